use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::{
    agency::AgencyConfig,
    frame::MAX_BATCH_LEN,
    ledger::DEFAULT_WINNING_NUMBER,
    server::{LedgerLocation, ServerConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log filter used when RUST_LOG is not set (e.g. "info", "debug").
    #[arg(long, global = true, env = "LOGGING_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept bets from the agencies and run the draw once all of them finish.
    Server(ServerArgs),
    /// Send an agency's bets to the server and wait for its winners.
    Agency(AgencyArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, env = "SERVER_LISTEN", default_value = "0.0.0.0:12345")]
    pub listen: SocketAddr,

    /// Pending connection queue length passed to listen(2).
    #[arg(long, env = "SERVER_LISTEN_BACKLOG", default_value_t = 5)]
    pub backlog: u32,

    /// Number of agencies that must finish before the draw runs.
    #[arg(
        long,
        env = "LOTTERY_AGENCIES",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub agencies: u32,

    /// Ledger file (JSON lines), or "memory" to keep bets in memory only.
    #[arg(long, env = "LOTTERY_LEDGER", default_value = "bets.jsonl")]
    pub ledger: String,

    /// Number that wins the draw.
    #[arg(long, env = "LOTTERY_WINNING_NUMBER", default_value_t = DEFAULT_WINNING_NUMBER)]
    pub winning_number: u32,
}

impl ServerArgs {
    pub fn into_config(self) -> ServerConfig {
        let ledger = if self.ledger.eq_ignore_ascii_case("memory") {
            LedgerLocation::Memory
        } else {
            LedgerLocation::File(PathBuf::from(self.ledger))
        };
        ServerConfig {
            listen: self.listen,
            backlog: self.backlog,
            agencies: self.agencies,
            ledger,
            winning_number: self.winning_number,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct AgencyArgs {
    /// Agency number, 1 up to the server's agency count.
    #[arg(
        long,
        env = "CLI_ID",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub id: u32,

    /// Server address (host:port).
    #[arg(long, env = "CLI_SERVER_ADDRESS", default_value = "127.0.0.1:12345")]
    pub server: String,

    /// CSV file with one `first_name,last_name,document,birthdate,number` bet per line.
    #[arg(long, env = "CLI_BETS_FILE")]
    pub bets: PathBuf,

    /// Maximum bets per batch.
    #[arg(
        long,
        env = "CLI_BATCH_MAX_AMOUNT",
        default_value_t = 50,
        value_parser = clap::value_parser!(u16).range(1..=MAX_BATCH_LEN as i64)
    )]
    pub batch_size: u16,
}

impl AgencyArgs {
    pub fn into_config(self) -> AgencyConfig {
        AgencyConfig {
            id: self.id,
            server: self.server,
            bets: self.bets,
            batch_size: usize::from(self.batch_size),
        }
    }
}
