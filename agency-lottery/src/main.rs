use anyhow::Result;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use agency_lottery::{
    agency,
    cli::{Cli, Command},
    server::LotteryServer,
};

fn init_tracing(default_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Server(args) => {
            let config = args.into_config();
            let server = LotteryServer::bind(&config)?;
            let addr = server.local_addr()?;
            info!("lottery server listening on {}", addr);
            if let Err(err) = server.run_until_signal().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Agency(args) => {
            let config = args.into_config();
            let id = config.id;
            if let Some(report) = agency::run_until_signal(config).await? {
                let line = format!(
                    "*** agency {id}: {} winners [{}]\n",
                    report.winners.len(),
                    report.winners.join(",")
                );
                let mut stdout = tokio::io::stdout();
                stdout.write_all(line.as_bytes()).await?;
                stdout.flush().await?;
            }
        }
    }

    Ok(())
}
