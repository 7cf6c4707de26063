//! Lottery server for a fixed set of betting agencies.
//!
//! Agencies upload bets in batches over a small length-prefixed text
//! protocol, then each signals that it is done. When the last agency is done
//! the server draws once and sends every agency its winners over the
//! connection it is waiting on.
//!
//! - [`cli`] parses the command line for the server and agency modes.
//! - [`bet`] is the wager record and its wire encoding.
//! - [`frame`] reads and writes protocol messages.
//! - [`ledger`] stores accepted bets and decides winners.
//! - [`registry`] tracks open connections so shutdown can close them.
//! - [`draw`] is the barrier that runs the draw exactly once per round.
//! - [`handler`] processes one message per connection.
//! - [`server`] runs the accept loop and graceful shutdown.
//! - [`agency`] is the client an agency runs to upload its bets.

pub mod agency;
pub mod bet;
pub mod cli;
pub mod draw;
pub mod frame;
pub mod handler;
pub mod ledger;
pub mod registry;
pub mod server;
