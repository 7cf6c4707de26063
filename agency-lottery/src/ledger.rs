//! Durable storage for accepted bets.
//!
//! The server only needs three things from storage: append a batch, list
//! everything appended so far, and decide whether a bet won. Callers are
//! expected to serialize access themselves (the server keeps the store behind
//! a single mutex), so implementations take `&mut self` for writes.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;

use crate::bet::Bet;

/// Number drawn by the lottery unless configured otherwise.
pub const DEFAULT_WINNING_NUMBER: u32 = 7574;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt ledger entry at {}:{line}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode bet: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait BetStore: Send {
    /// Appends every bet of the batch, or none of them.
    fn append(&mut self, bets: &[Bet]) -> Result<(), LedgerError>;

    /// Every bet appended so far, in append order.
    fn all(&self) -> Result<Vec<Bet>, LedgerError>;

    fn is_winner(&self, bet: &Bet) -> bool;
}

/// The storage lock. Held for one append or one full scan, never across
/// socket I/O.
pub type SharedLedger = Arc<Mutex<Box<dyn BetStore>>>;

pub fn shared(store: impl BetStore + 'static) -> SharedLedger {
    Arc::new(Mutex::new(Box::new(store)))
}

pub fn lock(ledger: &SharedLedger) -> MutexGuard<'_, Box<dyn BetStore>> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Volatile store, mostly for tests and throwaway runs.
#[derive(Debug)]
pub struct MemoryLedger {
    bets: Vec<Bet>,
    winning_number: u32,
}

impl MemoryLedger {
    pub fn new(winning_number: u32) -> Self {
        Self {
            bets: Vec::new(),
            winning_number,
        }
    }
}

impl BetStore for MemoryLedger {
    fn append(&mut self, bets: &[Bet]) -> Result<(), LedgerError> {
        self.bets.extend_from_slice(bets);
        Ok(())
    }

    fn all(&self) -> Result<Vec<Bet>, LedgerError> {
        Ok(self.bets.clone())
    }

    fn is_winner(&self, bet: &Bet) -> bool {
        bet.number == self.winning_number
    }
}

/// Append-only JSON lines file, one bet per line.
///
/// A batch is encoded in full before anything touches the file and then
/// written with a single `write_all`, so an encoding failure never leaves a
/// partial batch behind.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    file: File,
    winning_number: u32,
}

impl FileLedger {
    pub fn open(path: impl AsRef<Path>, winning_number: u32) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            file,
            winning_number,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl BetStore for FileLedger {
    fn append(&mut self, bets: &[Bet]) -> Result<(), LedgerError> {
        let mut encoded = Vec::new();
        for bet in bets {
            serde_json::to_writer(&mut encoded, bet)?;
            encoded.push(b'\n');
        }

        self.file
            .write_all(&encoded)
            .and_then(|()| self.file.sync_data())
            .map_err(|err| self.io_error(err))
    }

    fn all(&self) -> Result<Vec<Bet>, LedgerError> {
        let file = File::open(&self.path).map_err(|err| self.io_error(err))?;
        let mut bets = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| self.io_error(err))?;
            if line.trim().is_empty() {
                continue;
            }
            let bet = serde_json::from_str(&line).map_err(|source| LedgerError::Corrupt {
                path: self.path.clone(),
                line: index + 1,
                source,
            })?;
            bets.push(bet);
        }
        Ok(bets)
    }

    fn is_winner(&self, bet: &Bet) -> bool {
        bet.number == self.winning_number
    }
}
