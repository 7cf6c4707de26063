//! Registry of every open client connection.
//!
//! The server never closes a socket owned by another task directly. Each
//! connection carries a cancellation token instead, and all of its socket
//! I/O races that token, so cancelling it makes the next (or current) read or
//! write fail and the owning task drops the socket. Dropping a
//! [`Connection`] removes it from the registry, whichever path closed it.

use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{io::AsyncWriteExt, net::TcpStream, select};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::frame::{self, Batch, BatchError, FrameError, Header};

pub type ConnectionId = u64;

pub struct ConnectionRegistry {
    open: Mutex<HashMap<ConnectionId, CancellationToken>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Tracks a freshly accepted stream. After [`shutdown`](Self::shutdown)
    /// the returned connection starts out cancelled.
    pub fn register(self: &Arc<Self>, stream: TcpStream) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        self.lock_open().insert(id, cancel.clone());

        Connection {
            id,
            peer: stream.peer_addr().ok(),
            stream,
            cancel,
            registry: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.lock_open().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every connection currently registered and forgets them.
    /// Connections registered afterwards are unaffected.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.lock_open().drain().collect();
        for (_, cancel) in &drained {
            cancel.cancel();
        }
        drained.len()
    }

    /// Cancels every connection, present and future.
    pub fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        self.close_all()
    }

    fn remove(&self, id: ConnectionId) {
        self.lock_open().remove(&id);
    }

    fn lock_open(&self) -> MutexGuard<'_, HashMap<ConnectionId, CancellationToken>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An accepted client socket tracked by a [`ConnectionRegistry`].
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    stream: TcpStream,
    cancel: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn read_header(&mut self) -> Result<Header, FrameError> {
        cancellable(&self.cancel, frame::read_header(&mut self.stream)).await
    }

    pub async fn read_bet_batch(&mut self, header: &Header) -> Result<Batch, BatchError> {
        cancellable(&self.cancel, frame::read_bet_batch(&mut self.stream, header)).await
    }

    pub async fn write_ack(&mut self, agency: u32, batch_id: u32) -> Result<(), FrameError> {
        cancellable(
            &self.cancel,
            frame::write_ack(&mut self.stream, agency, batch_id),
        )
        .await
    }

    pub async fn write_winners(&mut self, documents: &[String]) -> Result<(), FrameError> {
        cancellable(&self.cancel, frame::write_winners(&mut self.stream, documents)).await
    }

    /// Shuts the socket down and releases it.
    pub async fn close(mut self) {
        if !self.cancel.is_cancelled() {
            if let Err(err) = self.stream.shutdown().await {
                debug!(id = self.id, error = ?err, "socket shutdown failed");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

async fn cancellable<F, T, E>(cancel: &CancellationToken, io: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<FrameError>,
{
    select! {
        biased;
        _ = cancel.cancelled() => Err(E::from(FrameError::Io(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "connection closed by server",
        )))),
        result = io => result,
    }
}
