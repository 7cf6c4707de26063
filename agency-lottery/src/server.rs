use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    sync::watch,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    draw::DrawBarrier,
    handler::handle_connection,
    ledger::{self, FileLedger, MemoryLedger, SharedLedger},
    registry::ConnectionRegistry,
};

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerLocation {
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub backlog: u32,
    pub agencies: u32,
    pub ledger: LedgerLocation,
    pub winning_number: u32,
}

impl ServerConfig {
    fn open_ledger(&self) -> Result<SharedLedger> {
        Ok(match &self.ledger {
            LedgerLocation::Memory => ledger::shared(MemoryLedger::new(self.winning_number)),
            LedgerLocation::File(path) => ledger::shared(
                FileLedger::open(path, self.winning_number)
                    .with_context(|| format!("failed to open ledger {}", path.display()))?,
            ),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    ShuttingDown,
    Stopped,
}

/// State shared by every connection handler.
pub struct LotteryState {
    pub ledger: SharedLedger,
    pub registry: Arc<ConnectionRegistry>,
    pub barrier: DrawBarrier,
}

impl LotteryState {
    pub fn new(agencies: u32, ledger: SharedLedger) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            registry: ConnectionRegistry::new(),
            barrier: DrawBarrier::new(agencies),
        })
    }
}

pub struct LotteryServer {
    listener: TcpListener,
    state: Arc<LotteryState>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
    stop: CancellationToken,
}

impl LotteryServer {
    /// Binds the listening socket. This is the only failure that stops the
    /// process.
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let ledger = config.open_ledger()?;
        let socket = if config.listen.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("failed to create listening socket")?;
        socket
            .set_reuseaddr(true)
            .context("failed to set SO_REUSEADDR")?;
        socket
            .bind(config.listen)
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let listener = socket
            .listen(config.backlog)
            .with_context(|| format!("failed to listen on {}", config.listen))?;

        Ok(Self::new(listener, LotteryState::new(config.agencies, ledger)))
    }

    pub fn new(listener: TcpListener, state: Arc<LotteryState>) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Running);
        Self {
            listener,
            state,
            lifecycle: Arc::new(lifecycle),
            stop: CancellationToken::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<LotteryState> {
        Arc::clone(&self.state)
    }

    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            state: Arc::clone(&self.state),
            lifecycle: Arc::clone(&self.lifecycle),
            stop: self.stop.clone(),
        }
    }

    /// Accepts connections until `shutdown` resolves or a [`ShutdownHandle`]
    /// fires, then waits for every handler to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let handle = self.shutdown_handle();
        let LotteryServer {
            listener,
            state,
            lifecycle,
            stop,
        } = self;
        let handlers = TaskTracker::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                biased;
                _ = stop.cancelled() => break,
                _ = &mut shutdown => {
                    handle.shutdown().await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &handlers).await;
                }
            }
        }

        drop(listener);
        handlers.close();
        handlers.wait().await;
        lifecycle.send_replace(Lifecycle::Stopped);
        info!("action: shutdown | result: success");

        Ok(())
    }

    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(termination_signal()).await
    }
}

/// Stops a running [`LotteryServer`]. Cloneable and safe to call repeatedly.
#[derive(Clone)]
pub struct ShutdownHandle {
    state: Arc<LotteryState>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
    stop: CancellationToken,
}

impl ShutdownHandle {
    /// Stops accepting, fails every in-flight read or write and drops
    /// connections parked at the draw barrier. Only the first call acts.
    pub async fn shutdown(&self) {
        let begun = self.lifecycle.send_if_modified(|current| {
            if *current == Lifecycle::Running {
                *current = Lifecycle::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !begun {
            return;
        }

        info!("action: shutdown | result: in_progress");
        self.stop.cancel();
        let closed = self.state.registry.shutdown();
        let abandoned = self.state.barrier.abandon().await;
        debug!(closed, abandoned, "connections closed for shutdown");
    }
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<LotteryState>,
    handlers: &TaskTracker,
) {
    match result {
        Ok((stream, peer)) => {
            info!(%peer, "action: accept_connections | result: success");
            spawn_handler(stream, state, handlers);
        }
        Err(err) => {
            warn!(error = ?err, "action: accept_connections | result: fail");
            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
        }
    }
}

fn spawn_handler(stream: TcpStream, state: &Arc<LotteryState>, handlers: &TaskTracker) {
    let conn = state.registry.register(stream);
    let state = Arc::clone(state);
    handlers.spawn(async move {
        let id = conn.id();
        let outcome = handle_connection(conn, &state).await;
        debug!(id, ?outcome, "connection handler finished");
    });
}

/// Resolves on SIGTERM or ctrl-c.
pub async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                }
                return;
            }
            Err(err) => warn!(error = ?err, "failed to install SIGTERM handler"),
        }
    }

    log_ctrl_c(tokio::signal::ctrl_c().await);
}

fn log_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => info!("received ctrl-c"),
        Err(err) => warn!(error = ?err, "failed to install ctrl-c handler"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_is_idempotent_and_reaches_stopped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = LotteryServer::new(
            listener,
            LotteryState::new(5, ledger::shared(MemoryLedger::new(7574))),
        );
        let handle = server.shutdown_handle();
        let mut lifecycle = server.lifecycle();
        let running = tokio::spawn(server.run_until(std::future::pending()));

        handle.shutdown().await;
        assert_ne!(*lifecycle.borrow(), Lifecycle::Running);
        handle.shutdown().await;

        running.await.unwrap().unwrap();
        lifecycle
            .wait_for(|state| *state == Lifecycle::Stopped)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bind_honours_the_configured_address() {
        let config = ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            backlog: 5,
            agencies: 5,
            ledger: LedgerLocation::Memory,
            winning_number: 7574,
        };
        let server = LotteryServer::bind(&config).unwrap();
        assert!(server.local_addr().unwrap().ip().is_loopback());
    }
}
