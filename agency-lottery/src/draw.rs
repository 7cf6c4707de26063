//! Rendezvous point for agencies that finished sending bets.
//!
//! Each agency parks its connection here after sending `FIN`. When the last
//! of the configured agencies arrives, the parked connections are taken out
//! under the barrier lock in one step, the lock is released, and only then is
//! the storage lock taken to compute winners. The two locks are never held
//! at the same time, and taking the whole map is what makes every round draw
//! exactly once.

use std::{
    collections::{BTreeMap, HashMap},
    mem,
    sync::atomic::{AtomicU64, Ordering},
};

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    frame::FrameError,
    ledger::{self, LedgerError, SharedLedger},
    registry::{Connection, ConnectionRegistry},
};

/// Winning documents per agency, in the order storage returned them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Winners(BTreeMap<u32, Vec<String>>);

impl Winners {
    pub fn for_agency(&self, agency: u32) -> &[String] {
        self.0.get(&agency).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

/// Single pass over every stored bet, bucketing winners by agency.
pub fn collect_winners(ledger: &SharedLedger) -> Result<Winners, LedgerError> {
    let store = ledger::lock(ledger);
    let mut winners = Winners::default();
    for bet in store.all()? {
        if store.is_winner(&bet) {
            winners.0.entry(bet.agency).or_default().push(bet.document);
        }
    }
    Ok(winners)
}

#[derive(Debug)]
pub enum Registration {
    /// Still waiting on other agencies; `registered` counts distinct agencies.
    Waiting { registered: usize },
    Drawn(DrawReport),
    /// Storage failed during the draw; waiting agencies were disconnected.
    Failed { round: u64 },
    /// The connection was already cancelled by shutdown and was dropped.
    Closed,
}

#[derive(Debug)]
pub struct DrawReport {
    pub round: u64,
    pub winners: Winners,
    /// Agencies whose `WIN` message was fully written.
    pub delivered: usize,
}

/// Connections held by the barrier for the current round.
#[derive(Default)]
struct Parked {
    by_agency: HashMap<u32, Connection>,
    /// Earlier `FIN` connections of agencies that finished again. They get no
    /// result but stay open until the round ends or the server shuts down.
    superseded: Vec<Connection>,
}

pub struct DrawBarrier {
    agencies: u32,
    parked: Mutex<Parked>,
    rounds: AtomicU64,
}

impl DrawBarrier {
    pub fn new(agencies: u32) -> Self {
        Self {
            agencies,
            parked: Mutex::new(Parked::default()),
            rounds: AtomicU64::new(0),
        }
    }

    pub fn agencies(&self) -> u32 {
        self.agencies
    }

    pub fn accepts(&self, agency: u32) -> bool {
        (1..=self.agencies).contains(&agency)
    }

    /// Number of draws started so far.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::SeqCst)
    }

    /// Distinct agencies waiting for the current round.
    pub async fn waiting(&self) -> usize {
        self.parked.lock().await.by_agency.len()
    }

    /// Replaced connections kept open until the current round ends.
    pub async fn superseded(&self) -> usize {
        self.parked.lock().await.superseded.len()
    }

    /// Parks `conn` until every agency has finished. The call that completes
    /// the set runs the draw, delivers results to every parked connection and
    /// closes them before returning.
    ///
    /// A second `FIN` from an agency takes over its slot. The earlier
    /// connection gets no result and is closed with the rest of the round.
    pub async fn register(
        &self,
        agency: u32,
        conn: Connection,
        ledger: &SharedLedger,
        registry: &ConnectionRegistry,
    ) -> Registration {
        let mut parked = self.parked.lock().await;
        // Shutdown cancels tokens before it drains the barrier, so a cancelled
        // connection seen here would otherwise never be released.
        if conn.is_cancelled() {
            drop(parked);
            debug!(agency, connection = conn.id(), "fin arrived during shutdown");
            return Registration::Closed;
        }

        if let Some(previous) = parked.by_agency.insert(agency, conn) {
            warn!(
                agency,
                connection = previous.id(),
                "agency finished twice, its earlier connection gets no result"
            );
            parked.superseded.push(previous);
        }
        let registered = parked.by_agency.len();
        let ready = (registered >= self.agencies as usize).then(|| mem::take(&mut *parked));
        drop(parked);

        match ready {
            Some(ready) => self.draw(ready, ledger, registry).await,
            None => {
                info!(
                    agency,
                    registered,
                    expected = self.agencies,
                    "action: wait_draw | result: in_progress"
                );
                Registration::Waiting { registered }
            }
        }
    }

    /// Drops every parked connection without a result.
    pub async fn abandon(&self) -> usize {
        let abandoned = mem::take(&mut *self.parked.lock().await);
        abandoned.by_agency.len() + abandoned.superseded.len()
    }

    async fn draw(
        &self,
        ready: Parked,
        ledger: &SharedLedger,
        registry: &ConnectionRegistry,
    ) -> Registration {
        let Parked {
            by_agency: mut waiting,
            superseded,
        } = ready;
        let round = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        info!(round, "action: draw | result: in_progress");

        let winners = match collect_winners(ledger) {
            Ok(winners) => winners,
            Err(err) => {
                error!(round, error = %err, "action: draw | result: fail");
                drop(waiting);
                drop(superseded);
                registry.close_all();
                return Registration::Failed { round };
            }
        };
        info!(round, winners = winners.total(), "action: draw | result: success");

        let parked: Vec<(u32, Connection)> = (1..=self.agencies)
            .filter_map(|agency| waiting.remove(&agency).map(|conn| (agency, conn)))
            .collect();

        let sends = parked.into_iter().map(|(agency, mut conn)| {
            let documents = winners.for_agency(agency).to_vec();
            async move {
                let result = conn.write_winners(&documents).await;
                (agency, conn, documents.len(), result)
            }
        });

        let mut delivered = 0;
        let mut sent = Vec::new();
        for (agency, conn, count, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    delivered += 1;
                    info!(agency, winners = count, "action: winners_sent | result: success");
                }
                Err(err @ FrameError::PayloadTooLarge(_)) => {
                    error!(
                        agency,
                        winners = count,
                        error = %err,
                        "action: winners_sent | result: fail | results do not fit one message"
                    );
                }
                Err(err) => {
                    warn!(agency, error = %err, "action: winners_sent | result: fail");
                }
            }
            sent.push(conn);
        }

        for conn in sent {
            conn.close().await;
        }
        for conn in superseded {
            conn.close().await;
        }
        let lingering = registry.close_all();
        if lingering > 0 {
            info!(round, lingering, "closed connections left open after the draw");
        }

        Registration::Drawn(DrawReport {
            round,
            winners,
            delivered,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
        time::timeout,
    };

    use super::*;
    use crate::{
        bet::Bet,
        frame,
        ledger::{BetStore, MemoryLedger, shared},
    };

    async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn ledger_with(records: &[&str]) -> SharedLedger {
        let mut store = MemoryLedger::new(7574);
        let bets: Vec<Bet> = records
            .iter()
            .map(|record| Bet::from_record(record).unwrap())
            .collect();
        store.append(&bets).unwrap();
        shared(store)
    }

    #[test]
    fn winners_are_bucketed_by_their_agency() {
        let ledger = ledger_with(&[
            "3,1,A,B,300,1990-01-01,7574",
            "1,1,C,D,100,1990-01-01,1",
            "3,2,E,F,301,1990-01-01,7574",
            "2,1,G,H,200,1990-01-01,7574",
        ]);

        let winners = collect_winners(&ledger).unwrap();
        assert_eq!(winners.for_agency(3), ["300".to_string(), "301".to_string()]);
        assert_eq!(winners.for_agency(2), ["200".to_string()]);
        assert!(winners.for_agency(1).is_empty());
        assert_eq!(winners.total(), 3);
    }

    async fn assert_silent(peer: &mut TcpStream) {
        let mut buf = [0u8; 8];
        let read = timeout(Duration::from_millis(100), peer.read(&mut buf)).await;
        assert!(read.is_err(), "peer should still be open, got {read:?}");
    }

    async fn assert_closed(peer: &mut TcpStream) {
        let mut rest = Vec::new();
        timeout(Duration::from_secs(1), peer.read_to_end(&mut rest))
            .await
            .expect("connection should be closed")
            .ok();
        assert!(rest.is_empty(), "unexpected reply: {rest:?}");
    }

    #[tokio::test]
    async fn repeated_fin_from_one_agency_does_not_trigger_the_draw() {
        let barrier = DrawBarrier::new(2);
        let registry = ConnectionRegistry::new();
        let ledger = ledger_with(&["1,1,A,B,100,1990-01-01,7574"]);

        let mut peers = Vec::new();
        for _ in 0..3 {
            let (peer, stream) = stream_pair().await;
            let outcome = barrier
                .register(1, registry.register(stream), &ledger, &registry)
                .await;
            assert!(matches!(outcome, Registration::Waiting { registered: 1 }));
            peers.push(peer);
        }
        assert_eq!(barrier.rounds(), 0);
        assert_eq!(barrier.waiting().await, 1);
        assert_eq!(barrier.superseded().await, 2);
        assert_eq!(registry.len(), 3);

        // Replaced connections stay open until the round ends.
        let mut latest = peers.pop().unwrap();
        for peer in &mut peers {
            assert_silent(peer).await;
        }

        let (mut other, stream) = stream_pair().await;
        let outcome = barrier
            .register(2, registry.register(stream), &ledger, &registry)
            .await;
        assert!(matches!(outcome, Registration::Drawn(_)));
        assert_eq!(barrier.superseded().await, 0);
        assert!(registry.is_empty());

        assert_eq!(frame::read_winners(&mut latest).await.unwrap(), vec!["100"]);
        assert!(frame::read_winners(&mut other).await.unwrap().is_empty());
        for peer in &mut peers {
            assert_closed(peer).await;
        }
    }

    #[tokio::test]
    async fn fin_after_shutdown_is_not_parked() {
        let barrier = DrawBarrier::new(3);
        let registry = ConnectionRegistry::new();
        let ledger = ledger_with(&[]);
        let (mut peer, stream) = stream_pair().await;
        let conn = registry.register(stream);

        // Same order the server shutdown uses.
        registry.shutdown();
        barrier.abandon().await;

        let outcome = barrier.register(1, conn, &ledger, &registry).await;
        assert!(matches!(outcome, Registration::Closed));
        assert_eq!(barrier.waiting().await, 0);
        assert!(registry.is_empty());
        assert_closed(&mut peer).await;
    }

    #[tokio::test]
    async fn winners_too_large_for_one_message_are_not_delivered() {
        let records: Vec<String> = (0..1200)
            .map(|i| format!("1,{i},A,B,{:09},1990-01-01,7574", i))
            .collect();
        let records: Vec<&str> = records.iter().map(String::as_str).collect();
        let ledger = ledger_with(&records);
        let barrier = DrawBarrier::new(2);
        let registry = ConnectionRegistry::new();

        let (mut crowded, one) = stream_pair().await;
        let (mut empty, two) = stream_pair().await;
        barrier
            .register(1, registry.register(one), &ledger, &registry)
            .await;
        let outcome = barrier
            .register(2, registry.register(two), &ledger, &registry)
            .await;
        let Registration::Drawn(report) = outcome else {
            panic!("expected a draw, got {outcome:?}");
        };
        assert_eq!(report.winners.for_agency(1).len(), 1200);
        assert_eq!(report.delivered, 1);

        assert!(frame::read_winners(&mut empty).await.unwrap().is_empty());
        assert_closed(&mut crowded).await;
    }

    #[tokio::test]
    async fn last_agency_triggers_one_draw_and_delivery() {
        let barrier = DrawBarrier::new(2);
        let registry = ConnectionRegistry::new();
        let ledger = ledger_with(&[
            "1,1,A,B,100,1990-01-01,7574",
            "2,1,C,D,200,1990-01-01,9",
        ]);

        let (mut peer_one, one) = stream_pair().await;
        let (mut peer_two, two) = stream_pair().await;

        let outcome = barrier
            .register(1, registry.register(one), &ledger, &registry)
            .await;
        assert!(matches!(outcome, Registration::Waiting { registered: 1 }));

        let outcome = barrier
            .register(2, registry.register(two), &ledger, &registry)
            .await;
        let Registration::Drawn(report) = outcome else {
            panic!("second agency should trigger the draw, got {outcome:?}");
        };
        assert_eq!(report.round, 1);
        assert_eq!(report.delivered, 2);
        assert_eq!(barrier.rounds(), 1);
        assert_eq!(barrier.waiting().await, 0);
        assert!(registry.is_empty());

        assert_eq!(frame::read_winners(&mut peer_one).await.unwrap(), vec!["100"]);
        assert!(frame::read_winners(&mut peer_two).await.unwrap().is_empty());

        let mut rest = Vec::new();
        peer_one.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn abandon_releases_parked_connections() {
        let barrier = DrawBarrier::new(3);
        let registry = ConnectionRegistry::new();
        let ledger = ledger_with(&[]);
        let (mut first, stream) = stream_pair().await;
        let (mut second, again) = stream_pair().await;

        barrier
            .register(2, registry.register(stream), &ledger, &registry)
            .await;
        barrier
            .register(2, registry.register(again), &ledger, &registry)
            .await;
        assert_eq!(barrier.abandon().await, 2);
        assert!(registry.is_empty());
        assert_closed(&mut first).await;
        assert_closed(&mut second).await;
        assert_eq!(barrier.rounds(), 0);
    }
}
