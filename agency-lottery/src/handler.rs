//! Per-connection protocol logic.
//!
//! A connection carries exactly one client message. `BET` connections are
//! answered and closed here; `FIN` connections are handed to the draw barrier,
//! which owns them until results are delivered.

use tracing::{debug, error, info, warn};

use crate::{
    draw::Registration,
    frame::{FrameError, Header, MessageType},
    ledger,
    registry::Connection,
    server::LotteryState,
};

/// Where a handler left its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The connection was answered (or rejected) and closed.
    Completed,
    /// The connection now belongs to the draw barrier.
    AwaitingDraw,
}

pub async fn handle_connection(mut conn: Connection, state: &LotteryState) -> Outcome {
    let header = match conn.read_header().await {
        Ok(header) => header,
        Err(err) => {
            report_read_failure(&conn, "receive_header", &err);
            return Outcome::Completed;
        }
    };

    match header.msg_type() {
        Ok(MessageType::Bet) => {
            receive_bets(&mut conn, &header, state).await;
            conn.close().await;
            Outcome::Completed
        }
        Ok(MessageType::Fin) => finish_agency(conn, &header, state).await,
        Err(err) => {
            warn!(peer = ?conn.peer(), error = %err, "action: receive_message | result: fail");
            conn.close().await;
            Outcome::Completed
        }
    }
}

async fn receive_bets(conn: &mut Connection, header: &Header, state: &LotteryState) {
    let batch = match conn.read_bet_batch(header).await {
        Ok(batch) => batch,
        Err(err) => {
            if err.source.is_transport() && conn.is_cancelled() {
                debug!(batch_id = ?err.batch_id, "batch interrupted by shutdown");
            } else {
                error!(
                    peer = ?conn.peer(),
                    batch_id = ?err.batch_id,
                    error = %err,
                    "action: receive_bets | result: fail"
                );
            }
            return;
        }
    };

    let Some(agency) = batch.agency() else {
        error!(batch_id = batch.batch_id, "action: receive_bets | result: fail | empty batch");
        return;
    };

    let stored = ledger::lock(&state.ledger).append(&batch.bets);
    if let Err(err) = stored {
        error!(
            agency,
            batch_id = batch.batch_id,
            error = %err,
            "action: store_bets | result: fail"
        );
        return;
    }
    info!(
        agency,
        batch_id = batch.batch_id,
        bets = batch.bets.len(),
        "action: store_bets | result: success"
    );

    if let Err(err) = conn.write_ack(agency, batch.batch_id).await {
        report_write_failure(conn, "send_ack", &err);
    }
}

async fn finish_agency(conn: Connection, header: &Header, state: &LotteryState) -> Outcome {
    let agency = match header.fin_agency() {
        Ok(agency) if state.barrier.accepts(agency) => agency,
        Ok(agency) => {
            warn!(
                agency,
                expected = state.barrier.agencies(),
                "action: receive_fin | result: fail | unknown agency"
            );
            conn.close().await;
            return Outcome::Completed;
        }
        Err(err) => {
            warn!(peer = ?conn.peer(), error = %err, "action: receive_fin | result: fail");
            conn.close().await;
            return Outcome::Completed;
        }
    };
    info!(agency, "action: receive_fin | result: success");

    match state
        .barrier
        .register(agency, conn, &state.ledger, &state.registry)
        .await
    {
        Registration::Waiting { .. } => {}
        Registration::Drawn(report) => info!(
            round = report.round,
            delivered = report.delivered,
            winners = report.winners.total(),
            "action: draw_completed | result: success"
        ),
        Registration::Failed { round } => {
            error!(round, "action: draw_completed | result: fail");
        }
        Registration::Closed => return Outcome::Completed,
    }
    Outcome::AwaitingDraw
}

fn report_read_failure(conn: &Connection, action: &str, err: &FrameError) {
    if conn.is_cancelled() {
        debug!(peer = ?conn.peer(), action, "read interrupted by shutdown");
    } else {
        error!(peer = ?conn.peer(), action, error = %err, "read failed, closing connection");
    }
}

fn report_write_failure(conn: &Connection, action: &str, err: &FrameError) {
    if conn.is_cancelled() {
        debug!(peer = ?conn.peer(), action, "write interrupted by shutdown");
    } else {
        warn!(peer = ?conn.peer(), action, error = %err, "write failed, closing connection");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        time::timeout,
    };

    use super::*;
    use crate::{frame, ledger::MemoryLedger, server::LotteryState};

    const JUAN: &str = "1,7,Juan,Perez,30111222,1990-01-01,4321";

    async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn state(agencies: u32) -> std::sync::Arc<LotteryState> {
        LotteryState::new(agencies, ledger::shared(MemoryLedger::new(7574)))
    }

    fn stored(state: &LotteryState) -> usize {
        ledger::lock(&state.ledger).all().unwrap().len()
    }

    async fn assert_closed_without_reply(peer: &mut TcpStream) {
        let mut rest = Vec::new();
        timeout(Duration::from_secs(1), peer.read_to_end(&mut rest))
            .await
            .expect("connection should be closed")
            .ok();
        assert!(rest.is_empty(), "unexpected reply: {rest:?}");
    }

    #[tokio::test]
    async fn stores_a_batch_and_acknowledges_it() {
        let state = state(5);
        let (mut peer, stream) = stream_pair().await;
        let conn = state.registry.register(stream);

        frame::write_bet_batch(&mut peer, 1, &[JUAN]).await.unwrap();
        let outcome = handle_connection(conn, &state).await;
        assert_eq!(outcome, Outcome::Completed);

        let ack = frame::read_ack(&mut peer).await.unwrap();
        assert_eq!(ack, frame::Ack { agency: 1, batch_id: 1 });
        assert_closed_without_reply(&mut peer).await;

        let all = ledger::lock(&state.ledger).all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].document, "30111222");
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn malformed_batch_is_neither_stored_nor_acknowledged() {
        let state = state(5);
        let (mut peer, stream) = stream_pair().await;
        let conn = state.registry.register(stream);

        let payload = format!("{JUAN};1,8,Ana,Gomez,1,1990-01-01\n");
        let frame = format!("BET{:04}020001;{payload}", payload.len());
        peer.write_all(frame.as_bytes()).await.unwrap();

        assert_eq!(handle_connection(conn, &state).await, Outcome::Completed);
        assert_closed_without_reply(&mut peer).await;
        assert_eq!(stored(&state), 0);
    }

    #[tokio::test]
    async fn truncated_payload_fails_without_storing() {
        let state = state(5);
        let (mut peer, stream) = stream_pair().await;
        let conn = state.registry.register(stream);

        peer.write_all(b"BET0050010001;123456789").await.unwrap();
        peer.shutdown().await.unwrap();

        let outcome = timeout(Duration::from_secs(1), handle_connection(conn, &state))
            .await
            .expect("handler must not hang on a short payload");
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(stored(&state), 0);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_message_type_closes_the_connection() {
        let state = state(5);
        let (mut peer, stream) = stream_pair().await;
        let conn = state.registry.register(stream);

        peer.write_all(b"HEY0000000000").await.unwrap();
        assert_eq!(handle_connection(conn, &state).await, Outcome::Completed);
        assert_closed_without_reply(&mut peer).await;
    }

    #[tokio::test]
    async fn fin_parks_the_connection_until_the_draw() {
        let state = state(2);
        let (mut peer, stream) = stream_pair().await;
        let conn = state.registry.register(stream);

        frame::write_fin(&mut peer, 1).await.unwrap();
        assert_eq!(handle_connection(conn, &state).await, Outcome::AwaitingDraw);
        assert_eq!(state.barrier.waiting().await, 1);
        assert_eq!(state.registry.len(), 1);
    }

    #[tokio::test]
    async fn fin_from_unknown_agency_is_rejected() {
        let state = state(2);
        let (mut peer, stream) = stream_pair().await;
        let conn = state.registry.register(stream);

        frame::write_fin(&mut peer, 9).await.unwrap();
        assert_eq!(handle_connection(conn, &state).await, Outcome::Completed);
        assert_eq!(state.barrier.waiting().await, 0);
        assert_closed_without_reply(&mut peer).await;
    }
}
