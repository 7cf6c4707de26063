//! Agency side of the protocol: ship every bet in batches, then ask for the
//! draw results.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::{io::AsyncWriteExt, net::TcpStream, select};
use tracing::{info, warn};

use crate::{
    bet::Bet,
    frame::{self, MAX_BATCH_ID, MAX_BATCH_LEN, MAX_PAYLOAD_LEN},
    server::termination_signal,
};

#[derive(Debug, Clone)]
pub struct AgencyConfig {
    pub id: u32,
    pub server: String,
    pub bets: PathBuf,
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgencyReport {
    pub batches: usize,
    pub bets: usize,
    pub winners: Vec<String>,
}

/// Runs the agency until it has its winners, or stops early on SIGTERM/ctrl-c.
pub async fn run_until_signal(config: AgencyConfig) -> Result<Option<AgencyReport>> {
    select! {
        report = run(&config) => report.map(Some),
        _ = termination_signal() => {
            info!(agency = config.id, "action: shutdown | result: success");
            Ok(None)
        }
    }
}

pub async fn run(config: &AgencyConfig) -> Result<AgencyReport> {
    let records = load_records(&config.bets, config.id).await?;
    let batches = split_batches(&records, config.batch_size);
    if batches.len() > MAX_BATCH_ID as usize {
        bail!(
            "{} batches exceed the {MAX_BATCH_ID} batch ids the protocol allows",
            batches.len()
        );
    }

    for (index, batch) in batches.iter().enumerate() {
        let batch_id = index as u32 + 1;
        send_batch(config, batch_id, batch).await?;
        info!(
            agency = config.id,
            batch_id,
            bets = batch.len(),
            "action: send_batch | result: success"
        );
    }

    let winners = request_winners(config).await?;
    info!(
        agency = config.id,
        winners = winners.len(),
        "action: winners_received | result: success"
    );

    Ok(AgencyReport {
        batches: batches.len(),
        bets: records.len(),
        winners,
    })
}

/// Reads `first_name,last_name,document,birthdate,number` lines and turns
/// them into validated wire records numbered from 1.
pub async fn load_records(path: &Path, agency: u32) -> Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read bets file {}", path.display()))?;

    let mut records = Vec::new();
    for (line_number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let bet_id = records.len() as u32 + 1;
        let record = format!("{agency},{bet_id},{line}");
        Bet::from_record(&record)
            .with_context(|| format!("{}:{}: invalid bet", path.display(), line_number + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Groups records into batches of at most `max_len` that also fit the 4
/// digit payload length.
pub fn split_batches(records: &[String], max_len: usize) -> Vec<Vec<String>> {
    let max_len = max_len.clamp(1, MAX_BATCH_LEN);
    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for record in records {
        current.push(record.clone());
        let too_long =
            current.len() > max_len || frame::bet_payload_len(&current) > MAX_PAYLOAD_LEN;
        if too_long && current.len() > 1 {
            let overflow = current.pop();
            batches.push(std::mem::take(&mut current));
            current.extend(overflow);
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

async fn connect(config: &AgencyConfig) -> Result<TcpStream> {
    TcpStream::connect(config.server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", config.server))
}

async fn send_batch(config: &AgencyConfig, batch_id: u32, records: &[String]) -> Result<()> {
    let mut stream = connect(config).await?;
    frame::write_bet_batch(&mut stream, batch_id, records)
        .await
        .with_context(|| format!("failed to send batch {batch_id}"))?;

    let ack = frame::read_ack(&mut stream)
        .await
        .with_context(|| format!("no acknowledgement for batch {batch_id}"))?;
    close(stream).await;

    if ack.agency != config.id || ack.batch_id != batch_id {
        bail!(
            "unexpected acknowledgement {},{} for batch {batch_id}",
            ack.agency,
            ack.batch_id
        );
    }
    Ok(())
}

async fn request_winners(config: &AgencyConfig) -> Result<Vec<String>> {
    let mut stream = connect(config).await?;
    frame::write_fin(&mut stream, config.id)
        .await
        .context("failed to send FIN")?;
    info!(agency = config.id, "action: wait_winners | result: in_progress");

    let winners = frame::read_winners(&mut stream)
        .await
        .context("connection closed before the draw results arrived")?;
    close(stream).await;
    Ok(winners)
}

async fn close(mut stream: TcpStream) {
    if let Err(error) = stream.shutdown().await {
        warn!(?error, "failed to shutdown connection cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(bet_id: usize, name_len: usize) -> String {
        format!(
            "1,{bet_id},{},Perez,30111222,1990-01-01,4321",
            "x".repeat(name_len)
        )
    }

    #[test]
    fn batches_respect_the_record_limit() {
        let records: Vec<String> = (1..=7).map(|id| record(id, 4)).collect();
        let batches = split_batches(&records, 3);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(batches.concat(), records);
    }

    #[test]
    fn batches_respect_the_payload_limit() {
        let records: Vec<String> = (1..=40).map(|id| record(id, 400)).collect();
        let batches = split_batches(&records, 99);
        assert!(batches.len() > 1);
        for batch in &batches {
            assert!(frame::bet_payload_len(batch) <= MAX_PAYLOAD_LEN);
        }
        assert_eq!(batches.concat(), records);
    }

    #[tokio::test]
    async fn bets_file_lines_become_numbered_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agency-3.csv");
        std::fs::write(
            &path,
            "Juan,Perez,30111222,1990-01-01,4321\n\nAna,Gomez,28999111,1985-06-15,7574\n",
        )
        .unwrap();

        let records = load_records(&path, 3).await.unwrap();
        assert_eq!(
            records,
            vec![
                "3,1,Juan,Perez,30111222,1990-01-01,4321".to_string(),
                "3,2,Ana,Gomez,28999111,1985-06-15,7574".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn invalid_lines_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agency-1.csv");
        std::fs::write(&path, "Juan,Perez,30111222,not-a-date,4321\n").unwrap();

        let err = load_records(&path, 1).await.unwrap_err();
        assert!(format!("{err:#}").contains(":1: invalid bet"));
    }
}
