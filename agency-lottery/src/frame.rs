//! Length-prefixed text framing shared by the server and the agency client.
//!
//! Every multi-byte number on the wire is zero-padded decimal ASCII. Client
//! messages start with a fixed 13 byte header:
//!
//! ```text
//! BET pppp bb iiii ; <records>\n     p = payload bytes, b = records, i = batch id
//! FIN <agency id, space padded to 10 bytes>
//! ```
//!
//! The server answers with `ACK,llll,<agency>,<batch id>\n` after storing a
//! batch and `WIN,llll<doc>,<doc>,...` once the draw ran.
//!
//! TCP delivers a byte stream, so every read and write here moves exactly the
//! requested number of bytes or fails.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bet::{Bet, InvalidBet};

pub const HEADER_LEN: usize = 13;
/// Largest payload a 4 digit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = 9999;
/// Largest record count a 2 digit batch size field can describe.
pub const MAX_BATCH_LEN: usize = 99;
pub const MAX_BATCH_ID: u32 = 9999;

const BET_TAG: &[u8; 3] = b"BET";
const FIN_TAG: &[u8; 3] = b"FIN";
const ACK_TAG: &[u8; 3] = b"ACK";
const WIN_TAG: &[u8; 3] = b"WIN";
const RECORD_SEPARATOR: char = ';';
const RECORD_TERMINATOR: u8 = b'\n';
/// `ACK,` or `WIN,` followed by the 4 digit payload length.
const REPLY_PREFIX_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),
    #[error("expected {expected} message, received {received}")]
    UnexpectedMessageType {
        expected: &'static str,
        received: String,
    },
    #[error("invalid {field} field: {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("batch declared {declared} records but carried {received}")]
    BatchSizeMismatch { declared: usize, received: usize },
    #[error("record {index} is malformed: {source}")]
    InvalidBet {
        index: usize,
        #[source]
        source: InvalidBet,
    },
    #[error("payload of {0} bytes does not fit a 4 digit length")]
    PayloadTooLarge(usize),
    #[error("batch of {0} records does not fit a 2 digit size")]
    BatchTooLarge(usize),
}

impl FrameError {
    /// True when the peer went away or the socket broke, as opposed to a
    /// malformed message.
    pub fn is_transport(&self) -> bool {
        matches!(self, FrameError::Io(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Bet,
    Fin,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Bet => "BET",
            MessageType::Fin => "FIN",
        }
    }
}

/// Raw 13 byte header as read off the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    raw: [u8; HEADER_LEN],
}

/// Fields of a `BET` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BetHeader {
    pub payload_size: usize,
    pub batch_size: usize,
    pub batch_id: u32,
}

impl Header {
    pub fn from_bytes(raw: [u8; HEADER_LEN]) -> Self {
        Self { raw }
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.raw
    }

    pub fn msg_type(&self) -> Result<MessageType, FrameError> {
        match &self.raw[..3] {
            tag if tag == BET_TAG => Ok(MessageType::Bet),
            tag if tag == FIN_TAG => Ok(MessageType::Fin),
            tag => Err(FrameError::UnknownMessageType(
                String::from_utf8_lossy(tag).into_owned(),
            )),
        }
    }

    pub fn bet_fields(&self) -> Result<BetHeader, FrameError> {
        self.ensure_type(MessageType::Bet)?;
        Ok(BetHeader {
            payload_size: parse_digits("payload_size", &self.raw[3..7])?,
            batch_size: parse_digits("batch_size", &self.raw[7..9])?,
            batch_id: parse_digits("batch_id", &self.raw[9..13])?,
        })
    }

    /// Agency id carried by a `FIN` header: optional leading spaces, the
    /// digits of the id, then padding that is ignored.
    pub fn fin_agency(&self) -> Result<u32, FrameError> {
        self.ensure_type(MessageType::Fin)?;
        let fields = &self.raw[3..];
        let start = fields.iter().take_while(|b| **b == b' ').count();
        let digits = fields[start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        parse_digits("agency_id", &fields[start..start + digits])
    }

    fn ensure_type(&self, expected: MessageType) -> Result<(), FrameError> {
        match self.msg_type() {
            Ok(found) if found == expected => Ok(()),
            _ => Err(FrameError::UnexpectedMessageType {
                expected: expected.as_str(),
                received: String::from_utf8_lossy(&self.raw[..3]).into_owned(),
            }),
        }
    }
}

/// Records parsed out of one `BET` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub batch_id: u32,
    pub bets: Vec<Bet>,
}

impl Batch {
    /// Agency that sent the batch, taken from its first record.
    pub fn agency(&self) -> Option<u32> {
        self.bets.first().map(|bet| bet.agency)
    }
}

/// A rejected batch. `batch_id` is known whenever the header itself parsed.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct BatchError {
    pub batch_id: Option<u32>,
    #[source]
    pub source: FrameError,
}

impl BatchError {
    fn new(batch_id: Option<u32>, source: impl Into<FrameError>) -> Self {
        Self {
            batch_id,
            source: source.into(),
        }
    }
}

impl From<FrameError> for BatchError {
    fn from(source: FrameError) -> Self {
        Self::new(None, source)
    }
}

/// Server acknowledgement of a stored batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub agency: u32,
    pub batch_id: u32,
}

pub async fn read_header<R>(reader: &mut R) -> Result<Header, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw).await?;
    Ok(Header::from_bytes(raw))
}

/// Reads the body of a `BET` message whose header was already consumed.
///
/// The batch is all-or-nothing: a record count that differs from the header
/// or any malformed record rejects every record in it.
pub async fn read_bet_batch<R>(reader: &mut R, header: &Header) -> Result<Batch, BatchError>
where
    R: AsyncRead + Unpin,
{
    let fields = header.bet_fields().map_err(|err| BatchError::new(None, err))?;
    let batch_id = Some(fields.batch_id);

    let mut delimiter = [0u8; 1];
    reader
        .read_exact(&mut delimiter)
        .await
        .map_err(|err| BatchError::new(batch_id, err))?;

    let mut payload = vec![0u8; fields.payload_size];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| BatchError::new(batch_id, err))?;

    let bets = parse_records(&payload, fields.batch_size)
        .map_err(|err| BatchError::new(batch_id, err))?;

    Ok(Batch {
        batch_id: fields.batch_id,
        bets,
    })
}

fn parse_records(payload: &[u8], batch_size: usize) -> Result<Vec<Bet>, FrameError> {
    let payload = payload.strip_suffix(&[RECORD_TERMINATOR]).unwrap_or(payload);
    let text = std::str::from_utf8(payload).map_err(|_| FrameError::InvalidField {
        field: "payload",
        value: String::from_utf8_lossy(payload).into_owned(),
    })?;

    let records: Vec<&str> = text.split(RECORD_SEPARATOR).collect();
    if records.len() != batch_size {
        return Err(FrameError::BatchSizeMismatch {
            declared: batch_size,
            received: records.len(),
        });
    }

    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            Bet::from_record(record).map_err(|source| FrameError::InvalidBet { index, source })
        })
        .collect()
}

pub async fn write_ack<W>(writer: &mut W, agency: u32, batch_id: u32) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload = format!("{agency},{batch_id}\n");
    let length = length_field(payload.len())?;
    let message = format!("ACK,{length},{payload}");
    send(writer, message.as_bytes()).await
}

/// Sends the winning documents of one agency. An empty list is sent as a
/// zero length payload.
pub async fn write_winners<W, S>(writer: &mut W, documents: &[S]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    let payload = documents
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(",");
    let length = length_field(payload.len())?;
    let message = format!("WIN,{length}{payload}");
    send(writer, message.as_bytes()).await
}

/// Bytes the `payload_size` field must announce for these records: the
/// records joined by `;` plus the trailing terminator.
pub fn bet_payload_len<S: AsRef<str>>(records: &[S]) -> usize {
    let joined: usize = records.iter().map(|r| r.as_ref().len()).sum();
    joined + records.len().saturating_sub(1) + 1
}

pub async fn write_bet_batch<W, S>(
    writer: &mut W,
    batch_id: u32,
    records: &[S],
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    if records.is_empty() || records.len() > MAX_BATCH_LEN {
        return Err(FrameError::BatchTooLarge(records.len()));
    }
    if batch_id > MAX_BATCH_ID {
        return Err(FrameError::InvalidField {
            field: "batch_id",
            value: batch_id.to_string(),
        });
    }

    let length = length_field(bet_payload_len(records))?;
    let joined = records
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(";");
    let message = format!(
        "BET{length}{:02}{batch_id:04};{joined}\n",
        records.len()
    );
    send(writer, message.as_bytes()).await
}

pub async fn write_fin<W>(writer: &mut W, agency: u32) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let message = format!("FIN{agency:<10}");
    send(writer, message.as_bytes()).await
}

pub async fn read_ack<R>(reader: &mut R) -> Result<Ack, FrameError>
where
    R: AsyncRead + Unpin,
{
    let length = read_reply_prefix(reader, ACK_TAG).await?;

    let mut separator = [0u8; 1];
    reader.read_exact(&mut separator).await?;

    let payload = read_text(reader, length).await?;
    let payload = payload.strip_suffix('\n').unwrap_or(&payload);
    let (agency, batch_id) = payload
        .split_once(',')
        .ok_or_else(|| FrameError::InvalidField {
            field: "ack",
            value: payload.to_string(),
        })?;

    Ok(Ack {
        agency: parse_digits("agency", agency.as_bytes())?,
        batch_id: parse_digits("batch_id", batch_id.as_bytes())?,
    })
}

pub async fn read_winners<R>(reader: &mut R) -> Result<Vec<String>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let length = read_reply_prefix(reader, WIN_TAG).await?;
    let payload = read_text(reader, length).await?;
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    Ok(payload.split(',').map(str::to_string).collect())
}

async fn read_reply_prefix<R>(reader: &mut R, tag: &[u8; 3]) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; REPLY_PREFIX_LEN];
    reader.read_exact(&mut prefix).await?;
    if &prefix[..3] != tag || prefix[3] != b',' {
        return Err(FrameError::UnexpectedMessageType {
            expected: if tag == ACK_TAG { "ACK" } else { "WIN" },
            received: String::from_utf8_lossy(&prefix).into_owned(),
        });
    }
    parse_digits("payload_size", &prefix[4..])
}

async fn read_text<R>(reader: &mut R, length: usize) -> Result<String, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    String::from_utf8(payload).map_err(|err| FrameError::InvalidField {
        field: "payload",
        value: String::from_utf8_lossy(err.as_bytes()).into_owned(),
    })
}

async fn send<W>(writer: &mut W, message: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    // write_all keeps writing until the whole buffer is out and reports a
    // zero length write as WriteZero.
    writer.write_all(message).await?;
    writer.flush().await?;
    Ok(())
}

fn length_field(length: usize) -> Result<String, FrameError> {
    if length > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(length));
    }
    Ok(format!("{length:04}"))
}

fn parse_digits<T>(field: &'static str, bytes: &[u8]) -> Result<T, FrameError>
where
    T: std::str::FromStr,
{
    let invalid = || FrameError::InvalidField {
        field,
        value: String::from_utf8_lossy(bytes).into_owned(),
    };
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(invalid)
}
