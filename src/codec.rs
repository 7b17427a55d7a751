//! Line encodings for the file-backed store.
//!
//! `Pipe` is the classic `STATUS|attempts|invisible-from|receipt|content`
//! layout with second-granularity UTC timestamps. `Json` is a versioned
//! structured record that survives any content.

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::message::{Message, MessageStatus};
use crate::{Error, Result};

pub const JSON_RECORD_VERSION: u32 = 1;

const NANOS_PER_SECOND: u64 = 1_000_000_000;
const PIPE_FIELDS: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    #[default]
    Pipe,
    Json,
}

impl RecordFormat {
    pub fn encode(self, message: &Message) -> Result<String> {
        match self {
            RecordFormat::Pipe => encode_pipe(message),
            RecordFormat::Json => encode_json(message),
        }
    }

    pub fn decode(self, line: &str) -> Result<Message> {
        match self {
            RecordFormat::Pipe => decode_pipe(line),
            RecordFormat::Json => decode_json(line),
        }
    }

    /// Instant recorded for a delivery made at `now`.
    ///
    /// Pipe timestamps only keep whole seconds, so the delivery is stamped at
    /// the next whole second. A timestamp read back is never earlier than the
    /// real delivery, which keeps the message hidden for at least the full
    /// visibility timeout.
    pub fn delivery_instant(self, now: u64) -> u64 {
        match self {
            RecordFormat::Pipe => match now % NANOS_PER_SECOND {
                0 => now,
                rem => now.saturating_add(NANOS_PER_SECOND - rem),
            },
            RecordFormat::Json => now,
        }
    }

    /// Format a stored line was written in. Pipe records always open with a
    /// status name, so a leading `{` is unambiguous.
    pub fn of_line(line: &str) -> Self {
        if line.starts_with('{') {
            RecordFormat::Json
        } else {
            RecordFormat::Pipe
        }
    }
}

/// Decodes a line in whichever format it was written in.
pub fn decode_line(line: &str) -> Result<Message> {
    RecordFormat::of_line(line).decode(line)
}

fn encode_pipe(message: &Message) -> Result<String> {
    if message.content.contains(|c: char| c == '\n' || c == '\r') {
        return Err(Error::InvalidContent("line breaks are not allowed in pipe records"));
    }
    let invisible_from = match message.invisible_from {
        Some(ns) if message.is_in_flight() => format_timestamp(ns)?,
        _ => String::new(),
    };
    Ok(format!(
        "{}|{}|{}|{}|{}",
        message.status, message.prior_attempts, invisible_from, message.receipt_id, message.content
    ))
}

fn decode_pipe(line: &str) -> Result<Message> {
    // Content is the last field, so a '|' inside it stays part of the content.
    let fields: Vec<&str> = line.splitn(PIPE_FIELDS, '|').collect();
    if fields.len() != PIPE_FIELDS {
        return Err(Error::CorruptRecord(format!(
            "expected {PIPE_FIELDS} fields, found {}",
            fields.len()
        )));
    }
    let status = MessageStatus::parse(fields[0])
        .ok_or_else(|| Error::CorruptRecord(format!("unknown status {:?}", fields[0])))?;
    let prior_attempts = fields[1]
        .parse::<u32>()
        .map_err(|_| Error::CorruptRecord(format!("invalid attempt count {:?}", fields[1])))?;
    let invisible_from = if fields[2].is_empty() {
        None
    } else {
        Some(parse_timestamp(fields[2])?)
    };
    let receipt_id = fields[3]
        .parse::<u64>()
        .map_err(|_| Error::CorruptRecord(format!("invalid receipt id {:?}", fields[3])))?;
    if status == MessageStatus::InFlight && invisible_from.is_none() {
        return Err(Error::CorruptRecord("in-flight record without timestamp".to_string()));
    }
    Ok(Message {
        status,
        prior_attempts,
        invisible_from,
        receipt_id,
        content: fields[4].to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonRecord {
    v: u32,
    status: MessageStatus,
    prior_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invisible_from_ns: Option<u64>,
    receipt_id: u64,
    content: String,
}

#[derive(Deserialize)]
struct VersionProbe {
    v: u32,
}

fn encode_json(message: &Message) -> Result<String> {
    let record = JsonRecord {
        v: JSON_RECORD_VERSION,
        status: message.status,
        prior_attempts: message.prior_attempts,
        invisible_from_ns: message.invisible_from,
        receipt_id: message.receipt_id,
        content: message.content.clone(),
    };
    Ok(serde_json::to_string(&record)?)
}

fn decode_json(line: &str) -> Result<Message> {
    let probe: VersionProbe = serde_json::from_str(line)?;
    if probe.v != JSON_RECORD_VERSION {
        return Err(Error::UnsupportedVersion(probe.v));
    }
    let record: JsonRecord = serde_json::from_str(line)?;
    if record.status == MessageStatus::InFlight && record.invisible_from_ns.is_none() {
        return Err(Error::CorruptRecord("in-flight record without timestamp".to_string()));
    }
    Ok(Message {
        status: record.status,
        prior_attempts: record.prior_attempts,
        invisible_from: record.invisible_from_ns,
        receipt_id: record.receipt_id,
        content: record.content,
    })
}

fn format_timestamp(ns: u64) -> Result<String> {
    let secs = i64::try_from(ns / NANOS_PER_SECOND)
        .map_err(|_| Error::CorruptRecord(format!("timestamp out of range: {ns}")))?;
    let at = OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|err| Error::CorruptRecord(err.to_string()))?;
    at.format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .map_err(|err| Error::CorruptRecord(err.to_string()))
}

fn parse_timestamp(value: &str) -> Result<u64> {
    let at = PrimitiveDateTime::parse(
        value,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    )
    .map_err(|err| Error::CorruptRecord(format!("invalid timestamp {value:?}: {err}")))?
    .assume_utc();
    let secs = u64::try_from(at.unix_timestamp())
        .map_err(|_| Error::CorruptRecord(format!("timestamp before epoch: {value:?}")))?;
    Ok(secs * NANOS_PER_SECOND)
}
