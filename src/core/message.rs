//! Message envelope and its single-line record codec.
//!
//! ```text
//! id  from  sent  received  send_attempt  message_type_name  bin|str  payload
//! ```
//!
//! Fields are tab separated. Timestamps use `yyyyMMddHHmmssfff` (UTC), binary
//! payloads are Base64, text payloads are stored raw.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

use crate::core::address::Address;
use crate::core::clock::truncate_ms;
use crate::core::record::Record;
use crate::core::{Error, Result};

pub const FIELD_COUNT: usize = 8;
pub const KIND_BIN: &str = "bin";
pub const KIND_STR: &str = "str";

pub(crate) const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year][month][day][hour][minute][second][subsecond digits:3]");

/// Message body. Exactly one representation is ever present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Bytes(_) => KIND_BIN,
            Payload::Text(_) => KIND_STR,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            Payload::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Bytes(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub from: Address,
    pub sent: OffsetDateTime,
    pub received: OffsetDateTime,
    pub send_attempt: u32,
    pub message_type_name: String,
    pub payload: Payload,
    filename: Option<PathBuf>,
}

impl Message {
    /// Creates a message stamped with a fresh id. `sent` is truncated to
    /// milliseconds; `received` starts equal to `sent`.
    pub fn new(
        from: Address,
        message_type_name: impl Into<String>,
        payload: Payload,
        sent: OffsetDateTime,
    ) -> Self {
        let sent = truncate_ms(sent);
        Self {
            id: Uuid::new_v4(),
            from,
            sent,
            received: sent,
            send_attempt: 0,
            message_type_name: message_type_name.into(),
            payload,
            filename: None,
        }
    }

    pub fn text(
        from: Address,
        message_type_name: impl Into<String>,
        text: impl Into<String>,
        sent: OffsetDateTime,
    ) -> Self {
        Self::new(from, message_type_name, Payload::Text(text.into()), sent)
    }

    pub fn bytes(
        from: Address,
        message_type_name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        sent: OffsetDateTime,
    ) -> Self {
        Self::new(from, message_type_name, Payload::Bytes(bytes.into()), sent)
    }

    /// Path of the file currently holding this message, if it has been
    /// durably enqueued in this process.
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// Decodes a JSON text payload. Blank text decodes to `None`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.payload {
            Payload::Text(text) if text.trim().is_empty() => Ok(None),
            Payload::Text(text) => serde_json::from_str(text)
                .map(Some)
                .map_err(|_| Error::Corrupt("payload is not valid json")),
            Payload::Bytes(_) => Err(Error::Unsupported("json decode of binary payload")),
        }
    }

    /// Rejects content the tab-separated record cannot carry.
    pub fn validate(&self) -> Result<()> {
        if self
            .message_type_name
            .contains(|c: char| c == '\t' || c == '\n' || c == '\r')
        {
            return Err(Error::Unsupported("message type name contains tab or newline"));
        }
        if let Payload::Text(text) = &self.payload {
            if text.contains('\t') {
                return Err(Error::Unsupported("text payload contains tab"));
            }
        }
        self.from.validate()
    }

    /// The record with line breaks replaced by spaces, for the audit logs.
    pub fn to_flat_line(&self) -> String {
        self.encode().replace(['\r', '\n'], " ")
    }
}

impl Record for Message {
    fn encode(&self) -> String {
        let payload = match &self.payload {
            Payload::Bytes(bytes) => STANDARD.encode(bytes),
            Payload::Text(text) => text.clone(),
        };
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.id,
            self.from,
            format_timestamp(self.sent),
            format_timestamp(self.received),
            self.send_attempt,
            self.message_type_name,
            self.payload.kind(),
            payload
        )
    }

    fn decode(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.split('\t').collect();
        if parts.len() != FIELD_COUNT {
            return Err(Error::Corrupt("record does not have 8 fields"));
        }
        let id = Uuid::parse_str(parts[0]).map_err(|_| Error::Corrupt("invalid message id"))?;
        let from: Address = parts[1]
            .parse()
            .map_err(|_| Error::Corrupt("invalid from address"))?;
        let sent = parse_timestamp(parts[2])?;
        let received = parse_timestamp(parts[3])?;
        let send_attempt = parts[4]
            .parse::<u32>()
            .map_err(|_| Error::Corrupt("invalid send attempt"))?;
        let payload = match parts[6] {
            KIND_BIN => Payload::Bytes(
                STANDARD
                    .decode(parts[7])
                    .map_err(|_| Error::Corrupt("invalid base64 payload"))?,
            ),
            KIND_STR => Payload::Text(parts[7].to_string()),
            _ => return Err(Error::Corrupt("unknown payload kind")),
        };
        Ok(Self {
            id,
            from,
            sent,
            received,
            send_attempt,
            message_type_name: parts[5].to_string(),
            payload,
            filename: None,
        })
    }

    fn set_backing_file(&mut self, path: Option<PathBuf>) {
        self.filename = path;
    }

    fn backing_file(&self) -> Option<&Path> {
        self.filename()
    }
}

pub fn format_timestamp(at: OffsetDateTime) -> String {
    // Every field in the description is numeric, so formatting cannot fail for
    // four-digit years.
    at.format(TIMESTAMP_FORMAT).unwrap_or_default()
}

pub fn parse_timestamp(text: &str) -> Result<OffsetDateTime> {
    PrimitiveDateTime::parse(text, TIMESTAMP_FORMAT)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|_| Error::Corrupt("invalid timestamp"))
}
