//! Wire-format types for the Zabbix sender protocol.
//!
//! zcp pushes Ceilometer samples to a Zabbix server (or proxy) trapper port
//! using the same framing in both directions. Requests and responses are
//! decoded by the same code, so a frame built by [`Envelope::serialize`] is
//! always readable by [`Envelope::deserialize`]. Stream readers validate the
//! two fixed-size headers with [`check_header`] and [`payload_length`].
//!
//! ## Wire Format
//!
//! ```text
//! ┌────────────────┬─────────────┬────────────────┬──────────────┬───────────────────┐
//! │ "ZBXD" (4 B)   │ version (1B)│ length (4 B)   │ reserved (4B)│ payload (N bytes) │
//! └────────────────┴─────────────┴────────────────┴──────────────┴───────────────────┘
//! ```
//!
//! - **version**: always `0x01`.
//! - **length**: little-endian `i32`, size of the payload only.
//! - **reserved**: four zero bytes.
//! - **payload**: JSON body.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur while framing or parsing sender messages.
#[derive(Debug)]
pub enum ProtocolError {
    /// Frame too short, truncated, or with an impossible length.
    InvalidMessage(String),
    /// The first four bytes are not `ZBXD`.
    BadSignature([u8; 4]),
    /// The version byte is not [`PROTOCOL_VERSION`].
    UnsupportedVersion(u8),
    /// JSON (de)serialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            ProtocolError::BadSignature(sig) => {
                write!(f, "Invalid signature: {:?}", String::from_utf8_lossy(sig))
            }
            ProtocolError::UnsupportedVersion(v) => write!(f, "Unsupported version: {:#04x}", v),
            ProtocolError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Protocol signature that starts every frame.
pub const HEADER_SIGNATURE: &[u8; 4] = b"ZBXD";

/// Protocol version marker following the signature.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Signature + version.
pub const HEADER_SIZE: usize = 5;

/// Length (4) + reserved (4).
pub const DATA_HEADER_SIZE: usize = 8;

/// Largest payload we are willing to frame or accept (128 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 128 * 1024 * 1024;

/// Request name for pushing item values as a proxy.
pub const HISTORY_DATA_REQUEST: &str = "history data";

/// Validate the 5-byte protocol header.
pub fn check_header(header: &[u8; HEADER_SIZE]) -> Result<(), ProtocolError> {
    if &header[..4] != HEADER_SIGNATURE {
        return Err(ProtocolError::BadSignature([
            header[0], header[1], header[2], header[3],
        ]));
    }
    if header[4] != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(header[4]));
    }
    Ok(())
}

/// Extract the payload length from the 8-byte data header.
///
/// Only the first four bytes carry the length; the rest are reserved.
pub fn payload_length(data_header: &[u8; DATA_HEADER_SIZE]) -> Result<usize, ProtocolError> {
    let length = LittleEndian::read_i32(&data_header[..4]);
    if length < 0 {
        return Err(ProtocolError::InvalidMessage(format!(
            "negative payload length {}",
            length
        )));
    }
    let length = length as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::InvalidMessage(format!(
            "payload length {} exceeds limit",
            length
        )));
    }
    Ok(length)
}

// ---------------------------------------------------------------------------
// Envelope (wire frame)
// ---------------------------------------------------------------------------

/// A framed sender message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// JSON payload.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Frame an already-encoded payload.
    pub fn new(payload: Vec<u8>) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::InvalidMessage(format!(
                "payload of {} bytes exceeds limit",
                payload.len()
            )));
        }
        Ok(Self { payload })
    }

    /// Encode `body` as JSON and frame it.
    pub fn from_json<T: Serialize>(body: &T) -> Result<Self, ProtocolError> {
        Self::new(serde_json::to_vec(body)?)
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Serialize this envelope into a byte buffer (header + data header + payload).
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + DATA_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(HEADER_SIGNATURE);
        buf.push(PROTOCOL_VERSION);
        // Writing into a Vec cannot fail.
        let _ = buf.write_i32::<LittleEndian>(self.payload.len() as i32);
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize an envelope from a contiguous byte slice.
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE + DATA_HEADER_SIZE {
            return Err(ProtocolError::InvalidMessage("Message too short".into()));
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&data[..HEADER_SIZE]);
        check_header(&header)?;

        let mut data_header = [0u8; DATA_HEADER_SIZE];
        data_header.copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE + DATA_HEADER_SIZE]);
        let length = payload_length(&data_header)?;

        let start = HEADER_SIZE + DATA_HEADER_SIZE;
        if data.len() < start + length {
            return Err(ProtocolError::InvalidMessage("Incomplete message".into()));
        }

        Ok(Self {
            payload: data[start..start + length].to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Data types: history data
// ---------------------------------------------------------------------------

/// One item value pushed to Zabbix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    /// Zabbix host name (the instance id).
    pub host: String,
    /// Item key (the Ceilometer meter name).
    pub key: String,
    /// Item value, always a string on the wire.
    pub value: String,
    /// Unix timestamp of the measurement, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<i64>,
}

/// `history data` request body sent on behalf of a Zabbix proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryData {
    pub request: String,
    /// Proxy identity as configured in Zabbix.
    pub host: String,
    pub data: Vec<HistoryItem>,
}

impl HistoryData {
    pub fn new(proxy_name: impl Into<String>, data: Vec<HistoryItem>) -> Self {
        Self {
            request: HISTORY_DATA_REQUEST.to_string(),
            host: proxy_name.into(),
            data,
        }
    }
}

/// Response returned by the Zabbix trapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderResponse {
    /// `"success"` or `"failed"`.
    pub response: String,
    #[serde(default)]
    pub info: Option<String>,
}

impl SenderResponse {
    pub fn is_success(&self) -> bool {
        self.response == "success"
    }

    /// Parse the `info` counters, when present in the usual form.
    pub fn processed(&self) -> Option<ProcessedInfo> {
        self.info.as_deref().and_then(ProcessedInfo::parse)
    }
}

/// Counters from `processed: 1; failed: 0; total: 1; seconds spent: 0.000055`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessedInfo {
    pub processed: u64,
    pub failed: u64,
    pub total: u64,
    pub seconds_spent: f64,
}

impl ProcessedInfo {
    pub fn parse(info: &str) -> Option<Self> {
        let mut processed = None;
        let mut failed = None;
        let mut total = None;
        let mut seconds_spent = None;

        for part in info.split(';') {
            let (name, value) = part.split_once(':')?;
            let value = value.trim();
            match name.trim() {
                "processed" => processed = value.parse().ok(),
                "failed" => failed = value.parse().ok(),
                "total" => total = value.parse().ok(),
                "seconds spent" => seconds_spent = value.parse().ok(),
                _ => {}
            }
        }

        Some(Self {
            processed: processed?,
            failed: failed?,
            total: total?,
            seconds_spent: seconds_spent.unwrap_or(0.0),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
