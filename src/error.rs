//! Error types for zcp

use thiserror::Error;

/// Result type alias using zcp Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in zcp operations
#[derive(Error, Debug)]
pub enum Error {
    /// The auth provider could not issue a credential
    #[error("Authentication error: {0}")]
    Auth(String),

    /// A request kept failing with 401 after the bounded refresh-and-retry
    #[error("Credential rejected by {url} after {attempts} attempt(s)")]
    AuthExpired { url: String, attempts: u32 },

    /// 408, 429 or 5xx; retried with backoff before surfacing
    #[error("Transient HTTP {status} from {url}")]
    TransientHttp { status: u16, url: String },

    /// Any other non-success status
    #[error("HTTP {status} from {url}: {body}")]
    Http {
        status: u16,
        url: String,
        body: String,
    },

    /// Transport-level HTTP failure
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    /// Upstream answered with a body we could not interpret
    #[error("Unexpected response from {url}: {reason}")]
    UnexpectedResponse { url: String, reason: String },

    /// Sender wire-format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] zcp_protocol::ProtocolError),

    /// Zabbix could not be reached within the configured attempts
    #[error("Zabbix at {addr} unreachable after {attempts} attempt(s): {last_error}")]
    BackendUnreachable {
        addr: String,
        attempts: u32,
        last_error: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for operation
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Errors that end the current poll cycle instead of a single host or metric.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(self, Error::AuthExpired { .. } | Error::Auth(_)) || self.is_process_fatal()
    }

    /// Errors that stop the process.
    pub fn is_process_fatal(&self) -> bool {
        matches!(self, Error::BackendUnreachable { .. })
    }
}
