//! # Error Types
//!
//! Error handling for the multiplexing protocol.
//!
//! ## Error Categories
//! - **Handshake failures**: bad magic, bad or unsupported version, timeout.
//!   The connection is torn down before any session exists.
//! - **Protocol violations**: malformed frames, illegal operations for the
//!   current session state, ration overrun or overflow. Fatal to the whole
//!   connection; the peer is sent an Error frame first.
//! - **I/O failures**: read/write errors and unexpected end of stream.
//! - **Session failures**: local abort, peer abort or close, connection down.
//!
//! Session byte-stream endpoints report failures as [`std::io::Error`] values
//! wrapping a [`MuxError`], so they compose with `tokio::io` utilities.
//!
//! ## Example Usage
//! ```rust
//! use mux_protocol::error::{MuxError, Result};
//! use mux_protocol::protocol::handshake::encode_ration;
//! use tracing::{error, info};
//!
//! fn ration_field(ration: u32) -> Result<u16> {
//!     encode_ration(ration)
//! }
//!
//! match ration_field(0x00FF_0000) {
//!     Ok(field) => info!(field, "ration encoded"),
//!     Err(e) => error!(error = %e, "invalid ration"),
//! }
//! assert!(matches!(ration_field(0x0000_0001), Err(MuxError::InvalidRation(1))));
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Handshake errors
    pub const ERR_BAD_MAGIC: &str = "Bad magic number in connection header";
    pub const ERR_ZERO_VERSION: &str = "Connection header carries invalid version 0";
    pub const ERR_HANDSHAKE_TIMEOUT: &str = "Handshake timed out";
    pub const ERR_HANDSHAKE_INCOMPLETE: &str = "Handshake not complete";
    pub const ERR_ALREADY_STARTED: &str = "Connection already started";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed by peer";
    pub const ERR_READ_FAILED: &str = "Read from connection failed";
    pub const ERR_WRITE_FAILED: &str = "Write to connection failed";
    pub const ERR_MUX_DROPPED: &str = "Connection handle dropped";
    pub const ERR_SEND_ABANDONED: &str = "Send abandoned before completion";
    pub const ERR_PROTOCOL_VIOLATION: &str = "Protocol violation";
    pub const ERR_PEER_ERROR: &str = "Error reported by peer";
    pub const ERR_PEER_SHUTDOWN: &str = "Connection shut down by peer";
    pub const ERR_LOCAL_SHUTDOWN: &str = "Connection shut down";

    /// Role errors
    pub const ERR_INITIATOR_ONLY: &str = "Operation only valid for the initiator";
    pub const ERR_RESPONDER_ONLY: &str = "Operation only valid for the responder";

    /// Session errors
    pub const ERR_SESSIONS_EXHAUSTED: &str = "No free session identifiers";
    pub const ERR_SESSION_ABORTED: &str = "Session aborted";
    pub const ERR_SESSION_CLOSED_BY_PEER: &str = "Session closed by peer";
    pub const ERR_SESSION_SUPERSEDED: &str = "Session superseded by a new open";
    pub const ERR_SESSION_VETOED: &str = "Session rejected by accept hook";
    pub const ERR_OUTPUT_FINISHED: &str = "Session output already finished";
}

/// Why a connection went down.
///
/// Set exactly once per connection and shared with every session and pending
/// send, so it is cheap to clone.
#[derive(Debug, Clone)]
pub struct DownReason {
    message: String,
    cause: Option<Arc<MuxError>>,
}

impl DownReason {
    pub fn new(message: impl Into<String>, cause: Option<MuxError>) -> Self {
        Self {
            message: message.into(),
            cause: cause.map(Arc::new),
        }
    }

    /// Human-readable description of the teardown.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Underlying error, if the teardown was caused by one.
    pub fn cause(&self) -> Option<&MuxError> {
        self.cause.as_deref()
    }
}

impl fmt::Display for DownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => f.write_str(&self.message),
        }
    }
}

// MuxError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid ration {0:#010x}: only bits 8-23 may be set")]
    InvalidRation(u32),

    #[error("Invalid session identifier: {0}")]
    InvalidSessionId(usize),

    #[error("Frame body too large: {0} bytes")]
    BodyTooLarge(usize),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Error reported by peer: {0}")]
    PeerError(String),

    #[error("Connection down: {0}")]
    ConnectionDown(DownReason),

    #[error("Session failed: {0}")]
    SessionFailed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("{}", constants::ERR_SESSIONS_EXHAUSTED)]
    SessionsExhausted,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl MuxError {
    /// Shorthand for building a protocol violation.
    pub fn violation(message: impl Into<String>) -> Self {
        MuxError::ProtocolViolation(message.into())
    }

    /// Whether this error belongs to the handshake phase.
    ///
    /// Handshake failures tear the connection down without an Error frame.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            MuxError::Handshake(_) | MuxError::UnsupportedVersion(_)
        )
    }

    /// Whether the peer should be told about this error with an Error frame.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            MuxError::ProtocolViolation(_) | MuxError::InvalidSessionId(_) | MuxError::BodyTooLarge(_)
        )
    }
}

/// Type alias for Results using MuxError
pub type Result<T> = std::result::Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_down_reason_display_with_cause() {
        let reason = DownReason::new("read failed", Some(MuxError::Timeout));
        assert_eq!(reason.to_string(), "read failed: Timeout occurred");
        assert!(matches!(reason.cause(), Some(MuxError::Timeout)));
    }

    #[test]
    fn test_down_reason_display_without_cause() {
        let reason = DownReason::new("shut down by peer", None);
        assert_eq!(reason.to_string(), "shut down by peer");
        assert!(reason.cause().is_none());
    }

    #[test]
    fn test_error_classification() {
        assert!(MuxError::Handshake("x".into()).is_handshake());
        assert!(MuxError::UnsupportedVersion(9).is_handshake());
        assert!(!MuxError::Timeout.is_handshake());
        assert!(MuxError::violation("bad").is_protocol_violation());
        assert!(MuxError::InvalidSessionId(300).is_protocol_violation());
        assert!(!MuxError::Io(io::Error::other("boom")).is_protocol_violation());
    }

    #[test]
    fn test_sessions_exhausted_message() {
        assert_eq!(
            MuxError::SessionsExhausted.to_string(),
            constants::ERR_SESSIONS_EXHAUSTED
        );
    }
}
