//! Relay error types

use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced by the relay core.
///
/// The taxonomy matters to callers: `Unreachable` routes a session into the
/// supervisor's restart path, `RetriesExhausted` is the only fatal condition,
/// everything else terminates the current session only.
#[derive(Error, Debug)]
pub enum RelayError {
    /// I/O error on a client or upstream channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded read or write did not complete within the channel timeout
    #[error("channel timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Upstream refused or failed the transport connect; triggers restart
    #[error("upstream unreachable at {host}:{port}: {source}")]
    Unreachable {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    /// ALPN negotiation did not select the expected protocol id
    #[error("ALPN negotiation failed: expected \"h2\", peer selected {selected:?}")]
    AlpnMismatch { selected: Option<String> },

    /// Peer violated the handshake message order or sent malformed bytes
    #[error("handshake protocol violation: {0}")]
    Handshake(String),

    /// Malformed or truncated frame on the wire
    #[error("frame error: {0}")]
    Frame(String),

    /// All post-restart reconnect attempts failed; the process cannot continue
    #[error("upstream still unreachable after restart and {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },
}

impl RelayError {
    /// True when the error should be routed into restart-and-retry rather
    /// than failing only the current session.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RelayError::Unreachable { .. })
    }

    /// True for the sole unrecoverable condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::RetriesExhausted { .. })
    }
}
