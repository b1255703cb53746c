//! Network error types.

use thiserror::Error;

/// Errors produced while establishing a realtime connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Connection failed to establish.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport closed before it finished opening.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The first server message was not a usable handshake.
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    /// Error reported by the server, either in a message or a close frame.
    #[error("protocol error {}: {message}", display_code(.code))]
    Protocol { code: Option<u16>, message: String },

    /// The attempt lost the priority race and was dropped.
    #[error("superseded by a higher priority transport")]
    Superseded,

    /// The transport cannot run in this environment.
    #[error("unsupported transport: {0}")]
    Unsupported(String),

    /// Invalid state for operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Transport-specific error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Missing or malformed configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl NetworkError {
    /// Whether the failure only means another transport won the race.
    ///
    /// Callers should not apply backoff for these.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }
}

fn display_code(code: &Option<u16>) -> String {
    code.map_or_else(|| "-".to_string(), |c| c.to_string())
}

/// Convenience result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
