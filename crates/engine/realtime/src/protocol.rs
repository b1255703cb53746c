//! Wire protocol messages and the handshake/close-code policy.
//!
//! Messages are JSON objects of the form
//! `{"event": "...", "channel": "...", "data": ...}`. The server often
//! sends `data` as a JSON-encoded string; [`decode_message`] unwraps it.

use crate::error::{NetworkError, NetworkResult};
use crate::transport::{CloseEvent, MessageEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const ERROR: &str = "pusher:error";
pub const PING: &str = "pusher:ping";
pub const PONG: &str = "pusher:pong";

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ProtocolMessage {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            channel: None,
            data,
            user_id: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

/// What the caller should do after a handshake or a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeAction {
    /// Session established.
    Connected,
    /// Malformed handshake or unclassified server error.
    Error,
    /// Reconnect over an encrypted transport only.
    TlsOnly,
    /// The server refused the connection; do not retry.
    Refused,
    /// Retry after backing off.
    Backoff,
    /// Retry immediately.
    Retry,
}

impl HandshakeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Error => "error",
            Self::TlsOnly => "tls_only",
            Self::Refused => "refused",
            Self::Backoff => "backoff",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for HandshakeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded first message of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeDecision {
    Connected {
        id: String,
        activity_timeout: Duration,
    },
    Rejected {
        action: HandshakeAction,
        error: Option<NetworkError>,
    },
}

/// Decode a raw message event.
pub fn decode_message(event: &MessageEvent) -> NetworkResult<ProtocolMessage> {
    let mut message: ProtocolMessage = serde_json::from_str(&event.data)
        .map_err(|e| NetworkError::Deserialization(format!("{e}: {}", event.data)))?;

    if let Value::String(raw) = &message.data {
        if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
            message.data = parsed;
        }
    }

    Ok(message)
}

/// Encode a message for the wire.
pub fn encode_message(message: &ProtocolMessage) -> NetworkResult<String> {
    serde_json::to_string(message).map_err(|e| NetworkError::Serialization(e.to_string()))
}

/// Interpret the first message received on a fresh transport.
pub fn process_handshake(event: &MessageEvent) -> NetworkResult<HandshakeDecision> {
    let message = decode_message(event)?;

    match message.event.as_str() {
        CONNECTION_ESTABLISHED => {
            let activity_timeout = message
                .data
                .get("activity_timeout")
                .and_then(Value::as_f64)
                .filter(|t| *t > 0.0)
                .and_then(|t| Duration::try_from_secs_f64(t).ok())
                .ok_or_else(|| {
                    NetworkError::InvalidHandshake(
                        "no activity timeout specified in handshake".into(),
                    )
                })?;
            let id = message
                .data
                .get("socket_id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    NetworkError::InvalidHandshake("no socket id specified in handshake".into())
                })?;

            Ok(HandshakeDecision::Connected {
                id: id.to_string(),
                activity_timeout,
            })
        }
        ERROR => {
            let close = CloseEvent::new(
                message
                    .data
                    .get("code")
                    .and_then(Value::as_u64)
                    .and_then(|c| u16::try_from(c).ok()),
                message
                    .data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
                true,
            );
            Ok(HandshakeDecision::Rejected {
                action: close_action(&close).unwrap_or(HandshakeAction::Error),
                error: close_error(&close),
            })
        }
        other => Err(NetworkError::InvalidHandshake(format!(
            "unexpected event {other}"
        ))),
    }
}

/// Map a close code to the action the caller should take.
///
/// Returns `None` when the code carries no guidance.
pub fn close_action(event: &CloseEvent) -> Option<HandshakeAction> {
    let code = event.code?;
    match code {
        1002..=1004 => Some(HandshakeAction::Backoff),
        0..=3999 => None,
        4000 => Some(HandshakeAction::TlsOnly),
        4001..=4099 => Some(HandshakeAction::Refused),
        4100..=4199 => Some(HandshakeAction::Backoff),
        4200..=4299 => Some(HandshakeAction::Retry),
        _ => Some(HandshakeAction::Refused),
    }
}

/// Error carried by a close event. Normal closures (1000, 1001) have none.
pub fn close_error(event: &CloseEvent) -> Option<NetworkError> {
    match event.code {
        Some(1000) | Some(1001) => None,
        code => Some(NetworkError::Protocol {
            code,
            message: event.reason.clone(),
        }),
    }
}
