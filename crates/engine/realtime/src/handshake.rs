//! Protocol handshake over a freshly opened transport.
//!
//! The handshake waits for the first server message (or a close), decides
//! the outcome once, and reports it through a one-shot callback:
//!
//! - `connected`: a [`Connection`] now owns the transport.
//! - any other action: the handshake closed the transport (unless the
//!   transport closed itself) and reports the error, if any.
//!
//! [`Handshake::close`] cancels a pending handshake without calling back.

use crate::connection::Connection;
use crate::error::NetworkError;
use crate::protocol::{self, HandshakeAction, HandshakeDecision};
use crate::transport::{
    listener, CloseEvent, ListenerId, MessageEvent, Transport, TransportEvent, TransportEventKind,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Action-specific part of a handshake result.
#[derive(Debug)]
pub enum HandshakeOutcome {
    Connected {
        connection: Connection,
        activity_timeout: Duration,
    },
    Failed {
        action: HandshakeAction,
        error: Option<NetworkError>,
    },
}

/// Terminal result of a handshake.
#[derive(Debug)]
pub struct HandshakeResult {
    /// The transport the handshake ran on.
    pub transport: Arc<dyn Transport>,
    pub outcome: HandshakeOutcome,
}

impl HandshakeResult {
    /// `connected`, or what the caller should do next.
    pub fn action(&self) -> HandshakeAction {
        match &self.outcome {
            HandshakeOutcome::Connected { .. } => HandshakeAction::Connected,
            HandshakeOutcome::Failed { action, .. } => *action,
        }
    }

    /// The new connection, if the server accepted the session.
    pub fn connection(&self) -> Option<&Connection> {
        match &self.outcome {
            HandshakeOutcome::Connected { connection, .. } => Some(connection),
            HandshakeOutcome::Failed { .. } => None,
        }
    }

    /// Server-requested inactivity window, if connected.
    pub fn activity_timeout(&self) -> Option<Duration> {
        match &self.outcome {
            HandshakeOutcome::Connected {
                activity_timeout, ..
            } => Some(*activity_timeout),
            HandshakeOutcome::Failed { .. } => None,
        }
    }

    /// Why the handshake failed, when there is a reason.
    pub fn error(&self) -> Option<&NetworkError> {
        match &self.outcome {
            HandshakeOutcome::Connected { .. } => None,
            HandshakeOutcome::Failed { error, .. } => error.as_ref(),
        }
    }
}

/// Callback receiving the handshake result.
pub type HandshakeCallback = Box<dyn FnOnce(HandshakeResult) + Send>;

struct Listeners {
    message: ListenerId,
    closed: ListenerId,
}

struct HandshakeInner {
    transport: Arc<dyn Transport>,
    callback: Mutex<Option<HandshakeCallback>>,
    listeners: Mutex<Option<Listeners>>,
}

/// Single-use handshake bound to one transport.
pub struct Handshake {
    inner: Arc<HandshakeInner>,
}

impl Handshake {
    /// Bind to `transport` and wait for the server's first word.
    ///
    /// The transport must already be open.
    pub fn new<F>(transport: Arc<dyn Transport>, callback: F) -> Self
    where
        F: FnOnce(HandshakeResult) + Send + 'static,
    {
        let inner = Arc::new(HandshakeInner {
            transport,
            callback: Mutex::new(Some(Box::new(callback))),
            listeners: Mutex::new(None),
        });
        HandshakeInner::bind_listeners(&inner);
        Self { inner }
    }

    /// Whether the handshake is still waiting for a result.
    pub fn is_pending(&self) -> bool {
        self.inner.listeners.lock().is_some()
    }

    /// Abort a pending handshake and close its transport.
    ///
    /// The callback is dropped without being called. No-op once the
    /// handshake has finished, so a transport handed to a connection is
    /// left alone.
    pub fn close(&self) {
        if !self.inner.unbind_listeners() {
            return;
        }
        let callback = self.inner.callback.lock().take();
        drop(callback);
        tracing::debug!("Handshake on {} cancelled", self.inner.transport.name());
        self.inner.transport.close();
    }
}

impl HandshakeInner {
    // Listeners keep the handshake alive until it finishes or is closed.
    fn bind_listeners(this: &Arc<Self>) {
        let on_message = this.clone();
        let message = this.transport.bind(
            TransportEventKind::Message,
            listener(move |event| {
                if let TransportEvent::Message(message) = event {
                    on_message.on_message(message);
                }
            }),
        );

        let on_closed = this.clone();
        let closed = this.transport.bind(
            TransportEventKind::Closed,
            listener(move |event| {
                if let TransportEvent::Closed(close) = event {
                    on_closed.on_closed(close);
                }
            }),
        );

        *this.listeners.lock() = Some(Listeners { message, closed });
    }

    /// Returns false if the listeners were already gone.
    fn unbind_listeners(&self) -> bool {
        let listeners = self.listeners.lock().take();
        match listeners {
            Some(listeners) => {
                self.transport.unbind(listeners.message);
                self.transport.unbind(listeners.closed);
                true
            }
            None => false,
        }
    }

    fn on_message(&self, message: &MessageEvent) {
        if !self.unbind_listeners() {
            return;
        }

        match protocol::process_handshake(message) {
            Ok(HandshakeDecision::Connected {
                id,
                activity_timeout,
            }) => {
                tracing::debug!(
                    "Handshake on {} connected as {}",
                    self.transport.name(),
                    id
                );
                let connection = Connection::new(id, self.transport.clone());
                self.finish(HandshakeOutcome::Connected {
                    connection,
                    activity_timeout,
                });
            }
            Ok(HandshakeDecision::Rejected { action, error }) => {
                tracing::info!(
                    "Handshake on {} rejected: {} ({:?})",
                    self.transport.name(),
                    action,
                    error
                );
                self.finish(HandshakeOutcome::Failed { action, error });
                self.transport.close();
            }
            Err(e) => {
                tracing::warn!("Handshake on {} failed: {}", self.transport.name(), e);
                self.finish(HandshakeOutcome::Failed {
                    action: HandshakeAction::Error,
                    error: Some(e),
                });
                self.transport.close();
            }
        }
    }

    fn on_closed(&self, close: &CloseEvent) {
        if !self.unbind_listeners() {
            return;
        }

        let action = protocol::close_action(close).unwrap_or(HandshakeAction::Backoff);
        let error = protocol::close_error(close);
        tracing::debug!(
            "Transport {} closed during handshake ({:?}), action {}",
            self.transport.name(),
            close.code,
            action
        );
        self.finish(HandshakeOutcome::Failed { action, error });
    }

    fn finish(&self, outcome: HandshakeOutcome) {
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(HandshakeResult {
                transport: self.transport.clone(),
                outcome,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use serde_json::json;

    type Results = Arc<Mutex<Vec<HandshakeResult>>>;

    fn start(transport: &Arc<MemoryTransport>) -> (Handshake, Results) {
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let handshake = Handshake::new(transport.clone(), move |result| sink.lock().push(result));
        (handshake, results)
    }

    fn established(id: &str, activity_timeout: u64) -> String {
        json!({
            "event": "pusher:connection_established",
            "data": json!({"socket_id": id, "activity_timeout": activity_timeout}).to_string(),
        })
        .to_string()
    }

    #[test]
    fn test_connected() {
        let transport = MemoryTransport::new("ws", 1);
        let (handshake, results) = start(&transport);

        transport.emit_message(established("abc123", 30));

        let results = results.lock();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.action(), HandshakeAction::Connected);
        assert_eq!(result.transport.name(), "ws");
        assert_eq!(result.connection().map(Connection::id), Some("abc123"));
        assert_eq!(result.activity_timeout(), Some(Duration::from_millis(30_000)));
        assert!(result.error().is_none());
        assert!(!transport.is_closed());
        assert!(!handshake.is_pending());
    }

    #[test]
    fn test_second_message_is_ignored() {
        let transport = MemoryTransport::new("ws", 1);
        let (_handshake, results) = start(&transport);

        transport.emit_message(established("abc123", 30));
        transport.emit_message(established("other", 30));

        assert_eq!(results.lock().len(), 1);
    }

    #[test]
    fn test_close_after_connect_leaves_transport_open() {
        let transport = MemoryTransport::new("ws", 1);
        let (handshake, _results) = start(&transport);

        transport.emit_message(established("abc123", 30));
        handshake.close();

        assert_eq!(transport.close_calls(), 0);
    }

    #[test]
    fn test_refusal_closes_transport() {
        let transport = MemoryTransport::new("ws", 1);
        let (_handshake, results) = start(&transport);

        transport.emit_message(
            json!({"event": "pusher:error", "data": {"code": 4001, "message": "no app"}})
                .to_string(),
        );

        let results = results.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action(), HandshakeAction::Refused);
        assert_eq!(
            results[0].error(),
            Some(&NetworkError::Protocol {
                code: Some(4001),
                message: "no app".into(),
            })
        );
        assert!(transport.is_closed());
    }

    #[test]
    fn test_decode_fault_is_error() {
        let transport = MemoryTransport::new("ws", 1);
        let (_handshake, results) = start(&transport);

        transport.emit_message("{not json");

        let results = results.lock();
        assert_eq!(results[0].action(), HandshakeAction::Error);
        assert!(matches!(
            results[0].error(),
            Some(NetworkError::Deserialization(_))
        ));
        assert!(transport.is_closed());
        assert_eq!(transport.close_calls(), 1);
    }

    #[test]
    fn test_close_without_guidance_backs_off() {
        let transport = MemoryTransport::new("ws", 1);
        let (_handshake, results) = start(&transport);

        transport.emit_closed(Some(1006), "abnormal");

        let results = results.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action(), HandshakeAction::Backoff);
        assert_eq!(
            results[0].error(),
            Some(&NetworkError::Protocol {
                code: Some(1006),
                message: "abnormal".into(),
            })
        );
        assert_eq!(transport.close_calls(), 0);
    }

    #[test]
    fn test_normal_close_backs_off_without_error() {
        let transport = MemoryTransport::new("ws", 1);
        let (_handshake, results) = start(&transport);

        transport.emit_closed(Some(1000), "");

        let results = results.lock();
        assert_eq!(results[0].action(), HandshakeAction::Backoff);
        assert!(results[0].error().is_none());
    }

    #[test]
    fn test_close_code_guides_action() {
        let transport = MemoryTransport::new("ws", 1);
        let (_handshake, results) = start(&transport);

        transport.emit_closed(Some(4000), "SSL only");

        assert_eq!(results.lock()[0].action(), HandshakeAction::TlsOnly);
    }

    #[test]
    fn test_caller_close_never_calls_back() {
        let transport = MemoryTransport::new("ws", 1);
        let (handshake, results) = start(&transport);

        handshake.close();
        handshake.close();
        transport.emit_message(established("abc123", 30));

        assert!(results.lock().is_empty());
        assert!(transport.is_closed());
        assert_eq!(transport.close_calls(), 1);
        assert_eq!(transport.listener_count(), 0);
    }

    #[test]
    fn test_close_from_callback_is_safe() {
        let transport = MemoryTransport::new("ws", 1);
        let slot: Arc<Mutex<Option<Handshake>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(Mutex::new(0));

        let inner_slot = slot.clone();
        let counter = calls.clone();
        let handshake = Handshake::new(transport.clone(), move |_| {
            *counter.lock() += 1;
            if let Some(handshake) = inner_slot.lock().as_ref() {
                handshake.close();
            }
        });
        *slot.lock() = Some(handshake);

        transport.emit_closed(Some(4200), "restart");

        assert_eq!(*calls.lock(), 1);
    }
}
