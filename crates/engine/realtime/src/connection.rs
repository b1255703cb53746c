//! Application connection over an established transport.
//!
//! A [`Connection`] is created by the handshake once the server has
//! accepted the session. It owns the transport from then on and turns raw
//! transport events into [`ConnectionEvent`]s for the session layer.

use crate::error::NetworkError;
use crate::protocol::{self, HandshakeAction, ProtocolMessage};
use crate::transport::{
    listener, CloseEvent, ListenerId, Transport, TransportEvent, TransportEventKind,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Events emitted by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Any decoded protocol message, including pings and errors.
    Message(ProtocolMessage),
    /// The server asked for a liveness reply.
    Ping,
    /// The server answered a ping.
    Pong,
    /// Server-side or decoding error.
    Error(NetworkError),
    /// Traffic was seen on the transport.
    Activity,
    /// The transport closed with a code that carries guidance.
    Action {
        action: HandshakeAction,
        error: Option<NetworkError>,
    },
    /// The transport closed. Always the last event.
    Closed,
}

/// Handler for connection events. A connection has at most one.
pub type EventHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

struct ConnectionInner {
    id: String,
    transport: Arc<dyn Transport>,
    handler: Mutex<Option<EventHandler>>,
    listeners: Mutex<Vec<ListenerId>>,
    closed: AtomicBool,
}

/// Live, authenticated connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Take over `transport` for session `id`.
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let inner = Arc::new(ConnectionInner {
            id: id.into(),
            transport,
            handler: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        ConnectionInner::bind_listeners(&inner);
        Self { inner }
    }

    /// Session id assigned by the server.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Transport the connection owns.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Whether the transport has reported its close.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Install the event handler, replacing any previous one.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        *self.inner.handler.lock() = Some(Arc::new(handler));
    }

    /// Stop delivering events.
    pub fn clear_handler(&self) {
        self.inner.handler.lock().take();
    }

    /// Send a raw payload.
    pub fn send(&self, data: &str) -> bool {
        self.inner.transport.send(data)
    }

    /// Encode and send an event.
    pub fn send_event(&self, name: &str, data: Value, channel: Option<&str>) -> bool {
        let mut message = ProtocolMessage::new(name, data);
        if let Some(channel) = channel {
            message = message.with_channel(channel);
        }
        match protocol::encode_message(&message) {
            Ok(encoded) => self.send(&encoded),
            Err(e) => {
                tracing::warn!("Dropping event {}: {}", name, e);
                false
            }
        }
    }

    /// Prove liveness, natively if the transport can.
    pub fn ping(&self) {
        if self.inner.transport.supports_ping() {
            self.inner.transport.ping();
        } else {
            self.send_event(protocol::PING, Value::Object(Default::default()), None);
        }
    }

    /// Close the underlying transport.
    pub fn close(&self) {
        self.inner.transport.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.transport.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionInner {
    fn bind_listeners(this: &Arc<Self>) {
        let bind = |kind: TransportEventKind| {
            let weak: Weak<Self> = Arc::downgrade(this);
            this.transport.bind(
                kind,
                listener(move |event| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_transport_event(event);
                    }
                }),
            )
        };

        let ids = vec![
            bind(TransportEventKind::Message),
            bind(TransportEventKind::Activity),
            bind(TransportEventKind::Error),
            bind(TransportEventKind::Closed),
        ];
        *this.listeners.lock() = ids;
    }

    fn unbind_listeners(&self) {
        let ids = std::mem::take(&mut *self.listeners.lock());
        for id in ids {
            self.transport.unbind(id);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn on_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Message(raw) => match protocol::decode_message(raw) {
                Ok(message) => self.on_message(message),
                Err(e) => self.emit(ConnectionEvent::Error(e)),
            },
            TransportEvent::Activity => self.emit(ConnectionEvent::Activity),
            TransportEvent::Error(e) => self.emit(ConnectionEvent::Error(e.clone())),
            TransportEvent::Closed(close) => self.on_closed(close),
            TransportEvent::Open => {}
        }
    }

    fn on_message(&self, message: ProtocolMessage) {
        match message.event.as_str() {
            protocol::ERROR => {
                let error = NetworkError::Protocol {
                    code: message
                        .data
                        .get("code")
                        .and_then(Value::as_u64)
                        .and_then(|c| u16::try_from(c).ok()),
                    message: message
                        .data
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                };
                self.emit(ConnectionEvent::Error(error));
            }
            protocol::PING => self.emit(ConnectionEvent::Ping),
            protocol::PONG => self.emit(ConnectionEvent::Pong),
            _ => {}
        }
        self.emit(ConnectionEvent::Message(message));
    }

    fn on_closed(&self, close: &CloseEvent) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.unbind_listeners();
        tracing::debug!(
            "Connection {} closed ({:?}: {})",
            self.id,
            close.code,
            close.reason
        );

        if close.code.is_some() {
            let action = protocol::close_action(close);
            let error = protocol::close_error(close);
            if let Some(error) = error.clone() {
                self.emit(ConnectionEvent::Error(error));
            }
            if let Some(action) = action {
                self.emit(ConnectionEvent::Action { action, error });
            }
        }
        self.emit(ConnectionEvent::Closed);
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.unbind_listeners();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use serde_json::json;

    fn recording(connection: &Connection) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        connection.set_handler(move |event| sink.lock().push(event));
        events
    }

    #[test]
    fn test_messages_are_decoded() {
        let transport = MemoryTransport::new("memory", 1);
        let connection = Connection::new("1.1", transport.clone());
        let events = recording(&connection);

        transport.emit_message(r#"{"event":"pusher:ping","data":{}}"#);
        transport.emit_message("garbage");

        let events = events.lock();
        assert_eq!(events[0], ConnectionEvent::Ping);
        assert!(matches!(&events[1], ConnectionEvent::Message(m) if m.event == protocol::PING));
        assert!(matches!(
            events[2],
            ConnectionEvent::Error(NetworkError::Deserialization(_))
        ));
    }

    #[test]
    fn test_server_error_message() {
        let transport = MemoryTransport::new("memory", 1);
        let connection = Connection::new("1.1", transport.clone());
        let events = recording(&connection);

        transport.emit_message(
            json!({
                "event": "pusher:error",
                "data": {"code": 4201, "message": "Pong reply not received"},
            })
            .to_string(),
        );

        assert_eq!(
            events.lock()[0],
            ConnectionEvent::Error(NetworkError::Protocol {
                code: Some(4201),
                message: "Pong reply not received".into(),
            })
        );
    }

    #[test]
    fn test_close_with_code_reports_action() {
        let transport = MemoryTransport::new("memory", 1);
        let connection = Connection::new("1.1", transport.clone());
        let events = recording(&connection);

        transport.emit_closed(Some(4100), "Over capacity");

        let events = events.lock();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ConnectionEvent::Error(_)));
        assert!(matches!(
            events[1],
            ConnectionEvent::Action {
                action: HandshakeAction::Backoff,
                ..
            }
        ));
        assert_eq!(events[2], ConnectionEvent::Closed);
        assert!(connection.is_closed());
        assert_eq!(transport.listener_count(), 0);
    }

    #[test]
    fn test_activity_is_forwarded() {
        let transport = MemoryTransport::new("memory", 1);
        let connection = Connection::new("1.1", transport.clone());
        let events = recording(&connection);

        transport.emit_activity();
        transport.emit_activity();

        assert_eq!(
            *events.lock(),
            vec![ConnectionEvent::Activity, ConnectionEvent::Activity]
        );
    }

    #[test]
    fn test_dropping_last_handle_unbinds() {
        let transport = MemoryTransport::new("memory", 1);
        let connection = Connection::new("1.1", transport.clone());
        let copy = connection.clone();
        assert_eq!(transport.listener_count(), 4);

        drop(connection);
        assert_eq!(transport.listener_count(), 4);
        drop(copy);
        assert_eq!(transport.listener_count(), 0);
        assert!(!transport.is_closed());
    }

    #[test]
    fn test_close_without_code() {
        let transport = MemoryTransport::new("memory", 1);
        let connection = Connection::new("1.1", transport.clone());
        let events = recording(&connection);

        transport.emit_closed(None, "");

        assert_eq!(*events.lock(), vec![ConnectionEvent::Closed]);
    }

    #[test]
    fn test_send_event_with_channel() {
        let transport = MemoryTransport::new("memory", 1);
        let connection = Connection::new("1.1", transport.clone());

        assert!(connection.send_event("client-move", json!({"x": 1}), Some("private-room")));
        assert_eq!(
            transport.sent(),
            vec![r#"{"event":"client-move","channel":"private-room","data":{"x":1}}"#.to_string()]
        );
    }

    #[test]
    fn test_ping_falls_back_to_event() {
        let transport = MemoryTransport::new("memory", 1);
        Connection::new("1.1", transport.clone()).ping();
        assert_eq!(transport.sent(), vec![r#"{"event":"pusher:ping","data":{}}"#.to_string()]);

        let native = MemoryTransport::with_native_ping("native", 1);
        Connection::new("1.2", native.clone()).ping();
        assert_eq!(native.pings(), 1);
        assert!(native.sent().is_empty());
    }
}
