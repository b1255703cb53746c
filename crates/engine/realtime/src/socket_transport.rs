//! HTTP streaming and polling transports.
//!
//! [`SocketTransport`] adapts a [`StreamSocket`] to the [`Transport`]
//! interface; [`HttpTransportFactory`] builds one per connection attempt.

use crate::config::StrategyOptions;
use crate::error::{NetworkError, NetworkResult};
use crate::socket::{HttpClient, PollingHooks, SocketHooks, StreamSocket, StreamingHooks};
use crate::transport::{
    Dispatcher, Listener, ListenerId, Transport, TransportEvent, TransportEventKind,
    TransportFactory,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Transport backed by a stream socket.
pub struct SocketTransport {
    name: String,
    url: String,
    hooks: Arc<dyn SocketHooks>,
    client: Arc<dyn HttpClient>,
    dispatcher: Arc<Dispatcher>,
    socket: Mutex<Option<StreamSocket>>,
}

impl SocketTransport {
    /// Transport that opens a socket to `url` on `open`.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        hooks: Arc<dyn SocketHooks>,
        client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            hooks,
            client,
            dispatcher: Arc::new(Dispatcher::new()),
            socket: Mutex::new(None),
        }
    }

    /// The underlying socket, once opened.
    pub fn socket(&self) -> Option<StreamSocket> {
        self.socket.lock().clone()
    }

    fn wire(&self, socket: &StreamSocket) {
        let dispatcher = self.dispatcher.clone();
        socket.set_onopen(move || {
            dispatcher.emit(&TransportEvent::Open);
        });
        let dispatcher = self.dispatcher.clone();
        socket.set_onmessage(move |message| {
            dispatcher.emit(&TransportEvent::Message(message.clone()));
        });
        let dispatcher = self.dispatcher.clone();
        socket.set_onactivity(move || {
            dispatcher.emit(&TransportEvent::Activity);
        });
        let dispatcher = self.dispatcher.clone();
        socket.set_onerror(move |error| {
            dispatcher.emit(&TransportEvent::Error(error.clone()));
        });
        let dispatcher = self.dispatcher.clone();
        socket.set_onclose(move |close| {
            dispatcher.emit(&TransportEvent::Closed(close.clone()));
        });
    }
}

impl Transport for SocketTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> NetworkResult<()> {
        let socket = {
            let mut slot = self.socket.lock();
            if slot.is_some() {
                return Err(NetworkError::InvalidState(format!(
                    "{} already opened",
                    self.name
                )));
            }
            let socket = StreamSocket::new(self.hooks.clone(), self.client.clone(), &self.url)?;
            *slot = Some(socket.clone());
            socket
        };
        self.wire(&socket);
        tracing::debug!("Opening {} session {}", self.name, socket.session());
        socket.open();
        Ok(())
    }

    fn close(&self) {
        if let Some(socket) = self.socket() {
            socket.close(None, "");
        }
    }

    fn send(&self, payload: &str) -> bool {
        self.socket()
            .is_some_and(|socket| socket.send(&Value::String(payload.to_string())))
    }

    fn supports_ping(&self) -> bool {
        true
    }

    fn ping(&self) -> bool {
        match self.socket() {
            Some(socket) => {
                socket.ping();
                true
            }
            None => false,
        }
    }

    fn bind(&self, kind: TransportEventKind, listener: Listener) -> ListenerId {
        self.dispatcher.bind(kind, listener)
    }

    fn unbind(&self, id: ListenerId) {
        self.dispatcher.unbind(id);
    }
}

/// Creates [`SocketTransport`]s against the configured HTTP endpoint.
pub struct HttpTransportFactory {
    client: Arc<dyn HttpClient>,
    hooks: Arc<dyn SocketHooks>,
}

impl HttpTransportFactory {
    /// Factory using custom socket hooks.
    pub fn new(client: Arc<dyn HttpClient>, hooks: Arc<dyn SocketHooks>) -> Self {
        Self { client, hooks }
    }

    /// One long-lived receiving request per session.
    pub fn streaming(client: Arc<dyn HttpClient>) -> Self {
        Self::new(client, Arc::new(StreamingHooks))
    }

    /// A fresh receiving request after every response.
    pub fn polling(client: Arc<dyn HttpClient>) -> Self {
        Self::new(client, Arc::new(PollingHooks))
    }
}

impl TransportFactory for HttpTransportFactory {
    fn is_supported(&self, _options: &StrategyOptions) -> bool {
        self.client.is_supported()
    }

    fn create_connection(
        &self,
        name: &str,
        _priority: i32,
        options: &StrategyOptions,
    ) -> NetworkResult<Arc<dyn Transport>> {
        let transport = SocketTransport::new(
            name,
            options.http_url(),
            self.hooks.clone(),
            self.client.clone(),
        );
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::testing::FakeClient;
    use crate::socket::SocketState;
    use crate::transport::{listener, CloseEvent};

    fn options() -> StrategyOptions {
        StrategyOptions {
            use_tls: false,
            http_port: 8080,
            ..StrategyOptions::with_key("key")
        }
    }

    fn recorded(transport: &dyn Transport) -> Arc<Mutex<Vec<TransportEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            TransportEventKind::Open,
            TransportEventKind::Message,
            TransportEventKind::Closed,
            TransportEventKind::Error,
        ] {
            let sink = events.clone();
            transport.bind(kind, listener(move |event| sink.lock().push(event.clone())));
        }
        events
    }

    #[test]
    fn test_factory_builds_http_transport() {
        let client = Arc::new(FakeClient::default());
        let factory = HttpTransportFactory::streaming(client.clone());
        assert!(factory.is_supported(&options()));

        let transport = factory.create_connection("xhr_streaming", 2, &options()).unwrap();
        assert_eq!(transport.name(), "xhr_streaming");
        assert_eq!(client.stream_count(), 0);

        transport.open().unwrap();
        let url = client.streams.lock()[0].url.clone();
        assert!(url.starts_with("http://localhost:8080/pusher/app/key/"), "{url}");
        assert!(url.contains("/xhr_streaming?protocol=7"), "{url}");
    }

    #[test]
    fn test_events_are_forwarded() {
        let client = Arc::new(FakeClient::default());
        let transport = HttpTransportFactory::streaming(client.clone())
            .create_connection("xhr_streaming", 2, &options())
            .unwrap();
        let events = recorded(transport.as_ref());

        transport.open().unwrap();
        let sink = client.last_sink();
        sink.push(200, "o\n");
        sink.push(200, "m\"{\\\"event\\\":\\\"x\\\"}\"\n");
        sink.push(200, "c[4200,\"restart\"]\n");

        let events = events.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], TransportEvent::Open);
        assert!(matches!(&events[1], TransportEvent::Message(m) if m.data == r#"{"event":"x"}"#));
        assert_eq!(
            events[2],
            TransportEvent::Closed(CloseEvent::new(Some(4200), "restart", true))
        );
    }

    #[test]
    fn test_activity_is_forwarded_while_open() {
        let client = Arc::new(FakeClient::default());
        let transport = HttpTransportFactory::streaming(client.clone())
            .create_connection("xhr_streaming", 2, &options())
            .unwrap();
        let activity = Arc::new(Mutex::new(0));
        let counter = activity.clone();
        transport.bind(
            TransportEventKind::Activity,
            listener(move |_| *counter.lock() += 1),
        );

        transport.open().unwrap();
        let sink = client.last_sink();
        sink.push(200, "o\n");
        assert_eq!(*activity.lock(), 0);

        sink.push(200, "h\nm\"{}\"\n");
        assert_eq!(*activity.lock(), 2);
    }

    #[test]
    fn test_send_and_ping_go_through_posts() {
        let client = Arc::new(FakeClient::default());
        let transport = SocketTransport::new(
            "xhr_polling",
            options().http_url(),
            Arc::new(PollingHooks),
            client.clone(),
        );
        assert!(!transport.send("early"));
        assert!(!transport.ping());

        transport.open().unwrap();
        client.last_sink().push(200, "o\n");

        assert!(transport.send(r#"{"event":"pusher:ping","data":{}}"#));
        assert!(transport.ping());
        assert_eq!(
            client.posted_bodies(),
            vec![
                r#"["{\"event\":\"pusher:ping\",\"data\":{}}"]"#.to_string(),
                "[]".to_string(),
            ]
        );
    }

    #[test]
    fn test_open_twice_fails() {
        let client = Arc::new(FakeClient::default());
        let transport = SocketTransport::new(
            "xhr_streaming",
            options().http_url(),
            Arc::new(StreamingHooks),
            client,
        );

        transport.open().unwrap();
        assert!(matches!(
            transport.open(),
            Err(NetworkError::InvalidState(_))
        ));
    }

    #[test]
    fn test_close_reports_once() {
        let client = Arc::new(FakeClient::default());
        let transport = SocketTransport::new(
            "xhr_streaming",
            options().http_url(),
            Arc::new(StreamingHooks),
            client.clone(),
        );
        let events = recorded(&transport);

        transport.open().unwrap();
        client.last_sink().push(200, "o\n");
        transport.close();
        transport.close();

        assert_eq!(transport.socket().map(|s| s.state()), Some(SocketState::Closed));
        let closes = events
            .lock()
            .iter()
            .filter(|e| e.kind() == TransportEventKind::Closed)
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_bad_url_fails_open() {
        let client = Arc::new(FakeClient::default());
        let transport =
            SocketTransport::new("xhr_streaming", "not a url", Arc::new(StreamingHooks), client);
        assert!(matches!(transport.open(), Err(NetworkError::Config(_))));
        assert!(transport.socket().is_none());
    }
}
