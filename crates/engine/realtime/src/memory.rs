//! In-process transport.
//!
//! [`MemoryTransport`] never touches the network: the owner drives it by
//! calling the `emit_*` methods, and everything sent through it is kept for
//! inspection. Useful for tests and for wiring a client to an in-process
//! server.

use crate::config::StrategyOptions;
use crate::error::{NetworkError, NetworkResult};
use crate::transport::{
    CloseEvent, Dispatcher, Listener, ListenerId, MessageEvent, Transport, TransportEvent,
    TransportEventKind, TransportFactory,
};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct MemoryState {
    open_calls: usize,
    close_calls: usize,
    closed: bool,
    sent: Vec<String>,
    pings: usize,
}

/// Transport driven by its owner.
#[derive(Debug)]
pub struct MemoryTransport {
    name: String,
    priority: i32,
    dispatcher: Dispatcher,
    state: Mutex<MemoryState>,
    open_error: Option<NetworkError>,
    native_ping: bool,
}

impl MemoryTransport {
    /// A transport that opens successfully.
    pub fn new(name: impl Into<String>, priority: i32) -> Arc<Self> {
        Arc::new(Self::build(name.into(), priority, None))
    }

    /// A transport whose `open` fails with `error`.
    pub fn failing(name: impl Into<String>, priority: i32, error: NetworkError) -> Arc<Self> {
        Arc::new(Self::build(name.into(), priority, Some(error)))
    }

    fn build(name: String, priority: i32, open_error: Option<NetworkError>) -> Self {
        Self {
            name,
            priority,
            dispatcher: Dispatcher::new(),
            state: Mutex::new(MemoryState::default()),
            open_error,
            native_ping: false,
        }
    }

    /// A transport with its own keepalive.
    pub fn with_native_ping(name: impl Into<String>, priority: i32) -> Arc<Self> {
        let mut transport = Self::build(name.into(), priority, None);
        transport.native_ping = true;
        Arc::new(transport)
    }

    /// Priority the factory created this transport for.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Simulate the transport finishing its open.
    pub fn emit_open(&self) {
        self.dispatcher.emit(&TransportEvent::Open);
    }

    /// Simulate a message from the remote side.
    pub fn emit_message(&self, data: impl Into<String>) {
        self.dispatcher
            .emit(&TransportEvent::Message(MessageEvent::new(data)));
    }

    /// Simulate the remote side closing. Ignored once closed.
    pub fn emit_closed(&self, code: Option<u16>, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.dispatcher.emit(&TransportEvent::Closed(CloseEvent::new(
            code,
            reason,
            code == Some(1000),
        )));
    }

    /// Simulate a transport failure.
    pub fn emit_error(&self, error: NetworkError) {
        self.dispatcher.emit(&TransportEvent::Error(error));
    }

    /// Simulate traffic without a message.
    pub fn emit_activity(&self) {
        self.dispatcher.emit(&TransportEvent::Activity);
    }

    /// Number of `open` calls so far.
    pub fn open_calls(&self) -> usize {
        self.state.lock().open_calls
    }

    /// Number of `close` calls so far.
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Payloads accepted by `send`, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Native pings sent.
    pub fn pings(&self) -> usize {
        self.state.lock().pings
    }

    /// Listeners currently bound.
    pub fn listener_count(&self) -> usize {
        self.dispatcher.listener_count()
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> NetworkResult<()> {
        self.state.lock().open_calls += 1;
        match &self.open_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Closes locally and reports a clean `Closed` event the first time.
    fn close(&self) {
        {
            let mut state = self.state.lock();
            state.close_calls += 1;
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.dispatcher
            .emit(&TransportEvent::Closed(CloseEvent::new(Some(1000), "", true)));
    }

    fn send(&self, payload: &str) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.sent.push(payload.to_string());
        true
    }

    fn supports_ping(&self) -> bool {
        self.native_ping
    }

    fn ping(&self) -> bool {
        if !self.native_ping {
            return false;
        }
        self.state.lock().pings += 1;
        true
    }

    fn bind(&self, kind: TransportEventKind, listener: Listener) -> ListenerId {
        self.dispatcher.bind(kind, listener)
    }

    fn unbind(&self, id: ListenerId) {
        self.dispatcher.unbind(id);
    }
}

/// Factory handing out [`MemoryTransport`]s and remembering them.
#[derive(Debug, Default)]
pub struct MemoryTransportFactory {
    unsupported: bool,
    open_error: Option<NetworkError>,
    created: Mutex<Vec<Arc<MemoryTransport>>>,
}

impl MemoryTransportFactory {
    /// A factory producing working transports.
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose capability check fails.
    pub fn unsupported() -> Self {
        Self {
            unsupported: true,
            ..Default::default()
        }
    }

    /// A factory whose transports fail to open.
    pub fn failing(error: NetworkError) -> Self {
        Self {
            open_error: Some(error),
            ..Default::default()
        }
    }

    /// Every transport created so far.
    pub fn created(&self) -> Vec<Arc<MemoryTransport>> {
        self.created.lock().clone()
    }

    /// The most recently created transport.
    pub fn last(&self) -> Option<Arc<MemoryTransport>> {
        self.created.lock().last().cloned()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn is_supported(&self, _options: &StrategyOptions) -> bool {
        !self.unsupported
    }

    fn create_connection(
        &self,
        name: &str,
        priority: i32,
        _options: &StrategyOptions,
    ) -> NetworkResult<Arc<dyn Transport>> {
        let transport = match &self.open_error {
            Some(error) => MemoryTransport::failing(name, priority, error.clone()),
            None => MemoryTransport::new(name, priority),
        };
        self.created.lock().push(transport.clone());
        Ok(transport as Arc<dyn Transport>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::listener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_close_emits_once() {
        let transport = MemoryTransport::new("memory", 1);
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        transport.bind(
            TransportEventKind::Closed,
            listener(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        transport.close();
        transport.close();
        transport.emit_closed(Some(4100), "late");

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.close_calls(), 2);
        assert!(!transport.send("x"));
    }

    #[test]
    fn test_factory_records_transports() {
        let factory = MemoryTransportFactory::new();
        let options = StrategyOptions::default();
        factory.create_connection("a", 1, &options).unwrap();
        factory.create_connection("b", 2, &options).unwrap();

        let created = factory.created();
        assert_eq!(created.len(), 2);
        assert_eq!(created[1].name(), "b");
        assert_eq!(created[1].priority(), 2);
    }
}
