//! Transport capability traits.
//!
//! This module defines the boundary to concrete wire transports
//! (WebSocket, HTTP streaming, etc.). Everything above it only sees an
//! event-emitting [`Transport`] and the [`TransportFactory`] that builds
//! one per connection attempt.

use crate::config::StrategyOptions;
use crate::error::{NetworkError, NetworkResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Raw protocol payload received from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub data: String,
}

impl MessageEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

/// Close notification delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close code, absent when the transport went away without one.
    pub code: Option<u16>,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseEvent {
    pub fn new(code: Option<u16>, reason: impl Into<String>, was_clean: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean,
        }
    }
}

/// Event names a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    Open,
    Message,
    Closed,
    Error,
    Activity,
}

/// Events emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The transport finished opening.
    Open,
    /// A protocol message arrived.
    Message(MessageEvent),
    /// The transport closed.
    Closed(CloseEvent),
    /// The transport failed.
    Error(NetworkError),
    /// Any traffic was seen on the wire.
    Activity,
}

impl TransportEvent {
    pub fn kind(&self) -> TransportEventKind {
        match self {
            Self::Open => TransportEventKind::Open,
            Self::Message(_) => TransportEventKind::Message,
            Self::Closed(_) => TransportEventKind::Closed,
            Self::Error(_) => TransportEventKind::Error,
            Self::Activity => TransportEventKind::Activity,
        }
    }
}

/// Token returned by [`Transport::bind`], used to unbind the listener later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Event listener attached to a transport.
pub type Listener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&TransportEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// An open-able, event-emitting message channel.
///
/// Implementations must deliver `Open` at most once per `open` call and
/// `Closed` at most once per lifetime. Listeners may be bound and unbound
/// from inside another listener.
pub trait Transport: Send + Sync {
    /// Transport name, used for logging.
    fn name(&self) -> &str;

    /// Start opening. Completion is reported through `Open`, `Error` or `Closed`.
    fn open(&self) -> NetworkResult<()>;

    /// Close the transport.
    fn close(&self);

    /// Send a raw protocol payload. Returns false if nothing was sent.
    fn send(&self, payload: &str) -> bool;

    /// Whether the transport has its own keepalive.
    fn supports_ping(&self) -> bool {
        false
    }

    /// Send a transport-level keepalive ping.
    fn ping(&self) -> bool {
        false
    }

    /// Subscribe to one kind of event.
    fn bind(&self, kind: TransportEventKind, listener: Listener) -> ListenerId;

    /// Remove a listener. Unknown ids are ignored.
    fn unbind(&self, id: ListenerId);
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name())
            .finish()
    }
}

/// Builds transports for a strategy.
pub trait TransportFactory: Send + Sync {
    /// Pure capability check for the current environment.
    fn is_supported(&self, options: &StrategyOptions) -> bool;

    /// Create a transport without opening it.
    fn create_connection(
        &self,
        name: &str,
        priority: i32,
        options: &StrategyOptions,
    ) -> NetworkResult<Arc<dyn Transport>>;
}

struct Binding {
    id: ListenerId,
    kind: TransportEventKind,
    listener: Listener,
}

/// Listener registry shared by transport implementations.
///
/// `emit` works on a snapshot, so listeners can bind or unbind during
/// dispatch. A listener unbound mid-dispatch is not called afterwards.
#[derive(Default)]
pub struct Dispatcher {
    bindings: Mutex<Vec<Binding>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, kind: TransportEventKind, listener: Listener) -> ListenerId {
        let id = ListenerId::next();
        self.bindings.lock().push(Binding { id, kind, listener });
        id
    }

    /// Returns true if the listener was bound.
    pub fn unbind(&self, id: ListenerId) -> bool {
        let mut bindings = self.bindings.lock();
        let before = bindings.len();
        bindings.retain(|b| b.id != id);
        bindings.len() != before
    }

    pub fn is_bound(&self, id: ListenerId) -> bool {
        self.bindings.lock().iter().any(|b| b.id == id)
    }

    pub fn listener_count(&self) -> usize {
        self.bindings.lock().len()
    }

    /// Deliver an event. Returns how many listeners were called.
    pub fn emit(&self, event: &TransportEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(ListenerId, Listener)> = self
            .bindings
            .lock()
            .iter()
            .filter(|b| b.kind == kind)
            .map(|b| (b.id, b.listener.clone()))
            .collect();

        let mut called = 0;
        for (id, listener) in snapshot {
            if !self.is_bound(id) {
                continue;
            }
            listener(event);
            called += 1;
        }
        called
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
