//! Priority-aware connection attempts.
//!
//! A [`TransportStrategy`] pairs a [`TransportFactory`] with a name and a
//! priority. Combinators race several strategies: each `connect` call
//! returns an [`AttemptHandle`] that can abort the attempt or raise the
//! priority bar so losers drop out with [`NetworkError::Superseded`].
//!
//! Every attempt calls back at most once. After [`AttemptHandle::abort`]
//! it never calls back.

use crate::config::StrategyOptions;
use crate::error::{NetworkError, NetworkResult};
use crate::handshake::{Handshake, HandshakeResult};
use crate::transport::{
    listener, ListenerId, Transport, TransportEvent, TransportEventKind, TransportFactory,
};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Callback receiving the outcome of a connection attempt.
pub type StrategyCallback = Box<dyn FnOnce(NetworkResult<HandshakeResult>) + Send>;

/// Something that can attempt a connection.
pub trait Strategy: Send + Sync {
    /// Pure capability check.
    fn is_supported(&self) -> bool;

    /// Start an attempt. The callback fires at most once.
    fn connect(&self, min_priority: i32, callback: StrategyCallback) -> AttemptHandle;
}

/// Strategy connecting through one kind of transport.
pub struct TransportStrategy {
    name: String,
    priority: i32,
    transport: Arc<dyn TransportFactory>,
    options: StrategyOptions,
}

impl TransportStrategy {
    /// Strategy opening `transport` connections under `name` at `priority`.
    pub fn new(
        name: impl Into<String>,
        priority: i32,
        transport: Arc<dyn TransportFactory>,
        options: StrategyOptions,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            transport,
            options,
        }
    }

    /// Name passed to the factory and matched against disabled transports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority compared against `min_priority` bars.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Options handed to the factory.
    pub fn options(&self) -> &StrategyOptions {
        &self.options
    }

    /// [`Strategy::connect`] taking any closure.
    pub fn connect_with<F>(&self, min_priority: i32, callback: F) -> AttemptHandle
    where
        F: FnOnce(NetworkResult<HandshakeResult>) + Send + 'static,
    {
        self.connect(min_priority, Box::new(callback))
    }

    /// Run an attempt as a future. Dropping the future aborts the attempt.
    pub fn connect_async(&self, min_priority: i32) -> PendingAttempt {
        let (tx, rx) = oneshot::channel();
        let handle = self.connect_with(min_priority, move |result| {
            let _ = tx.send(result);
        });
        PendingAttempt {
            handle,
            receiver: rx,
        }
    }
}

impl fmt::Debug for TransportStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportStrategy")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

impl Strategy for TransportStrategy {
    fn is_supported(&self) -> bool {
        !self.options.is_disabled(&self.name) && self.transport.is_supported(&self.options)
    }

    fn connect(&self, min_priority: i32, callback: StrategyCallback) -> AttemptHandle {
        if !self.is_supported() {
            tracing::debug!("Skipping unsupported transport {}", self.name);
            callback(Err(NetworkError::Unsupported(self.name.clone())));
            return AttemptHandle::finished();
        }
        if self.priority < min_priority {
            tracing::debug!(
                "Skipping {} (priority {} < {})",
                self.name,
                self.priority,
                min_priority
            );
            callback(Err(NetworkError::Superseded));
            return AttemptHandle::finished();
        }

        let created = self
            .transport
            .create_connection(&self.name, self.priority, &self.options);
        let transport = match created {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("Could not create transport {}: {}", self.name, e);
                callback(Err(e));
                return AttemptHandle::finished();
            }
        };

        tracing::debug!("Connecting over {} (priority {})", self.name, self.priority);
        let attempt = Arc::new(Attempt {
            name: self.name.clone(),
            priority: self.priority,
            transport,
            state: Mutex::new(AttemptState {
                phase: Phase::Opening,
                listeners: Vec::new(),
                callback: Some(callback),
            }),
        });
        Attempt::start(&attempt);

        AttemptHandle {
            attempt: Some(attempt),
        }
    }
}

enum Phase {
    Opening,
    Handshaking(Handshake),
    Finished,
}

struct AttemptState {
    phase: Phase,
    listeners: Vec<ListenerId>,
    callback: Option<StrategyCallback>,
}

struct Attempt {
    name: String,
    priority: i32,
    transport: Arc<dyn Transport>,
    state: Mutex<AttemptState>,
}

impl Attempt {
    fn start(this: &Arc<Self>) {
        let bind = |kind: TransportEventKind| {
            let attempt = this.clone();
            this.transport.bind(
                kind,
                listener(move |event| Attempt::on_transport_event(&attempt, event)),
            )
        };
        let ids = vec![
            bind(TransportEventKind::Open),
            bind(TransportEventKind::Error),
            bind(TransportEventKind::Closed),
        ];
        this.state.lock().listeners = ids;

        if let Err(e) = this.transport.open() {
            this.fail(e, true);
        }
    }

    fn on_transport_event(this: &Arc<Self>, event: &TransportEvent) {
        match event {
            TransportEvent::Open => Attempt::on_open(this),
            TransportEvent::Error(e) => this.fail(e.clone(), true),
            TransportEvent::Closed(_) => {
                this.fail(NetworkError::TransportClosed(this.name.clone()), false)
            }
            _ => {}
        }
    }

    fn unbind(&self, listeners: Vec<ListenerId>) {
        for id in listeners {
            self.transport.unbind(id);
        }
    }

    fn on_open(this: &Arc<Self>) {
        let listeners = {
            let mut state = this.state.lock();
            if !matches!(state.phase, Phase::Opening) {
                return;
            }
            std::mem::take(&mut state.listeners)
        };
        // The handshake owns close classification from here on.
        this.unbind(listeners);

        let attempt = this.clone();
        let handshake = Handshake::new(this.transport.clone(), move |result| {
            attempt.on_handshake(result)
        });

        let mut state = this.state.lock();
        if matches!(state.phase, Phase::Opening) {
            state.phase = Phase::Handshaking(handshake);
        } else {
            drop(state);
            handshake.close();
        }
    }

    fn on_handshake(&self, result: HandshakeResult) {
        let callback = {
            let mut state = self.state.lock();
            state.phase = Phase::Finished;
            state.callback.take()
        };
        tracing::debug!("Handshake over {} finished: {}", self.name, result.action());
        if let Some(callback) = callback {
            callback(Ok(result));
        }
    }

    fn fail(&self, error: NetworkError, close_transport: bool) {
        let (listeners, callback) = {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Opening) {
                return;
            }
            state.phase = Phase::Finished;
            (std::mem::take(&mut state.listeners), state.callback.take())
        };
        self.unbind(listeners);
        tracing::debug!("Transport {} failed: {}", self.name, error);
        if close_transport {
            self.transport.close();
        }
        if let Some(callback) = callback {
            callback(Err(error));
        }
    }

    /// Stop the attempt. Returns the pending callback, if any.
    fn cancel(&self) -> Option<StrategyCallback> {
        let (phase, listeners, callback) = {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Finished) {
                return None;
            }
            (
                std::mem::replace(&mut state.phase, Phase::Finished),
                std::mem::take(&mut state.listeners),
                state.callback.take(),
            )
        };
        self.unbind(listeners);
        match phase {
            Phase::Handshaking(handshake) => handshake.close(),
            _ => self.transport.close(),
        }
        callback
    }

    fn is_finished(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Finished)
    }
}

/// Control over one in-flight attempt.
///
/// Cloning yields another handle to the same attempt. All operations are
/// idempotent and safe to call from inside any attempt's callback.
#[derive(Clone, Default)]
pub struct AttemptHandle {
    attempt: Option<Arc<Attempt>>,
}

impl AttemptHandle {
    /// Handle for an attempt that resolved before `connect` returned.
    pub fn finished() -> Self {
        Self::default()
    }

    /// Cancel the attempt; its callback will not fire.
    pub fn abort(&self) {
        if let Some(attempt) = &self.attempt {
            if let Some(callback) = attempt.cancel() {
                tracing::debug!("Aborted attempt over {}", attempt.name);
                drop(callback);
            }
        }
    }

    /// Raise the acceptance bar; an attempt below it reports `Superseded`.
    pub fn force_min_priority(&self, min_priority: i32) {
        let Some(attempt) = &self.attempt else {
            return;
        };
        if attempt.priority >= min_priority {
            return;
        }
        if let Some(callback) = attempt.cancel() {
            tracing::debug!(
                "Attempt over {} superseded (priority {} < {})",
                attempt.name,
                attempt.priority,
                min_priority
            );
            callback(Err(NetworkError::Superseded));
        }
    }

    /// Whether the attempt has resolved or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.attempt
            .as_ref()
            .map_or(true, |attempt| attempt.is_finished())
    }
}

impl fmt::Debug for AttemptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptHandle")
            .field("transport", &self.attempt.as_ref().map(|a| a.name.as_str()))
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Future returned by [`TransportStrategy::connect_async`].
#[derive(Debug)]
pub struct PendingAttempt {
    handle: AttemptHandle,
    receiver: oneshot::Receiver<NetworkResult<HandshakeResult>>,
}

impl PendingAttempt {
    /// Handle for racing this attempt against others.
    pub fn handle(&self) -> &AttemptHandle {
        &self.handle
    }
}

impl Future for PendingAttempt {
    type Output = NetworkResult<HandshakeResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(NetworkError::ConnectionFailed(
                "attempt aborted".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingAttempt {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
