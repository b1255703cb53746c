//! Stream-backed socket.
//!
//! [`StreamSocket`] emulates a bidirectional socket on top of HTTP: the
//! server pushes newline-terminated frames down a long-lived request
//! (streaming) or a sequence of short ones (polling), and every outgoing
//! payload is a separate POST. Frames start with a type character:
//!
//! | frame | meaning                                  |
//! |-------|------------------------------------------|
//! | `o`   | session open, optional `{"hostname"}`    |
//! | `a`   | JSON array of messages                   |
//! | `m`   | single message                           |
//! | `h`   | heartbeat                                |
//! | `c`   | close, `[code, reason]`                  |
//!
//! The socket owns at most one stream at a time. Each stream is tagged with
//! a generation number; data arriving for an older generation is dropped,
//! which is how `reconnect` detaches the previous stream.

use crate::error::{NetworkError, NetworkResult};
use crate::location::{unique_url, Location};
use crate::transport::{CloseEvent, MessageEvent};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};

/// Accumulated stream data above which the stream is restarted.
pub const MAX_BUFFER_LENGTH: usize = 256 * 1024;

const SESSION_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Socket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A running HTTP request feeding a socket.
pub trait StreamRequest: Send {
    /// Abort the request. Called at most once.
    fn close(&mut self);
}

/// HTTP capability used by stream sockets.
pub trait HttpClient: Send + Sync {
    /// Whether this client can run in the current environment.
    fn is_supported(&self) -> bool {
        true
    }

    /// Start a streaming POST to `url`, reporting data through `sink`.
    fn start_stream(&self, url: &str, sink: StreamSink) -> NetworkResult<Box<dyn StreamRequest>>;

    /// Fire-and-forget POST of `body` to `url`.
    fn post(&self, url: &str, body: &str) -> NetworkResult<()>;
}

/// Behaviour that differs between streaming and polling.
pub trait SocketHooks: Send + Sync {
    /// URL of the receiving request.
    fn receive_url(&self, location: &Location, session: &str) -> String;

    /// The server sent a heartbeat frame.
    fn on_heartbeat(&self, socket: &StreamSocket) {
        socket.send_raw("[]");
    }

    /// The client wants to prove liveness.
    fn send_heartbeat(&self, socket: &StreamSocket) {
        socket.send_raw("[]");
    }

    /// The receiving request ended with `status`.
    fn on_finished(&self, socket: &StreamSocket, status: u16);
}

/// One long-lived receiving request.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamingHooks;

impl SocketHooks for StreamingHooks {
    fn receive_url(&self, location: &Location, session: &str) -> String {
        format!(
            "{}/{}/xhr_streaming{}",
            location.base(),
            session,
            location.query_string()
        )
    }

    fn on_finished(&self, socket: &StreamSocket, status: u16) {
        socket.on_close(
            Some(1006),
            &format!("Connection interrupted ({status})"),
            false,
        );
    }
}

/// A new receiving request after each response.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollingHooks;

impl SocketHooks for PollingHooks {
    fn receive_url(&self, location: &Location, session: &str) -> String {
        format!(
            "{}/{}/xhr{}",
            location.base(),
            session,
            location.query_string()
        )
    }

    fn on_finished(&self, socket: &StreamSocket, status: u16) {
        if status == 200 {
            socket.restart_stream();
        } else {
            socket.on_close(
                Some(1006),
                &format!("Connection interrupted ({status})"),
                false,
            );
        }
    }
}

/// Where a stream request delivers its data.
#[derive(Clone)]
pub struct StreamSink {
    socket: Weak<SocketInner>,
    generation: u64,
}

impl StreamSink {
    /// Append response data received with HTTP `status`.
    pub fn push(&self, status: u16, data: &str) {
        if let Some(inner) = self.socket.upgrade() {
            StreamSocket { inner }.on_data(self.generation, status, data);
        }
    }

    /// The request completed with HTTP `status`.
    pub fn finish(&self, status: u16) {
        if let Some(inner) = self.socket.upgrade() {
            StreamSocket { inner }.on_finished(self.generation, status);
        }
    }

    /// Whether the socket still listens to this stream.
    pub fn is_current(&self) -> bool {
        self.socket
            .upgrade()
            .is_some_and(|inner| inner.core.lock().generation == self.generation)
    }
}

impl fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug, Default)]
struct ChunkBuffer {
    data: String,
    position: usize,
}

impl ChunkBuffer {
    fn push(&mut self, chunk: &str) {
        self.data.push_str(chunk);
    }

    fn next_frame(&mut self) -> Option<String> {
        let unread = &self.data[self.position..];
        let end = unread.find('\n')?;
        let frame = unread[..end].to_string();
        self.position += end + 1;
        Some(frame)
    }

    fn is_too_long(&self) -> bool {
        self.position == self.data.len() && self.data.len() > MAX_BUFFER_LENGTH
    }

    fn clear(&mut self) {
        self.data.clear();
        self.position = 0;
    }
}

type Handler = Arc<dyn Fn() + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&NetworkError) + Send + Sync>;
type CloseHandler = Arc<dyn Fn(&CloseEvent) + Send + Sync>;
type MessageHandler = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    onopen: Option<Handler>,
    onerror: Option<ErrorHandler>,
    onclose: Option<CloseHandler>,
    onmessage: Option<MessageHandler>,
    onactivity: Option<Handler>,
}

struct SocketCore {
    state: SocketState,
    location: Location,
    stream: Option<Box<dyn StreamRequest>>,
    generation: u64,
    buffer: ChunkBuffer,
}

impl SocketCore {
    /// Detach the current stream. The caller closes what is returned.
    fn detach_stream(&mut self) -> Option<Box<dyn StreamRequest>> {
        self.generation += 1;
        self.buffer.clear();
        self.stream.take()
    }
}

struct SocketInner {
    hooks: Arc<dyn SocketHooks>,
    client: Arc<dyn HttpClient>,
    session: String,
    core: Mutex<SocketCore>,
    handlers: Mutex<Handlers>,
}

/// Socket emulated over HTTP requests.
///
/// Cloning yields another handle to the same socket.
#[derive(Clone)]
pub struct StreamSocket {
    inner: Arc<SocketInner>,
}

impl StreamSocket {
    /// Create a socket in `Connecting` state. Nothing is sent until [`open`].
    ///
    /// [`open`]: StreamSocket::open
    pub fn new(
        hooks: Arc<dyn SocketHooks>,
        client: Arc<dyn HttpClient>,
        url: &str,
    ) -> NetworkResult<Self> {
        let location = Location::parse(url)?;
        Ok(Self {
            inner: Arc::new(SocketInner {
                hooks,
                client,
                session: new_session(),
                core: Mutex::new(SocketCore {
                    state: SocketState::Connecting,
                    location,
                    stream: None,
                    generation: 0,
                    buffer: ChunkBuffer::default(),
                }),
                handlers: Mutex::new(Handlers::default()),
            }),
        })
    }

    /// Session path segment, `<number>/<8 chars>`.
    pub fn session(&self) -> &str {
        &self.inner.session
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        self.inner.core.lock().state
    }

    /// Endpoint the socket talks to, after any host rebinding.
    pub fn location(&self) -> Location {
        self.inner.core.lock().location.clone()
    }

    /// Replace the handler called when the session opens.
    pub fn set_onopen<F: Fn() + Send + Sync + 'static>(&self, handler: F) {
        self.inner.handlers.lock().onopen = Some(Arc::new(handler));
    }

    /// Replace the handler called on frame or stream errors.
    pub fn set_onerror<F: Fn(&NetworkError) + Send + Sync + 'static>(&self, handler: F) {
        self.inner.handlers.lock().onerror = Some(Arc::new(handler));
    }

    /// Replace the handler called once the socket is closed.
    pub fn set_onclose<F: Fn(&CloseEvent) + Send + Sync + 'static>(&self, handler: F) {
        self.inner.handlers.lock().onclose = Some(Arc::new(handler));
    }

    /// Replace the handler called for every delivered message.
    pub fn set_onmessage<F: Fn(&MessageEvent) + Send + Sync + 'static>(&self, handler: F) {
        self.inner.handlers.lock().onmessage = Some(Arc::new(handler));
    }

    /// Replace the handler called for any traffic while open.
    pub fn set_onactivity<F: Fn() + Send + Sync + 'static>(&self, handler: F) {
        self.inner.handlers.lock().onactivity = Some(Arc::new(handler));
    }

    /// Start the receiving stream.
    pub fn open(&self) {
        if self.state() == SocketState::Connecting {
            self.open_stream();
        }
    }

    /// Send `payload` wrapped in a one-element JSON array.
    pub fn send(&self, payload: &Value) -> bool {
        match serde_json::to_string(&[payload]) {
            Ok(encoded) => self.send_raw(&encoded),
            Err(e) => {
                tracing::warn!("Could not encode payload: {}", e);
                false
            }
        }
    }

    /// Send an already encoded payload. False unless the socket is open.
    pub fn send_raw(&self, payload: &str) -> bool {
        let url = {
            let core = self.inner.core.lock();
            if core.state != SocketState::Open {
                return false;
            }
            format!("{}/{}/xhr_send", core.location.base(), self.inner.session)
        };
        match self.inner.client.post(&unique_url(&url), payload) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Send on session {} failed: {}", self.inner.session, e);
                false
            }
        }
    }

    /// Send a heartbeat through the hooks.
    pub fn ping(&self) {
        self.inner.hooks.send_heartbeat(self);
    }

    /// Close the socket. `onclose` fires once, however often this is called.
    pub fn close(&self, code: Option<u16>, reason: &str) {
        {
            let mut core = self.inner.core.lock();
            if matches!(core.state, SocketState::Closing | SocketState::Closed) {
                return;
            }
            core.state = SocketState::Closing;
        }
        self.on_close(code, reason, true);
    }

    /// Drop the current stream and start over in `Connecting` state.
    ///
    /// A closing or closed socket only loses its stream; it stays closed.
    pub fn reconnect(&self) {
        let (stream, closed) = {
            let mut core = self.inner.core.lock();
            let closed = matches!(core.state, SocketState::Closing | SocketState::Closed);
            if !closed {
                core.state = SocketState::Connecting;
            }
            (core.detach_stream(), closed)
        };
        if let Some(mut stream) = stream {
            stream.close();
        }
        if closed {
            return;
        }
        tracing::debug!("Reconnecting session {}", self.inner.session);
        self.open_stream();
    }

    /// Replace the receiving stream without touching the lifecycle state.
    pub fn restart_stream(&self) {
        let stream = {
            let mut core = self.inner.core.lock();
            if matches!(core.state, SocketState::Closing | SocketState::Closed) {
                return;
            }
            core.detach_stream()
        };
        if let Some(mut stream) = stream {
            stream.close();
        }
        self.open_stream();
    }

    /// Move to `Closed` and report it. Later calls are ignored.
    pub fn on_close(&self, code: Option<u16>, reason: &str, was_clean: bool) {
        let stream = {
            let mut core = self.inner.core.lock();
            if core.state == SocketState::Closed {
                return;
            }
            core.state = SocketState::Closed;
            core.detach_stream()
        };
        if let Some(mut stream) = stream {
            stream.close();
        }
        tracing::debug!(
            "Session {} closed ({:?}: {})",
            self.inner.session,
            code,
            reason
        );

        let handler = self.inner.handlers.lock().onclose.clone();
        if let Some(handler) = handler {
            handler(&CloseEvent::new(code, reason, was_clean));
        }
    }

    fn on_data(&self, generation: u64, status: u16, data: &str) {
        let (frames, too_long) = {
            let mut core = self.inner.core.lock();
            if core.generation != generation {
                return;
            }
            core.buffer.push(data);
            let mut frames = Vec::new();
            while let Some(frame) = core.buffer.next_frame() {
                frames.push(frame);
            }
            (frames, core.buffer.is_too_long())
        };

        for frame in frames {
            if !self.is_current(generation) {
                return;
            }
            self.on_chunk(status, &frame);
        }

        if too_long && self.is_current(generation) {
            tracing::debug!("Stream buffer too long, restarting");
            self.restart_stream();
        }
    }

    fn on_finished(&self, generation: u64, status: u16) {
        if self.is_current(generation) {
            self.inner.hooks.on_finished(self, status);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.core.lock().generation == generation
    }

    fn on_chunk(&self, status: u16, frame: &str) {
        if status != 200 {
            return;
        }
        if self.state() == SocketState::Open {
            self.on_activity();
        }

        let mut chars = frame.chars();
        let Some(kind) = chars.next() else {
            return;
        };
        let body = chars.as_str();

        let result = match kind {
            'o' => parse_frame(body, "{}").map(|options| self.on_open(&options)),
            'a' => parse_frame(body, "[]").and_then(|payload| match payload {
                Value::Array(events) => {
                    for event in events {
                        self.on_event(event);
                    }
                    Ok(())
                }
                other => Err(NetworkError::Deserialization(format!(
                    "expected array frame, got {other}"
                ))),
            }),
            'm' => parse_frame(body, "null").map(|event| self.on_event(event)),
            'h' => {
                self.inner.hooks.on_heartbeat(self);
                Ok(())
            }
            'c' => parse_frame(body, "[]").map(|payload| {
                let code = payload
                    .get(0)
                    .and_then(Value::as_u64)
                    .and_then(|c| u16::try_from(c).ok());
                let reason = payload.get(1).and_then(Value::as_str).unwrap_or_default();
                self.on_close(code, reason, true);
            }),
            other => {
                tracing::debug!("Ignoring unknown frame type {:?}", other);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.on_error(&e);
        }
    }

    fn on_open(&self, options: &Value) {
        let opened = {
            let mut core = self.inner.core.lock();
            if core.state == SocketState::Connecting {
                if let Some(hostname) = options.get("hostname").and_then(Value::as_str) {
                    if let Err(e) = core.location.replace_host(hostname) {
                        tracing::warn!("Keeping original host: {}", e);
                    }
                }
                core.state = SocketState::Open;
                true
            } else {
                false
            }
        };

        if opened {
            tracing::debug!("Session {} open", self.inner.session);
            let handler = self.inner.handlers.lock().onopen.clone();
            if let Some(handler) = handler {
                handler();
            }
        } else {
            self.on_close(Some(1006), "Server lost session", true);
        }
    }

    fn on_event(&self, event: Value) {
        if self.state() != SocketState::Open {
            return;
        }
        let data = match event {
            Value::String(data) => data,
            other => other.to_string(),
        };
        let handler = self.inner.handlers.lock().onmessage.clone();
        if let Some(handler) = handler {
            handler(&MessageEvent::new(data));
        }
    }

    fn on_activity(&self) {
        let handler = self.inner.handlers.lock().onactivity.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn on_error(&self, error: &NetworkError) {
        let handler = self.inner.handlers.lock().onerror.clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    fn open_stream(&self) {
        let (location, generation) = {
            let core = self.inner.core.lock();
            if core.stream.is_some() {
                return;
            }
            (core.location.clone(), core.generation)
        };
        let url = unique_url(&self.inner.hooks.receive_url(&location, &self.inner.session));
        let sink = StreamSink {
            socket: Arc::downgrade(&self.inner),
            generation,
        };

        match self.inner.client.start_stream(&url, sink) {
            Ok(mut request) => {
                let mut core = self.inner.core.lock();
                if core.generation == generation
                    && core.stream.is_none()
                    && core.state != SocketState::Closed
                {
                    core.stream = Some(request);
                } else {
                    drop(core);
                    request.close();
                }
            }
            Err(e) => {
                tracing::warn!("Could not start stream {}: {}", url, e);
                self.on_error(&e);
                self.on_close(Some(1006), "Could not start streaming", false);
            }
        }
    }
}

impl fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("StreamSocket")
            .field("session", &self.inner.session)
            .field("state", &core.state)
            .field("location", &core.location)
            .finish()
    }
}

fn parse_frame(body: &str, empty: &str) -> NetworkResult<Value> {
    let text = if body.is_empty() { empty } else { body };
    serde_json::from_str(text).map_err(|e| NetworkError::Deserialization(e.to_string()))
}

fn new_session() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| SESSION_ALPHABET[rng.gen_range(0..SESSION_ALPHABET.len())] as char)
        .collect();
    format!("{}/{}", rng.gen_range(0..1000), suffix)
}
