//! Connection Manager
//!
//! Owns the websocket lifecycle, the outbound send queue, authentication
//! gating, and the read path that decodes frames and routes them to the
//! session registry.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Open -> Closed
//! ```
//!
//! Sending is legal in every state: [`Client::send`] always enqueues, and the
//! queue is flushed in FIFO order once the connection is open. The `logged`
//! flag is orthogonal to the connection state and flips back to false on
//! close or transport error.
//!
//! [`Client::connect`] runs the read/dispatch loop and completes only when
//! the connection ends, so deployments that need to do other work spawn it on
//! a dedicated task. [`Client::send`], event registration, and
//! [`Client::terminate`] are non-blocking and safe from any task; the queue
//! and state flags sit behind explicit locks rather than relying on the
//! transport's delivery context.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthError};
use crate::chart::ChartSession;
use crate::events::{EventHub, ListenerId};
use crate::protocol::{self, HEARTBEAT_PREFIX, ServerPacket};
use crate::quote::{QuoteSession, QuoteSessionOptions};
use crate::session::{Session, SessionRegistry};

// =============================================================================
// Constants
// =============================================================================

/// The fixed service endpoint.
pub const DATA_ENDPOINT: &str = "wss://data.tradingview.com/socket.io/websocket";

/// Token used when no credentials or token were configured.
pub const UNAUTHORIZED_TOKEN: &str = "unauthorized_user_token";

/// Origin header required by the websocket endpoint.
const BROWSER_ORIGIN: &str = "https://www.tradingview.com";

/// Wire method the server uses to signal a protocol-level error.
const PROTOCOL_ERROR_METHOD: &str = "protocol_error";

/// Client-level event names.
pub mod event {
    /// Connection opened.
    pub const CONNECTED: &str = "connected";
    /// Ping probe received (payload: the numeric token).
    pub const PING: &str = "ping";
    /// Server signaled a protocol-level error (payload: error details).
    pub const CRITICAL_ERROR: &str = "critical_error";
    /// Transport-level failure (payload: error text).
    pub const ERROR: &str = "error";
    /// Connection closed.
    pub const CLOSED: &str = "closed";
}

// =============================================================================
// Error Type
// =============================================================================

/// Errors surfaced synchronously by the client.
///
/// Frame-level and protocol-level failures are never raised through the
/// dispatch call stack; they arrive on the asynchronous read path and are
/// delivered as [`event`] callbacks instead.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Invalid construction arguments.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Credential exchange failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// WebSocket handshake or transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport write failure while flushing the queue.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not yet connected.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Socket open; queued frames are being delivered.
    Open,
    /// Connection ended (close, error, or termination).
    Closed,
}

// =============================================================================
// Credentials
// =============================================================================

/// Username/password pair for the credential exchange.
///
/// The `Debug` implementation redacts the password for safe logging.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Create credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] if either part is empty.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let username = username.into();
        let password = password.into();
        if username.is_empty() || password.is_empty() {
            return Err(ClientError::Configuration(
                "username and password cannot be empty".to_string(),
            ));
        }
        Ok(Self { username, password })
    }

    /// The username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Client`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    server_url: Option<String>,
    auth_token: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl ClientBuilder {
    /// Override the service endpoint (defaults to [`DATA_ENDPOINT`]).
    #[must_use]
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    /// Use a previously obtained auth token. The auth frame is queued
    /// immediately at build time, ahead of anything queued afterwards.
    #[must_use]
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the username for the credential exchange.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password for the credential exchange.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set both credentials at once.
    #[must_use]
    pub fn credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username(username).password(password)
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] when only one of
    /// username/password was provided (both or neither must be given), or
    /// when either is empty.
    pub fn build(self) -> Result<Client, ClientError> {
        let credentials = match (self.username, self.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)?),
            (None, None) => None,
            _ => {
                return Err(ClientError::Configuration(
                    "username and password must be provided together".to_string(),
                ));
            }
        };

        let client = Client {
            inner: Arc::new(ClientInner {
                server_url: self
                    .server_url
                    .unwrap_or_else(|| DATA_ENDPOINT.to_string()),
                credentials,
                state: Mutex::new(ConnectionState::Disconnected),
                logged: AtomicBool::new(false),
                auth_token: Mutex::new(None),
                queue: Mutex::new(VecDeque::new()),
                queue_notify: Notify::new(),
                cancel: CancellationToken::new(),
                events: EventHub::new(),
                registry: SessionRegistry::new(),
            }),
        };

        if let Some(token) = self.auth_token {
            client.set_auth_token(token);
        }
        Ok(client)
    }
}

// =============================================================================
// Client
// =============================================================================

struct ClientInner {
    server_url: String,
    credentials: Option<Credentials>,
    state: Mutex<ConnectionState>,
    logged: AtomicBool,
    auth_token: Mutex<Option<String>>,
    queue: Mutex<VecDeque<String>>,
    queue_notify: Notify,
    cancel: CancellationToken,
    events: EventHub,
    registry: SessionRegistry,
}

impl ClientInner {
    fn enqueue(&self, frame: String, front: bool) {
        {
            let mut queue = self.queue.lock();
            if front {
                queue.push_front(frame);
            } else {
                queue.push_back(frame);
            }
        }
        self.queue_notify.notify_one();
    }
}

/// The connection manager: one client instance owns one websocket
/// connection, its outbound queue, and its session registry.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client with default configuration and no authentication.
    #[must_use]
    pub fn new() -> Self {
        // The builder only fails on credential validation, and none are set.
        ClientBuilder::default()
            .build()
            .unwrap_or_else(|_| unreachable!("builder without credentials cannot fail"))
    }

    /// Start building a client.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// A non-owning handle sessions use to reach back to this client.
    #[must_use]
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Whether the socket is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether the server has acknowledged this session since the auth frame
    /// was queued.
    #[must_use]
    pub fn is_logged(&self) -> bool {
        self.inner.logged.load(Ordering::SeqCst)
    }

    /// Snapshot of the outbound queue, oldest first.
    #[must_use]
    pub fn queued_frames(&self) -> Vec<String> {
        self.inner.queue.lock().iter().cloned().collect()
    }

    /// The client-level event hub.
    #[must_use]
    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    /// Register a callback for [`event::CONNECTED`].
    pub fn on_connected(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.inner.events.on(event::CONNECTED, callback)
    }

    /// Register a callback for [`event::PING`].
    pub fn on_ping(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.inner.events.on(event::PING, callback)
    }

    /// Register a callback for [`event::CRITICAL_ERROR`].
    pub fn on_critical_error(
        &self,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.events.on(event::CRITICAL_ERROR, callback)
    }

    /// Register a callback for [`event::ERROR`].
    pub fn on_error(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.inner.events.on(event::ERROR, callback)
    }

    /// Register a callback for [`event::CLOSED`].
    pub fn on_closed(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.inner.events.on(event::CLOSED, callback)
    }

    /// Create a chart session bound to this client. Call
    /// [`ChartSession::set_up`] to register it and open the wire session.
    #[must_use]
    pub fn chart_session(&self) -> Arc<ChartSession> {
        ChartSession::new(self.handle())
    }

    /// Create a quote session bound to this client. Call
    /// [`QuoteSession::set_up`] to register it and open the wire session.
    #[must_use]
    pub fn quote_session(&self, options: QuoteSessionOptions) -> Arc<QuoteSession> {
        QuoteSession::new(self.handle(), options)
    }

    // =========================================================================
    // Outbound path
    // =========================================================================

    /// Enqueue a protocol message. Always succeeds regardless of connection
    /// state; delivery happens in FIFO order once the connection is open.
    pub fn send(&self, method: &str, params: &[Value]) {
        self.inner
            .enqueue(protocol::format_message(method, params), false);
    }

    /// Enqueue a raw payload (heartbeat echoes).
    pub fn send_raw(&self, payload: &str) {
        self.inner.enqueue(protocol::format_raw(payload), false);
    }

    /// Store `token` and immediately enqueue the auth frame.
    ///
    /// This does not mark the client as logged; that follows from the
    /// server's acknowledgement on the read path.
    pub fn set_auth_token(&self, token: impl Into<String>) {
        let token = token.into();
        *self.inner.auth_token.lock() = Some(token.clone());
        self.send("set_auth_token", &[Value::String(token)]);
    }

    /// Current auth token, if any.
    #[must_use]
    pub fn auth_token(&self) -> Option<String> {
        self.inner.auth_token.lock().clone()
    }

    /// Exchange credentials for a token and store it as the current auth
    /// token (also queues the auth frame).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Auth`] with the collaborator's message when the
    /// exchange fails.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, ClientError> {
        let token = auth::fetch_auth_token(username, password).await?;
        self.set_auth_token(token.clone());
        Ok(token)
    }

    /// Request the connection to close. The callback is invoked exactly once
    /// per call, whether or not the socket was still open.
    pub fn terminate(&self, callback: impl FnOnce()) {
        tracing::debug!("termination requested");
        self.inner.cancel.cancel();
        callback();
    }

    // =========================================================================
    // Connection loop
    // =========================================================================

    /// Open the websocket and run the read/dispatch loop until the
    /// connection ends.
    ///
    /// Resolves configured credentials into a token first so the auth frame
    /// leads everything already queued. The returned future completes only
    /// when the connection terminates; spawn it on a dedicated task to do
    /// other work concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Auth`] if the credential exchange fails,
    /// [`ClientError::WebSocket`] if the handshake fails, and a transport
    /// error if the connection breaks. Termination via [`Client::terminate`]
    /// and a server-initiated close both resolve to `Ok(())`.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.inner.auth_token.lock().is_none() {
            // Auth must hit the wire before any session traffic queued
            // before connect, so this frame goes to the front.
            let token = match &self.inner.credentials {
                Some(credentials) => {
                    auth::fetch_auth_token(credentials.username(), credentials.password()).await?
                }
                None => UNAUTHORIZED_TOKEN.to_string(),
            };
            *self.inner.auth_token.lock() = Some(token.clone());
            self.inner.enqueue(
                protocol::format_message("set_auth_token", &[Value::String(token)]),
                true,
            );
        }

        *self.inner.state.lock() = ConnectionState::Connecting;
        tracing::info!(url = %self.inner.server_url, "connecting");

        let mut request = self.inner.server_url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(ORIGIN, HeaderValue::from_static(BROWSER_ORIGIN));

        let (ws_stream, _response) = match tokio_tungstenite::connect_async(request).await {
            Ok(connected) => connected,
            Err(error) => {
                *self.inner.state.lock() = ConnectionState::Disconnected;
                return Err(error.into());
            }
        };
        let (mut write, mut read) = ws_stream.split();

        *self.inner.state.lock() = ConnectionState::Open;
        tracing::info!("connection open");
        self.inner.events.emit(event::CONNECTED, &Value::Null);

        if let Err(error) = self.flush(&mut write).await {
            self.fail(&error);
            return Err(error);
        }

        loop {
            tokio::select! {
                () = self.inner.cancel.cancelled() => {
                    tracing::info!("connection terminated by request");
                    let _ = write.send(Message::Close(None)).await;
                    self.on_close();
                    return Ok(());
                }
                () = self.inner.queue_notify.notified() => {
                    if let Err(error) = self.flush(&mut write).await {
                        self.fail(&error);
                        return Err(error);
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.process_incoming(text.as_str());
                            if let Err(error) = self.flush(&mut write).await {
                                self.fail(&error);
                                return Err(error);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| ClientError::Transport(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("server sent close frame");
                            self.on_close();
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            let error = ClientError::WebSocket(error);
                            self.fail(&error);
                            return Err(error);
                        }
                        None => {
                            tracing::info!("websocket stream ended");
                            let error = ClientError::ConnectionClosed;
                            self.fail(&error);
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    /// Feed a raw inbound payload through the decode/dispatch path.
    ///
    /// This is the read callback body: frames are decoded, ping probes are
    /// answered, protocol errors are reported as events, and routable
    /// messages are forwarded to the session registry. Exposed for
    /// deterministic testing and traffic replay.
    pub fn process_incoming(&self, raw: &str) {
        let packets = protocol::parse_packets(raw);

        // Any decoded traffic after the auth frame means the server accepted
        // the session.
        if !packets.is_empty() && !self.inner.logged.swap(true, Ordering::SeqCst) {
            tracing::debug!("session acknowledged by server");
        }

        for value in packets {
            match protocol::classify(value) {
                ServerPacket::Ping(n) => {
                    self.send_raw(&format!("{HEARTBEAT_PREFIX}{n}"));
                    self.inner.events.emit(event::PING, &Value::from(n));
                }
                ServerPacket::Message { method, params } => {
                    if method == PROTOCOL_ERROR_METHOD {
                        tracing::error!(?params, "server signaled protocol error");
                        self.inner
                            .events
                            .emit(event::CRITICAL_ERROR, &Value::Array(params));
                    } else {
                        self.inner.registry.route(&method, &params);
                    }
                }
                ServerPacket::Other(value) => {
                    tracing::trace!(?value, "ignoring unroutable packet");
                }
            }
        }
    }

    /// Drain the outbound queue to the socket while the connection is open.
    async fn flush<W>(&self, write: &mut W) -> Result<(), ClientError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: std::fmt::Display,
    {
        while *self.inner.state.lock() == ConnectionState::Open {
            let Some(frame) = self.inner.queue.lock().pop_front() else {
                break;
            };
            tracing::trace!(frame = %frame, "sending frame");
            write
                .send(Message::Text(frame.into()))
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    fn on_close(&self) {
        *self.inner.state.lock() = ConnectionState::Closed;
        self.inner.logged.store(false, Ordering::SeqCst);
        self.inner.events.emit(event::CLOSED, &Value::Null);
    }

    fn fail(&self, error: &ClientError) {
        tracing::warn!(%error, "connection failed");
        self.inner
            .events
            .emit(event::ERROR, &Value::String(error.to_string()));
        self.on_close();
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_url", &self.inner.server_url)
            .field("state", &self.state())
            .field("logged", &self.is_logged())
            .field("queued", &self.inner.queue.lock().len())
            .field("sessions", &self.inner.registry.len())
            .finish()
    }
}

// =============================================================================
// Client Handle
// =============================================================================

/// Non-owning handle from a session back to its client.
///
/// Sessions hold this instead of a strong reference so the client remains
/// the sole owner of the session collection; once the client is gone,
/// outbound messages are dropped with a log line.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    inner: Weak<ClientInner>,
}

impl ClientHandle {
    /// Enqueue a protocol message on the owning client, if it still exists.
    pub fn send(&self, method: &str, params: &[Value]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.enqueue(protocol::format_message(method, params), false);
        } else {
            tracing::debug!(method, "client gone, dropping outbound message");
        }
    }

    /// Register a session with the owning client's registry.
    pub fn register(&self, session: Arc<dyn Session>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.registry.register(session);
        }
    }

    /// Remove a session from the owning client's registry.
    pub fn unregister(&self, id: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.registry.remove(id);
        }
    }
}
