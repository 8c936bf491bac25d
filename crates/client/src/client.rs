//! Client engine: connection lifecycle, call correlation and dispatch of
//! frames the server sends on its own initiative.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use {
    futures::{
        FutureExt, SinkExt, StreamExt,
        future::BoxFuture,
        stream::{SplitSink, SplitStream},
    },
    secrecy::{ExposeSecret, Secret},
    serde_json::{Value, json},
    switchyard_protocol::{
        CallError, Id, Message, PendingCalls, RpcError, decode, decode_error, encode_error,
        encode_notification, encode_request, encode_result, methods, qualified_name,
    },
    tokio::{
        net::TcpStream,
        sync::{Mutex, mpsc},
        task::JoinHandle,
    },
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{
            Message as WsMessage,
            client::IntoClientRequest,
            http::{HeaderValue, header::AUTHORIZATION},
        },
    },
    tracing::{debug, error, info, warn},
    url::Url,
};

use crate::{Error, Result};

/// Outbound frames queued per connection before `call` starts waiting.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 512;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type MethodHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type NotificationHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

// ── State ────────────────────────────────────────────────────────────────────

/// Connection lifecycle. Cyclic: a disconnected client may connect again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ClientState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Correlation id to use instead of the next counter value.
    pub id: Option<Id>,
    /// Overrides the client's default call timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    #[must_use]
    pub fn with_id(mut self, id: impl Into<Id>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientBuilder {
    url: Option<String>,
    token: Option<Secret<String>>,
    call_timeout: Option<Duration>,
    auto_connect: bool,
    outbound_buffer: usize,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            call_timeout: None,
            auto_connect: true,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Bearer token presented in the upgrade request's `Authorization` header.
    #[must_use]
    pub fn token(self, token: impl Into<String>) -> Self {
        self.secret_token(Secret::new(token.into()))
    }

    #[must_use]
    pub fn secret_token(mut self, token: Secret<String>) -> Self {
        self.token = Some(token);
        self
    }

    /// Default timeout for outbound calls. Unset means wait forever.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Connect on first use when a url is configured. On by default.
    #[must_use]
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    #[must_use]
    pub fn outbound_buffer(mut self, frames: usize) -> Self {
        self.outbound_buffer = frames.max(1);
        self
    }

    pub fn build(self) -> Result<Client> {
        let url = self.url.as_deref().map(parse_url).transpose()?;
        Ok(Client {
            inner: Arc::new(Inner {
                url: RwLock::new(url),
                token: self.token,
                call_timeout: self.call_timeout,
                auto_connect: self.auto_connect,
                outbound_buffer: self.outbound_buffer,
                state: AtomicU8::new(ClientState::Disconnected as u8),
                pending: PendingCalls::new(),
                link: Mutex::new(None),
                methods: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
            }),
        })
    }
}

/// Parse a `ws://` or `wss://` url.
pub fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(Error::UnsupportedScheme(other.to_owned())),
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

struct Inner {
    url: RwLock<Option<Url>>,
    token: Option<Secret<String>>,
    call_timeout: Option<Duration>,
    auto_connect: bool,
    outbound_buffer: usize,
    state: AtomicU8,
    pending: PendingCalls,
    link: Mutex<Option<Link>>,
    methods: RwLock<HashMap<String, MethodHandler>>,
    handlers: RwLock<HashMap<String, NotificationHandler>>,
}

/// The tasks and outbound queue of one live connection.
struct Link {
    sender: mpsc::Sender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                debug!(error = %e, "connection task failed");
            }
        }
    }
}

/// JSON-RPC client over a single WebSocket connection.
///
/// Cheap to clone; clones share the connection, the pending calls and the
/// registered handlers.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Client for `url` with default settings. Connects on first use.
    pub fn new(url: &str) -> Result<Self> {
        ClientBuilder::new().url(url).build()
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    pub fn url(&self) -> Option<Url> {
        self.inner
            .url
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls currently waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Connect to the configured url. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut link = self.inner.link.lock().await;
        if self.is_connected() && link.is_some() {
            return Ok(());
        }
        self.open_link(&mut link).await.map(drop)
    }

    /// Replace the configured url and connect to it, dropping any current
    /// connection first.
    pub async fn connect_to(&self, url: &str) -> Result<()> {
        let url = parse_url(url)?;
        let mut link = self.inner.link.lock().await;
        *self.inner.url.write().unwrap_or_else(PoisonError::into_inner) = Some(url);
        self.open_link(&mut link).await.map(drop)
    }

    /// Close the connection and fail every pending call with
    /// [`CallError::Closed`]. The client can connect again afterwards.
    pub async fn disconnect(&self) {
        let link = self.inner.link.lock().await.take();
        if let Some(link) = link {
            link.shutdown().await;
        }
        self.inner.set_state(ClientState::Disconnected);
        let abandoned = self.inner.pending.close();
        debug!(abandoned, "client disconnected");
    }

    async fn open_link(&self, slot: &mut Option<Link>) -> Result<mpsc::Sender<String>> {
        // The old read loop is aborted before it can fail its calls.
        if let Some(old) = slot.take() {
            old.shutdown().await;
            let abandoned = self.inner.pending.close();
            debug!(abandoned, "replaced connection");
        }
        let url = self.url().ok_or(Error::NotConnected)?;

        self.inner.set_state(ClientState::Connecting);
        let stream = match self.handshake(&url).await {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.set_state(ClientState::Disconnected);
                return Err(e);
            },
        };

        let (sink, stream) = stream.split();
        let (sender, outbound) = mpsc::channel(self.inner.outbound_buffer);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        self.inner.pending.reopen();
        self.inner.set_state(ClientState::Connected);

        let weak = Arc::downgrade(&self.inner);
        let tasks = vec![
            tokio::spawn(write_loop(sink, outbound)),
            tokio::spawn(read_loop(weak.clone(), stream, sender.clone(), notify_tx)),
            tokio::spawn(notification_loop(weak, notify_rx)),
        ];
        *slot = Some(Link {
            sender: sender.clone(),
            tasks,
        });

        info!(%url, "connected");
        Ok(sender)
    }

    async fn handshake(&self, url: &Url) -> Result<WsStream> {
        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = &self.inner.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|_| Error::InvalidToken)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (stream, _) = connect_async(request).await?;
        Ok(stream)
    }

    /// Outbound queue of the live connection, connecting first if allowed.
    async fn sender(&self) -> Result<mpsc::Sender<String>> {
        let mut link = self.inner.link.lock().await;
        if self.is_connected()
            && let Some(link) = link.as_ref()
        {
            return Ok(link.sender.clone());
        }
        if !self.inner.auto_connect {
            return Err(Error::NotConnected);
        }
        self.open_link(&mut link).await
    }

    // ── Calls ────────────────────────────────────────────────────────────

    /// Call `method` and wait for its result.
    pub async fn call(&self, method: &str, params: Option<&Value>) -> Result<Value> {
        self.call_with(method, params, CallOptions::default()).await
    }

    pub async fn call_with(
        &self,
        method: &str,
        params: Option<&Value>,
        options: CallOptions,
    ) -> Result<Value> {
        let sender = self.sender().await?;
        let pending = &self.inner.pending;

        let id = options.id.unwrap_or_else(|| pending.next_id());
        let reply = pending.register(id.clone())?;
        let frame = match encode_request(method, Some(&id), params) {
            Ok(frame) => frame,
            Err(e) => {
                pending.remove(&id);
                return Err(CallError::Encode(e).into());
            },
        };

        debug!(%id, method, "call");
        if sender.send(frame).await.is_err() {
            pending.remove(&id);
            return Err(CallError::Closed.into());
        }

        let timeout = options.timeout.or(self.inner.call_timeout);
        Ok(reply.wait(pending, timeout).await?)
    }

    /// Send a notification. No reply is expected.
    pub async fn notify(&self, method: &str, params: Option<&Value>) -> Result<()> {
        let sender = self.sender().await?;
        let frame = encode_notification(method, params)?;
        sender
            .send(frame)
            .await
            .map_err(|_| Error::Call(CallError::Closed))
    }

    pub async fn get_methods(&self) -> Result<Vec<String>> {
        names(self.call(methods::GET_METHODS, None).await?)
    }

    pub async fn get_topics(&self) -> Result<Vec<String>> {
        names(self.call(methods::GET_TOPICS, None).await?)
    }

    pub async fn get_subscriptions(&self) -> Result<Vec<String>> {
        names(self.call(methods::GET_SUBSCRIPTIONS, None).await?)
    }

    // ── Pub/sub ──────────────────────────────────────────────────────────

    /// Subscribe to `topic` and route its notifications to `handler`.
    ///
    /// The handler is installed before the request goes out so a cached
    /// value replayed by the server is not missed. Returns `false` (and
    /// removes the handler) when the server did not grant the subscription.
    /// Handlers run one at a time in arrival order.
    pub async fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> Result<bool>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |params| handler(params).boxed());
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_owned(), handler);

        let granted = match self.call(methods::SUBSCRIBE, Some(&json!([topic]))).await {
            Ok(value) => names(value).map(|subs| subs.iter().any(|t| t == topic)),
            Err(e) => Err(e),
        };
        match granted {
            Ok(true) => Ok(true),
            Ok(false) => {
                debug!(topic, "subscription refused");
                self.remove_handler(topic);
                Ok(false)
            },
            Err(e) => {
                self.remove_handler(topic);
                Err(e)
            },
        }
    }

    /// Unsubscribe from `topic`. The local handler is removed even when the
    /// request fails.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let outcome = self.call(methods::UNSUBSCRIBE, Some(&json!([topic]))).await;
        self.remove_handler(topic);
        outcome.map(drop)
    }

    fn remove_handler(&self, topic: &str) -> bool {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
            .is_some()
    }

    // ── Local methods ────────────────────────────────────────────────────

    /// Register a method the server may call, named `prefix__name` (or just
    /// `name` with an empty prefix). A later registration replaces an
    /// earlier one.
    ///
    /// Errors that are an [`RpcError`] of a forwardable kind reach the
    /// server as-is; anything else is logged and reported as an internal
    /// error.
    pub fn add_method<F, Fut>(&self, prefix: &str, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let name = qualified_name(prefix, name);
        let handler: MethodHandler = Arc::new(move |params| handler(params).boxed());
        let replaced = self
            .inner
            .methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), handler)
            .is_some();
        if replaced {
            debug!(method = name, "replaced client method");
        }
    }

    pub fn remove_method(&self, name: &str) -> bool {
        self.inner
            .methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.url().map(String::from))
            .field("state", &self.state())
            .field("pending", &self.pending_calls())
            .finish_non_exhaustive()
    }
}

fn names(value: Value) -> Result<Vec<String>> {
    Ok(serde_json::from_value(value)?)
}

// ── Inbound frames ───────────────────────────────────────────────────────────

impl Inner {
    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn handle_frame(
        &self,
        raw: &str,
        sender: &mpsc::Sender<String>,
        notifications: &mpsc::UnboundedSender<(String, Value)>,
    ) {
        let message = match decode(raw) {
            Ok(message) => message,
            Err(err) => {
                self.reject(err);
                return;
            },
        };

        match message {
            Message::Request { id, method, params } => {
                debug!(%id, method, "inbound call");
                let handler = self
                    .methods
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&method)
                    .cloned();
                tokio::spawn(respond(handler, method, id, params, sender.clone()));
            },
            Message::Notification { method, params } => {
                if notifications.send((method, params)).is_err() {
                    debug!("notification loop gone");
                }
            },
            Message::Result {
                id: Some(id),
                value,
            } => {
                if !self.pending.resolve(&id, Ok(value)) {
                    debug!(%id, "dropping uncorrelated result");
                }
            },
            Message::Result { id: None, .. } => debug!("dropping result without id"),
            message @ Message::Error { .. } => self.resolve_error(&message),
        }
    }

    fn resolve_error(&self, message: &Message) {
        let err = match decode_error(message) {
            Ok(err) => err,
            Err(e) => {
                warn!(error = %e, "undecodable error envelope");
                return;
            },
        };
        match message.id() {
            Some(id) => {
                if !self.pending.resolve(id, Err(err)) {
                    debug!(%id, "dropping uncorrelated error");
                }
            },
            None => warn!(code = err.code(), detail = %err.message, "server reported an error"),
        }
    }

    /// A frame that failed validation. If it still carries the id of a call
    /// we are waiting on, that call fails with the decode error; otherwise
    /// the frame is logged and dropped. Invalid frames are never answered.
    fn reject(&self, err: RpcError) {
        if let Some(id) = err.id.clone()
            && self.pending.resolve(&id, Err(err.clone()))
        {
            return;
        }
        warn!(error = %err, "dropping invalid frame from server");
    }
}

async fn respond(
    handler: Option<MethodHandler>,
    method: String,
    id: Id,
    params: Value,
    sender: mpsc::Sender<String>,
) {
    let outcome = match handler {
        None => Err(RpcError::method_not_found()),
        Some(handler) => match AssertUnwindSafe(handler(params)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(wire_error(&method, err)),
            Err(_) => {
                error!(method, "client method panicked");
                Err(RpcError::internal())
            },
        },
    };

    let frame = match &outcome {
        Ok(value) => encode_result(Some(&id), value),
        Err(err) => encode_error(err, Some(&id)),
    };
    let frame = match frame.or_else(|e| {
        error!(method, error = %e, "failed to encode reply");
        encode_error(&RpcError::internal(), Some(&id))
    }) {
        Ok(frame) => frame,
        Err(_) => return,
    };

    if sender.send(frame).await.is_err() {
        debug!(method, "connection closed before reply");
    }
}

/// What the server sees when a local method fails.
fn wire_error(method: &str, err: anyhow::Error) -> RpcError {
    match err.downcast::<RpcError>() {
        Ok(rpc) if rpc.is_forwardable() => rpc,
        Ok(rpc) => {
            error!(method, error = %rpc, "client method failed");
            RpcError::internal()
        },
        Err(err) => {
            error!(method, error = ?err, "client method failed");
            RpcError::internal()
        },
    }
}

// ── Transport tasks ──────────────────────────────────────────────────────────

async fn write_loop(mut sink: SplitSink<WsStream, WsMessage>, mut outbound: mpsc::Receiver<String>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
            debug!(error = %e, "websocket write failed");
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "websocket close failed");
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    mut stream: SplitStream<WsStream>,
    sender: mpsc::Sender<String>,
    notifications: mpsc::UnboundedSender<(String, Value)>,
) {
    while let Some(frame) = stream.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match frame {
            Ok(WsMessage::Text(text)) => inner.handle_frame(text.as_str(), &sender, &notifications),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {},
            Err(e) => {
                warn!(error = %e, "websocket read failed");
                break;
            },
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.set_state(ClientState::Disconnected);
        let abandoned = inner.pending.close();
        info!(abandoned, "connection closed by server");
    }
}

/// Runs subscription handlers sequentially so each topic's notifications
/// are handled in the order they arrived.
async fn notification_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<(String, Value)>) {
    while let Some((topic, params)) = rx.recv().await {
        let Some(handler) = inner.upgrade().and_then(|inner| {
            inner
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&topic)
                .cloned()
        }) else {
            debug!(topic, "notification without handler");
            continue;
        };
        if let Err(e) = handler(params).await {
            warn!(topic, error = %e, "notification handler failed");
        }
    }
}
