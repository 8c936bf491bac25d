//! The server-side RPC engine.
//!
//! One [`Dispatcher`] owns the method and topic tables, the authorization
//! backend, the worker pool and the pub/sub engine. Each transport hands its
//! inbound frames to [`Dispatcher::serve`]; every frame is handled on its own
//! task so a slow handler never holds up the next frame on that connection.

use std::{fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use {
    futures::{FutureExt, Stream, StreamExt},
    serde_json::{Value, json},
    switchyard_protocol::{
        CallError, Id, Message, RpcError, decode, decode_error, encode_error, encode_result,
        is_reply, methods,
    },
    tokio::sync::mpsc,
    tracing::{debug, error, info, trace, warn},
};

use crate::{
    Result,
    auth::{AllowAll, AuthBackend, Credentials, MethodTable, Requirements, TopicTable},
    connection::{Connection, ConnectionState},
    context::RequestContext,
    method::{Handler, HandlerError, HandlerResult, MethodDescriptor, Request, qualified_name},
    pubsub::{PubSub, topic_list},
    worker::WorkerPool,
};

const DEFAULT_OUTBOUND_BUFFER: usize = 512;
const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

// ── Builder ──────────────────────────────────────────────────────────────────

/// Collects registrations and settings; [`build`](Self::build) freezes them.
pub struct DispatcherBuilder {
    auth: Arc<dyn AuthBackend>,
    methods: MethodTable,
    topics: TopicTable,
    max_workers: usize,
    call_timeout: Option<Duration>,
    outbound_buffer: usize,
    delivery_timeout: Duration,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        let builder = Self {
            auth: Arc::new(AllowAll),
            methods: MethodTable::new(),
            topics: TopicTable::new(),
            max_workers: DEFAULT_MAX_WORKERS,
            call_timeout: None,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        };
        builder.add_methods("", builtin_methods())
    }

    #[must_use]
    pub fn auth(self, backend: impl AuthBackend + 'static) -> Self {
        self.auth_arc(Arc::new(backend))
    }

    #[must_use]
    pub fn auth_arc(mut self, backend: Arc<dyn AuthBackend>) -> Self {
        self.auth = backend;
        self
    }

    /// Blocking handler concurrency; `0` runs them inline.
    #[must_use]
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Default timeout for calls from the server into a connection.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn outbound_buffer(mut self, frames: usize) -> Self {
        self.outbound_buffer = frames.max(1);
        self
    }

    /// How long a pub/sub delivery waits for room in one subscriber's
    /// outbound buffer before that subscriber is skipped.
    #[must_use]
    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Register `method` as `prefix__name` (or `name` for an empty prefix).
    /// A later registration under the same name replaces the earlier one.
    #[must_use]
    pub fn add_method(mut self, prefix: &str, method: MethodDescriptor) -> Self {
        let name = qualified_name(prefix, method.name());
        let method = method.with_name(name.clone());
        if self.methods.insert(name.clone(), Arc::new(method)).is_some() {
            debug!(method = %name, "replaced method registration");
        }
        self
    }

    #[must_use]
    pub fn add_methods(self, prefix: &str, methods: impl IntoIterator<Item = MethodDescriptor>) -> Self {
        methods
            .into_iter()
            .fold(self, |builder, method| builder.add_method(prefix, method))
    }

    #[must_use]
    pub fn add_topic(self, name: impl Into<String>) -> Self {
        self.add_topic_with(name, Requirements::default())
    }

    #[must_use]
    pub fn add_topic_with(mut self, name: impl Into<String>, requirements: Requirements) -> Self {
        self.topics.insert(name.into(), requirements);
        self
    }

    #[must_use]
    pub fn add_topics<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names
            .into_iter()
            .fold(self, |builder, name| builder.add_topic(name))
    }

    pub fn build(mut self) -> Dispatcher {
        // Application registrations win over backend-provided methods.
        for method in self.auth.methods() {
            let name = method.name().to_owned();
            self.methods
                .entry(name)
                .or_insert_with(|| Arc::new(method));
        }
        info!(
            methods = self.methods.len(),
            topics = self.topics.len(),
            max_workers = self.max_workers,
            "dispatcher ready"
        );
        Dispatcher {
            inner: Arc::new(Inner {
                methods: self.methods,
                pubsub: PubSub::new(self.topics, self.delivery_timeout),
                auth: self.auth,
                workers: WorkerPool::new(self.max_workers),
                call_timeout: self.call_timeout,
                outbound_buffer: self.outbound_buffer,
            }),
        }
    }
}

fn builtin_methods() -> Vec<MethodDescriptor> {
    vec![
        MethodDescriptor::new(methods::GET_METHODS, |req: Request| async move {
            Ok(json!(req.ctx()?.methods()))
        }),
        MethodDescriptor::new(methods::GET_TOPICS, |req: Request| async move {
            Ok(json!(req.ctx()?.topics()))
        }),
        MethodDescriptor::new(methods::GET_SUBSCRIPTIONS, |req: Request| async move {
            Ok(json!(req.ctx()?.subscriptions()))
        }),
        MethodDescriptor::new(methods::SUBSCRIBE, |req: Request| async move {
            let ctx = req.ctx()?;
            let topics = topic_list(ctx.params());
            let subscriptions = ctx
                .dispatcher()
                .pubsub()
                .subscribe(ctx.connection(), &topics)
                .await;
            Ok(json!(subscriptions))
        }),
        MethodDescriptor::new(methods::UNSUBSCRIBE, |req: Request| async move {
            let ctx = req.ctx()?;
            let topics = topic_list(ctx.params());
            Ok(json!(
                ctx.dispatcher()
                    .pubsub()
                    .unsubscribe(ctx.connection(), &topics)
            ))
        }),
    ]
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

struct Inner {
    methods: MethodTable,
    pubsub: PubSub,
    auth: Arc<dyn AuthBackend>,
    workers: WorkerPool,
    call_timeout: Option<Duration>,
    outbound_buffer: usize,
}

/// Shared handle to the RPC engine. Cloning is cheap.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Every registered method, before authorization filtering.
    pub fn methods(&self) -> &MethodTable {
        &self.inner.methods
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.methods.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.pubsub.topics().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.inner.pubsub
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.inner.workers
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.inner.call_timeout
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.pubsub.connection_count().await
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.pubsub.connections().await
    }

    /// Publish `value` on `topic` to every subscriber.
    pub async fn notify(&self, topic: &str, value: Value) -> Result<usize> {
        self.inner.pubsub.notify(topic, value).await
    }

    /// Call a method on the peer behind connection `conn_id`.
    pub async fn call(
        &self,
        conn_id: &str,
        method: &str,
        params: Option<&Value>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Value, CallError> {
        let conn = self
            .inner
            .pubsub
            .get(conn_id)
            .await
            .ok_or(CallError::Closed)?;
        conn.call(method, params, timeout.or(self.inner.call_timeout))
            .await
    }

    pub async fn authenticate(&self, token: Option<&str>) -> Credentials {
        self.inner.auth.authenticate(token).await
    }

    /// Ask the backend what `credentials` may see and install it on `conn`.
    pub async fn prepare(&self, conn: &Connection, credentials: Credentials) {
        let visibility = self
            .inner
            .auth
            .prepare(&self.inner.methods, self.inner.pubsub.topics(), &credentials)
            .await;
        debug!(
            conn_id = conn.id(),
            user = credentials.user.as_deref().unwrap_or("-"),
            methods = visibility.methods.len(),
            topics = visibility.topics.len(),
            "connection prepared"
        );
        conn.apply(credentials, visibility);
    }

    // ── Connection lifecycle ─────────────────────────────────────────────

    /// Create a connection in the `Connecting` state. The receiver yields
    /// outbound frames and must be drained by the transport's write loop.
    pub fn connect(&self, credentials: Credentials) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.inner.outbound_buffer);
        (Arc::new(Connection::new(tx, credentials)), rx)
    }

    /// Consult the backend once, register the connection and mark it open.
    pub async fn open(&self, conn: &Arc<Connection>) {
        self.prepare(conn, conn.credentials()).await;
        self.inner.pubsub.register(Arc::clone(conn)).await;
        conn.advance(ConnectionState::Open);
        info!(conn_id = conn.id(), "connection open");
    }

    /// Drive a connection until its inbound stream ends, then close it.
    pub async fn serve<S>(&self, conn: Arc<Connection>, frames: S)
    where
        S: Stream<Item = String> + Send,
    {
        self.open(&conn).await;
        futures::pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            trace!(conn_id = conn.id(), %frame, "inbound frame");
            let dispatcher = self.clone();
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { dispatcher.handle_frame(&conn, &frame).await });
        }
        self.close(&conn).await;
    }

    /// Unregister `conn` and fail every call still waiting on it.
    pub async fn close(&self, conn: &Connection) {
        if !conn.advance(ConnectionState::Closing) {
            return;
        }
        self.inner.pubsub.remove(conn.id()).await;
        let abandoned = conn.pending().close();
        conn.advance(ConnectionState::Closed);
        info!(conn_id = conn.id(), abandoned, "connection closed");
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// Handle one inbound frame. Protocol errors are answered on the same
    /// connection and never end it; a frame shaped like a reply is never
    /// answered.
    pub async fn handle_frame(&self, conn: &Arc<Connection>, raw: &str) {
        let message = match decode(raw) {
            Ok(message) => message,
            Err(err) if is_reply(raw) => {
                // Replies are never answered, not even broken ones.
                match err.id.clone() {
                    Some(id) if conn.pending().resolve(&id, Err(err.clone())) => {},
                    _ => debug!(conn_id = conn.id(), code = err.code(), "dropping invalid reply"),
                }
                return;
            },
            Err(err) => {
                debug!(conn_id = conn.id(), code = err.code(), "rejected frame");
                self.send_error(conn, &err, None).await;
                return;
            },
        };

        match message {
            Message::Request { .. } => self.handle_request(conn, message).await,
            Message::Notification { method, .. } => {
                debug!(conn_id = conn.id(), %method, "ignoring inbound notification");
            },
            Message::Result {
                id: Some(id),
                value,
            } => {
                if !conn.pending().resolve(&id, Ok(value)) {
                    debug!(conn_id = conn.id(), %id, "dropping uncorrelated result");
                }
            },
            Message::Error { id: Some(ref id), .. } => match decode_error(&message) {
                Ok(err) => {
                    if !conn.pending().resolve(id, Err(err)) {
                        debug!(conn_id = conn.id(), %id, "dropping uncorrelated error");
                    }
                },
                Err(e) => warn!(conn_id = conn.id(), error = %e, "undecodable error reply"),
            },
            Message::Result { id: None, .. } | Message::Error { id: None, .. } => {
                debug!(conn_id = conn.id(), "dropping reply without id");
            },
        }
    }

    async fn handle_request(&self, conn: &Arc<Connection>, message: Message) {
        let message = Arc::new(message);
        let Message::Request { id, method, params } = message.as_ref() else {
            return;
        };

        let Some(descriptor) = conn.method(method) else {
            debug!(conn_id = conn.id(), %method, "method unknown or restricted");
            self.send_error(conn, &RpcError::method_not_found(), Some(id))
                .await;
            return;
        };

        let params = match descriptor.bind(params) {
            Ok(params) => params,
            Err(err) => {
                self.send_error(conn, &err, Some(id)).await;
                return;
            },
        };

        let context = descriptor
            .wants_context()
            .then(|| RequestContext::new(self.clone(), Arc::clone(conn), Arc::clone(&message)));
        let outcome = self.invoke(&descriptor, Request::new(params, context)).await;

        match outcome {
            Ok(value) if descriptor.is_raw_response() => {
                let frame = match value {
                    Value::String(frame) => frame,
                    other => other.to_string(),
                };
                self.send(conn, frame).await;
            },
            Ok(value) => match encode_result(Some(id), &value) {
                Ok(frame) => self.send(conn, frame).await,
                Err(e) => {
                    error!(conn_id = conn.id(), %method, error = ?e, "failed to encode result");
                    self.send_error(conn, &RpcError::internal(), Some(id)).await;
                },
            },
            Err(HandlerError::Rpc(err)) if err.is_forwardable() => {
                self.send_error(conn, &err, Some(id)).await;
            },
            Err(err) => {
                error!(conn_id = conn.id(), %method, %id, error = ?err, "handler failed");
                self.send_error(conn, &RpcError::internal(), Some(id)).await;
            },
        }
    }

    async fn invoke(&self, descriptor: &MethodDescriptor, request: Request) -> HandlerResult {
        match descriptor.handler() {
            Handler::Async(handler) => {
                let handler = Arc::clone(handler);
                AssertUnwindSafe(async move { handler(request).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(HandlerError::internal(anyhow::anyhow!("handler panicked"))))
            },
            Handler::Blocking(handler) => {
                let handler = Arc::clone(handler);
                self.inner.workers.run(move || handler(request)).await?
            },
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    async fn send(&self, conn: &Connection, frame: String) {
        trace!(conn_id = conn.id(), %frame, "outbound frame");
        if let Err(e) = conn.send(frame).await {
            debug!(conn_id = conn.id(), error = %e, "reply dropped");
        }
    }

    async fn send_error(&self, conn: &Connection, err: &RpcError, id: Option<&Id>) {
        let frame = encode_error(err, id).or_else(|e| {
            error!(conn_id = conn.id(), code = err.code(), error = %e, "unencodable error");
            encode_error(&RpcError::internal(), id)
        });
        match frame {
            Ok(frame) => self.send(conn, frame).await,
            Err(e) => error!(conn_id = conn.id(), error = %e, "failed to encode error reply"),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("methods", &self.inner.methods.len())
            .field("topics", &self.inner.pubsub.topics().len())
            .field("workers", &self.inner.workers)
            .field("call_timeout", &self.inner.call_timeout)
            .finish_non_exhaustive()
    }
}
