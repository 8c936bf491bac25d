use std::{fmt, future::Future, sync::Arc, time::Duration};

use {
    serde_json::Value,
    switchyard_protocol::{CallError, Message, methods},
    tokio::runtime::Handle,
};

use crate::{Error, Result, auth::Credentials, connection::Connection, dispatcher::Dispatcher};

/// Per-request view of the connection a message arrived on.
///
/// Cheap to clone; handlers may move it into spawned tasks.
#[derive(Clone)]
pub struct RequestContext {
    dispatcher: Dispatcher,
    connection: Arc<Connection>,
    message: Arc<Message>,
}

impl RequestContext {
    pub(crate) fn new(dispatcher: Dispatcher, connection: Arc<Connection>, message: Arc<Message>) -> Self {
        Self {
            dispatcher,
            connection,
            message,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn connection_id(&self) -> &str {
        self.connection.id()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Params exactly as received, before binding.
    pub fn params(&self) -> &Value {
        self.message.params()
    }

    pub fn credentials(&self) -> Credentials {
        self.connection.credentials()
    }

    pub fn methods(&self) -> Vec<String> {
        self.connection.method_names()
    }

    pub fn topics(&self) -> Vec<String> {
        self.connection.topics()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.connection.subscriptions()
    }

    /// Send a notification to this connection only.
    pub async fn send_notification(&self, topic: &str, data: Option<&Value>) -> Result<()> {
        self.connection.notify(topic, data).await
    }

    /// Call back into the peer. `None` uses the dispatcher's default timeout.
    pub async fn call(
        &self,
        method: &str,
        params: Option<&Value>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Value, CallError> {
        let timeout = timeout.or(self.dispatcher.call_timeout());
        self.connection.call(method, params, timeout).await
    }

    /// Ask the peer to confirm `message`. Anything but `true` is a no.
    pub async fn confirm(
        &self,
        message: &str,
        timeout: Option<Duration>,
    ) -> std::result::Result<bool, CallError> {
        let answer = self
            .call(methods::CONFIRM, Some(&Value::from(message)), timeout)
            .await?;
        Ok(answer.as_bool().unwrap_or(false))
    }

    /// Change this connection's identity and recompute what it may see.
    pub async fn set_credentials(&self, credentials: Credentials) {
        self.dispatcher.prepare(&self.connection, credentials).await;
    }

    // ── Blocking bridge ──────────────────────────────────────────────────
    //
    // For handlers registered with `MethodDescriptor::blocking`. They run on
    // a worker thread, so they drive the async helpers to completion on the
    // runtime handle. Without a pool the handler runs on a runtime thread,
    // where blocking would deadlock, and these fail instead.

    /// [`call`](Self::call) from a blocking handler.
    pub fn blocking_call(
        &self,
        method: &str,
        params: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        Ok(self.block_on(self.call(method, params, timeout))??)
    }

    /// [`confirm`](Self::confirm) from a blocking handler.
    pub fn blocking_confirm(&self, message: &str, timeout: Option<Duration>) -> Result<bool> {
        Ok(self.block_on(self.confirm(message, timeout))??)
    }

    /// [`send_notification`](Self::send_notification) from a blocking handler.
    pub fn blocking_notification(&self, topic: &str, data: Option<&Value>) -> Result<()> {
        self.block_on(self.send_notification(topic, data))?
    }

    fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        if self.dispatcher.workers().is_inline() {
            return Err(Error::BlockingBridgeUnavailable);
        }
        let handle = Handle::try_current().map_err(|_| Error::BlockingBridgeUnavailable)?;
        Ok(handle.block_on(future))
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("conn_id", &self.connection.id())
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
