use std::{
    collections::{BTreeSet, HashSet},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use {
    serde_json::Value,
    switchyard_protocol::{CallError, PendingCalls, encode_notification, encode_request},
    tokio::sync::mpsc,
};

use crate::{
    Error, Result,
    auth::{Credentials, MethodTable, Visibility},
    method::MethodDescriptor,
};

/// Lifecycle of one connection. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    credentials: Credentials,
    methods: MethodTable,
    topics: HashSet<String>,
    subscriptions: BTreeSet<String>,
}

/// One live bidirectional channel to a peer.
///
/// Outbound frames go through a bounded channel drained by the transport's
/// write loop. Everything the connection may see (methods, topics) and what
/// it subscribed to lives here, so dropping the connection is the whole
/// cleanup.
#[derive(Debug)]
pub struct Connection {
    id: String,
    sender: mpsc::Sender<String>,
    state: AtomicU8,
    connected_at: Instant,
    session: RwLock<Session>,
    pending: PendingCalls,
}

impl Connection {
    pub fn new(sender: mpsc::Sender<String>, credentials: Credentials) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            connected_at: Instant::now(),
            session: RwLock::new(Session {
                credentials,
                ..Session::default()
            }),
            pending: PendingCalls::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance to `next`. Returns `false` if the connection was already at or
    /// past that state.
    pub(crate) fn advance(&self, next: ConnectionState) -> bool {
        self.state.fetch_max(next as u8, Ordering::AcqRel) < next as u8
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open && !self.sender.is_closed()
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    /// Queue a frame, waiting for room in the outbound buffer.
    pub async fn send(&self, frame: String) -> Result<()> {
        self.sender
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed(self.id.clone()))
    }

    /// Like [`send`](Self::send), but gives up once `limit` has passed
    /// without room in the buffer.
    pub async fn send_timeout(&self, frame: String, limit: Duration) -> Result<()> {
        tokio::time::timeout(limit, self.send(frame))
            .await
            .map_err(|_| Error::DeliveryTimeout(self.id.clone()))?
    }

    /// Queue a frame without waiting. Fails when the buffer is full or the
    /// write loop is gone.
    pub fn try_send(&self, frame: String) -> Result<()> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::BufferFull(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => Error::ConnectionClosed(self.id.clone()),
        })
    }

    pub async fn notify(&self, method: &str, params: Option<&Value>) -> Result<()> {
        self.send(encode_notification(method, params)?).await
    }

    /// Call a method on the peer and wait for its reply.
    ///
    /// The pending slot is registered before the request is queued so a fast
    /// reply always finds it.
    pub async fn call(
        &self,
        method: &str,
        params: Option<&Value>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Value, CallError> {
        let id = self.pending.next_id();
        let reply = self.pending.register(id.clone())?;
        let frame = match encode_request(method, Some(&id), params) {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.remove(&id);
                return Err(e.into());
            },
        };
        if self.sender.send(frame).await.is_err() {
            self.pending.remove(&id);
            return Err(CallError::Closed);
        }
        tracing::debug!(conn_id = %self.id, %id, method, "outbound call");
        reply.wait(&self.pending, timeout).await
    }

    // ── Session ──────────────────────────────────────────────────────────

    pub fn credentials(&self) -> Credentials {
        self.read().credentials.clone()
    }

    /// A visible method by name.
    pub fn method(&self, name: &str) -> Option<Arc<MethodDescriptor>> {
        self.read().methods.get(name).cloned()
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().methods.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.read().topics.iter().cloned().collect();
        topics.sort();
        topics
    }

    pub fn can_see_topic(&self, topic: &str) -> bool {
        self.read().topics.contains(topic)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.read().subscriptions.iter().cloned().collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.read().subscriptions.contains(topic)
    }

    /// Install a freshly prepared visibility. Subscriptions to topics that
    /// are no longer visible are dropped.
    pub(crate) fn apply(&self, credentials: Credentials, visibility: Visibility) {
        let mut session = self.write();
        let Visibility { methods, topics } = visibility;
        session
            .subscriptions
            .retain(|topic| topics.contains(topic));
        session.credentials = credentials;
        session.methods = methods;
        session.topics = topics;
    }

    /// Add a subscription if the topic is visible. Returns whether it was
    /// added.
    pub(crate) fn subscribe(&self, topic: &str) -> bool {
        let mut session = self.write();
        if !session.topics.contains(topic) {
            return false;
        }
        session.subscriptions.insert(topic.to_owned())
    }

    pub(crate) fn unsubscribe(&self, topic: &str) -> bool {
        self.write().subscriptions.remove(topic)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Session> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Session> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }
}
