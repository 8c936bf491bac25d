//! Live-connection registry and topic fan-out with a last-value cache.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use {
    futures::future::join_all,
    serde_json::Value,
    switchyard_protocol::encode_notification,
    tokio::sync::{Mutex, RwLock},
    tracing::{debug, warn},
};

use crate::{Error, Result, auth::TopicTable, connection::Connection};

/// Cached value of one topic. Holding the lock serializes publishes and
/// replays on that topic only.
type Lane = Arc<Mutex<Option<Value>>>;

/// Registry of open connections plus the per-topic state cache.
///
/// Every topic has its own lane: `notify` updates the cached value and fans
/// out while holding that topic's lane, and `subscribe` replays under it. A
/// subscriber therefore never sees a cached value older than one it was
/// already sent, and successive publishes on one topic arrive in order.
/// Publishes on different topics never wait on each other.
///
/// Delivery waits for room in a subscriber's outbound buffer, up to the
/// delivery timeout. A subscriber that times out or whose write loop is gone
/// is skipped for that publish; it stays registered until its transport
/// closes.
#[derive(Debug)]
pub struct PubSub {
    topics: Arc<TopicTable>,
    delivery_timeout: Duration,
    lanes: StdMutex<HashMap<String, Lane>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl PubSub {
    pub fn new(topics: TopicTable, delivery_timeout: Duration) -> Self {
        Self {
            topics: Arc::new(topics),
            delivery_timeout,
            lanes: StdMutex::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn topics(&self) -> &TopicTable {
        &self.topics
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    // ── Registry ─────────────────────────────────────────────────────────

    pub async fn register(&self, conn: Arc<Connection>) {
        let count = {
            let mut connections = self.connections.write().await;
            connections.insert(conn.id().to_owned(), conn);
            connections.len()
        };
        debug!(count, "connection registered");
    }

    pub async fn remove(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(conn_id)
    }

    pub async fn get(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(conn_id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    // ── Topics ───────────────────────────────────────────────────────────

    fn lane(&self, topic: &str) -> Lane {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(lanes.entry(topic.to_owned()).or_default())
    }

    /// Last value published on `topic`.
    pub async fn state(&self, topic: &str) -> Option<Value> {
        let lane = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()?;
        let cached = lane.lock().await;
        cached.clone()
    }

    /// Subscribe `conn` to every named topic it can see, replaying cached
    /// values for topics that have one. Returns the full subscription list.
    pub async fn subscribe(&self, conn: &Connection, topics: &[String]) -> Vec<String> {
        for topic in topics {
            if topic.is_empty() || !self.has_topic(topic) {
                continue;
            }
            let lane = self.lane(topic);
            let cached = lane.lock().await;
            if !conn.subscribe(topic) {
                continue;
            }
            debug!(conn_id = conn.id(), topic, "subscribed");
            let Some(value) = cached.as_ref() else {
                continue;
            };
            match encode_notification(topic, Some(value)) {
                Ok(frame) => {
                    if let Err(e) = conn.send_timeout(frame, self.delivery_timeout).await {
                        warn!(conn_id = conn.id(), topic, error = %e, "failed to replay topic state");
                    }
                },
                Err(e) => warn!(topic, error = %e, "failed to encode topic state"),
            }
        }
        conn.subscriptions()
    }

    /// Remove subscriptions. Removal needs no visibility check.
    pub fn unsubscribe(&self, conn: &Connection, topics: &[String]) -> Vec<String> {
        for topic in topics {
            if conn.unsubscribe(topic) {
                debug!(conn_id = conn.id(), topic, "unsubscribed");
            }
        }
        conn.subscriptions()
    }

    /// Publish `value` on `topic`: update the cache, then send one
    /// notification to every open subscriber. Subscribers are served
    /// concurrently; a failing or stalled one is logged and skipped without
    /// holding up the others. Returns the number of connections the
    /// notification was queued for.
    pub async fn notify(&self, topic: &str, value: Value) -> Result<usize> {
        if topic.is_empty() {
            return Err(Error::InvalidTopic);
        }
        let frame = encode_notification(topic, Some(&value))?;

        let lane = self.lane(topic);
        let mut cached = lane.lock().await;
        *cached = Some(value);

        let subscribers: Vec<Arc<Connection>> = self
            .connections
            .read()
            .await
            .values()
            .filter(|conn| conn.is_open() && conn.is_subscribed(topic))
            .cloned()
            .collect();

        let outcomes = join_all(subscribers.iter().map(|conn| {
            let frame = frame.clone();
            async move { conn.send_timeout(frame, self.delivery_timeout).await }
        }))
        .await;
        drop(cached);

        let mut delivered = 0;
        for (conn, outcome) in subscribers.iter().zip(outcomes) {
            match outcome {
                Ok(()) => delivered += 1,
                Err(e) => warn!(conn_id = conn.id(), topic, error = %e, "notification dropped"),
            }
        }

        debug!(topic, delivered, "published");
        Ok(delivered)
    }
}

/// Topic names from `subscribe`/`unsubscribe` params: a single name or a
/// list of names. Non-string entries are ignored.
pub fn topic_list(params: &Value) -> Vec<String> {
    match params {
        Value::String(topic) => vec![topic.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}
