//! Correlation of outbound requests with their replies.
//!
//! Both peers use the same table: a slot is registered before the request is
//! written, the read loop resolves it when a `Result` or `Error` arrives, and
//! a timed-out or failed call removes its own slot.

use std::{
    collections::HashMap,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use {serde_json::Value, tokio::sync::oneshot};

use crate::{Id, RpcError};

/// Outcome delivered to a waiting caller.
pub type Reply = Result<Value, RpcError>;

/// Why an outbound call did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("failed to send request: {0}")]
    Send(String),

    #[error("request id {0} is already awaiting a reply")]
    DuplicateId(Id),

    #[error(transparent)]
    Encode(#[from] crate::Error),
}

#[derive(Debug)]
struct Slots {
    open: bool,
    waiting: HashMap<Id, oneshot::Sender<Reply>>,
}

/// Table of calls awaiting a reply on one connection.
#[derive(Debug)]
pub struct PendingCalls {
    next_id: AtomicI64,
    slots: Mutex<Slots>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(0),
            slots: Mutex::new(Slots {
                open: true,
                waiting: HashMap::new(),
            }),
        }
    }

    /// Allocate a fresh numeric id, unique for the lifetime of this table.
    pub fn next_id(&self) -> Id {
        Id::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Reserve a slot for `id`. Must happen before the request is sent so a
    /// fast reply cannot race past its waiter.
    pub fn register(&self, id: Id) -> Result<PendingReply, CallError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if !slots.open {
            return Err(CallError::Closed);
        }
        if slots.waiting.contains_key(&id) {
            return Err(CallError::DuplicateId(id));
        }
        let (tx, rx) = oneshot::channel();
        slots.waiting.insert(id.clone(), tx);
        Ok(PendingReply { id, rx })
    }

    /// Deliver a reply. Returns `false` when nobody is waiting for `id`
    /// (unknown, already timed out, or the waiter went away).
    pub fn resolve(&self, id: &Id, reply: Reply) -> bool {
        let sender = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiting
            .remove(id);
        match sender {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop the slot for `id` without delivering anything.
    pub fn remove(&self, id: &Id) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiting
            .remove(id)
            .is_some()
    }

    /// Refuse new registrations and wake every waiter with
    /// [`CallError::Closed`]. Returns the number of abandoned calls.
    pub fn close(&self) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.open = false;
        let abandoned = slots.waiting.len();
        slots.waiting.clear();
        abandoned
    }

    /// Accept registrations again after a reconnect.
    pub fn reopen(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open = true;
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiting
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving half of a registered call.
#[derive(Debug)]
pub struct PendingReply {
    id: Id,
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Wait for the reply. On timeout the slot is removed so a late reply is
    /// discarded by [`PendingCalls::resolve`].
    pub async fn wait(self, calls: &PendingCalls, timeout: Option<Duration>) -> Result<Value, CallError> {
        let Self { id, rx } = self;
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    calls.remove(&id);
                    tracing::debug!(%id, ?limit, "call timed out");
                    return Err(CallError::Timeout(limit));
                },
            },
            None => rx.await,
        };
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(CallError::Rpc(err)),
            Err(_) => Err(CallError::Closed),
        }
    }
}
