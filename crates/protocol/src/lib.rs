//! JSON-RPC 2.0 protocol definitions for switchyard.
//!
//! All communication uses one JSON object per text frame over a persistent
//! bidirectional channel. Either peer may issue requests.
//!
//! Envelope types:
//! - `Request`: method call carrying a correlation id
//! - `Notification`: method call without an id, no reply expected
//! - `Result`: successful reply correlated by id
//! - `Error`: failed reply (or protocol failure) with a numeric code

pub mod codec;
pub mod error;
pub mod id;
pub mod pending;

pub use {
    codec::{
        ErrorObject, Message, decode, decode_error, encode_error, encode_notification,
        encode_request, encode_result, is_reply,
    },
    error::{ErrorKind, ErrorTable, RpcError, error_table, register_error_code},
    id::Id,
    pending::{CallError, PendingCalls, PendingReply, Reply},
};

// ── Constants ────────────────────────────────────────────────────────────────

/// The only protocol version accepted on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Lower bound (inclusive) of the application-defined server error range.
    pub const SERVER_ERROR_MIN: i64 = -32099;
    /// Upper bound (inclusive) of the application-defined server error range.
    pub const SERVER_ERROR_MAX: i64 = -32000;

    /// Whether `code` falls in the reserved "generic server-defined" range.
    pub const fn is_server_defined(code: i64) -> bool {
        code >= SERVER_ERROR_MIN && code <= SERVER_ERROR_MAX
    }
}

// ── Built-in method names ────────────────────────────────────────────────────

pub mod methods {
    pub const GET_METHODS: &str = "get_methods";
    pub const GET_TOPICS: &str = "get_topics";
    pub const GET_SUBSCRIPTIONS: &str = "get_subscriptions";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    /// Server → client confirmation prompt.
    pub const CONFIRM: &str = "confirm";
}

/// `prefix__name`, or just `name` when the prefix is empty.
pub fn qualified_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}__{name}")
    }
}

// ── Crate errors ─────────────────────────────────────────────────────────────

/// Failures while encoding envelopes or maintaining the error-code table.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("unknown error code {0}")]
    UnknownErrorCode(i64),

    #[error("error code {0} is reserved by JSON-RPC 2.0")]
    ReservedErrorCode(i64),

    #[error("expected an error envelope, got a {0}")]
    NotAnError(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
