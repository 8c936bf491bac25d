//! Structured JSON-RPC errors and the code → kind lookup table.
//!
//! The table is the single source of truth for which codes may appear on the
//! wire. It starts with the five standard codes plus the reserved
//! `-32099..=-32000` server range and can be extended at runtime with
//! [`register_error_code`]; every registration publishes a rebuilt snapshot,
//! so readers never observe a half-updated table.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, LazyLock, PoisonError, RwLock},
};

use serde_json::Value;

use crate::{Error, Id, codes};

// ── Kinds ────────────────────────────────────────────────────────────────────

/// Classification of a JSON-RPC error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    /// Application-defined error: the reserved server range or a code added
    /// with [`register_error_code`].
    ServerDefined(i64),
}

impl ErrorKind {
    pub const fn code(self) -> i64 {
        match self {
            Self::ParseError => codes::PARSE_ERROR,
            Self::InvalidRequest => codes::INVALID_REQUEST,
            Self::MethodNotFound => codes::METHOD_NOT_FOUND,
            Self::InvalidParams => codes::INVALID_PARAMS,
            Self::InternalError => codes::INTERNAL_ERROR,
            Self::ServerDefined(code) => code,
        }
    }

    /// Resolve a wire code through the current error table.
    pub fn from_code(code: i64) -> Option<Self> {
        error_table().kind(code)
    }

    /// Default human-readable message for this kind.
    pub fn default_message(self) -> String {
        error_table()
            .message(self.code())
            .unwrap_or("Server error")
            .to_owned()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParseError => f.write_str("parse error"),
            Self::InvalidRequest => f.write_str("invalid request"),
            Self::MethodNotFound => f.write_str("method not found"),
            Self::InvalidParams => f.write_str("invalid params"),
            Self::InternalError => f.write_str("internal error"),
            Self::ServerDefined(code) => write!(f, "server error {code}"),
        }
    }
}

// ── Lookup table ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ErrorEntry {
    kind: ErrorKind,
    message: String,
}

/// Immutable snapshot mapping wire codes to error kinds.
#[derive(Debug, Clone)]
pub struct ErrorTable {
    entries: HashMap<i64, ErrorEntry>,
}

impl ErrorTable {
    /// The JSON-RPC 2.0 standard table.
    pub fn standard() -> Self {
        let mut entries = HashMap::new();
        let standard = [
            (ErrorKind::ParseError, "Invalid JSON was received"),
            (ErrorKind::InvalidRequest, "Invalid request"),
            (ErrorKind::MethodNotFound, "Method not found"),
            (ErrorKind::InvalidParams, "Invalid params"),
            (ErrorKind::InternalError, "Internal error"),
        ];
        for (kind, message) in standard {
            entries.insert(kind.code(), ErrorEntry {
                kind,
                message: message.to_owned(),
            });
        }
        for code in codes::SERVER_ERROR_MIN..=codes::SERVER_ERROR_MAX {
            entries.insert(code, ErrorEntry {
                kind: ErrorKind::ServerDefined(code),
                message: "Server error".to_owned(),
            });
        }
        Self { entries }
    }

    pub fn kind(&self, code: i64) -> Option<ErrorKind> {
        self.entries.get(&code).map(|e| e.kind)
    }

    pub fn message(&self, code: i64) -> Option<&str> {
        self.entries.get(&code).map(|e| e.message.as_str())
    }

    pub fn contains(&self, code: i64) -> bool {
        self.entries.contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return a copy of this table with `code` registered as a server-defined
    /// kind. The five standard codes cannot be redefined.
    pub fn with_code(&self, code: i64, message: impl Into<String>) -> crate::Result<Self> {
        if matches!(
            self.kind(code),
            Some(kind) if !matches!(kind, ErrorKind::ServerDefined(_))
        ) {
            return Err(Error::ReservedErrorCode(code));
        }
        let mut next = self.clone();
        next.entries.insert(code, ErrorEntry {
            kind: ErrorKind::ServerDefined(code),
            message: message.into(),
        });
        Ok(next)
    }
}

impl Default for ErrorTable {
    fn default() -> Self {
        Self::standard()
    }
}

static TABLE: LazyLock<RwLock<Arc<ErrorTable>>> =
    LazyLock::new(|| RwLock::new(Arc::new(ErrorTable::standard())));

/// Current process-wide error table snapshot.
pub fn error_table() -> Arc<ErrorTable> {
    Arc::clone(&TABLE.read().unwrap_or_else(PoisonError::into_inner))
}

/// Register an application error code so peers may send it and decoding
/// recognises it. Re-registering a server-defined code replaces its message.
pub fn register_error_code(code: i64, message: impl Into<String>) -> crate::Result<()> {
    let mut table = TABLE.write().unwrap_or_else(PoisonError::into_inner);
    let rebuilt = table.with_code(code, message)?;
    *table = Arc::new(rebuilt);
    tracing::debug!(code, "registered error code");
    Ok(())
}

// ── Structured error ─────────────────────────────────────────────────────────

/// A structured JSON-RPC error, raised by handlers and reconstructed from
/// inbound `Error` envelopes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} ({})", .kind.code())]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
    pub data: Option<Value>,
    /// Correlation id carried by the error, used when no explicit id is
    /// supplied at encode time.
    pub id: Option<Id>,
}

impl RpcError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: kind.default_message(),
            data: None,
            id: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(ErrorKind::ParseError)
    }

    pub fn invalid_request() -> Self {
        Self::new(ErrorKind::InvalidRequest)
    }

    pub fn method_not_found() -> Self {
        Self::new(ErrorKind::MethodNotFound)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams).with_message(message)
    }

    pub fn internal() -> Self {
        Self::new(ErrorKind::InternalError)
    }

    /// Application error with a caller-chosen code and message.
    pub fn server_defined(code: i64, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerDefined(code)).with_message(message)
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: Option<Id>) -> Self {
        self.id = id;
        self
    }

    pub const fn code(&self) -> i64 {
        self.kind.code()
    }

    /// Whether a handler raising this error should see it forwarded to the
    /// caller verbatim. Everything else is reported as an opaque internal
    /// error.
    pub const fn is_forwardable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::InvalidRequest | ErrorKind::InvalidParams | ErrorKind::ServerDefined(_)
        )
    }
}
