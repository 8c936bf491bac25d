//! Method descriptors: a handler plus the parameter metadata needed to bind
//! positional or named JSON-RPC params before invocation.

use std::{fmt, future::Future, sync::Arc};

use {
    futures::{FutureExt, future::BoxFuture},
    serde::de::DeserializeOwned,
    serde_json::{Map, Value},
    switchyard_protocol::{CallError, RpcError},
};

use crate::{
    auth::{Credentials, Requirements},
    context::RequestContext,
};

pub use switchyard_protocol::qualified_name;

// ── Handler errors ───────────────────────────────────────────────────────────

/// What a handler may fail with.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// A structured error. `InvalidRequest`, `InvalidParams` and server-defined
    /// kinds reach the caller verbatim; other kinds are reported as internal.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Anything unexpected. Logged with full detail, never put on the wire.
    #[error(transparent)]
    Internal(anyhow::Error),
}

impl HandlerError {
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Self::Internal(err.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<switchyard_protocol::Error> for HandlerError {
    fn from(err: switchyard_protocol::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<CallError> for HandlerError {
    fn from(err: CallError) -> Self {
        Self::Internal(err.into())
    }
}

impl From<crate::Error> for HandlerError {
    fn from(err: crate::Error) -> Self {
        Self::Internal(err.into())
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

// ── Validators ───────────────────────────────────────────────────────────────

/// JSON value kinds usable as type validators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    Null,
    Bool,
    Number,
    Integer,
    String,
    Array,
    Object,
}

impl JsonKind {
    pub fn matches(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Null, Value::Null)
            | (Self::Bool, Value::Bool(_))
            | (Self::Number, Value::Number(_))
            | (Self::String, Value::String(_))
            | (Self::Array, Value::Array(_))
            | (Self::Object, Value::Object(_)) => true,
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            _ => false,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "boolean",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for JsonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Per-parameter check run after binding.
#[derive(Clone)]
pub enum Validator {
    Kind(JsonKind),
    Predicate(Predicate),
}

impl Validator {
    pub fn predicate(f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    fn check(&self, name: &str, value: &Value) -> Result<(), RpcError> {
        match self {
            Self::Kind(kind) if !kind.matches(value) => Err(RpcError::invalid_params(format!(
                "'{name}' has to be '{kind}'"
            ))),
            Self::Predicate(f) if !f(value) => Err(RpcError::invalid_params(format!(
                "'{name}': validation error"
            ))),
            _ => Ok(()),
        }
    }
}

impl From<JsonKind> for Validator {
    fn from(kind: JsonKind) -> Self {
        Self::Kind(kind)
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind(kind) => f.debug_tuple("Kind").field(kind).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

// ── Bound params ─────────────────────────────────────────────────────────────

/// Parameters after binding: every declared name is present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Deserialize one bound parameter. A shape mismatch is the caller's
    /// fault, so it surfaces as `InvalidParams`.
    pub fn parse<T: DeserializeOwned>(&self, name: &str) -> Result<T, RpcError> {
        let value = self.0.get(name).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| RpcError::invalid_params(format!("'{name}': {e}")))
    }

    /// Deserialize all bound parameters into one struct.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| RpcError::invalid_params(e.to_string()))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ── Handler input ────────────────────────────────────────────────────────────

/// What a handler is invoked with.
#[derive(Clone)]
pub struct Request {
    params: Params,
    context: Option<RequestContext>,
}

impl Request {
    pub fn new(params: Params, context: Option<RequestContext>) -> Self {
        Self { params, context }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param<T: DeserializeOwned>(&self, name: &str) -> Result<T, RpcError> {
        self.params.parse(name)
    }

    pub fn context(&self) -> Option<&RequestContext> {
        self.context.as_ref()
    }

    /// The connection context; fails for methods registered `context_free`.
    pub fn ctx(&self) -> Result<&RequestContext, HandlerError> {
        self.context.as_ref().ok_or_else(|| {
            HandlerError::internal(anyhow::anyhow!(
                "method was registered without connection context"
            ))
        })
    }

    pub fn into_parts(self) -> (Params, Option<RequestContext>) {
        (self.params, self.context)
    }
}

type AsyncHandler = dyn Fn(Request) -> BoxFuture<'static, HandlerResult> + Send + Sync;
type BlockingHandler = dyn Fn(Request) -> HandlerResult + Send + Sync;

/// The callable behind a method.
#[derive(Clone)]
pub enum Handler {
    /// Runs on the connection's task.
    Async(Arc<AsyncHandler>),
    /// Runs on the worker pool so it cannot stall the receive loop.
    Blocking(Arc<BlockingHandler>),
}

impl Handler {
    pub const fn is_blocking(&self) -> bool {
        matches!(self, Self::Blocking(_))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Async(_) => "Handler::Async",
            Self::Blocking(_) => "Handler::Blocking",
        })
    }
}

// ── Descriptor ───────────────────────────────────────────────────────────────

/// A registered method: handler, parameter shape, validators and access
/// requirements. Built once at registration and shared immutably after.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    name: String,
    handler: Handler,
    /// Declaration order, used for positional binding.
    order: Vec<String>,
    required: Vec<String>,
    optional: Vec<(String, Value)>,
    wants_context: bool,
    raw_response: bool,
    validators: Vec<(String, Validator)>,
    requirements: Requirements,
}

impl MethodDescriptor {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::with_handler(
            name,
            Handler::Async(Arc::new(move |request| handler(request).boxed())),
        )
    }

    pub fn blocking<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> HandlerResult + Send + Sync + 'static,
    {
        Self::with_handler(name, Handler::Blocking(Arc::new(handler)))
    }

    pub fn with_handler(name: impl Into<String>, handler: Handler) -> Self {
        Self {
            name: name.into(),
            handler,
            order: Vec::new(),
            required: Vec::new(),
            optional: Vec::new(),
            wants_context: true,
            raw_response: false,
            validators: Vec::new(),
            requirements: Requirements::default(),
        }
    }

    /// Declare a required parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.order.push(name.clone());
        self.required.push(name);
        self
    }

    /// Declare an optional parameter filled with `default` when absent.
    #[must_use]
    pub fn param_default(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        let name = name.into();
        self.order.push(name.clone());
        self.optional.push((name, default.into()));
        self
    }

    #[must_use]
    pub fn validate(mut self, name: impl Into<String>, validator: impl Into<Validator>) -> Self {
        self.validators.push((name.into(), validator.into()));
        self
    }

    /// The handler returns a complete envelope; send it verbatim.
    #[must_use]
    pub fn raw_response(mut self) -> Self {
        self.raw_response = true;
        self
    }

    /// Invoke the handler without a [`RequestContext`].
    #[must_use]
    pub fn context_free(mut self) -> Self {
        self.wants_context = false;
        self
    }

    #[must_use]
    pub fn login_required(mut self) -> Self {
        self.requirements = self.requirements.login_required();
        self
    }

    #[must_use]
    pub fn permission_required(mut self, permission: impl Into<String>) -> Self {
        self.requirements = self.requirements.permission_required(permission);
        self
    }

    #[must_use]
    pub fn user_test(mut self, test: impl Fn(&Credentials) -> bool + Send + Sync + 'static) -> Self {
        self.requirements = self.requirements.user_test(test);
        self
    }

    #[must_use]
    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn optional(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.optional.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub const fn wants_context(&self) -> bool {
        self.wants_context
    }

    pub const fn is_raw_response(&self) -> bool {
        self.raw_response
    }

    pub fn requirements(&self) -> &Requirements {
        &self.requirements
    }

    /// Bind raw JSON-RPC params against the declared parameters.
    ///
    /// `null` binds nothing, an array binds by position (extra items are
    /// dropped), an object binds by name (undeclared names are dropped) and
    /// any other value binds as a single positional argument.
    pub fn bind(&self, raw: &Value) -> Result<Params, RpcError> {
        let mut supplied: Map<String, Value> = match raw {
            Value::Null => Map::new(),
            Value::Object(named) => named
                .iter()
                .filter(|(name, _)| self.order.contains(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            Value::Array(positional) => self
                .order
                .iter()
                .cloned()
                .zip(positional.iter().cloned())
                .collect(),
            scalar => self
                .order
                .iter()
                .take(1)
                .cloned()
                .zip(std::iter::once(scalar.clone()))
                .collect(),
        };

        let mut bound = Map::new();
        for name in &self.required {
            let Some(value) = supplied.remove(name) else {
                return Err(RpcError::invalid_params("too few arguments"));
            };
            bound.insert(name.clone(), value);
        }
        for (name, default) in &self.optional {
            let value = supplied.remove(name).unwrap_or_else(|| default.clone());
            bound.insert(name.clone(), value);
        }

        for (name, validator) in &self.validators {
            if let Some(value) = bound.get(name) {
                validator.check(name, value)?;
            }
        }

        Ok(Params(bound))
    }
}
