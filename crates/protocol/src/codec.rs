//! Envelope classification, validation and serialization.

use {
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

use crate::{Error, ErrorKind, Id, JSONRPC_VERSION, RpcError, error_table};

// ── Messages ─────────────────────────────────────────────────────────────────

/// The `error` member of an `Error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A validated JSON-RPC 2.0 envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: Id,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Result {
        id: Option<Id>,
        value: Value,
    },
    Error {
        id: Option<Id>,
        error: ErrorObject,
    },
}

impl Message {
    pub fn id(&self) -> Option<&Id> {
        match self {
            Self::Request { id, .. } => Some(id),
            Self::Result { id, .. } | Self::Error { id, .. } => id.as_ref(),
            Self::Notification { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Result { .. } | Self::Error { .. } => None,
        }
    }

    /// Parameters of a method-bearing envelope (`null` when absent).
    pub fn params(&self) -> &Value {
        match self {
            Self::Request { params, .. } | Self::Notification { params, .. } => params,
            Self::Result { .. } | Self::Error { .. } => &Value::Null,
        }
    }

    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Notification { .. } => "notification",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
        }
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Whether a raw frame is shaped like a reply: a JSON object with a
/// `result` or `error` member. Such frames are never answered, even when
/// they fail to decode.
pub fn is_reply(raw: &str) -> bool {
    serde_json::from_str::<Map<String, Value>>(raw)
        .is_ok_and(|envelope| envelope.contains_key("result") || envelope.contains_key("error"))
}

/// Parse and classify one raw frame.
///
/// Malformed JSON yields `ParseError`; every structural violation yields
/// `InvalidRequest` carrying whatever id could be recovered.
pub fn decode(raw: &str) -> Result<Message, RpcError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| RpcError::parse_error())?;
    let Value::Object(mut envelope) = value else {
        return Err(RpcError::invalid_request());
    };

    let salvaged_id = Id::salvage(envelope.get("id"));
    let invalid = || RpcError::invalid_request().with_id(salvaged_id.clone());

    if envelope.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(invalid());
    }

    let present = ["method", "result", "error"]
        .iter()
        .filter(|key| envelope.contains_key(**key))
        .count();
    if present != 1 {
        return Err(invalid());
    }

    let id = Id::from_member(envelope.get("id")).map_err(|()| invalid())?;

    if let Some(method) = envelope.remove("method") {
        let Value::String(method) = method else {
            return Err(invalid());
        };
        let params = envelope.remove("params").unwrap_or(Value::Null);
        return Ok(match id {
            Some(id) => Message::Request { id, method, params },
            None => Message::Notification { method, params },
        });
    }

    // Replies must carry the id member, even if it is null.
    if !envelope.contains_key("id") {
        return Err(invalid());
    }

    if let Some(value) = envelope.remove("result") {
        return Ok(Message::Result { id, value });
    }

    let Some(Value::Object(error)) = envelope.remove("error") else {
        return Err(invalid());
    };
    let error = decode_error_object(error).ok_or_else(invalid)?;
    Ok(Message::Error { id, error })
}

fn decode_error_object(mut error: Map<String, Value>) -> Option<ErrorObject> {
    let code = error.get("code")?.as_i64()?;
    let message = match error.remove("message")? {
        Value::String(message) => message,
        _ => return None,
    };
    if !error_table().contains(code) {
        return None;
    }
    let data = match error.remove("data") {
        None | Some(Value::Null) => None,
        Some(data) => Some(data),
    };
    Some(ErrorObject {
        code,
        message,
        data,
    })
}

/// Rebuild the structured error carried by an inbound `Error` envelope.
pub fn decode_error(message: &Message) -> crate::Result<RpcError> {
    let Message::Error { id, error } = message else {
        return Err(Error::NotAnError(message.kind_name()));
    };
    let kind = ErrorKind::from_code(error.code).ok_or(Error::UnknownErrorCode(error.code))?;
    Ok(RpcError {
        kind,
        message: error.message.clone(),
        data: error.data.clone(),
        id: id.clone(),
    })
}

// ── Encoding ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a Id>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct ResultEnvelope<'a> {
    jsonrpc: &'static str,
    id: Option<&'a Id>,
    result: &'a Value,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a Id>,
    error: ErrorObject,
}

/// Encode a request; without an id this is a notification.
pub fn encode_request(method: &str, id: Option<&Id>, params: Option<&Value>) -> crate::Result<String> {
    Ok(serde_json::to_string(&RequestEnvelope {
        jsonrpc: JSONRPC_VERSION,
        id,
        method,
        params,
    })?)
}

pub fn encode_notification(method: &str, params: Option<&Value>) -> crate::Result<String> {
    encode_request(method, None, params)
}

pub fn encode_result(id: Option<&Id>, value: &Value) -> crate::Result<String> {
    Ok(serde_json::to_string(&ResultEnvelope {
        jsonrpc: JSONRPC_VERSION,
        id,
        result: value,
    })?)
}

/// Encode an error envelope. An explicit `id` wins over the id carried by the
/// error; `data` is omitted when absent. Codes missing from the error table
/// are refused.
pub fn encode_error(error: &RpcError, id: Option<&Id>) -> crate::Result<String> {
    let code = error.code();
    if !error_table().contains(code) {
        return Err(Error::UnknownErrorCode(code));
    }
    Ok(serde_json::to_string(&ErrorEnvelope {
        jsonrpc: JSONRPC_VERSION,
        id: id.or(error.id.as_ref()),
        error: ErrorObject {
            code,
            message: error.message.clone(),
            data: error.data.clone(),
        },
    })?)
}
