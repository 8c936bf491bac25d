use std::fmt;

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// Correlation id linking a request to its reply.
///
/// JSON-RPC allows numbers and strings; fractional numbers and structured
/// values are rejected at decode time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
}

impl Id {
    /// Interpret the raw `id` member of an envelope.
    ///
    /// `Ok(None)` means the id was absent or `null`; `Err(())` means it was
    /// present but not a usable correlation id.
    pub(crate) fn from_member(value: Option<&Value>) -> Result<Option<Self>, ()> {
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(Self::String(s.clone()))),
            Some(Value::Number(n)) => n.as_i64().map(Self::Number).map(Some).ok_or(()),
            Some(_) => Err(()),
        }
    }

    /// Best-effort id recovery from a malformed envelope, used so protocol
    /// errors can still be correlated.
    pub(crate) fn salvage(value: Option<&Value>) -> Option<Self> {
        Self::from_member(value).ok().flatten()
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}
