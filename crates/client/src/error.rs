use {
    switchyard_protocol::{CallError, RpcError},
    tokio_tungstenite::tungstenite,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("websocket connect failed: {0}")]
    Connect(Box<tungstenite::Error>),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported url scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),

    #[error("not connected and no url configured")]
    NotConnected,

    #[error("token is not a valid header value")]
    InvalidToken,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Protocol(#[from] switchyard_protocol::Error),
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        Self::Connect(Box::new(err))
    }
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        Self::Call(CallError::Rpc(err))
    }
}

impl Error {
    /// The structured error the server replied with, if that is what failed.
    pub fn rpc(&self) -> Option<&RpcError> {
        match self {
            Self::Call(CallError::Rpc(err)) => Some(err),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Call(CallError::Timeout(_)))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
