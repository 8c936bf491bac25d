/// Failures inside the server runtime (not wire errors; those are
/// [`switchyard_protocol::RpcError`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] switchyard_protocol::Error),

    #[error("blocking handler failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("blocking handler panicked")]
    WorkerPanicked,

    #[error("worker pool is shut down")]
    WorkerPoolClosed,

    #[error("topic name must not be empty")]
    InvalidTopic,

    #[error("outbound buffer of connection {0} is full")]
    BufferFull(String),

    #[error("delivery to connection {0} timed out")]
    DeliveryTimeout(String),

    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    #[error("blocking bridge needs a worker pool thread")]
    BlockingBridgeUnavailable,

    #[error(transparent)]
    Call(#[from] switchyard_protocol::CallError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
