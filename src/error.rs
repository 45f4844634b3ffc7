use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The target event loop has stopped and dropped its task queue.
    #[error("event loop is not running")]
    LoopStopped,

    #[error("envelope encode failed: {0}")]
    Encode(String),

    #[error("invalid listen address: {0}")]
    InvalidAddress(String),

    #[error("server already started")]
    AlreadyStarted,
}
