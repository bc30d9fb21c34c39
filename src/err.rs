#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect() called while already connected")]
    AlreadyConnected,

    #[error("handshake did not complete within {0} attempts")]
    HandshakeFailed(u32),

    #[error("shutdown did not complete within {0} attempts")]
    ShutdownFailed(u32),

    #[error("connection is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
