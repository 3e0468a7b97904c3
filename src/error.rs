use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found")]
    NotFound,

    #[error("insufficient free space in page")]
    InsufficientFreeSpace,

    #[error("no unfull page")]
    NoUnfullPage,

    #[error("insert retry budget exhausted")]
    UnreachableRetry,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DbError>;
