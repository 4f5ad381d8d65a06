use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("queue stopped")]
    Stopped,
    #[error("queue failed: {0}")]
    Failed(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
