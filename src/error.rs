use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MareaError>;

#[derive(Debug, Error)]
pub enum MareaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("operation interrupted: {0}")]
    Interrupted(&'static str),
    #[error("shutdown timed out: {0}")]
    ShutdownTimeout(&'static str),
}
