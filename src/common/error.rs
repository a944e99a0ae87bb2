use thiserror::Error;

/// Engine error types.
///
/// Only recoverable setup and teardown failures surface here. Invariant
/// breaches (missing PID during unfix, frame back-pointer mismatch, page
/// table probe overflow) abort the process with a source-located panic, and
/// transient restart conditions never leave the buffer manager.
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, KeelError>;
