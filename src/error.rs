//! Structured error handling for the engine.
//!
//! One crate-wide error enum keeps the failure taxonomy visible:
//! configuration, connectivity, data, protocol and logic failures, plus
//! transparent wrappers for the I/O and serialization layers underneath.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SluiceError {
    /// Missing target/resource, invalid action, malformed definition.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unreachable backend, authentication failure, lost session.
    #[error("connect error: {0}")]
    Connect(String),

    /// A push failed part-way through; `position` is the 0-based offset of
    /// the first failing record, counted from the start of the operation.
    #[error("data error at position {position}: {reason}")]
    Data { position: usize, reason: String },

    /// Malformed spool descriptor or payload backup file.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed pipe target, runaway module chain and similar wiring faults.
    #[error("logic error: {0}")]
    Logic(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("ftp error: {0}")]
    Ftp(String),
}

impl SluiceError {
    /// Position of the first failing record when this is a data error.
    pub fn error_position(&self) -> Option<usize> {
        match self {
            SluiceError::Data { position, .. } => Some(*position),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SluiceError>;
