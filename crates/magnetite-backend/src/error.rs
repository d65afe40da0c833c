//! Backend error types.

use magnetite_types::{Data, DataKind, ErrorCode};
use thiserror::Error;

/// Errors produced by store backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The key is absent (or expired).
    #[error("no such key: {0}")]
    NoSuchKey(Data),

    /// Operand types are incompatible for the requested operation.
    #[error("type clash: cannot {op} {delta:?} onto {existing:?}")]
    TypeClash {
        op: &'static str,
        existing: DataKind,
        delta: DataKind,
    },

    /// SQLite-level failure.
    #[error("sqlite failure: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Key or value blob failed to encode/decode.
    #[error("codec failure: {0}")]
    Codec(#[from] postcard::Error),
}

impl BackendError {
    /// Maps onto the wire-stable error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            BackendError::NoSuchKey(_) => ErrorCode::NoSuchKey,
            BackendError::TypeClash { .. } => ErrorCode::TypeClash,
            BackendError::Sqlite(_) | BackendError::Codec(_) => ErrorCode::BackendFailure,
        }
    }
}
