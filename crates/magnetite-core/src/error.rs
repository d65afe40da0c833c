//! Core error types.

use magnetite_types::{ErrorCode, NetworkInfo};
use thiserror::Error;

/// Errors surfaced by the router and its actors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid peer {info}")]
    PeerInvalid { info: NetworkInfo },

    #[error("peer {info} unavailable: {reason}")]
    PeerUnavailable { info: NetworkInfo, reason: String },

    #[error("peer {info} timed out")]
    PeerTimeout { info: NetworkInfo },

    #[error("peer speaks protocol version {version}, expected {expected}")]
    PeerIncompatible { version: u32, expected: u32 },

    #[error("no master for store {name}")]
    NoSuchMaster { name: String },

    #[error("no clone for store {name}")]
    NoSuchClone { name: String },

    #[error("store backend: {0}")]
    Backend(#[from] magnetite_backend::BackendError),

    #[error("store replied with {0}")]
    Store(ErrorCode),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame codec failure: {0}")]
    Codec(#[from] postcard::Error),

    #[error("oversized frame: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("core is shutting down")]
    ShuttingDown,
}

impl CoreError {
    /// Maps onto the wire-stable error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::PeerInvalid { .. } => ErrorCode::PeerInvalid,
            CoreError::PeerUnavailable { .. } => ErrorCode::PeerUnavailable,
            CoreError::PeerTimeout { .. } => ErrorCode::PeerTimeout,
            CoreError::PeerIncompatible { .. } => ErrorCode::PeerIncompatible,
            CoreError::NoSuchMaster { .. } => ErrorCode::NoSuchMaster,
            CoreError::NoSuchClone { .. } => ErrorCode::NoSuchClone,
            CoreError::Backend(err) => err.code(),
            CoreError::Store(code) => *code,
            CoreError::Io(_) | CoreError::Tls(_) => ErrorCode::PeerUnavailable,
            CoreError::Codec(_) | CoreError::FrameTooLarge { .. } => ErrorCode::PeerIncompatible,
            CoreError::ShuttingDown => ErrorCode::ShuttingDown,
        }
    }
}
