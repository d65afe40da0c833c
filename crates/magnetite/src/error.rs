//! Facade error type.

use magnetite_core::CoreError;
use magnetite_types::ErrorCode;
use thiserror::Error;

/// Result alias for endpoint operations.
pub type Result<T> = std::result::Result<T, EndpointError>;

/// Errors surfaced by the [`Endpoint`](crate::Endpoint) facade.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// TLS is required by configuration but no certificate material was
    /// provided. Fatal at construction.
    #[error("TLS required but not configured; set disable_ssl or provide tls certificates")]
    TlsRequired,

    /// The runtime failed to come up.
    #[error("runtime: {0}")]
    Io(#[from] std::io::Error),

    /// The core reported a failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A store reported a failure.
    #[error("store: {0}")]
    Store(ErrorCode),

    /// The endpoint was already shut down.
    #[error("endpoint is shut down")]
    ShutDown,
}

impl EndpointError {
    /// Maps onto the wire-stable error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            EndpointError::TlsRequired | EndpointError::Io(_) => ErrorCode::Unspecified,
            EndpointError::Core(err) => err.code(),
            EndpointError::Store(code) => *code,
            EndpointError::ShutDown => ErrorCode::ShuttingDown,
        }
    }
}

impl From<ErrorCode> for EndpointError {
    fn from(code: ErrorCode) -> Self {
        EndpointError::Store(code)
    }
}
