//! Recording format errors.

use std::path::PathBuf;

use magnetite_types::ErrorCode;
use thiserror::Error;

/// Errors produced while writing or reading recording files.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("cannot open recording file {path}: {source}")]
    CannotOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot write recording file {path}: {source}")]
    CannotWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("bad magic number: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("unsupported format version {version}")]
    UnsupportedVersion { version: u32 },

    #[error("truncated entry")]
    Truncated,

    #[error("unknown entry type {tag:#04x}")]
    UnknownEntryType { tag: u8 },

    #[error("topic id {id} out of range (table has {table_len} entries)")]
    TopicIdOutOfRange { id: u16, table_len: usize },

    #[error("topic table full: {0} topics already interned")]
    TopicTableFull(usize),

    #[error("payload codec failure: {0}")]
    Codec(#[from] postcard::Error),
}

impl RecordError {
    /// Maps onto the wire-stable error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            RecordError::CannotOpen { .. } => ErrorCode::CannotOpenFile,
            RecordError::CannotWrite { .. } | RecordError::TopicTableFull(_) => {
                ErrorCode::CannotWriteFile
            }
            RecordError::BadMagic { .. } => ErrorCode::BadMagic,
            RecordError::UnsupportedVersion { .. } => ErrorCode::UnsupportedVersion,
            RecordError::Truncated
            | RecordError::UnknownEntryType { .. }
            | RecordError::TopicIdOutOfRange { .. }
            | RecordError::Codec(_) => ErrorCode::FormatTruncated,
        }
    }
}
