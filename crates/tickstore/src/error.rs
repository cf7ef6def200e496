//! Error and Result types for tickstore operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for tickstore operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The error type for storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A segment file's header or structure did not parse.
    #[error("Corrupt segment {path}: {reason}")]
    CorruptSegment {
        /// Path of the offending segment file.
        path: PathBuf,
        /// What failed to parse.
        reason: String,
    },

    /// A compressed payload's framing was inconsistent.
    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}
