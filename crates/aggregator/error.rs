//! Error types for the state archive.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no active kv transaction, call set_tx first")]
    NoActiveTransaction,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt segment {path}: {reason}")]
    CorruptSegment { path: PathBuf, reason: String },

    #[error("corrupt segment index {path}: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },

    #[error("snappy codec error: {0}")]
    Codec(#[from] snap::Error),

    #[error("bitmap decode error: {0}")]
    Bitmap(String),

    #[error("tx range [{start}, {end}) is not aligned to step {step}")]
    UnalignedRange { start: u64, end: u64, step: u64 },

    #[error("archive was created with aggregation step {found}, opened with {expected}")]
    StepMismatch { found: u64, expected: u64 },

    #[error("incompatible archive schema version: found {found}, expected {expected}")]
    IncompatibleSchemaVersion { found: u64, expected: u64 },

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("{0}")]
    Custom(String),
}
