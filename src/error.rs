//! Encoder error types. Every kind is terminal; nothing is retried.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("io error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The invalid-delta ratio exceeded the acceptance threshold after
    /// grouping, usually a sign of corrupted timestamps in the input.
    #[error("too many invalid timestamps: {invalid} of {total} records")]
    TooManyInvalid { invalid: u64, total: u64 },

    /// The trails file offset reached the 32-bit format cap. This is a
    /// deliberate format limit; the producer fails instead of rolling over.
    #[error("trails file over 4GB (offset {offset})")]
    TrailsTooLarge { offset: u64 },

    #[error("codebook build failed: {0}")]
    Codebook(String),
}

impl EncodeError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        EncodeError::Io { path: path.to_path_buf(), source }
    }
}
