//! Shared error type for the common crate.

use thiserror::Error;

/// Errors produced by identity, signing, and serialization helpers.
#[derive(Debug, Error)]
pub enum CommonError {
    /// Key material could not be parsed, generated, or used.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// JSON encode/decode failure.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Filesystem failure (key file, journal file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
