use std::path::PathBuf;

/// Errors produced by fingerprinting and cache management.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid fingerprint {value:?}: expected 64 lowercase hex characters")]
    InvalidFingerprint { value: String },

    #[error("cache path {path} has no parent directory")]
    MissingParent { path: PathBuf },
}
