//! Error type of the index.

use mvp_rs::MvpError;
use thiserror::Error;

/// Errors surfaced by [`FingerprintIndex`](crate::FingerprintIndex).
#[derive(Debug, Error)]
pub enum IndexError {
    /// Tree-level failure. A failed flush arrives as
    /// [`MvpError::BatchRolledBack`] listing the points it dropped.
    #[error("tree: {0}")]
    Tree(#[from] MvpError),

    /// Id string is not a signed 64-bit integer.
    #[error("unable to parse id value {0:?}")]
    InvalidId(String),

    /// Radius string is not a finite, non-negative number.
    #[error("invalid radius {0:?}: expected a finite, non-negative number")]
    InvalidRadius(String),

    /// Fingerprint string is not an unsigned 64-bit integer.
    #[error("unable to parse fingerprint {0:?}")]
    InvalidFingerprint(String),

    /// Saved index written with an unknown encoding version.
    #[error("unsupported encoding version {0}")]
    UnsupportedEncoding(u8),

    /// Reading or writing a saved index failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IndexError {
    /// `(id, fingerprint)` pairs dropped by a failed flush. Empty for any
    /// other error.
    pub fn dropped_points(&self) -> &[(i64, u64)] {
        match self {
            IndexError::Tree(err) => err.dropped(),
            _ => &[],
        }
    }
}

/// Result alias for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;
