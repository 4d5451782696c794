use thiserror::Error;

/// Errors raised by the tree.
///
/// The structural variants (`LeafOverflow`, `IncompleteCollation`,
/// `TooFewVantagePoints`, `ChildIndexOutOfRange`) mean an internal invariant
/// broke while placing a batch. A flush that hits one rolls the batch back
/// and reports it wrapped in `BatchRolledBack`.
#[derive(Debug, Error)]
pub enum MvpError {
    #[error("leaf capacity exceeded: {stored} stored + {incoming} incoming > {capacity}")]
    LeafOverflow {
        stored: usize,
        incoming: usize,
        capacity: usize,
    },

    #[error("bucket {bucket} at level {level} not fully collated ({unassigned} points left)")]
    IncompleteCollation {
        level: usize,
        bucket: usize,
        unassigned: usize,
    },

    #[error("internal node needs {needed} vantage points, only {available} available")]
    TooFewVantagePoints { needed: usize, available: usize },

    #[error("child index {index} out of range (fanout {fanout})")]
    ChildIndexOutOfRange { index: usize, fanout: usize },

    #[error("batch of {} points rolled back: {source}", .dropped.len())]
    BatchRolledBack {
        source: Box<MvpError>,
        /// `(id, fingerprint)` of every point the batch held. None of them
        /// is indexed any more.
        dropped: Vec<(i64, u64)>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("snapshot truncated: expected {expected} entries, read {actual}")]
    SnapshotTruncated { expected: u64, actual: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MvpError {
    /// Points dropped by a rolled-back batch; empty for every other error.
    pub fn dropped(&self) -> &[(i64, u64)] {
        match self {
            MvpError::BatchRolledBack { dropped, .. } => dropped,
            _ => &[],
        }
    }

    /// The error beneath any rollback wrapper.
    pub fn cause(&self) -> &MvpError {
        match self {
            MvpError::BatchRolledBack { source, .. } => source.cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, MvpError>;
