//! Structural constants of the tree.
//!
//! All of them are fixed for the lifetime of a tree: split thresholds and
//! child indices are laid out against `branch_factor` and
//! `levels_per_node`, and leaf distance tables against `path_length`.

use crate::error::{MvpError, Result};

/// Upper bound on `fanout()`; child tables are allocated densely.
const MAX_FANOUT: usize = 1 << 20;

/// Shape of an MVP tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MvpConfig {
    /// Buckets each internal level splits into.
    pub branch_factor: usize,
    /// Vantage points held by a leaf.
    pub path_length: usize,
    /// Points a leaf stores in addition to its vantage points.
    pub leaf_cap: usize,
    /// Vantage points (levels) of an internal node.
    pub levels_per_node: usize,
    /// Buffered arrivals that trigger an automatic flush.
    pub sync_threshold: usize,
}

impl Default for MvpConfig {
    fn default() -> Self {
        Self {
            branch_factor: 2,
            path_length: 16,
            leaf_cap: 100,
            levels_per_node: 6,
            sync_threshold: 500,
        }
    }
}

impl MvpConfig {
    /// Number of child slots of an internal node: `branch_factor ^ levels_per_node`.
    #[inline]
    pub fn fanout(&self) -> usize {
        self.branch_factor.pow(self.levels_per_node as u32)
    }

    /// Buckets at the last level of an internal node: `branch_factor ^ (levels_per_node - 1)`.
    #[inline]
    pub fn num_splits(&self) -> usize {
        self.branch_factor.pow(self.levels_per_node.saturating_sub(1) as u32)
    }

    /// Largest point set that still becomes (or stays) a leaf.
    #[inline]
    pub(crate) fn leaf_limit(&self) -> usize {
        self.leaf_cap + self.path_length
    }

    pub fn validate(&self) -> Result<()> {
        if self.branch_factor < 2 {
            return Err(MvpError::InvalidConfig("branch_factor must be at least 2"));
        }
        if self.path_length == 0 {
            return Err(MvpError::InvalidConfig("path_length must be non-zero"));
        }
        if self.leaf_cap == 0 {
            return Err(MvpError::InvalidConfig("leaf_cap must be non-zero"));
        }
        if self.levels_per_node == 0 {
            return Err(MvpError::InvalidConfig("levels_per_node must be non-zero"));
        }
        if self.sync_threshold == 0 {
            return Err(MvpError::InvalidConfig("sync_threshold must be non-zero"));
        }
        // A leaf is promoted once it would exceed leaf_limit(), so the new
        // internal node always sees more points than that.
        if self.levels_per_node > self.leaf_limit() {
            return Err(MvpError::InvalidConfig(
                "levels_per_node must not exceed leaf_cap + path_length",
            ));
        }
        let fanout = (0..self.levels_per_node).try_fold(1usize, |acc, _| {
            acc.checked_mul(self.branch_factor)
                .filter(|&f| f <= MAX_FANOUT)
        });
        if fanout.is_none() {
            return Err(MvpError::InvalidConfig(
                "branch_factor ^ levels_per_node is too large",
            ));
        }
        Ok(())
    }
}
