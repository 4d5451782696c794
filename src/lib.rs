//! # mvp-rs
//!
//! A Multi-Vantage-Point (MVP) tree for radius search over 64-bit
//! fingerprints, such as perceptual image hashes compared by Hamming
//! distance.
//!
//! Based on "Distance-Based Indexing for High-Dimensional Metric Spaces"
//! (SIGMOD 1997, Bozkaya and Ozsoyoglu).
//!
//! Insertions are buffered and placed in batches; deletions tombstone a point
//! in place. Queries return every live point within the radius, nearest
//! first.
//!
//! ## Example
//!
//! ```rust
//! use mvp_rs::MvpTree;
//!
//! let mut tree = MvpTree::new();
//! tree.add(1, 0b0001).unwrap();
//! tree.add(2, 0b0011).unwrap();
//! tree.add(3, u64::MAX).unwrap();
//! tree.sync().unwrap();
//!
//! let ids: Vec<i64> = tree.query(0b0001, 1.0).iter().map(|n| n.id).collect();
//! assert_eq!(ids, vec![1, 2]);
//! ```

mod arena;
pub mod config;
pub mod distance;
pub mod error;
pub mod node;
pub mod point;
pub mod snapshot;
pub mod tree;

pub use config::MvpConfig;
pub use distance::{Distance, Hamming, QueryStats};
pub use error::{MvpError, Result};
pub use node::{Neighbor, Node, NodeHandle};
pub use point::{DataPoint, PointHandle};
pub use snapshot::Snapshot;
pub use tree::{LevelStats, MvpTree, NodeCounts};

#[cfg(test)]
mod proptests;
