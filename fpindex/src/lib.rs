//! # fpindex - Fingerprint Index
//!
//! A thread-safe host for an [`MvpTree`]: id assignment, input parsing,
//! file persistence and memory statistics around radius search over 64-bit
//! fingerprints.
//!
//! ## Example
//!
//! ```rust
//! use fpindex::FingerprintIndex;
//!
//! let index = FingerprintIndex::new();
//! let a = index.insert(0b0001, None).unwrap();
//! let b = index.insert(0b0011, Some(7)).unwrap();
//! assert_eq!(b, 7);
//! index.sync().unwrap();
//!
//! let hits = index.query(0b0001, 1.0).unwrap();
//! assert_eq!(hits, vec![(a, 0.0), (7, 1.0)]);
//! ```
//!
//! Per-id metadata is not stored here. A host that keeps it elsewhere
//! updates it in lockstep with [`FingerprintIndex::insert`] and
//! [`FingerprintIndex::delete`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod ids;
pub mod parse;

pub use error::{IndexError, Result};
pub use ids::IdGenerator;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::Instant;

use mvp_rs::{Distance, Hamming, MvpConfig, MvpTree, Snapshot};
use parking_lot::RwLock;
use tracing::{debug, warn};

/// Encoding version written at the head of a saved index.
pub const ENCODING_VERSION: u8 = 0;

/// Memory usage statistics for the index.
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    /// Live points
    pub num_points: usize,
    /// Internal nodes reachable from the root
    pub internal_nodes: usize,
    /// Leaves reachable from the root
    pub leaf_nodes: usize,
    /// Estimated total bytes (structural sizes, not allocator-exact)
    pub estimated_bytes: usize,
    /// Bytes per point (calculated)
    pub bytes_per_point: f64,
}

/// Configuration for the index.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Shape of the underlying tree
    pub tree: MvpConfig,
    /// Starting value of the id counter
    pub initial_id_counter: u64,
}

/// A fingerprint index safe to share between threads.
///
/// Queries take a read lock; every mutation takes the write lock.
pub struct FingerprintIndex<D = Hamming> {
    inner: RwLock<MvpTree<D>>,
    ids: IdGenerator,
    config: Config,
}

impl FingerprintIndex<Hamming> {
    /// Create a new empty index with default configuration.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MvpTree::new()),
            ids: IdGenerator::new(0),
            config: Config::default(),
        }
    }

    /// Create a new index with the given configuration.
    pub fn with_config(config: Config) -> Result<Self> {
        Self::with_metric(config, Hamming)
    }

    /// Rebuild an index from a file written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        Self::load_with_metric(path, config, Hamming)
    }
}

impl<D: Distance> FingerprintIndex<D> {
    /// Create a new index comparing fingerprints with `metric`.
    pub fn with_metric(config: Config, metric: D) -> Result<Self> {
        Ok(Self {
            inner: RwLock::new(MvpTree::with_config(config.tree, metric)?),
            ids: IdGenerator::new(config.initial_id_counter),
            config,
        })
    }

    /// The configuration this index was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Insert a fingerprint, generating an id unless one is given.
    ///
    /// Returns the id. The point is buffered and becomes visible to
    /// [`query`](Self::query) after the next flush. If this insert triggers
    /// a flush that fails, every buffered point is dropped and the error's
    /// [`dropped_points`](IndexError::dropped_points) lists them.
    pub fn insert(&self, fingerprint: u64, id: Option<i64>) -> Result<i64> {
        let id = id.unwrap_or_else(|| self.ids.next_id());
        self.inner.write().add(id, fingerprint)?;
        Ok(id)
    }

    /// Insert under an id taken from a replication log.
    pub fn insert_with_replication_id(&self, fingerprint: u64, id: i64) -> Result<i64> {
        self.insert(fingerprint, Some(id))
    }

    /// Delete an id. Returns `false` if it was not present.
    pub fn delete(&self, id: i64) -> bool {
        self.inner.write().delete(id).is_some()
    }

    /// Ids within `radius` of `fingerprint` with their distances, nearest
    /// first.
    pub fn query(&self, fingerprint: u64, radius: f64) -> Result<Vec<(i64, f64)>> {
        if !radius.is_finite() || radius < 0.0 {
            return Err(IndexError::InvalidRadius(radius.to_string()));
        }
        let started = Instant::now();
        let inner = self.inner.read();
        let (results, stats) = inner.query_with_stats(fingerprint, radius);
        let size = inner.len();
        drop(inner);

        debug!(
            elapsed_us = started.elapsed().as_micros() as u64,
            results = results.len(),
            nodes_visited = stats.nodes_visited,
            ops_ratio = if size > 0 { stats.distance_ops as f64 / size as f64 } else { 0.0 },
            "query"
        );
        Ok(results.into_iter().map(|n| (n.id, n.distance)).collect())
    }

    /// Check if an id is present, buffered arrivals included.
    pub fn lookup(&self, id: i64) -> bool {
        self.inner.read().lookup(id).is_some()
    }

    /// Get the number of live ids.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush buffered arrivals into the tree.
    ///
    /// On failure the buffered points are dropped and listed by
    /// [`IndexError::dropped_points`], so callers can insert them again.
    pub fn sync(&self) -> Result<()> {
        let started = Instant::now();
        let mut inner = self.inner.write();
        let pending = inner.pending();
        if let Err(err) = inner.sync() {
            warn!(dropped = err.dropped().len(), error = %err, "sync failed");
            return Err(err.into());
        }
        debug!(
            points = pending,
            elapsed_us = started.elapsed().as_micros() as u64,
            "synced"
        );
        Ok(())
    }

    /// Drop every point.
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// `(fingerprint, id)` of every live point in ascending id order.
    ///
    /// Replaying the log through
    /// [`insert_with_replication_id`](Self::insert_with_replication_id)
    /// reproduces the index elsewhere.
    pub fn replication_log(&self) -> Vec<(u64, i64)> {
        let snapshot = self.inner.read().snapshot();
        snapshot
            .into_entries()
            .into_iter()
            .map(|(id, value)| (value, id))
            .collect()
    }

    /// Write the index to `path`: the encoding version byte, then the
    /// point snapshot.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let snapshot = self.inner.read().snapshot();
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&[ENCODING_VERSION])?;
        snapshot.write_to(&mut out)?;
        out.flush()?;
        debug!(points = snapshot.len(), path = %path.display(), "index saved");
        Ok(())
    }

    /// Rebuild an index from a file written by [`save`](Self::save),
    /// comparing fingerprints with `metric`.
    pub fn load_with_metric(path: impl AsRef<Path>, config: Config, metric: D) -> Result<Self> {
        let path = path.as_ref();
        let started = Instant::now();
        let mut input = BufReader::new(File::open(path)?);
        let mut version = [0u8; 1];
        input.read_exact(&mut version)?;
        if version[0] != ENCODING_VERSION {
            return Err(IndexError::UnsupportedEncoding(version[0]));
        }
        let snapshot = Snapshot::read_from(&mut input)?;
        let tree = MvpTree::restore(&snapshot, config.tree, metric)?;
        debug!(
            points = snapshot.len(),
            path = %path.display(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "index loaded"
        );
        Ok(Self {
            inner: RwLock::new(tree),
            ids: IdGenerator::new(config.initial_id_counter),
            config,
        })
    }

    /// Get memory usage statistics.
    pub fn memory_usage(&self) -> MemoryStats {
        let inner = self.inner.read();
        let counts = inner.node_counts();
        let num_points = inner.len();
        let estimated_bytes = inner.memory_usage();
        MemoryStats {
            num_points,
            internal_nodes: counts.internal,
            leaf_nodes: counts.leaves,
            estimated_bytes,
            bytes_per_point: if num_points > 0 {
                estimated_bytes as f64 / num_points as f64
            } else {
                0.0
            },
        }
    }
}

impl Default for FingerprintIndex<Hamming> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mvp_rs::MvpError;

    fn small() -> Config {
        Config {
            tree: MvpConfig {
                branch_factor: 2,
                path_length: 4,
                leaf_cap: 8,
                levels_per_node: 3,
                sync_threshold: 32,
            },
            initial_id_counter: 0,
        }
    }

    #[test]
    fn test_basic_operations() {
        let index = FingerprintIndex::with_config(small()).unwrap();

        // Insert
        assert_eq!(index.insert(0b0001, Some(1)).unwrap(), 1);
        assert_eq!(index.insert(0b0011, Some(2)).unwrap(), 2);
        assert_eq!(index.insert(u64::MAX, Some(3)).unwrap(), 3);

        // Lookup sees buffered points
        assert!(index.lookup(2));
        assert!(!index.lookup(4));
        assert_eq!(index.len(), 3);

        index.sync().unwrap();
        assert_eq!(index.query(0b0001, 1.0).unwrap(), vec![(1, 0.0), (2, 1.0)]);
        assert_eq!(index.query(0b0001, 0.0).unwrap(), vec![(1, 0.0)]);

        // Delete
        assert!(index.delete(1));
        assert!(!index.delete(1));
        assert_eq!(index.len(), 2);
        assert_eq!(index.query(0b0001, 1.0).unwrap(), vec![(2, 1.0)]);
    }

    #[test]
    fn test_generated_ids() {
        let index = FingerprintIndex::with_config(Config {
            initial_id_counter: 41,
            ..small()
        })
        .unwrap();
        let id = index.insert(5, None).unwrap();
        assert_eq!(id as u64 & 0xffff, 42);
        assert!(index.lookup(id));
    }

    #[test]
    fn test_rejects_bad_radius() {
        let index = FingerprintIndex::new();
        assert!(matches!(index.query(0, -1.0), Err(IndexError::InvalidRadius(_))));
        assert!(matches!(index.query(0, f64::NAN), Err(IndexError::InvalidRadius(_))));
    }

    #[test]
    fn test_replication_log_replays() {
        let source = FingerprintIndex::with_config(small()).unwrap();
        for i in 0..50i64 {
            source.insert(i as u64 * 0x9E37_79B9, Some(100 - i)).unwrap();
        }
        source.delete(60);

        let log = source.replication_log();
        assert_eq!(log.len(), 49);
        assert!(log.windows(2).all(|w| w[0].1 < w[1].1));

        let replica = FingerprintIndex::with_config(small()).unwrap();
        for &(fp, id) in &log {
            replica.insert_with_replication_id(fp, id).unwrap();
        }
        assert_eq!(replica.replication_log(), log);
    }

    #[test]
    fn test_memory_usage() {
        let index = FingerprintIndex::with_config(small()).unwrap();
        assert_eq!(index.memory_usage().bytes_per_point, 0.0);
        for i in 0..500u64 {
            index.insert(i.wrapping_mul(0x9E37_79B9_7F4A_7C15), Some(i as i64)).unwrap();
        }
        index.sync().unwrap();

        let stats = index.memory_usage();
        assert_eq!(stats.num_points, 500);
        assert!(stats.internal_nodes > 0);
        assert!(stats.leaf_nodes > 0);
        assert!(stats.bytes_per_point > 0.0);
    }

    #[test]
    fn test_failed_sync_reports_dropped_points() {
        let metric = |a: u64, b: u64| {
            if a == 666 || b == 666 {
                f64::NAN
            } else {
                f64::from((a ^ b).count_ones())
            }
        };
        let index = FingerprintIndex::with_metric(small(), metric).unwrap();
        for i in 0..12i64 {
            index.insert(i as u64, Some(i)).unwrap();
        }
        index.sync().unwrap();

        index.insert(4, Some(3)).unwrap();
        for i in 100..111i64 {
            index.insert(666, Some(i)).unwrap();
        }
        let err = index.sync().unwrap_err();
        assert!(matches!(
            err,
            IndexError::Tree(MvpError::BatchRolledBack { .. })
        ));
        let mut dropped = err.dropped_points().to_vec();
        dropped.sort_unstable();
        let mut expected: Vec<(i64, u64)> = vec![(3, 4)];
        expected.extend((100..111).map(|i| (i, 666)));
        assert_eq!(dropped, expected);

        // Nothing from the failed batch is indexed and id 3 is back.
        assert_eq!(index.len(), 12);
        assert!(!index.lookup(100));
        assert_eq!(index.query(3, 0.0).unwrap(), vec![(3, 0.0)]);
        assert!(IndexError::InvalidId("x".into()).dropped_points().is_empty());
    }

    #[test]
    fn test_clear() {
        let index = FingerprintIndex::with_config(small()).unwrap();
        index.insert(1, Some(1)).unwrap();
        index.clear();
        assert!(index.is_empty());
        assert!(!index.lookup(1));
    }
}
