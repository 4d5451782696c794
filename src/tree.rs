//! The MVP tree: batched insertion, lookup, deletion and radius queries.
//!
//! Insertions are buffered in `arrivals` and pushed down the tree one batch
//! at a time, breadth first, one level group (one internal node's worth of
//! levels) per round. Each batch runs under a [`Journal`] so that a failed
//! batch leaves the tree exactly as it was.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::MvpConfig;
use crate::distance::{Distance, Hamming, Probe, QueryStats};
use crate::error::{MvpError, Result};
use crate::node::{internal_footprint, leaf_footprint, Neighbor, Node, NodeArena, NodeHandle, Search};
use crate::point::{DataPoint, PointArena, PointHandle};
use crate::snapshot::Snapshot;

/// Node population of one level group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LevelStats {
    pub internal: usize,
    pub leaves: usize,
    /// Stored (non-vantage) points across the leaves of this level group.
    pub stored_points: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub internal: usize,
    pub leaves: usize,
}

/// Where a node produced by a batch gets linked.
#[derive(Clone, Copy, Debug)]
enum Slot {
    Root,
    Child(NodeHandle, usize),
}

struct Pending {
    slot: Slot,
    points: Vec<PointHandle>,
}

/// Undo log of one batch.
///
/// Nodes are saved before their first mutation; frees are deferred to
/// commit so that saved nodes never refer to released slots.
struct Journal {
    old_root: Option<NodeHandle>,
    touched: HashSet<NodeHandle>,
    saved: Vec<(NodeHandle, Node)>,
    created: Vec<NodeHandle>,
    discarded: Vec<NodeHandle>,
    dead: Vec<PointHandle>,
}

impl Journal {
    fn new(old_root: Option<NodeHandle>) -> Self {
        Self {
            old_root,
            touched: HashSet::new(),
            saved: Vec::new(),
            created: Vec::new(),
            discarded: Vec::new(),
            dead: Vec::new(),
        }
    }

    fn save(&mut self, handle: NodeHandle, nodes: &NodeArena) {
        if self.touched.insert(handle) {
            self.saved.push((handle, nodes.get(handle).clone()));
        }
    }

    fn created(&mut self, handle: NodeHandle) {
        self.touched.insert(handle);
        self.created.push(handle);
    }
}

/// A multi-vantage-point tree over 64-bit fingerprints.
///
/// Not internally synchronized: callers serialize mutations against each
/// other and against queries.
#[derive(Clone, Debug)]
pub struct MvpTree<D = Hamming> {
    config: MvpConfig,
    metric: D,
    points: PointArena,
    nodes: NodeArena,
    root: Option<NodeHandle>,
    arrivals: Vec<PointHandle>,
    ids: BTreeMap<i64, PointHandle>,
    /// Live point of each id registered since the last flush, as it was
    /// before the first of those registrations. Restored if the flush fails.
    prior: BTreeMap<i64, Option<PointHandle>>,
}

impl MvpTree<Hamming> {
    /// Empty tree with the default shape and Hamming distance.
    pub fn new() -> Self {
        Self::build(MvpConfig::default(), Hamming)
    }
}

impl Default for MvpTree<Hamming> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Distance> MvpTree<D> {
    pub fn with_config(config: MvpConfig, metric: D) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, metric))
    }

    fn build(config: MvpConfig, metric: D) -> Self {
        Self {
            config,
            metric,
            points: PointArena::new(),
            nodes: NodeArena::default(),
            root: None,
            arrivals: Vec::new(),
            ids: BTreeMap::new(),
            prior: BTreeMap::new(),
        }
    }

    /// Rebuilds a tree from a snapshot. Vantage points and thresholds are
    /// chosen afresh, so the shape may differ from the tree that was saved.
    pub fn restore(snapshot: &Snapshot, config: MvpConfig, metric: D) -> Result<Self> {
        let mut tree = Self::with_config(config, metric)?;
        for &(id, value) in snapshot.entries() {
            tree.add(id, value)?;
        }
        tree.sync()?;
        Ok(tree)
    }

    #[inline]
    pub fn config(&self) -> &MvpConfig {
        &self.config
    }

    #[inline]
    pub fn metric(&self) -> &D {
        &self.metric
    }

    /// Live ids, buffered arrivals included.
    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Arrivals waiting for the next flush.
    #[inline]
    pub fn pending(&self) -> usize {
        self.arrivals.len()
    }

    #[inline]
    pub fn root(&self) -> Option<NodeHandle> {
        self.root
    }

    #[inline]
    pub fn node(&self, handle: NodeHandle) -> &Node {
        self.nodes.get(handle)
    }

    #[inline]
    pub fn points(&self) -> &PointArena {
        &self.points
    }

    /// Registers a point and buffers it; flushes once `sync_threshold`
    /// arrivals are waiting. An id that is already live is replaced: its old
    /// point is tombstoned.
    pub fn add(&mut self, id: i64, value: u64) -> Result<()> {
        self.register(id, value);
        if self.arrivals.len() >= self.config.sync_threshold {
            self.sync()?;
        }
        Ok(())
    }

    /// Registers every point and flushes them as one batch.
    pub fn add_batch(&mut self, batch: impl IntoIterator<Item = (i64, u64)>) -> Result<()> {
        for (id, value) in batch {
            self.register(id, value);
        }
        self.sync()
    }

    fn register(&mut self, id: i64, value: u64) {
        let old = self.ids.remove(&id);
        if let Some(old) = old {
            self.points.get_mut(old).active = false;
        }
        self.prior.entry(id).or_insert(old);
        let handle = self.points.alloc(DataPoint::new(id, value));
        self.ids.insert(id, handle);
        self.arrivals.push(handle);
    }

    /// Places every buffered arrival in the tree.
    ///
    /// Arrivals deleted before the flush are released instead of placed.
    /// On error the whole batch is dropped and the tree is left as it was
    /// before the buffered points were added: ids they replaced come back.
    /// The error is [`MvpError::BatchRolledBack`], listing the dropped
    /// `(id, fingerprint)` pairs so the caller can retry them.
    pub fn sync(&mut self) -> Result<()> {
        let prior = std::mem::take(&mut self.prior);
        if self.arrivals.is_empty() {
            return Ok(());
        }
        let arrivals = std::mem::take(&mut self.arrivals);
        let mut batch = Vec::with_capacity(arrivals.len());
        for handle in arrivals {
            if self.points.is_active(handle) {
                batch.push(handle);
            } else {
                self.points.free(handle);
            }
        }
        if batch.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let size = batch.len();
        let mut journal = Journal::new(self.root);
        match self.place(batch.clone(), &mut journal) {
            Ok(distance_ops) => {
                self.commit(journal);
                debug!(
                    points = size,
                    distance_ops,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "batch flushed"
                );
                Ok(())
            }
            Err(err) => {
                warn!(points = size, error = %err, "batch rolled back");
                let dropped = batch
                    .iter()
                    .map(|&h| {
                        let p = self.points.get(h);
                        (p.id, p.value)
                    })
                    .collect();
                self.rollback(journal, &batch, prior);
                Err(MvpError::BatchRolledBack {
                    source: Box::new(err),
                    dropped,
                })
            }
        }
    }

    /// Pushes a batch down the tree, one level group per round. Returns the
    /// number of distance evaluations spent.
    fn place(&mut self, batch: Vec<PointHandle>, journal: &mut Journal) -> Result<u64> {
        let Self {
            config,
            metric,
            points,
            nodes,
            root,
            ..
        } = self;
        let mut probe = Probe::new(&*metric);

        let mut level = vec![Pending {
            slot: Slot::Root,
            points: batch,
        }];
        while !level.is_empty() {
            let mut next = Vec::new();
            for Pending { slot, points: incoming } in level {
                let existing = match slot {
                    Slot::Root => *root,
                    Slot::Child(parent, index) => nodes.get(parent).child(index)?,
                };

                let (handle, absorbed) = match existing {
                    Some(handle) => {
                        journal.save(handle, nodes);
                        let mut absorbed =
                            nodes
                                .get_mut(handle)
                                .add_points(incoming, config, points, &mut probe)?;
                        match absorbed.replacement.take() {
                            Some(promoted) => {
                                let promoted = nodes.alloc(promoted);
                                journal.created(promoted);
                                journal.discarded.push(handle);
                                link(slot, promoted, root, nodes, journal)?;
                                (promoted, absorbed)
                            }
                            None => (handle, absorbed),
                        }
                    }
                    None => {
                        let (node, absorbed) = Node::create(incoming, config, points, &mut probe)?;
                        let handle = nodes.alloc(node);
                        journal.created(handle);
                        link(slot, handle, root, nodes, journal)?;
                        (handle, absorbed)
                    }
                };

                journal.dead.extend(absorbed.dead);
                next.extend(absorbed.children.into_iter().map(|(index, points)| Pending {
                    slot: Slot::Child(handle, index),
                    points,
                }));
            }
            level = next;
        }
        Ok(probe.stats.distance_ops)
    }

    fn commit(&mut self, journal: Journal) {
        for handle in journal.discarded {
            self.nodes.free(handle);
        }
        for handle in journal.dead {
            self.points.free(handle);
        }
    }

    fn rollback(
        &mut self,
        journal: Journal,
        batch: &[PointHandle],
        prior: BTreeMap<i64, Option<PointHandle>>,
    ) {
        for (handle, node) in journal.saved {
            self.nodes.restore(handle, node);
        }
        for handle in journal.created {
            self.nodes.free(handle);
        }
        self.root = journal.old_root;
        for &handle in batch {
            let id = self.points.get(handle).id;
            if self.ids.get(&id) == Some(&handle) {
                self.ids.remove(&id);
            }
            self.points.free(handle);
        }
        for (id, old) in prior {
            let Some(old) = old else { continue };
            if !self.ids.contains_key(&id) {
                self.points.get_mut(old).active = true;
                self.ids.insert(id, old);
            }
        }
    }

    pub fn lookup(&self, id: i64) -> Option<&DataPoint> {
        self.ids.get(&id).map(|&h| self.points.get(h))
    }

    /// Tombstones the point for `id`. It stays in its node until that node
    /// is rebuilt or the tree is cleared.
    pub fn delete(&mut self, id: i64) -> Option<DataPoint> {
        let handle = self.ids.remove(&id)?;
        if let Some(prior) = self.prior.get_mut(&id) {
            *prior = None;
        }
        let point = self.points.get_mut(handle);
        point.active = false;
        Some(*point)
    }

    /// Live placed points within `radius` of `target`, nearest first.
    ///
    /// Buffered arrivals are not searched; call [`MvpTree::sync`] first when
    /// they must be visible.
    pub fn query(&self, target: u64, radius: f64) -> Vec<Neighbor> {
        self.query_with_stats(target, radius).0
    }

    pub fn query_with_stats(&self, target: u64, radius: f64) -> (Vec<Neighbor>, QueryStats) {
        let mut search = Search::new(target, radius, &self.config, &self.points, &self.metric);
        let mut results = Vec::new();
        let mut level: Vec<NodeHandle> = self.root.into_iter().collect();
        while !level.is_empty() {
            let mut next = Vec::new();
            for handle in level {
                self.nodes.get(handle).traverse(&mut search, &mut results, &mut next);
            }
            level = next;
        }
        (results, search.probe.stats)
    }

    /// Frees every node and point, buffered arrivals included.
    pub fn clear(&mut self) {
        let mut level: Vec<NodeHandle> = self.root.take().into_iter().collect();
        while !level.is_empty() {
            let mut next = Vec::new();
            for handle in level {
                let Some(mut node) = self.nodes.free(handle) else {
                    continue;
                };
                next.extend(node.children());
                let purged = node.purge_data_points(&self.points);
                for p in purged.live.into_iter().chain(purged.dead) {
                    self.points.free(p);
                }
            }
            level = next;
        }
        for handle in self.arrivals.drain(..) {
            self.points.free(handle);
        }
        debug_assert!(self.points.is_empty(), "points outlived their nodes");
        debug_assert!(self.nodes.is_empty(), "unreachable nodes left behind");

        self.ids.clear();
        self.prior.clear();
        self.points.clear();
        self.nodes.clear();
    }

    /// Node population per level group, root first.
    pub fn level_stats(&self) -> Vec<LevelStats> {
        let mut stats = Vec::new();
        let mut level: Vec<NodeHandle> = self.root.into_iter().collect();
        while !level.is_empty() {
            let mut row = LevelStats::default();
            let mut next = Vec::new();
            for handle in level {
                let node = self.nodes.get(handle);
                if node.is_leaf() {
                    row.leaves += 1;
                    row.stored_points += node.count();
                } else {
                    row.internal += 1;
                }
                next.extend(node.children());
            }
            stats.push(row);
            level = next;
        }
        stats
    }

    pub fn node_counts(&self) -> NodeCounts {
        self.level_stats()
            .iter()
            .fold(NodeCounts::default(), |acc, row| NodeCounts {
                internal: acc.internal + row.internal,
                leaves: acc.leaves + row.leaves,
            })
    }

    /// Estimated bytes: live points plus counted nodes at their structural
    /// size. Not allocator-exact.
    pub fn memory_usage(&self) -> usize {
        let counts = self.node_counts();
        self.len() * std::mem::size_of::<DataPoint>()
            + counts.internal * internal_footprint(&self.config)
            + counts.leaves * leaf_footprint(&self.config)
            + std::mem::size_of::<Self>()
    }

    /// Live `(id, fingerprint)` pairs in ascending id order.
    pub fn snapshot(&self) -> Snapshot {
        self.ids
            .iter()
            .map(|(&id, &h)| (id, self.points.value(h)))
            .collect()
    }
}

fn link(
    slot: Slot,
    handle: NodeHandle,
    root: &mut Option<NodeHandle>,
    nodes: &mut NodeArena,
    journal: &mut Journal,
) -> Result<()> {
    match slot {
        Slot::Root => {
            *root = Some(handle);
            Ok(())
        }
        Slot::Child(parent, index) => {
            journal.save(parent, nodes);
            nodes.get_mut(parent).set_child(index, handle)
        }
    }
}
