//! Leaf and internal nodes of the MVP tree.
//!
//! A leaf keeps up to `path_length` vantage points, up to `leaf_cap` stored
//! points, and a dense table of distances from every vantage point to every
//! stored point. Queries use the table with the triangle inequality to skip
//! stored points without evaluating the metric.
//!
//! An internal node keeps `levels_per_node` vantage points, one per internal
//! level. Level `n` splits each of its `branch_factor ^ n` buckets into
//! `branch_factor` sub-buckets by distance to vantage point `n`; after the
//! last level every bucket path names one of `fanout` child slots. Vantage
//! points and split thresholds never change once set.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::trace;

use crate::arena::Arena;
use crate::config::MvpConfig;
use crate::distance::{Distance, Probe};
use crate::error::{MvpError, Result};
use crate::point::{PointArena, PointHandle};

/// Points routed to child slots, keyed by child index.
pub(crate) type Buckets = BTreeMap<usize, Vec<PointHandle>>;

/// Ascending thresholds of one bucket (`branch_factor - 1` entries).
type Thresholds = SmallVec<[f64; 3]>;

/// A point found by a query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub id: i64,
    pub value: u64,
    pub distance: f64,
}

/// Inserts keeping `results` sorted by distance; equal distances keep
/// discovery order.
pub(crate) fn insert_ordered(results: &mut Vec<Neighbor>, item: Neighbor) {
    let at = results.partition_point(|r| r.distance <= item.distance);
    results.insert(at, item);
}

fn neighbor(points: &PointArena, handle: PointHandle, distance: f64) -> Neighbor {
    let p = points.get(handle);
    Neighbor {
        id: p.id,
        value: p.value,
        distance,
    }
}

/// Result of handing a point set to a node.
#[derive(Debug, Default)]
pub(crate) struct Absorbed {
    /// The node that must take this node's place (a promoted leaf).
    pub replacement: Option<Node>,
    /// Points destined for child slots of the resulting internal node.
    pub children: Buckets,
    /// Tombstoned points dropped from storage; the caller frees them.
    pub dead: Vec<PointHandle>,
}

/// Points taken out of a node by [`Node::purge_data_points`].
#[derive(Debug, Default)]
pub struct Purged {
    pub live: Vec<PointHandle>,
    pub dead: Vec<PointHandle>,
}

impl Purged {
    fn sort(&mut self, handle: PointHandle, points: &PointArena) {
        if points.is_active(handle) {
            self.live.push(handle);
        } else {
            self.dead.push(handle);
        }
    }
}

// =============================================================================
// Leaf
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct LeafNode {
    vantage: SmallVec<[PointHandle; 16]>,
    points: Vec<PointHandle>,
    /// `pdists[i][j]`: distance from vantage point `i` to stored point `j`.
    pdists: SmallVec<[Vec<f64>; 16]>,
}

impl LeafNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes vantage points off the back of `points` until the leaf has
    /// `path_length` of them.
    fn select_vantage_points(&mut self, points: &mut Vec<PointHandle>, config: &MvpConfig) {
        while self.vantage.len() < config.path_length {
            let Some(p) = points.pop() else { break };
            self.vantage.push(p);
            self.pdists.push(Vec::new());
        }
    }

    fn mark_leaf_distances<D: Distance + ?Sized>(
        &mut self,
        incoming: &[PointHandle],
        config: &MvpConfig,
        points: &PointArena,
        probe: &mut Probe<'_, D>,
    ) -> Result<()> {
        if self.points.len() + incoming.len() > config.leaf_cap {
            return Err(MvpError::LeafOverflow {
                stored: self.points.len(),
                incoming: incoming.len(),
                capacity: config.leaf_cap,
            });
        }
        // Stored points only exist once every vantage slot is taken, so each
        // row covers all stored points.
        debug_assert!(self.points.is_empty() || self.vantage.len() == config.path_length);
        for (vp, row) in self.vantage.iter().zip(self.pdists.iter_mut()) {
            debug_assert_eq!(row.len(), self.points.len());
            let vp_value = points.value(*vp);
            row.extend(
                incoming
                    .iter()
                    .map(|&p| probe.measure(vp_value, points.value(p))),
            );
        }
        Ok(())
    }

    fn store(&mut self, incoming: Vec<PointHandle>, points: &mut PointArena) {
        for &p in &incoming {
            points.get_mut(p).active = true;
        }
        self.points.extend(incoming);
    }

    fn add_points<D: Distance + ?Sized>(
        &mut self,
        mut incoming: Vec<PointHandle>,
        config: &MvpConfig,
        points: &mut PointArena,
        probe: &mut Probe<'_, D>,
    ) -> Result<Absorbed> {
        self.select_vantage_points(&mut incoming, config);
        if self.points.len() + incoming.len() <= config.leaf_cap {
            self.mark_leaf_distances(&incoming, config, points, probe)?;
            self.store(incoming, points);
            return Ok(Absorbed::default());
        }

        let purged = self.purge_data_points(points);
        incoming.extend(purged.live);

        if incoming.len() <= config.leaf_limit() {
            trace!(points = incoming.len(), dropped = purged.dead.len(), "leaf rebuilt");
            self.select_vantage_points(&mut incoming, config);
            self.mark_leaf_distances(&incoming, config, points, probe)?;
            self.store(incoming, points);
            return Ok(Absorbed {
                dead: purged.dead,
                ..Absorbed::default()
            });
        }

        trace!(points = incoming.len(), dropped = purged.dead.len(), "leaf promoted");
        let mut internal = InternalNode::new(config);
        let children = internal.add_points(incoming, config, points, probe)?;
        Ok(Absorbed {
            replacement: Some(Node::Internal(internal)),
            children,
            dead: purged.dead,
        })
    }

    /// Runs `emit` for every live point within `radius` of `target`.
    fn scan<D: Distance + ?Sized>(
        &self,
        target: u64,
        radius: f64,
        points: &PointArena,
        probe: &mut Probe<'_, D>,
        mut emit: impl FnMut(PointHandle, f64),
    ) {
        let mut qdists: SmallVec<[f64; 16]> = SmallVec::with_capacity(self.vantage.len());
        for &vp in &self.vantage {
            let d = probe.measure(points.value(vp), target);
            qdists.push(d);
            if points.is_active(vp) && d <= radius {
                emit(vp, d);
            }
        }

        'stored: for (j, &p) in self.points.iter().enumerate() {
            if !points.is_active(p) {
                continue;
            }
            for (row, &qd) in self.pdists.iter().zip(&qdists) {
                let pd = row[j];
                if pd < qd - radius || pd > qd + radius {
                    continue 'stored;
                }
            }
            let d = probe.measure(points.value(p), target);
            if d <= radius {
                emit(p, d);
            }
        }
    }

    /// Drains the leaf, splitting its points into live and tombstoned.
    fn purge_data_points(&mut self, points: &PointArena) -> Purged {
        let mut purged = Purged::default();
        for p in self.vantage.drain(..).chain(self.points.drain(..)) {
            purged.sort(p, points);
        }
        self.pdists.clear();
        purged
    }

    pub fn vantage_points(&self) -> &[PointHandle] {
        &self.vantage
    }

    pub fn data_points(&self) -> &[PointHandle] {
        &self.points
    }
}

// =============================================================================
// Internal
// =============================================================================

#[derive(Clone, Debug)]
pub struct InternalNode {
    vantage: SmallVec<[PointHandle; 8]>,
    /// `splits[level][bucket]`, computed the first time a bucket receives
    /// points and frozen afterwards.
    splits: Vec<Vec<Option<Thresholds>>>,
    children: Vec<Option<NodeHandle>>,
}

impl InternalNode {
    pub fn new(config: &MvpConfig) -> Self {
        let bf = config.branch_factor;
        Self {
            vantage: SmallVec::new(),
            splits: (0..config.levels_per_node)
                .map(|level| vec![None; bf.pow(level as u32)])
                .collect(),
            children: vec![None; config.fanout()],
        }
    }

    fn select_vantage_points(&mut self, points: &mut Vec<PointHandle>, config: &MvpConfig) {
        while self.vantage.len() < config.levels_per_node {
            let Some(p) = points.pop() else { break };
            self.vantage.push(p);
        }
    }

    /// Thresholds of `bucket` at `level`, derived from `dists` on first use.
    ///
    /// Boundary `i` sits at position `i * n / branch_factor` of the sorted
    /// distances, averaging the order statistics on either side.
    fn split_thresholds(
        &mut self,
        dists: &[f64],
        level: usize,
        bucket: usize,
        branch_factor: usize,
    ) -> Thresholds {
        let slot = &mut self.splits[level][bucket];
        if let Some(existing) = slot {
            return existing.clone();
        }

        let mut sorted = dists.to_vec();
        sorted.sort_by(f64::total_cmp);
        let last = sorted.len() - 1;
        let factor = sorted.len() as f64 / branch_factor as f64;
        let thresholds: Thresholds = (1..branch_factor)
            .map(|i| {
                let pos = i as f64 * factor;
                let lo = (pos.floor() as usize).min(last);
                let hi = (pos.ceil() as usize).min(last);
                (sorted[lo] + sorted[hi]) / 2.0
            })
            .collect();
        *slot = Some(thresholds.clone());
        thresholds
    }

    /// Partitions `incoming` level by level and returns the point set of
    /// each child slot that receives any.
    fn collate_points<D: Distance + ?Sized>(
        &mut self,
        incoming: Vec<PointHandle>,
        config: &MvpConfig,
        points: &PointArena,
        probe: &mut Probe<'_, D>,
    ) -> Result<Buckets> {
        let bf = config.branch_factor;
        let mut buckets = Buckets::new();
        if !incoming.is_empty() {
            buckets.insert(0, incoming);
        }

        for level in 0..config.levels_per_node {
            let vp_value = points.value(self.vantage[level]);
            let mut next = Buckets::new();
            for (bucket, list) in buckets {
                let dists: Vec<f64> = list
                    .iter()
                    .map(|&p| probe.measure(vp_value, points.value(p)))
                    .collect();
                let splits = self.split_thresholds(&dists, level, bucket, bf);
                let upper = splits[splits.len() - 1];

                let mut unassigned = 0usize;
                for (p, d) in list.into_iter().zip(dists) {
                    let sub = match splits.iter().position(|&m| d <= m) {
                        Some(j) => j,
                        None if d > upper => bf - 1,
                        None => {
                            unassigned += 1;
                            continue;
                        }
                    };
                    next.entry(bucket * bf + sub).or_default().push(p);
                }
                if unassigned > 0 {
                    return Err(MvpError::IncompleteCollation {
                        level,
                        bucket,
                        unassigned,
                    });
                }
            }
            buckets = next;
        }
        Ok(buckets)
    }

    fn add_points<D: Distance + ?Sized>(
        &mut self,
        mut incoming: Vec<PointHandle>,
        config: &MvpConfig,
        points: &PointArena,
        probe: &mut Probe<'_, D>,
    ) -> Result<Buckets> {
        self.select_vantage_points(&mut incoming, config);
        if self.vantage.len() < config.levels_per_node {
            return Err(MvpError::TooFewVantagePoints {
                needed: config.levels_per_node,
                available: self.vantage.len(),
            });
        }
        self.collate_points(incoming, config, points, probe)
    }

    /// Reports live vantage points within `radius` and collects the child
    /// nodes whose bucket paths may hold further matches.
    ///
    /// A bucket bounded above by `m` can hold a match only if
    /// `d <= m + radius`; the last bucket only if `d > m_last - radius`.
    fn traverse<D: Distance + ?Sized>(
        &self,
        search: &mut Search<'_, '_, D>,
        results: &mut Vec<Neighbor>,
        next: &mut Vec<NodeHandle>,
    ) {
        let (points, radius) = (search.points, search.radius);
        let bf = search.config.branch_factor;
        let mut current = vec![true];
        for (level, &vp) in self.vantage.iter().enumerate() {
            let d = search.probe.measure(points.value(vp), search.target);
            if points.is_active(vp) && d <= radius {
                insert_ordered(results, neighbor(points, vp, d));
            }

            let mut reachable = vec![false; current.len() * bf];
            for (bucket, _) in current.iter().enumerate().filter(|(_, on)| **on) {
                let Some(splits) = &self.splits[level][bucket] else {
                    continue;
                };
                for (j, &m) in splits.iter().enumerate() {
                    if d <= m + radius {
                        reachable[bucket * bf + j] = true;
                    }
                }
                if d > splits[splits.len() - 1] - radius {
                    reachable[bucket * bf + bf - 1] = true;
                }
            }
            current = reachable;
        }

        next.extend(
            current
                .iter()
                .zip(&self.children)
                .filter_map(|(on, child)| if *on { *child } else { None }),
        );
    }

    /// Takes the vantage points out of the node. Children are left alone;
    /// their points are purged when those nodes are themselves purged.
    fn purge_data_points(&mut self, points: &PointArena) -> Purged {
        let mut purged = Purged::default();
        for p in self.vantage.drain(..) {
            purged.sort(p, points);
        }
        purged
    }

    pub fn vantage_points(&self) -> &[PointHandle] {
        &self.vantage
    }
}

// =============================================================================
// Search
// =============================================================================

/// One radius query: what is searched for, where, and its counters.
pub(crate) struct Search<'a, 'm, D: ?Sized> {
    pub(crate) target: u64,
    pub(crate) radius: f64,
    pub(crate) config: &'a MvpConfig,
    pub(crate) points: &'a PointArena,
    pub(crate) probe: Probe<'m, D>,
}

impl<'a, 'm, D: Distance + ?Sized> Search<'a, 'm, D> {
    pub(crate) fn new(
        target: u64,
        radius: f64,
        config: &'a MvpConfig,
        points: &'a PointArena,
        metric: &'m D,
    ) -> Self {
        Self {
            target,
            radius,
            config,
            points,
            probe: Probe::new(metric),
        }
    }
}

// =============================================================================
// Node
// =============================================================================

/// Slot index of a node inside a [`NodeArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct NodeHandle(u32);

#[derive(Clone, Debug)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    /// Builds a node for a point set that has no node yet: a leaf when the
    /// set fits in one, an internal node otherwise.
    pub(crate) fn create<D: Distance + ?Sized>(
        incoming: Vec<PointHandle>,
        config: &MvpConfig,
        points: &mut PointArena,
        probe: &mut Probe<'_, D>,
    ) -> Result<(Node, Absorbed)> {
        if incoming.len() <= config.leaf_limit() {
            let mut leaf = LeafNode::new();
            let absorbed = leaf.add_points(incoming, config, points, probe)?;
            debug_assert!(absorbed.replacement.is_none());
            Ok((Node::Leaf(leaf), absorbed))
        } else {
            let mut internal = InternalNode::new(config);
            let children = internal.add_points(incoming, config, points, probe)?;
            Ok((
                Node::Internal(internal),
                Absorbed {
                    children,
                    ..Absorbed::default()
                },
            ))
        }
    }

    pub(crate) fn add_points<D: Distance + ?Sized>(
        &mut self,
        incoming: Vec<PointHandle>,
        config: &MvpConfig,
        points: &mut PointArena,
        probe: &mut Probe<'_, D>,
    ) -> Result<Absorbed> {
        match self {
            Node::Leaf(leaf) => leaf.add_points(incoming, config, points, probe),
            Node::Internal(internal) => Ok(Absorbed {
                children: internal.add_points(incoming, config, points, probe)?,
                ..Absorbed::default()
            }),
        }
    }

    /// Adds this node's matches to `results` and queues the children that
    /// may hold more.
    pub(crate) fn traverse<D: Distance + ?Sized>(
        &self,
        search: &mut Search<'_, '_, D>,
        results: &mut Vec<Neighbor>,
        next: &mut Vec<NodeHandle>,
    ) {
        search.probe.stats.nodes_visited += 1;
        match self {
            Node::Leaf(leaf) => {
                let points = search.points;
                leaf.scan(search.target, search.radius, points, &mut search.probe, |h, d| {
                    insert_ordered(results, neighbor(points, h, d))
                })
            }
            Node::Internal(internal) => internal.traverse(search, results, next),
        }
    }

    /// Live points held directly by this node within `radius` of `target`,
    /// in storage order. Children are not visited.
    pub fn filter_by_radius<D: Distance + ?Sized>(
        &self,
        target: u64,
        radius: f64,
        points: &PointArena,
        metric: &D,
    ) -> Vec<PointHandle> {
        let mut probe = Probe::new(metric);
        let mut found = Vec::new();
        match self {
            Node::Leaf(leaf) => {
                leaf.scan(target, radius, points, &mut probe, |h, _| found.push(h));
            }
            Node::Internal(internal) => {
                for &vp in &internal.vantage {
                    if points.is_active(vp) && probe.measure(points.value(vp), target) <= radius {
                        found.push(vp);
                    }
                }
            }
        }
        found
    }

    /// Takes every point held directly by the node out of it, split into
    /// live and tombstoned. The node is left without points.
    pub fn purge_data_points(&mut self, points: &PointArena) -> Purged {
        match self {
            Node::Leaf(leaf) => leaf.purge_data_points(points),
            Node::Internal(internal) => internal.purge_data_points(points),
        }
    }

    pub fn child(&self, index: usize) -> Result<Option<NodeHandle>> {
        match self {
            Node::Leaf(_) => Ok(None),
            Node::Internal(internal) => internal.children.get(index).copied().ok_or(
                MvpError::ChildIndexOutOfRange {
                    index,
                    fanout: internal.children.len(),
                },
            ),
        }
    }

    pub fn set_child(&mut self, index: usize, child: NodeHandle) -> Result<()> {
        let fanout = match self {
            Node::Leaf(_) => 0,
            Node::Internal(internal) => internal.children.len(),
        };
        match self {
            Node::Internal(internal) if index < fanout => {
                internal.children[index] = Some(child);
                Ok(())
            }
            _ => Err(MvpError::ChildIndexOutOfRange { index, fanout }),
        }
    }

    /// Linked children in slot order.
    pub fn children(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        let slots: &[Option<NodeHandle>] = match self {
            Node::Leaf(_) => &[],
            Node::Internal(internal) => &internal.children,
        };
        slots.iter().flatten().copied()
    }

    /// Stored (non-vantage) points; always zero for internal nodes.
    pub fn count(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.points.len(),
            Node::Internal(_) => 0,
        }
    }

    pub fn vantage_points(&self) -> &[PointHandle] {
        match self {
            Node::Leaf(leaf) => leaf.vantage_points(),
            Node::Internal(internal) => internal.vantage_points(),
        }
    }

    pub fn data_points(&self) -> &[PointHandle] {
        match self {
            Node::Leaf(leaf) => leaf.data_points(),
            Node::Internal(_) => &[],
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }
}

/// Approximate bytes of a full leaf: handles plus the distance table.
pub(crate) fn leaf_footprint(config: &MvpConfig) -> usize {
    std::mem::size_of::<Node>()
        + config.leaf_cap * std::mem::size_of::<PointHandle>()
        + config.path_length * config.leaf_cap * std::mem::size_of::<f64>()
}

/// Approximate bytes of an internal node: child table plus threshold slots.
pub(crate) fn internal_footprint(config: &MvpConfig) -> usize {
    let buckets: usize = (0..config.levels_per_node)
        .map(|level| config.branch_factor.pow(level as u32))
        .sum();
    std::mem::size_of::<Node>()
        + config.fanout() * std::mem::size_of::<Option<NodeHandle>>()
        + buckets * std::mem::size_of::<Option<Thresholds>>()
}

/// Owner of every node of a tree.
#[derive(Clone, Debug, Default)]
pub struct NodeArena {
    inner: Arena<Node>,
}

impl NodeArena {
    pub fn alloc(&mut self, node: Node) -> NodeHandle {
        NodeHandle(self.inner.alloc(node))
    }

    pub fn free(&mut self, handle: NodeHandle) -> Option<Node> {
        self.inner.free(handle.0)
    }

    #[inline]
    pub fn get(&self, handle: NodeHandle) -> &Node {
        self.inner.get(handle.0).expect("dangling node handle")
    }

    #[inline]
    pub fn get_mut(&mut self, handle: NodeHandle) -> &mut Node {
        self.inner.get_mut(handle.0).expect("dangling node handle")
    }

    /// Puts `node` back into an occupied slot, returning what it replaced.
    pub(crate) fn restore(&mut self, handle: NodeHandle, node: Node) -> Option<Node> {
        self.inner.replace(handle.0, node)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
