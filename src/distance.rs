//! Distance functions over 64-bit fingerprints.
//!
//! Every pruning rule in the tree relies on the triangle inequality
//! `d(x, z) <= d(x, y) + d(y, z)`, so a [`Distance`] must be a true metric:
//! non-negative, symmetric, and zero only between equal fingerprints.
//! A function that breaks this still builds a tree, but queries may then
//! miss points.

/// A metric over fingerprints.
pub trait Distance {
    fn distance(&self, a: u64, b: u64) -> f64;
}

/// Hamming distance: population count of `a ^ b`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Hamming;

impl Distance for Hamming {
    #[inline]
    fn distance(&self, a: u64, b: u64) -> f64 {
        f64::from((a ^ b).count_ones())
    }
}

impl<F> Distance for F
where
    F: Fn(u64, u64) -> f64,
{
    #[inline]
    fn distance(&self, a: u64, b: u64) -> f64 {
        self(a, b)
    }
}

/// Counters collected by a single query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Distance function evaluations.
    pub distance_ops: u64,
    /// Nodes whose contents were examined.
    pub nodes_visited: u64,
}

/// A metric plus the evaluation counter of the operation using it.
///
/// One probe lives for one query or one batch flush; nothing is shared
/// between calls.
pub(crate) struct Probe<'a, D: ?Sized> {
    metric: &'a D,
    pub(crate) stats: QueryStats,
}

impl<'a, D: Distance + ?Sized> Probe<'a, D> {
    pub(crate) fn new(metric: &'a D) -> Self {
        Self {
            metric,
            stats: QueryStats::default(),
        }
    }

    #[inline]
    pub(crate) fn measure(&mut self, a: u64, b: u64) -> f64 {
        self.stats.distance_ops += 1;
        self.metric.distance(a, b)
    }
}
