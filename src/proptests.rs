use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::{BTreeMap, HashSet};

fn tiny() -> MvpConfig {
    MvpConfig {
        branch_factor: 2,
        path_length: 2,
        leaf_cap: 4,
        levels_per_node: 2,
        sync_threshold: 8,
    }
}

fn validate_tree<D: Distance>(t: &MvpTree<D>) {
    let config = *t.config();
    let mut seen: HashSet<PointHandle> = HashSet::new();
    let mut live_placed = 0usize;

    let mut stack: Vec<NodeHandle> = t.root().into_iter().collect();
    while let Some(handle) = stack.pop() {
        let node = t.node(handle);
        let vantage = node.vantage_points();
        let data = node.data_points();

        if node.is_leaf() {
            assert!(!vantage.is_empty(), "leaf without vantage points");
            assert!(vantage.len() <= config.path_length);
            assert!(data.len() <= config.leaf_cap, "leaf over capacity");
            assert!(
                data.is_empty() || vantage.len() == config.path_length,
                "stored points before all vantage slots are taken"
            );
            assert_eq!(node.children().count(), 0);
        } else {
            assert_eq!(vantage.len(), config.levels_per_node);
            assert!(data.is_empty());
            assert!(node.child(config.fanout()).is_err());
        }

        for &p in vantage.iter().chain(data) {
            assert!(seen.insert(p), "point handle placed twice");
            if t.points().is_active(p) {
                live_placed += 1;
            }
        }
        stack.extend(node.children());
    }

    assert_eq!(
        seen.len() + t.pending(),
        t.points().len(),
        "every allocated point is placed or buffered"
    );
    assert!(live_placed <= t.len());
}

fn linear_scan(model: &BTreeMap<i64, u64>, target: u64, radius: f64) -> Vec<(i64, f64)> {
    let mut hits: Vec<(i64, f64)> = model
        .iter()
        .map(|(&id, &v)| (id, Hamming.distance(v, target)))
        .filter(|&(_, d)| d <= radius)
        .collect();
    hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    hits
}

fn canonical(results: &[Neighbor]) -> Vec<(i64, f64)> {
    let mut hits: Vec<(i64, f64)> = results.iter().map(|n| (n.id, n.distance)).collect();
    hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    hits
}

const CENTERS: [u64; 4] = [
    0,
    u64::MAX,
    0xAAAA_AAAA_AAAA_AAAA,
    0x0123_4567_89AB_CDEF,
];

fn id_strategy() -> impl Strategy<Value = i64> {
    0i64..64
}

fn fingerprint_strategy() -> impl Strategy<Value = u64> {
    // A few bit flips away from a handful of centers, so small radii match.
    (0usize..CENTERS.len(), prop::collection::vec(0u32..64, 0..6)).prop_map(|(c, flips)| {
        flips
            .into_iter()
            .fold(CENTERS[c], |v, bit| v ^ (1u64 << bit))
    })
}

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    #[proptest(weight = 50)]
    Insert(
        #[proptest(strategy = "id_strategy()")] i64,
        #[proptest(strategy = "fingerprint_strategy()")] u64,
    ),
    #[proptest(weight = 20)]
    Delete(#[proptest(strategy = "id_strategy()")] i64),
    #[proptest(weight = 20)]
    Query(
        #[proptest(strategy = "fingerprint_strategy()")] u64,
        #[proptest(strategy = "0u8..=12")] u8,
    ),
    #[proptest(weight = 9)]
    Sync,
    #[proptest(weight = 1)]
    Clear,
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence_with_linear_scan(ops in prop::collection::vec(any::<Op>(), 0..=600)) {
        let mut t = MvpTree::with_config(tiny(), Hamming).unwrap();
        let mut m: BTreeMap<i64, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(id, value) => {
                    t.add(id, value).unwrap();
                    m.insert(id, value);
                }
                Op::Delete(id) => {
                    let got_t = t.delete(id).map(|p| p.value);
                    let got_m = m.remove(&id);
                    prop_assert_eq!(got_t, got_m);
                }
                Op::Query(target, radius) => {
                    t.sync().unwrap();
                    let radius = f64::from(radius);
                    let results = t.query(target, radius);
                    prop_assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
                    prop_assert_eq!(canonical(&results), linear_scan(&m, target, radius));
                }
                Op::Sync => {
                    t.sync().unwrap();
                }
                Op::Clear => {
                    t.clear();
                    m.clear();
                }
            }

            prop_assert_eq!(t.len(), m.len());
        }

        validate_tree(&t);
        for (&id, &value) in &m {
            prop_assert_eq!(t.lookup(id).map(|p| p.value), Some(value));
        }
        let expected: Vec<(i64, u64)> = m.iter().map(|(&id, &v)| (id, v)).collect();
        prop_assert_eq!(t.snapshot().into_entries(), expected);
    }

    #[test]
    fn prop_restore_answers_like_source_tree(
        entries in prop::collection::btree_map(id_strategy(), fingerprint_strategy(), 0..64),
        target in fingerprint_strategy(),
        radius in 0u8..=16,
    ) {
        let mut t = MvpTree::with_config(tiny(), Hamming).unwrap();
        t.add_batch(entries.iter().map(|(&id, &v)| (id, v))).unwrap();
        validate_tree(&t);

        let mut buf = Vec::new();
        t.snapshot().write_to(&mut buf).unwrap();
        let snap = Snapshot::read_from(buf.as_slice()).unwrap();
        let restored = MvpTree::restore(&snap, tiny(), Hamming).unwrap();
        validate_tree(&restored);

        let radius = f64::from(radius);
        prop_assert_eq!(
            canonical(&restored.query(target, radius)),
            canonical(&t.query(target, radius))
        );
    }
}

/// Calls `f` once per ordering of `items`, swapping in place (Heap's algorithm).
fn each_ordering<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    let mut order = items.to_vec();
    let mut swaps = vec![0usize; order.len()];
    f(order.clone());
    let mut i = 1;
    while i < order.len() {
        if swaps[i] < i {
            let j = if i % 2 == 0 { 0 } else { swaps[i] };
            order.swap(j, i);
            f(order.clone());
            swaps[i] += 1;
            i = 1;
        } else {
            swaps[i] = 0;
            i += 1;
        }
    }
}

#[test]
fn each_ordering_visits_every_ordering_once() {
    let mut seen = HashSet::new();
    let mut calls = 0;
    each_ordering(&[1, 2, 3, 4, 5, 6], |order| {
        calls += 1;
        seen.insert(order);
    });
    assert_eq!(calls, 720);
    assert_eq!(seen.len(), 720);

    let mut single = Vec::new();
    each_ordering(&['a'], |order| single.push(order));
    assert_eq!(single, vec![vec!['a']]);
}

#[test]
fn exhaustive_insert_order_small_set() {
    // Seven points overflow a tiny leaf, so the tree shape depends on order.
    let entries: Vec<(i64, u64)> = vec![
        (1, 0b0000),
        (2, 0b0001),
        (3, 0b0011),
        (4, 0b0111),
        (5, 0b1111),
        (6, 0b1110),
        (7, u64::MAX),
    ];
    let model: BTreeMap<i64, u64> = entries.iter().copied().collect();

    each_ordering(&entries, |perm| {
        let mut t = MvpTree::with_config(tiny(), Hamming).unwrap();
        t.add_batch(perm).unwrap();
        validate_tree(&t);

        for target in [0u64, 0b0101, u64::MAX] {
            for radius in [0.0, 1.0, 2.0, 4.0, 64.0] {
                assert_eq!(
                    canonical(&t.query(target, radius)),
                    linear_scan(&model, target, radius)
                );
            }
        }
    });
}

#[test]
fn exhaustive_delete_order_small_set() {
    let mut base = MvpTree::with_config(tiny(), Hamming).unwrap();
    let mut base_model: BTreeMap<i64, u64> = BTreeMap::new();
    for id in 0..6i64 {
        let v = (1u64 << (id * 3)) - 1;
        base.add(id, v).unwrap();
        base_model.insert(id, v);
    }
    base.sync().unwrap();
    let ids: Vec<i64> = base_model.keys().copied().collect();

    each_ordering(&ids, |perm| {
        let mut t = base.clone();
        let mut m = base_model.clone();

        for id in perm {
            assert_eq!(t.delete(id).map(|p| p.value), m.remove(&id));
            assert_eq!(t.len(), m.len());
            assert_eq!(canonical(&t.query(0, 64.0)), linear_scan(&m, 0, 64.0));
            validate_tree(&t);
        }
        assert!(t.is_empty());
        assert!(t.query(0, 64.0).is_empty());
    });
}
