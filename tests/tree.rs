//! End-to-end workload: a balanced binary aggregation tree.
//!
//! 2^DEPTH leaves feed a tree of sum atoms. Each mutation increments one
//! leaf and reads the root; only the chain from that leaf to the root may
//! recompute, never the whole tree.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use atom_flow::{Atom, AtomId, ComputeResult, Scope, Tracer};

const DEPTH: u32 = 6;
const MUTATIONS: usize = 100;

#[derive(Default)]
struct ExecutionCounter {
    executions: AtomicUsize,
}

impl Tracer for ExecutionCounter {
    fn on_compute_end(&self, _atom: &AtomId, result: ComputeResult) {
        // count actual read-function executions, not verify-skips
        if matches!(result, ComputeResult::Changed | ComputeResult::Unchanged) {
            self.executions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn build(level: u32, leaves: &mut Vec<Atom<i64>>) -> Atom<i64> {
    if level == DEPTH {
        let leaf = Atom::value(0_i64);
        leaves.push(leaf.clone());
        leaf
    } else {
        let lhs = build(level + 1, leaves);
        let rhs = build(level + 1, leaves);
        Atom::computed(move |get| Ok(get.get(&lhs)? + get.get(&rhs)?))
    }
}

#[test]
fn root_tracks_leaf_increments_in_bounded_work() {
    let counter = Arc::new(ExecutionCounter::default());
    let scope = Scope::builder().tracer(counter.clone()).build();

    let mut leaves = Vec::new();
    let root = build(0, &mut leaves);
    assert_eq!(leaves.len(), 1 << DEPTH);

    assert_eq!(scope.get(&root).unwrap(), 0);
    let initial_executions = counter.executions.load(Ordering::Relaxed);
    // the full tree computes exactly once up front
    assert_eq!(initial_executions, (1 << DEPTH) - 1);

    let observed = Arc::new(AtomicI64::new(0));
    let _binding = scope.bind(&root, {
        let observed = observed.clone();
        move |v: &i64| observed.store(*v, Ordering::Relaxed)
    });

    for i in 0..MUTATIONS {
        let leaf = &leaves[(3 * i) % leaves.len()];
        let current = scope.get(leaf).unwrap();
        scope.set(leaf, current + 1).unwrap();
        assert_eq!(scope.get(&root).unwrap(), i as i64 + 1);
    }

    assert_eq!(scope.get(&root).unwrap(), MUTATIONS as i64);
    assert_eq!(observed.load(Ordering::Relaxed), MUTATIONS as i64);

    // each mutation recomputes the leaf-to-root chain (DEPTH sum atoms), not
    // the whole tree: O(K * N), nowhere near O(K * 2^N)
    let total = counter.executions.load(Ordering::Relaxed);
    let per_mutation = total - initial_executions;
    assert!(
        per_mutation <= MUTATIONS * (DEPTH as usize + 1),
        "recomputed too much: {per_mutation} executions for {MUTATIONS} mutations"
    );
    assert!(per_mutation >= MUTATIONS * DEPTH as usize);
}

#[test]
fn every_leaf_contributes_to_the_root() {
    let scope = Scope::new();
    let mut leaves = Vec::new();
    let root = build(0, &mut leaves);

    for leaf in &leaves {
        scope.set(leaf, 2).unwrap();
    }
    assert_eq!(scope.get(&root).unwrap(), 2 * (1 << DEPTH));
}
