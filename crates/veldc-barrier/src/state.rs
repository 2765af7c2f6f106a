//! Per-compilation barrier bookkeeping.
//!
//! The registry tracks every barrier node that has been emitted but not
//! yet proven dead or expanded. It indexes nodes owned by the
//! compilation's graph; it allocates nothing and never outlives the
//! compilation.

use std::hash::BuildHasherDefault;

use indexmap::IndexSet;
use rustc_hash::FxHasher;
use veldc_util::FxHashSet;

use veldc_graph::{Graph, NodeId, Op};

type FxIndexSet<T> = IndexSet<T, BuildHasherDefault<FxHasher>>;

/// Ordered, duplicate-free collections of pending barrier nodes
#[derive(Default)]
pub struct BarrierSetState {
    enqueue_barriers: FxIndexSet<NodeId>,
    load_reference_barriers: FxIndexSet<NodeId>,
}

impl BarrierSetState {
    pub fn new() -> BarrierSetState {
        BarrierSetState::default()
    }

    pub fn enqueue_barriers_count(&self) -> usize {
        self.enqueue_barriers.len()
    }

    pub fn enqueue_barrier(&self, idx: usize) -> NodeId {
        self.enqueue_barriers[idx]
    }

    /// # Panics
    ///
    /// Panics on a duplicate entry; registering the same barrier twice
    /// is a programming error in the interception layer.
    pub fn add_enqueue_barrier(&mut self, n: NodeId) {
        let inserted = self.enqueue_barriers.insert(n);
        assert!(inserted, "duplicate entry in barrier list: {n:?}");
    }

    pub fn remove_enqueue_barrier(&mut self, n: NodeId) {
        self.enqueue_barriers.shift_remove(&n);
    }

    pub fn load_reference_barriers_count(&self) -> usize {
        self.load_reference_barriers.len()
    }

    pub fn load_reference_barrier(&self, idx: usize) -> NodeId {
        self.load_reference_barriers[idx]
    }

    /// # Panics
    ///
    /// Panics on a duplicate entry.
    pub fn add_load_reference_barrier(&mut self, n: NodeId) {
        let inserted = self.load_reference_barriers.insert(n);
        assert!(inserted, "duplicate entry in barrier list: {n:?}");
    }

    pub fn remove_load_reference_barrier(&mut self, n: NodeId) {
        self.load_reference_barriers.shift_remove(&n);
    }

    pub fn is_empty(&self) -> bool {
        self.enqueue_barriers.is_empty() && self.load_reference_barriers.is_empty()
    }

    /// Index a freshly created node if it is a barrier kind
    pub fn register_potential_barrier_node(&mut self, g: &Graph, n: NodeId) {
        match g.op(n) {
            Op::EnqueueBarrier => self.add_enqueue_barrier(n),
            Op::LoadRefBarrier => self.add_load_reference_barrier(n),
            _ => {}
        }
    }

    /// Drop a node from whichever collection holds it
    pub fn unregister_potential_barrier_node(&mut self, g: &Graph, n: NodeId) {
        match g.op(n) {
            Op::EnqueueBarrier => self.remove_enqueue_barrier(n),
            Op::LoadRefBarrier => self.remove_load_reference_barrier(n),
            _ => {}
        }
    }

    /// Drop every pending barrier that is not in the live-node set.
    ///
    /// Both collections are walked in reverse index order so removal
    /// never invalidates the indices still to be visited.
    pub fn sweep_useless(&mut self, live: &FxHashSet<NodeId>) {
        let mut dropped = 0usize;
        for i in (0..self.enqueue_barriers.len()).rev() {
            let n = self.enqueue_barriers[i];
            if !live.contains(&n) {
                let _ = self.enqueue_barriers.shift_remove_index(i);
                dropped += 1;
            }
        }
        for i in (0..self.load_reference_barriers.len()).rev() {
            let n = self.load_reference_barriers[i];
            if !live.contains(&n) {
                let _ = self.load_reference_barriers.shift_remove_index(i);
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::debug!("swept {dropped} dead barrier nodes from registry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veldc_graph::{Op, RefTy, Ty};

    fn barrier_node(g: &mut Graph, op: Op) -> NodeId {
        let top = g.top;
        let value = g.null_ref();
        g.add(op, Ty::Ref(RefTy::BOTTOM), &[top, top, value])
    }

    #[test]
    fn test_add_and_positional_access() {
        let mut g = Graph::new();
        let a = barrier_node(&mut g, Op::EnqueueBarrier);
        let b = barrier_node(&mut g, Op::EnqueueBarrier);

        let mut state = BarrierSetState::new();
        state.add_enqueue_barrier(a);
        state.add_enqueue_barrier(b);
        assert_eq!(state.enqueue_barriers_count(), 2);
        assert_eq!(state.enqueue_barrier(0), a);
        assert_eq!(state.enqueue_barrier(1), b);
    }

    #[test]
    #[should_panic(expected = "duplicate entry in barrier list")]
    fn test_duplicate_insert_panics() {
        let mut g = Graph::new();
        let a = barrier_node(&mut g, Op::LoadRefBarrier);
        let mut state = BarrierSetState::new();
        state.add_load_reference_barrier(a);
        state.add_load_reference_barrier(a);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut g = Graph::new();
        let a = barrier_node(&mut g, Op::EnqueueBarrier);
        let mut state = BarrierSetState::new();
        state.remove_enqueue_barrier(a);
        assert_eq!(state.enqueue_barriers_count(), 0);
    }

    #[test]
    fn test_sweep_useless_keeps_live() {
        let mut g = Graph::new();
        let a = barrier_node(&mut g, Op::LoadRefBarrier);
        let b = barrier_node(&mut g, Op::LoadRefBarrier);

        let mut state = BarrierSetState::new();
        state.add_load_reference_barrier(a);
        state.add_load_reference_barrier(b);

        let mut live = FxHashSet::default();
        live.insert(a);
        state.sweep_useless(&live);

        assert_eq!(state.load_reference_barriers_count(), 1);
        assert_eq!(state.load_reference_barrier(0), a);
    }
}
