//! Escape-analysis integration: teach the connection graph about
//! barrier nodes.
//!
//! Three rules keep barrier instrumentation from pessimizing escape
//! results: barrier nodes are transparent aliases of their value input;
//! the collector-aware atomics classify exactly like their plain
//! counterparts; and the raw store of the previous value into the SATB
//! queue buffer is a thread-local effect, not a heap publication.

use veldc_graph::analysis::{ConnectionGraph, EscapeState, GcEscapeHooks};
use veldc_graph::{AtomicRefKind, BasicType, Graph, NodeId, Op, BARRIER_VALUE_IN};

use crate::runtime::{RuntimeFn, ThreadContext};

/// Hooks implementation handed to the host's connection-graph builder
pub struct VgcEscapeHooks {
    pub tcx: ThreadContext,
}

impl VgcEscapeHooks {
    pub fn new(tcx: ThreadContext) -> VgcEscapeHooks {
        VgcEscapeHooks { tcx }
    }
}

impl GcEscapeHooks for VgcEscapeHooks {
    fn add_to_con_graph(&self, cg: &mut ConnectionGraph, n: NodeId) -> bool {
        let g = cg.g;
        match g.op(n) {
            Op::AtomicRef {
                kind, barriered: true, ..
            } => {
                if kind == AtomicRefKind::CompareAndExchange {
                    // The found value is an object load as far as
                    // points-to analysis cares.
                    cg.add_objload_to_connection_graph(n);
                }
                cg.add_to_congraph_unsafe_access(n);
                true
            }
            Op::EnqueueBarrier => {
                let value = g.input(n, BARRIER_VALUE_IN);
                cg.add_local_var_and_edge(n, EscapeState::NoEscape, value);
                true
            }
            Op::LoadRefBarrier => {
                let value = g.input(n, BARRIER_VALUE_IN);
                cg.add_local_var_and_edge(n, EscapeState::NoEscape, value);
                true
            }
            Op::Store { bt, .. } if bt.is_reference() => {
                // The template's raw store of the previous value into the
                // SATB queue buffer writes thread-local, non-heap memory.
                // Without this filter it would look like a heap
                // publication and globalize otherwise local allocations.
                is_satb_buffer_store(g, &self.tcx, n)
            }
            Op::CallLeaf { name } => {
                // The queue-full slow path hands its argument to the
                // marking queue, the same thread-local destination as
                // the buffer store.
                RuntimeFn::from_name(name) == Some(RuntimeFn::WriteRefFieldPre)
            }
            _ => false,
        }
    }

    fn add_final_edges(&self, cg: &mut ConnectionGraph, n: NodeId) -> bool {
        let g = cg.g;
        match g.op(n) {
            Op::AtomicRef {
                kind, barriered: true, ..
            } => {
                if kind == AtomicRefKind::CompareAndExchange {
                    let addr = g.input(n, 2);
                    cg.add_local_var_and_edge(n, EscapeState::NoEscape, addr);
                }
                cg.add_final_edges_unsafe_access(n)
            }
            Op::EnqueueBarrier | Op::LoadRefBarrier => {
                let value = g.input(n, BARRIER_VALUE_IN);
                cg.add_local_var_and_edge(n, EscapeState::NoEscape, value);
                true
            }
            Op::Store { bt, .. } if bt.is_reference() => {
                is_satb_buffer_store(g, &self.tcx, n)
            }
            Op::CallLeaf { name } => {
                RuntimeFn::from_name(name) == Some(RuntimeFn::WriteRefFieldPre)
            }
            _ => false,
        }
    }

    fn is_barrier_node(&self, g: &Graph, n: NodeId) -> bool {
        g.op(n) == Op::LoadRefBarrier
    }

    fn has_out_with_unsafe_object(&self, g: &Graph, n: NodeId) -> bool {
        g.uses_of(n)
            .iter()
            .any(|&u| matches!(g.op(u), Op::AtomicRef { barriered: true, .. }))
    }
}

/// Recognize the pre-barrier's store of the previous value into the
/// SATB queue buffer: a raw store whose base is loaded from the
/// thread-local buffer slot.
pub fn is_satb_buffer_store(g: &Graph, tcx: &ThreadContext, n: NodeId) -> bool {
    if !g.op(n).is_store() {
        return false;
    }
    let adr = g.input(n, 2);
    if g.op(adr) != Op::AddPtr {
        return false;
    }
    let base = g.input(adr, 0);
    if !matches!(g.op(base), Op::Load { bt: BasicType::RawPtr, .. }) {
        return false;
    }
    let base_adr = g.input(base, 2);
    if g.op(base_adr) != Op::AddPtr {
        return false;
    }
    g.op(g.input(base_adr, 0)) == Op::ThreadLocal
        && g.find_int_con(g.input(base_adr, 1)) == Some(tcx.satb_queue_buffer_offset)
}
