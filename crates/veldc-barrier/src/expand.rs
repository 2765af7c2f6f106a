//! Late barrier expansion: lower barrier macro nodes to explicit
//! control flow before code generation.
//!
//! Runs inside the host's loop-optimization pipeline as two sequential
//! modes: `Expand` pins every pending barrier to its recorded control
//! point and lowers it (enqueue barriers to the SATB template,
//! load-reference barriers to an evacuation-check-and-call, barriered
//! atomics to a bounded two-attempt compare/heal/retry shape), and
//! `PostExpand` re-runs local simplification over the control flow the
//! lowering introduced. Expansion is mandatory; a load-reference
//! barrier reaching final reshaping afterwards is a fatal fault.

use veldc_graph::{
    AtomicRefKind, BasicType, CmpKind, Graph, GraphBuilder, MemOrd, NodeId, Op, RefTy, RefWidth,
    Ty, RAW_ALIAS,
};

use crate::access::BarrierSet;
use crate::peephole::run_peephole;
use crate::runtime::{GcState, RuntimeFn, ThreadContext};
use crate::satb::{PROB_FAIR, PROB_STATE_CHANGING};

/// Barrier-specific modes of the loop-optimization pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOptsMode {
    /// Pin and lower all pending barrier macro nodes
    Expand,
    /// Re-simplify the control flow introduced by expansion
    PostExpand,
}

/// Pipeline entry point; returns true (the mode was handled here)
pub fn optimize_loops(bs: &mut BarrierSet, g: &mut Graph, mode: LoopOptsMode) -> bool {
    match mode {
        LoopOptsMode::Expand => {
            pin_and_expand(bs, g);
            true
        }
        LoopOptsMode::PostExpand => {
            optimize_after_expansion(g, &bs.tcx);
            true
        }
    }
}

/// Lower every pending barrier node, draining the registry
///
/// # Panics
///
/// Panics when a barrier was created without a recorded control point,
/// or the registry is not empty afterwards.
pub fn pin_and_expand(bs: &mut BarrierSet, g: &mut Graph) {
    // Dead barriers first, so expansion only touches reachable ones.
    let live = g.live_set();
    bs.state.sweep_useless(&live);

    let enqueues: Vec<NodeId> = (0..bs.state.enqueue_barriers_count())
        .map(|i| bs.state.enqueue_barrier(i))
        .collect();
    for n in &enqueues {
        expand_enqueue_barrier(bs, g, *n);
        bs.state.remove_enqueue_barrier(*n);
    }

    let lrbs: Vec<NodeId> = (0..bs.state.load_reference_barriers_count())
        .map(|i| bs.state.load_reference_barrier(i))
        .collect();
    for n in &lrbs {
        expand_load_ref_barrier(bs, g, *n);
        bs.state.remove_load_reference_barrier(*n);
    }

    let atomics: Vec<NodeId> = g
        .node_ids()
        .filter(|&n| matches!(g.op(n), Op::AtomicRef { barriered: true, .. }))
        .filter(|&n| live.contains(&n))
        .collect();
    for n in &atomics {
        expand_barriered_atomic(bs, g, *n);
    }

    assert!(
        bs.state.is_empty(),
        "barrier registry not drained by expansion"
    );
    log::debug!(
        "expanded {} enqueue barriers, {} load-reference barriers, {} barriered atomics",
        enqueues.len(),
        lrbs.len(),
        atomics.len()
    );
}

/// Local cleanup over post-expansion control flow
pub fn optimize_after_expansion(g: &mut Graph, tcx: &ThreadContext) -> bool {
    run_peephole(g, tcx)
}

/// Users of `old` at snapshot time, minus the barrier being expanded
/// and minus everything the barrier's own computation depends on (those
/// must stay above the spliced-in template)
fn snapshot_users(
    g: &Graph,
    old: NodeId,
    except: NodeId,
    deps: &veldc_util::FxHashSet<NodeId>,
) -> Vec<NodeId> {
    g.uses_of(old)
        .iter()
        .copied()
        .filter(|&u| u != except && !deps.contains(&u))
        .collect()
}

/// Transitive input closure of `n`
fn input_closure(g: &Graph, n: NodeId) -> veldc_util::FxHashSet<NodeId> {
    let mut set = veldc_util::FxHashSet::default();
    let mut worklist = vec![n];
    set.insert(n);
    while let Some(x) = worklist.pop() {
        for &i in g.inputs(x) {
            if set.insert(i) {
                worklist.push(i);
            }
        }
    }
    set
}

/// Rewire the snapshotted users of `old` onto `new`. Phis and initial
/// parameters stay put: their anchoring input is structural, not an
/// execution ordering.
fn splice_users(g: &mut Graph, users: &[NodeId], old: NodeId, new: NodeId) {
    if old == new {
        return;
    }
    for &u in users {
        if g.is_dead(u) || matches!(g.op(u), Op::Phi | Op::Parm(_)) {
            continue;
        }
        for slot in 0..g.num_inputs(u) {
            if g.input(u, slot) == old {
                g.set_input(u, slot, new);
            }
        }
    }
}

fn pinned_point(g: &Graph, n: NodeId) -> (NodeId, NodeId) {
    let ctrl = g.input(n, 0);
    let mem = g.input(n, 1);
    assert!(ctrl != g.top, "barrier was never pinned to a control point");
    assert!(mem != g.top, "barrier carries no recorded memory state");
    (ctrl, mem)
}

/// Lower a store-value enqueue barrier: emit the SATB logging template
/// for its value at the recorded point, then dissolve the node
fn expand_enqueue_barrier(bs: &mut BarrierSet, g: &mut Graph, n: NodeId) {
    if g.is_dead(n) {
        return;
    }
    let (ctrl, mem) = pinned_point(g, n);
    let value = g.input(n, veldc_graph::BARRIER_VALUE_IN);

    let deps = input_closure(g, n);
    let ctrl_users = snapshot_users(g, ctrl, n, &deps);
    let mem_users = snapshot_users(g, mem, n, &deps);

    let mut kit = GraphBuilder::at(g, ctrl, mem);
    let top = kit.top();
    bs.satb_write_barrier_pre(
        &mut kit,
        false,
        top,
        top,
        RAW_ALIAS,
        Ty::Ref(RefTy::BOTTOM),
        value,
        BasicType::Ref,
    );
    let exit_ctrl = kit.ctrl();
    let exit_mem = kit.memory(RAW_ALIAS);

    splice_users(g, &ctrl_users, ctrl, exit_ctrl);
    splice_users(g, &mem_users, mem, exit_mem);
    g.replace_node(n, value);
}

/// Lower a load-reference barrier to the evacuation check:
///
/// ```text
/// if (thread.gc_state & EVACUATION) != 0:      // predicted not taken
///     value = vgc_load_reference_barrier(value)
/// ```
fn expand_load_ref_barrier(bs: &mut BarrierSet, g: &mut Graph, n: NodeId) {
    if g.is_dead(n) {
        return;
    }
    let (ctrl, mem) = pinned_point(g, n);
    let value = g.input(n, veldc_graph::BARRIER_VALUE_IN);
    let value_ty = g.ty(value);

    let deps = input_closure(g, n);
    let ctrl_users = snapshot_users(g, ctrl, n, &deps);
    let mem_users = snapshot_users(g, mem, n, &deps);

    let mut kit = GraphBuilder::at(g, ctrl, mem);
    let evacuating = evac_test(&mut kit, &bs.tcx);

    let before = kit.save_state();
    let (evac_t, evac_f) = kit.if_then_else(evacuating, PROB_STATE_CHANGING);
    kit.set_ctrl(evac_t);
    let call = kit.make_leaf_call(RuntimeFn::LoadReferenceBarrier.name(), &[value]);
    let fixed = kit.call_result(call, value_ty);
    let slow_state = kit.save_state();

    kit.restore_state(before.with_ctrl(evac_f));
    let fast_state = kit.save_state();

    let region = kit.merge(slow_state, fast_state);
    let result = kit.phi2(region, value_ty, fixed, value);

    let exit_ctrl = kit.ctrl();
    let exit_mem = kit.memory(RAW_ALIAS);

    splice_users(g, &ctrl_users, ctrl, exit_ctrl);
    splice_users(g, &mem_users, mem, exit_mem);
    g.replace_node(n, result);
}

/// Lower a collector-aware atomic to a bounded two-attempt shape: try
/// the plain atomic; on failure with evacuation running, heal the
/// current slot value through the slow path and retry once with the
/// healed comparison. Failing the second attempt reports failure, which
/// the caller must treat as a legitimately lost race.
fn expand_barriered_atomic(bs: &mut BarrierSet, g: &mut Graph, n: NodeId) {
    let Op::AtomicRef {
        kind, width, ord, ..
    } = g.op(n)
    else {
        unreachable!("not a barriered atomic");
    };

    let ctrl = g.input(n, 0);
    let mem = g.input(n, 1);
    let addr = g.input(n, 2);
    let expected = g.input(n, 3);
    let new_val = g.input(n, 4);
    let res_ty = g.ty(n);
    let mem_proj = g.proj_out(n, Op::ScMemProj);

    let deps = input_closure(g, n);
    let ctrl_users = snapshot_users(g, ctrl, n, &deps);

    // Post-expansion memory precision is coarsened to the atomic's own
    // chain; the slow call and the retry both thread through it.
    let mut kit = GraphBuilder::at(g, ctrl, mem);

    let first = kit.atomic_ref(
        kind, width, false, ord, RAW_ALIAS, addr, expected, new_val, res_ty,
    );

    let result = match kind {
        AtomicRefKind::CompareAndSwap | AtomicRefKind::WeakCompareAndSwap => {
            expand_cas_retry(bs, &mut kit, kind, width, ord, addr, expected, new_val, first)
        }
        AtomicRefKind::CompareAndExchange => {
            expand_cae_retry(bs, &mut kit, kind, width, ord, addr, expected, new_val, first, res_ty)
        }
    };

    let exit_ctrl = kit.ctrl();
    let exit_mem = kit.memory(RAW_ALIAS);

    splice_users(g, &ctrl_users, ctrl, exit_ctrl);
    if let Some(mp) = mem_proj {
        g.replace_node(mp, exit_mem);
    }
    g.replace_node(n, result);
}

/// Failure arm of a boolean compare-and-swap
#[allow(clippy::too_many_arguments)]
fn expand_cas_retry(
    bs: &BarrierSet,
    kit: &mut GraphBuilder<'_>,
    kind: AtomicRefKind,
    width: RefWidth,
    ord: MemOrd,
    addr: NodeId,
    expected: NodeId,
    new_val: NodeId,
    first: NodeId,
) -> NodeId {
    let zero = kit.con_int(0);
    let failed = kit.cmp(CmpKind::Eq, first, zero);

    let before = kit.save_state();
    let (fail_t, ok_f) = kit.if_then_else(failed, PROB_FAIR);
    kit.set_ctrl(fail_t);

    // Failure may be spurious: the slot can hold the stale copy of the
    // object `expected` names. Only evacuation can cause that.
    let evacuating = evac_test(kit, &bs.tcx);
    let before_evac = kit.save_state();
    let (evac_t, evac_f) = kit.if_then_else(evacuating, PROB_STATE_CHANGING);
    kit.set_ctrl(evac_t);

    let slot_bt = match width {
        RefWidth::Narrow => BasicType::NarrowRef,
        RefWidth::Wide => BasicType::Ref,
    };
    let slot_ty = match width {
        RefWidth::Narrow => Ty::NarrowRef(RefTy::BOTTOM),
        RefWidth::Wide => Ty::Ref(RefTy::BOTTOM),
    };
    let cur = kit.load(RAW_ALIAS, addr, slot_ty, slot_bt, MemOrd::Unordered);
    let cur_wide = widen(kit, width, cur);
    let call = kit.make_leaf_call(RuntimeFn::LoadReferenceBarrier.name(), &[cur_wide]);
    let healed = kit.call_result(call, Ty::Ref(RefTy::BOTTOM));
    let expected_wide = widen(kit, width, expected);
    let same_object = kit.cmp(CmpKind::Eq, healed, expected_wide);

    let before_retry = kit.save_state();
    let (retry_t, retry_f) = kit.if_then_else(same_object, PROB_FAIR);
    kit.set_ctrl(retry_t);
    let second = kit.atomic_ref(kind, width, false, ord, RAW_ALIAS, addr, cur, new_val, Ty::Bool);
    let retry_state = kit.save_state();

    kit.restore_state(before_retry.with_ctrl(retry_f));
    let genuine_fail = kit.g.con_bool(false);
    let lost_state = kit.save_state();

    let r1 = kit.merge(retry_state, lost_state);
    let retry_result = kit.phi2(r1, Ty::Bool, second, genuine_fail);
    let evac_state = kit.save_state();

    kit.restore_state(before_evac.with_ctrl(evac_f));
    let stable_state = kit.save_state();

    let r2 = kit.merge(evac_state, stable_state);
    let fail_result = kit.phi2(r2, Ty::Bool, retry_result, first);
    let fail_state = kit.save_state();

    kit.restore_state(before.with_ctrl(ok_f));
    let ok_state = kit.save_state();

    let r3 = kit.merge(fail_state, ok_state);
    kit.phi2(r3, Ty::Bool, fail_result, first)
}

/// Failure arm of a compare-and-exchange, whose result is the found value
#[allow(clippy::too_many_arguments)]
fn expand_cae_retry(
    bs: &BarrierSet,
    kit: &mut GraphBuilder<'_>,
    kind: AtomicRefKind,
    width: RefWidth,
    ord: MemOrd,
    addr: NodeId,
    expected: NodeId,
    new_val: NodeId,
    first: NodeId,
    res_ty: Ty,
) -> NodeId {
    let mismatch = kit.cmp(CmpKind::Ne, first, expected);

    let before = kit.save_state();
    let (fail_t, ok_f) = kit.if_then_else(mismatch, PROB_FAIR);
    kit.set_ctrl(fail_t);

    let evacuating = evac_test(kit, &bs.tcx);
    let before_evac = kit.save_state();
    let (evac_t, evac_f) = kit.if_then_else(evacuating, PROB_STATE_CHANGING);
    kit.set_ctrl(evac_t);

    let first_wide = widen(kit, width, first);
    let call = kit.make_leaf_call(RuntimeFn::LoadReferenceBarrier.name(), &[first_wide]);
    let healed = kit.call_result(call, Ty::Ref(RefTy::BOTTOM));
    let expected_wide = widen(kit, width, expected);
    let same_object = kit.cmp(CmpKind::Eq, healed, expected_wide);

    let before_retry = kit.save_state();
    let (retry_t, retry_f) = kit.if_then_else(same_object, PROB_FAIR);
    kit.set_ctrl(retry_t);
    // Retry comparing against the raw stale value actually in the slot.
    let second = kit.atomic_ref(kind, width, false, ord, RAW_ALIAS, addr, first, new_val, res_ty);
    let retry_state = kit.save_state();

    kit.restore_state(before_retry.with_ctrl(retry_f));
    let lost_state = kit.save_state();

    let r1 = kit.merge(retry_state, lost_state);
    let retry_result = kit.phi2(r1, res_ty, second, first);
    let evac_state = kit.save_state();

    kit.restore_state(before_evac.with_ctrl(evac_f));
    let stable_state = kit.save_state();

    let r2 = kit.merge(evac_state, stable_state);
    let fail_result = kit.phi2(r2, res_ty, retry_result, first);
    let fail_state = kit.save_state();

    kit.restore_state(before.with_ctrl(ok_f));
    let ok_state = kit.save_state();

    let r3 = kit.merge(fail_state, ok_state);
    kit.phi2(r3, res_ty, fail_result, first)
}

/// `(thread.gc_state & EVACUATION) != 0`
fn evac_test(kit: &mut GraphBuilder<'_>, tcx: &ThreadContext) -> NodeId {
    let tls = kit.thread_local();
    let adr = kit.add_ptr_con(tls, tcx.gc_state_offset);
    let ld = kit.load(RAW_ALIAS, adr, Ty::Int, BasicType::Byte, MemOrd::Unordered);
    let mask = kit.con_int(GcState::EVACUATION);
    let masked = kit.and_int(ld, mask);
    let zero = kit.con_int(0);
    kit.cmp(CmpKind::Ne, masked, zero)
}

fn widen(kit: &mut GraphBuilder<'_>, width: RefWidth, v: NodeId) -> NodeId {
    match width {
        RefWidth::Wide => v,
        RefWidth::Narrow => {
            let rt = kit.g.ty(v).ref_ty().unwrap_or(RefTy::BOTTOM);
            kit.g.add(Op::CastWide, Ty::Ref(rt), &[v])
        }
    }
}
