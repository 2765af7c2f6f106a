//! SATB pre-write barrier: template emission and elimination.
//!
//! Snapshot-at-the-beginning marking requires the previous value of a
//! reference slot to reach the collector's log before the overwrite
//! becomes visible. The emitted shape, guarded so the common
//! not-marking case falls straight through:
//!
//! ```text
//! if (thread.gc_state & MARKING) != 0:     // predicted not taken
//!     if do_load: pre_val = load(addr)     // old value not materialized yet
//!     if pre_val != null:
//!         index = thread.satb_index
//!         if index != 0:                   // predicted taken: queue has room
//!             index -= WORD
//!             thread.satb_buffer[index] = pre_val
//!             thread.satb_index = index
//!         else:
//!             vgc_wb_pre(pre_val, thread)  // queue full, call out
//! ```
//!
//! Emission is skipped entirely when a bounded backward walk of the
//! memory chain proves the slot still holds its allocation-time zero:
//! the collector never needs to see a value that was never installed.

use veldc_graph::{
    AliasIdx, BasicType, CmpKind, Graph, GraphBuilder, MemOrd, NodeId, Op, Ty, RAW_ALIAS,
};

use crate::access::BarrierSet;
use crate::runtime::{GcState, RuntimeFn, ThreadContext, BYTES_PER_WORD};

/// Probability that the collector state test falls through (steady
/// state: not marking, queue not full). Tuning value, not semantics.
pub const PROB_STATE_STABLE: f32 = 0.999;
/// Complement of [`PROB_STATE_STABLE`]
pub const PROB_STATE_CHANGING: f32 = 1.0 - PROB_STATE_STABLE;
/// No-information branch probability
pub const PROB_FAIR: f32 = 0.5;

/// Hop budget of the pre-barrier elimination walk; running out means
/// conservative emission
pub const ELIM_WALK_BUDGET: usize = 50;

/// Widest raw store that can cover a slot during tile initialization
const MAX_STORE_BYTES: i64 = 8;

impl BarrierSet {
    /// SATB-gated entry point; no-op when the barrier is configured off
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn write_barrier_pre(
        &mut self,
        kit: &mut GraphBuilder<'_>,
        do_load: bool,
        obj: NodeId,
        adr: NodeId,
        alias: AliasIdx,
        val_ty: Ty,
        pre_val: NodeId,
        bt: BasicType,
    ) {
        if self.flags.satb_barrier {
            self.satb_write_barrier_pre(kit, do_load, obj, adr, alias, val_ty, pre_val, bt);
        }
    }

    /// Emit the pre-barrier template, or prove it unnecessary.
    ///
    /// With `do_load` the previous value is loaded from `adr` inside the
    /// marking branch; otherwise `pre_val` must already be materialized
    /// and `obj`/`adr`/`alias`/`val_ty` are unused (pass top).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn satb_write_barrier_pre(
        &mut self,
        kit: &mut GraphBuilder<'_>,
        do_load: bool,
        obj: NodeId,
        adr: NodeId,
        alias: AliasIdx,
        val_ty: Ty,
        pre_val_in: NodeId,
        bt: BasicType,
    ) {
        let top = kit.top();
        if do_load {
            assert!(obj != top, "must have a base");
            assert!(adr != top, "where are we loading from?");
            assert!(pre_val_in == top, "loaded already?");

            if self.satb_can_remove_pre_barrier(kit, adr, bt, alias) {
                log::debug!("pre-barrier elided: slot still holds allocation zero");
                return;
            }
        } else {
            assert!(pre_val_in != top, "must be loaded already");
            // Overwriting a known null installs nothing the collector
            // could lose.
            if kit.g.op(pre_val_in) == Op::NullRef {
                return;
            }
            assert!(
                kit.g.ty(pre_val_in).is_ref(),
                "previous value must be a reference"
            );
        }
        assert!(bt.is_reference(), "reference slots only");

        let tcx = self.tcx;
        let tls = kit.thread_local();
        let zero = kit.con_int(0);

        let index_adr = kit.add_ptr_con(tls, tcx.satb_queue_index_offset);
        let buffer_adr = kit.add_ptr_con(tls, tcx.satb_queue_buffer_offset);

        let gc_state_adr = kit.add_ptr_con(tls, tcx.gc_state_offset);
        let ld = kit.load(
            RAW_ALIAS,
            gc_state_adr,
            Ty::Int,
            BasicType::Byte,
            MemOrd::Unordered,
        );
        debug_assert!(
            is_gc_state_load(kit.g, &tcx, ld),
            "should match the gc-state load shape"
        );
        let marking_mask = kit.con_int(GcState::MARKING);
        let marking = kit.and_int(ld, marking_mask);

        let mut slow_call = None;

        let is_marking = kit.cmp(CmpKind::Ne, marking, zero);
        let outer = kit.save_state();
        let (marking_t, marking_f) = kit.if_then_else(is_marking, PROB_STATE_CHANGING);
        kit.set_ctrl(marking_t);
        {
            let index = kit.load(
                RAW_ALIAS,
                index_adr,
                Ty::IntPtr,
                BasicType::IntPtr,
                MemOrd::Unordered,
            );

            let pre_val = if do_load {
                kit.load(alias, adr, val_ty, bt, MemOrd::Unordered)
            } else {
                pre_val_in
            };

            let null = kit.null_ref();
            let nonnull = kit.cmp(CmpKind::Ne, pre_val, null);
            let before_null = kit.save_state();
            let (nn_t, nn_f) = kit.if_then_else(nonnull, PROB_FAIR);
            kit.set_ctrl(nn_t);
            {
                let buffer = kit.load(
                    RAW_ALIAS,
                    buffer_adr,
                    Ty::RawPtr,
                    BasicType::RawPtr,
                    MemOrd::Unordered,
                );

                let not_full = kit.cmp(CmpKind::Ne, index, zero);
                let before_full = kit.save_state();
                let (room_t, room_f) = kit.if_then_else(not_full, PROB_STATE_STABLE);
                kit.set_ctrl(room_t);
                {
                    let word = kit.con_int(BYTES_PER_WORD);
                    let next_index = kit.sub_int(index, word);
                    let log_addr = kit.add_ptr(buffer, next_index);
                    kit.store(RAW_ALIAS, log_addr, pre_val, BasicType::Ref, MemOrd::Unordered);
                    kit.store(
                        RAW_ALIAS,
                        index_adr,
                        next_index,
                        BasicType::IntPtr,
                        MemOrd::Unordered,
                    );
                }
                let room_state = kit.save_state();

                kit.restore_state(before_full.with_ctrl(room_f));
                {
                    let call =
                        kit.make_leaf_call(RuntimeFn::WriteRefFieldPre.name(), &[pre_val, tls]);
                    slow_call = Some(call);
                }
                let full_state = kit.save_state();
                kit.merge(room_state, full_state);
            }
            let nn_state = kit.save_state();
            kit.restore_state(before_null.with_ctrl(nn_f));
            let null_state = kit.save_state();
            kit.merge(nn_state, null_state);
        }
        let marking_state = kit.save_state();
        kit.restore_state(outer.with_ctrl(marking_f));
        let idle_state = kit.save_state();
        kit.merge(marking_state, idle_state);

        if self.flags.satb_barrier && adr != top {
            if let Some(call) = slow_call {
                // Thread the address computation onto the slow call so
                // scheduling keeps it below the marking test; the
                // peephole cleanup strips it once nothing else uses it.
                kit.g.add_input(call, adr);
            }
        }
    }

    /// Bounded backward walk of the memory chain: is the slot provably
    /// still zero from its allocation?
    ///
    /// Every hop must be a store provably independent of our slot, or
    /// the zero-initialized memory of the same allocation with no
    /// captured store at our offset. Anything inscrutable (a call, a
    /// merge) stops the walk and keeps the barrier.
    pub(crate) fn satb_can_remove_pre_barrier(
        &self,
        kit: &mut GraphBuilder<'_>,
        adr: NodeId,
        bt: BasicType,
        alias: AliasIdx,
    ) -> bool {
        let (base, offset) = match kit.g.decompose_addr(adr) {
            Some(pair) => pair,
            None => return false, // cannot unalias without a precise offset
        };
        let alloc = match kit.g.find_allocation(base) {
            Some(a) => a,
            None => return false, // no allocation found
        };
        let size = bt.memory_size();

        let mut mem = kit.memory(alias);
        for _ in 0..ELIM_WALK_BUDGET {
            let g = &*kit.g;
            match g.op(mem) {
                Op::Store { bt: st_bt, .. } => {
                    let st_adr = g.input(mem, 2);
                    let (st_base, st_off) = match g.op(st_adr) {
                        Op::AddPtr => (
                            g.input(st_adr, 0),
                            g.find_int_con(g.input(st_adr, 1)),
                        ),
                        _ => break, // inscrutable pointer
                    };

                    // A store to the very slot: the previous value is real.
                    if st_base == base && st_off == Some(offset) {
                        break;
                    }

                    if let Some(so) = st_off {
                        if so != offset {
                            // Offsets provably independent. Stores of
                            // different sizes co-exist in the same raw
                            // effect chain (tile initialization), so
                            // plain inequality is not enough.
                            let st_size = st_bt.memory_size();
                            if so >= offset + size
                                || so <= offset - MAX_STORE_BYTES
                                || so <= offset - st_size
                            {
                                mem = g.input(mem, 1);
                                continue;
                            }
                        }
                    }

                    if st_base != base && detect_ptr_independence(g, alloc, st_base) {
                        mem = g.input(mem, 1);
                        continue;
                    }

                    break;
                }
                Op::InitializeMem => {
                    let st_alloc = g.input(mem, 0);
                    if st_alloc == alloc {
                        // Same allocation site. Safe only if initialization
                        // never captured a real reference at our offset.
                        match find_captured_store(g, mem, base, offset) {
                            None => return true,
                            Some(st) => {
                                let captured_val = g.input(st, 3);
                                return g.op(captured_val) == Op::NullRef;
                            }
                        }
                    }
                    break;
                }
                // Inscrutable memory state (call, phi, fence): bail out.
                _ => break,
            }
        }

        false
    }
}

/// Can a fresh allocation alias `st_base`? Distinct allocations never
/// do, and neither does anything that existed before the allocation.
fn detect_ptr_independence(g: &Graph, alloc: NodeId, st_base: NodeId) -> bool {
    match g.find_allocation(st_base) {
        Some(st_alloc) => st_alloc != alloc,
        None => matches!(g.op(st_base), Op::Parm(_)),
    }
}

/// The store captured by an allocation's initialization at `offset`,
/// if any
fn find_captured_store(g: &Graph, init: NodeId, base: NodeId, offset: i64) -> Option<NodeId> {
    g.uses_of(init).iter().copied().find(|&u| {
        g.op(u).is_store()
            && g.input(u, 1) == init
            && g.decompose_addr(g.input(u, 2)) == Some((base, offset))
    })
}

/// Recognize the gc-state byte load emitted by the template
pub fn is_gc_state_load(g: &Graph, tcx: &ThreadContext, n: NodeId) -> bool {
    if !matches!(g.op(n), Op::Load { bt: BasicType::Byte, .. }) {
        return false;
    }
    let adr = g.input(n, 2);
    if g.op(adr) != Op::AddPtr {
        return false;
    }
    g.op(g.input(adr, 0)) == Op::ThreadLocal
        && g.find_int_con(g.input(adr, 1)) == Some(tcx.gc_state_offset)
}

/// Recognize an is-marking branch: `If((gc_state & MARKING) != 0)`
pub fn is_marking_if(g: &Graph, tcx: &ThreadContext, n: NodeId) -> bool {
    if !matches!(g.op(n), Op::If { .. }) {
        return false;
    }
    let cond = g.input(n, 1);
    if g.op(cond) != Op::Cmp(CmpKind::Ne) {
        return false;
    }
    let masked = g.input(cond, 0);
    let zero = g.input(cond, 1);
    g.find_int_con(zero) == Some(0)
        && g.op(masked) == Op::AndInt
        && is_gc_state_load(g, tcx, g.input(masked, 0))
        && g.find_int_con(g.input(masked, 1)) == Some(GcState::MARKING)
}

/// Is `n` the SATB slow-path leaf call?
pub fn is_wb_pre_call(g: &Graph, n: NodeId) -> bool {
    matches!(g.op(n), Op::CallLeaf { name } if name == RuntimeFn::WriteRefFieldPre.name())
}

/// Is `n` the load-reference-barrier slow-path leaf call?
pub fn is_lrb_call(g: &Graph, n: NodeId) -> bool {
    matches!(g.op(n), Op::CallLeaf { name } if name == RuntimeFn::LoadReferenceBarrier.name())
}

/// Does every use of `n` sit on a SATB slow-path call?
pub fn has_only_wb_pre_uses(g: &Graph, n: NodeId) -> bool {
    let uses = g.uses_of(n);
    !uses.is_empty() && uses.iter().all(|&u| is_wb_pre_call(g, u))
}

/// Collapse the pre-barrier guarding `call` for an allocation the host
/// has proven dead: the marking test is folded to "not marking" and the
/// whole template unravels in the next simplification round.
///
/// # Panics
///
/// Panics when `call` is not a SATB slow-path call or the guarding
/// control flow does not have the emitted shape.
pub fn eliminate_wb_pre(g: &mut Graph, tcx: &ThreadContext, call: NodeId) {
    assert!(is_wb_pre_call(g, call), "wb-pre call expected");

    let declared = 2 + RuntimeFn::WriteRefFieldPre.arg_count();
    while g.num_inputs(call) > declared {
        let last = g.num_inputs(call) - 1;
        g.del_input(call, last);
    }

    let mut c = g.input(call, 0);
    for _ in 0..8 {
        if matches!(g.op(c), Op::IfTrue | Op::IfFalse) {
            let iff = g.input(c, 0);
            if is_marking_if(g, tcx, iff) {
                log::debug!("folding marking test of dead allocation's pre-barrier");
                let folded = g.con_bool(false);
                g.set_input(iff, 1, folded);
                return;
            }
            c = g.input(iff, 0);
            continue;
        }
        if g.num_inputs(c) == 0 {
            break;
        }
        c = g.input(c, 0);
    }
    panic!("where is the pre-barrier control flow?");
}
