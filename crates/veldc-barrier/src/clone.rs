//! Clone / array-copy barrier decisions.
//!
//! A bulk copy that duplicates reference fields wholesale bypasses the
//! per-store interception, so the copied object may hold stale
//! references the collector has to be told about. The decision to
//! splice a post-copy runtime call rests entirely on the source's
//! static type: only a provably reference-free layout may skip it.

use veldc_graph::{BasicType, ElemKind, Graph, GraphBuilder, KlassInfo, NodeId, Op, Ty, RAW_ALIAS};

use crate::access::BarrierSet;
use crate::flags::BarrierFlags;
use crate::runtime::RuntimeFn;

/// Which compilation phase asks about array-copy barriers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayCopyPhase {
    Parsing,
    Optimization,
    Expansion,
}

/// Does an array copy with element type `elem` need GC barriers?
///
/// Non-reference elements never do. A tightly-coupled destination
/// (fresh, unescaped allocation) needs none during optimization and
/// only non-clone copies need them later. Otherwise barriers are
/// required, except during optimization when the store-value enqueue
/// barrier already covers every copied slot.
pub fn array_copy_requires_gc_barriers(
    flags: &BarrierFlags,
    tightly_coupled_alloc: bool,
    elem: BasicType,
    is_clone: bool,
    phase: ArrayCopyPhase,
) -> bool {
    if !elem.is_reference() {
        return false;
    }
    if tightly_coupled_alloc {
        if phase == ArrayCopyPhase::Optimization {
            return false;
        }
        return !is_clone;
    }
    if phase == ArrayCopyPhase::Optimization {
        return !flags.storeval_enqueue_barrier;
    }
    true
}

/// Must this clone be followed by the runtime barrier call?
///
/// Skippable only when the source type is exactly known (or sealed with
/// no subclasses), carries no injected fields and no reference-typed
/// fields, or is an array of a provably non-reference element type.
pub fn clone_needs_postbarrier(g: &Graph, ac: NodeId) -> bool {
    let src = g.input(ac, 2);
    let rt = match g.ty(src).ref_ty() {
        Some(rt) => rt,
        None => return true,
    };
    let kid = match rt.klass {
        Some(k) => k,
        None => return true,
    };
    match &g.klasses[kid] {
        KlassInfo::Instance {
            loaded,
            is_interface,
            has_subclasses,
            has_object_fields,
            has_injected_fields,
            ..
        } => {
            if !loaded {
                return true;
            }
            let exact_or_sealed = rt.exact || (!is_interface && !has_subclasses);
            if exact_or_sealed && !has_injected_fields {
                *has_object_fields
            } else {
                true
            }
        }
        KlassInfo::Array { elem, .. } => matches!(elem, ElemKind::Ref),
    }
}

/// Splice the clone-barrier leaf call into the copy's control and
/// memory chain, immediately after the copy.
///
/// # Panics
///
/// Panics when `ac` is not an object-clone copy, its destination is not
/// an address node, or the copy has no control/memory projections.
pub fn clone_barrier_at_expansion(g: &mut Graph, ac: NodeId) {
    assert!(
        matches!(g.op(ac), Op::ArrayCopy { clone_basic: true }),
        "no other kind of array copy here"
    );

    if !clone_needs_postbarrier(g, ac) {
        log::debug!("clone of reference-free layout: no post-copy barrier");
        return;
    }

    let out_c = g
        .proj_out(ac, Op::ProjCtrl)
        .expect("where is the copy's control projection?");
    let out_m = g
        .proj_out(ac, Op::ProjMem)
        .expect("where is the copy's memory projection?");

    let dest = g.input(ac, 3);
    assert!(g.op(dest) == Op::AddPtr, "bad input");
    let dest_base = g.input(dest, 0);

    // Fresh projections feed the barrier call; the old ones move below it.
    let c = g.add(Op::ProjCtrl, Ty::Control, &[ac]);
    let m = g.add(Op::ProjMem, Ty::Memory, &[ac]);
    let call = g.add(
        Op::CallLeaf {
            name: RuntimeFn::CloneBarrier.name(),
        },
        Ty::Tuple,
        &[c, m, dest_base],
    );
    let bc = g.add(Op::ProjCtrl, Ty::Control, &[call]);
    let bm = g.add(Op::ProjMem, Ty::Memory, &[call]);
    g.replace_node(out_c, bc);
    g.replace_node(out_m, bm);
}

impl BarrierSet {
    /// Emit the bulk copy for an object clone. The copy itself is the
    /// host's plain lowering; the barrier decision happens at expansion.
    pub fn clone_copy(
        &self,
        kit: &mut GraphBuilder<'_>,
        src: NodeId,
        dst: NodeId,
        size: NodeId,
    ) -> NodeId {
        assert!(kit.g.op(src) != Op::AddPtr, "unexpected input");
        assert!(kit.g.op(dst) == Op::AddPtr, "destination must be an address");
        let ctrl = kit.ctrl();
        let mem = kit.memory(RAW_ALIAS);
        let ac = kit.g.add(
            Op::ArrayCopy { clone_basic: true },
            Ty::Tuple,
            &[ctrl, mem, src, dst, size],
        );
        let c = kit.g.add(Op::ProjCtrl, Ty::Control, &[ac]);
        let m = kit.g.add(Op::ProjMem, Ty::Memory, &[ac]);
        kit.set_ctrl(c);
        kit.set_memory(RAW_ALIAS, m);
        ac
    }
}
