//! Edge-case coverage: compile-time filters, conservative fallbacks,
//! decision tables, and the narrow-pointer paths.

use veldc_graph::{
    AliasIdx, AtomicRefKind, BasicType, CmpKind, Graph, GraphBuilder, KlassInfo, MemOrd, NodeId,
    Op, RefTy, Ty, BARRIER_VALUE_IN, RAW_ALIAS,
};

use crate::access::{
    step_over_gc_barrier, AccessDescriptor, AccessOrigin, BarrierSet, LocationClass, RefStrength,
};
use crate::clone::{array_copy_requires_gc_barriers, clone_needs_postbarrier, ArrayCopyPhase};
use crate::expand::pin_and_expand;
use crate::flags::BarrierFlags;
use crate::runtime::ThreadContext;
use crate::satb::is_marking_if;
use crate::verify::verify_barriers;

const FIELD: AliasIdx = AliasIdx(1);

fn live_count(g: &Graph, pred: impl Fn(&Graph, NodeId) -> bool) -> usize {
    g.node_ids()
        .filter(|&n| !g.is_dead(n) && pred(g, n))
        .count()
}

fn marking_if_count(g: &Graph, tcx: &ThreadContext) -> usize {
    live_count(g, |g, n| is_marking_if(g, tcx, n))
}

fn instanceof_count(g: &Graph) -> usize {
    live_count(g, |g, n| matches!(g.op(n), Op::IsInstanceOf(_)))
}

fn new_barrier_set() -> BarrierSet {
    BarrierSet::new(BarrierFlags::default(), ThreadContext::default())
}

// ---- referent-field guard ----

fn unknown_offset_access(kit: &mut GraphBuilder<'_>, base_ty: Ty) -> AccessDescriptor {
    let base = kit.g.add(Op::Parm(0), base_ty, &[]);
    let offset = kit.g.add(Op::Parm(1), Ty::IntPtr, &[]);
    let addr = kit.add_ptr(base, offset);
    let mut access = AccessDescriptor::heap_field(base, addr, offset, FIELD);
    access.strength = RefStrength::Unknown;
    access
}

#[test]
fn test_unknown_offset_access_emits_runtime_guard() {
    let mut g = Graph::new();
    let ref_klass = g.add_klass(KlassInfo::Instance {
        name: "Reference".to_string(),
        loaded: true,
        is_interface: false,
        has_subclasses: true,
        has_object_fields: true,
        has_injected_fields: false,
        is_reference_family: true,
        is_root_object: false,
    });
    let tcx = ThreadContext::default();
    let mut bs = BarrierSet::new(BarrierFlags::default(), tcx).with_reference_klass(ref_klass);
    let mut kit = GraphBuilder::new(&mut g);

    let access = unknown_offset_access(&mut kit, Ty::Ref(RefTy::BOTTOM));
    let _loaded = bs.load_at(&mut kit, &access);

    // offset == referent_offset, then instanceof, then the log
    assert_eq!(instanceof_count(&g), 1);
    assert_eq!(marking_if_count(&g, &tcx), 1);
    assert_eq!(live_count(&g, |g, n| g.op(n) == Op::MemBarCpuOrder), 1);
    assert_eq!(
        live_count(&g, |g, n| {
            matches!(g.op(n), Op::Cmp(CmpKind::Eq))
                && g.find_int_con(g.input(n, 1)) == Some(tcx.referent_offset)
        }),
        1
    );
}

#[test]
fn test_guard_without_resolved_reference_klass_stays_conservative() {
    let mut g = Graph::new();
    let tcx = ThreadContext::default();
    let mut bs = BarrierSet::new(BarrierFlags::default(), tcx);
    let mut kit = GraphBuilder::new(&mut g);

    let access = unknown_offset_access(&mut kit, Ty::Ref(RefTy::BOTTOM));
    let _loaded = bs.load_at(&mut kit, &access);

    // No instanceof level, but the log still happens under the offset check
    assert_eq!(instanceof_count(&g), 0);
    assert_eq!(marking_if_count(&g, &tcx), 1);
}

#[test]
fn test_constant_non_referent_offset_skips_guard() {
    let mut g = Graph::new();
    let tcx = ThreadContext::default();
    let mut bs = new_barrier_set();
    let mut kit = GraphBuilder::new(&mut g);

    let base = kit.g.add(Op::Parm(0), Ty::Ref(RefTy::BOTTOM), &[]);
    let offset = kit.con_int(tcx.referent_offset + 32);
    let addr = kit.add_ptr(base, offset);
    let mut access = AccessDescriptor::heap_field(base, addr, offset, FIELD);
    access.strength = RefStrength::Unknown;
    let _loaded = bs.load_at(&mut kit, &access);

    assert_eq!(instanceof_count(&g), 0);
    assert_eq!(marking_if_count(&g, &tcx), 0);
}

#[test]
fn test_constant_referent_offset_keeps_guard() {
    let mut g = Graph::new();
    let tcx = ThreadContext::default();
    let mut bs = new_barrier_set();
    let mut kit = GraphBuilder::new(&mut g);

    let base = kit.g.add(Op::Parm(0), Ty::Ref(RefTy::BOTTOM), &[]);
    let offset = kit.con_int(tcx.referent_offset);
    let addr = kit.add_ptr(base, offset);
    let mut access = AccessDescriptor::heap_field(base, addr, offset, FIELD);
    access.strength = RefStrength::Unknown;
    let _loaded = bs.load_at(&mut kit, &access);

    assert_eq!(marking_if_count(&g, &tcx), 1);
}

#[test]
fn test_array_base_skips_guard() {
    let mut g = Graph::new();
    let ak = g.add_klass(KlassInfo::array("Object[]", veldc_graph::ElemKind::Ref));
    let tcx = ThreadContext::default();
    let mut bs = new_barrier_set();
    let mut kit = GraphBuilder::new(&mut g);

    let access = unknown_offset_access(&mut kit, Ty::Ref(RefTy::of(ak)));
    let _loaded = bs.load_at(&mut kit, &access);

    assert_eq!(marking_if_count(&g, &tcx), 0);
}

#[test]
fn test_plain_klass_base_skips_guard() {
    let mut g = Graph::new();
    let k = g.add_klass(KlassInfo::instance("Point", false));
    let tcx = ThreadContext::default();
    let mut bs = new_barrier_set();
    let mut kit = GraphBuilder::new(&mut g);

    let access = unknown_offset_access(&mut kit, Ty::Ref(RefTy::exact(k)));
    let _loaded = bs.load_at(&mut kit, &access);

    assert_eq!(marking_if_count(&g, &tcx), 0);
}

// ---- off-heap and optimization-time accesses ----

#[test]
fn test_off_heap_strong_store_takes_no_barriers() {
    let mut g = Graph::new();
    let tcx = ThreadContext::default();
    let mut bs = new_barrier_set();
    let mut kit = GraphBuilder::new(&mut g);

    let base = kit.g.add(Op::Parm(0), Ty::RawPtr, &[]);
    let off = kit.con_int(16);
    let addr = kit.add_ptr(base, off);
    let mut access = AccessDescriptor::heap_field(base, addr, off, FIELD);
    access.location = LocationClass::OffHeap;
    let val = kit.g.add(Op::Parm(1), Ty::Ref(RefTy::BOTTOM), &[]);
    let store = bs.store_at(&mut kit, &access, val);

    assert_eq!(g.input(store, 3), val);
    assert_eq!(marking_if_count(&g, &tcx), 0);
    assert!(bs.state.is_empty());
}

#[test]
fn test_opt_time_array_copy_store_gets_only_storeval_barrier() {
    let mut g = Graph::new();
    let tcx = ThreadContext::default();
    let mut bs = new_barrier_set();
    let mut kit = GraphBuilder::new(&mut g);

    let base = kit.g.add(Op::Parm(0), Ty::Ref(RefTy::BOTTOM), &[]);
    let off = kit.con_int(16);
    let addr = kit.add_ptr(base, off);
    let mut access = AccessDescriptor::heap_field(base, addr, off, FIELD);
    access.origin = AccessOrigin::Opt;
    access.array_copy = true;
    access.tightly_coupled_alloc = true;
    let val = kit.g.add(Op::Parm(1), Ty::Ref(RefTy::BOTTOM), &[]);
    let store = bs.store_at(&mut kit, &access, val);

    assert_eq!(g.op(g.input(store, 3)), Op::EnqueueBarrier);
    assert_eq!(marking_if_count(&g, &tcx), 0);
}

#[test]
#[should_panic(expected = "unexpected caller of optimization-time store")]
fn test_opt_time_store_outside_array_copy_is_a_fault() {
    let mut g = Graph::new();
    let mut bs = new_barrier_set();
    let mut kit = GraphBuilder::new(&mut g);

    let base = kit.g.add(Op::Parm(0), Ty::Ref(RefTy::BOTTOM), &[]);
    let off = kit.con_int(16);
    let addr = kit.add_ptr(base, off);
    let mut access = AccessDescriptor::heap_field(base, addr, off, FIELD);
    access.origin = AccessOrigin::Opt;
    let val = kit.g.add(Op::Parm(1), Ty::Ref(RefTy::BOTTOM), &[]);
    bs.store_at(&mut kit, &access, val);
}

// ---- elimination walk conservatism ----

fn fresh_object_store(
    bs: &mut BarrierSet,
    kit: &mut GraphBuilder<'_>,
    k: veldc_graph::KlassId,
    prelude: impl FnOnce(&mut GraphBuilder<'_>, NodeId),
) {
    let (alloc, _init) = kit.allocate(k, FIELD);
    prelude(kit, alloc);
    let off = kit.con_int(16);
    let addr = kit.add_ptr(alloc, off);
    let access = AccessDescriptor::heap_field(alloc, addr, off, FIELD);
    let val = kit.g.add(Op::Parm(9), Ty::Ref(RefTy::BOTTOM), &[]);
    bs.store_at(kit, &access, val);
}

#[test]
fn test_dynamic_offset_store_blocks_elimination() {
    let mut g = Graph::new();
    let k = g.add_klass(KlassInfo::instance("Box", true));
    let mut bs = new_barrier_set();
    let tcx = bs.tcx;
    let mut kit = GraphBuilder::new(&mut g);

    fresh_object_store(&mut bs, &mut kit, k, |kit, alloc| {
        let dyn_off = kit.g.add(Op::Parm(5), Ty::IntPtr, &[]);
        let addr = kit.add_ptr(alloc, dyn_off);
        let v = kit.g.add(Op::Parm(6), Ty::Ref(RefTy::BOTTOM), &[]);
        kit.store(FIELD, addr, v, BasicType::Ref, MemOrd::Unordered);
    });

    assert_eq!(marking_if_count(&g, &tcx), 1);
}

#[test]
fn test_walk_budget_exhaustion_keeps_barrier() {
    let mut g = Graph::new();
    let k = g.add_klass(KlassInfo::instance("Box", true));
    let mut bs = new_barrier_set();
    let tcx = bs.tcx;
    let mut kit = GraphBuilder::new(&mut g);

    fresh_object_store(&mut bs, &mut kit, k, |kit, alloc| {
        // Sixty provably independent stores: each hop is fine, the
        // total is not.
        for i in 0..60 {
            let addr = kit.add_ptr_con(alloc, 1024 + 8 * i);
            let v = kit.con_int(i);
            kit.store(FIELD, addr, v, BasicType::IntPtr, MemOrd::Unordered);
        }
    });

    assert_eq!(marking_if_count(&g, &tcx), 1);
}

#[test]
fn test_disjoint_offset_store_does_not_block_elimination() {
    let mut g = Graph::new();
    let k = g.add_klass(KlassInfo::instance("Box", true));
    let mut bs = new_barrier_set();
    let tcx = bs.tcx;
    let mut kit = GraphBuilder::new(&mut g);

    fresh_object_store(&mut bs, &mut kit, k, |kit, alloc| {
        let addr = kit.add_ptr_con(alloc, 64);
        let v = kit.g.add(Op::Parm(6), Ty::Ref(RefTy::BOTTOM), &[]);
        kit.store(FIELD, addr, v, BasicType::Ref, MemOrd::Unordered);
    });

    assert_eq!(marking_if_count(&g, &tcx), 0);
}

#[test]
fn test_store_to_preexisting_object_does_not_block_elimination() {
    let mut g = Graph::new();
    let k = g.add_klass(KlassInfo::instance("Box", true));
    let mut bs = new_barrier_set();
    let tcx = bs.tcx;
    let mut kit = GraphBuilder::new(&mut g);

    fresh_object_store(&mut bs, &mut kit, k, |kit, _alloc| {
        // Same offset, but a base that predates the allocation
        let other = kit.g.add(Op::Parm(5), Ty::Ref(RefTy::BOTTOM), &[]);
        let addr = kit.add_ptr_con(other, 16);
        let v = kit.g.add(Op::Parm(6), Ty::Ref(RefTy::BOTTOM), &[]);
        kit.store(FIELD, addr, v, BasicType::Ref, MemOrd::Unordered);
    });

    assert_eq!(marking_if_count(&g, &tcx), 0);
}

#[test]
fn test_captured_null_store_still_allows_elimination() {
    let mut g = Graph::new();
    let k = g.add_klass(KlassInfo::instance("Box", true));
    let mut bs = new_barrier_set();
    let tcx = bs.tcx;
    let mut kit = GraphBuilder::new(&mut g);

    fresh_object_store(&mut bs, &mut kit, k, |kit, alloc| {
        let addr = kit.add_ptr_con(alloc, 16);
        let null = kit.null_ref();
        kit.store(FIELD, addr, null, BasicType::Ref, MemOrd::Unordered);
    });

    // An explicit null at the slot is as good as the allocation zero...
    // except the walk sees the store first and stops at the same-slot
    // check, so the barrier stays. Conservative is acceptable; what must
    // never happen is elision with a real reference captured.
    assert_eq!(marking_if_count(&g, &tcx), 1);
}

// ---- array-copy decision table ----

#[test]
fn test_array_copy_barrier_decision_table() {
    let flags = BarrierFlags::default();
    let mut no_storeval = BarrierFlags::default();
    no_storeval.storeval_enqueue_barrier = false;

    // Primitive elements never need barriers
    for phase in [
        ArrayCopyPhase::Parsing,
        ArrayCopyPhase::Optimization,
        ArrayCopyPhase::Expansion,
    ] {
        assert!(!array_copy_requires_gc_barriers(
            &flags,
            false,
            BasicType::IntPtr,
            false,
            phase
        ));
    }

    // Tightly-coupled destination: nothing during optimization, and
    // clones never need the post-copy pass
    assert!(!array_copy_requires_gc_barriers(
        &flags,
        true,
        BasicType::Ref,
        false,
        ArrayCopyPhase::Optimization
    ));
    assert!(!array_copy_requires_gc_barriers(
        &flags,
        true,
        BasicType::Ref,
        true,
        ArrayCopyPhase::Parsing
    ));
    assert!(array_copy_requires_gc_barriers(
        &flags,
        true,
        BasicType::Ref,
        false,
        ArrayCopyPhase::Parsing
    ));

    // Loose destination during optimization: the store-value barrier
    // already covers the copied slots when it is on
    assert!(!array_copy_requires_gc_barriers(
        &flags,
        false,
        BasicType::Ref,
        false,
        ArrayCopyPhase::Optimization
    ));
    assert!(array_copy_requires_gc_barriers(
        &no_storeval,
        false,
        BasicType::Ref,
        false,
        ArrayCopyPhase::Optimization
    ));

    assert!(array_copy_requires_gc_barriers(
        &flags,
        false,
        BasicType::Ref,
        false,
        ArrayCopyPhase::Parsing
    ));
}

// ---- clone type filters ----

fn clone_node_for(g: &mut Graph, src_ty: Ty) -> NodeId {
    let bs = BarrierSet::new(BarrierFlags::default(), ThreadContext::default());
    let mut kit = GraphBuilder::new(g);
    let src = kit.g.add(Op::Parm(0), src_ty, &[]);
    let dst_base = kit.g.add(Op::Parm(1), Ty::Ref(RefTy::BOTTOM), &[]);
    let dst = kit.add_ptr_con(dst_base, 16);
    let size = kit.g.add(Op::Parm(2), Ty::IntPtr, &[]);
    bs.clone_copy(&mut kit, src, dst, size)
}

#[test]
fn test_clone_of_exact_reference_free_klass_needs_no_barrier() {
    let mut g = Graph::new();
    let k = g.add_klass(KlassInfo::instance("Point", false));
    let ac = clone_node_for(&mut g, Ty::Ref(RefTy::exact(k)));
    assert!(!clone_needs_postbarrier(&g, ac));
}

#[test]
fn test_clone_with_reference_fields_needs_barrier() {
    let mut g = Graph::new();
    let k = g.add_klass(KlassInfo::instance("Node", true));
    let ac = clone_node_for(&mut g, Ty::Ref(RefTy::exact(k)));
    assert!(clone_needs_postbarrier(&g, ac));
}

#[test]
fn test_clone_of_open_hierarchy_needs_barrier() {
    let mut g = Graph::new();
    let k = g.add_klass(KlassInfo::Instance {
        name: "Shape".to_string(),
        loaded: true,
        is_interface: false,
        has_subclasses: true,
        has_object_fields: false,
        has_injected_fields: false,
        is_reference_family: false,
        is_root_object: false,
    });
    let ac = clone_node_for(&mut g, Ty::Ref(RefTy::of(k)));
    assert!(clone_needs_postbarrier(&g, ac));
}

#[test]
fn test_clone_with_injected_fields_needs_barrier() {
    let mut g = Graph::new();
    let k = g.add_klass(KlassInfo::Instance {
        name: "Mirror".to_string(),
        loaded: true,
        is_interface: false,
        has_subclasses: false,
        has_object_fields: false,
        has_injected_fields: true,
        is_reference_family: false,
        is_root_object: false,
    });
    let ac = clone_node_for(&mut g, Ty::Ref(RefTy::exact(k)));
    assert!(clone_needs_postbarrier(&g, ac));
}

#[test]
fn test_clone_of_statically_unknown_type_needs_barrier() {
    let mut g = Graph::new();
    let ac = clone_node_for(&mut g, Ty::Ref(RefTy::BOTTOM));
    assert!(clone_needs_postbarrier(&g, ac));
}

// ---- narrow pointer forms ----

#[test]
fn test_narrow_cmpxchg_encodes_operands_and_decodes_result() {
    let mut g = Graph::new();
    let mut bs = new_barrier_set();
    let mut kit = GraphBuilder::new(&mut g);

    let base = kit.g.add(Op::Parm(0), Ty::Ref(RefTy::BOTTOM), &[]);
    let off = kit.con_int(16);
    let addr = kit.add_ptr(base, off);
    let mut access = AccessDescriptor::heap_field(base, addr, off, FIELD);
    access.bt = BasicType::NarrowRef;
    access.ord = MemOrd::Volatile;

    let expected = kit.g.add(Op::Parm(1), Ty::Ref(RefTy::BOTTOM), &[]);
    let new_val = kit.g.add(Op::Parm(2), Ty::Ref(RefTy::BOTTOM), &[]);
    let res = bs.atomic_cmpxchg_val_at(&mut kit, &access, expected, new_val);

    assert_eq!(g.op(res), Op::LoadRefBarrier);
    let wide = g.input(res, BARRIER_VALUE_IN);
    assert_eq!(g.op(wide), Op::CastWide);
    let atomic = g.input(wide, 0);
    assert!(matches!(
        g.op(atomic),
        Op::AtomicRef {
            kind: AtomicRefKind::CompareAndExchange,
            width: veldc_graph::RefWidth::Narrow,
            barriered: true,
            ..
        }
    ));
    assert_eq!(g.op(g.input(atomic, 3)), Op::CastNarrow);
}

#[test]
fn test_narrow_barriered_cae_expands_to_two_plain_attempts() {
    let mut g = Graph::new();
    let mut bs = new_barrier_set();
    let mut kit = GraphBuilder::new(&mut g);

    let base = kit.g.add(Op::Parm(0), Ty::Ref(RefTy::BOTTOM), &[]);
    let off = kit.con_int(16);
    let addr = kit.add_ptr(base, off);
    let mut access = AccessDescriptor::heap_field(base, addr, off, FIELD);
    access.bt = BasicType::NarrowRef;
    access.ord = MemOrd::Volatile;

    let expected = kit.g.add(Op::Parm(1), Ty::Ref(RefTy::BOTTOM), &[]);
    let new_val = kit.g.add(Op::Parm(2), Ty::Ref(RefTy::BOTTOM), &[]);
    let res = bs.atomic_cmpxchg_val_at(&mut kit, &access, expected, new_val);
    kit.ret(FIELD, res);

    pin_and_expand(&mut bs, &mut g);

    assert_eq!(
        live_count(&g, |g, n| matches!(g.op(n), Op::AtomicRef { barriered: true, .. })),
        0
    );
    assert_eq!(
        live_count(&g, |g, n| matches!(
            g.op(n),
            Op::AtomicRef {
                kind: AtomicRefKind::CompareAndExchange,
                barriered: false,
                ..
            }
        )),
        2
    );
    assert!(bs.state.is_empty());
}

#[test]
fn test_narrow_xchg_round_trips_through_casts() {
    let mut g = Graph::new();
    let mut bs = new_barrier_set();
    let mut kit = GraphBuilder::new(&mut g);

    let base = kit.g.add(Op::Parm(0), Ty::Ref(RefTy::BOTTOM), &[]);
    let off = kit.con_int(16);
    let addr = kit.add_ptr(base, off);
    let mut access = AccessDescriptor::heap_field(base, addr, off, FIELD);
    access.bt = BasicType::NarrowRef;

    let new_val = kit.g.add(Op::Parm(1), Ty::Ref(RefTy::BOTTOM), &[]);
    let res = bs.atomic_xchg_at(&mut kit, &access, new_val);

    assert_eq!(g.op(res), Op::LoadRefBarrier);
    let wide = g.input(res, BARRIER_VALUE_IN);
    assert_eq!(g.op(wide), Op::CastWide);
    let xchg = g.input(wide, 0);
    assert!(matches!(
        g.op(xchg),
        Op::GetAndSetRef {
            width: veldc_graph::RefWidth::Narrow
        }
    ));
    assert_eq!(g.op(g.input(xchg, 3)), Op::CastNarrow);
}

// ---- miscellaneous contracts ----

#[test]
fn test_step_over_is_identity_for_plain_values() {
    let mut g = Graph::new();
    let p = g.add(Op::Parm(0), Ty::Ref(RefTy::BOTTOM), &[]);
    assert_eq!(step_over_gc_barrier(&g, p), p);
}

#[test]
fn test_registering_non_barrier_node_is_noop() {
    let mut g = Graph::new();
    let p = g.add(Op::Parm(0), Ty::Ref(RefTy::BOTTOM), &[]);
    let mut bs = new_barrier_set();
    bs.state.register_potential_barrier_node(&g, p);
    assert!(bs.state.is_empty());
}

#[test]
fn test_verifier_tolerates_infinite_loop_guard() {
    let mut g = Graph::new();
    let tcx = ThreadContext::default();
    let mut kit = GraphBuilder::new(&mut g);

    // Load under the original control, test under the loop guard's
    // control projection: the documented exception.
    let tls = kit.thread_local();
    let adr = kit.add_ptr_con(tls, tcx.gc_state_offset);
    let ld = kit.load(RAW_ALIAS, adr, Ty::Int, BasicType::Byte, MemOrd::Unordered);

    let start = kit.g.start;
    let nb = kit.g.add(Op::NeverBranch, Ty::Control, &[start]);
    let cproj = kit.g.add(Op::CProj, Ty::Control, &[nb]);
    kit.set_ctrl(cproj);

    let mask = kit.con_int(crate::runtime::GcState::MARKING);
    let masked = kit.and_int(ld, mask);
    let zero = kit.con_int(0);
    let cond = kit.cmp(CmpKind::Ne, masked, zero);
    let (mt, _mf) = kit.if_then_else(cond, 0.5);
    kit.set_ctrl(mt);
    kit.ret(RAW_ALIAS, zero);

    assert_eq!(verify_barriers(&g, &tcx), Ok(()));
}
