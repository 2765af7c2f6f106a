//! Access interception: which barrier(s) does a memory access need?
//!
//! Every store, load and atomic on a reference-typed heap slot funnels
//! through [`BarrierSet`] before the host's generic lowering. The
//! decisions here are the whole point of the subsystem: store values
//! pass through the enqueue barrier, overwritten values reach the SATB
//! log, loaded references come back through the load-reference barrier,
//! and atomics get the collector-aware node variants. Freshly created
//! barrier nodes are registered with the compilation state immediately.

use veldc_graph::{
    AliasIdx, AtomicRefKind, BasicType, Graph, GraphBuilder, KlassId, MemOrd, NodeId, Op, RefTy,
    RefWidth, Ty, BARRIER_VALUE_IN, RAW_ALIAS,
};

use crate::flags::BarrierFlags;
use crate::runtime::{RuntimeFn, ThreadContext};
use crate::state::BarrierSetState;

/// Where an access lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationClass {
    Heap,
    OffHeap,
    Unknown,
}

/// Statically known strength of the referenced slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefStrength {
    Strong,
    Weak,
    /// Unsafe-style access with a non-constant offset; could be anything
    Unknown,
}

/// Whether the access comes from parsing or a later optimization pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOrigin {
    Parse,
    Opt,
}

/// Everything the interceptor needs to know about one access.
/// Consumed per access; never persisted.
#[derive(Debug, Clone, Copy)]
pub struct AccessDescriptor {
    pub base: NodeId,
    pub addr: NodeId,
    /// Offset node of the address, or top when unavailable
    pub offset: NodeId,
    pub alias: AliasIdx,
    pub bt: BasicType,
    pub value_ty: Ty,
    pub location: LocationClass,
    pub strength: RefStrength,
    pub ord: MemOrd,
    /// Access type disagrees with the slot's declared layout
    pub mismatched: bool,
    /// Weak flavor of a compare-and-swap
    pub weak_cas: bool,
    /// Part of an array-copy / clone fast path
    pub array_copy: bool,
    /// Destination is a just-allocated object that has not escaped
    pub tightly_coupled_alloc: bool,
    pub origin: AccessOrigin,
}

impl AccessDescriptor {
    /// A plain strong, unordered, parse-time heap field access
    pub fn heap_field(base: NodeId, addr: NodeId, offset: NodeId, alias: AliasIdx) -> Self {
        AccessDescriptor {
            base,
            addr,
            offset,
            alias,
            bt: BasicType::Ref,
            value_ty: Ty::Ref(RefTy::BOTTOM),
            location: LocationClass::Heap,
            strength: RefStrength::Strong,
            ord: MemOrd::Unordered,
            mismatched: false,
            weak_cas: false,
            array_copy: false,
            tightly_coupled_alloc: false,
            origin: AccessOrigin::Parse,
        }
    }

    pub fn is_ref(&self) -> bool {
        self.bt.is_reference()
    }
}

/// The barrier set of one in-flight compilation
pub struct BarrierSet {
    pub flags: BarrierFlags,
    pub tcx: ThreadContext,
    pub state: BarrierSetState,
    /// Well-known Reference klass of the compilation env, when resolved.
    /// Without it the referent guard skips its instanceof level and
    /// logs unconditionally under the offset check.
    pub reference_klass: Option<KlassId>,
}

impl BarrierSet {
    pub fn new(flags: BarrierFlags, tcx: ThreadContext) -> BarrierSet {
        BarrierSet {
            flags,
            tcx,
            state: BarrierSetState::new(),
            reference_klass: None,
        }
    }

    pub fn with_reference_klass(mut self, klass: KlassId) -> BarrierSet {
        self.reference_klass = Some(klass);
        self
    }

    /// Wrap `value` in an enqueue barrier and register it
    pub(crate) fn enqueue_barrier(&mut self, kit: &mut GraphBuilder<'_>, value: NodeId) -> NodeId {
        let ctrl = kit.ctrl();
        let mem = kit.memory(RAW_ALIAS);
        let ty = kit.g.ty(value);
        let n = kit.g.add(Op::EnqueueBarrier, ty, &[ctrl, mem, value]);
        self.state.register_potential_barrier_node(kit.g, n);
        n
    }

    /// Store-value barrier: enqueue barrier when configured, else identity
    pub(crate) fn storeval_barrier(&mut self, kit: &mut GraphBuilder<'_>, value: NodeId) -> NodeId {
        if self.flags.storeval_enqueue_barrier {
            self.enqueue_barrier(kit, value)
        } else {
            value
        }
    }

    /// Wrap `value` in a load-reference barrier and register it
    pub(crate) fn load_reference_barrier(
        &mut self,
        kit: &mut GraphBuilder<'_>,
        value: NodeId,
    ) -> NodeId {
        let ctrl = kit.ctrl();
        let mem = kit.memory(RAW_ALIAS);
        let ty = kit.g.ty(value);
        let n = kit.g.add(Op::LoadRefBarrier, ty, &[ctrl, mem, value]);
        self.state.register_potential_barrier_node(kit.g, n);
        n
    }

    /// Intercept a store. Reference stores to the heap (or of unknown
    /// strength) get the store-value barrier and the SATB pre-barrier
    /// for the overwritten value, then lower to the plain store.
    pub fn store_at(
        &mut self,
        kit: &mut GraphBuilder<'_>,
        access: &AccessDescriptor,
        value: NodeId,
    ) -> NodeId {
        let anonymous = access.strength == RefStrength::Unknown;
        let on_heap = access.location == LocationClass::Heap;

        if !access.is_ref() || (!on_heap && !anonymous) {
            return kit.store(access.alias, access.addr, value, access.bt, access.ord);
        }

        match access.origin {
            AccessOrigin::Parse => {
                let value = self.storeval_barrier(kit, value);
                let top = kit.top();
                self.write_barrier_pre(
                    kit,
                    true, // load the old value ourselves
                    access.base,
                    access.addr,
                    access.alias,
                    access.value_ty,
                    top,
                    access.bt,
                );
                kit.store(access.alias, access.addr, value, access.bt, access.ord)
            }
            AccessOrigin::Opt => {
                // Only the array-copy lowering stores through here, and
                // only when the SATB pre-barrier is not needed for it.
                assert!(
                    access.array_copy
                        && (access.tightly_coupled_alloc || !self.flags.satb_barrier),
                    "unexpected caller of optimization-time store"
                );
                let value = if self.flags.storeval_enqueue_barrier {
                    self.enqueue_barrier(kit, value)
                } else {
                    value
                };
                kit.store(access.alias, access.addr, value, access.bt, access.ord)
            }
        }
    }

    /// Intercept a load. Reference loads come back through a
    /// load-reference barrier; weak and unknown-strength loads
    /// additionally log the previous value through the keep-alive path.
    pub fn load_at(&mut self, kit: &mut GraphBuilder<'_>, access: &AccessDescriptor) -> NodeId {
        let mut load = kit.load(access.alias, access.addr, access.value_ty, access.bt, access.ord);

        if !access.is_ref() {
            return load;
        }

        if self.flags.load_ref_barrier {
            load = self.load_reference_barrier(kit, load);
        }

        let top = kit.top();
        let on_heap = access.location == LocationClass::Heap;
        let on_weak = access.strength == RefStrength::Weak;
        let unknown = access.strength == RefStrength::Unknown;
        let is_unordered = access.ord == MemOrd::Unordered;
        let need_cpu_mem_bar = !is_unordered || access.mismatched || !on_heap;

        // Reading the referent of a reference-queue object (directly or
        // through an unsafe access that might hit it) must log the value
        // before it can be dropped by the collector.
        let need_read_barrier = self.flags.keep_alive_barrier
            && on_heap
            && (on_weak || (unknown && access.offset != top && access.base != top));

        if !need_read_barrier {
            return load;
        }
        assert!(
            access.origin == AccessOrigin::Parse,
            "keep-alive entry not supported at optimization time"
        );

        if on_weak {
            // Known weak slot: log unconditionally, then fence so the
            // read cannot be commoned across a collector safepoint.
            self.satb_write_barrier_pre(
                kit,
                false,
                top,
                top,
                access.alias,
                access.value_ty,
                load,
                BasicType::Ref,
            );
            kit.mem_bar(access.alias);
        } else {
            self.insert_pre_barrier(
                kit,
                access.base,
                access.offset,
                load,
                !need_cpu_mem_bar,
                access.alias,
            );
        }

        load
    }

    /// Intercept a compare-and-exchange whose result is the found value
    pub fn atomic_cmpxchg_val_at(
        &mut self,
        kit: &mut GraphBuilder<'_>,
        access: &AccessDescriptor,
        expected: NodeId,
        new_val: NodeId,
    ) -> NodeId {
        assert!(access.is_ref(), "reference compare-and-exchange only");

        let new_val = self.storeval_barrier(kit, new_val);
        let top = kit.top();
        // The expected value is already materialized: log it without a load.
        self.write_barrier_pre(
            kit,
            false,
            top,
            top,
            access.alias,
            access.value_ty,
            expected,
            BasicType::Ref,
        );

        let (width, exp_v, new_v, inner_ty) = self.encode_pair(kit, access, expected, new_val);
        let mut result = kit.atomic_ref(
            AtomicRefKind::CompareAndExchange,
            width,
            self.flags.cas_barrier,
            access.ord,
            access.alias,
            access.addr,
            exp_v,
            new_v,
            inner_ty,
        );
        if width == RefWidth::Narrow {
            let rt = access.value_ty.ref_ty().unwrap_or(RefTy::BOTTOM);
            result = kit.g.add(Op::CastWide, Ty::Ref(rt), &[result]);
        }
        self.load_reference_barrier(kit, result)
    }

    /// Intercept a compare-and-swap whose result is a success flag
    pub fn atomic_cmpxchg_bool_at(
        &mut self,
        kit: &mut GraphBuilder<'_>,
        access: &AccessDescriptor,
        expected: NodeId,
        new_val: NodeId,
    ) -> NodeId {
        assert!(access.is_ref(), "reference compare-and-swap only");

        let new_val = self.storeval_barrier(kit, new_val);
        let top = kit.top();
        self.write_barrier_pre(
            kit,
            false,
            top,
            top,
            access.alias,
            access.value_ty,
            expected,
            BasicType::Ref,
        );

        let kind = if access.weak_cas {
            AtomicRefKind::WeakCompareAndSwap
        } else {
            AtomicRefKind::CompareAndSwap
        };
        let (width, exp_v, new_v, _inner_ty) = self.encode_pair(kit, access, expected, new_val);
        kit.atomic_ref(
            kind,
            width,
            self.flags.cas_barrier,
            access.ord,
            access.alias,
            access.addr,
            exp_v,
            new_v,
            Ty::Bool,
        )
    }

    /// Intercept an unconditional exchange. The result is the
    /// overwritten value: fix it up, then log it.
    pub fn atomic_xchg_at(
        &mut self,
        kit: &mut GraphBuilder<'_>,
        access: &AccessDescriptor,
        new_val: NodeId,
    ) -> NodeId {
        assert!(access.is_ref(), "reference exchange only");

        let new_val = self.storeval_barrier(kit, new_val);
        let narrow = access.bt == BasicType::NarrowRef;
        let rt = access.value_ty.ref_ty().unwrap_or(RefTy::BOTTOM);

        let (width, val, inner_ty) = if narrow {
            let v = kit.g.add(Op::CastNarrow, Ty::NarrowRef(rt), &[new_val]);
            (RefWidth::Narrow, v, Ty::NarrowRef(rt))
        } else {
            (RefWidth::Wide, new_val, access.value_ty)
        };

        let mut result = kit.get_and_set_ref(width, access.alias, access.addr, val, inner_ty);
        if narrow {
            result = kit.g.add(Op::CastWide, Ty::Ref(rt), &[result]);
        }

        let result = self.load_reference_barrier(kit, result);
        let top = kit.top();
        self.write_barrier_pre(
            kit,
            false,
            top,
            top,
            access.alias,
            access.value_ty,
            result,
            BasicType::Ref,
        );
        result
    }

    fn encode_pair(
        &self,
        kit: &mut GraphBuilder<'_>,
        access: &AccessDescriptor,
        expected: NodeId,
        new_val: NodeId,
    ) -> (RefWidth, NodeId, NodeId, Ty) {
        if access.bt == BasicType::NarrowRef {
            let rt = access.value_ty.ref_ty().unwrap_or(RefTy::BOTTOM);
            let e = kit.g.add(Op::CastNarrow, Ty::NarrowRef(rt), &[expected]);
            let nv = kit.g.add(Op::CastNarrow, Ty::NarrowRef(rt), &[new_val]);
            (RefWidth::Narrow, e, nv, Ty::NarrowRef(rt))
        } else {
            (RefWidth::Wide, expected, new_val, access.value_ty)
        }
    }
}

/// Is `n` a node the generic passes must treat as a GC barrier?
pub fn is_gc_barrier_node(g: &Graph, n: NodeId) -> bool {
    if g.op(n) == Op::LoadRefBarrier {
        return true;
    }
    match g.op(n) {
        Op::CallLeaf { name } => RuntimeFn::from_name(name).is_some(),
        _ => false,
    }
}

/// See through a barrier to the raw value it wraps; identity for
/// everything else. Relocation never changes null-ness or identity
/// facts the optimizer is after.
pub fn step_over_gc_barrier(g: &Graph, n: NodeId) -> NodeId {
    match g.op(n) {
        Op::LoadRefBarrier | Op::EnqueueBarrier => g.input(n, BARRIER_VALUE_IN),
        _ => n,
    }
}
