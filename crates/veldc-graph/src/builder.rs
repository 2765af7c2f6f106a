//! Graph builder: a cursor over current control and memory state.
//!
//! Barrier templates are emitted inline into the host graph, so the
//! builder tracks the current control node and one memory state per
//! alias class, the same bookkeeping the parser itself keeps. Branchy
//! emission follows a save/branch/restore/merge discipline:
//!
//! ```text
//! let before = kit.save_state();
//! let (t, f) = kit.if_then_else(cond, prob);
//! kit.set_ctrl(t);
//! // ... emit then-arm ...
//! let then_state = kit.save_state();
//! kit.restore_state(before.with_ctrl(f));
//! // ... emit else-arm ...
//! let else_state = kit.save_state();
//! let region = kit.merge(then_state, else_state);
//! ```

use veldc_util::{define_idx, FxHashMap};

use crate::graph::{Graph, NodeId};
use crate::node::{AtomicRefKind, CmpKind, MemOrd, Op, RefWidth};
use crate::types::{BasicType, KlassId, RefTy, Ty};

define_idx!(AliasIdx);

/// The raw (untyped, off-lattice) alias class: thread-local state,
/// runtime call side effects
pub const RAW_ALIAS: AliasIdx = AliasIdx(0);

/// Saved control and memory state of a [`GraphBuilder`]
#[derive(Clone)]
pub struct BuilderState {
    pub ctrl: NodeId,
    mem: FxHashMap<AliasIdx, NodeId>,
}

impl BuilderState {
    /// Same memory state, different control (for entering an else-arm)
    pub fn with_ctrl(&self, ctrl: NodeId) -> BuilderState {
        BuilderState {
            ctrl,
            mem: self.mem.clone(),
        }
    }
}

/// Emission cursor over a [`Graph`]
pub struct GraphBuilder<'a> {
    pub g: &'a mut Graph,
    ctrl: NodeId,
    mem: FxHashMap<AliasIdx, NodeId>,
    /// One initial-memory node per alias class, stable across branch
    /// states so merges see the same untouched-memory value on both arms
    initial_mem: FxHashMap<AliasIdx, NodeId>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(g: &'a mut Graph) -> GraphBuilder<'a> {
        let ctrl = g.start;
        GraphBuilder {
            g,
            ctrl,
            mem: FxHashMap::default(),
            initial_mem: FxHashMap::default(),
        }
    }

    /// A builder positioned at an arbitrary control/memory point, used
    /// by late expansion to re-enter the graph at a pinned barrier
    pub fn at(g: &'a mut Graph, ctrl: NodeId, raw_mem: NodeId) -> GraphBuilder<'a> {
        let mut mem = FxHashMap::default();
        mem.insert(RAW_ALIAS, raw_mem);
        GraphBuilder {
            g,
            ctrl,
            mem,
            initial_mem: FxHashMap::default(),
        }
    }

    pub fn ctrl(&self) -> NodeId {
        self.ctrl
    }

    pub fn set_ctrl(&mut self, ctrl: NodeId) {
        self.ctrl = ctrl;
    }

    pub fn top(&self) -> NodeId {
        self.g.top
    }

    /// Current memory state of an alias class
    ///
    /// Lazily materializes the initial-memory parameter for classes the
    /// emission has not touched yet.
    pub fn memory(&mut self, alias: AliasIdx) -> NodeId {
        if let Some(&m) = self.mem.get(&alias) {
            return m;
        }
        let init = self.initial_memory(alias);
        self.mem.insert(alias, init);
        init
    }

    pub fn set_memory(&mut self, alias: AliasIdx, mem: NodeId) {
        self.mem.insert(alias, mem);
    }

    fn initial_memory(&mut self, alias: AliasIdx) -> NodeId {
        if let Some(&m) = self.initial_mem.get(&alias) {
            return m;
        }
        let start = self.g.start;
        let init = self.g.add(Op::Parm(alias.0), Ty::Memory, &[start]);
        self.initial_mem.insert(alias, init);
        init
    }

    pub fn save_state(&mut self) -> BuilderState {
        BuilderState {
            ctrl: self.ctrl,
            mem: self.mem.clone(),
        }
    }

    pub fn restore_state(&mut self, state: BuilderState) {
        self.ctrl = state.ctrl;
        self.mem = state.mem;
    }

    // ---- constants ----

    pub fn con_int(&mut self, v: i64) -> NodeId {
        self.g.con_int(v)
    }

    pub fn null_ref(&mut self) -> NodeId {
        self.g.null_ref()
    }

    pub fn thread_local(&mut self) -> NodeId {
        self.g.thread_local()
    }

    // ---- arithmetic and addressing ----

    pub fn add_ptr(&mut self, base: NodeId, offset: NodeId) -> NodeId {
        self.g.add(Op::AddPtr, Ty::RawPtr, &[base, offset])
    }

    pub fn add_ptr_con(&mut self, base: NodeId, offset: i64) -> NodeId {
        let off = self.con_int(offset);
        self.add_ptr(base, off)
    }

    pub fn and_int(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.g.add(Op::AndInt, Ty::IntPtr, &[a, b])
    }

    pub fn sub_int(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.g.add(Op::SubInt, Ty::IntPtr, &[a, b])
    }

    pub fn cmp(&mut self, kind: CmpKind, a: NodeId, b: NodeId) -> NodeId {
        self.g.add(Op::Cmp(kind), Ty::Bool, &[a, b])
    }

    pub fn instance_of(&mut self, obj: NodeId, klass: KlassId) -> NodeId {
        let ctrl = self.ctrl;
        self.g.add(Op::IsInstanceOf(klass), Ty::Int, &[ctrl, obj])
    }

    // ---- memory operations ----

    pub fn load(
        &mut self,
        alias: AliasIdx,
        addr: NodeId,
        ty: Ty,
        bt: BasicType,
        ord: MemOrd,
    ) -> NodeId {
        let ctrl = self.ctrl;
        let mem = self.memory(alias);
        self.g.add(Op::Load { bt, ord }, ty, &[ctrl, mem, addr])
    }

    pub fn store(
        &mut self,
        alias: AliasIdx,
        addr: NodeId,
        value: NodeId,
        bt: BasicType,
        ord: MemOrd,
    ) -> NodeId {
        let ctrl = self.ctrl;
        let mem = self.memory(alias);
        let st = self
            .g
            .add(Op::Store { bt, ord }, Ty::Memory, &[ctrl, mem, addr, value]);
        self.mem.insert(alias, st);
        st
    }

    pub fn mem_bar(&mut self, alias: AliasIdx) -> NodeId {
        let ctrl = self.ctrl;
        let mem = self.memory(alias);
        let bar = self.g.add(Op::MemBarCpuOrder, Ty::Memory, &[ctrl, mem]);
        self.mem.insert(alias, bar);
        bar
    }

    /// Fresh allocation plus its zero-initialized memory state
    pub fn allocate(&mut self, klass: KlassId, field_alias: AliasIdx) -> (NodeId, NodeId) {
        let ctrl = self.ctrl;
        let mem = self.memory(RAW_ALIAS);
        let alloc = self
            .g
            .add(Op::Allocate { klass }, Ty::Ref(RefTy::exact(klass)), &[ctrl, mem]);
        let init = self.g.add(Op::InitializeMem, Ty::Memory, &[alloc]);
        self.mem.insert(field_alias, init);
        (alloc, init)
    }

    pub fn atomic_ref(
        &mut self,
        kind: AtomicRefKind,
        width: RefWidth,
        barriered: bool,
        ord: MemOrd,
        alias: AliasIdx,
        addr: NodeId,
        expected: NodeId,
        new_val: NodeId,
        result_ty: Ty,
    ) -> NodeId {
        let ctrl = self.ctrl;
        let mem = self.memory(alias);
        let atomic = self.g.add(
            Op::AtomicRef {
                kind,
                width,
                barriered,
                ord,
            },
            result_ty,
            &[ctrl, mem, addr, expected, new_val],
        );
        let mproj = self.g.add(Op::ScMemProj, Ty::Memory, &[atomic]);
        self.mem.insert(alias, mproj);
        atomic
    }

    pub fn get_and_set_ref(
        &mut self,
        width: RefWidth,
        alias: AliasIdx,
        addr: NodeId,
        new_val: NodeId,
        result_ty: Ty,
    ) -> NodeId {
        let ctrl = self.ctrl;
        let mem = self.memory(alias);
        let xchg = self.g.add(
            Op::GetAndSetRef { width },
            result_ty,
            &[ctrl, mem, addr, new_val],
        );
        let mproj = self.g.add(Op::ScMemProj, Ty::Memory, &[xchg]);
        self.mem.insert(alias, mproj);
        xchg
    }

    // ---- control flow ----

    /// Branch on `cond`; returns the taken/untaken control projections.
    /// `prob` is the probability the condition holds.
    pub fn if_then_else(&mut self, cond: NodeId, prob: f32) -> (NodeId, NodeId) {
        let ctrl = self.ctrl;
        let iff = self.g.add(Op::If { prob }, Ty::Tuple, &[ctrl, cond]);
        let t = self.g.add(Op::IfTrue, Ty::Control, &[iff]);
        let f = self.g.add(Op::IfFalse, Ty::Control, &[iff]);
        (t, f)
    }

    /// Merge two finished branch states into a region, phi-ing every
    /// alias class whose memory diverged; leaves the cursor at the merge
    pub fn merge(&mut self, a: BuilderState, b: BuilderState) -> NodeId {
        let region = self.g.add(Op::Region, Ty::Control, &[a.ctrl, b.ctrl]);

        let mut aliases: Vec<AliasIdx> = a.mem.keys().chain(b.mem.keys()).copied().collect();
        aliases.sort();
        aliases.dedup();

        let mut merged = FxHashMap::default();
        for alias in aliases {
            let ma = self.state_mem(&a, alias);
            let mb = self.state_mem(&b, alias);
            let m = if ma == mb {
                ma
            } else {
                self.g.add(Op::Phi, Ty::Memory, &[region, ma, mb])
            };
            merged.insert(alias, m);
        }

        self.ctrl = region;
        self.mem = merged;
        region
    }

    /// Two-way value phi on a merge region
    pub fn phi2(&mut self, region: NodeId, ty: Ty, a: NodeId, b: NodeId) -> NodeId {
        self.g.add(Op::Phi, ty, &[region, a, b])
    }

    fn state_mem(&mut self, state: &BuilderState, alias: AliasIdx) -> NodeId {
        match state.mem.get(&alias) {
            Some(&m) => m,
            None => self.initial_memory(alias),
        }
    }

    // ---- calls ----

    /// Leaf runtime call: no safepoint, no deoptimization state.
    /// Consumes and produces control and raw memory.
    pub fn make_leaf_call(&mut self, name: &'static str, args: &[NodeId]) -> NodeId {
        let ctrl = self.ctrl;
        let mem = self.memory(RAW_ALIAS);
        let mut inputs = vec![ctrl, mem];
        inputs.extend_from_slice(args);
        let call = self.g.add(Op::CallLeaf { name }, Ty::Tuple, &inputs);
        let cproj = self.g.add(Op::ProjCtrl, Ty::Control, &[call]);
        let mproj = self.g.add(Op::ProjMem, Ty::Memory, &[call]);
        self.ctrl = cproj;
        self.mem.insert(RAW_ALIAS, mproj);
        call
    }

    /// Result projection of a value-returning call
    pub fn call_result(&mut self, call: NodeId, ty: Ty) -> NodeId {
        self.g.add(Op::ProjResult, ty, &[call])
    }

    /// Attach a return to the root
    pub fn ret(&mut self, alias: AliasIdx, value: NodeId) -> NodeId {
        let ctrl = self.ctrl;
        let mem = self.memory(alias);
        let ret = self.g.add(Op::Return, Ty::Control, &[ctrl, mem, value]);
        let root = self.g.root;
        self.g.add_input(root, ret);
        ret
    }
}
