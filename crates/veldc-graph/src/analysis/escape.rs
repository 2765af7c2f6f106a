//! Connection-graph (points-to) escape analysis skeleton.
//!
//! Determines whether an allocation's reference can leave its allocating
//! scope. The builder walks the node list twice (classification, then
//! final edges) and lets a [`GcEscapeHooks`] implementation intercept
//! collector-specific node kinds before the generic rules run; this is
//! the seam the barrier subsystem plugs into so its nodes do not
//! pessimize escape results.
//!
//! Edges run in the direction escape state flows: an edge `a -> b`
//! means "if `a` escapes, `b` escapes" (a local alias of `b`, or a base
//! whose field holds `b`).

use veldc_util::{FxHashMap, FxHashSet};

use crate::graph::{Graph, NodeId};
use crate::node::Op;

/// How far a reference provably travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscapeState {
    NoEscape,
    ArgEscape,
    GlobalEscape,
}

/// Collector hooks into connection-graph construction
pub trait GcEscapeHooks {
    /// First-pass classification of `n`. Return true when handled.
    fn add_to_con_graph(&self, cg: &mut ConnectionGraph, n: NodeId) -> bool;

    /// Second-pass edge completion for `n`. Return true when handled.
    fn add_final_edges(&self, cg: &mut ConnectionGraph, n: NodeId) -> bool;

    /// Is `n` a barrier node the analysis should treat as a transparent
    /// alias of its value input?
    fn is_barrier_node(&self, g: &Graph, n: NodeId) -> bool;

    /// Does `n` feed a collector-aware atomic that classifies as an
    /// unsafe access?
    fn has_out_with_unsafe_object(&self, g: &Graph, n: NodeId) -> bool;
}

/// Hooks implementation for a host with no barrier-emitting collector
pub struct NoGcHooks;

impl GcEscapeHooks for NoGcHooks {
    fn add_to_con_graph(&self, _cg: &mut ConnectionGraph, _n: NodeId) -> bool {
        false
    }
    fn add_final_edges(&self, _cg: &mut ConnectionGraph, _n: NodeId) -> bool {
        false
    }
    fn is_barrier_node(&self, _g: &Graph, _n: NodeId) -> bool {
        false
    }
    fn has_out_with_unsafe_object(&self, _g: &Graph, _n: NodeId) -> bool {
        false
    }
}

/// Per-compilation connection graph
pub struct ConnectionGraph<'g> {
    pub g: &'g Graph,
    escape: FxHashMap<NodeId, EscapeState>,
    edges: Vec<(NodeId, NodeId)>,
    edge_set: FxHashSet<(NodeId, NodeId)>,
}

impl<'g> ConnectionGraph<'g> {
    pub fn new(g: &'g Graph) -> ConnectionGraph<'g> {
        ConnectionGraph {
            g,
            escape: FxHashMap::default(),
            edges: Vec::new(),
            edge_set: FxHashSet::default(),
        }
    }

    /// Build and solve the graph
    pub fn build(g: &'g Graph, hooks: &dyn GcEscapeHooks) -> ConnectionGraph<'g> {
        let mut cg = ConnectionGraph::new(g);

        for n in g.node_ids() {
            if g.is_dead(n) {
                continue;
            }
            if hooks.add_to_con_graph(&mut cg, n) {
                continue;
            }
            cg.add_node_generic(n);
        }

        for n in g.node_ids() {
            if !g.is_dead(n) {
                let _ = hooks.add_final_edges(&mut cg, n);
            }
        }

        cg.propagate();
        log::trace!(
            "connection graph solved: {} tracked nodes, {} edges",
            cg.escape.len(),
            cg.edges.len()
        );
        cg
    }

    fn add_node_generic(&mut self, n: NodeId) {
        match self.g.op(n) {
            Op::Allocate { .. } => {
                self.set_escape(n, EscapeState::NoEscape);
            }
            Op::Phi if self.g.ty(n).is_ref() => {
                for i in 1..self.g.num_inputs(n) {
                    let input = self.g.input(n, i);
                    self.add_local_var_and_edge(n, EscapeState::NoEscape, input);
                }
            }
            Op::CastWide | Op::CastNarrow => {
                let input = self.g.input(n, 0);
                self.add_local_var_and_edge(n, EscapeState::NoEscape, input);
            }
            Op::Load { bt, .. } if bt.is_reference() => {
                self.add_objload_to_connection_graph(n);
            }
            Op::Store { bt, .. } if bt.is_reference() => {
                let addr = self.g.input(n, 2);
                let value = self.g.input(n, 3);
                let base = self.get_addp_base(addr);
                match base.and_then(|b| self.g.find_allocation(b)) {
                    Some(alloc) => self.add_edge(alloc, value),
                    // Store into memory we cannot attribute: value is gone
                    None => self.set_escape(value, EscapeState::GlobalEscape),
                }
            }
            Op::Return => {
                for i in 2..self.g.num_inputs(n) {
                    let v = self.g.input(n, i);
                    if self.g.ty(v).is_ref() {
                        self.set_escape(v, EscapeState::ArgEscape);
                    }
                }
            }
            Op::CallLeaf { .. } => {
                for i in 2..self.g.num_inputs(n) {
                    let arg = self.g.input(n, i);
                    if self.g.ty(arg).is_ref() {
                        self.set_escape(arg, EscapeState::GlobalEscape);
                    }
                }
            }
            _ => {}
        }
    }

    /// Record `n` as a local variable in state `es` aliasing `target`
    pub fn add_local_var_and_edge(&mut self, n: NodeId, es: EscapeState, target: NodeId) {
        self.set_escape(n, es);
        self.add_edge(n, target);
    }

    /// A reference load: a fresh local variable whose referent is unknown
    /// but does not by itself escape anything
    pub fn add_objload_to_connection_graph(&mut self, n: NodeId) {
        self.set_escape(n, EscapeState::NoEscape);
    }

    /// Classify an atomic reference access the way an unsafe (untyped,
    /// possibly off-lattice) access is classified: the new value flows
    /// into the base when the base is a known allocation, otherwise it
    /// escapes globally
    pub fn add_to_congraph_unsafe_access(&mut self, n: NodeId) {
        let addr = self.g.input(n, 2);
        let new_val = *self.g.inputs(n).last().expect("atomic without value input");
        let base = self.get_addp_base(addr);
        match base.and_then(|b| self.g.find_allocation(b)) {
            Some(alloc) => self.add_edge(alloc, new_val),
            None => self.set_escape(new_val, EscapeState::GlobalEscape),
        }
    }

    /// Final-edge completion of an unsafe access; returns true
    pub fn add_final_edges_unsafe_access(&mut self, n: NodeId) -> bool {
        self.add_to_congraph_unsafe_access(n);
        true
    }

    /// The base object of an address computation
    pub fn get_addp_base(&self, addr: NodeId) -> Option<NodeId> {
        match self.g.op(addr) {
            Op::AddPtr => Some(self.g.input(addr, 0)),
            _ => None,
        }
    }

    pub fn set_escape(&mut self, n: NodeId, es: EscapeState) {
        let entry = self.escape.entry(n).or_insert(EscapeState::NoEscape);
        if es > *entry {
            *entry = es;
        }
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if self.edge_set.insert((from, to)) {
            self.edges.push((from, to));
        }
    }

    /// Escape state of `n` after solving
    pub fn escape_state(&self, n: NodeId) -> EscapeState {
        self.escape
            .get(&n)
            .copied()
            .unwrap_or(EscapeState::NoEscape)
    }

    /// Flow escape states along edges to a fixpoint
    fn propagate(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            for &(from, to) in &self.edges {
                let from_es = self
                    .escape
                    .get(&from)
                    .copied()
                    .unwrap_or(EscapeState::NoEscape);
                let to_es = self.escape.entry(to).or_insert(EscapeState::NoEscape);
                if from_es > *to_es {
                    *to_es = from_es;
                    changed = true;
                }
            }
        }
    }
}
