//! Graph store: arena-owned nodes with maintained def-use edges.
//!
//! One `Graph` is owned by one in-flight compilation and mutated in
//! place by every pass. Nodes never move; replaced nodes are
//! tombstoned as [`Op::Dead`] and dropped from the def-use index, so
//! `NodeId` handles held by pass-local state stay valid for membership
//! tests until the owning compilation is discarded.

use veldc_util::{define_idx, FxHashMap, FxHashSet, IndexVec};

use crate::node::Op;
use crate::types::{KlassId, KlassInfo, RefTy, Ty};

define_idx!(NodeId);

static_assertions::assert_eq_size!(NodeId, u32);

/// One IR node: operator, flat input list, value type
#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<NodeId>,
    pub ty: Ty,
}

/// The compilation's instruction graph
pub struct Graph {
    nodes: IndexVec<NodeId, Node>,
    uses: IndexVec<NodeId, Vec<NodeId>>,
    /// Klass table the static-type filters consult
    pub klasses: IndexVec<KlassId, KlassInfo>,

    /// The absent-input sentinel
    pub top: NodeId,
    /// Graph root; return nodes attach here
    pub root: NodeId,
    /// Initial control
    pub start: NodeId,

    con_int_cache: FxHashMap<i64, NodeId>,
    con_bool_cache: FxHashMap<bool, NodeId>,
    null_node: Option<NodeId>,
    thread_local_node: Option<NodeId>,
}

impl Graph {
    pub fn new() -> Graph {
        let mut nodes = IndexVec::new();
        let mut uses = IndexVec::new();

        let top = nodes.push(Node {
            op: Op::Top,
            inputs: Vec::new(),
            ty: Ty::Top,
        });
        uses.push(Vec::new());
        let root = nodes.push(Node {
            op: Op::Root,
            inputs: Vec::new(),
            ty: Ty::Control,
        });
        uses.push(Vec::new());
        let start = nodes.push(Node {
            op: Op::Start,
            inputs: Vec::new(),
            ty: Ty::Control,
        });
        uses.push(Vec::new());

        Graph {
            nodes,
            uses,
            klasses: IndexVec::new(),
            top,
            root,
            start,
            con_int_cache: FxHashMap::default(),
            con_bool_cache: FxHashMap::default(),
            null_node: None,
            thread_local_node: None,
        }
    }

    /// Number of node slots ever allocated (dead slots included)
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Create a node and index it in the def-use lists
    pub fn add(&mut self, op: Op, ty: Ty, inputs: &[NodeId]) -> NodeId {
        let id = self.nodes.push(Node {
            op,
            inputs: inputs.to_vec(),
            ty,
        });
        self.uses.push(Vec::new());
        for &input in inputs {
            self.uses[input].push(id);
        }
        id
    }

    pub fn op(&self, n: NodeId) -> Op {
        self.nodes[n].op
    }

    pub fn ty(&self, n: NodeId) -> Ty {
        self.nodes[n].ty
    }

    pub fn inputs(&self, n: NodeId) -> &[NodeId] {
        &self.nodes[n].inputs
    }

    pub fn input(&self, n: NodeId, i: usize) -> NodeId {
        self.nodes[n].inputs[i]
    }

    pub fn num_inputs(&self, n: NodeId) -> usize {
        self.nodes[n].inputs.len()
    }

    pub fn uses_of(&self, n: NodeId) -> &[NodeId] {
        &self.uses[n]
    }

    pub fn outcnt(&self, n: NodeId) -> usize {
        self.uses[n].len()
    }

    pub fn is_dead(&self, n: NodeId) -> bool {
        matches!(self.nodes[n].op, Op::Dead)
    }

    /// Replace input slot `i` of `n`, keeping the def-use index consistent
    pub fn set_input(&mut self, n: NodeId, i: usize, new_input: NodeId) {
        let old = self.nodes[n].inputs[i];
        if old == new_input {
            return;
        }
        self.nodes[n].inputs[i] = new_input;
        remove_one(&mut self.uses[old], n);
        self.uses[new_input].push(n);
    }

    /// Append a trailing input to `n`
    pub fn add_input(&mut self, n: NodeId, input: NodeId) {
        self.nodes[n].inputs.push(input);
        self.uses[input].push(n);
    }

    /// Delete input slot `i` of `n`, shifting later slots down
    pub fn del_input(&mut self, n: NodeId, i: usize) {
        let old = self.nodes[n].inputs.remove(i);
        remove_one(&mut self.uses[old], n);
    }

    /// Rewire every use of `old` to `new`, then tombstone `old`
    ///
    /// # Panics
    ///
    /// Panics when `old` and `new` are the same node.
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) {
        assert_ne!(old, new, "node replaced by itself");
        let users = std::mem::take(&mut self.uses[old]);
        for user in users {
            if user == new {
                // new consumed old as an input; that edge dies with old
                for slot in 0..self.nodes[user].inputs.len() {
                    if self.nodes[user].inputs[slot] == old {
                        self.nodes[user].inputs[slot] = self.top;
                        let top = self.top;
                        self.uses[top].push(user);
                    }
                }
                continue;
            }
            for slot in 0..self.nodes[user].inputs.len() {
                if self.nodes[user].inputs[slot] == old {
                    self.nodes[user].inputs[slot] = new;
                    self.uses[new].push(user);
                }
            }
        }
        self.kill(old);
    }

    /// Tombstone a node and release its input edges
    pub fn kill(&mut self, n: NodeId) {
        let inputs = std::mem::take(&mut self.nodes[n].inputs);
        for input in inputs {
            remove_one(&mut self.uses[input], n);
        }
        self.nodes[n].op = Op::Dead;
        self.nodes[n].ty = Ty::Top;
        self.uses[n].clear();
    }

    // ---- shared constants ----

    pub fn con_int(&mut self, v: i64) -> NodeId {
        if let Some(&n) = self.con_int_cache.get(&v) {
            return n;
        }
        let n = self.add(Op::ConInt(v), Ty::IntPtr, &[]);
        self.con_int_cache.insert(v, n);
        n
    }

    /// Boolean constant, distinct from the integer constant space
    pub fn con_bool(&mut self, v: bool) -> NodeId {
        if let Some(&n) = self.con_bool_cache.get(&v) {
            return n;
        }
        let n = self.add(Op::ConInt(v as i64), Ty::Bool, &[]);
        self.con_bool_cache.insert(v, n);
        n
    }

    pub fn null_ref(&mut self) -> NodeId {
        if let Some(n) = self.null_node {
            return n;
        }
        let n = self.add(Op::NullRef, Ty::Ref(RefTy::BOTTOM), &[]);
        self.null_node = Some(n);
        n
    }

    pub fn thread_local(&mut self) -> NodeId {
        if let Some(n) = self.thread_local_node {
            return n;
        }
        let n = self.add(Op::ThreadLocal, Ty::RawPtr, &[]);
        self.thread_local_node = Some(n);
        n
    }

    pub fn add_klass(&mut self, info: KlassInfo) -> KlassId {
        self.klasses.push(info)
    }

    // ---- structural queries ----

    /// Constant value of a `ConInt` node
    pub fn find_int_con(&self, n: NodeId) -> Option<i64> {
        match self.op(n) {
            Op::ConInt(v) => Some(v),
            _ => None,
        }
    }

    /// Split an address into `(base, constant offset)`
    ///
    /// Returns `None` when the offset is not a compile-time constant
    /// (the bottom offset of the original's AddP decomposition).
    pub fn decompose_addr(&self, addr: NodeId) -> Option<(NodeId, i64)> {
        match self.op(addr) {
            Op::AddPtr => {
                let base = self.input(addr, 0);
                let off = self.find_int_con(self.input(addr, 1))?;
                Some((base, off))
            }
            _ => None,
        }
    }

    /// The allocation node a reference value comes from, if provable
    pub fn find_allocation(&self, base: NodeId) -> Option<NodeId> {
        match self.op(base) {
            Op::Allocate { .. } => Some(base),
            _ => None,
        }
    }

    /// Find the projection of kind `kind` hanging off a multi-value node
    pub fn proj_out(&self, multi: NodeId, kind: Op) -> Option<NodeId> {
        self.uses[multi]
            .iter()
            .copied()
            .find(|&u| self.op(u) == kind && self.input(u, 0) == multi)
    }

    /// Nodes reachable from the root through input edges
    ///
    /// This is the compilation's live-node set: anything the root does
    /// not transitively demand is garbage in the compiler's own graph.
    pub fn live_set(&self) -> FxHashSet<NodeId> {
        let mut live = FxHashSet::default();
        let mut worklist = vec![self.root];
        live.insert(self.root);
        while let Some(n) = worklist.pop() {
            for &input in self.inputs(n) {
                if live.insert(input) {
                    worklist.push(input);
                }
            }
        }
        live
    }

    /// Iterate all node ids, dead slots included
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(|i| NodeId(i as u32))
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

fn remove_one(list: &mut Vec<NodeId>, item: NodeId) {
    if let Some(pos) = list.iter().position(|&x| x == item) {
        list.swap_remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CmpKind;

    #[test]
    fn test_add_and_uses() {
        let mut g = Graph::new();
        let a = g.con_int(1);
        let b = g.con_int(2);
        let cmp = g.add(Op::Cmp(CmpKind::Ne), Ty::Bool, &[a, b]);
        assert_eq!(g.uses_of(a), &[cmp]);
        assert_eq!(g.uses_of(b), &[cmp]);
        assert_eq!(g.inputs(cmp), &[a, b]);
    }

    #[test]
    fn test_con_int_dedup() {
        let mut g = Graph::new();
        assert_eq!(g.con_int(7), g.con_int(7));
        assert_ne!(g.con_int(7), g.con_int(8));
    }

    #[test]
    fn test_replace_node_rewires_uses() {
        let mut g = Graph::new();
        let a = g.con_int(1);
        let b = g.con_int(2);
        let c = g.con_int(3);
        let cmp = g.add(Op::Cmp(CmpKind::Eq), Ty::Bool, &[a, b]);
        g.replace_node(b, c);
        assert_eq!(g.inputs(cmp), &[a, c]);
        assert!(g.is_dead(b));
        assert!(g.uses_of(c).contains(&cmp));
    }

    #[test]
    fn test_live_set_excludes_detached() {
        let mut g = Graph::new();
        let a = g.con_int(1);
        let root = g.root;
        let start = g.start;
        let ret = g.add(Op::Return, Ty::Control, &[start, a]);
        g.add_input(root, ret);
        let orphan = g.add(Op::ConInt(99), Ty::IntPtr, &[]);

        let live = g.live_set();
        assert!(live.contains(&ret));
        assert!(live.contains(&a));
        assert!(!live.contains(&orphan));
    }

    #[test]
    fn test_decompose_addr() {
        let mut g = Graph::new();
        let base = g.add(Op::Parm(0), Ty::Ref(RefTy::BOTTOM), &[]);
        let off = g.con_int(16);
        let addr = g.add(Op::AddPtr, Ty::RawPtr, &[base, off]);
        assert_eq!(g.decompose_addr(addr), Some((base, 16)));

        let dyn_off = g.add(Op::Parm(1), Ty::IntPtr, &[]);
        let addr2 = g.add(Op::AddPtr, Ty::RawPtr, &[base, dyn_off]);
        assert_eq!(g.decompose_addr(addr2), None);
    }
}
