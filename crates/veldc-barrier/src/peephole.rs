//! Peephole simplification of barrier-related shapes.
//!
//! Three rewrites run during iterative simplification:
//!
//! 1. Null comparisons step over an intervening barrier on the non-null
//!    operand; relocation never changes null-ness, and the raw value
//!    exposes more null-check elimination.
//! 2. Two is-marking tests merge when one structurally dominates the
//!    other within a bounded dominator-chain search; failure to find a
//!    dominator degrades to no merge, never to a wrong merge.
//! 3. The scheduling-only address input threaded onto a SATB slow-path
//!    call is dropped once the address computation has no other use.
//!
//! [`final_graph_reshaping`] is the last line of defense before code
//! generation: barriered atomics report as store-load barriers and a
//! surviving load-reference barrier is a fatal fault.

use veldc_graph::{Graph, NodeId, Op, Ty};

use crate::access::step_over_gc_barrier;
use crate::runtime::{RuntimeFn, ThreadContext};
use crate::satb::{has_only_wb_pre_uses, is_marking_if, is_wb_pre_call};

/// Bound of the dominator-chain search for mergeable marking tests
pub const DOM_SEARCH_DEPTH: u32 = 16;

const MAX_PEEPHOLE_ROUNDS: usize = 10;

/// One local simplification attempt on `n`; true when the graph changed
pub fn ideal_node(g: &mut Graph, tcx: &ThreadContext, n: NodeId) -> bool {
    if g.is_dead(n) {
        return false;
    }
    fold_constant_if(g, n)
        || try_wb_pre_input_cleanup(g, n)
        || try_cmp_null_skip(g, n)
        || try_merge_marking_test(g, tcx, n)
}

/// Drive [`ideal_node`] over the whole graph to a bounded fixpoint
pub fn run_peephole(g: &mut Graph, tcx: &ThreadContext) -> bool {
    let mut any_change = false;
    let mut rounds = 0;
    loop {
        let mut changed = false;
        let ids: Vec<NodeId> = g.node_ids().collect();
        for n in ids {
            changed |= ideal_node(g, tcx, n);
        }
        any_change |= changed;
        rounds += 1;
        if !changed || rounds >= MAX_PEEPHOLE_ROUNDS {
            if rounds >= MAX_PEEPHOLE_ROUNDS {
                log::warn!("peephole simplification reached max rounds ({MAX_PEEPHOLE_ROUNDS})");
            }
            return any_change;
        }
    }
}

/// Fold a branch whose condition is a constant
fn fold_constant_if(g: &mut Graph, n: NodeId) -> bool {
    if !matches!(g.op(n), Op::If { .. }) {
        return false;
    }
    let cond = g.input(n, 1);
    let v = match g.find_int_con(cond) {
        Some(v) => v,
        None => return false,
    };
    settle_if(g, n, v != 0);
    true
}

/// Null-comparison barrier skip
fn try_cmp_null_skip(g: &mut Graph, n: NodeId) -> bool {
    if !matches!(g.op(n), Op::Cmp(_)) {
        return false;
    }
    let in1 = g.input(n, 0);
    let in2 = g.input(n, 1);
    let mut changed = false;
    if g.op(in1) == Op::NullRef {
        let stepped = step_over_gc_barrier(g, in2);
        if stepped != in2 {
            g.set_input(n, 1, stepped);
            changed = true;
        }
    }
    if g.op(in2) == Op::NullRef {
        let stepped = step_over_gc_barrier(g, in1);
        if stepped != in1 {
            g.set_input(n, 0, stepped);
            changed = true;
        }
    }
    changed
}

/// Drop the scheduling-only address input of a SATB slow-path call once
/// nothing but such calls uses the address computation
fn try_wb_pre_input_cleanup(g: &mut Graph, n: NodeId) -> bool {
    if !is_wb_pre_call(g, n) {
        return false;
    }
    let declared = 2 + RuntimeFn::WriteRefFieldPre.arg_count();
    if g.num_inputs(n) > declared {
        let addp = g.input(n, declared);
        if has_only_wb_pre_uses(g, addp) {
            g.del_input(n, declared);
            log::trace!("dropped dead scheduling input from wb-pre call {n:?}");
            return true;
        }
    }
    false
}

/// Merge an is-marking test with a structurally dominating one.
///
/// Walks up the dominator chain at most [`DOM_SEARCH_DEPTH`] steps
/// looking for another marking test reached through one of its own
/// arms; giving up leaves both tests in place (a missed optimization,
/// not a correctness problem).
fn try_merge_marking_test(g: &mut Graph, tcx: &ThreadContext, n: NodeId) -> bool {
    if !is_marking_if(g, tcx, n) {
        return false;
    }

    let mut prev = n;
    let mut dom = g.input(n, 0);
    let mut dist = DOM_SEARCH_DEPTH;
    loop {
        let arrived_through_arm =
            matches!(g.op(prev), Op::IfTrue | Op::IfFalse) && g.input(prev, 0) == dom;
        if is_marking_if(g, tcx, dom) && arrived_through_arm {
            break;
        }
        if dist == 0 {
            return false;
        }
        dist -= 1;
        prev = dom;
        dom = match up_one_dom(g, dom) {
            Some(d) => d,
            None => return false,
        };
    }

    // A loop brought us back to the test itself
    if n == dom {
        return false;
    }

    let taken_true = g.op(prev) == Op::IfTrue;
    log::trace!("marking test {n:?} proven by dominating test {dom:?}");
    settle_if(g, n, taken_true);
    true
}

/// Replace a branch with its known outcome: the taken projection falls
/// through to the branch's control, the untaken one becomes dead
fn settle_if(g: &mut Graph, iff: NodeId, taken_true: bool) {
    let ctrl = g.input(iff, 0);
    let t = g.proj_out(iff, Op::IfTrue);
    let f = g.proj_out(iff, Op::IfFalse);
    let (live, dead) = if taken_true { (t, f) } else { (f, t) };
    if let Some(d) = dead {
        let halt = g.add(Op::Halt, Ty::Control, &[]);
        g.replace_node(d, halt);
    }
    if let Some(l) = live {
        g.replace_node(l, ctrl);
    }
    g.kill(iff);
}

/// One step up the structural dominator chain, or `None` where the
/// shape gives no unique answer
fn up_one_dom(g: &Graph, n: NodeId) -> Option<NodeId> {
    match g.op(n) {
        Op::Start | Op::Root => None,
        Op::Region => {
            let ins = g.inputs(n);
            match ins.len() {
                1 => Some(ins[0]),
                2 => {
                    // Diamond merge: both arms project from one branch,
                    // so the branch's control dominates the merge.
                    let (a, b) = (ins[0], ins[1]);
                    if matches!(g.op(a), Op::IfTrue | Op::IfFalse)
                        && matches!(g.op(b), Op::IfTrue | Op::IfFalse)
                        && g.input(a, 0) == g.input(b, 0)
                    {
                        let iff = g.input(a, 0);
                        Some(g.input(iff, 0))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        }
        _ => {
            if g.num_inputs(n) > 0 {
                Some(g.input(n, 0))
            } else {
                None
            }
        }
    }
}

/// Final-shape check run per node just before code generation.
/// Returns true for nodes instruction selection must treat as
/// store-load barriers.
///
/// # Panics
///
/// Panics when a load-reference barrier macro node survived expansion,
/// or a SATB slow-path call still carries a scheduling input that the
/// peephole cleanup should have handled.
pub fn final_graph_reshaping(g: &mut Graph, n: NodeId) -> bool {
    match g.op(n) {
        Op::CallLeaf { .. } if is_wb_pre_call(g, n) => {
            let declared = 2 + RuntimeFn::WriteRefFieldPre.arg_count();
            if g.num_inputs(n) > declared {
                assert!(g.num_inputs(n) == declared + 1, "only one extra input");
                let addp = g.input(n, declared);
                assert!(
                    !has_only_wb_pre_uses(g, addp),
                    "useless address computation?"
                );
                g.del_input(n, declared);
            }
            false
        }
        Op::AtomicRef { barriered: true, .. } => true,
        Op::LoadRefBarrier => {
            panic!("load-reference barrier should have been expanded already")
        }
        _ => false,
    }
}
