//! Structural barrier verification (debug builds).
//!
//! Walks control flow backward from the root and checks that every
//! is-marking branch shares its control predecessor with the gc-state
//! load feeding it. A test floating away from its load could observe a
//! marking flag from a different safepoint epoch than the value it
//! guards. The control projection of an infinite-loop guard is the one
//! documented exception.

use thiserror::Error;
use veldc_util::FxHashSet;

use veldc_graph::{Graph, NodeId, Op};

use crate::access::BarrierSet;
use crate::runtime::ThreadContext;
use crate::satb::is_marking_if;

/// Violation report of the barrier verifier
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("is-marking test {test:?} and its gc-state load {load:?} have different controls")]
    ControlMismatch { test: NodeId, load: NodeId },
}

impl BarrierSet {
    /// Flag-gated verification entry point for the host's debug hooks
    pub fn verify_gc_barriers(&self, g: &Graph) -> Result<(), VerifyError> {
        if self.flags.verify_barriers {
            verify_barriers(g, &self.tcx)
        } else {
            Ok(())
        }
    }
}

/// Check every reachable is-marking branch. Optionally invoked; callers
/// assert on the result in debug builds.
pub fn verify_barriers(g: &Graph, tcx: &ThreadContext) -> Result<(), VerifyError> {
    let mut visited: FxHashSet<NodeId> = FxHashSet::default();
    let mut worklist = vec![g.root];

    while let Some(x) = worklist.pop() {
        if x == g.top || !visited.insert(x) {
            continue;
        }

        match g.op(x) {
            Op::Root | Op::Region => {
                for &input in g.inputs(x) {
                    worklist.push(input);
                }
            }
            Op::Start | Op::Halt | Op::Dead => {}
            _ => {
                if g.num_inputs(x) > 0 {
                    worklist.push(g.input(x, 0));
                }

                if is_marking_if(g, tcx, x) {
                    // Shape is guaranteed by is_marking_if:
                    // If(Cmp(And(load, MARKING), 0))
                    let cond = g.input(x, 1);
                    let masked = g.input(cond, 0);
                    let load = g.input(masked, 0);

                    let mut if_ctrl = g.input(x, 0);
                    let load_ctrl = g.input(load, 0);

                    if if_ctrl != load_ctrl
                        && g.op(if_ctrl) == Op::CProj
                        && g.op(g.input(if_ctrl, 0)) == Op::NeverBranch
                    {
                        // Infinite-loop guard between load and test.
                        if_ctrl = g.input(g.input(if_ctrl, 0), 0);
                    }

                    if if_ctrl != load_ctrl {
                        return Err(VerifyError::ControlMismatch { test: x, load });
                    }
                }
            }
        }
    }

    Ok(())
}
