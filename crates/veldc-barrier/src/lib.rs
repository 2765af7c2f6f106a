//! veldc-barrier - GC barrier insertion and expansion for the veldc JIT
//!
//! The vgc collector marks and evacuates concurrently with running
//! compiled code, which is only sound if every compiled heap access
//! carries the right barriers: SATB pre-write barriers so marking never
//! loses a reference that existed at snapshot time, and load-reference
//! barriers so loads observe an object's current location during
//! evacuation. This crate decides which barriers each access needs,
//! builds their control-flow templates into the compilation's graph,
//! keeps the optimizer honest about them (escape analysis, peephole
//! rules), and lowers what is left to explicit branches before code
//! generation.
//!
//! One [`BarrierSet`] instance exists per in-flight compilation and
//! owns that compilation's [`BarrierSetState`] registry. Nothing here
//! is shared between compilations and nothing blocks; the concurrency
//! being handled is the mutator/collector race at run time, encoded in
//! the emitted templates.

pub mod access;
pub mod clone;
pub mod escape;
pub mod expand;
pub mod flags;
pub mod peephole;
pub mod referent;
pub mod runtime;
pub mod satb;
pub mod state;
pub mod verify;


#[cfg(test)]
mod edge_cases;

pub use access::{
    is_gc_barrier_node, step_over_gc_barrier, AccessDescriptor, AccessOrigin, BarrierSet,
    LocationClass, RefStrength,
};
pub use clone::{array_copy_requires_gc_barriers, clone_needs_postbarrier, ArrayCopyPhase};
pub use expand::{optimize_loops, LoopOptsMode};
pub use flags::BarrierFlags;
pub use runtime::{GcState, RuntimeFn, ThreadContext};
pub use state::BarrierSetState;
pub use verify::{verify_barriers, VerifyError};
