//! Analyses over the graph IR.

pub mod escape;

pub use escape::{ConnectionGraph, EscapeState, GcEscapeHooks, NoGcHooks};
