//! veldc-graph - Graph IR of the veldc optimizing compiler
//!
//! A sea-of-nodes instruction graph with mutation-in-place semantics:
//! flat nodes in an arena-owned store, maintained def-use edges, a small
//! type lattice, and a builder that tracks current control and per-alias
//! memory state the way the parser does.
//!
//! The node kind enumeration is closed and includes the collector's
//! barrier node kinds; generic passes match on it exhaustively. The
//! connection-graph escape analysis exposes a hook seam
//! ([`analysis::GcEscapeHooks`]) so the barrier subsystem can teach it
//! about those kinds without the analysis knowing collector internals.

pub mod analysis;
pub mod builder;
pub mod graph;
pub mod node;
pub mod types;

pub use builder::{AliasIdx, BuilderState, GraphBuilder, RAW_ALIAS};
pub use graph::{Graph, Node, NodeId};
pub use node::{AtomicRefKind, CmpKind, MemOrd, Op, RefWidth, BARRIER_VALUE_IN};
pub use types::{BasicType, ElemKind, KlassId, KlassInfo, RefTy, Ty};
