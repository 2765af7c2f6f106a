//! Runtime call contract and collector-visible thread layout.
//!
//! The expansion pass may emit exactly three leaf calls into the
//! collector runtime; their names and signatures are fixed here and
//! nowhere else. Thread-local collector state (gc-state byte, SATB
//! queue index and buffer slots) is described by an explicit
//! [`ThreadContext`] handle passed into every emission routine; there is
//! no hidden global lookup.

/// Leaf call targets the barrier subsystem may emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFn {
    /// `vgc_wb_pre(value: ref, thread: raw) -> ()` - push a
    /// to-be-overwritten reference onto the full SATB queue
    WriteRefFieldPre,
    /// `vgc_clone_barrier(dest: ref) -> ()` - post-copy fixup of a
    /// freshly cloned object
    CloneBarrier,
    /// `vgc_load_reference_barrier(value: ref) -> ref` - return the
    /// up-to-date location of an object under concurrent evacuation
    LoadReferenceBarrier,
}

impl RuntimeFn {
    pub const fn name(self) -> &'static str {
        match self {
            RuntimeFn::WriteRefFieldPre => "vgc_wb_pre",
            RuntimeFn::CloneBarrier => "vgc_clone_barrier",
            RuntimeFn::LoadReferenceBarrier => "vgc_load_reference_barrier",
        }
    }

    /// Declared parameter count; calls carrying more inputs than
    /// `ctrl + mem + arg_count` hold scheduling-only extras
    pub const fn arg_count(self) -> usize {
        match self {
            RuntimeFn::WriteRefFieldPre => 2,
            RuntimeFn::CloneBarrier => 1,
            RuntimeFn::LoadReferenceBarrier => 1,
        }
    }

    pub const fn returns_ref(self) -> bool {
        matches!(self, RuntimeFn::LoadReferenceBarrier)
    }

    pub fn from_name(name: &str) -> Option<RuntimeFn> {
        match name {
            "vgc_wb_pre" => Some(RuntimeFn::WriteRefFieldPre),
            "vgc_clone_barrier" => Some(RuntimeFn::CloneBarrier),
            "vgc_load_reference_barrier" => Some(RuntimeFn::LoadReferenceBarrier),
            _ => None,
        }
    }
}

/// Collector state bits in the per-thread gc-state byte
pub struct GcState;

impl GcState {
    /// Concurrent marking is running; SATB logging is required
    pub const MARKING: i64 = 1 << 0;
    /// Concurrent evacuation is running; loaded references may be stale
    pub const EVACUATION: i64 = 1 << 1;
}

/// Byte offsets of collector-visible thread-local state
///
/// One instance per compilation, handed to every routine that emits
/// thread-relative loads or stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    /// Offset of the gc-state byte
    pub gc_state_offset: i64,
    /// Offset of the SATB queue write index (counts down to zero)
    pub satb_queue_index_offset: i64,
    /// Offset of the SATB queue buffer pointer
    pub satb_queue_buffer_offset: i64,
    /// Field offset of the referent slot in reference-queue objects
    pub referent_offset: i64,
}

impl Default for ThreadContext {
    fn default() -> Self {
        ThreadContext {
            gc_state_offset: 0x20,
            satb_queue_index_offset: 0x28,
            satb_queue_buffer_offset: 0x30,
            referent_offset: 16,
        }
    }
}

/// Width of a queue slot and of the index decrement
pub const BYTES_PER_WORD: i64 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_fn_name_roundtrip() {
        for f in [
            RuntimeFn::WriteRefFieldPre,
            RuntimeFn::CloneBarrier,
            RuntimeFn::LoadReferenceBarrier,
        ] {
            assert_eq!(RuntimeFn::from_name(f.name()), Some(f));
        }
        assert_eq!(RuntimeFn::from_name("memcpy"), None);
    }

    #[test]
    fn test_signatures() {
        assert_eq!(RuntimeFn::WriteRefFieldPre.arg_count(), 2);
        assert!(!RuntimeFn::WriteRefFieldPre.returns_ref());
        assert_eq!(RuntimeFn::LoadReferenceBarrier.arg_count(), 1);
        assert!(RuntimeFn::LoadReferenceBarrier.returns_ref());
    }
}
