//! Configuration switches of the barrier subsystem.
//!
//! Each switch is independently toggleable and read once per access
//! decision. Production configurations run with everything on; the
//! split exists so collector modes and diagnostic builds can disable
//! individual barrier families.

/// Barrier feature switches for one compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierFlags {
    /// Emit the SATB pre-write barrier on reference stores
    pub satb_barrier: bool,
    /// Wrap stored values in an enqueue barrier
    pub storeval_enqueue_barrier: bool,
    /// Wrap loaded references in a load-reference barrier
    pub load_ref_barrier: bool,
    /// Use the collector-aware atomic node variants
    pub cas_barrier: bool,
    /// Emit the referent-field keep-alive guard
    pub keep_alive_barrier: bool,
    /// Run the structural barrier verifier (debug builds)
    pub verify_barriers: bool,
}

impl Default for BarrierFlags {
    fn default() -> Self {
        BarrierFlags {
            satb_barrier: true,
            storeval_enqueue_barrier: true,
            load_ref_barrier: true,
            cas_barrier: true,
            keep_alive_barrier: true,
            verify_barriers: false,
        }
    }
}

impl BarrierFlags {
    /// Every barrier family disabled; accesses lower to plain memory ops
    pub fn none() -> Self {
        BarrierFlags {
            satb_barrier: false,
            storeval_enqueue_barrier: false,
            load_ref_barrier: false,
            cas_barrier: false,
            keep_alive_barrier: false,
            verify_barriers: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_all_barriers() {
        let flags = BarrierFlags::default();
        assert!(flags.satb_barrier);
        assert!(flags.storeval_enqueue_barrier);
        assert!(flags.load_ref_barrier);
        assert!(flags.cas_barrier);
        assert!(flags.keep_alive_barrier);
        assert!(!flags.verify_barriers);
    }
}
