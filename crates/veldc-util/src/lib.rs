//! veldc-util - Core Utilities and Foundation Types
//!
//! Foundation types shared by every veldc compiler crate: typed indices,
//! index-addressed vectors, and the hash-map flavors used for
//! per-compilation state.
//!
//! Typed indices keep the many index spaces of a compiler (node ids,
//! klass ids, alias classes) from being mixed up at compile time while
//! costing nothing at run time.

pub mod index_vec;

pub use index_vec::{Idx, IndexVec};

// Re-export commonly used hash collections
pub use rustc_hash::FxHashMap;
pub use rustc_hash::FxHashSet;

/// Macro to define index types easily
///
/// Expands to a `u32` newtype implementing [`Idx`], `Debug`, ordering and
/// hashing. The index space is capped at `u32::MAX` entries, which is far
/// beyond any practical compilation unit.
///
/// # Example
///
/// ```
/// use veldc_util::define_idx;
///
/// define_idx!(NodeId);
///
/// let id = NodeId(7);
/// assert_eq!(id.0, 7);
/// ```
#[macro_export]
macro_rules! define_idx {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $crate::Idx for $name {
            fn from_usize(idx: usize) -> Self {
                assert!(idx <= u32::MAX as usize);
                $name(idx as u32)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}
