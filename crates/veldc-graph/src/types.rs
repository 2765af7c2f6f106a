//! Type lattice and klass table for the graph IR.
//!
//! The lattice is deliberately small: the barrier passes only need to
//! distinguish control, memory, machine integers, raw pointers and
//! (possibly narrow-encoded) heap references, and to answer a handful of
//! static-type questions about the klass behind a reference.

use veldc_util::define_idx;

define_idx!(KlassId);

/// Machine-level type of a memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicType {
    Byte,
    Int,
    IntPtr,
    RawPtr,
    Ref,
    NarrowRef,
}

impl BasicType {
    /// Size in bytes of a value of this type in memory
    pub fn memory_size(self) -> i64 {
        match self {
            BasicType::Byte => 1,
            BasicType::Int => 4,
            BasicType::NarrowRef => 4,
            BasicType::IntPtr | BasicType::RawPtr | BasicType::Ref => 8,
        }
    }

    /// True for the reference-carrying flavors
    pub fn is_reference(self) -> bool {
        matches!(self, BasicType::Ref | BasicType::NarrowRef)
    }
}

/// Static type of a heap reference value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefTy {
    /// Statically known klass, if any
    pub klass: Option<KlassId>,
    /// The klass is exact, not merely an upper bound
    pub exact: bool,
}

impl RefTy {
    /// A reference about which nothing is known statically
    pub const BOTTOM: RefTy = RefTy {
        klass: None,
        exact: false,
    };

    pub fn of(klass: KlassId) -> RefTy {
        RefTy {
            klass: Some(klass),
            exact: false,
        }
    }

    pub fn exact(klass: KlassId) -> RefTy {
        RefTy {
            klass: Some(klass),
            exact: true,
        }
    }
}

/// Value type of a node
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ty {
    /// The absent value (type of the top node)
    Top,
    Control,
    Memory,
    Bool,
    Int,
    IntPtr,
    RawPtr,
    Ref(RefTy),
    NarrowRef(RefTy),
    /// Multi-value producers (If, calls, atomics); projections refine
    Tuple,
}

impl Ty {
    pub fn is_ref(&self) -> bool {
        matches!(self, Ty::Ref(_) | Ty::NarrowRef(_))
    }

    pub fn ref_ty(&self) -> Option<RefTy> {
        match self {
            Ty::Ref(rt) | Ty::NarrowRef(rt) => Some(*rt),
            _ => None,
        }
    }
}

/// Element kind of an array klass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemKind {
    Ref,
    Prim(BasicType),
}

/// Static description of one klass, the facts the barrier filters query
#[derive(Debug, Clone)]
pub enum KlassInfo {
    Instance {
        name: String,
        /// Resolution has completed; unloaded klasses answer nothing
        loaded: bool,
        is_interface: bool,
        has_subclasses: bool,
        /// Declares at least one reference-typed field
        has_object_fields: bool,
        /// Carries VM-injected fields invisible to the declared layout
        has_injected_fields: bool,
        /// Participates in the reference-queue protocol (subtype of the
        /// runtime's Reference klass)
        is_reference_family: bool,
        /// The root Object klass, ancestor of every reference-queue type
        is_root_object: bool,
    },
    Array {
        name: String,
        elem: ElemKind,
    },
}

impl KlassInfo {
    pub fn is_array(&self) -> bool {
        matches!(self, KlassInfo::Array { .. })
    }

    /// Could a value of this static type be a reference-queue participant?
    ///
    /// True for the Reference family itself and for any ancestor broad
    /// enough to hide one (the root Object klass, unloaded klasses).
    pub fn can_be_reference_family(&self) -> bool {
        match self {
            KlassInfo::Instance {
                loaded,
                is_reference_family,
                is_root_object,
                ..
            } => !loaded || *is_reference_family || *is_root_object,
            KlassInfo::Array { .. } => false,
        }
    }
}

/// Convenience constructors for klass descriptions
///
/// Tests and the klass table use these to avoid spelling out every field.
impl KlassInfo {
    /// A plain, fully resolved instance klass
    pub fn instance(name: &str, has_object_fields: bool) -> KlassInfo {
        KlassInfo::Instance {
            name: name.to_string(),
            loaded: true,
            is_interface: false,
            has_subclasses: false,
            has_object_fields,
            has_injected_fields: false,
            is_reference_family: false,
            is_root_object: false,
        }
    }

    pub fn array(name: &str, elem: ElemKind) -> KlassInfo {
        KlassInfo::Array {
            name: name.to_string(),
            elem,
        }
    }
}
