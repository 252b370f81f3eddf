//! Opaque identities.
//!
//! All identities are plain integers wrapped in newtypes so they can be
//! stored in atomics and frame words without indirection.

use std::fmt;

// =============================================================================
// Method / Class
// =============================================================================

/// Identity of a method (bytecode body).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m#{}", self.0)
    }
}

/// Identity of a class (also used as the type token of exceptions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c#{}", self.0)
    }
}

// =============================================================================
// Compiled code
// =============================================================================

/// Identity of one compiled method in the code cache.
///
/// Zero is reserved as "no code" so the id fits in a single atomic word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompiledId(pub u64);

impl CompiledId {
    /// Raw value meaning "no compiled code installed".
    pub const NONE_RAW: u64 = 0;

    /// Decode from a raw word, mapping zero to `None`.
    #[inline]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw == Self::NONE_RAW {
            None
        } else {
            Some(Self(raw))
        }
    }
}

impl fmt::Display for CompiledId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nm#{}", self.0)
    }
}

// =============================================================================
// Heap references
// =============================================================================

/// A reference to a heap object. Zero is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjRef(pub u64);

impl ObjRef {
    /// The null reference.
    pub const NULL: ObjRef = ObjRef(0);

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "@{:#x}", self.0)
        }
    }
}

/// Identity of a mutator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t#{}", self.0)
    }
}
