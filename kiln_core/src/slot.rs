//! Tagged interpreter slots.
//!
//! Interpreter frames hold untyped machine words. Deoptimization needs to
//! know which words are heap references (so the collector can find them),
//! which are plain integers, and which are dead. [`StackSlot`] carries that
//! tag alongside the value.

use crate::ids::ObjRef;
use smallvec::SmallVec;

/// Slot kind as recorded in a frame's tag map.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SlotTag {
    /// Int-sized (or one half of a long) value.
    Int = 0,
    /// Heap reference.
    Ref = 1,
    /// Dead or conflicting value. Contents are meaningless.
    #[default]
    Dead = 2,
}

impl SlotTag {
    #[inline]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Int),
            1 => Some(Self::Ref),
            2 => Some(Self::Dead),
            _ => None,
        }
    }
}

/// A single tagged interpreter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StackSlot {
    Int(i64),
    Ref(ObjRef),
    #[default]
    Dead,
}

impl StackSlot {
    #[inline]
    pub const fn tag(self) -> SlotTag {
        match self {
            StackSlot::Int(_) => SlotTag::Int,
            StackSlot::Ref(_) => SlotTag::Ref,
            StackSlot::Dead => SlotTag::Dead,
        }
    }

    /// Raw machine word. Dead slots are zero so a stale pointer never
    /// survives into an interpreter frame.
    #[inline]
    pub const fn to_word(self) -> u64 {
        match self {
            StackSlot::Int(v) => v as u64,
            StackSlot::Ref(r) => r.0,
            StackSlot::Dead => 0,
        }
    }

    /// Rebuild a slot from a word and its tag.
    #[inline]
    pub const fn from_word(tag: SlotTag, word: u64) -> Self {
        match tag {
            SlotTag::Int => StackSlot::Int(word as i64),
            SlotTag::Ref => StackSlot::Ref(ObjRef(word)),
            SlotTag::Dead => StackSlot::Dead,
        }
    }

    #[inline]
    pub const fn as_ref(self) -> Option<ObjRef> {
        match self {
            StackSlot::Ref(r) => Some(r),
            _ => None,
        }
    }
}

/// Slot storage sized for typical small frames.
pub type SlotVec = SmallVec<[StackSlot; 8]>;

// =============================================================================
// BasicType
// =============================================================================

/// Value kinds of fields, array elements and method results.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Object,
    Void,
}

impl BasicType {
    /// Number of interpreter slots a value of this type occupies.
    #[inline]
    pub const fn slots(self) -> usize {
        match self {
            BasicType::Long | BasicType::Double => 2,
            BasicType::Void => 0,
            _ => 1,
        }
    }

    #[inline]
    pub const fn is_reference(self) -> bool {
        matches!(self, BasicType::Object)
    }

    /// Size in bytes of one field or array element of this type.
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Int | BasicType::Float => 4,
            BasicType::Long | BasicType::Double | BasicType::Object => 8,
            BasicType::Void => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_slot_zaps_to_zero() {
        assert_eq!(StackSlot::Dead.to_word(), 0);
        assert_eq!(StackSlot::from_word(SlotTag::Dead, 0xdead), StackSlot::Dead);
    }

    #[test]
    fn test_word_round_trip_keeps_tag() {
        let r = StackSlot::Ref(ObjRef(0x1000));
        assert_eq!(StackSlot::from_word(r.tag(), r.to_word()), r);
        let i = StackSlot::Int(-3);
        assert_eq!(StackSlot::from_word(i.tag(), i.to_word()), i);
    }

    #[test]
    fn test_two_slot_types() {
        assert_eq!(BasicType::Long.slots(), 2);
        assert_eq!(BasicType::Double.slots(), 2);
        assert_eq!(BasicType::Object.slots(), 1);
        assert_eq!(BasicType::Void.slots(), 0);
    }
}
