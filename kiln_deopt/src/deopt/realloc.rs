//! Rematerialization of scalar-replaced objects and elided locks.
//!
//! Escape analysis lets compiled code keep an object's fields in registers
//! and stack slots instead of allocating it, and skip locking objects no
//! other thread can see. The interpreter needs real objects and real
//! locks, so deoptimization:
//!
//! 1. allocates every eliminated object ([`realloc_objects`])
//! 2. writes the recorded field values into them ([`reassign_fields`])
//! 3. locks the elided monitors again ([`relock_eliminated`])
//!
//! Steps 1 and 2 run inside a [`NoSafepointScope`]: half-initialized
//! objects must never be seen by a collector. An allocation failure does
//! not stop the others; the failed object reads as null and the error is
//! raised after the interpreter frames exist.
//!
//! [`NoSafepointScope`]: crate::thread::NoSafepointScope

use crate::heap::{Heap, element_offset, fields_in_order};
use crate::monitors::MonitorService;
use crate::stack::{RegisterMap, ThreadStack};
use crate::thread::JavaThread;
use crate::vframe_array::MonitorInfo;
use kiln_code::{Location, ObjectKind, ObjectValue, ScopeValue};
use kiln_core::{BasicType, ObjRef, StackSlot, ThreadId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, warn};

// =============================================================================
// Frame values
// =============================================================================

/// Reads recorded values out of a compiled frame.
#[derive(Clone, Copy)]
pub struct FrameValues<'a> {
    stack: &'a ThreadStack,
    /// Address that stack locations are relative to (the frame's sp).
    base: usize,
    registers: &'a RegisterMap,
}

impl<'a> FrameValues<'a> {
    pub fn new(stack: &'a ThreadStack, base: usize, registers: &'a RegisterMap) -> Self {
        Self { stack, base, registers }
    }

    pub fn word(&self, at: Location) -> Option<u64> {
        match at {
            Location::Stack(offset) => self.stack.read(self.base + offset as usize),
            Location::Register(reg) => self.registers.get(reg),
        }
    }

    /// Materialize one recorded value as an interpreter slot.
    ///
    /// # Panics
    ///
    /// Panics if a location lies outside the stack or register file.
    pub fn slot(&self, value: &ScopeValue, objects: &ReallocatedObjects) -> StackSlot {
        match *value {
            ScopeValue::Located { at, ty } => {
                let Some(word) = self.word(at) else {
                    panic!("unreadable value location {at:?} (frame base {:#x})", self.base);
                };
                if ty.is_reference() {
                    StackSlot::Ref(ObjRef(word))
                } else {
                    StackSlot::Int(word as i64)
                }
            }
            ScopeValue::ConstInt(v) => StackSlot::Int(v),
            ScopeValue::ConstRef(r) => StackSlot::Ref(r),
            ScopeValue::Object(id) => StackSlot::Ref(objects.get(id).unwrap_or(ObjRef::NULL)),
            ScopeValue::Illegal => StackSlot::Dead,
        }
    }

    /// Combine the two recorded halves of a long or double. An illegal
    /// first half means the second holds the whole value.
    fn wide_word(&self, hi: &ScopeValue, lo: &ScopeValue, objects: &ReallocatedObjects) -> u64 {
        let lo = self.slot(lo, objects).to_word();
        if hi.is_illegal() {
            return lo;
        }
        let hi = self.slot(hi, objects).to_word();
        (hi << 32) | (lo & 0xffff_ffff)
    }
}

// =============================================================================
// Reallocation
// =============================================================================

/// Objects allocated for one deoptimization, by object id.
#[derive(Debug, Clone, Default)]
pub struct ReallocatedObjects {
    objects: FxHashMap<u32, ObjRef>,
    failed: SmallVec<[u32; 2]>,
}

impl ReallocatedObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// The new object for `id`; `None` if its allocation failed.
    #[inline]
    pub fn get(&self, id: u32) -> Option<ObjRef> {
        self.objects.get(&id).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Ids whose allocation failed.
    #[inline]
    pub fn failed(&self) -> &[u32] {
        &self.failed
    }

    #[inline]
    pub fn failures(&self) -> usize {
        self.failed.len()
    }
}

/// Allocate every eliminated object.
///
/// Must be called inside a no-safepoint scope.
pub fn realloc_objects(heap: &dyn Heap, thread: &JavaThread, objects: &[ObjectValue]) -> ReallocatedObjects {
    debug_assert!(thread.in_no_safepoint_scope(), "reallocation outside a no-safepoint scope");
    let mut out = ReallocatedObjects::new();
    for obj in objects {
        let allocated = match obj.kind {
            ObjectKind::Instance => heap.allocate_instance(thread, obj.class),
            ObjectKind::PrimitiveArray(ty) => {
                let length = obj.field_values.len() / ty.slots().max(1);
                heap.allocate_array(thread, obj.class, ty, length)
            }
            ObjectKind::ReferenceArray => {
                heap.allocate_array(thread, obj.class, BasicType::Object, obj.field_values.len())
            }
        };
        match allocated {
            Some(r) => {
                out.objects.insert(obj.id, r);
            }
            None => {
                warn!(thread = %thread.id(), object = obj.id, class = %obj.class, "reallocation failed");
                out.failed.push(obj.id);
            }
        }
    }
    debug!(thread = %thread.id(), allocated = out.len(), failed = out.failures(), "reallocated objects");
    out
}

/// Store recorded field values into the reallocated objects.
///
/// Objects whose allocation failed are skipped; references to them are
/// stored as null.
///
/// # Panics
///
/// Panics if an object records fewer values than its layout needs.
pub fn reassign_fields(
    heap: &dyn Heap,
    objects: &[ObjectValue],
    values: &FrameValues<'_>,
    realloc: &ReallocatedObjects,
) {
    for obj in objects {
        let Some(target) = realloc.get(obj.id) else {
            continue;
        };
        match obj.kind {
            ObjectKind::Instance => {
                let mut recorded = obj.field_values.iter();
                for field in fields_in_order(heap, obj.class) {
                    let word = match field.ty.slots() {
                        2 => match (recorded.next(), recorded.next()) {
                            (Some(hi), Some(lo)) => values.wide_word(hi, lo, realloc),
                            _ => panic!("object {}: field values exhausted at offset {}", obj.id, field.offset),
                        },
                        _ => match recorded.next() {
                            Some(v) => values.slot(v, realloc).to_word(),
                            None => panic!("object {}: field values exhausted at offset {}", obj.id, field.offset),
                        },
                    };
                    heap.store(target, field.offset, field.ty, word);
                }
            }
            ObjectKind::PrimitiveArray(ty) => {
                let width = ty.slots().max(1);
                for (i, chunk) in obj.field_values.chunks_exact(width).enumerate() {
                    let word = match chunk {
                        [hi, lo] => values.wide_word(hi, lo, realloc),
                        [v] => values.slot(v, realloc).to_word(),
                        _ => unreachable!("element width is one or two slots"),
                    };
                    heap.store(target, element_offset(ty, i), ty, word);
                }
            }
            ObjectKind::ReferenceArray => {
                for (i, v) in obj.field_values.iter().enumerate() {
                    let word = values.slot(v, realloc).to_word();
                    heap.store(target, element_offset(BasicType::Object, i), BasicType::Object, word);
                }
            }
        }
    }
}

// =============================================================================
// Locking
// =============================================================================

/// Lock every elided monitor again on behalf of `thread`.
///
/// Monitors on objects that could not be reallocated stay unlocked.
/// Returns the number of monitors locked.
pub fn relock_eliminated(svc: &dyn MonitorService, thread: ThreadId, monitors: &mut [MonitorInfo]) -> usize {
    let mut relocked = 0;
    for m in monitors.iter_mut().filter(|m| m.eliminated && !m.owner.is_null()) {
        m.lock_word = svc.relock(thread, m.owner);
        relocked += 1;
    }
    relocked
}

/// Drop biases on objects a frame holds locked, so the interpreter sees
/// plain locks.
pub fn revoke_biases(svc: &dyn MonitorService, monitors: &[MonitorInfo]) -> usize {
    monitors
        .iter()
        .filter(|m| !m.eliminated && !m.owner.is_null())
        .filter(|m| svc.revoke_bias(m.owner))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{ArenaHeap, ClassInfo, FieldInfo};
    use crate::monitors::LockTable;
    use kiln_core::{ClassId, ThreadId};

    fn heap() -> ArenaHeap {
        let heap = ArenaHeap::default();
        heap.define_class(ClassInfo::new(ClassId(1), None, vec![FieldInfo { offset: 16, ty: BasicType::Int }]));
        heap.define_class(ClassInfo::new(
            ClassId(2),
            Some(ClassId(1)),
            vec![
                FieldInfo { offset: 32, ty: BasicType::Object },
                FieldInfo { offset: 24, ty: BasicType::Long },
            ],
        ));
        heap
    }

    fn instance(id: u32, values: Vec<ScopeValue>) -> ObjectValue {
        ObjectValue {
            id,
            class: ClassId(2),
            kind: ObjectKind::Instance,
            field_values: values,
        }
    }

    #[test]
    fn test_reassign_supertype_first_by_offset() {
        let heap = heap();
        let thread = JavaThread::with_stack_words(ThreadId(1), 64);
        let mut stack = ThreadStack::new(16);
        let base = stack.origin();
        stack.write(base + 3, 0x55);
        let regs = RegisterMap::new();
        let values = FrameValues::new(&stack, base, &regs);

        let objects = vec![instance(
            0,
            vec![
                ScopeValue::ConstInt(7),                    // c#1 offset 16
                ScopeValue::Illegal,                        // c#2 offset 24, long
                ScopeValue::stack(3, BasicType::Long),
                ScopeValue::ConstRef(ObjRef(0x9000)),       // c#2 offset 32
            ],
        )];
        let realloc = {
            let _nsv = thread.no_safepoint_scope();
            let realloc = realloc_objects(&heap, &thread, &objects);
            reassign_fields(&heap, &objects, &values, &realloc);
            realloc
        };
        let obj = realloc.get(0).unwrap();
        assert_eq!(heap.load(obj, 16), Some(7));
        assert_eq!(heap.load(obj, 24), Some(0x55));
        assert_eq!(heap.load(obj, 32), Some(0x9000));
    }

    #[test]
    fn test_failure_keeps_siblings() {
        let heap = heap();
        heap.define_class(ClassInfo::new(ClassId(3), None, vec![FieldInfo { offset: 16, ty: BasicType::Object }]));
        heap.fail_allocations_of(ClassId(2));
        let thread = JavaThread::with_stack_words(ThreadId(1), 64);
        let stack = ThreadStack::new(4);
        let regs = RegisterMap::new();
        let values = FrameValues::new(&stack, stack.origin(), &regs);

        let objects = vec![
            instance(0, vec![ScopeValue::ConstInt(1), ScopeValue::Illegal, ScopeValue::ConstInt(2), ScopeValue::Illegal]),
            ObjectValue {
                id: 1,
                class: ClassId(3),
                kind: ObjectKind::Instance,
                field_values: vec![ScopeValue::Object(0)],
            },
        ];
        let _nsv = thread.no_safepoint_scope();
        let realloc = realloc_objects(&heap, &thread, &objects);
        reassign_fields(&heap, &objects, &values, &realloc);
        assert_eq!(realloc.failed(), &[0]);
        let sibling = realloc.get(1).unwrap();
        // reference to the failed object reads as null
        assert_eq!(heap.load(sibling, 16), Some(0));
    }

    #[test]
    fn test_arrays() {
        let heap = ArenaHeap::default();
        let thread = JavaThread::with_stack_words(ThreadId(1), 64);
        let stack = ThreadStack::new(4);
        let mut regs = RegisterMap::new();
        regs.set(2, 0x1234_5678);
        let values = FrameValues::new(&stack, stack.origin(), &regs);
        let objects = vec![
            ObjectValue {
                id: 0,
                class: ClassId(10),
                kind: ObjectKind::PrimitiveArray(BasicType::Long),
                field_values: vec![ScopeValue::ConstInt(1), ScopeValue::register(2, BasicType::Int)],
            },
            ObjectValue {
                id: 1,
                class: ClassId(11),
                kind: ObjectKind::ReferenceArray,
                field_values: vec![ScopeValue::Object(0), ScopeValue::ConstRef(ObjRef::NULL)],
            },
        ];
        let _nsv = thread.no_safepoint_scope();
        let realloc = realloc_objects(&heap, &thread, &objects);
        reassign_fields(&heap, &objects, &values, &realloc);
        let longs = realloc.get(0).unwrap();
        assert_eq!(heap.array_length(longs), Some(1));
        assert_eq!(heap.load(longs, element_offset(BasicType::Long, 0)), Some((1 << 32) | 0x1234_5678));
        let refs = realloc.get(1).unwrap();
        assert_eq!(heap.load(refs, element_offset(BasicType::Object, 0)), Some(longs.0));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "no-safepoint scope")]
    fn test_polling_heap_panics_inside_scope() {
        let heap = ArenaHeap::default().with_safepoint_polls();
        let thread = JavaThread::with_stack_words(ThreadId(1), 64);
        let objects = vec![ObjectValue {
            id: 0,
            class: ClassId(1),
            kind: ObjectKind::Instance,
            field_values: vec![],
        }];
        let _nsv = thread.no_safepoint_scope();
        realloc_objects(&heap, &thread, &objects);
    }

    #[test]
    fn test_relock_skips_failed_owner() {
        let locks = LockTable::new();
        let mut monitors = [
            MonitorInfo { owner: ObjRef(0x100), lock_word: 0, eliminated: true },
            MonitorInfo { owner: ObjRef::NULL, lock_word: 0, eliminated: true },
            MonitorInfo { owner: ObjRef(0x200), lock_word: 0x8, eliminated: false },
        ];
        assert_eq!(relock_eliminated(&locks, ThreadId(1), &mut monitors), 1);
        assert!(locks.is_locked_by(ObjRef(0x100), ThreadId(1)));
        assert_eq!(monitors[1].lock_word, 0);
        assert_eq!(monitors[2].lock_word, 0x8);
    }

    #[test]
    fn test_revoke_biases_of_held_monitors() {
        let locks = LockTable::new();
        locks.bias(ObjRef(0x200), ThreadId(2));
        let monitors = [MonitorInfo { owner: ObjRef(0x200), lock_word: 0, eliminated: false }];
        assert_eq!(revoke_biases(&locks, &monitors), 1);
        assert!(!locks.is_biased(ObjRef(0x200)));
    }
}
