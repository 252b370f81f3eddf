//! Object allocation for reallocating scalar-replaced objects.
//!
//! The deoptimizer only needs a narrow slice of the heap: class layouts to
//! order field values, allocation that never suspends the calling thread,
//! and raw field stores. [`ArenaHeap`] is a bounded reference heap
//! implementing exactly that.

use crate::thread::JavaThread;
use kiln_core::{BasicType, ClassId, ObjRef};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Bytes of object header before the first field.
pub const OBJECT_HEADER_BYTES: usize = 16;

/// Bytes before the first array element (header plus length).
pub const ARRAY_BASE_OFFSET: usize = 24;

/// Byte offset of array element `index`.
#[inline]
pub const fn element_offset(ty: BasicType, index: usize) -> usize {
    ARRAY_BASE_OFFSET + index * ty.size_in_bytes()
}

// =============================================================================
// Class layout
// =============================================================================

/// An instance field declared by one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub offset: usize,
    pub ty: BasicType,
}

/// Layout facts for one class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub id: ClassId,
    pub super_class: Option<ClassId>,
    /// Fields declared by this class only.
    pub fields: Vec<FieldInfo>,
}

impl ClassInfo {
    pub fn new(id: ClassId, super_class: Option<ClassId>, fields: Vec<FieldInfo>) -> Self {
        Self { id, super_class, fields }
    }
}

// =============================================================================
// Heap
// =============================================================================

/// Heap services used while rebuilding eliminated objects.
///
/// Allocation must not reach a safepoint: the caller holds a
/// [`NoSafepointScope`](crate::thread::NoSafepointScope) until every field
/// of every reallocated object is written.
pub trait Heap: Send + Sync {
    fn class_info(&self, class: ClassId) -> Option<Arc<ClassInfo>>;

    /// Allocate a zeroed instance, `None` when the heap is exhausted.
    fn allocate_instance(&self, thread: &JavaThread, class: ClassId) -> Option<ObjRef>;

    /// Allocate a zeroed array of `length` elements of `elem`.
    fn allocate_array(
        &self,
        thread: &JavaThread,
        class: ClassId,
        elem: BasicType,
        length: usize,
    ) -> Option<ObjRef>;

    /// Raw store at a byte offset. Narrow types keep their low bits.
    fn store(&self, obj: ObjRef, offset: usize, ty: BasicType, value: u64);

    fn load(&self, obj: ObjRef, offset: usize) -> Option<u64>;
}

/// Instance fields of `class` in store order: supertypes first, each
/// class's own fields by ascending offset.
pub fn fields_in_order(heap: &dyn Heap, class: ClassId) -> Vec<FieldInfo> {
    let mut chain = Vec::new();
    let mut next = Some(class);
    while let Some(id) = next {
        let Some(info) = heap.class_info(id) else {
            break;
        };
        next = info.super_class;
        chain.push(info);
    }
    let mut fields = Vec::new();
    for info in chain.iter().rev() {
        let start = fields.len();
        fields.extend_from_slice(&info.fields);
        fields[start..].sort_by_key(|f| f.offset);
    }
    fields
}

// =============================================================================
// ArenaHeap
// =============================================================================

const ARENA_BASE: u64 = 0x8000_0000;
const ARENA_ALIGN: u64 = 0x10;

#[derive(Debug)]
struct ArenaObject {
    class: ClassId,
    length: Option<usize>,
    words: FxHashMap<usize, u64>,
}

#[derive(Debug, Default)]
struct ArenaState {
    objects: Vec<ArenaObject>,
    used: usize,
}

/// A bounded heap that never collects.
///
/// Allocation fails once `capacity` bytes are used or when the class was
/// marked with [`ArenaHeap::fail_allocations_of`].
#[derive(Debug)]
pub struct ArenaHeap {
    classes: RwLock<FxHashMap<ClassId, Arc<ClassInfo>>>,
    state: Mutex<ArenaState>,
    capacity: usize,
    failing: RwLock<Vec<ClassId>>,
    poll_on_allocate: bool,
}

impl Default for ArenaHeap {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl ArenaHeap {
    pub fn new(capacity: usize) -> Self {
        Self {
            classes: RwLock::new(FxHashMap::default()),
            state: Mutex::new(ArenaState::default()),
            capacity,
            failing: RwLock::new(Vec::new()),
            poll_on_allocate: false,
        }
    }

    /// Poll for a safepoint on every allocation, as a heap that may block
    /// for a collection would.
    pub fn with_safepoint_polls(mut self) -> Self {
        self.poll_on_allocate = true;
        self
    }

    pub fn define_class(&self, info: ClassInfo) {
        self.classes.write().insert(info.id, Arc::new(info));
    }

    /// Make every later allocation of `class` fail.
    pub fn fail_allocations_of(&self, class: ClassId) {
        self.failing.write().push(class);
    }

    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn class_of(&self, obj: ObjRef) -> Option<ClassId> {
        let state = self.state.lock();
        Self::index(obj).and_then(|i| state.objects.get(i)).map(|o| o.class)
    }

    pub fn array_length(&self, obj: ObjRef) -> Option<usize> {
        let state = self.state.lock();
        Self::index(obj).and_then(|i| state.objects.get(i)).and_then(|o| o.length)
    }

    fn index(obj: ObjRef) -> Option<usize> {
        let off = obj.0.checked_sub(ARENA_BASE)?;
        (off % ARENA_ALIGN == 0).then(|| (off / ARENA_ALIGN) as usize)
    }

    fn instance_size(&self, class: ClassId) -> usize {
        fields_in_order(self, class)
            .iter()
            .map(|f| f.offset + f.ty.size_in_bytes())
            .max()
            .unwrap_or(OBJECT_HEADER_BYTES)
    }

    fn allocate(&self, thread: &JavaThread, class: ClassId, bytes: usize, length: Option<usize>) -> Option<ObjRef> {
        if self.poll_on_allocate {
            thread.safepoint_poll();
        }
        if self.failing.read().contains(&class) {
            return None;
        }
        let mut state = self.state.lock();
        if bytes > self.capacity.saturating_sub(state.used) {
            return None;
        }
        state.used += bytes;
        let obj = ObjRef(ARENA_BASE + state.objects.len() as u64 * ARENA_ALIGN);
        state.objects.push(ArenaObject {
            class,
            length,
            words: FxHashMap::default(),
        });
        Some(obj)
    }
}

impl Heap for ArenaHeap {
    fn class_info(&self, class: ClassId) -> Option<Arc<ClassInfo>> {
        self.classes.read().get(&class).cloned()
    }

    fn allocate_instance(&self, thread: &JavaThread, class: ClassId) -> Option<ObjRef> {
        let bytes = self.instance_size(class);
        self.allocate(thread, class, bytes, None)
    }

    fn allocate_array(
        &self,
        thread: &JavaThread,
        class: ClassId,
        elem: BasicType,
        length: usize,
    ) -> Option<ObjRef> {
        self.allocate(thread, class, element_offset(elem, length), Some(length))
    }

    fn store(&self, obj: ObjRef, offset: usize, ty: BasicType, value: u64) {
        let bits = ty.size_in_bytes() * 8;
        let value = if bits >= 64 { value } else { value & ((1u64 << bits) - 1) };
        let mut state = self.state.lock();
        let Some(object) = Self::index(obj).and_then(|i| state.objects.get_mut(i)) else {
            panic!("store into unknown object {obj:?}");
        };
        object.words.insert(offset, value);
    }

    fn load(&self, obj: ObjRef, offset: usize) -> Option<u64> {
        let state = self.state.lock();
        let object = state.objects.get(Self::index(obj)?)?;
        Some(object.words.get(&offset).copied().unwrap_or(0))
    }
}
