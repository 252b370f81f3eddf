//! PC descriptors and their lookup cache.
//!
//! Every safepoint, call return and trap in compiled code has a [`PcDesc`]
//! mapping its code offset to the serialized scope that describes the
//! interpreter state at that point. Descriptors are sorted by offset and
//! bracketed by two sentinels:
//!
//! ```text
//!   index:   0            1 .. n            n + 1
//!          ┌──────────┬──────────────────┬──────────┐
//!          │ lower(-1)│ real descriptors │ upper(∞) │
//!          └──────────┴──────────────────┴──────────┘
//! ```
//!
//! The lower sentinel lets approximate matching always look at a
//! predecessor; the upper sentinel terminates scans.
//!
//! Lookups go through a [`PcDescCache`] first. The cache is written by any
//! reader without locking: a torn or stale slot only causes a miss,
//! because slots hold indices into the immutable table, never pointers.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

bitflags! {
    /// Per-descriptor flags recorded by the compiler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PcDescFlags: u8 {
        /// Resume by re-executing the bytecode at this pc.
        const REEXECUTE = 1 << 0;
        /// The call at this pc is a method-handle invoke.
        const IS_METHOD_HANDLE_INVOKE = 1 << 1;
        /// The call at this pc returns a heap reference.
        const RETURN_OOP = 1 << 2;
        /// An exception is being rethrown at this pc.
        const RETHROW_EXCEPTION = 1 << 3;
    }
}

/// Serialized "no data" marker for decode offsets.
pub const SERIALIZED_NULL: i32 = -1;

// =============================================================================
// PcDesc
// =============================================================================

/// Immutable mapping from one code offset to its debug information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcDesc {
    /// Offset from the start of the method's code.
    pub pc_offset: i32,
    /// Offset of the innermost scope in the debug info, or `SERIALIZED_NULL`.
    pub scope_decode_offset: i32,
    /// Offset of the eliminated-object pool, or `SERIALIZED_NULL`.
    pub obj_decode_offset: i32,
    pub flags: PcDescFlags,
}

impl PcDesc {
    /// Offset of the lower sentinel.
    pub const LOWER_OFFSET_LIMIT: i32 = -1;
    /// Offset of the upper sentinel. No real pc may reach it.
    pub const UPPER_OFFSET_LIMIT: i32 = i32::MAX;

    pub const fn new(pc_offset: i32, scope_decode_offset: i32, obj_decode_offset: i32) -> Self {
        Self {
            pc_offset,
            scope_decode_offset,
            obj_decode_offset,
            flags: PcDescFlags::empty(),
        }
    }

    pub const fn with_flags(mut self, flags: PcDescFlags) -> Self {
        self.flags = flags;
        self
    }

    const fn sentinel(pc_offset: i32) -> Self {
        Self::new(pc_offset, SERIALIZED_NULL, SERIALIZED_NULL)
    }

    #[inline]
    pub fn should_reexecute(&self) -> bool {
        self.flags.contains(PcDescFlags::REEXECUTE)
    }

    #[inline]
    pub fn is_method_handle_invoke(&self) -> bool {
        self.flags.contains(PcDescFlags::IS_METHOD_HANDLE_INVOKE)
    }

    #[inline]
    pub fn return_oop(&self) -> bool {
        self.flags.contains(PcDescFlags::RETURN_OOP)
    }

    #[inline]
    pub fn rethrow_exception(&self) -> bool {
        self.flags.contains(PcDescFlags::RETHROW_EXCEPTION)
    }
}

/// Match `table[idx]` against `pc_offset`.
///
/// Exact mode needs equality. Approximate mode accepts the first descriptor
/// at or after `pc_offset`, which holds when the predecessor lies strictly
/// before it.
#[inline]
fn match_desc(table: &[PcDesc], idx: usize, pc_offset: i32, approximate: bool) -> bool {
    let Some(desc) = table.get(idx) else {
        return false;
    };
    if !approximate {
        return desc.pc_offset == pc_offset;
    }
    idx > 0 && table[idx - 1].pc_offset < pc_offset && pc_offset <= desc.pc_offset
}

// =============================================================================
// PcDescCache
// =============================================================================

/// Number of slots in a [`PcDescCache`].
pub const PC_DESC_CACHE_SIZE: usize = 4;

const EMPTY_SLOT: usize = usize::MAX;

/// Most-recently-resolved descriptors, newest in slot 0.
#[derive(Debug)]
pub struct PcDescCache {
    slots: [AtomicUsize; PC_DESC_CACHE_SIZE],
}

impl Default for PcDescCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PcDescCache {
    pub const fn new() -> Self {
        const EMPTY: AtomicUsize = AtomicUsize::new(EMPTY_SLOT);
        Self {
            slots: [EMPTY; PC_DESC_CACHE_SIZE],
        }
    }

    /// Fill every slot with `idx` (normally the lower sentinel).
    pub fn reset_to(&self, idx: usize) {
        for slot in &self.slots {
            slot.store(idx, Ordering::Relaxed);
        }
    }

    /// Look for a cached descriptor matching `pc_offset`.
    ///
    /// Slot 0 is checked first since most lookups repeat the last one.
    pub fn find(&self, table: &[PcDesc], pc_offset: i32, approximate: bool) -> Option<usize> {
        let first = self.slots[0].load(Ordering::Relaxed);
        if first == EMPTY_SLOT {
            return None;
        }
        if match_desc(table, first, pc_offset, approximate) {
            return Some(first);
        }
        for slot in &self.slots[1..] {
            let idx = slot.load(Ordering::Relaxed);
            // A sentinel or empty slot means the rest of the cache is unused.
            if idx == EMPTY_SLOT || table.get(idx).map_or(true, |d| d.pc_offset < 0) {
                break;
            }
            if match_desc(table, idx, pc_offset, approximate) {
                return Some(idx);
            }
        }
        None
    }

    /// Insert `idx` as the newest entry, shifting older entries down.
    pub fn add(&self, idx: usize) {
        for i in (1..PC_DESC_CACHE_SIZE).rev() {
            let older = self.slots[i - 1].load(Ordering::Relaxed);
            self.slots[i].store(older, Ordering::Relaxed);
        }
        self.slots[0].store(idx, Ordering::Relaxed);
    }

    /// The cached descriptor index in `slot`, if any.
    pub fn slot(&self, slot: usize) -> Option<usize> {
        self.slots
            .get(slot)
            .map(|s| s.load(Ordering::Relaxed))
            .filter(|&idx| idx != EMPTY_SLOT)
    }
}

// =============================================================================
// PcDescTable
// =============================================================================

/// Sorted, sentinel-bracketed descriptors of one compiled method.
#[derive(Debug)]
pub struct PcDescTable {
    descs: Box<[PcDesc]>,
    cache: PcDescCache,
    full_searches: AtomicU64,
}

impl PcDescTable {
    /// Build a table from descriptors in any order.
    ///
    /// # Panics
    ///
    /// Panics if two descriptors share a pc offset or an offset lies outside
    /// `0..UPPER_OFFSET_LIMIT`.
    pub fn new(mut descs: Vec<PcDesc>) -> Self {
        descs.sort_unstable_by_key(|d| d.pc_offset);
        for pair in descs.windows(2) {
            assert!(
                pair[0].pc_offset < pair[1].pc_offset,
                "duplicate PcDesc for pc offset {}",
                pair[0].pc_offset
            );
        }
        if let (Some(first), Some(last)) = (descs.first(), descs.last()) {
            assert!(first.pc_offset >= 0, "negative pc offset {}", first.pc_offset);
            assert!(
                last.pc_offset < PcDesc::UPPER_OFFSET_LIMIT,
                "pc offset {} reaches the upper limit",
                last.pc_offset
            );
        }

        let mut table = Vec::with_capacity(descs.len() + 2);
        table.push(PcDesc::sentinel(PcDesc::LOWER_OFFSET_LIMIT));
        table.extend(descs);
        table.push(PcDesc::sentinel(PcDesc::UPPER_OFFSET_LIMIT));

        let cache = PcDescCache::new();
        cache.reset_to(0);
        Self {
            descs: table.into_boxed_slice(),
            cache,
            full_searches: AtomicU64::new(0),
        }
    }

    /// An empty table (native wrappers and stubs).
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Number of real descriptors.
    #[inline]
    pub fn len(&self) -> usize {
        self.descs.len() - 2
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Real descriptors in pc order.
    pub fn iter(&self) -> impl Iterator<Item = &PcDesc> {
        self.descs[1..self.descs.len() - 1].iter()
    }

    /// Descriptor lookup by code offset.
    ///
    /// Exact mode returns the descriptor at `pc_offset` or `None`.
    /// Approximate mode returns the first descriptor at or after it.
    pub fn find(&self, pc_offset: i32, approximate: bool) -> Option<&PcDesc> {
        if !(0..PcDesc::UPPER_OFFSET_LIMIT).contains(&pc_offset) {
            return None;
        }
        if let Some(idx) = self.cache.find(&self.descs, pc_offset, approximate) {
            return Some(&self.descs[idx]);
        }
        if self.is_empty() {
            return None;
        }

        self.full_searches.fetch_add(1, Ordering::Relaxed);
        let upper = self.descs.len() - 1;
        let real = &self.descs[1..upper];
        let idx = 1 + real.partition_point(|d| d.pc_offset < pc_offset);
        if idx < upper && match_desc(&self.descs, idx, pc_offset, approximate) {
            self.cache.add(idx);
            return Some(&self.descs[idx]);
        }
        None
    }

    /// Lookups that missed the cache and searched the table.
    #[inline]
    pub fn full_searches(&self) -> u64 {
        self.full_searches.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn cache(&self) -> &PcDescCache {
        &self.cache
    }

    /// Check the sentinel layout and strict ordering.
    pub fn verify(&self) -> Result<(), String> {
        let n = self.descs.len();
        if n < 2
            || self.descs[0].pc_offset != PcDesc::LOWER_OFFSET_LIMIT
            || self.descs[n - 1].pc_offset != PcDesc::UPPER_OFFSET_LIMIT
        {
            return Err("PcDesc sentinels missing".into());
        }
        match self.descs.windows(2).find(|w| w[0].pc_offset >= w[1].pc_offset) {
            Some(w) => Err(format!("PcDesc table unsorted at offset {}", w[1].pc_offset)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(offsets: &[i32]) -> PcDescTable {
        PcDescTable::new(offsets.iter().enumerate().map(|(i, &o)| PcDesc::new(o, i as i32, SERIALIZED_NULL)).collect())
    }

    #[test]
    fn test_exact_lookup() {
        let t = table(&[4, 12, 20]);
        assert_eq!(t.find(12, false).map(|d| d.pc_offset), Some(12));
        assert!(t.find(13, false).is_none());
        assert!(t.find(-3, false).is_none());
    }

    #[test]
    fn test_approximate_returns_next_desc() {
        let t = table(&[4, 12, 20]);
        assert_eq!(t.find(0, true).map(|d| d.pc_offset), Some(4));
        assert_eq!(t.find(5, true).map(|d| d.pc_offset), Some(12));
        assert_eq!(t.find(20, true).map(|d| d.pc_offset), Some(20));
        assert!(t.find(21, true).is_none());
    }

    #[test]
    fn test_empty_table() {
        let t = PcDescTable::empty();
        assert!(t.is_empty());
        assert!(t.find(0, true).is_none());
        assert_eq!(t.full_searches(), 0);
        assert!(t.verify().is_ok());
    }

    #[test]
    fn test_unsorted_input_is_sorted() {
        let t = table(&[20, 4, 12]);
        let offsets: Vec<_> = t.iter().map(|d| d.pc_offset).collect();
        assert_eq!(offsets, vec![4, 12, 20]);
        assert!(t.verify().is_ok());
    }

    #[test]
    #[should_panic(expected = "duplicate PcDesc")]
    fn test_duplicate_offset_rejected() {
        let _ = table(&[4, 4]);
    }

    #[test]
    fn test_repeat_lookup_hits_cache() {
        let t = table(&[4, 12, 20]);
        t.find(12, false);
        t.find(12, false);
        t.find(12, false);
        assert_eq!(t.full_searches(), 1);
    }

    #[test]
    fn test_cache_shifts_older_entries() {
        let t = table(&[4, 12, 20, 28, 36]);
        for o in [4, 12, 20, 28, 36] {
            t.find(o, false);
        }
        // Newest first; the oldest (4) fell out.
        let cached: Vec<_> = (0..PC_DESC_CACHE_SIZE).filter_map(|s| t.cache().slot(s)).collect();
        assert_eq!(cached, vec![5, 4, 3, 2]);
        let searches = t.full_searches();
        t.find(20, false);
        assert_eq!(t.full_searches(), searches);
        t.find(4, false);
        assert_eq!(t.full_searches(), searches + 1);
    }

    #[test]
    fn test_sentinel_never_matches_approximately() {
        let cache = PcDescCache::new();
        let descs = [PcDesc::sentinel(-1), PcDesc::new(8, 0, -1), PcDesc::sentinel(i32::MAX)];
        cache.reset_to(0);
        assert_eq!(cache.find(&descs, 0, true), None);
        assert_eq!(cache.find(&descs, -1, false), Some(0));
    }

    #[test]
    fn test_flags() {
        let d = PcDesc::new(0, 0, -1).with_flags(PcDescFlags::REEXECUTE | PcDescFlags::RETURN_OOP);
        assert!(d.should_reexecute());
        assert!(d.return_oop());
        assert!(!d.rethrow_exception());
        assert!(!d.is_method_handle_invoke());
    }
}
