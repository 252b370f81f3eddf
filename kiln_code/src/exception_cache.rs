//! Per-method cache of exception handler addresses.
//!
//! Maps `(exception class, throwing pc)` to the handler pc computed by the
//! slow exception-dispatch path. The cache is a list of nodes, one
//! exception class per node, each holding up to
//! [`EXCEPTION_CACHE_CAPACITY`] entries. New nodes go to the front.
//!
//! # Concurrency
//!
//! - Writers serialize on a mutex. A new entry is written into a free slot
//!   and only then published by a release store of the node's count.
//! - The node list is an immutable snapshot. Adding or unlinking a node
//!   builds a new list and swaps it in; readers clone the current snapshot
//!   and scan it without holding any lock.
//! - Readers may miss an entry added concurrently, in which case the
//!   handler is recomputed and added again (a no-op).
//! - Unloading moves nodes of dead classes onto a purge list. A purged node
//!   is released once no reader snapshot still refers to it.

use kiln_core::ClassId;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Entries per node.
pub const EXCEPTION_CACHE_CAPACITY: usize = 16;

// =============================================================================
// Node
// =============================================================================

struct CacheNode {
    exception_type: ClassId,
    pcs: [AtomicUsize; EXCEPTION_CACHE_CAPACITY],
    handlers: [AtomicUsize; EXCEPTION_CACHE_CAPACITY],
    count: AtomicUsize,
}

impl CacheNode {
    fn new(exception_type: ClassId, pc: usize, handler: usize) -> Self {
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        let node = Self {
            exception_type,
            pcs: [ZERO; EXCEPTION_CACHE_CAPACITY],
            handlers: [ZERO; EXCEPTION_CACHE_CAPACITY],
            count: AtomicUsize::new(1),
        };
        node.pcs[0].store(pc, Ordering::Relaxed);
        node.handlers[0].store(handler, Ordering::Relaxed);
        node
    }

    #[inline]
    fn entries(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Handler for `pc` among the published entries.
    fn test_address(&self, pc: usize) -> Option<usize> {
        (0..self.entries())
            .find(|&i| self.pcs[i].load(Ordering::Relaxed) == pc)
            .map(|i| self.handlers[i].load(Ordering::Relaxed))
    }

    /// Append an entry. Caller holds the writer lock.
    fn add_address_and_handler(&self, pc: usize, handler: usize) -> bool {
        if self.test_address(pc) == Some(handler) {
            return true;
        }
        let index = self.count.load(Ordering::Relaxed);
        if index >= EXCEPTION_CACHE_CAPACITY {
            return false;
        }
        self.pcs[index].store(pc, Ordering::Relaxed);
        self.handlers[index].store(handler, Ordering::Relaxed);
        self.count.store(index + 1, Ordering::Release);
        true
    }
}

type Snapshot = Arc<[Arc<CacheNode>]>;

// =============================================================================
// ExceptionCache
// =============================================================================

/// Snapshot-read, locked-write handler cache of one compiled method.
pub struct ExceptionCache {
    nodes: RwLock<Snapshot>,
    /// Serializes writers; holds unlinked nodes awaiting release.
    writer: Mutex<Vec<Arc<CacheNode>>>,
}

impl Default for ExceptionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExceptionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl ExceptionCache {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Arc::from(Vec::new())),
            writer: Mutex::new(Vec::new()),
        }
    }

    /// The published node list. The read lock is held only for the clone.
    #[inline]
    fn snapshot(&self) -> Snapshot {
        self.nodes.read().clone()
    }

    fn publish(&self, nodes: Vec<Arc<CacheNode>>) {
        *self.nodes.write() = Arc::from(nodes);
    }

    /// Cached handler for an exception of `exception_type` thrown at `pc`.
    ///
    /// May return `None` for an entry being added concurrently.
    pub fn lookup(&self, exception_type: ClassId, pc: usize) -> Option<usize> {
        self.snapshot()
            .iter()
            .filter(|n| n.exception_type == exception_type)
            .find_map(|n| n.test_address(pc))
    }

    /// Record `handler` for `(exception_type, pc)`.
    pub fn add(&self, exception_type: ClassId, pc: usize, handler: usize) {
        let _lock = self.writer.lock();
        let nodes = self.snapshot();
        if let Some(target) = nodes.iter().find(|n| n.exception_type == exception_type) {
            if target.add_address_and_handler(pc, handler) {
                return;
            }
        }
        let mut next = Vec::with_capacity(nodes.len() + 1);
        next.push(Arc::new(CacheNode::new(exception_type, pc, handler)));
        next.extend(nodes.iter().cloned());
        self.publish(next);
    }

    /// Unlink every node whose exception class is dead. Returns the number
    /// of entries removed. Storage is reclaimed by [`release_purged`].
    ///
    /// [`release_purged`]: ExceptionCache::release_purged
    pub fn purge(&self, mut is_alive: impl FnMut(ClassId) -> bool) -> usize {
        let mut purge = self.writer.lock();
        let nodes = self.snapshot();
        let (live, dead): (Vec<_>, Vec<_>) = nodes.iter().cloned().partition(|n| is_alive(n.exception_type));
        if dead.is_empty() {
            return 0;
        }
        let removed = dead.iter().map(|n| n.entries()).sum();
        self.publish(live);
        purge.extend(dead);
        removed
    }

    /// Release purged nodes that no reader snapshot still refers to.
    ///
    /// Returns the number of nodes released; zero while every purged node
    /// is still visible to some reader.
    pub fn release_purged(&self) -> usize {
        let mut purge = self.writer.lock();
        let before = purge.len();
        purge.retain(|n| Arc::strong_count(n) > 1);
        before - purge.len()
    }

    /// Nodes unlinked but not yet released.
    pub fn pending_purge(&self) -> usize {
        self.writer.lock().len()
    }

    /// Total published entries.
    pub fn len(&self) -> usize {
        self.snapshot().iter().map(|n| n.entries()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
