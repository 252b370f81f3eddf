//! Monitor state for relocking and bias revocation.
//!
//! Compiled code may elide locking on objects that never escape. When such
//! a frame is deoptimized the interpreter expects those monitors held, so
//! they are locked again on behalf of the thread. An object still biased
//! towards a thread from an earlier bias epoch is first returned to the
//! unbiased state.

use kiln_core::{ObjRef, ThreadId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::trace;

/// Low bits of a lock word for a stack-locked object.
pub const LOCKED_TAG: u64 = 0b00;
/// Low bits of a lock word for a biased object.
pub const BIASED_TAG: u64 = 0b101;

/// Locking operations needed while rebuilding interpreter frames.
pub trait MonitorService: Send + Sync {
    /// Lock `obj` for `thread` and return the lock word stored in the
    /// interpreter frame's monitor slot.
    fn relock(&self, thread: ThreadId, obj: ObjRef) -> u64;

    /// Drop any bias on `obj`. Returns true if a bias was removed.
    fn revoke_bias(&self, obj: ObjRef) -> bool;

    fn is_locked_by(&self, obj: ObjRef, thread: ThreadId) -> bool;
}

// =============================================================================
// LockTable
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Biased { owner: ThreadId, epoch: u32 },
    Locked { owner: ThreadId, recursions: u32 },
}

/// Side-table monitor implementation with epoch-based biasing.
#[derive(Debug, Default)]
pub struct LockTable {
    states: Mutex<FxHashMap<ObjRef, LockState>>,
    epoch: AtomicU32,
    revocations: AtomicU64,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bias `obj` towards `thread` in the current epoch.
    pub fn bias(&self, obj: ObjRef, thread: ThreadId) {
        let epoch = self.epoch.load(Ordering::Acquire);
        self.states.lock().insert(obj, LockState::Biased { owner: thread, epoch });
    }

    /// Start a new bias epoch, making every existing bias stale.
    pub fn bump_epoch(&self) -> u32 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_biased(&self, obj: ObjRef) -> bool {
        matches!(self.states.lock().get(&obj), Some(LockState::Biased { .. }))
    }

    pub fn recursions(&self, obj: ObjRef) -> Option<u32> {
        match self.states.lock().get(&obj) {
            Some(LockState::Locked { recursions, .. }) => Some(*recursions),
            _ => None,
        }
    }

    pub fn revocations(&self) -> u64 {
        self.revocations.load(Ordering::Relaxed)
    }

    fn lock_word(thread: ThreadId) -> u64 {
        (u64::from(thread.0) << 3) | LOCKED_TAG
    }
}

impl MonitorService for LockTable {
    /// # Panics
    ///
    /// Panics if another thread holds the lock; an object whose locking was
    /// elided cannot be visible to other threads.
    fn relock(&self, thread: ThreadId, obj: ObjRef) -> u64 {
        let current_epoch = self.epoch.load(Ordering::Acquire);
        let mut states = self.states.lock();
        let next = match states.get(&obj).copied() {
            None => LockState::Locked { owner: thread, recursions: 0 },
            Some(LockState::Biased { owner, epoch }) => {
                if owner != thread || epoch != current_epoch {
                    self.revocations.fetch_add(1, Ordering::Relaxed);
                    trace!(?obj, stale_owner = %owner, epoch, "revoked bias before relock");
                }
                LockState::Locked { owner: thread, recursions: 0 }
            }
            Some(LockState::Locked { owner, recursions }) if owner == thread => LockState::Locked {
                owner,
                recursions: recursions + 1,
            },
            Some(LockState::Locked { owner, .. }) => {
                panic!("relock of {obj:?} for {thread}: held by {owner}")
            }
        };
        states.insert(obj, next);
        Self::lock_word(thread)
    }

    fn revoke_bias(&self, obj: ObjRef) -> bool {
        let mut states = self.states.lock();
        if let Some(LockState::Biased { .. }) = states.get(&obj) {
            states.remove(&obj);
            self.revocations.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn is_locked_by(&self, obj: ObjRef, thread: ThreadId) -> bool {
        matches!(self.states.lock().get(&obj), Some(LockState::Locked { owner, .. }) if *owner == thread)
    }
}
