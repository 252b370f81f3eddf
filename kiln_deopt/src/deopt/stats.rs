//! Deoptimization counters.
//!
//! Global totals by reason, action and decision, plus per-site counts so
//! the sites that trap most can be found. Everything is updated with
//! relaxed atomics from any thread; readers get a best-effort snapshot.

use super::trap::{ACTION_LIMIT, DeoptAction, DeoptReason, REASON_LIMIT, TrapDecision};
use kiln_core::{Bci, CompiledId};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// =============================================================================
// Deopt Site
// =============================================================================

/// A trapping bytecode within one compiled method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeoptSiteKey {
    pub code: CompiledId,
    pub bci: Bci,
}

#[derive(Debug)]
struct DeoptSite {
    count: AtomicU32,
    by_reason: [AtomicU32; REASON_LIMIT],
}

impl DeoptSite {
    fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            by_reason: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    fn record(&self, reason: DeoptReason) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.by_reason[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn dominant_reason(&self) -> Option<DeoptReason> {
        let (idx, count) = self
            .by_reason
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .enumerate()
            .max_by_key(|&(_, c)| c)?;
        if count == 0 {
            return None;
        }
        DeoptReason::from_u8(idx as u8)
    }
}

/// Point-in-time view of one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteSnapshot {
    pub total_count: u32,
    pub dominant_reason: Option<DeoptReason>,
}

// =============================================================================
// Deopt Counters
// =============================================================================

/// Counters shared by every deoptimization on every thread.
#[derive(Debug)]
pub struct DeoptCounters {
    sites: RwLock<FxHashMap<DeoptSiteKey, DeoptSite>>,
    by_reason: [AtomicU64; REASON_LIMIT],
    by_action: [AtomicU64; ACTION_LIMIT],
    by_decision: [AtomicU64; 4],
    uncommon_traps: AtomicU64,
    deoptimizations: AtomicU64,
    frames_unpacked: AtomicU64,
    realloc_failures: AtomicU64,
    lost_invalidations: AtomicU64,
}

impl Default for DeoptCounters {
    fn default() -> Self {
        Self::new()
    }
}

fn decision_index(decision: TrapDecision) -> usize {
    match decision {
        TrapDecision::Ignore => 0,
        TrapDecision::RecompileEventually => 1,
        TrapDecision::ForceReinterpret => 2,
        TrapDecision::AbandonCompilation => 3,
    }
}

impl DeoptCounters {
    pub fn new() -> Self {
        Self {
            sites: RwLock::new(FxHashMap::default()),
            by_reason: std::array::from_fn(|_| AtomicU64::new(0)),
            by_action: std::array::from_fn(|_| AtomicU64::new(0)),
            by_decision: std::array::from_fn(|_| AtomicU64::new(0)),
            uncommon_traps: AtomicU64::new(0),
            deoptimizations: AtomicU64::new(0),
            frames_unpacked: AtomicU64::new(0),
            realloc_failures: AtomicU64::new(0),
            lost_invalidations: AtomicU64::new(0),
        }
    }

    /// Record an uncommon trap at a site.
    pub fn record_trap(&self, code: CompiledId, bci: Bci, reason: DeoptReason, action: DeoptAction) {
        self.uncommon_traps.fetch_add(1, Ordering::Relaxed);
        self.by_reason[reason as usize].fetch_add(1, Ordering::Relaxed);
        self.by_action[action as usize].fetch_add(1, Ordering::Relaxed);

        let key = DeoptSiteKey { code, bci };
        if let Some(site) = self.sites.read().get(&key) {
            site.record(reason);
            return;
        }
        self.sites.write().entry(key).or_insert_with(DeoptSite::new).record(reason);
    }

    pub fn record_decision(&self, decision: TrapDecision) {
        self.by_decision[decision_index(decision)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deoptimization(&self) {
        self.deoptimizations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frames_unpacked(&self, frames: usize) {
        self.frames_unpacked.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn record_realloc_failures(&self, failed: usize) {
        self.realloc_failures.fetch_add(failed as u64, Ordering::Relaxed);
    }

    /// A trap wanted to invalidate code another thread invalidated first.
    pub fn record_lost_invalidation(&self) {
        self.lost_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn site(&self, code: CompiledId, bci: Bci) -> Option<SiteSnapshot> {
        let sites = self.sites.read();
        sites.get(&DeoptSiteKey { code, bci }).map(|site| SiteSnapshot {
            total_count: site.count.load(Ordering::Relaxed),
            dominant_reason: site.dominant_reason(),
        })
    }

    /// Sites that trapped at least `threshold` times.
    pub fn hot_sites(&self, threshold: u32) -> Vec<DeoptSiteKey> {
        self.sites
            .read()
            .iter()
            .filter(|(_, site)| site.count.load(Ordering::Relaxed) >= threshold)
            .map(|(key, _)| *key)
            .collect()
    }

    #[inline]
    pub fn uncommon_traps(&self) -> u64 {
        self.uncommon_traps.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deoptimizations(&self) -> u64 {
        self.deoptimizations.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_unpacked(&self) -> u64 {
        self.frames_unpacked.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn realloc_failures(&self) -> u64 {
        self.realloc_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn lost_invalidations(&self) -> u64 {
        self.lost_invalidations.load(Ordering::Relaxed)
    }

    pub fn count_for_reason(&self, reason: DeoptReason) -> u64 {
        self.by_reason[reason as usize].load(Ordering::Relaxed)
    }

    pub fn count_for_action(&self, action: DeoptAction) -> u64 {
        self.by_action[action as usize].load(Ordering::Relaxed)
    }

    pub fn count_for_decision(&self, decision: TrapDecision) -> u64 {
        self.by_decision[decision_index(decision)].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_site_counts() {
        let c = DeoptCounters::new();
        let code = CompiledId(3);
        c.record_trap(code, 7, DeoptReason::NullCheck, DeoptAction::MaybeRecompile);
        c.record_trap(code, 7, DeoptReason::ClassCheck, DeoptAction::MaybeRecompile);
        c.record_trap(code, 7, DeoptReason::ClassCheck, DeoptAction::Reinterpret);

        let site = c.site(code, 7).unwrap();
        assert_eq!(site.total_count, 3);
        assert_eq!(site.dominant_reason, Some(DeoptReason::ClassCheck));
        assert!(c.site(code, 8).is_none());
        assert_eq!(c.count_for_action(DeoptAction::MaybeRecompile), 2);
        assert_eq!(c.hot_sites(3), vec![DeoptSiteKey { code, bci: 7 }]);
        assert!(c.hot_sites(4).is_empty());
    }

    #[test]
    fn test_concurrent_recording() {
        let c = Arc::new(DeoptCounters::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let c = c.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        c.record_trap(CompiledId(1), i % 2, DeoptReason::RangeCheck, DeoptAction::None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.uncommon_traps(), 1000);
        assert_eq!(c.count_for_reason(DeoptReason::RangeCheck), 1000);
        assert_eq!(c.site(CompiledId(1), 0).unwrap().total_count, 500);
    }

    #[test]
    fn test_decisions() {
        let c = DeoptCounters::new();
        c.record_decision(TrapDecision::ForceReinterpret);
        c.record_decision(TrapDecision::ForceReinterpret);
        assert_eq!(c.count_for_decision(TrapDecision::ForceReinterpret), 2);
        assert_eq!(c.count_for_decision(TrapDecision::Ignore), 0);
    }
}
