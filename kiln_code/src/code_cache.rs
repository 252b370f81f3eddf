//! Registry of compiled methods.
//!
//! The code cache provides:
//! - lookup by id and by any pc inside a method's code
//! - per-method OSR chains and the scavenge-root list (threaded through
//!   each method's [`CollectorLink`])
//! - the unloading and sweeping passes driven by the collector

use crate::compiled_method::{CollectorLink, CompiledMethod, CompiledState};
use crate::unloading::{IsAlive, PostponedIcs, UnloadOutcome, UnloadingClock};
use kiln_core::{Bci, CompiledId, MethodId};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Which intrusive list regular (non-OSR) code may join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectorMode {
    /// Young-generation collections scan the scavenge-root list.
    #[default]
    Generational,
    /// No scavenge-root list is maintained.
    SinglePass,
}

/// Totals of one unloading pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnloadingStats {
    pub unloaded: usize,
    pub ics_cleaned: usize,
    pub exception_entries_purged: usize,
    pub postponed: usize,
}

impl UnloadingStats {
    fn add(&mut self, o: UnloadOutcome) {
        self.unloaded += usize::from(o.unloaded);
        self.ics_cleaned += o.ics_cleaned;
        self.exception_entries_purged += o.exception_entries_purged;
        self.postponed += o.postponed;
    }
}

/// Totals of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub marked_on_stack: usize,
    pub made_zombie: usize,
    pub flushed: usize,
}

// =============================================================================
// Code Cache
// =============================================================================

/// All compiled code of one VM.
#[derive(Debug)]
pub struct CodeCache {
    methods: RwLock<FxHashMap<CompiledId, Arc<CompiledMethod>>>,
    by_address: RwLock<BTreeMap<usize, CompiledId>>,
    osr_heads: Mutex<FxHashMap<MethodId, CompiledId>>,
    scavenge_head: Mutex<Option<CompiledId>>,
    mode: CollectorMode,
    clock: UnloadingClock,
    next_id: AtomicU64,
    installs: AtomicU64,
    flushes: AtomicU64,
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new(CollectorMode::default())
    }
}

impl CodeCache {
    pub fn new(mode: CollectorMode) -> Self {
        Self {
            methods: RwLock::new(FxHashMap::default()),
            by_address: RwLock::new(BTreeMap::new()),
            osr_heads: Mutex::new(FxHashMap::default()),
            scavenge_head: Mutex::new(None),
            mode,
            clock: UnloadingClock::new(),
            next_id: AtomicU64::new(1),
            installs: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Allocate a fresh compiled-method id.
    pub fn next_id(&self) -> CompiledId {
        CompiledId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn clock(&self) -> &UnloadingClock {
        &self.clock
    }

    #[inline]
    pub fn mode(&self) -> CollectorMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.read().is_empty()
    }

    /// Publish `nm`, making it the method's code (or joining its OSR chain).
    ///
    /// # Panics
    ///
    /// Panics if the id is already present or the code range overlaps
    /// installed code.
    pub fn install(&self, nm: CompiledMethod) -> Arc<CompiledMethod> {
        let nm = Arc::new(nm);
        {
            let mut by_address = self.by_address.write();
            if let Some((_, &prev)) = by_address.range(..nm.code_end()).next_back() {
                if let Some(other) = self.methods.read().get(&prev) {
                    assert!(
                        other.code_end() <= nm.code_begin(),
                        "{} overlaps {}",
                        nm.id(),
                        other.id()
                    );
                }
            }
            let mut methods = self.methods.write();
            assert!(!methods.contains_key(&nm.id()), "{} installed twice", nm.id());
            methods.insert(nm.id(), nm.clone());
            by_address.insert(nm.code_begin(), nm.id());
        }

        nm.make_in_use();
        if nm.is_osr_method() {
            let mut heads = self.osr_heads.lock();
            let next = heads.insert(nm.method().id(), nm.id());
            nm.set_link(CollectorLink::Osr { next });
        } else {
            nm.method().set_code(nm.id());
            if self.mode == CollectorMode::Generational && nm.has_scavenge_roots() {
                let mut head = self.scavenge_head.lock();
                nm.set_link(CollectorLink::ScavengeRoot { next: head.replace(nm.id()) });
            }
        }
        self.installs.fetch_add(1, Ordering::Relaxed);
        debug!(nm = %nm.id(), method = %nm.method().id(), osr = nm.is_osr_method(), "installed");
        nm
    }

    #[inline]
    pub fn lookup(&self, id: CompiledId) -> Option<Arc<CompiledMethod>> {
        self.methods.read().get(&id).cloned()
    }

    /// Compiled method whose code contains `pc`.
    pub fn find_by_pc(&self, pc: usize) -> Option<Arc<CompiledMethod>> {
        let id = {
            let by_address = self.by_address.read();
            let (_, &id) = by_address.range(..=pc).next_back()?;
            id
        };
        self.lookup(id).filter(|nm| nm.contains(pc))
    }

    /// Snapshot of every installed method.
    pub fn all(&self) -> Vec<Arc<CompiledMethod>> {
        self.methods.read().values().cloned().collect()
    }

    // =========================================================================
    // Intrusive lists
    // =========================================================================

    /// OSR chain of `method`, newest first.
    pub fn osr_chain(&self, method: MethodId) -> Vec<CompiledId> {
        let head = self.osr_heads.lock().get(&method).copied();
        self.follow(head, |link| match link {
            CollectorLink::Osr { next } => next,
            _ => None,
        })
    }

    /// In-use OSR code of `method` entered at `bci`.
    pub fn lookup_osr(&self, method: MethodId, bci: Bci) -> Option<Arc<CompiledMethod>> {
        self.osr_chain(method)
            .into_iter()
            .filter_map(|id| self.lookup(id))
            .find(|nm| nm.entry_bci() == bci && nm.is_in_use())
    }

    /// Methods on the scavenge-root list, newest first.
    pub fn scavenge_roots(&self) -> Vec<CompiledId> {
        let head = *self.scavenge_head.lock();
        self.follow(head, |link| match link {
            CollectorLink::ScavengeRoot { next } => next,
            _ => None,
        })
    }

    fn follow(
        &self,
        mut cur: Option<CompiledId>,
        next: impl Fn(CollectorLink) -> Option<CompiledId>,
    ) -> Vec<CompiledId> {
        let mut out = Vec::new();
        while let Some(id) = cur {
            out.push(id);
            cur = self.lookup(id).and_then(|nm| next(nm.link()));
        }
        out
    }

    /// Remove `nm` from whichever list it is on.
    fn unlink(&self, nm: &CompiledMethod) {
        let (successor, osr) = match nm.link() {
            CollectorLink::Unlinked => return,
            CollectorLink::Osr { next } => (next, true),
            CollectorLink::ScavengeRoot { next } => (next, false),
        };
        let chain = if osr {
            self.osr_chain(nm.method().id())
        } else {
            self.scavenge_roots()
        };
        match chain.iter().position(|&id| id == nm.id()) {
            Some(0) if osr => {
                let mut heads = self.osr_heads.lock();
                match successor {
                    Some(next) => heads.insert(nm.method().id(), next),
                    None => heads.remove(&nm.method().id()),
                };
            }
            Some(0) => *self.scavenge_head.lock() = successor,
            Some(i) => {
                if let Some(prev) = self.lookup(chain[i - 1]) {
                    prev.set_link(if osr {
                        CollectorLink::Osr { next: successor }
                    } else {
                        CollectorLink::ScavengeRoot { next: successor }
                    });
                }
            }
            None => {}
        }
        nm.set_link(CollectorLink::Unlinked);
    }

    /// Drop dead entries from the scavenge-root list.
    pub fn prune_scavenge_roots(&self) -> usize {
        let dead: Vec<_> = self
            .scavenge_roots()
            .into_iter()
            .filter_map(|id| self.lookup(id))
            .filter(|nm| !nm.is_alive())
            .collect();
        for nm in &dead {
            self.unlink(nm);
        }
        dead.len()
    }

    // =========================================================================
    // Unloading
    // =========================================================================

    fn resolver(&self) -> impl Fn(CompiledId) -> Option<Arc<CompiledMethod>> + '_ {
        move |id| self.lookup(id)
    }

    /// Single-pass unloading at a global pause.
    pub fn do_unloading(&self, is_alive: &dyn IsAlive) -> UnloadingStats {
        let cycle = self.clock.advance_cycle();
        let mut stats = UnloadingStats::default();
        let all = self.all();
        for nm in &all {
            let outcome = nm.do_unloading(is_alive, &self.clock);
            if outcome.unloaded {
                self.unlink(nm);
            }
            stats.add(outcome);
        }
        let resolve = self.resolver();
        for nm in all.iter().filter(|nm| nm.is_alive()) {
            stats.ics_cleaned += nm.cleanup_inline_caches(&resolve);
        }
        info!(cycle, unloaded = stats.unloaded, ics = stats.ics_cleaned, "code cache unloading");
        stats
    }

    /// Pass one of two-phase unloading, spread over `workers` threads.
    ///
    /// Returns the postponed call sites to hand to
    /// [`do_unloading_parallel_postponed`](Self::do_unloading_parallel_postponed).
    pub fn do_unloading_parallel(
        &self,
        is_alive: &(dyn IsAlive + Sync),
        workers: usize,
    ) -> (PostponedIcs, UnloadingStats) {
        let cycle = self.clock.advance_cycle();
        let all = self.all();
        let chunk = all.len().div_ceil(workers.max(1)).max(1);
        let resolve = self.resolver();

        let results: Vec<(PostponedIcs, UnloadingStats)> = std::thread::scope(|s| {
            let handles: Vec<_> = all
                .chunks(chunk)
                .map(|part| {
                    let resolve = &resolve;
                    s.spawn(move || {
                        let mut postponed = PostponedIcs::new();
                        let mut stats = UnloadingStats::default();
                        for nm in part {
                            stats.add(nm.do_unloading_parallel(is_alive, &self.clock, resolve, &mut postponed));
                        }
                        (postponed, stats)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });

        let mut postponed = PostponedIcs::new();
        let mut stats = UnloadingStats::default();
        for (p, s) in results {
            postponed.extend(p);
            stats.unloaded += s.unloaded;
            stats.ics_cleaned += s.ics_cleaned;
            stats.exception_entries_purged += s.exception_entries_purged;
            stats.postponed += s.postponed;
        }
        for nm in all.iter().filter(|nm| nm.is_unloaded()) {
            self.unlink(nm);
        }
        debug!(cycle, postponed = postponed.len(), "unloading pass one");
        (postponed, stats)
    }

    /// Pass two of two-phase unloading. Returns the number of sites cleaned.
    pub fn do_unloading_parallel_postponed(&self, postponed: PostponedIcs) -> usize {
        let resolve = self.resolver();
        let cleaned = postponed
            .iter()
            .filter(|&(caller, site)| {
                self.lookup(caller)
                    .is_some_and(|nm| nm.do_unloading_parallel_postponed(site, &self.clock, &resolve))
            })
            .count();
        debug!(cleaned, "unloading pass two");
        cleaned
    }

    // =========================================================================
    // Sweeping
    // =========================================================================

    /// Sweep after a traversal of all thread stacks found `on_stack` active.
    ///
    /// Marks active code, converts eligible not-entrant and unloaded code to
    /// zombies, and flushes zombies without activations.
    pub fn sweep(&self, on_stack: &FxHashSet<CompiledId>) -> SweepStats {
        let traversal = self.clock.traversals();
        let mut stats = SweepStats::default();
        for nm in self.all() {
            if on_stack.contains(&nm.id()) {
                nm.mark_as_seen_on_stack(traversal);
                stats.marked_on_stack += 1;
                continue;
            }
            match nm.state() {
                CompiledState::NotEntrant if nm.stack_traversal_mark().is_none() => {
                    nm.mark_as_seen_on_stack(traversal);
                }
                CompiledState::NotEntrant | CompiledState::Unloaded => {
                    if nm.make_zombie(&self.clock) {
                        self.unlink(&nm);
                        stats.made_zombie += 1;
                    }
                }
                CompiledState::Zombie => {
                    self.flush(&nm);
                    stats.flushed += 1;
                }
                _ => {}
            }
        }
        self.clock.advance_traversal();
        stats
    }

    fn flush(&self, nm: &CompiledMethod) {
        self.unlink(nm);
        self.by_address.write().remove(&nm.code_begin());
        self.methods.write().remove(&nm.id());
        self.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(nm = %nm.id(), "flushed");
    }

    pub fn installs(&self) -> u64 {
        self.installs.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ClassId, Method, Opcode};

    fn method(id: u32) -> Arc<Method> {
        Arc::new(Method::new(MethodId(id), "f", ClassId(id), vec![Opcode::Simple; 8]))
    }

    #[test]
    fn test_install_and_find_by_pc() {
        let cache = CodeCache::default();
        let m = method(1);
        let id = cache.next_id();
        let nm = cache.install(CompiledMethod::new(id, m.clone(), 0x1000, 0x100));
        assert!(nm.is_in_use());
        assert_eq!(m.code(), Some(id));
        assert_eq!(cache.find_by_pc(0x1080).map(|n| n.id()), Some(id));
        assert!(cache.find_by_pc(0x0fff).is_none());
        assert!(cache.find_by_pc(0x1101).is_none());
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn test_overlapping_install_rejected() {
        let cache = CodeCache::default();
        cache.install(CompiledMethod::new(cache.next_id(), method(1), 0x1000, 0x100));
        cache.install(CompiledMethod::new(cache.next_id(), method(2), 0x1080, 0x100));
    }

    #[test]
    fn test_osr_chain() {
        let cache = CodeCache::default();
        let m = method(1);
        let a = cache.install(CompiledMethod::new(cache.next_id(), m.clone(), 0x1000, 0x10).with_entry_bci(2));
        let b = cache.install(CompiledMethod::new(cache.next_id(), m.clone(), 0x2000, 0x10).with_entry_bci(5));
        assert_eq!(cache.osr_chain(m.id()), vec![b.id(), a.id()]);
        assert_eq!(m.code(), None);
        assert_eq!(cache.lookup_osr(m.id(), 2).map(|n| n.id()), Some(a.id()));

        a.make_not_entrant();
        assert!(cache.lookup_osr(m.id(), 2).is_none());
        cache.unlink(&a);
        assert_eq!(cache.osr_chain(m.id()), vec![b.id()]);
        cache.unlink(&b);
        assert!(cache.osr_chain(m.id()).is_empty());
    }

    #[test]
    fn test_scavenge_roots_only_when_generational() {
        let generational = CodeCache::new(CollectorMode::Generational);
        let nm = generational.install(CompiledMethod::new(generational.next_id(), method(1), 0, 8).with_scavenge_roots(true));
        assert_eq!(generational.scavenge_roots(), vec![nm.id()]);

        let single = CodeCache::new(CollectorMode::SinglePass);
        single.install(CompiledMethod::new(single.next_id(), method(1), 0, 8).with_scavenge_roots(true));
        assert!(single.scavenge_roots().is_empty());
    }

    #[test]
    fn test_prune_scavenge_roots() {
        let cache = CodeCache::default();
        let a = cache.install(CompiledMethod::new(cache.next_id(), method(1), 0x000, 8).with_scavenge_roots(true));
        let b = cache.install(CompiledMethod::new(cache.next_id(), method(2), 0x100, 8).with_scavenge_roots(true));
        let c = cache.install(CompiledMethod::new(cache.next_id(), method(3), 0x200, 8).with_scavenge_roots(true));
        b.make_unloaded();
        assert_eq!(cache.prune_scavenge_roots(), 1);
        assert_eq!(cache.scavenge_roots(), vec![c.id(), a.id()]);
    }

    #[test]
    fn test_sweep_converts_and_flushes() {
        let cache = CodeCache::default();
        let nm = cache.install(CompiledMethod::new(cache.next_id(), method(1), 0, 8));
        nm.make_not_entrant();
        let none = FxHashSet::default();

        // First sweep records the mark, the next one is too early, then zombie.
        cache.sweep(&none);
        assert_eq!(cache.sweep(&none).made_zombie, 0);
        assert_eq!(cache.sweep(&none).made_zombie, 1);
        assert_eq!(cache.sweep(&none).flushed, 1);
        assert!(cache.lookup(nm.id()).is_none());
        assert_eq!(cache.flushes(), 1);
    }

    #[test]
    fn test_active_code_is_not_converted() {
        let cache = CodeCache::default();
        let nm = cache.install(CompiledMethod::new(cache.next_id(), method(1), 0, 8));
        nm.make_not_entrant();
        let mut active = FxHashSet::default();
        active.insert(nm.id());
        for _ in 0..4 {
            cache.sweep(&active);
        }
        assert!(nm.is_not_entrant());
    }
}
