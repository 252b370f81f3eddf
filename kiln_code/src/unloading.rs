//! Class-unloading support for compiled code.
//!
//! When the collector finds classes dead, compiled code embedding them
//! must be unloaded, inline caches pointing at unloaded code must be
//! cleaned and exception-cache entries for dead exception classes purged.
//!
//! Two protocols are offered:
//!
//! - **Single pass** ([`CompiledMethod::do_unloading`]), for collectors that
//!   stop the world: every method is classified and cleaned in one sweep,
//!   followed by a plain [`CompiledMethod::cleanup_inline_caches`].
//! - **Two phase** ([`CompiledMethod::do_unloading_parallel`] then
//!   [`CompiledMethod::do_unloading_parallel_postponed`]), for collectors
//!   that process methods concurrently: a call site whose target has not
//!   been classified yet is put on a [`PostponedIcs`] worklist and resolved
//!   once every method's status is known.
//!
//! The unloading verdict of each method is cached per [`UnloadingClock`]
//! cycle so it is computed exactly once per collection.

use crate::compiled_method::CompiledMethod;
use crate::inline_cache::IcTarget;
use kiln_core::{ClassId, CompiledId, ObjRef};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

// =============================================================================
// Liveness
// =============================================================================

/// Liveness oracle supplied by the collector.
pub trait IsAlive {
    fn is_class_alive(&self, class: ClassId) -> bool;

    fn is_object_alive(&self, _obj: ObjRef) -> bool {
        true
    }
}

impl<F: Fn(ClassId) -> bool> IsAlive for F {
    fn is_class_alive(&self, class: ClassId) -> bool {
        self(class)
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Collection cycle and sweeper traversal counters.
///
/// Owned by the code cache and passed explicitly into every unloading and
/// sweeping pass.
#[derive(Debug, Default)]
pub struct UnloadingClock {
    cycle: AtomicU64,
    traversals: AtomicU64,
}

impl UnloadingClock {
    pub const fn new() -> Self {
        Self {
            cycle: AtomicU64::new(0),
            traversals: AtomicU64::new(0),
        }
    }

    /// Current unloading cycle. Zero before the first collection.
    #[inline]
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    /// Start a new unloading cycle, invalidating cached verdicts.
    pub fn advance_cycle(&self) -> u64 {
        self.cycle.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn traversals(&self) -> u64 {
        self.traversals.load(Ordering::Acquire)
    }

    /// Complete a sweeper traversal of all thread stacks.
    pub fn advance_traversal(&self) -> u64 {
        self.traversals.fetch_add(1, Ordering::AcqRel) + 1
    }
}

// =============================================================================
// Worklist
// =============================================================================

/// Call sites whose target was unclassified during pass one.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PostponedIcs {
    sites: Vec<(CompiledId, usize)>,
}

impl PostponedIcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, caller: CompiledId, site: usize) {
        self.sites.push((caller, site));
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn extend(&mut self, other: PostponedIcs) {
        self.sites.extend(other.sites);
    }

    /// `(caller, call-site index)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (CompiledId, usize)> + '_ {
        self.sites.iter().copied()
    }
}

/// What one unloading pass did to one method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnloadOutcome {
    pub unloaded: bool,
    pub ics_cleaned: usize,
    pub exception_entries_purged: usize,
    pub postponed: usize,
}

// =============================================================================
// Per-method unloading
// =============================================================================

const UNLOADING_BIT: u64 = 1;

impl CompiledMethod {
    /// Whether anything this code embeds is dead.
    fn can_unload(&self, is_alive: &dyn IsAlive) -> bool {
        !is_alive.is_class_alive(self.method().holder())
            || self.oops().iter().any(|&o| !o.is_null() && !is_alive.is_object_alive(o))
    }

    /// Verdict for the current cycle, if already computed.
    pub fn unloading_status(&self, clock: &UnloadingClock) -> Option<bool> {
        let state = self.unloading_state.load(Ordering::Acquire);
        let cycle = clock.cycle();
        (cycle != 0 && state >> 1 == cycle).then_some(state & UNLOADING_BIT != 0)
    }

    /// Verdict for the current cycle, computing and caching it on first use.
    pub fn is_unloading(&self, is_alive: &dyn IsAlive, clock: &UnloadingClock) -> bool {
        if let Some(status) = self.unloading_status(clock) {
            return status;
        }
        let unloading = !self.is_alive() || self.can_unload(is_alive);
        let state = (clock.cycle() << 1) | u64::from(unloading);
        self.unloading_state.store(state, Ordering::Release);
        unloading
    }

    fn purge_exception_cache(&self, is_alive: &dyn IsAlive) -> usize {
        let purged = self.exception_cache().purge(|c| is_alive.is_class_alive(c));
        if purged > 0 {
            self.exception_cache().release_purged();
        }
        purged
    }

    fn clean_dead_metadata(&self, is_alive: &dyn IsAlive) -> usize {
        self.call_sites()
            .iter()
            .filter(|site| site.clean_if(|_, class| class.is_some_and(|c| !is_alive.is_class_alive(c))))
            .count()
    }

    /// Single-pass unloading at a global pause.
    pub fn do_unloading(&self, is_alive: &dyn IsAlive, clock: &UnloadingClock) -> UnloadOutcome {
        let mut outcome = UnloadOutcome::default();
        if !self.is_alive() {
            return outcome;
        }
        outcome.exception_entries_purged = self.purge_exception_cache(is_alive);
        outcome.ics_cleaned = self.clean_dead_metadata(is_alive);
        if self.is_unloading(is_alive, clock) {
            outcome.unloaded = self.make_unloaded();
        }
        outcome
    }

    /// Pass one of two-phase unloading.
    ///
    /// Classifies this method, then cleans call sites whose target is
    /// already known to be unloading or not in use. Sites whose target is
    /// still unclassified this cycle are appended to `postponed`.
    pub fn do_unloading_parallel(
        &self,
        is_alive: &dyn IsAlive,
        clock: &UnloadingClock,
        resolve: &dyn Fn(CompiledId) -> Option<Arc<CompiledMethod>>,
        postponed: &mut PostponedIcs,
    ) -> UnloadOutcome {
        let mut outcome = UnloadOutcome::default();
        if self.is_unloading(is_alive, clock) {
            outcome.unloaded = self.make_unloaded();
            return outcome;
        }
        outcome.exception_entries_purged = self.purge_exception_cache(is_alive);
        outcome.ics_cleaned = self.clean_dead_metadata(is_alive);

        for (index, site) in self.call_sites().iter().enumerate() {
            let IcTarget::Compiled(target) = site.target() else {
                continue;
            };
            match resolve(target) {
                None => {
                    if site.set_to_clean() {
                        outcome.ics_cleaned += 1;
                    }
                }
                Some(dest) => match dest.unloading_status(clock) {
                    Some(unloading) => {
                        if (unloading || !dest.is_in_use()) && site.set_to_clean() {
                            outcome.ics_cleaned += 1;
                        }
                    }
                    None => {
                        trace!(caller = %self.id(), callee = %target, site = index, "postponed IC");
                        postponed.push(self.id(), index);
                        outcome.postponed += 1;
                    }
                },
            }
        }
        outcome
    }

    /// Pass two of two-phase unloading for one postponed call site.
    ///
    /// Every method has been classified by now; an unclassified target is
    /// treated as unloading.
    pub fn do_unloading_parallel_postponed(
        &self,
        site: usize,
        clock: &UnloadingClock,
        resolve: &dyn Fn(CompiledId) -> Option<Arc<CompiledMethod>>,
    ) -> bool {
        let Some(site) = self.call_sites().get(site) else {
            return false;
        };
        site.clean_if(|target, _| match target {
            IcTarget::Compiled(id) => match resolve(id) {
                Some(dest) => dest.unloading_status(clock).unwrap_or(true) || !dest.is_in_use(),
                None => true,
            },
            _ => false,
        })
    }
}
