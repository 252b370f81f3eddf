//! Compiled methods and their lifecycle.
//!
//! A [`CompiledMethod`] owns the machine-code range of one compilation
//! together with everything needed to interpret that code at runtime:
//! PC descriptors, debug scopes, the implicit-exception table, the
//! exception-handler cache and the inline caches of its call sites.
//!
//! # Lifecycle
//!
//! ```text
//!  NotInstalled ──▶ InUse ──▶ NotUsed ──▶ NotEntrant ──▶ Unloaded ──▶ Zombie
//!                     │                       ▲ │            ▲           ▲
//!                     └───────────────────────┘ └────────────┼───────────┘
//!                     └──────────────────────────────────────┘
//! ```
//!
//! States only move rightwards. Only `InUse` code may be entered by new
//! calls; `NotEntrant` code still runs activations that are already on a
//! stack. Every transition is a compare-and-set on the state word, so when
//! several threads race to perform the same transition exactly one wins
//! and performs the follow-up work (decompile accounting, unlinking).

use crate::exception_cache::ExceptionCache;
use crate::inline_cache::{CompiledIc, IcTarget};
use crate::pc_desc::{PcDesc, PcDescTable};
use crate::scope::{DebugInfo, ScopeDesc};
use crate::unloading::UnloadingClock;
use kiln_core::{Bci, ClassId, CompiledId, INVOCATION_ENTRY_BCI, Method, ObjRef};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::{debug, info};

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of compiled code. Ordered by progression.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CompiledState {
    /// Built but not yet published in the code cache.
    NotInstalled = 0,
    /// Published and enterable.
    InUse = 1,
    /// Withdrawn before it was ever needed; not enterable.
    NotUsed = 2,
    /// Not enterable; existing activations may finish.
    NotEntrant = 3,
    /// Something it depends on was unloaded. Never executed again.
    Unloaded = 4,
    /// No activations remain; storage may be flushed.
    Zombie = 5,
}

impl CompiledState {
    #[inline]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::NotInstalled),
            1 => Some(Self::InUse),
            2 => Some(Self::NotUsed),
            3 => Some(Self::NotEntrant),
            4 => Some(Self::Unloaded),
            5 => Some(Self::Zombie),
            _ => None,
        }
    }

    /// Whether activations of this code may still exist.
    #[inline]
    pub const fn is_alive(self) -> bool {
        (self as u8) < (Self::Unloaded as u8)
    }
}

impl fmt::Display for CompiledState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotInstalled => "not_installed",
            Self::InUse => "in_use",
            Self::NotUsed => "not_used",
            Self::NotEntrant => "not_entrant",
            Self::Unloaded => "unloaded",
            Self::Zombie => "zombie",
        })
    }
}

// =============================================================================
// Collector link
// =============================================================================

/// Intrusive list membership, chosen by the owning list.
///
/// On-stack-replacement code hangs off its method's OSR chain; regular code
/// with young embedded references hangs off the collector's scavenge-root
/// list. A method is on at most one of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectorLink {
    #[default]
    Unlinked,
    Osr { next: Option<CompiledId> },
    ScavengeRoot { next: Option<CompiledId> },
}

/// Traversal mark meaning "not entrant, not yet seen by a sweep".
const PENDING_TRAVERSAL: u64 = u64::MAX;

// =============================================================================
// CompiledMethod
// =============================================================================

/// One compilation of one method.
pub struct CompiledMethod {
    id: CompiledId,
    method: Arc<Method>,
    entry_bci: Bci,
    comp_level: u8,
    code_begin: usize,
    code_size: usize,
    frame_size: usize,
    /// Words at the bottom of the frame reserved for outgoing calls.
    outgoing_words: usize,
    has_scavenge_roots: bool,

    pc_descs: PcDescTable,
    debug_info: DebugInfo,
    /// `(faulting pc offset, continuation pc offset)`, sorted.
    implicit_exceptions: Box<[(u32, u32)]>,
    oops: Box<[ObjRef]>,
    call_sites: Box<[CompiledIc]>,
    exception_cache: ExceptionCache,

    state: AtomicU8,
    stack_traversal_mark: AtomicU64,
    pub(crate) unloading_state: AtomicU64,
    link: Mutex<CollectorLink>,
}

impl fmt::Debug for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledMethod")
            .field("id", &self.id)
            .field("method", &self.method.id())
            .field("state", &self.state())
            .field("code_begin", &format_args!("{:#x}", self.code_begin))
            .field("code_size", &self.code_size)
            .finish_non_exhaustive()
    }
}

impl CompiledMethod {
    /// Compiled code for `method` occupying `[code_begin, code_begin + code_size)`.
    pub fn new(id: CompiledId, method: Arc<Method>, code_begin: usize, code_size: usize) -> Self {
        Self {
            id,
            method,
            entry_bci: INVOCATION_ENTRY_BCI,
            comp_level: 2,
            code_begin,
            code_size,
            frame_size: 2,
            outgoing_words: 0,
            has_scavenge_roots: false,
            pc_descs: PcDescTable::empty(),
            debug_info: DebugInfo::new(),
            implicit_exceptions: Box::new([]),
            oops: Box::new([]),
            call_sites: Box::new([]),
            exception_cache: ExceptionCache::new(),
            state: AtomicU8::new(CompiledState::NotInstalled as u8),
            stack_traversal_mark: AtomicU64::new(0),
            unloading_state: AtomicU64::new(0),
            link: Mutex::new(CollectorLink::Unlinked),
        }
    }

    pub fn with_pc_descs(mut self, descs: Vec<PcDesc>) -> Self {
        self.pc_descs = PcDescTable::new(descs);
        self
    }

    pub fn with_debug_info(mut self, info: DebugInfo) -> Self {
        self.debug_info = info;
        self
    }

    /// Frame size in words, return address and saved frame pointer included.
    pub fn with_frame_size(mut self, words: usize) -> Self {
        self.frame_size = words;
        self
    }

    /// Reserve `words` at the frame's sp for outgoing arguments.
    ///
    /// A callee deoptimized below this frame places its interpreter
    /// locals there, so the area is sized for the largest callee's locals.
    pub fn with_outgoing_area(mut self, words: usize) -> Self {
        self.outgoing_words = words;
        self
    }

    /// Mark as on-stack-replacement code entered at `bci`.
    pub fn with_entry_bci(mut self, bci: Bci) -> Self {
        self.entry_bci = bci;
        self
    }

    pub fn with_comp_level(mut self, level: u8) -> Self {
        self.comp_level = level;
        self
    }

    pub fn with_implicit_exceptions(mut self, mut table: Vec<(u32, u32)>) -> Self {
        table.sort_unstable_by_key(|&(pc, _)| pc);
        self.implicit_exceptions = table.into_boxed_slice();
        self
    }

    /// Heap references embedded in the code.
    pub fn with_oops(mut self, oops: Vec<ObjRef>) -> Self {
        self.oops = oops.into_boxed_slice();
        self
    }

    pub fn with_call_sites(mut self, sites: Vec<CompiledIc>) -> Self {
        self.call_sites = sites.into_boxed_slice();
        self
    }

    /// Embedded references may point into the young generation.
    pub fn with_scavenge_roots(mut self, young: bool) -> Self {
        self.has_scavenge_roots = young;
        self
    }

    // =========================================================================
    // Shape
    // =========================================================================

    #[inline]
    pub fn id(&self) -> CompiledId {
        self.id
    }

    #[inline]
    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    #[inline]
    pub fn entry_bci(&self) -> Bci {
        self.entry_bci
    }

    #[inline]
    pub fn is_osr_method(&self) -> bool {
        self.entry_bci != INVOCATION_ENTRY_BCI
    }

    #[inline]
    pub fn comp_level(&self) -> u8 {
        self.comp_level
    }

    #[inline]
    pub fn is_native_method(&self) -> bool {
        self.method.is_native()
    }

    #[inline]
    pub fn code_begin(&self) -> usize {
        self.code_begin
    }

    #[inline]
    pub fn code_end(&self) -> usize {
        self.code_begin + self.code_size
    }

    /// Whether `pc` lies in this method's code. The end address counts,
    /// since a call in the last instruction returns there.
    #[inline]
    pub fn contains(&self, pc: usize) -> bool {
        (self.code_begin..=self.code_end()).contains(&pc)
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Words reserved at the frame's sp for outgoing arguments.
    #[inline]
    pub fn outgoing_area(&self) -> usize {
        self.outgoing_words
    }

    #[inline]
    pub fn has_scavenge_roots(&self) -> bool {
        self.has_scavenge_roots
    }

    #[inline]
    pub fn oops(&self) -> &[ObjRef] {
        &self.oops
    }

    #[inline]
    pub fn call_sites(&self) -> &[CompiledIc] {
        &self.call_sites
    }

    #[inline]
    pub fn pc_descs(&self) -> &PcDescTable {
        &self.pc_descs
    }

    #[inline]
    pub fn debug_info(&self) -> &DebugInfo {
        &self.debug_info
    }

    #[inline]
    pub fn exception_cache(&self) -> &ExceptionCache {
        &self.exception_cache
    }

    pub fn link(&self) -> CollectorLink {
        *self.link.lock()
    }

    pub(crate) fn set_link(&self, link: CollectorLink) {
        *self.link.lock() = link;
    }

    // =========================================================================
    // PC lookup
    // =========================================================================

    /// Descriptor for an absolute `pc`.
    pub fn find_pc_desc(&self, pc: usize, approximate: bool) -> Option<&PcDesc> {
        let offset = pc.checked_sub(self.code_begin)?;
        let offset = i32::try_from(offset).ok()?;
        self.pc_descs.find(offset, approximate)
    }

    #[inline]
    pub fn pc_desc_at(&self, pc: usize) -> Option<&PcDesc> {
        self.find_pc_desc(pc, false)
    }

    #[inline]
    pub fn pc_desc_near(&self, pc: usize) -> Option<&PcDesc> {
        self.find_pc_desc(pc, true)
    }

    /// Absolute pc of a descriptor.
    #[inline]
    pub fn real_pc(&self, desc: &PcDesc) -> usize {
        self.code_begin + desc.pc_offset as usize
    }

    /// Innermost scope at `pc`.
    ///
    /// # Panics
    ///
    /// Panics when no descriptor or scope was recorded for `pc`; compiled
    /// code and its debug information disagree and nothing can be trusted.
    pub fn scope_desc_at(&self, pc: usize) -> ScopeDesc<'_> {
        let Some(desc) = self.pc_desc_at(pc) else {
            panic!("{}: no PcDesc for pc {pc:#x}", self.id);
        };
        match self.debug_info.scope_at(desc) {
            Some(scope) => scope,
            None => panic!("{}: no scope recorded for pc {pc:#x}", self.id),
        }
    }

    /// Innermost scope at or after `pc`, for callers that tolerate absence.
    pub fn scope_desc_near(&self, pc: usize) -> Option<ScopeDesc<'_>> {
        self.pc_desc_near(pc).and_then(|d| self.debug_info.scope_at(d))
    }

    /// Continuation pc for a hardware fault (implicit null check) at `pc`.
    pub fn continuation_for_implicit_exception(&self, pc: usize) -> Option<usize> {
        let offset = u32::try_from(pc.checked_sub(self.code_begin)?).ok()?;
        let i = self.implicit_exceptions.binary_search_by_key(&offset, |&(pc, _)| pc).ok()?;
        Some(self.code_begin + self.implicit_exceptions[i].1 as usize)
    }

    // =========================================================================
    // Exception handlers
    // =========================================================================

    /// Cached handler pc, lock-free.
    #[inline]
    pub fn handler_for_exception_and_pc(&self, exception: ClassId, pc: usize) -> Option<usize> {
        self.exception_cache.lookup(exception, pc)
    }

    #[inline]
    pub fn add_handler_for_exception_and_pc(&self, exception: ClassId, pc: usize, handler: usize) {
        self.exception_cache.add(exception, pc, handler);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[inline]
    pub fn state(&self) -> CompiledState {
        let raw = self.state.load(Ordering::Acquire);
        CompiledState::from_u8(raw).unwrap_or(CompiledState::Zombie)
    }

    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.state() == CompiledState::InUse
    }

    #[inline]
    pub fn is_not_entrant(&self) -> bool {
        self.state() == CompiledState::NotEntrant
    }

    #[inline]
    pub fn is_unloaded(&self) -> bool {
        self.state() == CompiledState::Unloaded
    }

    #[inline]
    pub fn is_zombie(&self) -> bool {
        self.state() == CompiledState::Zombie
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    /// Move to `to` if the current state satisfies `allowed`.
    ///
    /// Returns the previous state on success. Exactly one of several racing
    /// callers succeeds for a given transition.
    fn try_transition(
        &self,
        to: CompiledState,
        allowed: impl Fn(CompiledState) -> bool,
    ) -> Result<CompiledState, CompiledState> {
        let mut current = self.state();
        loop {
            if current >= to || !allowed(current) {
                return Err(current);
            }
            match self.state.compare_exchange_weak(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(raw) => current = CompiledState::from_u8(raw).unwrap_or(CompiledState::Zombie),
            }
        }
    }

    /// Publish freshly installed code. Called by the code cache.
    pub(crate) fn make_in_use(&self) -> bool {
        self.try_transition(CompiledState::InUse, |s| s == CompiledState::NotInstalled)
            .is_ok()
    }

    /// Withdraw code that was never needed.
    pub fn make_not_used(&self) -> bool {
        match self.try_transition(CompiledState::NotUsed, |s| s <= CompiledState::InUse) {
            Ok(_) => {
                self.unlink_from_method();
                debug!(nm = %self.id, method = %self.method.id(), "made not used");
                true
            }
            Err(_) => false,
        }
    }

    /// Stop new calls from entering this code.
    ///
    /// Returns `true` for the single caller that performed the transition;
    /// `false` if the code already was not entrant (or further along).
    pub fn make_not_entrant(&self) -> bool {
        let Ok(prev) = self.try_transition(CompiledState::NotEntrant, |s| s.is_alive()) else {
            return false;
        };
        if !self.is_osr_method() {
            self.method.inc_decompile_count();
        }
        self.stack_traversal_mark.store(PENDING_TRAVERSAL, Ordering::Release);
        self.unlink_from_method();
        info!(
            nm = %self.id,
            method = %self.method.id(),
            from = %prev,
            osr = self.is_osr_method(),
            "made not entrant"
        );
        true
    }

    /// Turn not-entrant or unloaded code into a zombie once no activation
    /// can remain.
    pub fn make_zombie(&self, clock: &UnloadingClock) -> bool {
        let convertible = |s: CompiledState| match s {
            CompiledState::NotEntrant => self.can_not_entrant_be_converted(clock),
            CompiledState::Unloaded => true,
            _ => false,
        };
        if self.try_transition(CompiledState::Zombie, convertible).is_err() {
            return false;
        }
        for site in self.call_sites.iter() {
            site.set_to_clean();
        }
        debug!(nm = %self.id, method = %self.method.id(), "made zombie");
        true
    }

    /// Mark as unloaded after a class it depends on died.
    pub fn make_unloaded(&self) -> bool {
        let Ok(prev) = self.try_transition(CompiledState::Unloaded, |s| s.is_alive()) else {
            return false;
        };
        self.unlink_from_method();
        info!(nm = %self.id, method = %self.method.id(), from = %prev, "made unloaded");
        true
    }

    /// Drop the method's pointer to this code if it still points here.
    fn unlink_from_method(&self) {
        if !self.is_osr_method() {
            self.method.clear_code(self.id);
        }
    }

    // =========================================================================
    // Sweeping
    // =========================================================================

    /// Record that an activation was seen during sweep `traversal`.
    #[inline]
    pub fn mark_as_seen_on_stack(&self, traversal: u64) {
        self.stack_traversal_mark.store(traversal, Ordering::Release);
    }

    #[inline]
    pub fn stack_traversal_mark(&self) -> Option<u64> {
        let mark = self.stack_traversal_mark.load(Ordering::Acquire);
        (mark != PENDING_TRAVERSAL).then_some(mark)
    }

    /// A not-entrant method may become a zombie once a full sweep has
    /// passed since it was last seen on a stack.
    pub fn can_not_entrant_be_converted(&self, clock: &UnloadingClock) -> bool {
        match self.stack_traversal_mark() {
            Some(mark) => mark + 1 < clock.traversals(),
            None => false,
        }
    }

    // =========================================================================
    // Inline caches
    // =========================================================================

    /// Reset every call site whose compiled target is gone, not in use, or
    /// no longer its method's installed code. Returns the number cleaned.
    pub fn cleanup_inline_caches(
        &self,
        resolve: impl Fn(CompiledId) -> Option<Arc<CompiledMethod>>,
    ) -> usize {
        let mut cleaned = 0;
        for site in self.call_sites.iter() {
            let stale = site.clean_if(|target, _| match target {
                IcTarget::Compiled(id) => match resolve(id) {
                    Some(dest) => !dest.is_in_use() || dest.method.code() != Some(dest.id),
                    None => true,
                },
                _ => false,
            });
            if stale {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            debug!(nm = %self.id, cleaned, "cleaned inline caches");
        }
        cleaned
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Check descriptor ordering and scope references.
    pub fn verify(&self) -> Result<(), String> {
        self.pc_descs.verify()?;
        self.debug_info.verify()?;
        if self.outgoing_words + 2 > self.frame_size {
            return Err(format!(
                "{}: outgoing area of {} words exceeds frame of {}",
                self.id, self.outgoing_words, self.frame_size
            ));
        }
        for desc in self.pc_descs.iter() {
            if desc.pc_offset as usize > self.code_size {
                return Err(format!("{}: PcDesc {} outside code", self.id, desc.pc_offset));
            }
            if self.debug_info.scope_at(desc).is_none() {
                return Err(format!("{}: PcDesc {} has no scope", self.id, desc.pc_offset));
            }
        }
        Ok(())
    }
}
