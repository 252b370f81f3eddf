//! Deoptimization driver.
//!
//! Replaces one compiled activation with the interpreter activations it
//! stands for. Both triggers, a frame marked for deoptimization and an
//! uncommon trap planted by the compiler, share one unwind:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Deoptimization Protocol                       │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  uncommon_trap ──▶ trap history + policy ──┐                         │
//! │                                            ▼                         │
//! │  deopt handler ────────────────▶ fetch_unroll_info                   │
//! │                                   1. in-deopt counter += 1           │
//! │                                   2. locate frame, decode scopes     │
//! │                                   3. reallocate eliminated objects   │
//! │                                   4. reassign their fields           │
//! │                                   5. relock elided monitors          │
//! │                                   6. capture the vframe array        │
//! │                                   7. frame sizes, caller adjustment  │
//! │                                            │ UnrollBlock             │
//! │                                            ▼                         │
//! │                                   8. trampoline pushes skeletal      │
//! │                                      interpreter frames              │
//! │                                            │                         │
//! │                                            ▼                         │
//! │                                   unpack_frames                      │
//! │                                   9. fill frames, counter -= 1,      │
//! │                                      raise deferred OutOfMemory      │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Trap history and policy only decide what happens to the compiled code;
//! the unwind itself is identical for both triggers.

pub mod realloc;
pub mod stats;
pub mod trampoline;
pub mod trap;
pub mod unroll;

pub use realloc::{FrameValues, ReallocatedObjects};
pub use stats::{DeoptCounters, DeoptSiteKey, SiteSnapshot};
pub use trampoline::DeoptBlob;
pub use trap::{
    DeoptAction, DeoptReason, TrapDecision, TrapHistory, TrapPolicy, TrapQuery, TrapRequest, TrapState,
};
pub use unroll::{ExecMode, UnrollBlock};

use crate::geometry::CallerKind;
use crate::interpreter::{CALL_STUB_ARGUMENT_WORDS, CALL_STUB_PC, DEOPT_HANDLER_PC, is_interpreter_pc};
use crate::runtime::{CodeKind, Runtime};
use crate::stack::Frame;
use crate::thread::{JavaThread, PendingException};
use crate::vframe_array::{MonitorInfo, VFrameArray};
use kiln_code::{CompiledMethod, IsAlive, PcDesc, PostponedIcs, ScopeDesc, UnloadingStats};
use kiln_core::{BasicType, KilnError, KilnResult, ObjRef};
use realloc::{realloc_objects, reassign_fields, relock_eliminated, revoke_biases};
use smallvec::{SmallVec, smallvec};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Deoptimizer
// =============================================================================

/// Entry points of the deoptimization runtime.
#[derive(Debug)]
pub struct Deoptimizer {
    rt: Arc<Runtime>,
    history: TrapHistory,
    counters: DeoptCounters,
}

impl Deoptimizer {
    pub fn new(rt: Arc<Runtime>) -> Self {
        Self {
            rt,
            history: TrapHistory::new(),
            counters: DeoptCounters::new(),
        }
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    #[inline]
    pub fn history(&self) -> &TrapHistory {
        &self.history
    }

    #[inline]
    pub fn counters(&self) -> &DeoptCounters {
        &self.counters
    }

    // =========================================================================
    // Two-phase unwind
    // =========================================================================

    /// First phase: capture the youngest compiled frame of `thread` and plan
    /// its replacement.
    ///
    /// On success the thread stays marked as inside the deoptimization
    /// handler until [`unpack_frames`](Self::unpack_frames).
    pub fn fetch_unroll_info(&self, thread: &mut JavaThread, mode: ExecMode) -> KilnResult<UnrollBlock> {
        thread.inc_in_deopt_handler();
        let result = self.fetch_unroll_info_helper(thread, mode, None);
        if result.is_err() {
            thread.dec_in_deopt_handler();
        }
        result
    }

    /// Second phase: fill the skeletal interpreter frames the trampoline
    /// pushed and return the kind of value live in the return registers.
    ///
    /// If any eliminated object could not be reallocated, an
    /// [`PendingException::OutOfMemory`] is left pending on the thread for
    /// the interpreter to throw.
    pub fn unpack_frames(&self, thread: &mut JavaThread, mode: ExecMode) -> KilnResult<BasicType> {
        let mut array = thread.take_vframe_array().ok_or(KilnError::NoPendingUnroll(thread.id()))?;
        let n = array.frames();

        let geometry = self.rt.geometry();
        let mut skeletal: SmallVec<[Frame; 4]> = SmallVec::with_capacity(n);
        let mut frame = thread.last_frame();
        for i in 0..n {
            skeletal.push(frame);
            if i + 1 < n {
                frame = geometry
                    .sender(thread.stack(), frame)
                    .ok_or(KilnError::NotDeoptimizable { fp: frame.fp })?;
            }
        }
        skeletal.reverse();

        array.unpack_to_stack(&self.rt, thread, &skeletal, mode);
        debug_assert_eq!(array.verify(geometry), Ok(()));
        thread.dec_in_deopt_handler();

        let failed = array.realloc_failures();
        if failed > 0 {
            warn!(thread = %thread.id(), failed, "deferring out of memory until frames are rebuilt");
            thread.set_pending_exception(PendingException::OutOfMemory { failed });
        }
        self.counters.record_frames_unpacked(n);
        debug!(thread = %thread.id(), frames = n, %mode, "unpacked frames");
        Ok(array.return_type())
    }

    fn fetch_unroll_info_helper(
        &self,
        thread: &mut JavaThread,
        mode: ExecMode,
        trap_decision: Option<TrapDecision>,
    ) -> KilnResult<UnrollBlock> {
        let (frame, pc, nm) = self.deoptee(thread)?;
        let (desc, scope) = decode_scope(&nm, pc);
        let geometry = self.rt.geometry();
        let caller = geometry
            .sender(thread.stack(), frame)
            .ok_or(KilnError::NotDeoptimizable { fp: frame.fp })?;

        let registers = *thread.registers();
        let values = FrameValues::new(thread.stack(), frame.sender_sp() - nm.frame_size(), &registers);

        let objects = scope.objects();
        let realloc = if objects.is_empty() {
            ReallocatedObjects::new()
        } else {
            let _nsv = thread.no_safepoint_scope();
            let realloc = realloc_objects(self.rt.heap(), thread, objects);
            reassign_fields(self.rt.heap(), objects, &values, &realloc);
            realloc
        };
        if realloc.failures() > 0 {
            self.counters.record_realloc_failures(realloc.failures());
        }

        let mut array = VFrameArray::capture(
            thread.id(),
            nm.id(),
            scope,
            frame,
            caller,
            nm.frame_size(),
            &values,
            &registers,
            &realloc,
        );
        for elem in array.elements_mut() {
            relock_eliminated(self.rt.monitors(), thread.id(), elem.monitors_mut());
        }
        let return_type = if desc.return_oop() { BasicType::Object } else { BasicType::Void };
        array.set_return_type(return_type);

        let Some(outermost) = array.elements().last() else {
            panic!("{}: empty scope chain at pc {pc:#x}", nm.id());
        };
        let caller_actual_parameters = outermost.method().size_of_parameters();
        let caller_adjustment = geometry.caller_adjustment(
            self.caller_kind(thread, caller),
            caller_actual_parameters,
            outermost.method().max_locals(),
        );
        let frame_sizes = array.frame_sizes(geometry);
        let mut frame_pcs: SmallVec<[usize; 5]> = smallvec![caller.pc];
        frame_pcs.extend(array.resume_pcs(mode));

        let block = UnrollBlock {
            size_of_deoptimized_frame: frame.size(),
            caller_adjustment,
            caller_actual_parameters,
            number_of_frames: array.frames(),
            frame_sizes,
            frame_pcs,
            unpack_kind: mode,
            return_type,
            trap_decision,
        };
        debug_assert_eq!(block.verify(), Ok(()));

        info!(
            thread = %thread.id(),
            nm = %nm.id(),
            method = %nm.method().id(),
            bci = scope_bci(&array),
            frames = block.number_of_frames,
            %mode,
            "deoptimizing compiled frame"
        );
        thread.set_vframe_array(array);
        self.counters.record_deoptimization();
        Ok(block)
    }

    /// The youngest frame, its real pc and its compiled method.
    fn deoptee(&self, thread: &JavaThread) -> KilnResult<(Frame, usize, Arc<CompiledMethod>)> {
        if !thread.has_java_frames() {
            return Err(KilnError::NoLastJavaFrame(thread.id()));
        }
        let frame = thread.last_frame();
        let pc = self.resolve_pc(thread, frame)?;
        Ok((frame, pc, self.compiled_at(frame, pc)?))
    }

    /// The pc a frame really stopped at, looking through a deopt patch.
    fn resolve_pc(&self, thread: &JavaThread, frame: Frame) -> KilnResult<usize> {
        if frame.pc == DEOPT_HANDLER_PC {
            thread.original_pc(frame.fp).ok_or(KilnError::NotDeoptimizable { fp: frame.fp })
        } else {
            Ok(frame.pc)
        }
    }

    /// Where the caller of a deoptimized frame keeps its callee's arguments.
    fn caller_kind(&self, thread: &JavaThread, caller: Frame) -> CallerKind {
        let pc = self.resolve_pc(thread, caller).unwrap_or(caller.pc);
        if is_interpreter_pc(pc) {
            return CallerKind::Interpreted;
        }
        let outgoing_words = if pc == CALL_STUB_PC {
            CALL_STUB_ARGUMENT_WORDS
        } else if let CodeKind::Compiled(nm) = self.rt.code_kind(pc) {
            nm.outgoing_area()
        } else {
            0
        };
        CallerKind::Compiled { outgoing_words }
    }

    fn compiled_at(&self, frame: Frame, pc: usize) -> KilnResult<Arc<CompiledMethod>> {
        match self.rt.code_kind(pc) {
            CodeKind::Compiled(nm) if !nm.is_native_method() => Ok(nm),
            _ => Err(KilnError::NotDeoptimizable { fp: frame.fp }),
        }
    }

    // =========================================================================
    // Marking frames
    // =========================================================================

    /// Arrange for `frame` to be deoptimized when control returns to it.
    ///
    /// The frame's return address is patched to the deoptimization handler
    /// and the original pc remembered. Biases on objects the frame holds
    /// locked are revoked now, while the owning frame is still compiled.
    pub fn deoptimize(&self, thread: &mut JavaThread, frame: Frame) -> KilnResult<()> {
        if frame.pc == DEOPT_HANDLER_PC && thread.original_pc(frame.fp).is_some() {
            return Ok(());
        }
        let pc = frame.pc;
        let nm = self.compiled_at(frame, pc)?;
        let desc = nm.pc_desc_at(pc).copied().ok_or(KilnError::NotDeoptimizable { fp: frame.fp })?;

        let revoked = match nm.debug_info().scope_at(&desc) {
            Some(scope) => {
                let registers = *thread.registers();
                let values = FrameValues::new(thread.stack(), frame.sender_sp() - nm.frame_size(), &registers);
                let none = ReallocatedObjects::new();
                let held: SmallVec<[MonitorInfo; 4]> = scope
                    .chain()
                    .flat_map(|s| s.monitors().iter())
                    .filter(|m| !m.eliminated)
                    .map(|m| MonitorInfo {
                        owner: values.slot(&m.owner, &none).as_ref().unwrap_or(ObjRef::NULL),
                        lock_word: 0,
                        eliminated: false,
                    })
                    .collect();
                revoke_biases(self.rt.monitors(), &held)
            }
            None => 0,
        };

        self.patch_return_pc(thread, frame, DEOPT_HANDLER_PC)?;
        thread.mark_for_deopt(frame.fp, pc);
        info!(
            thread = %thread.id(),
            nm = %nm.id(),
            method = %nm.method().id(),
            fp = frame.fp,
            revoked,
            "marked frame for deoptimization"
        );
        Ok(())
    }

    /// Deoptimize the frame with the given id (its frame pointer).
    ///
    /// Taking the thread mutably stands for the handshake that stops the
    /// target thread first.
    pub fn deoptimize_frame(&self, thread: &mut JavaThread, id: usize) -> KilnResult<()> {
        let frame = self
            .find_frame(thread, id)
            .ok_or(KilnError::InvalidFrameId { thread: thread.id(), id })?;
        self.deoptimize(thread, frame)
    }

    fn find_frame(&self, thread: &JavaThread, id: usize) -> Option<Frame> {
        let geometry = self.rt.geometry();
        let mut frame = thread.last_frame();
        loop {
            if frame.id() == id {
                return Some(frame);
            }
            let sender = geometry.sender(thread.stack(), frame)?;
            if sender.fp <= frame.fp {
                return None;
            }
            frame = sender;
        }
    }

    /// Replace the return address through which `target` is resumed.
    fn patch_return_pc(&self, thread: &mut JavaThread, target: Frame, pc: usize) -> KilnResult<()> {
        let last = thread.last_frame();
        if last.fp == target.fp {
            thread.set_last_frame(Frame { pc, ..last });
            return Ok(());
        }
        let geometry = self.rt.geometry();
        let mut callee = last;
        loop {
            let sender = geometry
                .sender(thread.stack(), callee)
                .filter(|s| s.fp > callee.fp)
                .ok_or(KilnError::InvalidFrameId {
                    thread: thread.id(),
                    id: target.id(),
                })?;
            if sender.fp == target.fp {
                thread.stack_mut().write(callee.fp + 1, pc as u64);
                return Ok(());
            }
            callee = sender;
        }
    }

    // =========================================================================
    // Uncommon traps
    // =========================================================================

    /// Handle an uncommon trap in the youngest frame of `thread`.
    ///
    /// Records the trap, applies the policy to the compiled code and plans
    /// the unwind, which always re-executes the trapping bytecode.
    pub fn uncommon_trap(&self, thread: &mut JavaThread, request: i32) -> KilnResult<UnrollBlock> {
        thread.inc_in_deopt_handler();
        let result = self
            .uncommon_trap_inner(thread, request)
            .and_then(|decision| self.fetch_unroll_info_helper(thread, ExecMode::UncommonTrap, Some(decision)));
        if result.is_err() {
            thread.dec_in_deopt_handler();
        }
        result
    }

    fn uncommon_trap_inner(&self, thread: &JavaThread, request: i32) -> KilnResult<TrapDecision> {
        let req = TrapRequest::decode(request).ok_or(KilnError::InvalidTrapRequest(request))?;
        let (_, pc, nm) = self.deoptee(thread)?;
        let (_, scope) = decode_scope(&nm, pc);
        let trap_method = scope.method().clone();
        let trap_bci = scope.bci();

        self.counters.record_trap(nm.id(), trap_bci, req.reason, req.action);
        info!(
            thread = %thread.id(),
            nm = %nm.id(),
            method = %trap_method.id(),
            bci = trap_bci,
            reason = %req.reason,
            action = ?req.action,
            "uncommon trap"
        );

        let query = (req.action != DeoptAction::None)
            .then(|| self.history.query_update(trap_method.id(), trap_bci, req.reason));
        let policy = TrapPolicy::decide(
            self.rt.config(),
            req.action,
            query.as_ref(),
            nm.method().decompile_count(),
        );

        if policy.make_not_entrant {
            if !nm.make_not_entrant() {
                // Another activation already invalidated this code and owns
                // the recompile bookkeeping.
                self.counters.record_lost_invalidation();
                self.counters.record_decision(TrapDecision::Ignore);
                debug!(method = %trap_method.id(), nm = %nm.id(), "code already not entrant");
                return Ok(TrapDecision::Ignore);
            }
            if req.reason.recorded_per_bytecode_if_any().is_some() {
                self.history.record_recompile(trap_method.id(), trap_bci);
            }
        }
        if policy.inc_recompile_count {
            let overflow = self.history.inc_overflow_recompiles(trap_method.id());
            debug!(method = %trap_method.id(), overflow, "recompile after repeated traps");
        }
        if policy.reprofile {
            trap_method.reset_counters();
        }
        if policy.make_not_compilable && trap_method.set_not_compilable() {
            warn!(method = %trap_method.id(), reason = %req.reason, "method made not compilable");
        }

        let decision = policy.decision();
        self.counters.record_decision(decision);
        debug!(method = %trap_method.id(), bci = trap_bci, %decision, "trap decision");
        Ok(decision)
    }

    // =========================================================================
    // Unloading
    // =========================================================================

    /// Unload dead code and clean inline caches in one pass at a global pause.
    pub fn do_unloading(&self, is_alive: &dyn IsAlive) -> UnloadingStats {
        self.rt.code_cache().do_unloading(is_alive)
    }

    /// First pass of two-phase unloading.
    pub fn do_unloading_parallel(&self, is_alive: &(dyn IsAlive + Sync), workers: usize) -> (PostponedIcs, UnloadingStats) {
        self.rt.code_cache().do_unloading_parallel(is_alive, workers)
    }

    /// Second pass of two-phase unloading.
    pub fn do_unloading_parallel_postponed(&self, postponed: PostponedIcs) -> usize {
        self.rt.code_cache().do_unloading_parallel_postponed(postponed)
    }
}

/// Descriptor and innermost scope at `pc`.
///
/// # Panics
///
/// Panics when nothing was recorded for `pc`: the frame stopped where the
/// compiler promised it never would.
fn decode_scope(nm: &CompiledMethod, pc: usize) -> (PcDesc, ScopeDesc<'_>) {
    let Some(desc) = nm.pc_desc_at(pc).copied() else {
        panic!("{}: no pc descriptor at {pc:#x}", nm.id());
    };
    let Some(scope) = nm.debug_info().scope_at(&desc) else {
        panic!("{}: no scope recorded for pc {pc:#x}", nm.id());
    };
    (desc, scope)
}

fn scope_bci(array: &VFrameArray) -> i32 {
    array.element(0).map_or(0, |e| e.raw_bci())
}
