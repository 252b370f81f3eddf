//! Java threads as seen by the deoptimization runtime.
//!
//! A [`JavaThread`] owns its stack, the anchor of its youngest frame, the
//! callee-saved registers captured at the last trap, and the per-thread
//! state the deoptimization protocol threads through its phases:
//!
//! - the in-deopt counter, raised between `fetch_unroll_info` and
//!   `unpack_frames` so asynchronous samplers back off
//! - the pending [`VFrameArray`] handed from the first phase to the second
//! - deferred exceptions raised once the interpreter frames exist
//! - the original pcs of frames patched for lazy deoptimization
//!
//! The frame pushing helpers build the same frames compiled code, the
//! interpreter and native stubs would, so a stack can be assembled and
//! then walked or deoptimized.

use crate::geometry::{ActivationShape, CallerKind, FrameGeometry};
use crate::interpreter::{CALL_STUB_ARGUMENT_WORDS, CALL_STUB_PC, InterpreterEntry, is_interpreter_pc};
use crate::stack::{Frame, RegisterMap, ThreadStack};
use crate::vframe_array::VFrameArray;
use kiln_code::CompiledMethod;
use kiln_core::{Bci, KilnResult, Method, ObjRef, StackSlot, ThreadId};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Stack size of a thread created with [`JavaThread::new`].
pub const DEFAULT_STACK_WORDS: usize = 64 * 1024;

/// An exception waiting to be dispatched by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingException {
    /// Reallocation of eliminated objects failed during deoptimization.
    OutOfMemory { failed: usize },
    /// An ordinary thrown object.
    Thrown(ObjRef),
}

// =============================================================================
// NoSafepointScope
// =============================================================================

/// Marks a region in which the thread must not stop for a safepoint.
///
/// Eliminated objects are reallocated and filled inside such a region:
/// until their fields are written they hold garbage a collector must never
/// see. A [`JavaThread::safepoint_poll`] inside the scope panics in debug
/// builds.
#[must_use = "the scope ends when the guard is dropped"]
pub struct NoSafepointScope<'a> {
    depth: &'a AtomicU32,
}

impl Drop for NoSafepointScope<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }
}

// =============================================================================
// JavaThread
// =============================================================================

/// A mutator thread and its stack.
pub struct JavaThread {
    id: ThreadId,
    stack: ThreadStack,
    last_frame: Frame,
    registers: RegisterMap,
    in_deopt_handler: AtomicU32,
    no_safepoint_depth: AtomicU32,
    vframe_array: Option<VFrameArray>,
    pending_exception: Option<PendingException>,
    /// fp of a frame patched for lazy deoptimization → its original pc.
    deopt_marks: FxHashMap<usize, usize>,
}

impl std::fmt::Debug for JavaThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JavaThread")
            .field("id", &self.id)
            .field("last_frame", &self.last_frame)
            .field("in_deopt_handler", &self.in_deopt_handler())
            .finish_non_exhaustive()
    }
}

impl JavaThread {
    pub fn new(id: ThreadId) -> Self {
        Self::with_stack_words(id, DEFAULT_STACK_WORDS)
    }

    /// Create a thread whose stack holds `words` words, starting with the
    /// entry frame of the call stub and its argument area.
    ///
    /// # Panics
    ///
    /// Panics if `words` cannot hold the entry frame.
    pub fn with_stack_words(id: ThreadId, words: usize) -> Self {
        let mut stack = ThreadStack::new(words);
        let fp = stack.push_link(stack.top(), 0, 0);
        let sp = fp - CALL_STUB_ARGUMENT_WORDS;
        assert!(sp >= stack.origin(), "thread {id}: stack of {words} words holds no entry frame");
        stack.set_sp(sp);
        Self {
            id,
            stack,
            last_frame: Frame::new(sp, fp, CALL_STUB_PC),
            registers: RegisterMap::new(),
            in_deopt_handler: AtomicU32::new(0),
            no_safepoint_depth: AtomicU32::new(0),
            vframe_array: None,
            pending_exception: None,
            deopt_marks: FxHashMap::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn stack(&self) -> &ThreadStack {
        &self.stack
    }

    #[inline]
    pub fn stack_mut(&mut self) -> &mut ThreadStack {
        &mut self.stack
    }

    /// The youngest frame.
    #[inline]
    pub fn last_frame(&self) -> Frame {
        self.last_frame
    }

    /// Only the call stub's entry frame is on the stack.
    #[inline]
    pub fn has_java_frames(&self) -> bool {
        self.last_frame.pc != CALL_STUB_PC
    }

    /// Make `frame` the youngest frame and move the stack pointer to it.
    pub fn set_last_frame(&mut self, frame: Frame) {
        self.stack.set_sp(frame.sp);
        self.last_frame = frame;
    }

    #[inline]
    pub fn registers(&self) -> &RegisterMap {
        &self.registers
    }

    #[inline]
    pub fn registers_mut(&mut self) -> &mut RegisterMap {
        &mut self.registers
    }

    // =========================================================================
    // Deoptimization state
    // =========================================================================

    /// Non-zero while this thread is between the two deoptimization phases.
    #[inline]
    pub fn in_deopt_handler(&self) -> u32 {
        self.in_deopt_handler.load(Ordering::Acquire)
    }

    pub(crate) fn inc_in_deopt_handler(&self) {
        self.in_deopt_handler.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_in_deopt_handler(&self) {
        let prev = self.in_deopt_handler.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "thread {}: in-deopt counter underflow", self.id);
    }

    /// # Panics
    ///
    /// Panics if the array of an earlier deoptimization was never unpacked.
    pub(crate) fn set_vframe_array(&mut self, array: VFrameArray) {
        assert!(self.vframe_array.is_none(), "thread {}: vframe array already pending", self.id);
        self.vframe_array = Some(array);
    }

    pub(crate) fn take_vframe_array(&mut self) -> Option<VFrameArray> {
        self.vframe_array.take()
    }

    /// The array captured by `fetch_unroll_info`, if not yet unpacked.
    #[inline]
    pub fn vframe_array(&self) -> Option<&VFrameArray> {
        self.vframe_array.as_ref()
    }

    #[inline]
    pub fn pending_exception(&self) -> Option<PendingException> {
        self.pending_exception
    }

    pub fn set_pending_exception(&mut self, exception: PendingException) {
        self.pending_exception = Some(exception);
    }

    pub fn take_pending_exception(&mut self) -> Option<PendingException> {
        self.pending_exception.take()
    }

    pub(crate) fn mark_for_deopt(&mut self, fp: usize, original_pc: usize) {
        self.deopt_marks.insert(fp, original_pc);
    }

    pub(crate) fn clear_deopt_mark(&mut self, fp: usize) -> Option<usize> {
        self.deopt_marks.remove(&fp)
    }

    /// Original pc of a frame whose return address was patched to the
    /// deoptimization handler.
    #[inline]
    pub fn original_pc(&self, fp: usize) -> Option<usize> {
        self.deopt_marks.get(&fp).copied()
    }

    // =========================================================================
    // Safepoints
    // =========================================================================

    /// Enter a region in which this thread must not reach a safepoint.
    pub fn no_safepoint_scope(&self) -> NoSafepointScope<'_> {
        self.no_safepoint_depth.fetch_add(1, Ordering::Relaxed);
        NoSafepointScope {
            depth: &self.no_safepoint_depth,
        }
    }

    #[inline]
    pub fn in_no_safepoint_scope(&self) -> bool {
        self.no_safepoint_depth.load(Ordering::Relaxed) > 0
    }

    /// Point at which the thread could be suspended.
    ///
    /// # Panics
    ///
    /// In debug builds, panics inside a [`NoSafepointScope`].
    #[inline]
    pub fn safepoint_poll(&self) {
        if cfg!(debug_assertions) && self.in_no_safepoint_scope() {
            panic!("thread {}: safepoint poll inside a no-safepoint scope", self.id);
        }
    }

    // =========================================================================
    // Frame construction
    // =========================================================================

    /// Push a native (non-Java) frame with `body_words` words below its link.
    pub fn push_native_frame(&mut self, pc: usize, body_words: usize) -> KilnResult<Frame> {
        let caller = self.last_frame;
        let sp = self.stack.reserve(body_words + 2)?;
        let fp = self.stack.push_link(caller.sp, caller.pc, caller.fp);
        let frame = Frame::new(sp, fp, pc);
        self.set_last_frame(frame);
        Ok(frame)
    }

    /// Push a frame of `nm` stopped at `pc`, with `values` stored at word
    /// offsets from the new frame's sp.
    ///
    /// # Panics
    ///
    /// Panics if a value offset falls into the frame's outgoing area or its
    /// link words.
    pub fn push_compiled_frame(
        &mut self,
        nm: &CompiledMethod,
        pc: usize,
        values: &[(u32, StackSlot)],
    ) -> KilnResult<Frame> {
        let caller = self.last_frame;
        let size = nm.frame_size();
        let sp = self.stack.reserve(size)?;
        let fp = self.stack.push_link(caller.sp, caller.pc, caller.fp);
        for &(offset, slot) in values {
            let addr = sp + offset as usize;
            assert!(addr < fp, "{}: value offset {offset} overlaps frame link", nm.id());
            assert!(
                offset as usize >= nm.outgoing_area(),
                "{}: value offset {offset} inside outgoing area",
                nm.id()
            );
            self.stack.write_slot(addr, slot, true);
        }
        let frame = Frame::new(sp, fp, pc);
        self.set_last_frame(frame);
        Ok(frame)
    }

    /// Push an interpreter frame of `method` stopped at an invoke at `bci`.
    ///
    /// The expression stack ends with the outgoing arguments, so a callee
    /// pushed next finds its parameters in place. An interpreted caller's
    /// outgoing arguments become this frame's first locals.
    pub fn push_interpreted_frame(
        &mut self,
        geometry: &dyn FrameGeometry,
        method: &Method,
        bci: Bci,
        locals: &[StackSlot],
        expressions: &[StackSlot],
        monitors: &[(ObjRef, u64)],
    ) -> KilnResult<Frame> {
        assert!(locals.len() <= method.max_locals(), "{}: too many locals", method.name());
        let caller = self.last_frame;
        let adjustment = geometry.caller_adjustment(
            self.caller_kind(caller),
            method.size_of_parameters(),
            method.max_locals(),
        );
        let shape = ActivationShape {
            max_locals: method.max_locals(),
            max_stack: method.max_stack(),
            monitors: monitors.len(),
            temps: expressions.len(),
            callee_params: 0,
            callee_locals: 0,
            is_top: false,
        };
        let size = geometry.size_activation(&shape);
        self.stack.reserve(adjustment + size)?;

        let extended_sp = caller.sp - adjustment;
        let fp = self.stack.push_link(extended_sp, caller.pc, caller.fp);
        let frame = Frame::new(extended_sp - size, fp, InterpreterEntry::Return.pc());
        let layout = geometry.layout_activation(&mut self.stack, &shape, frame, method.id(), bci, caller.sp);
        assert_eq!(layout.stack_end, frame.sp, "{}: interpreter frame size mismatch", method.name());
        layout.fill(&mut self.stack, locals, expressions, monitors, true);
        self.set_last_frame(frame);
        Ok(frame)
    }

    /// How `caller` holds the arguments of a frame pushed on top of it,
    /// as far as the thread can tell without the code cache.
    fn caller_kind(&self, caller: Frame) -> CallerKind {
        if is_interpreter_pc(caller.pc) {
            CallerKind::Interpreted
        } else if caller.pc == CALL_STUB_PC {
            CallerKind::Compiled {
                outgoing_words: CALL_STUB_ARGUMENT_WORDS,
            }
        } else {
            CallerKind::Compiled { outgoing_words: 0 }
        }
    }

    /// Return from the youngest frame into its caller.
    ///
    /// Returns the new youngest frame, or `None` when only the entry frame
    /// is left.
    pub fn pop_frame(&mut self, geometry: &dyn FrameGeometry) -> Option<Frame> {
        let caller = geometry.sender(&self.stack, self.last_frame)?;
        self.set_last_frame(caller);
        Some(caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Word64Geometry;
    use kiln_core::{ClassId, MethodId, Opcode};

    fn method(locals: u16, params: u16) -> Method {
        Method::new(MethodId(1), "m", ClassId(1), vec![Opcode::Simple, Opcode::Invoke { arg_slots: 1 }])
            .with_locals(locals, params)
            .with_max_stack(4)
    }

    #[test]
    fn test_new_thread_has_only_entry_frame() {
        let t = JavaThread::with_stack_words(ThreadId(1), 64);
        assert!(!t.has_java_frames());
        assert_eq!(t.last_frame().size(), 2 + CALL_STUB_ARGUMENT_WORDS);
        assert!(Word64Geometry.sender(t.stack(), t.last_frame()).is_none());
    }

    #[test]
    fn test_push_and_pop_native() {
        let g = Word64Geometry;
        let mut t = JavaThread::with_stack_words(ThreadId(1), 64);
        let entry = t.last_frame();
        let f = t.push_native_frame(0x77, 3).unwrap();
        assert_eq!(f.size(), 5);
        assert_eq!(t.stack().sp(), f.sp);
        assert_eq!(t.pop_frame(&g), Some(entry));
        assert_eq!(t.pop_frame(&g), None);
    }

    #[test]
    fn test_interpreted_callee_overlaps_arguments() {
        let g = Word64Geometry;
        let mut t = JavaThread::with_stack_words(ThreadId(1), 256);
        let caller = method(2, 0);
        let callee = method(3, 2);
        let args = [StackSlot::Int(10), StackSlot::Int(20)];
        t.push_interpreted_frame(&g, &caller, 1, &[StackSlot::Int(1)], &args, &[]).unwrap();
        let f = t
            .push_interpreted_frame(&g, &callee, 0, &[args[0], args[1], StackSlot::Int(3)], &[], &[])
            .unwrap();
        let state = g.interpreter_state(t.stack(), f).unwrap();
        // local 0 is the caller's first outgoing argument
        assert_eq!(t.stack().read_slot(state.locals), Some(StackSlot::Int(10)));
        assert_eq!(t.stack().read_slot(state.locals - 1), Some(StackSlot::Int(20)));
        assert_eq!(t.stack().read_slot(state.locals - 2), Some(StackSlot::Int(3)));
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut t = JavaThread::with_stack_words(ThreadId(1), 64);
        assert!(t.push_native_frame(0x77, 64).is_err());
    }

    #[test]
    fn test_in_deopt_counter() {
        let t = JavaThread::with_stack_words(ThreadId(1), 64);
        t.inc_in_deopt_handler();
        assert_eq!(t.in_deopt_handler(), 1);
        t.dec_in_deopt_handler();
        assert_eq!(t.in_deopt_handler(), 0);
    }

    #[test]
    fn test_scope_nesting() {
        let t = JavaThread::with_stack_words(ThreadId(1), 64);
        t.safepoint_poll();
        {
            let _outer = t.no_safepoint_scope();
            let _inner = t.no_safepoint_scope();
            assert!(t.in_no_safepoint_scope());
        }
        assert!(!t.in_no_safepoint_scope());
        t.safepoint_poll();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "no-safepoint scope")]
    fn test_poll_inside_scope_panics() {
        let t = JavaThread::with_stack_words(ThreadId(1), 64);
        let _nsv = t.no_safepoint_scope();
        t.safepoint_poll();
    }
}
