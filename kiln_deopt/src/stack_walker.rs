//! Java stack walking, synchronous and asynchronous.
//!
//! [`StackWalker`] steps through a thread's Java frames, expanding each
//! compiled frame into its inlined logical frames. An asynchronous walk
//! (a profiler sampling a thread it interrupted at an arbitrary
//! instruction) cannot trust the stack: it refuses to walk while a
//! collection or deoptimization is in flight, skips a bounded number of
//! native frames looking for Java code, validates every frame before
//! reporting it, and stops at the first frame whose caller link looks
//! wrong.
//!
//! # States
//!
//! ```text
//!            ┌─────────────┐
//!            │    Start    │
//!            └──────┬──────┘
//!                   │ start()
//!    ┌──────────────┼───────────────┬───────────────────┐
//!    ▼              ▼               ▼                   ▼
//! GcActive    DeoptActive     NoJavaFrame     Interpreted / Compiled / Native
//!                                                       │ next()
//!                                   ┌───────────────────┤
//!                                   ▼                   ▼
//!                     CFrame / Indecipherable         End
//! ```

use crate::runtime::{CodeKind, Runtime};
use crate::stack::Frame;
use crate::thread::JavaThread;
use kiln_code::CompiledMethod;
use kiln_core::{Bci, Method, MethodId, normalize_bci};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Where a walk currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalkState {
    /// Not yet positioned.
    Start,
    InterpretedFrame,
    /// A logical frame of compiled code, possibly inlined.
    CompiledFrame,
    /// Compiled wrapper of a native method.
    NativeFrame,
    /// A non-Java frame between Java frames.
    CFrame,
    /// A frame that looked like Java but failed validation. Ends the walk.
    IndecipherableFrame,
    /// A collection is running; the stack was not examined.
    GcActive,
    /// The thread is between deoptimization phases; its frames are in flux.
    DeoptActive,
    /// No Java frame within the native-frame skip limit.
    NoJavaFrame,
    End,
}

impl WalkState {
    /// The walker is positioned on a Java frame.
    #[inline]
    pub const fn is_java(self) -> bool {
        matches!(
            self,
            WalkState::InterpretedFrame | WalkState::CompiledFrame | WalkState::NativeFrame
        )
    }

    /// No further frames will be produced.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            WalkState::IndecipherableFrame
                | WalkState::GcActive
                | WalkState::DeoptActive
                | WalkState::NoJavaFrame
                | WalkState::End
        )
    }

    /// Terminal state reported before any frame was examined.
    #[inline]
    pub const fn is_error(self) -> bool {
        matches!(self, WalkState::GcActive | WalkState::DeoptActive | WalkState::NoJavaFrame)
    }
}

impl fmt::Display for WalkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WalkState::Start => "start",
            WalkState::InterpretedFrame => "interpreted",
            WalkState::CompiledFrame => "compiled",
            WalkState::NativeFrame => "native",
            WalkState::CFrame => "c-frame",
            WalkState::IndecipherableFrame => "indecipherable",
            WalkState::GcActive => "gc-active",
            WalkState::DeoptActive => "deopt-active",
            WalkState::NoJavaFrame => "no-java-frame",
            WalkState::End => "end",
        };
        f.write_str(name)
    }
}

/// One Java frame reported by a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    pub method: MethodId,
    /// Normalized bci; the synchronization entry reports as 0.
    pub bci: Bci,
    pub state: WalkState,
}

/// Position inside the inlined scopes of one compiled frame.
struct InlineCursor {
    nm: Arc<CompiledMethod>,
    decode_offset: i32,
}

// =============================================================================
// StackWalker
// =============================================================================

/// Walks the Java frames of one thread.
pub struct StackWalker<'a> {
    rt: &'a Runtime,
    thread: &'a JavaThread,
    is_async: bool,
    state: WalkState,
    frame: Frame,
    inline: Option<InlineCursor>,
    method: Option<Arc<Method>>,
    bci: Bci,
    frames_walked: usize,
    frames_scanned: usize,
}

impl<'a> StackWalker<'a> {
    /// Walker for the current thread at a well-defined point.
    pub fn new(rt: &'a Runtime, thread: &'a JavaThread) -> Self {
        Self {
            rt,
            thread,
            is_async: false,
            state: WalkState::Start,
            frame: thread.last_frame(),
            inline: None,
            method: None,
            bci: 0,
            frames_walked: 0,
            frames_scanned: 0,
        }
    }

    /// Walker for a thread interrupted at an arbitrary instruction.
    pub fn new_async(rt: &'a Runtime, thread: &'a JavaThread) -> Self {
        Self {
            is_async: true,
            ..Self::new(rt, thread)
        }
    }

    #[inline]
    pub fn state(&self) -> WalkState {
        self.state
    }

    /// Physical frame of the current position.
    #[inline]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    #[inline]
    pub fn method(&self) -> Option<&Arc<Method>> {
        self.method.as_ref()
    }

    /// Bci of the current logical frame, normalized.
    #[inline]
    pub fn bci(&self) -> Bci {
        normalize_bci(self.bci)
    }

    /// Physical frames examined so far.
    #[inline]
    pub fn frames_scanned(&self) -> usize {
        self.frames_scanned
    }

    /// Position on the first Java frame.
    pub fn start(&mut self) -> WalkState {
        if self.state != WalkState::Start {
            return self.state;
        }
        if self.is_async {
            if self.rt.is_gc_active() {
                return self.finish(WalkState::GcActive);
            }
            if self.thread.in_deopt_handler() > 0 {
                return self.finish(WalkState::DeoptActive);
            }
        }

        let geometry = self.rt.geometry();
        let stack = self.thread.stack();
        let limit = self.rt.config().max_c_frames_skip;
        let mut skipped = 0;
        loop {
            self.frames_scanned += 1;
            let state = self.classify();
            if state.is_java() || state == WalkState::IndecipherableFrame {
                return self.enter(state);
            }
            if skipped == limit {
                trace!(thread = %self.thread.id(), skipped, "no Java frame within skip limit");
                return self.finish(WalkState::NoJavaFrame);
            }
            skipped += 1;
            if !geometry.is_safe_for_sender(stack, self.frame) {
                return self.finish(WalkState::End);
            }
            match geometry.sender(stack, self.frame) {
                Some(sender) => self.frame = sender,
                None => return self.finish(WalkState::NoJavaFrame),
            }
        }
    }

    /// Advance to the next frame, logical or physical.
    pub fn next(&mut self) -> WalkState {
        match self.state {
            WalkState::Start => return self.start(),
            s if s.is_terminal() => return s,
            _ => {}
        }
        if self.frames_walked >= self.rt.config().max_walk_depth {
            return self.finish(WalkState::End);
        }

        if let Some(cursor) = &self.inline {
            let next = cursor
                .nm
                .debug_info()
                .scope(cursor.decode_offset)
                .and_then(|record| cursor.nm.debug_info().scope(record.sender).map(|r| (record.sender, r)));
            if let Some((offset, record)) = next {
                self.method = Some(record.method.clone());
                self.bci = record.bci;
                if let Some(cursor) = &mut self.inline {
                    cursor.decode_offset = offset;
                }
                return self.enter(WalkState::CompiledFrame);
            }
        }

        let geometry = self.rt.geometry();
        let stack = self.thread.stack();
        if !geometry.is_safe_for_sender(stack, self.frame) {
            return self.finish(WalkState::End);
        }
        let Some(sender) = geometry.sender(stack, self.frame) else {
            return self.finish(WalkState::End);
        };
        self.frame = sender;
        self.frames_scanned += 1;
        let state = self.classify();
        self.enter(state)
    }

    /// Walk every remaining frame and collect the Java ones.
    ///
    /// Returns the terminal state as an error when the walk could not
    /// start.
    pub fn collect(mut self, max_depth: usize) -> Result<Vec<CallFrame>, WalkState> {
        let mut frames = Vec::new();
        let mut state = self.start();
        if state.is_error() {
            return Err(state);
        }
        while !state.is_terminal() && frames.len() < max_depth {
            if state.is_java() {
                if let Some(m) = &self.method {
                    frames.push(CallFrame {
                        method: m.id(),
                        bci: self.bci(),
                        state,
                    });
                }
            }
            state = self.next();
        }
        Ok(frames)
    }

    fn enter(&mut self, state: WalkState) -> WalkState {
        if state.is_java() {
            self.frames_walked += 1;
        }
        self.state = state;
        state
    }

    fn finish(&mut self, state: WalkState) -> WalkState {
        self.inline = None;
        self.method = None;
        self.state = state;
        state
    }

    /// Decide what the current physical frame is and load its top logical
    /// frame.
    fn classify(&mut self) -> WalkState {
        self.inline = None;
        self.method = None;
        let mut pc = self.frame.pc;
        let mut kind = self.rt.code_kind(pc);
        if let CodeKind::DeoptHandler = kind {
            match self.thread.original_pc(self.frame.fp) {
                Some(original) => {
                    pc = original;
                    kind = self.rt.code_kind(pc);
                }
                None => return WalkState::IndecipherableFrame,
            }
        }

        match kind {
            CodeKind::Interpreter => self.classify_interpreted(),
            CodeKind::Compiled(nm) => self.classify_compiled(nm, pc),
            CodeKind::DeoptHandler => WalkState::IndecipherableFrame,
            CodeKind::Native => WalkState::CFrame,
        }
    }

    fn classify_interpreted(&mut self) -> WalkState {
        let Some(state) = self.rt.geometry().interpreter_state(self.thread.stack(), self.frame) else {
            return WalkState::IndecipherableFrame;
        };
        match self.rt.method(state.method) {
            Some(m) if m.is_valid_bci(state.bci) || (state.bci == 0 && m.code_size() == 0) => {
                self.method = Some(m);
                self.bci = state.bci;
                WalkState::InterpretedFrame
            }
            _ => WalkState::IndecipherableFrame,
        }
    }

    fn classify_compiled(&mut self, nm: Arc<CompiledMethod>, pc: usize) -> WalkState {
        if nm.is_native_method() {
            self.method = Some(nm.method().clone());
            self.bci = 0;
            return WalkState::NativeFrame;
        }
        // An asynchronous sample may land between descriptors; the next
        // descriptor describes the state the code is heading to, and the
        // frame is reported at that descriptor's pc.
        let mut approximated = false;
        let desc = match nm.pc_desc_at(pc) {
            Some(desc) => Some(desc),
            None if self.is_async => {
                approximated = true;
                nm.pc_desc_near(pc)
            }
            None => None,
        };
        let Some(desc) = desc.copied() else {
            return WalkState::IndecipherableFrame;
        };
        if approximated && self.frame.pc == pc {
            self.frame.pc = nm.real_pc(&desc);
        }
        let Some(scope) = nm.debug_info().scope_at(&desc) else {
            return WalkState::IndecipherableFrame;
        };
        if !scope.method().is_valid_bci(scope.bci()) && scope.bci() != 0 {
            return WalkState::IndecipherableFrame;
        }
        self.method = Some(scope.method().clone());
        self.bci = scope.bci();
        let decode_offset = scope.decode_offset();
        self.inline = Some(InlineCursor { nm, decode_offset });
        WalkState::CompiledFrame
    }
}

/// Sample the Java call trace of `thread`, youngest first.
///
/// The sampled thread may be stopped anywhere; see [`StackWalker::new_async`].
pub fn sample_call_trace(rt: &Runtime, thread: &JavaThread, max_depth: usize) -> Result<Vec<CallFrame>, WalkState> {
    StackWalker::new_async(rt, thread).collect(max_depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ArenaHeap;
    use crate::monitors::LockTable;
    use kiln_code::{DebugInfo, PcDesc, ScopeRecord};
    use kiln_core::{ClassId, KilnConfig, Opcode, StackSlot, ThreadId};

    fn runtime(config: KilnConfig) -> Runtime {
        Runtime::new(config, Arc::new(ArenaHeap::default()), Arc::new(LockTable::new()))
    }

    fn method(id: u32) -> Arc<Method> {
        Arc::new(
            Method::new(MethodId(id), format!("m{id}"), ClassId(1), vec![Opcode::Invoke { arg_slots: 0 }; 4])
                .with_locals(1, 0)
                .with_max_stack(2),
        )
    }

    /// outer(bci 2) inlines inner(bci 1), at pc offset 0x20.
    fn install_inlined(rt: &Runtime) -> Arc<CompiledMethod> {
        let outer = method(1);
        let inner = method(2);
        let mut info = DebugInfo::new();
        let o = info.add_scope(ScopeRecord::new(outer.clone(), 2));
        let i = info.add_scope(ScopeRecord::new(inner, 1).with_sender(o));
        let id = rt.code_cache().next_id();
        rt.install(
            CompiledMethod::new(id, outer, 0x100_0000, 0x100)
                .with_pc_descs(vec![PcDesc::new(0x20, i, -1), PcDesc::new(0x40, o, -1)])
                .with_debug_info(info)
                .with_frame_size(4),
        )
    }

    #[test]
    fn test_sync_walk_expands_inlining() {
        let rt = runtime(KilnConfig::default());
        let nm = install_inlined(&rt);
        let caller = method(3);
        rt.register_method(caller.clone());
        let mut t = JavaThread::with_stack_words(ThreadId(1), 256);
        t.push_interpreted_frame(rt.geometry(), &caller, 3, &[StackSlot::Int(0)], &[], &[]).unwrap();
        t.push_compiled_frame(&nm, nm.code_begin() + 0x20, &[]).unwrap();

        let frames = StackWalker::new(&rt, &t).collect(16).unwrap();
        let got: Vec<_> = frames.iter().map(|f| (f.method.0, f.bci, f.state)).collect();
        assert_eq!(
            got,
            vec![
                (2, 1, WalkState::CompiledFrame),
                (1, 2, WalkState::CompiledFrame),
                (3, 3, WalkState::InterpretedFrame),
            ]
        );
    }

    #[test]
    fn test_gc_active_refuses() {
        let rt = runtime(KilnConfig::default());
        let t = JavaThread::with_stack_words(ThreadId(1), 64);
        rt.set_gc_active(true);
        assert_eq!(sample_call_trace(&rt, &t, 8), Err(WalkState::GcActive));
        // synchronous walks do not consult the collector flag
        assert_eq!(StackWalker::new(&rt, &t).start(), WalkState::NoJavaFrame);
    }

    #[test]
    fn test_deopt_in_progress_refuses() {
        let rt = runtime(KilnConfig::default());
        let t = JavaThread::with_stack_words(ThreadId(1), 64);
        t.inc_in_deopt_handler();
        assert_eq!(sample_call_trace(&rt, &t, 8), Err(WalkState::DeoptActive));
    }

    #[test]
    fn test_skips_native_frames_within_limit() {
        let rt = runtime(KilnConfig {
            max_c_frames_skip: 3,
            ..Default::default()
        });
        let nm = install_inlined(&rt);
        let mut t = JavaThread::with_stack_words(ThreadId(1), 256);
        t.push_compiled_frame(&nm, nm.code_begin() + 0x40, &[]).unwrap();
        for _ in 0..3 {
            t.push_native_frame(0x5000, 1).unwrap();
        }
        let frames = sample_call_trace(&rt, &t, 8).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].method, MethodId(1));
    }

    #[test]
    fn test_async_uses_approximate_lookup() {
        let rt = runtime(KilnConfig::default());
        let nm = install_inlined(&rt);
        let mut t = JavaThread::with_stack_words(ThreadId(1), 256);
        t.push_compiled_frame(&nm, nm.code_begin() + 0x31, &[]).unwrap();
        assert_eq!(StackWalker::new(&rt, &t).start(), WalkState::IndecipherableFrame);
        let frames = sample_call_trace(&rt, &t, 8).unwrap();
        assert_eq!(frames[0].bci, 2);
    }

    #[test]
    fn test_async_reports_descriptor_pc() {
        let rt = runtime(KilnConfig::default());
        let nm = install_inlined(&rt);
        let mut t = JavaThread::with_stack_words(ThreadId(1), 256);
        let pushed = t.push_compiled_frame(&nm, nm.code_begin() + 0x31, &[]).unwrap();
        let mut w = StackWalker::new_async(&rt, &t);
        assert_eq!(w.start(), WalkState::CompiledFrame);
        assert_eq!(w.frame().pc, nm.code_begin() + 0x40);
        assert_eq!((w.frame().sp, w.frame().fp), (pushed.sp, pushed.fp));
        // the thread's own view is unchanged
        assert_eq!(t.last_frame().pc, nm.code_begin() + 0x31);

        // an exact hit is left alone
        let mut t = JavaThread::with_stack_words(ThreadId(2), 256);
        t.push_compiled_frame(&nm, nm.code_begin() + 0x20, &[]).unwrap();
        let mut w = StackWalker::new_async(&rt, &t);
        assert_eq!(w.start(), WalkState::CompiledFrame);
        assert_eq!(w.frame().pc, nm.code_begin() + 0x20);
    }

    #[test]
    fn test_bogus_interpreter_frame_is_indecipherable() {
        let rt = runtime(KilnConfig::default());
        let m = method(7);
        let mut t = JavaThread::with_stack_words(ThreadId(1), 256);
        // method 7 is never registered
        t.push_interpreted_frame(rt.geometry(), &m, 0, &[], &[], &[]).unwrap();
        let mut w = StackWalker::new_async(&rt, &t);
        assert_eq!(w.start(), WalkState::IndecipherableFrame);
        assert_eq!(w.next(), WalkState::IndecipherableFrame);
    }

    #[test]
    fn test_walk_depth_bounded() {
        let rt = runtime(KilnConfig {
            max_walk_depth: 2,
            ..Default::default()
        });
        let nm = install_inlined(&rt);
        let mut t = JavaThread::with_stack_words(ThreadId(1), 256);
        for _ in 0..4 {
            t.push_compiled_frame(&nm, nm.code_begin() + 0x40, &[]).unwrap();
        }
        let frames = StackWalker::new(&rt, &t).collect(16).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_c_frames_between_java_frames() {
        let rt = runtime(KilnConfig::default());
        let nm = install_inlined(&rt);
        let mut t = JavaThread::with_stack_words(ThreadId(1), 256);
        t.push_compiled_frame(&nm, nm.code_begin() + 0x40, &[]).unwrap();
        t.push_native_frame(0x5000, 2).unwrap();
        t.push_compiled_frame(&nm, nm.code_begin() + 0x40, &[]).unwrap();
        let mut w = StackWalker::new(&rt, &t);
        assert_eq!(w.start(), WalkState::CompiledFrame);
        assert_eq!(w.next(), WalkState::CFrame);
        assert_eq!(w.next(), WalkState::CompiledFrame);
        assert_eq!(w.next(), WalkState::CFrame); // entry frame
        assert_eq!(w.next(), WalkState::End);
    }
}
