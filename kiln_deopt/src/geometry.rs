//! Interpreter frame geometry.
//!
//! Everything architecture-specific about interpreter frames sits behind
//! [`FrameGeometry`]: how many words an activation needs, where its parts
//! go, and how to step from a frame to its caller. The rest of the runtime
//! only deals in [`ActivationShape`]s and [`InterpreterLayout`]s.
//!
//! # Interpreter Frame Layout (growing downward)
//!
//! ```text
//! ┌───────────────────────────────┐ High addresses
//! │     local 0                   │ ← locals (in the caller's area)
//! │     ...                       │
//! │     local max_locals-1        │
//! ├───────────────────────────────┤ ← fp + 2 (caller sp)
//! │     Return Address            │ fp + 1
//! │     Saved FP                  │ fp
//! │     Method Id                 │ fp - 1
//! │     Bci                       │ fp - 2
//! │     Locals Pointer            │ fp - 3
//! │     Sender SP                 │ fp - 4
//! │     Monitor Count             │ fp - 5
//! ├───────────────────────────────┤
//! │     Monitor 0: owner, lock    │ ← monitor base (fp - 6)
//! │     ...                       │
//! ├───────────────────────────────┤
//! │     Expression 0              │ ← expression base
//! │     ...                       │
//! │     Outgoing Arguments        │
//! ├───────────────────────────────┤
//! │     Callee Extra Locals       │
//! └───────────────────────────────┘ ← sp
//! ```
//!
//! A callee's parameters overlap the caller's outgoing arguments, so an
//! interpreted caller only reserves `callee_locals - callee_params` extra
//! words for the rest of the callee's locals. Compiled code and the call
//! stub keep an outgoing area at their sp large enough for a callee's
//! locals and need no extension.

use crate::stack::{Frame, ThreadStack};
use kiln_core::{Bci, MethodId, ObjRef, StackSlot};

// =============================================================================
// Activation Shape
// =============================================================================

/// Everything that determines the size of one interpreter activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActivationShape {
    pub max_locals: usize,
    pub max_stack: usize,
    pub monitors: usize,
    /// Live expression-stack entries, outgoing arguments excluded.
    pub temps: usize,
    /// Parameter words of the frame this one is calling. Zero for the top frame.
    pub callee_params: usize,
    /// Local words of the frame this one is calling. Zero for the top frame.
    pub callee_locals: usize,
    /// The youngest frame; reserves room for a full expression stack.
    pub is_top: bool,
}

/// Addresses of the parts of a laid-out interpreter frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterLayout {
    pub locals: usize,
    pub monitor_base: usize,
    pub expression_base: usize,
    /// Lowest word the frame may use. Must equal the frame's sp.
    pub stack_end: usize,
}

impl InterpreterLayout {
    #[inline]
    pub fn local(&self, index: usize) -> usize {
        self.locals - index
    }

    #[inline]
    pub fn expression(&self, index: usize) -> usize {
        self.expression_base - index
    }

    #[inline]
    pub fn monitor_owner(&self, index: usize) -> usize {
        self.monitor_base - 2 * index
    }

    #[inline]
    pub fn monitor_lock(&self, index: usize) -> usize {
        self.monitor_base - 2 * index - 1
    }

    /// Store locals, expressions and monitors (owner, lock word) and return
    /// the lowest address written, or `None` if nothing below the fixed
    /// words was touched.
    pub fn fill(
        &self,
        stack: &mut ThreadStack,
        locals: &[StackSlot],
        expressions: &[StackSlot],
        monitors: &[(ObjRef, u64)],
        zap: bool,
    ) -> Option<usize> {
        let mut lowest = None;
        for (i, &slot) in locals.iter().enumerate() {
            stack.write_slot(self.local(i), slot, zap);
        }
        for (k, &(owner, lock)) in monitors.iter().enumerate() {
            stack.write_slot(self.monitor_owner(k), StackSlot::Ref(owner), zap);
            stack.write(self.monitor_lock(k), lock);
            lowest = Some(self.monitor_lock(k));
        }
        for (j, &slot) in expressions.iter().enumerate() {
            stack.write_slot(self.expression(j), slot, zap);
            lowest = Some(self.expression(j));
        }
        lowest
    }
}

/// The frame directly below the outermost interpreter frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerKind {
    /// An interpreter frame whose expression stack ends with the arguments.
    Interpreted,
    /// Compiled code or a stub, with `outgoing_words` reserved at its sp.
    Compiled { outgoing_words: usize },
}

/// Fixed words of an interpreter frame as read back by a stack walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterState {
    pub method: MethodId,
    pub bci: Bci,
    pub locals: usize,
    pub sender_sp: usize,
    pub monitors: usize,
}

// =============================================================================
// FrameGeometry
// =============================================================================

/// Architecture-specific interpreter frame handling.
pub trait FrameGeometry: Send + Sync {
    /// Words one activation consumes, from its sp up to its caller's sp.
    ///
    /// Pure: depends on nothing but `shape`.
    fn size_activation(&self, shape: &ActivationShape) -> usize;

    /// Write the fixed part of an interpreter frame whose skeleton
    /// (`frame.sp`, `frame.fp` and the link words) already exists, and return
    /// where locals, monitors and expressions go.
    fn layout_activation(
        &self,
        stack: &mut ThreadStack,
        shape: &ActivationShape,
        frame: Frame,
        method: MethodId,
        bci: Bci,
        sender_sp: usize,
    ) -> InterpreterLayout;

    /// Read back the fixed words of an interpreter frame.
    fn interpreter_state(&self, stack: &ThreadStack, frame: Frame) -> Option<InterpreterState>;

    /// Whether the link words of `frame` can be trusted to reach its caller.
    fn is_safe_for_sender(&self, stack: &ThreadStack, frame: Frame) -> bool;

    /// The caller of `frame`, or `None` for the entry frame.
    fn sender(&self, stack: &ThreadStack, frame: Frame) -> Option<Frame>;

    /// Words a caller is extended by so the bottom interpreter frame's
    /// locals fit above it.
    ///
    /// An interpreted caller already holds the parameters as outgoing
    /// arguments. A compiled caller's outgoing area takes the locals whole;
    /// only an area too small for them is extended by the shortfall.
    fn caller_adjustment(&self, caller: CallerKind, callee_params: usize, callee_locals: usize) -> usize {
        match caller {
            CallerKind::Interpreted => callee_locals.saturating_sub(callee_params),
            CallerKind::Compiled { outgoing_words } => callee_locals.saturating_sub(outgoing_words),
        }
    }
}

// =============================================================================
// Word64Geometry
// =============================================================================

/// 64-bit layout with one word per slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Word64Geometry;

impl Word64Geometry {
    /// Words from the return address down to the monitor count.
    pub const FRAME_OVERHEAD: usize = 7;
    /// Words per monitor (owner, displaced lock word).
    pub const MONITOR_WORDS: usize = 2;

    const METHOD_OFFSET: usize = 1;
    const BCI_OFFSET: usize = 2;
    const LOCALS_OFFSET: usize = 3;
    const SENDER_SP_OFFSET: usize = 4;
    const MONITOR_COUNT_OFFSET: usize = 5;
    const MONITOR_BASE_OFFSET: usize = 6;

    fn stack_words(shape: &ActivationShape) -> usize {
        if shape.is_top {
            shape.temps.max(shape.max_stack)
        } else {
            shape.temps + shape.callee_params
        }
    }

    fn callee_extension(shape: &ActivationShape) -> usize {
        shape.callee_locals.saturating_sub(shape.callee_params)
    }
}

impl FrameGeometry for Word64Geometry {
    fn size_activation(&self, shape: &ActivationShape) -> usize {
        Self::FRAME_OVERHEAD
            + Self::MONITOR_WORDS * shape.monitors
            + Self::stack_words(shape)
            + Self::callee_extension(shape)
    }

    fn layout_activation(
        &self,
        stack: &mut ThreadStack,
        shape: &ActivationShape,
        frame: Frame,
        method: MethodId,
        bci: Bci,
        sender_sp: usize,
    ) -> InterpreterLayout {
        let fp = frame.fp;
        let locals = fp + 1 + shape.max_locals;
        let monitor_base = fp - Self::MONITOR_BASE_OFFSET;
        let expression_base = monitor_base - Self::MONITOR_WORDS * shape.monitors;
        let stack_end = expression_base + 1 - Self::stack_words(shape) - Self::callee_extension(shape);

        stack.write(fp - Self::METHOD_OFFSET, u64::from(method.0));
        stack.write(fp - Self::BCI_OFFSET, bci as i64 as u64);
        stack.write(fp - Self::LOCALS_OFFSET, locals as u64);
        stack.write(fp - Self::SENDER_SP_OFFSET, sender_sp as u64);
        stack.write(fp - Self::MONITOR_COUNT_OFFSET, shape.monitors as u64);

        InterpreterLayout {
            locals,
            monitor_base,
            expression_base,
            stack_end,
        }
    }

    fn interpreter_state(&self, stack: &ThreadStack, frame: Frame) -> Option<InterpreterState> {
        let fp = frame.fp;
        fp.checked_sub(Self::MONITOR_COUNT_OFFSET)?;
        let method = u32::try_from(stack.read(fp - Self::METHOD_OFFSET)?).ok()?;
        let bci = i32::try_from(stack.read(fp - Self::BCI_OFFSET)? as i64).ok()?;
        let locals = usize::try_from(stack.read(fp - Self::LOCALS_OFFSET)?).ok()?;
        let sender_sp = usize::try_from(stack.read(fp - Self::SENDER_SP_OFFSET)?).ok()?;
        let monitors = usize::try_from(stack.read(fp - Self::MONITOR_COUNT_OFFSET)?).ok()?;
        Some(InterpreterState {
            method: MethodId(method),
            bci,
            locals,
            sender_sp,
            monitors,
        })
    }

    fn is_safe_for_sender(&self, stack: &ThreadStack, frame: Frame) -> bool {
        if frame.sp > frame.fp || !stack.contains(frame.sp) || !stack.contains(frame.fp + 1) {
            return false;
        }
        match stack.read(frame.fp).and_then(|w| usize::try_from(w).ok()) {
            Some(0) => true,
            Some(saved) => saved > frame.fp + 1 && stack.contains(saved + 1),
            None => false,
        }
    }

    fn sender(&self, stack: &ThreadStack, frame: Frame) -> Option<Frame> {
        let saved_fp = usize::try_from(stack.read(frame.fp)?).ok()?;
        if saved_fp == 0 {
            return None;
        }
        let pc = usize::try_from(stack.read(frame.fp + 1)?).ok()?;
        Some(Frame::new(frame.sender_sp(), saved_fp, pc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::STACK_ORIGIN;

    fn shape(monitors: usize, temps: usize, is_top: bool) -> ActivationShape {
        ActivationShape {
            max_locals: 3,
            max_stack: 4,
            monitors,
            temps,
            callee_params: if is_top { 0 } else { 2 },
            callee_locals: if is_top { 0 } else { 5 },
            is_top,
        }
    }

    #[test]
    fn test_top_frame_reserves_max_stack() {
        let g = Word64Geometry;
        assert_eq!(g.size_activation(&shape(0, 1, true)), 7 + 4);
        assert_eq!(g.size_activation(&shape(1, 6, true)), 7 + 2 + 6);
    }

    #[test]
    fn test_interior_frame_counts_callee() {
        let g = Word64Geometry;
        // temps + params + (callee locals - params)
        assert_eq!(g.size_activation(&shape(0, 1, false)), 7 + 1 + 2 + 3);
    }

    #[test]
    fn test_layout_consumes_computed_size() {
        let g = Word64Geometry;
        let mut stack = ThreadStack::new(256);
        for monitors in [0, 1, 3] {
            for temps in [0, 2, 4] {
                for is_top in [true, false] {
                    let s = shape(monitors, temps, is_top);
                    let size = g.size_activation(&s);
                    let sender_sp = stack.top() - 8;
                    let fp = sender_sp - 2;
                    let frame = Frame::new(sender_sp - size, fp, 0);
                    let layout = g.layout_activation(&mut stack, &s, frame, MethodId(1), 0, sender_sp);
                    assert_eq!(layout.stack_end, frame.sp, "monitors={monitors} temps={temps} top={is_top}");
                    assert_eq!(layout.local(0), sender_sp + 2);
                }
            }
        }
    }

    #[test]
    fn test_state_round_trip() {
        let g = Word64Geometry;
        let mut stack = ThreadStack::new(64);
        let s = shape(1, 1, true);
        let fp = stack.top() - 10;
        let frame = Frame::new(fp + 2 - g.size_activation(&s), fp, 0);
        g.layout_activation(&mut stack, &s, frame, MethodId(9), -1, fp + 2);
        let state = g.interpreter_state(&stack, frame).unwrap();
        assert_eq!(state.method, MethodId(9));
        assert_eq!(state.bci, -1);
        assert_eq!(state.monitors, 1);
        assert_eq!(state.locals, fp + 4);
    }

    #[test]
    fn test_sender_and_safety() {
        let g = Word64Geometry;
        let mut stack = ThreadStack::new(32);
        let entry_fp = stack.push_link(stack.top(), 0, 0);
        let entry = Frame::new(entry_fp - 2, entry_fp, 0x30);
        let fp = stack.push_link(entry.sp, 0x1234, entry_fp);
        let frame = Frame::new(fp - 3, fp, 0x99);

        assert!(g.is_safe_for_sender(&stack, frame));
        let sender = g.sender(&stack, frame).unwrap();
        assert_eq!(sender, Frame::new(entry.sp, entry_fp, 0x1234));
        assert!(g.sender(&stack, entry).is_none());

        // corrupt the saved fp to point below the frame
        stack.write(fp, (STACK_ORIGIN + 1) as u64);
        assert!(!g.is_safe_for_sender(&stack, frame));
        assert!(!g.is_safe_for_sender(&stack, Frame::new(0, 0, 0)));
    }

    #[test]
    fn test_caller_adjustment() {
        let g = Word64Geometry;
        assert_eq!(g.caller_adjustment(CallerKind::Interpreted, 2, 5), 3);
        assert_eq!(g.caller_adjustment(CallerKind::Interpreted, 2, 2), 0);
        // a compiled caller's outgoing area holds every local
        assert_eq!(g.caller_adjustment(CallerKind::Compiled { outgoing_words: 5 }, 2, 5), 0);
        assert_eq!(g.caller_adjustment(CallerKind::Compiled { outgoing_words: 8 }, 0, 3), 0);
        assert_eq!(g.caller_adjustment(CallerKind::Compiled { outgoing_words: 3 }, 2, 5), 2);
    }
}
