//! Captured logical frames of a deoptimized compiled frame.
//!
//! One compiled frame may hold several logical (virtual) frames when the
//! compiler inlined calls. Deoptimization reads every one of them out of
//! the compiled frame into a [`VFrameArray`] while the frame still exists,
//! then, after the compiled frame has been replaced by skeletal interpreter
//! frames of the right sizes, writes each element into its interpreter
//! frame.
//!
//! ```text
//!   compiled frame              vframe array               interpreter frames
//!  ┌──────────────┐          ┌─────────────────┐          ┌─────────────────┐
//!  │ caller       │          │ [0] innermost   │──────┐   │ caller          │
//!  ├──────────────┤ capture  │ [1]             │──┐   │   ├─────────────────┤
//!  │ outer ⊃      │────────▶ │ [2] outermost   │┐ │   │   │ outermost       │◀┘
//!  │  inlined ⊃   │          └─────────────────┘│ │   │   ├─────────────────┤
//!  │   innermost  │                             │ └───┼──▶│ ...             │
//!  └──────────────┘                             │     │   ├─────────────────┤
//!                                               │     └──▶│ innermost (top) │
//!                                               │         └─────────────────┘
//!                                               └── unpacked outermost first
//! ```
//!
//! Elements are stored innermost first, the order scopes are recorded in;
//! unpacking goes outermost first, the order frames are pushed in.

use crate::deopt::realloc::{FrameValues, ReallocatedObjects};
use crate::deopt::unroll::ExecMode;
use crate::geometry::{ActivationShape, FrameGeometry};
use crate::interpreter::InterpreterEntry;
use crate::runtime::Runtime;
use crate::stack::{Frame, RegisterMap};
use crate::thread::JavaThread;
use kiln_code::{ScopeDesc, ScopeValue};
use kiln_core::{BasicType, Bci, CompiledId, Method, ObjRef, SYNCHRONIZATION_ENTRY_BCI, SlotVec, ThreadId, normalize_bci};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::trace;

/// A monitor held by a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorInfo {
    /// Locked object; null when its reallocation failed.
    pub owner: ObjRef,
    /// Displaced header stored in the interpreter's monitor slot.
    pub lock_word: u64,
    /// Locking was elided by the compiler.
    pub eliminated: bool,
}

// =============================================================================
// VFrameElement
// =============================================================================

/// One captured logical frame.
#[derive(Debug, Clone)]
pub struct VFrameElement {
    method: Arc<Method>,
    raw_bci: Bci,
    reexecute: bool,
    locals: SlotVec,
    expressions: SlotVec,
    monitors: SmallVec<[MonitorInfo; 2]>,
    iframe: Option<Frame>,
}

impl VFrameElement {
    fn capture(scope: &ScopeDesc<'_>, values: &FrameValues<'_>, objects: &ReallocatedObjects) -> Self {
        let slots = |recorded: &[ScopeValue]| -> SlotVec { recorded.iter().map(|v| values.slot(v, objects)).collect() };
        let monitors = scope
            .monitors()
            .iter()
            .map(|m| MonitorInfo {
                owner: values.slot(&m.owner, objects).as_ref().unwrap_or(ObjRef::NULL),
                lock_word: if m.eliminated { 0 } else { values.word(m.basic_lock).unwrap_or(0) },
                eliminated: m.eliminated,
            })
            .collect();
        let method = scope.method().clone();
        debug_assert!(
            scope.locals().len() <= method.max_locals(),
            "{}: {} locals recorded, {} declared",
            method.name(),
            scope.locals().len(),
            method.max_locals()
        );
        Self {
            method,
            raw_bci: scope.bci(),
            reexecute: scope.should_reexecute(),
            locals: slots(scope.locals()),
            expressions: slots(scope.expressions()),
            monitors,
            iframe: None,
        }
    }

    #[inline]
    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    /// Bci as recorded, possibly the synchronization entry.
    #[inline]
    pub fn raw_bci(&self) -> Bci {
        self.raw_bci
    }

    #[inline]
    pub fn bci(&self) -> Bci {
        normalize_bci(self.raw_bci)
    }

    #[inline]
    pub fn should_reexecute(&self) -> bool {
        self.reexecute
    }

    #[inline]
    pub fn locals(&self) -> &[kiln_core::StackSlot] {
        &self.locals
    }

    #[inline]
    pub fn expressions(&self) -> &[kiln_core::StackSlot] {
        &self.expressions
    }

    #[inline]
    pub fn monitors(&self) -> &[MonitorInfo] {
        &self.monitors
    }

    pub(crate) fn monitors_mut(&mut self) -> &mut [MonitorInfo] {
        &mut self.monitors
    }

    /// The interpreter frame this element was unpacked into.
    #[inline]
    pub fn iframe(&self) -> Option<Frame> {
        self.iframe
    }

    /// Interpreter entry the rebuilt frame resumes at.
    pub fn resume_entry(&self, is_top: bool, mode: ExecMode) -> InterpreterEntry {
        if self.raw_bci == SYNCHRONIZATION_ENTRY_BCI {
            // Stopped in the prologue before the method's monitor was taken.
            return InterpreterEntry::DeoptReexecute;
        }
        if self.reexecute {
            return InterpreterEntry::DeoptReexecute;
        }
        if !is_top {
            return InterpreterEntry::Return;
        }
        match mode {
            ExecMode::Exception => InterpreterEntry::Rethrow,
            ExecMode::UncommonTrap | ExecMode::Reexecute => InterpreterEntry::DeoptReexecute,
            ExecMode::Deopt => InterpreterEntry::DeoptContinue,
        }
    }
}

// =============================================================================
// VFrameArray
// =============================================================================

/// All logical frames of one deoptimized compiled frame.
#[derive(Debug, Clone)]
pub struct VFrameArray {
    thread: ThreadId,
    code: CompiledId,
    original: Frame,
    caller: Frame,
    /// Innermost first.
    elements: Vec<VFrameElement>,
    registers: RegisterMap,
    frame_size: usize,
    realloc_failures: usize,
    return_type: BasicType,
}

impl VFrameArray {
    /// Read every logical frame of `scope`'s chain out of the compiled
    /// frame `original`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn capture(
        thread: ThreadId,
        code: CompiledId,
        scope: ScopeDesc<'_>,
        original: Frame,
        caller: Frame,
        frame_size: usize,
        values: &FrameValues<'_>,
        registers: &RegisterMap,
        objects: &ReallocatedObjects,
    ) -> Self {
        let elements: Vec<_> = scope.chain().map(|s| VFrameElement::capture(&s, values, objects)).collect();
        trace!(%thread, %code, frames = elements.len(), "captured vframes");
        Self {
            thread,
            code,
            original,
            caller,
            elements,
            registers: *registers,
            frame_size,
            realloc_failures: objects.failures(),
            return_type: BasicType::Void,
        }
    }

    #[inline]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Compiled code the frames were captured from.
    #[inline]
    pub fn code(&self) -> CompiledId {
        self.code
    }

    /// The compiled frame being replaced.
    #[inline]
    pub fn original(&self) -> Frame {
        self.original
    }

    #[inline]
    pub fn caller(&self) -> Frame {
        self.caller
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.elements.len()
    }

    /// Element `index`, counted from the innermost frame.
    #[inline]
    pub fn element(&self, index: usize) -> Option<&VFrameElement> {
        self.elements.get(index)
    }

    #[inline]
    pub fn elements(&self) -> &[VFrameElement] {
        &self.elements
    }

    pub(crate) fn elements_mut(&mut self) -> &mut [VFrameElement] {
        &mut self.elements
    }

    /// Registers of the compiled frame at capture time.
    #[inline]
    pub fn registers(&self) -> &RegisterMap {
        &self.registers
    }

    /// Words of the compiled frame.
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Eliminated objects that could not be reallocated.
    #[inline]
    pub fn realloc_failures(&self) -> usize {
        self.realloc_failures
    }

    /// Kind of value live in the return registers of the compiled frame.
    #[inline]
    pub fn return_type(&self) -> BasicType {
        self.return_type
    }

    pub(crate) fn set_return_type(&mut self, ty: BasicType) {
        self.return_type = ty;
    }

    /// Shape of the interpreter frame for element `index` (innermost first).
    pub fn activation_shape(&self, index: usize) -> ActivationShape {
        let elem = &self.elements[index];
        let callee = index.checked_sub(1).map(|i| &self.elements[i]);
        let (callee_params, callee_locals) =
            callee.map_or((0, 0), |c| (c.method.size_of_parameters(), c.method.max_locals()));
        let expressions = elem.expressions.len();
        ActivationShape {
            max_locals: elem.method.max_locals(),
            max_stack: elem.method.max_stack(),
            monitors: elem.monitors.len(),
            // A caller's outgoing arguments are counted with its callee.
            temps: if callee.is_some() { expressions.saturating_sub(callee_params) } else { expressions },
            callee_params,
            callee_locals,
            is_top: index == 0,
        }
    }

    /// Interpreter frame sizes, outermost first.
    pub fn frame_sizes(&self, geometry: &dyn FrameGeometry) -> SmallVec<[usize; 4]> {
        (0..self.elements.len())
            .rev()
            .map(|i| geometry.size_activation(&self.activation_shape(i)))
            .collect()
    }

    /// Resume pcs, outermost first.
    pub fn resume_pcs(&self, mode: ExecMode) -> SmallVec<[usize; 4]> {
        self.elements
            .iter()
            .enumerate()
            .rev()
            .map(|(i, e)| e.resume_entry(i == 0, mode).pc())
            .collect()
    }

    /// Check captured frames against their methods and unpacked frames
    /// against their computed sizes.
    pub fn verify(&self, geometry: &dyn FrameGeometry) -> Result<(), String> {
        if self.elements.is_empty() {
            return Err(format!("{}: no vframes captured", self.code));
        }
        for (i, e) in self.elements.iter().enumerate() {
            let m = &e.method;
            if e.locals.len() > m.max_locals() {
                return Err(format!("{}: {} locals, max_locals {}", m.name(), e.locals.len(), m.max_locals()));
            }
            if m.code_size() > 0 && !m.is_valid_bci(e.bci()) {
                return Err(format!("{}: bci {} out of range", m.name(), e.raw_bci));
            }
            if let Some(frame) = e.iframe {
                let expected = geometry.size_activation(&self.activation_shape(i));
                if frame.size() != expected {
                    return Err(format!("{}: frame of {} words, expected {expected}", m.name(), frame.size()));
                }
            }
        }
        Ok(())
    }

    /// Fill the skeletal interpreter frames, given outermost first, and make
    /// the innermost one the thread's last frame.
    ///
    /// # Panics
    ///
    /// Panics if a skeletal frame does not have the size the geometry
    /// computes for its element.
    pub fn unpack_to_stack(&mut self, rt: &Runtime, thread: &mut JavaThread, skeletal: &[Frame], mode: ExecMode) {
        let n = self.elements.len();
        assert_eq!(skeletal.len(), n, "{} skeletal frames for {} vframes", skeletal.len(), n);
        let geometry = rt.geometry();
        let zap = rt.config().zap_dead_slots;

        for (k, skeleton) in skeletal.iter().enumerate() {
            let index = n - 1 - k;
            let is_top = index == 0;
            let shape = self.activation_shape(index);
            let elem = &self.elements[index];
            let entry = elem.resume_entry(is_top, mode);
            let frame = Frame::new(skeleton.sp, skeleton.fp, entry.pc());
            let sender_sp = if k == 0 { self.caller.sp } else { skeletal[k - 1].sp };

            let stack = thread.stack_mut();
            let layout = geometry.layout_activation(stack, &shape, frame, elem.method.id(), elem.bci(), sender_sp);
            assert_eq!(
                layout.stack_end,
                frame.sp,
                "{}: frame size mismatch at bci {}",
                elem.method.name(),
                elem.raw_bci
            );
            let monitors: SmallVec<[(ObjRef, u64); 2]> = elem.monitors.iter().map(|m| (m.owner, m.lock_word)).collect();
            if let Some(lowest) = layout.fill(stack, &elem.locals, &elem.expressions, &monitors, zap) {
                assert!(
                    lowest >= frame.sp,
                    "{}: frame size mismatch, wrote {lowest:#x} below sp {:#x}",
                    elem.method.name(),
                    frame.sp
                );
            }

            if is_top {
                thread.set_last_frame(frame);
            } else {
                stack.write(skeletal[k + 1].fp + 1, entry.pc() as u64);
            }
            trace!(
                thread = %self.thread,
                method = elem.method.name(),
                bci = elem.bci(),
                entry = ?entry,
                ?frame,
                "unpacked vframe"
            );
            self.elements[index].iframe = Some(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Word64Geometry;
    use kiln_core::{ClassId, MethodId, Opcode};

    fn method(id: u32, locals: u16, params: u16, max_stack: u16) -> Arc<Method> {
        Arc::new(
            Method::new(MethodId(id), format!("m{id}"), ClassId(1), vec![Opcode::Simple, Opcode::Invoke { arg_slots: 1 }, Opcode::Return])
                .with_locals(locals, params)
                .with_max_stack(max_stack),
        )
    }

    fn element(method: Arc<Method>, raw_bci: Bci, expressions: usize) -> VFrameElement {
        VFrameElement {
            method,
            raw_bci,
            reexecute: false,
            locals: SlotVec::new(),
            expressions: std::iter::repeat(kiln_core::StackSlot::Int(0)).take(expressions).collect(),
            monitors: SmallVec::new(),
            iframe: None,
        }
    }

    fn array(elements: Vec<VFrameElement>) -> VFrameArray {
        VFrameArray {
            thread: ThreadId(1),
            code: CompiledId(1),
            original: Frame::new(0, 0, 0),
            caller: Frame::new(0, 0, 0),
            elements,
            registers: RegisterMap::new(),
            frame_size: 4,
            realloc_failures: 0,
            return_type: BasicType::Void,
        }
    }

    #[test]
    fn test_resume_entries() {
        let m = method(1, 2, 1, 2);
        let mut e = element(m, 1, 0);
        assert_eq!(e.resume_entry(false, ExecMode::Deopt), InterpreterEntry::Return);
        assert_eq!(e.resume_entry(true, ExecMode::Deopt), InterpreterEntry::DeoptContinue);
        assert_eq!(e.resume_entry(true, ExecMode::Exception), InterpreterEntry::Rethrow);
        assert_eq!(e.resume_entry(true, ExecMode::UncommonTrap), InterpreterEntry::DeoptReexecute);

        e.reexecute = true;
        assert_eq!(e.resume_entry(false, ExecMode::Deopt), InterpreterEntry::DeoptReexecute);

        e.reexecute = false;
        e.raw_bci = SYNCHRONIZATION_ENTRY_BCI;
        assert_eq!(e.bci(), 0);
        assert_eq!(e.resume_entry(true, ExecMode::Exception), InterpreterEntry::DeoptReexecute);
    }

    #[test]
    fn test_shapes_account_for_callee_arguments() {
        let outer = method(1, 3, 1, 4);
        let inner = method(2, 4, 2, 3);
        // innermost first; the outer frame has two outgoing arguments on its stack
        let a = array(vec![element(inner, 0, 1), element(outer, 1, 3)]);

        let top = a.activation_shape(0);
        assert!(top.is_top);
        assert_eq!((top.temps, top.callee_params), (1, 0));

        let caller = a.activation_shape(1);
        assert!(!caller.is_top);
        assert_eq!((caller.temps, caller.callee_params, caller.callee_locals), (1, 2, 4));

        let g = Word64Geometry;
        let sizes = a.frame_sizes(&g);
        // outer: 7 + (1 + 2) + (4 - 2); inner: 7 + max(1, 3)
        assert_eq!(sizes.as_slice(), &[12, 10]);
        assert_eq!(
            a.resume_pcs(ExecMode::Deopt).as_slice(),
            &[InterpreterEntry::Return.pc(), InterpreterEntry::DeoptContinue.pc()]
        );
    }
}
