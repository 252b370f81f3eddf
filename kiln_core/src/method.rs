//! Method descriptors.
//!
//! A [`Method`] is immutable bytecode plus a handful of mutable runtime
//! words: the currently installed compiled code, the decompile counter,
//! the invocation counter and the "not compilable" verdict. The mutable
//! words are atomics so compiled code, the deoptimizer and the sweeper can
//! update them without holding a lock on the method.

use crate::ids::{ClassId, CompiledId, MethodId};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Bytecode index.
pub type Bci = i32;

/// Pseudo-bci of the implicit monitor enter of a synchronized method.
pub const SYNCHRONIZATION_ENTRY_BCI: Bci = -1;

/// Bci of the normal method entry. Compiled code whose entry bci differs
/// is on-stack-replacement code.
pub const INVOCATION_ENTRY_BCI: Bci = 0;

/// Map the synchronization pseudo-bci onto the method's first instruction.
#[inline]
pub const fn normalize_bci(bci: Bci) -> Bci {
    if bci == SYNCHRONIZATION_ENTRY_BCI {
        0
    } else {
        bci
    }
}

// =============================================================================
// Opcode
// =============================================================================

/// Instruction kinds, as far as frame reconstruction cares.
///
/// Every instruction occupies exactly one bci.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Anything without special deoptimization semantics.
    Simple,
    /// Conditional or switch branch whose condition was folded by the compiler.
    Branch,
    /// Field load or store that consumes values on the operand stack.
    FieldAccess,
    /// Array allocation.
    NewArray,
    /// Call with the given number of argument slots (receiver included).
    Invoke { arg_slots: u16 },
    MonitorEnter,
    MonitorExit,
    Return,
    Throw,
}

impl Opcode {
    /// Whether resuming at this instruction must execute it again rather
    /// than continue after it.
    #[inline]
    pub const fn should_reexecute(self) -> bool {
        matches!(self, Opcode::Branch | Opcode::FieldAccess | Opcode::NewArray)
    }

    #[inline]
    pub const fn is_invoke(self) -> bool {
        matches!(self, Opcode::Invoke { .. })
    }
}

// =============================================================================
// Method
// =============================================================================

/// A method body and its runtime profile words.
#[derive(Debug)]
pub struct Method {
    id: MethodId,
    name: Box<str>,
    holder: ClassId,
    max_locals: u16,
    max_stack: u16,
    size_of_parameters: u16,
    is_synchronized: bool,
    is_native: bool,
    code: Box<[Opcode]>,

    /// Currently installed compiled code (`CompiledId::NONE_RAW` if none).
    installed: AtomicU64,
    decompile_count: AtomicU32,
    invocation_count: AtomicU32,
    not_compilable: AtomicBool,
}

impl Method {
    /// Create a method with the given bytecode. Sizes default to the
    /// smallest frame able to hold the code; use the `with_*` builders.
    pub fn new(id: MethodId, name: impl Into<Box<str>>, holder: ClassId, code: Vec<Opcode>) -> Self {
        Self {
            id,
            name: name.into(),
            holder,
            max_locals: 0,
            max_stack: 0,
            size_of_parameters: 0,
            is_synchronized: false,
            is_native: false,
            code: code.into_boxed_slice(),
            installed: AtomicU64::new(CompiledId::NONE_RAW),
            decompile_count: AtomicU32::new(0),
            invocation_count: AtomicU32::new(0),
            not_compilable: AtomicBool::new(false),
        }
    }

    /// Set locals and parameter sizes. `params` must not exceed `locals`.
    pub fn with_locals(mut self, locals: u16, params: u16) -> Self {
        assert!(params <= locals, "parameters ({params}) exceed locals ({locals})");
        self.max_locals = locals;
        self.size_of_parameters = params;
        self
    }

    pub fn with_max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = max_stack;
        self
    }

    pub fn with_synchronized(mut self, synchronized: bool) -> Self {
        self.is_synchronized = synchronized;
        self
    }

    pub fn with_native(mut self, native: bool) -> Self {
        self.is_native = native;
        self
    }

    // =========================================================================
    // Shape
    // =========================================================================

    #[inline]
    pub fn id(&self) -> MethodId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Class declaring this method.
    #[inline]
    pub fn holder(&self) -> ClassId {
        self.holder
    }

    #[inline]
    pub fn max_locals(&self) -> usize {
        self.max_locals as usize
    }

    #[inline]
    pub fn max_stack(&self) -> usize {
        self.max_stack as usize
    }

    /// Parameter slots, receiver included.
    #[inline]
    pub fn size_of_parameters(&self) -> usize {
        self.size_of_parameters as usize
    }

    #[inline]
    pub fn is_synchronized(&self) -> bool {
        self.is_synchronized
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        self.is_native
    }

    #[inline]
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// Instruction at `bci`, or `None` when out of range.
    #[inline]
    pub fn opcode_at(&self, bci: Bci) -> Option<Opcode> {
        usize::try_from(bci).ok().and_then(|i| self.code.get(i).copied())
    }

    /// Whether `bci` names an instruction of this method.
    ///
    /// The synchronization pseudo-bci is valid only for synchronized methods.
    #[inline]
    pub fn is_valid_bci(&self, bci: Bci) -> bool {
        if bci == SYNCHRONIZATION_ENTRY_BCI {
            return self.is_synchronized;
        }
        self.opcode_at(bci).is_some()
    }

    /// Bci of the instruction after `bci`.
    #[inline]
    pub fn next_bci(&self, bci: Bci) -> Bci {
        normalize_bci(bci) + 1
    }

    // =========================================================================
    // Installed code
    // =========================================================================

    /// Currently installed compiled code.
    #[inline]
    pub fn code(&self) -> Option<CompiledId> {
        CompiledId::from_raw(self.installed.load(Ordering::Acquire))
    }

    /// Install `id` as the method's compiled code.
    #[inline]
    pub fn set_code(&self, id: CompiledId) {
        self.installed.store(id.0, Ordering::Release);
    }

    /// Clear the installed code only if it is still `id`.
    ///
    /// Returns `true` if the link was removed.
    #[inline]
    pub fn clear_code(&self, id: CompiledId) -> bool {
        self.installed
            .compare_exchange(id.0, CompiledId::NONE_RAW, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // =========================================================================
    // Profile counters
    // =========================================================================

    #[inline]
    pub fn decompile_count(&self) -> u32 {
        self.decompile_count.load(Ordering::Relaxed)
    }

    /// Bump the decompile count, returning the new value.
    #[inline]
    pub fn inc_decompile_count(&self) -> u32 {
        self.decompile_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn invocation_count(&self) -> u32 {
        self.invocation_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn inc_invocation_count(&self) -> u32 {
        self.invocation_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Restart profiling from scratch.
    #[inline]
    pub fn reset_counters(&self) {
        self.invocation_count.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_not_compilable(&self) -> bool {
        self.not_compilable.load(Ordering::Acquire)
    }

    /// Forbid further compilation. Returns `true` on the first call.
    #[inline]
    pub fn set_not_compilable(&self) -> bool {
        !self.not_compilable.swap(true, Ordering::AcqRel)
    }
}
