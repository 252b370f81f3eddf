//! Interpreter and stub code regions.
//!
//! The runtime classifies a frame by its pc. Interpreter entry points,
//! the deoptimization handler and the call stub live at fixed addresses
//! outside the code cache.

/// First pc of the interpreter's code.
pub const INTERPRETER_CODE_BEGIN: usize = 0x10_0000;

/// One past the last pc of the interpreter's code.
pub const INTERPRETER_CODE_END: usize = 0x10_1000;

/// Return address patched into frames marked for deoptimization.
pub const DEOPT_HANDLER_PC: usize = 0x20_0000;

/// Return address of the entry frame at the bottom of every Java stack.
pub const CALL_STUB_PC: usize = 0x30_0000;

/// Words the call stub reserves below its link for the entry method's
/// arguments and locals.
pub const CALL_STUB_ARGUMENT_WORDS: usize = 32;

/// Interpreter entry points a rebuilt frame can resume at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterpreterEntry {
    /// Return from an invoke; continue after the call.
    Return,
    /// Execute the instruction at the frame's bci again.
    DeoptReexecute,
    /// Continue with the instruction after the frame's bci.
    DeoptContinue,
    /// Dispatch the thread's pending exception at the frame's bci.
    Rethrow,
}

impl InterpreterEntry {
    #[inline]
    pub const fn pc(self) -> usize {
        INTERPRETER_CODE_BEGIN
            + match self {
                InterpreterEntry::Return => 0x40,
                InterpreterEntry::DeoptReexecute => 0x80,
                InterpreterEntry::DeoptContinue => 0xc0,
                InterpreterEntry::Rethrow => 0x100,
            }
    }

    pub const fn from_pc(pc: usize) -> Option<Self> {
        match pc.wrapping_sub(INTERPRETER_CODE_BEGIN) {
            0x40 => Some(InterpreterEntry::Return),
            0x80 => Some(InterpreterEntry::DeoptReexecute),
            0xc0 => Some(InterpreterEntry::DeoptContinue),
            0x100 => Some(InterpreterEntry::Rethrow),
            _ => None,
        }
    }
}

#[inline]
pub const fn is_interpreter_pc(pc: usize) -> bool {
    pc >= INTERPRETER_CODE_BEGIN && pc < INTERPRETER_CODE_END
}
