//! The unroll block: how to replace a compiled frame with interpreter
//! frames.
//!
//! Produced by the first deoptimization phase and consumed by the frame
//! replacement trampoline, which knows nothing about methods or bcis, only
//! sizes and return addresses.

use kiln_core::BasicType;
use smallvec::SmallVec;
use std::fmt;

use super::trap::TrapDecision;

/// Why a compiled frame is being unpacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecMode {
    /// The frame was marked for deoptimization and is being returned into.
    Deopt,
    /// An exception is propagating into the frame.
    Exception,
    /// Compiled code hit an uncommon trap.
    UncommonTrap,
    /// Re-execute the current bytecode of the youngest frame.
    Reexecute,
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecMode::Deopt => "deopt",
            ExecMode::Exception => "exception",
            ExecMode::UncommonTrap => "uncommon_trap",
            ExecMode::Reexecute => "reexecute",
        })
    }
}

/// Frame sizes and return addresses of the interpreter frames to build.
///
/// Arrays are ordered outermost (oldest) frame first, the order in which
/// frames are pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrollBlock {
    /// Words of the compiled frame being removed.
    pub size_of_deoptimized_frame: usize,
    /// Words the caller's frame grows by so the outermost frame's locals fit.
    pub caller_adjustment: usize,
    /// Parameter words the caller passed to the deoptimized method.
    pub caller_actual_parameters: usize,
    pub number_of_frames: usize,
    /// Words of each interpreter frame.
    pub frame_sizes: SmallVec<[usize; 4]>,
    /// `frame_pcs[0]` is the caller's return address; `frame_pcs[i + 1]` is
    /// the pc frame `i` resumes at.
    pub frame_pcs: SmallVec<[usize; 5]>,
    pub unpack_kind: ExecMode,
    /// Kind of value live in the return registers across the replacement.
    pub return_type: BasicType,
    /// Outcome of the trap, for uncommon traps.
    pub trap_decision: Option<TrapDecision>,
}

impl UnrollBlock {
    /// Words of all interpreter frames together.
    #[inline]
    pub fn total_frame_sizes(&self) -> usize {
        self.frame_sizes.iter().sum()
    }

    /// Words the stack needs beyond the caller's current sp.
    #[inline]
    pub fn stack_words_needed(&self) -> usize {
        self.caller_adjustment + self.total_frame_sizes()
    }

    /// Check array lengths against the frame count.
    pub fn verify(&self) -> Result<(), String> {
        if self.frame_sizes.len() != self.number_of_frames {
            return Err(format!(
                "{} frame sizes for {} frames",
                self.frame_sizes.len(),
                self.number_of_frames
            ));
        }
        if self.frame_pcs.len() != self.number_of_frames + 1 {
            return Err(format!(
                "{} frame pcs for {} frames",
                self.frame_pcs.len(),
                self.number_of_frames
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn block() -> UnrollBlock {
        UnrollBlock {
            size_of_deoptimized_frame: 6,
            caller_adjustment: 2,
            caller_actual_parameters: 1,
            number_of_frames: 2,
            frame_sizes: smallvec![10, 12],
            frame_pcs: smallvec![0x1, 0x2, 0x3],
            unpack_kind: ExecMode::Deopt,
            return_type: BasicType::Void,
            trap_decision: None,
        }
    }

    #[test]
    fn test_totals() {
        let b = block();
        assert_eq!(b.total_frame_sizes(), 22);
        assert_eq!(b.stack_words_needed(), 24);
        assert!(b.verify().is_ok());
    }

    #[test]
    fn test_verify_mismatch() {
        let mut b = block();
        b.frame_pcs.pop();
        assert!(b.verify().is_err());
    }
}
