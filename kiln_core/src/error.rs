//! Recoverable runtime errors.
//!
//! Only conditions a caller can act on are errors. Broken invariants
//! between compiled code and the runtime (missing scope descriptors, frame
//! size mismatches, suspension inside a no-safepoint scope) panic instead.

use crate::ids::{CompiledId, ThreadId};
use thiserror::Error;

/// Errors surfaced by the deoptimization runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KilnError {
    /// Reallocation of one or more scalar-replaced objects failed. Raised
    /// only after the interpreter frames have been rebuilt.
    #[error("out of memory while reallocating {failed} eliminated object(s)")]
    OutOfMemory { failed: usize },

    /// The frame is not a compiled Java frame.
    #[error("frame at fp={fp:#x} is not a compiled frame")]
    NotDeoptimizable { fp: usize },

    /// No frame with the given id exists on the thread's stack.
    #[error("no frame with id {id:#x} on thread {thread}")]
    InvalidFrameId { thread: ThreadId, id: usize },

    /// The thread has no walkable Java frame.
    #[error("thread {0} has no last Java frame")]
    NoLastJavaFrame(ThreadId),

    /// `unpack_frames` was called without a preceding `fetch_unroll_info`.
    #[error("thread {0} has no pending vframe array")]
    NoPendingUnroll(ThreadId),

    /// The thread stack cannot hold the interpreter frames.
    #[error("stack overflow: need {needed} words, {available} available")]
    StackOverflow { needed: usize, available: usize },

    /// An uncommon trap passed a request that does not decode.
    #[error("malformed trap request {0:#x}")]
    InvalidTrapRequest(i32),

    /// Compiled code id unknown to the code cache.
    #[error("unknown compiled method {0}")]
    UnknownCode(CompiledId),
}

/// Result alias for Kiln runtime operations.
pub type KilnResult<T> = Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let e = KilnError::OutOfMemory { failed: 2 };
        assert_eq!(e.to_string(), "out of memory while reallocating 2 eliminated object(s)");
        let e = KilnError::InvalidFrameId { thread: ThreadId(1), id: 0x40 };
        assert_eq!(e.to_string(), "no frame with id 0x40 on thread t#1");
    }
}
