//! Deoptimization blob.
//!
//! The platform code that sits between the two phases of an unwind. It
//! pops the compiled frame, extends the caller if the outermost
//! interpreter frame needs room for its locals, and pushes skeletal
//! interpreter frames of the sizes the [`UnrollBlock`] names. Only then
//! are the frames filled.
//!
//! ```text
//!   before                         after replace_frames
//! ┌─────────────────┐            ┌─────────────────┐
//! │ caller          │            │ caller          │
//! ├─────────────────┤ caller_sp  ├─────────────────┤ caller_sp
//! │ ret pc, fp      │            │ adjustment      │
//! │ compiled frame  │            ├─────────────────┤
//! │                 │            │ ret pc, fp      │ frame_sizes[0]
//! └─────────────────┘ sp         │ outermost       │
//!                                ├─────────────────┤
//!                                │ ret pc, fp      │ frame_sizes[1]
//!                                │ ...             │
//!                                └─────────────────┘ sp
//! ```

use super::Deoptimizer;
use super::unroll::{ExecMode, UnrollBlock};
use crate::stack::Frame;
use crate::thread::{JavaThread, PendingException};
use kiln_core::{KilnError, KilnResult};
use tracing::trace;

/// Runs complete unwinds on behalf of compiled code.
#[derive(Debug, Clone, Copy)]
pub struct DeoptBlob<'a> {
    deopt: &'a Deoptimizer,
}

impl<'a> DeoptBlob<'a> {
    pub fn new(deopt: &'a Deoptimizer) -> Self {
        Self { deopt }
    }

    /// Deoptimize the youngest frame of `thread`: entered from the deopt
    /// handler (`ExecMode::Deopt`) or with an exception pending
    /// (`ExecMode::Exception`).
    ///
    /// Returns [`KilnError::OutOfMemory`] after the interpreter frames are
    /// in place if eliminated objects could not be reallocated.
    pub fn execute(&self, thread: &mut JavaThread, mode: ExecMode) -> KilnResult<UnrollBlock> {
        let block = self.deopt.fetch_unroll_info(thread, mode)?;
        self.finish(thread, block)
    }

    /// Entry of compiled code's uncommon traps.
    pub fn execute_uncommon_trap(&self, thread: &mut JavaThread, request: i32) -> KilnResult<UnrollBlock> {
        let block = self.deopt.uncommon_trap(thread, request)?;
        self.finish(thread, block)
    }

    fn finish(&self, thread: &mut JavaThread, block: UnrollBlock) -> KilnResult<UnrollBlock> {
        if let Err(e) = replace_frames(thread, &block) {
            thread.take_vframe_array();
            thread.dec_in_deopt_handler();
            return Err(e);
        }
        self.deopt.unpack_frames(thread, block.unpack_kind)?;
        if let Some(PendingException::OutOfMemory { failed }) = thread.pending_exception() {
            thread.take_pending_exception();
            return Err(KilnError::OutOfMemory { failed });
        }
        Ok(block)
    }
}

/// Replace the youngest (compiled) frame of `thread` with skeletal
/// interpreter frames as planned by `block`.
///
/// Only the link words are written; `unpack_frames` fills the rest.
pub fn replace_frames(thread: &mut JavaThread, block: &UnrollBlock) -> KilnResult<()> {
    let deoptee = thread.last_frame();
    let caller_sp = deoptee.sender_sp();
    let caller_fp = thread
        .stack()
        .read(deoptee.fp)
        .and_then(|w| usize::try_from(w).ok())
        .ok_or(KilnError::NotDeoptimizable { fp: deoptee.fp })?;

    let needed = block.stack_words_needed();
    let available = caller_sp - thread.stack().origin();
    if needed > available {
        return Err(KilnError::StackOverflow { needed, available });
    }
    thread.clear_deopt_mark(deoptee.fp);

    let mut sp = caller_sp - block.caller_adjustment;
    let mut fp = caller_fp;
    let stack = thread.stack_mut();
    for (i, &size) in block.frame_sizes.iter().enumerate() {
        fp = stack.push_link(sp, block.frame_pcs[i], fp);
        sp -= size;
    }
    let top = Frame::new(sp, fp, block.frame_pcs[block.number_of_frames]);
    trace!(thread = %thread.id(), frames = block.number_of_frames, top = ?top, "pushed skeletal frames");
    thread.set_last_frame(top);
    Ok(())
}
