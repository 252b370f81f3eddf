//! Shared fixtures for the deoptimization integration tests.

#![allow(dead_code)]

use kiln_core::{Bci, ClassId, KilnConfig, Method, MethodId, Opcode};
use kiln_deopt::geometry::InterpreterState;
use kiln_deopt::{ArenaHeap, Frame, FrameGeometry, JavaThread, LockTable, Runtime, StackWalker};
use std::sync::Arc;

/// Start of the code region compiled methods are installed at.
pub const CODE: usize = 0x100_0000;

pub struct Fixture {
    pub rt: Arc<Runtime>,
    pub heap: Arc<ArenaHeap>,
    pub locks: Arc<LockTable>,
}

pub fn fixture(config: KilnConfig) -> Fixture {
    let heap = Arc::new(ArenaHeap::default());
    let locks = Arc::new(LockTable::new());
    let rt = Arc::new(Runtime::new(config, heap.clone(), locks.clone()));
    Fixture { rt, heap, locks }
}

/// A method whose every bytecode is an invoke passing `arg_slots` words,
/// so any bci is a valid call site.
pub fn method(id: u32, params: u16, locals: u16, max_stack: u16, arg_slots: u16) -> Arc<Method> {
    Arc::new(
        Method::new(MethodId(id), format!("m{id}"), ClassId(1), vec![Opcode::Invoke { arg_slots }; 8])
            .with_locals(locals, params)
            .with_max_stack(max_stack),
    )
}

/// Java frames of `thread`, youngest first, as (method, bci).
pub fn java_frames(rt: &Runtime, thread: &JavaThread) -> Vec<(MethodId, Bci)> {
    StackWalker::new(rt, thread)
        .collect(64)
        .unwrap_or_default()
        .into_iter()
        .map(|f| (f.method, f.bci))
        .collect()
}

/// Interpreter frames from the youngest down to the first non-interpreter
/// frame, with their fixed words.
pub fn interpreter_frames(rt: &Runtime, thread: &JavaThread) -> Vec<(Frame, InterpreterState)> {
    let geometry = rt.geometry();
    let mut out = Vec::new();
    let mut frame = thread.last_frame();
    while kiln_deopt::interpreter::is_interpreter_pc(frame.pc) {
        let Some(state) = geometry.interpreter_state(thread.stack(), frame) else {
            break;
        };
        out.push((frame, state));
        match geometry.sender(thread.stack(), frame) {
            Some(sender) => frame = sender,
            None => break,
        }
    }
    out
}
