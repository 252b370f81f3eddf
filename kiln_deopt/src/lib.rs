//! Deoptimization runtime for the Kiln VM.
//!
//! Turns running compiled activations back into interpreter activations
//! and walks thread stacks for the runtime and for asynchronous samplers.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                              Runtime                                  │
//! │   code cache · method registry · heap · monitors · frame geometry     │
//! └───────────────┬───────────────────────────────┬───────────────────────┘
//!                 │                               │
//!         ┌───────▼────────┐              ┌───────▼────────┐
//!         │  StackWalker   │              │  Deoptimizer   │
//!         │ classify, skip │              │ trap policy,   │
//!         │ C frames, walk │              │ realloc/relock │
//!         │ inlined scopes │              │ UnrollBlock    │
//!         └───────┬────────┘              └───────┬────────┘
//!                 │                               │
//!         ┌───────▼───────────────────────────────▼────────┐
//!         │ JavaThread: ThreadStack, frames, VFrameArray   │
//!         └────────────────────────────────────────────────┘
//! ```
//!
//! - [`stack`], [`thread`]: word-addressed stacks and per-thread state
//! - [`geometry`]: interpreter frame layout behind [`FrameGeometry`]
//! - [`stack_walker`]: the frame iterator shared by the runtime and samplers
//! - [`vframe_array`]: capture and unpacking of logical frames
//! - [`deopt`]: the driver, trap history and policy, and the blob that
//!   swaps frames
//! - [`heap`], [`monitors`]: the allocation and locking services
//!   deoptimization relies on

pub mod deopt;
pub mod geometry;
pub mod heap;
pub mod interpreter;
pub mod monitors;
pub mod runtime;
pub mod stack;
pub mod stack_walker;
pub mod thread;
pub mod vframe_array;

pub use deopt::{
    DeoptAction, DeoptBlob, DeoptCounters, DeoptReason, Deoptimizer, ExecMode, TrapDecision, TrapHistory,
    TrapRequest, TrapState, UnrollBlock,
};
pub use geometry::{ActivationShape, CallerKind, FrameGeometry, InterpreterLayout, Word64Geometry};
pub use heap::{ArenaHeap, ClassInfo, FieldInfo, Heap};
pub use interpreter::InterpreterEntry;
pub use monitors::{LockTable, MonitorService};
pub use runtime::{CodeKind, Runtime};
pub use stack::{Frame, RegisterMap, ThreadStack};
pub use stack_walker::{CallFrame, StackWalker, WalkState, sample_call_trace};
pub use thread::{JavaThread, NoSafepointScope, PendingException};
pub use vframe_array::{MonitorInfo, VFrameArray, VFrameElement};
