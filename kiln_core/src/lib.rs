//! Core vocabulary shared by every Kiln crate.
//!
//! This crate holds the small, dependency-light types that both the
//! compiled-code side (`kiln_code`) and the deoptimization runtime
//! (`kiln_deopt`) need to agree on:
//!
//! - identities for methods, classes, objects, threads and compiled code
//! - [`Method`] descriptors with their bytecode and mutable profile counters
//! - tagged interpreter slots ([`StackSlot`], [`SlotTag`], [`BasicType`])
//! - runtime tuning ([`KilnConfig`]) and the shared error type ([`KilnError`])

pub mod config;
pub mod error;
pub mod ids;
pub mod method;
pub mod slot;

pub use config::KilnConfig;
pub use error::{KilnError, KilnResult};
pub use ids::{ClassId, CompiledId, MethodId, ObjRef, ThreadId};
pub use method::{
    Bci, INVOCATION_ENTRY_BCI, Method, Opcode, SYNCHRONIZATION_ENTRY_BCI, normalize_bci,
};
pub use slot::{BasicType, SlotTag, SlotVec, StackSlot};
