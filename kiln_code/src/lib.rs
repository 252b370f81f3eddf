//! Compiled-code metadata for the Kiln VM.
//!
//! Everything the runtime needs to know about a piece of compiled code
//! after the compiler is done with it:
//!
//! - [`pc_desc`]: pc → scope descriptor tables and their lookup cache
//! - [`scope`]: serialized logical frames, values and eliminated objects
//! - [`exception_cache`]: snapshot-read cache of exception handlers
//! - [`inline_cache`]: call sites and their targets
//! - [`compiled_method`]: the [`CompiledMethod`] and its lifecycle
//! - [`unloading`]: single-pass and two-phase unloading after GC
//! - [`code_cache`]: the registry tying it together
#![forbid(unsafe_code)]

pub mod code_cache;
pub mod compiled_method;
pub mod exception_cache;
pub mod inline_cache;
pub mod pc_desc;
pub mod scope;
pub mod unloading;

pub use code_cache::{CodeCache, CollectorMode, SweepStats, UnloadingStats};
pub use compiled_method::{CollectorLink, CompiledMethod, CompiledState};
pub use exception_cache::{EXCEPTION_CACHE_CAPACITY, ExceptionCache};
pub use inline_cache::{CallKind, CompiledIc, IcTarget};
pub use pc_desc::{PC_DESC_CACHE_SIZE, PcDesc, PcDescCache, PcDescFlags, PcDescTable, SERIALIZED_NULL};
pub use scope::{
    DebugInfo, Location, MonitorValue, ObjectKind, ObjectValue, ScopeDesc, ScopeRecord, ScopeValue,
};
pub use unloading::{IsAlive, PostponedIcs, UnloadOutcome, UnloadingClock};
