//! Compiled call sites (inline caches).
//!
//! Each call instruction in compiled code carries an inline cache that is
//! either clean (goes through the resolver), bound to a compiled or
//! interpreted target, or megamorphic (goes through a dispatch stub). A
//! monomorphic virtual cache also remembers the receiver class it was
//! bound for; that cached metadata must be dropped when the class dies.
//!
//! ```text
//!            resolve            class miss
//!   Clean ───────────▶ Compiled ───────────▶ Megamorphic
//!     ▲                   │
//!     └───────────────────┘  target not entrant / unloaded
//! ```

use kiln_core::{ClassId, CompiledId, MethodId};
use parking_lot::Mutex;

/// How a call site dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Statically bound call.
    Static,
    /// Virtual call proven monomorphic at compile time.
    OptVirtual,
    /// Virtual call with a receiver-class check.
    Virtual,
}

/// Current destination of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcTarget {
    /// Unresolved; the next call goes through the resolver.
    Clean,
    /// Calls the interpreter entry of a method.
    Interpreted(MethodId),
    /// Calls compiled code directly.
    Compiled(CompiledId),
    /// Calls through the vtable stub.
    Megamorphic,
}

#[derive(Debug, Clone, Copy)]
struct IcState {
    target: IcTarget,
    cached_class: Option<ClassId>,
}

/// One call site of a compiled method.
#[derive(Debug)]
pub struct CompiledIc {
    call_offset: u32,
    kind: CallKind,
    state: Mutex<IcState>,
}

impl CompiledIc {
    /// A clean call site at `call_offset`.
    pub fn new(call_offset: u32, kind: CallKind) -> Self {
        Self {
            call_offset,
            kind,
            state: Mutex::new(IcState {
                target: IcTarget::Clean,
                cached_class: None,
            }),
        }
    }

    #[inline]
    pub fn call_offset(&self) -> u32 {
        self.call_offset
    }

    #[inline]
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    #[inline]
    pub fn target(&self) -> IcTarget {
        self.state.lock().target
    }

    /// Receiver class of a monomorphic virtual cache.
    #[inline]
    pub fn cached_class(&self) -> Option<ClassId> {
        self.state.lock().cached_class
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        self.target() == IcTarget::Clean
    }

    /// Bind to compiled code. Virtual sites remember the receiver class.
    pub fn set_to_compiled(&self, target: CompiledId, receiver: Option<ClassId>) {
        let mut state = self.state.lock();
        state.target = IcTarget::Compiled(target);
        state.cached_class = if self.kind == CallKind::Virtual { receiver } else { None };
    }

    pub fn set_to_interpreted(&self, method: MethodId) {
        let mut state = self.state.lock();
        state.target = IcTarget::Interpreted(method);
        state.cached_class = None;
    }

    pub fn set_to_megamorphic(&self) {
        let mut state = self.state.lock();
        state.target = IcTarget::Megamorphic;
        state.cached_class = None;
    }

    /// Reset to the unresolved state. Returns `true` if the site changed.
    pub fn set_to_clean(&self) -> bool {
        let mut state = self.state.lock();
        let changed = state.target != IcTarget::Clean || state.cached_class.is_some();
        state.target = IcTarget::Clean;
        state.cached_class = None;
        changed
    }

    /// Clean the site if `pred` holds for its current target, atomically
    /// with respect to other updates of this site.
    pub fn clean_if(&self, pred: impl FnOnce(IcTarget, Option<ClassId>) -> bool) -> bool {
        let mut state = self.state.lock();
        if state.target == IcTarget::Clean || !pred(state.target, state.cached_class) {
            return false;
        }
        state.target = IcTarget::Clean;
        state.cached_class = None;
        true
    }
}
