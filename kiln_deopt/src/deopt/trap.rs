//! Uncommon traps: reasons, actions, history and policy.
//!
//! Compiled code speculates (a null check never fails, a call site only
//! ever sees one class) and plants an uncommon trap where the speculation
//! could break. Each trap carries a packed request naming the reason and
//! the action the compiler suggests. The runtime combines that with the
//! trap history of the bytecode to decide what happens to the code.
//!
//! # Per-Bytecode Trap State
//!
//! Each bytecode remembers, in one byte, the reasons it has trapped for
//! and whether a recompilation already followed a trap there:
//!
//! ```text
//!   bit 4      bits 0..3
//! ┌──────────┬──────────────────────────────┐
//! │ recompil │ 0 = none, 1..7 = reason,     │
//! │          │ 15 = many (several reasons)  │
//! └──────────┴──────────────────────────────┘
//! ```
//!
//! A second, different reason collapses the state to "many", which then
//! answers "maybe" for every reason. Nothing ever leaves "many".

use dashmap::DashMap;
use kiln_core::{Bci, KilnConfig, MethodId};
use rustc_hash::FxHashMap;
use std::fmt;

// =============================================================================
// Reasons and actions
// =============================================================================

/// Why compiled code trapped.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptReason {
    None = 0,
    NullCheck = 1,
    NullAssert = 2,
    RangeCheck = 3,
    ClassCheck = 4,
    ArrayCheck = 5,
    Intrinsic = 6,
    Bimorphic = 7,
    /// A class the code depends on was not yet loaded.
    Unloaded = 8,
    Uninitialized = 9,
    /// Code the profile said was never reached.
    Unreached = 10,
    Unhandled = 11,
    Constraint = 12,
    Div0Check = 13,
    Age = 14,
    Predicate = 15,
    LoopLimitCheck = 16,
}

/// Number of reasons, for per-reason tables.
pub const REASON_LIMIT: usize = 17;

impl DeoptReason {
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::NullCheck,
            2 => Self::NullAssert,
            3 => Self::RangeCheck,
            4 => Self::ClassCheck,
            5 => Self::ArrayCheck,
            6 => Self::Intrinsic,
            7 => Self::Bimorphic,
            8 => Self::Unloaded,
            9 => Self::Uninitialized,
            10 => Self::Unreached,
            11 => Self::Unhandled,
            12 => Self::Constraint,
            13 => Self::Div0Check,
            14 => Self::Age,
            15 => Self::Predicate,
            16 => Self::LoopLimitCheck,
            _ => return None,
        })
    }

    /// Reasons tracked individually in the per-bytecode trap state.
    #[inline]
    pub const fn is_recorded_per_bytecode(self) -> bool {
        !matches!(self, Self::None) && (self as u8) <= Self::Bimorphic as u8
    }

    /// The reason to record in the per-bytecode state, if any. A failed
    /// division check is an implicit null check on the divisor.
    #[inline]
    pub const fn recorded_per_bytecode_if_any(self) -> Option<Self> {
        if self.is_recorded_per_bytecode() {
            Some(self)
        } else if matches!(self, Self::Div0Check) {
            Some(Self::NullCheck)
        } else {
            None
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::NullCheck => "null_check",
            Self::NullAssert => "null_assert",
            Self::RangeCheck => "range_check",
            Self::ClassCheck => "class_check",
            Self::ArrayCheck => "array_check",
            Self::Intrinsic => "intrinsic",
            Self::Bimorphic => "bimorphic",
            Self::Unloaded => "unloaded",
            Self::Uninitialized => "uninitialized",
            Self::Unreached => "unreached",
            Self::Unhandled => "unhandled",
            Self::Constraint => "constraint",
            Self::Div0Check => "div0_check",
            Self::Age => "age",
            Self::Predicate => "predicate",
            Self::LoopLimitCheck => "loop_limit_check",
        }
    }
}

impl fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the compiler asks the runtime to do after a trap.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptAction {
    /// Just interpret; the code stays valid.
    None = 0,
    /// Keep the code, recompile once traps pile up.
    MaybeRecompile = 1,
    /// Invalidate the code and gather a fresh profile.
    Reinterpret = 2,
    /// Invalidate the code.
    MakeNotEntrant = 3,
    /// Invalidate the code and never compile the method again.
    MakeNotCompilable = 4,
}

/// Number of actions, for per-action tables.
pub const ACTION_LIMIT: usize = 5;

impl DeoptAction {
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::MaybeRecompile,
            2 => Self::Reinterpret,
            3 => Self::MakeNotEntrant,
            4 => Self::MakeNotCompilable,
            _ => return None,
        })
    }
}

// =============================================================================
// Trap requests
// =============================================================================

/// A decoded trap request.
///
/// Compiled code passes requests as one negative `i32`:
/// `!((index + 1) << 8 | action << 5 | reason)`, with index 0 meaning "no
/// constant-pool index".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapRequest {
    pub reason: DeoptReason,
    pub action: DeoptAction,
    /// Constant-pool index of an unloaded class, if the trap names one.
    pub index: Option<u32>,
}

impl TrapRequest {
    const REASON_BITS: u32 = 5;
    const ACTION_SHIFT: u32 = 5;
    const ACTION_BITS: u32 = 3;
    const INDEX_SHIFT: u32 = 8;

    pub const fn new(reason: DeoptReason, action: DeoptAction) -> Self {
        Self { reason, action, index: None }
    }

    pub const fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    /// Pack into the form compiled code passes.
    ///
    /// # Panics
    ///
    /// Panics if the index does not fit in 23 bits.
    pub fn encode(self) -> i32 {
        let index = self.index.map_or(0, |i| i + 1);
        assert!(index < (1 << (31 - Self::INDEX_SHIFT)), "trap index {index} too large");
        let raw = ((index as i32) << Self::INDEX_SHIFT)
            | ((self.action as i32) << Self::ACTION_SHIFT)
            | self.reason as i32;
        !raw
    }

    /// Unpack a request; `None` for non-negative or malformed values.
    pub fn decode(request: i32) -> Option<Self> {
        if request >= 0 {
            return None;
        }
        let raw = !request;
        let reason = DeoptReason::from_u8((raw & ((1 << Self::REASON_BITS) - 1)) as u8)?;
        let action =
            DeoptAction::from_u8(((raw >> Self::ACTION_SHIFT) & ((1 << Self::ACTION_BITS) - 1)) as u8)?;
        let index = (raw >> Self::INDEX_SHIFT) as u32;
        Some(Self {
            reason,
            action,
            index: index.checked_sub(1),
        })
    }
}

// =============================================================================
// Trap state
// =============================================================================

/// Per-bytecode trap state byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TrapState(u8);

impl TrapState {
    const REASON_MASK: u8 = 0x0f;
    const MANY: u8 = Self::REASON_MASK;
    const RECOMPILE_BIT: u8 = 0x10;

    pub const EMPTY: TrapState = TrapState(0);

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & (Self::REASON_MASK | Self::RECOMPILE_BIT))
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// The single recorded reason, `None` when empty or "many".
    #[inline]
    pub const fn reason(self) -> Option<DeoptReason> {
        match self.0 & Self::REASON_MASK {
            0 | Self::MANY => None,
            r => DeoptReason::from_u8(r),
        }
    }

    /// More than one reason was recorded.
    #[inline]
    pub const fn is_many(self) -> bool {
        self.0 & Self::REASON_MASK == Self::MANY
    }

    /// Whether a trap for `reason` may have happened here. "Many" answers
    /// yes for every reason.
    #[inline]
    pub const fn has_reason(self, reason: DeoptReason) -> bool {
        let r = self.0 & Self::REASON_MASK;
        r == Self::MANY || (r != 0 && r == reason as u8)
    }

    /// Record `reason`, collapsing to "many" on a second distinct reason.
    pub const fn add_reason(self, reason: DeoptReason) -> Self {
        let recompile = self.0 & Self::RECOMPILE_BIT;
        let current = self.0 - recompile;
        let r = reason as u8;
        let next = if current == Self::MANY || current == r {
            current
        } else if current == 0 {
            r
        } else {
            Self::MANY
        };
        Self(next + recompile)
    }

    #[inline]
    pub const fn is_recompiled(self) -> bool {
        self.0 & Self::RECOMPILE_BIT != 0
    }

    #[inline]
    pub const fn set_recompiled(self, recompiled: bool) -> Self {
        if recompiled {
            Self(self.0 | Self::RECOMPILE_BIT)
        } else {
            Self(self.0 & !Self::RECOMPILE_BIT)
        }
    }
}

impl fmt::Debug for TrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrapState({self})")
    }
}

impl fmt::Display for TrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_many() {
            f.write_str("many")?;
        } else if let Some(reason) = self.reason() {
            f.write_str(reason.name())?;
        } else {
            f.write_str("none")?;
        }
        if self.is_recompiled() {
            f.write_str(" recompiled")?;
        }
        Ok(())
    }
}

// =============================================================================
// Trap history
// =============================================================================

/// Trap record of one bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BciTrapRecord {
    pub state: TrapState,
    pub count: u32,
}

#[derive(Debug, Default)]
struct MethodTraps {
    per_bci: FxHashMap<Bci, BciTrapRecord>,
    per_reason: [u32; REASON_LIMIT],
    overflow_recompiles: u32,
}

/// What the history said about a trap, before this trap was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapQuery {
    /// Traps at this bytecode, this one included. For reasons not tracked
    /// per bytecode, the per-method count.
    pub this_trap_count: u32,
    /// Traps of this reason anywhere in the method, this one included.
    pub per_method_count: u32,
    pub maybe_prior_trap: bool,
    pub maybe_prior_recompile: bool,
    pub overflow_recompiles: u32,
}

/// Trap history of every method, shared by all threads.
#[derive(Debug, Default)]
pub struct TrapHistory {
    methods: DashMap<MethodId, MethodTraps>,
}

impl TrapHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a trap for `reason` at `bci` and report the prior history.
    pub fn query_update(&self, method: MethodId, bci: Bci, reason: DeoptReason) -> TrapQuery {
        let mut traps = self.methods.entry(method).or_default();
        let slot = &mut traps.per_reason[reason as usize];
        let prior = *slot;
        *slot = prior.saturating_add(1);

        let mut query = TrapQuery {
            this_trap_count: prior.saturating_add(1),
            per_method_count: prior.saturating_add(1),
            maybe_prior_trap: prior != 0,
            maybe_prior_recompile: false,
            overflow_recompiles: traps.overflow_recompiles,
        };
        if let Some(per_bc) = reason.recorded_per_bytecode_if_any() {
            let record = traps.per_bci.entry(bci).or_default();
            query.maybe_prior_trap = record.state.has_reason(per_bc);
            query.maybe_prior_recompile = record.state.is_recompiled();
            record.state = record.state.add_reason(per_bc);
            record.count = record.count.saturating_add(1);
            query.this_trap_count = record.count;
        }
        query
    }

    /// Note that the code trapping at `bci` was thrown away.
    pub fn record_recompile(&self, method: MethodId, bci: Bci) {
        let mut traps = self.methods.entry(method).or_default();
        let record = traps.per_bci.entry(bci).or_default();
        record.state = record.state.set_recompiled(true);
    }

    /// Count a recompilation caused by repeated traps at one bytecode.
    pub fn inc_overflow_recompiles(&self, method: MethodId) -> u32 {
        let mut traps = self.methods.entry(method).or_default();
        traps.overflow_recompiles = traps.overflow_recompiles.saturating_add(1);
        traps.overflow_recompiles
    }

    pub fn bci_record(&self, method: MethodId, bci: Bci) -> Option<BciTrapRecord> {
        self.methods.get(&method)?.per_bci.get(&bci).copied()
    }

    /// Edit the record of one bytecode, creating it if needed.
    pub fn update_bci(&self, method: MethodId, bci: Bci, f: impl FnOnce(&mut BciTrapRecord)) {
        let mut traps = self.methods.entry(method).or_default();
        f(traps.per_bci.entry(bci).or_default());
    }

    pub fn method_trap_count(&self, method: MethodId, reason: DeoptReason) -> u32 {
        self.methods.get(&method).map_or(0, |t| t.per_reason[reason as usize])
    }

    pub fn overflow_recompiles(&self, method: MethodId) -> u32 {
        self.methods.get(&method).map_or(0, |t| t.overflow_recompiles)
    }

    /// Forget a method, e.g. when it is redefined.
    pub fn clear(&self, method: MethodId) {
        self.methods.remove(&method);
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Overall outcome of a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapDecision {
    /// Interpret this once; nothing else changes.
    Ignore,
    /// Keep running compiled code or let it be recompiled on demand.
    RecompileEventually,
    /// Invalidate the code and profile from scratch in the interpreter.
    ForceReinterpret,
    /// Give up compiling the method.
    AbandonCompilation,
}

impl fmt::Display for TrapDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrapDecision::Ignore => "ignore",
            TrapDecision::RecompileEventually => "recompile-eventually",
            TrapDecision::ForceReinterpret => "reinterpret",
            TrapDecision::AbandonCompilation => "abandon",
        })
    }
}

/// The individual steps a trap triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapPolicy {
    pub make_not_entrant: bool,
    pub make_not_compilable: bool,
    pub reprofile: bool,
    pub inc_recompile_count: bool,
    /// The compiler asked to keep the code and recompile later.
    pub maybe_recompile: bool,
}

impl TrapPolicy {
    /// Combine the requested action with the trap history.
    ///
    /// `query` is `None` when the action asks for no history update.
    /// `decompile_count` is the method's decompilations so far.
    pub fn decide(
        config: &KilnConfig,
        action: DeoptAction,
        query: Option<&TrapQuery>,
        decompile_count: u32,
    ) -> Self {
        let mut policy = Self::default();
        match action {
            DeoptAction::None => return policy,
            DeoptAction::MaybeRecompile => policy.maybe_recompile = true,
            DeoptAction::Reinterpret => {
                policy.make_not_entrant = true;
                policy.reprofile = true;
            }
            DeoptAction::MakeNotEntrant => policy.make_not_entrant = true,
            DeoptAction::MakeNotCompilable => {
                policy.make_not_entrant = true;
                policy.make_not_compilable = true;
            }
        }

        if let Some(q) = query {
            if q.maybe_prior_trap && q.this_trap_count >= config.per_bytecode_trap_limit {
                policy.make_not_entrant = true;
            }
            if q.per_method_count >= config.per_method_trap_limit {
                policy.make_not_entrant = true;
            }
            // Repeated recompilation at the same bytecode: profile again and
            // count it against the cutoff.
            if policy.make_not_entrant && q.maybe_prior_recompile {
                policy.inc_recompile_count = q.maybe_prior_trap;
                policy.reprofile = true;
            }
            if policy.inc_recompile_count
                && q.overflow_recompiles.saturating_add(1) > config.per_bytecode_recompilation_cutoff
            {
                policy.make_not_compilable = true;
            }
        }

        if policy.make_not_entrant && decompile_count >= config.per_method_recompilation_cutoff {
            policy.make_not_compilable = true;
        }
        policy
    }

    pub fn decision(&self) -> TrapDecision {
        if self.make_not_compilable {
            TrapDecision::AbandonCompilation
        } else if self.reprofile {
            TrapDecision::ForceReinterpret
        } else if self.make_not_entrant || self.maybe_recompile {
            TrapDecision::RecompileEventually
        } else {
            TrapDecision::Ignore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_encoding() {
        let r = TrapRequest::new(DeoptReason::ClassCheck, DeoptAction::MaybeRecompile);
        let raw = r.encode();
        assert!(raw < 0);
        assert_eq!(raw, !((1 << 5) | 4));
        assert_eq!(TrapRequest::decode(raw), Some(r));

        let r = TrapRequest::new(DeoptReason::Unloaded, DeoptAction::Reinterpret).with_index(0);
        assert_eq!(TrapRequest::decode(r.encode()), Some(r));
        let r = r.with_index(12345);
        assert_eq!(TrapRequest::decode(r.encode()).unwrap().index, Some(12345));
    }

    #[test]
    fn test_request_rejects_garbage() {
        assert_eq!(TrapRequest::decode(0), None);
        assert_eq!(TrapRequest::decode(17), None);
        // reason 31 does not exist
        assert_eq!(TrapRequest::decode(!31), None);
        // action 7 does not exist
        assert_eq!(TrapRequest::decode(!(7 << 5)), None);
    }

    #[test]
    fn test_state_lattice() {
        let s = TrapState::EMPTY;
        assert!(!s.has_reason(DeoptReason::NullCheck));
        let s = s.add_reason(DeoptReason::NullCheck);
        assert_eq!(s.reason(), Some(DeoptReason::NullCheck));
        assert!(s.has_reason(DeoptReason::NullCheck));
        assert!(!s.has_reason(DeoptReason::RangeCheck));
        assert_eq!(s.add_reason(DeoptReason::NullCheck), s);

        let many = s.add_reason(DeoptReason::RangeCheck);
        assert!(many.is_many());
        assert_eq!(many.reason(), None);
        for r in [DeoptReason::NullCheck, DeoptReason::ClassCheck, DeoptReason::Bimorphic] {
            assert!(many.has_reason(r));
            assert_eq!(many.add_reason(r), many);
        }
    }

    #[test]
    fn test_lattice_keeps_recompile_bit() {
        let s = TrapState::EMPTY.add_reason(DeoptReason::ClassCheck).set_recompiled(true);
        let many = s.add_reason(DeoptReason::ArrayCheck);
        assert!(many.is_many());
        assert!(many.is_recompiled());
        assert_eq!(many.to_string(), "many recompiled");
        assert!(!many.set_recompiled(false).is_recompiled());
        assert_eq!(TrapState::from_bits(many.bits()), many);
    }

    #[test]
    fn test_per_bytecode_recording() {
        assert!(DeoptReason::Bimorphic.is_recorded_per_bytecode());
        assert!(!DeoptReason::Unloaded.is_recorded_per_bytecode());
        assert!(!DeoptReason::None.is_recorded_per_bytecode());
        assert_eq!(DeoptReason::Div0Check.recorded_per_bytecode_if_any(), Some(DeoptReason::NullCheck));
        assert_eq!(DeoptReason::Age.recorded_per_bytecode_if_any(), None);
    }

    #[test]
    fn test_history_query_update() {
        let h = TrapHistory::new();
        let m = MethodId(1);
        let q = h.query_update(m, 5, DeoptReason::NullCheck);
        assert!(!q.maybe_prior_trap);
        assert_eq!(q.this_trap_count, 1);
        let q = h.query_update(m, 5, DeoptReason::NullCheck);
        assert!(q.maybe_prior_trap);
        assert_eq!(q.this_trap_count, 2);
        assert_eq!(q.per_method_count, 2);

        // a different bytecode has its own state but shares the method count
        let q = h.query_update(m, 9, DeoptReason::NullCheck);
        assert!(!q.maybe_prior_trap);
        assert_eq!(q.per_method_count, 3);

        h.record_recompile(m, 5);
        let q = h.query_update(m, 5, DeoptReason::RangeCheck);
        assert!(!q.maybe_prior_trap);
        assert!(q.maybe_prior_recompile);
        let rec = h.bci_record(m, 5).unwrap();
        assert!(rec.state.is_many());
        assert!(rec.state.is_recompiled());
    }

    #[test]
    fn test_unrecorded_reason_uses_method_count() {
        let h = TrapHistory::new();
        let m = MethodId(1);
        h.query_update(m, 0, DeoptReason::Unloaded);
        let q = h.query_update(m, 3, DeoptReason::Unloaded);
        assert!(q.maybe_prior_trap);
        assert_eq!(q.this_trap_count, 2);
        assert!(h.bci_record(m, 3).is_none());
    }

    fn query(count: u32, prior: bool, recompiled: bool) -> TrapQuery {
        TrapQuery {
            this_trap_count: count,
            per_method_count: count,
            maybe_prior_trap: prior,
            maybe_prior_recompile: recompiled,
            overflow_recompiles: 0,
        }
    }

    #[test]
    fn test_policy_outcomes() {
        let c = KilnConfig::default();
        let p = TrapPolicy::decide(&c, DeoptAction::None, None, 0);
        assert_eq!(p.decision(), TrapDecision::Ignore);

        let p = TrapPolicy::decide(&c, DeoptAction::MaybeRecompile, Some(&query(1, false, false)), 0);
        assert_eq!(p.decision(), TrapDecision::RecompileEventually);
        assert!(!p.make_not_entrant);

        // repeated traps at one bytecode invalidate the code
        let p = TrapPolicy::decide(&c, DeoptAction::MaybeRecompile, Some(&query(4, true, false)), 0);
        assert!(p.make_not_entrant);
        assert_eq!(p.decision(), TrapDecision::RecompileEventually);

        // ... and after a previous recompilation, force reprofiling
        let p = TrapPolicy::decide(&c, DeoptAction::MaybeRecompile, Some(&query(4, true, true)), 0);
        assert!(p.inc_recompile_count);
        assert_eq!(p.decision(), TrapDecision::ForceReinterpret);

        let p = TrapPolicy::decide(&c, DeoptAction::MakeNotCompilable, Some(&query(1, false, false)), 0);
        assert_eq!(p.decision(), TrapDecision::AbandonCompilation);
    }

    #[test]
    fn test_policy_cutoffs() {
        let c = KilnConfig::aggressive();
        let mut q = query(2, true, true);
        q.overflow_recompiles = 1;
        let p = TrapPolicy::decide(&c, DeoptAction::MaybeRecompile, Some(&q), 0);
        assert_eq!(p.decision(), TrapDecision::ForceReinterpret);
        q.overflow_recompiles = 2;
        let p = TrapPolicy::decide(&c, DeoptAction::MaybeRecompile, Some(&q), 0);
        assert_eq!(p.decision(), TrapDecision::AbandonCompilation);

        let p = TrapPolicy::decide(&c, DeoptAction::MakeNotEntrant, Some(&query(1, false, false)), 4);
        assert_eq!(p.decision(), TrapDecision::AbandonCompilation);
    }

    #[test]
    fn test_per_method_limit() {
        let c = KilnConfig::aggressive();
        let mut q = query(1, false, false);
        q.per_method_count = 8;
        let p = TrapPolicy::decide(&c, DeoptAction::MaybeRecompile, Some(&q), 0);
        assert!(p.make_not_entrant);
    }
}
