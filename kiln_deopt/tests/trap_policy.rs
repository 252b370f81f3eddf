//! Trap policy: how repeated uncommon traps escalate from recompiling to
//! reinterpreting to abandoning compilation.

mod common;

use common::{CODE, Fixture, fixture, java_frames, method};
use kiln_code::{CompiledMethod, DebugInfo, PcDesc, ScopeRecord, ScopeValue};
use kiln_core::{BasicType, KilnConfig, Method, MethodId, StackSlot, ThreadId};
use kiln_deopt::{
    DeoptAction, DeoptBlob, DeoptReason, Deoptimizer, InterpreterEntry, JavaThread, TrapDecision, TrapRequest,
    TrapState, deopt::TrapPolicy, deopt::TrapQuery,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::{Arc, Barrier};

const TRAP_BCI: i32 = 2;

/// Install code for `m` in its own `slot` of the code region.
fn install(fx: &Fixture, m: &Arc<Method>, slot: usize) -> Arc<CompiledMethod> {
    let mut info = DebugInfo::new();
    let scope = info.add_scope(
        ScopeRecord::new(m.clone(), TRAP_BCI)
            .with_locals(vec![ScopeValue::stack(0, BasicType::Int)])
            .with_reexecute(true),
    );
    fx.rt.install(
        CompiledMethod::new(fx.rt.code_cache().next_id(), m.clone(), CODE + slot * 0x1000, 0x100)
            .with_pc_descs(vec![PcDesc::new(0x10, scope, -1)])
            .with_debug_info(info)
            .with_frame_size(3),
    )
}

/// Run one trap on a fresh thread stopped in `nm`.
fn trap(d: &Deoptimizer, nm: &CompiledMethod, reason: DeoptReason, action: DeoptAction) -> TrapDecision {
    let mut t = JavaThread::with_stack_words(ThreadId(1), 256);
    t.push_compiled_frame(nm, nm.code_begin() + 0x10, &[(0, StackSlot::Int(1))]).unwrap();
    let request = TrapRequest::new(reason, action).encode();
    let block = DeoptBlob::new(d).execute_uncommon_trap(&mut t, request).unwrap();

    // the trapping bytecode runs again in the interpreter
    assert_eq!(t.last_frame().pc, InterpreterEntry::DeoptReexecute.pc());
    assert_eq!(java_frames(d.runtime(), &t), vec![(nm.method().id(), TRAP_BCI)]);
    block.trap_decision.unwrap()
}

#[test]
fn test_repeated_traps_escalate() {
    let fx = fixture(KilnConfig::aggressive());
    let d = Deoptimizer::new(fx.rt.clone());
    let m = method(1, 0, 1, 2, 0);
    let nm = install(&fx, &m, 0);

    // first trap only records the reason
    assert_eq!(
        trap(&d, &nm, DeoptReason::NullCheck, DeoptAction::MaybeRecompile),
        TrapDecision::RecompileEventually
    );
    assert!(nm.is_in_use());
    let record = d.history().bci_record(MethodId(1), TRAP_BCI).unwrap();
    assert!(record.state.has_reason(DeoptReason::NullCheck));
    assert!(!record.state.is_recompiled());

    // a repeat at the limit invalidates the code and notes the recompile
    assert_eq!(
        trap(&d, &nm, DeoptReason::NullCheck, DeoptAction::MaybeRecompile),
        TrapDecision::RecompileEventually
    );
    assert!(nm.is_not_entrant());
    assert_eq!(m.code(), None);
    assert_eq!(m.decompile_count(), 1);
    assert!(d.history().bci_record(MethodId(1), TRAP_BCI).unwrap().state.is_recompiled());

    // the recompiled code traps again at the same bytecode: profile afresh
    let nm2 = install(&fx, &m, 1);
    assert_eq!(
        trap(&d, &nm2, DeoptReason::NullCheck, DeoptAction::MaybeRecompile),
        TrapDecision::ForceReinterpret
    );
    assert!(nm2.is_not_entrant());
    assert_eq!(d.history().overflow_recompiles(MethodId(1)), 1);
    assert!(!m.is_not_compilable());

    // past the per-bytecode recompilation cutoff the method is given up
    let nm3 = install(&fx, &m, 2);
    assert_eq!(
        trap(&d, &nm3, DeoptReason::NullCheck, DeoptAction::MaybeRecompile),
        TrapDecision::ForceReinterpret
    );
    let nm4 = install(&fx, &m, 3);
    assert_eq!(
        trap(&d, &nm4, DeoptReason::NullCheck, DeoptAction::MaybeRecompile),
        TrapDecision::AbandonCompilation
    );
    assert!(m.is_not_compilable());

    assert_eq!(d.counters().uncommon_traps(), 5);
    assert_eq!(d.counters().count_for_decision(TrapDecision::ForceReinterpret), 2);
}

#[test]
fn test_per_method_limit_catches_spread_out_traps() {
    let fx = fixture(KilnConfig {
        per_bytecode_trap_limit: 100,
        per_method_trap_limit: 8,
        ..KilnConfig::default()
    });
    let d = Deoptimizer::new(fx.rt.clone());
    let m = method(1, 0, 1, 2, 0);
    let nm = install(&fx, &m, 0);

    // unhandled-bytecode traps are only counted per method
    for _ in 0..7 {
        assert_eq!(
            trap(&d, &nm, DeoptReason::Unhandled, DeoptAction::MaybeRecompile),
            TrapDecision::RecompileEventually
        );
        assert!(nm.is_in_use());
    }
    trap(&d, &nm, DeoptReason::Unhandled, DeoptAction::MaybeRecompile);
    assert!(nm.is_not_entrant());
    assert_eq!(d.history().method_trap_count(MethodId(1), DeoptReason::Unhandled), 8);
    assert_eq!(d.history().bci_record(MethodId(1), TRAP_BCI), None);
}

#[test]
fn test_racing_traps_invalidate_once() {
    let fx = fixture(KilnConfig::default());
    let d = Deoptimizer::new(fx.rt.clone());
    let m = method(1, 0, 1, 2, 0);
    let nm = install(&fx, &m, 0);
    let barrier = Barrier::new(4);

    std::thread::scope(|s| {
        for id in 0..4 {
            let (d, nm, barrier) = (&d, &nm, &barrier);
            s.spawn(move || {
                let mut t = JavaThread::with_stack_words(ThreadId(id + 1), 256);
                t.push_compiled_frame(nm, nm.code_begin() + 0x10, &[]).unwrap();
                let request = TrapRequest::new(DeoptReason::RangeCheck, DeoptAction::MakeNotEntrant).encode();
                barrier.wait();
                DeoptBlob::new(d).execute_uncommon_trap(&mut t, request).unwrap();
            });
        }
    });

    assert!(nm.is_not_entrant());
    assert_eq!(m.decompile_count(), 1);
    assert_eq!(d.counters().lost_invalidations(), 3);
    assert_eq!(d.counters().uncommon_traps(), 4);
}

#[test]
fn test_stale_activations_do_not_escalate() {
    let fx = fixture(KilnConfig::aggressive());
    let d = Deoptimizer::new(fx.rt.clone());
    let m = method(1, 0, 1, 2, 0);
    let nm = install(&fx, &m, 0);

    let decisions: Vec<_> = (0..5)
        .map(|_| trap(&d, &nm, DeoptReason::NullCheck, DeoptAction::MaybeRecompile))
        .collect();
    // only the activation that invalidated the code escalates
    assert_eq!(
        decisions,
        vec![
            TrapDecision::RecompileEventually,
            TrapDecision::RecompileEventually,
            TrapDecision::Ignore,
            TrapDecision::Ignore,
            TrapDecision::Ignore,
        ]
    );
    assert_eq!(m.decompile_count(), 1);
    assert_eq!(d.history().overflow_recompiles(MethodId(1)), 0);
    assert!(!m.is_not_compilable());
    assert_eq!(d.counters().lost_invalidations(), 3);
    assert_eq!(d.counters().count_for_decision(TrapDecision::Ignore), 3);
    assert_eq!(d.counters().uncommon_traps(), 5);
}

#[test]
fn test_many_is_absorbing() {
    let s = TrapState::EMPTY.add_reason(DeoptReason::NullCheck);
    assert_eq!(s.reason(), Some(DeoptReason::NullCheck));
    assert!(!s.has_reason(DeoptReason::RangeCheck));

    let many = s.add_reason(DeoptReason::RangeCheck);
    assert!(many.is_many());
    assert_eq!(many.reason(), None);
    // "many" may hide any reason, so every query answers yes
    assert!(many.has_reason(DeoptReason::ClassCheck));
    assert_eq!(many.add_reason(DeoptReason::NullCheck), many);
    assert_eq!(many.to_string(), "many");
}

// =============================================================================
// Properties
// =============================================================================

fn escalating_action() -> impl Strategy<Value = DeoptAction> {
    prop_oneof![
        Just(DeoptAction::MaybeRecompile),
        Just(DeoptAction::MakeNotEntrant),
        Just(DeoptAction::Reinterpret),
    ]
}

fn per_bytecode_reason() -> impl Strategy<Value = DeoptReason> {
    (1u8..=7).prop_filter_map("per-bytecode reason", DeoptReason::from_u8)
}

proptest! {
    /// A trap past the per-bytecode limit where the code was already
    /// recompiled once sends the method back to the interpreter.
    #[test]
    fn prop_repeat_after_recompile_reinterprets(
        limit in 1u32..16,
        extra in 0u32..16,
        cutoff in 1u32..32,
        overflow_seed in 0u32..32,
        decompiles_seed in 0u32..64,
        action in escalating_action(),
    ) {
        let config = KilnConfig {
            per_bytecode_trap_limit: limit,
            per_bytecode_recompilation_cutoff: cutoff,
            ..KilnConfig::default()
        };
        let query = TrapQuery {
            this_trap_count: limit + extra,
            per_method_count: 1,
            maybe_prior_trap: true,
            maybe_prior_recompile: true,
            // below the cutoff once this recompile is counted
            overflow_recompiles: overflow_seed % cutoff,
        };
        let decompiles = decompiles_seed % config.per_method_recompilation_cutoff;
        let policy = TrapPolicy::decide(&config, action, Some(&query), decompiles);
        prop_assert!(policy.make_not_entrant);
        prop_assert!(policy.inc_recompile_count);
        prop_assert_eq!(policy.decision(), TrapDecision::ForceReinterpret);
    }

    /// Adding reasons only ever moves up the lattice none < one < many.
    #[test]
    fn prop_trap_state_lattice(
        reasons in prop::collection::vec(per_bytecode_reason(), 1..6),
        recompiled in any::<bool>(),
    ) {
        let mut state = TrapState::EMPTY.set_recompiled(recompiled);
        for &r in &reasons {
            let next = state.add_reason(r);
            prop_assert!(next.has_reason(r));
            prop_assert_eq!(next.is_recompiled(), recompiled);
            if state.is_many() {
                prop_assert_eq!(next, state);
            }
            state = next;
        }
        let distinct = reasons.iter().collect::<std::collections::HashSet<_>>().len();
        prop_assert_eq!(state.is_many(), distinct > 1);
        if distinct == 1 {
            prop_assert_eq!(state.reason(), Some(reasons[0]));
        }
    }
}
