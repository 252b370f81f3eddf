//! Asynchronous sampling gives up after a bounded number of native frames
//! instead of scanning an arbitrarily deep native stack.

mod common;

use common::{CODE, fixture, method};
use kiln_code::{CompiledMethod, DebugInfo, PcDesc, ScopeRecord};
use kiln_core::{KilnConfig, MethodId, ThreadId};
use kiln_deopt::{JavaThread, StackWalker, WalkState, sample_call_trace};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const NATIVE_PC: usize = 0x5000;

/// A thread with one compiled Java frame under `natives` native frames.
fn thread_with_natives(fx: &common::Fixture, natives: usize) -> JavaThread {
    let m = method(1, 0, 1, 2, 0);
    let mut info = DebugInfo::new();
    let scope = info.add_scope(ScopeRecord::new(m.clone(), 3));
    let nm = fx.rt.install(
        CompiledMethod::new(fx.rt.code_cache().next_id(), m, CODE, 0x100)
            .with_pc_descs(vec![PcDesc::new(0x10, scope, -1)])
            .with_debug_info(info)
            .with_frame_size(2),
    );
    let mut t = JavaThread::with_stack_words(ThreadId(1), 8 * 1024);
    t.push_compiled_frame(&nm, CODE + 0x10, &[]).unwrap();
    for _ in 0..natives {
        t.push_native_frame(NATIVE_PC, 1).unwrap();
    }
    t
}

#[test]
fn test_deep_native_stack_reports_no_java_frame() {
    let fx = fixture(KilnConfig::default());
    let limit = fx.rt.config().max_c_frames_skip;
    let t = thread_with_natives(&fx, limit + 5);

    assert_eq!(sample_call_trace(&fx.rt, &t, 16), Err(WalkState::NoJavaFrame));

    let mut w = StackWalker::new_async(&fx.rt, &t);
    assert_eq!(w.start(), WalkState::NoJavaFrame);
    // the skipped frames plus the one that hit the limit, never the Java frame
    assert_eq!(w.frames_scanned(), limit + 1);
    assert!(w.method().is_none());
}

#[test]
fn test_java_frame_at_the_limit_is_found() {
    let fx = fixture(KilnConfig::default());
    let limit = fx.rt.config().max_c_frames_skip;
    let t = thread_with_natives(&fx, limit);

    let mut w = StackWalker::new_async(&fx.rt, &t);
    assert_eq!(w.start(), WalkState::CompiledFrame);
    assert_eq!(w.frames_scanned(), limit + 1);
    assert_eq!(w.method().map(|m| m.id()), Some(MethodId(1)));
    assert_eq!(w.bci(), 3);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_scan_is_bounded_by_skip_limit(limit in 0usize..12, natives in 0usize..24) {
        let fx = fixture(KilnConfig {
            max_c_frames_skip: limit,
            ..KilnConfig::default()
        });
        let t = thread_with_natives(&fx, natives);
        let mut w = StackWalker::new_async(&fx.rt, &t);
        let state = w.start();
        prop_assert!(w.frames_scanned() <= limit + 1);
        if natives <= limit {
            prop_assert_eq!(state, WalkState::CompiledFrame);
            prop_assert_eq!(w.frames_scanned(), natives + 1);
        } else {
            prop_assert_eq!(state, WalkState::NoJavaFrame);
            prop_assert_eq!(w.frames_scanned(), limit + 1);
        }
    }
}
