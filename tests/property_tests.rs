//! Property tests for the kernel's core data structures.
//!
//! Runs on host (x86_64) only; proptest is not available for ESP32 targets.
//! On ESP32, these tests are compiled out.

#![cfg(not(target_os = "espidf"))]

use atrium_kernel::action::split_name;
use atrium_kernel::config::KernelConfig;
use atrium_kernel::dataflow::{BinaryOp, SignalKind, SignalValue};
use atrium_kernel::event::{EventId, TriggerHandle};
use atrium_kernel::kernel::Kernel;
use proptest::prelude::*;

// ── Handles and names ─────────────────────────────────────────

proptest! {
    #[test]
    fn trigger_handle_packs_event_and_index(event in 1u16..=u16::MAX, index in any::<u16>()) {
        let h = TriggerHandle::new(EventId::from_raw(event), index);
        prop_assert_eq!(h.event(), EventId::from_raw(event));
        prop_assert_eq!(h.index(), index);
        prop_assert_eq!(TriggerHandle::from_raw(h.raw()), h);
    }

    #[test]
    fn split_name_separates_first_word(
        name in "[a-z]{1,8}![a-z]{1,8}",
        arg in "[a-z0-9][a-z0-9 ]{0,12}",
        pad in 1usize..4,
    ) {
        let cmd = format!("{name}{}{arg}", " ".repeat(pad));
        prop_assert_eq!(split_name(&cmd), (name.as_str(), Some(arg.as_str())));
        prop_assert_eq!(split_name(&name), (name.as_str(), None));
    }
}

// ── Value semantics ───────────────────────────────────────────

proptest! {
    #[test]
    fn mixed_equality_is_symmetric(a in -1_000_000i64..1_000_000, b in -1.0e6f64..1.0e6) {
        let l = BinaryOp::Equal.apply(SignalValue::Int(a), SignalValue::Float(b));
        let r = BinaryOp::Equal.apply(SignalValue::Float(b), SignalValue::Int(a));
        prop_assert_eq!(l, r);
    }

    #[test]
    fn mixed_less_promotes_to_float(a in any::<i32>(), b in -1.0e10f64..1.0e10) {
        let got = BinaryOp::Less.apply(SignalValue::Int(a.into()), SignalValue::Float(b));
        prop_assert_eq!(got, Some(SignalValue::from(f64::from(a) < b)));
    }

    #[test]
    fn comparisons_yield_int_booleans(a in any::<i64>(), b in any::<i64>()) {
        for op in [BinaryOp::Less, BinaryOp::LessEqual, BinaryOp::Equal] {
            let v = op.apply(SignalValue::Int(a), SignalValue::Int(b));
            prop_assert!(matches!(v, Some(SignalValue::Int(0 | 1))));
        }
    }

    #[test]
    fn float_to_int_truncates_toward_zero(f in -1.0e12f64..1.0e12) {
        let v = SignalValue::Float(f).coerce(SignalKind::Int);
        prop_assert_eq!(v.kind(), SignalKind::Int);
        let i = v.as_int().unwrap_or_default();
        prop_assert!((i as f64).abs() <= f.abs());
        prop_assert!((f - i as f64).abs() < 1.0);
    }

    #[test]
    fn int_text_parses_back(i in any::<i32>()) {
        let text = i.to_string();
        prop_assert_eq!(
            SignalValue::parse(SignalKind::Int, &text),
            Some(SignalValue::Int(i.into()))
        );
    }
}

// ── Event accounting ──────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Op {
    Attached,
    AttachedArg,
    NoWait,
    Unattached,
    UnattachedArg,
    Invalid,
    InvalidArg,
    Isr,
    IsrArg,
    IsrInvalid,
    Drain,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Attached),
        2 => Just(Op::AttachedArg),
        3 => Just(Op::NoWait),
        1 => Just(Op::Unattached),
        1 => Just(Op::UnattachedArg),
        1 => Just(Op::Invalid),
        1 => Just(Op::InvalidArg),
        2 => Just(Op::Isr),
        2 => Just(Op::IsrArg),
        1 => Just(Op::IsrInvalid),
        2 => Just(Op::Drain),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every trigger ends up in exactly one counter.
    #[test]
    fn every_trigger_is_accounted_once(ops in proptest::collection::vec(op(), 0..80)) {
        let k = Kernel::new(KernelConfig {
            send_timeout_ms: 1,
            ..KernelConfig::default()
        })
        .unwrap();
        k.register_action("sink!put", |_| {}, None, None).unwrap();
        let attached = k.register_event("prop", Some("`attached")).unwrap();
        let unattached = k.register_event("prop", Some("`unattached")).unwrap();
        k.attach_callback(attached, "sink!put").unwrap();

        let invalid = EventId::from_raw(500);
        let mut triggers = 0u32;
        for op in ops {
            match op {
                Op::Attached => k.trigger(attached),
                Op::AttachedArg => k.trigger_with_arg(attached, "on".into()),
                Op::NoWait => k.events().trigger_nowait(attached),
                Op::Unattached => k.trigger(unattached),
                Op::UnattachedArg => k.trigger_with_arg(unattached, "x".into()),
                Op::Invalid => k.trigger(invalid),
                Op::InvalidArg => k.trigger_with_arg(invalid, "x".into()),
                Op::Isr => k.isr_trigger(attached),
                Op::IsrArg => k.isr_trigger_with_arg(attached, "7".into()),
                Op::IsrInvalid => k.isr_trigger(invalid),
                Op::Drain => {
                    k.events().drain();
                    continue;
                }
            }
            triggers += 1;
        }
        k.events().drain();

        let c = k.events().counters();
        prop_assert_eq!(c.processed + c.discarded + c.lost + c.invalid, triggers);
        prop_assert_eq!(k.events().pending(), 0);
    }
}
