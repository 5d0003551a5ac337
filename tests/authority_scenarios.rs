//! End-to-end gate scenarios: zone scoping, idempotency, θ policy, mode
//! posture, and the isolation of notification delivery from gate state.

use std::sync::Arc;

use thetagate::authority::gate::{AuthorityGate, GateConfig, SignalRequest};
use thetagate::authority::{AuthorityLayer, DenyReason};
use thetagate::mode::Mode;
use thetagate::notify::{Dispatcher, Notification, RecordingNotifier};
use thetagate::types::{Direction, Outcome, SizeTier};

fn short(id: &str, name: &str, price: f64, theta: u8) -> SignalRequest {
    SignalRequest::new(id, name, "OVERBOUGHT", Direction::Short, price, theta)
}

#[test]
fn test_two_losses_collapse_only_their_zone() {
    let gate = AuthorityGate::default();
    gate.record_outcome("OVERBOUGHT", Direction::Short, 21_520.0, Outcome::Loss, None);
    gate.record_outcome("OVERBOUGHT", Direction::Short, 21_590.0, Outcome::Loss, None);

    let d = gate.authorize(&short("s-1", "STB_SHORT", 21_550.0, 3));
    assert!(!d.allowed());
    assert_eq!(d.response.layer_failed, Some(AuthorityLayer::Zone));
    assert_eq!(d.consecutive_loss_same_zone, 2);
    assert!(d.reason_text().starts_with("Denied at Layer 2"));

    let long = SignalRequest::new("s-2", "STB_LONG", "OVERSOLD", Direction::Long, 21_550.0, 3);
    let d = gate.authorize(&long);
    assert!(d.allowed(), "{}", d.reason_text());

    // neighbouring bucket is a different zone
    let d = gate.authorize(&short("s-3", "STB_SHORT", 21_600.0, 3));
    assert!(d.allowed());
}

#[test]
fn test_loss_in_one_zone_leaves_others_untouched() {
    let gate = AuthorityGate::default();
    let z1 = gate.zone_for("OVERBOUGHT", Direction::Short, 21_550.0);
    let z2 = gate.zone_for("OVERBOUGHT", Direction::Short, 21_650.0);
    let z3 = gate.zone_for("OVERBOUGHT", Direction::Long, 21_550.0);
    for _ in 0..3 {
        gate.record_outcome("OVERBOUGHT", Direction::Short, 21_550.0, Outcome::Loss, None);
    }
    assert_eq!(gate.consecutive_loss(&z1), 3);
    assert_eq!(gate.consecutive_loss(&z2), 0);
    assert_eq!(gate.consecutive_loss(&z3), 0);

    gate.record_outcome("OVERBOUGHT", Direction::Short, 21_550.0, Outcome::Win, None);
    assert_eq!(gate.consecutive_loss(&z1), 0);
}

#[test]
fn test_same_key_never_allowed_twice() {
    let gate = AuthorityGate::default();
    let req = short("dup-1", "STB_SHORT", 21_550.0, 3);
    assert!(gate.authorize(&req).allowed());
    let second = gate.authorize(&req);
    assert!(!second.allowed());
    assert_eq!(second.response.reason, DenyReason::Duplicate);
    assert_eq!(second.response.layer_failed, None);
    assert_eq!(gate.status().call_count, 1);
}

#[test]
fn test_theta_zero_always_denied() {
    let gate = AuthorityGate::default();
    let mut req = short("t0", "STB_SHORT", 21_550.0, 0);
    req.is_retry = true;
    req.impulse_count = 10;
    req.recovery_time = 0.5;
    req.size_preference = Some(SizeTier::Large);
    let d = gate.authorize(&req);
    assert!(!d.allowed());
    assert_eq!(d.response.layer_failed, Some(AuthorityLayer::State));
    assert_eq!(d.response.size, SizeTier::None);
}

#[test]
fn test_theta_two_retry_boundaries() {
    let cases = [
        (3, 3.9, true),
        (2, 1.0, false),
        (5, 4.0, false),
        (3, 4.5, false),
    ];
    for (i, (impulses, recovery, expected)) in cases.into_iter().enumerate() {
        let gate = AuthorityGate::default();
        let mut req = short(&format!("r-{}", i), "STB_SHORT", 21_550.0, 2);
        req.is_retry = true;
        req.impulse_count = impulses;
        req.recovery_time = recovery;
        let d = gate.authorize(&req);
        assert_eq!(d.allowed(), expected, "impulses={} recovery={}", impulses, recovery);
        if !expected {
            assert_eq!(d.response.reason, DenyReason::RetryConditions);
        }
    }
}

#[test]
fn test_lock_in_always_sizes_large() {
    let gate = AuthorityGate::default();
    for (i, theta) in [3u8, 4, 9, u8::MAX].into_iter().enumerate() {
        let mut req = short(&format!("l-{}", i), "STB_SHORT", 21_550.0, theta);
        req.size_preference = Some(SizeTier::Small);
        let d = gate.authorize(&req);
        assert!(d.allowed());
        assert_eq!(d.response.size, SizeTier::Large);
        assert!(d.response.can_trail);
    }
}

#[test]
fn test_conservative_mode_requires_tier1() {
    let gate = AuthorityGate::default();
    assert!(gate.authorize(&short("n-1", "SCALP_A", 21_550.0, 5)).allowed());

    gate.set_mode(Mode::Conservative, true);
    let d = gate.authorize(&short("c-1", "SCALP_A", 21_550.0, 5));
    assert_eq!(d.response.reason, DenyReason::NotTier1);
    assert_eq!(d.response.layer_failed, Some(AuthorityLayer::Identity));

    let d = gate.authorize(&short("c-2", "STB_SHORT", 21_550.0, 2));
    assert_eq!(d.response.layer_failed, Some(AuthorityLayer::State));
    assert!(gate.authorize(&short("c-3", "STB_SHORT", 21_550.0, 3)).allowed());

    gate.set_mode(Mode::Normal, true);
    assert!(gate.authorize(&short("n-2", "SCALP_A", 21_550.0, 5)).allowed());
}

#[test]
fn test_wide_spread_denied_at_execution_layer() {
    let gate = AuthorityGate::default();
    let mut req = short("x-1", "STB_SHORT", 21_550.0, 3);
    req.spread = Some(2.5);
    let d = gate.authorize(&req);
    assert_eq!(d.response.reason, DenyReason::ExecutionEnvironment);
    assert_eq!(d.response.layer_failed, Some(AuthorityLayer::Execution));

    let mut req = short("x-2", "STB_SHORT", 21_550.0, 3);
    req.spread = Some(1.0);
    assert!(gate.authorize(&req).allowed());
}

fn run_session(gate: &AuthorityGate) -> Vec<Notification> {
    gate.record_outcome("OVERBOUGHT", Direction::Short, 21_550.0, Outcome::Loss, None);
    let requests = [
        short("a", "STB_SHORT", 21_550.0, 3),
        short("b", "SCALP_A", 21_750.0, 1),
        short("c", "BUY_SPOT", 21_550.0, 3),
        short("a", "STB_SHORT", 21_550.0, 3),
    ];
    requests
        .iter()
        .map(|r| Notification::from_decision(gate.instrument(), &gate.authorize(r)))
        .collect()
}

#[tokio::test]
async fn test_failed_delivery_leaves_gate_state_unchanged() {
    let ok_gate = AuthorityGate::new(GateConfig::default());
    let failing_gate = AuthorityGate::new(GateConfig::default());

    let ok = Arc::new(RecordingNotifier::new());
    let failing = Arc::new(RecordingNotifier::failing());
    let mut ok_dispatch = Dispatcher::spawn(ok.clone(), 16);
    let mut failing_dispatch = Dispatcher::spawn(failing.clone(), 16);

    for note in run_session(&ok_gate) {
        ok_dispatch.submit(note);
    }
    for note in run_session(&failing_gate) {
        failing_dispatch.submit(note);
    }
    let ok_stats = ok_dispatch.shutdown().await;
    let failing_stats = failing_dispatch.shutdown().await;
    assert_eq!(ok_stats.delivered, 4);
    assert_eq!(failing_stats.failed, 4);

    let a = ok_gate.status();
    let b = failing_gate.status();
    assert_eq!(
        serde_json::to_string(&a.stats).unwrap(),
        serde_json::to_string(&b.stats).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&a.zones_with_losses).unwrap(),
        serde_json::to_string(&b.zones_with_losses).unwrap()
    );
    assert_eq!(a.zone_stats, b.zone_stats);
    assert_eq!(a.call_count, b.call_count);
}

#[test]
fn test_restart_keeps_kill_switch_verdict() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let path = path.to_str().unwrap();
    {
        let gate = AuthorityGate::with_audit_log(GateConfig::default(), path).unwrap();
        let mut bad = short("bad-1", "STB_SHORT", 21_550.0, 1);
        bad.execute_payload = Some(serde_json::json!({"side": "SELL"}));
        assert_eq!(gate.authorize(&bad).response.reason, DenyReason::InvariantViolation);
        gate.reset_halt("operator reviewed");
    }
    let gate = AuthorityGate::with_audit_log(GateConfig::default(), path).unwrap();
    assert!(!gate.is_halted());
    let kill = gate.kill_switch();
    assert!(kill.blocks_live());
    assert!(kill.reasons[0].starts_with("INVARIANT_FAIL"));
}
