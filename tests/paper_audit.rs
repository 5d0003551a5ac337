//! Paper sessions driven end to end through a shared gate: entries are
//! judged by the gate, realized exits feed its zones, and the audit trail
//! and promotion verdict reflect the session.

use thetagate::authority::gate::{AuthorityGate, GateConfig, SignalRequest};
use thetagate::authority::DenyReason;
use thetagate::paper::{ExitReason, PaperEngine};
use thetagate::reliability::audit_log::AuditLog;
use thetagate::types::{Bar, Direction, Outcome};

const T0: i64 = 1_767_225_600_000;

fn bar(i: i64, high: f64, low: f64, close: f64) -> Bar {
    Bar::new(T0 + i * 60_000, close, high, low, close)
}

/// Balanced bars, then a close pinned near the channel top that fires a
/// SHORT ignition at 102.25.
fn ignition_session(engine: &mut PaperEngine, gate: &AuthorityGate) -> Option<u64> {
    for i in 0..19 {
        engine.on_bar(&bar(i, 101.0, 99.0, 100.0), gate);
    }
    engine.on_bar(&bar(19, 103.0, 100.0, 102.25), gate).entered
}

#[test]
fn test_session_writes_decision_and_trade_to_audit_trail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let path = path.to_str().unwrap();

    {
        let gate = AuthorityGate::with_audit_log(GateConfig::default(), path).unwrap();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        assert_eq!(ignition_session(&mut engine, &gate), Some(1));
        let out = engine.on_bar(&bar(20, 103.0, 82.0, 83.0), &gate);
        assert_eq!(out.exited.unwrap().exit_reason, Some(ExitReason::TakeProfit));

        let promotion = engine.promotion(&gate);
        assert!(promotion.promote, "{:?}", promotion.blockers);
        assert!(promotion.audit_pass);
    }

    let recovery = AuditLog::recover(path).unwrap();
    assert_eq!(recovery.decisions, 1);
    assert_eq!(recovery.allows, 1);
    assert_eq!(recovery.trades, 1);
    assert_eq!(recovery.violations, 0);
    assert!(!recovery.halted);
    assert_eq!(recovery.last_decision.unwrap().signal_id, format!("NQ1!:STB_SHORT:{}", T0 + 19 * 60_000));
}

#[test]
fn test_collapsed_zone_blocks_paper_entry() {
    let gate = AuthorityGate::default();
    for _ in 0..2 {
        gate.record_outcome("OVERBOUGHT", Direction::Short, 102.25, Outcome::Loss, None);
    }
    let mut engine = PaperEngine::with_defaults("NQ1!");
    assert_eq!(ignition_session(&mut engine, &gate), None);
    assert!(engine.is_flat());
    assert!(engine.trades().is_empty());

    let stats = gate.stats();
    assert_eq!(stats.deny, 1);
    assert_eq!(stats.deny_by_layer[2], 1);
    // a denial is a decision, not an audit failure
    assert!(engine.audit().ready_for_live);
}

#[test]
fn test_loss_realized_in_paper_collapses_zone_for_external_signals() {
    let gate = AuthorityGate::default();
    let mut engine = PaperEngine::with_defaults("NQ1!");
    assert_eq!(ignition_session(&mut engine, &gate), Some(1));
    let out = engine.on_bar(&bar(20, 118.0, 101.0, 110.0), &gate);
    assert_eq!(out.exited.unwrap().result, Some(Outcome::Loss));

    gate.record_outcome("OVERBOUGHT", Direction::Short, 150.0, Outcome::Loss, Some(20));
    let external = SignalRequest::new("ext-1", "STB_SHORT", "OVERBOUGHT", Direction::Short, 120.0, 3);
    let d = gate.authorize(&external);
    assert!(!d.allowed());
    assert_eq!(d.response.reason, DenyReason::ZoneCollapse);
    // only the paper stop was fast enough to count
    assert_eq!(gate.status().mode.fast_collapse_count, 1);
}

#[test]
fn test_halted_gate_blocks_entries_and_promotion() {
    let gate = AuthorityGate::default();
    let mut bad = SignalRequest::new("ext-1", "STB_SHORT", "OVERBOUGHT", Direction::Short, 21_550.0, 3);
    bad.execute_payload = Some(serde_json::json!({"side": "SELL", "qty": 1}));
    assert_eq!(gate.authorize(&bad).response.reason, DenyReason::InvariantViolation);
    assert!(gate.is_halted());

    let mut engine = PaperEngine::with_defaults("NQ1!");
    assert_eq!(ignition_session(&mut engine, &gate), None);

    let promotion = engine.promotion(&gate);
    assert!(promotion.audit_pass);
    assert!(!promotion.promote);
    assert!(promotion.blockers.iter().any(|b| b.starts_with("INVARIANT_FAIL")));
}
