//! Runtime rules every decision event must satisfy before it leaves the
//! core. A violation trips the halt breaker; only an explicit reset
//! closes it again.

use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::logging::{self, ts_now};
use crate::reliability::audit_log::AuditRecovery;
use crate::reliability::circuit::CircuitBreaker;
use crate::ring::RingLog;
use crate::types::{Direction, EventAction, EventLayer, Phase, RunMode};

const VIOLATION_RING: usize = 256;

/// A decision event as it is about to be published.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionEvent {
    pub ts: String,
    pub instrument: String,
    pub bar_time: Option<i64>,
    pub layer: EventLayer,
    pub action: EventAction,
    pub phase: Option<Phase>,
    pub direction: Option<Direction>,
    pub trade_id: Option<u64>,
    pub theta: u8,
    pub price: Option<f64>,
    pub reason: String,
    pub execute_payload: Option<Value>,
}

impl DecisionEvent {
    pub fn new(instrument: &str, layer: EventLayer, action: EventAction, phase: Option<Phase>) -> Self {
        Self {
            ts: ts_now(),
            instrument: instrument.to_string(),
            bar_time: None,
            layer,
            action,
            phase,
            direction: None,
            trade_id: None,
            theta: 0,
            price: None,
            reason: String::new(),
            execute_payload: None,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_trade(mut self, trade_id: u64) -> Self {
        self.trade_id = Some(trade_id);
        self
    }

    pub fn with_theta(mut self, theta: u8) -> Self {
        self.theta = theta;
        self
    }

    pub fn with_bar(mut self, bar_time: i64, price: f64) -> Self {
        self.bar_time = Some(bar_time);
        self.price = Some(price);
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = reason.to_string();
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvariantRule {
    /// Phase tag missing on an event that is not a pure observation.
    MissingPhase,
    /// Extension without θ ≥ 3.
    ExtensionWithoutLockIn,
    /// Defense layer without the immediate phase.
    DefenseNotImmediate,
    /// Pre-transition layer carrying the ignition phase.
    PreTransitionAtIgnition,
    /// Layer and phase disagree.
    LayerPhaseConflict,
    /// Entry without direction.
    EntryWithoutDirection,
    /// Exit without a position id.
    ExitWithoutTrade,
    /// Execution payload while running on paper.
    PaperExecutePayload,
}

impl InvariantRule {
    pub fn id(&self) -> &'static str {
        match self {
            InvariantRule::MissingPhase => "INV-1",
            InvariantRule::ExtensionWithoutLockIn => "INV-2",
            InvariantRule::DefenseNotImmediate => "INV-3",
            InvariantRule::PreTransitionAtIgnition => "INV-4",
            InvariantRule::LayerPhaseConflict => "INV-5",
            InvariantRule::EntryWithoutDirection => "INV-6",
            InvariantRule::ExitWithoutTrade => "INV-7",
            InvariantRule::PaperExecutePayload => "INV-10",
        }
    }

    pub fn is_layer_conflict(&self) -> bool {
        matches!(
            self,
            InvariantRule::DefenseNotImmediate | InvariantRule::PreTransitionAtIgnition | InvariantRule::LayerPhaseConflict
        )
    }
}

impl Serialize for InvariantRule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id())
    }
}

impl fmt::Display for InvariantRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvariantViolation {
    pub timestamp: String,
    pub event: DecisionEvent,
    pub rules: Vec<InvariantRule>,
    pub mode: RunMode,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.rules.iter().map(|r| r.id()).collect();
        write!(f, "invariant violated: {}", ids.join(","))
    }
}

impl std::error::Error for InvariantViolation {}

/// Why an outbound event was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum EventRejection {
    /// The halt breaker is open. Nothing that issues authority passes
    /// until an explicit reset.
    Halted,
    Violation(InvariantViolation),
}

impl EventRejection {
    pub fn violation(&self) -> Option<&InvariantViolation> {
        match self {
            EventRejection::Halted => None,
            EventRejection::Violation(v) => Some(v),
        }
    }
}

impl fmt::Display for EventRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventRejection::Halted => f.write_str("halted by invariant guard"),
            EventRejection::Violation(v) => v.fmt(f),
        }
    }
}

impl std::error::Error for EventRejection {}

/// Every rule the event breaks, in rule order.
pub fn broken_rules(event: &DecisionEvent, mode: RunMode) -> Vec<InvariantRule> {
    let mut rules = Vec::new();

    if event.phase.is_none() && event.action != EventAction::Observe {
        rules.push(InvariantRule::MissingPhase);
    }
    if event.action == EventAction::Extend && event.theta < 3 {
        rules.push(InvariantRule::ExtensionWithoutLockIn);
    }
    if event.layer == EventLayer::Defense && event.phase != Some(Phase::Immediate) {
        rules.push(InvariantRule::DefenseNotImmediate);
    }
    if event.layer == EventLayer::PreTransition && event.phase == Some(Phase::Ignition) {
        rules.push(InvariantRule::PreTransitionAtIgnition);
    }
    let conflict = match (event.layer, event.phase) {
        (EventLayer::Ignition, Some(p)) => p != Phase::Ignition,
        (EventLayer::PreTransition, Some(p)) => p != Phase::PreTransition && p != Phase::Ignition,
        _ => false,
    };
    if conflict {
        rules.push(InvariantRule::LayerPhaseConflict);
    }
    if event.action == EventAction::Entry && event.direction.is_none() {
        rules.push(InvariantRule::EntryWithoutDirection);
    }
    if event.action == EventAction::Exit && event.trade_id.is_none() {
        rules.push(InvariantRule::ExitWithoutTrade);
    }
    let has_payload = matches!(&event.execute_payload, Some(v) if !v.is_null());
    if mode == RunMode::Paper && has_payload {
        rules.push(InvariantRule::PaperExecutePayload);
    }

    rules
}

pub fn assert_event_invariants(event: &DecisionEvent, mode: RunMode) -> Result<(), Vec<InvariantRule>> {
    let rules = broken_rules(event, mode);
    if rules.is_empty() {
        Ok(())
    } else {
        Err(rules)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillAction {
    LiveHalt,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillSwitchVerdict {
    pub kill_switch: bool,
    pub action: KillAction,
    pub reasons: Vec<String>,
}

impl KillSwitchVerdict {
    pub fn blocks_live(&self) -> bool {
        self.action == KillAction::LiveHalt
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardStatus {
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub violation_count: u64,
    pub layer_conflicts: u64,
    pub missing_phase: u64,
    pub recent: Vec<InvariantViolation>,
    pub kill_switch: KillSwitchVerdict,
}

#[derive(Debug, Clone)]
pub struct InvariantGuard {
    mode: RunMode,
    halt: CircuitBreaker,
    violations: RingLog<InvariantViolation>,
    violation_count: u64,
    layer_conflicts: u64,
    missing_phase: u64,
}

impl InvariantGuard {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            halt: CircuitBreaker::new(1),
            violations: RingLog::new(VIOLATION_RING),
            violation_count: 0,
            layer_conflicts: 0,
            missing_phase: 0,
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn is_halted(&self) -> bool {
        !self.halt.allow()
    }

    /// Halt-aware check. While halted, entries, defenses and extensions are
    /// refused outright; exits and observations still go through the rules
    /// so an open position can always be closed.
    pub fn admit(&mut self, event: &DecisionEvent) -> Result<(), EventRejection> {
        if self.is_halted() && event.action.issues_authority() {
            return Err(EventRejection::Halted);
        }
        self.check(event).map_err(EventRejection::Violation)
    }

    /// Validate an outbound event. On failure the violation is recorded,
    /// the halt breaker trips and the full event is logged.
    pub fn check(&mut self, event: &DecisionEvent) -> Result<(), InvariantViolation> {
        let rules = match assert_event_invariants(event, self.mode) {
            Ok(()) => return Ok(()),
            Err(rules) => rules,
        };

        let violation = InvariantViolation {
            timestamp: ts_now(),
            event: event.clone(),
            rules,
            mode: self.mode,
        };

        self.violation_count += 1;
        if violation.rules.iter().any(|r| r.is_layer_conflict()) {
            self.layer_conflicts += 1;
        }
        if violation.rules.contains(&InvariantRule::MissingPhase) {
            self.missing_phase += 1;
        }

        let ids: Vec<&str> = violation.rules.iter().map(|r| r.id()).collect();
        self.halt.trip(&ids.join(","));
        logging::log_violation(&ids, &event.to_value());

        self.violations.push(violation.clone());
        Err(violation)
    }

    /// Conflicts detected outside the rule set (e.g. a duplicate entry).
    pub fn record_layer_conflict(&mut self, detail: &str) {
        self.layer_conflicts += 1;
        logging::log(
            logging::Level::Error,
            logging::Domain::Invariant,
            "layer_conflict",
            logging::obj(&[("detail", logging::v_str(detail))]),
        );
    }

    /// Carry counts over from a replayed audit trail.
    pub fn seed_from(&mut self, recovery: &AuditRecovery) {
        self.violation_count += recovery.violations;
        self.layer_conflicts += recovery.layer_conflicts;
        self.missing_phase += recovery.missing_phase;
        if recovery.halted {
            self.halt.trip("recovered from audit log");
        }
    }

    pub fn kill_switch(&self) -> KillSwitchVerdict {
        let mut reasons = Vec::new();
        if self.violation_count >= 1 {
            reasons.push(format!("INVARIANT_FAIL >= 1 (count: {})", self.violation_count));
        }
        if self.layer_conflicts > 0 {
            reasons.push(format!("layer_conflict > 0 (count: {})", self.layer_conflicts));
        }
        if self.missing_phase > 0 {
            reasons.push(format!("phase_missing > 0 (count: {})", self.missing_phase));
        }
        let halt = !reasons.is_empty();
        KillSwitchVerdict {
            kill_switch: halt,
            action: if halt { KillAction::LiveHalt } else { KillAction::Continue },
            reasons,
        }
    }

    pub fn violation_count(&self) -> u64 {
        self.violation_count
    }

    pub fn layer_conflicts(&self) -> u64 {
        self.layer_conflicts
    }

    pub fn status(&self) -> GuardStatus {
        GuardStatus {
            halted: self.is_halted(),
            halt_reason: self.halt.last_reason.clone(),
            violation_count: self.violation_count,
            layer_conflicts: self.layer_conflicts,
            missing_phase: self.missing_phase,
            recent: self.violations.tail(10).into_iter().cloned().collect(),
            kill_switch: self.kill_switch(),
        }
    }

    /// Close the halt breaker. History stays, so the kill switch keeps
    /// blocking live promotion.
    pub fn reset_halt(&mut self) {
        self.halt.reset();
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.halt.reset();
        self.violations.clear();
        self.violation_count = 0;
        self.layer_conflicts = 0;
        self.missing_phase = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(layer: EventLayer, phase: Option<Phase>) -> DecisionEvent {
        DecisionEvent::new("NQ", layer, EventAction::Entry, phase).with_direction(Direction::Short)
    }

    #[test]
    fn test_valid_events_pass() {
        let mut g = InvariantGuard::new(RunMode::Paper);
        assert!(g.check(&entry(EventLayer::PreTransition, Some(Phase::PreTransition))).is_ok());
        assert!(g.check(&entry(EventLayer::Ignition, Some(Phase::Ignition))).is_ok());
        let defense = DecisionEvent::new("NQ", EventLayer::Defense, EventAction::Defense, Some(Phase::Immediate)).with_trade(1);
        assert!(g.check(&defense).is_ok());
        let observe = DecisionEvent::new("NQ", EventLayer::Observation, EventAction::Observe, None);
        assert!(g.check(&observe).is_ok());
        assert!(!g.is_halted());
        assert!(!g.kill_switch().blocks_live());
    }

    #[test]
    fn test_each_rule() {
        let m = RunMode::Paper;
        let e = DecisionEvent::new("NQ", EventLayer::Gate, EventAction::Entry, None).with_direction(Direction::Long);
        assert_eq!(broken_rules(&e, m), vec![InvariantRule::MissingPhase]);

        let e = DecisionEvent::new("NQ", EventLayer::Gate, EventAction::Extend, Some(Phase::Neutral)).with_theta(2);
        assert_eq!(broken_rules(&e, m), vec![InvariantRule::ExtensionWithoutLockIn]);

        let e = DecisionEvent::new("NQ", EventLayer::Defense, EventAction::Defense, Some(Phase::Ignition));
        assert_eq!(broken_rules(&e, m), vec![InvariantRule::DefenseNotImmediate]);

        let e = entry(EventLayer::PreTransition, Some(Phase::Ignition));
        assert_eq!(broken_rules(&e, m), vec![InvariantRule::PreTransitionAtIgnition]);

        let e = entry(EventLayer::Ignition, Some(Phase::PreTransition));
        assert_eq!(broken_rules(&e, m), vec![InvariantRule::LayerPhaseConflict]);

        let e = DecisionEvent::new("NQ", EventLayer::Ignition, EventAction::Entry, Some(Phase::Ignition));
        assert_eq!(broken_rules(&e, m), vec![InvariantRule::EntryWithoutDirection]);

        let e = DecisionEvent::new("NQ", EventLayer::Ignition, EventAction::Exit, Some(Phase::Ignition));
        assert_eq!(broken_rules(&e, m), vec![InvariantRule::ExitWithoutTrade]);

        let mut e = entry(EventLayer::Gate, Some(Phase::Neutral));
        e.execute_payload = Some(serde_json::json!({"qty": 1}));
        assert_eq!(broken_rules(&e, m), vec![InvariantRule::PaperExecutePayload]);
        assert!(broken_rules(&e, RunMode::Live).is_empty());
    }

    #[test]
    fn test_violation_halts_and_kills() {
        let mut g = InvariantGuard::new(RunMode::Paper);
        let bad = DecisionEvent::new("NQ", EventLayer::Defense, EventAction::Defense, Some(Phase::Ignition));
        let err = g.check(&bad).unwrap_err();
        assert_eq!(err.rules, vec![InvariantRule::DefenseNotImmediate]);
        assert!(g.is_halted());

        let verdict = g.kill_switch();
        assert_eq!(verdict.action, KillAction::LiveHalt);
        assert_eq!(verdict.reasons.len(), 2);

        let status = g.status();
        assert_eq!(status.violation_count, 1);
        assert_eq!(status.recent.len(), 1);
    }

    #[test]
    fn test_reset_halt_keeps_history() {
        let mut g = InvariantGuard::new(RunMode::Paper);
        let _ = g.check(&DecisionEvent::new("NQ", EventLayer::Gate, EventAction::Entry, None));
        g.reset_halt();
        assert!(!g.is_halted());
        assert!(g.kill_switch().blocks_live());
        g.reset();
        assert!(!g.kill_switch().blocks_live());
    }

    #[test]
    fn test_halted_guard_refuses_authority_but_not_exits() {
        let mut g = InvariantGuard::new(RunMode::Paper);
        let _ = g.check(&DecisionEvent::new("NQ", EventLayer::Gate, EventAction::Entry, None));
        assert!(g.is_halted());

        let extend = DecisionEvent::new("NQ", EventLayer::Ignition, EventAction::Extend, Some(Phase::Ignition))
            .with_trade(1)
            .with_theta(3);
        assert_eq!(g.admit(&extend), Err(EventRejection::Halted));
        assert_eq!(g.admit(&entry(EventLayer::Ignition, Some(Phase::Ignition))), Err(EventRejection::Halted));
        let exit = DecisionEvent::new("NQ", EventLayer::Ignition, EventAction::Exit, Some(Phase::Ignition)).with_trade(1);
        assert!(g.admit(&exit).is_ok());
        // refusals while halted are not new violations
        assert_eq!(g.status().violation_count, 1);

        g.reset_halt();
        assert!(g.admit(&extend).is_ok());
    }

    #[test]
    fn test_layer_conflict_alone_blocks_live() {
        let mut g = InvariantGuard::new(RunMode::Paper);
        g.record_layer_conflict("duplicate entry");
        assert!(!g.is_halted());
        assert!(g.kill_switch().blocks_live());
    }

    #[test]
    fn test_status_keeps_last_ten() {
        let mut g = InvariantGuard::new(RunMode::Paper);
        for _ in 0..15 {
            let _ = g.check(&DecisionEvent::new("NQ", EventLayer::Gate, EventAction::Exit, Some(Phase::Neutral)));
        }
        let status = g.status();
        assert_eq!(status.violation_count, 15);
        assert_eq!(status.recent.len(), 10);
    }

    #[test]
    fn test_seed_from_recovery() {
        let mut g = InvariantGuard::new(RunMode::Paper);
        let rec = AuditRecovery { violations: 2, halted: true, ..AuditRecovery::default() };
        g.seed_from(&rec);
        assert!(g.is_halted());
        assert_eq!(g.violation_count(), 2);
    }
}
