//! Paper-to-live promotion checks.
//!
//! Seven properties must hold before paper operation can be promoted:
//! no layer conflicts, phase tags on every action event, no θ≥3-gated
//! action below θ 3, defense only on the entry bar, exit reasons on every
//! closed trade, no processing faults, and counters that agree with the
//! trade ledger. The invariant guard's kill switch is an independent veto.

use serde::Serialize;

use crate::verify::invariants::KillSwitchVerdict;

use super::trade::TradeRecord;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditCounters {
    pub layer_conflicts: u64,
    pub phase_tag_missing: u64,
    pub theta3_violations: u64,
    pub defense_timing_errors: u64,
    pub exit_reason_missing: u64,
    pub engine_errors: u64,
    pub audit_violations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditCheck {
    pub id: &'static str,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub checks: Vec<AuditCheck>,
    pub all_pass: bool,
    pub ready_for_live: bool,
    pub failures: Vec<&'static str>,
}

/// Ledger facts the consistency check compares the counters against.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerView {
    pub slot_entries: u64,
    pub slot_exits: u64,
    pub open_trades: u64,
}

pub fn evaluate(counters: &AuditCounters, trades: &[TradeRecord], ledger: LedgerView) -> AuditReport {
    let closed: Vec<&TradeRecord> = trades.iter().filter(|t| t.is_closed()).collect();
    let exit_reasons_complete = counters.exit_reason_missing == 0 && closed.iter().all(|t| t.exit_reason.is_some());
    let consistent = counters.audit_violations == 0
        && ledger.slot_entries == trades.len() as u64
        && ledger.slot_exits == closed.len() as u64
        && closed.len() as u64 + ledger.open_trades == trades.len() as u64;

    let checks = vec![
        AuditCheck { id: "CHECK_1_layer_conflicts", passed: counters.layer_conflicts == 0 },
        AuditCheck { id: "CHECK_2_phase_tags", passed: counters.phase_tag_missing == 0 },
        AuditCheck { id: "CHECK_3_theta3_gated", passed: counters.theta3_violations == 0 },
        AuditCheck { id: "CHECK_4_defense_timing", passed: counters.defense_timing_errors == 0 },
        AuditCheck { id: "CHECK_5_exit_reason_complete", passed: exit_reasons_complete },
        AuditCheck { id: "CHECK_6_engine_stability", passed: counters.engine_errors == 0 },
        AuditCheck { id: "CHECK_7_audit_consistent", passed: consistent },
    ];
    let failures: Vec<&'static str> = checks.iter().filter(|c| !c.passed).map(|c| c.id).collect();
    let all_pass = failures.is_empty();
    AuditReport { checks, all_pass, ready_for_live: all_pass, failures }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionVerdict {
    pub promote: bool,
    pub audit_pass: bool,
    pub kill_switch: KillSwitchVerdict,
    pub blockers: Vec<String>,
}

pub fn promotion_verdict(report: &AuditReport, kill: &KillSwitchVerdict) -> PromotionVerdict {
    let mut blockers: Vec<String> = report.failures.iter().map(|f| f.to_string()).collect();
    if kill.blocks_live() {
        blockers.extend(kill.reasons.iter().cloned());
    }
    PromotionVerdict {
        promote: blockers.is_empty(),
        audit_pass: report.all_pass,
        kill_switch: kill.clone(),
        blockers,
    }
}
