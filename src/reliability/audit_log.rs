//! Append-only audit trail. One JSON object per line, tagged by `entry`.
//! `recover` replays the file so a restarted process can rebuild its
//! kill-switch inputs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

#[derive(Debug)]
pub struct AuditLog {
    file: File,
    path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry")]
pub enum AuditEntry {
    #[serde(rename = "decision")]
    Decision {
        ts: String,
        signal_id: String,
        signal_name: String,
        decision: String,
        theta: u8,
        size: String,
        reason: String,
        #[serde(default)]
        layer_failed: Option<u8>,
        #[serde(default)]
        zone: Option<String>,
    },
    #[serde(rename = "violation")]
    Violation {
        ts: String,
        rules: Vec<String>,
        fingerprint: String,
        event: Value,
    },
    #[serde(rename = "layer_conflict")]
    LayerConflict { ts: String, detail: String },
    #[serde(rename = "trade")]
    Trade {
        ts: String,
        trade_id: u64,
        layer: String,
        direction: String,
        entry_price: f64,
        exit_price: f64,
        pnl: f64,
        exit_reason: String,
        theta: u8,
    },
    #[serde(rename = "halt_reset")]
    HaltReset {
        ts: String,
        #[serde(default)]
        note: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastDecision {
    pub signal_id: String,
    pub decision: String,
    pub reason: String,
}

/// Summary rebuilt from a replayed audit trail.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditRecovery {
    pub decisions: u64,
    pub allows: u64,
    pub denies: u64,
    pub violations: u64,
    pub layer_conflicts: u64,
    pub missing_phase: u64,
    pub trades: u64,
    pub halt_resets: u64,
    /// A violation was logged after the most recent halt reset.
    pub halted: bool,
    pub last_decision: Option<LastDecision>,
    pub unreadable_lines: u64,
}

/// Rules whose violation counts as a layer conflict.
pub const LAYER_CONFLICT_RULES: &[&str] = &["INV-3", "INV-4", "INV-5"];
/// Rule raised for a missing phase tag.
pub const MISSING_PHASE_RULE: &str = "INV-1";

impl AuditLog {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open audit log {}", path))?;
        Ok(Self { file, path: path.to_string() })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn append(&mut self, entry: &AuditEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }

    pub fn replay(path: &str) -> Result<Vec<String>> {
        if !Path::new(path).exists() {
            return Ok(vec![]);
        }
        let file = File::open(path)?;
        Ok(BufReader::new(file).lines().map_while(|l| l.ok()).collect())
    }

    pub fn recover(path: &str) -> Result<AuditRecovery> {
        let mut state = AuditRecovery::default();
        for line in Self::replay(path)? {
            if line.trim().is_empty() {
                continue;
            }
            let entry = match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => entry,
                Err(_) => {
                    state.unreadable_lines += 1;
                    continue;
                }
            };
            match entry {
                AuditEntry::Decision { signal_id, decision, reason, .. } => {
                    state.decisions += 1;
                    if decision == "ALLOW" {
                        state.allows += 1;
                    } else {
                        state.denies += 1;
                    }
                    state.last_decision = Some(LastDecision { signal_id, decision, reason });
                }
                AuditEntry::Violation { rules, .. } => {
                    state.violations += 1;
                    state.halted = true;
                    if rules.iter().any(|r| LAYER_CONFLICT_RULES.contains(&r.as_str())) {
                        state.layer_conflicts += 1;
                    }
                    if rules.iter().any(|r| r == MISSING_PHASE_RULE) {
                        state.missing_phase += 1;
                    }
                }
                AuditEntry::LayerConflict { .. } => state.layer_conflicts += 1,
                AuditEntry::Trade { .. } => state.trades += 1,
                AuditEntry::HaltReset { .. } => {
                    state.halt_resets += 1;
                    state.halted = false;
                }
            }
        }
        Ok(state)
    }
}
