//! Caller-owned gate context. One instance per process (or per test),
//! passed by reference to whoever needs a decision.
//!
//! Mode and zone records are the only state shared between evaluation
//! calls; each sits behind its own mutex and no two locks are held at once.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::Config;
use crate::logging::{self, ts_now, Domain, Level};
use crate::mode::{Mode, ModeConfig, ModeController, ModeStatus};
use crate::reliability::audit_log::{AuditEntry, AuditLog};
use crate::reliability::writer::BackgroundWriter;
use crate::ring::RecentSet;
use crate::types::{Direction, EventAction, EventLayer, Outcome, Phase, RunMode, SizeTier};
use crate::verify::invariants::{DecisionEvent, EventRejection, GuardStatus, InvariantGuard, KillSwitchVerdict};
use crate::zone::{ZoneConfig, ZoneKey, ZoneLoss, ZoneLossCounter, ZoneStats};

use super::engine::{AuthorityEngine, AuthorityRequest, AuthorityResponse, AuthorityStats, DenyReason};
use super::retry::RetryBook;
use super::{ExecLimits, SignalCatalog};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub instrument: String,
    pub run_mode: RunMode,
    pub zone: ZoneConfig,
    pub mode: ModeConfig,
    pub catalog: SignalCatalog,
    pub exec: ExecLimits,
    pub retry_attempts_per_zone: u32,
    pub idempotency_cap: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            instrument: "NQ1!".to_string(),
            run_mode: RunMode::Paper,
            zone: ZoneConfig::default(),
            mode: ModeConfig::default(),
            catalog: SignalCatalog::default(),
            exec: ExecLimits::default(),
            retry_attempts_per_zone: 1,
            idempotency_cap: 10_000,
        }
    }
}

impl From<&Config> for GateConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            instrument: cfg.instrument.clone(),
            run_mode: cfg.run_mode,
            zone: cfg.zone.clone(),
            mode: cfg.mode.clone(),
            catalog: cfg.catalog.clone(),
            exec: cfg.exec.clone(),
            retry_attempts_per_zone: cfg.retry_attempts_per_zone,
            idempotency_cap: cfg.idempotency_cap,
        }
    }
}

/// One signal occurrence submitted for a decision. `signal_id` is the
/// caller's idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRequest {
    pub signal_id: String,
    pub signal_name: String,
    /// Situation label used for zone scoping, e.g. OVERBOUGHT.
    pub state: String,
    pub direction: Direction,
    pub price: f64,
    pub theta: u8,
    #[serde(default)]
    pub is_retry: bool,
    #[serde(default)]
    pub impulse_count: u32,
    #[serde(default)]
    pub recovery_time: f64,
    #[serde(default)]
    pub spread: Option<f64>,
    #[serde(default)]
    pub size_preference: Option<SizeTier>,
    /// Producing layer; external signals default to GATE.
    #[serde(default)]
    pub layer: Option<EventLayer>,
    /// External signals without a tag are NEUTRAL; internal layers must tag.
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub bar_time: Option<i64>,
    #[serde(default)]
    pub execute_payload: Option<Value>,
}

impl SignalRequest {
    pub fn new(signal_id: &str, signal_name: &str, state: &str, direction: Direction, price: f64, theta: u8) -> Self {
        Self {
            signal_id: signal_id.to_string(),
            signal_name: signal_name.to_string(),
            state: state.to_string(),
            direction,
            price,
            theta,
            is_retry: false,
            impulse_count: 0,
            recovery_time: 0.0,
            spread: None,
            size_preference: None,
            layer: None,
            phase: None,
            bar_time: None,
            execute_payload: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateDecision {
    pub signal_id: String,
    pub signal_name: String,
    pub zone: Option<ZoneKey>,
    pub consecutive_loss_same_zone: u32,
    #[serde(flatten)]
    pub response: AuthorityResponse,
}

impl GateDecision {
    pub fn allowed(&self) -> bool {
        self.response.is_allowed()
    }

    pub fn reason_text(&self) -> String {
        let zone = self.zone.as_ref().map(|z| z.zone_id.to_string()).unwrap_or_default();
        match (self.allowed(), self.response.layer_failed) {
            (true, _) => format!("Allowed: θ={}, zone={}", self.response.theta, zone),
            (false, Some(layer)) => format!("Denied at Layer {}: {}", layer.index(), self.response.detail),
            (false, None) => format!("Denied: {}", self.response.detail),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub instrument: String,
    pub run_mode: RunMode,
    pub mode: ModeStatus,
    pub manual_override: bool,
    pub call_count: u64,
    pub stats: AuthorityStats,
    pub allow_rate: f64,
    pub zone_stats: ZoneStats,
    pub zones_with_losses: Vec<ZoneLoss>,
    pub halted: bool,
    pub guard: GuardStatus,
}

pub struct AuthorityGate {
    cfg: GateConfig,
    mode: Mutex<ModeController>,
    zones: Mutex<ZoneLossCounter>,
    engine: Mutex<AuthorityEngine>,
    retries: Mutex<RetryBook>,
    guard: Mutex<InvariantGuard>,
    seen_keys: Mutex<RecentSet<String>>,
    audit: Option<BackgroundWriter<AuditEntry>>,
    call_count: AtomicU64,
}

impl Default for AuthorityGate {
    fn default() -> Self {
        Self::new(GateConfig::default())
    }
}

impl AuthorityGate {
    pub fn new(cfg: GateConfig) -> Self {
        Self {
            mode: Mutex::new(ModeController::new(cfg.mode.clone())),
            zones: Mutex::new(ZoneLossCounter::new(cfg.zone.clone())),
            engine: Mutex::new(AuthorityEngine::new(cfg.catalog.clone(), cfg.exec.clone())),
            retries: Mutex::new(RetryBook::new(cfg.retry_attempts_per_zone)),
            guard: Mutex::new(InvariantGuard::new(cfg.run_mode)),
            seen_keys: Mutex::new(RecentSet::new(cfg.idempotency_cap)),
            audit: None,
            call_count: AtomicU64::new(0),
            cfg,
        }
    }

    /// Gate backed by an audit trail. Prior violations in the trail are
    /// replayed into the guard before the first decision.
    pub fn with_audit_log(cfg: GateConfig, path: &str) -> Result<Self> {
        let recovery = AuditLog::recover(path)?;
        let mut log = AuditLog::open(path)?;
        let writer = BackgroundWriter::spawn("audit", Domain::Audit, move |entry: AuditEntry| log.append(&entry))?;
        let mut gate = Self::new(cfg);
        gate.guard
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .seed_from(&recovery);
        gate.audit = Some(writer);
        logging::log(
            Level::Info,
            Domain::System,
            "audit_recovered",
            logging::obj(&[
                ("path", logging::v_str(path)),
                ("recovery", serde_json::to_value(&recovery).unwrap_or(Value::Null)),
            ]),
        );
        Ok(gate)
    }

    pub fn instrument(&self) -> &str {
        &self.cfg.instrument
    }

    pub fn run_mode(&self) -> RunMode {
        self.cfg.run_mode
    }

    pub fn zone_for(&self, state: &str, direction: Direction, price: f64) -> ZoneKey {
        ZoneKey::from_price(state, direction, price, self.cfg.zone.bucket_width)
    }

    pub fn is_halted(&self) -> bool {
        lock(&self.guard).is_halted()
    }

    pub fn authorize(&self, req: &SignalRequest) -> GateDecision {
        self.authorize_at(req, Utc::now())
    }

    /// Halt check, idempotency, zone lookup, authority layers, invariant
    /// check of the outbound event, audit.
    pub fn authorize_at(&self, req: &SignalRequest, now: DateTime<Utc>) -> GateDecision {
        if self.is_halted() {
            let response = AuthorityResponse::deny(
                req.theta,
                DenyReason::Halted,
                None,
                "Execution halted by invariant guard".to_string(),
            );
            return self.finish(req, None, 0, response);
        }

        if !lock(&self.seen_keys).insert(req.signal_id.clone()) {
            let response = AuthorityResponse::deny(req.theta, DenyReason::Duplicate, None, "Duplicate call blocked".to_string());
            return self.finish(req, None, 0, response);
        }
        self.call_count.fetch_add(1, Ordering::SeqCst);

        let zone = self.zone_for(&req.state, req.direction, req.price);
        let losses = lock(&self.zones).consecutive_loss_at(&zone, now);
        let retry_budget_exhausted = req.is_retry && !lock(&self.retries).has_budget(&zone);

        let areq = AuthorityRequest {
            signal_name: req.signal_name.clone(),
            theta: req.theta,
            is_retry: req.is_retry,
            impulse_count: req.impulse_count,
            recovery_time: req.recovery_time,
            consecutive_loss_same_zone: losses,
            spread: req.spread,
            retry_budget_exhausted,
            size_preference: req.size_preference,
        };
        let mode_state = lock(&self.mode).state();
        let mut response = lock(&self.engine).decide(&areq, &mode_state);

        if response.is_allowed() {
            let event = self.outbound_event(req);
            if let Err(rejection) = self.check_event(&event) {
                let reason = match rejection {
                    EventRejection::Halted => DenyReason::Halted,
                    EventRejection::Violation(_) => DenyReason::InvariantViolation,
                };
                response = AuthorityResponse::deny(req.theta, reason, None, rejection.to_string());
            }
        }

        lock(&self.engine).record(&response);
        if response.is_allowed() {
            if req.is_retry {
                lock(&self.retries).record_attempt(&zone);
            }
            lock(&self.mode).record_trade();
        }

        self.finish(req, Some(zone), losses, response)
    }

    fn outbound_event(&self, req: &SignalRequest) -> DecisionEvent {
        let layer = req.layer.unwrap_or(EventLayer::Gate);
        let phase = match (req.phase, layer) {
            (Some(p), _) => Some(p),
            (None, EventLayer::Gate) => Some(Phase::Neutral),
            (None, _) => None,
        };
        let mut event = DecisionEvent::new(&self.cfg.instrument, layer, EventAction::Entry, phase)
            .with_direction(req.direction)
            .with_theta(req.theta)
            .with_reason(&req.signal_name);
        event.bar_time = req.bar_time;
        event.price = Some(req.price);
        event.execute_payload = req.execute_payload.clone();
        event
    }

    fn finish(&self, req: &SignalRequest, zone: Option<ZoneKey>, losses: u32, response: AuthorityResponse) -> GateDecision {
        let decision = GateDecision {
            signal_id: req.signal_id.clone(),
            signal_name: req.signal_name.clone(),
            zone,
            consecutive_loss_same_zone: losses,
            response,
        };
        let layer = decision.response.layer_failed.map(|l| l.index());
        logging::log_decision(
            &decision.signal_id,
            &decision.signal_name,
            decision.allowed(),
            decision.response.theta,
            layer,
            &decision.reason_text(),
        );
        self.append_audit(AuditEntry::Decision {
            ts: ts_now(),
            signal_id: decision.signal_id.clone(),
            signal_name: decision.signal_name.clone(),
            decision: decision.response.decision.as_str().to_string(),
            theta: decision.response.theta,
            size: decision.response.size.as_str().to_string(),
            reason: decision.response.reason.as_str().to_string(),
            layer_failed: layer,
            zone: decision.zone.as_ref().map(|z| z.to_string()),
        });
        decision
    }

    /// Run an event past the invariant guard. While halted, anything that
    /// issues authority is refused. Violations are audited.
    pub fn check_event(&self, event: &DecisionEvent) -> Result<(), EventRejection> {
        let result = lock(&self.guard).admit(event);
        match &result {
            Err(EventRejection::Violation(violation)) => {
                let value = event.to_value();
                self.append_audit(AuditEntry::Violation {
                    ts: violation.timestamp.clone(),
                    rules: violation.rules.iter().map(|r| r.id().to_string()).collect(),
                    fingerprint: logging::fingerprint(&value.to_string()),
                    event: value,
                });
            }
            Err(EventRejection::Halted) => logging::log(
                Level::Warn,
                Domain::Invariant,
                "event_refused_halted",
                logging::obj(&[
                    ("action", serde_json::to_value(event.action).unwrap_or(Value::Null)),
                    ("trade_id", serde_json::json!(event.trade_id)),
                ]),
            ),
            Ok(()) => {}
        }
        result
    }

    pub fn record_layer_conflict(&self, detail: &str) {
        lock(&self.guard).record_layer_conflict(detail);
        self.append_audit(AuditEntry::LayerConflict { ts: ts_now(), detail: detail.to_string() });
    }

    /// Queue an audit entry. Never waits on disk and never fails the caller.
    pub fn append_audit(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            if !audit.submit(entry) {
                logging::log(
                    Level::Warn,
                    Domain::Audit,
                    "audit_queue_closed",
                    logging::obj(&[("writer", logging::v_str(audit.name()))]),
                );
            }
        }
    }

    /// Feed a realized trade outcome into zone accounting. Returns the
    /// zone's consecutive loss count afterwards.
    pub fn record_outcome(&self, state: &str, direction: Direction, price: f64, outcome: Outcome, bars_held: Option<u32>) -> u32 {
        self.record_outcome_at(state, direction, price, outcome, bars_held, Utc::now())
    }

    pub fn record_outcome_at(
        &self,
        state: &str,
        direction: Direction,
        price: f64,
        outcome: Outcome,
        bars_held: Option<u32>,
        now: DateTime<Utc>,
    ) -> u32 {
        let zone = self.zone_for(state, direction, price);
        match outcome {
            Outcome::Win => {
                lock(&self.zones).record_win(&zone);
                lock(&self.retries).reset_zone(&zone);
                0
            }
            Outcome::Loss => {
                let count = lock(&self.zones).record_loss_at(&zone, now);
                lock(&self.retries).record_result(&zone, Outcome::Loss);
                let horizon = self.cfg.mode.fast_collapse_bars;
                if bars_held.map_or(false, |b| b <= horizon) {
                    self.record_fast_collapse();
                }
                count
            }
        }
    }

    pub fn record_fast_collapse(&self) -> Mode {
        lock(&self.mode).record_fast_collapse()
    }

    pub fn set_mode(&self, mode: Mode, manual: bool) {
        let mut controller = lock(&self.mode);
        if manual {
            controller.force_mode(mode, "Manual override");
        } else {
            controller.set_auto(mode, "Auto switch");
        }
    }

    pub fn reset_daily(&self) {
        lock(&self.zones).reset_all();
        lock(&self.engine).reset_stats();
        lock(&self.mode).reset_daily();
        lock(&self.retries).reset_all();
        lock(&self.seen_keys).clear();
        self.call_count.store(0, Ordering::SeqCst);
        logging::log(Level::Info, Domain::System, "daily_reset", logging::obj(&[]));
    }

    /// Out-of-band operator action closing the halt breaker.
    pub fn reset_halt(&self, note: &str) {
        lock(&self.guard).reset_halt();
        self.append_audit(AuditEntry::HaltReset { ts: ts_now(), note: note.to_string() });
        logging::log(
            Level::Warn,
            Domain::Invariant,
            "halt_reset",
            logging::obj(&[("note", logging::v_str(note))]),
        );
    }

    pub fn kill_switch(&self) -> KillSwitchVerdict {
        lock(&self.guard).kill_switch()
    }

    pub fn stats(&self) -> AuthorityStats {
        lock(&self.engine).stats().clone()
    }

    pub fn consecutive_loss(&self, zone: &ZoneKey) -> u32 {
        lock(&self.zones).get_consecutive_loss(zone)
    }

    pub fn status(&self) -> GateStatus {
        let mode = lock(&self.mode).status();
        let stats = self.stats();
        let (zone_stats, zones_with_losses) = {
            let zones = lock(&self.zones);
            (zones.stats(), zones.zones_with_losses())
        };
        let guard = lock(&self.guard).status();
        GateStatus {
            instrument: self.cfg.instrument.clone(),
            run_mode: self.cfg.run_mode,
            manual_override: mode.state.manual_override,
            mode,
            call_count: self.call_count.load(Ordering::SeqCst),
            allow_rate: stats.allow_rate(),
            stats,
            zone_stats,
            zones_with_losses,
            halted: guard.halted,
            guard,
        }
    }
}
