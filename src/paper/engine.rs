//! Bar loop for paper operation.
//!
//! While flat, the pre-transition layer runs first, then ignition. The
//! impulse defense only ever runs on an ignition entry bar. While a
//! position is open, only the trade context and exit checks run.

use anyhow::{anyhow, bail, Result};
use serde::Serialize;

use crate::authority::gate::{AuthorityGate, GateDecision, SignalRequest};
use crate::logging::{self, ts_now, Domain, Level};
use crate::observe::{ObservationRecord, ObservationTracker, ObserveConfig};
use crate::reliability::audit_log::AuditEntry;
use crate::ring::RingLog;
use crate::theta::{ThetaConfig, LOCK_IN};
use crate::types::{Bar, Direction, EventAction, EventLayer, Outcome, Phase, RunMode};
use crate::verify::invariants::{DecisionEvent, InvariantRule};
use crate::verify::position_sm::{apply_event, Event as PositionEvent, PositionSlot};

use super::audit::{self, AuditCounters, AuditReport, LedgerView, PromotionVerdict};
use super::detectors::{self, PreTransition};
use super::trade::{zone_state, ExitReason, TradeContext, TradeRecord};
use super::PaperConfig;

const LONG_PRE_TRANSITION_EXCLUDED: &str = "LONG_PRE_TRANSITION_EXCLUDED";
const EVENT_HISTORY: usize = 500;

/// One pre-transition detection, executed or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreTransitionSignal {
    pub bar_time: i64,
    pub bar_index: u64,
    pub direction: Direction,
    pub avg_pressure: f64,
    pub current_pressure: f64,
    pub change: f64,
    pub channel_pct: f64,
    pub executed: bool,
    pub blocked_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SignalStats {
    pub total: usize,
    pub long_count: usize,
    pub short_count: usize,
    /// Longs as a percentage of all detections.
    pub direction_ratio: f64,
    pub executed_count: usize,
    pub blocked_count: usize,
    pub execution_rate: f64,
    pub avg_change: f64,
    pub avg_channel_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayerStats {
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperStats {
    pub mode: RunMode,
    pub total_bars: u64,
    pub total_trades: usize,
    pub overall_win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub pre_transition: LayerStats,
    pub ignition: LayerStats,
    pub defense: LayerStats,
    pub extensions_applied: usize,
    pub theta_distribution: Vec<(u8, usize)>,
    pub counters: AuditCounters,
}

/// What a single bar produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BarOutcome {
    pub decisions: Vec<GateDecision>,
    pub entered: Option<u64>,
    pub exited: Option<TradeRecord>,
    pub observations: Vec<ObservationRecord>,
}

enum Entry {
    Opened(usize),
    Denied(String),
    Conflict,
}

fn round_to(v: f64, dp: i32) -> f64 {
    let f = 10f64.powi(dp);
    (v * f).round() / f
}

fn pct(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round_to(part as f64 / whole as f64 * 100.0, 1)
    }
}

fn layer_stats<'a>(trades: impl Iterator<Item = &'a TradeRecord>) -> LayerStats {
    let (mut n, mut wins) = (0, 0);
    for t in trades {
        n += 1;
        if t.result == Some(Outcome::Win) {
            wins += 1;
        }
    }
    LayerStats { trades: n, wins, win_rate: pct(wins, n) }
}

pub struct PaperEngine {
    cfg: PaperConfig,
    theta_cfg: ThetaConfig,
    instrument: String,
    bars: RingLog<Bar>,
    pressures: RingLog<f64>,
    bar_count: u64,
    last_trade_bar: Option<u64>,
    slot: PositionSlot,
    ctx: Option<TradeContext>,
    active: Option<usize>,
    trades: Vec<TradeRecord>,
    signals: Vec<PreTransitionSignal>,
    events: RingLog<DecisionEvent>,
    counters: AuditCounters,
    observer: ObservationTracker,
}

impl PaperEngine {
    pub fn new(instrument: &str, cfg: PaperConfig, theta_cfg: ThetaConfig, observe_cfg: ObserveConfig) -> Self {
        let bar_cap = cfg.bar_buffer.max(cfg.channel_period);
        let pressure_cap = cfg.pressure_buffer.max(cfg.pre_window).max(cfg.impulse_history);
        Self {
            instrument: instrument.to_string(),
            bars: RingLog::new(bar_cap),
            pressures: RingLog::new(pressure_cap),
            bar_count: 0,
            last_trade_bar: None,
            slot: PositionSlot::new(),
            ctx: None,
            active: None,
            trades: Vec::new(),
            signals: Vec::new(),
            events: RingLog::new(EVENT_HISTORY),
            counters: AuditCounters::default(),
            observer: ObservationTracker::new(observe_cfg),
            cfg,
            theta_cfg,
        }
    }

    pub fn with_defaults(instrument: &str) -> Self {
        Self::new(instrument, PaperConfig::default(), ThetaConfig::default(), ObserveConfig::default())
    }

    /// Process one accepted bar. A fault inside processing is counted and
    /// logged; it fails the stability check instead of unwinding the caller.
    pub fn on_bar(&mut self, bar: &Bar, gate: &AuthorityGate) -> BarOutcome {
        let mut out = BarOutcome::default();
        if let Err(err) = self.process(bar, gate, &mut out) {
            self.counters.engine_errors += 1;
            logging::log(
                Level::Error,
                Domain::Paper,
                "engine_error",
                logging::obj(&[
                    ("instrument", logging::v_str(&self.instrument)),
                    ("bar_time", serde_json::json!(bar.time)),
                    ("error", logging::v_str(&err.to_string())),
                ]),
            );
        }
        out
    }

    fn process(&mut self, bar: &Bar, gate: &AuthorityGate, out: &mut BarOutcome) -> Result<()> {
        if ![bar.open, bar.high, bar.low, bar.close].iter().all(|v| v.is_finite()) {
            bail!("non-finite price in bar {}", bar.time);
        }
        self.bars.push(*bar);
        self.bar_count += 1;
        let pressure = detectors::pressure(bar);
        self.pressures.push(pressure);

        for record in self.observer.on_bar(bar) {
            self.attach_observation(&record);
            out.observations.push(record);
        }

        if self.slot.is_open() {
            return self.manage_open(bar, gate, out);
        }

        let pressures = self.pressure_history();
        if let Some(pre) = detectors::detect_pre_transition(&pressures, self.cfg.pre_window, self.cfg.pre_shift) {
            self.on_pre_transition(bar, pre, gate, out)?;
            if pre.direction == Direction::Short {
                return Ok(());
            }
        }

        if self.bars.len() < self.cfg.min_bars_for_ignition || !self.cooled_down() {
            return Ok(());
        }
        let channel = self.channel();
        if let Some(direction) = detectors::detect_ignition(pressure, channel, &self.cfg) {
            if let Entry::Opened(idx) = self.enter(bar, direction, EventLayer::Ignition, gate, out)? {
                self.apply_defense(idx, bar, gate)?;
            }
        }
        Ok(())
    }

    fn cooled_down(&self) -> bool {
        match self.last_trade_bar {
            Some(last) => self.bar_count.saturating_sub(last) >= self.cfg.cooldown_bars,
            None => true,
        }
    }

    fn pressure_history(&self) -> Vec<f64> {
        self.pressures.iter().copied().collect()
    }

    fn channel(&self) -> f64 {
        let bars: Vec<Bar> = self.bars.iter().copied().collect();
        detectors::channel_pct(&bars, self.cfg.channel_period)
    }

    fn on_pre_transition(&mut self, bar: &Bar, pre: PreTransition, gate: &AuthorityGate, out: &mut BarOutcome) -> Result<()> {
        let mut signal = PreTransitionSignal {
            bar_time: bar.time,
            bar_index: self.bar_count,
            direction: pre.direction,
            avg_pressure: round_to(pre.avg_pressure, 4),
            current_pressure: round_to(pre.current_pressure, 4),
            change: round_to(pre.change, 4),
            channel_pct: round_to(self.channel(), 1),
            executed: false,
            blocked_by: None,
        };

        match pre.direction {
            // Buy-side shifts are recorded for study but never traded.
            Direction::Long => signal.blocked_by = Some(LONG_PRE_TRANSITION_EXCLUDED.to_string()),
            Direction::Short => match self.enter(bar, Direction::Short, EventLayer::PreTransition, gate, out)? {
                Entry::Opened(_) => signal.executed = true,
                Entry::Denied(reason) => signal.blocked_by = Some(reason),
                Entry::Conflict => signal.blocked_by = Some("layer_conflict".to_string()),
            },
        }

        logging::log(
            Level::Info,
            Domain::Paper,
            "pre_transition_signal",
            logging::obj(&[
                ("instrument", logging::v_str(&self.instrument)),
                ("direction", logging::v_str(signal.direction.as_str())),
                ("avg_pressure", logging::v_num(signal.avg_pressure)),
                ("change", logging::v_num(signal.change)),
                ("channel_pct", logging::v_num(signal.channel_pct)),
                ("executed", serde_json::json!(signal.executed)),
                ("blocked_by", serde_json::json!(signal.blocked_by)),
            ]),
        );
        self.signals.push(signal);
        Ok(())
    }

    /// Open a position for `layer` if the gate allows it.
    ///
    /// `process` only calls this while flat, and a SHORT pre-transition
    /// ends the bar before ignition runs, so `on_bar` never reaches the
    /// open-slot branch. It stays as a guard on the slot: a second entry is
    /// recorded as a layer conflict and never opens a trade.
    fn enter(&mut self, bar: &Bar, direction: Direction, layer: EventLayer, gate: &AuthorityGate, out: &mut BarOutcome) -> Result<Entry> {
        let (phase, signal_name) = match (layer, direction) {
            (EventLayer::PreTransition, _) => (Phase::PreTransition, self.cfg.pre_transition_signal.clone()),
            (EventLayer::Ignition, Direction::Short) => (Phase::Ignition, self.cfg.ignition_short_signal.clone()),
            (EventLayer::Ignition, Direction::Long) => (Phase::Ignition, self.cfg.ignition_long_signal.clone()),
            (other, _) => bail!("layer {} cannot open a position", other.as_str()),
        };

        if self.slot.is_open() {
            let detail = format!("{} entry on {} while trade {:?} is open", layer.as_str(), direction, self.slot.trade_id);
            self.layer_conflict(gate, &detail);
            return Ok(Entry::Conflict);
        }

        let trade_id = self.trades.len() as u64 + 1;
        let signal_id = format!("{}:{}:{}", self.instrument, signal_name, bar.time);
        let mut req = SignalRequest::new(&signal_id, &signal_name, zone_state(direction), direction, bar.close, self.cfg.entry_theta);
        req.layer = Some(layer);
        req.phase = Some(phase);
        req.bar_time = Some(bar.time);

        let decision = gate.authorize(&req);
        let allowed = decision.allowed();
        let reason = decision.response.reason.as_str().to_string();
        out.decisions.push(decision);
        if !allowed {
            return Ok(Entry::Denied(reason));
        }

        if let Err(e) = apply_event(&mut self.slot, PositionEvent::Enter { trade_id, direction }) {
            self.layer_conflict(gate, &e.msg);
            return Ok(Entry::Conflict);
        }

        let record = TradeRecord::open(
            trade_id,
            &signal_name,
            layer,
            phase,
            direction,
            bar.close,
            bar.time,
            self.bar_count,
            self.cfg.normal_stop,
            self.cfg.take_profit,
            detectors::pressure(bar),
        );
        logging::log_trade(
            "trade_entry",
            &self.instrument,
            trade_id,
            &[
                ("layer", logging::v_str(layer.as_str())),
                ("phase", logging::v_str(phase.as_str())),
                ("direction", logging::v_str(direction.as_str())),
                ("entry_price", logging::v_num(record.entry_price)),
                ("tp_price", logging::v_num(record.tp_price)),
                ("sl_price", logging::v_num(record.sl_price)),
            ],
        );
        self.trades.push(record);
        let idx = self.trades.len() - 1;
        self.active = Some(idx);
        self.ctx = Some(TradeContext::new(bar.close, direction, self.theta_cfg.clone()));
        self.last_trade_bar = Some(self.bar_count);
        self.observer.start(trade_id, direction, bar.close, bar.time);
        self.note_event(
            DecisionEvent::new(&self.instrument, layer, EventAction::Entry, Some(phase))
                .with_direction(direction)
                .with_trade(trade_id)
                .with_theta(self.cfg.entry_theta)
                .with_bar(bar.time, bar.close)
                .with_reason(&signal_name),
        );
        out.entered = Some(trade_id);
        Ok(Entry::Opened(idx))
    }

    /// Same-bar impulse defense: tightens the stop once, on the entry bar only.
    fn apply_defense(&mut self, idx: usize, bar: &Bar, gate: &AuthorityGate) -> Result<()> {
        let (entry_bar, defended, trade_id, direction) = {
            let t = self.trades.get(idx).ok_or_else(|| anyhow!("no trade at index {}", idx))?;
            (t.entry_bar, t.defense_applied, t.trade_id, t.direction)
        };
        if entry_bar != self.bar_count {
            self.counters.defense_timing_errors += 1;
            return Ok(());
        }
        if defended {
            return Ok(());
        }

        let pressure = detectors::pressure(bar);
        let history = self.pressure_history();
        if !detectors::is_impulse(pressure, self.channel(), &history, &self.cfg) {
            return Ok(());
        }

        let event = DecisionEvent::new(&self.instrument, EventLayer::Defense, EventAction::Defense, Some(Phase::Immediate))
            .with_direction(direction)
            .with_trade(trade_id)
            .with_bar(bar.time, bar.close)
            .with_reason("impulse");
        let checked = gate.check_event(&event);
        self.note_event(event);
        if checked.is_err() {
            return Ok(());
        }

        let tight = self.cfg.tight_stop;
        let t = self.trades.get_mut(idx).ok_or_else(|| anyhow!("no trade at index {}", idx))?;
        let old = t.stop_distance;
        t.stop_distance = tight;
        t.reprice();
        t.defense_applied = true;
        logging::log_trade(
            "impulse_defense",
            &self.instrument,
            trade_id,
            &[("old_stop", logging::v_num(old)), ("new_stop", logging::v_num(tight)), ("sl_price", logging::v_num(t.sl_price))],
        );
        Ok(())
    }

    fn manage_open(&mut self, bar: &Bar, gate: &AuthorityGate, out: &mut BarOutcome) -> Result<()> {
        let idx = self.active.ok_or_else(|| anyhow!("position open without an active trade"))?;
        let theta = self
            .ctx
            .as_mut()
            .ok_or_else(|| anyhow!("position open without a trade context"))?
            .update(bar.close);

        self.maybe_extend(idx, theta, bar, gate)?;

        let hit = self
            .trades
            .get(idx)
            .ok_or_else(|| anyhow!("no trade at index {}", idx))?
            .exit_hit(bar.high, bar.low);
        if let Some((reason, outcome, pnl)) = hit {
            self.close_trade(idx, reason, outcome, pnl, bar, gate, out)?;
        }
        Ok(())
    }

    fn maybe_extend(&mut self, idx: usize, theta: u8, bar: &Bar, gate: &AuthorityGate) -> Result<()> {
        let points = match self.cfg.extension_points {
            Some(p) if p > 0.0 => p,
            _ => return Ok(()),
        };
        let (layer, phase, direction, trade_id, extended) = {
            let t = self.trades.get(idx).ok_or_else(|| anyhow!("no trade at index {}", idx))?;
            (t.layer, t.phase, t.direction, t.trade_id, t.extension_applied)
        };
        if extended || theta < LOCK_IN {
            return Ok(());
        }

        let event = DecisionEvent::new(&self.instrument, layer, EventAction::Extend, Some(phase))
            .with_direction(direction)
            .with_trade(trade_id)
            .with_theta(theta)
            .with_bar(bar.time, bar.close)
            .with_reason("lock_in_extension");
        let checked = gate.check_event(&event);
        self.note_event(event);
        if let Err(rejection) = checked {
            if rejection.violation().is_some_and(|v| v.rules.contains(&InvariantRule::ExtensionWithoutLockIn)) {
                self.counters.theta3_violations += 1;
            }
            return Ok(());
        }

        let t = self.trades.get_mut(idx).ok_or_else(|| anyhow!("no trade at index {}", idx))?;
        t.take_profit_distance += points;
        t.reprice();
        t.extension_applied = true;
        logging::log_trade(
            "take_profit_extended",
            &self.instrument,
            trade_id,
            &[("theta", serde_json::json!(theta)), ("tp_price", logging::v_num(t.tp_price))],
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn close_trade(
        &mut self,
        idx: usize,
        reason: ExitReason,
        outcome: Outcome,
        pnl: f64,
        bar: &Bar,
        gate: &AuthorityGate,
        out: &mut BarOutcome,
    ) -> Result<()> {
        let ctx = self.ctx.take().ok_or_else(|| anyhow!("exit without a trade context"))?;
        let bar_index = self.bar_count;
        let closed = {
            let t = self.trades.get_mut(idx).ok_or_else(|| anyhow!("no trade at index {}", idx))?;
            t.close(&ctx, reason, outcome, pnl, bar.time, bar_index);
            t.clone()
        };
        if closed.exit_reason.is_none() {
            self.counters.exit_reason_missing += 1;
        }

        let exit_price = match reason {
            ExitReason::TakeProfit => closed.tp_price,
            ExitReason::StopLoss => closed.sl_price,
        };
        let event = DecisionEvent::new(&self.instrument, closed.layer, EventAction::Exit, Some(closed.phase))
            .with_direction(closed.direction)
            .with_trade(closed.trade_id)
            .with_theta(closed.theta_label)
            .with_bar(bar.time, exit_price)
            .with_reason(reason.as_str());
        // Exits pass a halted guard. A violation is recorded; the exit still stands.
        let _ = gate.check_event(&event);
        self.note_event(event);

        apply_event(&mut self.slot, PositionEvent::Exit { trade_id: closed.trade_id }).map_err(|e| anyhow!(e.msg))?;
        apply_event(&mut self.slot, PositionEvent::Release).map_err(|e| anyhow!(e.msg))?;
        self.active = None;

        gate.record_outcome(closed.zone_state(), closed.direction, closed.entry_price, outcome, Some(ctx.bars_held));
        gate.append_audit(AuditEntry::Trade {
            ts: ts_now(),
            trade_id: closed.trade_id,
            layer: closed.layer.as_str().to_string(),
            direction: closed.direction.as_str().to_string(),
            entry_price: closed.entry_price,
            exit_price,
            pnl,
            exit_reason: reason.as_str().to_string(),
            theta: closed.theta_label,
        });
        logging::log_trade(
            "trade_exit",
            &self.instrument,
            closed.trade_id,
            &[
                ("exit_reason", logging::v_str(reason.as_str())),
                ("pnl", logging::v_num(pnl)),
                ("bars_held", serde_json::json!(closed.final_bars)),
                ("final_theta", serde_json::json!(closed.theta_label)),
                ("final_mfe", logging::v_num(closed.final_mfe)),
            ],
        );
        out.exited = Some(closed);
        Ok(())
    }

    fn layer_conflict(&mut self, gate: &AuthorityGate, detail: &str) {
        self.counters.layer_conflicts += 1;
        gate.record_layer_conflict(detail);
    }

    fn note_event(&mut self, event: DecisionEvent) {
        if event.phase.is_none() && event.action != EventAction::Observe {
            self.counters.phase_tag_missing += 1;
        }
        self.events.push(event);
    }

    fn attach_observation(&mut self, record: &ObservationRecord) {
        if let Some(t) = self.trades.iter_mut().find(|t| t.trade_id == record.trade_id) {
            t.observation = Some(record.clone());
        }
    }

    /// Close out any running observations, e.g. at the end of a replay.
    pub fn finish(&mut self) -> Vec<ObservationRecord> {
        let records = self.observer.flush();
        for r in &records {
            self.attach_observation(r);
        }
        records
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn bar_count(&self) -> u64 {
        self.bar_count
    }

    pub fn is_flat(&self) -> bool {
        !self.slot.is_open()
    }

    pub fn open_trade(&self) -> Option<&TradeRecord> {
        self.active.and_then(|i| self.trades.get(i))
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn signals(&self) -> &[PreTransitionSignal] {
        &self.signals
    }

    pub fn recent_events(&self, n: usize) -> Vec<&DecisionEvent> {
        self.events.tail(n)
    }

    pub fn counters(&self) -> &AuditCounters {
        &self.counters
    }

    pub fn signal_stats(&self) -> SignalStats {
        let total = self.signals.len();
        if total == 0 {
            return SignalStats::default();
        }
        let long_count = self.signals.iter().filter(|s| s.direction == Direction::Long).count();
        let executed_count = self.signals.iter().filter(|s| s.executed).count();
        SignalStats {
            total,
            long_count,
            short_count: total - long_count,
            direction_ratio: pct(long_count, total),
            executed_count,
            blocked_count: total - executed_count,
            execution_rate: pct(executed_count, total),
            avg_change: round_to(self.signals.iter().map(|s| s.change).sum::<f64>() / total as f64, 4),
            avg_channel_pct: round_to(self.signals.iter().map(|s| s.channel_pct).sum::<f64>() / total as f64, 1),
        }
    }

    pub fn stats(&self) -> PaperStats {
        let closed: Vec<&TradeRecord> = self.trades.iter().filter(|t| t.is_closed()).collect();
        let total_pnl: f64 = closed.iter().filter_map(|t| t.pnl).sum();
        let wins = closed.iter().filter(|t| t.result == Some(Outcome::Win)).count();

        let mut dist = std::collections::BTreeMap::new();
        for t in &closed {
            *dist.entry(t.theta_label).or_insert(0usize) += 1;
        }

        PaperStats {
            mode: RunMode::Paper,
            total_bars: self.bar_count,
            total_trades: closed.len(),
            overall_win_rate: pct(wins, closed.len()),
            total_pnl: round_to(total_pnl, 2),
            avg_pnl: if closed.is_empty() { 0.0 } else { round_to(total_pnl / closed.len() as f64, 2) },
            pre_transition: layer_stats(closed.iter().copied().filter(|t| t.layer == EventLayer::PreTransition)),
            ignition: layer_stats(closed.iter().copied().filter(|t| t.layer == EventLayer::Ignition)),
            defense: layer_stats(closed.iter().copied().filter(|t| t.defense_applied)),
            extensions_applied: closed.iter().filter(|t| t.extension_applied).count(),
            theta_distribution: dist.into_iter().collect(),
            counters: self.counters.clone(),
        }
    }

    pub fn audit(&self) -> AuditReport {
        let ledger = LedgerView {
            slot_entries: self.slot.entries,
            slot_exits: self.slot.exits,
            open_trades: u64::from(self.active.is_some()),
        };
        audit::evaluate(&self.counters, &self.trades, ledger)
    }

    /// Paper-to-live verdict: all audit checks plus the guard's kill switch.
    pub fn promotion(&self, gate: &AuthorityGate) -> PromotionVerdict {
        audit::promotion_verdict(&self.audit(), &gate.kill_switch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::Mode;
    use crate::observe::Completion;

    const T0: i64 = 1_767_225_600_000;

    fn flat(i: i64) -> Bar {
        Bar::new(T0 + i * 60_000, 100.0, 101.0, 99.0, 100.0)
    }

    fn at(i: i64, high: f64, low: f64, close: f64) -> Bar {
        Bar::new(T0 + i * 60_000, close, high, low, close)
    }

    /// 19 balanced bars then a close near a fresh high: ignition SHORT at 102.25.
    fn drive_to_short_ignition(engine: &mut PaperEngine, gate: &AuthorityGate) -> BarOutcome {
        for i in 0..19 {
            let out = engine.on_bar(&flat(i), gate);
            assert!(out.entered.is_none());
        }
        engine.on_bar(&at(19, 103.0, 100.0, 102.25), gate)
    }

    #[test]
    fn test_ignition_entry_goes_through_gate() {
        let gate = AuthorityGate::default();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        let out = drive_to_short_ignition(&mut engine, &gate);
        assert_eq!(out.entered, Some(1));
        assert_eq!(out.decisions.len(), 1);
        assert!(out.decisions[0].allowed());
        assert_eq!(out.decisions[0].signal_name, "STB_SHORT");

        let t = engine.open_trade().unwrap();
        assert_eq!(t.layer, EventLayer::Ignition);
        assert_eq!(t.phase, Phase::Ignition);
        assert_eq!(t.tp_price, 82.25);
        assert_eq!(t.sl_price, 117.25);
        assert!(!t.defense_applied);
        assert!(!engine.is_flat());
    }

    #[test]
    fn test_take_profit_exit_and_stats() {
        let gate = AuthorityGate::default();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        drive_to_short_ignition(&mut engine, &gate);
        let out = engine.on_bar(&at(20, 103.0, 82.0, 83.0), &gate);
        let closed = out.exited.unwrap();
        assert_eq!(closed.exit_reason, Some(ExitReason::TakeProfit));
        assert_eq!(closed.result, Some(Outcome::Win));
        assert_eq!(closed.pnl, Some(20.0));
        assert_eq!(closed.final_bars, 1);
        assert!(engine.is_flat());

        let stats = engine.stats();
        assert_eq!(stats.total_trades, 1);
        assert_eq!(stats.overall_win_rate, 100.0);
        assert_eq!(stats.ignition.trades, 1);
        assert_eq!(stats.total_pnl, 20.0);
        assert!(engine.audit().ready_for_live);
        assert!(engine.promotion(&gate).promote);
    }

    #[test]
    fn test_stop_loss_feeds_zone_and_fast_collapse() {
        let gate = AuthorityGate::default();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        drive_to_short_ignition(&mut engine, &gate);
        let out = engine.on_bar(&at(20, 118.0, 101.0, 110.0), &gate);
        let closed = out.exited.unwrap();
        assert_eq!(closed.exit_reason, Some(ExitReason::StopLoss));
        assert_eq!(closed.pnl, Some(-15.0));

        let zone = gate.zone_for("OVERBOUGHT", Direction::Short, 102.25);
        assert_eq!(gate.consecutive_loss(&zone), 1);
        assert_eq!(gate.status().mode.fast_collapse_count, 1);
    }

    #[test]
    fn test_cooldown_blocks_immediate_reentry() {
        let gate = AuthorityGate::default();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        drive_to_short_ignition(&mut engine, &gate);
        engine.on_bar(&at(20, 103.0, 82.0, 83.0), &gate);
        // same ignition shape two bars after entry
        let out = engine.on_bar(&at(21, 103.0, 82.0, 102.0), &gate);
        assert!(out.entered.is_none());
        assert!(out.decisions.is_empty());
    }

    #[test]
    fn test_short_pre_transition_executes() {
        let gate = AuthorityGate::default();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        for i in 0..10 {
            engine.on_bar(&at(i, 102.0, 99.0, 101.0), &gate);
        }
        let out = engine.on_bar(&at(10, 102.0, 99.0, 100.0), &gate);
        assert_eq!(out.entered, Some(1));
        let t = engine.open_trade().unwrap();
        assert_eq!(t.layer, EventLayer::PreTransition);
        assert_eq!(t.phase, Phase::PreTransition);
        assert_eq!(t.signal_name, "OPA_SHORT");

        let sig = &engine.signals()[0];
        assert_eq!(sig.direction, Direction::Short);
        assert!(sig.executed);
        assert_eq!(engine.signal_stats().executed_count, 1);
    }

    #[test]
    fn test_long_pre_transition_is_recorded_not_traded() {
        let gate = AuthorityGate::default();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        for i in 0..10 {
            engine.on_bar(&at(i, 102.0, 99.0, 100.0), &gate);
        }
        let out = engine.on_bar(&at(10, 102.0, 99.0, 101.0), &gate);
        assert!(out.entered.is_none());
        assert!(out.decisions.is_empty());
        let sig = &engine.signals()[0];
        assert_eq!(sig.direction, Direction::Long);
        assert!(!sig.executed);
        assert_eq!(sig.blocked_by.as_deref(), Some(LONG_PRE_TRANSITION_EXCLUDED));
        let stats = engine.signal_stats();
        assert_eq!(stats.long_count, 1);
        assert_eq!(stats.direction_ratio, 100.0);
    }

    #[test]
    fn test_gate_denial_blocks_entry() {
        let gate = AuthorityGate::default();
        gate.set_mode(Mode::Conservative, true);
        let mut engine = PaperEngine::with_defaults("NQ1!");
        for i in 0..10 {
            engine.on_bar(&at(i, 102.0, 99.0, 101.0), &gate);
        }
        let out = engine.on_bar(&at(10, 102.0, 99.0, 100.0), &gate);
        assert!(out.entered.is_none());
        assert!(!out.decisions[0].allowed());
        let sig = &engine.signals()[0];
        assert!(!sig.executed);
        assert_eq!(sig.blocked_by.as_deref(), Some("not_tier1"));
        assert!(engine.trades().is_empty());
    }

    #[test]
    fn test_impulse_defense_tightens_stop_on_entry_bar() {
        let gate = AuthorityGate::default();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        for i in 0..19 {
            engine.on_bar(&flat(i), &gate);
        }
        // close on the high of a fresh extreme: pressure saturates, channel 100%
        let out = engine.on_bar(&at(19, 104.0, 100.0, 104.0), &gate);
        assert_eq!(out.entered, Some(1));
        let t = engine.open_trade().unwrap();
        assert!(t.defense_applied);
        assert_eq!(t.stop_distance, 8.0);
        assert_eq!(t.sl_price, 112.0);
        assert!(engine.recent_events(5).iter().any(|e| e.layer == EventLayer::Defense && e.phase == Some(Phase::Immediate)));
    }

    #[test]
    fn test_defense_off_entry_bar_is_timing_error() {
        let gate = AuthorityGate::default();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        drive_to_short_ignition(&mut engine, &gate);
        engine.on_bar(&at(20, 103.0, 101.0, 102.0), &gate);
        engine.apply_defense(0, &at(20, 103.0, 101.0, 102.0), &gate).unwrap();
        assert_eq!(engine.counters().defense_timing_errors, 1);
        assert!(engine.audit().failures.contains(&"CHECK_4_defense_timing"));
    }

    #[test]
    fn test_second_entry_on_open_slot_is_layer_conflict() {
        let gate = AuthorityGate::default();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        drive_to_short_ignition(&mut engine, &gate);
        let mut out = BarOutcome::default();
        let res = engine.enter(&at(20, 103.0, 100.0, 102.0), Direction::Short, EventLayer::Ignition, &gate, &mut out).unwrap();
        assert!(matches!(res, Entry::Conflict));
        assert!(out.decisions.is_empty());
        assert_eq!(engine.trades().len(), 1);
        assert_eq!(engine.counters().layer_conflicts, 1);
        assert!(gate.kill_switch().blocks_live());
        assert!(!engine.promotion(&gate).promote);
    }

    #[test]
    fn test_non_finite_bar_counts_engine_error() {
        let gate = AuthorityGate::default();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        engine.on_bar(&Bar::new(T0, 1.0, f64::NAN, 1.0, 1.0), &gate);
        assert_eq!(engine.counters().engine_errors, 1);
        assert!(engine.audit().failures.contains(&"CHECK_6_engine_stability"));
    }

    #[test]
    fn test_extension_at_lock_in() {
        let gate = AuthorityGate::default();
        let cfg = PaperConfig { extension_points: Some(10.0), ..PaperConfig::default() };
        let mut engine = PaperEngine::new("NQ1!", cfg, ThetaConfig::default(), ObserveConfig::default());
        drive_to_short_ignition(&mut engine, &gate);
        // close 15+ in favour, low stays above the target
        let out = engine.on_bar(&at(20, 90.0, 86.0, 87.0), &gate);
        assert!(out.exited.is_none());
        let t = engine.open_trade().unwrap();
        assert!(t.extension_applied);
        assert_eq!(t.tp_price, 72.25);
        assert_eq!(engine.counters().theta3_violations, 0);
    }

    #[test]
    fn test_observation_outlives_trade_and_attaches() {
        let gate = AuthorityGate::default();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        drive_to_short_ignition(&mut engine, &gate);
        engine.on_bar(&at(20, 103.0, 82.0, 83.0), &gate);
        assert!(engine.trades()[0].observation.is_none());

        let mut completed = Vec::new();
        for i in 21..40 {
            completed.extend(engine.on_bar(&at(i, 84.0, 82.0, 83.0), &gate).observations);
        }
        assert_eq!(completed.len(), 1);
        let obs = engine.trades()[0].observation.as_ref().unwrap();
        assert_eq!(obs.bars, 20);
        assert_eq!(obs.completion, Completion::Completed);
    }

    #[test]
    fn test_finish_flushes_open_observation() {
        let gate = AuthorityGate::default();
        let mut engine = PaperEngine::with_defaults("NQ1!");
        drive_to_short_ignition(&mut engine, &gate);
        engine.on_bar(&at(20, 103.0, 101.0, 102.0), &gate);
        let flushed = engine.finish();
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].undecided);
        assert!(engine.trades()[0].observation.is_some());
    }

    #[test]
    fn test_halted_gate_stops_entries() {
        let gate = AuthorityGate::default();
        let mut bad = SignalRequest::new("x", "STB_SHORT", "OVERBOUGHT", Direction::Short, 1.0, 1);
        bad.execute_payload = Some(serde_json::json!({"qty": 1}));
        gate.authorize(&bad);
        assert!(gate.is_halted());

        let mut engine = PaperEngine::with_defaults("NQ1!");
        let out = drive_to_short_ignition(&mut engine, &gate);
        assert!(out.entered.is_none());
        assert_eq!(out.decisions[0].response.reason.as_str(), "halted");
    }

    #[test]
    fn test_halt_mid_trade_blocks_extension_but_not_exit() {
        let gate = AuthorityGate::default();
        let cfg = PaperConfig { extension_points: Some(10.0), ..PaperConfig::default() };
        let mut engine = PaperEngine::new("NQ1!", cfg, ThetaConfig::default(), ObserveConfig::default());
        assert_eq!(drive_to_short_ignition(&mut engine, &gate).entered, Some(1));

        let mut bad = SignalRequest::new("x", "STB_SHORT", "OVERBOUGHT", Direction::Short, 1.0, 1);
        bad.execute_payload = Some(serde_json::json!({"qty": 1}));
        gate.authorize(&bad);
        assert!(gate.is_halted());

        // same 15-point favourable move that extends on a healthy gate
        let out = engine.on_bar(&at(20, 90.0, 86.0, 87.0), &gate);
        assert!(out.exited.is_none());
        let t = engine.open_trade().unwrap();
        assert!(!t.extension_applied);
        assert_eq!(t.tp_price, 82.25);
        assert_eq!(engine.counters().theta3_violations, 0);

        let out = engine.on_bar(&at(21, 88.0, 82.0, 83.0), &gate);
        assert_eq!(out.exited.unwrap().exit_reason, Some(ExitReason::TakeProfit));
        assert!(engine.is_flat());
    }
}
