//! Excursion observation for open trades.
//!
//! Observations are advisory. They run for a fixed bar window from entry,
//! independent of when the trade itself exits, and only feed the
//! after-the-fact explanation of a closed trade.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::logging::{self, Domain, Level};
use crate::types::{Bar, Direction};

#[derive(Debug, Clone)]
pub struct ObserveConfig {
    /// Bars observed per trade before classification.
    pub window: u32,
    /// Early adverse excursion above this fails the entry check.
    pub adverse_cut: f64,
    pub convex_ratio: f64,
    pub concave_ratio: f64,
    /// Bar at which the early adverse excursion is frozen.
    pub initial_bars: u32,
    /// Overshoot ratio at which a long's extension hint is revoked.
    pub revoke_ratio: f64,
    /// Fewer ratio points than this leave the shape unknown.
    pub min_shape_points: usize,
    /// Adverse excursion beyond this with an unknown shape is unexplained.
    pub explain_fail_adverse: f64,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            window: 20,
            adverse_cut: 8.8,
            convex_ratio: 1.3,
            concave_ratio: 0.7,
            initial_bars: 5,
            revoke_ratio: 1.0,
            min_shape_points: 10,
            explain_fail_adverse: 15.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Shape {
    Convex,
    Concave,
    Linear,
    #[serde(rename = "unknown")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Completion {
    /// Ran the full window.
    Completed,
    /// Cut short by a flush before the window ran out.
    Flushed,
}

/// Adverse over favorable excursion, favorable floored at 0.01.
pub fn overshoot_ratio(adverse: f64, favorable: f64) -> f64 {
    adverse / favorable.max(0.01)
}

/// Share of the total excursion that went the trade's way.
pub fn efficiency_ratio(adverse: f64, favorable: f64) -> f64 {
    let total = adverse + favorable;
    if total < 0.01 {
        return 0.0;
    }
    favorable / total
}

/// Compares the late slope of the ratio trajectory against its early slope.
pub fn classify_shape(series: &[f64], cfg: &ObserveConfig) -> Shape {
    let n = series.len();
    if n < cfg.min_shape_points.max(2) {
        return Shape::Unknown;
    }
    let early_end = ((n as f64 * 0.3) as usize).max(2);
    let late_start = (n as f64 * 0.7) as usize;

    let mean_slope = |from: usize, to: usize| -> f64 {
        if from >= to {
            return 0.0;
        }
        let diffs: Vec<f64> = (from..to).map(|i| series[i] - series[i - 1]).collect();
        diffs.iter().sum::<f64>() / diffs.len() as f64
    };
    let mut early = mean_slope(1, early_end);
    let late = mean_slope(late_start + 1, n);

    if early.abs() < 0.001 {
        early = if early >= 0.0 { 0.001 } else { -0.001 };
    }
    let ratio = late / early;
    if ratio > cfg.convex_ratio {
        Shape::Convex
    } else if ratio < cfg.concave_ratio {
        Shape::Concave
    } else {
        Shape::Linear
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationRecord {
    pub trade_id: u64,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_time: i64,
    pub bars: u32,
    pub max_favorable: f64,
    pub max_adverse: f64,
    pub initial_adverse: Option<f64>,
    pub early_adverse_ok: Option<bool>,
    pub ratio_initial: Option<f64>,
    pub ratio_final: Option<f64>,
    pub ratio_peak: Option<f64>,
    pub efficiency_final: f64,
    pub shape: Shape,
    pub extension_hint: bool,
    pub extension_revoked: bool,
    pub completion: Completion,
    pub undecided: bool,
    pub explain_fail: bool,
}

#[derive(Debug, Clone)]
struct Observation {
    direction: Direction,
    entry_price: f64,
    entry_time: i64,
    bars: u32,
    max_favorable: f64,
    max_adverse: f64,
    ratios: Vec<f64>,
    initial_adverse: Option<f64>,
    early_adverse_ok: Option<bool>,
    extension_hint: bool,
    extension_revoked: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ObserveStatus {
    pub active: usize,
    pub completed: u64,
    pub adverse_cut: f64,
}

#[derive(Debug, Clone)]
pub struct ObservationTracker {
    cfg: ObserveConfig,
    active: BTreeMap<u64, Observation>,
    completed: u64,
}

impl Default for ObservationTracker {
    fn default() -> Self {
        Self::new(ObserveConfig::default())
    }
}

impl ObservationTracker {
    pub fn new(cfg: ObserveConfig) -> Self {
        Self { cfg, active: BTreeMap::new(), completed: 0 }
    }

    pub fn start(&mut self, trade_id: u64, direction: Direction, entry_price: f64, entry_time: i64) {
        self.active.insert(
            trade_id,
            Observation {
                direction,
                entry_price,
                entry_time,
                bars: 0,
                max_favorable: 0.0,
                max_adverse: 0.0,
                ratios: Vec::new(),
                initial_adverse: None,
                early_adverse_ok: None,
                extension_hint: false,
                extension_revoked: false,
            },
        );
    }

    pub fn is_observing(&self, trade_id: u64) -> bool {
        self.active.contains_key(&trade_id)
    }

    /// Advance every active observation by one bar. Returns the
    /// observations whose window closed on this bar.
    pub fn on_bar(&mut self, bar: &Bar) -> Vec<ObservationRecord> {
        let cfg = &self.cfg;
        let mut done = Vec::new();
        for (&trade_id, obs) in self.active.iter_mut() {
            obs.bars += 1;
            let (favorable, adverse) = match obs.direction {
                Direction::Short => (obs.entry_price - bar.low, bar.high - obs.entry_price),
                Direction::Long => (bar.high - obs.entry_price, obs.entry_price - bar.low),
            };
            obs.max_favorable = obs.max_favorable.max(favorable.max(0.0));
            obs.max_adverse = obs.max_adverse.max(adverse.max(0.0));

            let ratio = overshoot_ratio(obs.max_adverse, obs.max_favorable);
            obs.ratios.push(ratio);

            if obs.bars == cfg.initial_bars {
                obs.initial_adverse = Some(obs.max_adverse);
                let ok = obs.max_adverse <= cfg.adverse_cut;
                obs.early_adverse_ok = Some(ok);
                obs.extension_hint = ok;
            }
            if obs.direction == Direction::Long && obs.extension_hint && ratio >= cfg.revoke_ratio {
                obs.extension_hint = false;
                obs.extension_revoked = true;
            }
            if obs.bars >= cfg.window {
                done.push(trade_id);
            }
        }

        let mut records = Vec::with_capacity(done.len());
        for id in done {
            if let Some(obs) = self.active.remove(&id) {
                records.push(self.finish(id, obs, Completion::Completed));
            }
        }
        records
    }

    /// Close every observation still running, e.g. at the end of a replay.
    pub fn flush(&mut self) -> Vec<ObservationRecord> {
        let active = std::mem::take(&mut self.active);
        let mut records = Vec::with_capacity(active.len());
        for (id, obs) in active {
            records.push(self.finish(id, obs, Completion::Flushed));
        }
        records
    }

    fn finish(&mut self, trade_id: u64, obs: Observation, completion: Completion) -> ObservationRecord {
        let shape = classify_shape(&obs.ratios, &self.cfg);
        let record = ObservationRecord {
            trade_id,
            direction: obs.direction,
            entry_price: obs.entry_price,
            entry_time: obs.entry_time,
            bars: obs.bars,
            max_favorable: obs.max_favorable,
            max_adverse: obs.max_adverse,
            initial_adverse: obs.initial_adverse,
            early_adverse_ok: obs.early_adverse_ok,
            ratio_initial: obs.ratios.first().copied(),
            ratio_final: obs.ratios.last().copied(),
            ratio_peak: obs.ratios.iter().copied().reduce(f64::max),
            efficiency_final: efficiency_ratio(obs.max_adverse, obs.max_favorable),
            shape,
            extension_hint: obs.extension_hint,
            extension_revoked: obs.extension_revoked,
            completion,
            undecided: completion != Completion::Completed,
            explain_fail: obs.max_adverse > self.cfg.explain_fail_adverse && shape == Shape::Unknown,
        };
        self.completed += 1;
        logging::log(
            Level::Info,
            Domain::Observe,
            "observation_complete",
            logging::obj(&[
                ("trade_id", serde_json::json!(trade_id)),
                ("shape", serde_json::to_value(shape).unwrap_or_default()),
                ("max_adverse", logging::v_num(record.max_adverse)),
                ("max_favorable", logging::v_num(record.max_favorable)),
                ("undecided", serde_json::json!(record.undecided)),
                ("explain_fail", serde_json::json!(record.explain_fail)),
            ]),
        );
        record
    }

    pub fn status(&self) -> ObserveStatus {
        ObserveStatus { active: self.active.len(), completed: self.completed, adverse_cut: self.cfg.adverse_cut }
    }
}
