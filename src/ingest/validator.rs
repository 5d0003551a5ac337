use anyhow::Context;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::logging::{self, ts_epoch_ms, Domain};
use crate::reliability::writer::BackgroundWriter;
use crate::ring::RecentSet;
use crate::storage::{CheckpointStore, NullCheckpoint};
use crate::types::{Bar, RawBar};

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Recent timestamps remembered for duplicate detection.
    pub seen_cap: usize,
    /// How far ahead of wall-clock the stored last timestamp may sit before
    /// it is treated as corrupted.
    pub future_tolerance_ms: i64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self { seen_cap: 500, future_tolerance_ms: 120_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RejectKind {
    Schema,
    Dup,
    Order,
}

impl RejectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectKind::Schema => "SCHEMA",
            RejectKind::Dup => "DUP",
            RejectKind::Order => "ORDER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub primary: RejectKind,
    pub reasons: Vec<RejectKind>,
    pub detail: String,
    pub time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept(Bar),
    Reject(Rejection),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept(_))
    }

    pub fn bar(&self) -> Option<&Bar> {
        match self {
            Verdict::Accept(bar) => Some(bar),
            Verdict::Reject(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Verdict::Accept(_) => None,
            Verdict::Reject(r) => Some(r),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidatorStatus {
    pub instrument: String,
    pub last_ts: Option<i64>,
    pub seen_count: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub corruption_resets: u64,
    pub checkpoint_present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointOp {
    Save(i64),
    Clear,
}

/// Checkpoint store moved onto its own writer thread. `present` mirrors
/// whether the store holds a row for the instrument.
struct Checkpointer {
    writer: BackgroundWriter<CheckpointOp>,
    present: Arc<AtomicBool>,
}

impl Checkpointer {
    fn spawn(instrument: &str, mut store: Box<dyn CheckpointStore>, present: bool) -> anyhow::Result<Self> {
        let flag = Arc::new(AtomicBool::new(present));
        let seen_by_writer = flag.clone();
        let instrument = instrument.to_string();
        let writer = BackgroundWriter::spawn("checkpoint", Domain::Ingest, move |op: CheckpointOp| {
            match op {
                CheckpointOp::Save(ts) => {
                    store.save(&instrument, ts).with_context(|| format!("save {} {}", instrument, ts))?;
                    seen_by_writer.store(true, Ordering::Relaxed);
                }
                CheckpointOp::Clear => {
                    store.clear(&instrument).with_context(|| format!("clear {}", instrument))?;
                    seen_by_writer.store(false, Ordering::Relaxed);
                }
            }
            Ok(())
        })?;
        Ok(Self { writer, present: flag })
    }
}

pub struct CandleValidator {
    instrument: String,
    cfg: ValidatorConfig,
    seen: RecentSet<i64>,
    last_ts: Option<i64>,
    checkpoint: Option<Checkpointer>,
    accepted: u64,
    rejected: u64,
    corruption_resets: u64,
}

fn check_schema(raw: &RawBar) -> Result<Bar, String> {
    let time = match raw.time {
        None => return Err("MISSING_FIELD:time".to_string()),
        Some(0) => return Err("EMPTY_FIELD:time".to_string()),
        Some(t) => t,
    };
    let mut prices = [0.0; 4];
    for (slot, (name, value)) in prices.iter_mut().zip([
        ("open", raw.open),
        ("high", raw.high),
        ("low", raw.low),
        ("close", raw.close),
    ]) {
        let v = value.ok_or_else(|| format!("MISSING_FIELD:{}", name))?;
        if !v.is_finite() || v <= 0.0 {
            return Err(format!("INVALID_VALUE:{}={}", name, v));
        }
        *slot = v;
    }
    let [open, high, low, close] = prices;
    if high < low {
        return Err(format!("INVALID_RANGE:high({})<low({})", high, low));
    }
    if close < low || close > high {
        return Err(format!("CLOSE_OUT_OF_RANGE:close={},range=[{},{}]", close, low, high));
    }
    if open < low || open > high {
        return Err(format!("OPEN_OUT_OF_RANGE:open={},range=[{},{}]", open, low, high));
    }
    Ok(Bar::new(time, open, high, low, close))
}

impl CandleValidator {
    /// Builds a validator and resumes ordering from the store's checkpoint.
    /// The store is read once here; later writes go through a background
    /// thread and never hold up a verdict.
    pub fn new(instrument: &str, cfg: ValidatorConfig, mut store: Box<dyn CheckpointStore>) -> Self {
        let last_ts = Self::restore(instrument, store.as_mut());
        let present = store.exists(instrument);
        let checkpoint = match Checkpointer::spawn(instrument, store, present) {
            Ok(c) => Some(c),
            Err(err) => {
                logging::log_checkpoint_failure(instrument, "spawn", &err.to_string());
                None
            }
        };
        Self {
            instrument: instrument.to_string(),
            seen: RecentSet::new(cfg.seen_cap),
            cfg,
            last_ts,
            checkpoint,
            accepted: 0,
            rejected: 0,
            corruption_resets: 0,
        }
    }

    pub fn in_memory(instrument: &str) -> Self {
        Self::new(instrument, ValidatorConfig::default(), Box::new(NullCheckpoint))
    }

    /// Last accepted timestamp held by the store, if it can be read.
    pub fn restore(instrument: &str, store: &mut dyn CheckpointStore) -> Option<i64> {
        match store.load(instrument) {
            Ok(ts) => ts,
            Err(err) => {
                logging::log_checkpoint_failure(instrument, "load", &err.to_string());
                None
            }
        }
    }

    fn persist(&self, op: CheckpointOp) {
        if let Some(c) = &self.checkpoint {
            if !c.writer.submit(op) {
                logging::log_checkpoint_failure(&self.instrument, "submit", "checkpoint writer stopped");
            }
        }
    }

    pub fn validate(&mut self, raw: &RawBar) -> Verdict {
        self.validate_at(raw, ts_epoch_ms())
    }

    /// Same as `validate` with an explicit wall-clock, for the corruption
    /// guard.
    pub fn validate_at(&mut self, raw: &RawBar, now_ms: i64) -> Verdict {
        let mut reasons = Vec::new();
        let mut details = Vec::new();

        let schema = check_schema(raw);
        if let Err(msg) = &schema {
            reasons.push(RejectKind::Schema);
            details.push(format!("SCHEMA:{}", msg));
        }

        if let Some(ts) = raw.time {
            if self.seen.contains(&ts) {
                reasons.push(RejectKind::Dup);
                details.push(format!("DUP:DUPLICATE:{}", ts));
            }

            let corrupted = matches!(self.last_ts, Some(last) if last > now_ms + self.cfg.future_tolerance_ms);
            if corrupted {
                self.reset_corrupted(now_ms);
            } else if let Some(last) = self.last_ts {
                if ts <= last {
                    reasons.push(RejectKind::Order);
                    details.push(format!("ORDER:OUT_OF_ORDER:current={},last={}", ts, last));
                }
            }
        }

        match schema {
            Ok(bar) if reasons.is_empty() => {
                self.register(bar.time);
                self.accepted += 1;
                Verdict::Accept(bar)
            }
            _ => {
                self.rejected += 1;
                let detail = details.join("; ");
                let tags: Vec<&str> = reasons.iter().map(|r| r.as_str()).collect();
                logging::log_candle_reject(&self.instrument, raw.time, &tags, &detail);
                Verdict::Reject(Rejection {
                    primary: reasons.first().copied().unwrap_or(RejectKind::Schema),
                    reasons,
                    detail,
                    time: raw.time,
                })
            }
        }
    }

    fn reset_corrupted(&mut self, now_ms: i64) {
        logging::log(
            logging::Level::Warn,
            logging::Domain::Ingest,
            "ts_reset",
            logging::obj(&[
                ("instrument", logging::v_str(&self.instrument)),
                ("last_ts", serde_json::json!(self.last_ts)),
                ("now_ms", serde_json::json!(now_ms)),
            ]),
        );
        self.last_ts = None;
        self.seen.clear();
        self.corruption_resets += 1;
        self.persist(CheckpointOp::Clear);
    }

    fn register(&mut self, ts: i64) {
        self.seen.insert(ts);
        self.last_ts = Some(ts);
        self.persist(CheckpointOp::Save(ts));
    }

    pub fn last_ts(&self) -> Option<i64> {
        self.last_ts
    }

    pub fn status(&self) -> ValidatorStatus {
        ValidatorStatus {
            instrument: self.instrument.clone(),
            last_ts: self.last_ts,
            seen_count: self.seen.len(),
            accepted: self.accepted,
            rejected: self.rejected,
            corruption_resets: self.corruption_resets,
            checkpoint_present: self.checkpoint.as_ref().is_some_and(|c| c.present.load(Ordering::Relaxed)),
        }
    }
}
