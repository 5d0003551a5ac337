//! Structured logging for the authority gate.
//!
//! Design goals:
//! 1. Multi-level granularity (TRACE → FATAL)
//! 2. Domain categories matching the gate's subsystems for filtering
//! 3. Every rejected bar, denial and violation is reproducible from its record
//! 4. Logging never fails or delays a decision

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Ingest,    // Candle validation, checkpoints
    Theta,     // Certification level transitions
    Zone,      // Zone-scoped loss accounting
    Mode,      // Operating posture changes
    Authority, // Gate decisions
    Invariant, // Rule violations, halt flag
    Paper,     // Paper-mode entries, exits, audit
    Observe,   // Excursion observation
    Notify,    // Outbound delivery (decoupled)
    System,    // Startup, shutdown, recovery
    Audit,     // Replay/audit trail entries
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Ingest => "ingest",
            Domain::Theta => "theta",
            Domain::Zone => "zone",
            Domain::Mode => "mode",
            Domain::Authority => "authority",
            Domain::Invariant => "invariant",
            Domain::Paper => "paper",
            Domain::Observe => "observe",
            Domain::Notify => "notify",
            Domain::System => "system",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Sequence counter and run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    echo: bool,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let echo = !matches!(std::env::var("LOG_STDOUT").as_deref(), Ok("0") | Ok("false"));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        let open = |name: &str| match File::create(run_dir.join(name)) {
            Ok(f) => Some(Mutex::new(BufWriter::new(f))),
            Err(err) => {
                eprintln!("[log] failed to create {}: {}", name, err);
                None
            }
        };

        RunContext {
            events: open("events.jsonl"),
            trace: open("trace.jsonl"),
            run_id,
            echo,
        }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["authorization", "Authorization", "webhook_url", "api_key"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["instrument", "signal_id", "trade_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if ctx.echo {
        println!("{}", line);
    }
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_candle_reject(instrument: &str, time: Option<i64>, reasons: &[&str], detail: &str) {
    log(
        Level::Warn,
        Domain::Ingest,
        "candle_reject",
        obj(&[
            ("instrument", v_str(instrument)),
            ("bar_time", time.map(|t| json!(t)).unwrap_or(Value::Null)),
            ("reasons", Value::Array(reasons.iter().map(|r| v_str(r)).collect())),
            ("detail", v_str(detail)),
        ]),
    );
}

pub fn log_checkpoint_failure(instrument: &str, op: &str, err: &str) {
    log(
        Level::Warn,
        Domain::Ingest,
        "checkpoint_failed",
        obj(&[
            ("instrument", v_str(instrument)),
            ("op", v_str(op)),
            ("error", v_str(err)),
        ]),
    );
}

pub fn log_decision(signal_id: &str, signal_name: &str, allowed: bool, theta: u8, layer: Option<u8>, reason: &str) {
    log(
        Level::Info,
        Domain::Authority,
        "decision",
        obj(&[
            ("signal_id", v_str(signal_id)),
            ("signal_name", v_str(signal_name)),
            ("decision", v_str(if allowed { "ALLOW" } else { "DENY" })),
            ("theta", json!(theta)),
            ("layer_failed", layer.map(|l| json!(l)).unwrap_or(Value::Null)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_mode_change(from: &str, to: &str, manual: bool, reason: &str) {
    log(
        Level::Warn,
        Domain::Mode,
        "mode_change",
        obj(&[
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("manual", json!(manual)),
            ("reason", v_str(reason)),
        ]),
    );
}

/// Invariant failures carry the full offending event plus its fingerprint
/// so the exact input can be replayed.
pub fn log_violation(rules: &[&str], event: &Value) {
    log(
        Level::Error,
        Domain::Invariant,
        "invariant_fail",
        obj(&[
            ("msg", v_str("invariant violated, execution halted")),
            ("rules", Value::Array(rules.iter().map(|r| v_str(r)).collect())),
            ("fingerprint", v_str(&fingerprint(&event.to_string()))),
            ("event", event.clone()),
        ]),
    );
}

pub fn log_trade(event: &str, instrument: &str, trade_id: u64, fields: &[(&str, Value)]) {
    let mut map = obj(fields);
    map.insert("instrument".to_string(), v_str(instrument));
    map.insert("trade_id".to_string(), json!(trade_id));
    log(Level::Info, Domain::Paper, event, map);
}

pub fn log_delivery(signal_id: &str, outcome: &str, detail: &str) {
    let level = if outcome == "failed" { Level::Warn } else { Level::Debug };
    log(
        level,
        Domain::Notify,
        "delivery",
        obj(&[
            ("signal_id", v_str(signal_id)),
            ("outcome", v_str(outcome)),
            ("detail", v_str(detail)),
        ]),
    );
}

/// Session summary on shutdown
pub fn log_session_summary(bars: u64, rejected: u64, trades: u64, win_rate: f64, violations: u64, ready_for_live: bool) {
    log(
        Level::Info,
        Domain::System,
        "session_summary",
        obj(&[
            ("bars", json!(bars)),
            ("rejected", json!(rejected)),
            ("trades", json!(trades)),
            ("win_rate", v_num(win_rate)),
            ("violations", json!(violations)),
            ("ready_for_live", json!(ready_for_live)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

/// SHA-256 hex digest, used to fingerprint events and datasets.
pub fn fingerprint(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Tests
// =============================================================================
