use anyhow::{anyhow, Result};
use serde_json::json;
use std::path::Path;

use thetagate::authority::gate::{AuthorityGate, GateConfig};
use thetagate::config::Config;
use thetagate::data::load_bars;
use thetagate::ingest::CandleValidator;
use thetagate::logging::{self, obj, v_num, v_str, Domain, Level};
use thetagate::notify::{Dispatcher, Notification};
use thetagate::paper::PaperEngine;
use thetagate::storage::{CheckpointStore, NullCheckpoint, SqliteCheckpoint};

fn checkpoint_store(path: &str) -> Box<dyn CheckpointStore> {
    match SqliteCheckpoint::open(path) {
        Ok(store) => Box::new(store),
        Err(e) => {
            logging::log_checkpoint_failure("*", "open", &e.to_string());
            Box::new(NullCheckpoint)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let csv = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: thetagate <bars.csv>"))?;
    let cfg = Config::from_env();

    let (raw_bars, manifest) = load_bars(Path::new(&csv)).map_err(|e| anyhow!("load {}: {}", csv, e))?;
    logging::log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("instrument", v_str(&cfg.instrument)),
            ("dataset", v_str(&manifest.path)),
            ("dataset_sha256", v_str(&manifest.hash_sha256)),
            ("rows", json!(manifest.row_count)),
            ("bad_rows", json!(manifest.bad_rows)),
        ]),
    );

    let mut validator = CandleValidator::new(
        &cfg.instrument,
        cfg.validator.clone(),
        checkpoint_store(&cfg.checkpoint_path),
    );
    let gate = AuthorityGate::with_audit_log(GateConfig::from(&cfg), &cfg.audit_path)?;
    let mut engine = PaperEngine::new(&cfg.instrument, cfg.paper.clone(), cfg.theta.clone(), cfg.observe.clone());
    let mut dispatcher = Dispatcher::spawn(cfg.notify.build()?, cfg.notify.channel_capacity);

    let mut rejected = 0u64;
    for raw in &raw_bars {
        let verdict = validator.validate(raw);
        let bar = match verdict.bar() {
            Some(bar) => *bar,
            None => {
                rejected += 1;
                continue;
            }
        };
        let outcome = engine.on_bar(&bar, &gate);
        for decision in outcome.decisions.iter().filter(|d| d.allowed()) {
            dispatcher.submit(Notification::from_decision(&cfg.instrument, decision));
        }
    }

    let late = engine.finish();
    let delivery = dispatcher.shutdown().await;
    let stats = engine.stats();
    let audit = engine.audit();
    let promotion = engine.promotion(&gate);
    let kill = gate.kill_switch();

    logging::log_session_summary(
        engine.bar_count(),
        rejected,
        stats.total_trades as u64,
        stats.overall_win_rate,
        gate.status().guard.violation_count,
        audit.ready_for_live,
    );
    logging::log(
        Level::Info,
        Domain::Notify,
        "delivery_summary",
        obj(&[
            ("delivered", json!(delivery.delivered)),
            ("failed", json!(delivery.failed)),
            ("not_sent", json!(delivery.not_sent)),
            ("dropped", json!(delivery.dropped)),
            ("flushed_observations", v_num(late.len() as f64)),
        ]),
    );

    let report = json!({
        "dataset": manifest,
        "validator": validator.status(),
        "gate": gate.status(),
        "stats": stats,
        "signals": engine.signal_stats(),
        "audit": audit,
        "kill_switch": kill,
        "promotion": promotion,
        "delivery": delivery,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
