use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::json;

use thetagate::authority::gate::{AuthorityGate, GateConfig};
use thetagate::config::Config;
use thetagate::ingest::CandleValidator;
use thetagate::paper::PaperEngine;
use thetagate::types::RawBar;

const BAR_MS: i64 = 60_000;
const START_MS: i64 = 1_767_225_600_000;

/// Random walk with occasional volatility bursts so both detection layers fire.
fn generate_bars(seed: u64, n: usize, start_price: f64) -> Vec<RawBar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut price = start_price;
    let mut vol: f64 = 4.0;
    let mut bars = Vec::with_capacity(n);
    for i in 0..n {
        let flip: f64 = rng.gen();
        if flip < 0.03 {
            vol = (vol * 1.8).min(30.0);
        } else if flip > 0.9 {
            vol = (vol * 0.7).max(2.0);
        }
        let open = price;
        let close = (price + rng.gen_range(-1.0..1.0) * vol).max(1.0);
        let high = open.max(close) + rng.gen_range(0.0..vol * 0.5);
        let low = (open.min(close) - rng.gen_range(0.0..vol * 0.5)).max(0.5);
        price = close;
        bars.push(RawBar {
            time: Some(START_MS + i as i64 * BAR_MS),
            open: Some(open),
            high: Some(high),
            low: Some(low),
            close: Some(close),
        });
    }
    bars
}

fn main() {
    let seed = std::env::var("SEED").ok().and_then(|v| v.parse().ok()).unwrap_or(42u64);
    let n = std::env::var("BARS").ok().and_then(|v| v.parse().ok()).unwrap_or(2_000usize);
    let start = std::env::var("START_PRICE").ok().and_then(|v| v.parse().ok()).unwrap_or(21_500.0);

    let cfg = Config::from_env();
    let gate = AuthorityGate::new(GateConfig::from(&cfg));
    let mut validator = CandleValidator::in_memory(&cfg.instrument);
    let mut engine = PaperEngine::new(&cfg.instrument, cfg.paper.clone(), cfg.theta.clone(), cfg.observe.clone());

    let mut rejected = 0u64;
    let mut denied = 0u64;
    for raw in generate_bars(seed, n, start) {
        let verdict = validator.validate(&raw);
        let Some(bar) = verdict.bar() else {
            rejected += 1;
            continue;
        };
        let outcome = engine.on_bar(bar, &gate);
        denied += outcome.decisions.iter().filter(|d| !d.allowed()).count() as u64;
    }
    engine.finish();

    let stats = engine.stats();
    let audit = engine.audit();
    thetagate::logging::log_session_summary(
        engine.bar_count(),
        rejected,
        stats.total_trades as u64,
        stats.overall_win_rate,
        gate.status().guard.violation_count,
        audit.ready_for_live,
    );
    println!(
        "{}",
        json!({
            "seed": seed,
            "bars": n,
            "rejected": rejected,
            "denied": denied,
            "stats": stats,
            "signals": engine.signal_stats(),
            "audit": audit,
            "promotion": engine.promotion(&gate),
        })
    );
}
