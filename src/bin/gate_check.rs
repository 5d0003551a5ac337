use std::io::{self, BufRead, Write};

use serde_json::json;

use thetagate::authority::gate::{AuthorityGate, GateConfig, SignalRequest};
use thetagate::config::Config;
use thetagate::types::{Direction, Outcome};

/// One stdin line: a signal to decide, or a realized outcome to feed back.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputLine {
    Signal(SignalRequest),
    Outcome {
        state: String,
        direction: Direction,
        price: f64,
        outcome: Outcome,
        #[serde(default)]
        bars_held: Option<u32>,
    },
    Status,
}

fn main() {
    let cfg = Config::from_env();
    let gate = match AuthorityGate::with_audit_log(GateConfig::from(&cfg), &cfg.audit_path) {
        Ok(gate) => gate,
        Err(err) => {
            eprintln!("audit log unavailable ({}), continuing without it", err);
            AuthorityGate::new(GateConfig::from(&cfg))
        }
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in stdin.lock().lines().map_while(|l| l.ok()) {
        if line.trim().is_empty() {
            continue;
        }
        // Bare requests without a "type" tag are treated as signals.
        let parsed = serde_json::from_str::<InputLine>(&line)
            .or_else(|_| serde_json::from_str::<SignalRequest>(&line).map(InputLine::Signal));
        let input = match parsed {
            Ok(v) => v,
            Err(err) => {
                eprintln!("bad input json: {}", err);
                continue;
            }
        };
        let reply = match input {
            InputLine::Signal(req) => json!(gate.authorize(&req)),
            InputLine::Outcome { state, direction, price, outcome, bars_held } => {
                let losses = gate.record_outcome(&state, direction, price, outcome, bars_held);
                json!({
                    "zone": gate.zone_for(&state, direction, price),
                    "consecutive_loss_same_zone": losses,
                    "mode": gate.status().mode,
                })
            }
            InputLine::Status => json!(gate.status()),
        };
        if writeln!(out, "{}", reply).is_err() {
            break;
        }
    }
}
