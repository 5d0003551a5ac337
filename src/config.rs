//! Process configuration. Every tunable reads from the environment with a
//! parsed default; subsystem configs are assembled from the flat values.

use crate::authority::{ExecLimits, SignalCatalog};
use crate::ingest::ValidatorConfig;
use crate::mode::ModeConfig;
use crate::notify::NotifyConfig;
use crate::observe::ObserveConfig;
use crate::paper::PaperConfig;
use crate::theta::ThetaConfig;
use crate::types::RunMode;
use crate::zone::ZoneConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub instrument: String,
    pub run_mode: RunMode,
    pub checkpoint_path: String,
    pub audit_path: String,
    pub idempotency_cap: usize,
    pub retry_attempts_per_zone: u32,
    pub validator: ValidatorConfig,
    pub theta: ThetaConfig,
    pub zone: ZoneConfig,
    pub mode: ModeConfig,
    pub catalog: SignalCatalog,
    pub exec: ExecLimits,
    pub paper: PaperConfig,
    pub observe: ObserveConfig,
    pub notify: NotifyConfig,
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

impl Config {
    pub fn from_env() -> Self {
        let catalog_default = SignalCatalog::default();
        let catalog = SignalCatalog::new(
            env_list("KNOWN_SIGNALS").unwrap_or(catalog_default.known_names()),
            env_list("TIER1_SIGNALS").unwrap_or(catalog_default.tier1_names()),
            env_list("BLACKLIST_SIGNALS").unwrap_or(catalog_default.blacklist_names()),
        );

        Self {
            instrument: std::env::var("INSTRUMENT").unwrap_or_else(|_| "NQ1!".to_string()),
            run_mode: std::env::var("RUN_MODE").ok().and_then(|v| RunMode::parse(&v)).unwrap_or(RunMode::Paper),
            checkpoint_path: std::env::var("CHECKPOINT_PATH").unwrap_or_else(|_| "./thetagate.sqlite".to_string()),
            audit_path: std::env::var("AUDIT_PATH").unwrap_or_else(|_| "./thetagate.audit.jsonl".to_string()),
            idempotency_cap: std::env::var("IDEMPOTENCY_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(10_000),
            retry_attempts_per_zone: std::env::var("RETRY_ATTEMPTS_PER_ZONE").ok().and_then(|v| v.parse().ok()).unwrap_or(1),
            validator: ValidatorConfig {
                seen_cap: std::env::var("VALIDATOR_SEEN_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(500),
                future_tolerance_ms: std::env::var("FUTURE_TOLERANCE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(120_000),
            },
            theta: ThetaConfig {
                transition_mfe: std::env::var("THETA_TRANSITION_MFE").ok().and_then(|v| v.parse().ok()).unwrap_or(10.0),
                lock_in_mfe: std::env::var("THETA_LOCK_IN_MFE").ok().and_then(|v| v.parse().ok()).unwrap_or(15.0),
                ..ThetaConfig::default()
            },
            zone: ZoneConfig {
                bucket_width: std::env::var("ZONE_BUCKET").ok().and_then(|v| v.parse().ok()).unwrap_or(100.0),
                reset_hours: std::env::var("ZONE_RESET_HOURS").ok().and_then(|v| v.parse().ok()).unwrap_or(24),
            },
            mode: ModeConfig {
                fast_collapse_threshold: std::env::var("FAST_COLLAPSE_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
                fast_collapse_bars: std::env::var("FAST_COLLAPSE_BARS").ok().and_then(|v| v.parse().ok()).unwrap_or(3),
            },
            catalog,
            exec: ExecLimits {
                max_slippage: std::env::var("MAX_SLIPPAGE").ok().and_then(|v| v.parse().ok()).unwrap_or(3.0),
                max_spread: std::env::var("MAX_SPREAD").ok().and_then(|v| v.parse().ok()).unwrap_or(2.0),
                min_slippage: std::env::var("MIN_SLIPPAGE").ok().and_then(|v| v.parse().ok()).unwrap_or(0.5),
            },
            paper: PaperConfig {
                overbought: std::env::var("PRESSURE_OVERBOUGHT").ok().and_then(|v| v.parse().ok()).unwrap_or(1.5),
                oversold: std::env::var("PRESSURE_OVERSOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(0.7),
                channel_high: std::env::var("CHANNEL_HIGH").ok().and_then(|v| v.parse().ok()).unwrap_or(70.0),
                channel_low: std::env::var("CHANNEL_LOW").ok().and_then(|v| v.parse().ok()).unwrap_or(30.0),
                channel_period: std::env::var("CHANNEL_PERIOD").ok().and_then(|v| v.parse().ok()).unwrap_or(20),
                pre_window: std::env::var("PRE_WINDOW").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
                pre_shift: std::env::var("PRE_SHIFT").ok().and_then(|v| v.parse().ok()).unwrap_or(0.5),
                take_profit: std::env::var("TAKE_PROFIT").ok().and_then(|v| v.parse().ok()).unwrap_or(20.0),
                normal_stop: std::env::var("NORMAL_STOP").ok().and_then(|v| v.parse().ok()).unwrap_or(15.0),
                tight_stop: std::env::var("TIGHT_STOP").ok().and_then(|v| v.parse().ok()).unwrap_or(8.0),
                cooldown_bars: std::env::var("COOLDOWN_BARS").ok().and_then(|v| v.parse().ok()).unwrap_or(10),
                impulse_history: std::env::var("IMPULSE_HISTORY").ok().and_then(|v| v.parse().ok()).unwrap_or(10),
                extension_points: std::env::var("EXTENSION_POINTS").ok().and_then(|v| v.parse().ok()),
                ..PaperConfig::default()
            },
            observe: ObserveConfig {
                window: std::env::var("OBSERVE_WINDOW").ok().and_then(|v| v.parse().ok()).unwrap_or(20),
                adverse_cut: std::env::var("OBSERVE_ADVERSE_CUT").ok().and_then(|v| v.parse().ok()).unwrap_or(8.8),
                convex_ratio: std::env::var("SHAPE_CONVEX").ok().and_then(|v| v.parse().ok()).unwrap_or(1.3),
                concave_ratio: std::env::var("SHAPE_CONCAVE").ok().and_then(|v| v.parse().ok()).unwrap_or(0.7),
                ..ObserveConfig::default()
            },
            notify: NotifyConfig {
                webhook_url: std::env::var("WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
                max_retries: std::env::var("NOTIFY_RETRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(3),
                base_delay_ms: std::env::var("NOTIFY_BASE_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(200),
                channel_capacity: std::env::var("NOTIFY_CHANNEL_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(256),
            },
        }
    }
}
