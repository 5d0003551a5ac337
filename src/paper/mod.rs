//! Paper-mode execution: three detection layers over a bar stream, one
//! position slot, every entry judged by the authority gate.

pub mod audit;
pub mod detectors;
pub mod engine;
pub mod trade;

pub use audit::{AuditCounters, AuditReport, PromotionVerdict};
pub use engine::{BarOutcome, LayerStats, PaperEngine, PaperStats, PreTransitionSignal, SignalStats};
pub use trade::{ExitReason, TradeContext, TradeRecord};

#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub overbought: f64,
    pub oversold: f64,
    pub channel_high: f64,
    pub channel_low: f64,
    pub channel_period: usize,
    pub pre_window: usize,
    pub pre_shift: f64,
    pub take_profit: f64,
    pub normal_stop: f64,
    pub tight_stop: f64,
    pub cooldown_bars: u64,
    /// Pressure readings required before the impulse defense can fire.
    pub impulse_history: usize,
    /// Channel percentile beyond which (or below 100 minus which) a bar
    /// may count as an impulse.
    pub impulse_channel_extreme: f64,
    pub min_bars_for_ignition: usize,
    /// Take-profit extension once θ reaches 3. None disables it.
    pub extension_points: Option<f64>,
    pub bar_buffer: usize,
    pub pressure_buffer: usize,
    /// Certification level entries are submitted at.
    pub entry_theta: u8,
    pub pre_transition_signal: String,
    pub ignition_short_signal: String,
    pub ignition_long_signal: String,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            overbought: 1.5,
            oversold: 0.7,
            channel_high: 70.0,
            channel_low: 30.0,
            channel_period: 20,
            pre_window: 5,
            pre_shift: 0.5,
            take_profit: 20.0,
            normal_stop: 15.0,
            tight_stop: 8.0,
            cooldown_bars: 10,
            impulse_history: 10,
            impulse_channel_extreme: 90.0,
            min_bars_for_ignition: 5,
            extension_points: None,
            bar_buffer: 100,
            pressure_buffer: 50,
            entry_theta: 1,
            pre_transition_signal: "OPA_SHORT".to_string(),
            ignition_short_signal: "STB_SHORT".to_string(),
            ignition_long_signal: "STB_LONG".to_string(),
        }
    }
}
