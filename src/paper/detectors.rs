//! Bar-level sensors used by the three detection layers. Pure functions
//! over bar and pressure histories, oldest first.

use serde::Serialize;

use crate::types::{Bar, Direction};

use super::PaperConfig;

/// Buyer/seller pressure: distance of the close from the low over its
/// distance from the high. A flat bar reads 1.0; a close on the high
/// saturates at 10.0.
pub fn pressure(bar: &Bar) -> f64 {
    if bar.high == bar.low {
        return 1.0;
    }
    let buyer = bar.close - bar.low;
    let seller = bar.high - bar.close;
    if seller == 0.0 {
        return 10.0;
    }
    buyer / seller
}

/// Position of the last close inside the high/low channel of the last
/// `period` bars, in percent. 50 until the window is full.
pub fn channel_pct(bars: &[Bar], period: usize) -> f64 {
    if period == 0 || bars.len() < period {
        return 50.0;
    }
    let window = &bars[bars.len() - period..];
    let highest = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let lowest = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    if highest == lowest {
        return 50.0;
    }
    let close = window[window.len() - 1].close;
    (close - lowest) / (highest - lowest) * 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PreTransition {
    pub direction: Direction,
    pub avg_pressure: f64,
    pub current_pressure: f64,
    pub change: f64,
}

/// Directional shift of the latest pressure against the window average,
/// before any price extreme. Reports both directions; which one may
/// trade is the engine's call.
pub fn detect_pre_transition(pressures: &[f64], window: usize, shift: f64) -> Option<PreTransition> {
    if window == 0 || pressures.len() < window {
        return None;
    }
    let recent = &pressures[pressures.len() - window..];
    let avg = recent.iter().sum::<f64>() / window as f64;
    let current = recent[window - 1];
    let change = current - avg;

    let direction = if change > shift && avg < 1.0 {
        Direction::Long
    } else if change < -shift && avg > 1.0 {
        Direction::Short
    } else {
        return None;
    };
    Some(PreTransition { direction, avg_pressure: avg, current_pressure: current, change })
}

/// Extreme pressure at an extreme of the channel.
pub fn detect_ignition(pressure: f64, channel: f64, cfg: &PaperConfig) -> Option<Direction> {
    if pressure > cfg.overbought && channel > cfg.channel_high {
        Some(Direction::Short)
    } else if pressure < cfg.oversold && channel < cfg.channel_low {
        Some(Direction::Long)
    } else {
        None
    }
}

/// 90th percentile of the pressure history by rank.
pub fn pressure_q90(pressures: &[f64]) -> Option<f64> {
    if pressures.is_empty() {
        return None;
    }
    let mut sorted = pressures.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() as f64 * 0.9) as usize).min(sorted.len() - 1);
    Some(sorted[idx])
}

/// Abnormal single-bar move: channel at an outer decile and the bar's
/// pressure deviating from balance by more than the history's q90.
pub fn is_impulse(pressure: f64, channel: f64, history: &[f64], cfg: &PaperConfig) -> bool {
    if history.len() < cfg.impulse_history {
        return false;
    }
    let extreme = cfg.impulse_channel_extreme;
    if !(channel > extreme || channel < 100.0 - extreme) {
        return false;
    }
    match pressure_q90(history) {
        Some(q90) => (pressure - 1.0).abs() > q90,
        None => false,
    }
}
