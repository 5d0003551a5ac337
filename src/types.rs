//! Shared vocabulary: bars, directions, phase tags and event layers.
//!
//! Everything that used to travel as a free-form string (decisions, phase
//! tags, layers, size labels) is a closed enum here so that a misspelled tag
//! cannot reach the invariant guard.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized OHLC bar. `time` is epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self { time, open, high, low, close }
    }
}

/// Bar as it arrives from the ingestion layer, before schema checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
}

impl From<Bar> for RawBar {
    fn from(bar: Bar) -> Self {
        Self {
            time: Some(bar.time),
            open: Some(bar.open),
            high: Some(bar.high),
            low: Some(bar.low),
            close: Some(bar.close),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// Signed move in the trade's favour.
    pub fn favorable(&self, entry: f64, price: f64) -> f64 {
        match self {
            Direction::Long => price - entry,
            Direction::Short => entry - price,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Temporal phase tag: when in the decision sequence an event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "t-ε")]
    PreTransition,
    #[serde(rename = "t0")]
    Ignition,
    #[serde(rename = "t+0")]
    Immediate,
    #[serde(rename = "NEUTRAL")]
    Neutral,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreTransition => "t-ε",
            Phase::Ignition => "t0",
            Phase::Immediate => "t+0",
            Phase::Neutral => "NEUTRAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventLayer {
    /// Pre-transition pressure shift detector.
    PreTransition,
    /// Ignition (extreme pressure + extreme channel) detector.
    Ignition,
    /// Same-bar impulse defense.
    Defense,
    /// Advisory excursion tracking.
    Observation,
    /// External signal evaluated by the authority gate.
    Gate,
}

impl EventLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLayer::PreTransition => "PRE_TRANSITION",
            EventLayer::Ignition => "IGNITION",
            EventLayer::Defense => "DEFENSE",
            EventLayer::Observation => "OBSERVATION",
            EventLayer::Gate => "GATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventAction {
    Entry,
    Exit,
    Observe,
    Defense,
    Extend,
}

impl EventAction {
    /// Actions that open or widen exposure. Exits and observations only
    /// ever reduce or record it.
    pub fn issues_authority(&self) -> bool {
        matches!(self, EventAction::Entry | EventAction::Defense | EventAction::Extend)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunMode {
    Paper,
    Live,
}

impl RunMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PAPER" => Some(RunMode::Paper),
            "LIVE" => Some(RunMode::Live),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Win,
    Loss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SizeTier {
    None,
    Small,
    Medium,
    Large,
}

impl SizeTier {
    pub fn multiplier(&self) -> f64 {
        match self {
            SizeTier::None => 0.0,
            SizeTier::Small => 1.0,
            SizeTier::Medium => 2.0,
            SizeTier::Large => 4.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeTier::None => "NONE",
            SizeTier::Small => "SMALL",
            SizeTier::Medium => "MEDIUM",
            SizeTier::Large => "LARGE",
        }
    }
}

impl fmt::Display for SizeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
