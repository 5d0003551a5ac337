//! Operating posture. NORMAL admits any known signal at θ ≥ 1;
//! CONSERVATIVE admits only tier-1 signals at θ ≥ 3.

use serde::Serialize;

use crate::logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Normal,
    Conservative,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "NORMAL",
            Mode::Conservative => "CONSERVATIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "NORMAL" => Some(Mode::Normal),
            "CONSERVATIVE" => Some(Mode::Conservative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModeConfig {
    /// Fast collapses tolerated per day; one more forces CONSERVATIVE.
    pub fast_collapse_threshold: u32,
    /// A loss realized within this many bars of entry counts as a fast collapse.
    pub fast_collapse_bars: u32,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self { fast_collapse_threshold: 5, fast_collapse_bars: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeState {
    pub mode: Mode,
    pub theta_threshold: u8,
    pub tier1_only: bool,
    pub manual_override: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeStatus {
    pub state: ModeState,
    pub fast_collapse_count: u32,
    pub fast_collapse_threshold: u32,
    pub daily_trades: u32,
}

#[derive(Debug, Clone)]
pub struct ModeController {
    cfg: ModeConfig,
    mode: Mode,
    manual_override: bool,
    reason: String,
    fast_collapse_count: u32,
    daily_trades: u32,
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new(ModeConfig::default())
    }
}

impl ModeController {
    pub fn new(cfg: ModeConfig) -> Self {
        Self {
            cfg,
            mode: Mode::Normal,
            manual_override: false,
            reason: "Normal operation".to_string(),
            fast_collapse_count: 0,
            daily_trades: 0,
        }
    }

    pub fn config(&self) -> &ModeConfig {
        &self.cfg
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> ModeState {
        let (theta_threshold, tier1_only) = match self.mode {
            Mode::Normal => (1, false),
            Mode::Conservative => (3, true),
        };
        ModeState {
            mode: self.mode,
            theta_threshold,
            tier1_only,
            manual_override: self.manual_override,
            reason: self.reason.clone(),
        }
    }

    fn transition(&mut self, to: Mode, manual: bool, reason: &str) {
        if self.mode != to || self.manual_override != manual {
            logging::log_mode_change(self.mode.as_str(), to.as_str(), manual, reason);
        }
        self.mode = to;
        self.manual_override = manual;
        self.reason = reason.to_string();
    }

    /// Counts a fast collapse; exceeding the daily threshold escalates.
    /// A manual override is left alone.
    pub fn record_fast_collapse(&mut self) -> Mode {
        self.fast_collapse_count += 1;
        if self.fast_collapse_count > self.cfg.fast_collapse_threshold
            && self.mode == Mode::Normal
            && !self.manual_override
        {
            let reason = format!(
                "Emergency: {} fast collapses today (limit {})",
                self.fast_collapse_count, self.cfg.fast_collapse_threshold
            );
            self.transition(Mode::Conservative, false, &reason);
        }
        self.mode
    }

    pub fn record_trade(&mut self) {
        self.daily_trades += 1;
    }

    /// Operator decision. Flagged as manual until `clear_override` or a
    /// daily reset without override.
    pub fn force_mode(&mut self, mode: Mode, reason: &str) {
        self.transition(mode, true, reason);
    }

    /// System-initiated switch; clears any manual flag.
    pub fn set_auto(&mut self, mode: Mode, reason: &str) {
        self.transition(mode, false, reason);
    }

    pub fn clear_override(&mut self) {
        if self.manual_override {
            let mode = self.mode;
            self.transition(mode, false, "Override cleared");
        }
    }

    pub fn reset_daily(&mut self) {
        self.fast_collapse_count = 0;
        self.daily_trades = 0;
        if !self.manual_override {
            self.transition(Mode::Normal, false, "Normal operation");
        }
    }

    pub fn status(&self) -> ModeStatus {
        ModeStatus {
            state: self.state(),
            fast_collapse_count: self.fast_collapse_count,
            fast_collapse_threshold: self.cfg.fast_collapse_threshold,
            daily_trades: self.daily_trades,
        }
    }
}
