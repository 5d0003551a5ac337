use serde::Serialize;

use crate::observe::ObservationRecord;
use crate::theta::{ThetaConfig, ThetaEngine};
use crate::types::{Direction, EventLayer, Outcome, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "SL")]
    StopLoss,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TP",
            ExitReason::StopLoss => "SL",
        }
    }
}

/// Excursion and θ tracking for the open trade. Exists from entry to
/// exit and nowhere else.
#[derive(Debug, Clone)]
pub struct TradeContext {
    pub entry_price: f64,
    pub direction: Direction,
    pub max_favorable_excursion: f64,
    pub max_adverse_excursion: f64,
    pub bars_held: u32,
    pub theta_history: Vec<u8>,
    theta: ThetaEngine,
}

impl TradeContext {
    pub fn new(entry_price: f64, direction: Direction, theta_cfg: ThetaConfig) -> Self {
        Self {
            entry_price,
            direction,
            max_favorable_excursion: 0.0,
            max_adverse_excursion: 0.0,
            bars_held: 0,
            theta_history: Vec::new(),
            theta: ThetaEngine::new(theta_cfg),
        }
    }

    /// One bar of holding, measured at the close. Returns the new θ.
    pub fn update(&mut self, close: f64) -> u8 {
        self.bars_held += 1;
        let favorable = self.direction.favorable(self.entry_price, close);
        self.max_favorable_excursion = self.max_favorable_excursion.max(favorable);
        self.max_adverse_excursion = self.max_adverse_excursion.max(-favorable);
        let state = self.theta.compute(self.max_favorable_excursion, self.bars_held, 0, 0.0);
        self.theta_history.push(state.value);
        state.value
    }

    pub fn theta(&self) -> u8 {
        self.theta.current().value
    }

    pub fn max_theta(&self) -> u8 {
        self.theta_history.iter().copied().max().unwrap_or(0)
    }
}

/// Ledger entry for one paper trade. Created at entry, frozen at exit.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub trade_id: u64,
    pub signal_name: String,
    pub layer: EventLayer,
    pub phase: Phase,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_time: i64,
    pub entry_bar: u64,
    pub stop_distance: f64,
    pub take_profit_distance: f64,
    pub tp_price: f64,
    pub sl_price: f64,
    pub pressure_at_entry: f64,
    pub defense_applied: bool,
    pub extension_applied: bool,
    pub theta_label: u8,
    pub max_theta: u8,
    pub final_mfe: f64,
    pub final_mae: f64,
    pub final_bars: u32,
    pub theta_history: Vec<u8>,
    pub result: Option<Outcome>,
    pub exit_reason: Option<ExitReason>,
    pub pnl: Option<f64>,
    pub exit_time: Option<i64>,
    pub exit_bar: Option<u64>,
    pub observation: Option<ObservationRecord>,
}

impl TradeRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        trade_id: u64,
        signal_name: &str,
        layer: EventLayer,
        phase: Phase,
        direction: Direction,
        entry_price: f64,
        entry_time: i64,
        entry_bar: u64,
        stop_distance: f64,
        take_profit_distance: f64,
        pressure_at_entry: f64,
    ) -> Self {
        let mut record = Self {
            trade_id,
            signal_name: signal_name.to_string(),
            layer,
            phase,
            direction,
            entry_price,
            entry_time,
            entry_bar,
            stop_distance,
            take_profit_distance,
            tp_price: 0.0,
            sl_price: 0.0,
            pressure_at_entry,
            defense_applied: false,
            extension_applied: false,
            theta_label: 0,
            max_theta: 0,
            final_mfe: 0.0,
            final_mae: 0.0,
            final_bars: 0,
            theta_history: Vec::new(),
            result: None,
            exit_reason: None,
            pnl: None,
            exit_time: None,
            exit_bar: None,
            observation: None,
        };
        record.reprice();
        record
    }

    /// Recompute target and stop prices from the current distances.
    pub fn reprice(&mut self) {
        match self.direction {
            Direction::Long => {
                self.tp_price = self.entry_price + self.take_profit_distance;
                self.sl_price = self.entry_price - self.stop_distance;
            }
            Direction::Short => {
                self.tp_price = self.entry_price - self.take_profit_distance;
                self.sl_price = self.entry_price + self.stop_distance;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.result.is_some()
    }

    /// Take-profit touch wins over a stop touch on the same bar.
    pub fn exit_hit(&self, high: f64, low: f64) -> Option<(ExitReason, Outcome, f64)> {
        let (tp_touched, sl_touched) = match self.direction {
            Direction::Long => (high >= self.tp_price, low <= self.sl_price),
            Direction::Short => (low <= self.tp_price, high >= self.sl_price),
        };
        if tp_touched {
            Some((ExitReason::TakeProfit, Outcome::Win, self.take_profit_distance))
        } else if sl_touched {
            let pnl = self.direction.favorable(self.entry_price, self.sl_price);
            Some((ExitReason::StopLoss, Outcome::Loss, pnl))
        } else {
            None
        }
    }

    /// Freeze θ and excursion values from the trade context.
    pub fn close(&mut self, ctx: &TradeContext, reason: ExitReason, outcome: Outcome, pnl: f64, time: i64, bar: u64) {
        self.theta_label = ctx.theta();
        self.max_theta = ctx.max_theta();
        self.final_mfe = ctx.max_favorable_excursion;
        self.final_mae = ctx.max_adverse_excursion;
        self.final_bars = ctx.bars_held;
        self.theta_history = ctx.theta_history.clone();
        self.exit_reason = Some(reason);
        self.result = Some(outcome);
        self.pnl = Some(pnl);
        self.exit_time = Some(time);
        self.exit_bar = Some(bar);
    }

    /// Situation label used for zone accounting.
    pub fn zone_state(&self) -> &'static str {
        zone_state(self.direction)
    }
}

pub fn zone_state(direction: Direction) -> &'static str {
    match direction {
        Direction::Short => "OVERBOUGHT",
        Direction::Long => "OVERSOLD",
    }
}
