//! θ certification engine.
//!
//! θ = 0  no state, nothing may act
//! θ = 1  birth, fixed exit
//! θ = 2  transition, conditionally retryable
//! θ ≥ 3  lock-in, extension eligible

use serde::Serialize;

use crate::logging::{self, Domain, Level};

pub const NO_STATE: u8 = 0;
pub const BIRTH: u8 = 1;
pub const TRANSITION: u8 = 2;
pub const LOCK_IN: u8 = 3;

pub fn theta_name(value: u8) -> &'static str {
    match value {
        0 => "NO_STATE",
        1 => "BIRTH",
        2 => "TRANSITION",
        _ => "LOCK_IN",
    }
}

#[derive(Debug, Clone)]
pub struct ThetaConfig {
    /// Excursion at or above which a situation may be TRANSITION.
    pub transition_mfe: f64,
    /// Excursion at or above which a situation is LOCK_IN.
    pub lock_in_mfe: f64,
    /// TRANSITION needs strictly more impulses than this.
    pub retry_impulse_min: u32,
    /// TRANSITION needs recovery strictly faster than this.
    pub retry_recovery_max: f64,
}

impl Default for ThetaConfig {
    fn default() -> Self {
        Self {
            transition_mfe: 10.0,
            lock_in_mfe: 15.0,
            retry_impulse_min: 2,
            retry_recovery_max: 4.0,
        }
    }
}

impl ThetaConfig {
    pub fn retry_conditions_met(&self, impulse_count: u32, recovery_time: f64) -> bool {
        impulse_count > self.retry_impulse_min && recovery_time < self.retry_recovery_max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThetaState {
    pub value: u8,
    pub name: &'static str,
    pub bars_in_state: u32,
    pub favorable_excursion: f64,
}

impl ThetaState {
    pub fn initial() -> Self {
        Self { value: NO_STATE, name: theta_name(NO_STATE), bars_in_state: 0, favorable_excursion: 0.0 }
    }

    pub fn is_certified(&self) -> bool {
        self.value >= BIRTH
    }
}

#[derive(Debug, Clone)]
pub struct ThetaEngine {
    cfg: ThetaConfig,
    current: ThetaState,
    history: Vec<ThetaState>,
}

impl Default for ThetaEngine {
    fn default() -> Self {
        Self::new(ThetaConfig::default())
    }
}

impl ThetaEngine {
    pub fn new(cfg: ThetaConfig) -> Self {
        Self { cfg, current: ThetaState::initial(), history: Vec::new() }
    }

    pub fn config(&self) -> &ThetaConfig {
        &self.cfg
    }

    /// Level for the given sensor readings, without touching engine state.
    pub fn classify(&self, favorable_excursion: f64, impulse_count: u32, recovery_time: f64) -> u8 {
        let mfe = favorable_excursion;
        if mfe <= 0.0 {
            // No favorable move is never certified, however long it has run.
            NO_STATE
        } else if mfe < self.cfg.transition_mfe {
            BIRTH
        } else if mfe < self.cfg.lock_in_mfe {
            if self.cfg.retry_conditions_met(impulse_count, recovery_time) {
                TRANSITION
            } else {
                BIRTH
            }
        } else {
            LOCK_IN
        }
    }

    pub fn compute(&mut self, favorable_excursion: f64, bars: u32, impulse_count: u32, recovery_time: f64) -> ThetaState {
        let value = self.classify(favorable_excursion, impulse_count, recovery_time);
        let next = ThetaState {
            value,
            name: theta_name(value),
            bars_in_state: bars,
            favorable_excursion,
        };

        if next.value != self.current.value {
            logging::log(
                Level::Debug,
                Domain::Theta,
                "theta_transition",
                logging::obj(&[
                    ("from", serde_json::json!(self.current.value)),
                    ("to", serde_json::json!(value)),
                    ("mfe", logging::v_num(favorable_excursion)),
                    ("bars", serde_json::json!(bars)),
                ]),
            );
            let prev = std::mem::replace(&mut self.current, next.clone());
            self.history.push(prev);
        } else {
            self.current = next.clone();
        }
        next
    }

    pub fn current(&self) -> &ThetaState {
        &self.current
    }

    /// Prior states in transition order, then the current one.
    pub fn history(&self) -> Vec<ThetaState> {
        let mut out = self.history.clone();
        out.push(self.current.clone());
        out
    }

    pub fn reset(&mut self) {
        self.current = ThetaState::initial();
        self.history.clear();
    }
}
