use std::collections::HashMap;

use crate::types::Outcome;
use crate::zone::ZoneKey;

use super::policy;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    pub attempts: u32,
    pub last_result: Option<Outcome>,
}

/// Per-zone retry budget layered on top of the θ retry rule.
#[derive(Debug, Clone)]
pub struct RetryBook {
    max_attempts: u32,
    zones: HashMap<ZoneKey, RetryState>,
}

impl Default for RetryBook {
    fn default() -> Self {
        Self::new(1)
    }
}

impl RetryBook {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts, zones: HashMap::new() }
    }

    pub fn attempts(&self, zone: &ZoneKey) -> u32 {
        self.zones.get(zone).map(|s| s.attempts).unwrap_or(0)
    }

    pub fn has_budget(&self, zone: &ZoneKey) -> bool {
        self.attempts(zone) < self.max_attempts
    }

    pub fn can_retry(&self, zone: &ZoneKey, theta: u8, impulse_count: u32, recovery_time: f64) -> bool {
        policy::can_retry(theta, impulse_count, recovery_time) && self.has_budget(zone)
    }

    pub fn record_attempt(&mut self, zone: &ZoneKey) {
        let state = self
            .zones
            .entry(zone.clone())
            .or_insert(RetryState { attempts: 0, last_result: None });
        state.attempts += 1;
    }

    pub fn record_result(&mut self, zone: &ZoneKey, outcome: Outcome) {
        if let Some(state) = self.zones.get_mut(zone) {
            state.last_result = Some(outcome);
        }
    }

    pub fn reset_zone(&mut self, zone: &ZoneKey) {
        self.zones.remove(zone);
    }

    pub fn reset_all(&mut self) {
        self.zones.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    #[test]
    fn test_single_attempt_budget() {
        let zone = ZoneKey::from_price("OVERBOUGHT", Direction::Short, 21_550.0, 100.0);
        let mut book = RetryBook::default();
        assert!(book.can_retry(&zone, 3, 0, 0.0));
        book.record_attempt(&zone);
        assert!(!book.can_retry(&zone, 3, 0, 0.0));
        book.record_result(&zone, Outcome::Loss);
        book.reset_zone(&zone);
        assert!(book.can_retry(&zone, 3, 0, 0.0));
    }

    #[test]
    fn test_policy_still_applies() {
        let zone = ZoneKey::from_price("OVERBOUGHT", Direction::Short, 21_550.0, 100.0);
        let book = RetryBook::default();
        assert!(!book.can_retry(&zone, 1, 10, 0.0));
        assert!(!book.can_retry(&zone, 2, 2, 0.0));
    }
}
