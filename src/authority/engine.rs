use serde::Serialize;
use std::fmt;

use crate::mode::ModeState;
use crate::types::SizeTier;

use super::policy;
use super::{ExecLimits, SignalCatalog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "ALLOW",
            Decision::Deny => "DENY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthorityLayer {
    Identity,
    State,
    Zone,
    Execution,
}

impl AuthorityLayer {
    pub fn index(&self) -> u8 {
        match self {
            AuthorityLayer::Identity => 0,
            AuthorityLayer::State => 1,
            AuthorityLayer::Zone => 2,
            AuthorityLayer::Execution => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    None,
    Blacklisted,
    UndefinedSignal,
    NotTier1,
    StateNotCertified,
    ZoneCollapse,
    ExecutionEnvironment,
    RetryConditions,
    RetryBudget,
    Duplicate,
    Halted,
    InvariantViolation,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::None => "none",
            DenyReason::Blacklisted => "blacklisted",
            DenyReason::UndefinedSignal => "undefined_signal",
            DenyReason::NotTier1 => "not_tier1",
            DenyReason::StateNotCertified => "state_not_certified",
            DenyReason::ZoneCollapse => "consecutive_loss_same_zone",
            DenyReason::ExecutionEnvironment => "execution_environment",
            DenyReason::RetryConditions => "retry_conditions",
            DenyReason::RetryBudget => "retry_budget",
            DenyReason::Duplicate => "duplicate",
            DenyReason::Halted => "halted",
            DenyReason::InvariantViolation => "invariant_violation",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthorityRequest {
    pub signal_name: String,
    pub theta: u8,
    pub is_retry: bool,
    pub impulse_count: u32,
    pub recovery_time: f64,
    pub consecutive_loss_same_zone: u32,
    /// Quoted spread in points, when the caller has one.
    pub spread: Option<f64>,
    /// True when the zone has already used its retry attempts.
    pub retry_budget_exhausted: bool,
    pub size_preference: Option<SizeTier>,
}

impl AuthorityRequest {
    pub fn new(signal_name: &str, theta: u8) -> Self {
        Self {
            signal_name: signal_name.to_string(),
            theta,
            is_retry: false,
            impulse_count: 0,
            recovery_time: 0.0,
            consecutive_loss_same_zone: 0,
            spread: None,
            retry_budget_exhausted: false,
            size_preference: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorityResponse {
    pub decision: Decision,
    pub theta: u8,
    pub size: SizeTier,
    pub can_retry: bool,
    pub can_trail: bool,
    pub reason: DenyReason,
    pub detail: String,
    pub layer_failed: Option<AuthorityLayer>,
}

impl AuthorityResponse {
    pub fn deny(theta: u8, reason: DenyReason, layer: Option<AuthorityLayer>, detail: String) -> Self {
        Self {
            decision: Decision::Deny,
            theta,
            size: SizeTier::None,
            can_retry: false,
            can_trail: false,
            reason,
            detail,
            layer_failed: layer,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuthorityStats {
    pub allow: u64,
    pub deny: u64,
    pub deny_by_layer: [u64; 4],
}

impl AuthorityStats {
    pub fn total(&self) -> u64 {
        self.allow + self.deny
    }

    pub fn allow_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.allow as f64 / total as f64
        }
    }
}

/// Four-layer decision gate. Checks run in strict order and stop at the
/// first failure.
#[derive(Debug, Clone)]
pub struct AuthorityEngine {
    catalog: SignalCatalog,
    limits: ExecLimits,
    stats: AuthorityStats,
}

impl Default for AuthorityEngine {
    fn default() -> Self {
        Self::new(SignalCatalog::default(), ExecLimits::default())
    }
}

impl AuthorityEngine {
    pub fn new(catalog: SignalCatalog, limits: ExecLimits) -> Self {
        Self { catalog, limits, stats: AuthorityStats::default() }
    }

    pub fn catalog(&self) -> &SignalCatalog {
        &self.catalog
    }

    pub fn evaluate(&mut self, req: &AuthorityRequest, mode: &ModeState) -> AuthorityResponse {
        let response = self.decide(req, mode);
        self.record(&response);
        response
    }

    /// Evaluate without touching the statistics. Callers that may still
    /// veto the response record the final outcome themselves.
    pub fn decide(&self, req: &AuthorityRequest, mode: &ModeState) -> AuthorityResponse {
        match self.first_failure(req, mode) {
            Some((layer, reason, detail)) => AuthorityResponse::deny(req.theta, reason, Some(layer), detail),
            None => AuthorityResponse {
                decision: Decision::Allow,
                theta: req.theta,
                size: policy::size_for(req.theta, req.size_preference),
                can_retry: policy::can_retry(req.theta, req.impulse_count, req.recovery_time)
                    && !req.retry_budget_exhausted,
                can_trail: policy::can_trail(req.theta),
                reason: DenyReason::None,
                detail: String::new(),
                layer_failed: None,
            },
        }
    }

    fn first_failure(&self, req: &AuthorityRequest, mode: &ModeState) -> Option<(AuthorityLayer, DenyReason, String)> {
        let name = req.signal_name.as_str();

        // Layer 0: identity
        if self.catalog.is_blacklisted(name) {
            return Some((AuthorityLayer::Identity, DenyReason::Blacklisted, format!("Blacklisted signal: {}", name)));
        }
        if !self.catalog.is_known(name) {
            return Some((AuthorityLayer::Identity, DenyReason::UndefinedSignal, format!("Signal '{}' not in defined signals", name)));
        }
        if mode.tier1_only && !self.catalog.is_tier1(name) {
            return Some((AuthorityLayer::Identity, DenyReason::NotTier1, format!("{} mode: '{}' is not tier-1", mode.mode.as_str(), name)));
        }

        // Layer 1: state
        if !policy::is_allowed(req.theta) || req.theta < mode.theta_threshold {
            return Some((
                AuthorityLayer::State,
                DenyReason::StateNotCertified,
                format!("θ={}: state not certified (threshold {})", req.theta, mode.theta_threshold),
            ));
        }

        // Layer 2: zone collapse, independent of θ
        if req.consecutive_loss_same_zone >= 2 {
            return Some((
                AuthorityLayer::Zone,
                DenyReason::ZoneCollapse,
                format!("State collapse: {} consecutive losses in zone", req.consecutive_loss_same_zone),
            ));
        }

        // Layer 3: execution environment and retry
        if let Some(spread) = req.spread {
            if !self.limits.permits(spread) {
                let slippage = self.limits.estimate_slippage(spread);
                return Some((
                    AuthorityLayer::Execution,
                    DenyReason::ExecutionEnvironment,
                    format!("slippage={:.2}, spread={:.2}", slippage, spread),
                ));
            }
        }
        if req.is_retry {
            if !policy::can_retry(req.theta, req.impulse_count, req.recovery_time) {
                return Some((
                    AuthorityLayer::Execution,
                    DenyReason::RetryConditions,
                    format!("Retry conditions not met at θ={}", req.theta),
                ));
            }
            if req.retry_budget_exhausted {
                return Some((AuthorityLayer::Execution, DenyReason::RetryBudget, "Retry budget used for zone".to_string()));
            }
        }

        None
    }

    pub fn record(&mut self, response: &AuthorityResponse) {
        match response.decision {
            Decision::Allow => self.stats.allow += 1,
            Decision::Deny => {
                self.stats.deny += 1;
                if let Some(layer) = response.layer_failed {
                    self.stats.deny_by_layer[layer.index() as usize] += 1;
                }
            }
        }
    }

    pub fn stats(&self) -> &AuthorityStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = AuthorityStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{Mode, ModeController};

    fn normal() -> ModeState {
        ModeController::default().state()
    }

    fn conservative() -> ModeState {
        let mut m = ModeController::default();
        m.force_mode(Mode::Conservative, "test");
        m.state()
    }

    #[test]
    fn test_layer_order() {
        let mut e = AuthorityEngine::default();

        let r = e.evaluate(&AuthorityRequest::new("BUY_SPOT", 5), &normal());
        assert_eq!(r.layer_failed, Some(AuthorityLayer::Identity));
        assert_eq!(r.reason, DenyReason::Blacklisted);

        let r = e.evaluate(&AuthorityRequest::new("MYSTERY", 5), &normal());
        assert_eq!(r.reason, DenyReason::UndefinedSignal);

        let r = e.evaluate(&AuthorityRequest::new("SCALP_A", 0), &normal());
        assert_eq!(r.layer_failed, Some(AuthorityLayer::State));

        let mut req = AuthorityRequest::new("SCALP_A", 5);
        req.consecutive_loss_same_zone = 2;
        let r = e.evaluate(&req, &normal());
        assert_eq!(r.layer_failed, Some(AuthorityLayer::Zone));

        assert_eq!(e.stats().deny, 4);
        assert_eq!(e.stats().deny_by_layer, [2, 1, 1, 0]);
    }

    #[test]
    fn test_theta_zero_denied_regardless() {
        let mut e = AuthorityEngine::default();
        let mut req = AuthorityRequest::new("STB_SHORT", 0);
        req.is_retry = true;
        req.impulse_count = 10;
        req.spread = Some(0.25);
        let r = e.evaluate(&req, &normal());
        assert_eq!(r.decision, Decision::Deny);
        assert_eq!(r.size, SizeTier::None);
    }

    #[test]
    fn test_allow_shapes_response() {
        let mut e = AuthorityEngine::default();
        let r = e.evaluate(&AuthorityRequest::new("SCALP_A", 1), &normal());
        assert!(r.is_allowed());
        assert_eq!(r.size, SizeTier::Small);
        assert!(!r.can_retry);
        assert!(!r.can_trail);

        let r = e.evaluate(&AuthorityRequest::new("SCALP_A", 4), &normal());
        assert_eq!(r.size, SizeTier::Large);
        assert!(r.can_retry);
        assert!(r.can_trail);
    }

    #[test]
    fn test_retry_boundaries_at_theta_two() {
        let mut e = AuthorityEngine::default();
        let mut req = AuthorityRequest::new("SCALP_A", 2);
        req.is_retry = true;
        req.impulse_count = 3;
        req.recovery_time = 3.0;
        assert!(e.evaluate(&req, &normal()).is_allowed());

        req.impulse_count = 2;
        let r = e.evaluate(&req, &normal());
        assert_eq!(r.layer_failed, Some(AuthorityLayer::Execution));
        assert_eq!(r.reason, DenyReason::RetryConditions);

        req.impulse_count = 3;
        req.recovery_time = 4.0;
        assert_eq!(e.evaluate(&req, &normal()).reason, DenyReason::RetryConditions);
    }

    #[test]
    fn test_retry_budget_denies() {
        let mut e = AuthorityEngine::default();
        let mut req = AuthorityRequest::new("SCALP_A", 3);
        req.is_retry = true;
        req.retry_budget_exhausted = true;
        assert_eq!(e.evaluate(&req, &normal()).reason, DenyReason::RetryBudget);
    }

    #[test]
    fn test_execution_environment() {
        let mut e = AuthorityEngine::default();
        let mut req = AuthorityRequest::new("SCALP_A", 1);
        req.spread = Some(2.5);
        let r = e.evaluate(&req, &normal());
        assert_eq!(r.reason, DenyReason::ExecutionEnvironment);
        req.spread = Some(1.0);
        assert!(e.evaluate(&req, &normal()).is_allowed());
    }

    #[test]
    fn test_conservative_requires_tier1() {
        let mut e = AuthorityEngine::default();
        let r = e.evaluate(&AuthorityRequest::new("SCALP_A", 9), &conservative());
        assert_eq!(r.reason, DenyReason::NotTier1);
        assert!(e.evaluate(&AuthorityRequest::new("SCALP_A", 9), &normal()).is_allowed());
        assert!(e.evaluate(&AuthorityRequest::new("STB_SHORT", 3), &conservative()).is_allowed());
        let r = e.evaluate(&AuthorityRequest::new("STB_SHORT", 2), &conservative());
        assert_eq!(r.layer_failed, Some(AuthorityLayer::State));
    }

    #[test]
    fn test_stats_and_reset() {
        let mut e = AuthorityEngine::default();
        e.evaluate(&AuthorityRequest::new("SCALP_A", 1), &normal());
        e.evaluate(&AuthorityRequest::new("SCALP_A", 0), &normal());
        assert_eq!(e.stats().allow_rate(), 0.5);
        e.reset_stats();
        assert_eq!(e.stats().total(), 0);
        assert_eq!(e.stats().allow_rate(), 0.0);
    }
}
