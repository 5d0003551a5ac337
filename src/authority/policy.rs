//! θ → permitted size, retry and trailing. Every θ value is matched
//! explicitly; anything from 3 up is lock-in.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::types::SizeTier;

/// θ=2 retry needs strictly more impulses than this.
pub const RETRY_IMPULSE_MIN: u32 = 2;
/// θ=2 retry needs recovery strictly faster than this (bars).
pub const RETRY_RECOVERY_MAX: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryRule {
    Never,
    Conditional,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStyle {
    FixedTp,
    FixedTpOrExtension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThetaPolicy {
    pub allow: bool,
    pub sizes: &'static [SizeTier],
    pub retry: RetryRule,
    pub trailing: bool,
    pub exit: Option<ExitStyle>,
}

pub fn policy_for(theta: u8) -> ThetaPolicy {
    match theta {
        0 => ThetaPolicy {
            allow: false,
            sizes: &[SizeTier::None],
            retry: RetryRule::Never,
            trailing: false,
            exit: None,
        },
        1 => ThetaPolicy {
            allow: true,
            sizes: &[SizeTier::Small],
            retry: RetryRule::Never,
            trailing: false,
            exit: Some(ExitStyle::FixedTp),
        },
        2 => ThetaPolicy {
            allow: true,
            sizes: &[SizeTier::Small, SizeTier::Medium],
            retry: RetryRule::Conditional,
            trailing: false,
            exit: Some(ExitStyle::FixedTp),
        },
        3..=u8::MAX => ThetaPolicy {
            allow: true,
            sizes: &[SizeTier::Large],
            retry: RetryRule::Always,
            trailing: true,
            exit: Some(ExitStyle::FixedTpOrExtension),
        },
    }
}

pub fn is_allowed(theta: u8) -> bool {
    policy_for(theta).allow
}

/// First permitted tier unless the preference is also permitted.
pub fn size_for(theta: u8, preference: Option<SizeTier>) -> SizeTier {
    let sizes = policy_for(theta).sizes;
    match preference {
        Some(p) if sizes.contains(&p) => p,
        _ => sizes.first().copied().unwrap_or(SizeTier::None),
    }
}

pub fn can_retry(theta: u8, impulse_count: u32, recovery_time: f64) -> bool {
    match policy_for(theta).retry {
        RetryRule::Never => false,
        RetryRule::Always => true,
        RetryRule::Conditional => impulse_count > RETRY_IMPULSE_MIN && recovery_time < RETRY_RECOVERY_MAX,
    }
}

/// Trailing is optional at lock-in and unavailable below it.
pub fn can_trail(theta: u8) -> bool {
    policy_for(theta).trailing
}

#[derive(Debug, Clone)]
pub struct AccountSizing {
    pub base_size: f64,
    pub max_size: f64,
    /// Per-θ tier replacing the policy's default.
    pub overrides: BTreeMap<u8, SizeTier>,
}

impl Default for AccountSizing {
    fn default() -> Self {
        Self { base_size: 1.0, max_size: 4.0, overrides: BTreeMap::new() }
    }
}

/// Contracts for θ: base × tier multiplier, capped at the account max.
pub fn position_size(theta: u8, account: &AccountSizing) -> f64 {
    let tier = account
        .overrides
        .get(&theta)
        .copied()
        .unwrap_or_else(|| size_for(theta, None));
    (account.base_size * tier.multiplier()).min(account.max_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_theta_zero_never_allowed() {
        assert!(!is_allowed(0));
        assert_eq!(size_for(0, Some(SizeTier::Large)), SizeTier::None);
        assert!(!can_retry(0, 10, 0.0));
    }

    #[test]
    fn test_sizes_by_theta() {
        assert_eq!(size_for(1, None), SizeTier::Small);
        assert_eq!(size_for(1, Some(SizeTier::Medium)), SizeTier::Small);
        assert_eq!(size_for(2, None), SizeTier::Small);
        assert_eq!(size_for(2, Some(SizeTier::Medium)), SizeTier::Medium);
        assert_eq!(size_for(3, None), SizeTier::Large);
        assert_eq!(size_for(9, Some(SizeTier::Small)), SizeTier::Large);
    }

    #[test]
    fn test_retry_rules() {
        assert!(!can_retry(1, 10, 0.0));
        assert!(can_retry(2, 3, 3.0));
        assert!(!can_retry(2, 2, 3.0));
        assert!(!can_retry(2, 3, 4.0));
        assert!(can_retry(3, 0, 100.0));
    }

    #[test]
    fn test_trailing_only_at_lock_in() {
        assert!(!can_trail(1));
        assert!(!can_trail(2));
        assert!(can_trail(3));
        assert!(can_trail(200));
    }

    #[test]
    fn test_position_size() {
        let acct = AccountSizing::default();
        assert_eq!(position_size(0, &acct), 0.0);
        assert_eq!(position_size(1, &acct), 1.0);
        assert_eq!(position_size(3, &acct), 4.0);

        let mut capped = AccountSizing { base_size: 2.0, max_size: 5.0, ..AccountSizing::default() };
        assert_eq!(position_size(3, &capped), 5.0);
        capped.overrides.insert(2, SizeTier::Medium);
        assert_eq!(position_size(2, &capped), 4.0);
    }
}
