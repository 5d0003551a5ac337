//! Layered authority: identity, state, zone, execution environment.

pub mod engine;
pub mod gate;
pub mod policy;
pub mod retry;

use std::collections::BTreeSet;

pub use engine::{AuthorityEngine, AuthorityLayer, AuthorityRequest, AuthorityResponse, AuthorityStats, Decision, DenyReason};
pub use gate::{AuthorityGate, GateStatus, SignalRequest};
pub use policy::AccountSizing;
pub use retry::RetryBook;

const KNOWN: &[&str] = &[
    "SHORT_STALL",
    "SHORT_INTERSECT_SPOT",
    "STB_SHORT",
    "STB_LONG",
    "SCALP_A",
    "HUNT_1",
    "RESIST_ZSCORE",
    "RESIST_ZSCORE_0.5",
    "RESIST_ZSCORE_1.0",
    "RESIST_ZSCORE_1.5",
    "POC_LONG",
    "OPA_SHORT",
];

const TIER1: &[&str] = &["STB_SHORT", "STB_LONG", "RESIST_ZSCORE_0.5", "RESIST_ZSCORE_1.0", "RESIST_ZSCORE_1.5"];

const BLACKLIST: &[&str] = &["BUY_SPOT", "SELL_SPOT", "DIAGONAL_HOLD", "HIGHER_LOW", "RANGE_EXPECT_V1"];

/// Signal names the identity layer recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalCatalog {
    known: BTreeSet<String>,
    tier1: BTreeSet<String>,
    blacklist: BTreeSet<String>,
}

impl Default for SignalCatalog {
    fn default() -> Self {
        let owned = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self::new(owned(KNOWN), owned(TIER1), owned(BLACKLIST))
    }
}

impl SignalCatalog {
    /// Tier-1 names are always known; a blacklisted name never is.
    pub fn new(known: Vec<String>, tier1: Vec<String>, blacklist: Vec<String>) -> Self {
        let blacklist: BTreeSet<String> = blacklist.into_iter().collect();
        let tier1: BTreeSet<String> = tier1.into_iter().filter(|s| !blacklist.contains(s)).collect();
        let known = known
            .into_iter()
            .chain(tier1.iter().cloned())
            .filter(|s| !blacklist.contains(s))
            .collect();
        Self { known, tier1, blacklist }
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    pub fn is_tier1(&self, name: &str) -> bool {
        self.tier1.contains(name)
    }

    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklist.contains(name)
    }

    pub fn known_names(&self) -> Vec<String> {
        self.known.iter().cloned().collect()
    }

    pub fn tier1_names(&self) -> Vec<String> {
        self.tier1.iter().cloned().collect()
    }

    pub fn blacklist_names(&self) -> Vec<String> {
        self.blacklist.iter().cloned().collect()
    }
}

/// Execution-environment limits checked at layer 3 when a spread is known.
#[derive(Debug, Clone)]
pub struct ExecLimits {
    pub max_slippage: f64,
    pub max_spread: f64,
    pub min_slippage: f64,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self { max_slippage: 3.0, max_spread: 2.0, min_slippage: 0.5 }
    }
}

impl ExecLimits {
    /// Conservative slippage estimate from the quoted spread.
    pub fn estimate_slippage(&self, spread: f64) -> f64 {
        (spread * 0.5).max(self.min_slippage)
    }

    pub fn permits(&self, spread: f64) -> bool {
        spread <= self.max_spread && self.estimate_slippage(spread) <= self.max_slippage
    }
}
