//! Consecutive-loss accounting scoped to a zone: the same situation, the
//! same direction, the same price bucket. Global P&L never enters here.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::logging::{self, Domain, Level};
use crate::types::Direction;

#[derive(Debug, Clone)]
pub struct ZoneConfig {
    pub bucket_width: f64,
    /// Records idle longer than this are treated as fresh. 0 disables.
    pub reset_hours: i64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self { bucket_width: 100.0, reset_hours: 24 }
    }
}

/// Fixed-width price bucket, `[lower, upper)`. Identified by its integer
/// index so fractional widths never merge neighbouring buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneId {
    index: i64,
    width_bits: u64,
}

impl ZoneId {
    pub fn from_price(price: f64, width: f64) -> Self {
        let width = if width.is_finite() && width > 0.0 { width } else { 100.0 };
        Self { index: (price / width).floor() as i64, width_bits: width.to_bits() }
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn width(&self) -> f64 {
        f64::from_bits(self.width_bits)
    }

    pub fn lower(&self) -> f64 {
        self.index as f64 * self.width()
    }

    pub fn upper(&self) -> f64 {
        (self.index + 1) as f64 * self.width()
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.lower(), self.upper())
    }
}

impl Serialize for ZoneId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ZoneKey {
    pub state: String,
    pub direction: Direction,
    pub zone_id: ZoneId,
}

impl ZoneKey {
    pub fn new(state: &str, direction: Direction, zone_id: ZoneId) -> Self {
        Self { state: state.to_string(), direction, zone_id }
    }

    pub fn from_price(state: &str, direction: Direction, price: f64, width: f64) -> Self {
        Self::new(state, direction, ZoneId::from_price(price, width))
    }
}

impl fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.state, self.direction, self.zone_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossRecord {
    pub count: u32,
    pub last_loss_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneLoss {
    pub zone: ZoneKey,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ZoneStats {
    pub active_zones: usize,
    pub zones_with_consecutive_loss: usize,
    pub total_losses_tracked: u64,
}

#[derive(Debug, Clone)]
pub struct ZoneLossCounter {
    cfg: ZoneConfig,
    records: HashMap<ZoneKey, LossRecord>,
}

impl Default for ZoneLossCounter {
    fn default() -> Self {
        Self::new(ZoneConfig::default())
    }
}

impl ZoneLossCounter {
    pub fn new(cfg: ZoneConfig) -> Self {
        Self { cfg, records: HashMap::new() }
    }

    pub fn key_for(&self, state: &str, direction: Direction, price: f64) -> ZoneKey {
        ZoneKey::from_price(state, direction, price, self.cfg.bucket_width)
    }

    fn expired(&self, record: &LossRecord, now: DateTime<Utc>) -> bool {
        self.cfg.reset_hours > 0 && now - record.last_loss_time > Duration::hours(self.cfg.reset_hours)
    }

    pub fn get_consecutive_loss(&mut self, zone: &ZoneKey) -> u32 {
        self.consecutive_loss_at(zone, Utc::now())
    }

    pub fn consecutive_loss_at(&mut self, zone: &ZoneKey, now: DateTime<Utc>) -> u32 {
        let record = match self.records.get(zone) {
            Some(r) => *r,
            None => return 0,
        };
        if self.expired(&record, now) {
            self.reset_zone(zone);
            return 0;
        }
        record.count
    }

    pub fn record_loss(&mut self, zone: &ZoneKey) -> u32 {
        self.record_loss_at(zone, Utc::now())
    }

    pub fn record_loss_at(&mut self, zone: &ZoneKey, now: DateTime<Utc>) -> u32 {
        let fresh = LossRecord { count: 1, last_loss_time: now };
        let count = match self.records.get(zone).copied() {
            Some(record) if !self.expired(&record, now) => {
                let next = LossRecord { count: record.count.saturating_add(1), last_loss_time: now };
                self.records.insert(zone.clone(), next);
                next.count
            }
            _ => {
                self.records.insert(zone.clone(), fresh);
                1
            }
        };
        logging::log(
            Level::Info,
            Domain::Zone,
            "zone_loss",
            logging::obj(&[
                ("zone", logging::v_str(&zone.to_string())),
                ("count", serde_json::json!(count)),
            ]),
        );
        count
    }

    /// A win clears the zone entirely.
    pub fn record_win(&mut self, zone: &ZoneKey) {
        if self.records.remove(zone).is_some() {
            logging::log(
                Level::Info,
                Domain::Zone,
                "zone_cleared",
                logging::obj(&[("zone", logging::v_str(&zone.to_string()))]),
            );
        }
    }

    pub fn reset_zone(&mut self, zone: &ZoneKey) {
        self.records.remove(zone);
    }

    pub fn reset_all(&mut self) {
        self.records.clear();
    }

    pub fn zones_with_losses(&self) -> Vec<ZoneLoss> {
        let mut out: Vec<ZoneLoss> = self
            .records
            .iter()
            .filter(|(_, r)| r.count > 0)
            .map(|(k, r)| ZoneLoss { zone: k.clone(), count: r.count })
            .collect();
        out.sort_by(|a, b| {
            (&a.zone.state, a.zone.direction, a.zone.zone_id).cmp(&(&b.zone.state, b.zone.direction, b.zone.zone_id))
        });
        out
    }

    pub fn stats(&self) -> ZoneStats {
        ZoneStats {
            active_zones: self.records.len(),
            zones_with_consecutive_loss: self.records.values().filter(|r| r.count >= 2).count(),
            total_losses_tracked: self.records.values().map(|r| r.count as u64).sum(),
        }
    }
}
