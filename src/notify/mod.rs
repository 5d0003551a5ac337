//! Outbound delivery of gate decisions.
//!
//! Delivery runs on its own task behind a bounded channel. Its outcome is
//! logged and counted here only; nothing flows back into the gate.

pub mod retry;
pub mod webhook;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::authority::gate::GateDecision;
use crate::logging::{self, ts_now};

pub use retry::RetryConfig;
pub use webhook::WebhookNotifier;

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub channel_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { webhook_url: None, max_retries: 3, base_delay_ms: 200, channel_capacity: 256 }
    }
}

impl NotifyConfig {
    /// Webhook when a URL is configured, otherwise a notifier that drops everything.
    pub fn build(&self) -> Result<Arc<dyn Notifier>> {
        match &self.webhook_url {
            Some(url) => {
                let retry = RetryConfig { max_retries: self.max_retries, base_delay_ms: self.base_delay_ms, ..RetryConfig::default() };
                Ok(Arc::new(WebhookNotifier::new(url, retry)?))
            }
            None => Ok(Arc::new(NullNotifier)),
        }
    }
}

/// Decision record handed to the delivery layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub ts: String,
    pub instrument: String,
    pub signal_id: String,
    pub signal_name: String,
    pub allowed: bool,
    pub reason: String,
    pub size: String,
    pub theta: u8,
    pub zone: Option<String>,
}

impl Notification {
    pub fn from_decision(instrument: &str, decision: &GateDecision) -> Self {
        Self {
            ts: ts_now(),
            instrument: instrument.to_string(),
            signal_id: decision.signal_id.clone(),
            signal_name: decision.signal_name.clone(),
            allowed: decision.allowed(),
            reason: decision.reason_text(),
            size: decision.response.size.as_str().to_string(),
            theta: decision.response.theta,
            zone: decision.zone.as_ref().map(|z| z.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
    NotSent,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "DELIVERED",
            DeliveryOutcome::Failed => "FAILED",
            DeliveryOutcome::NotSent => "NOT_SENT",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    /// `Err` means the delivery failed after any retries.
    async fn deliver(&self, note: &Notification) -> Result<DeliveryOutcome>;
}

pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    fn name(&self) -> &str {
        "null"
    }

    async fn deliver(&self, _note: &Notification) -> Result<DeliveryOutcome> {
        Ok(DeliveryOutcome::NotSent)
    }
}

/// Keeps every notification it is handed. Optionally fails every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { seen: Mutex::new(Vec::new()), fail: true }
    }

    pub fn seen(&self) -> Vec<Notification> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, note: &Notification) -> Result<DeliveryOutcome> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).push(note.clone());
        if self.fail {
            Err(anyhow!("receiver unavailable"))
        } else {
            Ok(DeliveryOutcome::Delivered)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
    pub not_sent: u64,
    /// Rejected at submit because the channel was full or closed.
    pub dropped: u64,
}

impl DispatchStats {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.delivered += 1,
            DeliveryOutcome::Failed => self.failed += 1,
            DeliveryOutcome::NotSent => self.not_sent += 1,
        }
    }
}

pub struct Dispatcher {
    tx: mpsc::Sender<Notification>,
    handle: JoinHandle<DispatchStats>,
    dropped: u64,
}

impl Dispatcher {
    /// Spawn the delivery task. Must be called inside a tokio runtime.
    pub fn spawn(notifier: Arc<dyn Notifier>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Notification>(capacity.max(1));
        let handle = tokio::spawn(async move {
            let mut stats = DispatchStats::default();
            while let Some(note) = rx.recv().await {
                let outcome = match notifier.deliver(&note).await {
                    Ok(outcome) => {
                        logging::log_delivery(&note.signal_id, outcome.as_str(), notifier.name());
                        outcome
                    }
                    Err(e) => {
                        logging::log_delivery(&note.signal_id, DeliveryOutcome::Failed.as_str(), &e.to_string());
                        DeliveryOutcome::Failed
                    }
                };
                stats.record(outcome);
            }
            stats
        });
        Self { tx, handle, dropped: 0 }
    }

    /// Queue without waiting. A full channel drops the notification.
    pub fn submit(&mut self, note: Notification) -> bool {
        match self.tx.try_send(note) {
            Ok(()) => true,
            Err(err) => {
                let note = match err {
                    mpsc::error::TrySendError::Full(n) | mpsc::error::TrySendError::Closed(n) => n,
                };
                logging::log_delivery(&note.signal_id, DeliveryOutcome::NotSent.as_str(), "dispatch queue unavailable");
                self.dropped += 1;
                false
            }
        }
    }

    /// Close the queue and wait for everything already queued.
    pub async fn shutdown(self) -> DispatchStats {
        let Dispatcher { tx, handle, dropped } = self;
        drop(tx);
        let mut stats = handle.await.unwrap_or_default();
        stats.dropped += dropped;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::gate::{AuthorityGate, SignalRequest};
    use crate::types::Direction;

    fn note(id: &str) -> Notification {
        let gate = AuthorityGate::default();
        let d = gate.authorize(&SignalRequest::new(id, "STB_SHORT", "OVERBOUGHT", Direction::Short, 21_550.0, 3));
        Notification::from_decision("NQ1!", &d)
    }

    #[test]
    fn test_notification_from_decision() {
        let n = note("sig-1");
        assert!(n.allowed);
        assert_eq!(n.size, "LARGE");
        assert_eq!(n.zone.as_deref(), Some("OVERBOUGHT/SHORT/21500-21600"));
        assert!(n.reason.starts_with("Allowed"));
    }

    #[tokio::test]
    async fn test_dispatcher_counts_outcomes() {
        let rec = Arc::new(RecordingNotifier::new());
        let mut d = Dispatcher::spawn(rec.clone(), 8);
        assert!(d.submit(note("a")));
        assert!(d.submit(note("b")));
        let stats = d.shutdown().await;
        assert_eq!(stats.delivered, 2);
        assert_eq!(rec.seen().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_counted_not_raised() {
        let rec = Arc::new(RecordingNotifier::failing());
        let mut d = Dispatcher::spawn(rec.clone(), 8);
        d.submit(note("a"));
        let stats = d.shutdown().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn test_null_notifier_not_sent() {
        let cfg = NotifyConfig::default();
        let notifier = cfg.build().unwrap();
        assert_eq!(notifier.name(), "null");
        let mut d = Dispatcher::spawn(notifier, 4);
        d.submit(note("a"));
        assert_eq!(d.shutdown().await.not_sent, 1);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_fails() {
        let retry = RetryConfig { max_retries: 1, base_delay_ms: 1, max_delay_ms: 2, jitter_factor: 0.0 };
        let hook = WebhookNotifier::new("http://127.0.0.1:9/hook", retry).unwrap();
        assert!(hook.deliver(&note("a")).await.is_err());
    }
}
