use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::reliability::circuit::CircuitBreaker;

use super::retry::{is_retryable_http_status, retry_async, Permanent, RetryConfig};
use super::{DeliveryOutcome, Notification, Notifier};

/// Consecutive failed deliveries before the webhook drops to a single
/// attempt per notification.
const BREAKER_THRESHOLD: u32 = 5;

/// POSTs each notification as JSON.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    retry: RetryConfig,
    breaker: Mutex<CircuitBreaker>,
}

impl WebhookNotifier {
    pub fn new(url: &str, retry: RetryConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            retry,
            breaker: Mutex::new(CircuitBreaker::new(BREAKER_THRESHOLD)),
        })
    }

    fn effective_retry(&self) -> RetryConfig {
        let open = !self.breaker.lock().unwrap_or_else(PoisonError::into_inner).allow();
        if open {
            RetryConfig { max_retries: 0, ..self.retry.clone() }
        } else {
            self.retry.clone()
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, note: &Notification) -> Result<DeliveryOutcome> {
        let retry = self.effective_retry();
        let result = retry_async(&retry, "webhook_post", || {
            let request = self.client.post(&self.url).json(note);
            async move {
                let resp = request.send().await?;
                let status = resp.status().as_u16();
                if resp.status().is_success() {
                    Ok(())
                } else if is_retryable_http_status(status) {
                    Err(anyhow!("webhook returned {}", status))
                } else {
                    Err(anyhow::Error::new(Permanent(format!("webhook returned {}", status))))
                }
            }
        })
        .await;

        let mut breaker = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(()) => {
                breaker.record_success();
                Ok(DeliveryOutcome::Delivered)
            }
            Err(e) => {
                breaker.record_failure(&e.to_string());
                Err(e)
            }
        }
    }
}
