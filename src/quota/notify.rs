use crate::quota::audit::{QuotaViolation, ViolationStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Pushes quota violations to an operator webhook.
///
/// Delivery is best-effort: a failed post leaves the violation unnotified
/// for the next pass and never disturbs scheduling.
pub struct ViolationNotifier {
    client: reqwest::Client,
    endpoint: Url,
    store: Arc<ViolationStore>,
}

impl ViolationNotifier {
    pub fn new(endpoint: &str, store: Arc<ViolationStore>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid violation webhook URL: {endpoint}"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            store,
        })
    }

    pub async fn notify(&self, violation: &QuotaViolation) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&violation)
            .send()
            .await
            .context("Webhook request failed")?;

        response
            .error_for_status()
            .context("Webhook returned an error status")?;
        Ok(())
    }

    /// Deliver every pending violation, marking the successful ones.
    pub async fn notify_pending(&self) -> usize {
        let pending = self.store.unnotified();
        let mut delivered = 0;

        for violation in pending {
            match self.notify(&violation).await {
                Ok(()) => {
                    self.store.mark_notified(violation.id);
                    delivered += 1;
                }
                Err(err) => {
                    warn!("Failed to notify violation {}: {:#}", violation.id, err);
                }
            }
        }

        if delivered > 0 {
            info!("Delivered {} quota violation notifications", delivered);
        }
        delivered
    }
}
