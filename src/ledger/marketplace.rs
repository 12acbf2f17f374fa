//! Marketplace reporting: an ambient addition (spec §4.9 extension) for
//! settling both consumed and supplied capacity, not just the consumer
//! side the base ledger tracks. New; no teacher/example precedent for a
//! marketplace settlement hook, so this follows the same "trait + stub +
//! webhook impl" pattern as `quota::store::CounterStore`.

use async_trait::async_trait;

use crate::model::LedgerEntry;

#[async_trait]
pub trait MarketplaceReporter: Send + Sync {
    async fn report(&self, entry: &LedgerEntry);
}

/// Default no-op reporter for deployments that don't participate in the
/// capacity marketplace.
pub struct NullReporter;

#[async_trait]
impl MarketplaceReporter for NullReporter {
    async fn report(&self, _entry: &LedgerEntry) {}
}

/// Posts supply-direction ledger entries to a configured webhook. Failures
/// are logged and counted, never propagated, matching the ledger's
/// best-effort propagation policy.
pub struct WebhookReporter {
    client: reqwest::Client,
    url: String,
}

impl WebhookReporter {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl MarketplaceReporter for WebhookReporter {
    async fn report(&self, entry: &LedgerEntry) {
        if !matches!(entry.direction, crate::model::LedgerDirection::Supply) {
            return;
        }
        let result = self.client.post(&self.url).json(entry).send().await;
        if let Err(err) = result {
            tracing::warn!(error = %err, "marketplace webhook report failed");
            metrics::counter!("marketplace_report_failures_total").increment(1);
        }
    }
}
