//! Append-only usage ledger (spec §4.9). Grounded on the teacher's
//! best-effort "log, increment a metric, never fail the request" style for
//! side-channel bookkeeping (`quota.rs`'s backend-error handling in the base
//! repo): a ledger write failure is logged and counted, never propagated.

pub mod marketplace;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::LedgerEntry;

/// Sink a ledger entry is written to. `InMemoryLedger` is the default and
/// sufficient for a single-process deployment; a durable backing store can
/// implement the same trait without touching callers.
#[async_trait]
pub trait LedgerSink: Send + Sync {
    async fn append(&self, entry: LedgerEntry);
}

pub struct InMemoryLedger {
    entries: tokio::sync::Mutex<Vec<LedgerEntry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            entries: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn all(&self) -> Vec<LedgerEntry> {
        self.entries.lock().await.clone()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerSink for InMemoryLedger {
    async fn append(&self, entry: LedgerEntry) {
        self.entries.lock().await.push(entry);
    }
}

/// Buffers ledger writes through an unbounded channel and a background
/// flush task, so a slow or unavailable sink never blocks the request path
/// that produced the usage record.
pub struct Ledger {
    tx: mpsc::UnboundedSender<LedgerEntry>,
}

impl Ledger {
    pub fn spawn(sink: Arc<dyn LedgerSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LedgerEntry>();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                sink.append(entry).await;
            }
        });
        Self { tx }
    }

    /// Records usage. Never fails the caller; a full or closed channel is
    /// logged and the entry is dropped, matching spec §7's propagation
    /// policy for non-critical side effects.
    pub fn record(&self, entry: LedgerEntry) {
        if self.tx.send(entry).is_err() {
            tracing::error!("ledger channel closed, dropping usage record");
            metrics::counter!("ledger_drops_total").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LedgerDirection;

    fn entry(tokens: u64) -> LedgerEntry {
        LedgerEntry {
            user_id: "u1".into(),
            api_key_id: "k1".into(),
            service_id: "gpt-4".into(),
            prompt_tokens: tokens,
            completion_tokens: tokens,
            direction: LedgerDirection::Consume,
            memo: "test".into(),
            recorded_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn recorded_entries_reach_the_sink() {
        let sink = Arc::new(InMemoryLedger::new());
        let ledger = Ledger::spawn(sink.clone());
        ledger.record(entry(10));
        ledger.record(entry(20));
        // Give the background task a chance to drain the channel.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let all = sink.all().await;
        assert_eq!(all.len(), 2);
    }
}
