//! Multi-dimensional capacity manager (spec §4.3).
//!
//! Live per-model counters for tokens/sec, requests/sec, concurrency, and a
//! configured max context length. Grounded on the `RwLock<HashMap<String,
//! QuotaState>>` + per-key entry shape of `QuotaTracker` in
//! `other_examples/810357af_first-fluke-cratos__crates-cratos-llm-src-quota-mod.rs.rs`,
//! turned from "observe remote limits" into "enforce local limits".

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::{CapacityConfig, CapacitySnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationMode {
    FailOpen,
    FailClosed,
    Cached,
}

struct LiveCapacity {
    config: CapacityConfig,
    /// Fixed-point tokens/sec * 1000, for lock-free atomic adjustment.
    tokens_per_sec_milli: AtomicU64,
    requests_in_flight: AtomicU32,
    concurrent: AtomicU32,
    /// Start (unix millis) of the current 1s request-rate window.
    request_window_started_ms: AtomicU64,
    requests_in_window: AtomicU32,
}

fn now_unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl LiveCapacity {
    fn snapshot(&self, model: &str) -> CapacitySnapshot {
        CapacitySnapshot {
            model: model.to_string(),
            tokens_per_sec: self.tokens_per_sec_milli.load(Ordering::Relaxed) as f64 / 1000.0,
            concurrent: self.concurrent.load(Ordering::Relaxed),
            max_tokens_per_sec: self.config.max_tokens_per_sec,
            max_concurrent: self.config.max_concurrent,
        }
    }
}

pub struct AcquireRequest {
    pub model: String,
    pub request_id: String,
    pub estimated_tokens: u64,
    pub estimated_duration: Duration,
    pub estimated_context_length: u32,
}

#[derive(Debug, Clone)]
pub struct CapacityLease {
    pub request_id: String,
    pub model: String,
    pub reserved_tokens_per_sec_milli: i64,
}

/// Per-model health probe result used to drive degradation policy.
pub enum ProbeHealth {
    Healthy,
    Unavailable,
}

pub struct CapacityManager {
    models: DashMap<String, LiveCapacity>,
    /// request_id -> whether it has already been released (idempotency).
    released: DashMap<String, ()>,
    degradation: DegradationMode,
    fail_open_token_floor: u64,
    cached_snapshot: DashMap<String, CapacitySnapshot>,
}

impl CapacityManager {
    pub fn new(configs: Vec<CapacityConfig>, degradation: DegradationMode, fail_open_token_floor: u64) -> Self {
        let models = DashMap::new();
        for cfg in configs {
            models.insert(
                cfg.model_family.clone(),
                LiveCapacity {
                    config: cfg,
                    tokens_per_sec_milli: AtomicU64::new(0),
                    requests_in_flight: AtomicU32::new(0),
                    concurrent: AtomicU32::new(0),
                    request_window_started_ms: AtomicU64::new(0),
                    requests_in_window: AtomicU32::new(0),
                },
            );
        }
        Self {
            models,
            released: DashMap::new(),
            degradation,
            fail_open_token_floor,
            cached_snapshot: DashMap::new(),
        }
    }

    /// Attempts to admit `req`. Returns `Ok(lease)` on success, `Err(())` if
    /// the model's counters would exceed their configured maxima or the
    /// estimated context length exceeds `max_context_length`.
    pub fn try_acquire(&self, req: &AcquireRequest, probe: ProbeHealth) -> Result<CapacityLease, CapacityDenied> {
        if matches!(probe, ProbeHealth::Unavailable) {
            return self.acquire_degraded(req);
        }

        let Some(live) = self.models.get(&req.model) else {
            // Unknown model: behave as fail-open with a conservative floor so
            // an un-configured model family doesn't wedge the whole gateway.
            return self.acquire_degraded(req);
        };

        if req.estimated_context_length > live.config.max_context_length {
            return Err(CapacityDenied::ContextTooLarge);
        }

        let secs = req.estimated_duration.as_secs_f64().max(0.001);
        let burden_milli = ((req.estimated_tokens as f64 / secs) * 1000.0) as i64;

        let current_milli = live.tokens_per_sec_milli.load(Ordering::Acquire) as i64;
        let max_milli = (live.config.max_tokens_per_sec * 1000.0) as i64;
        if current_milli + burden_milli > max_milli {
            return Err(CapacityDenied::CapacityExceeded);
        }

        let concurrent = live.concurrent.load(Ordering::Acquire);
        if concurrent + 1 > live.config.max_concurrent {
            return Err(CapacityDenied::CapacityExceeded);
        }

        let now_ms = now_unix_millis();
        let window_started = live.request_window_started_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(window_started) >= 1000 {
            live.request_window_started_ms.store(now_ms, Ordering::Release);
            live.requests_in_window.store(0, Ordering::Release);
        }
        let in_window = live.requests_in_window.load(Ordering::Acquire);
        if in_window as f64 + 1.0 > live.config.max_rps {
            return Err(CapacityDenied::CapacityExceeded);
        }

        live.tokens_per_sec_milli
            .fetch_add(burden_milli as u64, Ordering::AcqRel);
        live.concurrent.fetch_add(1, Ordering::AcqRel);
        live.requests_in_flight.fetch_add(1, Ordering::AcqRel);
        live.requests_in_window.fetch_add(1, Ordering::AcqRel);

        Ok(CapacityLease {
            request_id: req.request_id.clone(),
            model: req.model.clone(),
            reserved_tokens_per_sec_milli: burden_milli,
        })
    }

    fn acquire_degraded(&self, req: &AcquireRequest) -> Result<CapacityLease, CapacityDenied> {
        match self.degradation {
            DegradationMode::FailClosed => Err(CapacityDenied::ServiceUnavailable),
            DegradationMode::FailOpen => Ok(CapacityLease {
                request_id: req.request_id.clone(),
                model: req.model.clone(),
                reserved_tokens_per_sec_milli: self.fail_open_token_floor as i64 * 1000,
            }),
            DegradationMode::Cached => {
                if self.cached_snapshot.contains_key(&req.model) {
                    Ok(CapacityLease {
                        request_id: req.request_id.clone(),
                        model: req.model.clone(),
                        reserved_tokens_per_sec_milli: self.fail_open_token_floor as i64 * 1000,
                    })
                } else {
                    Err(CapacityDenied::ServiceUnavailable)
                }
            }
        }
    }

    /// Releases a lease, applying the delta between actual and estimated
    /// consumption. Idempotent per request id.
    pub fn release(&self, lease: &CapacityLease, actual_tokens: u64, actual_duration: Duration) {
        if self.released.insert(lease.request_id.clone(), ()).is_some() {
            return;
        }
        let Some(live) = self.models.get(&lease.model) else {
            return;
        };
        let secs = actual_duration.as_secs_f64().max(0.001);
        let actual_milli = ((actual_tokens as f64 / secs) * 1000.0) as i64;
        let delta = actual_milli - lease.reserved_tokens_per_sec_milli;

        let mut cur = live.tokens_per_sec_milli.load(Ordering::Acquire) as i64;
        loop {
            let next = (cur + delta).max(0);
            match live.tokens_per_sec_milli.compare_exchange(
                cur as u64,
                next as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed as i64,
            }
        }
        live.concurrent.fetch_sub(1, Ordering::AcqRel);
        live.requests_in_flight.fetch_sub(1, Ordering::AcqRel);
        self.cached_snapshot
            .insert(lease.model.clone(), live.snapshot(&lease.model));
    }

    pub fn snapshot(&self, model: &str) -> Option<CapacitySnapshot> {
        self.models.get(model).map(|l| l.snapshot(model))
    }

    pub fn all_snapshots(&self) -> Vec<CapacitySnapshot> {
        self.models.iter().map(|e| e.value().snapshot(e.key())).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityDenied {
    CapacityExceeded,
    ContextTooLarge,
    ServiceUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CapacityConfig {
        CapacityConfig {
            model_family: "gpt-4".into(),
            max_tokens_per_sec: 100.0,
            max_rps: 10.0,
            max_concurrent: 2,
            max_context_length: 8192,
        }
    }

    fn req(id: &str, tokens: u64) -> AcquireRequest {
        AcquireRequest {
            model: "gpt-4".into(),
            request_id: id.into(),
            estimated_tokens: tokens,
            estimated_duration: Duration::from_secs(1),
            estimated_context_length: 100,
        }
    }

    #[test]
    fn release_is_idempotent_and_restores_counters() {
        let mgr = CapacityManager::new(vec![cfg()], DegradationMode::FailClosed, 10);
        let lease = mgr.try_acquire(&req("1", 50), ProbeHealth::Healthy).unwrap();
        let before = mgr.snapshot("gpt-4").unwrap();
        assert_eq!(before.concurrent, 1);

        mgr.release(&lease, 50, Duration::from_secs(1));
        let after = mgr.snapshot("gpt-4").unwrap();
        assert_eq!(after.concurrent, 0);
        assert_eq!(after.tokens_per_sec, 0.0);

        // Duplicate release must not double-decrement.
        mgr.release(&lease, 50, Duration::from_secs(1));
        let still = mgr.snapshot("gpt-4").unwrap();
        assert_eq!(still.concurrent, 0);
    }

    #[test]
    fn admission_rejected_once_concurrency_exhausted() {
        let mgr = CapacityManager::new(vec![cfg()], DegradationMode::FailClosed, 10);
        let _l1 = mgr.try_acquire(&req("1", 1), ProbeHealth::Healthy).unwrap();
        let _l2 = mgr.try_acquire(&req("2", 1), ProbeHealth::Healthy).unwrap();
        let denied = mgr.try_acquire(&req("3", 1), ProbeHealth::Healthy);
        assert_eq!(denied.unwrap_err(), CapacityDenied::CapacityExceeded);
    }

    #[test]
    fn admission_rejected_once_rps_exhausted() {
        let mut low_rps = cfg();
        low_rps.max_rps = 1.0;
        low_rps.max_concurrent = 10;
        let mgr = CapacityManager::new(vec![low_rps], DegradationMode::FailClosed, 10);
        let _l1 = mgr.try_acquire(&req("1", 1), ProbeHealth::Healthy).unwrap();
        let denied = mgr.try_acquire(&req("2", 1), ProbeHealth::Healthy);
        assert_eq!(denied.unwrap_err(), CapacityDenied::CapacityExceeded);
    }

    #[test]
    fn fail_closed_degradation_refuses_new_admissions() {
        let mgr = CapacityManager::new(vec![cfg()], DegradationMode::FailClosed, 10);
        let denied = mgr.try_acquire(&req("1", 1), ProbeHealth::Unavailable);
        assert_eq!(denied.unwrap_err(), CapacityDenied::ServiceUnavailable);
    }
}
