//! Core data model shared by the scheduler, quota engine, and translator.
//!
//! These types mirror the data model in the specification almost field for
//! field; they carry no behavior beyond small derived accessors.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

/// A single admitted-or-admitting request moving through the pipeline.
///
/// Created on ingress; mutated only by the scheduler (priority may be
/// boosted by time windows or queue aging); destroyed on completion or
/// timeout.
#[derive(Debug)]
pub struct GatewayRequest {
    pub id: String,
    pub priority: u8,
    pub weight: u32,
    pub estimated_tokens: u64,
    pub account_id: String,
    pub team_id: Option<String>,
    pub environment: Option<String>,
    pub model: String,
    pub cancelable: bool,
    pub deadline: Instant,
    pub enqueued_at: Instant,
    /// Last time this request's tier was raised by the starvation-prevention
    /// aging pass, or `enqueued_at` if it has never been boosted.
    pub last_boosted_at: Instant,
    /// Signals completion (or rejection) back to the HTTP handler awaiting
    /// admission. `None` once taken by the dequeueing worker.
    pub result_tx: Option<oneshot::Sender<AdmissionResult>>,
}

impl GatewayRequest {
    pub fn cost_units(&self) -> f64 {
        (self.estimated_tokens as f64 / 1000.0).max(1.0)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Outcome delivered to a queued request once the scheduler acts on it.
/// `QueueFull` is never sent over the channel (enqueue rejects synchronously)
/// but is kept here so the whole admission outcome space lives in one enum.
#[derive(Debug, Clone)]
pub enum AdmissionResult {
    Admitted,
    TimedOut,
    Preempted,
    CapacityExceeded,
    QueueFull,
}

/// Configuration and live state for one priority tier's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityQueueConfig {
    pub level: u8,
    pub name: String,
    pub max_depth: usize,
    pub timeout: Duration,
    pub weight: u32,
    pub enable_subqueues: bool,
}

/// Per-model capacity limits and live counters.
///
/// Invariant: counters never exceed configured maxima except transiently
/// during release; counters are monotone under a single reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    pub model_family: String,
    pub max_tokens_per_sec: f64,
    pub max_rps: f64,
    pub max_concurrent: u32,
    pub max_context_length: u32,
}

/// A snapshot of a capacity record's live counters, for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub model: String,
    pub tokens_per_sec: f64,
    pub concurrent: u32,
    pub max_tokens_per_sec: f64,
    pub max_concurrent: u32,
}

/// Kind of a hierarchical quota record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    Hard,
    Soft,
    Reserved,
    Burstable,
}

/// The unit a quota's limit is denominated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    TokensPerWindow,
    CurrencyPerWindow,
    TokensPerSecond,
}

/// Borrowing policy for a quota that may lend idle headroom to siblings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BorrowPolicy {
    pub allow_borrow: bool,
    pub max_borrow_fraction: f64,
}

impl Default for BorrowPolicy {
    fn default() -> Self {
        Self {
            allow_borrow: false,
            max_borrow_fraction: 0.0,
        }
    }
}

/// A hierarchical quota record keyed by (account, team?, environment?, window).
///
/// Invariants (spec §3): `used <= limit` for hard quotas; `used <= 1.2 *
/// limit` for soft quotas; a quota only lends when `borrow.allow_borrow` is
/// set, and never beyond `borrow.max_borrow_fraction` of the lender's idle
/// headroom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub key: QuotaKey,
    pub kind: QuotaKind,
    pub dimension: QuotaDimension,
    pub limit: f64,
    pub used: f64,
    pub borrow: BorrowPolicy,
    pub alert_fraction: f64,
    pub window_start: DateTime<Utc>,
    pub window: Duration,
}

impl QuotaRecord {
    pub fn soft_ceiling(&self) -> f64 {
        match self.kind {
            QuotaKind::Soft => self.limit * 1.2,
            _ => self.limit,
        }
    }

    pub fn idle_headroom(&self) -> f64 {
        (self.limit - self.used).max(0.0)
    }

    pub fn usage_fraction(&self) -> f64 {
        if self.limit <= 0.0 {
            return 1.0;
        }
        self.used / self.limit
    }
}

/// A hierarchy key: (account, team?, environment?).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaKey {
    pub account_id: String,
    pub team_id: Option<String>,
    pub environment: Option<String>,
}

impl QuotaKey {
    pub fn user_level(account_id: &str, environment: Option<&str>) -> Self {
        Self {
            account_id: account_id.to_string(),
            team_id: None,
            environment: environment.map(str::to_string),
        }
    }

    pub fn as_string(&self) -> String {
        format!(
            "{}:{}:{}",
            self.account_id,
            self.team_id.as_deref().unwrap_or("-"),
            self.environment.as_deref().unwrap_or("-")
        )
    }
}

/// A time-scheduled override of priority, quota, capacity, weight,
/// queue-timeout, queue-depth, or cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    pub name: String,
    pub enabled: bool,
    pub schedule: Schedule,
    pub duration: Duration,
    pub rules: Vec<TimeWindowRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Cron { expr: String },
    OneShot { start: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindowRule {
    pub target: WindowTarget,
    pub priority_override: Option<u8>,
    pub priority_delta: Option<i8>,
    pub quota_multiplier: Option<f64>,
    pub capacity_multiplier: Option<f64>,
    pub weight_multiplier: Option<f64>,
    pub queue_timeout_multiplier: Option<f64>,
    pub queue_depth_multiplier: Option<f64>,
    pub cost_multiplier: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WindowTarget {
    Environment(String),
    AccountTier(u8),
    WorkloadTag(String),
    All,
}

/// Server-side state preserving a Responses tool-use loop across requests.
pub struct ResponseSession {
    pub id: String,
    pub adapter: String,
    pub base_model: String,
    pub history: Vec<crate::translate::unified::UnifiedMessage>,
    pub tools: Vec<crate::translate::unified::UnifiedTool>,
    pub outstanding_tool_call_ids: Vec<String>,
    pub output_tx: Option<oneshot::Sender<ToolOutputs>>,
    pub created_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ToolOutputs {
    pub messages: Vec<crate::translate::unified::UnifiedMessage>,
}

impl ResponseSession {
    pub fn new_id() -> String {
        format!("resp_sess_{}", Uuid::new_v4().simple())
    }
}

/// Direction of a ledger movement: the caller's own consumption, or capacity
/// the caller's org is supplying back to the marketplace pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerDirection {
    Consume,
    Supply,
}

/// An append-only usage record. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user_id: String,
    pub api_key_id: String,
    pub service_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub direction: LedgerDirection,
    pub memo: String,
    pub recorded_at: DateTime<Utc>,
}

/// Per-request token accounting gathered from the upstream response (or
/// approximated) and fed into both the ledger and `CommitUsage`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// `chars/4 + 1` fallback approximation (spec §4.9) when the upstream
    /// did not report usage.
    pub fn approximate(prompt_chars: usize, completion_chars: usize) -> Self {
        Self {
            prompt_tokens: (prompt_chars / 4) as u64 + 1,
            completion_tokens: (completion_chars / 4) as u64 + 1,
        }
    }
}

/// Authenticated request context produced by the (out-of-scope) identity
/// service and consumed by the classifier, quota engine, and handlers.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub account_id: String,
    pub team_id: Option<String>,
    pub api_key_id: String,
    pub is_admin: bool,
    pub account_tier: u8,
}

/// Convenience map of string tag -> string value attached to a request for
/// workload-tag time-window targeting.
pub type Tags = HashMap<String, String>;
