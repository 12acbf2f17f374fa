//! Environment-driven configuration (spec §9). Flat scalars follow the
//! teacher's `std::env::var` + typed-default pattern; the nested structures
//! the scheduler/quota/capacity/time-window layers need (routes, tiers,
//! classifier rules, capacity limits, quota seeds, time windows, static API
//! keys) are supplied as a JSON array in a single env var each, parsed with
//! the same "missing or invalid -> default" tolerance the teacher's
//! `parse_tenant_quotas` uses for its flat `key=value` form.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use governor::middleware::NoOpMiddleware;
use http::Request;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tower_governor::{
    errors::GovernorError, governor::GovernorConfigBuilder, key_extractor::KeyExtractor,
    GovernorLayer,
};

use crate::capacity::DegradationMode;
use crate::model::{AuthContext, CapacityConfig, PriorityQueueConfig, QuotaRecord, TimeWindow};
use crate::priority::classifier::ClassifierRule;
use crate::priority::scheduler::{SchedulerConfig, SchedulingPolicy};
use crate::provider::ModelRoute;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    pub openai_api_key: String,
    pub openai_base_url: Option<String>,
    pub anthropic_api_key: String,
    pub anthropic_base_url: Option<String>,

    // rate limit (outer HTTP-layer throttle; the scheduler/capacity layers
    // below do the spec's own admission control, this is just a blunt
    // per-key floor in front of them)
    pub rps: u32,
    pub burst: u32,

    // redis + quotas
    pub redis_url: Option<String>,
    pub quota_records: Vec<QuotaRecord>,
    pub alert_webhook: Option<String>,

    // static bearer auth
    pub static_api_keys: Vec<StaticApiKey>,

    // model routing
    pub model_routes: Vec<ModelRoute>,

    // priority classifier + tiers
    pub classifier_rules: Vec<ClassifierRule>,
    pub default_priority: u8,
    pub default_weight: u32,
    pub priority_tiers: Vec<PriorityQueueConfig>,

    // scheduler
    pub scheduling_policy: SchedulingPolicy,
    pub starvation_timeout_secs: Option<u64>,
    pub preemption_enabled: bool,
    pub preempt_priorities: Vec<u8>,
    pub queue_poll_interval_ms: u64,
    pub queue_timeout_secs: u64,

    // capacity
    pub capacity_configs: Vec<CapacityConfig>,
    pub degradation_mode: DegradationMode,
    pub fail_open_token_floor: u64,

    // time windows
    pub time_windows: Vec<TimeWindow>,

    // circuit-breaker lite
    pub timeout_secs: Option<u64>,
    pub max_concurrency: Option<usize>,

    // telemetry
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticApiKey {
    pub token: String,
    pub account_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    pub api_key_id: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default = "default_account_tier")]
    pub account_tier: u8,
}

fn default_account_tier() -> u8 {
    1
}

fn default_rps() -> u32 {
    5
}
fn default_burst() -> u32 {
    10
}

fn default_priority() -> u8 {
    5
}
fn default_weight() -> u32 {
    1
}

fn default_scheduling_policy() -> SchedulingPolicy {
    SchedulingPolicy::WeightedFair
}
fn default_preemption_enabled() -> bool {
    true
}
fn default_queue_poll_interval_ms() -> u64 {
    10
}
fn default_queue_timeout_secs() -> u64 {
    30
}

fn default_degradation_mode() -> DegradationMode {
    DegradationMode::FailOpen
}
fn default_fail_open_token_floor() -> u64 {
    1_000
}

fn default_service_name() -> String {
    "llm-gateway".to_string()
}

fn default_model_routes() -> Vec<ModelRoute> {
    vec![ModelRoute {
        pattern: "*".into(),
        adapter: crate::provider::UpstreamAdapter::OpenAI,
    }]
}

fn default_priority_tiers() -> Vec<PriorityQueueConfig> {
    vec![
        PriorityQueueConfig {
            level: 0,
            name: "interactive".into(),
            max_depth: 1_000,
            timeout: Duration::from_secs(30),
            weight: 4,
            enable_subqueues: false,
        },
        PriorityQueueConfig {
            level: 5,
            name: "standard".into(),
            max_depth: 5_000,
            timeout: Duration::from_secs(60),
            weight: 2,
            enable_subqueues: false,
        },
        PriorityQueueConfig {
            level: 9,
            name: "batch".into(),
            max_depth: 20_000,
            timeout: Duration::from_secs(300),
            weight: 1,
            enable_subqueues: false,
        },
    ]
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let openai_api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let openai_base_url = std::env::var("OPENAI_BASE_URL").ok();
        let anthropic_api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
        let anthropic_base_url = std::env::var("ANTHROPIC_BASE_URL").ok();

        let rps = env_parsed("RPS").unwrap_or_else(default_rps);
        let burst = env_parsed("BURST").unwrap_or_else(default_burst);

        let redis_url = std::env::var("REDIS_URL").ok();
        let quota_records = parse_json_env("QUOTA_RECORDS").unwrap_or_default();
        let alert_webhook = std::env::var("QUOTA_ALERT_WEBHOOK").ok();

        let static_api_keys = parse_json_env("STATIC_API_KEYS").unwrap_or_default();

        let model_routes = parse_json_env("MODEL_ROUTES").unwrap_or_else(default_model_routes);

        let classifier_rules = parse_json_env("CLASSIFIER_RULES").unwrap_or_default();
        let default_priority = env_parsed("DEFAULT_PRIORITY").unwrap_or_else(default_priority);
        let default_weight = env_parsed("DEFAULT_WEIGHT").unwrap_or_else(default_weight);
        let priority_tiers = parse_json_env("PRIORITY_TIERS").unwrap_or_else(default_priority_tiers);

        let scheduling_policy = std::env::var("SCHEDULING_POLICY")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "strict_priority" | "strict" => Some(SchedulingPolicy::StrictPriority),
                "weighted_fair" | "weighted" => Some(SchedulingPolicy::WeightedFair),
                "hybrid" => Some(SchedulingPolicy::Hybrid),
                _ => None,
            })
            .unwrap_or_else(default_scheduling_policy);
        let starvation_timeout_secs = env_parsed("STARVATION_TIMEOUT_SECS");
        let preemption_enabled = env_parsed("PREEMPTION_ENABLED").unwrap_or_else(default_preemption_enabled);
        let preempt_priorities = std::env::var("PREEMPT_PRIORITIES")
            .ok()
            .map(|s| s.split(',').filter_map(|v| v.trim().parse().ok()).collect())
            .unwrap_or_default();
        let queue_poll_interval_ms =
            env_parsed("QUEUE_POLL_INTERVAL_MS").unwrap_or_else(default_queue_poll_interval_ms);
        let queue_timeout_secs = env_parsed("QUEUE_TIMEOUT_SECS").unwrap_or_else(default_queue_timeout_secs);

        let capacity_configs = parse_json_env("CAPACITY_CONFIGS").unwrap_or_default();
        let degradation_mode = std::env::var("DEGRADATION_MODE")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "fail_open" => Some(DegradationMode::FailOpen),
                "fail_closed" => Some(DegradationMode::FailClosed),
                "cached" => Some(DegradationMode::Cached),
                _ => None,
            })
            .unwrap_or_else(default_degradation_mode);
        let fail_open_token_floor = env_parsed("FAIL_OPEN_TOKEN_FLOOR").unwrap_or_else(default_fail_open_token_floor);

        let time_windows = parse_json_env("TIME_WINDOWS").unwrap_or_default();

        let timeout_secs = env_parsed("TIMEOUT_SECS");
        let max_concurrency = env_parsed("MAX_CONCURRENCY");

        let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
        let service_name = std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service_name());

        Ok(Self {
            listen_addr,
            openai_api_key,
            openai_base_url,
            anthropic_api_key,
            anthropic_base_url,
            rps,
            burst,
            redis_url,
            quota_records,
            alert_webhook,
            static_api_keys,
            model_routes,
            classifier_rules,
            default_priority,
            default_weight,
            priority_tiers,
            scheduling_policy,
            starvation_timeout_secs,
            preemption_enabled,
            preempt_priorities,
            queue_poll_interval_ms,
            queue_timeout_secs,
            capacity_configs,
            degradation_mode,
            fail_open_token_floor,
            time_windows,
            timeout_secs,
            max_concurrency,
            otlp_endpoint,
            service_name,
        })
    }

    pub fn model_routes(&self) -> &[ModelRoute] {
        &self.model_routes
    }

    pub fn default_queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            policy: self.scheduling_policy,
            starvation_timeout: self.starvation_timeout_secs.map(Duration::from_secs),
            preemption_enabled: self.preemption_enabled,
            preempt_priorities: self.preempt_priorities.clone(),
            queue_poll_interval: Duration::from_millis(self.queue_poll_interval_ms),
        }
    }

    pub fn static_auth_keys(&self) -> HashMap<String, AuthContext> {
        self.static_api_keys
            .iter()
            .map(|k| {
                (
                    k.token.clone(),
                    AuthContext {
                        account_id: k.account_id.clone(),
                        team_id: k.team_id.clone(),
                        api_key_id: k.api_key_id.clone(),
                        is_admin: k.is_admin,
                        account_tier: k.account_tier,
                    },
                )
            })
            .collect()
    }

    pub fn build_governor(&self) -> anyhow::Result<GovernorLayer<ApiKeyExtractor, NoOpMiddleware>> {
        if self.rps == 0 {
            anyhow::bail!("RPS must be greater than zero");
        }
        if self.burst == 0 {
            anyhow::bail!("BURST must be greater than zero");
        }

        let mut builder = GovernorConfigBuilder::default();
        let mut builder = builder.key_extractor(ApiKeyExtractor);
        builder.period(Duration::from_secs(1) / self.rps);
        builder.burst_size(self.burst);

        let config = builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid governor configuration"))?;

        Ok(GovernorLayer {
            config: Arc::new(config),
        })
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parses a JSON array out of the named env var, tolerating absence or
/// malformed content the same way the teacher's flat parsers tolerate a
/// missing/garbled `TENANT_QUOTAS` value: log and fall back to the caller's
/// default rather than failing startup.
fn parse_json_env<T: DeserializeOwned>(name: &str) -> Option<Vec<T>> {
    let raw = std::env::var(name).ok()?;
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(err) => {
            tracing::warn!(env = name, error = %err, "ignoring malformed JSON env var");
            None
        }
    }
}

#[derive(Clone, Copy)]
pub struct ApiKeyExtractor;

impl KeyExtractor for ApiKeyExtractor {
    type Key = String;

    fn extract<B>(&self, req: &Request<B>) -> Result<Self::Key, GovernorError> {
        // Use X-Api-Key header if present, otherwise fall back to client IP+path
        if let Some(k) = req.headers().get("x-api-key") {
            if let Ok(s) = k.to_str() {
                if !s.is_empty() {
                    return Ok(format!("key:{s}"));
                }
            }
        }
        let ip = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");
        let path = req.uri().path();
        Ok(format!("ip:{ip}:{path}"))
    }
}
