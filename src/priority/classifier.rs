//! Priority classifier (spec §4.1).
//!
//! Applies an ordered rule list to each request: first match wins, default
//! priority applies if none match. Explicit `X-Priority` header overrides are
//! honored only for admin credentials under a 10-per-minute-per-account cap.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::GatewayError;
use crate::model::AuthContext;
use crate::priority::timewindow::TimeWindowManager;

const OVERRIDE_WINDOW: Duration = Duration::from_secs(60);
const OVERRIDE_MAX_USES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RuleCondition {
    Environment(String),
    AccountTier(u8),
    Model(String),
    Tag(String),
    Header { name: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub condition: RuleCondition,
    pub priority: u8,
    pub weight: u32,
}

/// Inputs available to the classifier for one incoming request.
pub struct ClassifyInput<'a> {
    pub auth: &'a AuthContext,
    pub model: &'a str,
    pub environment: Option<&'a str>,
    pub tags: &'a [String],
    pub header_priority_override: Option<&'a str>,
    pub workload_tag: Option<&'a str>,
}

pub struct PriorityClassifier {
    rules: Vec<ClassifierRule>,
    default_priority: u8,
    default_weight: u32,
    window: Arc<TimeWindowManager>,
    /// account_id -> recent override timestamps, for the 10/min cap.
    override_uses: Mutex<std::collections::HashMap<String, VecDeque<Instant>>>,
}

impl PriorityClassifier {
    pub fn new(
        rules: Vec<ClassifierRule>,
        default_priority: u8,
        default_weight: u32,
        window: Arc<TimeWindowManager>,
    ) -> Self {
        Self {
            rules,
            default_priority,
            default_weight,
            window,
            override_uses: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn matches(rule: &RuleCondition, input: &ClassifyInput<'_>) -> bool {
        match rule {
            RuleCondition::Environment(env) => input.environment == Some(env.as_str()),
            RuleCondition::AccountTier(tier) => input.auth.account_tier == *tier,
            RuleCondition::Model(model) => input.model == model,
            RuleCondition::Tag(tag) => input.tags.iter().any(|t| t == tag),
            RuleCondition::Header { name, value } => {
                // Header matching proper happens at the HTTP layer; here we
                // only compare against the already-extracted override value
                // for the well-known `X-Request-Class` condition.
                name.eq_ignore_ascii_case("x-request-class")
                    && input.tags.iter().any(|t| t == value)
            }
        }
    }

    async fn record_and_check_override_budget(&self, account_id: &str) -> bool {
        let mut uses = self.override_uses.lock().await;
        let now = Instant::now();
        let entry = uses.entry(account_id.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) > OVERRIDE_WINDOW {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() >= OVERRIDE_MAX_USES {
            return false;
        }
        entry.push_back(now);
        true
    }

    /// Classify one request, returning `(priority, weight)`.
    ///
    /// Fails with `unauthorized` only when a non-admin caller requests
    /// `critical` via `X-Priority`; otherwise never fails.
    pub async fn classify(&self, input: ClassifyInput<'_>) -> Result<(u8, u32), GatewayError> {
        let mut priority = self.default_priority;
        let mut weight = self.default_weight;

        for rule in &self.rules {
            if Self::matches(&rule.condition, &input) {
                priority = rule.priority;
                weight = rule.weight;
                break;
            }
        }

        if let Some(raw) = input.header_priority_override {
            let is_critical = raw.eq_ignore_ascii_case("critical") || raw == "0";
            if is_critical {
                if !input.auth.is_admin {
                    return Err(GatewayError::Unauthorized);
                }
                if !self
                    .record_and_check_override_budget(&input.auth.account_id)
                    .await
                {
                    return Err(GatewayError::RateLimited(
                        "priority override quota exhausted".into(),
                    ));
                }
                priority = 0;
            } else if let Ok(p) = raw.parse::<u8>() {
                if input.auth.is_admin {
                    priority = p;
                }
            }
        }

        let target = input
            .environment
            .map(|e| crate::model::WindowTarget::Environment(e.to_string()))
            .unwrap_or(crate::model::WindowTarget::All);
        let (adj_priority, _quota_mult, _cap_mult) = self
            .window
            .apply_priority_quota_capacity(&target, priority, 1.0, 1.0)
            .await;

        Ok((adj_priority, weight))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::timewindow::TimeWindowManager;

    fn auth(is_admin: bool) -> AuthContext {
        AuthContext {
            account_id: "acct-1".into(),
            team_id: None,
            api_key_id: "key-1".into(),
            is_admin,
            account_tier: 1,
        }
    }

    #[tokio::test]
    async fn default_priority_applies_when_no_rule_matches() {
        let classifier = PriorityClassifier::new(
            vec![],
            5,
            1,
            Arc::new(TimeWindowManager::new(vec![])),
        );
        let a = auth(false);
        let (p, w) = classifier
            .classify(ClassifyInput {
                auth: &a,
                model: "gpt-4",
                environment: None,
                tags: &[],
                header_priority_override: None,
                workload_tag: None,
            })
            .await
            .unwrap();
        assert_eq!(p, 5);
        assert_eq!(w, 1);
    }

    #[tokio::test]
    async fn non_admin_critical_override_is_rejected() {
        let classifier = PriorityClassifier::new(
            vec![],
            5,
            1,
            Arc::new(TimeWindowManager::new(vec![])),
        );
        let a = auth(false);
        let res = classifier
            .classify(ClassifyInput {
                auth: &a,
                model: "gpt-4",
                environment: None,
                tags: &[],
                header_priority_override: Some("critical"),
                workload_tag: None,
            })
            .await;
        assert!(matches!(res, Err(GatewayError::Unauthorized)));
    }

    #[tokio::test]
    async fn admin_critical_override_is_capped_at_ten_per_minute() {
        let classifier = PriorityClassifier::new(
            vec![],
            5,
            1,
            Arc::new(TimeWindowManager::new(vec![])),
        );
        let a = auth(true);
        for _ in 0..10 {
            let (p, _) = classifier
                .classify(ClassifyInput {
                    auth: &a,
                    model: "gpt-4",
                    environment: None,
                    tags: &[],
                    header_priority_override: Some("critical"),
                    workload_tag: None,
                })
                .await
                .unwrap();
            assert_eq!(p, 0);
        }
        let res = classifier
            .classify(ClassifyInput {
                auth: &a,
                model: "gpt-4",
                environment: None,
                tags: &[],
                header_priority_override: Some("critical"),
                workload_tag: None,
            })
            .await;
        assert!(matches!(res, Err(GatewayError::RateLimited(_))));
    }
}
