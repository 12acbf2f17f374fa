//! Shared admission pipeline: classify -> quota reserve -> scheduler submit
//! -> capacity lease handoff. Every protocol handler (chat, responses,
//! messages) drives a request through the same sequence before calling
//! upstream, mirroring spec §4's fixed stage ordering.

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::GatewayError;
use crate::model::{AuthContext, GatewayRequest, QuotaKey, WindowTarget};
use crate::priority::classifier::ClassifyInput;
use crate::priority::scheduler::CancelHandle;
use crate::capacity::CapacityLease;
use crate::quota::hierarchy_keys;
use crate::state::AppState;

pub struct Admission {
    pub request_id: String,
    pub quota_keys: Vec<QuotaKey>,
    pub lease: CapacityLease,
    pub cancel: Option<CancelHandle>,
    pub started_at: Instant,
}

impl Admission {
    /// Releases capacity and unregisters from the active registry. Must be
    /// called exactly once per admitted request, on every exit path
    /// (success, upstream error, or cancellation).
    pub fn finish(&self, state: &AppState, actual_tokens: u64) {
        let elapsed = self.started_at.elapsed().max(Duration::from_millis(1));
        state.capacity.release(&self.lease, actual_tokens, elapsed);
        state.scheduler.complete(&self.request_id);
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn admit(
    state: &AppState,
    auth: &AuthContext,
    model: &str,
    environment: Option<&str>,
    tags: &[String],
    header_priority_override: Option<&str>,
    estimated_tokens: u64,
) -> Result<Admission, GatewayError> {
    let (priority, weight) = state
        .classifier
        .classify(ClassifyInput {
            auth,
            model,
            environment,
            tags,
            header_priority_override,
            workload_tag: tags.first().map(String::as_str),
        })
        .await?;

    let quota_keys = hierarchy_keys(&auth.account_id, auth.team_id.as_deref(), environment);
    let target = environment
        .map(|e| WindowTarget::Environment(e.to_string()))
        .unwrap_or(WindowTarget::All);
    let outcome = state
        .quota
        .check_and_reserve(&quota_keys, estimated_tokens as f64, &target)
        .await?;

    let request_id = Uuid::new_v4().to_string();
    let account_id = auth.account_id.clone();
    let team_id = auth.team_id.clone();
    let environment_owned = environment.map(str::to_string);
    let model_owned = model.to_string();
    let started_at = Instant::now();
    let queue_timeout = state.cfg.default_queue_timeout();

    let submit_result = {
        let request_id = request_id.clone();
        state
            .scheduler
            .submit(
                priority,
                environment,
                move |tx| GatewayRequest {
                    id: request_id.clone(),
                    priority,
                    weight,
                    estimated_tokens,
                    account_id: account_id.clone(),
                    team_id: team_id.clone(),
                    environment: environment_owned.clone(),
                    model: model_owned.clone(),
                    cancelable: true,
                    deadline: started_at + queue_timeout,
                    enqueued_at: started_at,
                    last_boosted_at: started_at,
                    result_tx: Some(tx),
                },
                queue_timeout,
            )
            .await
    };

    if let Err(err) = submit_result {
        state.quota.commit_usage(&outcome.reserved_keys, estimated_tokens as f64, 0.0).await;
        return Err(err);
    }

    let lease = state
        .pending_leases
        .remove(&request_id)
        .map(|(_, lease)| lease)
        .ok_or_else(|| GatewayError::Internal("admitted request has no capacity lease".into()))?;
    let cancel = state.scheduler.cancel_handle(&request_id);

    Ok(Admission {
        request_id,
        quota_keys: outcome.reserved_keys,
        lease,
        cancel,
        started_at,
    })
}
