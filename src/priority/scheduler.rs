//! Scheduler loop: strict / weighted-fair / hybrid dequeue, starvation
//! prevention, and preemption (spec §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::timeout;

use crate::error::GatewayError;
use crate::model::{AdmissionResult, GatewayRequest};
use crate::priority::queue::PriorityQueues;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    StrictPriority,
    WeightedFair,
    Hybrid,
}

/// Cooperative cancellation handle handed to an admitted request's task.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }

    fn fire(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct ActiveEntry {
    priority: u8,
    cancelable: bool,
    handle: CancelHandle,
}

/// Registry of currently-admitted requests, consulted by preemption.
pub struct ActiveRegistry {
    entries: DashMap<String, ActiveEntry>,
}

impl ActiveRegistry {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn register(&self, request_id: &str, priority: u8, cancelable: bool) -> CancelHandle {
        let handle = CancelHandle::new();
        self.entries.insert(
            request_id.to_string(),
            ActiveEntry {
                priority,
                cancelable,
                handle: handle.clone(),
            },
        );
        handle
    }

    pub fn unregister(&self, request_id: &str) {
        self.entries.remove(request_id);
    }

    pub fn handle_of(&self, request_id: &str) -> Option<CancelHandle> {
        self.entries.get(request_id).map(|e| e.handle.clone())
    }

    /// Selects and cancels the best preemption victim: among entries whose
    /// tier is in `preempt_priorities` and numerically greater (lower
    /// urgency) than `incoming_priority`, the one with the numerically
    /// largest priority. Returns whether a victim was found and cancelled.
    fn preempt_one(&self, incoming_priority: u8, preempt_priorities: &[u8]) -> bool {
        let mut victim: Option<(String, u8)> = None;
        for entry in self.entries.iter() {
            let e = entry.value();
            if !e.cancelable {
                continue;
            }
            if !preempt_priorities.contains(&e.priority) {
                continue;
            }
            if e.priority <= incoming_priority {
                continue;
            }
            if victim.as_ref().map(|(_, p)| e.priority > *p).unwrap_or(true) {
                victim = Some((entry.key().clone(), e.priority));
            }
        }
        if let Some((id, _)) = victim {
            if let Some(e) = self.entries.get(&id) {
                e.handle.fire();
            }
            self.entries.remove(&id);
            true
        } else {
            false
        }
    }
}

pub struct SchedulerConfig {
    pub policy: SchedulingPolicy,
    pub starvation_timeout: Option<Duration>,
    pub preemption_enabled: bool,
    pub preempt_priorities: Vec<u8>,
    pub queue_poll_interval: Duration,
}

/// Owns the queues, the active registry, and the background dequeue loop.
/// Cloneable handle passed to HTTP handlers to submit + await admission.
#[derive(Clone)]
pub struct SchedulerHandle {
    queues: Arc<PriorityQueues>,
    registry: Arc<ActiveRegistry>,
    config: Arc<SchedulerConfig>,
    /// Weighted-fair deficit counters, one per tier.
    deficits: Arc<Mutex<HashMap<u8, f64>>>,
}

impl SchedulerHandle {
    pub fn new(queues: Arc<PriorityQueues>, config: SchedulerConfig) -> Self {
        Self {
            queues,
            registry: Arc::new(ActiveRegistry::new()),
            config: Arc::new(config),
            deficits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active_registry(&self) -> Arc<ActiveRegistry> {
        self.registry.clone()
    }

    /// Looks up the cancel handle for a currently-admitted request, so a
    /// handler can select on it while awaiting the upstream response.
    pub fn cancel_handle(&self, request_id: &str) -> Option<CancelHandle> {
        self.registry.handle_of(request_id)
    }

    /// Unregisters a completed request from the active registry.
    pub fn complete(&self, request_id: &str) {
        self.registry.unregister(request_id);
    }

    /// Spawns the background dequeue loop. One call per process.
    pub fn spawn_loop<F>(&self, mut on_dequeue: F)
    where
        F: FnMut(GatewayRequest) + Send + 'static,
    {
        let queues = self.queues.clone();
        let config = self.config.clone();
        let deficits = self.deficits.clone();
        tokio::spawn(async move {
            loop {
                if let Some(req) = Self::dequeue_next(&queues, &config, &deficits).await {
                    on_dequeue(req);
                } else {
                    // Jitter the idle poll so many empty-queue workers don't
                    // all wake on the same tick.
                    let jitter_ms = rand::thread_rng().gen_range(0..=config.queue_poll_interval.as_millis() as u64 / 5);
                    tokio::time::sleep(config.queue_poll_interval + Duration::from_millis(jitter_ms)).await;
                }
            }
        });
    }

    async fn dequeue_next(
        queues: &Arc<PriorityQueues>,
        config: &Arc<SchedulerConfig>,
        deficits: &Arc<Mutex<HashMap<u8, f64>>>,
    ) -> Option<GatewayRequest> {
        match config.policy {
            SchedulingPolicy::StrictPriority => Self::dequeue_strict(queues).await,
            SchedulingPolicy::WeightedFair => Self::dequeue_weighted_fair(queues, deficits).await,
            SchedulingPolicy::Hybrid => {
                let levels = queues.tier_levels().await;
                if let Some(&tier0) = levels.first() {
                    if let Some(req) = queues.dequeue_tier(tier0).await {
                        return Some(req);
                    }
                }
                Self::dequeue_weighted_fair_excluding(queues, deficits, levels.first().copied())
                    .await
            }
        }
    }

    async fn dequeue_strict(queues: &Arc<PriorityQueues>) -> Option<GatewayRequest> {
        for tier in queues.tier_levels().await {
            if let Some(req) = queues.dequeue_tier(tier).await {
                return Some(req);
            }
        }
        None
    }

    async fn dequeue_weighted_fair(
        queues: &Arc<PriorityQueues>,
        deficits: &Arc<Mutex<HashMap<u8, f64>>>,
    ) -> Option<GatewayRequest> {
        Self::dequeue_weighted_fair_excluding(queues, deficits, None).await
    }

    async fn dequeue_weighted_fair_excluding(
        queues: &Arc<PriorityQueues>,
        deficits: &Arc<Mutex<HashMap<u8, f64>>>,
        exclude: Option<u8>,
    ) -> Option<GatewayRequest> {
        let levels: Vec<u8> = queues
            .tier_levels()
            .await
            .into_iter()
            .filter(|t| Some(*t) != exclude)
            .collect();
        if levels.is_empty() {
            return None;
        }

        let mut non_empty = Vec::new();
        for tier in &levels {
            if !queues.is_tier_empty(*tier).await {
                non_empty.push(*tier);
            }
        }
        if non_empty.is_empty() {
            return None;
        }

        let mut deficits = deficits.lock().await;
        for tier in &non_empty {
            let weight = queues.tier_weight(*tier).await as f64;
            *deficits.entry(*tier).or_insert(0.0) += weight;
        }

        let chosen = *non_empty
            .iter()
            .max_by(|a, b| {
                deficits
                    .get(a)
                    .unwrap_or(&0.0)
                    .partial_cmp(deficits.get(b).unwrap_or(&0.0))
                    .unwrap()
            })
            .unwrap();

        let req = queues.dequeue_tier(chosen).await;
        if let Some(req) = &req {
            let cost = req.cost_units();
            if let Some(d) = deficits.get_mut(&chosen) {
                *d -= cost;
            }
        }
        req
    }

    /// Submits a request for scheduling and blocks (up to its queue timeout)
    /// until the scheduler admits it, times it out, or preempts it.
    pub async fn submit(
        &self,
        tier: u8,
        env: Option<&str>,
        mut build: impl FnMut(oneshot::Sender<AdmissionResult>) -> GatewayRequest,
        queue_timeout: Duration,
    ) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        let req = build(tx);
        if let Err(_rejected) = self.queues.enqueue(tier, env, req).await {
            return Err(GatewayError::QueueFull);
        }

        match timeout(queue_timeout, rx).await {
            Ok(Ok(AdmissionResult::Admitted)) => Ok(()),
            Ok(Ok(AdmissionResult::Preempted)) => Err(GatewayError::ServiceUnavailable(
                "request preempted by higher-priority traffic".into(),
            )),
            Ok(Ok(AdmissionResult::CapacityExceeded)) => Err(GatewayError::CapacityExceeded),
            Ok(Ok(AdmissionResult::TimedOut)) | Ok(Err(_)) => Err(GatewayError::QueueTimeout),
            Ok(Ok(AdmissionResult::QueueFull)) => Err(GatewayError::QueueFull),
            Err(_) => Err(GatewayError::QueueTimeout),
        }
    }

    /// Attempts to free capacity for a new admission of `priority` by
    /// cancelling one eligible active victim. Returns true if a victim was
    /// cancelled.
    pub fn try_preempt_for(&self, priority: u8) -> bool {
        if !self.config.preemption_enabled {
            return false;
        }
        self.registry
            .preempt_one(priority, &self.config.preempt_priorities)
    }

    /// Spawns the background starvation-prevention task: every
    /// `starvation_timeout`, walks the queues and raises the tier of any
    /// request that has waited that long since it was enqueued or last
    /// boosted. A no-op if starvation prevention isn't configured.
    pub fn spawn_aging_loop(&self) {
        let Some(timeout) = self.config.starvation_timeout else {
            return;
        };
        let queues = self.queues.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;
                let boosted = queues.age_requests(timeout).await;
                if boosted > 0 {
                    tracing::debug!(boosted, "starvation prevention boosted queued requests");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PriorityQueueConfig;

    fn cfg(level: u8, weight: u32) -> PriorityQueueConfig {
        PriorityQueueConfig {
            level,
            name: format!("tier-{level}"),
            max_depth: 100,
            timeout: Duration::from_secs(30),
            weight,
            enable_subqueues: false,
        }
    }

    fn req(id: &str, tier: u8, tx: oneshot::Sender<AdmissionResult>) -> GatewayRequest {
        GatewayRequest {
            id: id.to_string(),
            priority: tier,
            weight: 1,
            estimated_tokens: 10,
            account_id: "a".into(),
            team_id: None,
            environment: None,
            model: "gpt-4".into(),
            cancelable: true,
            deadline: Instant::now() + Duration::from_secs(30),
            enqueued_at: Instant::now(),
            last_boosted_at: Instant::now(),
            result_tx: Some(tx),
        }
    }

    #[tokio::test]
    async fn strict_priority_dequeues_smallest_tier_first() {
        let queues = Arc::new(PriorityQueues::new(vec![cfg(0, 1), cfg(1, 1), cfg(3, 1)]));
        for (id, tier) in [("A", 3), ("B", 0), ("C", 3), ("D", 1)] {
            let (tx, _rx) = oneshot::channel();
            queues.enqueue(tier, None, req(id, tier, tx)).await.unwrap();
        }
        let mut order = vec![];
        for _ in 0..4 {
            if let Some(r) = SchedulerHandle::dequeue_strict(&queues).await {
                order.push(r.id);
            }
        }
        assert_eq!(order, vec!["B", "D", "A", "C"]);
    }

    #[test]
    fn preemption_picks_numerically_largest_eligible_priority() {
        let registry = ActiveRegistry::new();
        let _h1 = registry.register("low", 3, true);
        let _h2 = registry.register("mid", 2, true);
        let _h3 = registry.register("protected", 5, false);
        let preempted = registry.preempt_one(1, &[2, 3, 4]);
        assert!(preempted);
        assert!(registry.entries.get("low").is_none());
        assert!(registry.entries.get("mid").is_some());
    }
}
