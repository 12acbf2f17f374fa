//! Bounded per-tier priority queues with optional environment sub-queues
//! (spec §3 `Priority Queue`, §4.2 enqueue/dequeue).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::model::{AdmissionResult, GatewayRequest, PriorityQueueConfig};

/// One tier's live FIFO state. When sub-queues are enabled, `current_depth`
/// equals the sum of all sub-queue depths (spec invariant).
struct TierQueue {
    config: PriorityQueueConfig,
    main: VecDeque<GatewayRequest>,
    subqueues: Option<HashMap<String, VecDeque<GatewayRequest>>>,
}

impl TierQueue {
    fn new(config: PriorityQueueConfig) -> Self {
        let subqueues = config.enable_subqueues.then(HashMap::new);
        Self {
            config,
            main: VecDeque::new(),
            subqueues,
        }
    }

    fn depth(&self) -> usize {
        match &self.subqueues {
            Some(subs) => subs.values().map(|q| q.len()).sum(),
            None => self.main.len(),
        }
    }

    fn push(&mut self, env: Option<&str>, req: GatewayRequest) {
        match (&mut self.subqueues, env) {
            (Some(subs), Some(env)) => {
                subs.entry(env.to_string()).or_default().push_back(req);
            }
            _ => self.main.push_back(req),
        }
    }

    /// Pops the oldest non-expired request from this tier, preferring
    /// round-robin across sub-queues when enabled. Expired entries are
    /// dropped (counted by the caller) and the scan continues.
    fn pop_front_non_expired(&mut self, now: Instant, timeouts: &mut usize) -> Option<GatewayRequest> {
        if let Some(subs) = &mut self.subqueues {
            loop {
                let mut found = None;
                for (_, q) in subs.iter_mut() {
                    if let Some(front) = q.front() {
                        if front.is_expired(now) {
                            let expired = q.pop_front().unwrap();
                            Self::notify(expired, AdmissionResult::TimedOut);
                            *timeouts += 1;
                            found = Some(());
                            break;
                        }
                    }
                }
                if found.is_some() {
                    continue;
                }
                // No expired entries remain up front; pop the first
                // non-empty sub-queue's head.
                for (_, q) in subs.iter_mut() {
                    if let Some(req) = q.pop_front() {
                        return Some(req);
                    }
                }
                return None;
            }
        } else {
            loop {
                let front_expired = self.main.front().map(|r| r.is_expired(now)).unwrap_or(false);
                if front_expired {
                    let expired = self.main.pop_front().unwrap();
                    Self::notify(expired, AdmissionResult::TimedOut);
                    *timeouts += 1;
                    continue;
                }
                return self.main.pop_front();
            }
        }
    }

    fn notify(mut req: GatewayRequest, result: AdmissionResult) {
        if let Some(tx) = req.result_tx.take() {
            let _ = tx.send(result);
        }
    }

    /// Drains every request that has waited at least `timeout` since it was
    /// last boosted, preserving the sub-queue (if any) each came from.
    fn drain_aged(&mut self, now: Instant, timeout: Duration) -> Vec<(Option<String>, GatewayRequest)> {
        let mut aged = Vec::new();
        if let Some(subs) = &mut self.subqueues {
            for (env, q) in subs.iter_mut() {
                let mut keep = VecDeque::new();
                while let Some(req) = q.pop_front() {
                    if now.duration_since(req.last_boosted_at) >= timeout {
                        aged.push((Some(env.clone()), req));
                    } else {
                        keep.push_back(req);
                    }
                }
                *q = keep;
            }
        } else {
            let mut keep = VecDeque::new();
            while let Some(req) = self.main.pop_front() {
                if now.duration_since(req.last_boosted_at) >= timeout {
                    aged.push((None, req));
                } else {
                    keep.push_back(req);
                }
            }
            self.main = keep;
        }
        aged
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub depth_by_tier: HashMap<u8, usize>,
    pub timeouts_by_tier: HashMap<u8, usize>,
}

/// The full set of priority tiers, guarded by one mutex per invariant in
/// spec §5 ("counters mutated only through... a single-writer" — here the
/// single writer is whichever task holds the lock for the duration of one
/// enqueue/dequeue call; no upstream I/O is ever performed while holding it).
pub struct PriorityQueues {
    tiers: Mutex<Vec<TierQueue>>,
}

impl PriorityQueues {
    pub fn new(configs: Vec<PriorityQueueConfig>) -> Self {
        let mut tiers: Vec<TierQueue> = configs.into_iter().map(TierQueue::new).collect();
        tiers.sort_by_key(|t| t.config.level);
        Self {
            tiers: Mutex::new(tiers),
        }
    }

    pub async fn enqueue(
        &self,
        tier: u8,
        env: Option<&str>,
        mut req: GatewayRequest,
    ) -> Result<(), GatewayRequest> {
        let mut tiers = self.tiers.lock().await;
        let Some(q) = tiers.iter_mut().find(|t| t.config.level == tier) else {
            return Err(req);
        };
        if q.depth() >= q.config.max_depth {
            return Err(req);
        }
        req.deadline = req.enqueued_at + q.config.timeout;
        q.push(env, req);
        Ok(())
    }

    /// Pops the next eligible request from the given tier only (used by
    /// strict-priority and hybrid scheduling).
    pub async fn dequeue_tier(&self, tier: u8) -> Option<GatewayRequest> {
        let mut tiers = self.tiers.lock().await;
        let now = Instant::now();
        let q = tiers.iter_mut().find(|t| t.config.level == tier)?;
        let mut timeouts = 0usize;
        let result = q.pop_front_non_expired(now, &mut timeouts);
        result
    }

    pub async fn is_tier_empty(&self, tier: u8) -> bool {
        let tiers = self.tiers.lock().await;
        tiers
            .iter()
            .find(|t| t.config.level == tier)
            .map(|t| t.depth() == 0)
            .unwrap_or(true)
    }

    pub async fn tier_levels(&self) -> Vec<u8> {
        let tiers = self.tiers.lock().await;
        tiers.iter().map(|t| t.config.level).collect()
    }

    pub async fn tier_weight(&self, tier: u8) -> u32 {
        let tiers = self.tiers.lock().await;
        tiers
            .iter()
            .find(|t| t.config.level == tier)
            .map(|t| t.config.weight)
            .unwrap_or(1)
    }

    /// Starvation prevention (spec §4.2): any request that has waited at
    /// least `starvation_timeout` since it was enqueued or last boosted has
    /// its tier raised by one level. Tier 0 (the highest-priority, lowest
    /// numbered level) never ages further. Returns the number of requests
    /// boosted.
    pub async fn age_requests(&self, starvation_timeout: Duration) -> usize {
        let mut tiers = self.tiers.lock().await;
        let now = Instant::now();
        let mut boosted = 0usize;
        for idx in (1..tiers.len()).rev() {
            let aged = tiers[idx].drain_aged(now, starvation_timeout);
            for (env, mut req) in aged {
                let target_level = tiers[idx - 1].config.level;
                if tiers[idx - 1].depth() < tiers[idx - 1].config.max_depth {
                    req.priority = target_level;
                    req.last_boosted_at = now;
                    tiers[idx - 1].push(env.as_deref(), req);
                    boosted += 1;
                } else {
                    // Target tier is full; leave queued where it is and
                    // retry on the next aging pass.
                    tiers[idx].push(env.as_deref(), req);
                }
            }
        }
        boosted
    }

    pub async fn stats(&self) -> QueueStats {
        let tiers = self.tiers.lock().await;
        let mut stats = QueueStats::default();
        for t in tiers.iter() {
            stats.depth_by_tier.insert(t.config.level, t.depth());
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn make_req(id: &str, tier: u8) -> (GatewayRequest, oneshot::Receiver<AdmissionResult>) {
        let (tx, rx) = oneshot::channel();
        let req = GatewayRequest {
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
        };
        (req, rx)
    }

    fn cfg(level: u8, max_depth: usize) -> PriorityQueueConfig {
        PriorityQueueConfig {
            level,
            name: format!("tier-{level}"),
            max_depth,
            timeout: Duration::from_secs(30),
            weight: 1,
            enable_subqueues: false,
        }
    }

    #[tokio::test]
    async fn queue_full_is_rejected_and_existing_entries_remain_dequeueable() {
        let queues = PriorityQueues::new(vec![cfg(2, 2)]);
        let (r1, _rx1) = make_req("1", 2);
        let (r2, _rx2) = make_req("2", 2);
        let (r3, _rx3) = make_req("3", 2);
        queues.enqueue(2, None, r1).await.unwrap();
        queues.enqueue(2, None, r2).await.unwrap();
        let rejected = queues.enqueue(2, None, r3).await;
        assert!(rejected.is_err());

        let first = queues.dequeue_tier(2).await.unwrap();
        assert_eq!(first.id, "1");
        let second = queues.dequeue_tier(2).await.unwrap();
        assert_eq!(second.id, "2");
        assert!(queues.dequeue_tier(2).await.is_none());
    }

    #[tokio::test]
    async fn fifo_order_within_one_tier() {
        let queues = PriorityQueues::new(vec![cfg(0, 10)]);
        for id in ["a", "b", "c"] {
            let (r, _rx) = make_req(id, 0);
            queues.enqueue(0, None, r).await.unwrap();
        }
        let mut order = vec![];
        while let Some(r) = queues.dequeue_tier(0).await {
            order.push(r.id);
        }
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
