//! Time-window manager: cron/one-time schedules that override priority,
//! quota, and capacity at runtime (spec §4.5).

use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

use crate::model::{Schedule, TimeWindow, TimeWindowRule, WindowTarget};

/// Holds the current window set behind a swappable `Arc`-style snapshot
/// (spec §5: "Time-window rule set is swapped via atomic pointer
/// replacement"). We use `RwLock<Vec<_>>` rather than reaching for a new
/// crate, since reads are cheap clones and writes are rare (once-a-minute
/// recompute or an explicit reload call).
pub struct TimeWindowManager {
    windows: RwLock<Vec<TimeWindow>>,
}

impl TimeWindowManager {
    pub fn new(windows: Vec<TimeWindow>) -> Self {
        Self {
            windows: RwLock::new(windows),
        }
    }

    /// Replaces the entire window set atomically.
    pub fn reload(&self, windows: Vec<TimeWindow>) {
        let mut guard = self.windows.write().unwrap();
        *guard = windows;
    }

    fn is_active(window: &TimeWindow, now: DateTime<Utc>) -> bool {
        if !window.enabled {
            return false;
        }
        let duration = chrono::Duration::from_std(window.duration).unwrap_or(chrono::Duration::zero());
        match &window.schedule {
            Schedule::OneShot { start } => *start <= now && now < *start + duration,
            Schedule::Cron { expr } => {
                let Ok(schedule) = CronSchedule::from_str(expr) else {
                    return false;
                };
                let Some(most_recent) = schedule.after(&(now - duration)).take(1000).filter(|t| *t <= now).last()
                else {
                    return false;
                };
                now < most_recent + duration
            }
        }
    }

    /// Rules from currently-active windows that target `target`, most
    /// recently started window winning on overlap for the same target key
    /// (spec §3 invariant).
    fn active_rules_for(&self, target: &WindowTarget, now: DateTime<Utc>) -> Vec<TimeWindowRule> {
        let windows = self.windows.read().unwrap();
        let mut candidates: Vec<(DateTime<Utc>, &TimeWindow)> = Vec::new();
        for w in windows.iter() {
            if !Self::is_active(w, now) {
                continue;
            }
            let has_target = w
                .rules
                .iter()
                .any(|r| &r.target == target || matches!(r.target, WindowTarget::All));
            if !has_target {
                continue;
            }
            let start = Self::effective_start(w, now);
            candidates.push((start, w));
        }
        candidates.sort_by_key(|(start, _)| *start);
        // Most recently started wins: later in the sorted list overrides
        // earlier ones with the same rule target.
        let mut by_target_kind: std::collections::HashMap<bool, TimeWindowRule> = std::collections::HashMap::new();
        for (_, w) in candidates {
            for rule in &w.rules {
                if &rule.target == target {
                    by_target_kind.insert(true, rule.clone());
                } else if matches!(rule.target, WindowTarget::All) {
                    by_target_kind.entry(false).or_insert_with(|| rule.clone());
                }
            }
        }
        by_target_kind.into_values().collect()
    }

    fn effective_start(window: &TimeWindow, now: DateTime<Utc>) -> DateTime<Utc> {
        match &window.schedule {
            Schedule::OneShot { start } => *start,
            Schedule::Cron { expr } => {
                let duration = chrono::Duration::from_std(window.duration).unwrap_or(chrono::Duration::zero());
                CronSchedule::from_str(expr)
                    .ok()
                    .and_then(|s| s.after(&(now - duration)).take(1000).filter(|t| *t <= now).last())
                    .unwrap_or(now)
            }
        }
    }

    /// Applies active rules for `target` to the base priority, quota
    /// multiplier, and capacity multiplier. Quota and capacity multipliers
    /// scale the effective limit, never the stored used value (spec §4.4).
    pub async fn apply_priority_quota_capacity(
        &self,
        target: &WindowTarget,
        base_priority: u8,
        base_quota_multiplier: f64,
        base_capacity_multiplier: f64,
    ) -> (u8, f64, f64) {
        let now = Utc::now();
        let mut priority = base_priority as i16;
        let mut quota_mult = base_quota_multiplier;
        let mut capacity_mult = base_capacity_multiplier;

        for rule in self.active_rules_for(target, now) {
            if let Some(p) = rule.priority_override {
                priority = p as i16;
            }
            if let Some(d) = rule.priority_delta {
                priority += d as i16;
            }
            if let Some(m) = rule.quota_multiplier {
                quota_mult *= m;
            }
            if let Some(m) = rule.capacity_multiplier {
                capacity_mult *= m;
            }
        }

        (priority.clamp(0, 255) as u8, quota_mult, capacity_mult)
    }

    /// Weight/timeout/depth/cost multipliers for `target`, for callers that
    /// need the queue-shape overrides rather than priority/quota/capacity.
    pub fn queue_overrides_for(&self, target: &WindowTarget) -> QueueOverrides {
        let now = Utc::now();
        let mut out = QueueOverrides::default();
        for rule in self.active_rules_for(target, now) {
            if let Some(m) = rule.weight_multiplier {
                out.weight_multiplier *= m;
            }
            if let Some(m) = rule.queue_timeout_multiplier {
                out.timeout_multiplier *= m;
            }
            if let Some(m) = rule.queue_depth_multiplier {
                out.depth_multiplier *= m;
            }
            if let Some(m) = rule.cost_multiplier {
                out.cost_multiplier *= m;
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueOverrides {
    pub weight_multiplier: f64,
    pub timeout_multiplier: f64,
    pub depth_multiplier: f64,
    pub cost_multiplier: f64,
}

impl Default for QueueOverrides {
    fn default() -> Self {
        Self {
            weight_multiplier: 1.0,
            timeout_multiplier: 1.0,
            depth_multiplier: 1.0,
            cost_multiplier: 1.0,
        }
    }
}

/// Spawns the once-a-minute background recompute task named in spec §4.5.
/// The manager itself is stateless between ticks (every read recomputes
/// active windows), so this task exists only to give callers a predictable
/// place to hang reload-from-external-source logic; it is a no-op today.
pub fn spawn_minute_tick() -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            tracing::debug!("time-window minute tick");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn one_shot_window(target: WindowTarget, start_offset_secs: i64, duration_secs: u64, priority: u8) -> TimeWindow {
        TimeWindow {
            name: "promo".into(),
            enabled: true,
            schedule: Schedule::OneShot {
                start: Utc::now() + chrono::Duration::seconds(start_offset_secs),
            },
            duration: StdDuration::from_secs(duration_secs),
            rules: vec![TimeWindowRule {
                target,
                priority_override: Some(priority),
                priority_delta: None,
                quota_multiplier: None,
                capacity_multiplier: None,
                weight_multiplier: None,
                queue_timeout_multiplier: None,
                queue_depth_multiplier: None,
                cost_multiplier: None,
            }],
        }
    }

    #[tokio::test]
    async fn active_one_shot_window_overrides_priority() {
        let window = one_shot_window(WindowTarget::Environment("prod".into()), -5, 60, 0);
        let mgr = TimeWindowManager::new(vec![window]);
        let (priority, _, _) = mgr
            .apply_priority_quota_capacity(&WindowTarget::Environment("prod".into()), 5, 1.0, 1.0)
            .await;
        assert_eq!(priority, 0);
    }

    #[tokio::test]
    async fn expired_one_shot_window_has_no_effect() {
        let window = one_shot_window(WindowTarget::Environment("prod".into()), -120, 60, 0);
        let mgr = TimeWindowManager::new(vec![window]);
        let (priority, _, _) = mgr
            .apply_priority_quota_capacity(&WindowTarget::Environment("prod".into()), 5, 1.0, 1.0)
            .await;
        assert_eq!(priority, 5);
    }

    #[tokio::test]
    async fn disabled_window_never_applies() {
        let mut window = one_shot_window(WindowTarget::All, -5, 60, 0);
        window.enabled = false;
        let mgr = TimeWindowManager::new(vec![window]);
        let (priority, _, _) = mgr
            .apply_priority_quota_capacity(&WindowTarget::Environment("prod".into()), 5, 1.0, 1.0)
            .await;
        assert_eq!(priority, 5);
    }
}
