//! Composition root: wires the scheduler, capacity manager, quota engine,
//! time-window manager, session table, ledger, and provider clients into
//! one `AppState` handed to every handler, following the teacher's
//! `AppState` shape in `main.rs` (a flat struct of `Arc`s passed through
//! `axum::extract::State`).

use std::sync::Arc;

use dashmap::DashMap;

use crate::auth::Authenticator;
use crate::capacity::{CapacityLease, CapacityManager};
use crate::config::AppConfig;
use crate::ledger::marketplace::MarketplaceReporter;
use crate::ledger::Ledger;
use crate::priority::classifier::PriorityClassifier;
use crate::priority::scheduler::SchedulerHandle;
use crate::priority::timewindow::TimeWindowManager;
use crate::provider::ProviderClients;
use crate::quota::QuotaEngine;
use crate::session::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub scheduler: SchedulerHandle,
    pub capacity: Arc<CapacityManager>,
    pub quota: Arc<QuotaEngine>,
    pub windows: Arc<TimeWindowManager>,
    pub classifier: Arc<PriorityClassifier>,
    pub sessions: Arc<SessionStore>,
    pub ledger: Arc<Ledger>,
    pub marketplace: Arc<dyn MarketplaceReporter>,
    pub providers: Arc<ProviderClients>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Capacity leases handed off from the scheduler's dequeue loop to the
    /// handler awaiting admission, keyed by request id. The dequeue loop
    /// performs capacity admission (spec §4.2 "Scheduler/Queue -> Capacity
    /// Admission" ordering) and leaves the lease here for the handler to
    /// release once the upstream call finishes.
    pub pending_leases: Arc<DashMap<String, CapacityLease>>,
}
