use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{error_handling::HandleErrorLayer, routing::get, BoxError, Router};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::signal;
use tower::{
    limit::GlobalConcurrencyLimitLayer, load_shed::LoadShedLayer, timeout::TimeoutLayer,
    ServiceBuilder,
};
use tower_http::trace::TraceLayer;
use tracing::info;

mod auth;
mod capacity;
mod config;
mod error;
mod handlers;
mod ledger;
mod model;
mod priority;
mod provider;
mod quota;
mod redact;
mod session;
mod state;
mod telemetry;
mod translate;

use crate::auth::StaticBearerAuthenticator;
use crate::capacity::{AcquireRequest, CapacityManager, ProbeHealth};
use crate::config::AppConfig;
use crate::ledger::marketplace::{MarketplaceReporter, NullReporter, WebhookReporter};
use crate::ledger::{InMemoryLedger, Ledger};
use crate::model::AdmissionResult;
use crate::priority::classifier::PriorityClassifier;
use crate::priority::queue::PriorityQueues;
use crate::priority::scheduler::SchedulerHandle;
use crate::priority::timewindow::TimeWindowManager;
use crate::provider::anthropic::AnthropicProvider;
use crate::provider::openai::OpenAIProvider;
use crate::provider::ProviderClients;
use crate::quota::store::{CounterStore, InProcessCounterStore, RedisCounterStore};
use crate::quota::QuotaEngine;
use crate::session::SessionStore;
use crate::state::AppState;
use crate::telemetry::{init_metrics, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = AppConfig::from_env()?;
    init_tracing(&cfg);
    let metrics_handle = init_metrics()?;

    let windows = Arc::new(TimeWindowManager::new(cfg.time_windows.clone()));
    let classifier = Arc::new(PriorityClassifier::new(
        cfg.classifier_rules.clone(),
        cfg.default_priority,
        cfg.default_weight,
        windows.clone(),
    ));

    let queues = Arc::new(PriorityQueues::new(cfg.priority_tiers.clone()));
    let scheduler = SchedulerHandle::new(queues, cfg.scheduler_config());

    let capacity = Arc::new(CapacityManager::new(
        cfg.capacity_configs.clone(),
        cfg.degradation_mode,
        cfg.fail_open_token_floor,
    ));

    let store: Arc<dyn CounterStore> = match cfg.redis_url.as_deref() {
        Some(url) if !url.is_empty() => {
            let redis_store = RedisCounterStore::connect(url).await?;
            for record in cfg.quota_records.clone() {
                redis_store.register_metadata(record);
            }
            Arc::new(redis_store)
        }
        _ => {
            let in_process = InProcessCounterStore::new();
            for record in cfg.quota_records.clone() {
                in_process.insert(record).await;
            }
            Arc::new(in_process)
        }
    };
    let quota = Arc::new(QuotaEngine::new(store, windows.clone(), cfg.alert_webhook.clone()));

    let sessions = Arc::new(SessionStore::new());
    let ledger = Arc::new(Ledger::spawn(Arc::new(InMemoryLedger::new())));
    let marketplace: Arc<dyn MarketplaceReporter> = match cfg.alert_webhook.clone() {
        Some(url) if !url.is_empty() => Arc::new(WebhookReporter::new(url)),
        _ => Arc::new(NullReporter),
    };

    let providers = Arc::new(ProviderClients {
        openai: OpenAIProvider::new(cfg.openai_api_key.clone(), cfg.openai_base_url.clone())?,
        anthropic: AnthropicProvider::new(cfg.anthropic_api_key.clone(), cfg.anthropic_base_url.clone())?,
    });

    let authenticator = Arc::new(StaticBearerAuthenticator::new(cfg.static_auth_keys()));
    let pending_leases = Arc::new(DashMap::new());

    let state = AppState {
        cfg: Arc::new(cfg),
        scheduler: scheduler.clone(),
        capacity: capacity.clone(),
        quota,
        windows,
        classifier,
        sessions,
        ledger,
        marketplace,
        providers,
        authenticator,
        pending_leases: pending_leases.clone(),
    };

    spawn_dequeue_loop(&scheduler, capacity, pending_leases);
    scheduler.spawn_aging_loop();

    let governor = state.cfg.build_governor()?;
    let timeout_secs = state.cfg.timeout_secs;
    let max_concurrency = state.cfg.max_concurrency;

    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(governor)
        .layer(HandleErrorLayer::new(handle_layer_error))
        .layer(LoadShedLayer::new())
        .option_layer(
            timeout_secs
                .filter(|v| *v > 0)
                .map(|secs| TimeoutLayer::new(Duration::from_secs(secs))),
        )
        .option_layer(max_concurrency.filter(|v| *v > 0).map(GlobalConcurrencyLimitLayer::new))
        .into_inner();

    let listen_addr = state.cfg.listen_addr.clone();
    let app = Router::new()
        .route("/metrics", get(move || async move { metrics_handle.render() }))
        .merge(handlers::router(state))
        .layer(middleware);

    let addr: SocketAddr = listen_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "starting server");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wires the scheduler's background dequeue loop to capacity admission
/// (spec §4.2's fixed "Scheduler/Queue -> Capacity Admission" ordering):
/// each dequeued request attempts a capacity lease, leaves it in
/// `pending_leases` for the waiting handler to pick up, registers an active
/// entry for cancellation, and resolves the handler's oneshot.
fn spawn_dequeue_loop(
    scheduler: &SchedulerHandle,
    capacity: Arc<CapacityManager>,
    pending_leases: Arc<DashMap<String, crate::capacity::CapacityLease>>,
) {
    let registry = scheduler.active_registry();
    scheduler.spawn_loop(move |mut req| {
        let Some(tx) = req.result_tx.take() else {
            return;
        };
        let acquire = AcquireRequest {
            model: req.model.clone(),
            request_id: req.id.clone(),
            estimated_tokens: req.estimated_tokens,
            estimated_duration: Duration::from_secs(1),
            estimated_context_length: req.estimated_tokens.min(u32::MAX as u64) as u32,
        };
        match capacity.try_acquire(&acquire, ProbeHealth::Healthy) {
            Ok(lease) => {
                registry.register(&req.id, req.priority, req.cancelable);
                pending_leases.insert(req.id.clone(), lease);
                let _ = tx.send(AdmissionResult::Admitted);
            }
            Err(_) => {
                let _ = tx.send(AdmissionResult::CapacityExceeded);
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install signal handler");
        term.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("signal received, starting graceful shutdown");
}

async fn handle_layer_error(err: BoxError) -> (axum::http::StatusCode, &'static str) {
    use axum::http::StatusCode;
    if err.is::<tower::timeout::error::Elapsed>() {
        tracing::warn!("request timed out");
        metrics::counter!("cb_events_total", "event" => "timeout").increment(1);
        return (StatusCode::GATEWAY_TIMEOUT, "upstream timed out");
    }
    if err.is::<tower::load_shed::error::Overloaded>() {
        tracing::warn!("shed request due to overload");
        metrics::counter!("cb_events_total", "event" => "load_shed").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "server overloaded");
    }
    tracing::error!(error = %err, "unhandled middleware error");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}
