//! Top-level wiring: ingress -> triage -> scheduler -> investigation ->
//! alert sink / report store, plus graceful startup and shutdown.
//!
//! This is the one place that owns every subsystem handle; everything
//! else only sees the trait objects it needs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::alerting::{build_alert_sink, AlertSink};
use crate::cache::{build_cache, ResponseCache};
use crate::config::SentinelConfig;
use crate::ingress::{self, UnixSocketHandle};
use crate::investigation::InvestigationPool;
use crate::metrics::MetricsRegistry;
use crate::model::{CloudModel, Model, UnconfiguredModel};
use crate::reports::{ReportStore, SqliteReportStore};
use crate::scheduler::{InvestigationDispatcher, Scheduler, SchedulerHandle};
use crate::tools::{StaticToolRegistry, ToolRegistry};
use crate::triage::TriagePool;
use crate::types::{IncidentId, LogRecord, RunningInvestigation, SentinelError};

/// Everything spun up by [`start`], held so the caller can shut it down
/// cleanly. Dropping this without calling [`RunningAgent::shutdown`]
/// leaves the local socket file behind.
pub struct RunningAgent {
    pub config: SentinelConfig,
    pub metrics: Arc<MetricsRegistry>,
    pub scheduler: SchedulerHandle,
    pub report_store: Arc<dyn ReportStore>,
    pub alert_sink: Arc<dyn AlertSink>,
    server: tokio::task::JoinHandle<()>,
    local_socket: UnixSocketHandle,
}

fn resolve_model(config: &SentinelConfig) -> Arc<dyn Model> {
    match CloudModel::from_env(&config.llm) {
        Some(model) => Arc::new(model),
        None => {
            tracing::warn!("no model provider credentials found, investigations will report failures");
            Arc::new(UnconfiguredModel)
        }
    }
}

fn local_socket_path() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(".seraph.sock")
}

/// Boot every subsystem, bind the HTTP and local-socket listeners, and
/// replay `startup_prompts` as synthetic triaged alerts once the
/// scheduler is live.
pub async fn start(config: SentinelConfig) -> Result<RunningAgent, SentinelError> {
    let metrics = MetricsRegistry::new();
    let model = resolve_model(&config);
    let cache = build_cache(&config.llm_cache).await;
    let alert_sink = build_alert_sink(&config.alert_manager);
    let report_store: Arc<dyn ReportStore> = Arc::new(
        SqliteReportStore::open(&SqliteReportStore::default_path())
            .map_err(SentinelError::ReportStore)?,
    );
    let tools: Arc<dyn ToolRegistry> = Arc::new(StaticToolRegistry::new(vec![]));
    let investigation_worker_count = config.investigation_worker_count();

    let (scheduler_handle, _pool) = spawn_scheduler_and_pool(
        &config,
        investigation_worker_count,
        model.clone(),
        tools,
        report_store.clone(),
        alert_sink.clone(),
        cache.clone(),
        metrics.clone(),
    );

    let triage_pool = TriagePool::spawn(
        config.triage_worker_count(),
        model.clone(),
        cache.clone(),
        scheduler_handle.clone(),
        &config.pre_filters,
        metrics.clone(),
    );

    for prompt in &config.startup_prompts {
        let log = LogRecord::new(prompt.clone()).with_source("startup".to_string());
        triage_pool.dispatch(log);
    }

    let app_state = ingress::build_app_state(&config, triage_pool, model.clone(), metrics.clone());
    let recent_logs = app_state.recent_logs.clone();
    let router = ingress::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| SentinelError::Internal(format!("failed to bind {addr}: {e}")))?;
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await {
            tracing::error!(error = %e, "ingress server exited");
        }
    });

    let local_socket = ingress::spawn_local_socket(local_socket_path(), recent_logs)
        .await
        .map_err(|e| SentinelError::Internal(e.to_string()))?;

    Ok(RunningAgent {
        config,
        metrics,
        scheduler: scheduler_handle,
        report_store,
        alert_sink,
        server,
        local_socket,
    })
}

/// Forwards to an `InvestigationDispatcher` set once construction of
/// the actual pool has finished. `Scheduler::spawn` needs a dispatcher
/// up front and `InvestigationPool::spawn` needs a live `SchedulerHandle`
/// up front, so one side of the cycle has to start as a stand-in; any
/// dispatch racing the `set()` below only happens before the scheduler
/// has admitted its first investigation, since nothing reaches
/// `dispatch`/`cancel` until an alert is admitted.
struct DeferredDispatcher {
    inner: OnceCell<Arc<dyn InvestigationDispatcher>>,
}

#[async_trait]
impl InvestigationDispatcher for DeferredDispatcher {
    async fn dispatch(&self, worker_index: usize, investigation: RunningInvestigation) {
        if let Some(inner) = self.inner.get() {
            inner.dispatch(worker_index, investigation).await;
        } else {
            tracing::error!("dispatch called before investigation pool finished bootstrapping");
        }
    }

    async fn cancel(&self, worker_index: usize, investigation_id: IncidentId) {
        if let Some(inner) = self.inner.get() {
            inner.cancel(worker_index, investigation_id).await;
        }
    }
}

fn spawn_scheduler_and_pool(
    config: &SentinelConfig,
    investigation_worker_count: usize,
    model: Arc<dyn Model>,
    tools: Arc<dyn ToolRegistry>,
    report_store: Arc<dyn ReportStore>,
    alert_sink: Arc<dyn AlertSink>,
    cache: Arc<dyn ResponseCache>,
    metrics: Arc<MetricsRegistry>,
) -> (SchedulerHandle, Arc<InvestigationPool>) {
    let deferred = Arc::new(DeferredDispatcher { inner: OnceCell::new() });
    let dispatcher: Arc<dyn InvestigationDispatcher> = deferred.clone();

    let handle = Scheduler::spawn(
        config.priority_queue.clone(),
        investigation_worker_count,
        dispatcher,
        tools.clone(),
        alert_sink.clone(),
        metrics.clone(),
    );

    let pool = InvestigationPool::spawn(
        investigation_worker_count,
        model,
        tools,
        handle.clone(),
        report_store,
        alert_sink,
        cache,
        &config.llm_cache,
        metrics,
    );

    let pool_as_dispatcher: Arc<dyn InvestigationDispatcher> = pool.clone();
    deferred
        .inner
        .set(pool_as_dispatcher)
        .unwrap_or_else(|_| unreachable!("set once, immediately after construction"));

    (handle, pool)
}

impl RunningAgent {
    /// Stop accepting new logs, let the scheduler drain in place, and
    /// tear down the local socket. Does not wait for in-flight
    /// investigations to complete; the scheduler's own timeout sweep
    /// bounds how long any of them can still be running.
    pub async fn shutdown(self) {
        self.server.abort();
        self.local_socket.shutdown().await;
    }
}
