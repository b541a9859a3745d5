//! The robot agent coordinator.
//!
//! Owns the robot lifecycle: registers with the backend, runs the claim
//! loop through the circuit breaker, heartbeats leases, pushes presence,
//! persists its own restart checkpoint, and drains jobs on shutdown.
//! All collaborators are injected; tests build an agent against a mock
//! backend and a scripted engine.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::sqlite::offline_store::OfflineStore;
use crate::application::job_executor::{JobExecutor, JobExecutorConfig};
use crate::domain::errors::{RobotError, RobotResult};
use crate::domain::models::checkpoint::{AgentCheckpoint, AgentStats};
use crate::domain::models::config::RobotConfig;
use crate::domain::models::job::Job;
use crate::domain::models::robot::{
    AgentState, PresenceSnapshot, RobotCapabilities, RobotRegistration, RobotStatusKind,
};
use crate::domain::models::variable::variables_from_json;
use crate::domain::ports::backend::BackendQueue;
use crate::domain::ports::engine::WorkflowEngine;
use crate::infrastructure::paths::RobotPaths;
use crate::services::audit::AuditLogger;
use crate::services::checkpoint::CheckpointManager;
use crate::services::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
};
use crate::services::metrics::MetricsCollector;
use crate::services::progress::JobLocker;

pub struct RobotAgent {
    config: RobotConfig,
    robot_id: String,
    robot_name: String,
    hostname: String,
    capabilities: RobotCapabilities,
    paths: RobotPaths,

    backend: Arc<dyn BackendQueue>,
    store: Arc<OfflineStore>,
    audit: Arc<AuditLogger>,
    metrics: Arc<MetricsCollector>,
    breaker: Arc<CircuitBreaker>,
    registry: CircuitBreakerRegistry,
    executor: Arc<JobExecutor>,
    locker: Arc<JobLocker>,

    state: RwLock<AgentState>,
    stats: Arc<StdMutex<AgentStats>>,
    nodes_seen: AtomicU64,
    started_at: StdMutex<Option<chrono::DateTime<Utc>>>,
    shutdown_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl RobotAgent {
    /// Wire up every subsystem. Fails only on storage or identity
    /// problems; the backend may be unreachable at build time.
    pub async fn new(
        config: RobotConfig,
        backend: Arc<dyn BackendQueue>,
        engine: Arc<dyn WorkflowEngine>,
        paths: RobotPaths,
        audit: Arc<AuditLogger>,
    ) -> RobotResult<Arc<Self>> {
        let robot_id = paths.load_or_create_robot_id(config.robot_id.as_deref())?;
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let robot_name = config
            .robot_name
            .clone()
            .unwrap_or_else(|| format!("Robot-{}", hostname));

        let store = Arc::new(OfflineStore::open(&paths.offline_db_path(), &robot_id).await?);
        let metrics = Arc::new(MetricsCollector::new(Duration::from_secs_f64(
            config.resource_sample_interval.max(1.0),
        )));
        let stats = Arc::new(StdMutex::new(AgentStats::default()));

        let breaker_name = format!("robot-{}", robot_id);
        let mut breaker_config = CircuitBreakerConfig::from(&config.circuit_breaker);
        breaker_config.enabled = config.enable_circuit_breaker;
        let breaker = {
            let audit = Arc::clone(&audit);
            let stats = Arc::clone(&stats);
            Arc::new(
                CircuitBreaker::new(breaker_name, breaker_config).with_listener(Arc::new(
                    move |name, _from, to| {
                        if to == crate::services::circuit_breaker::CircuitState::Open {
                            stats.lock().expect("stats poisoned").circuit_breaker_opens += 1;
                        }
                        let audit = Arc::clone(&audit);
                        let name = name.to_string();
                        let state = to.as_str();
                        tokio::spawn(async move {
                            audit.circuit_state_changed(&name, state).await;
                        });
                    },
                )),
            )
        };
        let registry = CircuitBreakerRegistry::new();
        registry.insert(Arc::clone(&breaker));

        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&store),
            Arc::clone(&audit),
            config.enable_checkpointing,
        ));

        let executor_config = JobExecutorConfig {
            max_concurrent_jobs: config.max_concurrent_jobs,
            job_timeout: Duration::from_secs(config.job_timeout),
            node_timeout: Duration::from_secs_f64(config.node_timeout),
            cancellation_check_interval: Duration::from_secs_f64(
                config.cancellation_check_interval.max(0.05),
            ),
            progress_flush_interval: Duration::from_secs_f64(
                config.progress_flush_interval.max(0.05),
            ),
            resume_from_checkpoint: config.resume_from_checkpoint && config.enable_checkpointing,
        };

        let on_complete = Self::completion_callback(
            Arc::clone(&backend),
            Arc::clone(&breaker),
            Arc::clone(&store),
            Arc::clone(&audit),
            Arc::clone(&stats),
        );

        let executor = JobExecutor::new(
            executor_config,
            engine,
            Arc::clone(&backend),
            Arc::clone(&store),
            checkpoints,
            Arc::clone(&metrics),
            Arc::clone(&audit),
            on_complete,
        );

        let locker = Arc::new(JobLocker::new(Arc::clone(&backend), robot_id.clone()));
        let capabilities = RobotCapabilities::detect(
            config.engines.clone(),
            config.tags(),
            config.max_concurrent_jobs,
        );

        let (shutdown_tx, _) = watch::channel(false);
        let (pause_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            robot_id,
            robot_name,
            hostname,
            capabilities,
            paths,
            backend,
            store,
            audit,
            metrics,
            breaker,
            registry,
            executor,
            locker,
            state: RwLock::new(AgentState::Stopped),
            stats,
            nodes_seen: AtomicU64::new(0),
            started_at: StdMutex::new(None),
            shutdown_tx,
            pause_tx,
            tasks: StdMutex::new(Vec::new()),
        }))
    }

    /// Reports a job's outcome to the backend through the circuit
    /// breaker. Unreachable backends leave the outcome pending in the
    /// offline store; the sync pass retries it later.
    fn completion_callback(
        backend: Arc<dyn BackendQueue>,
        breaker: Arc<CircuitBreaker>,
        store: Arc<OfflineStore>,
        audit: Arc<AuditLogger>,
        stats: Arc<StdMutex<AgentStats>>,
    ) -> crate::application::job_executor::CompletionCallback {
        Arc::new(move |job_id, success, error| {
            let backend = Arc::clone(&backend);
            let breaker = Arc::clone(&breaker);
            let store = Arc::clone(&store);
            let audit = Arc::clone(&audit);
            let stats = Arc::clone(&stats);
            let report: futures::future::BoxFuture<'static, ()> = Box::pin(async move {
                let cancelled = error
                    .as_deref()
                    .map(|e| e.starts_with("cancelled"))
                    .unwrap_or(false);
                {
                    let mut stats = stats.lock().expect("stats poisoned");
                    if success {
                        stats.jobs_completed += 1;
                    } else if cancelled {
                        stats.jobs_cancelled += 1;
                    } else {
                        stats.jobs_failed += 1;
                    }
                }

                let result = serde_json::json!({ "success": success, "error": error });
                store
                    .mark_completed(&job_id, success, Some(&result), error.as_deref())
                    .await;

                let reported = breaker
                    .call(|| async {
                        if success {
                            backend.complete_job(&job_id, &result).await
                        } else if cancelled {
                            backend
                                .cancel_job(&job_id, error.as_deref().unwrap_or("cancelled"))
                                .await
                        } else {
                            backend
                                .fail_job(&job_id, error.as_deref().unwrap_or("unknown error"))
                                .await
                        }
                    })
                    .await;

                match reported {
                    Ok(()) => {
                        store.mark_synced(&job_id).await;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "outcome report deferred to offline sync");
                        store.increment_sync_attempts(&job_id).await;
                        audit.job_cached(&job_id).await;
                    }
                }
            });
            report
        })
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub async fn state(&self) -> AgentState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        matches!(self.state().await, AgentState::Running | AgentState::Paused)
    }

    pub async fn current_job_count(&self) -> usize {
        self.executor.running_count().await
    }

    pub fn circuit_registry(&self) -> &CircuitBreakerRegistry {
        &self.registry
    }

    /// Bring the agent up: restore state, register, spawn the loops.
    pub async fn start(self: Arc<Self>) -> RobotResult<()> {
        {
            let mut state = self.state.write().await;
            if *state != AgentState::Stopped {
                return Err(RobotError::Invariant(format!(
                    "start() while {}",
                    state.as_str()
                )));
            }
            *state = AgentState::Starting;
        }
        *self.started_at.lock().expect("started_at poisoned") = Some(Utc::now());
        info!(robot_id = %self.robot_id, name = %self.robot_name, "starting robot agent");

        self.restore_self_checkpoint().await;
        self.register().await;
        self.audit
            .robot_started(serde_json::json!({
                "robot_id": self.robot_id,
                "name": self.robot_name,
                "max_concurrent_jobs": self.config.max_concurrent_jobs,
            }))
            .await;

        self.recover_orphaned_jobs().await;

        let shutdown_rx = self.shutdown_tx.subscribe();
        let monitor = Arc::clone(&self.metrics).start_resource_monitoring(shutdown_rx);
        {
            let mut tasks = self.tasks.lock().expect("tasks poisoned");
            tasks.push(monitor);
        }
        Self::spawn_loop(&self, Self::claim_loop);
        Self::spawn_loop(&self, Self::heartbeat_loop);
        Self::spawn_loop(&self, Self::presence_loop);
        Self::spawn_loop(&self, Self::checkpoint_loop);

        *self.state.write().await = AgentState::Running;
        info!(robot_id = %self.robot_id, "robot agent running");
        Ok(())
    }

    fn spawn_loop<F, Fut>(agent: &Arc<Self>, body: F)
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(body(Arc::clone(agent)));
        agent.tasks.lock().expect("tasks poisoned").push(handle);
    }

    /// Graceful shutdown per the documented ordering: drain jobs (or
    /// time out), persist the final self-checkpoint, then cancel loops
    /// and mark the registration offline.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if matches!(*state, AgentState::Stopped | AgentState::ShuttingDown) {
                return;
            }
            *state = AgentState::ShuttingDown;
        }
        info!(robot_id = %self.robot_id, "shutting down");
        self.shutdown_tx.send_replace(true);

        let grace = Duration::from_secs(self.config.shutdown_grace);
        self.executor.shutdown(false, grace).await;
        for job_id in self.executor.running_ids().await {
            warn!(job_id = %job_id, "job still running after grace, cancelling");
            self.executor.cancel(&job_id, "agent shutdown").await;
        }

        self.save_self_checkpoint().await;

        let handles: Vec<JoinHandle<()>> =
            self.tasks.lock().expect("tasks poisoned").drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        if let Err(e) = self
            .backend
            .update_robot_status(&self.robot_id, RobotStatusKind::Offline)
            .await
        {
            warn!(error = %e, "could not mark registration offline");
        }

        self.store.close().await;
        self.audit.robot_stopped(Some("graceful shutdown")).await;
        *self.state.write().await = AgentState::Stopped;
        info!(robot_id = %self.robot_id, "stopped");
    }

    /// Suspend job acquisition; running jobs continue.
    pub async fn pause(&self) {
        let mut state = self.state.write().await;
        if *state != AgentState::Running {
            return;
        }
        *state = AgentState::Paused;
        drop(state);
        self.pause_tx.send_replace(true);
        let _ = self
            .backend
            .update_robot_status(&self.robot_id, RobotStatusKind::Paused)
            .await;
        info!(robot_id = %self.robot_id, "paused");
    }

    pub async fn resume(&self) {
        let mut state = self.state.write().await;
        if *state != AgentState::Paused {
            return;
        }
        *state = AgentState::Running;
        drop(state);
        self.pause_tx.send_replace(false);
        let _ = self
            .backend
            .update_robot_status(&self.robot_id, RobotStatusKind::Online)
            .await;
        info!(robot_id = %self.robot_id, "resumed");
    }

    pub async fn cancel_job(&self, job_id: &str, reason: &str) -> bool {
        self.executor.cancel(job_id, reason).await
    }

    async fn register(&self) {
        let registration = RobotRegistration {
            robot_id: self.robot_id.clone(),
            name: self.robot_name.clone(),
            hostname: self.hostname.clone(),
            status: RobotStatusKind::Online,
            environment: self.config.environment.clone(),
            capabilities: self.capabilities.clone(),
            last_heartbeat: Some(Utc::now()),
        };
        match self.backend.upsert_registration(&registration).await {
            Ok(()) => self.audit.robot_registered(&self.hostname).await,
            Err(e) => warn!(error = %e, "registration deferred, backend unreachable"),
        }
    }

    /// Re-queue jobs that were mid-execution when the process died.
    async fn recover_orphaned_jobs(&self) {
        let orphans = self.store.get_in_progress_jobs().await;
        if orphans.is_empty() {
            return;
        }
        info!(count = orphans.len(), "recovering in-progress jobs");
        for record in orphans {
            let reclaimed = self.locker.try_claim(&record.job_id).await;
            if !reclaimed {
                debug!(job_id = %record.job_id, "orphan not reclaimable, leaving to the queue");
                continue;
            }
            let job = Job::new(record.job_id.clone(), record.workflow.clone());
            if self.executor.submit(job).await {
                self.audit.job_claimed(&record.job_id).await;
            }
        }
    }

    async fn claim_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut pause_rx = self.pause_tx.subscribe();
        let base_poll = Duration::from_secs_f64(self.config.poll_interval.max(0.05));
        let max_poll = Duration::from_secs_f64(
            self.config
                .poll_interval_max
                .max(self.config.poll_interval),
        );
        let mut poll = base_poll;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            // Pause gate: block until resumed or shut down.
            if *pause_rx.borrow() {
                tokio::select! {
                    _ = pause_rx.changed() => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            }

            if self.executor.running_count().await >= self.config.max_concurrent_jobs {
                Self::sleep_or_shutdown(poll, &mut shutdown_rx).await;
                continue;
            }
            // Claim-loop backoff while the breaker is open; the backend
            // claim RPC is never reached in this state.
            if self.breaker.is_open() {
                Self::sleep_or_shutdown(poll, &mut shutdown_rx).await;
                continue;
            }

            let backend = Arc::clone(&self.backend);
            let robot_id = self.robot_id.clone();
            let environment = self.config.environment.clone();
            let claimed = self
                .breaker
                .call(move || {
                    let backend = Arc::clone(&backend);
                    async move { backend.claim_job(&robot_id, &environment).await }
                })
                .await;

            match claimed {
                Ok(Some(job)) => {
                    poll = base_poll;
                    self.on_job_claimed(job).await;
                }
                Ok(None) => {
                    // Idle: back the poll interval off up to the cap.
                    poll = (poll * 2).min(max_poll);
                    Self::sleep_or_shutdown(poll, &mut shutdown_rx).await;
                }
                Err(e) => {
                    let err = e.into_robot_error(|inner| inner);
                    match err {
                        RobotError::CircuitOpen { .. } => {
                            Self::sleep_or_shutdown(poll, &mut shutdown_rx).await;
                        }
                        transient if transient.is_transient() => {
                            warn!(error = %transient, "claim attempt failed");
                            Self::sleep_or_shutdown(poll, &mut shutdown_rx).await;
                        }
                        other => {
                            error!(error = %other, "claim loop error");
                            Self::sleep_or_shutdown(Duration::from_secs(5), &mut shutdown_rx)
                                .await;
                        }
                    }
                }
            }
        }
        debug!("claim loop exited");
    }

    async fn on_job_claimed(&self, job: Job) {
        let workflow_name = job
            .document
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("unnamed")
            .to_string();
        self.audit.job_received(&job.id, &workflow_name).await;
        self.audit.job_claimed(&job.id).await;

        if self.store.cache_job(&job.id, &job.document, "pending").await {
            self.audit.job_cached(&job.id).await;
        }

        let mut job = job;
        if job.initial_variables.is_empty() {
            if let Some(vars) = job.document.get("variables") {
                job.initial_variables = variables_from_json(vars.clone());
            }
        }
        let job_id = job.id.clone();
        if !self.executor.submit(job).await {
            warn!(job_id = %job_id, "executor rejected job, releasing");
            self.locker.release(&job_id).await;
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_secs_f64(self.config.heartbeat_interval.max(0.05));
        loop {
            if Self::sleep_or_shutdown(interval, &mut shutdown_rx).await {
                break;
            }
            // Extend leases before the visibility timeout can lapse.
            for job_id in self.executor.running_ids().await {
                self.locker
                    .heartbeat(&job_id, self.config.visibility_timeout as i64)
                    .await;
            }
            self.sync_offline_results().await;
        }
        debug!("heartbeat loop exited");
    }

    /// Push locally finished jobs whose outcome the backend has not
    /// acknowledged yet. Stops at the first failure; the backend is
    /// likely down.
    async fn sync_offline_results(&self) {
        for record in self.store.get_jobs_to_sync().await {
            let result = record
                .result
                .clone()
                .unwrap_or_else(|| serde_json::json!({ "success": record.error_message.is_none() }));
            let report = if record.cache_status
                == crate::adapters::sqlite::offline_store::CacheStatus::Completed
            {
                self.backend.complete_job(&record.job_id, &result).await
            } else {
                self.backend
                    .fail_job(
                        &record.job_id,
                        record.error_message.as_deref().unwrap_or("unknown error"),
                    )
                    .await
            };
            match report {
                Ok(()) => {
                    self.store.mark_synced(&record.job_id).await;
                    self.audit.job_synced(&record.job_id).await;
                }
                Err(e) => {
                    debug!(job_id = %record.job_id, error = %e, "offline sync attempt failed");
                    self.store.increment_sync_attempts(&record.job_id).await;
                    break;
                }
            }
        }
    }

    async fn presence_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_secs_f64(self.config.presence_interval.max(0.05));
        loop {
            if Self::sleep_or_shutdown(interval, &mut shutdown_rx).await {
                break;
            }
            let presence = self.presence_snapshot().await;
            if let Err(e) = self.backend.update_presence(&self.robot_id, &presence).await {
                debug!(error = %e, "presence push failed");
            }
        }
        debug!("presence loop exited");
    }

    async fn presence_snapshot(&self) -> PresenceSnapshot {
        let current_jobs = self.executor.running_count().await;
        let status = match self.state().await {
            AgentState::Paused => RobotStatusKind::Paused,
            AgentState::ShuttingDown | AgentState::Stopped => RobotStatusKind::Offline,
            _ if current_jobs > 0 => RobotStatusKind::Busy,
            _ => RobotStatusKind::Idle,
        };
        let resources = self.metrics.current_resources().await;
        PresenceSnapshot {
            status,
            current_jobs,
            capacity: self.config.max_concurrent_jobs,
            cpu_percent: resources.map(|r| r.cpu_percent).unwrap_or(0.0),
            memory_percent: resources.map(|r| r.memory_percent).unwrap_or(0.0),
            timestamp: Utc::now(),
        }
    }

    /// Periodic self-checkpoint persistence and housekeeping.
    async fn checkpoint_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_secs(60);
        loop {
            if Self::sleep_or_shutdown(interval, &mut shutdown_rx).await {
                break;
            }
            self.save_self_checkpoint().await;
            self.store.cleanup_old_synced_jobs(7).await;
        }
        debug!("checkpoint loop exited");
    }

    fn stats_snapshot(&self) -> AgentStats {
        self.stats.lock().expect("stats poisoned").clone()
    }

    async fn save_self_checkpoint(&self) {
        // Fold freshly executed nodes into the persistent counter.
        let total_nodes = self.metrics.summary().await.nodes_executed;
        let seen = self.nodes_seen.swap(total_nodes, Ordering::SeqCst);
        {
            let mut stats = self.stats.lock().expect("stats poisoned");
            stats.nodes_executed += total_nodes.saturating_sub(seen);
        }

        let mut checkpoint = AgentCheckpoint::new(
            self.robot_id.clone(),
            self.state().await.as_str(),
            self.stats_snapshot(),
        );
        checkpoint.current_job_ids = self.executor.running_ids().await;
        checkpoint.last_heartbeat = Some(Utc::now());

        if let Err(e) = self.paths.write_agent_checkpoint(&checkpoint) {
            warn!(error = %e, "self-checkpoint write failed");
        }
        if let Err(e) = self
            .paths
            .prune_agent_checkpoints(&self.robot_id, self.config.checkpoint_retention)
        {
            debug!(error = %e, "self-checkpoint prune failed");
        }
    }

    async fn restore_self_checkpoint(&self) {
        let Some(checkpoint) = self.paths.read_agent_checkpoint(&self.robot_id) else {
            return;
        };
        {
            let mut stats = self.stats.lock().expect("stats poisoned");
            *stats = checkpoint.stats.clone();
            stats.checkpoints_restored += 1;
        }
        if !checkpoint.current_job_ids.is_empty() {
            info!(
                orphans = checkpoint.current_job_ids.len(),
                "previous run left jobs in flight"
            );
        }
        info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            jobs_completed = checkpoint.stats.jobs_completed,
            "restored agent checkpoint"
        );
    }

    /// Sleeps `duration`, returning true when shutdown fired instead.
    async fn sleep_or_shutdown(
        duration: Duration,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        if *shutdown_rx.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
        }
    }

    /// Status document written to `robot_<id>_status.json` and shown by
    /// `robot status`.
    pub async fn status(&self) -> serde_json::Value {
        let stats = self.stats_snapshot();
        let summary = self.metrics.summary().await;
        let resources = self.metrics.current_resources().await;
        let started_at = *self.started_at.lock().expect("started_at poisoned");
        let uptime_seconds = started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0))
            .unwrap_or(0);
        serde_json::json!({
            "robot_id": self.robot_id,
            "name": self.robot_name,
            "hostname": self.hostname,
            "state": self.state().await.as_str(),
            "environment": self.config.environment,
            "current_jobs": self.executor.running_ids().await,
            "current_job_count": self.executor.running_count().await,
            "capacity": self.config.max_concurrent_jobs,
            "circuit_breaker": self.breaker.status(),
            "stats": {
                "jobs_completed": stats.jobs_completed,
                "jobs_failed": stats.jobs_failed,
                "jobs_cancelled": stats.jobs_cancelled,
                "nodes_executed": stats.nodes_executed
                    + summary.nodes_executed.saturating_sub(self.nodes_seen.load(Ordering::SeqCst)),
                "circuit_breaker_opens": stats.circuit_breaker_opens,
                "checkpoints_restored": stats.checkpoints_restored,
            },
            "resources": resources,
            "started_at": started_at,
            "uptime_seconds": uptime_seconds,
            "updated_at": Utc::now(),
        })
    }
}
