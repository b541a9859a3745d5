//! Bounded-concurrency job execution.
//!
//! A counting semaphore caps concurrent workflows; an unbounded FIFO
//! queue feeds a dispatcher that spawns one execution task per job. Each
//! task wires the workflow engine's node events into checkpointing,
//! progress reporting, metrics, and audit, polls a shared cancellation
//! flag, and finishes through the completion callback whatever happens.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::sqlite::offline_store::OfflineStore;
use crate::domain::models::job::Job;
use crate::domain::models::variable::VariableMap;
use crate::domain::models::workflow::WorkflowDocument;
use crate::domain::ports::backend::BackendQueue;
use crate::domain::ports::engine::{EngineRequest, NodeEvent, WorkflowEngine};
use crate::services::audit::AuditLogger;
use crate::services::checkpoint::CheckpointManager;
use crate::services::metrics::MetricsCollector;
use crate::services::progress::{CancellationChecker, ProgressReporter};

#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    pub max_concurrent_jobs: usize,
    pub job_timeout: Duration,
    pub node_timeout: Duration,
    pub cancellation_check_interval: Duration,
    pub progress_flush_interval: Duration,
    pub resume_from_checkpoint: bool,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            job_timeout: Duration::from_secs(3600),
            node_timeout: Duration::from_secs(120),
            cancellation_check_interval: Duration::from_secs(2),
            progress_flush_interval: Duration::from_secs(1),
            resume_from_checkpoint: true,
        }
    }
}

/// Invoked exactly once per submitted job with `(job_id, success,
/// error)`.
pub type CompletionCallback =
    Arc<dyn Fn(String, bool, Option<String>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Starting | Self::Running)
    }
}

/// Public snapshot of one tracked job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_id: String,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

struct TrackedJob {
    state: JobState,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    cancel_flag: Arc<AtomicBool>,
    cancel_reason: Arc<StdMutex<Option<String>>>,
    cancel_notify: Arc<Notify>,
}

impl TrackedJob {
    fn new() -> Self {
        Self {
            state: JobState::Queued,
            started_at: None,
            completed_at: None,
            error: None,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            cancel_reason: Arc::new(StdMutex::new(None)),
            cancel_notify: Arc::new(Notify::new()),
        }
    }
}

/// How one execution ended, before reporting.
enum Termination {
    Finished { success: bool, error: Option<String> },
    Cancelled { reason: String },
    TimedOut,
}

pub struct JobExecutor {
    config: JobExecutorConfig,
    engine: Arc<dyn WorkflowEngine>,
    backend: Arc<dyn BackendQueue>,
    store: Arc<OfflineStore>,
    checkpoints: Arc<CheckpointManager>,
    metrics: Arc<MetricsCollector>,
    audit: Arc<AuditLogger>,
    semaphore: Arc<Semaphore>,
    jobs: Arc<RwLock<HashMap<String, TrackedJob>>>,
    queue_tx: mpsc::UnboundedSender<Job>,
    on_complete: CompletionCallback,
    accepting: AtomicBool,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl JobExecutor {
    /// Build the executor and spawn its dispatcher loop. Must be called
    /// from within a tokio runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: JobExecutorConfig,
        engine: Arc<dyn WorkflowEngine>,
        backend: Arc<dyn BackendQueue>,
        store: Arc<OfflineStore>,
        checkpoints: Arc<CheckpointManager>,
        metrics: Arc<MetricsCollector>,
        audit: Arc<AuditLogger>,
        on_complete: CompletionCallback,
    ) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
        let executor = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            config,
            engine,
            backend,
            store,
            checkpoints,
            metrics,
            audit,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            queue_tx,
            on_complete,
            accepting: AtomicBool::new(true),
            dispatcher: StdMutex::new(None),
        });

        let dispatcher = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                while let Some(job) = queue_rx.recv().await {
                    let permit = match Arc::clone(&executor.semaphore).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let runner = Arc::clone(&executor);
                    tokio::spawn(async move {
                        let _permit = permit;
                        runner.execute_job(job).await;
                    });
                }
            })
        };
        *executor.dispatcher.lock().expect("dispatcher poisoned") = Some(dispatcher);
        executor
    }

    /// Queue a job for execution. Rejects duplicates of a job still in
    /// flight and submissions after shutdown began.
    pub async fn submit(&self, job: Job) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        let job_id = job.id.clone();
        {
            let mut jobs = self.jobs.write().await;
            if jobs.get(&job_id).map(|j| j.state.is_active()).unwrap_or(false) {
                warn!(job_id = %job_id, "duplicate submission rejected");
                return false;
            }
            jobs.insert(job_id.clone(), TrackedJob::new());
        }
        if self.queue_tx.send(job).is_err() {
            self.jobs.write().await.remove(&job_id);
            return false;
        }
        true
    }

    /// Request cancellation of a starting or running job.
    ///
    /// Returns `false` without side effects for any other state.
    pub async fn cancel(&self, job_id: &str, reason: &str) -> bool {
        let jobs = self.jobs.read().await;
        let Some(job) = jobs.get(job_id) else {
            return false;
        };
        if !matches!(job.state, JobState::Starting | JobState::Running) {
            return false;
        }
        *job.cancel_reason.lock().expect("reason poisoned") = Some(reason.to_string());
        job.cancel_flag.store(true, Ordering::SeqCst);
        job.cancel_notify.notify_waiters();
        info!(job_id, reason, "cancellation requested");
        true
    }

    pub async fn running_count(&self) -> usize {
        let jobs = self.jobs.read().await;
        jobs.values().filter(|j| j.state.is_active()).count()
    }

    pub async fn running_ids(&self) -> Vec<String> {
        let jobs = self.jobs.read().await;
        jobs.iter()
            .filter(|(_, j)| j.state.is_active())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn job_info(&self, job_id: &str) -> Option<JobInfo> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).map(|j| JobInfo {
            job_id: job_id.to_string(),
            state: j.state,
            started_at: j.started_at,
            completed_at: j.completed_at,
            error: j.error.clone(),
        })
    }

    /// Stop accepting work and wait up to `grace` for in-flight jobs.
    /// With `cancel_running` the flag is raised for every active job
    /// first.
    pub async fn shutdown(&self, cancel_running: bool, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);

        if cancel_running {
            let ids = self.running_ids().await;
            for id in ids {
                self.cancel(&id, "executor shutdown").await;
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while self.running_count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Some(handle) = self.dispatcher.lock().expect("dispatcher poisoned").take() {
            handle.abort();
        }
    }

    async fn set_state(&self, job_id: &str, state: JobState) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.state = state;
            match state {
                JobState::Starting => job.started_at = Some(Utc::now()),
                JobState::Completed | JobState::Failed | JobState::Cancelled => {
                    job.completed_at = Some(Utc::now())
                }
                _ => {}
            }
        }
    }

    async fn execute_job(self: Arc<Self>, job: Job) {
        let job_id = job.id.clone();
        let (cancel_flag, cancel_reason, cancel_notify) = {
            let jobs = self.jobs.read().await;
            match jobs.get(&job_id) {
                Some(tracked) => (
                    Arc::clone(&tracked.cancel_flag),
                    Arc::clone(&tracked.cancel_reason),
                    Arc::clone(&tracked.cancel_notify),
                ),
                None => return,
            }
        };

        self.set_state(&job_id, JobState::Starting).await;
        self.metrics.start_job(&job_id, "").await;
        self.store.mark_in_progress(&job_id).await;

        // Parse the workflow document before anything subscribes to it.
        let document = match WorkflowDocument::from_json(&job.document) {
            Ok(document) => document,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "workflow document rejected");
                self.finish(&job_id, None, JobState::Failed, Some(e.to_string()), None)
                    .await;
                return;
            }
        };
        let workflow_name = document.name().to_string();
        let total_nodes = document.node_count() as u32;
        self.audit
            .log(
                crate::services::audit::AuditEventType::WorkflowLoaded,
                crate::services::audit::AuditSeverity::Debug,
                format!("Workflow '{}' loaded", workflow_name),
                Some(&job_id),
                None,
                serde_json::json!({ "total_nodes": total_nodes }),
            )
            .await;

        let reporter = Arc::new(ProgressReporter::new(
            job_id.clone(),
            Arc::clone(&self.backend),
            self.config.progress_flush_interval,
        ));
        reporter.start_job(&workflow_name, total_nodes).await;

        self.checkpoints.start_job(&job_id, &workflow_name).await;

        // Resume: seed skip-set and variables from the latest checkpoint.
        let mut variables: VariableMap = document.variables.clone();
        for (key, value) in &job.initial_variables {
            variables.insert(key.clone(), value.clone());
        }
        let mut skip_nodes = std::collections::HashSet::new();
        if self.config.resume_from_checkpoint {
            if let Some(restored) = self.checkpoints.restore(&job_id).await {
                skip_nodes = restored.executed_nodes;
                for (key, value) in restored.variables {
                    variables.insert(key, value);
                }
            }
        }

        let checker = CancellationChecker::new(
            Arc::clone(&self.backend),
            self.config.cancellation_check_interval,
        );
        // The checker's flag feeds the same poll the executor owns.
        let backend_cancel = checker.flag();
        checker.start(&job_id);

        self.set_state(&job_id, JobState::Running).await;
        self.audit.job_started(&job_id, total_nodes as usize).await;
        self.store
            .log_event(
                &job_id,
                "job.started",
                serde_json::json!({ "workflow": workflow_name, "total_nodes": total_nodes }),
            )
            .await;

        let request = EngineRequest {
            job_id: job_id.clone(),
            document,
            variables,
            skip_nodes,
            node_timeout: self.config.node_timeout,
        };
        let (events_tx, mut events_rx) = mpsc::channel::<NodeEvent>(64);
        let engine = Arc::clone(&self.engine);
        let mut engine_task = tokio::spawn(async move { engine.run(request, events_tx).await });

        let started = tokio::time::Instant::now();
        let mut poll = tokio::time::interval(self.config.cancellation_check_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut events_open = true;

        let termination = loop {
            tokio::select! {
                event = events_rx.recv(), if events_open => {
                    match event {
                        Some(event) => self.handle_node_event(&job_id, &reporter, event).await,
                        None => events_open = false,
                    }
                }
                result = &mut engine_task => {
                    break match result {
                        Ok(Ok(outcome)) => Termination::Finished {
                            success: outcome.success,
                            error: outcome.error,
                        },
                        Ok(Err(e)) => Termination::Finished {
                            success: false,
                            error: Some(e.to_string()),
                        },
                        Err(e) => {
                            error!(job_id = %job_id, error = %e, "execution task crashed");
                            Termination::Finished {
                                success: false,
                                error: Some(format!("execution task crashed: {}", e)),
                            }
                        }
                    };
                }
                _ = cancel_notify.notified() => {
                    engine_task.abort();
                    let reason = cancel_reason
                        .lock()
                        .expect("reason poisoned")
                        .clone()
                        .unwrap_or_else(|| "cancel requested".into());
                    break Termination::Cancelled { reason };
                }
                _ = poll.tick() => {
                    if cancel_flag.load(Ordering::SeqCst) || backend_cancel.load(Ordering::SeqCst) {
                        engine_task.abort();
                        let reason = cancel_reason
                            .lock()
                            .expect("reason poisoned")
                            .clone()
                            .unwrap_or_else(|| "cancel requested by orchestrator".into());
                        break Termination::Cancelled { reason };
                    }
                    if started.elapsed() >= self.config.job_timeout {
                        engine_task.abort();
                        break Termination::TimedOut;
                    }
                }
            }
        };
        checker.stop();

        // Events buffered before the engine finished still count.
        while let Ok(event) = events_rx.try_recv() {
            self.handle_node_event(&job_id, &reporter, event).await;
        }

        match termination {
            Termination::Finished { success, error } => {
                let state = if success {
                    JobState::Completed
                } else {
                    JobState::Failed
                };
                self.finish(&job_id, Some(&reporter), state, error, None).await;
            }
            Termination::Cancelled { reason } => {
                self.finish(
                    &job_id,
                    Some(&reporter),
                    JobState::Cancelled,
                    Some(format!("cancelled: {}", reason)),
                    Some(reason),
                )
                .await;
            }
            Termination::TimedOut => {
                let message = format!(
                    "job timed out after {}s",
                    self.config.job_timeout.as_secs()
                );
                self.finish(&job_id, Some(&reporter), JobState::Failed, Some(message), None)
                    .await;
            }
        }
    }

    async fn handle_node_event(
        &self,
        job_id: &str,
        reporter: &Arc<ProgressReporter>,
        event: NodeEvent,
    ) {
        match event {
            NodeEvent::Started {
                node_id,
                node_type,
                name,
            } => {
                reporter.report_node_start(&node_id, &node_type, &name).await;
                self.audit.node_started(job_id, &node_id, &node_type).await;
            }
            NodeEvent::Completed {
                node_id,
                node_type,
                duration_ms,
                variables,
                browser_state,
            } => {
                self.checkpoints
                    .on_node_complete(job_id, &node_id, &variables, browser_state)
                    .await;
                self.metrics
                    .record_node(job_id, &node_id, &node_type, true, duration_ms, None)
                    .await;
                reporter
                    .report_node_complete(&node_id, true, duration_ms, None)
                    .await;
                self.audit
                    .node_completed(job_id, &node_id, &node_type, duration_ms)
                    .await;
            }
            NodeEvent::Failed {
                node_id,
                node_type,
                error,
            } => {
                self.checkpoints.record_error(job_id, &node_id, &error).await;
                self.metrics
                    .record_node(job_id, &node_id, &node_type, false, 0, Some(&error))
                    .await;
                reporter
                    .report_node_complete(&node_id, false, 0, Some(&error))
                    .await;
                self.audit
                    .node_failed(job_id, &node_id, &node_type, &error)
                    .await;
            }
            NodeEvent::Skipped { node_id } => {
                self.metrics.record_node_skipped(&node_id).await;
                self.audit.node_skipped(job_id, &node_id).await;
            }
        }
    }

    /// Terminal bookkeeping shared by every exit path. The completion
    /// callback always fires; checkpoints are cleared only on success so
    /// failures and cancellations can resume.
    async fn finish(
        &self,
        job_id: &str,
        reporter: Option<&Arc<ProgressReporter>>,
        state: JobState,
        error: Option<String>,
        cancel_reason: Option<String>,
    ) {
        let success = state == JobState::Completed;
        let duration_ms = self
            .metrics
            .end_job(job_id, success, error.as_deref())
            .await
            .unwrap_or(0);

        if let Some(reporter) = reporter {
            match state {
                JobState::Cancelled => {
                    reporter.report_cancelled(cancel_reason.as_deref()).await;
                }
                _ => reporter.end_job(success, error.as_deref()).await,
            }
        }

        match state {
            JobState::Completed => {
                self.audit.job_completed(job_id, duration_ms).await;
                self.checkpoints.clear(job_id).await;
            }
            JobState::Cancelled => {
                self.audit
                    .job_cancelled(job_id, cancel_reason.as_deref())
                    .await;
            }
            _ => {
                self.audit
                    .job_failed(job_id, error.as_deref().unwrap_or("unknown"), duration_ms)
                    .await;
            }
        }
        self.store
            .log_event(
                job_id,
                match state {
                    JobState::Completed => "job.completed",
                    JobState::Cancelled => "job.cancelled",
                    _ => "job.failed",
                },
                serde_json::json!({ "duration_ms": duration_ms, "error": error.as_deref() }),
            )
            .await;
        self.checkpoints.end_job(job_id).await;

        {
            let mut jobs = self.jobs.write().await;
            if let Some(job) = jobs.get_mut(job_id) {
                job.state = state;
                job.completed_at = Some(Utc::now());
                job.error = error.clone();
            }
        }

        (self.on_complete)(job_id.to_string(), success, error).await;

        // Terminal jobs leave the tracking map so the id can be
        // resubmitted.
        self.jobs.write().await.remove(job_id);
        debug!(job_id, state = ?state, "job finished");
    }
}
