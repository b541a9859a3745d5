//! Progress reporting, cancellation polling, and job locking.
//!
//! The reporter coalesces rapid updates into at most one backend write
//! per flush interval; only the most recent fields survive. Terminal
//! events (`end_job`, `report_cancelled`) flush immediately and are
//! never coalesced with later updates. Progress writes go through the
//! backend without retry: a failed progress update must never fail the
//! job.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::ports::backend::{BackendQueue, ProgressStage, ProgressUpdate};

pub type ProgressListener = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

pub struct ProgressReporter {
    job_id: String,
    workflow_name: StdMutex<String>,
    backend: Arc<dyn BackendQueue>,
    flush_interval: Duration,
    total_nodes: AtomicU32,
    completed_nodes: AtomicU32,
    stage: StdMutex<ProgressStage>,
    pending: Arc<Mutex<Option<ProgressUpdate>>>,
    listeners: StdMutex<Vec<ProgressListener>>,
    terminal: Arc<AtomicBool>,
    flush_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ProgressReporter {
    pub fn new(
        job_id: impl Into<String>,
        backend: Arc<dyn BackendQueue>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            workflow_name: StdMutex::new(String::new()),
            backend,
            flush_interval,
            total_nodes: AtomicU32::new(0),
            completed_nodes: AtomicU32::new(0),
            stage: StdMutex::new(ProgressStage::Queued),
            pending: Arc::new(Mutex::new(None)),
            listeners: StdMutex::new(Vec::new()),
            terminal: Arc::new(AtomicBool::new(false)),
            flush_task: StdMutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: ProgressListener) {
        self.listeners.lock().expect("listeners poisoned").push(listener);
    }

    pub fn current_stage(&self) -> ProgressStage {
        *self.stage.lock().expect("stage poisoned")
    }

    fn percent(&self) -> f32 {
        let total = self.total_nodes.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        let completed = self.completed_nodes.load(Ordering::SeqCst);
        (completed as f32 / total as f32 * 100.0).min(100.0)
    }

    fn compose(&self, stage: ProgressStage) -> ProgressUpdate {
        *self.stage.lock().expect("stage poisoned") = stage;
        let mut update = ProgressUpdate::new(self.job_id.clone(), stage);
        update.percent_complete = self.percent();
        update.completed_nodes = self.completed_nodes.load(Ordering::SeqCst);
        update.total_nodes = self.total_nodes.load(Ordering::SeqCst);
        update
    }

    fn notify(&self, update: &ProgressUpdate) {
        for listener in self.listeners.lock().expect("listeners poisoned").iter() {
            listener(update);
        }
    }

    /// Queue an update for the next flush.
    async fn merge(&self, update: ProgressUpdate) {
        if self.terminal.load(Ordering::SeqCst) {
            return;
        }
        self.notify(&update);
        *self.pending.lock().await = Some(update);
    }

    /// Send an update straight to the backend, dropping anything queued.
    async fn send_now(&self, update: ProgressUpdate) {
        self.notify(&update);
        *self.pending.lock().await = None;
        if let Err(e) = self.backend.update_progress(&update).await {
            debug!(job_id = %self.job_id, error = %e, "progress update dropped");
        }
    }

    /// Begin reporting: records the starting stage and spawns the flush
    /// timer.
    pub async fn start_job(&self, workflow_name: &str, total_nodes: u32) {
        *self.workflow_name.lock().expect("name poisoned") = workflow_name.to_string();
        self.total_nodes.store(total_nodes, Ordering::SeqCst);
        self.completed_nodes.store(0, Ordering::SeqCst);

        let mut update = self.compose(ProgressStage::Starting);
        update.message = Some(format!("Starting {}", workflow_name));
        self.merge(update).await;

        let pending = Arc::clone(&self.pending);
        let terminal = Arc::clone(&self.terminal);
        let backend = Arc::clone(&self.backend);
        let job_id = self.job_id.clone();
        let flush_interval = self.flush_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if terminal.load(Ordering::SeqCst) {
                    break;
                }
                let queued = pending.lock().await.take();
                if let Some(update) = queued {
                    if let Err(e) = backend.update_progress(&update).await {
                        debug!(job_id = %job_id, error = %e, "progress flush failed");
                    }
                }
            }
        });
        *self.flush_task.lock().expect("task poisoned") = Some(handle);
    }

    pub async fn update_stage(&self, stage: ProgressStage, message: Option<&str>) {
        let mut update = self.compose(stage);
        update.message = message.map(String::from);
        self.merge(update).await;
    }

    pub async fn report_node_start(&self, node_id: &str, node_type: &str, name: &str) {
        let mut update = self.compose(ProgressStage::Executing);
        update.current_node_id = Some(node_id.to_string());
        update.current_node_name = Some(name.to_string());
        update.message = Some(format!("Executing {}", node_type));
        self.merge(update).await;
    }

    pub async fn report_node_complete(
        &self,
        node_id: &str,
        success: bool,
        duration_ms: u64,
        error: Option<&str>,
    ) {
        if success {
            self.completed_nodes.fetch_add(1, Ordering::SeqCst);
        }
        let mut update = self.compose(ProgressStage::Executing);
        update.current_node_id = Some(node_id.to_string());
        update.error = error.map(String::from);
        update.message = Some(if success {
            format!("Node {} completed in {}ms", node_id, duration_ms)
        } else {
            format!("Node {} failed", node_id)
        });
        self.merge(update).await;
    }

    /// Terminal: flushed immediately, later updates are dropped.
    pub async fn end_job(&self, success: bool, error: Option<&str>) {
        let stage = if success {
            ProgressStage::Completed
        } else {
            ProgressStage::Failed
        };
        let workflow_name = self.workflow_name.lock().expect("name poisoned").clone();
        let mut update = self.compose(stage);
        if success {
            update.percent_complete = 100.0;
        }
        update.message = Some(format!(
            "Workflow {} {}",
            workflow_name,
            if success { "completed" } else { "failed" }
        ));
        update.success = Some(success);
        update.error = error.map(String::from);
        self.terminal.store(true, Ordering::SeqCst);
        self.send_now(update).await;
        self.stop_flush();
    }

    /// Terminal cancellation notice; flushed immediately.
    pub async fn report_cancelled(&self, reason: Option<&str>) {
        let mut update = self.compose(ProgressStage::Cancelled);
        update.success = Some(false);
        update.message = reason.map(String::from);
        update.error = Some(format!(
            "cancelled: {}",
            reason.unwrap_or("requested by orchestrator")
        ));
        self.terminal.store(true, Ordering::SeqCst);
        self.send_now(update).await;
        self.stop_flush();
    }

    fn stop_flush(&self) {
        if let Some(handle) = self.flush_task.lock().expect("task poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(handle) = self.flush_task.lock().expect("task poisoned").take() {
            handle.abort();
        }
    }
}

/// Polls the backend's `cancel_requested` flag for one job.
///
/// The executor's job loop observes the flag between engine polls;
/// observation latency is bounded by the check interval.
pub struct CancellationChecker {
    backend: Arc<dyn BackendQueue>,
    interval: Duration,
    cancelled: Arc<AtomicBool>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl CancellationChecker {
    pub fn new(backend: Arc<dyn BackendQueue>, interval: Duration) -> Self {
        Self {
            backend,
            interval,
            cancelled: Arc::new(AtomicBool::new(false)),
            task: StdMutex::new(None),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Shared flag for the executor's polling loop.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// One immediate check, outside the polling cadence.
    pub async fn check_once(&self, job_id: &str) -> bool {
        match self.backend.cancel_requested(job_id).await {
            Ok(true) => {
                self.cancelled.store(true, Ordering::SeqCst);
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(job_id, error = %e, "cancellation check failed");
                false
            }
        }
    }

    pub fn start(&self, job_id: &str) {
        let backend = Arc::clone(&self.backend);
        let cancelled = Arc::clone(&self.cancelled);
        let interval = self.interval;
        let job_id = job_id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match backend.cancel_requested(&job_id).await {
                    Ok(true) => {
                        cancelled.store(true, Ordering::SeqCst);
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => debug!(job_id = %job_id, error = %e, "cancellation poll failed"),
                }
            }
        });
        *self.task.lock().expect("task poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().expect("task poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for CancellationChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Optimistic claim/release against the backend job row. A periodic
/// heartbeat extends the lease; if it stops, the orchestrator reclaims
/// the job after the visibility timeout.
pub struct JobLocker {
    backend: Arc<dyn BackendQueue>,
    robot_id: String,
}

impl JobLocker {
    pub fn new(backend: Arc<dyn BackendQueue>, robot_id: impl Into<String>) -> Self {
        Self {
            backend,
            robot_id: robot_id.into(),
        }
    }

    /// True when the row was still pending and unclaimed.
    pub async fn try_claim(&self, job_id: &str) -> bool {
        match self.backend.try_lock_job(job_id, &self.robot_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                debug!(job_id, error = %e, "lock attempt failed");
                false
            }
        }
    }

    pub async fn release(&self, job_id: &str) {
        if let Err(e) = self.backend.release_job(job_id).await {
            debug!(job_id, error = %e, "release failed");
        }
    }

    pub async fn heartbeat(&self, job_id: &str, seconds: i64) {
        if let Err(e) = self.backend.extend_lease(job_id, seconds).await {
            debug!(job_id, error = %e, "lease extension failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::RobotResult;
    use crate::domain::models::job::Job;
    use crate::domain::models::robot::{PresenceSnapshot, RobotRegistration, RobotStatusKind};
    use async_trait::async_trait;

    /// Backend fake that records progress writes and exposes a settable
    /// cancel flag.
    #[derive(Default)]
    struct RecordingBackend {
        updates: StdMutex<Vec<ProgressUpdate>>,
        cancel: AtomicBool,
        fail_progress: AtomicBool,
    }

    #[async_trait]
    impl BackendQueue for RecordingBackend {
        async fn ping(&self) -> RobotResult<()> {
            Ok(())
        }
        async fn claim_job(&self, _: &str, _: &str) -> RobotResult<Option<Job>> {
            Ok(None)
        }
        async fn try_lock_job(&self, _: &str, _: &str) -> RobotResult<bool> {
            Ok(true)
        }
        async fn extend_lease(&self, _: &str, _: i64) -> RobotResult<()> {
            Ok(())
        }
        async fn release_job(&self, _: &str) -> RobotResult<()> {
            Ok(())
        }
        async fn complete_job(&self, _: &str, _: &serde_json::Value) -> RobotResult<()> {
            Ok(())
        }
        async fn fail_job(&self, _: &str, _: &str) -> RobotResult<()> {
            Ok(())
        }
        async fn cancel_job(&self, _: &str, _: &str) -> RobotResult<()> {
            Ok(())
        }
        async fn update_progress(&self, update: &ProgressUpdate) -> RobotResult<()> {
            if self.fail_progress.load(Ordering::SeqCst) {
                return Err(crate::domain::errors::RobotError::Transient(
                    "backend offline".into(),
                ));
            }
            self.updates.lock().unwrap().push(update.clone());
            Ok(())
        }
        async fn cancel_requested(&self, _: &str) -> RobotResult<bool> {
            Ok(self.cancel.load(Ordering::SeqCst))
        }
        async fn upsert_registration(&self, _: &RobotRegistration) -> RobotResult<()> {
            Ok(())
        }
        async fn update_robot_status(&self, _: &str, _: RobotStatusKind) -> RobotResult<()> {
            Ok(())
        }
        async fn update_presence(&self, _: &str, _: &PresenceSnapshot) -> RobotResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_coalescing_keeps_latest() {
        let backend = Arc::new(RecordingBackend::default());
        let reporter = Arc::new(ProgressReporter::new(
            "j1",
            backend.clone() as Arc<dyn BackendQueue>,
            Duration::from_millis(30),
        ));
        reporter.start_job("demo", 4).await;

        // Burst of updates inside one flush window.
        for node in ["a", "b", "c"] {
            reporter.report_node_start(node, "test.step", node).await;
            reporter.report_node_complete(node, true, 1, None).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let updates = backend.updates.lock().unwrap();
        // Far fewer writes than merges; the last one carries node c.
        assert!(!updates.is_empty());
        assert!(updates.len() <= 3, "got {} writes", updates.len());
        let last = updates.last().unwrap();
        assert_eq!(last.current_node_id.as_deref(), Some("c"));
        assert_eq!(last.completed_nodes, 3);
        assert_eq!(last.percent_complete, 75.0);
    }

    #[tokio::test]
    async fn test_end_job_flushes_immediately_and_seals() {
        let backend = Arc::new(RecordingBackend::default());
        let reporter = Arc::new(ProgressReporter::new(
            "j1",
            backend.clone() as Arc<dyn BackendQueue>,
            Duration::from_secs(60),
        ));
        reporter.start_job("demo", 2).await;
        reporter.report_node_complete("a", true, 1, None).await;
        reporter.report_node_complete("b", true, 1, None).await;
        reporter.end_job(true, None).await;

        {
            let updates = backend.updates.lock().unwrap();
            let last = updates.last().unwrap();
            assert_eq!(last.stage, ProgressStage::Completed);
            assert_eq!(last.percent_complete, 100.0);
            assert_eq!(last.success, Some(true));
        }

        // Updates after the terminal event are dropped.
        reporter.update_stage(ProgressStage::Executing, None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let updates = backend.updates.lock().unwrap();
        assert_eq!(updates.last().unwrap().stage, ProgressStage::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_notice_contains_reason() {
        let backend = Arc::new(RecordingBackend::default());
        let reporter = Arc::new(ProgressReporter::new(
            "j1",
            backend.clone() as Arc<dyn BackendQueue>,
            Duration::from_secs(60),
        ));
        reporter.start_job("demo", 1).await;
        reporter.report_cancelled(Some("user request")).await;

        let updates = backend.updates.lock().unwrap();
        let last = updates.last().unwrap();
        assert_eq!(last.stage, ProgressStage::Cancelled);
        assert!(last.error.as_deref().unwrap().contains("cancel"));
    }

    #[tokio::test]
    async fn test_progress_failure_never_propagates() {
        let backend = Arc::new(RecordingBackend::default());
        backend.fail_progress.store(true, Ordering::SeqCst);
        let reporter = Arc::new(ProgressReporter::new(
            "j1",
            backend.clone() as Arc<dyn BackendQueue>,
            Duration::from_millis(10),
        ));
        reporter.start_job("demo", 1).await;
        reporter.report_node_complete("a", true, 1, None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        // No panic, no error; the terminal write also swallows the failure.
        reporter.end_job(true, None).await;
    }

    #[tokio::test]
    async fn test_local_listeners_fire_synchronously() {
        let backend = Arc::new(RecordingBackend::default());
        let reporter = Arc::new(ProgressReporter::new(
            "j1",
            backend as Arc<dyn BackendQueue>,
            Duration::from_secs(60),
        ));
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        reporter.add_listener(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        reporter.start_job("demo", 1).await;
        reporter.report_node_complete("a", true, 1, None).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_checker_observes_flag() {
        let backend = Arc::new(RecordingBackend::default());
        let checker = CancellationChecker::new(
            backend.clone() as Arc<dyn BackendQueue>,
            Duration::from_millis(10),
        );
        checker.start("j1");
        assert!(!checker.is_cancelled());

        backend.cancel.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(checker.is_cancelled());
        checker.stop();
    }

    #[tokio::test]
    async fn test_check_once() {
        let backend = Arc::new(RecordingBackend::default());
        let checker = CancellationChecker::new(
            backend.clone() as Arc<dyn BackendQueue>,
            Duration::from_secs(60),
        );
        assert!(!checker.check_once("j1").await);
        backend.cancel.store(true, Ordering::SeqCst);
        assert!(checker.check_once("j1").await);
        assert!(checker.is_cancelled());
    }
}
