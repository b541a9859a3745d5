//! Time-based workflow scheduling.
//!
//! A background loop checks for due schedules and dispatches each fire
//! under a concurrency semaphore. Overlapping fires of one schedule are
//! coalesced: its next-run time is not advanced until the current run
//! returns, so at most one missed fire runs afterwards. Failed and
//! timed-out runs are retried up to `max_retries` times with
//! `retry_delay_seconds` between attempts.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::errors::{RobotError, RobotResult};
use crate::domain::models::config::SchedulerSettings;
use crate::domain::models::schedule::{
    ExecutionRecord, RunStatus, Schedule, ScheduleSpec, ScheduleStatus,
};
use crate::domain::models::workflow::WorkflowDocument;
use crate::domain::ports::engine::{EngineRequest, WorkflowEngine};
use crate::services::execution_history::ExecutionHistory;

pub type StartCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type RecordCallback = Arc<dyn Fn(&ExecutionRecord) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SchedulerCallbacks {
    pub on_start: Option<StartCallback>,
    pub on_complete: Option<RecordCallback>,
    pub on_error: Option<RecordCallback>,
}

struct ScheduleEntry {
    schedule: Schedule,
    running: bool,
}

pub struct WorkflowScheduler {
    engine: Arc<dyn WorkflowEngine>,
    history: Arc<ExecutionHistory>,
    settings: SchedulerSettings,
    schedules: Arc<RwLock<HashMap<String, ScheduleEntry>>>,
    semaphore: Arc<Semaphore>,
    active_executions: Arc<AtomicUsize>,
    callbacks: SchedulerCallbacks,
    running: Arc<AtomicBool>,
    check_task: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkflowScheduler {
    pub fn new(
        engine: Arc<dyn WorkflowEngine>,
        history: Arc<ExecutionHistory>,
        settings: SchedulerSettings,
    ) -> Self {
        let max_concurrent = settings.max_concurrent_executions.max(1);
        Self {
            engine,
            history,
            settings,
            schedules: Arc::new(RwLock::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            active_executions: Arc::new(AtomicUsize::new(0)),
            callbacks: SchedulerCallbacks::default(),
            running: Arc::new(AtomicBool::new(false)),
            check_task: StdMutex::new(None),
        }
    }

    pub fn with_callbacks(mut self, callbacks: SchedulerCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Register a schedule; its first fire time is computed immediately.
    pub async fn add_schedule(&self, mut schedule: Schedule) -> RobotResult<()> {
        schedule.spec.validate()?;
        if schedule.next_run_at.is_none() {
            schedule.next_run_at = schedule.spec.next_fire(Utc::now());
        }
        let mut schedules = self.schedules.write().await;
        if schedules.contains_key(&schedule.id) {
            return Err(RobotError::Config(format!(
                "schedule '{}' already registered",
                schedule.id
            )));
        }
        info!(schedule = %schedule.name, next_run = ?schedule.next_run_at, "schedule registered");
        schedules.insert(
            schedule.id.clone(),
            ScheduleEntry {
                schedule,
                running: false,
            },
        );
        Ok(())
    }

    pub async fn remove_schedule(&self, schedule_id: &str) -> bool {
        self.schedules.write().await.remove(schedule_id).is_some()
    }

    /// Replace the definition; keeps run counters, recomputes next fire.
    pub async fn update_schedule(&self, schedule: Schedule) -> RobotResult<bool> {
        schedule.spec.validate()?;
        let mut schedules = self.schedules.write().await;
        let Some(entry) = schedules.get_mut(&schedule.id) else {
            return Ok(false);
        };
        let mut updated = schedule;
        updated.run_count = entry.schedule.run_count;
        updated.success_count = entry.schedule.success_count;
        updated.failure_count = entry.schedule.failure_count;
        updated.last_run_at = entry.schedule.last_run_at;
        updated.next_run_at = updated.spec.next_fire(Utc::now());
        updated.updated_at = Utc::now();
        entry.schedule = updated;
        Ok(true)
    }

    pub async fn pause_schedule(&self, schedule_id: &str) -> bool {
        self.set_status(schedule_id, ScheduleStatus::Paused).await
    }

    pub async fn resume_schedule(&self, schedule_id: &str) -> bool {
        let resumed = self.set_status(schedule_id, ScheduleStatus::Active).await;
        if resumed {
            let mut schedules = self.schedules.write().await;
            if let Some(entry) = schedules.get_mut(schedule_id) {
                entry.schedule.next_run_at = entry.schedule.spec.next_fire(Utc::now());
            }
        }
        resumed
    }

    async fn set_status(&self, schedule_id: &str, status: ScheduleStatus) -> bool {
        let mut schedules = self.schedules.write().await;
        match schedules.get_mut(schedule_id) {
            Some(entry) => {
                entry.schedule.status = status;
                entry.schedule.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Option<Schedule> {
        self.schedules
            .read()
            .await
            .get(schedule_id)
            .map(|e| e.schedule.clone())
    }

    pub async fn list_schedules(&self) -> Vec<Schedule> {
        self.schedules
            .read()
            .await
            .values()
            .map(|e| e.schedule.clone())
            .collect()
    }

    /// Upcoming fires across all active schedules, soonest first.
    pub async fn get_next_runs(&self, limit: usize) -> Vec<(String, chrono::DateTime<Utc>)> {
        let schedules = self.schedules.read().await;
        let mut runs: Vec<(String, chrono::DateTime<Utc>)> = schedules
            .values()
            .filter(|e| e.schedule.status == ScheduleStatus::Active)
            .filter_map(|e| e.schedule.next_run_at.map(|t| (e.schedule.name.clone(), t)))
            .collect();
        runs.sort_by_key(|(_, t)| *t);
        runs.truncate(limit);
        runs
    }

    pub fn active_execution_count(&self) -> usize {
        self.active_executions.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the trigger-evaluation loop.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let interval = Duration::from_secs(self.settings.check_interval_seconds.max(1));
        let scheduler = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            while scheduler.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                Arc::clone(&scheduler).check_due_schedules().await;
            }
        });
        *self.check_task.lock().expect("task poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.check_task.lock().expect("task poisoned").take() {
            handle.abort();
        }
    }

    /// One pass over the registered schedules, dispatching every due
    /// fire. Public so callers with their own cadence can drive it.
    pub async fn check_due_schedules(self: Arc<Self>) {
        let now = Utc::now();
        let due: Vec<String> = {
            let mut schedules = self.schedules.write().await;
            schedules
                .values_mut()
                .filter(|e| {
                    e.schedule.status == ScheduleStatus::Active
                        && !e.running
                        && e.schedule.next_run_at.map(|t| t <= now).unwrap_or(false)
                })
                .map(|e| {
                    e.running = true;
                    e.schedule.id.clone()
                })
                .collect()
        };

        for schedule_id in due {
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                scheduler.execute_schedule(&schedule_id).await;
            });
        }
    }

    async fn execute_schedule(self: Arc<Self>, schedule_id: &str) {
        let _permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        self.active_executions.fetch_add(1, Ordering::SeqCst);

        let Some(schedule) = self.get_schedule(schedule_id).await else {
            self.active_executions.fetch_sub(1, Ordering::SeqCst);
            return;
        };

        let execution_id = Uuid::new_v4().to_string();
        if let Some(cb) = &self.callbacks.on_start {
            cb(schedule_id);
        }

        let started_at = Utc::now();
        let (success, error_message, attempts) = self.run_with_retries(&schedule).await;
        let completed_at = Utc::now();

        let record = ExecutionRecord {
            execution_id,
            schedule_id: schedule.id.clone(),
            schedule_name: schedule.name.clone(),
            workflow_path: schedule.workflow_path.display().to_string(),
            started_at,
            completed_at: Some(completed_at),
            status: if success {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            },
            success,
            duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
            error_message: error_message.clone().unwrap_or_default(),
            attempts,
        };
        self.history.add_entry(record.clone()).await;

        {
            let mut schedules = self.schedules.write().await;
            if let Some(entry) = schedules.get_mut(schedule_id) {
                entry.running = false;
                entry.schedule.run_count += 1;
                entry.schedule.last_run_at = Some(started_at);
                if success {
                    entry.schedule.success_count += 1;
                } else {
                    entry.schedule.failure_count += 1;
                }
                if matches!(entry.schedule.spec, ScheduleSpec::Once { .. }) {
                    entry.schedule.status = ScheduleStatus::Completed;
                    entry.schedule.next_run_at = None;
                } else {
                    // Computed from now, not the fire time: a run that
                    // outlived its own period coalesces the missed fires
                    // into the next check-loop pass.
                    entry.schedule.next_run_at = entry.schedule.spec.next_fire(Utc::now());
                }
            }
        }

        if success {
            if let Some(cb) = &self.callbacks.on_complete {
                cb(&record);
            }
        } else {
            error!(
                schedule = %schedule.name,
                error = %error_message.unwrap_or_default(),
                attempts,
                "schedule run failed"
            );
            if let Some(cb) = &self.callbacks.on_error {
                cb(&record);
            }
        }
        self.active_executions.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run one fire, retrying failed and timed-out attempts.
    async fn run_with_retries(&self, schedule: &Schedule) -> (bool, Option<String>, u32) {
        let max_attempts = self.settings.max_retries + 1;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.run_once(schedule).await {
                Ok(()) => return (true, None, attempt),
                Err(e) => {
                    // A missing workflow file cannot heal between retries.
                    let retryable = !matches!(e, RobotError::Workflow(_));
                    warn!(
                        schedule = %schedule.name,
                        attempt,
                        error = %e,
                        "schedule attempt failed"
                    );
                    last_error = Some(e.to_string());
                    if !retryable {
                        return (false, last_error, attempt);
                    }
                    if attempt < max_attempts && self.settings.retry_delay_seconds > 0 {
                        tokio::time::sleep(Duration::from_secs(self.settings.retry_delay_seconds))
                            .await;
                    }
                }
            }
        }
        (false, last_error, max_attempts)
    }

    async fn run_once(&self, schedule: &Schedule) -> RobotResult<()> {
        let raw = tokio::fs::read_to_string(&schedule.workflow_path)
            .await
            .map_err(|_| {
                RobotError::Workflow(format!(
                    "workflow file not found: {}",
                    schedule.workflow_path.display()
                ))
            })?;
        let document = WorkflowDocument::from_str(&raw)?;

        let mut variables = document.variables.clone();
        for (key, value) in &schedule.variables {
            variables.insert(key.clone(), value.clone());
        }

        let (events_tx, mut events_rx) = mpsc::channel(64);
        // Scheduler runs have no per-node consumer; drain so the engine
        // never blocks on a full channel.
        let drain = tokio::spawn(async move { while events_rx.recv().await.is_some() {} });

        let request = EngineRequest {
            job_id: format!("schedule-{}", schedule.id),
            document,
            variables,
            skip_nodes: Default::default(),
            node_timeout: Duration::from_secs(120),
        };
        let timeout = Duration::from_secs(self.settings.execution_timeout_seconds.max(1));
        let outcome = tokio::time::timeout(timeout, self.engine.run(request, events_tx)).await;
        drain.abort();

        match outcome {
            Ok(Ok(result)) if result.success => Ok(()),
            Ok(Ok(result)) => Err(RobotError::JobExecution {
                job_id: schedule.id.clone(),
                message: result.error.unwrap_or_else(|| "workflow failed".into()),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RobotError::JobExecution {
                job_id: schedule.id.clone(),
                message: format!("timed out after {}s", timeout.as_secs()),
            }),
        }
    }
}
