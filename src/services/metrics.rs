//! In-memory execution metrics.
//!
//! Tracks per-job and per-node-type timings, a bounded recent-error
//! list, and periodic host resource samples. Everything lives behind one
//! RwLock held only for short, non-awaiting sections.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::{watch, RwLock};
use tracing::debug;

const MAX_RECENT_JOBS: usize = 50;
const MAX_ERRORS: usize = 100;
const MAX_RESOURCE_SNAPSHOTS: usize = 120;

#[derive(Debug, Clone, Serialize)]
pub struct JobMetrics {
    pub job_id: String,
    pub workflow_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub nodes_executed: u32,
    pub nodes_failed: u32,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NodeTypeStats {
    pub count: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl NodeTypeStats {
    pub fn avg_duration_ms(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_duration_ms / self.count
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_mb: u64,
    pub memory_percent: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub node_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_active: usize,
    pub nodes_executed: u64,
    pub nodes_failed: u64,
    pub nodes_skipped: u64,
    pub avg_job_duration_ms: u64,
}

#[derive(Debug, Default)]
struct Inner {
    active_jobs: HashMap<String, JobMetrics>,
    recent_jobs: VecDeque<JobMetrics>,
    node_stats: HashMap<String, NodeTypeStats>,
    errors: VecDeque<ErrorEntry>,
    resources: VecDeque<ResourceSnapshot>,
    jobs_started: u64,
    jobs_completed: u64,
    jobs_failed: u64,
    nodes_executed: u64,
    nodes_failed: u64,
    nodes_skipped: u64,
    total_job_duration_ms: u64,
}

pub struct MetricsCollector {
    inner: RwLock<Inner>,
    sample_interval: Duration,
}

impl MetricsCollector {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            sample_interval,
        }
    }

    pub async fn start_job(&self, job_id: &str, workflow_name: &str) {
        let mut inner = self.inner.write().await;
        inner.jobs_started += 1;
        inner.active_jobs.insert(
            job_id.to_string(),
            JobMetrics {
                job_id: job_id.to_string(),
                workflow_name: workflow_name.to_string(),
                started_at: Utc::now(),
                completed_at: None,
                success: None,
                error: None,
                nodes_executed: 0,
                nodes_failed: 0,
                duration_ms: None,
            },
        );
    }

    /// Close out a job's metrics; returns the measured duration.
    pub async fn end_job(&self, job_id: &str, success: bool, error: Option<&str>) -> Option<u64> {
        let mut inner = self.inner.write().await;
        let mut job = inner.active_jobs.remove(job_id)?;

        let now = Utc::now();
        let duration_ms = (now - job.started_at).num_milliseconds().max(0) as u64;
        job.completed_at = Some(now);
        job.success = Some(success);
        job.error = error.map(String::from);
        job.duration_ms = Some(duration_ms);

        if success {
            inner.jobs_completed += 1;
        } else {
            inner.jobs_failed += 1;
        }
        inner.total_job_duration_ms += duration_ms;

        while inner.recent_jobs.len() >= MAX_RECENT_JOBS {
            inner.recent_jobs.pop_front();
        }
        inner.recent_jobs.push_back(job);
        Some(duration_ms)
    }

    pub async fn record_node(
        &self,
        job_id: &str,
        node_id: &str,
        node_type: &str,
        success: bool,
        duration_ms: u64,
        error: Option<&str>,
    ) {
        let mut inner = self.inner.write().await;
        inner.nodes_executed += 1;
        if !success {
            inner.nodes_failed += 1;
        }

        if let Some(job) = inner.active_jobs.get_mut(job_id) {
            job.nodes_executed += 1;
            if !success {
                job.nodes_failed += 1;
            }
        }

        let stats = inner.node_stats.entry(node_type.to_string()).or_default();
        stats.count += 1;
        if !success {
            stats.failures += 1;
        }
        stats.total_duration_ms += duration_ms;
        if stats.count == 1 || duration_ms < stats.min_duration_ms {
            stats.min_duration_ms = duration_ms;
        }
        if duration_ms > stats.max_duration_ms {
            stats.max_duration_ms = duration_ms;
        }

        if let Some(message) = error {
            while inner.errors.len() >= MAX_ERRORS {
                inner.errors.pop_front();
            }
            inner.errors.push_back(ErrorEntry {
                timestamp: Utc::now(),
                job_id: job_id.to_string(),
                node_id: Some(node_id.to_string()),
                message: message.to_string(),
            });
        }
    }

    pub async fn record_node_skipped(&self, node_id: &str) {
        let mut inner = self.inner.write().await;
        inner.nodes_skipped += 1;
        debug!(node_id, "node skipped on resume");
    }

    pub async fn record_resource_snapshot(&self, snapshot: ResourceSnapshot) {
        let mut inner = self.inner.write().await;
        while inner.resources.len() >= MAX_RESOURCE_SNAPSHOTS {
            inner.resources.pop_front();
        }
        inner.resources.push_back(snapshot);
    }

    pub async fn current_resources(&self) -> Option<ResourceSnapshot> {
        self.inner.read().await.resources.back().copied()
    }

    pub async fn summary(&self) -> MetricsSummary {
        let inner = self.inner.read().await;
        let finished = inner.jobs_completed + inner.jobs_failed;
        MetricsSummary {
            jobs_started: inner.jobs_started,
            jobs_completed: inner.jobs_completed,
            jobs_failed: inner.jobs_failed,
            jobs_active: inner.active_jobs.len(),
            nodes_executed: inner.nodes_executed,
            nodes_failed: inner.nodes_failed,
            nodes_skipped: inner.nodes_skipped,
            avg_job_duration_ms: if finished == 0 {
                0
            } else {
                inner.total_job_duration_ms / finished
            },
        }
    }

    pub async fn node_stats(&self) -> HashMap<String, NodeTypeStats> {
        self.inner.read().await.node_stats.clone()
    }

    pub async fn error_summary(&self, limit: usize) -> Vec<ErrorEntry> {
        let inner = self.inner.read().await;
        inner.errors.iter().rev().take(limit).cloned().collect()
    }

    pub async fn recent_jobs(&self, limit: usize) -> Vec<JobMetrics> {
        let inner = self.inner.read().await;
        inner.recent_jobs.iter().rev().take(limit).cloned().collect()
    }

    pub async fn full_report(&self) -> serde_json::Value {
        let summary = self.summary().await;
        let inner = self.inner.read().await;
        serde_json::json!({
            "summary": summary,
            "node_stats": inner.node_stats,
            "recent_errors": inner.errors.iter().rev().take(10).collect::<Vec<_>>(),
            "resources": inner.resources.back(),
        })
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
    }

    /// Spawn the resource sampling loop; exits when `shutdown` flips.
    pub fn start_resource_monitoring(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let collector = Arc::clone(&self);
        let sample_interval = self.sample_interval;
        tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = tokio::time::interval(sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        system.refresh_cpu_usage();
                        system.refresh_memory();
                        let total = system.total_memory();
                        let used = system.used_memory();
                        let snapshot = ResourceSnapshot {
                            timestamp: Utc::now(),
                            cpu_percent: system.global_cpu_usage(),
                            memory_mb: used / (1024 * 1024),
                            memory_percent: if total == 0 {
                                0.0
                            } else {
                                (used as f32 / total as f32) * 100.0
                            },
                        };
                        collector.record_resource_snapshot(snapshot).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let metrics = collector();
        metrics.start_job("j1", "demo").await;

        let summary = metrics.summary().await;
        assert_eq!(summary.jobs_started, 1);
        assert_eq!(summary.jobs_active, 1);

        let duration = metrics.end_job("j1", true, None).await;
        assert!(duration.is_some());

        let summary = metrics.summary().await;
        assert_eq!(summary.jobs_completed, 1);
        assert_eq!(summary.jobs_active, 0);
        assert_eq!(metrics.recent_jobs(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_end_unknown_job() {
        let metrics = collector();
        assert!(metrics.end_job("ghost", true, None).await.is_none());
    }

    #[tokio::test]
    async fn test_node_stats_aggregation() {
        let metrics = collector();
        metrics.start_job("j1", "demo").await;
        metrics
            .record_node("j1", "a", "browser.click", true, 10, None)
            .await;
        metrics
            .record_node("j1", "b", "browser.click", true, 30, None)
            .await;
        metrics
            .record_node("j1", "c", "browser.click", false, 20, Some("timeout"))
            .await;

        let stats = metrics.node_stats().await;
        let click = &stats["browser.click"];
        assert_eq!(click.count, 3);
        assert_eq!(click.failures, 1);
        assert_eq!(click.min_duration_ms, 10);
        assert_eq!(click.max_duration_ms, 30);
        assert_eq!(click.avg_duration_ms(), 20);

        let errors = metrics.error_summary(5).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].node_id.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_failed_job_counts() {
        let metrics = collector();
        metrics.start_job("j1", "demo").await;
        metrics.end_job("j1", false, Some("boom")).await;

        let summary = metrics.summary().await;
        assert_eq!(summary.jobs_failed, 1);
        assert_eq!(summary.jobs_completed, 0);
    }

    #[tokio::test]
    async fn test_skips_and_reset() {
        let metrics = collector();
        metrics.record_node_skipped("a").await;
        metrics.record_node_skipped("b").await;
        assert_eq!(metrics.summary().await.nodes_skipped, 2);

        metrics.reset().await;
        assert_eq!(metrics.summary().await.nodes_skipped, 0);
    }

    #[tokio::test]
    async fn test_resource_ring_is_bounded() {
        let metrics = collector();
        for i in 0..(MAX_RESOURCE_SNAPSHOTS + 10) {
            metrics
                .record_resource_snapshot(ResourceSnapshot {
                    timestamp: Utc::now(),
                    cpu_percent: i as f32,
                    memory_mb: 100,
                    memory_percent: 10.0,
                })
                .await;
        }
        let inner = metrics.inner.read().await;
        assert_eq!(inner.resources.len(), MAX_RESOURCE_SNAPSHOTS);
    }
}
