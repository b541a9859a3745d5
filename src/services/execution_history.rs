//! Scheduler execution history.
//!
//! A ring of execution records persisted to one JSON file. Pruning runs
//! on every insert: newest `max_entries` kept, anything older than the
//! retention window dropped.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::warn;

use crate::domain::models::schedule::{ExecutionRecord, RunStatus};

pub struct ExecutionHistory {
    path: Option<PathBuf>,
    max_entries: usize,
    retention_days: u32,
    entries: RwLock<VecDeque<ExecutionRecord>>,
}

impl ExecutionHistory {
    /// File-backed history; loads existing entries, tolerating a missing
    /// or unreadable file.
    pub fn open(path: PathBuf, max_entries: usize, retention_days: u32) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<ExecutionRecord>>(&raw) {
                Ok(list) => list.into(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "history file unreadable, starting empty");
                    VecDeque::new()
                }
            },
            Err(_) => VecDeque::new(),
        };
        Self {
            path: Some(path),
            max_entries,
            retention_days,
            entries: RwLock::new(entries),
        }
    }

    /// Memory-only history for tests.
    pub fn in_memory(max_entries: usize, retention_days: u32) -> Self {
        Self {
            path: None,
            max_entries,
            retention_days,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn add_entry(&self, record: ExecutionRecord) {
        let snapshot = {
            let mut entries = self.entries.write().await;
            entries.push_back(record);
            self.prune(&mut entries);
            entries.iter().cloned().collect::<Vec<_>>()
        };
        self.persist(&snapshot).await;
    }

    fn prune(&self, entries: &mut VecDeque<ExecutionRecord>) {
        let cutoff = Utc::now() - Duration::days(i64::from(self.retention_days));
        entries.retain(|e| e.started_at >= cutoff);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    async fn persist(&self, snapshot: &[ExecutionRecord]) {
        let Some(path) = &self.path else { return };
        let json = match serde_json::to_string_pretty(snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "history serialization failed");
                return;
            }
        };
        // Atomic replace so a crash mid-write never corrupts the file.
        let tmp = path.with_extension("json.tmp");
        let result = async {
            tokio::fs::write(&tmp, json.as_bytes()).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "history write failed");
        }
    }

    /// Query entries, newest first.
    pub async fn get_entries(
        &self,
        limit: usize,
        schedule_id: Option<&str>,
        status: Option<RunStatus>,
        since: Option<DateTime<Utc>>,
    ) -> Vec<ExecutionRecord> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .rev()
            .filter(|e| schedule_id.map_or(true, |id| e.schedule_id == id))
            .filter(|e| status.map_or(true, |s| e.status == s))
            .filter(|e| since.map_or(true, |t| e.started_at >= t))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_recent(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.get_entries(limit, None, None, None).await
    }

    pub async fn get_for_schedule(&self, schedule_id: &str, limit: usize) -> Vec<ExecutionRecord> {
        self.get_entries(limit, Some(schedule_id), None, None).await
    }

    pub async fn get_failures(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.get_entries(limit, None, Some(RunStatus::Failed), None)
            .await
    }

    pub async fn get_today(&self) -> Vec<ExecutionRecord> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| chrono::TimeZone::from_utc_datetime(&Utc, &t));
        self.get_entries(usize::MAX, None, None, midnight).await
    }

    /// Success/failure aggregates over the last `days`.
    pub async fn get_statistics(&self, days: u32) -> serde_json::Value {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let entries = self.entries.read().await;
        let window: Vec<&ExecutionRecord> =
            entries.iter().filter(|e| e.started_at >= cutoff).collect();

        let total = window.len();
        let successful = window.iter().filter(|e| e.success).count();
        let mut by_schedule: std::collections::HashMap<&str, (u64, u64)> =
            std::collections::HashMap::new();
        for entry in &window {
            let bucket = by_schedule.entry(entry.schedule_id.as_str()).or_default();
            bucket.0 += 1;
            if entry.success {
                bucket.1 += 1;
            }
        }

        serde_json::json!({
            "days": days,
            "total": total,
            "successful": successful,
            "failed": total - successful,
            "success_rate": if total == 0 { 1.0 } else { successful as f64 / total as f64 },
            "by_schedule": by_schedule
                .into_iter()
                .map(|(id, (t, s))| (id.to_string(), serde_json::json!({"total": t, "successful": s})))
                .collect::<serde_json::Map<_, _>>(),
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
