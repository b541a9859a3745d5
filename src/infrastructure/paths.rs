//! Filesystem layout under `~/.casare_rpa/`.
//!
//! Holds the persistent robot id, pid and status files, the offline
//! store database, agent self-checkpoints, and the log directories.
//! Writes that must survive a crash mid-write go through a temp file
//! and rename.

use std::path::{Path, PathBuf};
use tracing::warn;

use crate::domain::errors::{RobotError, RobotResult};
use crate::domain::models::checkpoint::AgentCheckpoint;

#[derive(Debug, Clone)]
pub struct RobotPaths {
    base: PathBuf,
}

impl RobotPaths {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// `~/.casare_rpa` unless overridden by configuration.
    pub fn resolve(data_dir: Option<&Path>) -> RobotResult<Self> {
        let base = match data_dir {
            Some(dir) => dir.to_path_buf(),
            None => dirs::home_dir()
                .ok_or_else(|| RobotError::Config("cannot resolve home directory".into()))?
                .join(".casare_rpa"),
        };
        let paths = Self::new(base);
        paths.ensure_layout()?;
        Ok(paths)
    }

    fn ensure_layout(&self) -> RobotResult<()> {
        for dir in [
            self.base.clone(),
            self.logs_dir(),
            self.audit_dir(),
            self.checkpoints_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| RobotError::Storage(format!("create {}: {}", dir.display(), e)))?;
        }
        Ok(())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.logs_dir().join("audit")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.base.join("checkpoints")
    }

    pub fn offline_db_path(&self) -> PathBuf {
        self.base.join("offline_queue.db")
    }

    pub fn history_path(&self) -> PathBuf {
        self.base.join("execution_history.json")
    }

    fn robot_id_file(&self) -> PathBuf {
        self.base.join("robot_id")
    }

    /// Resolve the persistent robot id. An explicit override wins; a
    /// previously persisted id is reused; otherwise a fresh UUID is
    /// generated and persisted.
    pub fn load_or_create_robot_id(&self, requested: Option<&str>) -> RobotResult<String> {
        if let Some(id) = requested {
            if id.is_empty() {
                return Err(RobotError::Config("robot id must not be empty".into()));
            }
            return Ok(id.to_string());
        }

        let file = self.robot_id_file();
        if let Ok(existing) = std::fs::read_to_string(&file) {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(existing.to_string());
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        std::fs::write(&file, &id)
            .map_err(|e| RobotError::Storage(format!("persist robot id: {}", e)))?;
        Ok(id)
    }

    /// The persisted robot id, if one exists. Never generates.
    pub fn read_robot_id(&self) -> Option<String> {
        let raw = std::fs::read_to_string(self.robot_id_file()).ok()?;
        let id = raw.trim();
        (!id.is_empty()).then(|| id.to_string())
    }

    pub fn pid_file(&self, robot_id: &str) -> PathBuf {
        self.base.join(format!("robot_{}.pid", robot_id))
    }

    pub fn write_pid_file(&self, robot_id: &str) -> std::io::Result<PathBuf> {
        let path = self.pid_file(robot_id);
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(path)
    }

    pub fn read_pid(&self, robot_id: &str) -> Option<i32> {
        std::fs::read_to_string(self.pid_file(robot_id))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub fn remove_pid_file(&self, robot_id: &str) {
        let _ = std::fs::remove_file(self.pid_file(robot_id));
    }

    pub fn status_file(&self, robot_id: &str) -> PathBuf {
        self.base.join(format!("robot_{}_status.json", robot_id))
    }

    pub fn write_status(&self, robot_id: &str, status: &serde_json::Value) {
        let path = self.status_file(robot_id);
        let payload = match serde_json::to_vec_pretty(status) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "status serialization failed");
                return;
            }
        };
        if let Err(e) = atomic_write(&path, &payload) {
            warn!(path = %path.display(), error = %e, "status write failed");
        }
    }

    pub fn read_status(&self, robot_id: &str) -> Option<serde_json::Value> {
        let raw = std::fs::read_to_string(self.status_file(robot_id)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn agent_checkpoint_path(&self, robot_id: &str) -> PathBuf {
        self.checkpoints_dir().join(format!("agent_{}.json", robot_id))
    }

    /// Write the latest self-checkpoint plus a timestamped sibling kept
    /// for retention.
    pub fn write_agent_checkpoint(&self, checkpoint: &AgentCheckpoint) -> std::io::Result<()> {
        let payload = serde_json::to_vec_pretty(checkpoint).map_err(std::io::Error::other)?;
        atomic_write(&self.agent_checkpoint_path(&checkpoint.robot_id), &payload)?;

        let stamped = self.checkpoints_dir().join(format!(
            "agent_{}_{}.json",
            checkpoint.robot_id,
            checkpoint.created_at.format("%Y%m%d_%H%M%S")
        ));
        atomic_write(&stamped, &payload)
    }

    pub fn read_agent_checkpoint(&self, robot_id: &str) -> Option<AgentCheckpoint> {
        let raw = std::fs::read_to_string(self.agent_checkpoint_path(robot_id)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(robot_id, error = %e, "agent checkpoint unreadable");
                None
            }
        }
    }

    /// Keep only the newest `keep` timestamped self-checkpoints.
    pub fn prune_agent_checkpoints(&self, robot_id: &str, keep: usize) -> std::io::Result<()> {
        let prefix = format!("agent_{}_", robot_id);
        let mut stamped: Vec<PathBuf> = std::fs::read_dir(self.checkpoints_dir())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        stamped.sort();
        let excess = stamped.len().saturating_sub(keep);
        for path in stamped.into_iter().take(excess) {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn atomic_write(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, payload)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::checkpoint::AgentStats;

    fn paths() -> (RobotPaths, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let paths = RobotPaths::resolve(Some(dir.path())).unwrap();
        (paths, dir)
    }

    #[test]
    fn test_robot_id_persists() {
        let (paths, _dir) = paths();
        let first = paths.load_or_create_robot_id(None).unwrap();
        let second = paths.load_or_create_robot_id(None).unwrap();
        assert_eq!(first, second);

        let overridden = paths.load_or_create_robot_id(Some("robot-x")).unwrap();
        assert_eq!(overridden, "robot-x");
        // The persisted id is untouched by an override.
        assert_eq!(paths.load_or_create_robot_id(None).unwrap(), first);
    }

    #[test]
    fn test_pid_file_round_trip() {
        let (paths, _dir) = paths();
        paths.write_pid_file("r1").unwrap();
        assert_eq!(paths.read_pid("r1"), Some(std::process::id() as i32));
        paths.remove_pid_file("r1");
        assert_eq!(paths.read_pid("r1"), None);
    }

    #[test]
    fn test_status_round_trip() {
        let (paths, _dir) = paths();
        let status = serde_json::json!({"state": "running", "current_job_count": 2});
        paths.write_status("r1", &status);
        assert_eq!(paths.read_status("r1").unwrap(), status);
    }

    #[test]
    fn test_agent_checkpoint_write_and_prune() {
        let (paths, _dir) = paths();
        for i in 0..5u64 {
            let mut checkpoint =
                AgentCheckpoint::new("r1", "running", AgentStats::default());
            checkpoint.stats.jobs_completed = i;
            checkpoint.created_at =
                chrono::Utc::now() + chrono::Duration::seconds(i as i64);
            paths.write_agent_checkpoint(&checkpoint).unwrap();
        }

        let latest = paths.read_agent_checkpoint("r1").unwrap();
        assert_eq!(latest.stats.jobs_completed, 4);

        paths.prune_agent_checkpoints("r1", 2).unwrap();
        let stamped = std::fs::read_dir(paths.checkpoints_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("agent_r1_")
            })
            .count();
        assert_eq!(stamped, 2);
        // The latest pointer survives pruning.
        assert!(paths.read_agent_checkpoint("r1").is_some());
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let (paths, _dir) = paths();
        assert!(paths.read_agent_checkpoint("ghost").is_none());
    }
}
