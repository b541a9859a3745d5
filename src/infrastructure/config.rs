//! Configuration loading and validation.
//!
//! Hierarchical merge, lowest to highest precedence: programmatic
//! defaults, an optional YAML file, then `CASARE_*` environment
//! variables. The backend URL may also arrive through the shared
//! `POSTGRES_URL` / `DATABASE_URL` / `SUPABASE_URL` variables.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::config::RobotConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_concurrent_jobs must be at least 1")]
    InvalidConcurrency,

    #[error("poll_interval must be positive, got {0}")]
    InvalidPollInterval(f64),

    #[error("heartbeat_interval must be positive, got {0}")]
    InvalidHeartbeatInterval(f64),

    #[error("visibility_timeout must be at least 1 second")]
    InvalidVisibilityTimeout,

    #[error("batch_size must be at least 1")]
    InvalidBatchSize,

    #[error("connection backoff is inverted: initial {0}s > max {1}s")]
    InvalidBackoff(f64, f64),

    #[error("circuit breaker failure_threshold must be at least 1")]
    InvalidFailureThreshold,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration, merging the optional YAML file and the
    /// environment over the defaults.
    pub fn load(config_file: Option<&Path>) -> Result<RobotConfig> {
        let mut figment = Figment::new().merge(Serialized::defaults(RobotConfig::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Yaml::file(path));
        }
        let mut config: RobotConfig = figment
            .merge(Env::prefixed("CASARE_").split("__"))
            .extract()
            .context("failed to extract robot configuration")?;

        if config.database_url.is_none() {
            config.database_url = ["POSTGRES_URL", "DATABASE_URL", "SUPABASE_URL"]
                .iter()
                .find_map(|name| std::env::var(name).ok())
                .filter(|url| !url.is_empty());
        }

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &RobotConfig) -> Result<(), ConfigError> {
        if config.max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if config.poll_interval <= 0.0 {
            return Err(ConfigError::InvalidPollInterval(config.poll_interval));
        }
        if config.heartbeat_interval <= 0.0 {
            return Err(ConfigError::InvalidHeartbeatInterval(
                config.heartbeat_interval,
            ));
        }
        if config.visibility_timeout == 0 {
            return Err(ConfigError::InvalidVisibilityTimeout);
        }
        if config.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if config.connection.initial_delay_seconds > config.connection.max_delay_seconds {
            return Err(ConfigError::InvalidBackoff(
                config.connection.initial_delay_seconds,
                config.connection.max_delay_seconds,
            ));
        }
        if config.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults() {
        let config = ConfigLoader::load(None).unwrap();
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.environment, "default");
    }

    #[test]
    fn test_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("robot.yaml");
        std::fs::write(
            &path,
            "max_concurrent_jobs: 4\nenvironment: staging\ncircuit_breaker:\n  failure_threshold: 3\n",
        )
        .unwrap();

        let config = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.environment, "staging");
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        // Untouched sections keep defaults.
        assert_eq!(config.circuit_breaker.success_threshold, 2);
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let config = RobotConfig {
            max_concurrent_jobs: 0,
            ..Default::default()
        };
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidConcurrency)
        ));
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let mut config = RobotConfig::default();
        config.connection.initial_delay_seconds = 500.0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(_, _))
        ));
    }
}
