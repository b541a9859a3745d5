//! Backend connection management.
//!
//! Maintains the logical session to the backend queue service and runs
//! operations through it, reconnecting with exponential backoff when the
//! session drops. The circuit breaker sits outside this layer, so the
//! single retry here runs at most once per breaker admission.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::domain::errors::{RobotError, RobotResult};
use crate::domain::models::config::ConnectionSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; terminal.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Apply +/-25% randomization to reconnect delays.
    pub jitter: bool,
    /// Zero means retry forever.
    pub max_reconnect_attempts: u32,
    pub connection_timeout: Duration,
    pub operation_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
            max_reconnect_attempts: 0,
            connection_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&ConnectionSettings> for ConnectionConfig {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            initial_delay: Duration::from_secs_f64(settings.initial_delay_seconds),
            max_delay: Duration::from_secs_f64(settings.max_delay_seconds),
            backoff_multiplier: settings.backoff_multiplier,
            jitter: settings.jitter,
            max_reconnect_attempts: settings.max_reconnect_attempts,
            connection_timeout: Duration::from_secs_f64(settings.connection_timeout_seconds),
            operation_timeout: Duration::from_secs_f64(settings.operation_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConnectionStats {
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
}

/// Factory for backend sessions. The production connector yields a
/// PostgreSQL pool; tests yield an in-memory handle.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Clone + Send + Sync + 'static;

    async fn connect(&self) -> anyhow::Result<Self::Session>;

    /// Minimal probe over an existing session.
    async fn ping(&self, session: &Self::Session) -> anyhow::Result<()>;
}

/// State-change callbacks for observability.
#[derive(Clone, Default)]
pub struct ConnectionEvents {
    pub on_connected: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_disconnected: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_reconnecting: Option<Arc<dyn Fn(u32) + Send + Sync>>,
}

pub struct ConnectionManager<C: Connector> {
    connector: C,
    config: ConnectionConfig,
    state: RwLock<ConnectionState>,
    session: RwLock<Option<C::Session>>,
    reconnect_attempt: AtomicU32,
    consecutive_failures: AtomicU32,
    last_success: Mutex<Option<DateTime<Utc>>>,
    stats: Mutex<ConnectionStats>,
    events: ConnectionEvents,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, config: ConnectionConfig) -> Self {
        Self {
            connector,
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            session: RwLock::new(None),
            reconnect_attempt: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_success: Mutex::new(None),
            stats: Mutex::new(ConnectionStats::default()),
            events: ConnectionEvents::default(),
        }
    }

    pub fn with_events(mut self, events: ConnectionEvents) -> Self {
        self.events = events;
        self
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    pub async fn stats(&self) -> ConnectionStats {
        *self.stats.lock().await
    }

    /// Backoff delay for a given attempt (0-indexed):
    /// `initial * multiplier^attempt` capped at `max_delay`, with
    /// optional +/-25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi(attempt.min(32) as i32);
        let capped = base.min(self.config.max_delay.as_secs_f64());
        let secs = if self.config.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Establish a fresh session.
    pub async fn connect(&self) -> RobotResult<()> {
        *self.state.write().await = ConnectionState::Connecting;
        self.stats.lock().await.connection_attempts += 1;

        let connected =
            tokio::time::timeout(self.config.connection_timeout, self.connector.connect()).await;

        match connected {
            Ok(Ok(session)) => {
                *self.session.write().await = Some(session);
                *self.state.write().await = ConnectionState::Connected;
                self.reconnect_attempt.store(0, Ordering::SeqCst);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                *self.last_success.lock().await = Some(Utc::now());
                self.stats.lock().await.successful_connections += 1;
                info!("backend connection established");
                if let Some(cb) = &self.events.on_connected {
                    cb();
                }
                Ok(())
            }
            Ok(Err(e)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                self.stats.lock().await.failed_connections += 1;
                warn!(error = %e, "backend connection failed");
                Err(RobotError::NotConnected(e.to_string()))
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                self.stats.lock().await.failed_connections += 1;
                warn!(
                    timeout_secs = self.config.connection_timeout.as_secs(),
                    "backend connection timed out"
                );
                Err(RobotError::NotConnected("connection timed out".into()))
            }
        }
    }

    /// One delayed reconnect attempt. The attempt counter persists
    /// across calls, so repeated failures see exponentially growing
    /// delays until a connect succeeds.
    pub async fn reconnect(&self) -> RobotResult<()> {
        let attempt = self.reconnect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.max_reconnect_attempts > 0 && attempt > self.config.max_reconnect_attempts
        {
            *self.state.write().await = ConnectionState::Failed;
            return Err(RobotError::NotConnected(format!(
                "reconnect attempts exhausted after {}",
                attempt - 1
            )));
        }

        *self.state.write().await = ConnectionState::Reconnecting;
        if let Some(cb) = &self.events.on_reconnecting {
            cb(attempt);
        }

        let delay = self.delay_for(attempt - 1);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
        self.connect().await
    }

    /// Close the session; used at shutdown.
    pub async fn disconnect(&self) {
        *self.session.write().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn mark_disconnected(&self) {
        *self.state.write().await = ConnectionState::Disconnected;
        if let Some(cb) = &self.events.on_disconnected {
            cb();
        }
    }

    async fn current_session(&self) -> Option<C::Session> {
        if *self.state.read().await != ConnectionState::Connected {
            return None;
        }
        self.session.read().await.clone()
    }

    async fn run_op<T, F, Fut>(&self, op: &F, session: C::Session) -> RobotResult<T>
    where
        F: Fn(C::Session) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.config.operation_timeout, op(session)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RobotError::Transient(e.to_string())),
            Err(_) => Err(RobotError::OperationTimeout {
                seconds: self.config.operation_timeout.as_secs(),
            }),
        }
    }

    async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_success.lock().await = Some(Utc::now());
        self.stats.lock().await.successful_operations += 1;
    }

    async fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        self.stats.lock().await.failed_operations += 1;
    }

    /// Run `op` against the live session.
    ///
    /// Connects first when disconnected. On failure with `retry` set,
    /// reconnects once and retries the operation exactly once; the
    /// original error is surfaced if either step fails.
    pub async fn execute<T, F, Fut>(&self, op: F, retry: bool) -> RobotResult<T>
    where
        F: Fn(C::Session) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let session = match self.current_session().await {
            Some(session) => session,
            None => {
                self.connect().await?;
                self.current_session()
                    .await
                    .ok_or_else(|| RobotError::NotConnected("no session after connect".into()))?
            }
        };

        let first_error = match self.run_op(&op, session).await {
            Ok(value) => {
                self.record_success().await;
                return Ok(value);
            }
            Err(e) => {
                self.record_failure().await;
                e
            }
        };

        if !retry {
            return Err(first_error);
        }

        self.mark_disconnected().await;
        if self.reconnect().await.is_ok() {
            if let Some(session) = self.current_session().await {
                match self.run_op(&op, session).await {
                    Ok(value) => {
                        self.record_success().await;
                        return Ok(value);
                    }
                    Err(_) => self.record_failure().await,
                }
            }
        }
        Err(first_error)
    }

    /// Probe the backend; true when it answered within the operation
    /// timeout.
    pub async fn health_check(&self) -> bool {
        let Some(session) = self.current_session().await else {
            return false;
        };
        matches!(
            tokio::time::timeout(self.config.operation_timeout, self.connector.ping(&session))
                .await,
            Ok(Ok(()))
        )
    }
}
