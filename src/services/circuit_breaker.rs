//! Circuit breaker for backend calls.
//!
//! Wraps an arbitrary async operation; blocks calls fast while the
//! wrapped system is failing and probes recovery with bounded
//! concurrency. Closed -> Open after `failure_threshold` consecutive
//! failures; Open -> HalfOpen once `open_timeout` elapses (checked on
//! every call attempt); HalfOpen -> Closed after `success_threshold`
//! consecutive successes, HalfOpen -> Open on any failure.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::domain::errors::RobotError;
use crate::domain::models::config::CircuitBreakerSettings;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// Concurrent probes admitted while half-open.
    pub half_open_max_calls: u32,
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            success_threshold: 2,
            half_open_max_calls: 3,
            enabled: true,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            open_timeout: Duration::from_secs(settings.open_timeout_seconds),
            success_threshold: settings.success_threshold,
            half_open_max_calls: settings.half_open_max_calls,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Cumulative call statistics. `times_opened` is non-decreasing;
/// `total_calls` counts every admission attempt, so
/// `total_calls >= successful + failed + blocked` holds at all times.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CircuitStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub blocked_calls: u64,
    pub times_opened: u64,
}

/// Observability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_in_flight: u32,
    pub stats: CircuitStats,
}

/// Error from a protected call.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the operation was never invoked.
    Open {
        name: String,
        seconds_remaining: u64,
    },
    /// The operation ran and failed.
    Operation(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open {
                name,
                seconds_remaining,
            } => write!(f, "circuit '{}' open, retry in {}s", name, seconds_remaining),
            Self::Operation(e) => write!(f, "operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { .. } => None,
            Self::Operation(e) => Some(e),
        }
    }
}

impl<E> CircuitBreakerError<E> {
    /// Flatten into the domain error, mapping inner errors with `f`.
    pub fn into_robot_error(self, f: impl FnOnce(E) -> RobotError) -> RobotError {
        match self {
            Self::Open {
                name,
                seconds_remaining,
            } => RobotError::CircuitOpen {
                name,
                seconds_remaining,
            },
            Self::Operation(e) => f(e),
        }
    }
}

pub type StateChangeListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    stats: CircuitStats,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            opened_at_utc: None,
            half_open_in_flight: 0,
            stats: CircuitStats::default(),
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_utc = Some(Utc::now());
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        self.stats.times_opened += 1;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.opened_at_utc = None;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
    }

    fn seconds_remaining(&self, open_timeout: Duration) -> u64 {
        self.opened_at
            .map(|at| open_timeout.saturating_sub(at.elapsed()).as_secs())
            .unwrap_or(0)
    }
}

/// Whether a call was admitted normally or as a half-open probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// A named three-state circuit breaker. All state transitions and
/// counter updates happen under one mutex; the protected operation runs
/// outside it.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    listener: Option<StateChangeListener>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: StateChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` through the breaker.
    ///
    /// When the circuit is open (or half-open saturated) the operation
    /// is never invoked and `CircuitBreakerError::Open` is returned.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let admission = match self.try_admit() {
            Ok(admission) => admission,
            Err(seconds_remaining) => {
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    seconds_remaining,
                })
            }
        };

        match op().await {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(admission);
                Err(CircuitBreakerError::Operation(e))
            }
        }
    }

    fn try_admit(&self) -> Result<Admission, u64> {
        let mut transition = None;
        let result = {
            let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
            inner.stats.total_calls += 1;

            if !self.config.enabled {
                return Ok(Admission::Normal);
            }

            if inner.state == CircuitState::Open {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.config.open_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.half_open_in_flight = 0;
                    transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                } else {
                    inner.stats.blocked_calls += 1;
                    return Err(inner.seconds_remaining(self.config.open_timeout));
                }
            }

            match inner.state {
                CircuitState::Closed => Ok(Admission::Normal),
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight >= self.config.half_open_max_calls {
                        inner.stats.blocked_calls += 1;
                        Err(0)
                    } else {
                        inner.half_open_in_flight += 1;
                        Ok(Admission::Probe)
                    }
                }
                CircuitState::Open => unreachable!("open handled above"),
            }
        };

        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
        result
    }

    fn on_success(&self, admission: Admission) {
        let mut transition = None;
        {
            let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
            inner.stats.successful_calls += 1;
            if admission == Admission::Probe {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
            match inner.state {
                CircuitState::Closed => inner.consecutive_failures = 0,
                CircuitState::HalfOpen => {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        inner.close();
                        transition = Some((CircuitState::HalfOpen, CircuitState::Closed));
                    }
                }
                CircuitState::Open => {}
            }
        }
        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut transition = None;
        {
            let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
            inner.stats.failed_calls += 1;
            if admission == Admission::Probe {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.open();
                        transition = Some((CircuitState::Closed, CircuitState::Open));
                    }
                }
                CircuitState::HalfOpen => {
                    inner.open();
                    transition = Some((CircuitState::HalfOpen, CircuitState::Open));
                }
                CircuitState::Open => {}
            }
        }
        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        if let Some(listener) = &self.listener {
            listener(&self.name, from, to);
        }
    }

    /// Force the circuit closed and clear the consecutive counters.
    /// Cumulative statistics are preserved.
    pub fn reset(&self) {
        let from = {
            let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
            let from = inner.state;
            inner.close();
            from
        };
        if from != CircuitState::Closed {
            self.notify(from, CircuitState::Closed);
        }
    }

    /// Force the circuit open.
    pub fn force_open(&self) {
        let from = {
            let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
            let from = inner.state;
            if from != CircuitState::Open {
                inner.open();
            }
            from
        };
        if from != CircuitState::Open {
            self.notify(from, CircuitState::Open);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .expect("circuit breaker mutex poisoned")
            .state
    }

    /// Whether the claim loop should back off without calling.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.state == CircuitState::Open
            && inner
                .opened_at
                .map(|at| at.elapsed() < self.config.open_timeout)
                .unwrap_or(false)
    }

    pub fn status(&self) -> CircuitStatus {
        let inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        CircuitStatus {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            opened_at: inner.opened_at_utc,
            half_open_in_flight: inner.half_open_in_flight,
            stats: inner.stats,
        }
    }
}

/// Named registry so multiple call-sites share one breaker. Injected
/// explicitly, never a process-wide singleton.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().expect("registry poisoned").get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write().expect("registry poisoned");
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    pub fn insert(&self, breaker: Arc<CircuitBreaker>) {
        self.breakers
            .write()
            .expect("registry poisoned")
            .insert(breaker.name().to_string(), breaker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .expect("registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn statuses(&self) -> Vec<CircuitStatus> {
        self.breakers
            .read()
            .expect("registry poisoned")
            .values()
            .map(|b| b.status())
            .collect()
    }
}
