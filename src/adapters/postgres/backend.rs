//! PostgreSQL backend queue adapter.
//!
//! Implements every orchestrator operation as runtime-checked SQL
//! against the `jobs` and `robots` tables, routed through the
//! connection manager. Queue mutations ride the retry path; progress
//! writes and cancellation reads do not, so a flaky backend can never
//! fail a running job through them.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::errors::{RobotError, RobotResult};
use crate::domain::models::job::{Job, JobStatus};
use crate::domain::models::robot::{PresenceSnapshot, RobotRegistration, RobotStatusKind};
use crate::domain::models::variable::variables_from_json;
use crate::domain::ports::backend::{BackendQueue, ProgressUpdate};
use crate::services::connection::{
    ConnectionConfig, ConnectionEvents, ConnectionManager, Connector,
};

/// Session factory for the orchestrator database.
pub struct PgConnector {
    url: String,
}

impl PgConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Session = PgPool;

    async fn connect(&self) -> anyhow::Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.url)
            .await?;
        Ok(pool)
    }

    async fn ping(&self, session: &PgPool) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(session).await?;
        Ok(())
    }
}

const CLAIM_SQL: &str = r#"
UPDATE jobs SET
    status = 'running',
    claimed_by = $1,
    lease_deadline = NOW() + make_interval(secs => $3),
    updated_at = NOW()
WHERE id = (
    SELECT id FROM jobs
    WHERE status = 'pending' AND claimed_by IS NULL AND environment = $2
    ORDER BY priority DESC, created_at ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
RETURNING id, workflow, variables, priority, retry_count, environment,
          tenant, status, claimed_by, lease_deadline, created_at
"#;

pub struct PgBackend {
    connection: Arc<ConnectionManager<PgConnector>>,
    visibility_timeout: f64,
}

impl PgBackend {
    pub fn new(
        url: impl Into<String>,
        config: ConnectionConfig,
        events: ConnectionEvents,
        visibility_timeout_seconds: u64,
    ) -> Self {
        let connection =
            Arc::new(ConnectionManager::new(PgConnector::new(url), config).with_events(events));
        Self {
            connection,
            visibility_timeout: visibility_timeout_seconds as f64,
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<PgConnector>> {
        &self.connection
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> RobotResult<Job> {
    let status: String = row
        .try_get("status")
        .map_err(|e| RobotError::Transient(e.to_string()))?;
    Ok(Job {
        id: row
            .try_get("id")
            .map_err(|e| RobotError::Transient(e.to_string()))?,
        document: row
            .try_get::<serde_json::Value, _>("workflow")
            .map_err(|e| RobotError::Transient(e.to_string()))?,
        initial_variables: row
            .try_get::<Option<serde_json::Value>, _>("variables")
            .ok()
            .flatten()
            .map(variables_from_json)
            .unwrap_or_default(),
        priority: row.try_get("priority").unwrap_or(0),
        retry_count: row.try_get("retry_count").unwrap_or(0),
        environment: row
            .try_get("environment")
            .unwrap_or_else(|_| "default".to_string()),
        tenant: row.try_get("tenant").ok().flatten(),
        claimed_by: row.try_get("claimed_by").ok().flatten(),
        lease_deadline: row.try_get("lease_deadline").ok().flatten(),
        status: JobStatus::parse_str(&status).unwrap_or(JobStatus::Running),
        created_at: row.try_get("created_at").ok().flatten(),
    })
}

#[async_trait]
impl BackendQueue for PgBackend {
    async fn ping(&self) -> RobotResult<()> {
        self.connection
            .execute(
                |pool| async move {
                    sqlx::query("SELECT 1").execute(&pool).await?;
                    Ok(())
                },
                false,
            )
            .await
    }

    async fn claim_job(&self, robot_id: &str, environment: &str) -> RobotResult<Option<Job>> {
        let robot_id = robot_id.to_string();
        let environment = environment.to_string();
        let lease = self.visibility_timeout;
        self.connection
            .execute(
                move |pool| {
                    let robot_id = robot_id.clone();
                    let environment = environment.clone();
                    async move {
                        let row = sqlx::query(CLAIM_SQL)
                            .bind(&robot_id)
                            .bind(&environment)
                            .bind(lease)
                            .fetch_optional(&pool)
                            .await?;
                        match row {
                            Some(row) => Ok(Some(row_to_job(&row)?)),
                            None => Ok(None),
                        }
                    }
                },
                true,
            )
            .await
    }

    async fn try_lock_job(&self, job_id: &str, robot_id: &str) -> RobotResult<bool> {
        let job_id = job_id.to_string();
        let robot_id = robot_id.to_string();
        let lease = self.visibility_timeout;
        self.connection
            .execute(
                move |pool| {
                    let job_id = job_id.clone();
                    let robot_id = robot_id.clone();
                    async move {
                        let done = sqlx::query(
                            r#"UPDATE jobs SET
                                   status = 'running',
                                   claimed_by = $2,
                                   lease_deadline = NOW() + make_interval(secs => $3),
                                   updated_at = NOW()
                               WHERE id = $1 AND status = 'pending' AND claimed_by IS NULL"#,
                        )
                        .bind(&job_id)
                        .bind(&robot_id)
                        .bind(lease)
                        .execute(&pool)
                        .await?;
                        Ok(done.rows_affected() == 1)
                    }
                },
                true,
            )
            .await
    }

    async fn extend_lease(&self, job_id: &str, seconds: i64) -> RobotResult<()> {
        let job_id = job_id.to_string();
        self.connection
            .execute(
                move |pool| {
                    let job_id = job_id.clone();
                    async move {
                        sqlx::query(
                            r#"UPDATE jobs SET
                                   lease_deadline = NOW() + make_interval(secs => $2),
                                   updated_at = NOW()
                               WHERE id = $1 AND status = 'running'"#,
                        )
                        .bind(&job_id)
                        .bind(seconds as f64)
                        .execute(&pool)
                        .await?;
                        Ok(())
                    }
                },
                true,
            )
            .await
    }

    async fn release_job(&self, job_id: &str) -> RobotResult<()> {
        let job_id = job_id.to_string();
        self.connection
            .execute(
                move |pool| {
                    let job_id = job_id.clone();
                    async move {
                        sqlx::query(
                            r#"UPDATE jobs SET
                                   status = 'pending',
                                   claimed_by = NULL,
                                   lease_deadline = NULL,
                                   updated_at = NOW()
                               WHERE id = $1 AND status = 'running'"#,
                        )
                        .bind(&job_id)
                        .execute(&pool)
                        .await?;
                        Ok(())
                    }
                },
                true,
            )
            .await
    }

    async fn complete_job(&self, job_id: &str, result: &serde_json::Value) -> RobotResult<()> {
        let job_id = job_id.to_string();
        let result = result.clone();
        // No claimed_by guard: a late completion after lease expiry is
        // accepted by contract.
        self.connection
            .execute(
                move |pool| {
                    let job_id = job_id.clone();
                    let result = result.clone();
                    async move {
                        sqlx::query(
                            r#"UPDATE jobs SET
                                   status = 'completed',
                                   result = $2,
                                   completed_at = NOW(),
                                   updated_at = NOW()
                               WHERE id = $1"#,
                        )
                        .bind(&job_id)
                        .bind(&result)
                        .execute(&pool)
                        .await?;
                        Ok(())
                    }
                },
                true,
            )
            .await
    }

    async fn fail_job(&self, job_id: &str, error: &str) -> RobotResult<()> {
        let job_id = job_id.to_string();
        let error = error.to_string();
        self.connection
            .execute(
                move |pool| {
                    let job_id = job_id.clone();
                    let error = error.clone();
                    async move {
                        sqlx::query(
                            r#"UPDATE jobs SET
                                   status = 'failed',
                                   error = $2,
                                   completed_at = NOW(),
                                   updated_at = NOW()
                               WHERE id = $1"#,
                        )
                        .bind(&job_id)
                        .bind(&error)
                        .execute(&pool)
                        .await?;
                        Ok(())
                    }
                },
                true,
            )
            .await
    }

    async fn cancel_job(&self, job_id: &str, reason: &str) -> RobotResult<()> {
        let job_id = job_id.to_string();
        let reason = reason.to_string();
        self.connection
            .execute(
                move |pool| {
                    let job_id = job_id.clone();
                    let reason = reason.clone();
                    async move {
                        sqlx::query(
                            r#"UPDATE jobs SET
                                   status = 'cancelled',
                                   error = $2,
                                   completed_at = NOW(),
                                   updated_at = NOW()
                               WHERE id = $1"#,
                        )
                        .bind(&job_id)
                        .bind(&reason)
                        .execute(&pool)
                        .await?;
                        Ok(())
                    }
                },
                true,
            )
            .await
    }

    async fn update_progress(&self, update: &ProgressUpdate) -> RobotResult<()> {
        let job_id = update.job_id.clone();
        let progress = serde_json::to_value(update)?;
        self.connection
            .execute(
                move |pool| {
                    let job_id = job_id.clone();
                    let progress = progress.clone();
                    async move {
                        sqlx::query(
                            "UPDATE jobs SET progress = $2, updated_at = NOW() WHERE id = $1",
                        )
                        .bind(&job_id)
                        .bind(&progress)
                        .execute(&pool)
                        .await?;
                        Ok(())
                    }
                },
                false,
            )
            .await
    }

    async fn cancel_requested(&self, job_id: &str) -> RobotResult<bool> {
        let job_id = job_id.to_string();
        self.connection
            .execute(
                move |pool| {
                    let job_id = job_id.clone();
                    async move {
                        let row =
                            sqlx::query("SELECT cancel_requested FROM jobs WHERE id = $1")
                                .bind(&job_id)
                                .fetch_optional(&pool)
                                .await?;
                        Ok(row
                            .map(|r| r.try_get::<bool, _>("cancel_requested").unwrap_or(false))
                            .unwrap_or(false))
                    }
                },
                false,
            )
            .await
    }

    async fn upsert_registration(&self, registration: &RobotRegistration) -> RobotResult<()> {
        let registration = registration.clone();
        let capabilities = serde_json::to_value(&registration.capabilities)?;
        self.connection
            .execute(
                move |pool| {
                    let registration = registration.clone();
                    let capabilities = capabilities.clone();
                    async move {
                        sqlx::query(
                            r#"INSERT INTO robots
                                   (id, name, hostname, status, environment, capabilities,
                                    last_heartbeat, updated_at)
                               VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
                               ON CONFLICT (hostname) DO UPDATE SET
                                   id = EXCLUDED.id,
                                   name = EXCLUDED.name,
                                   status = EXCLUDED.status,
                                   environment = EXCLUDED.environment,
                                   capabilities = EXCLUDED.capabilities,
                                   last_heartbeat = NOW(),
                                   updated_at = NOW()"#,
                        )
                        .bind(&registration.robot_id)
                        .bind(&registration.name)
                        .bind(&registration.hostname)
                        .bind(registration.status.as_str())
                        .bind(&registration.environment)
                        .bind(&capabilities)
                        .execute(&pool)
                        .await?;
                        Ok(())
                    }
                },
                true,
            )
            .await
    }

    async fn update_robot_status(
        &self,
        robot_id: &str,
        status: RobotStatusKind,
    ) -> RobotResult<()> {
        let robot_id = robot_id.to_string();
        self.connection
            .execute(
                move |pool| {
                    let robot_id = robot_id.clone();
                    async move {
                        sqlx::query(
                            "UPDATE robots SET status = $2, updated_at = NOW() WHERE id = $1",
                        )
                        .bind(&robot_id)
                        .bind(status.as_str())
                        .execute(&pool)
                        .await?;
                        Ok(())
                    }
                },
                true,
            )
            .await
    }

    async fn update_presence(
        &self,
        robot_id: &str,
        presence: &PresenceSnapshot,
    ) -> RobotResult<()> {
        let robot_id = robot_id.to_string();
        let metrics = serde_json::to_value(presence)?;
        self.connection
            .execute(
                move |pool| {
                    let robot_id = robot_id.clone();
                    let metrics = metrics.clone();
                    async move {
                        sqlx::query(
                            r#"UPDATE robots SET
                                   status = $2,
                                   metrics = $3,
                                   last_heartbeat = NOW(),
                                   updated_at = NOW()
                               WHERE id = $1"#,
                        )
                        .bind(&robot_id)
                        .bind(presence.status.as_str())
                        .bind(&metrics)
                        .execute(&pool)
                        .await?;
                        Ok(())
                    }
                },
                false,
            )
            .await
    }
}
