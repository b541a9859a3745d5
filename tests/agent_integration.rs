//! Agent coordinator integration: claim loop, pause gate, circuit
//! breaker backoff, offline sync, and shutdown ordering.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use casare_robot::adapters::engine::SequentialEngine;
use casare_robot::adapters::sqlite::offline_store::OfflineStore;
use casare_robot::application::agent::RobotAgent;
use casare_robot::domain::models::config::RobotConfig;
use casare_robot::domain::models::job::Job;
use casare_robot::domain::models::robot::{AgentState, RobotStatusKind};
use casare_robot::domain::ports::backend::BackendQueue;
use casare_robot::infrastructure::paths::RobotPaths;
use casare_robot::services::audit::{AuditConfig, AuditLogger};

use common::{slow_workflow, three_step_workflow, MockBackend};

struct Rig {
    backend: Arc<MockBackend>,
    agent: Arc<RobotAgent>,
    paths: RobotPaths,
    _dir: tempfile::TempDir,
}

fn fast_config(dir: &std::path::Path) -> RobotConfig {
    let mut config = RobotConfig::default();
    config.robot_id = Some("robot-test".to_string());
    config.data_dir = Some(dir.to_path_buf());
    config.poll_interval = 0.05;
    config.poll_interval_max = 0.1;
    config.heartbeat_interval = 0.05;
    config.presence_interval = 0.05;
    config.cancellation_check_interval = 0.05;
    config.progress_flush_interval = 0.02;
    config.shutdown_grace = 5;
    config.max_concurrent_jobs = 2;
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.open_timeout_seconds = 60;
    config
}

async fn rig_with_config(config: RobotConfig) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config;
    config.data_dir = Some(dir.path().to_path_buf());

    let backend = Arc::new(MockBackend::new());
    let paths = RobotPaths::resolve(Some(dir.path())).unwrap();
    let audit = Arc::new(
        AuditLogger::new(paths.audit_dir(), "robot-test", AuditConfig::default()).unwrap(),
    );
    let agent = RobotAgent::new(
        config,
        Arc::clone(&backend) as Arc<dyn BackendQueue>,
        Arc::new(SequentialEngine::new()),
        paths.clone(),
        audit,
    )
    .await
    .unwrap();

    Rig {
        backend,
        agent,
        paths,
        _dir: dir,
    }
}

async fn rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());
    drop(dir);
    rig_with_config(config).await
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_claim_execute_report_lifecycle() {
    let rig = rig().await;
    rig.backend
        .push_job(Job::new("j1", three_step_workflow("lifecycle")));

    Arc::clone(&rig.agent).start().await.unwrap();

    wait_until("job completion", || {
        rig.backend.completed.lock().unwrap().contains_key("j1")
    })
    .await;

    // Registration was upserted online at startup.
    let registrations = rig.backend.registrations.lock().unwrap();
    assert!(!registrations.is_empty());
    assert_eq!(registrations[0].status, RobotStatusKind::Online);
    drop(registrations);

    // Progress reached the terminal stage.
    let updates = rig.backend.progress_for("j1");
    assert!(updates
        .iter()
        .any(|u| u.percent_complete == 100.0 && u.success == Some(true)));

    rig.agent.stop().await;
    assert_eq!(rig.agent.state().await, AgentState::Stopped);

    // Shutdown marked the registration offline.
    let status_updates = rig.backend.status_updates.lock().unwrap();
    assert!(status_updates
        .iter()
        .any(|(_, status)| *status == RobotStatusKind::Offline));
}

#[tokio::test]
async fn test_pause_gate_blocks_acquisition() {
    let rig = rig().await;
    Arc::clone(&rig.agent).start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    rig.agent.pause().await;
    assert_eq!(rig.agent.state().await, AgentState::Paused);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Queue a job while paused; the claim loop must not pick it up.
    rig.backend
        .push_job(Job::new("j1", three_step_workflow("paused")));
    let calls_when_paused = rig.backend.claim_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        rig.backend.claim_calls.load(Ordering::SeqCst),
        calls_when_paused,
        "claim RPC fired while paused"
    );
    assert_eq!(rig.agent.current_job_count().await, 0);

    // Resume drains the queue.
    rig.agent.resume().await;
    wait_until("job completion after resume", || {
        rig.backend.completed.lock().unwrap().contains_key("j1")
    })
    .await;

    rig.agent.stop().await;
}

#[tokio::test]
async fn test_open_circuit_stops_claim_rpcs() {
    let rig = rig().await;
    rig.backend.set_unreachable(true);
    Arc::clone(&rig.agent).start().await.unwrap();

    // Three consecutive claim failures open the breaker.
    wait_until("circuit to open", || {
        rig.agent
            .circuit_registry()
            .statuses()
            .iter()
            .any(|s| s.state == casare_robot::services::circuit_breaker::CircuitState::Open)
    })
    .await;

    // With the circuit open the claim RPC is no longer invoked.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let calls_at_open = rig.backend.claim_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        rig.backend.claim_calls.load(Ordering::SeqCst),
        calls_at_open,
        "claim RPC invoked while circuit open"
    );

    rig.agent.stop().await;
}

#[tokio::test]
async fn test_offline_results_sync_when_backend_returns() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());

    // A previous run finished j9 while the backend was down.
    {
        let store = OfflineStore::open(&dir.path().join("offline_queue.db"), "robot-test")
            .await
            .unwrap();
        store
            .cache_job("j9", &three_step_workflow("stranded"), "pending")
            .await;
        store
            .mark_completed("j9", true, Some(&serde_json::json!({"success": true})), None)
            .await;
        store.close().await;
    }

    let backend = Arc::new(MockBackend::new());
    let paths = RobotPaths::resolve(Some(dir.path())).unwrap();
    let audit = Arc::new(
        AuditLogger::new(paths.audit_dir(), "robot-test", AuditConfig::default()).unwrap(),
    );
    let agent = RobotAgent::new(
        config,
        Arc::clone(&backend) as Arc<dyn BackendQueue>,
        Arc::new(SequentialEngine::new()),
        paths,
        audit,
    )
    .await
    .unwrap();
    Arc::clone(&agent).start().await.unwrap();

    wait_until("offline outcome sync", || {
        backend.completed.lock().unwrap().contains_key("j9")
    })
    .await;

    agent.stop().await;
}

#[tokio::test]
async fn test_zero_grace_shutdown_still_persists_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(dir.path());
    config.shutdown_grace = 0;
    let rig = rig_with_config(config).await;

    rig.backend
        .push_job(Job::new("j1", slow_workflow("slow", 10_000)));
    Arc::clone(&rig.agent).start().await.unwrap();

    for _ in 0..500 {
        if rig.agent.current_job_count().await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(rig.agent.current_job_count().await > 0, "job never picked up");

    let started = std::time::Instant::now();
    rig.agent.stop().await;
    // No waiting on the slow job.
    assert!(started.elapsed() < Duration::from_secs(5));

    // The final self-checkpoint exists and carries the counters.
    let checkpoint = rig.paths.read_agent_checkpoint("robot-test").unwrap();
    assert_eq!(checkpoint.robot_id, "robot-test");
    assert_eq!(rig.agent.state().await, AgentState::Stopped);
}

#[tokio::test]
async fn test_heartbeat_extends_leases_for_running_jobs() {
    let rig = rig().await;
    rig.backend
        .push_job(Job::new("j1", slow_workflow("slow", 800)));
    Arc::clone(&rig.agent).start().await.unwrap();

    wait_until("lease extension", || {
        rig.backend
            .lease_extensions
            .lock()
            .unwrap()
            .iter()
            .any(|(id, secs)| id == "j1" && *secs == 30)
    })
    .await;

    rig.agent.stop().await;
}

#[tokio::test]
async fn test_presence_pushed_periodically() {
    let rig = rig().await;
    Arc::clone(&rig.agent).start().await.unwrap();

    wait_until("presence updates", || {
        rig.backend.presence_updates.lock().unwrap().len() >= 2
    })
    .await;

    let presences = rig.backend.presence_updates.lock().unwrap();
    assert!(presences.iter().all(|p| p.capacity == 2));
    drop(presences);

    rig.agent.stop().await;
}

#[tokio::test]
async fn test_stats_survive_restart_via_self_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());

    {
        let rig = rig_with_config(config.clone()).await;
        rig.backend
            .push_job(Job::new("j1", three_step_workflow("first-run")));
        Arc::clone(&rig.agent).start().await.unwrap();
        wait_until("first completion", || {
            rig.backend.completed.lock().unwrap().contains_key("j1")
        })
        .await;
        rig.agent.stop().await;

        let checkpoint = rig.paths.read_agent_checkpoint("robot-test").unwrap();
        assert_eq!(checkpoint.stats.jobs_completed, 1);

        // Second agent over the same data dir restores the counters.
        let backend = Arc::new(MockBackend::new());
        let audit = Arc::new(
            AuditLogger::new(
                rig.paths.audit_dir(),
                "robot-test",
                AuditConfig::default(),
            )
            .unwrap(),
        );
        let mut config2 = config.clone();
        config2.data_dir = Some(rig.paths.base().to_path_buf());
        let agent = RobotAgent::new(
            config2,
            Arc::clone(&backend) as Arc<dyn BackendQueue>,
            Arc::new(SequentialEngine::new()),
            rig.paths.clone(),
            audit,
        )
        .await
        .unwrap();
        Arc::clone(&agent).start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = agent.status().await;
        assert_eq!(status["stats"]["jobs_completed"], 1);
        assert_eq!(status["stats"]["checkpoints_restored"], 1);
        agent.stop().await;
    }
}

#[tokio::test]
async fn test_status_document_shape() {
    let rig = rig().await;
    Arc::clone(&rig.agent).start().await.unwrap();
    let status = rig.agent.status().await;

    assert_eq!(status["robot_id"], "robot-test");
    assert_eq!(status["state"], "running");
    assert_eq!(status["capacity"], 2);
    assert!(status["stats"]["jobs_completed"].is_u64());
    assert!(status["circuit_breaker"]["state"].is_string());

    rig.agent.stop().await;
}
