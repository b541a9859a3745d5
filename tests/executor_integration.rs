//! Job executor integration: the full execution sequence against an
//! in-memory backend and the reference engine.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use casare_robot::adapters::engine::SequentialEngine;
use casare_robot::adapters::sqlite::offline_store::OfflineStore;
use casare_robot::application::job_executor::{JobExecutor, JobExecutorConfig};
use casare_robot::domain::models::checkpoint::BrowserStateHint;
use casare_robot::domain::models::job::Job;
use casare_robot::domain::models::variable::{VariableMap, VariableValue};
use casare_robot::domain::ports::backend::{BackendQueue, ProgressStage};
use casare_robot::services::audit::{AuditConfig, AuditEventType, AuditFilter, AuditLogger};
use casare_robot::services::checkpoint::CheckpointManager;
use casare_robot::services::metrics::MetricsCollector;

use common::{slow_workflow, three_step_workflow, MockBackend};

type Completion = (String, bool, Option<String>);

struct Harness {
    backend: Arc<MockBackend>,
    store: Arc<OfflineStore>,
    checkpoints: Arc<CheckpointManager>,
    metrics: Arc<MetricsCollector>,
    audit: Arc<AuditLogger>,
    executor: Arc<JobExecutor>,
    completions: Arc<Mutex<Vec<Completion>>>,
    _dir: tempfile::TempDir,
}

async fn harness(config: JobExecutorConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(OfflineStore::in_memory("robot-test").await.unwrap());
    let audit = Arc::new(
        AuditLogger::new(dir.path(), "robot-test", AuditConfig::default()).unwrap(),
    );
    let checkpoints = Arc::new(CheckpointManager::new(
        Arc::clone(&store),
        Arc::clone(&audit),
        true,
    ));
    let metrics = Arc::new(MetricsCollector::new(Duration::from_secs(60)));
    let completions: Arc<Mutex<Vec<Completion>>> = Arc::new(Mutex::new(Vec::new()));

    let callback = {
        let completions = Arc::clone(&completions);
        Arc::new(
            move |job_id: String, success: bool, error: Option<String>| {
                let completions = Arc::clone(&completions);
                Box::pin(async move {
                    completions.lock().unwrap().push((job_id, success, error));
                }) as futures::future::BoxFuture<'static, ()>
            },
        )
    };

    let executor = JobExecutor::new(
        config,
        Arc::new(SequentialEngine::new()),
        Arc::clone(&backend) as Arc<dyn BackendQueue>,
        Arc::clone(&store),
        Arc::clone(&checkpoints),
        Arc::clone(&metrics),
        Arc::clone(&audit),
        callback,
    );

    Harness {
        backend,
        store,
        checkpoints,
        metrics,
        audit,
        executor,
        completions,
        _dir: dir,
    }
}

fn fast_config() -> JobExecutorConfig {
    JobExecutorConfig {
        max_concurrent_jobs: 3,
        job_timeout: Duration::from_secs(30),
        node_timeout: Duration::from_secs(5),
        cancellation_check_interval: Duration::from_millis(20),
        progress_flush_interval: Duration::from_millis(20),
        resume_from_checkpoint: true,
    }
}

async fn wait_for_completions(harness: &Harness, count: usize) {
    for _ in 0..500 {
        if harness.completions.lock().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {} completions, got {:?}",
        count,
        harness.completions.lock().unwrap()
    );
}

#[tokio::test]
async fn test_happy_path_full_sequence() {
    let harness = harness(fast_config()).await;
    let job = Job::new("j1", three_step_workflow("happy"));
    harness.store.cache_job("j1", &job.document, "pending").await;

    assert!(harness.executor.submit(job).await);
    wait_for_completions(&harness, 1).await;

    // Completion callback fired with success.
    let completions = harness.completions.lock().unwrap().clone();
    assert_eq!(completions, vec![("j1".to_string(), true, None)]);

    // Zero checkpoint rows remain after a normal completion.
    assert_eq!(harness.store.checkpoint_count("j1").await, 0);

    // The terminal progress update reports 100%.
    let last = harness.backend.last_progress().unwrap();
    assert_eq!(last.stage, ProgressStage::Completed);
    assert_eq!(last.percent_complete, 100.0);

    // Audit trail: started, three node completions, completed.
    let started = harness
        .audit
        .query(AuditFilter {
            event_types: Some(vec![AuditEventType::JobStarted]),
            ..Default::default()
        })
        .await;
    assert_eq!(started.len(), 1);
    let node_completions = harness
        .audit
        .query(AuditFilter {
            event_types: Some(vec![AuditEventType::NodeCompleted]),
            job_id: Some("j1".into()),
            ..Default::default()
        })
        .await;
    assert_eq!(node_completions.len(), 3);
    let completed = harness
        .audit
        .query(AuditFilter {
            event_types: Some(vec![AuditEventType::JobCompleted]),
            ..Default::default()
        })
        .await;
    assert_eq!(completed.len(), 1);

    // Metrics recorded the job and its nodes.
    let summary = harness.metrics.summary().await;
    assert_eq!(summary.jobs_completed, 1);
    assert_eq!(summary.nodes_executed, 3);

    // The tracking entry is gone once terminal.
    assert!(harness.executor.job_info("j1").await.is_none());
}

#[tokio::test]
async fn test_duplicate_submission_rejected() {
    let harness = harness(fast_config()).await;
    let job = Job::new("j1", slow_workflow("slow", 5_000));
    assert!(harness.executor.submit(job.clone()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!harness.executor.submit(job).await);
    harness.executor.cancel("j1", "test cleanup").await;
    wait_for_completions(&harness, 1).await;
}

#[tokio::test]
async fn test_cancel_outside_running_states_is_a_no_op() {
    let harness = harness(fast_config()).await;
    assert!(!harness.executor.cancel("ghost", "nothing there").await);

    let job = Job::new("j1", three_step_workflow("quick"));
    harness.executor.submit(job).await;
    wait_for_completions(&harness, 1).await;
    // Already terminal and removed.
    assert!(!harness.executor.cancel("j1", "too late").await);
}

#[tokio::test]
async fn test_executor_initiated_cancellation() {
    let harness = harness(fast_config()).await;
    let job = Job::new("j1", slow_workflow("slow", 10_000));
    harness.executor.submit(job).await;

    // Wait until the first node's checkpoint lands.
    for _ in 0..100 {
        if harness.store.checkpoint_count("j1").await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(harness.executor.cancel("j1", "user request").await);
    wait_for_completions(&harness, 1).await;

    let (job_id, success, error) = harness.completions.lock().unwrap()[0].clone();
    assert_eq!(job_id, "j1");
    assert!(!success);
    assert!(error.as_deref().unwrap().contains("cancel"));

    // Cancellation retains checkpoints for a future resume.
    assert!(harness.store.checkpoint_count("j1").await > 0);

    let last = harness.backend.last_progress().unwrap();
    assert_eq!(last.stage, ProgressStage::Cancelled);

    let cancelled = harness
        .audit
        .query(AuditFilter {
            event_types: Some(vec![AuditEventType::JobCancelled]),
            ..Default::default()
        })
        .await;
    assert_eq!(cancelled.len(), 1);
}

#[tokio::test]
async fn test_backend_cancellation_flag_observed() {
    let harness = harness(fast_config()).await;
    let job = Job::new("j1", slow_workflow("slow", 10_000));
    harness.executor.submit(job).await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    harness.backend.set_cancel_requested("j1");
    wait_for_completions(&harness, 1).await;

    let (_, success, error) = harness.completions.lock().unwrap()[0].clone();
    assert!(!success);
    assert!(error.as_deref().unwrap().contains("cancel"));
}

#[tokio::test]
async fn test_concurrency_cap_respected() {
    let mut config = fast_config();
    config.max_concurrent_jobs = 1;
    let harness = harness(config).await;

    let observed_max = Arc::new(AtomicBool::new(false));
    harness
        .executor
        .submit(Job::new("j1", slow_workflow("one", 200)))
        .await;
    harness
        .executor
        .submit(Job::new("j2", slow_workflow("two", 200)))
        .await;

    // With one slot, both jobs never run at once; probe while running.
    for _ in 0..30 {
        let running = harness.executor.running_count().await;
        if running > 1 {
            observed_max.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    wait_for_completions(&harness, 2).await;
    assert!(!observed_max.load(Ordering::SeqCst));

    let completions = harness.completions.lock().unwrap().clone();
    assert!(completions.iter().all(|(_, success, _)| *success));
}

#[tokio::test]
async fn test_failing_node_fails_job_and_keeps_checkpoints() {
    let harness = harness(fast_config()).await;
    let document = common::linear_workflow(
        "failing",
        &[
            ("a", "flow.start", serde_json::json!({})),
            ("b", "basic.fail", serde_json::json!({"message": "element not found"})),
        ],
    );
    harness.executor.submit(Job::new("j1", document)).await;
    wait_for_completions(&harness, 1).await;

    let (_, success, error) = harness.completions.lock().unwrap()[0].clone();
    assert!(!success);
    assert!(error.as_deref().unwrap().contains("element not found"));

    // The checkpoint from node a survives for the retry.
    assert_eq!(harness.store.checkpoint_count("j1").await, 1);

    let last = harness.backend.last_progress().unwrap();
    assert_eq!(last.stage, ProgressStage::Failed);
}

#[tokio::test]
async fn test_resume_skips_executed_nodes() {
    let harness = harness(fast_config()).await;

    // Simulate a previous run that died after a and b completed.
    harness.checkpoints.start_job("j1", "resumable").await;
    let mut vars = VariableMap::new();
    vars.insert("carried".to_string(), VariableValue::Int(7));
    harness
        .checkpoints
        .on_node_complete("j1", "a", &vars, BrowserStateHint::default())
        .await
        .unwrap();
    harness
        .checkpoints
        .on_node_complete("j1", "b", &vars, BrowserStateHint::default())
        .await
        .unwrap();
    harness.checkpoints.end_job("j1").await;

    let document = common::linear_workflow(
        "resumable",
        &[
            ("a", "flow.start", serde_json::json!({})),
            ("b", "basic.log", serde_json::json!({})),
            ("c", "basic.log", serde_json::json!({})),
            ("d", "basic.log", serde_json::json!({})),
        ],
    );
    harness.executor.submit(Job::new("j1", document)).await;
    wait_for_completions(&harness, 1).await;

    let (_, success, _) = harness.completions.lock().unwrap()[0].clone();
    assert!(success);

    // The restoration was announced with the resume node.
    let restored = harness
        .audit
        .query(AuditFilter {
            event_types: Some(vec![AuditEventType::CheckpointRestored]),
            ..Default::default()
        })
        .await;
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].details["restored_at_node"], "b");

    // a and b were skipped, c and d executed.
    let summary = harness.metrics.summary().await;
    assert_eq!(summary.nodes_skipped, 2);
    assert_eq!(summary.nodes_executed, 2);
}

#[tokio::test]
async fn test_job_timeout() {
    let mut config = fast_config();
    config.job_timeout = Duration::from_millis(100);
    let harness = harness(config).await;

    harness
        .executor
        .submit(Job::new("j1", slow_workflow("slow", 60_000)))
        .await;
    wait_for_completions(&harness, 1).await;

    let (_, success, error) = harness.completions.lock().unwrap()[0].clone();
    assert!(!success);
    assert!(error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_invalid_document_fails_cleanly() {
    let harness = harness(fast_config()).await;
    harness
        .executor
        .submit(Job::new("j1", serde_json::json!({"nodes": {}})))
        .await;
    wait_for_completions(&harness, 1).await;

    let (_, success, error) = harness.completions.lock().unwrap()[0].clone();
    assert!(!success);
    assert!(error.is_some());
}

#[tokio::test]
async fn test_shutdown_waits_for_running_jobs() {
    let harness = harness(fast_config()).await;
    harness
        .executor
        .submit(Job::new("j1", slow_workflow("slow", 300)))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness
        .executor
        .shutdown(false, Duration::from_secs(5))
        .await;
    // The job finished inside the grace window.
    assert_eq!(harness.completions.lock().unwrap().len(), 1);
    // New submissions are refused after shutdown.
    assert!(
        !harness
            .executor
            .submit(Job::new("j2", three_step_workflow("late")))
            .await
    );
}
