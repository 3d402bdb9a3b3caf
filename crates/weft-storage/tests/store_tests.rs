//! Contract tests run against both store implementations.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use weft_core::event::{Event, EventPayload};
use weft_core::traits::RunStore;
use weft_core::types::*;
use weft_storage::{MemoryRunStore, SqliteRunStore};

fn sample_pipeline() -> Pipeline {
    let step = Step {
        id: "agg".into(),
        name: "aggregate".into(),
        config: StepConfig::Transform(TransformConfig::Aggregate {}),
        enabled: true,
        timeout_ms: 1000,
        max_attempts: 2,
        retry_backoff: RetryBackoff::default(),
        estimate: None,
        position: Position::default(),
    };
    Pipeline {
        id: "pipe-1".into(),
        name: "sample".into(),
        version: "3".into(),
        variables: BTreeMap::new(),
        steps: vec![step],
        connections: vec![],
    }
}

fn sample_run(pipeline: &Pipeline) -> Run {
    Run {
        id: Uuid::new_v4().to_string(),
        pipeline_id: pipeline.id.clone(),
        pipeline_snapshot: pipeline.clone(),
        state: RunState::Running,
        initial_variables: BTreeMap::from([("x".to_string(), json!(1))]),
        options: RunOptions::default(),
        outputs: BTreeMap::new(),
        created_by: "tester".into(),
        started_at: Utc::now(),
        finished_at: None,
        error: None,
        lease_until: Some(Utc::now() + Duration::seconds(60)),
    }
}

async fn exercise_store(store: &dyn RunStore) {
    let pipeline = sample_pipeline();
    store.save_pipeline(&pipeline).await.unwrap();
    let loaded = store.load_pipeline(&pipeline.id).await.unwrap().unwrap();
    assert_eq!(loaded, pipeline);

    let run = sample_run(&pipeline);
    store.create_run(&run).await.unwrap();

    // Snapshot round-trips byte-for-byte through the store.
    let fetched = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(fetched.pipeline_snapshot, pipeline);
    assert_eq!(fetched.state, RunState::Running);
    assert_eq!(fetched.initial_variables.get("x"), Some(&json!(1)));

    // Two attempts for the same step, newest first on listing.
    for attempt in 1..=2u32 {
        let mut step_run = StepRun {
            id: format!("{}-agg-{attempt}", run.id),
            run_id: run.id.clone(),
            step_id: "agg".into(),
            attempt,
            state: StepRunState::Running,
            started_at: Some(Utc::now()),
            finished_at: None,
            inputs: json!({"data": [1, 2]}),
            outputs: None,
            error: None,
            error_code: None,
            metrics: StepMetrics::default(),
        };
        store.create_step_run(&step_run).await.unwrap();

        step_run.state = if attempt == 1 {
            StepRunState::Failed
        } else {
            StepRunState::Succeeded
        };
        step_run.error = (attempt == 1).then(|| "boom".to_string());
        step_run.error_code = (attempt == 1).then(|| "http.503".to_string());
        step_run.outputs = (attempt == 2).then(|| json!({"result": {"count": 2}}));
        step_run.finished_at = Some(Utc::now());
        step_run.metrics = StepMetrics { duration_ms: 12, tokens: 0, cost: 0.0 };
        store.finish_step_run(&step_run).await.unwrap();
    }

    let step_runs = store.list_step_runs(&run.id).await.unwrap();
    assert_eq!(step_runs.len(), 2);
    assert_eq!(step_runs[0].attempt, 2);
    assert_eq!(step_runs[0].state, StepRunState::Succeeded);
    assert_eq!(step_runs[1].attempt, 1);
    assert_eq!(step_runs[1].error_code.as_deref(), Some("http.503"));

    // Logs keep their monotonic sequence.
    let step_run_id = &step_runs[0].id;
    for seq in 0..3u64 {
        store
            .append_log(
                step_run_id,
                &LogEntry {
                    seq,
                    level: LogLevel::Info,
                    message: format!("line {seq}"),
                    ts: Utc::now(),
                },
            )
            .await
            .unwrap();
    }
    let logs = store.list_logs(step_run_id).await.unwrap();
    assert_eq!(logs.iter().map(|l| l.seq).collect::<Vec<_>>(), vec![0, 1, 2]);

    store
        .append_event(&Event::new(
            run.id.clone(),
            Utc::now(),
            EventPayload::RunStarted { pipeline_id: pipeline.id.clone(), dry_run: false },
        ))
        .await
        .unwrap();

    // Terminal transition with outputs.
    let outputs = BTreeMap::from([("final".to_string(), json!({"count": 2}))]);
    store
        .update_run(&run.id, RunState::Succeeded, &outputs, None, Some(Utc::now()))
        .await
        .unwrap();
    let done = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(done.state, RunState::Succeeded);
    assert_eq!(done.outputs.get("final"), Some(&json!({"count": 2})));

    let listed = store.list_runs(&pipeline.id).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_memory_store_contract() {
    let store = MemoryRunStore::new();
    exercise_store(&store).await;
}

#[tokio::test]
async fn test_sqlite_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteRunStore::open(dir.path().join("weft.db")).await.unwrap();
    exercise_store(&store).await;
}

#[tokio::test]
async fn test_lease_expiry_surfaces_orphans() {
    let store = SqliteRunStore::open_in_memory().await.unwrap();
    let pipeline = sample_pipeline();
    let mut run = sample_run(&pipeline);
    run.lease_until = Some(Utc::now() - Duration::seconds(30));
    store.create_run(&run).await.unwrap();

    let expired = store.expired_runs(Utc::now()).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, run.id);

    // Heartbeat pushes the lease forward and clears the run from the scan.
    store
        .heartbeat(&run.id, Utc::now() + Duration::seconds(60))
        .await
        .unwrap();
    assert!(store.expired_runs(Utc::now()).await.unwrap().is_empty());

    // Terminal runs never show up as expired.
    store
        .update_run(&run.id, RunState::Cancelled, &BTreeMap::new(), None, Some(Utc::now()))
        .await
        .unwrap();
    assert!(store
        .expired_runs(Utc::now() + Duration::seconds(3600))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_duplicate_run_rejected_by_memory_store() {
    let store = MemoryRunStore::new();
    let pipeline = sample_pipeline();
    let run = sample_run(&pipeline);
    store.create_run(&run).await.unwrap();
    assert!(store.create_run(&run).await.is_err());
}
