//! Engine API behaviour: subscriptions, lookups, recovery.

mod support;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use support::*;
use weft_core::error::EngineError;
use weft_core::traits::RunStore;
use weft_core::types::{Run, RunOptions, RunState, StepRunState};

#[tokio::test]
async fn test_unknown_run_lookups() {
    let (engine, _store) = engine_with(default_services());
    assert!(matches!(
        engine.get_run("nope").await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.cancel("nope").await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.list_step_runs("nope").await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_subscribe_selector_validation() {
    let (engine, _store) = engine_with(default_services());
    assert!(engine.subscribe("run:*").is_ok());
    assert!(engine.subscribe("step:r1:s1").is_ok());
    assert!(matches!(
        engine.subscribe("everything"),
        Err(EngineError::InvalidSelector(_))
    ));
}

#[tokio::test]
async fn test_live_subscription_sees_ordered_events() {
    let (engine, _store) = engine_with(default_services());
    let mut stream = engine.subscribe("run:*").unwrap();

    let p = pipeline(
        "watched",
        vec![input_step("a"), output_step("b")],
        vec![conn("c1", ("a", "value"), ("b", "data"))],
    );
    let run_id = engine
        .submit(p, vars(&[("a", json!("hello"))]), RunOptions::default(), "tests")
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Some(event) = stream.next().await {
        if event.run_id != run_id {
            continue;
        }
        kinds.push(event.payload.kind().to_string());
        if kinds.last().map(String::as_str) == Some("run_finished") {
            break;
        }
    }
    assert_eq!(kinds.first().map(String::as_str), Some("run_started"));
    assert_eq!(kinds.last().map(String::as_str), Some("run_finished"));
    let starts = kinds.iter().filter(|k| *k == "step_started").count();
    let successes = kinds.iter().filter(|k| *k == "step_succeeded").count();
    assert_eq!(starts, 2);
    assert_eq!(successes, 2);
}

fn stale_run(pipeline_id: &str, resumable: bool) -> Run {
    let p = pipeline(
        pipeline_id,
        vec![input_step("a"), output_step("b")],
        vec![conn("c1", ("a", "value"), ("b", "data"))],
    );
    Run {
        id: format!("stale-{pipeline_id}"),
        pipeline_id: pipeline_id.to_string(),
        pipeline_snapshot: p,
        state: RunState::Running,
        initial_variables: BTreeMap::from([("a".to_string(), json!(42))]),
        options: RunOptions { resumable, ..Default::default() },
        outputs: BTreeMap::new(),
        created_by: "tests".to_string(),
        started_at: Utc::now() - Duration::minutes(10),
        finished_at: None,
        error: None,
        lease_until: Some(Utc::now() - Duration::minutes(5)),
    }
}

#[tokio::test]
async fn test_recovery_marks_orphaned() {
    let (engine, store) = engine_with(default_services());
    let run = stale_run("orphan", false);
    store.create_run(&run).await.unwrap();

    let handled = engine.recover().await.unwrap();
    assert_eq!(handled, 1);

    let after = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(after.state, RunState::Failed);
    assert!(after.error.as_deref().unwrap_or_default().contains("orphaned"));

    // A second sweep finds nothing.
    assert_eq!(engine.recover().await.unwrap(), 0);
}

#[tokio::test]
async fn test_recovery_resumes_resumable_run() {
    let (engine, store) = engine_with(default_services());
    let run = stale_run("resume", true);
    store.create_run(&run).await.unwrap();

    let handled = engine.recover().await.unwrap();
    assert_eq!(handled, 1);
    engine.join(&run.id).await;

    let after = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(after.state, RunState::Succeeded);
    assert_eq!(after.outputs.get("b"), Some(&json!(42)));

    let step_runs = store.list_step_runs(&run.id).await.unwrap();
    assert!(step_runs
        .iter()
        .all(|sr| sr.state == StepRunState::Succeeded));
}

#[tokio::test]
async fn test_submit_by_stored_pipeline_id() {
    let (engine, store) = engine_with(default_services());
    let p = pipeline(
        "stored",
        vec![input_step("a"), output_step("b")],
        vec![conn("c1", ("a", "value"), ("b", "data"))],
    );
    store.save_pipeline(&p).await.unwrap();

    let run_id = engine
        .submit_by_id("stored", vars(&[("a", json!(7))]), RunOptions::default(), "tests")
        .await
        .unwrap();
    engine.join(&run_id).await;
    let summary = engine.get_run(&run_id).await.unwrap();
    assert_eq!(summary.state, RunState::Succeeded);
    assert_eq!(summary.outputs.get("b"), Some(&json!(7)));

    assert!(matches!(
        engine
            .submit_by_id("missing", vars(&[]), RunOptions::default(), "tests")
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_run_level_timeout_behaves_as_cancel() {
    let (model, mut started) = HangingModel::new();
    let (engine, _store) = engine_with(services(
        Arc::new(model),
        Arc::new(ScriptedHttp::new(vec![])),
        Arc::new(StubSandbox),
    ));
    let p = pipeline("slow", vec![llm_step("gen", "go")], vec![]);
    let options = RunOptions { run_timeout_ms: Some(100), ..Default::default() };
    let run_id = engine.submit(p, vars(&[]), options, "tests").await.unwrap();
    started.recv().await.unwrap();
    engine.join(&run_id).await;

    let summary = engine.get_run(&run_id).await.unwrap();
    assert_eq!(summary.state, RunState::Cancelled);
    assert!(summary
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("timeout"));
}

#[tokio::test]
async fn test_validation_warnings_do_not_block() {
    let (engine, _store) = engine_with(default_services());
    // Disabled single step: warning, still submittable.
    let mut only = input_step("a");
    only.enabled = false;
    let p = pipeline("warned", vec![only], vec![]);
    let (run_id, summary) = run_to_end(&engine, p, vars(&[]), RunOptions::default()).await;
    assert_eq!(summary.state, RunState::Succeeded);
    let step_runs = engine.list_step_runs(&run_id).await.unwrap();
    assert_eq!(step_runs[0].state, StepRunState::Skipped);
}
