//! In-memory run store
//!
//! Backs tests and ephemeral embeddings with the same contract as the
//! SQLite store. State lives behind one async lock; transitions are
//! therefore atomic with respect to readers.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use weft_core::error::StoreError;
use weft_core::event::Event;
use weft_core::traits::RunStore;
use weft_core::types::{LogEntry, Pipeline, Run, RunState, StepRun};

#[derive(Default)]
struct Inner {
    pipelines: HashMap<String, Pipeline>,
    runs: HashMap<String, Run>,
    step_runs: Vec<StepRun>,
    logs: HashMap<String, Vec<LogEntry>>,
    events: Vec<Event>,
}

#[derive(Default)]
pub struct MemoryRunStore {
    inner: RwLock<Inner>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All persisted events, in append order. Test helper.
    pub async fn events(&self) -> Vec<Event> {
        self.inner.read().await.events.clone()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .pipelines
            .insert(pipeline.id.clone(), pipeline.clone());
        Ok(())
    }

    async fn load_pipeline(&self, pipeline_id: &str) -> Result<Option<Pipeline>, StoreError> {
        Ok(self.inner.read().await.pipelines.get(pipeline_id).cloned())
    }

    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::Constraint(format!("run '{}' exists", run.id)));
        }
        inner.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        Ok(self.inner.read().await.runs.get(run_id).cloned())
    }

    async fn list_runs(&self, pipeline_id: &str) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.read().await;
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| r.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn update_run(
        &self,
        run_id: &str,
        state: RunState,
        outputs: &BTreeMap<String, Value>,
        error: Option<&str>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound("run".to_string()))?;
        run.state = state;
        run.outputs = outputs.clone();
        run.error = error.map(str::to_string);
        run.finished_at = finished_at;
        Ok(())
    }

    async fn create_step_run(&self, step_run: &StepRun) -> Result<(), StoreError> {
        self.inner.write().await.step_runs.push(step_run.clone());
        Ok(())
    }

    async fn finish_step_run(&self, step_run: &StepRun) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .step_runs
            .iter_mut()
            .find(|sr| sr.id == step_run.id)
            .ok_or_else(|| StoreError::NotFound("step_run".to_string()))?;
        *slot = step_run.clone();
        Ok(())
    }

    async fn list_step_runs(&self, run_id: &str) -> Result<Vec<StepRun>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<StepRun> = inner
            .step_runs
            .iter()
            .filter(|sr| sr.run_id == run_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.step_id.cmp(&b.step_id).then(b.attempt.cmp(&a.attempt)));
        Ok(rows)
    }

    async fn append_log(&self, step_run_id: &str, entry: &LogEntry) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .logs
            .entry(step_run_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, step_run_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .logs
            .get(step_run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        self.inner.write().await.events.push(event.clone());
        Ok(())
    }

    async fn heartbeat(&self, run_id: &str, lease_until: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(run) = inner.runs.get_mut(run_id) {
            if run.state == RunState::Running {
                run.lease_until = Some(lease_until);
            }
        }
        Ok(())
    }

    async fn expired_runs(&self, now: DateTime<Utc>) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .values()
            .filter(|r| {
                r.state == RunState::Running
                    && r.lease_until.map(|lease| lease < now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}
