//! Public engine API
//!
//! Synchronous submit, asynchronous completion. Validation happens
//! before a run row exists; a rejected pipeline never touches the store.
//! Each accepted run gets its own executor task and cancellation token.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use weft_core::config::EngineConfig;
use weft_core::error::EngineError;
use weft_core::event::Topic;
use weft_core::graph::PipelineGraph;
use weft_core::traits::RunStore;
use weft_core::types::{Pipeline, Run, RunOptions, RunState, RunSummary, StepRun};
use weft_core::validator;

use crate::bus::{EventBus, EventStream};
use crate::executor::Executor;
use crate::runners::{RunnerRegistry, Services};

struct ActiveRun {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The pipeline execution engine. Construct once, share behind an `Arc`,
/// embed in whatever serves the API.
pub struct Engine {
    store: Arc<dyn RunStore>,
    bus: EventBus,
    services: Services,
    runners: Arc<RunnerRegistry>,
    config: EngineConfig,
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl Engine {
    pub fn new(store: Arc<dyn RunStore>, services: Services, config: EngineConfig) -> Self {
        let bus = EventBus::new(config.event_queue_depth);
        Self {
            store,
            bus,
            services,
            runners: Arc::new(RunnerRegistry::with_defaults()),
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the runner registry, e.g. to add a custom step kind in
    /// tests or embedders.
    pub fn with_runners(mut self, runners: RunnerRegistry) -> Self {
        self.runners = Arc::new(runners);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Validate and launch a run. Returns the run id immediately;
    /// completion is observed via `subscribe` or `get_run`.
    pub async fn submit(
        &self,
        pipeline: Pipeline,
        initial_variables: BTreeMap<String, Value>,
        options: RunOptions,
        created_by: impl Into<String>,
    ) -> Result<String, EngineError> {
        let report = validator::validate(&pipeline);
        if !report.valid() {
            debug!(
                "pipeline '{}' rejected with {} validation error(s)",
                pipeline.id,
                report.errors.len()
            );
            return Err(EngineError::Validation { report });
        }
        for warning in &report.warnings {
            debug!("pipeline '{}': {}", pipeline.id, warning.message);
        }

        // Defaults from the definition fill anything the caller left out.
        let mut variables = pipeline.variables.clone();
        variables.extend(initial_variables);

        let now = self.services.clock.now();
        let run = Run {
            id: Uuid::new_v4().to_string(),
            pipeline_id: pipeline.id.clone(),
            pipeline_snapshot: pipeline,
            state: RunState::Pending,
            initial_variables: variables,
            options,
            outputs: BTreeMap::new(),
            created_by: created_by.into(),
            started_at: now,
            finished_at: None,
            error: None,
            lease_until: Some(now + self.lease()),
        };
        self.store.create_run(&run).await?;

        let run_id = run.id.clone();
        self.launch(run, &[]).await;
        info!("run {run_id}: accepted");
        Ok(run_id)
    }

    /// Submit by referencing a stored pipeline definition.
    pub async fn submit_by_id(
        &self,
        pipeline_id: &str,
        initial_variables: BTreeMap<String, Value>,
        options: RunOptions,
        created_by: impl Into<String>,
    ) -> Result<String, EngineError> {
        let pipeline = self
            .store
            .load_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(pipeline_id.to_string()))?;
        self.submit(pipeline, initial_variables, options, created_by).await
    }

    async fn launch(&self, run: Run, prior_step_runs: &[StepRun]) {
        let graph = PipelineGraph::build(&run.pipeline_snapshot)
            .expect("validated pipeline builds");
        let cancel = CancellationToken::new();
        let run_id = run.id.clone();
        let mut executor = Executor::new(
            run,
            graph,
            self.store.clone(),
            self.bus.clone(),
            self.services.clone(),
            self.runners.clone(),
            self.config.clone(),
            cancel.clone(),
        );
        if !prior_step_runs.is_empty() {
            executor.preload_step_results(prior_step_runs);
        }
        let handle = tokio::spawn(executor.execute());
        self.active
            .lock()
            .await
            .insert(run_id, ActiveRun { cancel, handle });
    }

    /// Cancel a run. Idempotent: cancelling a terminal run is a no-op.
    pub async fn cancel(&self, run_id: &str) -> Result<(), EngineError> {
        let active = self.active.lock().await;
        if let Some(entry) = active.get(run_id) {
            info!("run {run_id}: cancel requested");
            entry.cancel.cancel();
            return Ok(());
        }
        drop(active);

        match self.store.get_run(run_id).await? {
            Some(run) => {
                if !run.state.is_terminal() {
                    warn!("run {run_id}: cancel for run with no local executor");
                }
                Ok(())
            }
            None => Err(EngineError::NotFound(run_id.to_string())),
        }
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunSummary, EngineError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(run_id.to_string()))?;
        Ok(RunSummary::from(&run))
    }

    /// Attempts newest-first per step.
    pub async fn list_step_runs(&self, run_id: &str) -> Result<Vec<StepRun>, EngineError> {
        if self.store.get_run(run_id).await?.is_none() {
            return Err(EngineError::NotFound(run_id.to_string()));
        }
        Ok(self.store.list_step_runs(run_id).await?)
    }

    /// Subscribe with a selector: `run:<id>`, `step:<run>:<step>`,
    /// `run:*`, `step:*`.
    pub fn subscribe(&self, selector: &str) -> Result<EventStream, EngineError> {
        let topic = Topic::parse(selector)?;
        Ok(self.bus.subscribe(topic))
    }

    /// Wait for a run's executor task to finish. Test and shutdown
    /// helper; running pipelines are unaffected.
    pub async fn join(&self, run_id: &str) {
        let entry = self.active.lock().await.remove(run_id);
        if let Some(entry) = entry {
            let _ = entry.handle.await;
        }
    }

    /// Scan for lease-expired runs left behind by a dead executor:
    /// resumable runs are relaunched from their snapshot, everything
    /// else is marked failed as orphaned.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let expired = self.store.expired_runs(self.services.clock.now()).await?;
        let mut handled = 0;
        for run in expired {
            if self.active.lock().await.contains_key(&run.id) {
                continue;
            }
            handled += 1;
            if run.options.resumable {
                info!("run {}: resuming after lease expiry", run.id);
                let prior = self.store.list_step_runs(&run.id).await?;
                self.launch(run, &prior).await;
            } else {
                warn!("run {}: orphaned, marking failed", run.id);
                self.store
                    .update_run(
                        &run.id,
                        RunState::Failed,
                        &run.outputs,
                        Some("orphaned: executor lease expired"),
                        Some(self.services.clock.now()),
                    )
                    .await?;
            }
        }
        Ok(handled)
    }

    fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    /// Drop bookkeeping for finished executor tasks.
    pub async fn sweep_finished(&self) {
        let mut active = self.active.lock().await;
        active.retain(|_, entry| !entry.handle.is_finished());
    }
}
