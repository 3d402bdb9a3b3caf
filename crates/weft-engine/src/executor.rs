//! Run executor
//!
//! One executor task owns one run end to end. Workers execute a single
//! attempt each and report back over the executor's mailbox; the
//! executor alone mutates the variable store and persists run/step-run
//! transitions, so scheduling state never sees cross-task contention.
//!
//! Dispatch order is deterministic: the ready set is ordered by step id
//! and the plan comes from Kahn's algorithm with the same tie-break.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use weft_core::config::EngineConfig;
use weft_core::error::{StepError, StoreError};
use weft_core::event::{Event, EventPayload};
use weft_core::graph::PipelineGraph;
use weft_core::resolver::Resolver;
use weft_core::traits::RunStore;
use weft_core::types::{
    LogEntry, LogLevel, PortRef, PortType, Run, RunState, Step, StepKind, StepMetrics, StepRun,
    StepRunState,
};
use weft_core::vars::VariableStore;

use crate::bus::EventBus;
use crate::runners::{
    RunnerRegistry, RunnerSignal, Services, StepContext, StepEmitter, StepInputs, StepOutputs,
};

const STORE_RETRY_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Mailbox messages. Workers push signals and completions; timers push
/// retry wake-ups and the run deadline.
enum ExecMsg {
    Signal(RunnerSignal),
    AttemptDone {
        step_id: String,
        attempt: u32,
        result: Result<StepOutputs, StepError>,
        duration_ms: u64,
    },
    RetryDue {
        step_id: String,
    },
    RunDeadline {
        reason: String,
    },
}

#[derive(Debug)]
enum EndReason {
    FailFast { step_id: String },
    ExternalCancel,
    DeadlineExceeded { reason: String },
}

struct InFlight {
    attempt: u32,
    step_run: StepRun,
    handle: JoinHandle<()>,
}

pub(crate) struct Executor {
    run: Run,
    graph: PipelineGraph,
    store: Arc<dyn RunStore>,
    bus: EventBus,
    services: Services,
    runners: Arc<RunnerRegistry>,
    config: EngineConfig,
    cancel: CancellationToken,

    vars: VariableStore,
    skipped_ports: HashSet<(String, String)>,
    finished: HashSet<String>,
    pending: HashMap<String, usize>,
    ready: BTreeSet<String>,
    in_flight: HashMap<String, InFlight>,
    backing_off: HashSet<String>,
    attempts: HashMap<String, u32>,
    retries_used: u32,
    outputs: BTreeMap<String, Value>,
    first_error: Option<String>,
    end: Option<EndReason>,
    /// Highest persisted log seq per step-run id, so executor-side log
    /// lines never collide with runner-emitted ones.
    log_seq: HashMap<String, u64>,

    tx: mpsc::UnboundedSender<ExecMsg>,
    rx: mpsc::UnboundedReceiver<ExecMsg>,
}

impl Executor {
    pub(crate) fn new(
        run: Run,
        graph: PipelineGraph,
        store: Arc<dyn RunStore>,
        bus: EventBus,
        services: Services,
        runners: Arc<RunnerRegistry>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        let vars = VariableStore::seeded(
            run.initial_variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let mut executor = Self {
            run,
            graph,
            store,
            bus,
            services,
            runners,
            config,
            cancel,
            vars,
            skipped_ports: HashSet::new(),
            finished: HashSet::new(),
            pending: HashMap::new(),
            ready: BTreeSet::new(),
            in_flight: HashMap::new(),
            backing_off: HashSet::new(),
            attempts: HashMap::new(),
            retries_used: 0,
            outputs: BTreeMap::new(),
            first_error: None,
            end: None,
            log_seq: HashMap::new(),
            tx,
            rx,
        };
        executor.seed_ready();
        executor
    }

    /// Pre-load results from a previous attempt at this run, used by the
    /// recovery path when a run is resumable.
    pub(crate) fn preload_step_results(&mut self, step_runs: &[StepRun]) {
        let mut latest: HashMap<&str, &StepRun> = HashMap::new();
        for step_run in step_runs {
            let slot = latest.entry(step_run.step_id.as_str()).or_insert(step_run);
            if step_run.attempt > slot.attempt {
                *slot = step_run;
            }
        }
        for (step_id, step_run) in latest {
            let Some(step) = self.graph.step(step_id).cloned() else { continue };
            match step_run.state {
                StepRunState::Succeeded => {
                    let outputs: StepOutputs = step_run
                        .outputs
                        .as_ref()
                        .and_then(|v| v.as_object())
                        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                        .unwrap_or_default();
                    self.record_outputs(&step, &outputs);
                    self.mark_finished(step_id.to_string());
                }
                StepRunState::Skipped => {
                    for port in step.kind().output_ports() {
                        self.skipped_ports
                            .insert((step.id.clone(), port.name.to_string()));
                    }
                    self.mark_finished(step_id.to_string());
                }
                _ => {}
            }
        }
    }

    fn seed_ready(&mut self) {
        for id in self.graph.steps_by_id().keys() {
            let upstream = self.graph.upstream(id).len();
            self.pending.insert(id.clone(), upstream);
            if upstream == 0 {
                self.ready.insert(id.clone());
            }
        }
    }

    fn concurrency(&self) -> usize {
        self.run
            .options
            .concurrency
            .unwrap_or(self.config.worker_pool_default)
            .max(1)
    }

    pub(crate) async fn execute(mut self) {
        if self.run.options.dry_run {
            self.dry_run().await;
            return;
        }

        info!("run {}: starting executor", self.run.id);
        self.persist_run_state(RunState::Running, None).await;
        self.emit(EventPayload::RunStarted {
            pipeline_id: self.run.pipeline_id.clone(),
            dry_run: false,
        })
        .await;

        let heartbeat = self.spawn_heartbeat();
        let deadline = self.spawn_deadline();

        loop {
            if self.end.is_none() {
                self.pump_dispatch().await;
            }
            if self.in_flight.is_empty()
                && self.backing_off.is_empty()
                && (self.end.is_some() || self.ready.is_empty())
            {
                break;
            }

            if self.end.is_some() {
                // Draining: in-flight steps get the grace period to honour
                // cancellation, then they are aborted.
                match tokio::time::timeout(self.config.cancel_grace, self.rx.recv()).await {
                    Ok(Some(msg)) => self.handle(msg).await,
                    Ok(None) => break,
                    Err(_) => {
                        self.abort_in_flight().await;
                        break;
                    }
                }
            } else {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("run {}: cancellation observed", self.run.id);
                        self.begin_shutdown(EndReason::ExternalCancel).await;
                    }
                    msg = self.rx.recv() => match msg {
                        Some(msg) => self.handle(msg).await,
                        None => break,
                    },
                }
            }
        }

        heartbeat.abort();
        deadline.abort();
        self.finalize().await;
    }

    async fn begin_shutdown(&mut self, reason: EndReason) {
        if self.end.is_some() {
            return;
        }
        self.ready.clear();
        // Steps waiting out a retry backoff will not be re-dispatched.
        let backing_off: Vec<String> = self.backing_off.drain().collect();
        for step_id in backing_off {
            let attempt = self.attempts.get(&step_id).copied().unwrap_or(1);
            self.emit(EventPayload::StepCancelled { step_id: step_id.clone(), attempt })
                .await;
            self.mark_finished(step_id);
        }
        self.end = Some(reason);
        self.cancel.cancel();
    }

    async fn handle(&mut self, msg: ExecMsg) {
        match msg {
            ExecMsg::Signal(RunnerSignal::StreamChunk { step_id, delta }) => {
                self.emit(EventPayload::StepStreamChunk { step_id, delta }).await;
            }
            ExecMsg::Signal(RunnerSignal::Log { step_id, entry }) => {
                self.persist_runner_log(&step_id, entry).await;
            }
            ExecMsg::AttemptDone { step_id, attempt, result, duration_ms } => {
                self.on_attempt_done(step_id, attempt, result, duration_ms).await;
            }
            ExecMsg::RetryDue { step_id } => {
                if self.backing_off.remove(&step_id) && self.end.is_none() {
                    self.ready.insert(step_id);
                }
            }
            ExecMsg::RunDeadline { reason } => {
                if self.end.is_none() {
                    warn!("run {}: {reason}", self.run.id);
                    self.begin_shutdown(EndReason::DeadlineExceeded { reason }).await;
                }
            }
        }
    }

    async fn pump_dispatch(&mut self) {
        while self.end.is_none() && self.in_flight.len() < self.concurrency() {
            let Some(step_id) = self.ready.iter().next().cloned() else { break };
            self.ready.remove(&step_id);
            if self.finished.contains(&step_id) || self.in_flight.contains_key(&step_id) {
                continue;
            }
            if let Some(reason) = self.skip_reason(&step_id) {
                self.skip_step(&step_id, reason).await;
                continue;
            }
            self.dispatch(step_id).await;
        }
    }

    /// Why this step must be skipped instead of dispatched, if at all.
    fn skip_reason(&self, step_id: &str) -> Option<String> {
        let step = self.graph.step(step_id)?;
        if !step.enabled {
            return Some("step is disabled".to_string());
        }
        for port in step.kind().input_ports() {
            if !port.required {
                continue;
            }
            let target = PortRef::new(step_id, port.name);
            if let Some(conn) = self.graph.source_of(&target) {
                let source = (conn.source.step_id.clone(), conn.source.port.clone());
                if self.skipped_ports.contains(&source) {
                    return Some(format!(
                        "required input '{}' fed by skipped port {}",
                        port.name, conn.source
                    ));
                }
            }
        }
        None
    }

    async fn skip_step(&mut self, step_id: &str, reason: String) {
        debug!("run {}: skipping step {step_id}: {reason}", self.run.id);
        let step = self.graph.step(step_id).expect("scheduled step exists").clone();
        let attempt = self.next_attempt(step_id);
        let now = self.services.clock.now();
        let step_run = StepRun {
            id: Uuid::new_v4().to_string(),
            run_id: self.run.id.clone(),
            step_id: step_id.to_string(),
            attempt,
            state: StepRunState::Skipped,
            started_at: Some(now),
            finished_at: Some(now),
            inputs: Value::Null,
            outputs: None,
            error: None,
            error_code: None,
            metrics: StepMetrics::default(),
        };
        self.persist_step_run_create(&step_run).await;
        self.persist_step_run_finish(&step_run).await;
        self.emit(EventPayload::StepSkipped {
            step_id: step_id.to_string(),
            reason: Some(reason),
        })
        .await;
        for port in step.kind().output_ports() {
            self.skipped_ports
                .insert((step.id.clone(), port.name.to_string()));
        }
        self.mark_finished(step_id.to_string());
    }

    fn next_attempt(&mut self, step_id: &str) -> u32 {
        let counter = self.attempts.entry(step_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    async fn dispatch(&mut self, step_id: String) {
        let step = self.graph.step(&step_id).expect("scheduled step exists").clone();
        let attempt = self.next_attempt(&step_id);

        let resolution = self.resolve_inputs(&step).await;
        let now = self.services.clock.now();
        let mut step_run = StepRun {
            id: Uuid::new_v4().to_string(),
            run_id: self.run.id.clone(),
            step_id: step_id.clone(),
            attempt,
            state: StepRunState::Running,
            started_at: Some(now),
            finished_at: None,
            inputs: Value::Null,
            outputs: None,
            error: None,
            error_code: None,
            metrics: StepMetrics::default(),
        };

        match resolution {
            Err(err) => {
                // Resolution failures surface as a failed attempt without
                // dispatching the runner.
                self.persist_step_run_create(&step_run).await;
                if attempt == 1 {
                    self.emit(EventPayload::StepStarted { step_id: step_id.clone(), attempt })
                        .await;
                }
                self.in_flight.insert(
                    step_id.clone(),
                    InFlight { attempt, step_run, handle: tokio::spawn(async {}) },
                );
                self.on_attempt_done(step_id, attempt, Err(err), 0).await;
            }
            Ok((inputs, warnings)) => {
                step_run.inputs = Value::Object(inputs.clone().into_iter().collect());
                self.persist_step_run_create(&step_run).await;
                if attempt == 1 {
                    self.emit(EventPayload::StepStarted { step_id: step_id.clone(), attempt })
                        .await;
                } else {
                    self.executor_log(
                        &step_run.id.clone(),
                        &step_id,
                        LogLevel::Info,
                        format!("retry attempt {attempt}"),
                    )
                    .await;
                }
                for warning in warnings {
                    self.executor_log(&step_run.id.clone(), &step_id, LogLevel::Warn, warning)
                        .await;
                }

                let handle = self.spawn_worker(&step, attempt, inputs);
                self.in_flight
                    .insert(step_id, InFlight { attempt, step_run, handle });
            }
        }
    }

    fn spawn_worker(&self, step: &Step, attempt: u32, inputs: StepInputs) -> JoinHandle<()> {
        let step = step.clone();
        let run_id = self.run.id.clone();
        let services = self.services.clone();
        let runners = self.runners.clone();
        let token = self.cancel.child_token();
        let vars = self.vars.as_value();
        let tx = self.tx.clone();
        let signal_tx = self.tx.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let step_id = step.id.clone();
            let emitter = StepEmitter::new(
                step_id.clone(),
                Arc::new(move |signal| {
                    let _ = signal_tx.send(ExecMsg::Signal(signal));
                }),
            );

            let result = match runners.get(step.kind()) {
                None => Err(StepError::Internal(format!(
                    "no runner registered for kind '{}'",
                    step.kind()
                ))),
                Some(runner) => {
                    let ctx = StepContext {
                        run_id: &run_id,
                        step: &step,
                        services: &services,
                        cancel: token.clone(),
                        emitter,
                        vars,
                    };
                    let timeout = Duration::from_millis(step.timeout_ms);
                    tokio::select! {
                        _ = token.cancelled() => Err(StepError::Cancelled),
                        outcome = tokio::time::timeout(timeout, runner.run(&ctx, inputs)) => {
                            match outcome {
                                Ok(result) => result,
                                Err(_) => Err(StepError::Timeout),
                            }
                        }
                    }
                }
            };

            let _ = tx.send(ExecMsg::AttemptDone {
                step_id,
                attempt,
                result,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        })
    }

    async fn on_attempt_done(
        &mut self,
        step_id: String,
        attempt: u32,
        result: Result<StepOutputs, StepError>,
        duration_ms: u64,
    ) {
        let Some(in_flight) = self.in_flight.remove(&step_id) else {
            // Aborted during the grace period; the record was already
            // finalized as cancelled.
            return;
        };
        let mut step_run = in_flight.step_run;
        let step = self.graph.step(&step_id).expect("scheduled step exists").clone();
        step_run.finished_at = Some(self.services.clock.now());

        match result {
            Ok(outputs) => {
                let metrics = StepMetrics {
                    duration_ms,
                    tokens: outputs.get("tokens").and_then(Value::as_u64).unwrap_or(0),
                    cost: outputs.get("cost").and_then(Value::as_f64).unwrap_or(0.0),
                };
                step_run.state = StepRunState::Succeeded;
                step_run.outputs =
                    Some(Value::Object(outputs.clone().into_iter().collect()));
                step_run.metrics = metrics;
                self.persist_step_run_finish(&step_run).await;

                if step.kind() == StepKind::Output {
                    let data = step_run
                        .inputs
                        .get("data")
                        .cloned()
                        .unwrap_or(Value::Null);
                    self.outputs.insert(step.name.clone(), data);
                }
                self.record_outputs(&step, &outputs);
                self.emit(EventPayload::StepSucceeded { step_id: step_id.clone(), metrics })
                    .await;
                self.mark_finished(step_id);
            }
            Err(StepError::Cancelled) => {
                step_run.state = StepRunState::Cancelled;
                step_run.error = Some(StepError::Cancelled.to_string());
                step_run.error_code = Some(StepError::Cancelled.code());
                step_run.metrics.duration_ms = duration_ms;
                self.persist_step_run_finish(&step_run).await;
                self.emit(EventPayload::StepCancelled { step_id: step_id.clone(), attempt })
                    .await;
                self.mark_finished(step_id);
            }
            Err(err) => {
                step_run.state = StepRunState::Failed;
                step_run.error = Some(err.to_string());
                step_run.error_code = Some(err.code());
                step_run.metrics.duration_ms = duration_ms;
                self.persist_step_run_finish(&step_run).await;

                if self.retry_allowed(&step, attempt, &err) {
                    self.retries_used += 1;
                    let delay = step.retry_backoff.delay_for_attempt(attempt);
                    self.executor_log(
                        &step_run.id.clone(),
                        &step_id,
                        LogLevel::Warn,
                        format!(
                            "attempt {attempt} failed ({}); retrying in {}ms",
                            err,
                            delay.as_millis()
                        ),
                    )
                    .await;
                    self.backing_off.insert(step_id.clone());
                    let tx = self.tx.clone();
                    let clock = self.services.clock.clone();
                    tokio::spawn(async move {
                        clock.sleep(delay).await;
                        let _ = tx.send(ExecMsg::RetryDue { step_id });
                    });
                } else {
                    error!(
                        "run {}: step {step_id} failed terminally on attempt {attempt}: {err}",
                        self.run.id
                    );
                    self.emit(EventPayload::StepFailed {
                        step_id: step_id.clone(),
                        error: err.to_string(),
                        code: err.code(),
                        attempt,
                    })
                    .await;
                    if self.first_error.is_none() {
                        self.first_error =
                            Some(format!("step '{step_id}' failed: {err}"));
                    }
                    // Downstream consumers resolve as skipped so non
                    // fail-fast runs can drain the rest of the graph.
                    for port in step.kind().output_ports() {
                        self.skipped_ports
                            .insert((step.id.clone(), port.name.to_string()));
                    }
                    self.mark_finished(step_id.clone());
                    if self.run.options.fail_fast {
                        self.begin_shutdown(EndReason::FailFast { step_id }).await;
                    }
                }
            }
        }
    }

    fn retry_allowed(&self, step: &Step, attempt: u32, err: &StepError) -> bool {
        if self.end.is_some() || !err.retryable() {
            return false;
        }
        if attempt >= self.effective_max_attempts(step) {
            return false;
        }
        match self.run.options.max_total_retries {
            Some(budget) => self.retries_used < budget,
            None => true,
        }
    }

    fn effective_max_attempts(&self, step: &Step) -> u32 {
        if step.max_attempts > 1 {
            step.max_attempts
        } else {
            self.run
                .options
                .max_attempts_default
                .unwrap_or(step.max_attempts)
                .max(1)
        }
    }

    /// Write a successful attempt's outputs into the variable store and
    /// mark declared-but-absent ports (condition branches) as skipped.
    fn record_outputs(&mut self, step: &Step, outputs: &StepOutputs) {
        for port in step.kind().output_ports() {
            match outputs.get(port.name) {
                Some(value) => {
                    self.vars.set(
                        &format!("steps.{}.{}", step.id, port.name),
                        value.clone(),
                    );
                    // Convenience alias for the last-completed step.
                    self.vars.set(port.name, value.clone());
                }
                None => {
                    self.skipped_ports
                        .insert((step.id.clone(), port.name.to_string()));
                }
            }
        }
    }

    fn mark_finished(&mut self, step_id: String) {
        if !self.finished.insert(step_id.clone()) {
            return;
        }
        for next in self.graph.downstream(&step_id) {
            let next = next.to_string();
            if let Some(remaining) = self.pending.get_mut(&next) {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 && !self.finished.contains(&next) {
                    self.ready.insert(next);
                }
            }
        }
    }

    async fn resolve_inputs(
        &self,
        step: &Step,
    ) -> Result<(StepInputs, Vec<String>), StepError> {
        let mut inputs = StepInputs::new();
        let mut warnings = Vec::new();
        for port in step.kind().input_ports() {
            let target = PortRef::new(step.id.clone(), port.name);
            if let Some(conn) = self.graph.source_of(&target) {
                let source = (conn.source.step_id.clone(), conn.source.port.clone());
                if self.skipped_ports.contains(&source) {
                    // Required-and-skipped was handled before dispatch;
                    // an optional skipped input just stays absent.
                    continue;
                }
                let path = format!("steps.{}.{}", conn.source.step_id, conn.source.port);
                if let Some(value) = self.vars.get(&path) {
                    inputs.insert(port.name.to_string(), value.clone());
                }
                continue;
            }

            let Some(literal) = step.config.literal_for_port(port.name) else {
                continue;
            };
            let mut resolver =
                Resolver::new(&self.vars).with_credentials(self.services.credentials.as_ref());
            let resolved = if step.kind() == StepKind::Api && port.name == "body" {
                match &literal {
                    Value::String(text) => resolver.resolve_json_text(text).await?,
                    other => resolver.resolve_value(other).await?,
                }
            } else {
                match (&literal, port.ty) {
                    // Text ports are string contexts: missing paths render
                    // as the empty string, never as null.
                    (Value::String(text), PortType::Text) => {
                        Value::String(resolver.resolve_str(text).await?)
                    }
                    (other, _) => resolver.resolve_value(other).await?,
                }
            };
            warnings.extend(resolver.warnings);
            inputs.insert(port.name.to_string(), resolved);
        }
        Ok((inputs, warnings))
    }

    async fn dry_run(mut self) {
        info!("run {}: dry run", self.run.id);
        self.persist_run_state(RunState::Running, None).await;
        self.emit(EventPayload::RunStarted {
            pipeline_id: self.run.pipeline_id.clone(),
            dry_run: true,
        })
        .await;

        let order = match self.graph.kahn_order() {
            Ok(order) => order,
            Err(residue) => {
                // Submission validates first, so this is unreachable in
                // practice; fail the run rather than panic.
                let message = format!("cycle through {}", residue.join(", "));
                self.persist_run_state(RunState::Failed, Some(&message)).await;
                self.emit(EventPayload::RunFinished {
                    state: RunState::Failed,
                    error: Some(message),
                })
                .await;
                return;
            }
        };

        let mut steps = Vec::new();
        let mut total_duration_ms = 0u64;
        let mut total_cost = 0.0f64;
        for (index, step_id) in order.iter().enumerate() {
            let step = self.graph.step(step_id).expect("planned step exists");
            let (resolved, warnings) = match self.resolve_inputs(step).await {
                Ok((inputs, warnings)) => {
                    (Value::Object(inputs.into_iter().collect()), warnings)
                }
                Err(err) => (Value::Null, vec![err.to_string()]),
            };
            let bound_ports: Vec<String> = self
                .graph
                .incoming(step_id)
                .map(|conn| conn.target.port.clone())
                .collect();
            let estimate = step.estimate.unwrap_or_default();
            total_duration_ms += estimate.duration_ms;
            total_cost += estimate.cost;
            steps.push(json!({
                "step_id": step_id,
                "order": index,
                "kind": step.kind().to_string(),
                "enabled": step.enabled,
                "estimated_duration_ms": estimate.duration_ms,
                "estimated_cost": estimate.cost,
                "resolved_inputs": resolved,
                "connected_ports": bound_ports,
                "warnings": warnings,
            }));
        }
        let report = json!({
            "steps": steps,
            "total_estimated_duration_ms": total_duration_ms,
            "total_estimated_cost": total_cost,
        });
        self.emit(EventPayload::DryRunReport { report }).await;

        self.persist_run_state(RunState::Succeeded, None).await;
        self.emit(EventPayload::RunFinished { state: RunState::Succeeded, error: None })
            .await;
    }

    async fn finalize(mut self) {
        let (state, error) = match &self.end {
            Some(EndReason::ExternalCancel) => (RunState::Cancelled, None),
            Some(EndReason::DeadlineExceeded { reason }) => {
                (RunState::Cancelled, Some(reason.clone()))
            }
            Some(EndReason::FailFast { .. }) => {
                (RunState::Failed, self.first_error.clone())
            }
            None => match &self.first_error {
                Some(error) => (RunState::Failed, Some(error.clone())),
                None => (RunState::Succeeded, None),
            },
        };

        info!("run {}: finished with state {state}", self.run.id);
        self.run.state = state;
        self.run.finished_at = Some(self.services.clock.now());
        self.persist_run_state(state, error.as_deref()).await;
        self.emit(EventPayload::RunFinished { state, error }).await;
    }

    /// Abort workers that ignored cancellation past the grace period and
    /// finalize their records as cancelled.
    async fn abort_in_flight(&mut self) {
        let stuck: Vec<String> = self.in_flight.keys().cloned().collect();
        for step_id in stuck {
            let Some(in_flight) = self.in_flight.remove(&step_id) else { continue };
            warn!(
                "run {}: aborting step {step_id} after cancellation grace period",
                self.run.id
            );
            in_flight.handle.abort();
            let mut step_run = in_flight.step_run;
            step_run.state = StepRunState::Cancelled;
            step_run.finished_at = Some(self.services.clock.now());
            step_run.error = Some("aborted after cancellation grace period".to_string());
            step_run.error_code = Some("cancelled".to_string());
            self.persist_step_run_finish(&step_run).await;
            self.emit(EventPayload::StepCancelled {
                step_id: step_id.clone(),
                attempt: in_flight.attempt,
            })
            .await;
            self.mark_finished(step_id);
        }
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let run_id = self.run.id.clone();
        let lease = self.config.lease_duration;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lease / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let until = Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default();
                if let Err(err) = store.heartbeat(&run_id, until).await {
                    warn!("run {run_id}: heartbeat failed: {err}");
                }
            }
        })
    }

    /// The run deadline is the caller's timeout capped by the engine's
    /// maximum run lifetime, so a live executor can never outlast the
    /// reaper's expectations.
    fn spawn_deadline(&self) -> JoinHandle<()> {
        let lifetime = self.config.run_max_lifetime;
        let (wait, reason) = match self.run.options.run_timeout_ms {
            Some(ms) if Duration::from_millis(ms) < lifetime => (
                Duration::from_millis(ms),
                "run-level timeout exceeded".to_string(),
            ),
            _ => (lifetime, "maximum run lifetime exceeded".to_string()),
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = tx.send(ExecMsg::RunDeadline { reason });
        })
    }

    // -- persistence helpers ------------------------------------------------

    async fn emit(&mut self, payload: EventPayload) {
        let event = Event::new(self.run.id.clone(), self.services.clock.now(), payload);
        self.bus.publish(event.clone());
        let store = self.store.clone();
        let result = with_store_retry(&self.services, || {
            let store = store.clone();
            let event = event.clone();
            async move { store.append_event(&event).await }
        })
        .await;
        if let Err(err) = result {
            warn!("run {}: event persistence failed: {err}", self.run.id);
        }
    }

    async fn executor_log(
        &mut self,
        step_run_id: &str,
        step_id: &str,
        level: LogLevel,
        message: String,
    ) {
        let seq = self
            .log_seq
            .get(step_run_id)
            .map(|max| max + 1)
            .unwrap_or(1_000_000);
        let entry = LogEntry { seq, level, message, ts: self.services.clock.now() };
        self.persist_log(step_run_id, &entry).await;
        self.log_seq.insert(step_run_id.to_string(), seq);
        self.emit(EventPayload::StepLog {
            step_id: step_id.to_string(),
            level: entry.level,
            message: entry.message,
            seq: entry.seq,
        })
        .await;
    }

    async fn persist_runner_log(&mut self, step_id: &str, entry: LogEntry) {
        let Some(step_run_id) = self
            .in_flight
            .get(step_id)
            .map(|f| f.step_run.id.clone())
        else {
            return;
        };
        self.persist_log(&step_run_id, &entry).await;
        let seen = self.log_seq.entry(step_run_id).or_insert(0);
        *seen = (*seen).max(entry.seq);
        self.emit(EventPayload::StepLog {
            step_id: step_id.to_string(),
            level: entry.level,
            message: entry.message,
            seq: entry.seq,
        })
        .await;
    }

    async fn persist_log(&self, step_run_id: &str, entry: &LogEntry) {
        let store = self.store.clone();
        let step_run_id = step_run_id.to_string();
        let entry = entry.clone();
        let result = with_store_retry(&self.services, || {
            let store = store.clone();
            let step_run_id = step_run_id.clone();
            let entry = entry.clone();
            async move { store.append_log(&step_run_id, &entry).await }
        })
        .await;
        if let Err(err) = result {
            warn!("run {}: log persistence failed: {err}", self.run.id);
        }
    }

    async fn persist_step_run_create(&self, step_run: &StepRun) {
        let store = self.store.clone();
        let step_run = step_run.clone();
        let result = with_store_retry(&self.services, || {
            let store = store.clone();
            let step_run = step_run.clone();
            async move { store.create_step_run(&step_run).await }
        })
        .await;
        if let Err(err) = result {
            error!("run {}: step-run create failed: {err}", self.run.id);
        }
    }

    async fn persist_step_run_finish(&self, step_run: &StepRun) {
        let store = self.store.clone();
        let step_run = step_run.clone();
        let result = with_store_retry(&self.services, || {
            let store = store.clone();
            let step_run = step_run.clone();
            async move { store.finish_step_run(&step_run).await }
        })
        .await;
        if let Err(err) = result {
            error!("run {}: step-run transition failed: {err}", self.run.id);
        }
    }

    async fn persist_run_state(&self, state: RunState, error: Option<&str>) {
        let store = self.store.clone();
        let run_id = self.run.id.clone();
        let outputs = self.outputs.clone();
        let finished_at = state.is_terminal().then(|| self.services.clock.now());
        let error = error.map(str::to_string);
        let result = with_store_retry(&self.services, || {
            let store = store.clone();
            let run_id = run_id.clone();
            let outputs = outputs.clone();
            let error = error.clone();
            async move {
                store
                    .update_run(&run_id, state, &outputs, error.as_deref(), finished_at)
                    .await
            }
        })
        .await;
        if let Err(err) = result {
            // The lease will expire and the recovery routine will mark the
            // run orphaned if this was the terminal transition.
            error!("run {}: run transition to {state} failed: {err}", self.run.id);
        }
    }
}

/// Bounded retry for store writes; only retryable store errors are
/// attempted again.
async fn with_store_retry<T, F, Fut>(services: &Services, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable() && attempt < STORE_RETRY_ATTEMPTS => {
                warn!("store write failed (attempt {attempt}): {err}");
                services.clock.sleep(STORE_RETRY_DELAY * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}
