//! Step runners
//!
//! One runner per step kind behind a single contract: resolved inputs
//! in, outputs or a typed failure out. Runners never touch the variable
//! store or the run records; the executor owns both. External effects
//! go through the injected services bundle.

pub mod api;
pub mod code;
pub mod condition;
pub mod io;
pub mod llm;
pub mod merge;
pub mod transform;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use weft_core::error::StepError;
use weft_core::traits::{Clock, CredentialResolver, HttpClient, ModelInvoker, Sandbox};
use weft_core::types::{LogEntry, LogLevel, Step, StepKind};

/// Injected service bundle shared by every runner.
#[derive(Clone)]
pub struct Services {
    pub model: Arc<dyn ModelInvoker>,
    pub http: Arc<dyn HttpClient>,
    pub sandbox: Arc<dyn Sandbox>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub clock: Arc<dyn Clock>,
}

pub type StepInputs = BTreeMap<String, Value>;
pub type StepOutputs = BTreeMap<String, Value>;

/// Signals a runner can raise mid-attempt; the executor turns them into
/// events and persisted log lines.
#[derive(Debug)]
pub enum RunnerSignal {
    StreamChunk { step_id: String, delta: String },
    Log { step_id: String, entry: LogEntry },
}

/// Handle for emitting signals from inside an attempt. Delivery is a
/// synchronous push into the executor's mailbox, so signals stay ordered
/// relative to the attempt's completion.
#[derive(Clone)]
pub struct StepEmitter {
    step_id: String,
    sink: Arc<dyn Fn(RunnerSignal) + Send + Sync>,
    seq: Arc<AtomicU64>,
}

impl StepEmitter {
    pub fn new(
        step_id: impl Into<String>,
        sink: Arc<dyn Fn(RunnerSignal) + Send + Sync>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            sink,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emitter whose signals go nowhere; used by dry runs and tests.
    pub fn noop(step_id: impl Into<String>) -> Self {
        Self::new(step_id, Arc::new(|_| {}))
    }

    pub fn chunk(&self, delta: impl Into<String>) {
        (self.sink)(RunnerSignal::StreamChunk {
            step_id: self.step_id.clone(),
            delta: delta.into(),
        });
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            level,
            message: message.into(),
            ts: Utc::now(),
        };
        (self.sink)(RunnerSignal::Log {
            step_id: self.step_id.clone(),
            entry,
        });
    }
}

/// Everything an attempt gets handed by the executor.
pub struct StepContext<'a> {
    pub run_id: &'a str,
    pub step: &'a Step,
    pub services: &'a Services,
    pub cancel: CancellationToken,
    pub emitter: StepEmitter,
    /// Snapshot of the variable store at dispatch, for runners that
    /// evaluate expressions or render templates against it.
    pub vars: Value,
}

/// The single contract every step kind implements.
#[async_trait]
pub trait StepRunner: Send + Sync {
    fn kind(&self) -> StepKind;

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        inputs: StepInputs,
    ) -> Result<StepOutputs, StepError>;
}

/// Dispatch table from step kind to runner.
pub struct RunnerRegistry {
    runners: HashMap<StepKind, Arc<dyn StepRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self { runners: HashMap::new() }
    }

    /// Registry with the built-in runner for every kind.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(llm::LlmRunner));
        registry.register(Arc::new(code::CodeRunner));
        registry.register(Arc::new(api::ApiRunner));
        registry.register(Arc::new(transform::TransformRunner));
        registry.register(Arc::new(condition::ConditionRunner));
        registry.register(Arc::new(merge::MergeRunner));
        registry.register(Arc::new(io::InputRunner));
        registry.register(Arc::new(io::OutputRunner));
        registry
    }

    pub fn register(&mut self, runner: Arc<dyn StepRunner>) {
        self.runners.insert(runner.kind(), runner);
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepRunner>> {
        self.runners.get(&kind).cloned()
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Helper shared by runners: fetch a required input, failing with a
/// consistent message when the executor's resolution missed it.
pub(crate) fn required<'a>(
    inputs: &'a StepInputs,
    port: &str,
) -> Result<&'a Value, StepError> {
    inputs
        .get(port)
        .ok_or_else(|| StepError::Internal(format!("required input '{port}' missing")))
}

pub(crate) fn required_str<'a>(
    inputs: &'a StepInputs,
    port: &str,
) -> Result<&'a str, StepError> {
    let value = required(inputs, port)?;
    value
        .as_str()
        .ok_or_else(|| StepError::Internal(format!("input '{port}' is not text")))
}
