//! Core types for the weft pipeline engine
//!
//! This module defines the pipeline definition model (steps, ports,
//! connections) and the execution records (runs, step runs) shared by the
//! validator, executor, and run store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// Type of a step input or output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PortType {
    Text,
    Json,
    Number,
    Boolean,
    Array,
    File,
    Any,
}

impl PortType {
    /// Whether a value of `self` may flow into a port of type `target`.
    pub fn assignable_to(self, target: PortType) -> bool {
        use PortType::*;
        match (self, target) {
            (Any, _) | (_, Any) => true,
            (a, b) if a == b => true,
            (Text, Json) | (Text, Number) | (Text, Boolean) => true,
            (Number, Text) | (Boolean, Text) | (Array, Text) | (Json, Text) => true,
            _ => false,
        }
    }
}

/// Declaration of a single port on a step kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDecl {
    pub name: &'static str,
    pub ty: PortType,
    /// Only meaningful for input ports.
    pub required: bool,
}

impl PortDecl {
    const fn required(name: &'static str, ty: PortType) -> Self {
        Self { name, ty, required: true }
    }

    const fn optional(name: &'static str, ty: PortType) -> Self {
        Self { name, ty, required: false }
    }
}

/// Discriminant for the step kinds the engine can dispatch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepKind {
    Llm,
    Code,
    Api,
    Transform,
    Condition,
    Merge,
    Input,
    Output,
}

impl StepKind {
    /// Input port declarations for this kind.
    pub fn input_ports(self) -> &'static [PortDecl] {
        use PortType::*;
        const LLM_IN: &[PortDecl] = &[
            PortDecl::required("prompt", Text),
            PortDecl::optional("system_prompt", Text),
            PortDecl::optional("context", Text),
            PortDecl::optional("variables", Json),
        ];
        const CODE_IN: &[PortDecl] = &[
            PortDecl::required("code", Text),
            PortDecl::optional("variables", Json),
            PortDecl::optional("input_data", Any),
        ];
        const API_IN: &[PortDecl] = &[
            PortDecl::required("url", Text),
            PortDecl::required("method", Text),
            PortDecl::optional("headers", Json),
            PortDecl::optional("body", Any),
            PortDecl::optional("auth", Json),
        ];
        const TRANSFORM_IN: &[PortDecl] = &[PortDecl::required("data", Any)];
        const CONDITION_IN: &[PortDecl] = &[
            PortDecl::optional("data", Any),
            PortDecl::required("condition", Text),
        ];
        const MERGE_IN: &[PortDecl] = &[
            PortDecl::required("data1", Any),
            PortDecl::required("data2", Any),
            PortDecl::optional("strategy", Text),
        ];
        const INPUT_IN: &[PortDecl] = &[];
        const OUTPUT_IN: &[PortDecl] = &[PortDecl::required("data", Any)];
        match self {
            StepKind::Llm => LLM_IN,
            StepKind::Code => CODE_IN,
            StepKind::Api => API_IN,
            StepKind::Transform => TRANSFORM_IN,
            StepKind::Condition => CONDITION_IN,
            StepKind::Merge => MERGE_IN,
            StepKind::Input => INPUT_IN,
            StepKind::Output => OUTPUT_IN,
        }
    }

    /// Output port declarations for this kind.
    pub fn output_ports(self) -> &'static [PortDecl] {
        use PortType::*;
        const LLM_OUT: &[PortDecl] = &[
            PortDecl::required("text", Text),
            PortDecl::optional("json", Json),
            PortDecl::required("tokens", Number),
            PortDecl::required("cost", Number),
        ];
        const CODE_OUT: &[PortDecl] = &[
            PortDecl::required("result", Any),
            PortDecl::required("logs", Array),
            PortDecl::required("errors", Array),
        ];
        const API_OUT: &[PortDecl] = &[
            PortDecl::required("response", Json),
            PortDecl::required("status", Number),
            PortDecl::required("headers", Json),
        ];
        const TRANSFORM_OUT: &[PortDecl] = &[PortDecl::required("result", Any)];
        const CONDITION_OUT: &[PortDecl] = &[
            PortDecl::required("result", Boolean),
            PortDecl::required("value", Any),
            PortDecl::optional("true_path", Any),
            PortDecl::optional("false_path", Any),
        ];
        const MERGE_OUT: &[PortDecl] = &[PortDecl::required("result", Any)];
        const INPUT_OUT: &[PortDecl] = &[PortDecl::required("value", Any)];
        const OUTPUT_OUT: &[PortDecl] = &[];
        match self {
            StepKind::Llm => LLM_OUT,
            StepKind::Code => CODE_OUT,
            StepKind::Api => API_OUT,
            StepKind::Transform => TRANSFORM_OUT,
            StepKind::Condition => CONDITION_OUT,
            StepKind::Merge => MERGE_OUT,
            StepKind::Input => INPUT_OUT,
            StepKind::Output => OUTPUT_OUT,
        }
    }

    pub fn input_port(self, name: &str) -> Option<&'static PortDecl> {
        self.input_ports().iter().find(|p| p.name == name)
    }

    pub fn output_port(self, name: &str) -> Option<&'static PortDecl> {
        self.output_ports().iter().find(|p| p.name == name)
    }
}

/// Kind-specific step configuration as a tagged union.
///
/// Raw JSON appears only at the storage boundary; in memory every kind
/// carries typed fields. Unknown fields are collected into `extra` and
/// surfaced as validation warnings rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StepConfig {
    Llm(LlmConfig),
    Code(CodeConfig),
    Api(ApiConfig),
    Transform(TransformConfig),
    Condition(ConditionConfig),
    Merge(MergeConfig),
    Input(InputConfig),
    Output(OutputConfig),
}

impl StepConfig {
    pub fn kind(&self) -> StepKind {
        match self {
            StepConfig::Llm(_) => StepKind::Llm,
            StepConfig::Code(_) => StepKind::Code,
            StepConfig::Api(_) => StepKind::Api,
            StepConfig::Transform(_) => StepKind::Transform,
            StepConfig::Condition(_) => StepKind::Condition,
            StepConfig::Merge(_) => StepKind::Merge,
            StepConfig::Input(_) => StepKind::Input,
            StepConfig::Output(_) => StepKind::Output,
        }
    }

    /// Fields not recognised by the schema, tolerated for forward
    /// compatibility. Transform configs are fully tagged and carry none.
    pub fn extra_fields(&self) -> Option<&serde_json::Map<String, Value>> {
        match self {
            StepConfig::Llm(c) => Some(&c.extra),
            StepConfig::Code(c) => Some(&c.extra),
            StepConfig::Api(c) => Some(&c.extra),
            StepConfig::Transform(_) => None,
            StepConfig::Condition(c) => Some(&c.extra),
            StepConfig::Merge(c) => Some(&c.extra),
            StepConfig::Input(c) => Some(&c.extra),
            StepConfig::Output(c) => Some(&c.extra),
        }
    }

    /// Literal value bound to an input port directly in the config, if any.
    ///
    /// Used by the executor when a required port has no inbound connection.
    pub fn literal_for_port(&self, port: &str) -> Option<Value> {
        match self {
            StepConfig::Llm(c) => match port {
                "prompt" => Some(Value::String(c.prompt.clone())),
                "system_prompt" => c.system_prompt.clone().map(Value::String),
                "variables" => c.variables.clone(),
                _ => None,
            },
            StepConfig::Code(c) => match port {
                "code" => Some(Value::String(c.code.clone())),
                "variables" => c.variables.clone(),
                "input_data" => c.input_data.clone(),
                _ => None,
            },
            StepConfig::Api(c) => match port {
                "url" => Some(Value::String(c.url.clone())),
                "method" => Some(Value::String(c.method.clone())),
                "headers" => c.headers.clone(),
                "body" => c.body.clone(),
                "auth" => c.auth.as_ref().map(|a| serde_json::to_value(a).unwrap_or(Value::Null)),
                _ => None,
            },
            StepConfig::Condition(c) => match port {
                "condition" => Some(Value::String(c.condition.clone())),
                _ => None,
            },
            StepConfig::Merge(c) => match port {
                "strategy" => Some(Value::String(c.strategy.to_string())),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Configuration for an `llm` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Requested shape of the model response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResponseFormat {
    Text,
    Json,
}

/// Configuration for a `code` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeConfig {
    pub language: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Configuration for an `api` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub follow_redirects: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_true() -> bool {
    true
}

/// Authentication applied by the `api` runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    ApiKey {
        key: String,
        #[serde(default = "default_api_key_header")]
        header: String,
    },
}

fn default_api_key_header() -> String {
    "X-Api-Key".to_string()
}

/// Configuration for a `transform` step, tagged by transform type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransformConfig {
    Extract {
        mappings: Vec<ExtractMapping>,
    },
    Filter {
        conditions: Vec<FilterCondition>,
    },
    Format {
        template: String,
    },
    Aggregate {},
    Custom {
        expression: String,
    },
}

/// One source-to-target mapping of an `extract` transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractMapping {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub mode: ExtractMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExtractMode {
    #[default]
    Direct,
    Function,
    Expression,
}

/// One predicate of a `filter` transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    Startswith,
    Endswith,
    Regex,
}

/// Configuration for a `condition` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub condition: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Configuration for a `merge` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub strategy: MergeStrategy,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    ObjectMerge,
    Concat,
    FirstNonNull,
    Zip,
}

/// Configuration for an `input` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Initial variable to expose; defaults to the step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Configuration for an `output` step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Exponential backoff settings for step retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryBackoff {
    pub base_ms: u64,
    pub factor: f64,
    pub cap_ms: u64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self { base_ms: 250, factor: 2.0, cap_ms: 30_000 }
    }
}

impl RetryBackoff {
    /// Delay before re-dispatching `attempt + 1`, 1-based attempts.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).min(24);
        let ms = (self.base_ms as f64 * self.factor.powi(exp as i32)) as u64;
        std::time::Duration::from_millis(ms.min(self.cap_ms))
    }
}

/// Layout hint carried through from the builder UI; semantically inert.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One node of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub config: StepConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_step_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub retry_backoff: RetryBackoff,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<StepEstimate>,
    #[serde(default)]
    pub position: Position,
}

fn default_step_timeout_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    1
}

impl Step {
    pub fn kind(&self) -> StepKind {
        self.config.kind()
    }
}

/// Dry-run cost table entry for a step.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StepEstimate {
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub cost: f64,
}

/// `(step_id, port_name)` endpoint of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub step_id: String,
    pub port: String,
}

impl PortRef {
    pub fn new(step_id: impl Into<String>, port: impl Into<String>) -> Self {
        Self { step_id: step_id.into(), port: port.into() }
    }
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.step_id, self.port)
    }
}

/// Typed edge between two step ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source: PortRef,
    pub target: PortRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A user-authored pipeline definition. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Pipeline {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Terminal and non-terminal states of a run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed | RunState::Cancelled)
    }
}

/// Options accepted at submit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts_default: Option<u32>,
    /// Run-wide retry budget; the tighter of this and per-step
    /// `max_attempts` wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_retries: Option<u32>,
    /// Cancel the whole run on the first terminal step failure. When
    /// off, unaffected branches keep executing and the failure is
    /// recorded for the final state.
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default)]
    pub resumable: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            concurrency: None,
            run_timeout_ms: None,
            max_attempts_default: None,
            max_total_retries: None,
            fail_fast: true,
            resumable: false,
        }
    }
}

/// One execution of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub pipeline_id: String,
    /// Deep copy of the definition at submit time; later edits to the
    /// pipeline do not affect this run.
    pub pipeline_snapshot: Pipeline,
    pub state: RunState,
    pub initial_variables: BTreeMap<String, Value>,
    pub options: RunOptions,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    pub created_by: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Executor lease expiry; heartbeated while the run is live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
}

/// States of a single step attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepRunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepRunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepRunState::Pending | StepRunState::Running)
    }
}

/// Duration and usage accounting for one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    pub duration_ms: u64,
    pub tokens: u64,
    pub cost: f64,
}

/// Record of one attempt of one step within a run.
///
/// A retried step gets a fresh record per attempt; only the latest
/// attempt is authoritative for downstream ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    /// 1-based attempt counter.
    pub attempt: u32,
    pub state: StepRunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub metrics: StepMetrics,
}

/// Severity of a step log line.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Append-only log line attached to a step run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub level: LogLevel,
    pub message: String,
    pub ts: DateTime<Utc>,
}

/// Condensed view of a run returned by `get_run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub pipeline_id: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outputs: BTreeMap<String, Value>,
    pub error: Option<String>,
    pub dry_run: bool,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id.clone(),
            pipeline_id: run.pipeline_id.clone(),
            state: run.state,
            started_at: run.started_at,
            finished_at: run.finished_at,
            outputs: run.outputs.clone(),
            error: run.error.clone(),
            dry_run: run.options.dry_run,
        }
    }
}
