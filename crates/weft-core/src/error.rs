//! Error taxonomy for the weft engine
//!
//! Every failure kind carries a stable string code and a retryable
//! default so the executor's retry policy never has to parse messages.

use thiserror::Error;

/// Model invocation failures, classified by the invoker.
#[derive(Debug, Clone, Error)]
#[error("model error ({kind}): {message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ModelErrorKind {
    RateLimit,
    Transient,
    Network,
    Auth,
    InvalidRequest,
    ContentPolicy,
}

impl ModelError {
    pub fn new(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            ModelErrorKind::RateLimit | ModelErrorKind::Transient | ModelErrorKind::Network
        )
    }
}

/// HTTP call failures observed by the `api` runner.
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    #[error("http status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
}

impl HttpError {
    pub fn retryable(&self) -> bool {
        match self {
            HttpError::Network(_) => true,
            HttpError::Status { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
        }
    }
}

/// Sandbox failures from the `code` runner. Non-retryable by default.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("sandbox timed out")]
    Timeout,
    #[error("sandbox exceeded memory limit")]
    Oom,
    #[error("sandbox raised: {0}")]
    Exception(String),
    #[error("sandbox policy violation: {0}")]
    Policy(String),
}

impl SandboxError {
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Timeout => "timeout",
            SandboxError::Oom => "oom",
            SandboxError::Exception(_) => "exception",
            SandboxError::Policy(_) => "policy",
        }
    }
}

/// Credential lookup failures.
#[derive(Debug, Clone, Error)]
#[error("credential '{reference}' unavailable: {message}")]
pub struct CredentialError {
    pub reference: String,
    pub message: String,
}

/// Run store failures. The executor retries these with bounded backoff.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("store constraint violated: {0}")]
    Constraint(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Query(_))
    }
}

/// Expression parse/eval failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("evaluation error: {0}")]
    Eval(String),
}

/// The single failure type produced by a step attempt.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("transform failed: {0}")]
    Transform(String),
    #[error("template render failed: {0}")]
    TemplateRender(String),
    #[error(transparent)]
    Expression(#[from] ExprError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("step timed out")]
    Timeout,
    #[error("step cancelled")]
    Cancelled,
    #[error("internal: {0}")]
    Internal(String),
}

impl StepError {
    /// Stable machine-readable code persisted with the step run.
    pub fn code(&self) -> String {
        match self {
            StepError::Model(e) => format!("model.{}", e.kind),
            StepError::Http(HttpError::Status { status, .. }) => format!("http.{status}"),
            StepError::Http(HttpError::Network(_)) => "http.network".to_string(),
            StepError::Sandbox(e) => format!("sandbox.{}", e.kind()),
            StepError::Transform(_) => "transform".to_string(),
            StepError::TemplateRender(_) => "template_render".to_string(),
            StepError::Expression(_) => "expression".to_string(),
            StepError::Credential(_) => "credential".to_string(),
            StepError::Timeout => "timeout".to_string(),
            StepError::Cancelled => "cancelled".to_string(),
            StepError::Internal(_) => "internal".to_string(),
        }
    }

    /// Default retry eligibility per failure kind.
    ///
    /// Timeouts surface here only for kinds where waiting longer can help;
    /// sandbox timeouts arrive as `Sandbox(Timeout)` and stay final.
    pub fn retryable(&self) -> bool {
        match self {
            StepError::Model(e) => e.retryable(),
            StepError::Http(e) => e.retryable(),
            StepError::Sandbox(_) => false,
            StepError::Transform(_) => false,
            StepError::TemplateRender(_) => false,
            StepError::Expression(_) => false,
            StepError::Credential(_) => false,
            StepError::Timeout => true,
            StepError::Cancelled => false,
            StepError::Internal(_) => false,
        }
    }
}

/// A single validator finding.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("graph is malformed: {0}")]
    MalformedGraph(String),
    #[error("cycle detected through steps {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
    #[error("required input {step}.{port} is not bound")]
    UnboundRequiredInput { step: String, port: String },
    #[error("connection {connection}: {source_type} output cannot feed {target_type} input")]
    TypeMismatch {
        connection: String,
        source_type: String,
        target_type: String,
    },
    #[error("step {step}: invalid {field}: {reason}")]
    InvalidStepConfig {
        step: String,
        field: String,
        reason: String,
    },
    #[error("multiple connections terminate at {step}.{port}")]
    DuplicateInboundConnection { step: String, port: String },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MalformedGraph(_) => "MalformedGraph",
            ValidationError::CycleDetected { .. } => "CycleDetected",
            ValidationError::UnboundRequiredInput { .. } => "UnboundRequiredInput",
            ValidationError::TypeMismatch { .. } => "TypeMismatch",
            ValidationError::InvalidStepConfig { .. } => "InvalidStepConfig",
            ValidationError::DuplicateInboundConnection { .. } => "DuplicateInboundConnection",
        }
    }
}

/// Non-fatal validator findings.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationWarning {
    pub step: Option<String>,
    pub message: String,
}

/// Outcome of validating a pipeline.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn warn(&mut self, step: Option<&str>, message: impl Into<String>) {
        self.warnings.push(ValidationWarning {
            step: step.map(str::to_string),
            message: message.into(),
        });
    }
}

/// Failures surfaced by the engine's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("pipeline failed validation with {} error(s)", report.errors.len())]
    Validation { report: ValidationReport },
    #[error("run {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid subscription selector: {0}")]
    InvalidSelector(String),
}
