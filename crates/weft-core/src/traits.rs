//! Service seams consumed by the engine
//!
//! The engine never talks to a provider, a database, or a subprocess
//! directly; everything arrives through these injected contracts so a
//! test can swap in recorded responses and a manual clock.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{
    CredentialError, HttpError, ModelError, SandboxError, StoreError,
};
use crate::event::Event;
use crate::types::{LogEntry, Pipeline, ResponseFormat, Run, RunState, StepRun};

/// Provider-agnostic chat request. Provider-specific mapping is the
/// invoker's problem; the engine never embeds provider knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
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
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Completed (non-streaming) model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub cost: f64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Incremental chunk of a streamed response. The final chunk carries the
/// usage block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenChunk {
    pub delta: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<TokenChunk, ModelError>> + Send>>;

/// Model invocation seam. One per platform deployment; routes to the
/// configured provider adapters.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ModelError>;

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, ModelError>;
}

/// Plain HTTP request issued by the `api` runner.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub verify_ssl: bool,
}

/// Response handed back to the runner. Non-2xx statuses come back as
/// `Ok`; classification is the runner's job.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// Resource limits passed to the sandbox with every execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
    #[serde(default)]
    pub allowed_packages: Vec<String>,
}

/// Result of a sandboxed execution that ran to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOutcome {
    pub result: Value,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Out-of-process code execution seam. The engine never runs user code
/// in-process and never trusts it to cooperate.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        language: &str,
        code: &str,
        env: Value,
        limits: &SandboxLimits,
    ) -> Result<SandboxOutcome, SandboxError>;
}

/// Secret resolution seam. Pipeline definitions carry only references
/// (`{{creds.github_token}}`); raw secrets never enter the definition.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn get(&self, reference: &str) -> Result<String, CredentialError>;
}

/// Time source, injectable for deterministic tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation used in production.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Durable persistence for pipelines, runs, step runs, logs and events.
///
/// Every state transition is one transaction; readers only observe
/// committed states.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError>;

    async fn load_pipeline(&self, pipeline_id: &str) -> Result<Option<Pipeline>, StoreError>;

    /// Creates the run row together with its frozen snapshot.
    async fn create_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError>;

    async fn list_runs(&self, pipeline_id: &str) -> Result<Vec<Run>, StoreError>;

    /// Transitions the run's state, recording outputs/error/finish time.
    async fn update_run(
        &self,
        run_id: &str,
        state: RunState,
        outputs: &BTreeMap<String, Value>,
        error: Option<&str>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn create_step_run(&self, step_run: &StepRun) -> Result<(), StoreError>;

    /// Transitions a step run out of `running` in one transaction.
    async fn finish_step_run(&self, step_run: &StepRun) -> Result<(), StoreError>;

    /// Attempts newest-first per step, following the
    /// `(run_id, step_id, attempt desc)` index.
    async fn list_step_runs(&self, run_id: &str) -> Result<Vec<StepRun>, StoreError>;

    /// Append-only with monotonically increasing `seq` per step run.
    async fn append_log(&self, step_run_id: &str, entry: &LogEntry) -> Result<(), StoreError>;

    async fn list_logs(&self, step_run_id: &str) -> Result<Vec<LogEntry>, StoreError>;

    async fn append_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Extends the executor lease for a live run.
    async fn heartbeat(&self, run_id: &str, lease_until: DateTime<Utc>) -> Result<(), StoreError>;

    /// Runs still `running` whose lease expired before `now`.
    async fn expired_runs(&self, now: DateTime<Utc>) -> Result<Vec<Run>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_lookup_is_case_insensitive() {
        let response = HttpResponse {
            status: 200,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: b"{}".to_vec(),
        };
        assert_eq!(response.content_type(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_system_clock_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        clock.sleep(Duration::from_millis(5)).await;
        let b = clock.now();
        assert!(b > a);
    }
}
