//! Shared fixtures for engine integration tests: scripted services,
//! pipeline builders, and run helpers.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use weft_core::error::{
    CredentialError, HttpError, ModelError, SandboxError,
};
use weft_core::traits::*;
use weft_core::types::*;
use weft_engine::runners::Services;
use weft_engine::Engine;
use weft_storage::MemoryRunStore;

// ---------------------------------------------------------------------------
// Scripted services
// ---------------------------------------------------------------------------

/// Model invoker that replays a fixed script of responses.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ChatResponse, ModelError>>>,
    stream_chunks: Vec<TokenChunk>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<ChatResponse, ModelError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            stream_chunks: Vec::new(),
        }
    }

    pub fn streaming(chunks: Vec<TokenChunk>) -> Self {
        Self { script: Mutex::new(VecDeque::new()), stream_chunks: chunks }
    }

    pub fn reply(text: &str) -> ChatResponse {
        ChatResponse {
            content: text.to_string(),
            usage: TokenUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 },
            cost: 0.0003,
            model: "scripted".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }
}

#[async_trait]
impl ModelInvoker for ScriptedModel {
    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ModelError> {
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Self::reply("default")))
    }

    async fn chat_stream(&self, _request: ChatRequest) -> Result<ChatStream, ModelError> {
        let chunks = self.stream_chunks.clone();
        Ok(Box::pin(futures::stream::iter(
            chunks.into_iter().map(Ok::<_, ModelError>),
        )))
    }
}

/// Model invoker that reports each started call and then parks until the
/// run is cancelled out from under it.
pub struct HangingModel {
    started: mpsc::UnboundedSender<String>,
}

impl HangingModel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { started: tx }, rx)
    }
}

#[async_trait]
impl ModelInvoker for HangingModel {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ModelError> {
        let _ = self.started.send(request.model_id.clone());
        tokio::time::sleep(Duration::from_secs(300)).await;
        Ok(ScriptedModel::reply("unreachable"))
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, ModelError> {
        let _ = self.started.send(request.model_id);
        tokio::time::sleep(Duration::from_secs(300)).await;
        Err(ModelError::new(
            weft_core::error::ModelErrorKind::Transient,
            "unreachable",
        ))
    }
}

/// HTTP client replaying a script of responses.
pub struct ScriptedHttp {
    script: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
}

impl ScriptedHttp {
    pub fn new(script: Vec<Result<HttpResponse, HttpError>>) -> Self {
        Self { script: Mutex::new(script.into_iter().collect()) }
    }

    pub fn json_response(status: u16, body: Value) -> HttpResponse {
        HttpResponse {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.to_string().into_bytes(),
        }
    }
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Self::json_response(200, json!({"ok": true}))))
    }
}

/// Sandbox stub: code containing "sleep" trips the sandbox's own
/// timeout; anything else echoes the env back as the result.
pub struct StubSandbox;

#[async_trait]
impl Sandbox for StubSandbox {
    async fn execute(
        &self,
        _language: &str,
        code: &str,
        env: Value,
        _limits: &SandboxLimits,
    ) -> Result<SandboxOutcome, SandboxError> {
        if code.contains("sleep") {
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Err(SandboxError::Timeout);
        }
        Ok(SandboxOutcome {
            result: env,
            logs: vec!["ran".to_string()],
            errors: vec![],
        })
    }
}

/// Credential resolver over a fixed map.
pub struct StaticCredentials {
    entries: BTreeMap<String, String>,
}

impl StaticCredentials {
    pub fn empty() -> Self {
        Self { entries: BTreeMap::new() }
    }

    pub fn with(entries: &[(&str, &str)]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn get(&self, reference: &str) -> Result<String, CredentialError> {
        self.entries.get(reference).cloned().ok_or_else(|| CredentialError {
            reference: reference.to_string(),
            message: "unknown reference".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn services(
    model: Arc<dyn ModelInvoker>,
    http: Arc<dyn HttpClient>,
    sandbox: Arc<dyn Sandbox>,
) -> Services {
    Services {
        model,
        http,
        sandbox,
        credentials: Arc::new(StaticCredentials::empty()),
        clock: Arc::new(SystemClock),
    }
}

pub fn default_services() -> Services {
    services(
        Arc::new(ScriptedModel::new(vec![])),
        Arc::new(ScriptedHttp::new(vec![])),
        Arc::new(StubSandbox),
    )
}

pub fn engine_with(services: Services) -> (Arc<Engine>, Arc<MemoryRunStore>) {
    let store = Arc::new(MemoryRunStore::new());
    let mut config = weft_core::EngineConfig::default();
    config.cancel_grace = Duration::from_millis(500);
    let engine = Arc::new(Engine::new(store.clone(), services, config));
    (engine, store)
}

pub fn step(id: &str, config: StepConfig) -> Step {
    Step {
        id: id.to_string(),
        name: id.to_string(),
        config,
        enabled: true,
        timeout_ms: 5_000,
        max_attempts: 1,
        retry_backoff: RetryBackoff { base_ms: 10, factor: 2.0, cap_ms: 100 },
        estimate: None,
        position: Position::default(),
    }
}

pub fn input_step(id: &str) -> Step {
    step(
        id,
        StepConfig::Input(InputConfig {
            variable: None,
            default: None,
            extra: Default::default(),
        }),
    )
}

pub fn output_step(id: &str) -> Step {
    step(id, StepConfig::Output(OutputConfig::default()))
}

pub fn llm_step(id: &str, prompt: &str) -> Step {
    step(
        id,
        StepConfig::Llm(LlmConfig {
            model_id: id.to_string(),
            prompt: prompt.to_string(),
            system_prompt: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: vec![],
            response_format: None,
            stream: false,
            variables: None,
            extra: Default::default(),
        }),
    )
}

pub fn api_step(id: &str, url: &str) -> Step {
    step(
        id,
        StepConfig::Api(ApiConfig {
            url: url.to_string(),
            method: "GET".to_string(),
            headers: None,
            body: None,
            auth: None,
            follow_redirects: false,
            verify_ssl: true,
            extra: Default::default(),
        }),
    )
}

pub fn code_step(id: &str, code: &str) -> Step {
    step(
        id,
        StepConfig::Code(CodeConfig {
            language: "python".to_string(),
            code: code.to_string(),
            memory_mb: None,
            allowed_packages: vec![],
            variables: None,
            input_data: None,
            extra: Default::default(),
        }),
    )
}

pub fn condition_step(id: &str, condition: &str) -> Step {
    step(
        id,
        StepConfig::Condition(ConditionConfig {
            condition: condition.to_string(),
            extra: Default::default(),
        }),
    )
}

pub fn extract_step(id: &str, source: &str, target: &str) -> Step {
    step(
        id,
        StepConfig::Transform(TransformConfig::Extract {
            mappings: vec![ExtractMapping {
                source: source.to_string(),
                target: target.to_string(),
                mode: ExtractMode::Direct,
            }],
        }),
    )
}

pub fn aggregate_step(id: &str) -> Step {
    step(id, StepConfig::Transform(TransformConfig::Aggregate {}))
}

pub fn merge_step(id: &str) -> Step {
    step(
        id,
        StepConfig::Merge(MergeConfig {
            strategy: MergeStrategy::ObjectMerge,
            extra: Default::default(),
        }),
    )
}

pub fn conn(id: &str, from: (&str, &str), to: (&str, &str)) -> Connection {
    Connection {
        id: id.to_string(),
        source: PortRef::new(from.0, from.1),
        target: PortRef::new(to.0, to.1),
        label: None,
    }
}

pub fn pipeline(id: &str, steps: Vec<Step>, connections: Vec<Connection>) -> Pipeline {
    Pipeline {
        id: id.to_string(),
        name: id.to_string(),
        version: "1".to_string(),
        variables: BTreeMap::new(),
        steps,
        connections,
    }
}

pub fn vars(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Run helpers
// ---------------------------------------------------------------------------

/// Submit, wait for the executor task, and return the terminal summary.
pub async fn run_to_end(
    engine: &Engine,
    pipeline: Pipeline,
    initial: BTreeMap<String, Value>,
    options: RunOptions,
) -> (String, RunSummary) {
    let run_id = engine
        .submit(pipeline, initial, options, "tests")
        .await
        .expect("submit accepted");
    engine.join(&run_id).await;
    let summary = engine.get_run(&run_id).await.expect("run exists");
    (run_id, summary)
}

/// Kinds of events recorded for a run, in persistence order.
pub async fn event_kinds(store: &MemoryRunStore, run_id: &str) -> Vec<String> {
    store
        .events()
        .await
        .into_iter()
        .filter(|e| e.run_id == run_id)
        .map(|e| match e.step_id() {
            Some(step) => format!("{}:{}", e.payload.kind(), step),
            None => e.payload.kind().to_string(),
        })
        .collect()
}
