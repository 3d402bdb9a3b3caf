//! LLM step runner
//!
//! Builds a provider-agnostic chat request from config and inputs and
//! hands it to the injected invoker. Streaming responses are re-emitted
//! as stream-chunk events while the final text is assembled. Provider
//! mapping lives entirely behind the `ModelInvoker` seam.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use weft_core::error::StepError;
use weft_core::traits::{ChatMessage, ChatRequest, ChatRole, TokenUsage};
use weft_core::types::{LogLevel, ResponseFormat, StepConfig, StepKind};

use super::{required_str, StepContext, StepInputs, StepOutputs, StepRunner};

pub struct LlmRunner;

#[async_trait]
impl StepRunner for LlmRunner {
    fn kind(&self) -> StepKind {
        StepKind::Llm
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        inputs: StepInputs,
    ) -> Result<StepOutputs, StepError> {
        let config = match &ctx.step.config {
            StepConfig::Llm(config) => config,
            _ => return Err(StepError::Internal("llm runner got non-llm step".into())),
        };

        let prompt = required_str(&inputs, "prompt")?;
        let mut user_content = String::new();
        if let Some(context) = inputs.get("context").and_then(Value::as_str) {
            if !context.is_empty() {
                user_content.push_str(context);
                user_content.push_str("\n\n");
            }
        }
        user_content.push_str(prompt);
        if let Some(variables) = inputs.get("variables") {
            if !variables.is_null() {
                user_content.push_str("\n\nVariables:\n");
                user_content.push_str(&serde_json::to_string_pretty(variables).unwrap_or_default());
            }
        }

        let mut messages = Vec::new();
        let system = inputs
            .get("system_prompt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| config.system_prompt.clone());
        if let Some(system) = system {
            messages.push(ChatMessage { role: ChatRole::System, content: system });
        }
        messages.push(ChatMessage { role: ChatRole::User, content: user_content });

        let request = ChatRequest {
            model_id: config.model_id.clone(),
            messages,
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            stop: config.stop.clone(),
            response_format: config.response_format,
        };

        let (text, usage, cost) = if config.stream {
            self.consume_stream(ctx, request).await?
        } else {
            let response = ctx.services.model.chat(request).await?;
            (response.content, response.usage, response.cost)
        };

        let mut outputs = StepOutputs::new();
        if config.response_format == Some(ResponseFormat::Json) {
            match serde_json::from_str::<Value>(&text) {
                Ok(parsed) => {
                    outputs.insert("json".to_string(), parsed);
                }
                Err(err) => {
                    ctx.emitter.log(
                        LogLevel::Warn,
                        format!("model reply was not valid JSON: {err}"),
                    );
                }
            }
        }
        outputs.insert("text".to_string(), Value::String(text));
        outputs.insert("tokens".to_string(), json!(usage.total_tokens));
        outputs.insert("cost".to_string(), json!(cost));
        Ok(outputs)
    }
}

impl LlmRunner {
    async fn consume_stream(
        &self,
        ctx: &StepContext<'_>,
        request: ChatRequest,
    ) -> Result<(String, TokenUsage, f64), StepError> {
        let mut stream = ctx.services.model.chat_stream(request).await?;
        let mut text = String::new();
        let mut usage = TokenUsage::default();
        let mut cost = 0.0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !chunk.delta.is_empty() {
                ctx.emitter.chunk(chunk.delta.clone());
                text.push_str(&chunk.delta);
            }
            if let Some(chunk_usage) = chunk.usage {
                usage = chunk_usage;
            }
            if let Some(chunk_cost) = chunk.cost {
                cost = chunk_cost;
            }
            if chunk.done {
                break;
            }
        }
        Ok((text, usage, cost))
    }
}
