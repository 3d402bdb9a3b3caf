//! Code step runner
//!
//! Ships the code plus a JSON environment to the sandbox service. User
//! code never executes in-process; limits travel with every call and
//! the sandbox is expected to kill anything that exceeds them.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use weft_core::error::StepError;
use weft_core::traits::SandboxLimits;
use weft_core::types::{StepConfig, StepKind};

use super::{required_str, StepContext, StepInputs, StepOutputs, StepRunner};

const DEFAULT_MEMORY_MB: u64 = 512;

pub struct CodeRunner;

#[async_trait]
impl StepRunner for CodeRunner {
    fn kind(&self) -> StepKind {
        StepKind::Code
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        inputs: StepInputs,
    ) -> Result<StepOutputs, StepError> {
        let config = match &ctx.step.config {
            StepConfig::Code(config) => config,
            _ => return Err(StepError::Internal("code runner got non-code step".into())),
        };

        let code = required_str(&inputs, "code")?;
        let env = json!({
            "variables": inputs.get("variables").cloned().unwrap_or(Value::Null),
            "input_data": inputs.get("input_data").cloned().unwrap_or(Value::Null),
        });
        let limits = SandboxLimits {
            timeout: Duration::from_millis(ctx.step.timeout_ms),
            memory_mb: config.memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
            allowed_packages: config.allowed_packages.clone(),
        };

        let outcome = ctx
            .services
            .sandbox
            .execute(&config.language, code, env, &limits)
            .await?;

        let mut outputs = StepOutputs::new();
        outputs.insert("result".to_string(), outcome.result);
        outputs.insert(
            "logs".to_string(),
            Value::Array(outcome.logs.into_iter().map(Value::String).collect()),
        );
        outputs.insert(
            "errors".to_string(),
            Value::Array(outcome.errors.into_iter().map(Value::String).collect()),
        );
        Ok(outputs)
    }
}
