//! Input and output step runners
//!
//! `input` surfaces an initial variable as a port so downstream steps
//! can wire to it (and templates can say `{{inputs.name}}`). `output` is
//! a sink; the executor copies its resolved `data` into the run's
//! outputs keyed by step name.

use async_trait::async_trait;
use serde_json::Value;

use weft_core::error::StepError;
use weft_core::types::{LogLevel, StepConfig, StepKind};
use weft_core::vars::{lookup, parse_path};

use super::{StepContext, StepInputs, StepOutputs, StepRunner};

pub struct InputRunner;

#[async_trait]
impl StepRunner for InputRunner {
    fn kind(&self) -> StepKind {
        StepKind::Input
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        _inputs: StepInputs,
    ) -> Result<StepOutputs, StepError> {
        let config = match &ctx.step.config {
            StepConfig::Input(config) => config,
            _ => return Err(StepError::Internal("input runner got non-input step".into())),
        };
        let variable = config.variable.as_deref().unwrap_or(&ctx.step.name);

        let path = format!("inputs.{variable}");
        let value = parse_path(&path)
            .and_then(|segs| lookup(&ctx.vars, &segs).cloned())
            .or_else(|| config.default.clone());
        let value = match value {
            Some(value) => value,
            None => {
                ctx.emitter.log(
                    LogLevel::Warn,
                    format!("initial variable '{variable}' not provided"),
                );
                Value::Null
            }
        };

        let mut outputs = StepOutputs::new();
        outputs.insert("value".to_string(), value);
        Ok(outputs)
    }
}

pub struct OutputRunner;

#[async_trait]
impl StepRunner for OutputRunner {
    fn kind(&self) -> StepKind {
        StepKind::Output
    }

    async fn run(
        &self,
        _ctx: &StepContext<'_>,
        _inputs: StepInputs,
    ) -> Result<StepOutputs, StepError> {
        // The executor copies the resolved `data` input into run.outputs;
        // the step itself declares no output ports.
        Ok(StepOutputs::new())
    }
}
