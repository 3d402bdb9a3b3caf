//! Condition step runner
//!
//! Evaluates the configured expression against the variable store with
//! the `data` input bound into scope. Exactly one of the branch ports is
//! populated; the executor turns the absent one into a skip marker for
//! whatever hangs off it.

use async_trait::async_trait;
use serde_json::{Map, Value};

use weft_core::error::StepError;
use weft_core::expr;
use weft_core::types::StepKind;

use super::{required_str, StepContext, StepInputs, StepOutputs, StepRunner};

pub struct ConditionRunner;

#[async_trait]
impl StepRunner for ConditionRunner {
    fn kind(&self) -> StepKind {
        StepKind::Condition
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        inputs: StepInputs,
    ) -> Result<StepOutputs, StepError> {
        let condition = required_str(&inputs, "condition")?;
        let data = inputs.get("data").cloned().unwrap_or(Value::Null);

        let parsed = expr::parse(condition)?;
        let mut scope = match &ctx.vars {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        scope.insert("data".to_string(), data.clone());
        let result = expr::truthy(&expr::eval_with(&parsed, &Value::Object(scope))?);

        let mut outputs = StepOutputs::new();
        outputs.insert("result".to_string(), Value::Bool(result));
        outputs.insert("value".to_string(), data.clone());
        if result {
            outputs.insert("true_path".to_string(), data);
        } else {
            outputs.insert("false_path".to_string(), data);
        }
        Ok(outputs)
    }
}
