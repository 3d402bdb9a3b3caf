//! Merge step runner

use async_trait::async_trait;
use serde_json::Value;

use weft_core::error::StepError;
use weft_core::types::{MergeStrategy, StepConfig, StepKind};

use super::{required, StepContext, StepInputs, StepOutputs, StepRunner};

pub struct MergeRunner;

#[async_trait]
impl StepRunner for MergeRunner {
    fn kind(&self) -> StepKind {
        StepKind::Merge
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        inputs: StepInputs,
    ) -> Result<StepOutputs, StepError> {
        let strategy = match &ctx.step.config {
            StepConfig::Merge(config) => config.strategy,
            _ => return Err(StepError::Internal("merge runner got non-merge step".into())),
        };
        // The strategy port overrides config when wired.
        let strategy = match inputs.get("strategy").and_then(Value::as_str) {
            Some(name) => name
                .parse::<MergeStrategy>()
                .map_err(|_| StepError::Internal(format!("unknown merge strategy '{name}'")))?,
            None => strategy,
        };

        let data1 = required(&inputs, "data1")?;
        let data2 = required(&inputs, "data2")?;
        let result = merge(strategy, data1, data2)?;

        let mut outputs = StepOutputs::new();
        outputs.insert("result".to_string(), result);
        Ok(outputs)
    }
}

fn merge(strategy: MergeStrategy, data1: &Value, data2: &Value) -> Result<Value, StepError> {
    match strategy {
        MergeStrategy::ObjectMerge => Ok(deep_merge(data1, data2)),
        MergeStrategy::Concat => concat(data1, data2),
        MergeStrategy::FirstNonNull => Ok(if data1.is_null() {
            data2.clone()
        } else {
            data1.clone()
        }),
        MergeStrategy::Zip => zip(data1, data2),
    }
}

/// Deep merge favouring the second operand on conflicts.
fn deep_merge(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            let mut out = left.clone();
            for (key, value) in right {
                let merged = match out.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (_, other) => other.clone(),
    }
}

fn concat(a: &Value, b: &Value) -> Result<Value, StepError> {
    match (a, b) {
        (Value::Array(left), Value::Array(right)) => {
            let mut out = left.clone();
            out.extend(right.iter().cloned());
            Ok(Value::Array(out))
        }
        (Value::String(left), Value::String(right)) => {
            Ok(Value::String(format!("{left}{right}")))
        }
        _ => Err(StepError::Internal(
            "concat requires two arrays or two strings".into(),
        )),
    }
}

fn zip(a: &Value, b: &Value) -> Result<Value, StepError> {
    match (a, b) {
        (Value::Array(left), Value::Array(right)) => Ok(Value::Array(
            left.iter()
                .zip(right.iter())
                .map(|(x, y)| Value::Array(vec![x.clone(), y.clone()]))
                .collect(),
        )),
        _ => Err(StepError::Internal("zip requires two arrays".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_merge_favours_second() {
        let a = json!({"x": 1, "nested": {"keep": true, "replace": 1}});
        let b = json!({"nested": {"replace": 2}, "y": 3});
        let merged = deep_merge(&a, &b);
        assert_eq!(
            merged,
            json!({"x": 1, "nested": {"keep": true, "replace": 2}, "y": 3})
        );
    }

    #[test]
    fn test_concat_and_zip() {
        assert_eq!(
            merge(MergeStrategy::Concat, &json!([1]), &json!([2, 3])).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(
            merge(MergeStrategy::Concat, &json!("ab"), &json!("cd")).unwrap(),
            json!("abcd")
        );
        assert!(merge(MergeStrategy::Concat, &json!(1), &json!([2])).is_err());
        assert_eq!(
            merge(MergeStrategy::Zip, &json!([1, 2]), &json!(["a", "b", "c"])).unwrap(),
            json!([[1, "a"], [2, "b"]])
        );
    }

    #[test]
    fn test_first_non_null() {
        assert_eq!(
            merge(MergeStrategy::FirstNonNull, &Value::Null, &json!(7)).unwrap(),
            json!(7)
        );
        assert_eq!(
            merge(MergeStrategy::FirstNonNull, &json!(1), &json!(7)).unwrap(),
            json!(1)
        );
    }
}
