//! Transform step runner
//!
//! Local data reshaping: extract, filter, format, aggregate, and
//! expression-mode custom transforms. All failures are final; a
//! transform that cannot produce a value will not produce one on retry.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use weft_core::error::StepError;
use weft_core::expr;
use weft_core::resolver::Resolver;
use weft_core::types::{
    ExtractMapping, ExtractMode, FilterCondition, FilterOp, StepConfig, StepKind, TransformConfig,
};
use weft_core::vars::{parse_path, lookup, VariableStore};

use super::{required, StepContext, StepInputs, StepOutputs, StepRunner};

pub struct TransformRunner;

#[async_trait]
impl StepRunner for TransformRunner {
    fn kind(&self) -> StepKind {
        StepKind::Transform
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        inputs: StepInputs,
    ) -> Result<StepOutputs, StepError> {
        let config = match &ctx.step.config {
            StepConfig::Transform(config) => config,
            _ => {
                return Err(StepError::Internal(
                    "transform runner got non-transform step".into(),
                ))
            }
        };
        let data = required(&inputs, "data")?;

        let result = match config {
            TransformConfig::Extract { mappings } => extract(data, mappings)?,
            TransformConfig::Filter { conditions } => filter(data, conditions)?,
            TransformConfig::Format { template } => format_template(ctx, data, template).await?,
            TransformConfig::Aggregate {} => aggregate(data),
            TransformConfig::Custom { expression } => custom(ctx, data, expression)?,
        };

        let mut outputs = StepOutputs::new();
        outputs.insert("result".to_string(), result);
        Ok(outputs)
    }
}

fn extract(data: &Value, mappings: &[ExtractMapping]) -> Result<Value, StepError> {
    match data {
        Value::Array(items) => {
            let mapped: Result<Vec<Value>, StepError> =
                items.iter().map(|item| extract_one(item, mappings)).collect();
            Ok(Value::Array(mapped?))
        }
        other => extract_one(other, mappings),
    }
}

fn extract_one(item: &Value, mappings: &[ExtractMapping]) -> Result<Value, StepError> {
    let mut out = VariableStore::new();
    for mapping in mappings {
        let value = match mapping.mode {
            ExtractMode::Direct => {
                let segs = parse_path(&mapping.source).ok_or_else(|| {
                    StepError::Transform(format!("bad source path '{}'", mapping.source))
                })?;
                lookup(item, &segs).cloned().unwrap_or(Value::Null)
            }
            // Function and expression modes share the expression engine;
            // `item` and `value` both name the element under scrutiny.
            ExtractMode::Function | ExtractMode::Expression => {
                let parsed = expr::parse(&mapping.source)
                    .map_err(|e| StepError::Transform(e.to_string()))?;
                let scope = json!({"item": item, "value": item});
                expr::eval_with(&parsed, &scope)
                    .map_err(|e| StepError::Transform(e.to_string()))?
            }
        };
        if !out.set(&mapping.target, value) {
            return Err(StepError::Transform(format!(
                "bad target path '{}'",
                mapping.target
            )));
        }
    }
    Ok(out.as_value())
}

fn filter(data: &Value, conditions: &[FilterCondition]) -> Result<Value, StepError> {
    let items = data
        .as_array()
        .ok_or_else(|| StepError::Transform("filter requires an array".into()))?;
    let mut kept = Vec::new();
    for item in items {
        let mut matches = true;
        for condition in conditions {
            if !matches_condition(item, condition)? {
                matches = false;
                break;
            }
        }
        if matches {
            kept.push(item.clone());
        }
    }
    Ok(Value::Array(kept))
}

fn matches_condition(item: &Value, condition: &FilterCondition) -> Result<bool, StepError> {
    let segs = parse_path(&condition.field)
        .ok_or_else(|| StepError::Transform(format!("bad field path '{}'", condition.field)))?;
    let actual = lookup(item, &segs).cloned().unwrap_or(Value::Null);
    let expected = &condition.value;

    let ordering = |a: &Value, b: &Value| -> Option<std::cmp::Ordering> {
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => Some(x.cmp(y)),
                _ => None,
            },
        }
    };

    let result = match condition.op {
        FilterOp::Eq => actual == *expected,
        FilterOp::Ne => actual != *expected,
        FilterOp::Gt => ordering(&actual, expected) == Some(std::cmp::Ordering::Greater),
        FilterOp::Lt => ordering(&actual, expected) == Some(std::cmp::Ordering::Less),
        FilterOp::Gte => matches!(
            ordering(&actual, expected),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ),
        FilterOp::Lte => matches!(
            ordering(&actual, expected),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ),
        FilterOp::Contains => match (&actual, expected) {
            (Value::String(hay), Value::String(needle)) => hay.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
        FilterOp::Startswith => match (&actual, expected) {
            (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        FilterOp::Endswith => match (&actual, expected) {
            (Value::String(s), Value::String(suffix)) => s.ends_with(suffix.as_str()),
            _ => false,
        },
        FilterOp::Regex => {
            let pattern = expected
                .as_str()
                .ok_or_else(|| StepError::Transform("regex value must be a string".into()))?;
            let re = regex::Regex::new(pattern)
                .map_err(|e| StepError::Transform(format!("invalid regex: {e}")))?;
            actual.as_str().map(|s| re.is_match(s)).unwrap_or(false)
        }
    };
    Ok(result)
}

async fn format_template(
    ctx: &StepContext<'_>,
    data: &Value,
    template: &str,
) -> Result<Value, StepError> {
    let mut store = VariableStore::from_snapshot(ctx.vars.clone());
    store.set("data", data.clone());
    let mut resolver = Resolver::new(&store).with_credentials(ctx.services.credentials.as_ref());
    let rendered = resolver.resolve_str(template).await?;
    for warning in resolver.warnings {
        ctx.emitter.log(weft_core::types::LogLevel::Warn, warning);
    }
    Ok(Value::String(rendered))
}

fn aggregate(data: &Value) -> Value {
    match data {
        Value::Array(items) => json!({"count": items.len(), "items": items}),
        other => json!({"count": 1, "items": [other]}),
    }
}

fn custom(ctx: &StepContext<'_>, data: &Value, expression: &str) -> Result<Value, StepError> {
    let parsed = expr::parse(expression).map_err(|e| StepError::Transform(e.to_string()))?;
    let mut scope = match &ctx.vars {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    scope.insert("data".to_string(), data.clone());
    expr::eval_with(&parsed, &Value::Object(scope))
        .map_err(|e| StepError::Transform(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_direct_over_array() {
        let data = json!([
            {"user": {"name": "ada", "age": 36}},
            {"user": {"name": "alan", "age": 41}}
        ]);
        let mappings = vec![ExtractMapping {
            source: "user.name".into(),
            target: "name".into(),
            mode: ExtractMode::Direct,
        }];
        let out = extract(&data, &mappings).unwrap();
        assert_eq!(out, json!([{"name": "ada"}, {"name": "alan"}]));
    }

    #[test]
    fn test_extract_expression_mode() {
        let data = json!({"name": "ada"});
        let mappings = vec![ExtractMapping {
            source: "upper(item.name)".into(),
            target: "shout".into(),
            mode: ExtractMode::Expression,
        }];
        let out = extract(&data, &mappings).unwrap();
        assert_eq!(out, json!({"shout": "ADA"}));
    }

    #[test]
    fn test_filter_conditions() {
        let data = json!([
            {"score": 10, "tag": "keep-me"},
            {"score": 3, "tag": "keep-me"},
            {"score": 20, "tag": "drop"}
        ]);
        let conditions = vec![
            FilterCondition { field: "score".into(), op: FilterOp::Gte, value: json!(10) },
            FilterCondition {
                field: "tag".into(),
                op: FilterOp::Startswith,
                value: json!("keep"),
            },
        ];
        let out = filter(&data, &conditions).unwrap();
        assert_eq!(out, json!([{"score": 10, "tag": "keep-me"}]));

        assert!(filter(&json!({"not": "array"}), &conditions).is_err());
    }

    #[test]
    fn test_filter_regex() {
        let data = json!([{"id": "run-12"}, {"id": "job-9"}]);
        let conditions = vec![FilterCondition {
            field: "id".into(),
            op: FilterOp::Regex,
            value: json!("^run-\\d+$"),
        }];
        let out = filter(&data, &conditions).unwrap();
        assert_eq!(out, json!([{"id": "run-12"}]));
    }

    #[test]
    fn test_aggregate() {
        assert_eq!(
            aggregate(&json!([1, 2, 3])),
            json!({"count": 3, "items": [1, 2, 3]})
        );
        assert_eq!(aggregate(&json!("solo")), json!({"count": 1, "items": ["solo"]}));
    }
}
