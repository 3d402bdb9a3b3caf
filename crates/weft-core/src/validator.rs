//! Static pipeline validation
//!
//! Runs once before a run is created. Errors block submission; warnings
//! ride along in the report for the caller to surface.

use std::collections::HashMap;

use log::debug;
use url::Url;

use crate::error::{ValidationError, ValidationReport};
use crate::expr;
use crate::graph::PipelineGraph;
use crate::types::{
    ApiConfig, CodeConfig, ExtractMode, FilterOp, Pipeline, PortRef, Step, StepConfig, StepKind,
    TransformConfig,
};

const ALLOWED_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS",
];

const SUPPORTED_LANGUAGES: &[&str] = &["python", "javascript", "bash"];

/// Patterns in user code worth flagging, without blocking: the sandbox
/// is the actual enforcement boundary.
const SUSPICIOUS_CODE_PATTERNS: &[&str] = &[
    r"\beval\s*\(",
    r"\bexec\s*\(",
    r"\bsubprocess\b",
    r"\bos\.system\b",
    r"\bopen\s*\(",
    r"\brequire\s*\(\s*['\x22]child_process",
    r"rm\s+-rf",
];

/// Validate a pipeline definition against the full static check set.
pub fn validate(pipeline: &Pipeline) -> ValidationReport {
    let mut report = ValidationReport::default();

    let graph = match PipelineGraph::build(pipeline) {
        Ok(graph) => graph,
        Err(err) => {
            report.errors.push(err);
            return report;
        }
    };

    check_acyclic(&graph, &mut report);
    check_duplicate_inbound(&graph, &mut report);
    check_required_inputs(&graph, &mut report);
    check_port_types(&graph, &mut report);
    for step in graph.steps_by_id().values() {
        check_step_config(step, &mut report);
    }
    check_output_names(pipeline, &mut report);
    collect_warnings(pipeline, &graph, &mut report);

    debug!(
        "validated pipeline '{}': {} error(s), {} warning(s)",
        pipeline.id,
        report.errors.len(),
        report.warnings.len()
    );
    report
}

fn check_acyclic(graph: &PipelineGraph, report: &mut ValidationReport) {
    if let Err(residue) = graph.kahn_order() {
        report.errors.push(ValidationError::CycleDetected { path: residue });
    }
}

fn check_duplicate_inbound(graph: &PipelineGraph, report: &mut ValidationReport) {
    let mut seen: HashMap<&PortRef, usize> = HashMap::new();
    for conn in graph.connections() {
        *seen.entry(&conn.target).or_insert(0) += 1;
    }
    for (target, count) in seen {
        if count > 1 {
            report.errors.push(ValidationError::DuplicateInboundConnection {
                step: target.step_id.clone(),
                port: target.port.clone(),
            });
        }
    }
}

fn check_required_inputs(graph: &PipelineGraph, report: &mut ValidationReport) {
    for step in graph.steps_by_id().values() {
        for port in step.kind().input_ports() {
            if !port.required {
                continue;
            }
            let target = PortRef::new(step.id.clone(), port.name);
            let bound = graph.source_of(&target).is_some()
                || step.config.literal_for_port(port.name).is_some();
            if !bound {
                report.errors.push(ValidationError::UnboundRequiredInput {
                    step: step.id.clone(),
                    port: port.name.to_string(),
                });
            }
        }
    }
}

fn check_port_types(graph: &PipelineGraph, report: &mut ValidationReport) {
    for conn in graph.connections() {
        let source_kind = graph
            .step(&conn.source.step_id)
            .expect("graph construction checked step ids")
            .kind();
        let target_kind = graph
            .step(&conn.target.step_id)
            .expect("graph construction checked step ids")
            .kind();
        let source_port = source_kind
            .output_port(&conn.source.port)
            .expect("graph construction checked ports");
        let target_port = target_kind
            .input_port(&conn.target.port)
            .expect("graph construction checked ports");
        if !source_port.ty.assignable_to(target_port.ty) {
            report.errors.push(ValidationError::TypeMismatch {
                connection: conn.id.clone(),
                source_type: source_port.ty.to_string(),
                target_type: target_port.ty.to_string(),
            });
        }
    }
}

fn check_step_config(step: &Step, report: &mut ValidationReport) {
    let invalid = |field: &str, reason: String| ValidationError::InvalidStepConfig {
        step: step.id.clone(),
        field: field.to_string(),
        reason,
    };

    if step.max_attempts == 0 {
        report
            .errors
            .push(invalid("max_attempts", "must be at least 1".to_string()));
    }

    match &step.config {
        StepConfig::Llm(config) => {
            if config.model_id.trim().is_empty() {
                report.errors.push(invalid("model_id", "must not be empty".into()));
            }
            if config.prompt.trim().is_empty() {
                report.errors.push(invalid("prompt", "must not be empty".into()));
            }
        }
        StepConfig::Api(config) => check_api_config(step, config, report),
        StepConfig::Code(config) => check_code_config(step, config, report),
        StepConfig::Condition(config) => {
            // Templated conditions only become parseable after resolution.
            if !config.condition.contains("{{") {
                if let Err(err) = expr::parse(&config.condition) {
                    report.errors.push(invalid("condition", err.to_string()));
                }
            }
        }
        StepConfig::Transform(config) => check_transform_config(step, config, report),
        StepConfig::Merge(_) | StepConfig::Input(_) | StepConfig::Output(_) => {}
    }
}

fn check_api_config(step: &Step, config: &ApiConfig, report: &mut ValidationReport) {
    let invalid = |field: &str, reason: String| ValidationError::InvalidStepConfig {
        step: step.id.clone(),
        field: field.to_string(),
        reason,
    };
    let method = config.method.to_uppercase();
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        report
            .errors
            .push(invalid("method", format!("unsupported method '{}'", config.method)));
    }
    if config.url.trim().is_empty() {
        report.errors.push(invalid("url", "must not be empty".into()));
    } else if !config.url.contains("{{") {
        // Templated urls can only be checked after resolution.
        if let Err(err) = Url::parse(&config.url) {
            report.errors.push(invalid("url", err.to_string()));
        }
    }
}

fn check_code_config(step: &Step, config: &CodeConfig, report: &mut ValidationReport) {
    let invalid = |field: &str, reason: String| ValidationError::InvalidStepConfig {
        step: step.id.clone(),
        field: field.to_string(),
        reason,
    };
    if config.code.trim().is_empty() {
        report.errors.push(invalid("code", "must not be empty".into()));
    }
    if !SUPPORTED_LANGUAGES.contains(&config.language.as_str()) {
        report.errors.push(invalid(
            "language",
            format!(
                "unsupported language '{}' (supported: {})",
                config.language,
                SUPPORTED_LANGUAGES.join(", ")
            ),
        ));
    }
}

fn check_transform_config(step: &Step, config: &TransformConfig, report: &mut ValidationReport) {
    let invalid = |field: &str, reason: String| ValidationError::InvalidStepConfig {
        step: step.id.clone(),
        field: field.to_string(),
        reason,
    };
    match config {
        TransformConfig::Extract { mappings } => {
            if mappings.is_empty() {
                report.errors.push(invalid("mappings", "must not be empty".into()));
            }
            for mapping in mappings {
                if mapping.mode == ExtractMode::Expression {
                    if let Err(err) = expr::parse(&mapping.source) {
                        report.errors.push(invalid("mappings", err.to_string()));
                    }
                }
            }
        }
        TransformConfig::Filter { conditions } => {
            for condition in conditions {
                if condition.op == FilterOp::Regex {
                    let pattern = condition.value.as_str().unwrap_or_default();
                    if let Err(err) = regex::Regex::new(pattern) {
                        report.errors.push(invalid("conditions", err.to_string()));
                    }
                }
            }
        }
        TransformConfig::Format { template } => {
            if template.trim().is_empty() {
                report.errors.push(invalid("template", "must not be empty".into()));
            }
        }
        TransformConfig::Aggregate {} => {}
        TransformConfig::Custom { expression } => {
            if let Err(err) = expr::parse(expression) {
                report.errors.push(invalid("expression", err.to_string()));
            }
        }
    }
}

fn check_output_names(pipeline: &Pipeline, report: &mut ValidationReport) {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for step in &pipeline.steps {
        if step.kind() != StepKind::Output {
            continue;
        }
        if let Some(previous) = seen.insert(step.name.as_str(), step.id.as_str()) {
            report.errors.push(ValidationError::InvalidStepConfig {
                step: step.id.clone(),
                field: "name".to_string(),
                reason: format!(
                    "output name '{}' already used by step '{}'",
                    step.name, previous
                ),
            });
        }
    }
}

fn collect_warnings(pipeline: &Pipeline, graph: &PipelineGraph, report: &mut ValidationReport) {
    for step in &pipeline.steps {
        if !step.enabled {
            report.warn(Some(&step.id), "step is disabled and will be skipped");
        }

        let isolated = graph.incoming(&step.id).next().is_none()
            && graph.outgoing(&step.id).next().is_none()
            && pipeline.steps.len() > 1;
        if isolated {
            report.warn(Some(&step.id), "step has no connections");
        }

        if let StepConfig::Code(config) = &step.config {
            for pattern in SUSPICIOUS_CODE_PATTERNS {
                let re = regex::Regex::new(pattern).expect("static pattern");
                if re.is_match(&config.code) {
                    report.warn(
                        Some(&step.id),
                        format!("code matches suspicious pattern {pattern}"),
                    );
                }
            }
        }

        if let Some(extra) = step.config.extra_fields() {
            for field in extra.keys() {
                report.warn(
                    Some(&step.id),
                    format!("unknown config field '{field}' ignored"),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use serde_json::json;

    fn step(id: &str, config: StepConfig) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            config,
            enabled: true,
            timeout_ms: 1000,
            max_attempts: 1,
            retry_backoff: RetryBackoff::default(),
            estimate: None,
            position: Position::default(),
        }
    }

    fn llm(id: &str) -> Step {
        step(
            id,
            StepConfig::Llm(LlmConfig {
                model_id: "gpt-4o".into(),
                prompt: "hello {{inputs.x}}".into(),
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

    fn conn(id: &str, from: (&str, &str), to: (&str, &str)) -> Connection {
        Connection {
            id: id.to_string(),
            source: PortRef::new(from.0, from.1),
            target: PortRef::new(to.0, to.1),
            label: None,
        }
    }

    fn pipeline(steps: Vec<Step>, connections: Vec<Connection>) -> Pipeline {
        Pipeline {
            id: "p".into(),
            name: "p".into(),
            version: "1".into(),
            variables: Default::default(),
            steps,
            connections,
        }
    }

    #[test]
    fn test_valid_pipeline_passes() {
        let p = pipeline(
            vec![
                llm("ask"),
                step("sink", StepConfig::Output(OutputConfig::default())),
            ],
            vec![conn("c1", ("ask", "text"), ("sink", "data"))],
        );
        let report = validate(&p);
        assert!(report.valid(), "{:?}", report.errors);
    }

    #[test]
    fn test_cycle_detected() {
        let p = pipeline(
            vec![
                step("a", StepConfig::Transform(TransformConfig::Aggregate {})),
                step("b", StepConfig::Transform(TransformConfig::Aggregate {})),
            ],
            vec![
                conn("c1", ("a", "result"), ("b", "data")),
                conn("c2", ("b", "result"), ("a", "data")),
            ],
        );
        let report = validate(&p);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::CycleDetected { path } if path == &vec!["a".to_string(), "b".to_string()])));
    }

    #[test]
    fn test_unbound_required_input() {
        let p = pipeline(
            vec![step("t", StepConfig::Transform(TransformConfig::Aggregate {}))],
            vec![],
        );
        let report = validate(&p);
        assert!(report.errors.iter().any(|e| matches!(
            e,
            ValidationError::UnboundRequiredInput { step, port } if step == "t" && port == "data"
        )));
    }

    #[test]
    fn test_type_mismatch() {
        // llm tokens (number) -> llm variables (json) is not assignable.
        let p = pipeline(
            vec![llm("ask"), llm("followup")],
            vec![conn("c1", ("ask", "tokens"), ("followup", "variables"))],
        );
        let report = validate(&p);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::TypeMismatch { .. })));
    }

    #[test]
    fn test_duplicate_inbound_connection() {
        let p = pipeline(
            vec![
                llm("a"),
                llm("b"),
                step("sink", StepConfig::Output(OutputConfig::default())),
            ],
            vec![
                conn("c1", ("a", "text"), ("sink", "data")),
                conn("c2", ("b", "text"), ("sink", "data")),
            ],
        );
        let report = validate(&p);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateInboundConnection { .. })));
    }

    #[test]
    fn test_invalid_configs() {
        let bad_api = step(
            "call",
            StepConfig::Api(ApiConfig {
                url: "not a url".into(),
                method: "FETCH".into(),
                headers: None,
                body: None,
                auth: None,
                follow_redirects: false,
                verify_ssl: true,
                extra: Default::default(),
            }),
        );
        let bad_condition = step(
            "check",
            StepConfig::Condition(ConditionConfig {
                condition: "x ===".into(),
                extra: Default::default(),
            }),
        );
        let p = pipeline(vec![bad_api, bad_condition], vec![]);
        let report = validate(&p);
        let configs: Vec<_> = report
            .errors
            .iter()
            .filter(|e| matches!(e, ValidationError::InvalidStepConfig { .. }))
            .collect();
        // FETCH, unparseable url, unparseable condition; unbound inputs
        // are reported separately.
        assert!(configs.len() >= 3, "{configs:?}");
    }

    #[test]
    fn test_warnings_for_disabled_and_suspicious_code() {
        let mut code = step(
            "run",
            StepConfig::Code(CodeConfig {
                language: "python".into(),
                code: "eval(input())".into(),
                memory_mb: None,
                allowed_packages: vec![],
                variables: None,
                input_data: Some(json!({})),
                extra: Default::default(),
            }),
        );
        code.enabled = false;
        let p = pipeline(vec![code], vec![]);
        let report = validate(&p);
        assert!(report.valid());
        assert!(report.warnings.iter().any(|w| w.message.contains("disabled")));
        assert!(report.warnings.iter().any(|w| w.message.contains("suspicious")));
    }

    #[test]
    fn test_duplicate_output_names_rejected() {
        let mut out1 = step("o1", StepConfig::Output(OutputConfig::default()));
        out1.name = "result".into();
        let mut out2 = step("o2", StepConfig::Output(OutputConfig::default()));
        out2.name = "result".into();
        let p = pipeline(
            vec![llm("a"), out1, out2],
            vec![
                conn("c1", ("a", "text"), ("o1", "data")),
                conn("c2", ("a", "text"), ("o2", "data")),
            ],
        );
        let report = validate(&p);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidStepConfig { field, .. } if field == "name")));
    }
}
