//! Template resolution against the variable store
//!
//! Expands `{{a.b[2].c}}` references in step configuration before
//! dispatch. String contexts render missing paths as the empty string;
//! JSON contexts render them as `null`; both record a warning. `{{{{`
//! escapes a literal `{{`. Paths under `creds.` are routed to the
//! injected credential resolver so secrets never live in definitions.

use serde_json::Value;

use crate::error::StepError;
use crate::traits::CredentialResolver;
use crate::vars::VariableStore;

/// One resolution pass over a step's configuration. Collects warnings
/// for the caller to surface as step logs.
pub struct Resolver<'a> {
    store: &'a VariableStore,
    creds: Option<&'a dyn CredentialResolver>,
    pub warnings: Vec<String>,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a VariableStore) -> Self {
        Self { store, creds: None, warnings: Vec::new() }
    }

    pub fn with_credentials(mut self, creds: &'a dyn CredentialResolver) -> Self {
        self.creds = Some(creds);
        self
    }

    /// Render a template into a string.
    pub async fn resolve_str(&mut self, input: &str) -> Result<String, StepError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(pos) = rest.find("{{") {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if tail.starts_with("{{{{") {
                out.push_str("{{");
                rest = &tail[4..];
                continue;
            }
            match tail[2..].find("}}") {
                None => {
                    self.warnings.push(format!(
                        "unterminated template reference near '{}'",
                        preview(tail)
                    ));
                    out.push_str(tail);
                    rest = "";
                    break;
                }
                Some(end) => {
                    let path = tail[2..2 + end].trim();
                    let value = self.lookup(path).await?;
                    match value {
                        Some(v) => out.push_str(&render_scalar(&v)),
                        None => {
                            self.warnings
                                .push(format!("template path '{path}' not found"));
                        }
                    }
                    rest = &tail[2 + end + 2..];
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Recursively resolve string leaves of a JSON value. A leaf that is
    /// exactly one `{{path}}` is replaced by the referenced value itself,
    /// preserving structure; anything else is string-interpolated.
    pub fn resolve_value<'b>(
        &'b mut self,
        value: &'b Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, StepError>> + Send + 'b>>
    {
        Box::pin(async move {
            match value {
                Value::String(s) => {
                    if let Some(path) = single_placeholder(s) {
                        let resolved = self.lookup(path).await?;
                        if resolved.is_none() {
                            self.warnings
                                .push(format!("template path '{path}' not found"));
                        }
                        Ok(resolved.unwrap_or(Value::Null))
                    } else {
                        Ok(Value::String(self.resolve_str(s).await?))
                    }
                }
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.resolve_value(item).await?);
                    }
                    Ok(Value::Array(out))
                }
                Value::Object(map) => {
                    let mut out = serde_json::Map::with_capacity(map.len());
                    for (k, v) in map {
                        out.insert(k.clone(), self.resolve_value(v).await?);
                    }
                    Ok(Value::Object(out))
                }
                other => Ok(other.clone()),
            }
        })
    }

    /// Resolve a request body. A body that is valid JSON before
    /// resolution stays structured. A template that renders into
    /// something JSON-shaped but unparseable fails before dispatch;
    /// plain text passes through as a string.
    pub async fn resolve_json_text(&mut self, text: &str) -> Result<Value, StepError> {
        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
            return self.resolve_value(&parsed).await;
        }
        let rendered = self.resolve_str(text).await?;
        match serde_json::from_str::<Value>(&rendered) {
            Ok(parsed) => Ok(parsed),
            Err(err) => {
                let jsonish =
                    matches!(rendered.trim_start().as_bytes().first(), Some(b'{' | b'['));
                if text.contains("{{") && jsonish {
                    Err(StepError::TemplateRender(format!(
                        "body is not valid JSON after resolution: {err}"
                    )))
                } else {
                    Ok(Value::String(rendered))
                }
            }
        }
    }

    async fn lookup(&mut self, path: &str) -> Result<Option<Value>, StepError> {
        if let Some(reference) = path.strip_prefix("creds.") {
            let creds = self.creds.ok_or_else(|| {
                StepError::TemplateRender(format!(
                    "credential reference '{path}' with no resolver configured"
                ))
            })?;
            let secret = creds.get(reference).await?;
            return Ok(Some(Value::String(secret)));
        }
        Ok(self.store.get(path).cloned())
    }
}

/// The inner path when `input` is exactly one `{{path}}` reference.
fn single_placeholder(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if trimmed.starts_with("{{{{") || inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    let path = inner.trim();
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

/// String rendering of a resolved value for interpolation contexts.
fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn preview(s: &str) -> &str {
    &s[..s.len().min(24)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> VariableStore {
        let mut store = VariableStore::new();
        store.set("name", json!("widget"));
        store.set("count", json!(3));
        store.set("steps.fetch.response", json!({"items": [{"id": 7}]}));
        store
    }

    #[tokio::test]
    async fn test_string_interpolation() {
        let s = store();
        let mut resolver = Resolver::new(&s);
        let out = resolver
            .resolve_str("have {{count}} of {{name}}, first id {{steps.fetch.response.items[0].id}}")
            .await
            .unwrap();
        assert_eq!(out, "have 3 of widget, first id 7");
        assert!(resolver.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_missing_path_renders_empty_with_warning() {
        let s = store();
        let mut resolver = Resolver::new(&s);
        let out = resolver.resolve_str("x={{nope.nothing}}!").await.unwrap();
        assert_eq!(out, "x=!");
        assert_eq!(resolver.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_escape_produces_literal_braces() {
        let s = store();
        let mut resolver = Resolver::new(&s);
        let out = resolver.resolve_str("{{{{name}} stays").await.unwrap();
        assert_eq!(out, "{{name}} stays");
    }

    #[tokio::test]
    async fn test_single_placeholder_preserves_structure() {
        let s = store();
        let mut resolver = Resolver::new(&s);
        let body = json!({
            "wrapped": "{{steps.fetch.response}}",
            "inline": "count is {{count}}",
            "missing": "{{nope}}"
        });
        let out = resolver.resolve_value(&body).await.unwrap();
        assert_eq!(out["wrapped"], json!({"items": [{"id": 7}]}));
        assert_eq!(out["inline"], json!("count is 3"));
        assert_eq!(out["missing"], Value::Null);
        assert_eq!(resolver.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_json_body_identity_when_no_templates() {
        let s = store();
        let mut resolver = Resolver::new(&s);
        let literal = r#"{"a": [1, 2], "b": {"c": true}}"#;
        let out = resolver.resolve_json_text(literal).await.unwrap();
        assert_eq!(out, serde_json::from_str::<Value>(literal).unwrap());
    }

    #[tokio::test]
    async fn test_invalid_json_after_resolution_fails() {
        let s = store();
        let mut resolver = Resolver::new(&s);
        // Not valid JSON before resolution, still not valid after.
        let err = resolver.resolve_json_text("{'bad': {{count}}").await;
        assert!(matches!(err, Err(StepError::TemplateRender(_))));
    }

    #[tokio::test]
    async fn test_credential_reference_requires_resolver() {
        let s = store();
        let mut resolver = Resolver::new(&s);
        let err = resolver.resolve_str("{{creds.github_token}}").await;
        assert!(matches!(err, Err(StepError::TemplateRender(_))));
    }
}
