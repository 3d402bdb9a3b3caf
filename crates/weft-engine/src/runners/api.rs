//! API step runner
//!
//! Issues one HTTP call through the injected client. Auth material is
//! applied as headers here, after the resolver has already swapped any
//! credential references for secrets. Status classification follows the
//! engine's retry taxonomy: network failures, 5xx, 408 and 429 are
//! retryable, other 4xx are final.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{Map, Value};

use weft_core::error::{HttpError, StepError};
use weft_core::traits::HttpRequest;
use weft_core::types::{AuthConfig, StepConfig, StepKind};

use super::{required_str, StepContext, StepInputs, StepOutputs, StepRunner};

const RESPONSE_PREVIEW_LIMIT: usize = 512;

pub struct ApiRunner;

#[async_trait]
impl StepRunner for ApiRunner {
    fn kind(&self) -> StepKind {
        StepKind::Api
    }

    async fn run(
        &self,
        ctx: &StepContext<'_>,
        inputs: StepInputs,
    ) -> Result<StepOutputs, StepError> {
        let config = match &ctx.step.config {
            StepConfig::Api(config) => config,
            _ => return Err(StepError::Internal("api runner got non-api step".into())),
        };

        let url = required_str(&inputs, "url")?.to_string();
        let method = required_str(&inputs, "method")?.to_uppercase();

        let mut headers: Vec<(String, String)> = Vec::new();
        if let Some(Value::Object(map)) = inputs.get("headers") {
            for (name, value) in map {
                headers.push((name.clone(), render_header(value)));
            }
        }

        let auth = match inputs.get("auth") {
            Some(value) if !value.is_null() => Some(
                serde_json::from_value::<AuthConfig>(value.clone())
                    .map_err(|e| StepError::Internal(format!("invalid auth config: {e}")))?,
            ),
            _ => None,
        };
        if let Some(auth) = auth {
            apply_auth(&auth, &mut headers);
        }

        let body = match inputs.get("body") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.clone().into_bytes()),
            Some(structured) => {
                if !headers
                    .iter()
                    .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                {
                    headers.push(("Content-Type".to_string(), "application/json".to_string()));
                }
                Some(serde_json::to_vec(structured).map_err(|e| {
                    StepError::Internal(format!("body serialization failed: {e}"))
                })?)
            }
        };

        let request = HttpRequest {
            method,
            url,
            headers,
            body,
            timeout: Duration::from_millis(ctx.step.timeout_ms),
            follow_redirects: config.follow_redirects,
            verify_ssl: config.verify_ssl,
        };

        let response = ctx.services.http.execute(request).await?;
        let body_text = String::from_utf8_lossy(&response.body).to_string();

        if response.status >= 400 {
            let mut cut = RESPONSE_PREVIEW_LIMIT.min(body_text.len());
            while !body_text.is_char_boundary(cut) {
                cut -= 1;
            }
            return Err(StepError::Http(HttpError::Status {
                status: response.status,
                message: body_text[..cut].to_string(),
            }));
        }

        let is_json = response
            .content_type()
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);
        let parsed = if is_json {
            serde_json::from_str(&body_text).unwrap_or(Value::String(body_text))
        } else {
            Value::String(body_text)
        };

        let mut header_map = Map::new();
        for (name, value) in &response.headers {
            header_map.insert(name.to_lowercase(), Value::String(value.clone()));
        }

        let mut outputs = StepOutputs::new();
        outputs.insert("response".to_string(), parsed);
        outputs.insert("status".to_string(), Value::from(response.status));
        outputs.insert("headers".to_string(), Value::Object(header_map));
        Ok(outputs)
    }
}

fn render_header(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_auth(auth: &AuthConfig, headers: &mut Vec<(String, String)>) {
    match auth {
        AuthConfig::None => {}
        AuthConfig::Bearer { token } => {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        AuthConfig::Basic { username, password } => {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            headers.push(("Authorization".to_string(), format!("Basic {encoded}")));
        }
        AuthConfig::ApiKey { key, header } => {
            headers.push((header.clone(), key.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_headers() {
        let mut headers = Vec::new();
        apply_auth(&AuthConfig::Bearer { token: "tok".into() }, &mut headers);
        assert_eq!(headers[0].1, "Bearer tok");

        headers.clear();
        apply_auth(
            &AuthConfig::Basic { username: "u".into(), password: "p".into() },
            &mut headers,
        );
        assert_eq!(headers[0].1, format!("Basic {}", base64::engine::general_purpose::STANDARD.encode("u:p")));

        headers.clear();
        apply_auth(
            &AuthConfig::ApiKey { key: "k".into(), header: "X-Api-Key".into() },
            &mut headers,
        );
        assert_eq!(headers[0], ("X-Api-Key".to_string(), "k".to_string()));
    }
}
