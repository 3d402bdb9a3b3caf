//! HTTP client adapter backed by reqwest
//!
//! One adapter instance serves all `api` steps. Redirect and TLS
//! behaviour vary per request, so clients are built per (redirects,
//! verify) pair and cached.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;

use weft_core::error::HttpError;
use weft_core::traits::{HttpClient, HttpRequest, HttpResponse};

pub struct ReqwestHttpClient {
    clients: Mutex<HashMap<(bool, bool), reqwest::Client>>,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self { clients: Mutex::new(HashMap::new()) }
    }

    fn client(&self, follow_redirects: bool, verify_ssl: bool) -> Result<reqwest::Client, HttpError> {
        let mut clients = self.clients.lock().expect("client cache lock");
        if let Some(client) = clients.get(&(follow_redirects, verify_ssl)) {
            return Ok(client.clone());
        }
        let redirect = if follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = reqwest::Client::builder()
            .redirect(redirect)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .map_err(|e| HttpError::Network(e.to_string()))?;
        clients.insert((follow_redirects, verify_ssl), client.clone());
        Ok(client)
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HttpError::Network(format!("bad method '{}'", request.method)))?;
        debug!("http {} {}", request.method, request.url);

        let client = self.client(request.follow_redirects, request.verify_ssl)?;
        let mut builder = client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?
            .to_vec();

        Ok(HttpResponse { status, headers, body })
    }
}
