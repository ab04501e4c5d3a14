// Upstream v1internal HTTP client.

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use reqwest::{header, Client, Response};
use serde_json::{json, Value};
use tokio::time::Duration;

const UPSTREAM_USER_AGENT: &str = "antigravity/1.11.9 linux/amd64";

pub struct UpstreamClient {
    http_client: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(cfg: &RelayConfig) -> Self {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .user_agent(UPSTREAM_USER_AGENT);

        if let Some(proxy_url) = &cfg.upstream_proxy {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => {
                    builder = builder.proxy(proxy);
                    tracing::info!("upstream client egress proxy enabled: {}", proxy_url);
                }
                Err(e) => {
                    tracing::error!("invalid upstream proxy {}: {}", proxy_url, e);
                }
            }
        }

        let http_client = builder.build().unwrap_or_else(|_| Client::new());
        Self {
            http_client,
            base_url: cfg.upstream_base.trim_end_matches('/').to_string(),
        }
    }

    fn build_url(&self, method: &str, query_string: Option<&str>) -> String {
        match query_string {
            Some(qs) => format!("{}:{}?{}", self.base_url, method, qs),
            None => format!("{}:{}", self.base_url, method),
        }
    }

    fn headers(access_token: &str) -> RelayResult<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", access_token))
                .map_err(|e| RelayError::Upstream {
                    status: None,
                    message: format!("invalid access token header: {}", e),
                })?,
        );
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_static(UPSTREAM_USER_AGENT),
        );
        Ok(headers)
    }

    /// POST a v1internal method (`generateContent`, `streamGenerateContent`,
    /// `loadCodeAssist`, `fetchAvailableModels`).
    pub async fn call_v1_internal(
        &self,
        method: &str,
        access_token: &str,
        body: Value,
        query_string: Option<&str>,
    ) -> RelayResult<Response> {
        let url = self.build_url(method, query_string);
        let response = self
            .http_client
            .post(&url)
            .headers(Self::headers(access_token)?)
            .json(&body)
            .send()
            .await?;
        Ok(response)
    }

    /// `loadCodeAssist`: project id and tier discovery.
    pub async fn load_code_assist(&self, access_token: &str) -> RelayResult<Value> {
        let body = json!({
            "metadata": { "ideType": "ANTIGRAVITY" }
        });
        let response = self
            .call_v1_internal("loadCodeAssist", access_token, body, None)
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(RelayError::Upstream {
                status: Some(status),
                message: format!("loadCodeAssist failed: {}", text),
            });
        }
        Ok(response.json().await?)
    }

    /// `fetchAvailableModels`: per-model quota info.
    pub async fn fetch_available_models(
        &self,
        access_token: &str,
        project_id: Option<&str>,
    ) -> RelayResult<Value> {
        let mut body = json!({});
        if let Some(pid) = project_id {
            body["project"] = json!(pid);
        }
        let response = self
            .call_v1_internal("fetchAvailableModels", access_token, body, None)
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(RelayError::Upstream {
                status: Some(status),
                message: format!("fetchAvailableModels failed: {}", text),
            });
        }
        Ok(response.json().await?)
    }
}
