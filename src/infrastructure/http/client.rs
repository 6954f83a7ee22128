use crate::config::Config;
use crate::domain::errors::{ClientError, ClientResult, UnexpectedResponseError};
use crate::domain::ports::write_client::{WriteClient, WriteMeta};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

/// Header carrying the ACL secret.
pub const TOKEN_HEADER: &str = "X-Nomad-Token";

/// Header carrying the raft index of a completed write.
pub const INDEX_HEADER: &str = "X-Nomad-Index";

/// Error bodies are truncated to this many bytes.
const MAX_ERROR_BODY: usize = 500;

/// reqwest-backed client for the variable service.
///
/// Handles the base address, namespace and region query parameters, the
/// token header and JSON encoding. Retries are layered on top by
/// `RetryClient`.
#[derive(Clone)]
pub struct HttpClient {
    http_client: Client,
    address: String,
    namespace: Option<String>,
    region: Option<String>,
    token: Option<String>,
}

impl HttpClient {
    pub fn new(address: impl Into<String>) -> ClientResult<Self> {
        Self::with_timeout(address, Duration::from_secs(30))
    }

    pub fn with_timeout(address: impl Into<String>, timeout: Duration) -> ClientResult<Self> {
        let http_client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http_client,
            address: address.into().trim_end_matches('/').to_string(),
            namespace: None,
            region: None,
            token: None,
        })
    }

    pub fn from_config(config: &Config) -> ClientResult<Self> {
        let mut client = Self::with_timeout(&config.address, config.http_timeout)?;
        client.namespace = config.namespace.clone();
        client.region = config.region.clone();
        client.token = config.token.clone();
        Ok(client)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn url(&self, endpoint: &str) -> ClientResult<String> {
        if !endpoint.starts_with('/') {
            return Err(ClientError::InvalidRequest(format!(
                "endpoint must start with '/': {}",
                endpoint
            )));
        }
        Ok(format!("{}{}", self.address, endpoint))
    }

    fn query_params(&self) -> Vec<(&'static str, &str)> {
        let mut params = Vec::new();
        if let Some(namespace) = self.namespace.as_deref() {
            params.push(("namespace", namespace));
        }
        if let Some(region) = self.region.as_deref() {
            params.push(("region", region));
        }
        params
    }

    /// PUT a serializable body and decode the response into `T`.
    pub async fn put_json<B, T>(&self, endpoint: &str, body: &B) -> ClientResult<(WriteMeta, T)>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body)?;
        let (meta, value) = self.put(endpoint, &body).await?;
        Ok((meta, serde_json::from_value(value)?))
    }
}

#[async_trait]
impl WriteClient for HttpClient {
    async fn put(&self, endpoint: &str, body: &Value) -> ClientResult<(WriteMeta, Value)> {
        let url = self.url(endpoint)?;
        let started = Instant::now();

        let mut request = self
            .http_client
            .put(&url)
            .query(&self.query_params())
            .json(body);
        if let Some(token) = self.token.as_deref() {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!("PUT {} returned status {}", url, status.as_u16());

        if !status.is_success() {
            let status_text = status.canonical_reason().unwrap_or_default().to_string();
            let error = match response.text().await {
                Ok(body) => {
                    let body = truncate(body.trim(), MAX_ERROR_BODY);
                    UnexpectedResponseError::new(status.as_u16(), status_text, body)
                }
                Err(e) => UnexpectedResponseError::new(status.as_u16(), status_text, "")
                    .with_source(e),
            };
            return Err(error.into());
        }

        let last_index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let bytes = response.bytes().await?;
        let value = if bytes.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };

        let meta = WriteMeta {
            last_index,
            request_time: started.elapsed(),
        };
        Ok((meta, value))
    }
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}
