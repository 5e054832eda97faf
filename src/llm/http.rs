use crate::config::ProviderConfig;
use crate::llm::ProviderError;
use futures::{Stream, StreamExt};
use std::time::Duration;

/// Connection settings shared by the HTTP providers
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub client: reqwest::Client,
    pub name: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    api_key_env: String,
    api_key: Option<String>,
}

impl HttpSettings {
    /// Build settings for a configured provider, reading its API key from the environment
    pub fn from_config(config: &ProviderConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport(format!("client setup: {}", e)))?;

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());

        Ok(Self {
            client,
            name: config.name.clone(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
            api_key_env: config.api_key_env.clone(),
            api_key,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Unavailable(format!("{} not set", self.api_key_env)))
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Map a reqwest error, filling in the configured timeout
    pub fn request_error(&self, err: reqwest::Error) -> ProviderError {
        match ProviderError::from(err) {
            ProviderError::Timeout(_) => ProviderError::Timeout(self.timeout),
            other => other,
        }
    }

    /// Send a request, turning non-success statuses into provider errors
    pub async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = request.send().await.map_err(|e| self.request_error(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status.as_u16(), &body))
    }
}

/// Response body as a stream of byte chunks
pub(crate) fn body_chunks(
    response: reqwest::Response,
    timeout: Duration,
) -> impl Stream<Item = Result<Vec<u8>, ProviderError>> + Send + 'static {
    response.bytes_stream().map(move |chunk| {
        chunk.map(|b| b.to_vec()).map_err(|e| match ProviderError::from(e) {
            ProviderError::Timeout(_) => ProviderError::Timeout(timeout),
            other => other,
        })
    })
}
