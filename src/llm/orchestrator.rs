//! Provider selection, fallback and streamed generation

use crate::config::{duration_or, LlmConfig, ProviderKind};
use crate::llm::{
    AnthropicProvider, GeminiProvider, GenerationRequest, HttpSettings, LlmProvider,
    OpenAiProvider, ProviderError, SinkError, StreamSink,
};
use crate::types::Usage;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    /// Every provider was skipped or failed before producing output
    #[error("All providers failed: {}", reasons.join("; "))]
    AllProvidersFailed { reasons: Vec<String> },

    /// A provider failed after part of its output reached the caller
    #[error("Provider {provider} failed mid-stream: {reason}")]
    StreamInterrupted {
        provider: String,
        reason: ProviderError,
    },

    /// The caller went away
    #[error("Generation cancelled by caller")]
    Cancelled,

    #[error("Stream error: {0}")]
    Sink(SinkError),
}

/// Successful generation with the provider that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub usage: Option<Usage>,
    /// Reasons of providers tried before the one that answered
    pub failed_attempts: Vec<String>,
}

/// Last known health of one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub model: String,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Health {
    available: bool,
    reason: Option<String>,
}

/// LLM orchestrator over a priority-ordered provider list
pub struct LlmOrchestrator {
    providers: Vec<Arc<dyn LlmProvider>>,
    health: Mutex<HashMap<String, Health>>,
    request_timeout: Duration,
    batch_chars: usize,
    max_tokens: u32,
    temperature: f32,
}

impl LlmOrchestrator {
    /// `providers` must already be in priority order
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, config: &LlmConfig) -> Self {
        Self {
            providers,
            health: Mutex::new(HashMap::new()),
            request_timeout: duration_or(&config.request_timeout, Duration::from_secs(60)),
            batch_chars: config.stream_batch_chars,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    /// Build the HTTP providers enabled in `config`, sorted by priority
    pub fn from_config(config: &LlmConfig) -> Result<Self, ProviderError> {
        let timeout = duration_or(&config.request_timeout, Duration::from_secs(60));

        let mut enabled: Vec<_> = config.providers.iter().filter(|p| p.enabled).collect();
        enabled.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

        let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::with_capacity(enabled.len());
        for provider in enabled {
            let settings = HttpSettings::from_config(provider, timeout)?;
            let built: Arc<dyn LlmProvider> = match provider.kind {
                ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(settings)),
                ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(settings)),
                ProviderKind::Gemini => Arc::new(GeminiProvider::new(settings)),
            };
            providers.push(built);
        }

        Ok(Self::new(providers, config))
    }

    pub fn request(&self, prompt: String) -> GenerationRequest {
        GenerationRequest {
            prompt,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    /// Providers in attempt order: the preferred one first, then priority order
    ///
    /// A missing or unknown preference yields plain priority order.
    pub fn attempt_order(&self, preference: Option<&str>) -> Vec<Arc<dyn LlmProvider>> {
        let preferred =
            preference.filter(|name| self.providers.iter().any(|p| p.name() == *name));

        let mut order = Vec::with_capacity(self.providers.len());
        if let Some(name) = preferred {
            order.extend(self.providers.iter().filter(|p| p.name() == name).cloned());
        }
        order.extend(
            self.providers
                .iter()
                .filter(|p| Some(p.name()) != preferred)
                .cloned(),
        );
        order
    }

    /// Probe every provider and record the result
    pub async fn refresh_health(&self) {
        for provider in &self.providers {
            let result = provider.healthcheck().await;
            self.record(provider.name(), result.as_ref().err());
        }
    }

    /// Last known health, in priority order
    pub fn providers(&self) -> Vec<ProviderStatus> {
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        self.providers
            .iter()
            .map(|p| {
                let h = health.get(p.name()).cloned().unwrap_or(Health {
                    available: true,
                    reason: None,
                });
                ProviderStatus {
                    name: p.name().to_string(),
                    model: p.model_name().to_string(),
                    available: h.available,
                    reason: h.reason,
                }
            })
            .collect()
    }

    pub fn any_available(&self) -> bool {
        self.providers().iter().any(|p| p.available)
    }

    fn record(&self, name: &str, error: Option<&ProviderError>) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.insert(
            name.to_string(),
            Health {
                available: error.is_none(),
                reason: error.map(|e| e.to_string()),
            },
        );
    }

    /// Health probe before an attempt; an unavailable provider is skipped
    async fn admit(&self, provider: &Arc<dyn LlmProvider>, reasons: &mut Vec<String>) -> bool {
        match provider.healthcheck().await {
            Ok(()) => true,
            Err(e) => {
                debug!(provider = %provider.name(), "Skipping provider: {}", e);
                self.record(provider.name(), Some(&e));
                reasons.push(format!("{}: {}", provider.name(), e));
                false
            }
        }
    }

    fn attempt_failed(
        &self,
        provider: &Arc<dyn LlmProvider>,
        err: &ProviderError,
        reasons: &mut Vec<String>,
    ) {
        warn!(provider = %provider.name(), "Provider failed, trying next: {}", err);
        self.record(provider.name(), Some(err));
        reasons.push(format!("{}: {}", provider.name(), err));
    }

    /// Blocking generation with fallback; each provider gets one attempt
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        preference: Option<&str>,
    ) -> Result<GenerationOutcome, GenerationError> {
        let mut reasons = Vec::new();

        for provider in self.attempt_order(preference) {
            if !self.admit(&provider, &mut reasons).await {
                continue;
            }

            let result = tokio::time::timeout(self.request_timeout, provider.generate(request))
                .await
                .unwrap_or(Err(ProviderError::Timeout(self.request_timeout)));

            match result {
                Ok(generation) => {
                    self.record(provider.name(), None);
                    info!(provider = %provider.name(), "Generation complete");
                    return Ok(GenerationOutcome {
                        text: generation.text,
                        provider: provider.name().to_string(),
                        model: provider.model_name().to_string(),
                        usage: generation.usage,
                        failed_attempts: reasons,
                    });
                }
                Err(e) => self.attempt_failed(&provider, &e, &mut reasons),
            }
        }

        Err(self.exhausted(reasons))
    }

    fn exhausted(&self, mut reasons: Vec<String>) -> GenerationError {
        if self.providers.is_empty() {
            reasons.push("no providers configured".to_string());
        }
        GenerationError::AllProvidersFailed { reasons }
    }

    /// Streamed generation with fallback, forwarding batched deltas to `sink`
    ///
    /// Fallback only happens before the first chunk reaches the caller. Dropping
    /// the receiver cancels the provider stream at the next delta boundary.
    pub async fn generate_streaming(
        &self,
        request: &GenerationRequest,
        preference: Option<&str>,
        sink: &mut StreamSink,
    ) -> Result<GenerationOutcome, GenerationError> {
        let mut reasons = Vec::new();

        'providers: for provider in self.attempt_order(preference) {
            if sink.is_closed() {
                return Err(GenerationError::Cancelled);
            }
            if !self.admit(&provider, &mut reasons).await {
                continue;
            }

            let deadline = Instant::now() + self.request_timeout;
            let opened = tokio::select! {
                biased;
                _ = sink.closed() => return Err(GenerationError::Cancelled),
                opened = tokio::time::timeout_at(deadline, provider.generate_stream(request)) => opened,
            };
            let mut stream = match opened {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    self.attempt_failed(&provider, &e, &mut reasons);
                    continue;
                }
                Err(_) => {
                    let e = ProviderError::Timeout(self.request_timeout);
                    self.attempt_failed(&provider, &e, &mut reasons);
                    continue;
                }
            };

            let mut text = String::new();
            let mut pending = String::new();
            let mut forwarded = false;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = sink.closed() => {
                        debug!(provider = %provider.name(), "Caller disconnected, dropping provider stream");
                        return Err(GenerationError::Cancelled);
                    }
                    next = tokio::time::timeout_at(deadline, stream.next()) => next,
                };

                let item = match next {
                    Ok(item) => item,
                    Err(_) => Some(Err(ProviderError::Timeout(self.request_timeout))),
                };

                match item {
                    Some(Ok(delta)) => {
                        text.push_str(&delta);
                        pending.push_str(&delta);
                        if pending.chars().count() >= self.batch_chars.max(1) {
                            self.forward(sink, std::mem::take(&mut pending)).await?;
                            forwarded = true;
                        }
                    }
                    Some(Err(e)) if forwarded => {
                        warn!(provider = %provider.name(), "Provider failed mid-stream: {}", e);
                        self.record(provider.name(), Some(&e));
                        return Err(GenerationError::StreamInterrupted {
                            provider: provider.name().to_string(),
                            reason: e,
                        });
                    }
                    Some(Err(e)) => {
                        self.attempt_failed(&provider, &e, &mut reasons);
                        continue 'providers;
                    }
                    None => break,
                }
            }

            if !pending.is_empty() {
                self.forward(sink, pending).await?;
            }

            self.record(provider.name(), None);
            info!(provider = %provider.name(), "Streamed generation complete");
            return Ok(GenerationOutcome {
                text,
                provider: provider.name().to_string(),
                model: provider.model_name().to_string(),
                usage: None,
                failed_attempts: reasons,
            });
        }

        Err(self.exhausted(reasons))
    }

    async fn forward(&self, sink: &mut StreamSink, content: String) -> Result<(), GenerationError> {
        sink.chunk(content).await.map_err(|e| match e {
            SinkError::Disconnected => GenerationError::Cancelled,
            other => GenerationError::Sink(other),
        })
    }
}
