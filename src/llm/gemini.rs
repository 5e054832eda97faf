//! Google Gemini provider

use crate::llm::http::body_chunks;
use crate::llm::{
    delta_stream, DeltaStream, Generation, GenerationRequest, HttpSettings, LlmProvider,
    ProviderError, SseAction, SseEvent,
};
use crate::types::Usage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

impl GenerateResponse {
    fn text(self) -> String {
        self.candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect()
    }
}

/// Gemini `generateContent` provider
pub struct GeminiProvider {
    settings: HttpSettings,
}

impl GeminiProvider {
    pub fn new(settings: HttpSettings) -> Self {
        Self { settings }
    }

    async fn post(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let key = self.settings.api_key()?;
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: &request.prompt,
                }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        };

        let (method, query): (&str, Vec<(&str, &str)>) = if stream {
            ("streamGenerateContent", vec![("alt", "sse"), ("key", key)])
        } else {
            ("generateContent", vec![("key", key)])
        };
        let url = self
            .settings
            .endpoint(&format!("models/{}:{}", self.settings.model, method));

        let builder = self.settings.client.post(url).query(&query).json(&body);
        self.settings.send(builder).await
    }
}

fn parse_stream_event(event: &SseEvent) -> Result<SseAction, ProviderError> {
    let chunk: GenerateResponse = serde_json::from_str(&event.data)
        .map_err(|e| ProviderError::Protocol(format!("stream chunk: {}", e)))?;

    let text = chunk.text();
    if text.is_empty() {
        Ok(SseAction::Skip)
    } else {
        Ok(SseAction::Delta(text))
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }

    async fn healthcheck(&self) -> Result<(), ProviderError> {
        self.settings.api_key().map(|_| ())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ProviderError> {
        let response = self.post(request, false).await?;
        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;

        let usage = body.usage_metadata.as_ref().map(|u| Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
        });
        let text = body.text();
        if text.is_empty() {
            return Err(ProviderError::Protocol("response has no candidates".to_string()));
        }

        Ok(Generation { text, usage })
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<DeltaStream, ProviderError> {
        let response = self.post(request, true).await?;
        Ok(delta_stream(
            body_chunks(response, self.settings.timeout),
            parse_stream_event,
        ))
    }
}
