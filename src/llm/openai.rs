//! OpenAI chat completions provider

use crate::llm::http::body_chunks;
use crate::llm::{
    delta_stream, DeltaStream, Generation, GenerationRequest, HttpSettings, LlmProvider,
    ProviderError, SseAction, SseEvent,
};
use crate::types::Usage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    delta: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<Choice>,
}

/// OpenAI-compatible `/chat/completions` provider
pub struct OpenAiProvider {
    settings: HttpSettings,
}

impl OpenAiProvider {
    pub fn new(settings: HttpSettings) -> Self {
        Self { settings }
    }

    fn body<'a>(&'a self, request: &'a GenerationRequest, stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.settings.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
        }
    }

    async fn post(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let key = self.settings.api_key()?;
        let builder = self
            .settings
            .client
            .post(self.settings.endpoint("chat/completions"))
            .bearer_auth(key)
            .json(&self.body(request, stream));
        self.settings.send(builder).await
    }
}

/// Extract the delta text of one streamed chunk
fn parse_stream_event(event: &SseEvent) -> Result<SseAction, ProviderError> {
    if event.data.trim() == "[DONE]" {
        return Ok(SseAction::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(&event.data)
        .map_err(|e| ProviderError::Protocol(format!("stream chunk: {}", e)))?;

    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .unwrap_or_default();

    if text.is_empty() {
        Ok(SseAction::Skip)
    } else {
        Ok(SseAction::Delta(text))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
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
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| ProviderError::Protocol("response has no message content".to_string()))?;

        debug!(provider = %self.settings.name, "Generated {} chars", text.len());

        Ok(Generation {
            text,
            usage: body.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
        })
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

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_parse_stream_event() {
        let delta = event(r#"{"choices":[{"index":0,"delta":{"content":"Refunds"}}]}"#);
        assert_eq!(
            parse_stream_event(&delta).unwrap(),
            SseAction::Delta("Refunds".to_string())
        );

        let role_only = event(r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#);
        assert_eq!(parse_stream_event(&role_only).unwrap(), SseAction::Skip);

        assert_eq!(parse_stream_event(&event("[DONE]")).unwrap(), SseAction::Done);
        assert!(parse_stream_event(&event("{not json")).is_err());
    }

    #[test]
    fn test_blocking_response_shape() {
        let json = r#"{
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Within 30 days [1]."}}],
            "usage": {"prompt_tokens": 812, "completion_tokens": 9, "total_tokens": 821}
        }"#;
        let body: ChatResponse = serde_json::from_str(json).unwrap();
        let usage = body.usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(812));
        assert_eq!(
            body.choices[0].message.as_ref().unwrap().content.as_deref(),
            Some("Within 30 days [1].")
        );
    }
}
