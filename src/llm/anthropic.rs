//! Anthropic messages provider

use crate::llm::http::body_chunks;
use crate::llm::{
    delta_stream, DeltaStream, Generation, GenerationRequest, HttpSettings, LlmProvider,
    ProviderError, SseAction, SseEvent,
};
use crate::types::Usage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessagesUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct StreamPayload {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    error: Option<StreamErrorBody>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct StreamErrorBody {
    #[serde(default)]
    message: String,
}

/// Anthropic `/messages` provider
pub struct AnthropicProvider {
    settings: HttpSettings,
}

impl AnthropicProvider {
    pub fn new(settings: HttpSettings) -> Self {
        Self { settings }
    }

    async fn post(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let key = self.settings.api_key()?;
        let body = MessagesRequest {
            model: &self.settings.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
            stream,
        };

        let builder = self
            .settings
            .client
            .post(self.settings.endpoint("messages"))
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        self.settings.send(builder).await
    }
}

fn parse_stream_event(event: &SseEvent) -> Result<SseAction, ProviderError> {
    let payload: StreamPayload = serde_json::from_str(&event.data)
        .map_err(|e| ProviderError::Protocol(format!("stream event: {}", e)))?;

    match payload.kind.as_str() {
        "content_block_delta" => match payload.delta.and_then(|d| d.text) {
            Some(text) if !text.is_empty() => Ok(SseAction::Delta(text)),
            _ => Ok(SseAction::Skip),
        },
        "message_stop" => Ok(SseAction::Done),
        "error" => Err(ProviderError::Protocol(
            payload
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "stream error".to_string()),
        )),
        _ => Ok(SseAction::Skip),
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
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
        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;

        let text: String = body
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect();
        if text.is_empty() {
            return Err(ProviderError::Protocol(
                "response has no text content".to_string(),
            ));
        }

        Ok(Generation {
            text,
            usage: body.usage.map(|u| Usage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
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

    fn event(name: &str, data: &str) -> SseEvent {
        SseEvent {
            event: Some(name.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_parse_stream_events() {
        let delta = event(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Refunds"}}"#,
        );
        assert_eq!(
            parse_stream_event(&delta).unwrap(),
            SseAction::Delta("Refunds".to_string())
        );

        let ping = event("ping", r#"{"type":"ping"}"#);
        assert_eq!(parse_stream_event(&ping).unwrap(), SseAction::Skip);

        let stop = event("message_stop", r#"{"type":"message_stop"}"#);
        assert_eq!(parse_stream_event(&stop).unwrap(), SseAction::Done);

        let overloaded = event(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert_eq!(
            parse_stream_event(&overloaded).unwrap_err(),
            ProviderError::Protocol("Overloaded".to_string())
        );
    }

    #[test]
    fn test_blocking_response_concatenates_text_blocks() {
        let json = r#"{
            "content": [{"type": "text", "text": "Within 30 days"}, {"type": "text", "text": " [1]."}],
            "usage": {"input_tokens": 700, "output_tokens": 12}
        }"#;
        let body: MessagesResponse = serde_json::from_str(json).unwrap();
        let text: String = body.content.into_iter().filter_map(|b| b.text).collect();
        assert_eq!(text, "Within 30 days [1].");
    }
}
