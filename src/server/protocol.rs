// Length-prefixed JSON protocol spoken over the Unix socket

use crate::cache::{CacheStats, ClearTarget, InvalidationReport};
use crate::error::{Result, SmartChatError};
use crate::index::CorpusFragment;
use crate::llm::{ProviderStatus, StreamEvent};
use crate::pipeline::{QueryRequest, SearchRequest, SearchResponse};
use crate::types::{DocumentId, MutationKind, QueryResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

/// Maximum frame size (10MB)
pub const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

/// Requests accepted by the server, one per connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Blocking query, answered with one response frame
    Query(QueryRequest),
    /// Streamed query, answered with one frame per event
    QueryStream(QueryRequest),
    /// Hybrid retrieval only: scored fragments, no generation
    Search(SearchRequest),
    /// Provider availability, optionally re-probed first
    Providers {
        #[serde(default)]
        refresh: bool,
    },
    CacheStats,
    ClearCache { target: ClearTarget },
    /// Invalidate a document's cache entries, then apply the mutation
    DocumentMutation {
        document_id: DocumentId,
        kind: MutationKind,
        /// Replacement fragments for an update
        #[serde(default)]
        fragments: Vec<CorpusFragment>,
    },
    Health,
}

/// Response frame for every request except `query_stream`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn success_with_data(data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }

    /// Serialize `value` into a success response
    pub fn with<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => Self::success_with_data(data),
            Err(e) => Self::error(format!("Failed to serialize response: {}", e)),
        }
    }

    /// Error response carrying the kind, correlation id and reasons
    pub fn failure(err: &SmartChatError) -> Self {
        Self {
            success: false,
            message: Some(err.to_string()),
            data: Some(serde_json::json!({
                "kind": err.kind(),
                "correlation_id": err.correlation_id(),
                "reasons": err.reasons(),
            })),
        }
    }

    /// Decode the data payload of a successful response
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T> {
        if !self.success {
            return Err(SmartChatError::Server(
                self.message.unwrap_or_else(|| "Request failed".to_string()),
            ));
        }
        let data = self
            .data
            .ok_or_else(|| SmartChatError::Server("Response carried no data".to_string()))?;
        serde_json::from_value(data).map_err(|e| SmartChatError::Json {
            source: e,
            context: "Failed to decode response data".to_string(),
        })
    }
}

/// Read one length-prefixed JSON frame
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    // Read 4-byte length prefix
    let length = reader.read_u32().await.map_err(|e| SmartChatError::Io {
        source: e,
        context: "Failed to read frame length".to_string(),
    })?;

    if length > MAX_FRAME_SIZE {
        return Err(SmartChatError::Server(format!(
            "Frame too large: {} bytes (max: {})",
            length, MAX_FRAME_SIZE
        )));
    }

    let mut buffer = vec![0u8; length as usize];
    reader
        .read_exact(&mut buffer)
        .await
        .map_err(|e| SmartChatError::Io {
            source: e,
            context: "Failed to read frame payload".to_string(),
        })?;

    serde_json::from_slice(&buffer).map_err(|e| SmartChatError::Json {
        source: e,
        context: "Failed to deserialize frame".to_string(),
    })
}

/// Write one length-prefixed JSON frame
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value).map_err(|e| SmartChatError::Json {
        source: e,
        context: "Failed to serialize frame".to_string(),
    })?;

    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(SmartChatError::Server(format!(
            "Frame too large: {} bytes (max: {})",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }

    // Length prefix (4 bytes, big-endian)
    writer
        .write_u32(payload.len() as u32)
        .await
        .map_err(|e| SmartChatError::Io {
            source: e,
            context: "Failed to write frame length".to_string(),
        })?;

    writer
        .write_all(&payload)
        .await
        .map_err(|e| SmartChatError::Io {
            source: e,
            context: "Failed to write frame payload".to_string(),
        })?;

    writer.flush().await.map_err(|e| SmartChatError::Io {
        source: e,
        context: "Failed to flush frame".to_string(),
    })
}

/// Client for a running server
pub struct ServerClient {
    socket_path: PathBuf,
}

impl ServerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn connect(&self, request: &Request) -> Result<UnixStream> {
        let mut stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| SmartChatError::Io {
                    source: e,
                    context: format!("Failed to connect to server at {:?}", self.socket_path),
                })?;
        write_frame(&mut stream, request).await?;
        Ok(stream)
    }

    /// Send one request and read its single response frame
    pub async fn send(&self, request: &Request) -> Result<Response> {
        let mut stream = self.connect(request).await?;
        read_frame(&mut stream).await
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResult> {
        self.send(&Request::Query(request)).await?.into_data()
    }

    /// Stream a query, handing every event to `on_event`; returns the terminal event
    pub async fn query_stream<F>(&self, request: QueryRequest, mut on_event: F) -> Result<StreamEvent>
    where
        F: FnMut(&StreamEvent),
    {
        let mut stream = self.connect(&Request::QueryStream(request)).await?;
        loop {
            let event: StreamEvent = read_frame(&mut stream).await?;
            on_event(&event);
            if event.is_terminal() {
                return Ok(event);
            }
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        self.send(&Request::Search(request)).await?.into_data()
    }

    pub async fn providers(&self, refresh: bool) -> Result<Vec<ProviderStatus>> {
        self.send(&Request::Providers { refresh })
            .await?
            .into_data()
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.send(&Request::CacheStats).await?.into_data()
    }

    /// Returns the number of entries removed
    pub async fn clear_cache(&self, target: ClearTarget) -> Result<usize> {
        let removed: serde_json::Value = self
            .send(&Request::ClearCache { target })
            .await?
            .into_data()?;
        Ok(removed["removed"].as_u64().unwrap_or(0) as usize)
    }

    pub async fn document_mutation(
        &self,
        document_id: DocumentId,
        kind: MutationKind,
        fragments: Vec<CorpusFragment>,
    ) -> Result<InvalidationReport> {
        self.send(&Request::DocumentMutation {
            document_id,
            kind,
            fragments,
        })
        .await?
        .into_data()
    }

    pub async fn health(&self) -> Result<super::HealthReport> {
        self.send(&Request::Health).await?.into_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheScope;
    use crate::types::Scope;

    #[test]
    fn test_request_wire_format() {
        let json = r#"{"type": "query", "query": "What is the refund policy?", "scope": {"document": 42}}"#;
        match serde_json::from_str::<Request>(json).unwrap() {
            Request::Query(q) => {
                assert_eq!(q.scope, Scope::Document(42));
                assert!(q.conversation_history.is_empty());
            }
            other => panic!("unexpected request: {:?}", other),
        }

        let clear = serde_json::to_value(Request::ClearCache {
            target: ClearTarget::Scope(CacheScope::Response),
        })
        .unwrap();
        assert_eq!(clear["type"], "clear_cache");
        assert_eq!(clear["target"]["scope"], "response");

        let providers: Request = serde_json::from_str(r#"{"type": "providers"}"#).unwrap();
        assert!(matches!(providers, Request::Providers { refresh: false }));

        let search = r#"{"type": "search", "query": "refunds", "limit": 5}"#;
        match serde_json::from_str::<Request>(search).unwrap() {
            Request::Search(s) => {
                assert_eq!(s.query, "refunds");
                assert_eq!(s.scope, Scope::Corpus);
                assert_eq!(s.limit, Some(5));
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_failure_response_carries_correlation() {
        let err = SmartChatError::AllProvidersFailed {
            correlation_id: "c-9".to_string(),
            reasons: vec!["openai: timed out".to_string()],
        };
        let response = Response::failure(&err);
        assert!(!response.success);
        let data = response.data.unwrap();
        assert_eq!(data["kind"], "all_providers_failed");
        assert_eq!(data["correlation_id"], "c-9");
    }

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &Response::success("ok")).await.unwrap();
        let response: Response = read_frame(&mut b).await.unwrap();
        assert!(response.success);
        assert_eq!(response.message.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(MAX_FRAME_SIZE + 1).await.unwrap();
        let result: Result<Response> = read_frame(&mut b).await;
        assert!(matches!(result, Err(SmartChatError::Server(_))));
    }
}
