//! Streaming events and the per-query stream state machine
//!
//! ```text
//! INIT -> RETRIEVING (search) -> CONTEXT_READY (citations)
//!      -> GENERATING (chunk*) -> COMPLETE (final)
//! any non-terminal state -> FAILED (error)
//! ```

use crate::error::ErrorKind;
use crate::types::{Citation, QueryFlag, QueryResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// One record of a streamed answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Search {
        correlation_id: String,
        fragments_found: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        flags: Vec<QueryFlag>,
    },
    Citations {
        citations: Vec<Citation>,
    },
    Chunk {
        content: String,
    },
    Final(Box<QueryResult>),
    Error {
        kind: ErrorKind,
        message: String,
        correlation_id: String,
        #[serde(default)]
        reasons: Vec<String>,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Final(_) | StreamEvent::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Retrieving,
    ContextReady,
    Generating,
    Complete,
    Failed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Complete | StreamState::Failed)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("stream receiver dropped")]
    Disconnected,

    #[error("illegal stream transition from {from:?} on {event}")]
    IllegalTransition { from: StreamState, event: &'static str },
}

/// Sending side of one query's event stream
///
/// Every event passes through the state machine; an event that is not legal in
/// the current state is rejected without being sent.
pub struct StreamSink {
    tx: mpsc::Sender<StreamEvent>,
    state: StreamState,
    correlation_id: String,
}

impl StreamSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>, correlation_id: impl Into<String>) -> Self {
        Self {
            tx,
            state: StreamState::Init,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Whether the caller has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the caller drops its receiver
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    fn transition(
        &mut self,
        allowed: &[StreamState],
        to: StreamState,
        event: &'static str,
    ) -> Result<(), SinkError> {
        if !allowed.contains(&self.state) {
            return Err(SinkError::IllegalTransition {
                from: self.state,
                event,
            });
        }
        self.state = to;
        Ok(())
    }

    async fn send(&self, event: StreamEvent) -> Result<(), SinkError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SinkError::Disconnected)
    }

    /// INIT -> RETRIEVING, emits `search`
    pub async fn search(
        &mut self,
        fragments_found: usize,
        flags: Vec<QueryFlag>,
    ) -> Result<(), SinkError> {
        self.transition(&[StreamState::Init], StreamState::Retrieving, "search")?;
        let event = StreamEvent::Search {
            correlation_id: self.correlation_id.clone(),
            fragments_found,
            flags,
        };
        self.send(event).await
    }

    /// RETRIEVING -> CONTEXT_READY, emits `citations`
    pub async fn citations(&mut self, citations: Vec<Citation>) -> Result<(), SinkError> {
        self.transition(
            &[StreamState::Retrieving],
            StreamState::ContextReady,
            "citations",
        )?;
        self.send(StreamEvent::Citations { citations }).await
    }

    /// CONTEXT_READY | GENERATING -> GENERATING, emits `chunk`
    pub async fn chunk(&mut self, content: String) -> Result<(), SinkError> {
        self.transition(
            &[StreamState::ContextReady, StreamState::Generating],
            StreamState::Generating,
            "chunk",
        )?;
        self.send(StreamEvent::Chunk { content }).await
    }

    /// CONTEXT_READY | GENERATING -> COMPLETE, emits `final`
    pub async fn finish(&mut self, result: QueryResult) -> Result<(), SinkError> {
        self.transition(
            &[StreamState::ContextReady, StreamState::Generating],
            StreamState::Complete,
            "final",
        )?;
        self.send(StreamEvent::Final(Box::new(result))).await
    }

    /// Any non-terminal state -> FAILED, emits `error`
    pub async fn fail(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        reasons: Vec<String>,
    ) -> Result<(), SinkError> {
        self.transition(
            &[
                StreamState::Init,
                StreamState::Retrieving,
                StreamState::ContextReady,
                StreamState::Generating,
            ],
            StreamState::Failed,
            "error",
        )?;
        let event = StreamEvent::Error {
            kind,
            message: message.into(),
            correlation_id: self.correlation_id.clone(),
            reasons,
        };
        self.send(event).await
    }
}
