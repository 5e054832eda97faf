// Server module: Unix socket front end for the query pipeline

mod protocol;
mod signals;

pub use protocol::{read_frame, write_frame, Request, Response, ServerClient, MAX_FRAME_SIZE};
pub use signals::SignalHandler;

use crate::cache::{InvalidationHandle, InvalidationListener, InvalidationReport};
use crate::embedding::EmbeddingProvider;
use crate::error::{Result, SmartChatError};
use crate::index::{CorpusFragment, MemoryCorpus};
use crate::llm::ProviderStatus;
use crate::pipeline::{QueryPipeline, QueryRequest};
use crate::types::{DocumentEvent, DocumentId, DocumentStatus, MutationKind};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default deadline for a client to send its request frame
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for open connections at shutdown before they are aborted
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Overall service health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub cache_enabled: bool,
    pub cache_reachable: bool,
    pub fragments: usize,
    pub providers: Vec<ProviderStatus>,
}

/// Components shared by every connection
pub struct ServerState {
    pipeline: Arc<QueryPipeline>,
    corpus: Arc<MemoryCorpus>,
    embedding: Arc<dyn EmbeddingProvider>,
    invalidation: InvalidationHandle,
}

impl ServerState {
    pub fn new(
        pipeline: Arc<QueryPipeline>,
        corpus: Arc<MemoryCorpus>,
        embedding: Arc<dyn EmbeddingProvider>,
        invalidation: InvalidationHandle,
    ) -> Self {
        Self {
            pipeline,
            corpus,
            embedding,
            invalidation,
        }
    }

    /// Answer every request except `query_stream`
    pub async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Query(query) => match self.pipeline.query(&query).await {
                Ok(result) => Response::with(&result),
                Err(e) => Response::failure(&e),
            },
            Request::QueryStream(_) => Response::error("query_stream needs a streaming connection"),
            Request::Search(search) => match self.pipeline.search(&search).await {
                Ok(response) => Response::with(&response),
                Err(e) => Response::failure(&e),
            },
            Request::Providers { refresh } => {
                if refresh {
                    self.pipeline.orchestrator().refresh_health().await;
                }
                Response::with(&self.pipeline.orchestrator().providers())
            }
            Request::CacheStats => Response::with(&self.pipeline.cache().stats().await),
            Request::ClearCache { target } => match self.pipeline.cache().clear(&target).await {
                Ok(removed) => Response::with(&serde_json::json!({ "removed": removed })),
                Err(e) => Response::error(format!("Failed to clear cache: {}", e)),
            },
            Request::DocumentMutation {
                document_id,
                kind,
                fragments,
            } => match self.apply_mutation(document_id, kind, fragments).await {
                Ok(report) => Response::with(&report),
                Err(e) => Response::failure(&e),
            },
            Request::Health => Response::with(&self.health().await),
        }
    }

    /// Invalidate, then mutate the corpus
    ///
    /// The invalidation is acknowledged before the mutation is applied. A second
    /// pass afterwards removes entries computed in between from pre-mutation data.
    pub async fn apply_mutation(
        &self,
        document_id: DocumentId,
        kind: MutationKind,
        fragments: Vec<CorpusFragment>,
    ) -> Result<InvalidationReport> {
        if let Some(stray) = fragments
            .iter()
            .find(|f| f.fragment.document_id != document_id)
        {
            return Err(SmartChatError::InvalidQuery(format!(
                "Fragment {} belongs to document {}, not {}",
                stray.fragment.id, stray.fragment.document_id, document_id
            )));
        }

        let event = DocumentEvent { document_id, kind };
        let mut report = self.invalidation.invalidate(event).await?;

        match kind {
            MutationKind::Deleted => {
                self.corpus.remove_document(document_id).await;
            }
            MutationKind::Updated if !fragments.is_empty() => {
                self.corpus.remove_document(document_id).await;
                for entry in fragments {
                    self.corpus.insert(entry.fragment, entry.embedding).await;
                }
                self.corpus
                    .set_document_status(document_id, DocumentStatus::Ready)
                    .await;
                if let Err(e) = self.corpus.embed_missing(self.embedding.as_ref()).await {
                    tracing::warn!(
                        "Document {} updated without vectors, keyword search only: {}",
                        document_id,
                        e
                    );
                }
            }
            MutationKind::Updated => {}
        }

        let follow_up = self.invalidation.invalidate(event).await?;
        report.retrieval_keys_deleted += follow_up.retrieval_keys_deleted;
        report.response_keys_deleted += follow_up.response_keys_deleted;
        report.metadata_deleted |= follow_up.metadata_deleted;
        report.errors.extend(follow_up.errors);

        tracing::info!("Applied {:?} of document {}", kind, document_id);
        Ok(report)
    }

    pub async fn health(&self) -> HealthReport {
        let cache = self.pipeline.cache();
        let cache_enabled = cache.is_enabled();
        let cache_reachable = cache_enabled && cache.ping().await;
        let providers = self.pipeline.orchestrator().providers();
        let fragments = self.corpus.len().await;

        let status = if !providers.iter().any(|p| p.available) {
            HealthStatus::Unhealthy
        } else if (cache_enabled && !cache_reachable) || fragments == 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            cache_enabled,
            cache_reachable,
            fragments,
            providers,
        }
    }
}

/// Unix domain socket server
pub struct Server {
    socket_path: PathBuf,
    max_connections: usize,
    request_timeout: Duration,
    shutdown_grace: Duration,
    state: Arc<ServerState>,
    invalidation: InvalidationListener,
}

impl Server {
    /// Create a server over a built pipeline; spawns the invalidation worker
    pub fn new(
        socket_path: PathBuf,
        max_connections: usize,
        pipeline: Arc<QueryPipeline>,
        corpus: Arc<MemoryCorpus>,
        embedding: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let invalidation = InvalidationListener::spawn(pipeline.cache().clone(), 64);
        let state = Arc::new(ServerState::new(
            pipeline,
            corpus,
            embedding,
            invalidation.handle(),
        ));

        Self {
            socket_path,
            max_connections: max_connections.max(1),
            request_timeout: REQUEST_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
            state,
            invalidation,
        }
    }

    /// Override the request-frame deadline and the shutdown grace period
    pub fn with_timeouts(mut self, request_timeout: Duration, shutdown_grace: Duration) -> Self {
        self.request_timeout = request_timeout;
        self.shutdown_grace = shutdown_grace;
        self
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind to the socket path, replacing a stale socket file
    fn bind(&self) -> Result<UnixListener> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| SmartChatError::Io {
                source: e,
                context: format!("Failed to remove existing socket: {:?}", self.socket_path),
            })?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SmartChatError::Io {
                source: e,
                context: format!("Failed to create socket directory: {:?}", parent),
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| SmartChatError::Io {
            source: e,
            context: format!("Failed to bind to socket: {:?}", self.socket_path),
        })?;

        tracing::info!("Server listening on {:?}", self.socket_path);
        Ok(listener)
    }

    /// Serve until `shutdown` resolves, then close connections and drain
    /// pending invalidations
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind()?;
        let permits = Arc::new(Semaphore::new(self.max_connections));
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let permit = tokio::select! {
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                        _ = &mut shutdown => {
                            tracing::info!("Shutdown requested");
                            break;
                        }
                    };
                    let state = self.state.clone();
                    let request_timeout = self.request_timeout;
                    connections.spawn(async move {
                        if let Err(e) = handle_client(stream, state, request_timeout).await {
                            tracing::error!("Client handler error: {}", e);
                        }
                        drop(permit);
                    });
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
            }
        }

        drop(listener);
        self.shutdown(connections).await
    }

    async fn shutdown(self, mut connections: JoinSet<()>) -> Result<()> {
        tracing::info!("Shutting down server");

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            tracing::warn!(
                "Aborting {} connections still open after {:?}",
                connections.len(),
                self.shutdown_grace
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        // Connection tasks are gone, so this is the last state handle
        drop(self.state);
        self.invalidation.shutdown().await;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| SmartChatError::Io {
                source: e,
                context: format!("Failed to remove socket: {:?}", self.socket_path),
            })?;
        }

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

/// Handle one connection: read a request, write its response frame(s)
async fn handle_client(
    mut stream: UnixStream,
    state: Arc<ServerState>,
    request_timeout: Duration,
) -> Result<()> {
    let request: Request =
        match tokio::time::timeout(request_timeout, protocol::read_frame(&mut stream)).await {
            Ok(request) => request?,
            Err(_) => {
                return Err(SmartChatError::Server(format!(
                    "No request received within {:?}",
                    request_timeout
                )))
            }
        };

    match request {
        Request::QueryStream(query) => stream_query(&mut stream, &state, query).await,
        other => {
            let response = state.dispatch(other).await;
            protocol::write_frame(&mut stream, &response).await
        }
    }
}

/// Forward pipeline events until the terminal one; a write failure drops the
/// receiver, which cancels the query
async fn stream_query(
    stream: &mut UnixStream,
    state: &ServerState,
    query: QueryRequest,
) -> Result<()> {
    let mut events = state.pipeline.query_stream(query);
    while let Some(event) = events.recv().await {
        protocol::write_frame(stream, &event).await?;
        if event.is_terminal() {
            break;
        }
    }
    Ok(())
}
