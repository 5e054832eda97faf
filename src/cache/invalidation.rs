// Invalidation worker fed by document mutation events over a bounded channel

use super::{CacheManager, InvalidationReport};
use crate::error::{Result, SmartChatError};
use crate::types::DocumentEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Mutation event paired with the acknowledgement the mutator waits on
struct InvalidationRequest {
    event: DocumentEvent,
    ack: oneshot::Sender<InvalidationReport>,
}

/// Cloneable sending side handed to whatever mutates documents
#[derive(Clone)]
pub struct InvalidationHandle {
    tx: mpsc::Sender<InvalidationRequest>,
}

impl InvalidationHandle {
    /// Invalidate and wait until the cache no longer holds entries for the
    /// document. Callers commit their mutation only after this returns.
    pub async fn invalidate(&self, event: DocumentEvent) -> Result<InvalidationReport> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(InvalidationRequest { event, ack })
            .await
            .map_err(|_| SmartChatError::Server("Invalidation channel closed".to_string()))?;

        done.await.map_err(|_| {
            SmartChatError::Server("Invalidation worker dropped the request".to_string())
        })
    }
}

/// Owns the invalidation worker task
pub struct InvalidationListener {
    handle: InvalidationHandle,
    worker_handle: Option<tokio::task::JoinHandle<()>>,
}

impl InvalidationListener {
    /// Spawn the worker with a channel of `buffer_size` pending events
    pub fn spawn(cache: Arc<CacheManager>, buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));

        let worker_handle = Some(tokio::spawn(async move {
            invalidation_worker(rx, cache).await;
        }));

        Self {
            handle: InvalidationHandle { tx },
            worker_handle,
        }
    }

    pub fn handle(&self) -> InvalidationHandle {
        self.handle.clone()
    }

    /// Stop accepting events and wait for queued ones to be applied
    ///
    /// Outstanding [`InvalidationHandle`] clones keep the channel open, so drop
    /// them first.
    pub async fn shutdown(mut self) {
        drop(self.handle);

        if let Some(handle) = self.worker_handle.take() {
            tracing::info!("Waiting for invalidation queue to drain...");
            let _ = handle.await;
            tracing::info!("Invalidation queue drained");
        }
    }
}

#[derive(Default)]
struct WorkerStats {
    processed: usize,
    partial: usize,
}

async fn invalidation_worker(
    mut rx: mpsc::Receiver<InvalidationRequest>,
    cache: Arc<CacheManager>,
) {
    let mut stats = WorkerStats::default();

    loop {
        tokio::select! {
            Some(request) = rx.recv() => {
                let report = cache.invalidate_document(request.event).await;
                stats.processed += 1;
                if !report.errors.is_empty() {
                    stats.partial += 1;
                }

                if request.ack.send(report).is_err() {
                    tracing::debug!(
                        "Mutator for document {} stopped waiting",
                        request.event.document_id
                    );
                }
            }

            else => {
                tracing::info!(
                    "Invalidation worker finished: {} events processed, {} partial",
                    stats.processed,
                    stats.partial
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::{MutationKind, RetrievalCandidate, Scope};

    #[tokio::test]
    async fn test_invalidate_waits_for_ack() {
        let cache = Arc::new(CacheManager::from_config(&Config::default().cache));
        let candidate = RetrievalCandidate {
            fragment_id: "f1".to_string(),
            document_id: 42,
            vector_score: 0.9,
            keyword_score: 0.4,
            fused_score: 0.75,
        };
        let g = cache.generation();
        cache
            .put_retrieval(Scope::Document(42), "refund policy", 20, &[candidate], g)
            .await;

        let listener = InvalidationListener::spawn(cache.clone(), 8);
        let report = listener
            .handle()
            .invalidate(DocumentEvent {
                document_id: 42,
                kind: MutationKind::Deleted,
            })
            .await
            .unwrap();

        assert_eq!(report.retrieval_keys_deleted, 1);
        assert!(cache
            .get_retrieval(Scope::Document(42), "refund policy", 20)
            .await
            .is_none());

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_listener_reports_error() {
        let cache = Arc::new(CacheManager::disabled());
        let listener = InvalidationListener::spawn(cache, 1);
        let handle = listener.handle();
        if let Some(worker) = &listener.worker_handle {
            worker.abort();
        }
        tokio::task::yield_now().await;
        let result = handle
            .invalidate(DocumentEvent {
                document_id: 1,
                kind: MutationKind::Updated,
            })
            .await;
        assert!(result.is_err());
    }
}
