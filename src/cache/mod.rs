//! Query cache manager
//!
//! Cache-through wrapper for retrieval candidates, final responses and document
//! metadata. The store is an optimization only: when it is absent, slow or
//! failing, every operation falls through to direct computation.

mod invalidation;
pub mod keys;
mod store;

pub use invalidation::{InvalidationHandle, InvalidationListener};
pub use keys::CacheScope;
pub use store::{glob_match, CacheEntry, CacheError, CacheStore, MemoryCacheStore};

use crate::config::{duration_or, CacheConfig};
use crate::index::{DocumentCatalog, IndexError};
use crate::types::{
    ConversationTurn, DocumentEvent, DocumentId, DocumentMeta, MutationKind, QueryResult,
    RetrievalCandidate, Scope,
};
use keys::{DOCMETA_PREFIX, RESPONSE_PREFIX, RETRIEVAL_PREFIX};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a manual clear addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearTarget {
    Scope(CacheScope),
    Document(DocumentId),
    /// Raw glob with `*` wildcards
    Pattern(String),
}

/// Keys removed for one document mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationReport {
    pub document_id: DocumentId,
    pub kind: MutationKind,
    pub retrieval_keys_deleted: usize,
    pub response_keys_deleted: usize,
    pub metadata_deleted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Live entry counts per key family
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyCounts {
    pub retrieval: usize,
    pub response: usize,
    pub docmeta: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    /// Writes dropped because an invalidation ran during the computation
    pub skipped_writes: u64,
    pub errors: u64,
    pub invalidations: u64,
    pub retrieval_keys_invalidated: u64,
    pub response_keys_invalidated: u64,
    pub docmeta_keys_invalidated: u64,
    pub keys: KeyCounts,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    skipped_writes: AtomicU64,
    errors: AtomicU64,
    invalidations: AtomicU64,
    retrieval_invalidated: AtomicU64,
    response_invalidated: AtomicU64,
    docmeta_invalidated: AtomicU64,
}

/// Stored payload tagged with the generation it was computed under
#[derive(Serialize, Deserialize)]
struct Stamped<T> {
    generation: u64,
    value: T,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Cache-through manager over an optional [`CacheStore`]
pub struct CacheManager {
    store: Option<Arc<dyn CacheStore>>,
    retrieval_ttl: Duration,
    response_ttl: Duration,
    metadata_ttl: Duration,
    op_timeout: Duration,
    /// Bumped before every invalidation deletes anything
    generation: AtomicU64,
    /// Entries stamped below this generation are misses; raised when an
    /// invalidation could not delete everything
    stale_before: AtomicU64,
    counters: Counters,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self {
            store: Some(store),
            retrieval_ttl: duration_or(&config.retrieval_ttl, Duration::from_secs(15 * 60)),
            response_ttl: duration_or(&config.response_ttl, Duration::from_secs(24 * 3600)),
            metadata_ttl: duration_or(&config.metadata_ttl, Duration::from_secs(3600)),
            op_timeout: duration_or(&config.op_timeout, Duration::from_millis(250)),
            generation: AtomicU64::new(0),
            stale_before: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Manager without a store; every lookup misses and every write is a no-op
    pub fn disabled() -> Self {
        Self {
            store: None,
            retrieval_ttl: Duration::ZERO,
            response_ttl: Duration::ZERO,
            metadata_ttl: Duration::ZERO,
            op_timeout: Duration::ZERO,
            generation: AtomicU64::new(0),
            stale_before: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// In-memory store when enabled, disabled manager otherwise
    pub fn from_config(config: &CacheConfig) -> Self {
        if config.enabled {
            Self::new(Arc::new(MemoryCacheStore::new(config.max_entries)), config)
        } else {
            info!("Query cache disabled by configuration");
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Snapshot taken before a computation; pass it back to the `put_*` call
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Run one store operation under the op timeout, absorbing failures
    async fn run<T, F>(&self, op: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                bump(&self.counters.errors);
                warn!("Cache {} failed: {}", op, e);
                None
            }
            Err(_) => {
                bump(&self.counters.errors);
                warn!("Cache {} timed out after {:?}", op, self.op_timeout);
                None
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let store = self.store.as_ref()?;

        let payload = match self.run("get", store.get(key)).await {
            Some(Some(payload)) => payload,
            _ => {
                bump(&self.counters.misses);
                return None;
            }
        };

        match serde_json::from_str::<Stamped<T>>(&payload) {
            Ok(stamped) if stamped.generation < self.stale_before.load(Ordering::SeqCst) => {
                bump(&self.counters.misses);
                debug!("Ignoring entry that survived a failed invalidation: {}", key);
                self.run("delete", store.delete(key)).await;
                None
            }
            Ok(stamped) => {
                bump(&self.counters.hits);
                debug!("Cache hit: {}", key);
                Some(stamped.value)
            }
            Err(e) => {
                bump(&self.counters.errors);
                bump(&self.counters.misses);
                warn!("Dropping unreadable cache entry {}: {}", key, e);
                self.run("delete", store.delete(key)).await;
                None
            }
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, started: u64) {
        let Some(store) = self.store.as_ref() else {
            return;
        };

        if self.generation() != started {
            bump(&self.counters.skipped_writes);
            debug!("Skipping cache write for {}: invalidated meanwhile", key);
            return;
        }

        let stamped = Stamped {
            generation: started,
            value,
        };
        let payload = match serde_json::to_string(&stamped) {
            Ok(payload) => payload,
            Err(e) => {
                bump(&self.counters.errors);
                warn!(
                    "Cache write skipped: {}",
                    CacheError::Serialization(e.to_string())
                );
                return;
            }
        };

        if self
            .run("set", store.set(key, payload, ttl))
            .await
            .is_none()
        {
            return;
        }

        // An invalidation that overlapped the write may have missed it
        if self.generation() != started {
            bump(&self.counters.skipped_writes);
            self.run("delete", store.delete(key)).await;
            return;
        }
        bump(&self.counters.writes);
    }

    pub async fn get_retrieval(
        &self,
        scope: Scope,
        query: &str,
        top_k: usize,
    ) -> Option<Vec<RetrievalCandidate>> {
        self.get_json(&keys::retrieval_key(scope, query, top_k))
            .await
    }

    pub async fn put_retrieval(
        &self,
        scope: Scope,
        query: &str,
        top_k: usize,
        candidates: &[RetrievalCandidate],
        started: u64,
    ) {
        let key = keys::retrieval_key(scope, query, top_k);
        self.put_json(&key, &candidates, self.retrieval_ttl, started)
            .await
    }

    pub async fn get_response(
        &self,
        scope: Scope,
        query: &str,
        provider: Option<&str>,
        history: &[ConversationTurn],
    ) -> Option<QueryResult> {
        self.get_json(&keys::response_key(scope, query, provider, history))
            .await
    }

    pub async fn put_response(
        &self,
        scope: Scope,
        query: &str,
        provider: Option<&str>,
        history: &[ConversationTurn],
        result: &QueryResult,
        started: u64,
    ) {
        let key = keys::response_key(scope, query, provider, history);
        self.put_json(&key, result, self.response_ttl, started)
            .await
    }

    /// Cache-through document metadata lookup
    pub async fn document_meta(
        &self,
        document_id: DocumentId,
        catalog: &dyn DocumentCatalog,
    ) -> Result<Option<DocumentMeta>, IndexError> {
        let key = keys::docmeta_key(document_id);
        if let Some(meta) = self.get_json::<DocumentMeta>(&key).await {
            return Ok(Some(meta));
        }

        let started = self.generation();
        let meta = catalog.document(document_id).await?;
        if let Some(meta) = &meta {
            self.put_json(&key, meta, self.metadata_ttl, started).await;
        }
        Ok(meta)
    }

    async fn delete_matching(
        &self,
        store: &Arc<dyn CacheStore>,
        pattern: &str,
        errors: &mut Vec<String>,
    ) -> usize {
        match tokio::time::timeout(self.op_timeout, store.delete_pattern(pattern)).await {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                bump(&self.counters.errors);
                errors.push(format!("{}: {}", pattern, e));
                0
            }
            Err(_) => {
                bump(&self.counters.errors);
                errors.push(format!("{}: timed out after {:?}", pattern, self.op_timeout));
                0
            }
        }
    }

    /// Remove every entry a mutation of `event.document_id` could make stale
    ///
    /// Covers the document's metadata, its scoped retrieval and response
    /// entries, and all corpus-scoped entries.
    ///
    /// When the store fails a delete, every entry written before this call is
    /// treated as a miss from then on, so a surviving key is never served.
    pub async fn invalidate_document(&self, event: DocumentEvent) -> InvalidationReport {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        bump(&self.counters.invalidations);

        let mut report = InvalidationReport {
            document_id: event.document_id,
            kind: event.kind,
            retrieval_keys_deleted: 0,
            response_keys_deleted: 0,
            metadata_deleted: false,
            errors: Vec::new(),
        };

        let Some(store) = self.store.as_ref() else {
            return report;
        };

        let id = event.document_id;
        let mut errors = Vec::new();

        for pattern in [
            keys::document_pattern(RETRIEVAL_PREFIX, id),
            keys::corpus_pattern(RETRIEVAL_PREFIX),
        ] {
            report.retrieval_keys_deleted +=
                self.delete_matching(store, &pattern, &mut errors).await;
        }
        for pattern in [
            keys::document_pattern(RESPONSE_PREFIX, id),
            keys::corpus_pattern(RESPONSE_PREFIX),
        ] {
            report.response_keys_deleted +=
                self.delete_matching(store, &pattern, &mut errors).await;
        }
        report.metadata_deleted = self
            .delete_matching(store, &keys::docmeta_key(id), &mut errors)
            .await
            > 0;
        report.errors = errors;

        self.counters
            .retrieval_invalidated
            .fetch_add(report.retrieval_keys_deleted as u64, Ordering::Relaxed);
        self.counters
            .response_invalidated
            .fetch_add(report.response_keys_deleted as u64, Ordering::Relaxed);
        if report.metadata_deleted {
            bump(&self.counters.docmeta_invalidated);
        }

        if report.errors.is_empty() {
            info!(
                "Invalidated document {} ({:?}): {} retrieval, {} response keys",
                id, event.kind, report.retrieval_keys_deleted, report.response_keys_deleted
            );
        } else {
            self.stale_before.fetch_max(generation, Ordering::SeqCst);
            warn!(
                "Partial invalidation of document {}, older entries now ignored: {}",
                id,
                report.errors.join("; ")
            );
        }

        report
    }

    /// Manual clear; returns the number of keys removed
    pub async fn clear(&self, target: &ClearTarget) -> Result<usize, CacheError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };

        // Any clear may race an in-flight computation
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let patterns: Vec<String> = match target {
            ClearTarget::Scope(scope) => vec![scope.pattern().to_string()],
            ClearTarget::Document(id) => vec![
                keys::document_pattern(RETRIEVAL_PREFIX, *id),
                keys::corpus_pattern(RETRIEVAL_PREFIX),
                keys::document_pattern(RESPONSE_PREFIX, *id),
                keys::corpus_pattern(RESPONSE_PREFIX),
                keys::docmeta_key(*id),
            ],
            ClearTarget::Pattern(pattern) => vec![pattern.clone()],
        };

        let mut removed = 0;
        for pattern in &patterns {
            let deleted = tokio::time::timeout(self.op_timeout, store.delete_pattern(pattern))
                .await
                .map_err(|_| CacheError::Timeout(self.op_timeout))
                .and_then(|r| r);
            match deleted {
                Ok(count) => removed += count,
                Err(e) => {
                    bump(&self.counters.errors);
                    self.stale_before.fetch_max(generation, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        info!("Cleared {} cache entries ({:?})", removed, target);
        Ok(removed)
    }

    async fn count_keys(&self, store: &Arc<dyn CacheStore>, prefix: &str) -> usize {
        let pattern = format!("{}:*", prefix);
        self.run("keys", store.keys(&pattern))
            .await
            .map(|keys| keys.len())
            .unwrap_or(0)
    }

    pub async fn stats(&self) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let c = &self.counters;

        let keys = match self.store.as_ref() {
            Some(store) => KeyCounts {
                retrieval: self.count_keys(store, RETRIEVAL_PREFIX).await,
                response: self.count_keys(store, RESPONSE_PREFIX).await,
                docmeta: self.count_keys(store, DOCMETA_PREFIX).await,
            },
            None => KeyCounts::default(),
        };

        CacheStats {
            enabled: self.is_enabled(),
            hits: load(&c.hits),
            misses: load(&c.misses),
            writes: load(&c.writes),
            skipped_writes: load(&c.skipped_writes),
            errors: load(&c.errors),
            invalidations: load(&c.invalidations),
            retrieval_keys_invalidated: load(&c.retrieval_invalidated),
            response_keys_invalidated: load(&c.response_invalidated),
            docmeta_keys_invalidated: load(&c.docmeta_invalidated),
            keys,
        }
    }

    /// Whether the store answers within the op timeout; false when disabled
    pub async fn ping(&self) -> bool {
        match self.store.as_ref() {
            Some(store) => self.run("ping", store.ping()).await.is_some(),
            None => false,
        }
    }
}
