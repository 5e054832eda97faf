//! Query pipeline
//!
//! Sequences retrieval, reranking, context assembly and generation for one
//! query, with the cache consulted at the response and retrieval boundaries.
//! The blocking entry point returns a [`QueryResult`]; the streaming entry point
//! returns a receiver of [`StreamEvent`]s that always ends in exactly one
//! `final` or `error` event.

use crate::cache::CacheManager;
use crate::config::{duration_or, Config};
use crate::context::{AssembledContext, ContextAssembler};
use crate::embedding::EmbeddingProvider;
use crate::error::{ErrorKind, Result, SmartChatError};
use crate::index::{DocumentCatalog, FragmentStore, MemoryCorpus};
use crate::llm::{
    GenerationError, GenerationOutcome, LlmOrchestrator, SinkError, StreamEvent, StreamSink,
};
use crate::retrieval::{HybridRetriever, Reranker, RetrievalOutcome, SearchError};
use crate::types::{
    ConversationTurn, FragmentId, FragmentSet, QueryFlag, QueryResult, RetrievalCandidate, Scope,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

mod search;

pub use search::{FusionSummary, SearchHit, SearchRequest, SearchResponse};

pub const MAX_QUERY_CHARS: usize = 1000;
pub const MAX_HISTORY_TURNS: usize = 10;

/// Answer given when nothing relevant was retrieved
pub const NO_RESULTS_ANSWER: &str =
    "I couldn't find any relevant information in the available documents to answer your question.";

/// Provider name recorded on answers no provider produced
const NO_PROVIDER: &str = "none";

/// One query as submitted by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub provider_preference: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<ConversationTurn>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            scope: Scope::Corpus,
            provider_preference: None,
            conversation_history: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider_preference = Some(provider.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.conversation_history = history;
        self
    }

    fn text(&self) -> &str {
        self.query.trim()
    }

    fn preference(&self) -> Option<&str> {
        self.provider_preference.as_deref()
    }

    /// Reject requests the pipeline will not run
    pub fn validate(&self) -> Result<()> {
        let chars = self.text().chars().count();
        if chars == 0 {
            return Err(SmartChatError::InvalidQuery(
                "Query cannot be empty".to_string(),
            ));
        }
        if chars > MAX_QUERY_CHARS {
            return Err(SmartChatError::InvalidQuery(format!(
                "Query is {} characters, the limit is {}",
                chars, MAX_QUERY_CHARS
            )));
        }
        if self.conversation_history.len() > MAX_HISTORY_TURNS {
            return Err(SmartChatError::InvalidQuery(format!(
                "Conversation history has {} turns, the limit is {}",
                self.conversation_history.len(),
                MAX_HISTORY_TURNS
            )));
        }
        Ok(())
    }
}

/// Everything generation needs, produced before any provider is called
struct Grounding {
    fragments_found: usize,
    flags: Vec<QueryFlag>,
    /// `None` when nothing relevant was found
    context: Option<AssembledContext>,
}

impl Grounding {
    fn empty(flags: Vec<QueryFlag>) -> Self {
        Self {
            fragments_found: 0,
            flags,
            context: None,
        }
    }

    /// Degraded retrieval or ranking must not be served again from cache
    fn cacheable(&self) -> bool {
        !self.flags.iter().any(|f| {
            matches!(
                f,
                QueryFlag::KeywordOnly | QueryFlag::VectorOnly | QueryFlag::RerankDegraded
            )
        })
    }
}

/// Why a streamed query stopped before `final`
enum StreamStop {
    Cancelled,
    Failed {
        kind: ErrorKind,
        message: String,
        reasons: Vec<String>,
    },
}

impl From<SmartChatError> for StreamStop {
    fn from(e: SmartChatError) -> Self {
        StreamStop::Failed {
            kind: e.kind(),
            message: e.to_string(),
            reasons: e.reasons().to_vec(),
        }
    }
}

impl From<SinkError> for StreamStop {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::Disconnected => StreamStop::Cancelled,
            other => StreamStop::Failed {
                kind: ErrorKind::Internal,
                message: other.to_string(),
                reasons: Vec::new(),
            },
        }
    }
}

impl From<GenerationError> for StreamStop {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::AllProvidersFailed { reasons } => StreamStop::Failed {
                kind: ErrorKind::AllProvidersFailed,
                message: "All providers failed".to_string(),
                reasons,
            },
            GenerationError::StreamInterrupted { provider, reason } => StreamStop::Failed {
                kind: ErrorKind::ProviderFailure,
                message: format!("Provider {} failed mid-stream", provider),
                reasons: vec![format!("{}: {}", provider, reason)],
            },
            GenerationError::Cancelled => StreamStop::Cancelled,
            GenerationError::Sink(e) => e.into(),
        }
    }
}

fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn cancelled(probe: Option<&StreamSink>) -> bool {
    probe.is_some_and(|sink| sink.is_closed())
}

/// Query pipeline façade
pub struct QueryPipeline {
    retriever: HybridRetriever,
    reranker: Reranker,
    assembler: ContextAssembler,
    orchestrator: Arc<LlmOrchestrator>,
    cache: Arc<CacheManager>,
    fragments: Arc<dyn FragmentStore>,
    catalog: Option<Arc<dyn DocumentCatalog>>,
    top_k_initial: usize,
    final_k: usize,
    stream_buffer: usize,
}

impl QueryPipeline {
    pub fn new(
        retriever: HybridRetriever,
        reranker: Reranker,
        assembler: ContextAssembler,
        orchestrator: Arc<LlmOrchestrator>,
        cache: Arc<CacheManager>,
        fragments: Arc<dyn FragmentStore>,
        config: &Config,
    ) -> Self {
        Self {
            retriever,
            reranker,
            assembler,
            orchestrator,
            cache,
            fragments,
            catalog: None,
            top_k_initial: config.retrieval.top_k_initial,
            final_k: config.retrieval.final_k,
            stream_buffer: config.server.stream_buffer.max(1),
        }
    }

    /// Consult document status before searching a single document
    pub fn with_catalog(mut self, catalog: Arc<dyn DocumentCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Wire every component from configuration over an in-memory corpus
    pub fn build(
        config: &Config,
        corpus: Arc<MemoryCorpus>,
        embedding: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let embed_timeout = duration_or(&config.embedding.timeout, Duration::from_secs(2));
        let retriever =
            HybridRetriever::new(embedding, corpus.clone(), corpus.clone(), &config.retrieval)
                .map_err(|e| SmartChatError::Config(format!("retrieval: {}", e)))?
                .with_embed_timeout(embed_timeout);
        let reranker = Reranker::from_config(&config.rerank)
            .map_err(|e| SmartChatError::Config(format!("rerank: {}", e)))?;
        let assembler = ContextAssembler::new(&config.context)
            .map_err(|e| SmartChatError::Config(format!("context: {}", e)))?;
        let orchestrator = LlmOrchestrator::from_config(&config.llm)
            .map_err(|e| SmartChatError::Config(format!("llm: {}", e)))?;
        let cache = CacheManager::from_config(&config.cache);

        Ok(Self::new(
            retriever,
            reranker,
            assembler,
            Arc::new(orchestrator),
            Arc::new(cache),
            corpus.clone(),
            config,
        )
        .with_catalog(corpus))
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn orchestrator(&self) -> &Arc<LlmOrchestrator> {
        &self.orchestrator
    }

    /// Answer one query
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResult> {
        let started_at = Instant::now();
        let correlation_id = new_correlation_id();
        request.validate()?;

        if let Some(cached) = self.cached_response(request, &correlation_id, started_at).await {
            return Ok(cached);
        }

        let generation = self.cache.generation();
        let mut grounding = self
            .ground(request, &correlation_id, None)
            .await?
            .unwrap_or_else(|| Grounding::empty(Vec::new()));

        let Some(context) = grounding.context.take() else {
            return Ok(self.no_results(&correlation_id, started_at, grounding));
        };

        let gen_request = self.orchestrator.request(context.prompt.clone());
        let outcome = self
            .orchestrator
            .generate(&gen_request, request.preference())
            .await
            .map_err(|e| {
                let reasons = match e {
                    GenerationError::AllProvidersFailed { reasons } => reasons,
                    other => vec![other.to_string()],
                };
                error!(
                    correlation_id = %correlation_id,
                    "All providers failed: {}",
                    reasons.join("; ")
                );
                SmartChatError::AllProvidersFailed {
                    correlation_id: correlation_id.clone(),
                    reasons,
                }
            })?;

        let result = self.answer(&correlation_id, started_at, &grounding, &context, outcome);
        if grounding.cacheable() {
            self.store_response(request, &result, generation).await;
        }

        info!(
            correlation_id = %correlation_id,
            provider = %result.provider_used,
            "Query answered in {} ms",
            result.latency_ms
        );
        Ok(result)
    }

    /// Answer one query as a stream of events
    ///
    /// Dropping the receiver cancels the query at its next checkpoint.
    pub fn query_stream(self: &Arc<Self>, request: QueryRequest) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let pipeline = Arc::clone(self);

        tokio::spawn(async move {
            let started_at = Instant::now();
            let mut sink = StreamSink::new(tx, new_correlation_id());

            match pipeline.drive_stream(&request, &mut sink, started_at).await {
                Ok(()) => {}
                Err(StreamStop::Cancelled) => {
                    info!(
                        correlation_id = %sink.correlation_id(),
                        "Caller disconnected, query cancelled"
                    );
                }
                Err(StreamStop::Failed {
                    kind,
                    message,
                    reasons,
                }) => {
                    error!(
                        correlation_id = %sink.correlation_id(),
                        "Streamed query failed: {}",
                        message
                    );
                    if !sink.state().is_terminal() {
                        if let Err(e) = sink.fail(kind, message, reasons).await {
                            debug!("Could not deliver error event: {}", e);
                        }
                    }
                }
            }
        });

        rx
    }

    async fn drive_stream(
        &self,
        request: &QueryRequest,
        sink: &mut StreamSink,
        started_at: Instant,
    ) -> std::result::Result<(), StreamStop> {
        request.validate()?;
        let correlation_id = sink.correlation_id().to_string();

        if let Some(cached) = self.cached_response(request, &correlation_id, started_at).await {
            sink.search(cached.fragments_found, cached.flags.clone()).await?;
            sink.citations(cached.citations.clone()).await?;
            sink.chunk(cached.answer_text.clone()).await?;
            sink.finish(cached).await?;
            return Ok(());
        }

        let generation = self.cache.generation();
        let Some(mut grounding) = self.ground(request, &correlation_id, Some(&*sink)).await? else {
            return Err(StreamStop::Cancelled);
        };

        sink.search(grounding.fragments_found, grounding.flags.clone())
            .await?;

        let Some(context) = grounding.context.take() else {
            let result = self.no_results(&correlation_id, started_at, grounding);
            sink.citations(Vec::new()).await?;
            sink.chunk(result.answer_text.clone()).await?;
            sink.finish(result).await?;
            return Ok(());
        };

        sink.citations(context.citation_map.citations()).await?;

        let gen_request = self.orchestrator.request(context.prompt.clone());
        let outcome = self
            .orchestrator
            .generate_streaming(&gen_request, request.preference(), sink)
            .await?;

        let result = self.answer(&correlation_id, started_at, &grounding, &context, outcome);
        let cacheable = grounding.cacheable();
        sink.finish(result.clone()).await?;

        if cacheable {
            self.store_response(request, &result, generation).await;
        }
        info!(
            correlation_id = %correlation_id,
            provider = %result.provider_used,
            "Streamed query answered in {} ms",
            result.latency_ms
        );
        Ok(())
    }

    /// Retrieval, reranking and context assembly
    ///
    /// Returns `Ok(None)` when `probe` reports the caller gone at a checkpoint.
    async fn ground(
        &self,
        request: &QueryRequest,
        correlation_id: &str,
        probe: Option<&StreamSink>,
    ) -> Result<Option<Grounding>> {
        if cancelled(probe) {
            return Ok(None);
        }

        let retrieval = self.retrieve(request, correlation_id).await?;
        if cancelled(probe) {
            return Ok(None);
        }

        let mut flags = retrieval.flags;
        let fragments_found = retrieval.candidates.len();
        if retrieval.candidates.is_empty() {
            return Ok(Some(Grounding::empty(flags)));
        }

        let fragments = self.hydrate(&retrieval.candidates, correlation_id).await?;
        let reranked = self
            .reranker
            .rerank(request.text(), &retrieval.candidates, &fragments, self.final_k)
            .await;
        if reranked.degraded {
            flags.push(QueryFlag::RerankDegraded);
        }
        if cancelled(probe) {
            return Ok(None);
        }
        if reranked.ranked.is_empty() {
            return Ok(Some(Grounding::empty(flags)));
        }

        let context = self.assembler.assemble(
            request.text(),
            &reranked.ranked,
            &fragments,
            &request.conversation_history,
            self.assembler.token_budget(),
        );
        flags.extend(context.flags.iter().copied());
        if cancelled(probe) {
            return Ok(None);
        }

        Ok(Some(Grounding {
            fragments_found,
            flags,
            context: Some(context),
        }))
    }

    /// Cache-through hybrid retrieval
    async fn retrieve(
        &self,
        request: &QueryRequest,
        correlation_id: &str,
    ) -> Result<RetrievalOutcome> {
        let scope = request.scope;

        if let (Scope::Document(id), Some(catalog)) = (scope, &self.catalog) {
            match self.cache.document_meta(id, catalog.as_ref()).await {
                Ok(Some(meta)) if meta.is_searchable() => {}
                Ok(meta) => {
                    debug!(
                        correlation_id = %correlation_id,
                        "Document {} not searchable ({:?}), skipping retrieval",
                        id,
                        meta.map(|m| m.status)
                    );
                    return Ok(RetrievalOutcome::default());
                }
                Err(e) => {
                    warn!(correlation_id = %correlation_id, "Document catalog lookup failed: {}", e)
                }
            }
        }

        if let Some(candidates) = self
            .cache
            .get_retrieval(scope, request.text(), self.top_k_initial)
            .await
        {
            return Ok(RetrievalOutcome {
                candidates,
                ..Default::default()
            });
        }

        let generation = self.cache.generation();
        let outcome = self
            .retriever
            .retrieve(request.text(), scope, self.top_k_initial)
            .await
            .map_err(|e| match e {
                SearchError::InvalidQuery(message) => SmartChatError::InvalidQuery(message),
                SearchError::Unavailable { reasons } => {
                    error!(
                        correlation_id = %correlation_id,
                        %scope,
                        "Retrieval unavailable: {}",
                        reasons.join("; ")
                    );
                    SmartChatError::RetrievalUnavailable {
                        correlation_id: correlation_id.to_string(),
                        reasons,
                    }
                }
                other => SmartChatError::RetrievalUnavailable {
                    correlation_id: correlation_id.to_string(),
                    reasons: vec![other.to_string()],
                },
            })?;

        if outcome.flags.is_empty() {
            self.cache
                .put_retrieval(
                    scope,
                    request.text(),
                    self.top_k_initial,
                    &outcome.candidates,
                    generation,
                )
                .await;
        }
        Ok(outcome)
    }

    async fn hydrate(
        &self,
        candidates: &[RetrievalCandidate],
        correlation_id: &str,
    ) -> Result<FragmentSet> {
        let ids: Vec<FragmentId> = candidates.iter().map(|c| c.fragment_id.clone()).collect();
        let fragments = self.fragments.fragments(&ids).await.map_err(|e| {
            SmartChatError::RetrievalUnavailable {
                correlation_id: correlation_id.to_string(),
                reasons: vec![format!("fragment store: {}", e)],
            }
        })?;
        Ok(fragments.into_iter().map(|f| (f.id.clone(), f)).collect())
    }

    async fn cached_response(
        &self,
        request: &QueryRequest,
        correlation_id: &str,
        started_at: Instant,
    ) -> Option<QueryResult> {
        let mut cached = self
            .cache
            .get_response(
                request.scope,
                request.text(),
                request.preference(),
                &request.conversation_history,
            )
            .await?;

        cached.correlation_id = correlation_id.to_string();
        cached.latency_ms = started_at.elapsed().as_millis() as u64;
        cached.timestamp = Utc::now();
        if !cached.has_flag(QueryFlag::ServedFromCache) {
            cached.flags.push(QueryFlag::ServedFromCache);
        }
        debug!(correlation_id = %correlation_id, "Serving response from cache");
        Some(cached)
    }

    async fn store_response(&self, request: &QueryRequest, result: &QueryResult, generation: u64) {
        self.cache
            .put_response(
                request.scope,
                request.text(),
                request.preference(),
                &request.conversation_history,
                result,
                generation,
            )
            .await;
    }

    fn no_results(
        &self,
        correlation_id: &str,
        started_at: Instant,
        grounding: Grounding,
    ) -> QueryResult {
        info!(correlation_id = %correlation_id, "No relevant fragments found");
        QueryResult {
            answer_text: NO_RESULTS_ANSWER.to_string(),
            citations: Vec::new(),
            fragments_found: grounding.fragments_found,
            fragments_used: 0,
            provider_used: NO_PROVIDER.to_string(),
            model_name: NO_PROVIDER.to_string(),
            latency_ms: started_at.elapsed().as_millis() as u64,
            correlation_id: correlation_id.to_string(),
            timestamp: Utc::now(),
            usage: None,
            flags: grounding.flags,
        }
    }

    fn answer(
        &self,
        correlation_id: &str,
        started_at: Instant,
        grounding: &Grounding,
        context: &AssembledContext,
        outcome: GenerationOutcome,
    ) -> QueryResult {
        let citations = self
            .assembler
            .resolve_citations(&outcome.text, &context.citation_map);

        if !outcome.failed_attempts.is_empty() {
            info!(
                correlation_id = %correlation_id,
                provider = %outcome.provider,
                "Answered after fallback: {}",
                outcome.failed_attempts.join("; ")
            );
        }

        QueryResult {
            answer_text: outcome.text,
            citations,
            fragments_found: grounding.fragments_found,
            fragments_used: context.fragments_used,
            provider_used: outcome.provider,
            model_name: outcome.model,
            latency_ms: started_at.elapsed().as_millis() as u64,
            correlation_id: correlation_id.to_string(),
            timestamp: Utc::now(),
            usage: outcome.usage,
            flags: grounding.flags.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_validate_limits() {
        assert!(QueryRequest::new("What is the refund policy?").validate().is_ok());
        assert!(matches!(
            QueryRequest::new("   ").validate(),
            Err(SmartChatError::InvalidQuery(_))
        ));
        assert!(QueryRequest::new("x".repeat(MAX_QUERY_CHARS)).validate().is_ok());
        assert!(QueryRequest::new("x".repeat(MAX_QUERY_CHARS + 1))
            .validate()
            .is_err());

        let history = vec![ConversationTurn::new(Role::User, "hi"); MAX_HISTORY_TURNS + 1];
        assert!(QueryRequest::new("refunds?")
            .with_history(history)
            .validate()
            .is_err());
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: QueryRequest =
            serde_json::from_str(r#"{"query": "What is the refund policy?"}"#).unwrap();
        assert_eq!(request.scope, Scope::Corpus);
        assert!(request.provider_preference.is_none());
        assert!(request.conversation_history.is_empty());
    }

    #[test]
    fn test_degraded_grounding_not_cacheable() {
        assert!(Grounding::empty(vec![QueryFlag::HistoryTruncated]).cacheable());
        assert!(!Grounding::empty(vec![QueryFlag::KeywordOnly]).cacheable());
        assert!(!Grounding::empty(vec![QueryFlag::RerankDegraded]).cacheable());
    }

    #[test]
    fn test_mid_stream_failure_maps_to_provider_failure() {
        let stop: StreamStop = GenerationError::StreamInterrupted {
            provider: "openai".to_string(),
            reason: crate::llm::ProviderError::Transport("reset".to_string()),
        }
        .into();
        match stop {
            StreamStop::Failed { kind, reasons, .. } => {
                assert_eq!(kind, ErrorKind::ProviderFailure);
                assert_eq!(reasons.len(), 1);
            }
            StreamStop::Cancelled => panic!("expected failure"),
        }
    }
}
