//! Hybrid retrieval combining vector and keyword search

use crate::config::{duration_or, RetrievalConfig};
use crate::embedding::EmbeddingProvider;
use crate::index::{KeywordSearch, ScoredHit, VectorSearch};
use crate::retrieval::{deduplicate_candidates, fuse, FusionConfig, FusionError};
use crate::types::{QueryFlag, RetrievalCandidate, Scope};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Both retrieval sources failed: {}", reasons.join("; "))]
    Unavailable { reasons: Vec<String> },

    #[error("Fusion configuration error: {0}")]
    Fusion(#[from] FusionError),
}

/// Fused candidates plus any degradation recorded on the way
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub candidates: Vec<RetrievalCandidate>,
    pub flags: Vec<QueryFlag>,
    /// Failure reason of a source that was skipped
    pub degraded_reason: Option<String>,
}

/// Hybrid retriever over the vector and keyword collaborators
pub struct HybridRetriever {
    embedding_provider: Arc<dyn EmbeddingProvider>,
    vector_search: Arc<dyn VectorSearch>,
    keyword_search: Arc<dyn KeywordSearch>,
    fusion: FusionConfig,
    min_fused_score: f32,
    min_vector_score: f32,
    source_timeout: Duration,
    embed_timeout: Duration,
}

impl HybridRetriever {
    /// Create a new hybrid retriever
    pub fn new(
        embedding_provider: Arc<dyn EmbeddingProvider>,
        vector_search: Arc<dyn VectorSearch>,
        keyword_search: Arc<dyn KeywordSearch>,
        config: &RetrievalConfig,
    ) -> Result<Self, SearchError> {
        let source_timeout = duration_or(&config.source_timeout, Duration::from_secs(2));
        Ok(Self {
            embedding_provider,
            vector_search,
            keyword_search,
            fusion: FusionConfig::from_config(config)?,
            min_fused_score: config.min_fused_score,
            min_vector_score: config.min_vector_score,
            source_timeout,
            embed_timeout: source_timeout,
        })
    }

    /// Override the query-embedding timeout (defaults to the source timeout)
    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    pub fn fusion(&self) -> &FusionConfig {
        &self.fusion
    }

    /// Retrieve up to `top_k_initial` fused candidates for `query_text` within `scope`
    pub async fn retrieve(
        &self,
        query_text: &str,
        scope: Scope,
        top_k_initial: usize,
    ) -> Result<RetrievalOutcome, SearchError> {
        let query_text = query_text.trim();
        if query_text.is_empty() {
            return Err(SearchError::InvalidQuery(
                "Query text cannot be empty".to_string(),
            ));
        }

        // Parallel vector + keyword search
        let (vector_results, keyword_results) = tokio::join!(
            self.vector_source(query_text, scope, top_k_initial),
            self.keyword_source(query_text, scope, top_k_initial)
        );

        let mut outcome = RetrievalOutcome::default();
        let fused = match (vector_results, keyword_results) {
            (Ok(vector), Ok(keyword)) => fuse(&vector, &keyword, &self.fusion),
            (Err(reason), Ok(keyword)) => {
                warn!(%scope, "Vector search degraded, using keyword results only: {}", reason);
                outcome.flags.push(QueryFlag::KeywordOnly);
                outcome.degraded_reason = Some(reason);
                fuse(&[], &keyword, &self.single_source(0.0))
            }
            (Ok(vector), Err(reason)) => {
                warn!(%scope, "Keyword search degraded, using vector results only: {}", reason);
                outcome.flags.push(QueryFlag::VectorOnly);
                outcome.degraded_reason = Some(reason);
                fuse(&vector, &[], &self.single_source(1.0))
            }
            (Err(vector_reason), Err(keyword_reason)) => {
                return Err(SearchError::Unavailable {
                    reasons: vec![vector_reason, keyword_reason],
                });
            }
        };

        let mut candidates = deduplicate_candidates(fused);
        candidates.retain(|c| scope.contains(c.document_id));
        candidates.retain(|c| c.fused_score >= self.min_fused_score);
        candidates.truncate(top_k_initial);

        debug!(%scope, "Retrieved {} candidates", candidates.len());
        outcome.candidates = candidates;
        Ok(outcome)
    }

    /// Fusion settings giving the surviving source the whole weight
    fn single_source(&self, alpha: f32) -> FusionConfig {
        FusionConfig {
            alpha,
            ..self.fusion.clone()
        }
    }

    /// Vector search: embed the query, then query the vector index.
    ///
    /// Embedding and search share one `source_timeout` deadline; the embed
    /// timeout only bounds the embedding step inside it.
    async fn vector_source(
        &self,
        query: &str,
        scope: Scope,
        limit: usize,
    ) -> Result<Vec<ScoredHit>, String> {
        let search = async {
            let embedding =
                tokio::time::timeout(self.embed_timeout, self.embedding_provider.embed(query))
                    .await
                    .map_err(|_| {
                        format!("vector: embedding timed out after {:?}", self.embed_timeout)
                    })?
                    .map_err(|e| format!("vector: {}", e))?;

            self.vector_search
                .search(&embedding, scope, limit, self.min_vector_score)
                .await
                .map_err(|e| format!("vector: {}", e))
        };

        tokio::time::timeout(self.source_timeout, search)
            .await
            .map_err(|_| format!("vector: timed out after {:?}", self.source_timeout))?
    }

    /// Keyword search through the keyword index
    async fn keyword_source(
        &self,
        query: &str,
        scope: Scope,
        limit: usize,
    ) -> Result<Vec<ScoredHit>, String> {
        tokio::time::timeout(
            self.source_timeout,
            self.keyword_search.search(query, scope, limit),
        )
        .await
        .map_err(|_| format!("keyword: timed out after {:?}", self.source_timeout))?
        .map_err(|e| format!("keyword: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::EmbeddingError;
    use crate::index::IndexError;
    use async_trait::async_trait;

    struct FixedEmbedding;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedding {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, 0.0])
        }
        fn dimension(&self) -> usize {
            2
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    enum Source {
        Hits(Vec<ScoredHit>),
        Fail,
        Hang,
    }

    #[async_trait]
    impl VectorSearch for Source {
        async fn search(
            &self,
            _embedding: &[f32],
            _scope: Scope,
            _k: usize,
            _min_score: f32,
        ) -> Result<Vec<ScoredHit>, IndexError> {
            self.respond().await
        }
    }

    #[async_trait]
    impl KeywordSearch for Source {
        async fn search(
            &self,
            _text: &str,
            _scope: Scope,
            _k: usize,
        ) -> Result<Vec<ScoredHit>, IndexError> {
            self.respond().await
        }
    }

    impl Source {
        async fn respond(&self) -> Result<Vec<ScoredHit>, IndexError> {
            match self {
                Source::Hits(hits) => Ok(hits.clone()),
                Source::Fail => Err(IndexError::Unavailable("down".to_string())),
                Source::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Embeds after a fixed delay
    struct SlowEmbedding(Duration);

    #[async_trait]
    impl EmbeddingProvider for SlowEmbedding {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            tokio::time::sleep(self.0).await;
            Ok(vec![1.0, 0.0])
        }
        fn dimension(&self) -> usize {
            2
        }
        fn model_name(&self) -> &str {
            "slow"
        }
    }

    /// Vector index answering after a fixed delay
    struct SlowVectors(Duration);

    #[async_trait]
    impl VectorSearch for SlowVectors {
        async fn search(
            &self,
            _embedding: &[f32],
            _scope: Scope,
            _k: usize,
            _min_score: f32,
        ) -> Result<Vec<ScoredHit>, IndexError> {
            tokio::time::sleep(self.0).await;
            Ok(hits())
        }
    }

    fn retriever(vector: Source, keyword: Source) -> HybridRetriever {
        let mut config = Config::default().retrieval;
        config.source_timeout = "50ms".to_string();
        HybridRetriever::new(
            Arc::new(FixedEmbedding),
            Arc::new(vector),
            Arc::new(keyword),
            &config,
        )
        .unwrap()
    }

    fn hits() -> Vec<ScoredHit> {
        vec![
            ScoredHit::new("42_0", 42, 0.9),
            ScoredHit::new("42_1", 42, 0.6),
            ScoredHit::new("7_0", 7, 0.8),
        ]
    }

    #[tokio::test]
    async fn test_scope_is_enforced() {
        let r = retriever(Source::Hits(hits()), Source::Hits(hits()));
        let outcome = r.retrieve("refund", Scope::Document(42), 30).await.unwrap();
        assert_eq!(outcome.candidates.len(), 2);
        assert!(outcome.candidates.iter().all(|c| c.document_id == 42));
        assert!(outcome.flags.is_empty());
    }

    #[tokio::test]
    async fn test_truncates_to_top_k() {
        let r = retriever(Source::Hits(hits()), Source::Hits(hits()));
        let outcome = r.retrieve("refund", Scope::Corpus, 2).await.unwrap();
        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(outcome.candidates[0].fragment_id, "42_0");
    }

    #[tokio::test]
    async fn test_degrades_to_keyword_only() {
        let r = retriever(Source::Fail, Source::Hits(hits()));
        let outcome = r.retrieve("refund", Scope::Corpus, 30).await.unwrap();
        assert_eq!(outcome.flags, vec![QueryFlag::KeywordOnly]);
        assert_eq!(outcome.candidates.len(), 3);
        assert!((outcome.candidates[0].fused_score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_vector_only() {
        let r = retriever(Source::Hits(hits()), Source::Hang);
        let outcome = r.retrieve("refund", Scope::Corpus, 30).await.unwrap();
        assert_eq!(outcome.flags, vec![QueryFlag::VectorOnly]);
        assert!(outcome.degraded_reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_both_sources_failing() {
        let r = retriever(Source::Fail, Source::Hang);
        match r.retrieve("refund", Scope::Corpus, 30).await {
            Err(SearchError::Unavailable { reasons }) => assert_eq!(reasons.len(), 2),
            other => panic!("expected unavailable, got {:?}", other.map(|o| o.candidates)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_vector_side_shares_one_deadline() {
        let mut config = Config::default().retrieval;
        config.source_timeout = "100ms".to_string();
        // Each step fits the bound on its own, together they do not
        let r = HybridRetriever::new(
            Arc::new(SlowEmbedding(Duration::from_millis(70))),
            Arc::new(SlowVectors(Duration::from_millis(70))),
            Arc::new(Source::Hits(hits())),
            &config,
        )
        .unwrap();

        let started = tokio::time::Instant::now();
        let outcome = r.retrieve("refund", Scope::Corpus, 30).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(140));
        assert_eq!(outcome.flags, vec![QueryFlag::KeywordOnly]);
        assert!(outcome.degraded_reason.unwrap().contains("timed out after 100ms"));
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let r = retriever(Source::Hits(hits()), Source::Hits(hits()));
        assert!(matches!(
            r.retrieve("   ", Scope::Corpus, 30).await,
            Err(SearchError::InvalidQuery(_))
        ));
    }
}
