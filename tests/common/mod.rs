//! Shared fixtures for integration tests: a small two-document corpus, a
//! bag-of-words embedder, scripted providers, a counting keyword source and a
//! retrieval source that is always down.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use smartchat::cache::CacheManager;
use smartchat::config::Config;
use smartchat::context::ContextAssembler;
use smartchat::embedding::{EmbeddingError, EmbeddingProvider};
use smartchat::index::{
    tokenize, IndexError, KeywordSearch, MemoryCorpus, ScoredHit, VectorSearch,
};
use smartchat::llm::{
    DeltaStream, Generation, GenerationRequest, LlmOrchestrator, LlmProvider, ProviderError,
};
use smartchat::pipeline::QueryPipeline;
use smartchat::retrieval::{HybridRetriever, Reranker, TermOverlapScorer};
use smartchat::types::{Fragment, Scope};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DIMENSION: usize = 64;

/// Hashes terms into a fixed number of buckets
pub struct BagOfWords;

#[async_trait]
impl EmbeddingProvider for BagOfWords {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0; DIMENSION];
        for term in tokenize(text) {
            let bucket = term
                .bytes()
                .fold(7u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64));
            vector[(bucket % DIMENSION as u64) as usize] += 1.0;
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn model_name(&self) -> &str {
        "bag-of-words"
    }
}

/// Provider replaying a fixed script
pub struct Scripted {
    name: &'static str,
    script: Result<Vec<String>, ProviderError>,
    pub calls: AtomicUsize,
}

impl Scripted {
    pub fn answering(name: &'static str, deltas: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name,
            script: Ok(deltas.iter().map(|d| d.to_string()).collect()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(name: &'static str, err: ProviderError) -> Arc<Self> {
        Arc::new(Self {
            name,
            script: Err(err),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn model_name(&self) -> &str {
        "scripted-1"
    }

    async fn healthcheck(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<Generation, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Ok(deltas) => Ok(Generation {
                text: deltas.concat(),
                usage: None,
            }),
            Err(e) => Err(e.clone()),
        }
    }

    async fn generate_stream(
        &self,
        _request: &GenerationRequest,
    ) -> Result<DeltaStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Ok(deltas) => Ok(stream::iter(deltas.clone().into_iter().map(Ok)).boxed()),
            Err(e) => Err(e.clone()),
        }
    }
}

/// Keyword source that counts how often retrieval reached it
pub struct CountingKeywords {
    corpus: Arc<MemoryCorpus>,
    pub searches: AtomicUsize,
}

impl CountingKeywords {
    pub fn new(corpus: Arc<MemoryCorpus>) -> Arc<Self> {
        Arc::new(Self {
            corpus,
            searches: AtomicUsize::new(0),
        })
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeywordSearch for CountingKeywords {
    async fn search(
        &self,
        text: &str,
        scope: Scope,
        k: usize,
    ) -> Result<Vec<ScoredHit>, IndexError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        KeywordSearch::search(self.corpus.as_ref(), text, scope, k).await
    }
}

/// Vector and keyword source that is always unavailable
pub struct FailingSource(pub &'static str);

impl FailingSource {
    pub fn new(reason: &'static str) -> Arc<Self> {
        Arc::new(Self(reason))
    }
}

#[async_trait]
impl VectorSearch for FailingSource {
    async fn search(
        &self,
        _embedding: &[f32],
        _scope: Scope,
        _k: usize,
        _min_score: f32,
    ) -> Result<Vec<ScoredHit>, IndexError> {
        Err(IndexError::Unavailable(self.0.to_string()))
    }
}

#[async_trait]
impl KeywordSearch for FailingSource {
    async fn search(
        &self,
        _text: &str,
        _scope: Scope,
        _k: usize,
    ) -> Result<Vec<ScoredHit>, IndexError> {
        Err(IndexError::Unavailable(self.0.to_string()))
    }
}

fn fragment(id: &str, document_id: u64, position: u32, text: &str) -> Fragment {
    Fragment {
        id: id.to_string(),
        document_id,
        text: text.to_string(),
        embedding_ref: None,
        position,
        token_count: text.split_whitespace().count(),
        section_header: None,
    }
}

/// Document 42 covers refunds, document 7 covers shipping
pub async fn corpus() -> Arc<MemoryCorpus> {
    let corpus = Arc::new(MemoryCorpus::new());
    let fragments = [
        fragment(
            "42-0",
            42,
            0,
            "Our refund policy allows a full refund within 30 days of purchase.",
        ),
        fragment(
            "42-1",
            42,
            1,
            "Refund requests must include the order number and the original receipt.",
        ),
        fragment(
            "42-2",
            42,
            2,
            "Digital goods are not eligible for a refund once downloaded.",
        ),
        fragment(
            "7-0",
            7,
            0,
            "Standard shipping takes five business days within the country.",
        ),
        fragment(
            "7-1",
            7,
            1,
            "Express shipping is available for an additional fee.",
        ),
    ];
    for f in fragments {
        corpus.insert(f, None).await;
    }
    corpus
        .embed_missing(&BagOfWords)
        .await
        .expect("bag of words never fails");
    corpus
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.rerank.scorer = "term_overlap".to_string();
    config.llm.stream_batch_chars = 0;
    config.retrieval.top_k_initial = 30;
    config.retrieval.final_k = 10;
    config
}

/// Pipeline wired over the shared corpus with the given providers, in priority order
pub fn pipeline(
    config: &Config,
    corpus: Arc<MemoryCorpus>,
    keywords: Arc<CountingKeywords>,
    providers: Vec<Arc<dyn LlmProvider>>,
) -> Arc<QueryPipeline> {
    pipeline_over(config, corpus.clone(), corpus, keywords, providers)
}

/// Pipeline over explicit retrieval sources; fragments still come from `corpus`
pub fn pipeline_over(
    config: &Config,
    corpus: Arc<MemoryCorpus>,
    vectors: Arc<dyn VectorSearch>,
    keywords: Arc<dyn KeywordSearch>,
    providers: Vec<Arc<dyn LlmProvider>>,
) -> Arc<QueryPipeline> {
    let retriever =
        HybridRetriever::new(Arc::new(BagOfWords), vectors, keywords, &config.retrieval)
            .expect("valid retrieval config");
    let reranker = Reranker::new(Arc::new(TermOverlapScorer), Duration::from_secs(1));
    let assembler = ContextAssembler::new(&config.context).expect("valid context config");
    let orchestrator = Arc::new(LlmOrchestrator::new(providers, &config.llm));
    let cache = Arc::new(CacheManager::from_config(&config.cache));

    Arc::new(
        QueryPipeline::new(
            retriever,
            reranker,
            assembler,
            orchestrator,
            cache,
            corpus.clone(),
            config,
        )
        .with_catalog(corpus),
    )
}
