//! Second-pass relevance scoring of fused candidates

use crate::config::{duration_or, RerankConfig};
use crate::index::tokenize;
use crate::retrieval::compare_candidates;
use crate::types::{FragmentSet, RankedFragment, RetrievalCandidate};
use async_trait::async_trait;
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum RerankError {
    #[error("Reranker initialization failed: {0}")]
    InitializationError(String),

    #[error("Reranking failed: {0}")]
    RerankingError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Scorer returned {actual} scores for {expected} texts")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Scorer timed out after {0:?}")]
    Timeout(Duration),
}

/// Scores `(query, text)` pairs independently of the retrieval embedding space
#[async_trait]
pub trait RerankScorer: Send + Sync {
    /// One score per text, in input order
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, RerankError>;

    fn name(&self) -> &str;
}

/// Cross-encoder scorer backed by FastEmbed
pub struct CrossEncoderScorer {
    model: Arc<TextRerank>,
    model_name: String,
}

impl CrossEncoderScorer {
    /// Create a new scorer with the specified model
    ///
    /// Models are downloaded on first use. Supported:
    /// - BAAI/bge-reranker-base
    /// - BAAI/bge-reranker-v2-m3
    /// - jinaai/jina-reranker-v1-turbo-en
    pub fn new(model_name: &str) -> Result<Self, RerankError> {
        let model = match model_name {
            "BAAI/bge-reranker-base" => RerankerModel::BGERerankerBase,
            "BAAI/bge-reranker-v2-m3" => RerankerModel::BGERerankerV2M3,
            "jinaai/jina-reranker-v1-turbo-en" => RerankerModel::JINARerankerV1TurboEn,
            _ => {
                return Err(RerankError::InitializationError(format!(
                    "Unsupported reranker model: {}",
                    model_name
                )))
            }
        };

        tracing::info!("Initializing reranker model: {}", model_name);

        let init_options = RerankInitOptions::new(model).with_show_download_progress(false);
        let model = TextRerank::try_new(init_options)
            .map_err(|e| RerankError::InitializationError(e.to_string()))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: model_name.to_string(),
        })
    }

    /// Create scorer with default model
    pub fn with_default_model() -> Result<Self, RerankError> {
        Self::new("BAAI/bge-reranker-base")
    }
}

#[async_trait]
impl RerankScorer for CrossEncoderScorer {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, RerankError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        if query.is_empty() {
            return Err(RerankError::InvalidInput(
                "Query cannot be empty".to_string(),
            ));
        }

        let model = self.model.clone();
        let query = query.to_string();
        let documents = texts.to_vec();
        let count = documents.len();

        let results = tokio::task::spawn_blocking(move || model.rerank(query, documents, false, None))
            .await
            .map_err(|e| RerankError::RerankingError(e.to_string()))?
            .map_err(|e| RerankError::RerankingError(e.to_string()))?;

        // Results come back sorted by score; restore input order
        let mut scores = vec![f32::NEG_INFINITY; count];
        let mut filled = 0;
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
                filled += 1;
            }
        }
        if filled != count {
            return Err(RerankError::LengthMismatch {
                expected: count,
                actual: filled,
            });
        }

        Ok(scores)
    }

    fn name(&self) -> &str {
        &self.model_name
    }
}

/// Lexical scorer: share of query terms present in the text
///
/// Needs no model, so it also serves offline runs.
#[derive(Debug, Default)]
pub struct TermOverlapScorer;

#[async_trait]
impl RerankScorer for TermOverlapScorer {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, RerankError> {
        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
        if query_terms.is_empty() {
            return Err(RerankError::InvalidInput(
                "Query has no scorable terms".to_string(),
            ));
        }

        Ok(texts
            .iter()
            .map(|text| {
                let terms: HashSet<String> = tokenize(text).into_iter().collect();
                let shared = query_terms.intersection(&terms).count();
                shared as f32 / query_terms.len() as f32
            })
            .collect())
    }

    fn name(&self) -> &str {
        "term_overlap"
    }
}

/// Ranked output plus whether the scorer had to be bypassed
#[derive(Debug, Clone, Default)]
pub struct RerankOutcome {
    pub ranked: Vec<RankedFragment>,
    pub degraded: bool,
}

/// Reranker applying a scorer with a bounded wait and fused-order fallback
pub struct Reranker {
    scorer: Option<Arc<dyn RerankScorer>>,
    timeout: Duration,
}

impl Reranker {
    pub fn new(scorer: Arc<dyn RerankScorer>, timeout: Duration) -> Self {
        Self {
            scorer: Some(scorer),
            timeout,
        }
    }

    /// Reranker that keeps fused order
    pub fn disabled() -> Self {
        Self {
            scorer: None,
            timeout: Duration::ZERO,
        }
    }

    /// Build the configured scorer
    pub fn from_config(config: &RerankConfig) -> Result<Self, RerankError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }

        let timeout = duration_or(&config.timeout, Duration::from_secs(3));
        let scorer: Arc<dyn RerankScorer> = match config.scorer.as_str() {
            "cross_encoder" => Arc::new(CrossEncoderScorer::new(&config.model)?),
            "term_overlap" => Arc::new(TermOverlapScorer),
            other => {
                return Err(RerankError::InitializationError(format!(
                    "Unknown scorer: {}",
                    other
                )))
            }
        };
        Ok(Self::new(scorer, timeout))
    }

    pub fn is_enabled(&self) -> bool {
        self.scorer.is_some()
    }

    /// Rerank `candidates` (in fused order) down to at most `final_k` fragments
    ///
    /// Candidates without a resolved fragment in `fragments` are dropped. On
    /// scorer failure the fused order is kept and the outcome is marked degraded.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: &[RetrievalCandidate],
        fragments: &FragmentSet,
        final_k: usize,
    ) -> RerankOutcome {
        let mut present: Vec<&RetrievalCandidate> = candidates
            .iter()
            .filter(|c| fragments.contains_key(&c.fragment_id))
            .collect();
        present.sort_by(|a, b| compare_candidates(a, b));

        if present.is_empty() || final_k == 0 {
            return RerankOutcome::default();
        }

        let Some(scorer) = &self.scorer else {
            return RerankOutcome {
                ranked: Self::fused_order(&present, final_k),
                degraded: false,
            };
        };

        let texts: Vec<String> = present
            .iter()
            .filter_map(|c| fragments.get(&c.fragment_id).map(|f| f.text.clone()))
            .collect();

        let scores = match tokio::time::timeout(self.timeout, scorer.score(query, &texts)).await {
            Ok(Ok(scores)) if scores.len() == texts.len() => scores,
            Ok(Ok(scores)) => {
                let err = RerankError::LengthMismatch {
                    expected: texts.len(),
                    actual: scores.len(),
                };
                return Self::degrade(&present, final_k, scorer.name(), err);
            }
            Ok(Err(e)) => return Self::degrade(&present, final_k, scorer.name(), e),
            Err(_) => {
                return Self::degrade(
                    &present,
                    final_k,
                    scorer.name(),
                    RerankError::Timeout(self.timeout),
                )
            }
        };

        let mut scored: Vec<(&RetrievalCandidate, f32)> =
            present.into_iter().zip(scores).collect();
        scored.sort_by(|(a, sa), (b, sb)| sb.total_cmp(sa).then_with(|| compare_candidates(a, b)));
        scored.truncate(final_k);

        debug!("Reranked to {} fragments with {}", scored.len(), scorer.name());

        RerankOutcome {
            ranked: scored
                .into_iter()
                .enumerate()
                .map(|(i, (c, score))| RankedFragment {
                    fragment_id: c.fragment_id.clone(),
                    relevance_score: score,
                    rank: i + 1,
                })
                .collect(),
            degraded: false,
        }
    }

    fn degrade(
        present: &[&RetrievalCandidate],
        final_k: usize,
        scorer: &str,
        err: RerankError,
    ) -> RerankOutcome {
        warn!("Rerank scorer {} failed, keeping fused order: {}", scorer, err);
        RerankOutcome {
            ranked: Self::fused_order(present, final_k),
            degraded: true,
        }
    }

    fn fused_order(present: &[&RetrievalCandidate], final_k: usize) -> Vec<RankedFragment> {
        present
            .iter()
            .take(final_k)
            .enumerate()
            .map(|(i, c)| RankedFragment {
                fragment_id: c.fragment_id.clone(),
                relevance_score: c.fused_score,
                rank: i + 1,
            })
            .collect()
    }
}
