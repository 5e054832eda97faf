//! Retrieval-only search: fused candidates with their scores, no generation

use super::{new_correlation_id, QueryPipeline, QueryRequest};
use crate::error::{Result, SmartChatError};
use crate::retrieval::FusionMethod;
use crate::types::{DocumentId, FragmentId, QueryFlag, Scope};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub scope: Scope,
    /// Defaults to `retrieval.final_k`, capped at `retrieval.top_k_initial`
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            scope: Scope::Corpus,
            limit: None,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One fused candidate and the fragment behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub fragment_id: FragmentId,
    pub document_id: DocumentId,
    pub position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_header: Option<String>,
    pub text: String,
    pub vector_score: f32,
    pub keyword_score: f32,
    pub hybrid_score: f32,
}

/// Fusion settings a search ran under
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionSummary {
    pub method: FusionMethod,
    /// Vector weight actually applied: 0 or 1 when one source was skipped
    pub alpha: f32,
    pub rrf_k: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub correlation_id: String,
    pub results: Vec<SearchHit>,
    pub fusion: FusionSummary,
    #[serde(default)]
    pub flags: Vec<QueryFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    pub latency_ms: u64,
}

impl QueryPipeline {
    /// Hybrid retrieval for `request`, hydrated, without reranking or generation
    ///
    /// Goes through the retrieval cache and the document-status check exactly
    /// like a query does.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let started_at = Instant::now();
        let correlation_id = new_correlation_id();

        let query = QueryRequest::new(request.query.as_str()).with_scope(request.scope);
        query.validate()?;
        let limit = match request.limit {
            Some(0) => {
                return Err(SmartChatError::InvalidQuery(
                    "Search limit must be greater than 0".to_string(),
                ))
            }
            Some(limit) => limit,
            None => self.final_k,
        }
        .min(self.top_k_initial.max(1));

        let outcome = self.retrieve(&query, &correlation_id).await?;
        let candidates = &outcome.candidates[..outcome.candidates.len().min(limit)];
        let fragments = self.hydrate(candidates, &correlation_id).await?;

        let results: Vec<SearchHit> = candidates
            .iter()
            .filter_map(|c| {
                let fragment = fragments.get(&c.fragment_id)?;
                Some(SearchHit {
                    fragment_id: c.fragment_id.clone(),
                    document_id: c.document_id,
                    position: fragment.position,
                    section_header: fragment.section_header.clone(),
                    text: fragment.text.clone(),
                    vector_score: c.vector_score,
                    keyword_score: c.keyword_score,
                    hybrid_score: c.fused_score,
                })
            })
            .collect();

        let fusion = self.retriever.fusion();
        let alpha = if outcome.flags.contains(&QueryFlag::KeywordOnly) {
            0.0
        } else if outcome.flags.contains(&QueryFlag::VectorOnly) {
            1.0
        } else {
            fusion.alpha
        };

        let latency_ms = started_at.elapsed().as_millis() as u64;
        info!(
            correlation_id = %correlation_id,
            scope = %request.scope,
            "Search returned {} results in {} ms",
            results.len(),
            latency_ms
        );

        Ok(SearchResponse {
            correlation_id,
            results,
            fusion: FusionSummary {
                method: fusion.method,
                alpha,
                rrf_k: fusion.rrf_k,
            },
            flags: outcome.flags,
            degraded_reason: outcome.degraded_reason,
            latency_ms,
        })
    }
}
