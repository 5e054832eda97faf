//! Score fusion for combining vector and keyword hit lists

use crate::config::RetrievalConfig;
use crate::index::ScoredHit;
use crate::types::{DocumentId, FragmentId, RetrievalCandidate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FusionError {
    #[error("Invalid weight configuration: alpha must be within 0.0..=1.0, got {0}")]
    InvalidWeights(f32),

    #[error("Invalid RRF constant: k must be positive, got {0}")]
    InvalidRrfK(f32),

    #[error("Unknown fusion method: {0}")]
    UnknownMethod(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionMethod {
    /// `α·norm(vector) + (1-α)·norm(keyword)` with per-source max-normalization
    Weighted,
    /// Reciprocal Rank Fusion: `Σ weight / (k + rank)`
    Rrf,
}

/// Configuration for fusion algorithm
#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub method: FusionMethod,

    /// Weight of the vector source; the keyword source gets `1 - alpha`
    pub alpha: f32,

    /// RRF K constant (typically 60)
    pub rrf_k: f32,
}

impl FusionConfig {
    pub fn new(method: FusionMethod, alpha: f32, rrf_k: f32) -> Result<Self, FusionError> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(FusionError::InvalidWeights(alpha));
        }
        if rrf_k <= 0.0 {
            return Err(FusionError::InvalidRrfK(rrf_k));
        }

        Ok(Self {
            method,
            alpha,
            rrf_k,
        })
    }

    pub fn from_config(config: &RetrievalConfig) -> Result<Self, FusionError> {
        let method = match config.fusion_method.as_str() {
            "weighted" => FusionMethod::Weighted,
            "rrf" => FusionMethod::Rrf,
            other => return Err(FusionError::UnknownMethod(other.to_string())),
        };
        Self::new(method, config.alpha, config.rrf_k)
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            method: FusionMethod::Weighted,
            alpha: 0.7,
            rrf_k: 60.0,
        }
    }
}

#[derive(Default)]
struct Merged {
    document_id: DocumentId,
    vector_score: f32,
    keyword_score: f32,
    vector_rank: Option<usize>,
    keyword_rank: Option<usize>,
}

/// Merge both hit lists by fragment id
///
/// A fragment listed twice by the same source keeps its best score and rank.
/// Missing-source scores default to zero.
fn merge(vector_hits: &[ScoredHit], keyword_hits: &[ScoredHit]) -> HashMap<FragmentId, Merged> {
    let mut merged: HashMap<FragmentId, Merged> = HashMap::new();

    for (rank, hit) in vector_hits.iter().enumerate() {
        let entry = merged.entry(hit.fragment_id.clone()).or_default();
        entry.document_id = hit.document_id;
        if entry.vector_rank.is_none() || hit.score > entry.vector_score {
            entry.vector_score = hit.score;
        }
        entry.vector_rank.get_or_insert(rank + 1);
    }

    for (rank, hit) in keyword_hits.iter().enumerate() {
        let entry = merged.entry(hit.fragment_id.clone()).or_default();
        entry.document_id = hit.document_id;
        if entry.keyword_rank.is_none() || hit.score > entry.keyword_score {
            entry.keyword_score = hit.score;
        }
        entry.keyword_rank.get_or_insert(rank + 1);
    }

    merged
}

fn max_score(hits: &[ScoredHit]) -> f32 {
    hits.iter().map(|h| h.score).fold(0.0, f32::max)
}

fn normalize(score: f32, max: f32) -> f32 {
    if max > 0.0 {
        (score / max).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Weighted max-normalized fusion
pub fn weighted_fusion(
    vector_hits: &[ScoredHit],
    keyword_hits: &[ScoredHit],
    alpha: f32,
) -> Vec<RetrievalCandidate> {
    let vector_max = max_score(vector_hits);
    let keyword_max = max_score(keyword_hits);

    let mut results: Vec<RetrievalCandidate> = merge(vector_hits, keyword_hits)
        .into_iter()
        .map(|(fragment_id, m)| RetrievalCandidate {
            fused_score: alpha * normalize(m.vector_score, vector_max)
                + (1.0 - alpha) * normalize(m.keyword_score, keyword_max),
            fragment_id,
            document_id: m.document_id,
            vector_score: m.vector_score,
            keyword_score: m.keyword_score,
        })
        .collect();

    sort_candidates(&mut results);
    results
}

/// Apply Reciprocal Rank Fusion to combine two ranked lists
///
/// RRF formula: score(id) = sum over all rankings of: weight / (k + rank)
/// with `alpha` weighting the vector list and `1 - alpha` the keyword list.
/// Input lists must already be ordered best-first.
pub fn reciprocal_rank_fusion(
    vector_hits: &[ScoredHit],
    keyword_hits: &[ScoredHit],
    alpha: f32,
    rrf_k: f32,
) -> Vec<RetrievalCandidate> {
    let mut results: Vec<RetrievalCandidate> = merge(vector_hits, keyword_hits)
        .into_iter()
        .map(|(fragment_id, m)| {
            let vector_part = m
                .vector_rank
                .map(|r| alpha / (rrf_k + r as f32))
                .unwrap_or(0.0);
            let keyword_part = m
                .keyword_rank
                .map(|r| (1.0 - alpha) / (rrf_k + r as f32))
                .unwrap_or(0.0);
            RetrievalCandidate {
                fused_score: vector_part + keyword_part,
                fragment_id,
                document_id: m.document_id,
                vector_score: m.vector_score,
                keyword_score: m.keyword_score,
            }
        })
        .collect();

    sort_candidates(&mut results);
    results
}

/// Fuse with the configured method
pub fn fuse(
    vector_hits: &[ScoredHit],
    keyword_hits: &[ScoredHit],
    config: &FusionConfig,
) -> Vec<RetrievalCandidate> {
    match config.method {
        FusionMethod::Weighted => weighted_fusion(vector_hits, keyword_hits, config.alpha),
        FusionMethod::Rrf => {
            reciprocal_rank_fusion(vector_hits, keyword_hits, config.alpha, config.rrf_k)
        }
    }
}

/// Order by fused score desc, then vector score desc, then fragment id asc
pub fn sort_candidates(candidates: &mut [RetrievalCandidate]) {
    candidates.sort_by(compare_candidates);
}

pub(crate) fn compare_candidates(a: &RetrievalCandidate, b: &RetrievalCandidate) -> Ordering {
    b.fused_score
        .total_cmp(&a.fused_score)
        .then_with(|| b.vector_score.total_cmp(&a.vector_score))
        .then_with(|| a.fragment_id.cmp(&b.fragment_id))
}
