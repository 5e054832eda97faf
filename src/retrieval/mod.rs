//! Hybrid Retrieval & Reranking
//!
//! This module fuses vector and keyword search results into one
//! deterministic candidate list, then rescores it with an independent
//! cross-encoder-style scorer.

mod deduplication;
mod fusion;
mod hybrid;
mod reranker;

pub use deduplication::deduplicate_candidates;
pub use fusion::{
    fuse, reciprocal_rank_fusion, sort_candidates, weighted_fusion, FusionConfig, FusionError,
    FusionMethod,
};
pub(crate) use fusion::compare_candidates;
pub use hybrid::{HybridRetriever, RetrievalOutcome, SearchError};
pub use reranker::{
    CrossEncoderScorer, RerankError, RerankOutcome, RerankScorer, Reranker, TermOverlapScorer,
};
