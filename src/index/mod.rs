//! Collaborator seams for fragment lookup
//!
//! Vector and keyword indexes, the fragment store and the document catalog are
//! owned by ingestion. The dialogue core only consumes them through these
//! traits. [`MemoryCorpus`] implements all four over an in-memory fragment set
//! for local runs and tests.

mod memory;

pub use memory::{CorpusDocument, CorpusFile, CorpusFragment, MemoryCorpus};

use crate::types::{DocumentId, DocumentMeta, Fragment, FragmentId, Scope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum IndexError {
    #[error("Index unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// A scored hit returned by either retrieval source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredHit {
    pub fragment_id: FragmentId,
    pub document_id: DocumentId,
    pub score: f32,
}

impl ScoredHit {
    pub fn new(fragment_id: impl Into<FragmentId>, document_id: DocumentId, score: f32) -> Self {
        Self {
            fragment_id: fragment_id.into(),
            document_id,
            score,
        }
    }
}

/// Vector similarity query: `(embedding, scope, k) -> [(fragment_id, score)]`
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(
        &self,
        embedding: &[f32],
        scope: Scope,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredHit>, IndexError>;
}

/// Keyword relevance query: `(text, scope, k) -> [(fragment_id, score)]`
#[async_trait]
pub trait KeywordSearch: Send + Sync {
    async fn search(&self, text: &str, scope: Scope, k: usize)
        -> Result<Vec<ScoredHit>, IndexError>;
}

/// Fragment hydration by id. Unknown ids are skipped, not errors.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    async fn fragments(&self, ids: &[FragmentId]) -> Result<Vec<Fragment>, IndexError>;
}

/// Document status lookup backing the document-metadata cache
#[async_trait]
pub trait DocumentCatalog: Send + Sync {
    async fn document(&self, document_id: DocumentId) -> Result<Option<DocumentMeta>, IndexError>;
}

/// Lowercased alphanumeric terms of at least two chars
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}
