//! Shared data model for the dialogue core
//!
//! Fragments are owned by ingestion; everything else here is produced per query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of a fragment (stable across ingestion runs)
pub type FragmentId = String;

/// Identifier of a source document
pub type DocumentId = u64;

/// Fragments resolved for one query, keyed by id
pub type FragmentSet = HashMap<FragmentId, Fragment>;

/// Immutable chunk of source text with an associated embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    pub document_id: DocumentId,
    pub text: String,
    /// Reference into the vector store, if the fragment was embedded
    #[serde(default)]
    pub embedding_ref: Option<String>,
    /// Position of the fragment within its document
    pub position: u32,
    pub token_count: usize,
    #[serde(default)]
    pub section_header: Option<String>,
}

/// The subset of fragments a query may search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Every fragment of the corpus
    #[default]
    Corpus,
    /// Only fragments of one document
    Document(DocumentId),
}

impl Scope {
    /// Whether a fragment of `document_id` may appear under this scope
    pub fn contains(&self, document_id: DocumentId) -> bool {
        match self {
            Scope::Corpus => true,
            Scope::Document(id) => *id == document_id,
        }
    }

    /// Key segment used by the cache layer (`doc:42` or `all`)
    pub fn key_segment(&self) -> String {
        match self {
            Scope::Corpus => "all".to_string(),
            Scope::Document(id) => format!("doc:{}", id),
        }
    }

    pub fn document_id(&self) -> Option<DocumentId> {
        match self {
            Scope::Corpus => None,
            Scope::Document(id) => Some(*id),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key_segment())
    }
}

/// Fused candidate produced by the hybrid retriever
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub fragment_id: FragmentId,
    pub document_id: DocumentId,
    pub vector_score: f32,
    pub keyword_score: f32,
    pub fused_score: f32,
}

/// Candidate after the second-pass relevance scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedFragment {
    pub fragment_id: FragmentId,
    pub relevance_score: f32,
    /// 1-based rank
    pub rank: usize,
}

/// Source reference attached to an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub fragment_id: FragmentId,
    /// Label as it appears in the prompt and answer, e.g. `[2]`
    pub label: String,
    pub document_id: DocumentId,
    pub position: u32,
    pub snippet: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One caller-owned turn of conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
        }
    }
}

/// Degradations and provenance markers recorded on a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFlag {
    /// Vector source failed, keyword results only
    KeywordOnly,
    /// Keyword source failed, vector results only
    VectorOnly,
    /// Rerank scorer failed, fused order used
    RerankDegraded,
    /// No fragment fit the budget, answered from history alone
    ContextTooLarge,
    /// The top fragment was cut to fit the budget
    ContextTruncated,
    /// Oldest history turns were dropped
    HistoryTruncated,
    ServedFromCache,
}

/// Token usage reported by a provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
}

/// Terminal result of one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(rename = "response")]
    pub answer_text: String,
    pub citations: Vec<Citation>,
    pub fragments_found: usize,
    pub fragments_used: usize,
    pub provider_used: String,
    pub model_name: String,
    #[serde(rename = "processing_time_ms")]
    pub latency_ms: u64,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<QueryFlag>,
}

impl QueryResult {
    pub fn has_flag(&self, flag: QueryFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Processing status of a document, as reported by the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Processing,
    Ready,
    Failed,
    Deleted,
}

/// Cached per-document metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub document_id: DocumentId,
    pub status: DocumentStatus,
    pub fragment_count: usize,
}

impl DocumentMeta {
    /// Whether a query against this document can find anything
    pub fn is_searchable(&self) -> bool {
        self.status == DocumentStatus::Ready && self.fragment_count > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Updated,
    Deleted,
}

/// Document mutation notice consumed by cache invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEvent {
    pub document_id: DocumentId,
    pub kind: MutationKind,
}
