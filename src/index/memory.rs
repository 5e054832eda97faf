//! In-memory fragment corpus
//!
//! Serves every lookup by brute force: cosine similarity for vectors and a BM25
//! scan over the in-scope fragments for keywords. Suitable for local runs and
//! tests, not for large corpora.

use crate::embedding::{EmbeddingError, EmbeddingProvider};
use crate::error::{Result, SmartChatError};
use crate::index::{
    tokenize, DocumentCatalog, FragmentStore, IndexError, KeywordSearch, ScoredHit, VectorSearch,
};
use crate::types::{DocumentId, DocumentMeta, DocumentStatus, Fragment, FragmentId, Scope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

const BM25_K1: f32 = 1.5;
const BM25_B: f32 = 0.75;

/// On-disk corpus format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorpusFile {
    #[serde(default)]
    pub documents: Vec<CorpusDocument>,
    pub fragments: Vec<CorpusFragment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusDocument {
    pub document_id: DocumentId,
    pub status: DocumentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusFragment {
    #[serde(flatten)]
    pub fragment: Fragment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Default)]
struct Inner {
    fragments: HashMap<FragmentId, Fragment>,
    embeddings: HashMap<FragmentId, Vec<f32>>,
    documents: HashMap<DocumentId, DocumentStatus>,
}

/// Fragment corpus held entirely in memory
#[derive(Default)]
pub struct MemoryCorpus {
    inner: RwLock<Inner>,
}

impl MemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a corpus from its file representation
    pub fn from_file(file: CorpusFile) -> Self {
        let mut inner = Inner::default();
        for doc in file.documents {
            inner.documents.insert(doc.document_id, doc.status);
        }
        for entry in file.fragments {
            inner
                .documents
                .entry(entry.fragment.document_id)
                .or_insert(DocumentStatus::Ready);
            if let Some(embedding) = entry.embedding {
                inner.embeddings.insert(entry.fragment.id.clone(), embedding);
            }
            inner.fragments.insert(entry.fragment.id.clone(), entry.fragment);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Load a corpus from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SmartChatError::Io {
            source: e,
            context: format!("Failed to read corpus file: {:?}", path),
        })?;
        let file: CorpusFile = serde_json::from_str(&content).map_err(|e| SmartChatError::Json {
            source: e,
            context: format!("Failed to parse corpus file: {:?}", path),
        })?;
        Ok(Self::from_file(file))
    }

    /// Insert or replace a fragment
    pub async fn insert(&self, fragment: Fragment, embedding: Option<Vec<f32>>) {
        let mut inner = self.inner.write().await;
        inner
            .documents
            .entry(fragment.document_id)
            .or_insert(DocumentStatus::Ready);
        if let Some(embedding) = embedding {
            inner.embeddings.insert(fragment.id.clone(), embedding);
        }
        inner.fragments.insert(fragment.id.clone(), fragment);
    }

    pub async fn set_document_status(&self, document_id: DocumentId, status: DocumentStatus) {
        self.inner.write().await.documents.insert(document_id, status);
    }

    /// Remove a document and all its fragments, returning the fragment count removed
    pub async fn remove_document(&self, document_id: DocumentId) -> usize {
        let mut inner = self.inner.write().await;
        let ids: Vec<FragmentId> = inner
            .fragments
            .values()
            .filter(|f| f.document_id == document_id)
            .map(|f| f.id.clone())
            .collect();
        for id in &ids {
            inner.fragments.remove(id);
            inner.embeddings.remove(id);
        }
        inner.documents.insert(document_id, DocumentStatus::Deleted);
        debug!("Removed document {} ({} fragments)", document_id, ids.len());
        ids.len()
    }

    /// Embed every fragment that has no vector yet
    pub async fn embed_missing(
        &self,
        provider: &dyn EmbeddingProvider,
    ) -> std::result::Result<usize, EmbeddingError> {
        let pending: Vec<(FragmentId, String)> = {
            let inner = self.inner.read().await;
            let mut pending: Vec<(FragmentId, String)> = inner
                .fragments
                .values()
                .filter(|f| !inner.embeddings.contains_key(&f.id))
                .map(|f| (f.id.clone(), f.text.clone()))
                .collect();
            pending.sort();
            pending
        };

        let mut embedded = 0;
        for (id, text) in pending {
            let embedding = provider.embed(&text).await?;
            self.inner.write().await.embeddings.insert(id, embedding);
            embedded += 1;
        }
        Ok(embedded)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.fragments.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.fragments.is_empty()
    }

    /// Compute cosine similarity between two vectors
    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot / (norm_a * norm_b)
    }
}

fn sort_hits(hits: &mut Vec<ScoredHit>, k: usize) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.fragment_id.cmp(&b.fragment_id))
    });
    hits.truncate(k);
}

#[async_trait]
impl VectorSearch for MemoryCorpus {
    async fn search(
        &self,
        embedding: &[f32],
        scope: Scope,
        k: usize,
        min_score: f32,
    ) -> std::result::Result<Vec<ScoredHit>, IndexError> {
        let inner = self.inner.read().await;
        let mut hits: Vec<ScoredHit> = inner
            .fragments
            .values()
            .filter(|f| scope.contains(f.document_id))
            .filter_map(|f| {
                let stored = inner.embeddings.get(&f.id)?;
                let score = Self::cosine_similarity(embedding, stored);
                (score >= min_score).then(|| ScoredHit::new(f.id.clone(), f.document_id, score))
            })
            .collect();
        sort_hits(&mut hits, k);
        Ok(hits)
    }
}

#[async_trait]
impl KeywordSearch for MemoryCorpus {
    async fn search(
        &self,
        text: &str,
        scope: Scope,
        k: usize,
    ) -> std::result::Result<Vec<ScoredHit>, IndexError> {
        let query_terms: HashSet<String> = tokenize(text).into_iter().collect();
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let inner = self.inner.read().await;
        let docs: Vec<(&Fragment, Vec<String>)> = inner
            .fragments
            .values()
            .filter(|f| scope.contains(f.document_id))
            .map(|f| (f, tokenize(&f.text)))
            .collect();
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let total = docs.len() as f32;
        let avg_len = docs.iter().map(|(_, t)| t.len()).sum::<usize>() as f32 / total;

        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for (_, terms) in &docs {
            let unique: HashSet<&str> = terms.iter().map(|t| t.as_str()).collect();
            for term in unique {
                if query_terms.contains(term) {
                    *doc_freq.entry(term).or_insert(0) += 1;
                }
            }
        }

        let mut hits = Vec::new();
        for (fragment, terms) in &docs {
            let len = terms.len() as f32;
            let mut score = 0.0;
            for term in &query_terms {
                let tf = terms.iter().filter(|t| *t == term).count() as f32;
                if tf == 0.0 {
                    continue;
                }
                let df = doc_freq.get(term.as_str()).copied().unwrap_or(0) as f32;
                let idf = (1.0 + (total - df + 0.5) / (df + 0.5)).ln();
                let norm = if avg_len > 0.0 { len / avg_len } else { 1.0 };
                score += idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * norm));
            }
            if score > 0.0 {
                hits.push(ScoredHit::new(fragment.id.clone(), fragment.document_id, score));
            }
        }
        sort_hits(&mut hits, k);
        Ok(hits)
    }
}

#[async_trait]
impl FragmentStore for MemoryCorpus {
    async fn fragments(&self, ids: &[FragmentId]) -> std::result::Result<Vec<Fragment>, IndexError> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.fragments.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl DocumentCatalog for MemoryCorpus {
    async fn document(
        &self,
        document_id: DocumentId,
    ) -> std::result::Result<Option<DocumentMeta>, IndexError> {
        let inner = self.inner.read().await;
        Ok(inner.documents.get(&document_id).map(|status| DocumentMeta {
            document_id,
            status: *status,
            fragment_count: inner
                .fragments
                .values()
                .filter(|f| f.document_id == document_id)
                .count(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(id: &str, document_id: DocumentId, text: &str) -> Fragment {
        Fragment {
            id: id.to_string(),
            document_id,
            text: text.to_string(),
            embedding_ref: None,
            position: 0,
            token_count: text.len() / 4,
            section_header: None,
        }
    }

    async fn corpus() -> MemoryCorpus {
        let corpus = MemoryCorpus::new();
        corpus
            .insert(
                fragment("42_0", 42, "Refund policy: refunds are issued within 30 days."),
                Some(vec![1.0, 0.0]),
            )
            .await;
        corpus
            .insert(
                fragment("42_1", 42, "Shipping takes five business days."),
                Some(vec![0.0, 1.0]),
            )
            .await;
        corpus
            .insert(
                fragment("7_0", 7, "Our refund desk is closed on weekends."),
                Some(vec![0.9, 0.1]),
            )
            .await;
        corpus
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("What is the Refund-policy? A"),
            vec!["what", "is", "the", "refund", "policy"]
        );
    }

    #[tokio::test]
    async fn test_keyword_search_respects_scope() {
        let corpus = corpus().await;

        let all = KeywordSearch::search(&corpus, "refund", Scope::Corpus, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let scoped = KeywordSearch::search(&corpus, "refund", Scope::Document(42), 10)
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].fragment_id, "42_0");
    }

    #[tokio::test]
    async fn test_vector_search_orders_by_similarity() {
        let corpus = corpus().await;
        let hits = VectorSearch::search(&corpus, &[1.0, 0.0], Scope::Corpus, 10, 0.1)
            .await
            .unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.fragment_id.as_str()).collect();
        assert_eq!(ids, vec!["42_0", "7_0"]);
    }

    #[tokio::test]
    async fn test_remove_document() {
        let corpus = corpus().await;
        assert_eq!(corpus.remove_document(42).await, 2);
        assert_eq!(corpus.len().await, 1);

        let meta = corpus.document(42).await.unwrap().unwrap();
        assert_eq!(meta.status, DocumentStatus::Deleted);
        assert!(!meta.is_searchable());
    }

    #[test]
    fn test_corpus_file_parsing() {
        let json = r#"{
            "fragments": [
                {"id": "1_0", "document_id": 1, "text": "hello world", "position": 0,
                 "token_count": 2, "embedding": [0.5, 0.5]}
            ]
        }"#;
        let file: CorpusFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.fragments.len(), 1);
        assert_eq!(file.fragments[0].embedding.as_ref().unwrap().len(), 2);
    }
}
