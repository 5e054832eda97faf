//! Cache key layout
//!
//! ```text
//! retrieval:{all|doc:<id>}:<hash(query, top_k)>
//! response:{all|doc:<id>}:<hash(query, provider, history)>
//! docmeta:<id>
//! ```

use crate::types::{ConversationTurn, DocumentId, Scope};
use serde::{Deserialize, Serialize};

pub const RETRIEVAL_PREFIX: &str = "retrieval";
pub const RESPONSE_PREFIX: &str = "response";
pub const DOCMETA_PREFIX: &str = "docmeta";

const EMPTY_HISTORY: &str = "no-history";
const AUTO_PROVIDER: &str = "auto";

/// Family of cache entries a clear or stats request addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    Retrieval,
    Response,
    #[serde(rename = "docmeta")]
    DocMeta,
    All,
}

impl CacheScope {
    /// Glob covering every key of this family
    pub fn pattern(&self) -> &'static str {
        match self {
            CacheScope::Retrieval => "retrieval:*",
            CacheScope::Response => "response:*",
            CacheScope::DocMeta => "docmeta:*",
            CacheScope::All => "*",
        }
    }
}

/// Trim, lowercase and collapse internal whitespace
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn hash_hex(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Stable digest of the conversation history that shaped an answer
pub fn history_hash(history: &[ConversationTurn]) -> String {
    if history.is_empty() {
        return EMPTY_HISTORY.to_string();
    }

    let mut hasher = blake3::Hasher::new();
    for turn in history {
        hasher.update(turn.role.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(turn.content.as_bytes());
        hasher.update(&[0]);
        if let Some(ts) = turn.timestamp {
            hasher.update(ts.to_rfc3339().as_bytes());
        }
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

pub fn retrieval_key(scope: Scope, query: &str, top_k: usize) -> String {
    let material = format!("{}\u{1f}{}", normalize_query(query), top_k);
    format!(
        "{}:{}:{}",
        RETRIEVAL_PREFIX,
        scope.key_segment(),
        hash_hex(&material)
    )
}

pub fn response_key(
    scope: Scope,
    query: &str,
    provider_preference: Option<&str>,
    history: &[ConversationTurn],
) -> String {
    let material = format!(
        "{}\u{1f}{}\u{1f}{}",
        normalize_query(query),
        provider_preference.unwrap_or(AUTO_PROVIDER),
        history_hash(history)
    );
    format!(
        "{}:{}:{}",
        RESPONSE_PREFIX,
        scope.key_segment(),
        hash_hex(&material)
    )
}

pub fn docmeta_key(document_id: DocumentId) -> String {
    format!("{}:{}", DOCMETA_PREFIX, document_id)
}

/// Entries scoped to one document under `prefix`
pub fn document_pattern(prefix: &str, document_id: DocumentId) -> String {
    format!("{}:doc:{}:*", prefix, document_id)
}

/// Corpus-wide entries under `prefix`
pub fn corpus_pattern(prefix: &str) -> String {
    format!("{}:all:*", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_normalize_query() {
        assert_eq!(
            normalize_query("  What is the   REFUND\tpolicy? "),
            "what is the refund policy?"
        );
    }

    #[test]
    fn test_retrieval_key_ignores_whitespace_and_case() {
        let a = retrieval_key(Scope::Document(42), "What is the refund policy?", 20);
        let b = retrieval_key(Scope::Document(42), "  what is the REFUND policy?", 20);
        assert_eq!(a, b);
        assert!(a.starts_with("retrieval:doc:42:"));

        let corpus = retrieval_key(Scope::Corpus, "What is the refund policy?", 20);
        assert!(corpus.starts_with("retrieval:all:"));
        assert_ne!(a, corpus);

        let wider = retrieval_key(Scope::Document(42), "What is the refund policy?", 50);
        assert_ne!(a, wider);
    }

    #[test]
    fn test_response_key_varies_with_provider_and_history() {
        let q = "What is the refund policy?";
        let base = response_key(Scope::Corpus, q, None, &[]);
        assert_eq!(base, response_key(Scope::Corpus, q, None, &[]));
        assert_ne!(base, response_key(Scope::Corpus, q, Some("claude"), &[]));

        let history = vec![ConversationTurn::new(Role::User, "hello")];
        assert_ne!(base, response_key(Scope::Corpus, q, None, &history));
    }

    #[test]
    fn test_history_hash_is_order_sensitive() {
        let a = vec![
            ConversationTurn::new(Role::User, "a"),
            ConversationTurn::new(Role::Assistant, "b"),
        ];
        let b = vec![
            ConversationTurn::new(Role::Assistant, "b"),
            ConversationTurn::new(Role::User, "a"),
        ];
        assert_ne!(history_hash(&a), history_hash(&b));
        assert_eq!(history_hash(&[]), EMPTY_HISTORY);
    }

    #[test]
    fn test_patterns() {
        assert_eq!(document_pattern(RETRIEVAL_PREFIX, 42), "retrieval:doc:42:*");
        assert_eq!(corpus_pattern(RESPONSE_PREFIX), "response:all:*");
        assert_eq!(docmeta_key(42), "docmeta:42");
        assert_eq!(CacheScope::All.pattern(), "*");
    }
}
