//! Result deduplication by fragment ID

use crate::types::{FragmentId, RetrievalCandidate};
use std::collections::HashSet;

/// Deduplicate candidates by fragment_id, keeping the first (highest-ranked) instance
///
/// # Arguments
/// * `candidates` - Candidates in rank order, potentially with duplicates
///
/// # Returns
/// Deduplicated candidates, maintaining rank order
pub fn deduplicate_candidates(candidates: Vec<RetrievalCandidate>) -> Vec<RetrievalCandidate> {
    let mut seen: HashSet<FragmentId> = HashSet::new();

    candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.fragment_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, fused: f32) -> RetrievalCandidate {
        RetrievalCandidate {
            fragment_id: id.to_string(),
            document_id: 42,
            vector_score: fused,
            keyword_score: 0.0,
            fused_score: fused,
        }
    }

    #[test]
    fn test_deduplication() {
        let candidates = vec![
            candidate("42_0", 0.9),
            candidate("42_1", 0.8),
            candidate("42_0", 0.7), // Duplicate
        ];

        let deduped = deduplicate_candidates(candidates);

        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].fragment_id, "42_0");
        assert_eq!(deduped[0].fused_score, 0.9); // Keeps first (highest score)
    }
}
