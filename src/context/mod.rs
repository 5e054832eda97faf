//! Prompt assembly
//!
//! Builds a token-bounded, citation-labeled prompt from ranked fragments and
//! the caller's conversation history. Fragments are labeled `[1]`, `[2]`, ...
//! in inclusion order; the labels used in the answer are later resolved back to
//! citations in first-use order.

mod citations;

pub use citations::{snippet, CitationEntry, CitationMap, CitationParser};

use crate::config::ContextConfig;
use crate::types::{Citation, ConversationTurn, FragmentSet, QueryFlag, RankedFragment};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Invalid citation pattern: {0}")]
    Pattern(#[from] regex::Error),
}

const INSTRUCTIONS: &str = "You are an intelligent assistant helping users understand documents. \
Answer the user's question based on the provided context from relevant document fragments.

IMPORTANT INSTRUCTIONS:
1. Answer based ONLY on the information provided in the context
2. Use the citation numbers [1], [2], etc. when referencing specific information
3. If the context doesn't contain enough information to answer the question, say so clearly
4. Provide a clear, well-structured response
5. Include relevant citations for key statements";

const NO_CONTEXT: &str = "(no document fragments fit within the context budget)";

/// Rough token estimate: one token per four chars, rounded up
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Prompt ready for generation
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub prompt: String,
    pub citation_map: CitationMap,
    pub flags: Vec<QueryFlag>,
    pub fragments_used: usize,
    pub history_used: usize,
}

/// Context assembler
pub struct ContextAssembler {
    token_budget: usize,
    history_budget: usize,
    max_history_turns: usize,
    parser: CitationParser,
}

impl ContextAssembler {
    pub fn new(config: &ContextConfig) -> Result<Self, ContextError> {
        Ok(Self {
            token_budget: config.token_budget,
            history_budget: config.history_budget,
            max_history_turns: config.max_history_turns,
            parser: CitationParser::new()?,
        })
    }

    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    /// Assemble a prompt for `query` within `token_budget`
    ///
    /// `ranked` must be in rank order; fragments missing from `fragments` are
    /// skipped. At least one fragment is included whenever any is available and
    /// the fragment budget is non-zero.
    pub fn assemble(
        &self,
        query: &str,
        ranked: &[RankedFragment],
        fragments: &FragmentSet,
        history: &[ConversationTurn],
        token_budget: usize,
    ) -> AssembledContext {
        let mut flags = Vec::new();

        let (history_lines, history_tokens) = self.select_history(history);
        if history_lines.len() < history.len() {
            flags.push(QueryFlag::HistoryTruncated);
        }

        let question = format!("USER QUESTION: {}", query);
        let fixed = estimate_tokens(INSTRUCTIONS) + estimate_tokens(&question) + history_tokens;
        let fragment_budget = token_budget.saturating_sub(fixed);

        let mut citation_map = CitationMap::default();
        let mut parts = Vec::new();
        let mut used = 0usize;

        let available: Vec<_> = ranked
            .iter()
            .filter_map(|r| fragments.get(&r.fragment_id))
            .collect();

        if fragment_budget == 0 {
            if !available.is_empty() {
                warn!(
                    "Context budget of {} tokens consumed by template and history, answering without fragments",
                    token_budget
                );
                flags.push(QueryFlag::ContextTooLarge);
            }
        } else {
            for fragment in available {
                if used + fragment.token_count <= fragment_budget {
                    let number = citation_map.push(fragment);
                    parts.push(format!("[{}] {}", number, fragment.text));
                    used += fragment.token_count;
                } else if citation_map.is_empty() {
                    // Top fragment alone is too large: keep its head
                    let text: String = fragment.text.chars().take(fragment_budget * 4).collect();
                    let number = citation_map.push(fragment);
                    parts.push(format!("[{}] {}", number, text));
                    used = fragment_budget;
                    flags.push(QueryFlag::ContextTruncated);
                    break;
                } else {
                    break;
                }
            }
        }

        let context = if parts.is_empty() {
            NO_CONTEXT.to_string()
        } else {
            parts.join("\n\n")
        };

        let mut prompt = format!("{}\n\nCONTEXT FROM DOCUMENTS:\n{}\n\n", INSTRUCTIONS, context);
        if !history_lines.is_empty() {
            prompt.push_str("CONVERSATION HISTORY:\n");
            for line in &history_lines {
                prompt.push_str(line);
                prompt.push('\n');
            }
            prompt.push('\n');
        }
        prompt.push_str(&question);
        prompt.push_str("\n\nASSISTANT: ");

        debug!(
            "Assembled context: {} fragments ({} tokens), {} history turns",
            citation_map.len(),
            used,
            history_lines.len()
        );

        AssembledContext {
            prompt,
            fragments_used: citation_map.len(),
            history_used: history_lines.len(),
            citation_map,
            flags,
        }
    }

    /// Most recent turns that fit the history budget, oldest first
    fn select_history(&self, history: &[ConversationTurn]) -> (Vec<String>, usize) {
        let start = history.len().saturating_sub(self.max_history_turns);
        let mut lines = Vec::new();
        let mut tokens = 0;

        for turn in history[start..].iter().rev() {
            let line = format!("{}: {}", turn.role.as_str().to_uppercase(), turn.content);
            let cost = estimate_tokens(&line);
            if tokens + cost > self.history_budget {
                break;
            }
            tokens += cost;
            lines.push(line);
        }

        lines.reverse();
        (lines, tokens)
    }

    /// Citations for a generated answer, in first-use order
    pub fn resolve_citations(&self, answer: &str, map: &CitationMap) -> Vec<Citation> {
        self.parser.resolve(answer, map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::{Fragment, Role};

    fn fragment(id: &str, tokens: usize) -> Fragment {
        Fragment {
            id: id.to_string(),
            document_id: 42,
            text: format!("{} {}", id, "word ".repeat(tokens)),
            embedding_ref: None,
            position: 0,
            token_count: tokens,
            section_header: None,
        }
    }

    fn setup(sizes: &[(&str, usize)]) -> (Vec<RankedFragment>, FragmentSet) {
        let ranked = sizes
            .iter()
            .enumerate()
            .map(|(i, (id, _))| RankedFragment {
                fragment_id: id.to_string(),
                relevance_score: 1.0 - i as f32 * 0.1,
                rank: i + 1,
            })
            .collect();
        let set = sizes
            .iter()
            .map(|(id, tokens)| (id.to_string(), fragment(id, *tokens)))
            .collect();
        (ranked, set)
    }

    fn assembler() -> ContextAssembler {
        ContextAssembler::new(&Config::default().context).unwrap()
    }

    fn overhead(query: &str) -> usize {
        estimate_tokens(INSTRUCTIONS) + estimate_tokens(&format!("USER QUESTION: {}", query))
    }

    #[test]
    fn test_labels_follow_inclusion_order() {
        let (ranked, set) = setup(&[("b", 10), ("a", 10), ("c", 10)]);
        let ctx = assembler().assemble("refund?", &ranked, &set, &[], 3000);

        assert_eq!(ctx.fragments_used, 3);
        assert_eq!(ctx.citation_map.get(1).unwrap().fragment_id, "b");
        assert_eq!(ctx.citation_map.get(2).unwrap().fragment_id, "a");
        assert!(ctx.prompt.contains("[1] b word"));
        assert!(ctx.prompt.contains("USER QUESTION: refund?"));
        assert!(ctx.prompt.ends_with("ASSISTANT: "));
        assert!(!ctx.prompt.contains("CONVERSATION HISTORY"));
        assert!(ctx.flags.is_empty());
    }

    #[test]
    fn test_greedy_stops_at_first_misfit() {
        let budget = overhead("q") + 25;
        let (ranked, set) = setup(&[("a", 10), ("b", 20), ("c", 5)]);
        let ctx = assembler().assemble("q", &ranked, &set, &[], budget);

        assert_eq!(ctx.fragments_used, 1);
        assert!(ctx.flags.is_empty());
    }

    #[test]
    fn test_oversized_top_fragment_is_truncated() {
        let budget = overhead("q") + 5;
        let (ranked, set) = setup(&[("a", 50)]);
        let ctx = assembler().assemble("q", &ranked, &set, &[], budget);

        assert_eq!(ctx.fragments_used, 1);
        assert_eq!(ctx.flags, vec![QueryFlag::ContextTruncated]);
    }

    #[test]
    fn test_zero_fragment_budget() {
        let (ranked, set) = setup(&[("a", 5)]);
        let ctx = assembler().assemble("q", &ranked, &set, &[], 10);

        assert_eq!(ctx.fragments_used, 0);
        assert_eq!(ctx.flags, vec![QueryFlag::ContextTooLarge]);
        assert!(ctx.prompt.contains(NO_CONTEXT));
    }

    #[test]
    fn test_history_drops_oldest_first() {
        let config = ContextConfig {
            token_budget: 3000,
            history_budget: 12,
            max_history_turns: 5,
        };
        let assembler = ContextAssembler::new(&config).unwrap();
        let history = vec![
            ConversationTurn::new(Role::User, "first question about shipping"),
            ConversationTurn::new(Role::Assistant, "ok"),
            ConversationTurn::new(Role::User, "and refunds?"),
        ];

        let (ranked, set) = setup(&[("a", 5)]);
        let ctx = assembler.assemble("q", &ranked, &set, &history, 3000);

        assert_eq!(ctx.history_used, 2);
        assert!(ctx.flags.contains(&QueryFlag::HistoryTruncated));
        assert!(ctx.prompt.contains("ASSISTANT: ok\nUSER: and refunds?\n"));
        assert!(!ctx.prompt.contains("shipping"));
    }

    #[test]
    fn test_history_capped_by_turn_count() {
        let history: Vec<ConversationTurn> = (0..8)
            .map(|i| ConversationTurn::new(Role::User, format!("turn {}", i)))
            .collect();
        let (ranked, set) = setup(&[("a", 5)]);
        let ctx = assembler().assemble("q", &ranked, &set, &history, 3000);

        assert_eq!(ctx.history_used, 5);
        assert!(ctx.prompt.contains("USER: turn 3"));
        assert!(!ctx.prompt.contains("USER: turn 2"));
    }

    #[test]
    fn test_resolve_citations() {
        let (ranked, set) = setup(&[("a", 5), ("b", 5)]);
        let assembler = assembler();
        let ctx = assembler.assemble("q", &ranked, &set, &[], 3000);

        let citations = assembler.resolve_citations("B says so [2], A agrees [1].", &ctx.citation_map);
        assert_eq!(citations[0].fragment_id, "b");
        assert_eq!(citations[1].fragment_id, "a");
    }
}
