//! Citation labels and first-use ordering

use crate::types::{Citation, DocumentId, Fragment, FragmentId};
use regex::Regex;
use std::collections::HashSet;

const SNIPPET_CHARS: usize = 200;

/// Matches `[1]` as well as grouped markers like `[1, 3]`
const MARKER_PATTERN: &str = r"\[(\d+(?:\s*,\s*\d+)*)\]";

/// One labeled fragment in the assembled prompt
#[derive(Debug, Clone, PartialEq)]
pub struct CitationEntry {
    /// 1-based label number
    pub number: usize,
    pub fragment_id: FragmentId,
    pub document_id: DocumentId,
    pub position: u32,
    pub snippet: String,
}

impl CitationEntry {
    pub fn label(&self) -> String {
        format!("[{}]", self.number)
    }

    pub fn to_citation(&self) -> Citation {
        Citation {
            fragment_id: self.fragment_id.clone(),
            label: self.label(),
            document_id: self.document_id,
            position: self.position,
            snippet: self.snippet.clone(),
        }
    }
}

/// Labels assigned in inclusion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CitationMap {
    entries: Vec<CitationEntry>,
}

impl CitationMap {
    /// Append a fragment, returning its label number
    pub(crate) fn push(&mut self, fragment: &Fragment) -> usize {
        let number = self.entries.len() + 1;
        self.entries.push(CitationEntry {
            number,
            fragment_id: fragment.id.clone(),
            document_id: fragment.document_id,
            position: fragment.position,
            snippet: snippet(&fragment.text),
        });
        number
    }

    pub fn get(&self, number: usize) -> Option<&CitationEntry> {
        number.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every labeled fragment, in label order
    pub fn citations(&self) -> Vec<Citation> {
        self.entries.iter().map(CitationEntry::to_citation).collect()
    }
}

/// Scans generated text for citation markers
#[derive(Debug, Clone)]
pub struct CitationParser {
    marker: Regex,
}

impl CitationParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            marker: Regex::new(MARKER_PATTERN)?,
        })
    }

    /// Label numbers in reading order, each once
    pub fn cited_numbers(&self, text: &str) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut numbers = Vec::new();

        for caps in self.marker.captures_iter(text) {
            let Some(group) = caps.get(1) else { continue };
            for part in group.as_str().split(',') {
                if let Ok(n) = part.trim().parse::<usize>() {
                    if seen.insert(n) {
                        numbers.push(n);
                    }
                }
            }
        }

        numbers
    }

    /// Citations ordered by first use in `answer`; unknown and unused labels are omitted
    pub fn resolve(&self, answer: &str, map: &CitationMap) -> Vec<Citation> {
        self.cited_numbers(answer)
            .into_iter()
            .filter_map(|n| map.get(n))
            .map(CitationEntry::to_citation)
            .collect()
    }
}

/// First 200 chars of `text`, with `...` when cut
pub fn snippet(text: &str) -> String {
    let mut chars = text.char_indices();
    match chars.nth(SNIPPET_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(id: &str, text: &str) -> Fragment {
        Fragment {
            id: id.to_string(),
            document_id: 42,
            text: text.to_string(),
            embedding_ref: None,
            position: 0,
            token_count: 10,
            section_header: None,
        }
    }

    fn map() -> CitationMap {
        let mut map = CitationMap::default();
        map.push(&fragment("a", "first"));
        map.push(&fragment("b", "second"));
        map.push(&fragment("c", "third"));
        map
    }

    #[test]
    fn test_first_use_order() {
        let parser = CitationParser::new().unwrap();
        let answer = "Refunds take 30 days [3]. Exchanges are free [1]. Again [3].";

        let citations = parser.resolve(answer, &map());
        let labels: Vec<&str> = citations.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["[3]", "[1]"]);
        assert_eq!(citations[0].fragment_id, "c");
    }

    #[test]
    fn test_grouped_and_unknown_markers() {
        let parser = CitationParser::new().unwrap();
        let answer = "See [2, 1] and [9] and [3][2].";

        assert_eq!(parser.cited_numbers(answer), vec![2, 1, 9, 3]);

        let citations = parser.resolve(answer, &map());
        let ids: Vec<&str> = citations.iter().map(|c| c.fragment_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_zero_label_ignored() {
        let parser = CitationParser::new().unwrap();
        assert!(parser.resolve("Nothing here [0].", &map()).is_empty());
    }

    #[test]
    fn test_snippet() {
        assert_eq!(snippet("short"), "short");

        let long = "é".repeat(250);
        let s = snippet(&long);
        assert!(s.ends_with("..."));
        assert_eq!(s.chars().count(), 203);

        let exact = "x".repeat(200);
        assert_eq!(snippet(&exact), exact);
    }
}
