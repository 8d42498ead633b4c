//! Lightweight lexical helpers shared by the relationship graph, the rule-based
//! metadata fallback, and query processing.

use std::collections::{BTreeSet, HashMap};

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "also", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "him", "his",
    "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just", "me", "more", "most",
    "my", "no", "nor", "not", "now", "of", "off", "on", "once", "only", "or", "other", "our",
    "ours", "out", "over", "own", "same", "she", "should", "so", "some", "such", "than", "that",
    "the", "their", "theirs", "them", "then", "there", "these", "they", "this", "those",
    "through", "to", "too", "under", "until", "up", "use", "used", "using", "very", "was", "we",
    "were", "what", "when", "where", "which", "while", "who", "whom", "why", "will", "with",
    "would", "you", "your", "yours",
];

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.binary_search(&word).is_ok()
}

/// Lowercased alphanumeric tokens of at least three characters, stop words removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .map(|token| token.trim_matches(|c: char| c == '-' || c == '_').to_lowercase())
        .filter(|token| token.chars().count() >= 3)
        .filter(|token| !token.chars().all(|c| c.is_ascii_digit()))
        .filter(|token| !is_stop_word(token))
        .collect()
}

/// Most frequent tokens, ties broken by first occurrence.
pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let tokens = tokenize(text);
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, token) in tokens.iter().enumerate() {
        let entry = counts.entry(token.as_str()).or_insert((0, position));
        entry.0 += 1;
    }

    let mut ranked: Vec<(&str, usize, usize)> = counts
        .into_iter()
        .map(|(token, (count, first))| (token, count, first))
        .collect();
    ranked.sort_by(|left, right| right.1.cmp(&left.1).then(left.2.cmp(&right.2)));

    ranked
        .into_iter()
        .take(max_keywords)
        .map(|(token, _, _)| token.to_string())
        .collect()
}

/// Jaccard similarity of two sets, 0.0 when both are empty.
pub fn jaccard(left: &BTreeSet<String>, right: &BTreeSet<String>) -> f32 {
    let union = left.union(right).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = left.intersection(right).count();
    intersection as f32 / union as f32
}

/// Case-insensitive overlap count between two string lists.
pub fn overlap_count(left: &[String], right: &[String]) -> usize {
    let right: BTreeSet<String> = right.iter().map(|value| value.to_lowercase()).collect();
    left.iter()
        .filter(|value| right.contains(&value.to_lowercase()))
        .count()
}

/// Deduplicate case-insensitively, keeping first spelling and order.
pub fn dedup_preserving_order(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .into_iter()
        .filter(|value| !value.trim().is_empty())
        .filter(|value| seen.insert(value.to_lowercase()))
        .collect()
}
