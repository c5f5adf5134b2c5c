//! Text helpers shared by the write paths: bounded truncation and the cheap
//! lexical/numeric overlap checks that gate the fallback merge band.

use std::collections::BTreeSet;

/// Words that carry no topical signal in stored summaries
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "has", "have", "had", "was", "were", "are",
    "user", "users", "their", "they", "them", "his", "her", "she", "about", "from", "into",
    "likes", "like", "not", "but", "also", "very", "just",
];

/// Truncate to at most `max` characters on a char boundary
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

/// Lowercased alphanumeric tokens of at least three characters, minus stopwords
pub fn significant_tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .collect()
}

/// True when both texts share at least one significant token
pub fn lexical_overlap(a: &str, b: &str) -> bool {
    let left = significant_tokens(a);
    let right = significant_tokens(b);
    left.intersection(&right).next().is_some()
}

/// Integers mentioned in the text
pub fn integers(text: &str) -> Vec<i64> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|t| !t.is_empty() && t.len() <= 12)
        .filter_map(|t| t.parse().ok())
        .collect()
}

/// True when the texts mention the same integer or adjacent ones
/// ("turns 34" vs "is 35 years old")
pub fn numeric_overlap(a: &str, b: &str) -> bool {
    let left = integers(a);
    let right = integers(b);
    left.iter()
        .any(|x| right.iter().any(|y| (x - y).abs() <= 1))
}

/// Case-insensitive containment
pub fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Stable grouping key: category plus the first two significant words
pub fn topic_key(category: &str, summary: &str) -> String {
    let words: Vec<String> = summary
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .take(2)
        .collect();

    if words.is_empty() {
        category.to_lowercase()
    } else {
        format!("{}:{}", category.to_lowercase(), words.join("_"))
    }
}
