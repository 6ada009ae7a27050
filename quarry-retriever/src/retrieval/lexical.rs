//! Lexical fallback scorer.
//!
//! Used by retrieval when the embedding backend is unreachable. Texts are
//! tokenized into lowercased alphanumeric terms with stop words and single
//! characters removed, weighted by TF-IDF, and ranked by cosine similarity
//! between the query's and each candidate's term vectors. Scores therefore lie
//! in `[0, 1]` like the semantic path, and ties resolve the same way.

use super::vector_index::{SearchHit, top_k};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have",
        "if", "in", "into", "is", "it", "its", "no", "not", "of", "on", "or", "such", "that",
        "the", "their", "then", "there", "these", "they", "this", "to", "was", "were", "will",
        "with",
    ]
    .into_iter()
    .collect()
});

/// Lowercase, split on non-alphanumeric characters, drop stop words and 1-char tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1 && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn term_frequencies(tokens: Vec<String>) -> HashMap<String, f32> {
    let mut counts = HashMap::new();
    for token in tokens {
        *counts.entry(token).or_insert(0.0) += 1.0;
    }
    counts
}

/// Rank `candidates` (position, text) against `query`; at most `k` hits with a positive score.
pub fn search<'a, I>(query: &str, candidates: I, k: usize) -> Vec<SearchHit>
where
    I: IntoIterator<Item = (usize, &'a str)>,
{
    let query_terms = term_frequencies(tokenize(query));
    if query_terms.is_empty() || k == 0 {
        return Vec::new();
    }

    let documents: Vec<(usize, HashMap<String, f32>)> = candidates
        .into_iter()
        .map(|(position, text)| (position, term_frequencies(tokenize(text))))
        .collect();
    if documents.is_empty() {
        return Vec::new();
    }

    let mut document_frequency: HashMap<&str, f32> = HashMap::new();
    for (_, terms) in &documents {
        for term in terms.keys() {
            *document_frequency.entry(term.as_str()).or_insert(0.0) += 1.0;
        }
    }

    let n = documents.len() as f32;
    let idf = |term: &str| -> f32 {
        let df = document_frequency.get(term).copied().unwrap_or(0.0);
        ((n + 1.0) / (df + 1.0)).ln() + 1.0
    };

    let query_weights: HashMap<&str, f32> = query_terms
        .iter()
        .map(|(term, tf)| (term.as_str(), tf * idf(term)))
        .collect();
    let query_norm = norm(query_weights.values());

    let hits = documents.iter().filter_map(|(position, terms)| {
        let mut dot = 0.0;
        for (term, weight) in &query_weights {
            if let Some(tf) = terms.get(*term) {
                dot += weight * tf * idf(term);
            }
        }
        if dot <= 0.0 {
            return None;
        }
        let weights: Vec<f32> = terms.iter().map(|(term, tf)| tf * idf(term)).collect();
        let document_norm = norm(weights.iter());
        Some(SearchHit {
            position: *position,
            score: (dot / (query_norm * document_norm)).min(1.0),
        })
    });

    top_k(hits, k)
}

fn norm<'a>(weights: impl Iterator<Item = &'a f32>) -> f32 {
    weights.map(|w| w * w).sum::<f32>().sqrt()
}
