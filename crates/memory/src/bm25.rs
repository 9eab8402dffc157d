//! BM25 ranking over tokenized content. Replaces the teacher's hand-rolled
//! weighted scorer (`scorer.rs`, `retrieval.rs`) because the spec mandates
//! BM25 with a documented `k1`, `b`. The tokenizer — lowercase, split on
//! non-alphanumerics, stopword-filtered, minimum length 3 — is lifted
//! directly from `retrieval::tokenize` and its `STOP_WORDS` table.

use std::collections::{BTreeSet, HashMap};

/// Common English stop words excluded from the lexical term set.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "was", "has", "are", "not", "this", "that", "with", "from", "have",
    "you", "can", "its", "will", "but", "they", "all", "been", "also", "into", "more", "than",
    "when", "who", "what", "how", "out", "our", "new", "now",
];

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// Scores every document in `corpus` against `query`, returning
/// `(index, score)` pairs unsorted. `corpus` is re-tokenized on every call —
/// fine at the scale a single agent's memory store operates at; a persistent
/// inverted index is future work if corpus size ever demands it.
pub fn score_corpus(query: &str, corpus: &[&str], params: &Bm25Params) -> Vec<(usize, f32)> {
    let query_terms: BTreeSet<String> = tokenize(query).into_iter().collect();
    if query_terms.is_empty() || corpus.is_empty() {
        return corpus.iter().enumerate().map(|(i, _)| (i, 0.0)).collect();
    }

    let docs: Vec<Vec<String>> = corpus.iter().map(|doc| tokenize(doc)).collect();
    let doc_lengths: Vec<f32> = docs.iter().map(|d| d.len() as f32).collect();
    let avg_doc_len = doc_lengths.iter().sum::<f32>() / doc_lengths.len().max(1) as f32;

    let mut doc_freq: HashMap<&str, usize> = HashMap::new();
    for term in &query_terms {
        let count = docs.iter().filter(|d| d.contains(term)).count();
        doc_freq.insert(term.as_str(), count);
    }

    let n = docs.len() as f32;
    docs.iter()
        .enumerate()
        .map(|(i, doc_terms)| {
            let term_counts: HashMap<&str, usize> = {
                let mut counts = HashMap::new();
                for t in doc_terms {
                    *counts.entry(t.as_str()).or_insert(0) += 1;
                }
                counts
            };
            let doc_len = doc_lengths[i];
            let score: f32 = query_terms
                .iter()
                .map(|term| {
                    let df = *doc_freq.get(term.as_str()).unwrap_or(&0) as f32;
                    if df == 0.0 {
                        return 0.0;
                    }
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let tf = *term_counts.get(term.as_str()).unwrap_or(&0) as f32;
                    let denom = tf + params.k1 * (1.0 - params.b + params.b * doc_len / avg_doc_len.max(1.0));
                    if denom == 0.0 {
                        0.0
                    } else {
                        idf * (tf * (params.k1 + 1.0)) / denom
                    }
                })
                .sum();
            (i, score)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_words_are_excluded() {
        let terms = tokenize("the project was a success");
        assert!(!terms.contains(&"the".to_string()));
        assert!(terms.contains(&"project".to_string()));
        assert!(terms.contains(&"success".to_string()));
    }

    #[test]
    fn matching_document_outscores_unrelated_one() {
        let corpus = ["user prefers dark mode themes", "the weather in paris is mild today"];
        let scores = score_corpus("dark mode preference", &corpus, &Bm25Params::default());
        let (best, _) = scores.iter().max_by(|a, b| a.1.total_cmp(&b.1)).unwrap();
        assert_eq!(*best, 0);
    }

    #[test]
    fn empty_query_scores_everything_zero() {
        let corpus = ["anything", "something else"];
        let scores = score_corpus("", &corpus, &Bm25Params::default());
        assert!(scores.iter().all(|(_, s)| *s == 0.0));
    }
}
