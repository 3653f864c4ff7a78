//! TF-IDF cosine scoring for context search.
//!
//! - Tokens: lowercase alphanumeric runs (with `_`), at least two chars, stop words removed.
//! - Weights: sublinear term frequency `1 + ln(tf)` times smoothed IDF
//!   `ln((N + 1) / (df + 1)) + 1`.
//! - Score: cosine similarity between query and document vectors, in `[0, 1]`.
//!
//! Statistics are computed over the store's current entries on every query; the
//! store is small enough that an incremental index would not pay for itself.

use std::collections::HashMap;

pub(super) fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| s.len() >= 2)
        .filter(|s| !is_stop_word(s))
        .map(str::to_string)
        .collect()
}

fn is_stop_word(word: &str) -> bool {
    const STOP_WORDS: &[&str] = &[
        "the", "be", "to", "of", "and", "in", "that", "have", "it", "for", "not", "on", "with",
        "as", "you", "do", "at", "this", "but", "by", "from", "they", "we", "or", "an", "will",
        "all", "would", "there", "their", "what", "so", "if", "about", "which", "when", "can",
        "no", "into", "your", "some", "them", "than", "then", "its", "also", "is", "was", "are",
        "been", "being", "were", "am",
    ];
    STOP_WORDS.contains(&word)
}

fn term_frequencies(tokens: &[String]) -> HashMap<&str, usize> {
    let mut tf = HashMap::new();
    for token in tokens {
        *tf.entry(token.as_str()).or_insert(0) += 1;
    }
    tf
}

/// Score every document against `query`. Output order matches `documents`.
pub(super) fn score_documents(query: &str, documents: &[String]) -> Vec<f64> {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() || documents.is_empty() {
        return vec![0.0; documents.len()];
    }

    let doc_tokens: Vec<Vec<String>> = documents.iter().map(|doc| tokenize(doc)).collect();
    let doc_tfs: Vec<HashMap<&str, usize>> =
        doc_tokens.iter().map(|tokens| term_frequencies(tokens)).collect();

    let mut df: HashMap<&str, usize> = HashMap::new();
    for tf in &doc_tfs {
        for term in tf.keys() {
            *df.entry(*term).or_insert(0) += 1;
        }
    }

    let n = documents.len() as f64;
    let idf = |term: &str| -> f64 {
        let doc_freq = *df.get(term).unwrap_or(&0) as f64;
        ((n + 1.0) / (doc_freq + 1.0)).ln() + 1.0
    };
    let weight = |count: usize, term: &str| -> f64 { (1.0 + (count as f64).ln()) * idf(term) };

    let query_tf = term_frequencies(&query_tokens);
    let query_vec: HashMap<&str, f64> = query_tf
        .iter()
        .map(|(term, count)| (*term, weight(*count, *term)))
        .collect();
    let query_norm = query_vec.values().map(|w| w * w).sum::<f64>().sqrt();

    doc_tfs
        .iter()
        .map(|tf| {
            if tf.is_empty() || query_norm == 0.0 {
                return 0.0;
            }
            let mut dot = 0.0;
            let mut norm = 0.0;
            for (term, count) in tf {
                let w = weight(*count, *term);
                norm += w * w;
                if let Some(qw) = query_vec.get(term) {
                    dot += w * qw;
                }
            }
            if dot == 0.0 {
                return 0.0;
            }
            (dot / (norm.sqrt() * query_norm)).clamp(0.0, 1.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_stop_words_and_short_tokens() {
        let tokens = tokenize("The parser is a Recursive-descent parser_v2!");
        assert_eq!(tokens, vec!["parser", "recursive", "descent", "parser_v2"]);
    }

    #[test]
    fn exact_match_scores_one() {
        let docs = vec!["checkpoint writer".to_string(), "token bucket".to_string()];
        let scores = score_documents("checkpoint writer", &docs);
        assert!((scores[0] - 1.0).abs() < 1e-9);
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn rarer_terms_weigh_more() {
        let docs = vec![
            "config loader config".to_string(),
            "config retry".to_string(),
            "config".to_string(),
        ];
        let scores = score_documents("config retry", &docs);
        assert!(scores[1] > scores[0]);
        assert!(scores[1] > scores[2]);
    }

    #[test]
    fn empty_query_scores_zero() {
        let docs = vec!["anything".to_string()];
        assert_eq!(score_documents("the of", &docs), vec![0.0]);
    }
}
