//! BM25 keyword scoring over a candidate set
//!
//! Used on the lexical half of hybrid retrieval so proper nouns, serial
//! numbers, and code fragments get exact-match weight before the results
//! are fused with dense search via RRF.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

pub const K1: f64 = 1.5;
pub const B: f64 = 0.75;

/// Chinese function words dropped from both queries and documents
const STOP_WORDS: &[&str] = &[
    "的", "了", "是", "在", "和", "与", "或", "及", "等", "之", "为", "有", "被", "把", "对",
    "从", "到",
];

fn token_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\x{4e00}-\x{9fff}]+|[a-zA-Z0-9_]+").unwrap())
}

/// Tokenise into CJK runs and ASCII word runs. Tokens shorter than two
/// characters, stop words, and absurdly long digit strings are dropped;
/// alphabetic tokens are lowercased.
pub fn tokenize(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    for m in token_pattern().find_iter(text) {
        let token = m.as_str();
        if token.chars().count() < 2 {
            continue;
        }
        if STOP_WORDS.contains(&token) {
            continue;
        }
        if token.chars().all(|c| c.is_ascii_digit()) && token.len() > 20 {
            continue;
        }
        if token.chars().all(|c| c.is_ascii_alphabetic()) {
            out.push(token.to_lowercase());
        } else {
            out.push(token.to_string());
        }
    }
    out
}

/// Score each `(item, content)` candidate against the query with BM25 and
/// return them in descending score order.
pub fn rank<T>(query: &str, candidates: Vec<(T, String)>) -> Vec<(T, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }
    let q_terms = tokenize(query);
    if q_terms.is_empty() {
        return candidates.into_iter().map(|(item, _)| (item, 0.0)).collect();
    }

    let n = candidates.len() as f64;
    let doc_lens: Vec<f64> = candidates
        .iter()
        .map(|(_, content)| content.chars().count() as f64)
        .collect();
    let avgdl = doc_lens.iter().sum::<f64>() / n;
    if avgdl <= 0.0 {
        return candidates.into_iter().map(|(item, _)| (item, 0.0)).collect();
    }

    let doc_tfs: Vec<HashMap<String, usize>> = candidates
        .iter()
        .map(|(_, content)| {
            let mut tf = HashMap::new();
            for term in tokenize(content) {
                *tf.entry(term).or_insert(0) += 1;
            }
            tf
        })
        .collect();

    let mut idf = HashMap::new();
    for term in &q_terms {
        let df = doc_tfs.iter().filter(|tf| tf.contains_key(term)).count() as f64;
        idf.insert(term.clone(), ((n - df + 0.5) / (df + 0.5) + 1.0).ln());
    }

    let mut scored: Vec<(T, f64)> = candidates
        .into_iter()
        .enumerate()
        .map(|(i, (item, _))| {
            let dl = doc_lens[i];
            let mut score = 0.0;
            for term in &q_terms {
                let f = *doc_tfs[i].get(term).unwrap_or(&0) as f64;
                if f == 0.0 {
                    continue;
                }
                score += idf[term] * (f * (K1 + 1.0)) / (f + K1 * (1.0 - B + B * dl / avgdl));
            }
            (item, score)
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_mixed_text() {
        let tokens = tokenize("深度学习 uses the ISBN 978 identifier");
        assert!(tokens.contains(&"深度学习".to_string()));
        assert!(tokens.contains(&"isbn".to_string()));
        assert!(tokens.contains(&"978".to_string()));
        // single-char and stop tokens dropped
        assert!(!tokens.contains(&"的".to_string()));
    }

    #[test]
    fn test_tokenize_drops_stop_words_and_long_digits() {
        let tokens = tokenize("的 了 123456789012345678901 有效词");
        assert_eq!(tokens, vec!["有效词"]);
    }

    #[test]
    fn test_exact_match_ranks_first() {
        let candidates = vec![
            (1, "本书编号为 ISBN 978316 全书介绍检索".to_string()),
            (2, "一段关于深度学习的概述文字".to_string()),
            (3, "另一段无关内容".to_string()),
        ];
        let ranked = rank("ISBN 978316", candidates);
        assert_eq!(ranked[0].0, 1);
        assert!(ranked[0].1 > ranked[1].1);
    }

    #[test]
    fn test_no_query_terms_zero_scores() {
        let candidates = vec![(1, "内容".to_string())];
        let ranked = rank("的", candidates);
        assert_eq!(ranked[0].1, 0.0);
    }

    #[test]
    fn test_term_frequency_saturation() {
        // BM25 saturates: ten repeats must score less than ten times one
        let candidates = vec![
            (1, "apple ".repeat(10)),
            (2, "apple banana cherry date".to_string()),
        ];
        let ranked = rank("apple", candidates);
        let top = ranked.iter().find(|(id, _)| *id == 1).unwrap().1;
        let other = ranked.iter().find(|(id, _)| *id == 2).unwrap().1;
        assert!(top > other);
        assert!(top < other * 10.0);
    }

    #[test]
    fn test_empty_candidates() {
        let ranked: Vec<(i64, f64)> = rank("query", Vec::new());
        assert!(ranked.is_empty());
    }
}
