//! Hybrid re-ranking: semantic score plus a weighted BM25 keyword score

use std::collections::HashMap;

use super::types::SearchHit;

const BM25_K1: f32 = 1.5;
const BM25_B: f32 = 0.75;
/// Empirical upper bound of the BM25 score per query token
const BM25_NORMALIZER: f32 = 5.0;
/// Query tokens this short carry no signal ("of", "a", ...)
const MIN_TOKEN_CHARS: usize = 3;

/// Re-ranks semantically ranked candidates with a keyword boost.
///
/// `final = min(1, semantic + bm25 / (tokens * 5) * keyword_boost_weight)`.
/// A weight of 0 keeps the semantic order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridScorer {
    keyword_boost_weight: f32,
}

impl Default for HybridScorer {
    fn default() -> Self {
        Self {
            keyword_boost_weight: 0.0,
        }
    }
}

impl HybridScorer {
    pub fn new(keyword_boost_weight: f32) -> Self {
        let keyword_boost_weight = if keyword_boost_weight.is_finite() {
            keyword_boost_weight.max(0.0)
        } else {
            0.0
        };
        Self {
            keyword_boost_weight,
        }
    }

    pub fn keyword_boost_weight(&self) -> f32 {
        self.keyword_boost_weight
    }

    pub fn rerank(&self, candidates: Vec<SearchHit>, expanded_query: &str) -> Vec<SearchHit> {
        let tokens = tokenize(expanded_query);
        if tokens.is_empty() || candidates.is_empty() {
            return candidates;
        }

        let documents: Vec<String> = candidates
            .iter()
            .map(|c| c.scoring_text().to_lowercase())
            .collect();
        let n = documents.len() as f32;
        let total_len: usize = documents.iter().map(|d| d.chars().count()).sum();
        let avg_len = (total_len as f32 / n).max(1.0);

        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for token in &tokens {
            let df = documents.iter().filter(|d| d.contains(token.as_str())).count();
            doc_freq.insert(token.as_str(), df);
        }

        let normalizer = tokens.len() as f32 * BM25_NORMALIZER;
        let mut scored = candidates;
        for (candidate, document) in scored.iter_mut().zip(&documents) {
            let doc_len = document.chars().count() as f32;
            let mut bm25 = 0.0;
            for token in &tokens {
                let tf = document.matches(token.as_str()).count() as f32;
                if tf == 0.0 {
                    continue;
                }
                let df = doc_freq.get(token.as_str()).copied().unwrap_or(0) as f32;
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                let length_norm = 1.0 - BM25_B + BM25_B * (doc_len / avg_len);
                bm25 += idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * length_norm);
            }
            let boosted = candidate.score + (bm25 / normalizer) * self.keyword_boost_weight;
            candidate.set_score(boosted.min(1.0));
        }

        // sort_by is stable: equal scores keep their semantic order
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored
    }
}

fn tokenize(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::LocationData;

    fn hit(x: i32, score: f32, content: &str) -> SearchHit {
        let location = LocationData::new("overworld", x, 64, 0).unwrap();
        SearchHit::new(location, score, "preview").with_content(content)
    }

    #[test]
    fn test_short_tokens_are_dropped() {
        assert_eq!(tokenize("  A Diamond of SWORD  "), vec!["diamond", "sword"]);
        assert!(tokenize("of a to").is_empty());
    }

    #[test]
    fn test_no_tokens_returns_input_unchanged() {
        let candidates = vec![hit(0, 0.2, "stone"), hit(1, 0.9, "dirt")];
        let result = HybridScorer::new(1.0).rerank(candidates.clone(), "to");
        assert_eq!(result, candidates);
        assert!(HybridScorer::new(1.0).rerank(vec![], "diamond").is_empty());
    }

    #[test]
    fn test_higher_term_frequency_scores_at_least_as_high() {
        let scorer = HybridScorer::new(0.5);
        let result = scorer.rerank(
            vec![hit(0, 0.5, "sword stone"), hit(1, 0.5, "sword sword")],
            "sword",
        );
        assert_eq!(result[0].location.x, 1);
        assert!(result[0].score >= result[1].score);
    }

    #[test]
    fn test_zero_weight_keeps_semantic_scores() {
        let candidates = vec![hit(0, 0.3, "sword sword sword"), hit(1, 0.7, "dirt")];
        let result = HybridScorer::default().rerank(candidates, "sword");
        assert_eq!(result[0].location.x, 1);
        assert!((result[0].score - 0.7).abs() < 1e-6);
        assert!((result[1].score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_scores_are_clamped_to_one() {
        let result = HybridScorer::new(100.0).rerank(vec![hit(0, 0.95, "diamond sword")], "diamond sword");
        assert_eq!(result[0].score, 1.0);
    }

    #[test]
    fn test_ties_keep_original_order() {
        let candidates = vec![hit(0, 0.5, "a"), hit(1, 0.5, "b"), hit(2, 0.5, "c")];
        let result = HybridScorer::new(1.0).rerank(candidates, "diamond");
        let order: Vec<i32> = result.iter().map(|h| h.location.x).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_preview_used_without_content() {
        let location = LocationData::new("overworld", 0, 0, 0).unwrap();
        let plain = SearchHit::new(location.clone(), 0.1, "emerald block");
        let other = SearchHit::new(location, 0.2, "stone");
        let result = HybridScorer::new(1.0).rerank(vec![other, plain], "emerald");
        assert_eq!(result[0].preview, "emerald block");
    }

    #[test]
    fn test_invalid_weight_is_disabled() {
        assert_eq!(HybridScorer::new(f32::NAN).keyword_boost_weight(), 0.0);
        assert_eq!(HybridScorer::new(-1.0).keyword_boost_weight(), 0.0);
    }
}
