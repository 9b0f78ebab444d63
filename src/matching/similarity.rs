// src/matching/similarity.rs - Trigram similarity between normalized mentions
use std::collections::HashSet;
use strsim::normalized_levenshtein;

use crate::models::core::SourceMention;
use crate::models::matching::{BlockKeyKind, MatchMethod};

/// Street lines at or above this normalized Levenshtein similarity count as the same address.
pub const STREET_AGREEMENT: f64 = 0.9;

/// The slice of a mention that scoring looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparable {
    pub name: String,
    pub state: Option<String>,
    pub city: Option<String>,
    pub street: Option<String>,
}

impl Comparable {
    pub fn from_mention(m: &SourceMention) -> Self {
        Self {
            name: m.normalized_name.clone(),
            state: m.location.state.clone(),
            city: m.location.city.clone(),
            street: m.location.street.clone(),
        }
    }
}

/// Per-word trigrams, each word padded with two leading spaces and one trailing space.
pub fn trigrams(name: &str) -> HashSet<String> {
    let mut grams = HashSet::new();
    for word in name.split_whitespace() {
        let padded: Vec<char> = format!("  {} ", word).chars().collect();
        for window in padded.windows(3) {
            grams.insert(window.iter().collect());
        }
    }
    grams
}

/// |A ∩ B| / |A ∪ B|; two empty sets are identical.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    jaccard(&trigrams(a), &trigrams(b))
}

fn both_equal(a: &Option<String>, b: &Option<String>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if x == y)
}

#[derive(Debug, Clone, Copy)]
pub struct SimilarityScorer {
    pub city_boost: f64,
}

impl SimilarityScorer {
    pub fn new(city_boost: f64) -> Self {
        Self { city_boost }
    }

    pub fn score(&self, a: &Comparable, b: &Comparable) -> f64 {
        self.score_with(trigram_similarity(&a.name, &b.name), a, b)
    }

    /// Applies the location boost to a precomputed name similarity.
    pub fn score_with(&self, name_similarity: f64, a: &Comparable, b: &Comparable) -> f64 {
        let mut score = name_similarity;
        if both_equal(&a.state, &b.state) && both_equal(&a.city, &b.city) {
            score += self.city_boost;
        }
        score.clamp(0.0, 1.0)
    }

    pub fn method_for(&self, kind: BlockKeyKind, a: &Comparable, b: &Comparable) -> MatchMethod {
        if a.name == b.name && both_equal(&a.state, &b.state) {
            return MatchMethod::BlockExact;
        }
        match kind {
            BlockKeyKind::StatePrefix4 | BlockKeyKind::StatePrefix3 => MatchMethod::FuzzyName,
            BlockKeyKind::StreetZip => match (&a.street, &b.street) {
                (Some(sa), Some(sb)) if normalized_levenshtein(sa, sb) >= STREET_AGREEMENT => {
                    MatchMethod::AddressBlock
                }
                _ => MatchMethod::StreetZip,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(name: &str, state: Option<&str>, city: Option<&str>) -> Comparable {
        Comparable {
            name: name.to_string(),
            state: state.map(str::to_string),
            city: city.map(str::to_string),
            street: None,
        }
    }

    #[test]
    fn test_trigram_padding() {
        let grams = trigrams("ab");
        assert!(grams.contains("  a"));
        assert!(grams.contains(" ab"));
        assert!(grams.contains("ab "));
        assert_eq!(grams.len(), 3);
    }

    #[test]
    fn test_score_is_reflexive_and_symmetric() {
        let scorer = SimilarityScorer::new(0.05);
        let a = c("acme supply", Some("CA"), Some("oakland"));
        let b = c("acme supplies", Some("CA"), Some("berkeley"));
        let d = c("zenith plumbing", None, None);

        assert_eq!(scorer.score(&a, &a), 1.0);
        assert_eq!(scorer.score(&d, &d), 1.0);
        assert_eq!(scorer.score(&a, &b), scorer.score(&b, &a));
        assert_eq!(scorer.score(&a, &d), scorer.score(&d, &a));
        assert!(scorer.score(&a, &b) > scorer.score(&a, &d));
        assert!((0.0..=1.0).contains(&scorer.score(&a, &b)));
    }

    #[test]
    fn test_city_boost_and_clamp() {
        let scorer = SimilarityScorer::new(0.05);
        let a = c("acme supply", Some("CA"), Some("oakland"));
        let b = c("acme supplies", Some("CA"), Some("oakland"));
        let b_elsewhere = c("acme supplies", Some("CA"), Some("fresno"));
        let boosted = scorer.score(&a, &b);
        let plain = scorer.score(&a, &b_elsewhere);
        assert!((boosted - plain - 0.05).abs() < 1e-9);
        assert_eq!(scorer.score(&a, &a), 1.0);
    }

    #[test]
    fn test_method_attribution() {
        let scorer = SimilarityScorer::new(0.0);
        let a = c("acme supply", Some("CA"), None);
        let b = c("acme supply", Some("CA"), None);
        assert_eq!(scorer.method_for(BlockKeyKind::StreetZip, &a, &b), MatchMethod::BlockExact);

        let b = c("acme supplies", Some("CA"), None);
        assert_eq!(scorer.method_for(BlockKeyKind::StatePrefix3, &a, &b), MatchMethod::FuzzyName);

        let mut a = c("acme supply", Some("CA"), None);
        let mut b = c("acme warehouse", Some("CA"), None);
        a.street = Some("100 main street".to_string());
        b.street = Some("100 main streets".to_string());
        assert_eq!(scorer.method_for(BlockKeyKind::StreetZip, &a, &b), MatchMethod::AddressBlock);
        b.street = Some("100 harbor way".to_string());
        assert_eq!(scorer.method_for(BlockKeyKind::StreetZip, &a, &b), MatchMethod::StreetZip);
    }
}
