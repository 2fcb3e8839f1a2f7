//! Name and category similarity
//!
//! `score = 0.85 * name + 0.15 * category`. `name` is 1 for equal token
//! sets; otherwise it blends token containment (0.5), token Jaccard (0.25)
//! and normalised Levenshtein over the whole string (0.25), halved when the
//! two names carry conflicting model tokens. A name that is a strict token
//! superset or subset of another therefore lands in the review band rather
//! than merging or splitting silently. `category` is the shared prefix depth
//! of the two category paths. A candidate is
//! merged only when it clears the accept threshold AND leads the runner-up by
//! the tie margin; everything between the review floor and that bar goes to
//! review.

use serde::Serialize;
use std::collections::HashSet;

use super::normalize::Normalizer;
use super::types::ScoredCandidate;
use crate::config::MatchingConfig;

const NAME_WEIGHT: f64 = 0.85;
const CATEGORY_WEIGHT: f64 = 0.15;

const CONTAINMENT_WEIGHT: f64 = 0.5;
const JACCARD_WEIGHT: f64 = 0.25;
const EDIT_WEIGHT: f64 = 0.25;

/// Factor applied when model numbers disagree (`11` vs `12`)
const MODEL_CONFLICT_PENALTY: f64 = 0.5;

/// What to do with a record given its scored candidates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MatchDecision {
    Accept(ScoredCandidate),
    Review(Vec<ScoredCandidate>),
    /// Nothing close enough; the record is a new product
    NoMatch,
}

/// Similarity of two normalised names in `[0, 1]`
pub fn name_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let ta = Normalizer::tokens(a);
    let tb = Normalizer::tokens(b);
    if ta == tb {
        return 1.0;
    }

    let shared = ta.intersection(&tb).count() as f64;
    let smaller = ta.len().min(tb.len());
    let union = ta.union(&tb).count();
    let containment = if smaller == 0 { 0.0 } else { shared / smaller as f64 };
    let jaccard = if union == 0 { 0.0 } else { shared / union as f64 };

    let blended = CONTAINMENT_WEIGHT * containment
        + JACCARD_WEIGHT * jaccard
        + EDIT_WEIGHT * strsim::normalized_levenshtein(a, b);

    if models_conflict(&ta, &tb) {
        blended * MODEL_CONFLICT_PENALTY
    } else {
        blended
    }
}

/// Both names carry model tokens and neither set covers the other
fn models_conflict(a: &HashSet<&str>, b: &HashSet<&str>) -> bool {
    let models = |tokens: &HashSet<&str>| -> HashSet<String> {
        tokens
            .iter()
            .filter(|t| t.chars().any(|c| c.is_ascii_digit()))
            .map(|t| t.to_string())
            .collect()
    };
    let (ma, mb) = (models(a), models(b));
    !ma.is_empty() && !mb.is_empty() && !ma.is_subset(&mb) && !mb.is_subset(&ma)
}

/// Shared prefix depth over the longer path; two empty paths agree fully
pub fn category_similarity(a: &[String], b: &[String]) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    let shared = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    shared as f64 / longest as f64
}

pub fn score(name_a: &str, category_a: &[String], name_b: &str, category_b: &[String]) -> f64 {
    NAME_WEIGHT * name_similarity(name_a, name_b)
        + CATEGORY_WEIGHT * category_similarity(category_a, category_b)
}

/// Apply the matching policy to scored candidates
pub fn decide(mut scored: Vec<ScoredCandidate>, policy: &MatchingConfig) -> MatchDecision {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.nomenclature_id.cmp(&b.nomenclature_id))
    });

    let Some(best) = scored.first() else {
        return MatchDecision::NoMatch;
    };
    if best.score < policy.review_floor {
        return MatchDecision::NoMatch;
    }

    let runner_up = scored.get(1).map(|c| c.score).unwrap_or(0.0);
    if best.score >= policy.accept_threshold && best.score - runner_up >= policy.tie_margin {
        return MatchDecision::Accept(best.clone());
    }

    scored.retain(|c| c.score >= policy.review_floor);
    MatchDecision::Review(scored)
}
