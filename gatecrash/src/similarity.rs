// gatecrash/src/similarity.rs
//
// Multiset-intersection scoring between two stripped token lists, and the
// threshold decision built on it. The score is what ultimately decides
// whether a replayed response counts as "the same content".

use crate::records::MatchingMode;
use crate::strip::ContentsHashes;
use std::collections::HashMap;

/// 0..=100 intersection score between two token lists.
///
/// The intersection is a multiset intersection (per-token minimum counts).
/// The denominator is the larger list, or the first list's length in subset
/// form ("is A essentially contained in B?"). Two empty lists score 100.
pub fn inter_score(a: &[String], b: &[String], subset: bool) -> u32 {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for token in a {
        *counts.entry(token.as_str()).or_insert(0) += 1;
    }
    let mut intersection = 0usize;
    for token in b {
        if let Some(count) = counts.get_mut(token.as_str()) {
            if *count > 0 {
                *count -= 1;
                intersection += 1;
            }
        }
    }

    let denominator = if subset { a.len() } else { a.len().max(b.len()) };
    if denominator == 0 {
        100
    } else {
        ((100.0 * intersection as f64) / denominator as f64).round() as u32
    }
}

#[derive(Debug, Clone)]
pub struct MatchParams {
    pub mode:      MatchingMode,
    pub threshold: u32,
    pub debug:     bool,
}

/// Scores and per-profile verdicts of one comparison. With matching debug
/// on, both profiles are scored and recorded; the selected mode decides
/// `similar` either way.
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub score_narrow:  Option<u32>,
    pub score_broad:   Option<u32>,
    pub result_narrow: Option<bool>,
    pub result_broad:  Option<bool>,
    pub similar:       bool,
}

pub fn compare_contents(
    first: &ContentsHashes,
    second: &ContentsHashes,
    params: &MatchParams,
    subset: bool,
) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();

    if params.mode == MatchingMode::M3i || params.debug {
        let score = inter_score(&first.narrow, &second.narrow, subset);
        outcome.score_narrow = Some(score);
        outcome.result_narrow = Some(score >= params.threshold);
    }
    if params.mode == MatchingMode::M4i || params.debug {
        let score = inter_score(&first.broad, &second.broad, subset);
        outcome.score_broad = Some(score);
        outcome.result_broad = Some(score >= params.threshold);
    }

    outcome.similar = match params.mode {
        MatchingMode::M3i => outcome.result_narrow.unwrap_or(false),
        MatchingMode::M4i => outcome.result_broad.unwrap_or(false),
    };
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn identical_lists_score_100() {
        let a = list(&["x", "y", "z"]);
        assert_eq!(inter_score(&a, &a, false), 100);
    }

    #[test]
    fn intersection_counts_are_multiset_minimums() {
        let a = list(&["x", "x", "y"]);
        let b = list(&["x", "y", "y"]);
        // min counts: x→1, y→1; denominator 3.
        assert_eq!(inter_score(&a, &b, false), 67);
    }

    #[test]
    fn denominator_is_the_larger_list() {
        let a = list(&["x", "y"]);
        let b = list(&["x", "y", "z", "w"]);
        assert_eq!(inter_score(&a, &b, false), 50);
    }

    #[test]
    fn subset_form_scores_100_for_contained_multisets() {
        let a = list(&["x", "y"]);
        let b = list(&["x", "y", "z", "w"]);
        assert_eq!(inter_score(&a, &b, true), 100);
        // Not symmetric: b is not contained in a.
        assert_eq!(inter_score(&b, &a, true), 50);
    }

    #[test]
    fn empty_lists_score_100() {
        assert_eq!(inter_score(&[], &[], false), 100);
        assert_eq!(inter_score(&[], &list(&["x"]), true), 100);
    }

    #[test]
    fn threshold_decides_similarity() {
        let params = MatchParams {
            mode: MatchingMode::M3i,
            threshold: 80,
            debug: false,
        };
        let a = ContentsHashes {
            narrow: list(&["x", "y", "z", "w", "v"]),
            broad: Vec::new(),
        };
        let mut b = a.clone();
        let outcome = compare_contents(&a, &b, &params, false);
        assert!(outcome.similar);
        assert_eq!(outcome.score_narrow, Some(100));
        assert_eq!(outcome.score_broad, None);

        b.narrow.truncate(3);
        let outcome = compare_contents(&a, &b, &params, false);
        assert!(!outcome.similar);
        assert_eq!(outcome.score_narrow, Some(60));
    }

    #[test]
    fn debug_scores_both_profiles_but_mode_decides() {
        let params = MatchParams {
            mode: MatchingMode::M4i,
            threshold: 80,
            debug: true,
        };
        let a = ContentsHashes {
            narrow: list(&["only", "here"]),
            broad: list(&["k:1", "k:2"]),
        };
        let b = ContentsHashes {
            narrow: list(&["different", "entirely"]),
            broad: list(&["k:1", "k:2"]),
        };
        let outcome = compare_contents(&a, &b, &params, false);
        assert_eq!(outcome.result_narrow, Some(false));
        assert_eq!(outcome.result_broad, Some(true));
        assert!(outcome.similar);
    }
}
