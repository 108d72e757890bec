use crate::models::{
    CANONICAL_SECTION_ORDER, KeywordCoverage, KeywordScore, PlacedKeyword, PriorityTier,
    RemainingKeyword, SectionType,
};
use std::collections::HashMap;

/// Recomputes keyword coverage from scratch against the given section
/// texts (confirmed plus drafted). A keyword is placed when it occurs,
/// case-insensitive substring, in any text; `placed_in` is the first
/// section in canonical order that contains it. Deterministic and
/// side-effect-free.
pub fn compute_coverage(
    keywords: &[KeywordScore],
    texts: &HashMap<SectionType, String>,
) -> KeywordCoverage {
    let lowered: Vec<(SectionType, String)> = CANONICAL_SECTION_ORDER
        .iter()
        .filter_map(|section| {
            texts
                .get(section)
                .filter(|text| !text.is_empty())
                .map(|text| (*section, text.to_lowercase()))
        })
        .collect();

    let mut placed = Vec::new();
    let mut remaining = Vec::new();

    for score in keywords {
        let needle = score.keyword.trim().to_lowercase();
        if needle.is_empty() {
            continue;
        }
        let hit = lowered
            .iter()
            .find(|(_, haystack)| haystack.contains(&needle));
        match hit {
            Some((section, _)) => placed.push(PlacedKeyword {
                keyword: score.keyword.clone(),
                relevance: score.relevance,
                placed_in: *section,
            }),
            None => remaining.push(RemainingKeyword {
                keyword: score.keyword.clone(),
                relevance: score.relevance,
                tier: PriorityTier::from_relevance(score.relevance),
            }),
        }
    }

    let total = placed.len() + remaining.len();
    let coverage_score = if total == 0 {
        0
    } else {
        ((placed.len() as f64 / total as f64) * 100.0).round() as u8
    };

    KeywordCoverage {
        placed,
        remaining,
        coverage_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords(entries: &[(&str, f64)]) -> Vec<KeywordScore> {
        entries
            .iter()
            .map(|(keyword, relevance)| KeywordScore {
                keyword: keyword.to_string(),
                relevance: *relevance,
            })
            .collect()
    }

    fn texts(entries: &[(SectionType, &str)]) -> HashMap<SectionType, String> {
        entries
            .iter()
            .map(|(section, text)| (*section, text.to_string()))
            .collect()
    }

    #[test]
    fn placement_is_case_insensitive_substring() {
        let coverage = compute_coverage(
            &keywords(&[("Yoga Mat", 0.9)]),
            &texts(&[(SectionType::Title, "Premium YOGA mat for home workouts")]),
        );
        assert_eq!(coverage.placed.len(), 1);
        assert_eq!(coverage.placed[0].placed_in, SectionType::Title);
        assert!(coverage.remaining.is_empty());
        assert_eq!(coverage.coverage_score, 100);
    }

    #[test]
    fn placed_in_is_first_canonical_section() {
        let coverage = compute_coverage(
            &keywords(&[("non-slip", 0.7)]),
            &texts(&[
                (SectionType::Description, "non-slip surface keeps you steady"),
                (SectionType::Bullet2, "NON-SLIP textured grip"),
            ]),
        );
        // Bullet 2 precedes description in canonical order.
        assert_eq!(coverage.placed[0].placed_in, SectionType::Bullet2);
    }

    #[test]
    fn remaining_keywords_are_tiered() {
        let coverage = compute_coverage(
            &keywords(&[("eco friendly", 0.8), ("gift idea", 0.5), ("cheap", 0.1)]),
            &texts(&[(SectionType::Title, "Premium yoga mat")]),
        );
        assert!(coverage.placed.is_empty());
        let tiers: Vec<PriorityTier> = coverage.remaining.iter().map(|k| k.tier).collect();
        assert_eq!(
            tiers,
            vec![PriorityTier::High, PriorityTier::Medium, PriorityTier::Low]
        );
        assert_eq!(coverage.coverage_score, 0);
    }

    #[test]
    fn recomputation_is_idempotent() {
        let kw = keywords(&[("yoga mat", 0.9), ("carrying strap", 0.45)]);
        let tx = texts(&[
            (SectionType::Title, "Yoga mat with alignment lines"),
            (SectionType::Bullet1, "Includes carrying strap"),
        ]);
        let first = compute_coverage(&kw, &tx);
        let second = compute_coverage(&kw, &tx);
        assert_eq!(first, second);
    }

    #[test]
    fn verbatim_keyword_never_lands_in_remaining() {
        let coverage = compute_coverage(
            &keywords(&[("alignment lines", 0.65)]),
            &texts(&[(SectionType::Description, "Features alignment lines for posture")]),
        );
        assert_eq!(coverage.placed.len(), 1);
        assert!(
            !coverage
                .remaining
                .iter()
                .any(|k| k.keyword == "alignment lines")
        );
    }

    #[test]
    fn score_rounds_to_integer_percentage() {
        let coverage = compute_coverage(
            &keywords(&[("a", 0.9), ("b", 0.9), ("zz", 0.9)]),
            &texts(&[(SectionType::Title, "a b")]),
        );
        // 2 of 3 placed -> 66.66 rounds to 67.
        assert_eq!(coverage.coverage_score, 67);
    }

    #[test]
    fn blank_keywords_are_skipped() {
        let coverage = compute_coverage(
            &keywords(&[("  ", 0.9), ("mat", 0.9)]),
            &texts(&[(SectionType::Title, "mat")]),
        );
        assert_eq!(coverage.placed.len(), 1);
        assert_eq!(coverage.coverage_score, 100);
    }
}
