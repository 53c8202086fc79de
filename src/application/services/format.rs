//! Scored tabular format classifier.
//!
//! Tier is decided by column count (the four tiers occupy disjoint
//! ranges); dialect and per-column assignment are decided by fuzzy header
//! matching with a confidence score. Low confidence is a hard stop with
//! the unmatched columns listed, never a silent best guess.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::domain::error::DomainError;
use crate::domain::tabular::{mapping_columns, CanonicalColumn, Dialect, Tier};

/// Minimum similarity for an individual header to count as matched.
const MATCH_FLOOR: f64 = 0.6;

/// Result of classifying a header row.
#[derive(Debug, Clone)]
pub struct HeaderMap {
    pub tier: Tier,
    pub dialect: Dialect,
    /// Mean per-header match similarity in 0.0..=1.0.
    pub confidence: f64,
    /// Canonical column per input header position; None for unmatched.
    pub columns: Vec<Option<CanonicalColumn>>,
    pub unmatched: Vec<String>,
}

impl HeaderMap {
    /// Position of a canonical column among the input headers.
    pub fn position(&self, column: CanonicalColumn) -> Option<usize> {
        self.columns.iter().position(|c| *c == Some(column))
    }

    /// Cell of `row` under a canonical column, if present.
    pub fn cell<'a>(&self, row: &'a [String], column: CanonicalColumn) -> Option<&'a str> {
        self.position(column).and_then(|i| row.get(i)).map(String::as_str)
    }
}

/// Classify a hierarchy-file header row.
///
/// `preferred` breaks ties when both dialects score equally (callers
/// default it from settings, historically to legacy).
pub fn classify_hierarchy(
    headers: &[String],
    threshold: f64,
    preferred: Dialect,
) -> Result<HeaderMap, DomainError> {
    let tier = tier_for_count(headers.len()).ok_or_else(|| DomainError::FormatAmbiguous {
        confidence: 0.0,
        threshold,
        unmatched: headers.to_vec(),
    })?;

    let candidates = tier.candidate_columns();
    let map = best_dialect_match(headers, &candidates, tier, preferred);

    let required = required_columns(tier);
    let missing: Vec<CanonicalColumn> = required
        .into_iter()
        .filter(|c| map.position(*c).is_none())
        .collect();

    if map.confidence < threshold || !missing.is_empty() {
        let mut unmatched = map.unmatched.clone();
        for col in missing {
            unmatched.push(format!("missing:{}", col.header(map.dialect)));
        }
        return Err(DomainError::FormatAmbiguous {
            confidence: map.confidence,
            threshold,
            unmatched,
        });
    }

    debug!(
        "classified hierarchy headers: tier={:?} dialect={:?} confidence={:.2}",
        map.tier, map.dialect, map.confidence
    );
    Ok(map)
}

/// Classify a mapping-file header row.
///
/// Extra unrecognized columns are tolerated (and ignored downstream):
/// mapping files in the wild carry exporter artifacts. Sort-named columns
/// in particular are never mapped — sort is structural and comes only
/// from the hierarchy file.
pub fn classify_mappings(headers: &[String], threshold: f64) -> Result<HeaderMap, DomainError> {
    let candidates = mapping_columns();
    // Tier is not meaningful for mapping files; Tier4 is carried as the
    // schema marker of the full surface.
    let mut map = best_dialect_match(headers, &candidates, Tier::Tier4, Dialect::Current);

    if map.position(CanonicalColumn::HierarchyId).is_none() {
        return Err(DomainError::FormatAmbiguous {
            confidence: map.confidence,
            threshold,
            unmatched: vec![format!(
                "missing:{}",
                CanonicalColumn::HierarchyId.header(map.dialect)
            )],
        });
    }

    // Confidence over matched columns only; unmatched extras are allowed
    // and do not count against the score.
    let matched_scores: Vec<f64> = map
        .columns
        .iter()
        .zip(headers)
        .filter_map(|(column, header)| {
            column.map(|c| similarity(&normalize_header(header), &c.header(map.dialect)))
        })
        .collect();
    if matched_scores.is_empty() {
        return Err(DomainError::FormatAmbiguous {
            confidence: 0.0,
            threshold,
            unmatched: map.unmatched,
        });
    }
    map.confidence = matched_scores.iter().sum::<f64>() / matched_scores.len() as f64;
    if map.confidence < threshold {
        return Err(DomainError::FormatAmbiguous {
            confidence: map.confidence,
            threshold,
            unmatched: map.unmatched,
        });
    }
    for extra in &map.unmatched {
        warn!("ignoring unrecognized mapping column: {extra}");
    }
    Ok(map)
}

fn tier_for_count(count: usize) -> Option<Tier> {
    [Tier::Tier1, Tier::Tier2, Tier::Tier3, Tier::Tier4]
        .into_iter()
        .find(|t| t.admits_column_count(count))
}

fn required_columns(tier: Tier) -> Vec<CanonicalColumn> {
    use CanonicalColumn::*;
    match tier {
        Tier::Tier1 => vec![SourceValue, GroupName],
        Tier::Tier2 => vec![HierarchyName, ParentName],
        Tier::Tier3 => vec![HierarchyId, HierarchyName, ParentId],
        Tier::Tier4 => vec![HierarchyId, HierarchyName, ParentId, SortOrder],
    }
}

/// Score both dialects and keep the better assignment; ties go to the
/// preferred dialect.
fn best_dialect_match(
    headers: &[String],
    candidates: &[CanonicalColumn],
    tier: Tier,
    preferred: Dialect,
) -> HeaderMap {
    let first = assign(headers, candidates, tier, preferred);
    let other = match preferred {
        Dialect::Legacy => Dialect::Current,
        Dialect::Current => Dialect::Legacy,
    };
    let second = assign(headers, candidates, tier, other);
    if second.confidence > first.confidence {
        second
    } else {
        first
    }
}

/// Greedy per-header assignment: each header takes the best-scoring
/// unused canonical column, if the score clears the match floor.
fn assign(
    headers: &[String],
    candidates: &[CanonicalColumn],
    tier: Tier,
    dialect: Dialect,
) -> HeaderMap {
    let mut used: HashSet<CanonicalColumn> = HashSet::new();
    let mut columns: Vec<Option<CanonicalColumn>> = Vec::with_capacity(headers.len());
    let mut unmatched: Vec<String> = Vec::new();
    let mut score_sum = 0.0;

    for header in headers {
        let normalized = normalize_header(header);
        let best = candidates
            .iter()
            .filter(|c| !used.contains(c))
            .map(|c| (*c, similarity(&normalized, &c.header(dialect))))
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((column, score)) if score >= MATCH_FLOOR => {
                used.insert(column);
                columns.push(Some(column));
                score_sum += score;
            }
            Some((_, score)) => {
                columns.push(None);
                unmatched.push(header.clone());
                score_sum += score;
            }
            None => {
                columns.push(None);
                unmatched.push(header.clone());
            }
        }
    }

    let confidence = if headers.is_empty() {
        0.0
    } else {
        score_sum / headers.len() as f64
    };

    HeaderMap {
        tier,
        dialect,
        confidence,
        columns,
        unmatched,
    }
}

/// Uppercase and collapse every non-alphanumeric run to one underscore.
fn normalize_header(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    let mut last_was_sep = true;
    for ch in header.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Normalized similarity in 0.0..=1.0 from edit distance.
fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Simple Levenshtein distance implementation.
fn levenshtein(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();
    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for (i, row) in matrix.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    for (i, c1) in s1.chars().enumerate() {
        for (j, c2) in s2.chars().enumerate() {
            let cost = usize::from(c1 != c2);
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1)
                .min(matrix[i + 1][j] + 1)
                .min(matrix[i][j] + cost);
        }
    }

    matrix[len1][len2]
}
