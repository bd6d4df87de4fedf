//! Row label classification.
//!
//! A label is matched against the alias table in three tiers, first confident match
//! wins: exact normalized text, token overlap, then edit distance. Anything left is
//! reported as [`Classification::Unclassified`] rather than dropped.

use crate::config::ClassificationSettings;
use crate::grid::RawGrid;
use crate::taxonomy::{AliasTable, CanonicalLineItem};
use log::debug;
use serde::{Deserialize, Serialize};

const TOKEN_TIER_WEIGHT: f64 = 0.9;
const EDIT_TIER_WEIGHT: f64 = 0.8;
const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MatchTier {
    Exact,
    TokenOverlap,
    EditDistance,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Classification {
    Matched {
        item: CanonicalLineItem,
        confidence: f64,
        tier: MatchTier,
        /// Normalized alias text that produced the match
        alias: String,
    },
    Unclassified,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifiedRow {
    pub row_index: usize,
    pub raw_label: String,
    pub classification: Classification,
}

impl ClassifiedRow {
    pub fn item(&self) -> Option<CanonicalLineItem> {
        match &self.classification {
            Classification::Matched { item, .. } => Some(*item),
            Classification::Unclassified => None,
        }
    }

    pub fn confidence(&self) -> f64 {
        match &self.classification {
            Classification::Matched { confidence, .. } => *confidence,
            Classification::Unclassified => 0.0,
        }
    }

    pub fn is_classified(&self) -> bool {
        self.item().is_some()
    }
}

/// Lowercases, drops parenthetical notes and punctuation, collapses whitespace.
pub fn normalize_label(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut depth = 0usize;

    for ch in text.chars() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => {
                depth = depth.saturating_sub(1);
                stripped.push(' ');
            }
            _ if depth > 0 => {}
            '.' | '\'' | '’' => {}
            c if c.is_alphanumeric() => stripped.extend(c.to_lowercase()),
            _ => stripped.push(' '),
        }
    }

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tokens(normalized: &str) -> Vec<String> {
    normalized.split_whitespace().map(str::to_string).collect()
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Symmetric token overlap (Dice coefficient). A label token also matches an alias
/// token it abbreviates ("rev" → "revenue").
pub fn token_overlap(label_tokens: &[String], alias_tokens: &[String], min_abbreviation: usize) -> f64 {
    if label_tokens.is_empty() || alias_tokens.is_empty() {
        return 0.0;
    }

    let mut used = vec![false; alias_tokens.len()];
    let mut pending: Vec<&String> = Vec::new();
    let mut matched = 0usize;

    for token in label_tokens {
        match alias_tokens
            .iter()
            .enumerate()
            .find(|(idx, alias)| !used[*idx] && *alias == token)
        {
            Some((idx, _)) => {
                used[idx] = true;
                matched += 1;
            }
            None => pending.push(token),
        }
    }

    for token in pending {
        if token.chars().count() < min_abbreviation {
            continue;
        }
        if let Some((idx, _)) = alias_tokens
            .iter()
            .enumerate()
            .find(|(idx, alias)| !used[*idx] && alias.starts_with(token.as_str()))
        {
            used[idx] = true;
            matched += 1;
        }
    }

    (2 * matched) as f64 / (label_tokens.len() + alias_tokens.len()) as f64
}

/// `1 - distance / label length`, clamped to `[0, 1]`.
pub fn edit_similarity(label: &str, alias: &str) -> f64 {
    let label_len = label.chars().count();
    if label_len == 0 {
        return 0.0;
    }
    let distance = levenshtein(label, alias);
    (1.0 - distance as f64 / label_len as f64).clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
struct PreparedAlias {
    normalized: String,
    tokens: Vec<String>,
    item: CanonicalLineItem,
    confidence: f64,
}

struct Candidate<'a> {
    alias: &'a PreparedAlias,
    score: f64,
}

pub struct LineItemClassifier {
    aliases: Vec<PreparedAlias>,
    settings: ClassificationSettings,
}

impl LineItemClassifier {
    pub fn new(table: &AliasTable, settings: ClassificationSettings) -> Self {
        let aliases = table
            .entries
            .iter()
            .map(|entry| {
                let normalized = normalize_label(&entry.alias);
                PreparedAlias {
                    tokens: tokens(&normalized),
                    normalized,
                    item: entry.item,
                    confidence: entry.confidence,
                }
            })
            .collect();

        Self { aliases, settings }
    }

    pub fn classify(&self, row_index: usize, raw_label: &str) -> ClassifiedRow {
        let classification = self.classify_label(raw_label);
        debug!(
            "Row {} '{}' classified as {:?}",
            row_index, raw_label, classification
        );
        ClassifiedRow {
            row_index,
            raw_label: raw_label.trim().to_string(),
            classification,
        }
    }

    pub fn classify_label(&self, raw_label: &str) -> Classification {
        let normalized = normalize_label(raw_label);
        if normalized.is_empty() {
            return Classification::Unclassified;
        }

        // 1. Exact normalized match
        if let Some(alias) = self
            .aliases
            .iter()
            .filter(|a| a.normalized == normalized)
            .min_by_key(|a| a.item.priority())
        {
            return Classification::Matched {
                item: alias.item,
                confidence: 1.0,
                tier: MatchTier::Exact,
                alias: alias.normalized.clone(),
            };
        }

        // 2. Token overlap
        let label_tokens = tokens(&normalized);
        let best = self.best_candidate(|alias| {
            token_overlap(&label_tokens, &alias.tokens, self.settings.min_abbreviation_len)
        });
        if let Some(candidate) = best {
            if candidate.score >= self.settings.token_overlap_threshold {
                return Self::matched(candidate, TOKEN_TIER_WEIGHT, MatchTier::TokenOverlap);
            }
        }

        // 3. Edit distance
        let best = self.best_candidate(|alias| edit_similarity(&normalized, &alias.normalized));
        if let Some(candidate) = best {
            if candidate.score >= self.settings.edit_similarity_threshold {
                return Self::matched(candidate, EDIT_TIER_WEIGHT, MatchTier::EditDistance);
            }
        }

        Classification::Unclassified
    }

    fn matched(candidate: Candidate<'_>, weight: f64, tier: MatchTier) -> Classification {
        Classification::Matched {
            item: candidate.alias.item,
            confidence: (candidate.score * weight * candidate.alias.confidence).clamp(0.0, 1.0),
            tier,
            alias: candidate.alias.normalized.clone(),
        }
    }

    /// Highest score wins; equal scores fall back to taxonomy priority, then base
    /// confidence, then alias table order.
    fn best_candidate<F>(&self, score: F) -> Option<Candidate<'_>>
    where
        F: Fn(&PreparedAlias) -> f64,
    {
        let mut best: Option<Candidate<'_>> = None;

        for alias in &self.aliases {
            let s = score(alias);
            if s <= 0.0 {
                continue;
            }
            let replace = match &best {
                None => true,
                Some(current) => {
                    if (s - current.score).abs() > SCORE_EPSILON {
                        s > current.score
                    } else if alias.item.priority() != current.alias.item.priority() {
                        alias.item.priority() < current.alias.item.priority()
                    } else {
                        alias.confidence > current.alias.confidence
                    }
                }
            };
            if replace {
                best = Some(Candidate { alias, score: s });
            }
        }

        best
    }

    /// Classifies every labelled row from `first_row` down, skipping rows whose label
    /// is sheet metadata (e.g. "Currency").
    pub fn classify_grid_rows(
        &self,
        grid: &RawGrid,
        first_row: usize,
        label_column: usize,
        metadata_labels: &[String],
    ) -> Vec<ClassifiedRow> {
        let metadata: Vec<String> = metadata_labels.iter().map(|l| normalize_label(l)).collect();

        (first_row..grid.row_count())
            .filter_map(|row| {
                let label = grid.cell(row, label_column).as_text()?;
                let normalized = normalize_label(&label);
                if normalized.is_empty() || metadata.contains(&normalized) {
                    return None;
                }
                Some(self.classify(row, &label))
            })
            .collect()
    }
}
