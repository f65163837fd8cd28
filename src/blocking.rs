//! Blocking engine: hash-indexed equality joins between the two collections.
//!
//! Each rule gets a `key -> (left rows, right rows)` index, built once and
//! read-only afterwards. A pair belongs to the first rule (in configured
//! order) that produces it, so per-rule partitions are disjoint and can be
//! emitted in parallel without a dedup merge.

use std::fmt;

use ahash::{AHashMap, AHashSet};
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::BlockingSettings;
use crate::error::{LinkageError, LinkageWarning, Result};
use crate::record::{Collection, RecordStore, Schema};

const KEY_SEPARATOR: char = '\u{1f}';

/// Equality predicate over an ordered tuple of attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct BlockingRule {
    attributes: Vec<String>,
}

impl BlockingRule {
    pub fn on<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attributes: attributes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn uses(&self, attribute: &str) -> bool {
        self.attributes.iter().any(|a| a == attribute)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.attributes.is_empty() {
            return Err(LinkageError::config("blocking rule with no attributes"));
        }
        let mut seen = AHashSet::new();
        for attribute in &self.attributes {
            if attribute.trim().is_empty() {
                return Err(LinkageError::config(format!(
                    "blocking rule '{self}' has an empty attribute name"
                )));
            }
            if !seen.insert(attribute.as_str()) {
                return Err(LinkageError::config(format!(
                    "blocking rule '{self}' repeats attribute '{attribute}'"
                )));
            }
        }
        Ok(())
    }

    fn positions(&self, schema: &Schema) -> Result<Vec<usize>> {
        self.attributes
            .iter()
            .map(|a| {
                schema.position(a).ok_or_else(|| {
                    LinkageError::config(format!(
                        "blocking rule '{self}' references unknown attribute '{a}'"
                    ))
                })
            })
            .collect()
    }
}

impl fmt::Display for BlockingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, a) in self.attributes.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            write!(f, "l.{a} = r.{a}")?;
        }
        Ok(())
    }
}

/// A candidate pair before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockedPair {
    pub left: u32,
    pub right: u32,
    /// Index of the first rule that produced the pair.
    pub match_key: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleStats {
    pub rule: String,
    /// Pairs this rule contributed that no earlier rule produced.
    pub new_pairs: usize,
    pub skipped_keys: usize,
}

#[derive(Debug, Clone)]
pub struct BlockingOutput {
    /// Sorted by (left, right); every pair appears once.
    pub pairs: Vec<BlockedPair>,
    pub stats: Vec<RuleStats>,
    pub warnings: Vec<LinkageWarning>,
}

struct RuleIndex {
    label: String,
    left_keys: Vec<Option<String>>,
    right_keys: Vec<Option<String>>,
    /// Keys present on both sides, sorted.
    buckets: Vec<(String, Vec<u32>, Vec<u32>)>,
    skipped: AHashSet<String>,
}

impl RuleIndex {
    fn build(rule: &BlockingRule, positions: &[usize], store: &RecordStore) -> Self {
        let left_keys = row_keys(store.left(), positions);
        let right_keys = row_keys(store.right(), positions);

        let mut map: AHashMap<&str, (Vec<u32>, Vec<u32>)> = AHashMap::new();
        for (row, key) in store.left().rows().zip(&left_keys) {
            if let Some(key) = key {
                map.entry(key.as_str()).or_default().0.push(row);
            }
        }
        for (row, key) in store.right().rows().zip(&right_keys) {
            if let Some(key) = key {
                if let Some(entry) = map.get_mut(key.as_str()) {
                    entry.1.push(row);
                }
            }
        }

        let mut buckets: Vec<(String, Vec<u32>, Vec<u32>)> = map
            .into_iter()
            .filter(|(_, (l, r))| !r.is_empty() && !l.is_empty())
            .map(|(k, (l, r))| (k.to_string(), l, r))
            .collect();
        buckets.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        Self {
            label: rule.to_string(),
            left_keys,
            right_keys,
            buckets,
            skipped: AHashSet::new(),
        }
    }

    /// Whether this rule emitted the pair (same key, key not skipped).
    fn covers(&self, left: u32, right: u32) -> bool {
        match (
            &self.left_keys[left as usize],
            &self.right_keys[right as usize],
        ) {
            (Some(a), Some(b)) => a == b && !self.skipped.contains(a),
            _ => false,
        }
    }
}

/// Composite key per row; `None` when any rule attribute is missing.
fn row_keys(collection: &Collection, positions: &[usize]) -> Vec<Option<String>> {
    collection
        .rows()
        .into_par_iter()
        .map(|row| {
            let mut key = String::new();
            for (i, &p) in positions.iter().enumerate() {
                let value = collection.value(row, p)?;
                if i > 0 {
                    key.push(KEY_SEPARATOR);
                }
                value.write_key(&mut key);
            }
            Some(key)
        })
        .collect()
}

fn display_key(key: &str) -> String {
    key.split(KEY_SEPARATOR)
        .map(|part| part.split_once(':').map_or(part, |(_, v)| v))
        .collect::<Vec<_>>()
        .join(" | ")
}

fn build_indices(
    store: &RecordStore,
    rules: &[BlockingRule],
    settings: &BlockingSettings,
) -> Result<(Vec<RuleIndex>, Vec<LinkageWarning>)> {
    let positions = rules
        .iter()
        .map(|rule| {
            rule.validate()?;
            rule.positions(store.schema())
        })
        .collect::<Result<Vec<_>>>()?;

    let mut indices: Vec<RuleIndex> = rules
        .par_iter()
        .zip(positions.par_iter())
        .map(|(rule, positions)| RuleIndex::build(rule, positions, store))
        .collect();

    let mut warnings = Vec::new();
    for index in &mut indices {
        let mut skipped = AHashSet::new();
        for (key, lefts, rights) in &index.buckets {
            let pairs = lefts.len().saturating_mul(rights.len());
            if pairs <= settings.max_pairs_per_key {
                continue;
            }
            warn!(
                rule = %index.label,
                key = %display_key(key),
                pairs,
                ceiling = settings.max_pairs_per_key,
                skipped = settings.skip_oversized_keys,
                "blocking key exceeds pair ceiling"
            );
            warnings.push(LinkageWarning::Scale {
                rule: index.label.clone(),
                key: display_key(key),
                pairs,
                ceiling: settings.max_pairs_per_key,
                skipped: settings.skip_oversized_keys,
            });
            if settings.skip_oversized_keys {
                skipped.insert(key.clone());
            }
        }
        index.skipped = skipped;
    }

    Ok((indices, warnings))
}

fn rule_pairs(rule: usize, indices: &[RuleIndex]) -> impl ParallelIterator<Item = BlockedPair> + '_ {
    let index = &indices[rule];
    let earlier = &indices[..rule];
    index
        .buckets
        .par_iter()
        .filter(move |(key, _, _)| !index.skipped.contains(key))
        .flat_map_iter(move |(_, lefts, rights)| {
            lefts.iter().flat_map(move |&left| {
                rights.iter().filter_map(move |&right| {
                    if earlier.iter().any(|e| e.covers(left, right)) {
                        None
                    } else {
                        Some(BlockedPair {
                            left,
                            right,
                            match_key: rule,
                        })
                    }
                })
            })
        })
}

/// Generate link-only candidate pairs: the deduplicated union over `rules`.
pub fn generate_candidates(
    store: &RecordStore,
    rules: &[BlockingRule],
    settings: &BlockingSettings,
) -> Result<BlockingOutput> {
    let (indices, warnings) = build_indices(store, rules, settings)?;

    let per_rule: Vec<Vec<BlockedPair>> = (0..indices.len())
        .into_par_iter()
        .map(|rule| rule_pairs(rule, &indices).collect())
        .collect();

    let stats: Vec<RuleStats> = indices
        .iter()
        .zip(&per_rule)
        .map(|(index, pairs)| RuleStats {
            rule: index.label.clone(),
            new_pairs: pairs.len(),
            skipped_keys: index.skipped.len(),
        })
        .collect();
    for s in &stats {
        debug!(rule = %s.rule, new_pairs = s.new_pairs, skipped_keys = s.skipped_keys, "blocking rule done");
    }

    let mut pairs: Vec<BlockedPair> = per_rule.into_iter().flatten().collect();
    pairs.par_sort_unstable_by_key(|p| (p.left, p.right));

    info!(
        rules = rules.len(),
        candidates = pairs.len(),
        cross_pairs = store.total_cross_pairs(),
        "blocking complete"
    );

    Ok(BlockingOutput {
        pairs,
        stats,
        warnings,
    })
}

/// Per-rule candidate counts without materialising the pairs.
pub fn count_candidates(
    store: &RecordStore,
    rules: &[BlockingRule],
    settings: &BlockingSettings,
) -> Result<Vec<RuleStats>> {
    let (indices, _) = build_indices(store, rules, settings)?;
    Ok(indices
        .iter()
        .enumerate()
        .map(|(rule, index)| RuleStats {
            rule: index.label.clone(),
            new_pairs: rule_pairs(rule, &indices).count(),
            skipped_keys: index.skipped.len(),
        })
        .collect())
}
