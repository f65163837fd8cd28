//! Precision and recall of predicted links against an exhaustive set of
//! known matches. Pair identity ignores orientation.

use std::collections::BTreeMap;

use crate::error::{LinkageError, Result};
use crate::predict::PredictedLink;
use crate::record::RecordStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdPair {
    pub left: String,
    pub right: String,
}

impl IdPair {
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
        }
    }

    /// Orientation-free identity: `(a, b)` and `(b, a)` share a key. If the two
    /// collections draw ids from overlapping spaces, a reversed prediction
    /// counts as a hit here; use [`Orientation::LeftRight`] to rule that out.
    fn key(&self) -> (String, String) {
        if self.left <= self.right {
            (self.left.clone(), self.right.clone())
        } else {
            (self.right.clone(), self.left.clone())
        }
    }
}

/// How predicted pairs are matched against the ground truth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Orientation {
    /// `(a, b)` equals `(b, a)`.
    #[default]
    Unordered,
    /// The left id must come from the left role and the right id from the right.
    LeftRight,
}

impl IdPair {
    fn key_for(&self, orientation: Orientation) -> (String, String) {
        match orientation {
            Orientation::Unordered => self.key(),
            Orientation::LeftRight => (self.left.clone(), self.right.clone()),
        }
    }
}

/// Which ground-truth columns hold the left and right identifiers. Always
/// supplied by the caller; never inferred from column positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundTruthColumns {
    pub left: String,
    pub right: String,
}

impl GroundTruthColumns {
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
        }
    }

    /// Resolve both roles against a header row. Fails if either column is
    /// absent or repeated, or both roles name the same column.
    pub fn resolve<'h, I>(&self, headers: I) -> Result<(usize, usize)>
    where
        I: IntoIterator<Item = &'h str>,
    {
        if self.left == self.right {
            return Err(LinkageError::SchemaAmbiguity(format!(
                "left and right identifier roles both map to column '{}'",
                self.left
            )));
        }
        let headers: Vec<&str> = headers.into_iter().collect();
        let find = |name: &str| -> Result<usize> {
            let hits: Vec<usize> = headers
                .iter()
                .enumerate()
                .filter(|(_, h)| h.trim() == name)
                .map(|(i, _)| i)
                .collect();
            match hits.as_slice() {
                [single] => Ok(*single),
                [] => Err(LinkageError::SchemaAmbiguity(format!(
                    "column '{name}' not found among {headers:?}"
                ))),
                _ => Err(LinkageError::SchemaAmbiguity(format!(
                    "column '{name}' appears {} times",
                    hits.len()
                ))),
            }
        };
        Ok((find(&self.left)?, find(&self.right)?))
    }
}

/// Exhaustive set of true-match pairs.
#[derive(Debug, Clone, Default)]
pub struct GroundTruth {
    pairs: BTreeMap<(String, String), IdPair>,
}

impl GroundTruth {
    pub fn from_pairs<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        let mut truth = Self::default();
        for (left, right) in pairs {
            truth.insert(IdPair::new(left, right));
        }
        truth
    }

    pub(crate) fn insert(&mut self, pair: IdPair) {
        self.pairs.entry(pair.key()).or_insert(pair);
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn contains(&self, left: &str, right: &str) -> bool {
        self.pairs
            .contains_key(&IdPair::new(left, right).key())
    }

    pub fn pairs(&self) -> impl Iterator<Item = &IdPair> {
        self.pairs.values()
    }

    /// Every pair must name one record from each collection, in either
    /// orientation. Unresolvable pairs are reported, not dropped.
    pub fn validate_against(&self, store: &RecordStore) -> Result<()> {
        let (left, right) = (store.left(), store.right());
        let unresolved: Vec<&IdPair> = self
            .pairs
            .values()
            .filter(|p| {
                let forward = left.row_of(&p.left).is_some() && right.row_of(&p.right).is_some();
                let reverse = left.row_of(&p.right).is_some() && right.row_of(&p.left).is_some();
                !forward && !reverse
            })
            .collect();
        if unresolved.is_empty() {
            return Ok(());
        }
        let shown: Vec<String> = unresolved
            .iter()
            .take(5)
            .map(|p| format!("({}, {})", p.left, p.right))
            .collect();
        Err(LinkageError::SchemaAmbiguity(format!(
            "{} ground-truth pair(s) do not resolve to one '{}' and one '{}' record, e.g. {}",
            unresolved.len(),
            left.source(),
            right.source(),
            shown.join(", ")
        )))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub true_positives: Vec<IdPair>,
    pub false_positives: Vec<IdPair>,
    pub false_negatives: Vec<IdPair>,
    /// 0 when nothing was predicted.
    pub precision: f64,
    /// 0 when the ground truth is empty.
    pub recall: f64,
    pub f1: f64,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Compare predicted id pairs with the ground truth, ignoring orientation.
/// Duplicate predictions count once.
pub fn evaluate<I, A, B>(predictions: I, truth: &GroundTruth) -> Evaluation
where
    I: IntoIterator<Item = (A, B)>,
    A: Into<String>,
    B: Into<String>,
{
    evaluate_with(predictions, truth, Orientation::Unordered)
}

pub fn evaluate_with<I, A, B>(
    predictions: I,
    truth: &GroundTruth,
    orientation: Orientation,
) -> Evaluation
where
    I: IntoIterator<Item = (A, B)>,
    A: Into<String>,
    B: Into<String>,
{
    let truth: BTreeMap<(String, String), &IdPair> = truth
        .pairs
        .values()
        .map(|p| (p.key_for(orientation), p))
        .collect();
    let mut predicted: BTreeMap<(String, String), IdPair> = BTreeMap::new();
    for (left, right) in predictions {
        let pair = IdPair::new(left, right);
        predicted.entry(pair.key_for(orientation)).or_insert(pair);
    }

    let mut true_positives = Vec::new();
    let mut false_positives = Vec::new();
    for (key, pair) in predicted.iter() {
        if truth.contains_key(key) {
            true_positives.push(pair.clone());
        } else {
            false_positives.push(pair.clone());
        }
    }
    let false_negatives: Vec<IdPair> = truth
        .iter()
        .filter(|(key, _)| !predicted.contains_key(*key))
        .map(|(_, pair)| (*pair).clone())
        .collect();

    let precision = ratio(true_positives.len(), predicted.len());
    let recall = ratio(true_positives.len(), truth.len());
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    Evaluation {
        true_positives,
        false_positives,
        false_negatives,
        precision,
        recall,
        f1,
    }
}

pub fn evaluate_links(links: &[PredictedLink], truth: &GroundTruth) -> Evaluation {
    evaluate_links_with(links, truth, Orientation::Unordered)
}

/// Links are always oriented (left id from the left collection), so
/// [`Orientation::LeftRight`] is exact once the truth columns name the roles.
pub fn evaluate_links_with(
    links: &[PredictedLink],
    truth: &GroundTruth,
    orientation: Orientation,
) -> Evaluation {
    evaluate_with(
        links
            .iter()
            .map(|l| (l.left_id.as_str(), l.right_id.as_str())),
        truth,
        orientation,
    )
}
