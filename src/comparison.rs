//! Comparator model: per-attribute ordered comparison levels and the
//! comparison vectors built from them.

use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Deserialize;
use strsim::{damerau_levenshtein, jaro_winkler, levenshtein};

use crate::blocking::BlockedPair;
use crate::error::{LinkageError, Result};
use crate::record::{RecordRef, RecordStore, Schema, Value};

/// Normalize text: lowercase and collapse whitespace
pub fn normalize(s: &str) -> String {
    s.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Tokenize and sort tokens alphabetically
fn tokenize_and_sort(s: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens
}

/// Token sort ratio, 0.0-100.0: Jaro-Winkler over normalized, token-sorted text.
pub fn token_sort_ratio(s1: &str, s2: &str) -> f64 {
    if s1.is_empty() || s2.is_empty() {
        return 0.0;
    }

    let sorted1 = tokenize_and_sort(&normalize(s1)).join(" ");
    let sorted2 = tokenize_and_sort(&normalize(s2)).join(" ");
    if sorted1.is_empty() || sorted2.is_empty() {
        return 0.0;
    }

    jaro_winkler(&sorted1, &sorted2) * 100.0
}

/// A pluggable similarity predicate for one comparison level.
pub trait Comparator: Send + Sync + fmt::Debug {
    fn label(&self) -> String;

    /// Both values are present when this is called.
    fn matches(&self, left: &Value, right: &Value) -> bool;
}

/// The predicate a configured level applies. Levels are tried in the order
/// they are configured, so list the most specific first.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LevelPredicate {
    Exact,
    JaroWinkler { threshold: f64 },
    TokenSortJaroWinkler { threshold: f64 },
    Levenshtein { max_distance: usize },
    DamerauLevenshtein { max_distance: usize },
    NumericWithin { tolerance: f64 },
    DateWithinDays { days: i64 },
    #[serde(skip)]
    Custom(Arc<dyn Comparator>),
}

impl LevelPredicate {
    fn label(&self) -> String {
        match self {
            Self::Exact => "exact".to_string(),
            Self::JaroWinkler { threshold } => format!("jaro_winkler>={threshold}"),
            Self::TokenSortJaroWinkler { threshold } => {
                format!("token_sort_jaro_winkler>={threshold}")
            }
            Self::Levenshtein { max_distance } => format!("levenshtein<={max_distance}"),
            Self::DamerauLevenshtein { max_distance } => {
                format!("damerau_levenshtein<={max_distance}")
            }
            Self::NumericWithin { tolerance } => format!("within {tolerance}"),
            Self::DateWithinDays { days } => format!("within {days} days"),
            Self::Custom(c) => c.label(),
        }
    }

    fn validate(&self, attribute: &str) -> Result<()> {
        let bad = |what: String| {
            Err(LinkageError::config(format!(
                "comparison '{attribute}': {what}"
            )))
        };
        match self {
            Self::JaroWinkler { threshold } | Self::TokenSortJaroWinkler { threshold }
                if !(*threshold > 0.0 && *threshold <= 1.0) =>
            {
                bad(format!("similarity threshold {threshold} outside (0, 1]"))
            }
            Self::NumericWithin { tolerance } if !(tolerance.is_finite() && *tolerance >= 0.0) => {
                bad(format!("numeric tolerance {tolerance} must be finite and >= 0"))
            }
            Self::DateWithinDays { days } if *days < 0 => {
                bad(format!("date window {days} must be >= 0"))
            }
            _ => Ok(()),
        }
    }

    fn matches(&self, left: &Value, right: &Value) -> bool {
        match self {
            Self::Exact => left == right,
            Self::JaroWinkler { threshold } => {
                jaro_winkler(&left.as_text(), &right.as_text()) >= *threshold
            }
            Self::TokenSortJaroWinkler { threshold } => {
                token_sort_ratio(&left.as_text(), &right.as_text()) / 100.0 >= *threshold
            }
            Self::Levenshtein { max_distance } => {
                levenshtein(&left.as_text(), &right.as_text()) <= *max_distance
            }
            Self::DamerauLevenshtein { max_distance } => {
                damerau_levenshtein(&left.as_text(), &right.as_text()) <= *max_distance
            }
            Self::NumericWithin { tolerance } => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => (a - b).abs() <= *tolerance,
                _ => false,
            },
            Self::DateWithinDays { days } => match (left.as_date(), right.as_date()) {
                (Some(a), Some(b)) => (a - b).num_days().abs() <= *days,
                _ => false,
            },
            Self::Custom(c) => c.matches(left, right),
        }
    }
}

fn default_levels() -> Vec<LevelPredicate> {
    vec![LevelPredicate::Exact]
}

/// One configured comparison: an attribute and its ordered levels. The
/// `null` and `else` levels are implicit.
#[derive(Debug, Clone, Deserialize)]
pub struct ComparisonConfig {
    pub attribute: String,
    #[serde(default = "default_levels")]
    pub levels: Vec<LevelPredicate>,
}

impl ComparisonConfig {
    pub fn exact(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            levels: default_levels(),
        }
    }

    pub fn with_level(mut self, predicate: LevelPredicate) -> Self {
        self.levels.push(predicate);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.attribute.trim().is_empty() {
            return Err(LinkageError::config("comparison with an empty attribute name"));
        }
        if self.levels.len() > MAX_LEVELS {
            return Err(LinkageError::config(format!(
                "comparison '{}' has {} levels, at most {MAX_LEVELS} allowed",
                self.attribute,
                self.levels.len()
            )));
        }
        self.levels
            .iter()
            .try_for_each(|level| level.validate(&self.attribute))
    }
}

const MAX_LEVELS: usize = 64;

/// Outcome of one comparison: the null level, or an index into the
/// non-null levels (0 is the most specific; the last is `else`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gamma(i8);

impl Gamma {
    pub const NULL: Self = Self(-1);

    pub fn level(index: usize) -> Self {
        debug_assert!(index <= MAX_LEVELS);
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        Self(index as i8)
    }

    /// Index into the non-null levels, `None` for the null level.
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl fmt::Display for Gamma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A comparison bound to a schema position.
#[derive(Debug, Clone)]
pub struct Comparison {
    attribute: String,
    position: usize,
    levels: Vec<LevelPredicate>,
    labels: Vec<String>,
}

impl Comparison {
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Number of non-null levels, including `else`.
    pub fn num_levels(&self) -> usize {
        self.levels.len() + 1
    }

    pub fn level_labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label(&self, gamma: Gamma) -> &str {
        match gamma.index() {
            Some(i) => &self.labels[i],
            None => "null",
        }
    }

    /// Classify a value pair. Checked in order: null (either side missing),
    /// configured levels, else.
    pub fn classify(&self, left: Option<&Value>, right: Option<&Value>) -> Gamma {
        let (Some(left), Some(right)) = (left, right) else {
            return Gamma::NULL;
        };
        let index = self
            .levels
            .iter()
            .position(|level| level.matches(left, right))
            .unwrap_or(self.levels.len());
        Gamma::level(index)
    }
}

/// Per-pair level assignments, one per comparison in configured order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComparisonVector(Box<[Gamma]>);

impl ComparisonVector {
    pub fn new(gammas: Vec<Gamma>) -> Self {
        Self(gammas.into_boxed_slice())
    }

    pub fn gammas(&self) -> &[Gamma] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A blocked pair enriched with its comparison vector.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePair {
    pub left: u32,
    pub right: u32,
    /// Index of the first blocking rule that produced the pair.
    pub match_key: usize,
    pub vector: ComparisonVector,
}

/// The configured comparisons, resolved against a schema.
#[derive(Debug, Clone)]
pub struct ComparisonSet {
    comparisons: Vec<Comparison>,
}

impl ComparisonSet {
    pub fn compile(configs: &[ComparisonConfig], schema: &Schema) -> Result<Self> {
        let mut comparisons = Vec::with_capacity(configs.len());
        for config in configs {
            config.validate()?;
            let position = schema.position(&config.attribute).ok_or_else(|| {
                LinkageError::config(format!(
                    "comparison references unknown attribute '{}'",
                    config.attribute
                ))
            })?;
            let mut labels: Vec<String> = config.levels.iter().map(LevelPredicate::label).collect();
            labels.push("else".to_string());
            comparisons.push(Comparison {
                attribute: config.attribute.clone(),
                position,
                levels: config.levels.clone(),
                labels,
            });
        }
        Ok(Self { comparisons })
    }

    pub fn len(&self) -> usize {
        self.comparisons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comparisons.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Comparison> {
        self.comparisons.iter()
    }

    pub fn get(&self, index: usize) -> &Comparison {
        &self.comparisons[index]
    }

    pub fn build_vector(&self, left: RecordRef<'_>, right: RecordRef<'_>) -> ComparisonVector {
        ComparisonVector::new(
            self.comparisons
                .iter()
                .map(|c| c.classify(left.value(c.position), right.value(c.position)))
                .collect(),
        )
    }

    /// Build comparison vectors for blocked pairs in parallel, keeping input order.
    pub fn compare_pairs(&self, store: &RecordStore, pairs: &[BlockedPair]) -> Vec<CandidatePair> {
        pairs
            .par_iter()
            .map(|pair| CandidatePair {
                left: pair.left,
                right: pair.right,
                match_key: pair.match_key,
                vector: self.build_vector(
                    store.left().record(pair.left),
                    store.right().record(pair.right),
                ),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn compile(configs: &[ComparisonConfig]) -> ComparisonSet {
        let schema = Schema::new(configs.iter().map(|c| c.attribute.clone()));
        ComparisonSet::compile(configs, &schema).unwrap()
    }

    fn surname() -> ComparisonSet {
        compile(&[ComparisonConfig::exact("surname")
            .with_level(LevelPredicate::JaroWinkler { threshold: 0.88 })])
    }

    #[test]
    fn test_token_sort_ratio_identical() {
        let score = token_sort_ratio("hello world", "hello world");
        assert!((score - 100.0).abs() < 0.001);
    }

    #[test]
    fn test_token_sort_ratio_reordered() {
        let score = token_sort_ratio("hello world", "world hello");
        assert!((score - 100.0).abs() < 0.001);
    }

    #[test]
    fn test_token_sort_ratio_empty() {
        assert!(token_sort_ratio("", "hello").abs() < 0.001);
        assert!(token_sort_ratio("hello", "").abs() < 0.001);
    }

    #[test]
    fn test_classify_priority_order() {
        let set = surname();
        let c = set.get(0);
        let thompson = Value::from("thompson");
        let thompsen = Value::from("thompsen");
        let walker = Value::from("walker");

        assert_eq!(c.classify(Some(&thompson), Some(&thompson)), Gamma::level(0));
        assert_eq!(c.classify(Some(&thompson), Some(&thompsen)), Gamma::level(1));
        assert_eq!(c.classify(Some(&thompson), Some(&walker)), Gamma::level(2));
        assert_eq!(c.label(Gamma::level(2)), "else");
        assert_eq!(c.label(Gamma::NULL), "null");
    }

    #[test]
    fn test_classify_total_and_deterministic() {
        let set = surname();
        let c = set.get(0);
        let a = Value::from("smith");
        let b = Value::from("jones");
        let inputs = [
            (None, None),
            (Some(&a), None),
            (None, Some(&b)),
            (Some(&a), Some(&a)),
            (Some(&a), Some(&b)),
        ];
        for (left, right) in inputs {
            let first = c.classify(left, right);
            for _ in 0..5 {
                assert_eq!(c.classify(left, right), first);
            }
            match first.index() {
                Some(i) => assert!(i < c.num_levels()),
                None => assert!(left.is_none() || right.is_none()),
            }
        }
    }

    #[test]
    fn test_numeric_and_date_levels() {
        let set = compile(&[
            ComparisonConfig {
                attribute: "age".into(),
                levels: vec![LevelPredicate::NumericWithin { tolerance: 1.0 }],
            },
            ComparisonConfig {
                attribute: "dob".into(),
                levels: vec![
                    LevelPredicate::Exact,
                    LevelPredicate::DateWithinDays { days: 3 },
                ],
            },
        ]);
        let age = set.get(0);
        assert_eq!(
            age.classify(Some(&Value::Integer(40)), Some(&Value::Float(40.5))),
            Gamma::level(0)
        );
        assert_eq!(
            age.classify(Some(&Value::Integer(40)), Some(&Value::from("n/a"))),
            Gamma::level(1)
        );

        let dob = set.get(1);
        let d1 = Value::Date(NaiveDate::from_ymd_opt(1980, 1, 1).unwrap());
        let d2 = Value::from("19800103");
        assert_eq!(dob.classify(Some(&d1), Some(&d2)), Gamma::level(1));
    }

    #[derive(Debug)]
    struct SameInitial;

    impl Comparator for SameInitial {
        fn label(&self) -> String {
            "same initial".into()
        }

        fn matches(&self, left: &Value, right: &Value) -> bool {
            left.as_text().chars().next() == right.as_text().chars().next()
        }
    }

    #[test]
    fn test_custom_comparator() {
        let set = compile(&[ComparisonConfig::exact("given_name")
            .with_level(LevelPredicate::Custom(Arc::new(SameInitial)))]);
        let c = set.get(0);
        assert_eq!(c.level_labels(), &["exact", "same initial", "else"]);
        assert_eq!(
            c.classify(Some(&Value::from("john")), Some(&Value::from("jon"))),
            Gamma::level(1)
        );
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let schema = Schema::new(["surname"]);
        let err = ComparisonSet::compile(&[ComparisonConfig::exact("postcode")], &schema)
            .unwrap_err();
        assert!(err.to_string().contains("postcode"));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let schema = Schema::new(["surname"]);
        let config = ComparisonConfig::exact("surname")
            .with_level(LevelPredicate::JaroWinkler { threshold: 1.5 });
        assert!(ComparisonSet::compile(&[config], &schema).is_err());
    }
}
