use ahash::AHashSet;
use serde::Deserialize;

use crate::blocking::BlockingRule;
use crate::comparison::ComparisonConfig;
use crate::error::{LinkageError, Result};
use crate::record::Schema;

// ---------------------------------------------------------------------------
// Top-level settings
// ---------------------------------------------------------------------------

/// Immutable settings for one linkage job. Trained state never lives here;
/// it is threaded through [`crate::params::ModelParameters`] values instead.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkerSettings {
    #[serde(default)]
    pub link_type: LinkType,
    #[serde(default = "default_unique_id_column")]
    pub unique_id_column: String,
    #[serde(default = "default_source_column")]
    pub source_column: String,
    pub blocking_rules: Vec<BlockingRule>,
    pub comparisons: Vec<ComparisonConfig>,
    #[serde(default)]
    pub blocking: BlockingSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub prediction: PredictionSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    #[default]
    LinkOnly,
    DedupeWithin,
}

fn default_unique_id_column() -> String {
    "unique_id".to_string()
}

fn default_source_column() -> String {
    "source_dataset".to_string()
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BlockingSettings {
    /// Ceiling on |left bucket| x |right bucket| for a single key.
    #[serde(default = "default_max_pairs_per_key")]
    pub max_pairs_per_key: usize,
    #[serde(default = "default_true")]
    pub skip_oversized_keys: bool,
}

impl Default for BlockingSettings {
    fn default() -> Self {
        Self {
            max_pairs_per_key: default_max_pairs_per_key(),
            skip_oversized_keys: true,
        }
    }
}

fn default_max_pairs_per_key() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TrainingSettings {
    /// Random cross pairs drawn for u-estimation. The standard error of each
    /// u estimate is sqrt(u(1-u)/n), so precision improves with the square
    /// root of the sample while cost grows linearly.
    #[serde(default = "default_u_sample_size")]
    pub u_sample_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Prior probability that a blocked candidate pair is a match, before training.
    #[serde(default = "default_initial_prior")]
    pub initial_prior: f64,
    /// EM training rules, applied in order, each refining the previous parameters.
    #[serde(default)]
    pub em_rules: Vec<BlockingRule>,
    #[serde(default)]
    pub em: EmSettings,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            u_sample_size: default_u_sample_size(),
            seed: default_seed(),
            initial_prior: default_initial_prior(),
            em_rules: Vec::new(),
            em: EmSettings::default(),
        }
    }
}

fn default_u_sample_size() -> usize {
    1_000_000
}

fn default_seed() -> u64 {
    42
}

fn default_initial_prior() -> f64 {
    1e-4
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EmSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Convergence threshold on the largest absolute change of any m or the prior.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Replace the prior with the mean posterior of the training pairs. When
    /// false the prior is still re-estimated inside the loop but the incoming
    /// value is returned.
    #[serde(default = "default_true")]
    pub update_prior: bool,
}

impl Default for EmSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            update_prior: true,
        }
    }
}

fn default_max_iterations() -> usize {
    20
}

fn default_tolerance() -> f64 {
    1e-4
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PredictionSettings {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for PredictionSettings {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

fn default_threshold() -> f64 {
    0.5
}

pub(crate) fn check_threshold(threshold: f64) -> Result<()> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(LinkageError::config(format!(
            "match probability threshold {threshold} outside [0, 1]"
        )))
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl LinkerSettings {
    pub fn new(blocking_rules: Vec<BlockingRule>, comparisons: Vec<ComparisonConfig>) -> Self {
        Self {
            link_type: LinkType::LinkOnly,
            unique_id_column: default_unique_id_column(),
            source_column: default_source_column(),
            blocking_rules,
            comparisons,
            blocking: BlockingSettings::default(),
            training: TrainingSettings::default(),
            prediction: PredictionSettings::default(),
        }
    }

    pub fn from_toml(input: &str) -> Result<Self> {
        let settings: LinkerSettings =
            toml::from_str(input).map_err(|e| LinkageError::ConfigParse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.link_type == LinkType::DedupeWithin {
            return Err(LinkageError::config(
                "link_type 'dedupe_within' is not supported, use 'link_only'",
            ));
        }
        if self.unique_id_column.trim().is_empty() {
            return Err(LinkageError::config("unique_id_column must not be empty"));
        }

        if self.blocking_rules.is_empty() {
            return Err(LinkageError::config("at least one blocking rule is required"));
        }
        for rule in self.blocking_rules.iter().chain(&self.training.em_rules) {
            rule.validate()?;
        }

        if self.comparisons.is_empty() {
            return Err(LinkageError::config("at least one comparison is required"));
        }
        let mut seen = AHashSet::new();
        for comparison in &self.comparisons {
            comparison.validate()?;
            if comparison.attribute == self.unique_id_column {
                return Err(LinkageError::config(format!(
                    "the unique id column '{}' cannot be compared",
                    self.unique_id_column
                )));
            }
            if !seen.insert(comparison.attribute.as_str()) {
                return Err(LinkageError::config(format!(
                    "attribute '{}' is compared twice",
                    comparison.attribute
                )));
            }
        }

        check_threshold(self.prediction.threshold)?;

        let prior = self.training.initial_prior;
        if !(prior > 0.0 && prior < 1.0) {
            return Err(LinkageError::config(format!(
                "initial_prior {prior} must lie strictly between 0 and 1"
            )));
        }
        if self.training.u_sample_size == 0 {
            return Err(LinkageError::config("u_sample_size must be at least 1"));
        }
        if self.training.em.max_iterations == 0 {
            return Err(LinkageError::config("em.max_iterations must be at least 1"));
        }
        let tolerance = self.training.em.tolerance;
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(LinkageError::config(format!(
                "em.tolerance {tolerance} must be finite and positive"
            )));
        }
        if self.blocking.max_pairs_per_key == 0 {
            return Err(LinkageError::config("blocking.max_pairs_per_key must be at least 1"));
        }
        Ok(())
    }

    /// Every attribute the settings reference, comparisons first.
    pub fn schema(&self) -> Schema {
        let compared = self.comparisons.iter().map(|c| c.attribute.clone());
        let blocked = self
            .blocking_rules
            .iter()
            .chain(&self.training.em_rules)
            .flat_map(|r| r.attributes().iter().cloned());
        Schema::new(compared.chain(blocked))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
