//! Fellegi-Sunter model parameters: per-level m/u probabilities and the prior.

use crate::comparison::{ComparisonSet, Gamma};
use crate::error::{LinkageError, Result};

/// Floor applied to probabilities before they enter a ratio or a logarithm.
pub const PROBABILITY_FLOOR: f64 = 1e-10;

const SUM_TOLERANCE: f64 = 1e-9;

pub(crate) fn clamp_probability(p: f64) -> f64 {
    p.clamp(PROBABILITY_FLOOR, 1.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelParameters {
    pub label: String,
    pub m: f64,
    pub u: f64,
    pub m_trained: bool,
    pub u_trained: bool,
}

impl LevelParameters {
    pub fn bayes_factor(&self) -> f64 {
        clamp_probability(self.m) / clamp_probability(self.u)
    }

    pub fn match_weight(&self) -> f64 {
        self.bayes_factor().log2()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonParameters {
    pub attribute: String,
    /// Non-null levels in priority order; the last is `else`.
    pub levels: Vec<LevelParameters>,
}

/// Row of [`ModelParameters::describe`].
#[derive(Debug, Clone, PartialEq)]
pub struct LevelSummary {
    pub attribute: String,
    pub label: String,
    pub m: f64,
    pub u: f64,
    pub match_weight: f64,
}

/// Learned model. Each estimator call returns a new value; nothing mutates
/// a value after it has been handed to the scorer.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParameters {
    prior: f64,
    comparisons: Vec<ComparisonParameters>,
}

impl ModelParameters {
    /// Untrained starting point. m favours the most specific level and u
    /// favours `else`, each decaying tenfold per level.
    pub fn initial(comparisons: &ComparisonSet, prior: f64) -> Self {
        let comparisons = comparisons
            .iter()
            .map(|c| {
                let n = c.num_levels();
                let m = decaying(n, false);
                let u = decaying(n, true);
                ComparisonParameters {
                    attribute: c.attribute().to_string(),
                    levels: c
                        .level_labels()
                        .iter()
                        .zip(m.into_iter().zip(u))
                        .map(|(label, (m, u))| LevelParameters {
                            label: label.clone(),
                            m,
                            u,
                            m_trained: false,
                            u_trained: false,
                        })
                        .collect(),
                }
            })
            .collect();
        Self { prior, comparisons }
    }

    pub fn prior(&self) -> f64 {
        self.prior
    }

    pub fn with_prior(mut self, prior: f64) -> Self {
        self.prior = prior;
        self
    }

    pub fn comparisons(&self) -> &[ComparisonParameters] {
        &self.comparisons
    }

    pub fn comparison(&self, index: usize) -> &ComparisonParameters {
        &self.comparisons[index]
    }

    pub fn m_values(&self, comparison: usize) -> Vec<f64> {
        self.comparisons[comparison].levels.iter().map(|l| l.m).collect()
    }

    pub fn u_values(&self, comparison: usize) -> Vec<f64> {
        self.comparisons[comparison].levels.iter().map(|l| l.u).collect()
    }

    pub(crate) fn set_m(&mut self, comparison: usize, m: &[f64]) {
        for (level, &value) in self.comparisons[comparison].levels.iter_mut().zip(m) {
            level.m = value;
            level.m_trained = true;
        }
    }

    pub(crate) fn set_u(&mut self, comparison: usize, u: &[f64]) {
        for (level, &value) in self.comparisons[comparison].levels.iter_mut().zip(u) {
            level.u = value;
            level.u_trained = true;
        }
    }

    /// Bayes factor m/u for one comparison outcome. The null level is neutral.
    pub fn bayes_factor(&self, comparison: usize, gamma: Gamma) -> f64 {
        match gamma.index() {
            Some(level) => self.comparisons[comparison].levels[level].bayes_factor(),
            None => 1.0,
        }
    }

    /// Per-level m, u and match weight, for inspection.
    pub fn describe(&self) -> Vec<LevelSummary> {
        self.comparisons
            .iter()
            .flat_map(|c| {
                c.levels.iter().map(move |l| LevelSummary {
                    attribute: c.attribute.clone(),
                    label: l.label.clone(),
                    m: l.m,
                    u: l.u,
                    match_weight: l.match_weight(),
                })
            })
            .collect()
    }

    /// Check shape against a comparison set, the prior range, and that m and u
    /// each sum to one per comparison.
    pub fn validate(&self, comparisons: &ComparisonSet) -> Result<()> {
        if !(self.prior > 0.0 && self.prior < 1.0) {
            return Err(LinkageError::config(format!(
                "prior {} must lie strictly between 0 and 1",
                self.prior
            )));
        }
        if self.comparisons.len() != comparisons.len() {
            return Err(LinkageError::config(format!(
                "parameters cover {} comparisons, settings configure {}",
                self.comparisons.len(),
                comparisons.len()
            )));
        }
        for (params, comparison) in self.comparisons.iter().zip(comparisons.iter()) {
            if params.attribute != comparison.attribute()
                || params.levels.len() != comparison.num_levels()
            {
                return Err(LinkageError::config(format!(
                    "parameters for '{}' do not match comparison '{}'",
                    params.attribute,
                    comparison.attribute()
                )));
            }
            let m_sum: f64 = params.levels.iter().map(|l| l.m).sum();
            let u_sum: f64 = params.levels.iter().map(|l| l.u).sum();
            let in_range = params
                .levels
                .iter()
                .all(|l| (0.0..=1.0).contains(&l.m) && (0.0..=1.0).contains(&l.u));
            if !in_range || (m_sum - 1.0).abs() > SUM_TOLERANCE || (u_sum - 1.0).abs() > SUM_TOLERANCE
            {
                return Err(LinkageError::config(format!(
                    "parameters for '{}' are not distributions (sum m = {m_sum}, sum u = {u_sum})",
                    params.attribute
                )));
            }
        }
        Ok(())
    }
}

fn decaying(n: usize, reversed: bool) -> Vec<f64> {
    let raw: Vec<f64> = (0..n)
        .map(|i| {
            let step = if reversed { n - 1 - i } else { i };
            10f64.powi(-i32::try_from(step).unwrap_or(i32::MAX))
        })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|x| x / total).collect()
}
