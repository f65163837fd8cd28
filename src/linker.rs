//! End-to-end pipeline over an immutable store and settings.
//!
//! `Linker` holds no trained state. Every training step takes the current
//! [`ModelParameters`] and returns a new value that the caller passes on.

use tracing::info;

use crate::blocking::{generate_candidates, BlockingRule, RuleStats};
use crate::comparison::{CandidatePair, ComparisonSet};
use crate::config::LinkerSettings;
use crate::error::{LinkageError, LinkageWarning, Result};
use crate::estimate::{estimate_parameters_using_em, estimate_u_random_sampling, EmOutcome};
use crate::params::ModelParameters;
use crate::predict::{predict, PredictedLink};
use crate::record::RecordStore;

#[derive(Debug, Clone)]
pub struct Candidates {
    pub pairs: Vec<CandidatePair>,
    pub stats: Vec<RuleStats>,
    pub warnings: Vec<LinkageWarning>,
}

#[derive(Debug, Clone)]
pub struct TrainingRound {
    pub rule: String,
    pub outcome: EmOutcome,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub parameters: ModelParameters,
    pub rounds: Vec<TrainingRound>,
    pub warnings: Vec<LinkageWarning>,
}

impl TrainingReport {
    pub fn converged(&self) -> bool {
        self.rounds.iter().all(|r| r.outcome.converged)
    }
}

pub struct Linker<'a> {
    store: &'a RecordStore,
    settings: &'a LinkerSettings,
    comparisons: ComparisonSet,
}

impl<'a> Linker<'a> {
    /// Validate `settings` and resolve them against the store's schema.
    pub fn new(store: &'a RecordStore, settings: &'a LinkerSettings) -> Result<Self> {
        settings.validate()?;
        let comparisons = ComparisonSet::compile(&settings.comparisons, store.schema())?;
        for rule in settings
            .blocking_rules
            .iter()
            .chain(&settings.training.em_rules)
        {
            if let Some(unknown) = rule
                .attributes()
                .iter()
                .find(|a| store.schema().position(a).is_none())
            {
                return Err(LinkageError::config(format!(
                    "blocking rule '{rule}' references unknown attribute '{unknown}'"
                )));
            }
        }
        Ok(Self {
            store,
            settings,
            comparisons,
        })
    }

    pub fn store(&self) -> &RecordStore {
        self.store
    }

    pub fn settings(&self) -> &LinkerSettings {
        self.settings
    }

    pub fn comparisons(&self) -> &ComparisonSet {
        &self.comparisons
    }

    pub fn initial_parameters(&self) -> ModelParameters {
        ModelParameters::initial(&self.comparisons, self.settings.training.initial_prior)
    }

    pub fn estimate_u(&self, params: &ModelParameters) -> Result<ModelParameters> {
        estimate_u_random_sampling(
            self.store,
            &self.comparisons,
            self.settings.training.u_sample_size,
            self.settings.training.seed,
            params,
        )
    }

    /// One EM round on `training_rule`, starting from `params` or, if none are
    /// given, from the untrained defaults.
    pub fn estimate_em(
        &self,
        training_rule: &BlockingRule,
        params: Option<&ModelParameters>,
    ) -> Result<EmOutcome> {
        let initial;
        let params = match params {
            Some(p) => p,
            None => {
                initial = self.initial_parameters();
                &initial
            }
        };
        params.validate(&self.comparisons)?;
        estimate_parameters_using_em(
            self.store,
            &self.comparisons,
            training_rule,
            params,
            &self.settings.blocking,
            &self.settings.training.em,
        )
    }

    /// u by random sampling, then one EM round per configured training rule,
    /// in order.
    pub fn train(&self) -> Result<TrainingReport> {
        let mut parameters = self.estimate_u(&self.initial_parameters())?;
        let mut rounds = Vec::with_capacity(self.settings.training.em_rules.len());
        let mut warnings = Vec::new();

        for rule in &self.settings.training.em_rules {
            let outcome = self.estimate_em(rule, Some(&parameters))?;
            parameters = outcome.parameters.clone();
            warnings.extend(outcome.warnings.iter().cloned());
            rounds.push(TrainingRound {
                rule: rule.to_string(),
                outcome,
            });
        }

        info!(
            rounds = rounds.len(),
            warnings = warnings.len(),
            prior = parameters.prior(),
            "training complete"
        );
        Ok(TrainingReport {
            parameters,
            rounds,
            warnings,
        })
    }

    /// Candidate pairs under the prediction blocking rules, with comparison vectors.
    pub fn candidates(&self) -> Result<Candidates> {
        let blocked = generate_candidates(
            self.store,
            &self.settings.blocking_rules,
            &self.settings.blocking,
        )?;
        let pairs = self.comparisons.compare_pairs(self.store, &blocked.pairs);
        Ok(Candidates {
            pairs,
            stats: blocked.stats,
            warnings: blocked.warnings,
        })
    }

    /// Predict at the configured threshold.
    pub fn predict(
        &self,
        candidates: &[CandidatePair],
        params: &ModelParameters,
    ) -> Result<Vec<PredictedLink>> {
        self.predict_with_threshold(candidates, params, self.settings.prediction.threshold)
    }

    pub fn predict_with_threshold(
        &self,
        candidates: &[CandidatePair],
        params: &ModelParameters,
        threshold: f64,
    ) -> Result<Vec<PredictedLink>> {
        predict(self.store, &self.comparisons, candidates, params, threshold)
    }
}
