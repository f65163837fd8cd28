//! Parameter estimation: u from random sampling, m (and the prior) from EM.
//!
//! Both phases are pure: they take the current [`ModelParameters`] and return
//! a new value. Within an EM iteration the E and M statistics are a rayon
//! fold/reduce over pairs; iterations themselves are sequential.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::blocking::{count_candidates, generate_candidates, BlockingRule};
use crate::comparison::{ComparisonSet, ComparisonVector};
use crate::config::{BlockingSettings, EmSettings};
use crate::error::{LinkageError, LinkageWarning, Result};
use crate::params::{clamp_probability, ModelParameters, PROBABILITY_FLOOR};
use crate::record::RecordStore;

// ---------------------------------------------------------------------------
// u: random sampling
// ---------------------------------------------------------------------------

/// Estimate u for every comparison level from uniformly drawn cross pairs.
///
/// Random pairs are almost all non-matches, so the empirical level frequencies
/// approximate u. Pairs are drawn with replacement from a `StdRng` seeded with
/// `seed`; if `sample_size` covers the whole cross product, every pair is used
/// once instead. m values are carried over unchanged.
pub fn estimate_u_random_sampling(
    store: &RecordStore,
    comparisons: &ComparisonSet,
    sample_size: usize,
    seed: u64,
    params: &ModelParameters,
) -> Result<ModelParameters> {
    let (n_left, n_right) = (store.left().len(), store.right().len());
    if n_left == 0 || n_right == 0 {
        return Err(LinkageError::config(
            "cannot sample pairs for u estimation: a collection is empty",
        ));
    }

    let total = store.total_cross_pairs();
    let pairs: Vec<(u32, u32)> = if sample_size as u64 >= total {
        let right_rows = store.right().rows();
        store
            .left()
            .rows()
            .flat_map(|l| right_rows.clone().map(move |r| (l, r)))
            .collect()
    } else {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..sample_size)
            .map(|_| {
                (
                    rng.gen_range(store.left().rows()),
                    rng.gen_range(store.right().rows()),
                )
            })
            .collect()
    };

    let shape: Vec<usize> = comparisons.iter().map(|c| c.num_levels()).collect();
    let counts = pairs
        .par_iter()
        .fold(
            || LevelCounts::new(&shape),
            |mut acc, &(l, r)| {
                let vector =
                    comparisons.build_vector(store.left().record(l), store.right().record(r));
                acc.add(&vector);
                acc
            },
        )
        .reduce(|| LevelCounts::new(&shape), LevelCounts::merge);

    let mut updated = params.clone();
    for (index, comparison) in comparisons.iter().enumerate() {
        let level_counts = &counts.0[index];
        let observed: u64 = level_counts.iter().sum();
        if observed == 0 {
            warn!(
                attribute = comparison.attribute(),
                "no non-null comparisons in u sample, keeping previous u"
            );
            continue;
        }
        let u: Vec<f64> = level_counts
            .iter()
            .map(|&c| c as f64 / observed as f64)
            .collect();
        for (label, &count) in comparison.level_labels().iter().zip(level_counts) {
            if count == 0 {
                warn!(
                    attribute = comparison.attribute(),
                    level = %label,
                    "level never observed among sampled pairs, u is 0"
                );
            }
        }
        updated.set_u(index, &u);
    }

    info!(sampled_pairs = pairs.len(), seed, "u probabilities estimated");
    Ok(updated)
}

struct LevelCounts(Vec<Vec<u64>>);

impl LevelCounts {
    fn new(shape: &[usize]) -> Self {
        Self(shape.iter().map(|&n| vec![0; n]).collect())
    }

    fn add(&mut self, vector: &ComparisonVector) {
        for (counts, gamma) in self.0.iter_mut().zip(vector.gammas()) {
            if let Some(level) = gamma.index() {
                counts[level] += 1;
            }
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (a, b) in self.0.iter_mut().zip(other.0) {
            for (x, y) in a.iter_mut().zip(b) {
                *x += y;
            }
        }
        self
    }
}

// ---------------------------------------------------------------------------
// m: expectation maximisation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EmIteration {
    pub iteration: usize,
    /// Observed-data log-likelihood under the parameters this iteration started from.
    pub log_likelihood: f64,
    pub max_delta: f64,
    pub prior: f64,
}

#[derive(Debug, Clone)]
pub struct EmOutcome {
    pub parameters: ModelParameters,
    pub iterations: Vec<EmIteration>,
    pub converged: bool,
    pub training_pairs: usize,
    /// Attributes whose m values this round re-estimated.
    pub trained_comparisons: Vec<String>,
    pub warnings: Vec<LinkageWarning>,
}

/// Sufficient statistics of one E-step.
struct Expectation {
    /// Posterior-weighted level counts per comparison.
    weighted: Vec<Vec<f64>>,
    posterior_sum: f64,
    log_likelihood: f64,
}

impl Expectation {
    fn new(shape: &[usize]) -> Self {
        Self {
            weighted: shape.iter().map(|&n| vec![0.0; n]).collect(),
            posterior_sum: 0.0,
            log_likelihood: 0.0,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (a, b) in self.weighted.iter_mut().zip(other.weighted) {
            for (x, y) in a.iter_mut().zip(b) {
                *x += y;
            }
        }
        self.posterior_sum += other.posterior_sum;
        self.log_likelihood += other.log_likelihood;
        self
    }
}

/// Posterior match probability and log marginal likelihood of one pair,
/// combining only the active comparisons.
fn posterior(
    vector: &ComparisonVector,
    params: &ModelParameters,
    prior: f64,
    active: &[bool],
) -> (f64, f64) {
    let mut log_match = prior.ln();
    let mut log_non_match = (1.0 - prior).ln();
    for (index, gamma) in vector.gammas().iter().enumerate() {
        if !active[index] {
            continue;
        }
        if let Some(level) = gamma.index() {
            let level = &params.comparison(index).levels[level];
            log_match += clamp_probability(level.m).ln();
            log_non_match += clamp_probability(level.u).ln();
        }
    }
    let hi = log_match.max(log_non_match);
    let log_marginal = hi + ((log_match - hi).exp() + (log_non_match - hi).exp()).ln();
    ((log_match - log_marginal).exp(), log_marginal)
}

/// Run EM on precomputed comparison vectors.
///
/// Comparisons with `active[i] == false` are ignored in the E-step and keep
/// their m values. u is held fixed. Stops when the largest absolute change of
/// any active m or of the prior drops below `settings.tolerance`, or after
/// `settings.max_iterations`; the latter keeps the last estimate and returns a
/// [`LinkageWarning::Convergence`].
pub fn expectation_maximisation(
    vectors: &[ComparisonVector],
    active: &[bool],
    params: &ModelParameters,
    settings: &EmSettings,
    rule_label: &str,
) -> EmOutcome {
    let trained_comparisons: Vec<String> = params
        .comparisons()
        .iter()
        .zip(active)
        .filter(|(_, a)| **a)
        .map(|(c, _)| c.attribute.clone())
        .collect();

    if vectors.is_empty() {
        warn!(rule = rule_label, "no training pairs, parameters unchanged");
        return EmOutcome {
            parameters: params.clone(),
            iterations: Vec::new(),
            converged: true,
            training_pairs: 0,
            trained_comparisons,
            warnings: Vec::new(),
        };
    }

    let shape: Vec<usize> = params.comparisons().iter().map(|c| c.levels.len()).collect();
    let mut current = params.clone();
    let mut prior = params.prior().clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR);
    let mut iterations = Vec::with_capacity(settings.max_iterations);
    let mut converged = false;

    for iteration in 1..=settings.max_iterations {
        let expectation = vectors
            .par_iter()
            .fold(
                || Expectation::new(&shape),
                |mut acc, vector| {
                    let (p, log_marginal) = posterior(vector, &current, prior, active);
                    acc.posterior_sum += p;
                    acc.log_likelihood += log_marginal;
                    for (index, gamma) in vector.gammas().iter().enumerate() {
                        if let (true, Some(level)) = (active[index], gamma.index()) {
                            acc.weighted[index][level] += p;
                        }
                    }
                    acc
                },
            )
            .reduce(|| Expectation::new(&shape), Expectation::merge);

        let new_prior = (expectation.posterior_sum / vectors.len() as f64)
            .clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR);
        let mut max_delta = (new_prior - prior).abs();
        for (index, weighted) in expectation.weighted.iter().enumerate() {
            if !active[index] {
                continue;
            }
            let total: f64 = weighted.iter().sum();
            if total <= 0.0 {
                continue;
            }
            let m: Vec<f64> = weighted.iter().map(|w| w / total).collect();
            for (old, new) in current.m_values(index).iter().zip(&m) {
                max_delta = max_delta.max((old - new).abs());
            }
            current.set_m(index, &m);
        }

        debug!(
            rule = rule_label,
            iteration,
            max_delta,
            prior = new_prior,
            log_likelihood = expectation.log_likelihood,
            "EM iteration"
        );
        iterations.push(EmIteration {
            iteration,
            log_likelihood: expectation.log_likelihood,
            max_delta,
            prior: new_prior,
        });
        prior = new_prior;

        if max_delta < settings.tolerance {
            converged = true;
            break;
        }
    }

    let mut warnings = Vec::new();
    if !converged {
        let max_delta = iterations.last().map_or(f64::NAN, |i| i.max_delta);
        warn!(
            rule = rule_label,
            iterations = iterations.len(),
            max_delta,
            "EM reached the iteration cap without converging"
        );
        warnings.push(LinkageWarning::Convergence {
            rule: rule_label.to_string(),
            iterations: iterations.len(),
            max_delta,
        });
    }

    let parameters = if settings.update_prior {
        current.with_prior(prior)
    } else {
        current.with_prior(params.prior())
    };

    info!(
        rule = rule_label,
        iterations = iterations.len(),
        converged,
        training_pairs = vectors.len(),
        prior = parameters.prior(),
        "EM round finished"
    );

    EmOutcome {
        parameters,
        iterations,
        converged,
        training_pairs: vectors.len(),
        trained_comparisons,
        warnings,
    }
}

/// One EM training round: block on `training_rule`, compare, and run EM with
/// every comparison on the rule's attributes held out. A comparison on a
/// blocking attribute always agrees within its own training pairs, so letting
/// it vote would only confirm the rule.
pub fn estimate_parameters_using_em(
    store: &RecordStore,
    comparisons: &ComparisonSet,
    training_rule: &BlockingRule,
    params: &ModelParameters,
    blocking: &BlockingSettings,
    em: &EmSettings,
) -> Result<EmOutcome> {
    let active: Vec<bool> = comparisons
        .iter()
        .map(|c| !training_rule.uses(c.attribute()))
        .collect();
    if !active.iter().any(|&a| a) {
        return Err(LinkageError::config(format!(
            "training rule '{training_rule}' blocks on every compared attribute, nothing left to train"
        )));
    }

    let blocked = generate_candidates(store, std::slice::from_ref(training_rule), blocking)?;
    if blocked.pairs.is_empty() {
        return Err(LinkageError::config(format!(
            "training rule '{training_rule}' produced no candidate pairs"
        )));
    }
    let vectors: Vec<ComparisonVector> = comparisons
        .compare_pairs(store, &blocked.pairs)
        .into_iter()
        .map(|c| c.vector)
        .collect();

    let mut outcome =
        expectation_maximisation(&vectors, &active, params, em, &training_rule.to_string());
    let mut warnings = blocked.warnings;
    warnings.append(&mut outcome.warnings);
    outcome.warnings = warnings;
    Ok(outcome)
}

/// Prior from rules believed to identify matches with near certainty:
/// (pairs satisfying any rule / `recall`) / |left x right|.
pub fn estimate_prior_from_deterministic_rules(
    store: &RecordStore,
    rules: &[BlockingRule],
    recall: f64,
    blocking: &BlockingSettings,
) -> Result<f64> {
    if !(recall > 0.0 && recall <= 1.0) {
        return Err(LinkageError::config(format!(
            "recall {recall} must lie in (0, 1]"
        )));
    }
    let total = store.total_cross_pairs();
    if total == 0 {
        return Err(LinkageError::config(
            "cannot estimate a prior: a collection is empty",
        ));
    }
    let matched: usize = count_candidates(store, rules, blocking)?
        .iter()
        .map(|s| s.new_pairs)
        .sum();
    let prior = (matched as f64 / recall) / total as f64;
    info!(matched, recall, prior, "prior estimated from deterministic rules");
    Ok(prior.clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR))
}
