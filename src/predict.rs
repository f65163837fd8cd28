//! Scoring candidate pairs with learned Fellegi-Sunter weights.

use rayon::prelude::*;
use tracing::info;

use crate::comparison::{CandidatePair, ComparisonSet, ComparisonVector, Gamma};
use crate::config::check_threshold;
use crate::error::Result;
use crate::params::{ModelParameters, PROBABILITY_FLOOR};
use crate::record::RecordStore;

/// One comparison's contribution to a link.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonOutcome {
    pub attribute: String,
    pub label: String,
    pub gamma: Gamma,
    pub bayes_factor: f64,
}

/// A scored candidate pair at or above the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictedLink {
    pub left_id: String,
    pub right_id: String,
    pub comparisons: Vec<ComparisonOutcome>,
    /// log2 posterior odds.
    pub match_weight: f64,
    pub match_probability: f64,
    /// Index of the blocking rule that produced the pair.
    pub match_key: usize,
}

/// log2 posterior odds: prior odds plus every comparison's log2 Bayes factor.
pub fn match_weight(vector: &ComparisonVector, params: &ModelParameters) -> f64 {
    let prior = params
        .prior()
        .clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR);
    let prior_weight = (prior / (1.0 - prior)).log2();
    vector
        .gammas()
        .iter()
        .enumerate()
        .map(|(index, &gamma)| params.bayes_factor(index, gamma).log2())
        .fold(prior_weight, |acc, w| acc + w)
}

/// Convert log2 odds to a probability.
pub fn weight_to_probability(weight: f64) -> f64 {
    let odds = weight.exp2();
    if odds.is_infinite() {
        1.0
    } else {
        odds / (1.0 + odds)
    }
}

/// Match probability of one pair under `params`, combining every comparison.
pub fn score(vector: &ComparisonVector, params: &ModelParameters) -> f64 {
    weight_to_probability(match_weight(vector, params))
}

/// Score all candidates in parallel and keep those with probability >=
/// `threshold`, in candidate order.
pub fn predict(
    store: &RecordStore,
    comparisons: &ComparisonSet,
    candidates: &[CandidatePair],
    params: &ModelParameters,
    threshold: f64,
) -> Result<Vec<PredictedLink>> {
    check_threshold(threshold)?;
    params.validate(comparisons)?;

    let links: Vec<PredictedLink> = candidates
        .par_iter()
        .filter_map(|pair| {
            let weight = match_weight(&pair.vector, params);
            let probability = weight_to_probability(weight);
            if probability < threshold {
                return None;
            }
            let outcomes = pair
                .vector
                .gammas()
                .iter()
                .enumerate()
                .map(|(index, &gamma)| {
                    let comparison = comparisons.get(index);
                    ComparisonOutcome {
                        attribute: comparison.attribute().to_string(),
                        label: comparison.label(gamma).to_string(),
                        gamma,
                        bayes_factor: params.bayes_factor(index, gamma),
                    }
                })
                .collect();
            Some(PredictedLink {
                left_id: store.left().id(pair.left).to_string(),
                right_id: store.right().id(pair.right).to_string(),
                comparisons: outcomes,
                match_weight: weight,
                match_probability: probability,
                match_key: pair.match_key,
            })
        })
        .collect();

    info!(
        candidates = candidates.len(),
        links = links.len(),
        threshold,
        "prediction complete"
    );
    Ok(links)
}
