//! Fellegi-Sunter probabilistic record linkage between two collections.
//!
//! The pipeline is explicit: ingest into a [`RecordStore`], generate
//! candidates with [`generate_candidates`], estimate u by random sampling,
//! refine m with EM on training rules, then [`predict`] and [`evaluate`].
//! Trained state is always a [`ModelParameters`] value passed between steps.

pub mod blocking;
pub mod comparison;
pub mod config;
pub mod error;
pub mod estimate;
pub mod evaluate;
pub mod io;
pub mod linker;
pub mod params;
pub mod predict;
pub mod record;

#[cfg(feature = "python")]
mod python;

pub use blocking::{count_candidates, generate_candidates, BlockedPair, BlockingRule, RuleStats};
pub use comparison::{
    token_sort_ratio, CandidatePair, Comparator, ComparisonConfig, ComparisonSet,
    ComparisonVector, Gamma, LevelPredicate,
};
pub use config::{
    BlockingSettings, EmSettings, LinkType, LinkerSettings, PredictionSettings, TrainingSettings,
};
pub use error::{LinkageError, LinkageWarning, Result};
pub use estimate::{
    estimate_parameters_using_em, estimate_prior_from_deterministic_rules,
    estimate_u_random_sampling, EmOutcome,
};
pub use evaluate::{
    evaluate, evaluate_links, evaluate_links_with, evaluate_with, Evaluation, GroundTruth,
    GroundTruthColumns, IdPair, Orientation,
};
pub use linker::{Linker, TrainingReport};
pub use params::{ModelParameters, PROBABILITY_FLOOR};
pub use predict::{predict, score, PredictedLink};
pub use record::{CollectionInput, RecordStore, Row, Schema, Value};
