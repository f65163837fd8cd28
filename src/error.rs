use std::fmt;

/// Fatal errors. Every variant is surfaced to the caller; nothing is silently coerced.
#[derive(Debug, thiserror::Error)]
pub enum LinkageError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("config parse error: {0}")]
    ConfigParse(String),

    #[error(
        "collection '{collection}' rejected: {} record(s) without an id, duplicate ids {duplicate_ids:?}",
        missing_id_rows.len()
    )]
    DataQuality {
        collection: String,
        /// Zero-based input positions of rows lacking the unique-id field.
        missing_id_rows: Vec<usize>,
        duplicate_ids: Vec<String>,
    },

    #[error("ground truth schema ambiguity: {0}")]
    SchemaAmbiguity(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkageError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, LinkageError>;

/// Non-fatal conditions. Returned next to the result they qualify.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkageWarning {
    /// EM hit its iteration cap; the last estimate was kept.
    Convergence {
        rule: String,
        iterations: usize,
        max_delta: f64,
    },
    /// A blocking key produced more pairs than the configured ceiling.
    Scale {
        rule: String,
        key: String,
        pairs: usize,
        ceiling: usize,
        skipped: bool,
    },
}

impl fmt::Display for LinkageWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Convergence {
                rule,
                iterations,
                max_delta,
            } => write!(
                f,
                "EM trained on '{rule}' did not converge after {iterations} iterations (max delta {max_delta:.3e})"
            ),
            Self::Scale {
                rule,
                key,
                pairs,
                ceiling,
                skipped,
            } => write!(
                f,
                "blocking rule '{rule}' key '{key}' yields {pairs} pairs (ceiling {ceiling}){}",
                if *skipped { ", skipped" } else { "" }
            ),
        }
    }
}
