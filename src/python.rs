use std::collections::HashMap;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::config::LinkerSettings;
use crate::error::LinkageError;
use crate::evaluate::{evaluate, GroundTruth, IdPair};
use crate::linker::Linker;
use crate::record::{CollectionInput, RecordStore, Row, Value};

fn to_py_err(err: LinkageError) -> PyErr {
    PyValueError::new_err(err.to_string())
}

/// One record as handed over from Python: column name to cell text.
type PyRecord = HashMap<String, Option<String>>;

fn to_rows(records: Vec<PyRecord>) -> Vec<Row> {
    records
        .into_iter()
        .map(|record| {
            let mut row = Row::new();
            for (name, cell) in record {
                row.set(name, cell.and_then(Value::text));
            }
            row
        })
        .collect()
}

/// A predicted link flattened for Python.
#[derive(Clone, Debug, IntoPyObject)]
struct LinkRow {
    unique_id_l: String,
    unique_id_r: String,
    match_weight: f64,
    match_probability: f64,
    match_key: usize,
    levels: HashMap<String, String>,
}

#[derive(Clone, Debug, IntoPyObject)]
struct EvaluationRow {
    precision: f64,
    recall: f64,
    f1: f64,
    true_positives: usize,
    false_positives: Vec<(String, String)>,
    false_negatives: Vec<(String, String)>,
}

fn link(
    left: Vec<PyRecord>,
    right: Vec<PyRecord>,
    left_source: &str,
    right_source: &str,
    settings_toml: &str,
) -> Result<Vec<LinkRow>, LinkageError> {
    let settings = LinkerSettings::from_toml(settings_toml)?;
    let store = RecordStore::link_only(
        settings.schema(),
        &settings.unique_id_column,
        CollectionInput::new(left_source, to_rows(left)),
        CollectionInput::new(right_source, to_rows(right)),
    )?;

    let linker = Linker::new(&store, &settings)?;
    let report = linker.train()?;
    let candidates = linker.candidates()?;
    let links = linker.predict(&candidates.pairs, &report.parameters)?;

    Ok(links
        .into_iter()
        .map(|link| LinkRow {
            unique_id_l: link.left_id,
            unique_id_r: link.right_id,
            match_weight: link.match_weight,
            match_probability: link.match_probability,
            match_key: link.match_key,
            levels: link
                .comparisons
                .into_iter()
                .map(|c| (c.attribute, c.label))
                .collect(),
        })
        .collect())
}

/// Train on both collections and return every link at or above the
/// configured threshold.
#[pyfunction]
fn link_records(
    left: Vec<PyRecord>,
    right: Vec<PyRecord>,
    left_source: &str,
    right_source: &str,
    settings_toml: &str,
) -> PyResult<Vec<LinkRow>> {
    link(left, right, left_source, right_source, settings_toml).map_err(to_py_err)
}

#[pyfunction]
fn evaluate_links(
    predicted: Vec<(String, String)>,
    truth: Vec<(String, String)>,
) -> EvaluationRow {
    let truth = GroundTruth::from_pairs(truth);
    let eval = evaluate(predicted, &truth);
    let flatten = |pairs: Vec<IdPair>| -> Vec<(String, String)> {
        pairs.into_iter().map(|p| (p.left, p.right)).collect()
    };
    EvaluationRow {
        precision: eval.precision,
        recall: eval.recall,
        f1: eval.f1,
        true_positives: eval.true_positives.len(),
        false_positives: flatten(eval.false_positives),
        false_negatives: flatten(eval.false_negatives),
    }
}

/// Jaro-Winkler over whitespace-sorted tokens, 0-100.
#[pyfunction]
fn token_sort_ratio(s1: &str, s2: &str) -> f64 {
    crate::comparison::token_sort_ratio(s1, s2)
}

/// Module name matches `[lib] name` so the built library exports `PyInit_record_linker`.
#[pymodule]
fn record_linker(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(link_records, m)?)?;
    m.add_function(wrap_pyfunction!(evaluate_links, m)?)?;
    m.add_function(wrap_pyfunction!(token_sort_ratio, m)?)?;
    Ok(())
}
