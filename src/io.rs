//! Row-oriented interchange: CSV in, CSV out.

use std::io::{Read, Write};

use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use tracing::debug;

use crate::comparison::ComparisonSet;
use crate::error::{LinkageError, Result};
use crate::evaluate::{GroundTruth, GroundTruthColumns, IdPair};
use crate::predict::PredictedLink;
use crate::record::{CollectionInput, Row, Schema, Value};

fn column_index(headers: &StringRecord, name: &str) -> Result<usize> {
    headers.iter().position(|h| h == name).ok_or_else(|| {
        LinkageError::config(format!("CSV has no column '{name}'"))
    })
}

/// Resolve the id column plus every schema attribute against the header.
fn resolve_columns(
    headers: &StringRecord,
    schema: &Schema,
    unique_id_column: &str,
) -> Result<Vec<(String, usize)>> {
    std::iter::once(unique_id_column)
        .chain(schema.attributes().iter().map(String::as_str))
        .map(|name| Ok((name.to_string(), column_index(headers, name)?)))
        .collect()
}

fn to_row(record: &StringRecord, columns: &[(String, usize)]) -> Row {
    let mut row = Row::new();
    for (name, index) in columns {
        row.set(name.clone(), record.get(*index).and_then(Value::text));
    }
    row
}

/// Read one collection. Only the id column and the schema attributes are kept;
/// empty cells are missing values.
pub fn read_collection<R: Read>(
    reader: R,
    source: &str,
    schema: &Schema,
    unique_id_column: &str,
) -> Result<CollectionInput> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(reader);
    let headers = reader.headers()?.clone();
    let columns = resolve_columns(&headers, schema, unique_id_column)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(to_row(&record?, &columns));
    }
    debug!(source, rows = rows.len(), "read collection");
    Ok(CollectionInput::new(source, rows))
}

/// Read a file holding both collections, split on `source_column`. The first
/// tag seen becomes the left collection. Exactly two tags must be present.
pub fn read_combined<R: Read>(
    reader: R,
    schema: &Schema,
    unique_id_column: &str,
    source_column: &str,
) -> Result<(CollectionInput, CollectionInput)> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(reader);
    let headers = reader.headers()?.clone();
    let columns = resolve_columns(&headers, schema, unique_id_column)?;
    let source_index = column_index(&headers, source_column)?;

    let mut collections: Vec<CollectionInput> = Vec::with_capacity(2);
    let mut untagged = 0usize;
    for record in reader.records() {
        let record = record?;
        let tag = record.get(source_index).unwrap_or("");
        if tag.is_empty() {
            untagged += 1;
            continue;
        }
        let row = to_row(&record, &columns);
        match collections.iter_mut().find(|c| c.source == tag) {
            Some(collection) => collection.rows.push(row),
            None => collections.push(CollectionInput::new(tag, vec![row])),
        }
    }

    if untagged > 0 {
        return Err(LinkageError::config(format!(
            "{untagged} row(s) have no value in source column '{source_column}'"
        )));
    }
    let tags: Vec<&str> = collections.iter().map(|c| c.source.as_str()).collect();
    if collections.len() != 2 {
        return Err(LinkageError::config(format!(
            "link_only needs exactly two source tags in '{source_column}', found {tags:?}"
        )));
    }
    let right = collections.pop();
    let left = collections.pop();
    match (left, right) {
        (Some(left), Some(right)) => Ok((left, right)),
        _ => Err(LinkageError::config("combined input did not split into two collections")),
    }
}

/// Read ground-truth pairs using an explicit column mapping.
pub fn read_ground_truth<R: Read>(reader: R, columns: &GroundTruthColumns) -> Result<GroundTruth> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(reader);
    let headers = reader.headers()?.clone();
    let (left, right) = columns.resolve(headers.iter())?;

    let mut truth = GroundTruth::default();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        match (record.get(left), record.get(right)) {
            (Some(l), Some(r)) if !l.is_empty() && !r.is_empty() => {
                truth.insert(IdPair::new(l, r));
            }
            _ => {
                return Err(LinkageError::SchemaAmbiguity(format!(
                    "ground-truth row {} lacks a value for '{}' or '{}'",
                    line + 1,
                    columns.left,
                    columns.right
                )))
            }
        }
    }
    Ok(truth)
}

/// Write links as CSV: ids, weight, probability, blocking rule index, then a
/// `gamma_<attribute>` and `bf_<attribute>` column per comparison.
pub fn write_predictions<W: Write>(
    writer: W,
    comparisons: &ComparisonSet,
    links: &[PredictedLink],
) -> Result<()> {
    let mut writer = WriterBuilder::new().from_writer(writer);

    let mut header: Vec<String> = [
        "unique_id_l",
        "unique_id_r",
        "match_weight",
        "match_probability",
        "match_key",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    for comparison in comparisons.iter() {
        header.push(format!("gamma_{}", comparison.attribute()));
        header.push(format!("bf_{}", comparison.attribute()));
    }
    writer.write_record(&header)?;

    for link in links {
        let mut record = vec![
            link.left_id.clone(),
            link.right_id.clone(),
            link.match_weight.to_string(),
            link.match_probability.to_string(),
            link.match_key.to_string(),
        ];
        for outcome in &link.comparisons {
            record.push(outcome.gamma.to_string());
            record.push(outcome.bayes_factor.to_string());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
