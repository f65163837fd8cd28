//! Record store: two labelled collections held column-wise.
//!
//! Records are addressed by dense `u32` row indices so candidate pairs stay
//! small; identifiers are resolved back through [`Collection::id`].

use std::borrow::Cow;
use std::fmt;
use std::ops::Range;

use ahash::AHashMap;
use chrono::NaiveDate;
use tracing::{debug, info};

use crate::error::{LinkageError, Result};

/// A scalar attribute value. Missing values are represented as `None` at the
/// use sites, never as a sentinel inside `Value`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
}

impl Value {
    /// Text value, or `None` when blank.
    pub fn text(s: impl Into<String>) -> Option<Self> {
        let s = s.into();
        if s.trim().is_empty() {
            None
        } else {
            Some(Self::Text(s))
        }
    }

    /// Float value, or `None` for NaN. `-0.0` is stored as `0.0`.
    pub fn float(x: f64) -> Option<Self> {
        if x.is_nan() {
            None
        } else if x == 0.0 {
            Some(Self::Float(0.0))
        } else {
            Some(Self::Float(x))
        }
    }

    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Text(s) => Cow::Borrowed(s.as_str()),
            Self::Integer(i) => Cow::Owned(i.to_string()),
            Self::Float(x) => Cow::Owned(x.to_string()),
            Self::Date(d) => Cow::Owned(d.format("%Y-%m-%d").to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Integer(i) => Some(*i as f64),
            Self::Float(x) => Some(*x),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Date(_) => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .or_else(|_| NaiveDate::parse_from_str(s.trim(), "%Y%m%d"))
                .ok(),
            _ => None,
        }
    }

    /// Append a type-tagged key fragment. Equal values produce equal fragments,
    /// and text is length-prefixed so a sequence of fragments decodes one way
    /// only, whatever the text contains.
    pub(crate) fn write_key(&self, out: &mut String) {
        use std::fmt::Write;
        // Writing into a String cannot fail.
        let _ = match self {
            Self::Text(s) => write!(out, "t{}:{s}", s.len()),
            Self::Integer(i) => write!(out, "i:{i}"),
            Self::Float(x) => write!(out, "f:{x:?}"),
            Self::Date(d) => write!(out, "d:{d}"),
        };
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Self::Date(d)
    }
}

/// One input row before ingestion: named fields, possibly including the
/// unique-id column.
#[derive(Debug, Clone, Default)]
pub struct Row {
    fields: Vec<(String, Option<Value>)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = match value.into() {
            Value::Text(s) => Value::text(s),
            Value::Float(x) => Value::float(x),
            other => Some(other),
        };
        self.fields.push((name.into(), value));
        self
    }

    pub fn with_missing(mut self, name: impl Into<String>) -> Self {
        self.fields.push((name.into(), None));
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Option<Value>) {
        self.fields.push((name.into(), value));
    }

    pub fn fields(&self) -> &[(String, Option<Value>)] {
        &self.fields
    }
}

/// Ordered attribute names shared by both collections.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    attributes: Vec<String>,
    positions: AHashMap<String, usize>,
}

impl Schema {
    pub fn new<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut schema = Self::default();
        for name in attributes {
            let name = name.into();
            if !schema.positions.contains_key(&name) {
                schema.positions.insert(name.clone(), schema.attributes.len());
                schema.attributes.push(name);
            }
        }
        schema
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Rows supplied for one collection, tagged with their source.
#[derive(Debug, Clone)]
pub struct CollectionInput {
    pub source: String,
    pub rows: Vec<Row>,
}

impl CollectionInput {
    pub fn new(source: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            source: source.into(),
            rows,
        }
    }
}

/// One ingested collection, stored column-wise.
#[derive(Debug)]
pub struct Collection {
    source: String,
    ids: Vec<String>,
    id_index: AHashMap<String, u32>,
    columns: Vec<Vec<Option<Value>>>,
}

impl Collection {
    fn ingest(input: CollectionInput, unique_id_column: &str, schema: &Schema) -> Result<Self> {
        let CollectionInput { source, rows } = input;
        if u32::try_from(rows.len()).is_err() {
            return Err(LinkageError::config(format!(
                "collection '{source}' has {} rows, more than a u32 index can address",
                rows.len()
            )));
        }

        let mut ids = Vec::with_capacity(rows.len());
        let mut id_index: AHashMap<String, u32> = AHashMap::with_capacity(rows.len());
        let mut columns: Vec<Vec<Option<Value>>> = (0..schema.len())
            .map(|_| Vec::with_capacity(rows.len()))
            .collect();
        let mut missing_id_rows = Vec::new();
        let mut duplicate_ids = Vec::new();

        for (pos, row) in rows.into_iter().enumerate() {
            let mut slots: Vec<Option<Value>> = vec![None; schema.len()];
            let mut id = None;
            for (name, value) in row.fields {
                if name == unique_id_column {
                    id = value.map(|v| v.as_text().trim().to_string());
                } else if let Some(p) = schema.position(&name) {
                    slots[p] = value;
                }
            }

            let Some(id) = id.filter(|id| !id.is_empty()) else {
                missing_id_rows.push(pos);
                continue;
            };
            if id_index.contains_key(&id) {
                duplicate_ids.push(id);
                continue;
            }

            #[allow(clippy::cast_possible_truncation)]
            let row_idx = ids.len() as u32;
            id_index.insert(id.clone(), row_idx);
            ids.push(id);
            for (column, slot) in columns.iter_mut().zip(slots) {
                column.push(slot);
            }
        }

        if !missing_id_rows.is_empty() || !duplicate_ids.is_empty() {
            duplicate_ids.sort();
            duplicate_ids.dedup();
            return Err(LinkageError::DataQuality {
                collection: source,
                missing_id_rows,
                duplicate_ids,
            });
        }

        debug!(source = %source, records = ids.len(), "ingested collection");
        Ok(Self {
            source,
            ids,
            id_index,
            columns,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Row indices in input order. Ingestion caps the length at `u32::MAX`.
    pub fn rows(&self) -> Range<u32> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.ids.len() as u32;
        0..len
    }

    pub fn id(&self, row: u32) -> &str {
        &self.ids[row as usize]
    }

    pub fn row_of(&self, id: &str) -> Option<u32> {
        self.id_index.get(id).copied()
    }

    pub fn value(&self, row: u32, attribute: usize) -> Option<&Value> {
        self.columns[attribute][row as usize].as_ref()
    }

    pub fn record(&self, row: u32) -> RecordRef<'_> {
        RecordRef {
            collection: self,
            row,
        }
    }
}

/// Borrowed view of one ingested record.
#[derive(Debug, Clone, Copy)]
pub struct RecordRef<'a> {
    collection: &'a Collection,
    row: u32,
}

impl<'a> RecordRef<'a> {
    pub fn id(&self) -> &'a str {
        self.collection.id(self.row)
    }

    pub fn source(&self) -> &'a str {
        self.collection.source()
    }

    pub fn value(&self, attribute: usize) -> Option<&'a Value> {
        self.collection.value(self.row, attribute)
    }
}

/// Both collections of a link-only job plus their shared schema.
#[derive(Debug)]
pub struct RecordStore {
    schema: Schema,
    left: Collection,
    right: Collection,
}

impl RecordStore {
    /// Ingest two collections. A collection with rows lacking an id, or with
    /// duplicate ids, is rejected whole.
    pub fn link_only(
        schema: Schema,
        unique_id_column: &str,
        left: CollectionInput,
        right: CollectionInput,
    ) -> Result<Self> {
        if left.source == right.source {
            return Err(LinkageError::config(format!(
                "link_only needs two distinct collections, both are tagged '{}'",
                left.source
            )));
        }
        if schema.position(unique_id_column).is_some() {
            return Err(LinkageError::config(format!(
                "unique id column '{unique_id_column}' cannot also be a compared attribute"
            )));
        }

        let left = Collection::ingest(left, unique_id_column, &schema)?;
        let right = Collection::ingest(right, unique_id_column, &schema)?;
        info!(
            left = %left.source,
            left_records = left.len(),
            right = %right.source,
            right_records = right.len(),
            "record store ready"
        );
        Ok(Self {
            schema,
            left,
            right,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn left(&self) -> &Collection {
        &self.left
    }

    pub fn right(&self) -> &Collection {
        &self.right
    }

    /// Size of the full cross product.
    pub fn total_cross_pairs(&self) -> u64 {
        self.left.len() as u64 * self.right.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(["given_name", "surname"])
    }

    fn row(id: &str, given: &str, surname: &str) -> Row {
        Row::new()
            .with("unique_id", id)
            .with("given_name", given)
            .with("surname", surname)
    }

    #[test]
    fn test_ingest_columnar() {
        let store = RecordStore::link_only(
            schema(),
            "unique_id",
            CollectionInput::new("a", vec![row("1", "ann", "lee"), row("2", "bob", "")]),
            CollectionInput::new("b", vec![row("x", "cid", "moe")]),
        )
        .unwrap();

        assert_eq!(store.left().len(), 2);
        assert_eq!(store.left().rows(), 0..2);
        assert_eq!(store.total_cross_pairs(), 2);
        let bob = store.left().record(1);
        assert_eq!(bob.id(), "2");
        assert_eq!(bob.source(), "a");
        assert_eq!(bob.value(0), Some(&Value::from("bob")));
        // Blank text is missing.
        assert_eq!(bob.value(1), None);
        assert_eq!(store.right().row_of("x"), Some(0));
    }

    #[test]
    fn test_duplicate_ids_reject_collection() {
        let err = RecordStore::link_only(
            schema(),
            "unique_id",
            CollectionInput::new("a", vec![row("1", "ann", "lee"), row("1", "amy", "lee")]),
            CollectionInput::new("b", vec![row("x", "cid", "moe")]),
        )
        .unwrap_err();
        match err {
            LinkageError::DataQuality {
                collection,
                duplicate_ids,
                missing_id_rows,
            } => {
                assert_eq!(collection, "a");
                assert_eq!(duplicate_ids, vec!["1".to_string()]);
                assert!(missing_id_rows.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_id_reported_by_position() {
        let no_id = Row::new().with("given_name", "zed");
        let err = RecordStore::link_only(
            schema(),
            "unique_id",
            CollectionInput::new("a", vec![row("1", "ann", "lee")]),
            CollectionInput::new("b", vec![row("x", "cid", "moe"), no_id]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LinkageError::DataQuality { ref collection, ref missing_id_rows, .. }
                if collection == "b" && missing_id_rows == &vec![1]
        ));
    }

    #[test]
    fn test_same_source_tag_rejected() {
        let err = RecordStore::link_only(
            schema(),
            "unique_id",
            CollectionInput::new("a", vec![]),
            CollectionInput::new("a", vec![]),
        )
        .unwrap_err();
        assert!(matches!(err, LinkageError::Configuration(_)));
    }

    #[test]
    fn test_value_normalisation() {
        assert_eq!(Value::float(f64::NAN), None);
        assert_eq!(Value::float(-0.0), Some(Value::Float(0.0)));
        assert_eq!(Value::text("   "), None);

        let mut a = String::new();
        let mut b = String::new();
        Value::Integer(5).write_key(&mut a);
        Value::from("5").write_key(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_text_keys_are_length_prefixed() {
        fn key(values: &[&str]) -> String {
            let mut out = String::new();
            for v in values {
                Value::from(*v).write_key(&mut out);
                out.push('\u{1f}');
            }
            out
        }
        assert_eq!(key(&["ann"]), "t3:ann\u{1f}");
        assert_ne!(key(&["x\u{1f}t:y", "z"]), key(&["x", "y\u{1f}t:z"]));
    }

    #[test]
    fn test_value_date_parsing() {
        let d = NaiveDate::from_ymd_opt(1990, 3, 14).unwrap();
        assert_eq!(Value::from("19900314").as_date(), Some(d));
        assert_eq!(Value::from("1990-03-14").as_date(), Some(d));
        assert_eq!(Value::Date(d).as_text(), "1990-03-14");
    }
}
