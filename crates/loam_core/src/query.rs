//! View query options, result rows, and grouping helpers.

use crate::revision::Body;
use serde_json::{Map, Value};

/// Options for querying a view index.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Restrict results to exactly these keys.
    pub keys: Option<Vec<Value>>,
    /// Lower bound of the key range (upper bound when descending).
    pub start_key: Option<Value>,
    /// Upper bound of the key range (lower bound when descending).
    pub end_key: Option<Value>,
    /// Whether the end of the range is included.
    pub inclusive_end: bool,
    /// Reverse the key order.
    pub descending: bool,
    /// Maximum number of rows.
    pub limit: usize,
    /// Rows to skip from the start of the result.
    pub skip: usize,
    /// Group reduced results by key.
    pub group: bool,
    /// Group array keys by their first `group_level` elements.
    pub group_level: usize,
    /// Run the view's reduce function.
    pub reduce: bool,
    /// Attach the source document's properties to each row.
    pub prefetch: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            keys: None,
            start_key: None,
            end_key: None,
            inclusive_end: true,
            descending: false,
            limit: usize::MAX,
            skip: 0,
            group: false,
            group_level: 0,
            reduce: false,
            prefetch: false,
        }
    }
}

impl QueryOptions {
    /// Restricts the query to the given keys.
    #[must_use]
    pub fn with_keys(mut self, keys: Vec<Value>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Sets the start of the key range.
    #[must_use]
    pub fn with_start_key(mut self, key: Value) -> Self {
        self.start_key = Some(key);
        self
    }

    /// Sets the end of the key range.
    #[must_use]
    pub fn with_end_key(mut self, key: Value) -> Self {
        self.end_key = Some(key);
        self
    }

    /// Excludes the end key from the range.
    #[must_use]
    pub fn without_inclusive_end(mut self) -> Self {
        self.inclusive_end = false;
        self
    }

    /// Reverses the ordering.
    #[must_use]
    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Caps the number of returned rows.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Skips the first `skip` rows.
    #[must_use]
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Enables the reduce step.
    #[must_use]
    pub fn reduced(mut self) -> Self {
        self.reduce = true;
        self
    }

    /// Groups reduced rows by the first `level` elements of array keys.
    #[must_use]
    pub fn with_group_level(mut self, level: usize) -> Self {
        self.group_level = level;
        self
    }

    /// Attaches document properties to each row.
    #[must_use]
    pub fn with_prefetch(mut self) -> Self {
        self.prefetch = true;
        self
    }
}

/// A result row from a view query.
#[derive(Debug, Clone)]
pub struct QueryRow {
    /// The key emitted by the map function (or the group key).
    pub key: Value,
    /// The emitted value, or the reduced value for grouped queries.
    pub value: Value,
    /// The document that caused this row to be emitted. `None` for reduced
    /// or grouped rows, which don't correspond to individual documents.
    pub source_doc_id: Option<String>,
    /// The sequence of the revision the row was mapped from.
    pub sequence: u64,
    /// The source document's properties, when prefetch was requested.
    pub document_properties: Option<Body>,
}

impl QueryRow {
    /// The id of the document described by the row. Usually the source
    /// document, unless the map function linked another document by putting
    /// an `_id` in the emitted value.
    #[must_use]
    pub fn document_id(&self) -> Option<&str> {
        self.document_properties
            .as_ref()
            .and_then(|p| p.get("_id"))
            .and_then(Value::as_str)
            .or(self.source_doc_id.as_deref())
    }

    /// JSON representation of the row, in the shape of a CouchDB view
    /// result entry.
    #[must_use]
    pub fn as_json(&self) -> Map<String, Value> {
        let mut out = Map::new();
        if !self.value.is_null() || self.source_doc_id.is_some() {
            out.insert("key".into(), self.key.clone());
            if !self.value.is_null() {
                out.insert("value".into(), self.value.clone());
            }
            out.insert(
                "id".into(),
                self.source_doc_id
                    .as_ref()
                    .map_or(Value::Null, |id| Value::from(id.clone())),
            );
            if let Some(props) = &self.document_properties {
                out.insert("doc".into(), Value::Object(props.clone()));
            }
        } else {
            out.insert("key".into(), self.key.clone());
            out.insert("error".into(), Value::from("not_found"));
        }
        out
    }
}

/// Equality is structural on key, source document, document properties and
/// value. When neither row emitted a value there is nothing else to compare,
/// so the sequences decide whether anything about the document changed.
/// Used to suppress spurious live-query change notifications, so false
/// positives here mean missed updates for clients.
impl PartialEq for QueryRow {
    fn eq(&self, other: &Self) -> bool {
        if self.key != other.key
            || self.source_doc_id != other.source_doc_id
            || self.document_properties != other.document_properties
        {
            return false;
        }
        if !self.value.is_null() || !other.value.is_null() {
            self.value == other.value
        } else {
            self.sequence == other.sequence
        }
    }
}

/// Whether two keys fall into the same group at this group level.
///
/// Level 0 (or non-array keys) means exact equality; otherwise the first
/// `min(level, len(k1), len(k2))` elements are compared structurally.
#[must_use]
pub fn group_together(k1: &Value, k2: &Value, group_level: usize) -> bool {
    let (Some(a1), Some(a2)) = (k1.as_array(), k2.as_array()) else {
        return k1 == k2;
    };
    if group_level == 0 {
        return k1 == k2;
    }
    let end = group_level.min(a1.len()).min(a2.len());
    a1[..end] == a2[..end]
}

/// The key prefix to report for a group at this level.
#[must_use]
pub fn group_key(key: &Value, group_level: usize) -> Value {
    match key.as_array() {
        Some(arr) if group_level > 0 && arr.len() > group_level => {
            Value::Array(arr[..group_level].to_vec())
        }
        _ => key.clone(),
    }
}

/// Reduce helper: totals an array of numbers, ignoring everything else.
#[must_use]
pub fn total_values(values: &[Value]) -> f64 {
    values.iter().filter_map(Value::as_f64).sum()
}
