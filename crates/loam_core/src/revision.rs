//! Document revisions and revision ids.

use crate::error::{CoreError, CoreResult};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A document body: a schemaless JSON object.
pub type Body = Map<String, Value>;

/// A revision id of the form `N-hash`, where `N` is the generation (depth in
/// the revision tree) and `hash` an opaque suffix.
///
/// Ordering is generation first, then suffix lexicographically; the maximum
/// among conflicting current revisions is the winner.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RevId {
    generation: u64,
    suffix: String,
}

impl RevId {
    /// Builds a revision id from its parts.
    #[must_use]
    pub fn new(generation: u64, suffix: impl Into<String>) -> Self {
        Self {
            generation,
            suffix: suffix.into(),
        }
    }

    /// Parses an `N-hash` string.
    pub fn parse(s: &str) -> CoreResult<Self> {
        let (gen_str, suffix) = s
            .split_once('-')
            .ok_or_else(|| CoreError::InvalidRevisionId(s.to_string()))?;
        let generation: u64 = gen_str
            .parse()
            .map_err(|_| CoreError::InvalidRevisionId(s.to_string()))?;
        if generation == 0 || suffix.is_empty() {
            return Err(CoreError::InvalidRevisionId(s.to_string()));
        }
        Ok(Self {
            generation,
            suffix: suffix.to_string(),
        })
    }

    /// The generation (the `N` in `N-hash`).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The opaque hash suffix.
    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

impl FromStr for RevId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.suffix.cmp(&other.suffix))
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.suffix)
    }
}

impl fmt::Debug for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevId({self})")
    }
}

/// One immutable version of a document.
#[derive(Clone, Debug, PartialEq)]
pub struct Revision {
    /// Document id.
    pub doc_id: String,
    /// Revision id.
    pub rev_id: RevId,
    /// Sequence number in the database this revision was read from
    /// (0 for revisions not yet stored locally).
    pub sequence: u64,
    /// Whether this revision is a deletion tombstone.
    pub deleted: bool,
    /// The JSON body, if loaded. `None` for bare references.
    pub body: Option<Body>,
}

impl Revision {
    /// Creates a revision with a body.
    #[must_use]
    pub fn new(doc_id: impl Into<String>, rev_id: RevId, body: Body) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            sequence: 0,
            deleted: false,
            body: Some(body),
        }
    }

    /// Creates a deletion tombstone.
    #[must_use]
    pub fn tombstone(doc_id: impl Into<String>, rev_id: RevId) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            sequence: 0,
            deleted: true,
            body: None,
        }
    }

    /// Builds a revision from wire-format document properties (`_id`,
    /// `_rev`, `_deleted`, plus the user fields).
    pub fn from_properties(props: Body) -> CoreResult<Self> {
        let doc_id = props
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::NotFound("document without _id".into()))?
            .to_string();
        let rev_id = props
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::InvalidRevisionId("document without _rev".into()))?
            .parse()?;
        let deleted = props.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
        Ok(Self {
            doc_id,
            rev_id,
            sequence: 0,
            deleted,
            body: Some(props),
        })
    }

    /// The `_attachments` metadata object, if the body carries one.
    #[must_use]
    pub fn attachments(&self) -> Option<&Map<String, Value>> {
        self.body
            .as_ref()
            .and_then(|b| b.get("_attachments"))
            .and_then(Value::as_object)
    }

    /// Whether the body references any attachments.
    #[must_use]
    pub fn has_attachments(&self) -> bool {
        self.attachments().is_some_and(|a| !a.is_empty())
    }

    /// The body without the underscore-prefixed metadata properties.
    #[must_use]
    pub fn user_properties(&self) -> Body {
        self.body
            .as_ref()
            .map(|b| {
                b.iter()
                    .filter(|(k, _)| !k.starts_with('_'))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rev_id_parse_and_display() {
        let rev: RevId = "3-deadbeef".parse().unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.suffix(), "deadbeef");
        assert_eq!(rev.to_string(), "3-deadbeef");
    }

    #[test]
    fn rev_id_rejects_malformed() {
        assert!(RevId::parse("nodash").is_err());
        assert!(RevId::parse("x-abc").is_err());
        assert!(RevId::parse("0-abc").is_err());
        assert!(RevId::parse("2-").is_err());
    }

    #[test]
    fn winner_orders_by_generation_then_suffix() {
        let a: RevId = "2-a".parse().unwrap();
        let b: RevId = "2-b".parse().unwrap();
        let c: RevId = "10-a".parse().unwrap();
        assert!(b > a);
        assert!(c > b); // generation compares numerically, not lexically
    }

    #[test]
    fn revision_from_properties() {
        let props = json!({"_id": "doc1", "_rev": "1-abc", "title": "hello"});
        let rev = Revision::from_properties(props.as_object().unwrap().clone()).unwrap();
        assert_eq!(rev.doc_id, "doc1");
        assert_eq!(rev.rev_id.to_string(), "1-abc");
        assert!(!rev.deleted);
        assert_eq!(rev.user_properties().get("title"), Some(&json!("hello")));
    }

    #[test]
    fn tombstone_from_properties() {
        let props = json!({"_id": "gone", "_rev": "2-x", "_deleted": true});
        let rev = Revision::from_properties(props.as_object().unwrap().clone()).unwrap();
        assert!(rev.deleted);
    }

    #[test]
    fn attachments_detected() {
        let props = json!({
            "_id": "d", "_rev": "1-a",
            "_attachments": {"photo.png": {"content_type": "image/png", "length": 4}}
        });
        let rev = Revision::from_properties(props.as_object().unwrap().clone()).unwrap();
        assert!(rev.has_attachments());
        assert!(rev.attachments().unwrap().contains_key("photo.png"));
    }
}
