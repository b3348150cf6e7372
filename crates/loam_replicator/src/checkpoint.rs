//! Replication checkpoints: `_local/<id>` documents on the remote.

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

/// Derives the checkpoint document id for a replication.
///
/// Hex SHA-1 of `"<localUUID>\n<remoteURL>\n<push?1:0>"`. The private store
/// UUID makes the id stable across restarts yet unguessable from the
/// outside. Pure: same inputs, same id.
#[must_use]
pub fn checkpoint_doc_id(local_uuid: &str, remote_url: &str, push: bool) -> String {
    let input = format!("{local_uuid}\n{remote_url}\n{}", u8::from(push));
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Client-side state of one remote checkpoint document.
///
/// Tracks the last fetched body (so unknown fields the remote stored are
/// echoed back on save), the `_rev` needed to update it, and the save
/// discipline: at most one PUT in flight, with an `overdue` flag re-arming
/// a save that was requested while one was running.
#[derive(Debug, Default)]
pub struct Checkpoint {
    doc_id: String,
    body: Map<String, Value>,
    saving: bool,
    overdue: bool,
}

impl Checkpoint {
    /// A checkpoint for the given document id.
    #[must_use]
    pub fn new(doc_id: String) -> Self {
        Self {
            doc_id,
            body: Map::new(),
            saving: false,
            overdue: false,
        }
    }

    /// The `_local/<id>` document id.
    #[must_use]
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// The remote's recorded `lastSequence`, if a body has been fetched.
    #[must_use]
    pub fn remote_last_sequence(&self) -> Option<&str> {
        self.body.get("lastSequence").and_then(Value::as_str)
    }

    /// The `_rev` required for the next save, if known.
    #[must_use]
    pub fn rev(&self) -> Option<&str> {
        self.body.get("_rev").and_then(Value::as_str)
    }

    /// Records a fetched checkpoint body (or clears state on 404).
    pub fn on_fetched(&mut self, body: Option<Map<String, Value>>) {
        self.body = body.unwrap_or_default();
    }

    /// Whether a PUT is currently in flight.
    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.saving
    }

    /// Called when a save is wanted. Returns the body to PUT, or `None` if
    /// a save is already in flight; in that case the request is recorded
    /// and [`Checkpoint::on_saved`] will report it as overdue.
    pub fn begin_save(&mut self, last_sequence: &str) -> Option<Map<String, Value>> {
        if self.saving {
            self.overdue = true;
            return None;
        }
        self.saving = true;
        self.overdue = false;
        let mut body = self.body.clone();
        body.insert("lastSequence".into(), Value::from(last_sequence.to_string()));
        Some(body)
    }

    /// Records a successful PUT: the saved body plus the new `_rev` becomes
    /// the cached state. Returns `true` if another save is overdue.
    pub fn on_saved(&mut self, mut saved_body: Map<String, Value>, new_rev: Option<&str>) -> bool {
        self.saving = false;
        if let Some(rev) = new_rev {
            saved_body.insert("_rev".into(), Value::from(rev.to_string()));
        }
        self.body = saved_body;
        std::mem::take(&mut self.overdue)
    }

    /// Records a failed PUT with a 404: the remote document was deleted, so
    /// the cached body (and its `_rev`) is dropped and a re-save is due.
    pub fn on_save_not_found(&mut self) {
        self.saving = false;
        self.body = Map::new();
        self.overdue = true;
    }

    /// Records a failed PUT with a 409: someone else updated the document.
    /// The caller must refresh (GET) to re-acquire `_rev` and then save
    /// again.
    pub fn on_save_conflict(&mut self) {
        // Still "saving" from the caller's point of view: the refresh and
        // re-save continue the same logical save.
        self.saving = true;
    }

    /// Records a refresh result; the next save uses the refreshed `_rev`.
    pub fn on_refreshed(&mut self, body: Option<Map<String, Value>>) {
        self.saving = false;
        self.body = body.unwrap_or_default();
    }

    /// Records a failed PUT for any other reason.
    pub fn on_save_failed(&mut self) -> bool {
        self.saving = false;
        std::mem::take(&mut self.overdue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn doc_id_is_deterministic() {
        let a = checkpoint_doc_id("uuid-1", "http://remote/db", false);
        let b = checkpoint_doc_id("uuid-1", "http://remote/db", false);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn doc_id_depends_on_all_inputs() {
        let base = checkpoint_doc_id("uuid-1", "http://remote/db", false);
        assert_ne!(base, checkpoint_doc_id("uuid-2", "http://remote/db", false));
        assert_ne!(base, checkpoint_doc_id("uuid-1", "http://other/db", false));
        assert_ne!(base, checkpoint_doc_id("uuid-1", "http://remote/db", true));
    }

    fn fetched_body() -> Map<String, Value> {
        json!({"lastSequence": "10", "_rev": "0-1", "extra": {"custom": true}})
            .as_object()
            .unwrap()
            .clone()
    }

    #[test]
    fn save_body_echoes_unknown_fields() {
        let mut cp = Checkpoint::new("abc".into());
        cp.on_fetched(Some(fetched_body()));
        let body = cp.begin_save("42").unwrap();
        assert_eq!(body["lastSequence"], json!("42"));
        assert_eq!(body["_rev"], json!("0-1"));
        assert_eq!(body["extra"], json!({"custom": true}));
    }

    #[test]
    fn only_one_save_in_flight() {
        let mut cp = Checkpoint::new("abc".into());
        let body = cp.begin_save("1").unwrap();
        assert!(cp.is_saving());
        assert!(cp.begin_save("2").is_none());

        // Completion reports the overdue save.
        let overdue = cp.on_saved(body, Some("0-2"));
        assert!(overdue);
        assert!(!cp.is_saving());
        assert_eq!(cp.rev(), Some("0-2"));

        // And the re-save picks up the new rev.
        let body = cp.begin_save("2").unwrap();
        assert_eq!(body["_rev"], json!("0-2"));
        assert!(!cp.on_saved(body, Some("0-3")));
    }

    #[test]
    fn not_found_on_save_drops_rev_and_rearms() {
        let mut cp = Checkpoint::new("abc".into());
        cp.on_fetched(Some(fetched_body()));
        cp.begin_save("11").unwrap();
        cp.on_save_not_found();
        assert!(!cp.is_saving());
        assert_eq!(cp.rev(), None);
        // The next save carries no _rev (fresh create).
        let body = cp.begin_save("11").unwrap();
        assert!(!body.contains_key("_rev"));
    }

    #[test]
    fn conflict_keeps_save_in_progress_until_refresh() {
        let mut cp = Checkpoint::new("abc".into());
        cp.on_fetched(Some(fetched_body()));
        cp.begin_save("12").unwrap();
        cp.on_save_conflict();
        assert!(cp.is_saving());

        cp.on_refreshed(Some(
            json!({"lastSequence": "9", "_rev": "0-7"})
                .as_object()
                .unwrap()
                .clone(),
        ));
        assert!(!cp.is_saving());
        let body = cp.begin_save("12").unwrap();
        assert_eq!(body["_rev"], json!("0-7"));
    }
}
