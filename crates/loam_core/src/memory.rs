//! In-memory reference implementation of [`LocalStore`].

use crate::error::{CoreError, CoreResult};
use crate::revision::{Body, RevId, Revision};
use crate::store::{ChangesOptions, LocalStore};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Debug)]
struct StoredRev {
    rev_id: RevId,
    parent: Option<RevId>,
    sequence: u64,
    deleted: bool,
    body: Option<Body>,
    current: bool,
}

impl StoredRev {
    /// A stub is a history placeholder with no content and no sequence.
    fn is_stub(&self) -> bool {
        self.sequence == 0
    }
}

#[derive(Clone, Debug, Default)]
struct DocTree {
    revs: HashMap<String, StoredRev>,
}

impl DocTree {
    /// The winning revision: non-deleted leaves beat deleted ones, then the
    /// highest revision id wins.
    fn winner(&self) -> Option<&StoredRev> {
        let leaves: Vec<&StoredRev> = self
            .revs
            .values()
            .filter(|r| r.current && !r.is_stub())
            .collect();
        let alive = leaves
            .iter()
            .filter(|r| !r.deleted)
            .max_by(|a, b| a.rev_id.cmp(&b.rev_id));
        alive
            .copied()
            .or_else(|| leaves.into_iter().max_by(|a, b| a.rev_id.cmp(&b.rev_id)))
    }
}

#[derive(Clone, Default)]
struct State {
    docs: BTreeMap<String, DocTree>,
    last_sequence: u64,
    checkpoints: HashMap<String, String>,
}

#[derive(Default)]
struct Shared {
    state: State,
    txn_depth: u32,
    txn_failed: bool,
    snapshot: Option<State>,
    active: BTreeSet<String>,
}

/// An in-memory document store with multi-version revision trees.
///
/// Suitable for embedding, fixtures and tests; transactions are implemented
/// with a snapshot of the whole state, restored on rollback.
pub struct MemoryStore {
    shared: Mutex<Shared>,
    uuid: String,
    open: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store with a fresh private UUID.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(Shared::default()),
            uuid: uuid::Uuid::new_v4().simple().to_string(),
            open: AtomicBool::new(true),
        }
    }

    /// Marks the store closed; subsequent replications refuse to start.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Writes a new revision of a document, generating the next revision id.
    /// Returns the new revision.
    pub fn put(&self, doc_id: &str, body: Body) -> CoreResult<Revision> {
        let parent = self.current_rev_id(doc_id);
        let generation = parent.as_ref().map_or(1, |p| p.generation() + 1);
        let suffix = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let rev_id = RevId::new(generation, suffix);

        let mut history = vec![rev_id.clone()];
        if let Some(p) = parent {
            history.push(p);
        }
        let mut rev = Revision::new(doc_id, rev_id, body);
        let seq = self.force_insert(rev.clone(), &history)?;
        rev.sequence = seq;
        Ok(rev)
    }

    /// Deletes a document by writing a tombstone revision.
    pub fn delete(&self, doc_id: &str) -> CoreResult<Revision> {
        let parent = self
            .current_rev_id(doc_id)
            .ok_or_else(|| CoreError::NotFound(doc_id.to_string()))?;
        let suffix = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let rev_id = RevId::new(parent.generation() + 1, suffix);
        let history = vec![rev_id.clone(), parent];
        let mut rev = Revision::tombstone(doc_id, rev_id);
        let seq = self.force_insert(rev.clone(), &history)?;
        rev.sequence = seq;
        Ok(rev)
    }

    /// The current winning revision id of a document, deleted or not.
    fn current_rev_id(&self, doc_id: &str) -> Option<RevId> {
        let shared = self.shared.lock();
        shared
            .state
            .docs
            .get(doc_id)
            .and_then(DocTree::winner)
            .map(|r| r.rev_id.clone())
    }

    fn make_revision(doc_id: &str, stored: &StoredRev, include_body: bool) -> Revision {
        let body = if include_body {
            stored.body.clone().map(|mut b| {
                b.insert("_id".into(), Value::from(doc_id.to_string()));
                b.insert("_rev".into(), Value::from(stored.rev_id.to_string()));
                if stored.deleted {
                    b.insert("_deleted".into(), Value::from(true));
                }
                b
            })
        } else {
            None
        };
        Revision {
            doc_id: doc_id.to_string(),
            rev_id: stored.rev_id.clone(),
            sequence: stored.sequence,
            deleted: stored.deleted,
            body,
        }
    }

    /// Strips wire metadata the tree tracks separately.
    fn normalize_body(mut body: Body) -> Body {
        body.remove("_id");
        body.remove("_rev");
        body.remove("_deleted");
        body.remove("_revisions");
        body
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryStore {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn private_uuid(&self) -> String {
        self.uuid.clone()
    }

    fn last_sequence_number(&self) -> u64 {
        self.shared.lock().state.last_sequence
    }

    fn last_sequence_for(&self, checkpoint_id: &str) -> CoreResult<Option<String>> {
        Ok(self
            .shared
            .lock()
            .state
            .checkpoints
            .get(checkpoint_id)
            .cloned())
    }

    fn set_last_sequence(&self, seq: &str, checkpoint_id: &str, _push: bool) -> CoreResult<()> {
        self.shared
            .lock()
            .state
            .checkpoints
            .insert(checkpoint_id.to_string(), seq.to_string());
        Ok(())
    }

    fn contains_revision(&self, doc_id: &str, rev_id: &RevId) -> bool {
        let shared = self.shared.lock();
        shared
            .state
            .docs
            .get(doc_id)
            .and_then(|t| t.revs.get(&rev_id.to_string()))
            .is_some_and(|r| !r.is_stub())
    }

    fn find_missing_revisions(
        &self,
        candidates: &[(String, RevId)],
    ) -> CoreResult<Vec<(String, RevId)>> {
        Ok(candidates
            .iter()
            .filter(|(doc_id, rev_id)| !self.contains_revision(doc_id, rev_id))
            .cloned()
            .collect())
    }

    fn force_insert(&self, rev: Revision, history: &[RevId]) -> CoreResult<u64> {
        let mut shared = self.shared.lock();
        let state = &mut shared.state;
        let tree = state.docs.entry(rev.doc_id.clone()).or_default();
        let rev_key = rev.rev_id.to_string();

        if let Some(existing) = tree.revs.get(&rev_key) {
            if !existing.is_stub() {
                return Ok(existing.sequence);
            }
        }

        if let Some(first) = history.first() {
            if first != &rev.rev_id {
                return Err(CoreError::InvalidRevisionId(format!(
                    "history does not start with {}",
                    rev.rev_id
                )));
            }
        }

        // Record missing ancestors as stubs so the history is walkable.
        for (i, ancestor) in history.iter().enumerate().skip(1) {
            let key = ancestor.to_string();
            if !tree.revs.contains_key(&key) {
                tree.revs.insert(
                    key,
                    StoredRev {
                        rev_id: ancestor.clone(),
                        parent: history.get(i + 1).cloned(),
                        sequence: 0,
                        deleted: false,
                        body: None,
                        current: false,
                    },
                );
            }
        }

        let parent = history.get(1).cloned();
        if let Some(p) = &parent {
            if let Some(parent_rev) = tree.revs.get_mut(&p.to_string()) {
                parent_rev.current = false;
            }
        }

        // A revision is current unless something already descends from it.
        let has_child = tree
            .revs
            .values()
            .any(|r| r.parent.as_ref() == Some(&rev.rev_id));

        state.last_sequence += 1;
        let sequence = state.last_sequence;
        let tree = state.docs.entry(rev.doc_id.clone()).or_default();
        tree.revs.insert(
            rev_key,
            StoredRev {
                rev_id: rev.rev_id,
                parent,
                sequence,
                deleted: rev.deleted,
                body: rev.body.map(Self::normalize_body),
                current: !has_child,
            },
        );
        Ok(sequence)
    }

    fn changes_since(&self, seq: u64, options: &ChangesOptions) -> CoreResult<Vec<Revision>> {
        let shared = self.shared.lock();
        let mut out = Vec::new();
        for (doc_id, tree) in &shared.state.docs {
            if options.include_conflicts {
                for rev in tree.revs.values() {
                    if rev.current && !rev.is_stub() && rev.sequence > seq {
                        out.push(Self::make_revision(doc_id, rev, options.include_docs));
                    }
                }
            } else if let Some(winner) = tree.winner() {
                if winner.sequence > seq {
                    out.push(Self::make_revision(doc_id, winner, options.include_docs));
                }
            }
        }
        out.sort_by_key(|r| r.sequence);
        out.truncate(options.limit);
        Ok(out)
    }

    fn winning_revision(&self, doc_id: &str) -> CoreResult<Option<Revision>> {
        let shared = self.shared.lock();
        Ok(shared
            .state
            .docs
            .get(doc_id)
            .and_then(DocTree::winner)
            .filter(|r| !r.deleted)
            .map(|r| Self::make_revision(doc_id, r, true)))
    }

    fn revision_body(&self, doc_id: &str, rev_id: &RevId) -> CoreResult<Option<Revision>> {
        let shared = self.shared.lock();
        Ok(shared
            .state
            .docs
            .get(doc_id)
            .and_then(|t| t.revs.get(&rev_id.to_string()))
            .filter(|r| !r.is_stub())
            .map(|r| Self::make_revision(doc_id, r, true)))
    }

    fn revision_history(&self, doc_id: &str, rev_id: &RevId) -> CoreResult<Vec<RevId>> {
        let shared = self.shared.lock();
        let Some(tree) = shared.state.docs.get(doc_id) else {
            return Ok(Vec::new());
        };
        let mut history = Vec::new();
        let mut cursor = Some(rev_id.clone());
        while let Some(id) = cursor {
            let Some(stored) = tree.revs.get(&id.to_string()) else {
                break;
            };
            history.push(id);
            cursor = stored.parent.clone();
        }
        Ok(history)
    }

    fn documents_with_ids(&self, doc_ids: &[String]) -> CoreResult<Vec<Revision>> {
        let mut out = Vec::new();
        for doc_id in doc_ids {
            if let Some(rev) = self.winning_revision(doc_id)? {
                out.push(rev);
            }
        }
        Ok(out)
    }

    fn winners_since(&self, seq: u64) -> CoreResult<Vec<Revision>> {
        let shared = self.shared.lock();
        let mut out = Vec::new();
        for (doc_id, tree) in &shared.state.docs {
            if let Some(winner) = tree.winner() {
                if !winner.deleted && winner.sequence > seq {
                    out.push(Self::make_revision(doc_id, winner, true));
                }
            }
        }
        Ok(out)
    }

    fn superseded_sequences_since(&self, seq: u64) -> CoreResult<Vec<u64>> {
        let shared = self.shared.lock();
        let mut superseded = BTreeSet::new();
        for tree in shared.state.docs.values() {
            for rev in tree.revs.values() {
                if rev.sequence <= seq {
                    continue;
                }
                let Some(parent) = &rev.parent else { continue };
                if let Some(parent_rev) = tree.revs.get(&parent.to_string()) {
                    if parent_rev.sequence > 0 && parent_rev.sequence <= seq {
                        superseded.insert(parent_rev.sequence);
                    }
                }
            }
        }
        Ok(superseded.into_iter().collect())
    }

    fn begin_transaction(&self) -> CoreResult<()> {
        let mut shared = self.shared.lock();
        if shared.txn_depth == 0 {
            shared.snapshot = Some(shared.state.clone());
            shared.txn_failed = false;
        }
        shared.txn_depth += 1;
        Ok(())
    }

    fn end_transaction(&self, success: bool) -> CoreResult<()> {
        let mut shared = self.shared.lock();
        if shared.txn_depth == 0 {
            return Err(CoreError::Transaction("end_transaction without begin"));
        }
        if !success {
            shared.txn_failed = true;
        }
        shared.txn_depth -= 1;
        if shared.txn_depth == 0 {
            let snapshot = shared.snapshot.take();
            if shared.txn_failed {
                if let Some(snapshot) = snapshot {
                    shared.state = snapshot;
                }
            }
        }
        Ok(())
    }

    fn add_active_replication(&self, session_id: &str) {
        self.shared.lock().active.insert(session_id.to_string());
    }

    fn forget_replication(&self, session_id: &str) {
        self.shared.lock().active.remove(session_id);
    }

    fn active_replications(&self) -> Vec<String> {
        self.shared.lock().active.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(v: serde_json::Value) -> Body {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn put_assigns_increasing_sequences() {
        let store = MemoryStore::new();
        let r1 = store.put("a", body(json!({"n": 1}))).unwrap();
        let r2 = store.put("b", body(json!({"n": 2}))).unwrap();
        assert_eq!(r1.sequence, 1);
        assert_eq!(r2.sequence, 2);
        assert_eq!(store.last_sequence_number(), 2);
    }

    #[test]
    fn update_supersedes_previous_revision() {
        let store = MemoryStore::new();
        let r1 = store.put("doc", body(json!({"v": 1}))).unwrap();
        let r2 = store.put("doc", body(json!({"v": 2}))).unwrap();
        assert_eq!(r2.rev_id.generation(), 2);

        let winner = store.winning_revision("doc").unwrap().unwrap();
        assert_eq!(winner.rev_id, r2.rev_id);
        assert_eq!(
            store.superseded_sequences_since(r1.sequence).unwrap(),
            vec![r1.sequence]
        );
    }

    #[test]
    fn delete_hides_document() {
        let store = MemoryStore::new();
        store.put("doc", body(json!({}))).unwrap();
        store.delete("doc").unwrap();
        assert!(store.winning_revision("doc").unwrap().is_none());
        // But the tombstone is still the change-feed winner.
        let changes = store.changes_since(0, &ChangesOptions::default()).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].deleted);
    }

    #[test]
    fn force_insert_with_history_creates_stubs() {
        let store = MemoryStore::new();
        let rev: RevId = "3-ccc".parse().unwrap();
        let history: Vec<RevId> = vec![
            "3-ccc".parse().unwrap(),
            "2-bbb".parse().unwrap(),
            "1-aaa".parse().unwrap(),
        ];
        let r = Revision::new("doc", rev.clone(), body(json!({"x": 1})));
        store.force_insert(r, &history).unwrap();

        assert!(store.contains_revision("doc", &rev));
        // Stub ancestors are walkable but do not count as present.
        assert!(!store.contains_revision("doc", &"2-bbb".parse().unwrap()));
        assert_eq!(
            store.revision_history("doc", &rev).unwrap(),
            history
        );
    }

    #[test]
    fn force_insert_is_idempotent() {
        let store = MemoryStore::new();
        let rev: RevId = "1-abc".parse().unwrap();
        let r = Revision::new("doc", rev.clone(), body(json!({})));
        let s1 = store.force_insert(r.clone(), &[rev.clone()]).unwrap();
        let s2 = store.force_insert(r, &[rev]).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(store.last_sequence_number(), s1);
    }

    #[test]
    fn conflicting_leaves_pick_higher_rev_id() {
        let store = MemoryStore::new();
        let base: RevId = "1-base".parse().unwrap();
        let a: RevId = "2-a".parse().unwrap();
        let b: RevId = "2-b".parse().unwrap();
        store
            .force_insert(
                Revision::new("d", base.clone(), body(json!({}))),
                &[base.clone()],
            )
            .unwrap();
        store
            .force_insert(
                Revision::new("d", a.clone(), body(json!({"side": "a"}))),
                &[a.clone(), base.clone()],
            )
            .unwrap();
        store
            .force_insert(
                Revision::new("d", b.clone(), body(json!({"side": "b"}))),
                &[b.clone(), base],
            )
            .unwrap();

        let winner = store.winning_revision("d").unwrap().unwrap();
        assert_eq!(winner.rev_id, b);
        // Both conflicting revisions are current.
        let opts = ChangesOptions {
            include_conflicts: true,
            ..Default::default()
        };
        let all = store.changes_since(0, &opts).unwrap();
        assert_eq!(all.iter().filter(|r| r.doc_id == "d").count(), 2);
    }

    #[test]
    fn missing_revisions_filtered() {
        let store = MemoryStore::new();
        store.put("x", body(json!({}))).unwrap();
        let present = store.winning_revision("x").unwrap().unwrap().rev_id;
        let absent: RevId = "9-zzz".parse().unwrap();
        let missing = store
            .find_missing_revisions(&[
                ("x".into(), present),
                ("x".into(), absent.clone()),
            ])
            .unwrap();
        assert_eq!(missing, vec![("x".to_string(), absent)]);
    }

    #[test]
    fn rollback_restores_state() {
        let store = MemoryStore::new();
        store.put("keep", body(json!({}))).unwrap();
        store.begin_transaction().unwrap();
        store.put("discard", body(json!({}))).unwrap();
        store.end_transaction(false).unwrap();

        assert!(store.winning_revision("keep").unwrap().is_some());
        assert!(store.winning_revision("discard").unwrap().is_none());
        assert_eq!(store.last_sequence_number(), 1);
    }

    #[test]
    fn nested_transaction_failure_rolls_back_outermost() {
        let store = MemoryStore::new();
        store.begin_transaction().unwrap();
        store.put("a", body(json!({}))).unwrap();
        store.begin_transaction().unwrap();
        store.put("b", body(json!({}))).unwrap();
        store.end_transaction(false).unwrap();
        store.end_transaction(true).unwrap();

        assert!(store.winning_revision("a").unwrap().is_none());
        assert!(store.winning_revision("b").unwrap().is_none());
    }

    #[test]
    fn checkpoint_sequences_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.last_sequence_for("cp1").unwrap(), None);
        store.set_last_sequence("42", "cp1", false).unwrap();
        assert_eq!(
            store.last_sequence_for("cp1").unwrap(),
            Some("42".to_string())
        );
    }

    #[test]
    fn active_replication_registry() {
        let store = MemoryStore::new();
        store.add_active_replication("repl001");
        store.add_active_replication("repl002");
        store.forget_replication("repl001");
        assert_eq!(store.active_replications(), vec!["repl002".to_string()]);
    }

    #[test]
    fn bodies_carry_wire_metadata() {
        let store = MemoryStore::new();
        let rev = store.put("doc", body(json!({"k": "v"}))).unwrap();
        let read = store.winning_revision("doc").unwrap().unwrap();
        let props = read.body.unwrap();
        assert_eq!(props.get("_id"), Some(&json!("doc")));
        assert_eq!(props.get("_rev"), Some(&json!(rev.rev_id.to_string())));
        assert_eq!(props.get("k"), Some(&json!("v")));
    }
}
