//! Map/reduce views and the incremental index update loop.

use crate::collation::{collate, Collation};
use crate::error::{CoreError, CoreResult};
use crate::query::{group_key, group_together, QueryOptions, QueryRow};
use crate::revision::Body;
use crate::store::LocalStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// A map function: called once per winning revision, emits key/value pairs.
pub type MapFn = dyn Fn(&Body, &mut Emitter) + Send + Sync;

/// A reduce function: `(keys, values, rereduce) -> value`.
pub type ReduceFn = dyn Fn(&[Value], &[Value], bool) -> Value + Send + Sync;

/// Collects the key/value pairs emitted by a map function.
#[derive(Default)]
pub struct Emitter {
    rows: Vec<(Value, Value)>,
}

impl Emitter {
    /// Emits one index row.
    pub fn emit(&mut self, key: Value, value: Value) {
        self.rows.push((key, value));
    }
}

/// One materialised index row.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow {
    /// Sequence of the revision the row was emitted from.
    pub sequence: u64,
    /// Source document id.
    pub doc_id: String,
    /// Emitted key.
    pub key: Value,
    /// Emitted value.
    pub value: Value,
}

#[derive(Clone, Default)]
struct IndexState {
    rows: Vec<ViewRow>,
    last_sequence: u64,
}

struct ViewState {
    version: Option<String>,
    map: Option<Arc<MapFn>>,
    reduce: Option<Arc<ReduceFn>>,
    collation: Collation,
    index: IndexState,
}

/// A named secondary index over a database, defined by a map function and an
/// optional reduce function.
///
/// The function bodies are not persisted, only a version string; views must
/// be re-registered on every launch, and a changed version triggers a full
/// rebuild at the next update.
pub struct View {
    name: String,
    store: Arc<dyn LocalStore>,
    state: Mutex<ViewState>,
}

impl View {
    /// Creates a view over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn LocalStore>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store,
            state: Mutex::new(ViewState {
                version: None,
                map: None,
                reduce: None,
                collation: Collation::default(),
                index: IndexState::default(),
            }),
        }
    }

    /// The view's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a map function with no reduce. Returns `true` if the
    /// version changed (forcing a rebuild on the next update).
    pub fn set_map(&self, map: Arc<MapFn>, version: &str) -> bool {
        self.set_map_reduce(map, None, version)
    }

    /// Registers the view's functions. A changed version resets the index's
    /// `last_sequence` to 0 so the next update rebuilds from scratch.
    pub fn set_map_reduce(
        &self,
        map: Arc<MapFn>,
        reduce: Option<Arc<ReduceFn>>,
        version: &str,
    ) -> bool {
        let mut state = self.state.lock();
        let changed = state.version.as_deref() != Some(version);
        state.map = Some(map);
        state.reduce = reduce;
        if changed {
            state.version = Some(version.to_string());
            state.index.last_sequence = 0;
        }
        changed
    }

    /// Sets the key collation used by queries.
    pub fn set_collation(&self, collation: Collation) {
        self.state.lock().collation = collation;
    }

    /// The highest database sequence this index has incorporated.
    #[must_use]
    pub fn last_sequence_indexed(&self) -> u64 {
        self.state.lock().index.last_sequence
    }

    /// Whether the index lags behind the database.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.last_sequence_indexed() < self.store.last_sequence_number()
    }

    /// Drops the index; it is regenerated on the next update.
    pub fn delete_index(&self) {
        let mut state = self.state.lock();
        state.index = IndexState::default();
    }

    /// All index rows ordered by key, for diagnostics and tests.
    #[must_use]
    pub fn dump(&self) -> Vec<ViewRow> {
        let state = self.state.lock();
        let mut rows = state.index.rows.clone();
        rows.sort_by(|a, b| {
            collate(&a.key, &b.key, state.collation).then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        rows
    }

    /// Incrementally updates the index inside a single store transaction.
    ///
    /// Scans every current, non-deleted winning revision past the view's
    /// `last_sequence`, re-maps changed documents, and bumps `last_sequence`
    /// to the database maximum. An abort leaves rows and `last_sequence`
    /// exactly as they were.
    pub fn update_index(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        let Some(map) = state.map.clone() else {
            return Err(CoreError::NotFound(format!(
                "view {} has no map function registered",
                self.name
            )));
        };

        self.store.begin_transaction()?;
        let rebuilt = self.rebuild_rows(&state.index, &map);
        match rebuilt {
            Ok(Some(index)) => {
                self.store.end_transaction(true)?;
                debug!(
                    view = %self.name,
                    rows = index.rows.len(),
                    last_sequence = index.last_sequence,
                    "view index updated"
                );
                state.index = index;
                Ok(())
            }
            Ok(None) => {
                // Already up to date.
                self.store.end_transaction(true)?;
                Ok(())
            }
            Err(e) => {
                self.store.end_transaction(false)?;
                Err(e)
            }
        }
    }

    fn rebuild_rows(&self, current: &IndexState, map: &Arc<MapFn>) -> CoreResult<Option<IndexState>> {
        let last = current.last_sequence;
        let max = self.store.last_sequence_number();
        if last == max {
            trace!(view = %self.name, last_sequence = last, "view index already current");
            return Ok(None);
        }

        let mut index = current.clone();
        if last == 0 {
            index.rows.clear();
        } else {
            let superseded = self.store.superseded_sequences_since(last)?;
            index
                .rows
                .retain(|r| superseded.binary_search(&r.sequence).is_err());
        }

        let winners = self.store.winners_since(last)?;
        for rev in winners {
            if rev.doc_id.starts_with("_design/") {
                continue;
            }
            // A re-mapped document replaces all of its previous rows, even
            // ones a sibling-conflict scan would have left behind.
            index.rows.retain(|r| r.doc_id != rev.doc_id);
            let Some(body) = rev.body else { continue };
            let mut emitter = Emitter::default();
            map(&body, &mut emitter);
            trace!(view = %self.name, doc = %rev.doc_id, emitted = emitter.rows.len(), "mapped");
            for (key, value) in emitter.rows {
                index.rows.push(ViewRow {
                    sequence: rev.sequence,
                    doc_id: rev.doc_id.clone(),
                    key,
                    value,
                });
            }
        }
        index.last_sequence = max;
        Ok(Some(index))
    }

    /// Queries the index. Does not update it first.
    pub fn query_with_options(&self, options: &QueryOptions) -> CoreResult<Vec<QueryRow>> {
        let state = self.state.lock();
        let collation = state.collation;

        // Filter.
        let mut rows: Vec<&ViewRow> = state
            .index
            .rows
            .iter()
            .filter(|row| self.row_in_range(row, options, collation))
            .collect();

        // Order by key, doc id breaking ties.
        rows.sort_by(|a, b| {
            collate(&a.key, &b.key, collation).then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        if options.descending {
            rows.reverse();
        }
        let rows: Vec<&ViewRow> = rows
            .into_iter()
            .skip(options.skip)
            .take(options.limit)
            .collect();

        let group = options.group || options.group_level > 0;
        let reduce = options.reduce || group;

        if reduce && state.reduce.is_none() && !group {
            return Err(CoreError::InvalidQuery(format!(
                "cannot use reduce option in view {} which has no reduce function",
                self.name
            )));
        }

        if reduce {
            Ok(Self::reduced_rows(
                &rows,
                state.reduce.as_deref(),
                group,
                options.group_level,
            ))
        } else {
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let document_properties = if options.prefetch {
                    self.prefetch_properties(row)?
                } else {
                    None
                };
                out.push(QueryRow {
                    key: row.key.clone(),
                    value: row.value.clone(),
                    source_doc_id: Some(row.doc_id.clone()),
                    sequence: row.sequence,
                    document_properties,
                });
            }
            Ok(out)
        }
    }

    fn row_in_range(&self, row: &ViewRow, options: &QueryOptions, collation: Collation) -> bool {
        if let Some(keys) = &options.keys {
            return keys.contains(&row.key);
        }
        let (min, max, inclusive_min, inclusive_max) = if options.descending {
            (
                options.end_key.as_ref(),
                options.start_key.as_ref(),
                options.inclusive_end,
                true,
            )
        } else {
            (
                options.start_key.as_ref(),
                options.end_key.as_ref(),
                true,
                options.inclusive_end,
            )
        };
        if let Some(min) = min {
            let ord = collate(&row.key, min, collation);
            if ord == Ordering::Less || (!inclusive_min && ord == Ordering::Equal) {
                return false;
            }
        }
        if let Some(max) = max {
            let ord = collate(&row.key, max, collation);
            if ord == Ordering::Greater || (!inclusive_max && ord == Ordering::Equal) {
                return false;
            }
        }
        true
    }

    fn reduced_rows(
        rows: &[&ViewRow],
        reduce: Option<&ReduceFn>,
        group: bool,
        group_level: usize,
    ) -> Vec<QueryRow> {
        let mut out = Vec::new();
        let mut keys_to_reduce: Vec<Value> = Vec::new();
        let mut values_to_reduce: Vec<Value> = Vec::new();
        let mut last_key: Option<Value> = None;

        for row in rows {
            let starts_new_group = match &last_key {
                Some(last) if group => !group_together(&row.key, last, group_level),
                Some(_) => false,
                None => true,
            };
            if starts_new_group {
                if let Some(last) = last_key.take() {
                    out.push(Self::reduced_row(
                        &last,
                        &keys_to_reduce,
                        &values_to_reduce,
                        reduce,
                        group,
                        group_level,
                    ));
                    keys_to_reduce.clear();
                    values_to_reduce.clear();
                }
                last_key = Some(row.key.clone());
            }
            keys_to_reduce.push(row.key.clone());
            values_to_reduce.push(row.value.clone());
        }

        if let Some(last) = last_key {
            out.push(Self::reduced_row(
                &last,
                &keys_to_reduce,
                &values_to_reduce,
                reduce,
                group,
                group_level,
            ));
        }
        out
    }

    fn reduced_row(
        last_key: &Value,
        keys: &[Value],
        values: &[Value],
        reduce: Option<&ReduceFn>,
        group: bool,
        group_level: usize,
    ) -> QueryRow {
        let reduced = reduce.map_or(Value::Null, |r| r(keys, values, false));
        let key = if group {
            group_key(last_key, group_level)
        } else {
            Value::Null
        };
        QueryRow {
            key,
            value: reduced,
            source_doc_id: None,
            sequence: 0,
            document_properties: None,
        }
    }

    fn prefetch_properties(&self, row: &ViewRow) -> CoreResult<Option<Body>> {
        // A value with an `_id` links another document; prefetch follows it.
        let linked = row
            .value
            .as_object()
            .and_then(|v| v.get("_id"))
            .and_then(Value::as_str);
        let doc_id = linked.unwrap_or(&row.doc_id);
        Ok(self
            .store
            .winning_revision(doc_id)?
            .and_then(|rev| rev.body))
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::revision::{RevId, Revision};
    use serde_json::json;

    fn body(v: Value) -> Body {
        v.as_object().unwrap().clone()
    }

    fn by_title_view(store: &Arc<MemoryStore>) -> View {
        let view = View::new(Arc::clone(store) as Arc<dyn LocalStore>, "by_title");
        view.set_map(
            Arc::new(|doc, emitter| {
                if let Some(title) = doc.get("title") {
                    emitter.emit(title.clone(), Value::Null);
                }
            }),
            "1",
        );
        view
    }

    #[test]
    fn index_maps_all_documents() {
        let store = Arc::new(MemoryStore::new());
        store.put("a", body(json!({"title": "apple"}))).unwrap();
        store.put("b", body(json!({"title": "pear"}))).unwrap();
        let view = by_title_view(&store);
        view.update_index().unwrap();

        let rows = view.dump();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, json!("apple"));
        assert_eq!(rows[1].key, json!("pear"));
        assert_eq!(view.last_sequence_indexed(), store.last_sequence_number());
    }

    #[test]
    fn incremental_update_replaces_changed_docs() {
        let store = Arc::new(MemoryStore::new());
        store.put("a", body(json!({"title": "first"}))).unwrap();
        let view = by_title_view(&store);
        view.update_index().unwrap();

        store.put("a", body(json!({"title": "second"}))).unwrap();
        assert!(view.is_stale());
        view.update_index().unwrap();

        let rows = view.dump();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, json!("second"));
    }

    #[test]
    fn deleted_documents_leave_the_index() {
        let store = Arc::new(MemoryStore::new());
        store.put("gone", body(json!({"title": "x"}))).unwrap();
        let view = by_title_view(&store);
        view.update_index().unwrap();
        assert_eq!(view.dump().len(), 1);

        store.delete("gone").unwrap();
        view.update_index().unwrap();
        assert!(view.dump().is_empty());
    }

    #[test]
    fn design_documents_are_not_indexed() {
        let store = Arc::new(MemoryStore::new());
        store
            .put("_design/ddoc", body(json!({"title": "meta"})))
            .unwrap();
        store.put("real", body(json!({"title": "doc"}))).unwrap();
        let view = by_title_view(&store);
        view.update_index().unwrap();
        assert_eq!(view.dump().len(), 1);
    }

    #[test]
    fn conflicting_revisions_map_the_winner_once() {
        let store = Arc::new(MemoryStore::new());
        let base: RevId = "1-base".parse().unwrap();
        store
            .force_insert(
                Revision::new("d", base.clone(), body(json!({"title": "base"}))),
                &[base.clone()],
            )
            .unwrap();
        let a: RevId = "2-a".parse().unwrap();
        let b: RevId = "2-b".parse().unwrap();
        store
            .force_insert(
                Revision::new("d", a.clone(), body(json!({"title": "from-a"}))),
                &[a, base.clone()],
            )
            .unwrap();
        store
            .force_insert(
                Revision::new("d", b.clone(), body(json!({"title": "from-b"}))),
                &[b, base],
            )
            .unwrap();

        let view = by_title_view(&store);
        view.update_index().unwrap();
        let rows = view.dump();
        // Exactly one row, from the winning revision 2-b.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, json!("from-b"));
    }

    #[test]
    fn changed_version_forces_rebuild() {
        let store = Arc::new(MemoryStore::new());
        store.put("a", body(json!({"title": "t"}))).unwrap();
        let view = by_title_view(&store);
        view.update_index().unwrap();
        assert_eq!(view.last_sequence_indexed(), 1);

        let changed = view.set_map(
            Arc::new(|doc, emitter| {
                if let Some(t) = doc.get("title") {
                    emitter.emit(json!([t]), Value::Null);
                }
            }),
            "2",
        );
        assert!(changed);
        assert_eq!(view.last_sequence_indexed(), 0);
        view.update_index().unwrap();
        assert_eq!(view.dump()[0].key, json!(["t"]));
    }

    #[test]
    fn up_to_date_index_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        store.put("a", body(json!({"title": "t"}))).unwrap();
        let view = by_title_view(&store);
        view.update_index().unwrap();
        view.update_index().unwrap();
        assert_eq!(view.dump().len(), 1);
    }

    #[test]
    fn view_sequence_never_exceeds_database_sequence() {
        let store = Arc::new(MemoryStore::new());
        let view = by_title_view(&store);
        for i in 0..5 {
            store
                .put(&format!("d{i}"), body(json!({"title": i})))
                .unwrap();
            view.update_index().unwrap();
            assert!(view.last_sequence_indexed() <= store.last_sequence_number());
        }
    }

    #[test]
    fn range_query() {
        let store = Arc::new(MemoryStore::new());
        for (id, title) in [("a", "ant"), ("b", "bee"), ("c", "cow"), ("d", "dog")] {
            store.put(id, body(json!({"title": title}))).unwrap();
        }
        let view = by_title_view(&store);
        view.update_index().unwrap();

        let rows = view
            .query_with_options(
                &QueryOptions::default()
                    .with_start_key(json!("bee"))
                    .with_end_key(json!("cow")),
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, json!("bee"));
        assert_eq!(rows[1].key, json!("cow"));

        let exclusive = view
            .query_with_options(
                &QueryOptions::default()
                    .with_start_key(json!("bee"))
                    .with_end_key(json!("cow"))
                    .without_inclusive_end(),
            )
            .unwrap();
        assert_eq!(exclusive.len(), 1);
    }

    #[test]
    fn descending_query_reverses_rows() {
        let store = Arc::new(MemoryStore::new());
        for (id, title) in [("a", "ant"), ("b", "bee")] {
            store.put(id, body(json!({"title": title}))).unwrap();
        }
        let view = by_title_view(&store);
        view.update_index().unwrap();
        let rows = view
            .query_with_options(&QueryOptions::default().descending())
            .unwrap();
        assert_eq!(rows[0].key, json!("bee"));
        assert_eq!(rows[1].key, json!("ant"));
    }

    #[test]
    fn keys_query_and_limit() {
        let store = Arc::new(MemoryStore::new());
        for (id, title) in [("a", "ant"), ("b", "bee"), ("c", "cow")] {
            store.put(id, body(json!({"title": title}))).unwrap();
        }
        let view = by_title_view(&store);
        view.update_index().unwrap();

        let rows = view
            .query_with_options(
                &QueryOptions::default().with_keys(vec![json!("ant"), json!("cow")]),
            )
            .unwrap();
        assert_eq!(rows.len(), 2);

        let limited = view
            .query_with_options(&QueryOptions::default().with_limit(1).with_skip(1))
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].key, json!("bee"));
    }

    #[test]
    fn grouped_reduce_sums_per_prefix() {
        let store = Arc::new(MemoryStore::new());
        store.put("x1", body(json!({"g": 1, "i": 1, "n": 1}))).unwrap();
        store.put("x2", body(json!({"g": 1, "i": 2, "n": 2}))).unwrap();
        store.put("x3", body(json!({"g": 2, "i": 1, "n": 3}))).unwrap();

        let view = View::new(Arc::clone(&store) as Arc<dyn LocalStore>, "sums");
        view.set_map_reduce(
            Arc::new(|doc, emitter| {
                emitter.emit(
                    json!([doc.get("g").unwrap(), doc.get("i").unwrap()]),
                    doc.get("n").cloned().unwrap_or(Value::Null),
                );
            }),
            Some(Arc::new(|_keys, values, _rereduce| {
                json!(crate::query::total_values(values))
            })),
            "1",
        );
        view.update_index().unwrap();

        let rows = view
            .query_with_options(&QueryOptions::default().reduced().with_group_level(1))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, json!([1]));
        assert_eq!(rows[0].value, json!(3.0));
        assert_eq!(rows[1].key, json!([2]));
        assert_eq!(rows[1].value, json!(3.0));
    }

    #[test]
    fn reduce_without_function_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let view = by_title_view(&store);
        view.update_index().unwrap();
        assert!(matches!(
            view.query_with_options(&QueryOptions::default().reduced()),
            Err(CoreError::InvalidQuery(_))
        ));
    }

    /// Delegates to a [`MemoryStore`] but fails the indexer's scan on demand.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        fail_scans: std::sync::atomic::AtomicBool,
    }

    impl LocalStore for FlakyStore {
        fn is_open(&self) -> bool {
            self.inner.is_open()
        }
        fn private_uuid(&self) -> String {
            self.inner.private_uuid()
        }
        fn last_sequence_number(&self) -> u64 {
            self.inner.last_sequence_number()
        }
        fn last_sequence_for(&self, id: &str) -> crate::CoreResult<Option<String>> {
            self.inner.last_sequence_for(id)
        }
        fn set_last_sequence(&self, seq: &str, id: &str, push: bool) -> crate::CoreResult<()> {
            self.inner.set_last_sequence(seq, id, push)
        }
        fn contains_revision(&self, doc_id: &str, rev_id: &RevId) -> bool {
            self.inner.contains_revision(doc_id, rev_id)
        }
        fn find_missing_revisions(
            &self,
            c: &[(String, RevId)],
        ) -> crate::CoreResult<Vec<(String, RevId)>> {
            self.inner.find_missing_revisions(c)
        }
        fn force_insert(&self, rev: Revision, history: &[RevId]) -> crate::CoreResult<u64> {
            self.inner.force_insert(rev, history)
        }
        fn changes_since(
            &self,
            seq: u64,
            options: &crate::ChangesOptions,
        ) -> crate::CoreResult<Vec<Revision>> {
            self.inner.changes_since(seq, options)
        }
        fn winning_revision(&self, doc_id: &str) -> crate::CoreResult<Option<Revision>> {
            self.inner.winning_revision(doc_id)
        }
        fn revision_body(
            &self,
            doc_id: &str,
            rev_id: &RevId,
        ) -> crate::CoreResult<Option<Revision>> {
            self.inner.revision_body(doc_id, rev_id)
        }
        fn revision_history(&self, doc_id: &str, rev_id: &RevId) -> crate::CoreResult<Vec<RevId>> {
            self.inner.revision_history(doc_id, rev_id)
        }
        fn documents_with_ids(&self, ids: &[String]) -> crate::CoreResult<Vec<Revision>> {
            self.inner.documents_with_ids(ids)
        }
        fn winners_since(&self, seq: u64) -> crate::CoreResult<Vec<Revision>> {
            if self.fail_scans.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CoreError::Transaction("injected scan failure"));
            }
            self.inner.winners_since(seq)
        }
        fn superseded_sequences_since(&self, seq: u64) -> crate::CoreResult<Vec<u64>> {
            self.inner.superseded_sequences_since(seq)
        }
        fn begin_transaction(&self) -> crate::CoreResult<()> {
            self.inner.begin_transaction()
        }
        fn end_transaction(&self, success: bool) -> crate::CoreResult<()> {
            self.inner.end_transaction(success)
        }
        fn add_active_replication(&self, id: &str) {
            self.inner.add_active_replication(id);
        }
        fn forget_replication(&self, id: &str) {
            self.inner.forget_replication(id);
        }
        fn active_replications(&self) -> Vec<String> {
            self.inner.active_replications()
        }
    }

    #[test]
    fn aborted_update_changes_nothing() {
        let memory = Arc::new(MemoryStore::new());
        let store = Arc::new(FlakyStore {
            inner: Arc::clone(&memory),
            fail_scans: std::sync::atomic::AtomicBool::new(false),
        });
        memory.put("a", body(json!({"title": "one"}))).unwrap();

        let view = View::new(Arc::clone(&store) as Arc<dyn LocalStore>, "by_title");
        view.set_map(
            Arc::new(|doc, emitter| {
                if let Some(title) = doc.get("title") {
                    emitter.emit(title.clone(), Value::Null);
                }
            }),
            "1",
        );
        view.update_index().unwrap();
        let before_rows = view.dump();
        let before_seq = view.last_sequence_indexed();

        memory.put("b", body(json!({"title": "two"}))).unwrap();
        store
            .fail_scans
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(view.update_index().is_err());

        // Rows and last_sequence are exactly as before the aborted pass.
        assert_eq!(view.dump(), before_rows);
        assert_eq!(view.last_sequence_indexed(), before_seq);

        store
            .fail_scans
            .store(false, std::sync::atomic::Ordering::SeqCst);
        view.update_index().unwrap();
        assert_eq!(view.dump().len(), 2);
    }

    #[test]
    fn prefetch_attaches_document_properties() {
        let store = Arc::new(MemoryStore::new());
        store.put("a", body(json!({"title": "t", "extra": 9}))).unwrap();
        let view = by_title_view(&store);
        view.update_index().unwrap();

        let rows = view
            .query_with_options(&QueryOptions::default().with_prefetch())
            .unwrap();
        let props = rows[0].document_properties.as_ref().unwrap();
        assert_eq!(props.get("extra"), Some(&json!(9)));
    }
}
