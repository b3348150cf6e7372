//! Pull direction: change feed → inbox → fetch bodies → transactional
//! insert → watermark advance.

use crate::error::ReplicationError;
use crate::feed::{ChangeEntry, ChangeFeed, ChangeFeedClient, FeedMode};
use crate::replicator::{encode_doc_id, DirectionOps, Inner, RevisionRef};
use crate::tracker::SequenceTracker;
use loam_core::{Body, RevId, Revision};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Mutable pull-side state, owned by the replicator and touched only on the
/// work executor.
#[derive(Default)]
pub(crate) struct PullState {
    pub feed: Option<Arc<ChangeFeed>>,
    /// Bumped every time a feed is (re)started, so a stale feed's stop
    /// callback cannot clear its replacement.
    pub feed_generation: u64,
    pub tracker: SequenceTracker,
    pub next_key: u64,
    /// Downloads still in flight for queued inbox items.
    pub downloads_outstanding: usize,
    /// Fetched revisions waiting for the transactional insert.
    pub to_insert: Vec<(RevisionRef, Body)>,
}

/// Routes feed callbacks (which arrive on the feed thread) onto the work
/// executor.
struct PullFeedClient {
    inner: Weak<Inner>,
    /// Whether this feed was registered as an async task (one-shot feeds
    /// hold the replication active; long-poll feeds run between batches).
    counts_as_task: bool,
    generation: u64,
}

impl ChangeFeedClient for PullFeedClient {
    fn change_feed_received_change(&self, change: ChangeEntry) {
        if let Some(inner) = self.inner.upgrade() {
            let target = Arc::clone(&inner);
            inner
                .executor
                .submit(move || handle_change(&target, change));
        }
    }

    fn change_feed_stopped(&self, error: Option<ReplicationError>) {
        if let Some(inner) = self.inner.upgrade() {
            let target = Arc::clone(&inner);
            let counted = self.counts_as_task;
            let generation = self.generation;
            inner
                .executor
                .submit(move || feed_stopped(&target, error, counted, generation));
        }
    }
}

/// Pull specialisation of the replication core.
pub(crate) struct PullOps;

impl DirectionOps for PullOps {
    fn begin_replicating(&self, inner: &Arc<Inner>) {
        let (since, continuous, filter, filter_params, doc_ids, headers) = {
            let state = inner.state.lock();
            (
                state.last_sequence.clone(),
                state.continuous,
                state.filter.clone(),
                state.filter_params.clone(),
                state.doc_ids.clone(),
                state.headers.clone(),
            )
        };
        debug!(since = ?since, continuous, "starting change feed");

        let generation = {
            // Sequences that never completed in a previous round come back
            // through the feed; stale tracker entries would pin the
            // watermark forever.
            let mut pull = inner.pull.lock();
            pull.tracker.clear();
            pull.to_insert.clear();
            pull.feed_generation += 1;
            pull.feed_generation
        };
        let previous = inner.pull.lock().feed.take();
        if let Some(previous) = previous {
            previous.stop();
        }

        // One-shot pulls drain the feed once and stop; continuous pulls
        // keep the connection open in long-poll mode, so the feed's own
        // reopening loop delivers changes as soon as they happen.
        let mode = if continuous {
            FeedMode::LongPoll
        } else {
            FeedMode::OneShot
        };
        let feed = Arc::new(ChangeFeed::new(
            inner.remote.clone(),
            mode,
            true, // style=all_docs so conflicting branches replicate too
            since.map(Value::from),
            Arc::clone(&inner.http),
            Arc::new(PullFeedClient {
                inner: Arc::downgrade(inner),
                counts_as_task: !continuous,
                generation,
            }),
        ));
        feed.set_filter(filter);
        feed.set_filter_params(filter_params);
        feed.set_doc_ids(doc_ids);
        feed.set_request_headers(headers);

        // A one-shot feed counts as one long-lived async task: the
        // replication stays active until it ends and the inbox drains. A
        // long-poll feed runs for the life of the replication and must not
        // pin it active; activity follows the inbox and the requests.
        if !continuous {
            inner.async_task_started();
        }
        match feed.start() {
            Ok(()) => {
                inner.pull.lock().feed = Some(feed);
            }
            Err(e) => {
                inner.set_error(e);
                if !continuous {
                    inner.async_task_finished(1);
                }
            }
        }
    }

    fn process_inbox(&self, inner: &Arc<Inner>, inbox: Vec<RevisionRef>) {
        inner.pull.lock().downloads_outstanding += inbox.len();
        for rev in inbox {
            fetch_revision(inner, rev);
        }
    }

    fn maybe_create_remote_db(&self, _inner: &Arc<Inner>) {
        // Pulls never create the remote database.
    }

    fn retry(&self, inner: &Arc<Inner>) {
        // Re-run the feed from the current watermark; previously failed
        // sequences come back because the checkpoint never passed them.
        self.begin_replicating(inner);
    }

    fn stopping(&self, inner: &Arc<Inner>) {
        let feed = inner.pull.lock().feed.take();
        if let Some(feed) = feed {
            feed.stop();
        }
    }
}

/// One change record arriving on the executor: filter out revisions that
/// already exist locally and queue the rest.
fn handle_change(inner: &Arc<Inner>, change: ChangeEntry) {
    let mut candidates: Vec<(String, RevId)> = Vec::new();
    for rev in &change.revs {
        match rev.parse::<RevId>() {
            Ok(rev_id) => candidates.push((change.doc_id.clone(), rev_id)),
            Err(_) => warn!(doc = %change.doc_id, rev = %rev, "ignoring malformed rev id"),
        }
    }

    let missing = match inner.store.find_missing_revisions(&candidates) {
        Ok(missing) => missing,
        Err(e) => {
            inner.set_error(e.into());
            return;
        }
    };

    let seq_value = change.seq_string();
    if missing.is_empty() {
        // Nothing to fetch; the sequence is already satisfied locally, but
        // it still has to flow through the watermark so the checkpoint can
        // pass it.
        let mark = {
            let mut pull = inner.pull.lock();
            let key = pull.next_key;
            pull.next_key += 1;
            pull.tracker.add(key, seq_value);
            pull.tracker.complete(key)
        };
        if let Some(mark) = mark {
            inner.set_last_sequence(mark);
        }
        return;
    }

    trace!(doc = %change.doc_id, count = missing.len(), "queueing missing revisions");
    inner.add_changes_count(missing.len() as u64);
    for (doc_id, rev_id) in missing {
        let key = {
            let mut pull = inner.pull.lock();
            let key = pull.next_key;
            pull.next_key += 1;
            pull.tracker.add(key, seq_value.clone());
            key
        };
        inner.add_to_inbox(RevisionRef {
            doc_id,
            rev_id,
            key,
            seq_value: seq_value.clone(),
            deleted: change.deleted,
        });
    }
}

fn feed_stopped(
    inner: &Arc<Inner>,
    error: Option<ReplicationError>,
    counted: bool,
    generation: u64,
) {
    debug!("change feed finished");
    {
        let mut pull = inner.pull.lock();
        if pull.feed_generation == generation {
            pull.feed = None;
        }
    }
    if let Some(e) = error {
        let auth = e.is_auth();
        let continuous = inner.state.lock().continuous;
        inner.set_error(e);
        if auth {
            // Credentials are not recovered automatically.
            inner.stop_on_executor();
        } else if continuous {
            // The long-poll loop has died; bring it back on the retry
            // cadence rather than leaving the replication idle forever.
            inner.cancel_retry();
            inner.schedule_retry();
        }
    }
    if counted {
        inner.async_task_finished(1);
    }
}

/// Fetches one revision body (multipart when it has attachments) and stages
/// it for the batch insert.
fn fetch_revision(inner: &Arc<Inner>, rev: RevisionRef) {
    let path = format!(
        "/{}?rev={}&revs=true&attachments=true",
        encode_doc_id(&rev.doc_id),
        rev.rev_id
    );
    inner.async_task_started();
    let target = Arc::clone(inner);
    inner.send_multipart_download(&path, move |result| {
        match result {
            Ok(props) => {
                target.pull.lock().to_insert.push((rev, props));
            }
            Err(ReplicationError::Cancelled) => {}
            Err(e) => {
                warn!(doc = %rev.doc_id, rev = %rev.rev_id, error = %e, "failed to fetch revision");
                target.revision_failed();
                target.set_error(e);
            }
        }
        let drained = {
            let mut pull = target.pull.lock();
            pull.downloads_outstanding -= 1;
            pull.downloads_outstanding == 0
        };
        if drained {
            insert_downloaded(&target);
        }
        target.async_task_finished(1);
    });
}

/// Stores every fetched revision in a single transaction, then advances the
/// watermark over the sequences that are now durable.
fn insert_downloaded(inner: &Arc<Inner>) {
    let batch: Vec<(RevisionRef, Body)> = {
        let mut pull = inner.pull.lock();
        std::mem::take(&mut pull.to_insert)
    };
    if batch.is_empty() {
        return;
    }
    debug!(count = batch.len(), "inserting downloaded revisions");

    if let Err(e) = inner.store.begin_transaction() {
        inner.set_error(e.into());
        inner.stop_on_executor();
        return;
    }
    let mut stored_keys = Vec::with_capacity(batch.len());
    let mut store_error = None;
    for (rev_ref, props) in batch {
        let history = history_from_properties(&props, &rev_ref.rev_id);
        let deleted = props
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(rev_ref.deleted);
        let revision = Revision {
            doc_id: rev_ref.doc_id.clone(),
            rev_id: rev_ref.rev_id.clone(),
            sequence: 0,
            deleted,
            body: Some(props),
        };
        match inner.store.force_insert(revision, &history) {
            Ok(_) => stored_keys.push(rev_ref.key),
            Err(e) => {
                store_error = Some(e);
                break;
            }
        }
    }
    let success = store_error.is_none();
    if let Err(e) = inner.store.end_transaction(success) {
        store_error.get_or_insert(e);
    }
    if let Some(e) = store_error {
        // A store failure is not a per-revision hiccup; the replication
        // cannot make progress safely.
        inner.set_error(e.into());
        inner.stop_on_executor();
        return;
    }

    let mark = {
        let mut pull = inner.pull.lock();
        let mut latest = None;
        for key in &stored_keys {
            if let Some(mark) = pull.tracker.complete(*key) {
                latest = Some(mark);
            }
        }
        latest
    };
    inner.add_completed_changes(stored_keys.len() as u64);
    if let Some(mark) = mark {
        inner.set_last_sequence(mark);
    }
}

/// Extracts the revision history from a `_revisions` object
/// (`{"start": N, "ids": ["hashN", "hashN-1", ...]}`), newest first.
fn history_from_properties(props: &Body, rev_id: &RevId) -> Vec<RevId> {
    let Some(revisions) = props.get("_revisions").and_then(Value::as_object) else {
        return vec![rev_id.clone()];
    };
    let Some(start) = revisions.get("start").and_then(Value::as_u64) else {
        return vec![rev_id.clone()];
    };
    let Some(ids) = revisions.get("ids").and_then(Value::as_array) else {
        return vec![rev_id.clone()];
    };
    let mut history = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let Some(suffix) = id.as_str() else {
            return vec![rev_id.clone()];
        };
        let generation = start.saturating_sub(i as u64);
        if generation == 0 {
            break;
        }
        history.push(RevId::new(generation, suffix));
    }
    if history.first() != Some(rev_id) {
        // The history does not describe this revision; fall back to a bare
        // entry rather than corrupting the tree.
        return vec![rev_id.clone()];
    }
    history
}
