//! Push direction: local changes → `_revs_diff` → `_bulk_docs` or
//! multipart upload → acked watermark advance.

use crate::multipart::MultipartWriter;
use crate::replicator::{encode_doc_id, DirectionOps, Inner, RevisionRef};
use crate::tracker::SequenceTracker;
use loam_blob::BlobKey;
use loam_core::{Body, ChangesOptions, Revision};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Mutable push-side state, touched only on the work executor.
#[derive(Default)]
pub(crate) struct PushState {
    pub tracker: SequenceTracker,
    /// A `PUT /db` to create the target is in flight; replication waits.
    pub creating_target: bool,
}

/// Push specialisation of the replication core.
pub(crate) struct PushOps;

impl DirectionOps for PushOps {
    fn begin_replicating(&self, inner: &Arc<Inner>) {
        if inner.push_state.lock().creating_target {
            // Resumed by the create-target completion.
            return;
        }
        let since = {
            let state = inner.state.lock();
            state
                .last_sequence
                .as_deref()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0)
        };
        let options = ChangesOptions {
            include_conflicts: true,
            include_docs: false,
            ..Default::default()
        };
        let changes = match inner.store.changes_since(since, &options) {
            Ok(changes) => changes,
            Err(e) => {
                inner.set_error(e.into());
                return;
            }
        };
        // Unacknowledged sequences from a previous round are rescanned here;
        // drop their stale tracker entries.
        inner.push_state.lock().tracker.clear();
        debug!(since, count = changes.len(), "pushing local changes");
        inner.add_changes_count(changes.len() as u64);

        let doc_ids = inner.state.lock().doc_ids.clone();
        for rev in changes {
            if !doc_ids.is_empty() && !doc_ids.contains(&rev.doc_id) {
                continue;
            }
            {
                let mut push = inner.push_state.lock();
                push.tracker.add(rev.sequence, rev.sequence.to_string());
            }
            inner.add_to_inbox(RevisionRef {
                doc_id: rev.doc_id,
                rev_id: rev.rev_id,
                key: rev.sequence,
                seq_value: rev.sequence.to_string(),
                deleted: rev.deleted,
            });
        }
    }

    fn process_inbox(&self, inner: &Arc<Inner>, inbox: Vec<RevisionRef>) {
        // Ask the remote which of these revisions it lacks.
        let mut diff: Map<String, Value> = Map::new();
        for rev in &inbox {
            let entry = diff
                .entry(rev.doc_id.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(revs) = entry.as_array_mut() {
                revs.push(Value::from(rev.rev_id.to_string()));
            }
        }

        inner.async_task_started();
        let target = Arc::clone(inner);
        inner.send_request(
            crate::transport::Method::Post,
            "/_revs_diff",
            Some(Value::Object(diff)),
            move |result| {
                match result {
                    Ok(response) => on_revs_diff(&target, inbox, &response),
                    Err(crate::error::ReplicationError::Cancelled) => {}
                    Err(e) => {
                        warn!(error = %e, "_revs_diff failed");
                        target.set_error(e);
                    }
                }
                target.async_task_finished(1);
            },
        );
    }

    fn maybe_create_remote_db(&self, inner: &Arc<Inner>) {
        if !inner.state.lock().create_target {
            return;
        }
        debug!("creating remote database");
        inner.push_state.lock().creating_target = true;
        inner.async_task_started();
        let target = Arc::clone(inner);
        inner.send_request(crate::transport::Method::Put, "", None, move |result| {
            target.push_state.lock().creating_target = false;
            match result {
                // 412 means the database already exists, which is just as
                // good as having created it.
                Ok(_) => {
                    target.state.lock().create_target = false;
                    target.ops.clone().begin_replicating(&target);
                }
                Err(e) if e.status() == Some(412) => {
                    target.state.lock().create_target = false;
                    target.ops.clone().begin_replicating(&target);
                }
                Err(e) => {
                    warn!(error = %e, "failed to create remote database");
                    target.set_error(e);
                }
            }
            target.async_task_finished(1);
        });
    }

    fn retry(&self, inner: &Arc<Inner>) {
        self.begin_replicating(inner);
    }

    fn stopping(&self, _inner: &Arc<Inner>) {}
}

/// Handles the `_revs_diff` response: acknowledge what the remote already
/// has, upload what it is missing.
fn on_revs_diff(inner: &Arc<Inner>, inbox: Vec<RevisionRef>, response: &Value) {
    let empty = Map::new();
    let diff = response.as_object().unwrap_or(&empty);

    let mut bulk_docs: Vec<Value> = Vec::new();
    let mut bulk_refs: Vec<RevisionRef> = Vec::new();
    let mut acked: Vec<u64> = Vec::new();

    for rev in inbox {
        let missing = diff
            .get(&rev.doc_id)
            .and_then(|d| d.get("missing"))
            .and_then(Value::as_array)
            .is_some_and(|missing| {
                missing
                    .iter()
                    .any(|m| m.as_str() == Some(&rev.rev_id.to_string()))
            });
        if !missing {
            trace!(doc = %rev.doc_id, rev = %rev.rev_id, "remote already has revision");
            acked.push(rev.key);
            continue;
        }

        let loaded = match inner.store.revision_body(&rev.doc_id, &rev.rev_id) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                warn!(doc = %rev.doc_id, rev = %rev.rev_id, "revision vanished before upload");
                inner.revision_failed();
                continue;
            }
            Err(e) => {
                inner.set_error(e.into());
                inner.revision_failed();
                continue;
            }
        };

        if loaded.has_attachments() {
            upload_multipart(inner, rev, loaded);
        } else {
            match upload_properties(inner, &rev, &loaded) {
                Some(props) => {
                    bulk_docs.push(Value::Object(props));
                    bulk_refs.push(rev);
                }
                None => inner.revision_failed(),
            }
        }
    }

    complete_keys(inner, &acked);

    if !bulk_docs.is_empty() {
        upload_bulk_docs(inner, bulk_refs, bulk_docs);
    }
}

/// Builds the wire properties for a revision: body plus `_revisions` history
/// for `new_edits: false`.
fn upload_properties(inner: &Arc<Inner>, rev: &RevisionRef, loaded: &Revision) -> Option<Body> {
    let mut props = loaded.body.clone().unwrap_or_default();
    props.insert("_id".into(), Value::from(rev.doc_id.clone()));
    props.insert("_rev".into(), Value::from(rev.rev_id.to_string()));
    if loaded.deleted {
        props.insert("_deleted".into(), Value::from(true));
    }
    let history = inner
        .store
        .revision_history(&rev.doc_id, &rev.rev_id)
        .ok()?;
    if !history.is_empty() {
        let ids: Vec<Value> = history
            .iter()
            .map(|r| Value::from(r.suffix().to_string()))
            .collect();
        props.insert(
            "_revisions".into(),
            json!({"start": rev.rev_id.generation(), "ids": ids}),
        );
    }
    Some(props)
}

fn upload_bulk_docs(inner: &Arc<Inner>, refs: Vec<RevisionRef>, docs: Vec<Value>) {
    debug!(count = docs.len(), "uploading via _bulk_docs");
    let body = json!({"new_edits": false, "docs": docs});
    inner.async_task_started();
    let target = Arc::clone(inner);
    inner.send_request(
        crate::transport::Method::Post,
        "/_bulk_docs",
        Some(body),
        move |result| {
            match result {
                Ok(response) => {
                    // With new_edits:false the response lists only failures.
                    let mut failed_docs: Vec<(String, bool)> = Vec::new();
                    if let Some(rows) = response.as_array() {
                        for row in rows {
                            if row.get("error").is_some() {
                                let id = row
                                    .get("id")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string();
                                let conflict =
                                    row.get("error").and_then(Value::as_str) == Some("conflict");
                                failed_docs.push((id, conflict));
                            }
                        }
                    }
                    let mut acked = Vec::new();
                    for rev in &refs {
                        match failed_docs.iter().find(|(id, _)| id == &rev.doc_id) {
                            // A conflict means the remote already decided
                            // against this revision; skip past it.
                            Some((_, true)) | None => acked.push(rev.key),
                            Some((_, false)) => {
                                warn!(doc = %rev.doc_id, "remote rejected revision");
                                target.revision_failed();
                            }
                        }
                    }
                    complete_keys(&target, &acked);
                }
                Err(crate::error::ReplicationError::Cancelled) => {}
                Err(e) => {
                    warn!(error = %e, "_bulk_docs failed");
                    for _ in &refs {
                        target.revision_failed();
                    }
                    target.set_error(e);
                }
            }
            target.async_task_finished(1);
        },
    );
}

/// Uploads one document with attachments as `multipart/related`.
fn upload_multipart(inner: &Arc<Inner>, rev: RevisionRef, loaded: Revision) {
    let Some(mut props) = upload_properties(inner, &rev, &loaded) else {
        inner.revision_failed();
        return;
    };

    // Mark every attachment as following the document part, and collect the
    // bodies from the blob store in stub order.
    let mut attachment_bodies: Vec<(Option<String>, Vec<u8>)> = Vec::new();
    if let Some(attachments) = props.get_mut("_attachments").and_then(Value::as_object_mut) {
        for (name, stub) in attachments.iter_mut() {
            let Some(stub) = stub.as_object_mut() else {
                continue;
            };
            let digest = stub.get("digest").and_then(Value::as_str).unwrap_or("");
            let Ok(key) = BlobKey::from_digest_string(digest) else {
                warn!(attachment = %name, "attachment stub without a digest");
                inner.revision_failed();
                return;
            };
            let content = match inner.blobs.blob_contents(&key) {
                Ok(content) => content,
                Err(e) => {
                    warn!(attachment = %name, error = %e, "attachment body missing");
                    inner.revision_failed();
                    return;
                }
            };
            let content_type = stub
                .get("content_type")
                .and_then(Value::as_str)
                .map(str::to_string);
            stub.insert("follows".into(), Value::from(true));
            stub.remove("data");
            attachment_bodies.push((content_type, content));
        }
    }

    let mut writer = MultipartWriter::new();
    if let Err(e) = writer.add_document(&props) {
        inner.set_error(e);
        inner.revision_failed();
        return;
    }
    for (content_type, content) in attachment_bodies {
        writer.add_attachment(content_type.as_deref(), &content);
    }

    debug!(doc = %rev.doc_id, "uploading document with attachments");
    let path = format!("/{}?new_edits=false", encode_doc_id(&rev.doc_id));
    inner.async_task_started();
    let target = Arc::clone(inner);
    inner.send_multipart_upload(
        crate::transport::Method::Put,
        &path,
        writer,
        move |result| {
            match result {
                Ok(_) => complete_keys(&target, &[rev.key]),
                Err(e) if e.is_conflict() => {
                    // Remote wins; skip the revision without failing it.
                    debug!(doc = %rev.doc_id, "conflict on upload, skipping revision");
                    complete_keys(&target, &[rev.key]);
                }
                Err(crate::error::ReplicationError::Cancelled) => {}
                Err(e) => {
                    warn!(doc = %rev.doc_id, error = %e, "attachment upload failed");
                    target.revision_failed();
                    target.set_error(e);
                }
            }
            target.async_task_finished(1);
        },
    );
}

/// Marks sequences acknowledged and advances the checkpoint watermark.
fn complete_keys(inner: &Arc<Inner>, keys: &[u64]) {
    if keys.is_empty() {
        return;
    }
    let mark = {
        let mut push = inner.push_state.lock();
        let mut latest = None;
        for key in keys {
            if let Some(mark) = push.tracker.complete(*key) {
                latest = Some(mark);
            }
        }
        latest
    };
    inner.add_completed_changes(keys.len() as u64);
    if let Some(mark) = mark {
        inner.set_last_sequence(mark);
    }
}
