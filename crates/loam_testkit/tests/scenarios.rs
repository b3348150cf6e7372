//! End-to-end replication scenarios against the in-memory fake remote.

use loam_core::{LocalStore, QueryOptions, View};
use loam_replicator::{ReplicationStatus, ReplicatorConfig};
use loam_testkit::{wait_until, ReplicationHarness};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn seed_three_docs(harness: &ReplicationHarness) {
    harness.remote.seed_doc("a", "1-x", json!({"n": 1}));
    harness.remote.seed_doc("b", "1-y", json!({"n": 2}));
    harness.remote.seed_doc("c", "1-z", json!({"n": 3}));
}

#[test]
fn fresh_pull_of_three_documents() {
    let harness = ReplicationHarness::new();
    seed_three_docs(&harness);

    let puller = harness.puller();
    puller.start();
    assert!(puller.wait_until_stopped(WAIT));

    for (doc, rev) in [("a", "1-x"), ("b", "1-y"), ("c", "1-z")] {
        assert!(
            harness.store.contains_revision(doc, &rev.parse().unwrap()),
            "missing {doc}@{rev}"
        );
    }
    assert_eq!(puller.last_sequence().as_deref(), Some("3"));
    assert!(puller.last_error().is_none());
    assert_eq!(puller.changes_count(), 3);
    assert_eq!(puller.completed_changes_count(), 3);

    // The checkpoint lands on the remote shortly after the stop.
    let checkpoint_id = harness.checkpoint_id(false);
    assert!(wait_until(WAIT, || {
        harness
            .remote
            .local_checkpoint(&checkpoint_id)
            .and_then(|cp| cp.get("lastSequence").cloned())
            == Some(json!("3"))
    }));
    // And is mirrored locally under the same id.
    assert_eq!(
        harness.store.last_sequence_for(&checkpoint_id).unwrap(),
        Some("3".to_string())
    );
}

#[test]
fn resumed_pull_issues_no_document_fetches() {
    let harness = ReplicationHarness::new();
    seed_three_docs(&harness);

    let first = harness.puller();
    first.start();
    assert!(first.wait_until_stopped(WAIT));
    let checkpoint_id = harness.checkpoint_id(false);
    assert!(wait_until(WAIT, || {
        harness.remote.local_checkpoint(&checkpoint_id).is_some()
    }));
    let fetches_after_first = harness.remote.doc_get_count();
    assert_eq!(fetches_after_first, 3);

    // Same store, fresh replicator: simulates a process restart.
    let second = harness.puller();
    second.start();
    assert!(second.wait_until_stopped(WAIT));

    assert_eq!(harness.remote.doc_get_count(), fetches_after_first);
    assert_eq!(second.last_sequence().as_deref(), Some("3"));
    assert!(second.last_error().is_none());
}

#[test]
fn failed_revision_pins_checkpoint_and_schedules_retry() {
    let harness = ReplicationHarness::new();
    seed_three_docs(&harness);
    harness.remote.fail_next_doc_get("b", 500);

    let puller = harness.replicator(ReplicatorConfig::pull(harness.remote.url()).continuous());
    puller.start();

    // The batch completes: a and c are stored, b is not.
    assert!(wait_until(WAIT, || {
        harness
            .store
            .contains_revision("a", &"1-x".parse().unwrap())
            && harness
                .store
                .contains_revision("c", &"1-z".parse().unwrap())
    }));
    assert!(wait_until(WAIT, || puller.status() == ReplicationStatus::Idle));

    assert!(!harness.store.contains_revision("b", &"1-y".parse().unwrap()));
    // The watermark never passed the failed revision.
    assert_eq!(puller.last_sequence().as_deref(), Some("1"));
    assert_eq!(puller.revisions_failed(), 1);
    assert!(puller.last_error().is_some());
    assert!(puller.retry_pending());

    puller.stop();
    assert!(puller.wait_until_stopped(WAIT));
}

#[test]
fn checkpoint_conflict_refreshes_rev_and_resaves() {
    let harness = ReplicationHarness::new();
    harness.remote.seed_doc("a", "1-x", json!({"n": 1}));

    let checkpoint_id = harness.checkpoint_id(false);
    harness
        .remote
        .seed_local(&checkpoint_id, json!({"lastSequence": "0"}));
    harness.remote.conflict_next_checkpoint_save(&checkpoint_id);

    let puller = harness.puller();
    puller.start();
    assert!(puller.wait_until_stopped(WAIT));

    // The 409 triggered a refresh (GET) and a successful re-save: the
    // checkpoint now records the pulled sequence at the remote's latest rev.
    assert!(wait_until(WAIT, || {
        harness
            .remote
            .local_checkpoint(&checkpoint_id)
            .and_then(|cp| cp.get("lastSequence").cloned())
            == Some(json!("1"))
    }));
    let checkpoint = harness.remote.local_checkpoint(&checkpoint_id).unwrap();
    assert_eq!(checkpoint.get("_rev"), Some(&json!("0-2")));
}

#[test]
fn checkpoint_echoes_unknown_remote_fields() {
    let harness = ReplicationHarness::new();
    harness.remote.seed_doc("a", "1-x", json!({"n": 1}));

    let checkpoint_id = harness.checkpoint_id(false);
    harness.remote.seed_local(
        &checkpoint_id,
        json!({"lastSequence": "0", "history": [{"session": "older"}]}),
    );

    let puller = harness.puller();
    puller.start();
    assert!(puller.wait_until_stopped(WAIT));

    assert!(wait_until(WAIT, || {
        harness
            .remote
            .local_checkpoint(&checkpoint_id)
            .and_then(|cp| cp.get("lastSequence").cloned())
            == Some(json!("1"))
    }));
    let checkpoint = harness.remote.local_checkpoint(&checkpoint_id).unwrap();
    assert_eq!(
        checkpoint.get("history"),
        Some(&json!([{"session": "older"}]))
    );
}

#[test]
fn pull_round_trips_attachments_byte_identically() {
    let harness = ReplicationHarness::new();
    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    harness.remote.seed_doc_with_attachment(
        "with-att",
        "1-a",
        json!({"title": "attached"}),
        "data.bin",
        "application/octet-stream",
        &payload,
    );

    let puller = harness.puller();
    puller.start();
    assert!(puller.wait_until_stopped(WAIT));
    assert!(puller.last_error().is_none());

    let local = harness.store.winning_revision("with-att").unwrap().unwrap();
    let digest = local.body.as_ref().unwrap()["_attachments"]["data.bin"]["digest"]
        .as_str()
        .unwrap()
        .to_string();
    let key = loam_blob::BlobKey::from_digest_string(&digest).unwrap();
    assert_eq!(harness.blobs.blob_contents(&key).unwrap(), payload);
    // The stored bytes hash back to the key they are filed under.
    harness.blobs.verify(&key).unwrap();
}

#[test]
fn push_uploads_local_changes() {
    let harness = ReplicationHarness::new();
    let body = |v: Value| v.as_object().unwrap().clone();
    let r1 = harness.store.put("one", body(json!({"n": 1}))).unwrap();
    let r2 = harness.store.put("two", body(json!({"n": 2}))).unwrap();

    let pusher = harness.pusher();
    pusher.start();
    assert!(pusher.wait_until_stopped(WAIT));
    assert!(pusher.last_error().is_none());

    assert!(harness.remote.has_revision("one", &r1.rev_id.to_string()));
    assert!(harness.remote.has_revision("two", &r2.rev_id.to_string()));
    assert_eq!(pusher.last_sequence().as_deref(), Some("2"));
    assert!(harness.remote.revs_diff_count() >= 1);

    let checkpoint_id = harness.checkpoint_id(true);
    assert!(wait_until(WAIT, || {
        harness
            .remote
            .local_checkpoint(&checkpoint_id)
            .and_then(|cp| cp.get("lastSequence").cloned())
            == Some(json!("2"))
    }));
}

#[test]
fn push_skips_revisions_the_remote_already_has() {
    let harness = ReplicationHarness::new();
    let body = |v: Value| v.as_object().unwrap().clone();
    let rev = harness.store.put("shared", body(json!({"n": 1}))).unwrap();
    harness
        .remote
        .seed_doc("shared", &rev.rev_id.to_string(), json!({"n": 1}));
    let doc_gets_before = harness.remote.request_log().len();

    let pusher = harness.pusher();
    pusher.start();
    assert!(pusher.wait_until_stopped(WAIT));

    // _revs_diff reported nothing missing, so no upload happened.
    assert!(pusher.last_error().is_none());
    assert_eq!(pusher.last_sequence().as_deref(), Some("1"));
    let log = harness.remote.request_log();
    assert!(!log
        .iter()
        .skip(doc_gets_before)
        .any(|(_, url)| url.contains("_bulk_docs")));
}

#[test]
fn push_sends_attachments_as_multipart() {
    let harness = ReplicationHarness::new();
    let payload = b"pushed attachment content";
    let (key, length) = harness.blobs.store_blob(payload).unwrap();
    let body = json!({
        "title": "outgoing",
        "_attachments": {
            "file.bin": {
                "content_type": "application/octet-stream",
                "digest": key.digest_string(),
                "length": length,
                "revpos": 1,
            }
        }
    });
    harness
        .store
        .put("outgoing", body.as_object().unwrap().clone())
        .unwrap();

    let pusher = harness.pusher();
    pusher.start();
    assert!(pusher.wait_until_stopped(WAIT));
    assert!(pusher.last_error().is_none());

    // The remote now holds byte-identical attachment content.
    assert_eq!(
        harness.remote.attachment_contents(&key.digest_string()),
        Some(payload.to_vec())
    );
    let remote_body = harness.remote.doc_body("outgoing").unwrap();
    assert!(remote_body["_attachments"]["file.bin"]["digest"]
        .as_str()
        .unwrap()
        .starts_with("sha1-"));
}

#[test]
fn push_creates_target_database_when_asked() {
    let harness = ReplicationHarness::new();
    harness.remote.drop_database();
    let body = |v: Value| v.as_object().unwrap().clone();
    harness.store.put("doc", body(json!({"n": 1}))).unwrap();

    let pusher =
        harness.replicator(ReplicatorConfig::push(harness.remote.url()).create_target());
    pusher.start();
    assert!(pusher.wait_until_stopped(WAIT));

    assert!(harness.remote.database_exists());
    assert!(pusher.last_error().is_none());
    assert!(wait_until(WAIT, || harness.remote.doc_body("doc").is_some()));
}

#[test]
fn cookie_login_flow_precedes_replication() {
    let harness = ReplicationHarness::new();
    harness.remote.seed_doc("a", "1-x", json!({"n": 1}));

    let remote_url = url::Url::parse(&format!(
        "{}?facebookAccessToken=token-abc&email=user@example.com",
        harness.remote.url()
    ))
    .unwrap();
    let puller = harness.replicator(ReplicatorConfig::pull(remote_url));
    puller.start();
    assert!(puller.wait_until_stopped(WAIT));
    assert!(puller.last_error().is_none());

    let logins = harness.remote.login_requests();
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].0, "_facebook");
    assert_eq!(logins[0].1["access_token"], json!("token-abc"));
    assert!(harness.store.contains_revision("a", &"1-x".parse().unwrap()));
}

#[test]
fn session_probe_falls_back_to_server_root() {
    let harness = ReplicationHarness::new();
    harness.remote.seed_doc("a", "1-x", json!({"n": 1}));
    harness.remote.disable_db_session_path();
    harness.remote.set_session_user(Some("already@example.com"));

    let remote_url = url::Url::parse(&format!(
        "{}?facebookAccessToken=tok&email=already@example.com",
        harness.remote.url()
    ))
    .unwrap();
    let puller = harness.replicator(ReplicatorConfig::pull(remote_url));
    puller.start();
    assert!(puller.wait_until_stopped(WAIT));

    // An active session means no login POST at all.
    assert!(harness.remote.login_requests().is_empty());
    let log = harness.remote.request_log();
    assert!(log
        .iter()
        .any(|(_, url)| url.ends_with("/db/_session")));
    assert!(log
        .iter()
        .any(|(_, url)| url.ends_with("remote.example/_session")));
    assert!(harness.store.contains_revision("a", &"1-x".parse().unwrap()));
}

#[test]
fn stop_drains_to_stopped_state() {
    let harness = ReplicationHarness::new();
    for i in 0..40 {
        harness
            .remote
            .seed_doc(&format!("doc{i}"), "1-a", json!({"i": i}));
    }

    let puller = harness.replicator(ReplicatorConfig::pull(harness.remote.url()).continuous());
    puller.start();
    // Stop mid-flight; the replication must still reach STOPPED.
    std::thread::sleep(Duration::from_millis(30));
    puller.stop();
    assert!(puller.wait_until_stopped(WAIT));
    assert!(!puller.is_running());
    assert_eq!(puller.status(), ReplicationStatus::Stopped);
}

#[test]
fn continuous_pull_receives_later_changes() {
    let harness = ReplicationHarness::new();
    harness.remote.seed_doc("a", "1-x", json!({"n": 1}));

    let puller = harness.replicator(ReplicatorConfig::pull(harness.remote.url()).continuous());
    puller.start();
    assert!(wait_until(WAIT, || {
        harness.store.contains_revision("a", &"1-x".parse().unwrap())
    }));
    assert!(puller.wait_for_status(WAIT, |s| s == ReplicationStatus::Idle));
    assert!(puller.last_error().is_none());

    // A change arriving while the replication is idle is picked up by the
    // held long-poll on its own, with no reachability nudge.
    harness.remote.seed_doc("b", "1-y", json!({"n": 2}));
    assert!(wait_until(WAIT, || {
        harness.store.contains_revision("b", &"1-y".parse().unwrap())
    }));
    assert!(wait_until(WAIT, || {
        puller.last_sequence().as_deref() == Some("2")
    }));
    assert!(puller.last_error().is_none());

    // And again, to show the loop keeps reopening.
    harness.remote.seed_doc("c", "1-z", json!({"n": 3}));
    assert!(wait_until(WAIT, || {
        harness.store.contains_revision("c", &"1-z".parse().unwrap())
    }));

    puller.stop();
    assert!(puller.wait_until_stopped(WAIT));
}

#[test]
fn database_closing_persists_checkpoint_and_stops() {
    let harness = ReplicationHarness::new();
    harness.remote.seed_doc("a", "1-x", json!({"n": 1}));

    let puller = harness.replicator(ReplicatorConfig::pull(harness.remote.url()).continuous());
    puller.start();
    assert!(wait_until(WAIT, || {
        puller.last_sequence().as_deref() == Some("1")
    }));

    puller.database_closing();
    assert!(puller.wait_until_stopped(WAIT));
    assert!(!puller.is_running());

    let checkpoint_id = harness.checkpoint_id(false);
    assert_eq!(
        harness.store.last_sequence_for(&checkpoint_id).unwrap(),
        Some("1".to_string())
    );
}

#[test]
fn closed_store_refuses_to_start() {
    let harness = ReplicationHarness::new();
    harness.remote.seed_doc("a", "1-x", json!({"n": 1}));
    harness.store.close();

    let puller = harness.puller();
    puller.start();
    harness.executor.run_sync(|| ());

    assert!(!puller.is_running());
    assert_eq!(puller.status(), ReplicationStatus::Stopped);
    assert!(!harness.store.contains_revision("a", &"1-x".parse().unwrap()));
}

#[test]
fn offline_online_cycle_resumes_replication() {
    let harness = ReplicationHarness::new();
    harness.remote.seed_doc("a", "1-x", json!({"n": 1}));

    let puller = harness.replicator(ReplicatorConfig::pull(harness.remote.url()).continuous());
    puller.start();
    assert!(puller.wait_for_status(WAIT, |s| s == ReplicationStatus::Idle));

    puller.go_offline();
    assert!(puller.wait_for_status(WAIT, |s| s == ReplicationStatus::Offline));
    assert!(puller.is_running());

    harness.remote.seed_doc("b", "1-y", json!({"n": 2}));
    puller.go_online();
    assert!(wait_until(WAIT, || {
        harness
            .store
            .contains_revision("b", &"1-y".parse().unwrap())
    }));

    puller.stop();
    assert!(puller.wait_until_stopped(WAIT));
}

#[test]
fn pulled_documents_feed_the_view_indexer() {
    let harness = ReplicationHarness::new();
    harness.remote.seed_doc("a", "1-x", json!({"kind": "fruit", "name": "apple"}));
    harness.remote.seed_doc("b", "1-y", json!({"kind": "fruit", "name": "pear"}));
    harness.remote.seed_doc("c", "1-z", json!({"kind": "tool", "name": "hammer"}));

    let puller = harness.puller();
    puller.start();
    assert!(puller.wait_until_stopped(WAIT));

    let view = View::new(
        Arc::clone(&harness.store) as Arc<dyn LocalStore>,
        "by_kind",
    );
    view.set_map(
        Arc::new(|doc, emitter| {
            if let Some(kind) = doc.get("kind") {
                emitter.emit(kind.clone(), json!(1));
            }
        }),
        "1",
    );
    view.update_index().unwrap();

    let rows = view
        .query_with_options(&QueryOptions::default().with_keys(vec![json!("fruit")]))
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(view.last_sequence_indexed() <= harness.store.last_sequence_number());
}

#[test]
fn grouped_reduce_over_replicated_documents() {
    let harness = ReplicationHarness::new();
    harness.remote.seed_doc("x1", "1-a", json!({"g": 1, "i": 1, "n": 1}));
    harness.remote.seed_doc("x2", "1-b", json!({"g": 1, "i": 2, "n": 2}));
    harness.remote.seed_doc("x3", "1-c", json!({"g": 2, "i": 1, "n": 3}));

    let puller = harness.puller();
    puller.start();
    assert!(puller.wait_until_stopped(WAIT));

    let view = View::new(Arc::clone(&harness.store) as Arc<dyn LocalStore>, "sums");
    view.set_map_reduce(
        Arc::new(|doc, emitter| {
            emitter.emit(
                json!([doc["g"], doc["i"]]),
                doc.get("n").cloned().unwrap_or(Value::Null),
            );
        }),
        Some(Arc::new(|_keys, values, _rereduce| {
            json!(loam_core::total_values(values))
        })),
        "1",
    );
    view.update_index().unwrap();

    let rows = view
        .query_with_options(&QueryOptions::default().reduced().with_group_level(1))
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!((rows[0].key.clone(), rows[0].value.clone()), (json!([1]), json!(3.0)));
    assert_eq!((rows[1].key.clone(), rows[1].value.clone()), (json!([2]), json!(3.0)));
}

#[test]
fn deletions_replicate_as_tombstones() {
    let harness = ReplicationHarness::new();
    harness.remote.seed_doc("gone", "1-x", json!({"n": 1}));
    harness.remote.seed_deletion("gone", "2-y");

    let puller = harness.puller();
    puller.start();
    assert!(puller.wait_until_stopped(WAIT));
    assert!(puller.last_error().is_none());

    // The tombstone arrived; the document resolves to nothing.
    assert!(harness
        .store
        .contains_revision("gone", &"2-y".parse().unwrap()));
    assert!(harness.store.winning_revision("gone").unwrap().is_none());
}
