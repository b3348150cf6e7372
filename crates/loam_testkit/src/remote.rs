//! An in-memory CouchDB-compatible peer.

use loam_blob::{BlobKey, BlobStore};
use loam_core::Body;
use loam_replicator::{
    CancelToken, HttpClient, HttpRequest, HttpResponse, Method, MultipartDocReader,
    MultipartWriter, ReplicationError, ReplicationResult,
};
use parking_lot::{Condvar, Mutex};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::trace;

const SERVER_HEADER: &str = "loam-fake-remote/0.1";
/// How long a long-poll `_changes` request is held open waiting for news.
const LONGPOLL_HOLD: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
struct RemoteDoc {
    body: Body,
    deleted: bool,
    /// Revision hash suffixes, newest first.
    history: Vec<String>,
}

#[derive(Default)]
struct RemoteState {
    exists: bool,
    /// doc id → rev id → stored revision.
    docs: BTreeMap<String, BTreeMap<String, RemoteDoc>>,
    /// doc id → current winning rev id.
    current: BTreeMap<String, String>,
    /// The change log: (seq, doc id, rev id, deleted).
    changes: Vec<(u64, String, String, bool)>,
    next_seq: u64,
    /// `_local` documents: id → (rev generation, body).
    locals: HashMap<String, (u64, Body)>,
    session_user: Option<String>,
    /// Whether `/db/_session` exists (Sync Gateway layout). When false the
    /// db-level probe 404s and clients fall back to the root.
    session_at_db_path: bool,
    login_requests: Vec<(String, Value)>,
    /// doc id → status code to fail the next GET with.
    fail_doc_gets: HashMap<String, u16>,
    /// `_local` ids whose next PUT conflicts regardless of `_rev`.
    conflict_next_local_puts: std::collections::HashSet<String>,
    doc_get_count: usize,
    changes_feed_count: usize,
    revs_diff_count: usize,
    bulk_docs_count: usize,
    request_log: Vec<(Method, String)>,
}

/// An in-memory remote database served straight through [`HttpClient`].
pub struct FakeRemote {
    state: Mutex<RemoteState>,
    /// Signalled whenever the change log grows; wakes held long-polls.
    changed: Condvar,
    blobs: Arc<BlobStore>,
    db_path: String,
    _dir: TempDir,
}

impl FakeRemote {
    /// Creates an existing, empty remote database mounted at `/db`.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let dir = tempfile::tempdir().expect("temp dir for fake remote");
        let blobs =
            BlobStore::open(&dir.path().join("remote-attachments")).expect("remote blob store");
        Arc::new(Self {
            state: Mutex::new(RemoteState {
                exists: true,
                session_at_db_path: true,
                next_seq: 0,
                ..RemoteState::default()
            }),
            changed: Condvar::new(),
            blobs: Arc::new(blobs),
            db_path: "/db".to_string(),
            _dir: dir,
        })
    }

    /// The URL clients should replicate against.
    #[must_use]
    pub fn url(&self) -> url::Url {
        url::Url::parse(&format!("http://remote.example{}", self.db_path))
            .expect("fake remote URL")
    }

    /// Removes the database, as if it was never created.
    pub fn drop_database(&self) {
        let mut state = self.state.lock();
        state.exists = false;
        state.docs.clear();
        state.current.clear();
        state.changes.clear();
        state.locals.clear();
        state.next_seq = 0;
    }

    /// Whether the database exists.
    #[must_use]
    pub fn database_exists(&self) -> bool {
        self.state.lock().exists
    }

    /// Stores a revision and records it on the change log.
    pub fn seed_doc(&self, doc_id: &str, rev: &str, body: Value) {
        let body = body.as_object().cloned().unwrap_or_default();
        self.insert_revision(doc_id, rev, body, false);
    }

    /// Stores a revision whose body references an attachment held by the
    /// remote.
    pub fn seed_doc_with_attachment(
        &self,
        doc_id: &str,
        rev: &str,
        mut body: Value,
        name: &str,
        content_type: &str,
        content: &[u8],
    ) {
        let (key, length) = self.blobs.store_blob(content).expect("store attachment");
        let stub = json!({
            "content_type": content_type,
            "digest": key.digest_string(),
            "length": length,
            "revpos": generation_of(rev),
        });
        let attachments = body
            .as_object_mut()
            .expect("document body is an object")
            .entry("_attachments")
            .or_insert_with(|| Value::Object(Map::new()));
        attachments
            .as_object_mut()
            .expect("_attachments is an object")
            .insert(name.to_string(), stub);
        self.seed_doc(doc_id, rev, body);
    }

    /// Marks a tombstone on the change log.
    pub fn seed_deletion(&self, doc_id: &str, rev: &str) {
        self.insert_revision(doc_id, rev, Body::new(), true);
    }

    fn insert_revision(&self, doc_id: &str, rev: &str, body: Body, deleted: bool) {
        let mut state = self.state.lock();
        let parent_history = state
            .current
            .get(doc_id)
            .and_then(|current| state.docs.get(doc_id).and_then(|revs| revs.get(current)))
            .map(|doc| doc.history.clone())
            .unwrap_or_default();
        let mut history = vec![suffix_of(rev)];
        history.extend(parent_history);

        state.docs.entry(doc_id.to_string()).or_default().insert(
            rev.to_string(),
            RemoteDoc {
                body,
                deleted,
                history,
            },
        );
        state.current.insert(doc_id.to_string(), rev.to_string());
        state.next_seq += 1;
        let seq = state.next_seq;
        state
            .changes
            .push((seq, doc_id.to_string(), rev.to_string(), deleted));
        self.changed.notify_all();
    }

    /// Whether the remote holds this exact revision.
    #[must_use]
    pub fn has_revision(&self, doc_id: &str, rev: &str) -> bool {
        self.state
            .lock()
            .docs
            .get(doc_id)
            .is_some_and(|revs| revs.contains_key(rev))
    }

    /// The current body of a document.
    #[must_use]
    pub fn doc_body(&self, doc_id: &str) -> Option<Body> {
        let state = self.state.lock();
        let rev = state.current.get(doc_id)?;
        state
            .docs
            .get(doc_id)
            .and_then(|revs| revs.get(rev))
            .map(|doc| doc.body.clone())
    }

    /// Contents of an attachment stored on the remote, by digest string.
    #[must_use]
    pub fn attachment_contents(&self, digest: &str) -> Option<Vec<u8>> {
        let key = BlobKey::from_digest_string(digest).ok()?;
        self.blobs.blob_contents(&key).ok()
    }

    /// The body of a `_local` checkpoint document.
    #[must_use]
    pub fn local_checkpoint(&self, id: &str) -> Option<Body> {
        self.state.lock().locals.get(id).map(|(generation, body)| {
            let mut body = body.clone();
            body.insert("_rev".into(), Value::from(format!("0-{generation}")));
            body
        })
    }

    /// Deletes a `_local` document (so the next checkpoint PUT 404s).
    pub fn delete_local(&self, id: &str) {
        self.state.lock().locals.remove(id);
    }

    /// Stores a `_local` document directly, at revision `0-1`.
    pub fn seed_local(&self, id: &str, body: Value) {
        let body = body.as_object().cloned().unwrap_or_default();
        self.state.lock().locals.insert(id.to_string(), (1, body));
    }

    /// Bumps a `_local` document's revision, as a concurrent writer would;
    /// the next PUT with the stale `_rev` conflicts.
    pub fn bump_local_rev(&self, id: &str) {
        if let Some((generation, _)) = self.state.lock().locals.get_mut(id) {
            *generation += 1;
        }
    }

    /// Makes the next PUT of this `_local` document answer 409, as if a
    /// concurrent writer won the race.
    pub fn conflict_next_checkpoint_save(&self, id: &str) {
        self.state
            .lock()
            .conflict_next_local_puts
            .insert(id.to_string());
    }

    /// Fails the next GET of this document with `status`.
    pub fn fail_next_doc_get(&self, doc_id: &str, status: u16) {
        self.state
            .lock()
            .fail_doc_gets
            .insert(doc_id.to_string(), status);
    }

    /// Installs an authenticated session (the `/_session` probe reports it).
    pub fn set_session_user(&self, name: Option<&str>) {
        self.state.lock().session_user = name.map(str::to_string);
    }

    /// Makes `/db/_session` 404 so clients fall back to the root probe.
    pub fn disable_db_session_path(&self) {
        self.state.lock().session_at_db_path = false;
    }

    /// Login POSTs received so far, as (path, body).
    #[must_use]
    pub fn login_requests(&self) -> Vec<(String, Value)> {
        self.state.lock().login_requests.clone()
    }

    /// Number of individual document GETs served.
    #[must_use]
    pub fn doc_get_count(&self) -> usize {
        self.state.lock().doc_get_count
    }

    /// Number of `_changes` requests served.
    #[must_use]
    pub fn changes_feed_count(&self) -> usize {
        self.state.lock().changes_feed_count
    }

    /// Number of `_revs_diff` requests served.
    #[must_use]
    pub fn revs_diff_count(&self) -> usize {
        self.state.lock().revs_diff_count
    }

    /// Every request seen, as (method, url).
    #[must_use]
    pub fn request_log(&self) -> Vec<(Method, String)> {
        self.state.lock().request_log.clone()
    }

    fn respond_json(status: u16, body: Value) -> HttpResponse {
        HttpResponse::new(
            status,
            vec![
                ("Content-Type".into(), "application/json".into()),
                ("Server".into(), SERVER_HEADER.into()),
            ],
            serde_json::to_vec(&body).unwrap_or_default(),
        )
    }

    fn not_found() -> HttpResponse {
        Self::respond_json(404, json!({"error": "not_found"}))
    }

    fn handle_session(&self, db_level: bool) -> HttpResponse {
        let state = self.state.lock();
        if db_level && !state.session_at_db_path {
            return Self::not_found();
        }
        let name = state
            .session_user
            .as_ref()
            .map_or(Value::Null, |n| Value::from(n.clone()));
        Self::respond_json(200, json!({"ok": true, "userCtx": {"name": name, "roles": []}}))
    }

    fn handle_login(&self, path: &str, body: Option<&[u8]>) -> HttpResponse {
        let parsed: Value = body
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or(Value::Null);
        let mut state = self.state.lock();
        state.login_requests.push((path.to_string(), parsed));
        state.session_user = Some("logged-in@example.com".to_string());
        HttpResponse::new(
            200,
            vec![
                ("Content-Type".into(), "application/json".into()),
                ("Server".into(), SERVER_HEADER.into()),
                (
                    "Set-Cookie".into(),
                    "FakeSession=cafebabe; Path=/; HttpOnly".into(),
                ),
            ],
            serde_json::to_vec(&json!({"ok": true})).unwrap_or_default(),
        )
    }

    fn handle_changes(
        &self,
        query: &HashMap<String, String>,
        cancel: &CancelToken,
    ) -> ReplicationResult<HttpResponse> {
        let since: u64 = query
            .get("since")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let longpoll = query.get("feed").map(String::as_str) == Some("longpoll");
        let deadline = Instant::now() + LONGPOLL_HOLD;

        let mut state = self.state.lock();
        state.changes_feed_count += 1;
        if longpoll {
            // Hold the response open until something lands past `since`,
            // the client aborts, or the hold times out (heartbeat-style
            // empty response, the client just reopens).
            while !state.changes.iter().any(|(seq, ..)| *seq > since)
                && Instant::now() < deadline
            {
                if cancel.is_cancelled() {
                    return Err(ReplicationError::Cancelled);
                }
                let _ = self
                    .changed
                    .wait_for(&mut state, Duration::from_millis(20));
            }
            if cancel.is_cancelled() {
                return Err(ReplicationError::Cancelled);
            }
        }
        let results: Vec<Value> = state
            .changes
            .iter()
            .filter(|(seq, ..)| *seq > since)
            .map(|(seq, doc_id, rev, deleted)| {
                let mut row = json!({
                    "seq": seq,
                    "id": doc_id,
                    "changes": [{"rev": rev}],
                });
                if *deleted {
                    row.as_object_mut()
                        .expect("row is an object")
                        .insert("deleted".into(), Value::from(true));
                }
                row
            })
            .collect();
        let last_seq = state.changes.last().map_or(0, |(seq, ..)| *seq);
        Ok(Self::respond_json(
            200,
            json!({"results": results, "last_seq": last_seq}),
        ))
    }

    fn handle_local_get(&self, id: &str) -> HttpResponse {
        match self.local_checkpoint(id) {
            Some(body) => Self::respond_json(200, Value::Object(body)),
            None => Self::not_found(),
        }
    }

    fn handle_local_put(&self, id: &str, body: Option<&[u8]>) -> HttpResponse {
        let Some(parsed) = body
            .and_then(|b| serde_json::from_slice::<Value>(b).ok())
            .and_then(|v| v.as_object().cloned())
        else {
            return Self::respond_json(400, json!({"error": "bad_request"}));
        };
        let mut state = self.state.lock();
        if state.conflict_next_local_puts.remove(id) {
            return Self::respond_json(409, json!({"error": "conflict"}));
        }
        let sent_rev = parsed.get("_rev").and_then(Value::as_str).map(str::to_string);
        let existing = state.locals.get(id).map(|(generation, _)| *generation);
        if let Some(generation) = existing {
            if sent_rev.as_deref() != Some(&format!("0-{generation}")) {
                return Self::respond_json(409, json!({"error": "conflict"}));
            }
        }
        let next = existing.unwrap_or(0) + 1;
        let mut stored = parsed;
        stored.remove("_rev");
        state.locals.insert(id.to_string(), (next, stored));
        Self::respond_json(
            201,
            json!({"ok": true, "id": format!("_local/{id}"), "rev": format!("0-{next}")}),
        )
    }

    fn handle_revs_diff(&self, body: Option<&[u8]>) -> HttpResponse {
        let Some(request) = body
            .and_then(|b| serde_json::from_slice::<Value>(b).ok())
            .and_then(|v| v.as_object().cloned())
        else {
            return Self::respond_json(400, json!({"error": "bad_request"}));
        };
        let mut state = self.state.lock();
        state.revs_diff_count += 1;
        let mut response = Map::new();
        for (doc_id, revs) in request {
            let Some(revs) = revs.as_array().cloned() else {
                continue;
            };
            let missing: Vec<Value> = revs
                .into_iter()
                .filter(|rev| {
                    let Some(rev) = rev.as_str() else { return false };
                    !state
                        .docs
                        .get(&doc_id)
                        .is_some_and(|known| known.contains_key(rev))
                })
                .collect();
            if !missing.is_empty() {
                response.insert(doc_id, json!({"missing": missing}));
            }
        }
        Self::respond_json(200, Value::Object(response))
    }

    fn handle_bulk_docs(&self, body: Option<&[u8]>) -> HttpResponse {
        let Some(request) = body.and_then(|b| serde_json::from_slice::<Value>(b).ok()) else {
            return Self::respond_json(400, json!({"error": "bad_request"}));
        };
        self.state.lock().bulk_docs_count += 1;
        let Some(docs) = request.get("docs").and_then(Value::as_array) else {
            return Self::respond_json(400, json!({"error": "bad_request"}));
        };
        for doc in docs {
            let Some(props) = doc.as_object() else { continue };
            let Some(doc_id) = props.get("_id").and_then(Value::as_str) else {
                continue;
            };
            let Some(rev) = props.get("_rev").and_then(Value::as_str) else {
                continue;
            };
            let deleted = props
                .get("_deleted")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let mut body = props.clone();
            body.remove("_revisions");
            self.insert_revision(doc_id, rev, body, deleted);
        }
        Self::respond_json(201, json!([]))
    }

    fn handle_doc_get(
        &self,
        doc_id: &str,
        query: &HashMap<String, String>,
        accept: Option<&str>,
    ) -> ReplicationResult<HttpResponse> {
        {
            let mut state = self.state.lock();
            if let Some(status) = state.fail_doc_gets.remove(doc_id) {
                return Ok(Self::respond_json(
                    status,
                    json!({"error": "injected failure"}),
                ));
            }
            state.doc_get_count += 1;
        }
        let state = self.state.lock();
        let Some(revs) = state.docs.get(doc_id) else {
            return Ok(Self::not_found());
        };
        let rev_id = match query.get("rev") {
            Some(rev) => rev.clone(),
            None => match state.current.get(doc_id) {
                Some(rev) => rev.clone(),
                None => return Ok(Self::not_found()),
            },
        };
        let Some(doc) = revs.get(&rev_id) else {
            return Ok(Self::not_found());
        };

        let mut body = doc.body.clone();
        body.insert("_id".into(), Value::from(doc_id.to_string()));
        body.insert("_rev".into(), Value::from(rev_id.clone()));
        if doc.deleted {
            body.insert("_deleted".into(), Value::from(true));
        }
        if query.get("revs").map(String::as_str) == Some("true") {
            body.insert(
                "_revisions".into(),
                json!({
                    "start": generation_of(&rev_id),
                    "ids": doc.history,
                }),
            );
        }

        let wants_multipart = accept.is_some_and(|a| a.contains("multipart/related"));
        let has_attachments = body
            .get("_attachments")
            .and_then(Value::as_object)
            .is_some_and(|atts| !atts.is_empty());

        if wants_multipart && has_attachments && query.get("attachments").is_some() {
            let mut contents: Vec<(Option<String>, Vec<u8>)> = Vec::new();
            if let Some(attachments) = body.get_mut("_attachments").and_then(Value::as_object_mut)
            {
                for (_, stub) in attachments.iter_mut() {
                    let Some(stub) = stub.as_object_mut() else { continue };
                    let digest = stub
                        .get("digest")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let key = BlobKey::from_digest_string(digest)
                        .map_err(|_| ReplicationError::Protocol("bad seeded digest".into()))?;
                    let content = self
                        .blobs
                        .blob_contents(&key)
                        .map_err(|_| ReplicationError::Protocol("missing seeded blob".into()))?;
                    let content_type = stub
                        .get("content_type")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    stub.insert("follows".into(), Value::from(true));
                    contents.push((content_type, content));
                }
            }
            let mut writer = MultipartWriter::new();
            writer.add_document(&body)?;
            for (content_type, content) in contents {
                writer.add_attachment(content_type.as_deref(), &content);
            }
            let content_type = writer.content_type();
            return Ok(HttpResponse::new(
                200,
                vec![
                    ("Content-Type".into(), content_type),
                    ("Server".into(), SERVER_HEADER.into()),
                ],
                writer.finish(),
            ));
        }

        Ok(Self::respond_json(200, Value::Object(body)))
    }

    fn handle_doc_put(
        &self,
        doc_id: &str,
        content_type: Option<&str>,
        body: Option<&[u8]>,
    ) -> ReplicationResult<HttpResponse> {
        let Some(bytes) = body else {
            return Ok(Self::respond_json(400, json!({"error": "bad_request"})));
        };
        let props: Body = match content_type {
            Some(ct) if ct.starts_with("multipart/related") => {
                let mut reader = MultipartDocReader::new(ct, Arc::clone(&self.blobs))?;
                reader.append(bytes)?;
                reader.finish()?
            }
            _ => serde_json::from_slice(bytes)?,
        };
        let Some(rev) = props.get("_rev").and_then(Value::as_str).map(str::to_string) else {
            return Ok(Self::respond_json(400, json!({"error": "bad_request"})));
        };
        let deleted = props
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut stored = props;
        stored.remove("_revisions");
        self.insert_revision(doc_id, &rev, stored, deleted);
        Ok(Self::respond_json(
            201,
            json!({"ok": true, "id": doc_id, "rev": rev}),
        ))
    }
}

impl HttpClient for FakeRemote {
    fn execute(&self, request: HttpRequest) -> ReplicationResult<HttpResponse> {
        if request.cancel.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }
        let path = percent_decode(request.url.path());
        let query: HashMap<String, String> = request
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        trace!(method = request.method.as_str(), %path, "fake remote request");
        self.state
            .lock()
            .request_log
            .push((request.method, request.url.to_string()));

        // Server-root endpoints.
        if path == "/_session" {
            return Ok(self.handle_session(false));
        }
        if path == "/_facebook" || path == "/_persona_assertion" {
            return Ok(self.handle_login(&path, request.body.as_deref()));
        }

        // Everything else is database-scoped.
        let Some(rest) = path.strip_prefix(&self.db_path) else {
            return Ok(Self::not_found());
        };
        let rest = rest.strip_prefix('/').unwrap_or(rest);

        if rest.is_empty() {
            return Ok(match request.method {
                Method::Put => {
                    let mut state = self.state.lock();
                    if state.exists {
                        Self::respond_json(412, json!({"error": "file_exists"}))
                    } else {
                        state.exists = true;
                        Self::respond_json(201, json!({"ok": true}))
                    }
                }
                _ if self.state.lock().exists => {
                    Self::respond_json(200, json!({"db_name": "db"}))
                }
                _ => Self::not_found(),
            });
        }

        if !self.state.lock().exists {
            return Ok(Self::not_found());
        }

        match (request.method, rest) {
            (Method::Get, "_session") => Ok(self.handle_session(true)),
            (Method::Post, "_facebook") | (Method::Post, "_persona_assertion") => {
                Ok(self.handle_login(rest, request.body.as_deref()))
            }
            (Method::Get, "_changes") => self.handle_changes(&query, &request.cancel),
            (Method::Get, local) if local.starts_with("_local/") => {
                Ok(self.handle_local_get(&local["_local/".len()..]))
            }
            (Method::Put, local) if local.starts_with("_local/") => {
                Ok(self.handle_local_put(&local["_local/".len()..], request.body.as_deref()))
            }
            (Method::Post, "_revs_diff") => Ok(self.handle_revs_diff(request.body.as_deref())),
            (Method::Post, "_bulk_docs") => Ok(self.handle_bulk_docs(request.body.as_deref())),
            (Method::Get, doc_id) => {
                self.handle_doc_get(doc_id, &query, request.header("Accept"))
            }
            (Method::Put, doc_id) => self.handle_doc_put(
                doc_id,
                request.header("Content-Type").map(str::to_string).as_deref(),
                request.body.as_deref(),
            ),
            _ => Ok(Self::respond_json(405, json!({"error": "method_not_allowed"}))),
        }
    }
}

fn generation_of(rev: &str) -> u64 {
    rev.split_once('-')
        .and_then(|(generation, _)| generation.parse().ok())
        .unwrap_or(1)
}

fn suffix_of(rev: &str) -> String {
    rev.split_once('-')
        .map(|(_, suffix)| suffix.to_string())
        .unwrap_or_else(|| rev.to_string())
}

fn percent_decode(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(high), Some(low)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((high * 16 + low) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
