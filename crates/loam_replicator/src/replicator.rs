//! The replication core: a direction-agnostic orchestrator specialised with
//! puller or pusher behaviour.

use crate::auth::{authorizer_from_url, Authorizer, TokenRegistry};
use crate::batcher::Batcher;
use crate::checkpoint::{checkpoint_doc_id, Checkpoint};
use crate::error::{ReplicationError, ReplicationResult};
use crate::multipart::{MultipartDocReader, MultipartWriter};
use crate::pool::RequestPool;
use crate::puller::{PullOps, PullState};
use crate::pusher::{PushOps, PushState};
use crate::transport::{
    mask_credentials, CancelToken, CookieJar, HttpClient, HttpRequest, HttpResponse, Method,
};
use loam_blob::BlobStore;
use loam_core::{Body, LocalStore, RevId, ScheduledTask, WorkExecutor};
use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use url::Url;

pub(crate) const INBOX_CAPACITY: usize = 100;
pub(crate) const PROCESSOR_DELAY: Duration = Duration::from_millis(500);
pub(crate) const RETRY_DELAY: Duration = Duration::from_secs(60);
pub(crate) const CHECKPOINT_SAVE_DELAY: Duration = Duration::from_secs(2);
pub(crate) const REQUEST_POOL_SIZE: usize = 2;

/// The replication's externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    /// Finished, or hit a fatal error.
    Stopped,
    /// Running but the remote is unreachable.
    Offline,
    /// Caught up, waiting for more changes.
    Idle,
    /// Actively transferring data.
    Active,
}

/// Snapshot passed to change listeners.
#[derive(Debug, Clone)]
pub struct ReplicationEvent {
    /// Current status.
    pub status: ReplicationStatus,
    /// Total changes discovered so far.
    pub changes_count: u64,
    /// Changes fully processed so far.
    pub completed_changes_count: u64,
    /// Most recent non-cancellation error.
    pub last_error: Option<Arc<ReplicationError>>,
}

/// Configuration for one replication.
#[derive(Clone)]
pub struct ReplicatorConfig {
    /// Remote database URL. Authorizer-selecting query parameters are
    /// recognised and stripped.
    pub remote: Url,
    /// Push (local → remote) rather than pull.
    pub push: bool,
    /// Keep running after catching up.
    pub continuous: bool,
    /// Create the target database before pushing (push only).
    pub create_target: bool,
    /// Server-side filter function name.
    pub filter: Option<String>,
    /// Parameters for the filter function.
    pub filter_params: Map<String, Value>,
    /// Restrict replication to these documents.
    pub doc_ids: Vec<String>,
    /// Extra headers for every remote request.
    pub headers: Vec<(String, String)>,
}

impl ReplicatorConfig {
    /// A pull replication from `remote`.
    #[must_use]
    pub fn pull(remote: Url) -> Self {
        Self {
            remote,
            push: false,
            continuous: false,
            create_target: false,
            filter: None,
            filter_params: Map::new(),
            doc_ids: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// A push replication to `remote`.
    #[must_use]
    pub fn push(remote: Url) -> Self {
        Self {
            push: true,
            ..Self::pull(remote)
        }
    }

    /// Keeps the replication running after it catches up.
    #[must_use]
    pub fn continuous(mut self) -> Self {
        self.continuous = true;
        self
    }

    /// Creates the target database if missing (push only).
    #[must_use]
    pub fn create_target(mut self) -> Self {
        self.create_target = true;
        self
    }

    /// Sets the server-side filter.
    #[must_use]
    pub fn with_filter(mut self, name: impl Into<String>, params: Map<String, Value>) -> Self {
        self.filter = Some(name.into());
        self.filter_params = params;
        self
    }

    /// Restricts replication to these documents.
    #[must_use]
    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = doc_ids;
        self
    }

    /// Restricts a pull to these Sync Gateway channels. A convenience over
    /// the `sync_gateway/bychannel` filter; ignored for pushes and cleared
    /// by an empty list.
    #[must_use]
    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        const BY_CHANNEL_FILTER: &str = "sync_gateway/bychannel";
        if self.push {
            return self;
        }
        if channels.is_empty() {
            if self.filter.as_deref() == Some(BY_CHANNEL_FILTER) {
                self.filter = None;
                self.filter_params = Map::new();
            }
        } else {
            self.filter = Some(BY_CHANNEL_FILTER.to_string());
            let mut params = Map::new();
            params.insert("channels".into(), Value::from(channels.join(",")));
            self.filter_params = params;
        }
        self
    }

    /// The channel list encoded in the filter parameters, if the
    /// `sync_gateway/bychannel` filter is active.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        if self.push || self.filter.as_deref() != Some("sync_gateway/bychannel") {
            return Vec::new();
        }
        self.filter_params
            .get("channels")
            .and_then(Value::as_str)
            .map(|joined| joined.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Adds a header to every remote request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// One queued unit of replication work: a revision reference travelling
/// through the inbox.
#[derive(Debug, Clone)]
pub(crate) struct RevisionRef {
    pub doc_id: String,
    pub rev_id: RevId,
    /// Watermark key: arrival index for pulls, local sequence for pushes.
    pub key: u64,
    /// Checkpoint value to record once everything up to `key` lands.
    pub seq_value: String,
    pub deleted: bool,
}

/// Direction-specific behaviour, implemented by the puller and the pusher.
pub(crate) trait DirectionOps: Send + Sync {
    fn begin_replicating(&self, inner: &Arc<Inner>);
    fn process_inbox(&self, inner: &Arc<Inner>, inbox: Vec<RevisionRef>);
    fn maybe_create_remote_db(&self, inner: &Arc<Inner>);
    fn retry(&self, inner: &Arc<Inner>);
    fn stopping(&self, inner: &Arc<Inner>);
}

pub(crate) struct ReplState {
    pub running: bool,
    pub online: bool,
    pub active: bool,
    pub status: ReplicationStatus,
    pub continuous: bool,
    pub create_target: bool,
    pub filter: Option<String>,
    pub filter_params: Map<String, Value>,
    pub doc_ids: Vec<String>,
    pub headers: Vec<(String, String)>,
    pub session_id: String,
    pub last_sequence: Option<String>,
    pub last_sequence_changed: bool,
    pub checkpoint: Checkpoint,
    pub async_task_count: i64,
    pub revisions_failed: u64,
    pub changes_count: u64,
    pub completed_changes_count: u64,
    pub last_error: Option<Arc<ReplicationError>>,
    pub retry_handle: Option<ScheduledTask>,
    pub server_type: Option<String>,
}

fn status_of(state: &ReplState) -> ReplicationStatus {
    if !state.running {
        ReplicationStatus::Stopped
    } else if !state.online {
        ReplicationStatus::Offline
    } else if state.active {
        ReplicationStatus::Active
    } else {
        ReplicationStatus::Idle
    }
}

type Listener = Box<dyn Fn(&ReplicationEvent) + Send>;

pub(crate) struct Inner {
    pub store: Arc<dyn LocalStore>,
    pub blobs: Arc<BlobStore>,
    pub remote: Url,
    pub push: bool,
    pub executor: WorkExecutor,
    pub http: Arc<dyn HttpClient>,
    pub cookies: Arc<CookieJar>,
    pub ops: Arc<dyn DirectionOps>,
    pool: Mutex<RequestPool>,
    requests: Mutex<HashMap<u64, CancelToken>>,
    next_request_id: AtomicU64,
    session_counter: Arc<AtomicU32>,
    pub authorizer: Mutex<Option<Arc<dyn Authorizer>>>,
    pub batcher: Mutex<Option<Arc<Batcher<RevisionRef>>>>,
    pub state: Mutex<ReplState>,
    status_changed: Condvar,
    pub pull: Mutex<PullState>,
    pub push_state: Mutex<PushState>,
    listeners: Mutex<Vec<Listener>>,
}

/// A pull or push replication between a local store and a remote database.
///
/// All public methods are thread-safe; internally every state mutation is
/// funnelled onto the shared work executor.
pub struct Replicator {
    inner: Arc<Inner>,
}

impl Replicator {
    /// Creates a replication. `session_counter` and `registry` are shared
    /// per-manager state; the executor is the manager's work executor.
    pub fn new(
        store: Arc<dyn LocalStore>,
        blobs: Arc<BlobStore>,
        http: Arc<dyn HttpClient>,
        executor: WorkExecutor,
        session_counter: Arc<AtomicU32>,
        registry: Arc<TokenRegistry>,
        config: ReplicatorConfig,
    ) -> Self {
        let (remote, authorizer) = authorizer_from_url(&config.remote, &registry);
        let http = authorizer
            .as_ref()
            .and_then(|a| a.http_client_factory())
            .map_or(http, |factory| factory.client());

        let ops: Arc<dyn DirectionOps> = if config.push {
            Arc::new(PushOps)
        } else {
            Arc::new(PullOps)
        };

        let inner = Arc::new(Inner {
            store,
            blobs,
            remote,
            push: config.push,
            executor: executor.clone(),
            http,
            cookies: Arc::new(CookieJar::new()),
            ops,
            pool: Mutex::new(RequestPool::new(REQUEST_POOL_SIZE)),
            requests: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            session_counter,
            authorizer: Mutex::new(authorizer),
            batcher: Mutex::new(None),
            state: Mutex::new(ReplState {
                running: false,
                online: true,
                active: false,
                status: ReplicationStatus::Stopped,
                continuous: config.continuous,
                create_target: config.create_target,
                filter: config.filter,
                filter_params: config.filter_params,
                doc_ids: config.doc_ids,
                headers: config.headers,
                session_id: String::new(),
                last_sequence: None,
                last_sequence_changed: false,
                checkpoint: Checkpoint::default(),
                async_task_count: 0,
                revisions_failed: 0,
                changes_count: 0,
                completed_changes_count: 0,
                last_error: None,
                retry_handle: None,
                server_type: None,
            }),
            status_changed: Condvar::new(),
            pull: Mutex::new(PullState::default()),
            push_state: Mutex::new(PushState::default()),
            listeners: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let batcher = Batcher::new(
            executor,
            INBOX_CAPACITY,
            PROCESSOR_DELAY,
            Arc::new(move |batch: Vec<RevisionRef>| {
                if let Some(inner) = weak.upgrade() {
                    debug!(size = batch.len(), "processing inbox");
                    inner.ops.clone().process_inbox(&inner, batch);
                    inner.update_active();
                }
            }),
        );
        *inner.batcher.lock() = Some(batcher);

        Self { inner }
    }

    /// Whether this replication pulls from the remote.
    #[must_use]
    pub fn is_pull(&self) -> bool {
        !self.inner.push
    }

    /// The remote URL (query-string credentials stripped).
    #[must_use]
    pub fn remote(&self) -> &Url {
        &self.inner.remote
    }

    /// Installs an authorizer. Takes effect at the next `start()`.
    pub fn set_authorizer(&self, authorizer: Arc<dyn Authorizer>) {
        *self.inner.authorizer.lock() = Some(authorizer);
    }

    /// Registers a listener invoked on every observable change.
    pub fn add_change_listener(&self, listener: impl Fn(&ReplicationEvent) + Send + 'static) {
        self.inner.listeners.lock().push(Box::new(listener));
    }

    /// Starts the replication, asynchronously.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.executor.submit(move || inner.start_on_executor());
    }

    /// Stops the replication, asynchronously. Pending inbox items are
    /// discarded; in-flight requests are cancelled; the final checkpoint is
    /// saved.
    pub fn stop(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.executor.submit(move || inner.stop_on_executor());
    }

    /// Called when the owning database is closing. Flushes the checkpoint,
    /// pre-emptively mirrors `last_sequence` into the local store (a save
    /// PUT may still be in flight when the store goes away), and stops.
    pub fn database_closing(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(move || inner.database_closing_on_executor());
    }

    /// Stops and starts again, picking up from the saved checkpoint.
    pub fn restart(&self) {
        self.stop();
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .schedule(Duration::from_millis(250), move || {
                inner.start_on_executor();
            });
    }

    /// Marks the remote unreachable: cancels in-flight requests but keeps
    /// the replication alive.
    pub fn go_offline(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.executor.submit(move || inner.go_offline_on_executor());
    }

    /// Marks the remote reachable again: re-fetches the checkpoint and
    /// re-enters the session check.
    pub fn go_online(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.executor.submit(move || inner.go_online_on_executor());
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ReplicationStatus {
        status_of(&self.inner.state.lock())
    }

    /// Whether the replication is running (not stopped).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// The most recent non-cancellation error.
    #[must_use]
    pub fn last_error(&self) -> Option<Arc<ReplicationError>> {
        self.inner.state.lock().last_error.clone()
    }

    /// The last checkpointed source sequence.
    #[must_use]
    pub fn last_sequence(&self) -> Option<String> {
        self.inner.state.lock().last_sequence.clone()
    }

    /// Total changes discovered.
    #[must_use]
    pub fn changes_count(&self) -> u64 {
        self.inner.state.lock().changes_count
    }

    /// Changes fully processed.
    #[must_use]
    pub fn completed_changes_count(&self) -> u64 {
        self.inner.state.lock().completed_changes_count
    }

    /// Revisions that failed to transfer since the last retry.
    #[must_use]
    pub fn revisions_failed(&self) -> u64 {
        self.inner.state.lock().revisions_failed
    }

    /// Whether a failed-transfer retry is currently scheduled.
    #[must_use]
    pub fn retry_pending(&self) -> bool {
        self.inner
            .state
            .lock()
            .retry_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_cancelled())
    }

    /// This run's session id.
    #[must_use]
    pub fn session_id(&self) -> String {
        self.inner.state.lock().session_id.clone()
    }

    /// The server type sniffed from the `Server` response header.
    #[must_use]
    pub fn server_type(&self) -> Option<String> {
        self.inner.state.lock().server_type.clone()
    }

    /// Whether the remote is a Sync Gateway of at least `min_version`.
    #[must_use]
    pub fn server_is_sync_gateway_version(&self, min_version: &str) -> bool {
        const PREFIX: &str = "Couchbase Sync Gateway/";
        self.inner
            .state
            .lock()
            .server_type
            .as_deref()
            .and_then(|s| s.strip_prefix(PREFIX))
            .is_some_and(|version| version >= min_version)
    }

    /// Blocks until the status satisfies `pred`, or the timeout elapses.
    pub fn wait_for_status(
        &self,
        timeout: Duration,
        pred: impl Fn(ReplicationStatus) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if pred(status_of(&state)) {
                return true;
            }
            if self
                .inner
                .status_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return pred(status_of(&state));
            }
        }
    }

    /// Blocks until the replication stops.
    pub fn wait_until_stopped(&self, timeout: Duration) -> bool {
        self.wait_for_status(timeout, |status| status == ReplicationStatus::Stopped)
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("remote", &mask_credentials(&self.inner.remote))
            .field("push", &self.inner.push)
            .finish()
    }
}

impl Inner {
    pub(crate) fn checkpoint_id(&self) -> String {
        checkpoint_doc_id(&self.store.private_uuid(), self.remote.as_str(), self.push)
    }

    fn start_on_executor(self: &Arc<Self>) {
        if !self.store.is_open() {
            warn!("not starting replication, local store is closed");
            return;
        }
        let session_id = {
            let mut state = self.state.lock();
            if state.running {
                return;
            }
            state.running = true;
            state.last_sequence = None;
            state.last_sequence_changed = false;
            state.last_error = None;
            state.revisions_failed = 0;
            state.changes_count = 0;
            state.completed_changes_count = 0;
            state.checkpoint = Checkpoint::new(String::new());
            let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
            state.session_id = format!("repl{n:03}");
            state.session_id.clone()
        };
        self.store.add_active_replication(&session_id);
        info!(
            session = %session_id,
            remote = %mask_credentials(&self.remote),
            push = self.push,
            "replication starting"
        );
        self.check_session();
        self.notify();
    }

    pub(crate) fn stop_on_executor(self: &Arc<Self>) {
        {
            let state = self.state.lock();
            if !state.running {
                return;
            }
        }
        info!("replication stopping");
        if let Some(batcher) = self.batcher.lock().as_ref() {
            batcher.clear();
        }
        let session_id = {
            let mut state = self.state.lock();
            state.continuous = false;
            state.session_id.clone()
        };
        self.ops.clone().stopping(self);
        self.stop_remote_requests();
        self.cancel_retry();
        self.store.forget_replication(&session_id);
        let drained = self.state.lock().async_task_count <= 0;
        if drained {
            self.stopped();
        } else {
            debug!("deferring stop until async tasks drain");
        }
    }

    pub(crate) fn stopped(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
        }
        info!("replication stopped");
        self.save_last_sequence();
        // Make the local mirror durable even if the remote save is still in
        // flight when the process exits.
        self.mirror_last_sequence_locally();
        self.notify();
    }

    /// Persists the current `last_sequence` into the local store under the
    /// checkpoint id, if the store is still open.
    fn mirror_last_sequence_locally(self: &Arc<Self>) {
        let (seq, checkpoint_id) = {
            let state = self.state.lock();
            (
                state.last_sequence.clone(),
                state.checkpoint.doc_id().to_string(),
            )
        };
        if let (Some(seq), false) = (seq, checkpoint_id.is_empty()) {
            if !self.store.is_open() {
                return;
            }
            if let Err(e) = self.store.set_last_sequence(&seq, &checkpoint_id, self.push) {
                warn!(error = %e, "failed to persist checkpoint locally");
            }
        }
    }

    /// The owning database is going away. A checkpoint save may be in
    /// flight; its completion cannot be counted on to land before the store
    /// closes, so the local mirror is written now, then the replication
    /// stops.
    fn database_closing_on_executor(self: &Arc<Self>) {
        debug!("database closing");
        self.save_last_sequence();
        let saving = self.state.lock().checkpoint.is_saving();
        if saving {
            self.mirror_last_sequence_locally();
        }
        self.stop_on_executor();
    }

    fn go_offline_on_executor(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if !state.online {
                return;
            }
            state.online = false;
        }
        debug!("going offline");
        self.stop_remote_requests();
        self.notify();
    }

    fn go_online_on_executor(self: &Arc<Self>) {
        let running = {
            let mut state = self.state.lock();
            if state.online {
                return;
            }
            state.online = true;
            if state.running {
                // Force a checkpoint re-fetch; the remote may have moved on.
                state.last_sequence = None;
                state.last_error = None;
            }
            state.running
        };
        debug!("going online");
        {
            let mut pool = self.pool.lock();
            pool.shutdown();
            *pool = RequestPool::new(REQUEST_POOL_SIZE);
        }
        if running {
            self.check_session();
        }
        self.notify();
    }

    fn check_session(self: &Arc<Self>) {
        let cookie_login = self
            .authorizer
            .lock()
            .as_ref()
            .is_some_and(|a| a.uses_cookie_based_login());
        if cookie_login {
            self.check_session_at_path("/_session");
        } else {
            self.fetch_remote_checkpoint();
        }
    }

    fn check_session_at_path(self: &Arc<Self>, session_path: &str) {
        self.async_task_started();
        let path = session_path.to_string();
        let inner = Arc::clone(self);
        self.send_request(Method::Get, session_path, None, move |result| {
            match result {
                Err(e) if e.is_not_found() && path == "/_session" => {
                    // Not a Sync Gateway layout; try the CouchDB root.
                    inner.check_session_at_path("_session");
                }
                Err(e) => {
                    error!(error = %e, "session check failed");
                    inner.set_error(e);
                }
                Ok(response) => {
                    let username = response
                        .get("userCtx")
                        .and_then(|ctx| ctx.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    if username.is_empty() {
                        debug!("no active session, logging in");
                        inner.login();
                    } else {
                        debug!(user = username, "active session");
                        inner.fetch_remote_checkpoint();
                    }
                }
            }
            inner.async_task_finished(1);
        });
    }

    fn login(self: &Arc<Self>) {
        let Some(authorizer) = self.authorizer.lock().clone() else {
            self.fetch_remote_checkpoint();
            return;
        };
        let Some(params) = authorizer.login_parameters_for_site(&self.remote) else {
            debug!("authorizer has no login parameters, skipping login");
            self.fetch_remote_checkpoint();
            return;
        };
        let login_path = authorizer.login_path_for_site(&self.remote);
        debug!(path = %login_path, "logging in");

        let body = Value::Object(
            params
                .into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect(),
        );
        self.async_task_started();
        let inner = Arc::clone(self);
        self.send_request(Method::Post, &login_path, Some(body), move |result| {
            match result {
                Err(e) => {
                    warn!(error = %e, "login failed");
                    inner.set_error(e);
                }
                Ok(_) => {
                    debug!("login succeeded");
                    inner.fetch_remote_checkpoint();
                }
            }
            inner.async_task_finished(1);
        });
    }

    fn fetch_remote_checkpoint(self: &Arc<Self>) {
        let checkpoint_id = self.checkpoint_id();
        {
            let mut state = self.state.lock();
            state.last_sequence_changed = false;
            state.checkpoint = Checkpoint::new(checkpoint_id.clone());
        }
        let local = self
            .store
            .last_sequence_for(&checkpoint_id)
            .unwrap_or_default();

        self.async_task_started();
        let inner = Arc::clone(self);
        let path = format!("/_local/{checkpoint_id}");
        self.send_request(Method::Get, &path, None, move |result| {
            match result {
                Err(e) if e.is_not_found() => {
                    debug!("no remote checkpoint, fresh replication");
                    inner.ops.clone().maybe_create_remote_db(&inner);
                    inner.on_checkpoint_fetched(None, local.clone());
                }
                Err(e) => {
                    warn!(error = %e, "error fetching remote checkpoint");
                    inner.set_error(e);
                }
                Ok(value) => {
                    inner.on_checkpoint_fetched(value.as_object().cloned(), local.clone());
                }
            }
            inner.async_task_finished(1);
        });
    }

    fn on_checkpoint_fetched(self: &Arc<Self>, body: Option<Body>, local: Option<String>) {
        {
            let mut state = self.state.lock();
            state.checkpoint.on_fetched(body);
            let remote_seq = state.checkpoint.remote_last_sequence().map(str::to_string);
            if remote_seq.is_some() && remote_seq == local {
                state.last_sequence = local;
                info!(last_sequence = ?state.last_sequence, "resuming replication");
            } else {
                info!(
                    local = ?local,
                    remote = ?remote_seq,
                    "checkpoint mismatch, replicating from the start"
                );
                state.last_sequence = None;
            }
        }
        self.ops.clone().begin_replicating(self);
    }

    pub(crate) fn add_to_inbox(self: &Arc<Self>, rev: RevisionRef) {
        if let Some(batcher) = self.batcher.lock().as_ref() {
            batcher.queue(rev);
        }
        self.update_active();
    }

    pub(crate) fn async_task_started(self: &Arc<Self>) {
        let count = {
            let mut state = self.state.lock();
            state.async_task_count += 1;
            state.async_task_count
        };
        trace!(count, "async task started");
        if count == 1 {
            self.update_active();
        }
    }

    pub(crate) fn async_task_finished(self: &Arc<Self>, n: i64) {
        let count = {
            let mut state = self.state.lock();
            state.async_task_count -= n;
            debug_assert!(state.async_task_count >= 0, "async task count underflow");
            state.async_task_count
        };
        trace!(count, "async task finished");
        if count == 0 {
            self.update_active();
        }
    }

    pub(crate) fn update_active(self: &Arc<Self>) {
        let batcher_count = self
            .batcher
            .lock()
            .as_ref()
            .map_or(0, |batcher| batcher.count());
        let transition = {
            let mut state = self.state.lock();
            let new_active = batcher_count > 0 || state.async_task_count > 0;
            if state.active == new_active {
                None
            } else {
                state.active = new_active;
                Some((
                    new_active,
                    state.running,
                    state.continuous,
                    state.last_error.is_some(),
                ))
            }
        };
        let Some((active, running, continuous, has_error)) = transition else {
            return;
        };
        debug!(active, "activity changed");
        self.notify();
        if !active && running {
            if !continuous {
                debug!("work drained, stopping one-shot replication");
                self.stopped();
            } else if has_error {
                let failed = self.state.lock().revisions_failed;
                debug!(
                    revisions_failed = failed,
                    retry_in_secs = RETRY_DELAY.as_secs(),
                    "will retry failed transfers"
                );
                self.cancel_retry();
                self.schedule_retry();
            }
        }
    }

    pub(crate) fn set_error(self: &Arc<Self>, e: ReplicationError) {
        if matches!(e, ReplicationError::Cancelled) {
            return;
        }
        error!(error = %e, "replication error");
        self.state.lock().last_error = Some(Arc::new(e));
        self.notify();
    }

    pub(crate) fn revision_failed(self: &Arc<Self>) {
        self.state.lock().revisions_failed += 1;
    }

    pub(crate) fn add_completed_changes(self: &Arc<Self>, n: u64) {
        if n > 0 {
            self.state.lock().completed_changes_count += n;
            self.notify();
        }
    }

    pub(crate) fn add_changes_count(self: &Arc<Self>, n: u64) {
        if n > 0 {
            self.state.lock().changes_count += n;
            self.notify();
        }
    }

    /// Advances `lastSequence` and debounces a checkpoint save.
    pub(crate) fn set_last_sequence(self: &Arc<Self>, seq: String) {
        let schedule = {
            let mut state = self.state.lock();
            if state.last_sequence.as_deref() == Some(seq.as_str()) {
                return;
            }
            trace!(from = ?state.last_sequence, to = %seq, "advancing lastSequence");
            state.last_sequence = Some(seq);
            if state.last_sequence_changed {
                false
            } else {
                state.last_sequence_changed = true;
                true
            }
        };
        if schedule {
            let inner = Arc::clone(self);
            self.executor.schedule(CHECKPOINT_SAVE_DELAY, move || {
                inner.save_last_sequence();
            });
        }
    }

    pub(crate) fn save_last_sequence(self: &Arc<Self>) {
        let (checkpoint_id, body, seq) = {
            let mut state = self.state.lock();
            if !state.last_sequence_changed {
                return;
            }
            let Some(seq) = state.last_sequence.clone() else {
                return;
            };
            let Some(body) = state.checkpoint.begin_save(&seq) else {
                // A save is in flight; it will re-save when it completes.
                return;
            };
            state.last_sequence_changed = false;
            (state.checkpoint.doc_id().to_string(), body, seq)
        };
        if checkpoint_id.is_empty() {
            return;
        }
        debug!(%seq, "saving remote checkpoint");

        let inner = Arc::clone(self);
        let saved_body = body.clone();
        let path = format!("/_local/{checkpoint_id}");
        self.send_request(Method::Put, &path, Some(Value::Object(body)), move |result| {
            let resave = match result {
                Ok(value) => {
                    let rev = value.get("rev").and_then(Value::as_str);
                    let overdue = {
                        let mut state = inner.state.lock();
                        state.checkpoint.on_saved(saved_body, rev)
                    };
                    // The store may have closed while the PUT was in
                    // flight; the closing path already mirrored for us.
                    if inner.store.is_open() {
                        if let Err(e) =
                            inner
                                .store
                                .set_last_sequence(&seq, &checkpoint_id, inner.push)
                        {
                            warn!(error = %e, "failed to mirror checkpoint locally");
                        }
                    }
                    overdue
                }
                Err(e) if e.is_not_found() => {
                    // The checkpoint doc was deleted out from under us.
                    debug!("remote checkpoint vanished, will recreate");
                    inner.state.lock().checkpoint.on_save_not_found();
                    true
                }
                Err(e) if e.is_conflict() => {
                    debug!("checkpoint conflict, refreshing _rev");
                    inner.state.lock().checkpoint.on_save_conflict();
                    inner.refresh_remote_checkpoint();
                    false
                }
                Err(e) => {
                    warn!(error = %e, "unable to save remote checkpoint");
                    inner.state.lock().checkpoint.on_save_failed()
                }
            };
            if resave {
                inner.state.lock().last_sequence_changed = true;
                inner.save_last_sequence();
            }
        });
    }

    /// Re-reads the checkpoint document to pick up its current `_rev` after
    /// a conflicting save, then saves again.
    fn refresh_remote_checkpoint(self: &Arc<Self>) {
        let checkpoint_id = { self.state.lock().checkpoint.doc_id().to_string() };
        self.async_task_started();
        let inner = Arc::clone(self);
        let path = format!("/_local/{checkpoint_id}");
        self.send_request(Method::Get, &path, None, move |result| {
            match result {
                Err(e) if !e.is_not_found() => {
                    warn!(error = %e, "error refreshing remote checkpoint");
                    inner.state.lock().checkpoint.on_refreshed(None);
                }
                Err(_) => {
                    inner.state.lock().checkpoint.on_refreshed(None);
                    inner.state.lock().last_sequence_changed = true;
                    inner.save_last_sequence();
                }
                Ok(value) => {
                    debug!("refreshed remote checkpoint");
                    {
                        let mut state = inner.state.lock();
                        state.checkpoint.on_refreshed(value.as_object().cloned());
                        state.last_sequence_changed = true;
                    }
                    inner.save_last_sequence();
                }
            }
            inner.async_task_finished(1);
        });
    }

    pub(crate) fn schedule_retry(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let handle = self.executor.schedule(RETRY_DELAY, move || {
            inner.retry_if_ready();
        });
        self.state.lock().retry_handle = Some(handle);
    }

    pub(crate) fn cancel_retry(self: &Arc<Self>) {
        if let Some(handle) = self.state.lock().retry_handle.take() {
            handle.cancel();
        }
    }

    fn retry_if_ready(self: &Arc<Self>) {
        let (running, online) = {
            let state = self.state.lock();
            (state.running, state.online)
        };
        if !running {
            return;
        }
        if online {
            info!("retrying to transfer missed revisions");
            {
                let mut state = self.state.lock();
                state.revisions_failed = 0;
                state.last_error = None;
            }
            self.cancel_retry();
            self.ops.clone().retry(self);
        } else {
            self.schedule_retry();
        }
    }

    fn stop_remote_requests(self: &Arc<Self>) {
        let requests = self.requests.lock();
        debug!(count = requests.len(), "cancelling in-flight requests");
        for cancel in requests.values() {
            cancel.cancel();
        }
    }

    pub(crate) fn notify(self: &Arc<Self>) {
        let event = {
            let mut state = self.state.lock();
            state.status = status_of(&state);
            ReplicationEvent {
                status: state.status,
                changes_count: state.changes_count,
                completed_changes_count: state.completed_changes_count,
                last_error: state.last_error.clone(),
            }
        };
        self.status_changed.notify_all();
        for listener in self.listeners.lock().iter() {
            listener(&event);
        }
    }

    /// Resolves a path against the remote URL. Paths starting with `/` are
    /// database-relative; bare paths are server-root-relative (the CouchDB
    /// `/_session` fallback); an empty path is the database itself.
    pub(crate) fn build_url(&self, relative: &str) -> ReplicationResult<Url> {
        if relative.is_empty() {
            return Ok(self.remote.clone());
        }
        let url_str = if let Some(rooted) = relative.strip_prefix('/') {
            let mut base = self.remote.to_string();
            while base.ends_with('/') {
                base.pop();
            }
            format!("{base}/{rooted}")
        } else {
            let origin = self.remote.origin().ascii_serialization();
            format!("{origin}/{relative}")
        };
        Url::parse(&url_str).map_err(|e| ReplicationError::Protocol(e.to_string()))
    }

    fn base_headers(&self, request: HttpRequest) -> HttpRequest {
        let mut request = request;
        for (name, value) in self.state.lock().headers.iter() {
            request.headers.push((name.clone(), value.clone()));
        }
        if let Some(cookie) = self.cookies.header_value() {
            request.headers.push(("Cookie".into(), cookie));
        }
        request
    }

    fn note_response(self: &Arc<Self>, response: &HttpResponse) {
        for (name, value) in &response.headers {
            if name.eq_ignore_ascii_case("set-cookie") {
                self.cookies.store_from_header(value);
            }
        }
        if let Some(server) = response.header("Server") {
            let server = server.to_string();
            let inner = Arc::clone(self);
            self.executor.submit(move || {
                let mut state = inner.state.lock();
                if state.server_type.is_none() {
                    debug!(server = %server, "remote server identified");
                    state.server_type = Some(server);
                }
            });
        }
    }

    fn track_request(self: &Arc<Self>) -> (u64, CancelToken) {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let token = CancelToken::new();
        self.requests.lock().insert(id, token.clone());
        (id, token)
    }

    /// Issues a JSON request on the pool; the completion runs on the work
    /// executor with the parsed body.
    pub(crate) fn send_request(
        self: &Arc<Self>,
        method: Method,
        relative: &str,
        body: Option<Value>,
        completion: impl FnOnce(ReplicationResult<Value>) + Send + 'static,
    ) {
        let url = match self.build_url(relative) {
            Ok(url) => url,
            Err(e) => {
                self.executor.submit(move || completion(Err(e)));
                return;
            }
        };
        let (id, token) = self.track_request();
        let mut request = HttpRequest::new(method, url).with_header("Accept", "application/json");
        request.cancel = token;
        if let Some(body) = &body {
            request.headers
                .push(("Content-Type".into(), "application/json".into()));
            match serde_json::to_vec(body) {
                Ok(bytes) => request.body = Some(bytes),
                Err(e) => {
                    self.executor.submit(move || completion(Err(e.into())));
                    return;
                }
            }
        }
        let request = self.base_headers(request);

        let inner = Arc::clone(self);
        let completion = Arc::new(Mutex::new(Some(completion)));
        let completion_for_job = Arc::clone(&completion);
        let accepted = self.pool.lock().execute(move || {
            let result = inner.perform_json_request(request);
            inner.requests.lock().remove(&id);
            if let Some(completion) = completion_for_job.lock().take() {
                inner.executor.submit(move || completion(result));
            }
        });
        if !accepted {
            self.requests.lock().remove(&id);
            if let Some(completion) = completion.lock().take() {
                self.executor
                    .submit(move || completion(Err(ReplicationError::Cancelled)));
            }
        }
    }

    fn perform_json_request(self: &Arc<Self>, request: HttpRequest) -> ReplicationResult<Value> {
        if request.cancel.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }
        let masked = mask_credentials(&request.url);
        trace!(method = request.method.as_str(), url = %masked, "remote request");
        let response = self.http.execute(request)?;
        self.note_response(&response);
        if !response.is_success() {
            return Err(ReplicationError::Status {
                status: response.status,
                url: masked,
            });
        }
        let bytes = response.read_body()?;
        if bytes.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(serde_json::from_slice(&bytes)?)
        }
    }

    /// Downloads a document that may arrive as `multipart/related`,
    /// streaming attachment parts into the blob store.
    pub(crate) fn send_multipart_download(
        self: &Arc<Self>,
        relative: &str,
        completion: impl FnOnce(ReplicationResult<Body>) + Send + 'static,
    ) {
        let url = match self.build_url(relative) {
            Ok(url) => url,
            Err(e) => {
                self.executor.submit(move || completion(Err(e)));
                return;
            }
        };
        let (id, token) = self.track_request();
        let mut request = HttpRequest::new(Method::Get, url)
            .with_header("Accept", "multipart/related, application/json");
        request.cancel = token;
        let request = self.base_headers(request);

        let inner = Arc::clone(self);
        let completion = Arc::new(Mutex::new(Some(completion)));
        let completion_for_job = Arc::clone(&completion);
        let accepted = self.pool.lock().execute(move || {
            let result = inner.perform_multipart_download(request);
            inner.requests.lock().remove(&id);
            if let Some(completion) = completion_for_job.lock().take() {
                inner.executor.submit(move || completion(result));
            }
        });
        if !accepted {
            self.requests.lock().remove(&id);
            if let Some(completion) = completion.lock().take() {
                self.executor
                    .submit(move || completion(Err(ReplicationError::Cancelled)));
            }
        }
    }

    fn perform_multipart_download(
        self: &Arc<Self>,
        request: HttpRequest,
    ) -> ReplicationResult<Body> {
        if request.cancel.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }
        let masked = mask_credentials(&request.url);
        trace!(url = %masked, "multipart download");
        let cancel = request.cancel.clone();
        let mut response = self.http.execute(request)?;
        self.note_response(&response);
        if !response.is_success() {
            return Err(ReplicationError::Status {
                status: response.status,
                url: masked,
            });
        }
        let content_type = response
            .header("Content-Type")
            .unwrap_or("application/json")
            .to_string();
        if content_type.starts_with("multipart/related") {
            let mut reader =
                MultipartDocReader::new(&content_type, Arc::clone(&self.blobs))?;
            let mut buf = [0u8; 8 * 1024];
            loop {
                if cancel.is_cancelled() {
                    return Err(ReplicationError::Cancelled);
                }
                let n = response.body.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                reader.append(&buf[..n])?;
            }
            reader.finish()
        } else {
            let bytes = {
                let mut out = Vec::new();
                response.body.read_to_end(&mut out)?;
                out
            };
            let value: Value = serde_json::from_slice(&bytes)?;
            value
                .as_object()
                .cloned()
                .ok_or_else(|| ReplicationError::Protocol("document is not an object".into()))
        }
    }

    /// Uploads a `multipart/related` body (push with attachments).
    pub(crate) fn send_multipart_upload(
        self: &Arc<Self>,
        method: Method,
        relative: &str,
        writer: MultipartWriter,
        completion: impl FnOnce(ReplicationResult<Value>) + Send + 'static,
    ) {
        let url = match self.build_url(relative) {
            Ok(url) => url,
            Err(e) => {
                self.executor.submit(move || completion(Err(e)));
                return;
            }
        };
        let (id, token) = self.track_request();
        let content_type = writer.content_type();
        let mut request = HttpRequest::new(method, url)
            .with_header("Accept", "application/json")
            .with_header("Content-Type", content_type)
            .with_body(writer.finish());
        request.cancel = token;
        let request = self.base_headers(request);

        let inner = Arc::clone(self);
        let completion = Arc::new(Mutex::new(Some(completion)));
        let completion_for_job = Arc::clone(&completion);
        let accepted = self.pool.lock().execute(move || {
            let result = inner.perform_json_request(request);
            inner.requests.lock().remove(&id);
            if let Some(completion) = completion_for_job.lock().take() {
                inner.executor.submit(move || completion(result));
            }
        });
        if !accepted {
            self.requests.lock().remove(&id);
            if let Some(completion) = completion.lock().take() {
                self.executor
                    .submit(move || completion(Err(ReplicationError::Cancelled)));
            }
        }
    }
}

/// Percent-encodes a document id for use as a URL path segment.
pub(crate) fn encode_doc_id(doc_id: &str) -> String {
    let mut out = String::with_capacity(doc_id.len());
    for byte in doc_id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
