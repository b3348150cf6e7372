//! Consumer of a remote `_changes` feed.

use crate::backoff::Backoff;
use crate::error::{ReplicationError, ReplicationResult};
use crate::stream::ResultsScanner;
use crate::transport::{mask_credentials, CancelToken, HttpClient, HttpRequest, Method};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};
use url::Url;

const HEARTBEAT_MS: u64 = 300_000;
const LONGPOLL_LIMIT: u32 = 50;
const READ_CHUNK: usize = 8 * 1024;

/// How the feed connection is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// One request returning everything since `since`, then stop.
    OneShot,
    /// The server holds each response open until changes arrive; the feed
    /// reopens the connection after every response.
    LongPoll,
    /// Never implemented reliably by the protocol peers; refused at start.
    Continuous,
}

impl FeedMode {
    fn feed_param(self) -> &'static str {
        match self {
            FeedMode::OneShot => "normal",
            FeedMode::LongPoll => "longpoll",
            FeedMode::Continuous => "continuous",
        }
    }
}

/// One record from the changes feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// The remote sequence of this change; opaque, monotone per connection.
    pub seq: Value,
    /// The changed document.
    pub doc_id: String,
    /// Candidate revision ids (more than one with `style=all_docs`).
    pub revs: Vec<String>,
    /// Whether the change is a deletion.
    pub deleted: bool,
}

impl ChangeEntry {
    /// Parses a feed record. Returns `None` for records without a sequence
    /// or document id, which the protocol treats as unparseable.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        let seq = value.get("seq")?.clone();
        if seq.is_null() {
            return None;
        }
        let doc_id = value.get("id")?.as_str()?.to_string();
        let revs = value
            .get("changes")
            .and_then(Value::as_array)
            .map(|changes| {
                changes
                    .iter()
                    .filter_map(|c| c.get("rev").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let deleted = value
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Some(Self {
            seq,
            doc_id,
            revs,
            deleted,
        })
    }

    /// The sequence as a string, the form checkpoints use.
    #[must_use]
    pub fn seq_string(&self) -> String {
        match &self.seq {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Receives feed callbacks on the feed's worker thread.
pub trait ChangeFeedClient: Send + Sync {
    /// A change record was parsed. The feed's `last_sequence` advances only
    /// after this returns.
    fn change_feed_received_change(&self, change: ChangeEntry);

    /// The feed stopped, with the error that ended it if any. Delivered
    /// exactly once.
    fn change_feed_stopped(&self, error: Option<ReplicationError>);
}

struct FeedShared {
    database_url: Url,
    mode: FeedMode,
    include_conflicts: bool,
    http: Arc<dyn HttpClient>,
    client: Mutex<Option<Arc<dyn ChangeFeedClient>>>,
    last_sequence: Mutex<Option<Value>>,
    filter_name: Mutex<Option<String>>,
    filter_params: Mutex<Map<String, Value>>,
    doc_ids: Mutex<Vec<String>>,
    request_headers: Mutex<Vec<(String, String)>>,
    running: AtomicBool,
    stop_notified: AtomicBool,
    thread_started: AtomicBool,
    error: Mutex<Option<ReplicationError>>,
    current_cancel: Mutex<Option<CancelToken>>,
}

/// Reads a remote database's `_changes` feed and hands each record to its
/// client.
///
/// State machine: idle → requesting → streaming → (idle | error | stopped).
/// A non-2xx status records the error and stops; transport errors retry
/// under exponential backoff; an IO error while `stop()` is tearing the
/// connection down is swallowed.
pub struct ChangeFeed {
    shared: Arc<FeedShared>,
}

impl ChangeFeed {
    /// Creates a feed over `database_url` starting after `since`.
    #[must_use]
    pub fn new(
        database_url: Url,
        mode: FeedMode,
        include_conflicts: bool,
        since: Option<Value>,
        http: Arc<dyn HttpClient>,
        client: Arc<dyn ChangeFeedClient>,
    ) -> Self {
        Self {
            shared: Arc::new(FeedShared {
                database_url,
                mode,
                include_conflicts,
                http,
                client: Mutex::new(Some(client)),
                last_sequence: Mutex::new(since),
                filter_name: Mutex::new(None),
                filter_params: Mutex::new(Map::new()),
                doc_ids: Mutex::new(Vec::new()),
                request_headers: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                stop_notified: AtomicBool::new(false),
                thread_started: AtomicBool::new(false),
                error: Mutex::new(None),
                current_cancel: Mutex::new(None),
            }),
        }
    }

    /// Sets the server-side filter function name.
    pub fn set_filter(&self, name: Option<String>) {
        *self.shared.filter_name.lock() = name;
    }

    /// Sets the filter parameters.
    pub fn set_filter_params(&self, params: Map<String, Value>) {
        *self.shared.filter_params.lock() = params;
    }

    /// Restricts the feed to these documents. A non-empty list installs the
    /// `_doc_ids` filter; an empty list leaves the feed unfiltered.
    pub fn set_doc_ids(&self, doc_ids: Vec<String>) {
        *self.shared.doc_ids.lock() = doc_ids;
    }

    /// Extra headers for every feed request.
    pub fn set_request_headers(&self, headers: Vec<(String, String)>) {
        *self.shared.request_headers.lock() = headers;
    }

    /// Whether the worker loop is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The last accepted sequence.
    #[must_use]
    pub fn last_sequence(&self) -> Option<Value> {
        self.shared.last_sequence.lock().clone()
    }

    /// The request path and query for the next connection.
    #[must_use]
    pub fn changes_feed_path(&self) -> String {
        self.shared.changes_feed_path()
    }

    /// The absolute URL for the next connection.
    pub fn changes_feed_url(&self) -> ReplicationResult<Url> {
        self.shared.changes_feed_url()
    }

    /// Starts the worker thread. Refuses continuous mode and double starts.
    pub fn start(&self) -> ReplicationResult<()> {
        if self.shared.mode == FeedMode::Continuous {
            return Err(ReplicationError::UnsupportedFeedMode("continuous"));
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.thread_started.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let masked = mask_credentials(&shared.database_url);
        std::thread::Builder::new()
            .name(format!("loam-changes-{masked}"))
            .spawn(move || {
                run_loop(&shared);
                notify_stopped(&shared);
            })
            .map_err(|e| ReplicationError::transport_fatal(e.to_string()))?;
        Ok(())
    }

    /// Aborts the current request and stops the worker.
    pub fn stop(&self) {
        debug!("change feed asked to stop");
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.shared.current_cancel.lock().take() {
            cancel.cancel();
        }
        if !self.shared.thread_started.load(Ordering::SeqCst) {
            notify_stopped(&self.shared);
        }
    }
}

impl FeedShared {
    fn changes_feed_path(&self) -> String {
        let mut path = format!("_changes?feed={}", self.mode.feed_param());
        if self.mode == FeedMode::LongPoll {
            path.push_str(&format!("&limit={LONGPOLL_LIMIT}"));
        }
        path.push_str(&format!("&heartbeat={HEARTBEAT_MS}"));
        if self.include_conflicts {
            path.push_str("&style=all_docs");
        }
        if let Some(since) = self.last_sequence.lock().clone() {
            let since = match since {
                Value::String(s) => s,
                other => other.to_string(),
            };
            path.push_str(&format!("&since={}", encode(&since)));
        }

        let mut filter_name = self.filter_name.lock().clone();
        let mut filter_params = self.filter_params.lock().clone();
        let doc_ids = self.doc_ids.lock().clone();
        if !doc_ids.is_empty() {
            filter_name = Some("_doc_ids".to_string());
            filter_params = Map::new();
            filter_params.insert("doc_ids".into(), Value::from(doc_ids));
        }

        if let Some(name) = filter_name {
            path.push_str(&format!("&filter={}", encode(&name)));
            for (key, value) in &filter_params {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                path.push_str(&format!("&{}={}", encode(key), encode(&value)));
            }
        }
        path
    }

    fn changes_feed_url(&self) -> ReplicationResult<Url> {
        let mut base = self.database_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        base.push_str(&self.changes_feed_path());
        Url::parse(&base).map_err(|e| ReplicationError::Protocol(e.to_string()))
    }

    fn received_change(&self, value: &Value) -> bool {
        let Some(change) = ChangeEntry::from_json(value) else {
            return false;
        };
        let seq = change.seq.clone();
        if let Some(client) = self.client.lock().clone() {
            client.change_feed_received_change(change);
        }
        // Advanced only after the client accepted the record.
        *self.last_sequence.lock() = Some(seq);
        true
    }

    fn received_poll_response(&self, body: &Value) -> bool {
        let Some(results) = body.get("results").and_then(Value::as_array) else {
            return false;
        };
        results.iter().all(|change| self.received_change(change))
    }
}

fn notify_stopped(shared: &Arc<FeedShared>) {
    if shared.stop_notified.swap(true, Ordering::SeqCst) {
        return;
    }
    debug!("change feed stopped");
    let client = shared.client.lock().take();
    if let Some(client) = client {
        client.change_feed_stopped(shared.error.lock().take());
    }
}

/// Sleeps in small slices so `stop()` stays responsive.
fn interruptible_sleep(shared: &FeedShared, total: Duration) {
    let mut remaining = total;
    while remaining > Duration::ZERO && shared.running.load(Ordering::SeqCst) {
        let slice = remaining.min(Duration::from_millis(100));
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

fn run_loop(shared: &Arc<FeedShared>) {
    let mut backoff = Backoff::new();

    while shared.running.load(Ordering::SeqCst) {
        let url = match shared.changes_feed_url() {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "cannot build changes feed URL");
                *shared.error.lock() = Some(e);
                break;
            }
        };
        trace!(url = %mask_credentials(&url), "requesting changes feed");

        let cancel = CancelToken::new();
        *shared.current_cancel.lock() = Some(cancel.clone());
        let mut request = HttpRequest::new(Method::Get, url);
        request.cancel = cancel;
        for (name, value) in shared.request_headers.lock().iter() {
            request.headers.push((name.clone(), value.clone()));
        }

        let response = match shared.http.execute(request) {
            Ok(response) => response,
            Err(e) => {
                if !shared.running.load(Ordering::SeqCst) {
                    // Teardown closed the socket underneath the read.
                    break;
                }
                warn!(error = %e, "changes feed request failed");
                interruptible_sleep(shared, backoff.next_delay());
                continue;
            }
        };

        if response.status >= 300 {
            error!(status = response.status, "changes feed got error status");
            *shared.error.lock() = Some(ReplicationError::Status {
                status: response.status,
                url: mask_credentials(&shared.database_url),
            });
            shared.running.store(false, Ordering::SeqCst);
            break;
        }

        match shared.mode {
            FeedMode::LongPoll => {
                let body = match read_json(response) {
                    Ok(body) => body,
                    Err(e) => {
                        if !shared.running.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(error = %e, "error reading long-poll response");
                        interruptible_sleep(shared, backoff.next_delay());
                        continue;
                    }
                };
                if shared.received_poll_response(&body) {
                    trace!("starting new longpoll");
                    backoff.reset();
                } else {
                    warn!("unparseable long-poll response, stopping feed");
                    shared.running.store(false, Ordering::SeqCst);
                }
            }
            FeedMode::OneShot => {
                match stream_results(shared, response) {
                    Ok(()) => {
                        backoff.reset();
                        shared.running.store(false, Ordering::SeqCst);
                    }
                    Err(e) => {
                        if !shared.running.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(error = %e, "error streaming changes");
                        interruptible_sleep(shared, backoff.next_delay());
                    }
                }
            }
            FeedMode::Continuous => unreachable!("refused at start"),
        }
    }
    trace!("change feed run loop exiting");
}

fn encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn read_json(mut response: crate::transport::HttpResponse) -> ReplicationResult<Value> {
    let mut body = Vec::new();
    response.body.read_to_end(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Streams a normal-mode response, emitting each record as it completes.
fn stream_results(
    shared: &Arc<FeedShared>,
    mut response: crate::transport::HttpResponse,
) -> ReplicationResult<()> {
    let mut scanner = ResultsScanner::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = response.body.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for record in scanner.feed(&buf[..n])? {
            let value: Value = serde_json::from_slice(&record)?;
            if !shared.received_change(&value) {
                warn!(record = %String::from_utf8_lossy(&record), "unparseable change record");
            }
        }
        if scanner.is_done() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpResponse, MockHttpClient};
    use serde_json::json;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingClient {
        changes: Mutex<Vec<ChangeEntry>>,
        stopped: AtomicBool,
        stop_error: Mutex<Option<ReplicationError>>,
    }

    impl ChangeFeedClient for RecordingClient {
        fn change_feed_received_change(&self, change: ChangeEntry) {
            self.changes.lock().push(change);
        }
        fn change_feed_stopped(&self, error: Option<ReplicationError>) {
            *self.stop_error.lock() = error;
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn wait_until(pred: impl Fn() -> bool) {
        let start = Instant::now();
        while !pred() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn feed_with(
        mode: FeedMode,
        since: Option<Value>,
        http: Arc<MockHttpClient>,
    ) -> (ChangeFeed, Arc<RecordingClient>) {
        let client = Arc::new(RecordingClient::default());
        let feed = ChangeFeed::new(
            Url::parse("http://remote.example/db").unwrap(),
            mode,
            false,
            since,
            http,
            Arc::clone(&client) as Arc<dyn ChangeFeedClient>,
        );
        (feed, client)
    }

    #[test]
    fn path_for_one_shot() {
        let (feed, _) = feed_with(FeedMode::OneShot, None, Arc::new(MockHttpClient::new()));
        assert_eq!(
            feed.changes_feed_path(),
            "_changes?feed=normal&heartbeat=300000"
        );
    }

    #[test]
    fn path_for_long_poll_with_since() {
        let (feed, _) = feed_with(
            FeedMode::LongPoll,
            Some(json!("12:abc")),
            Arc::new(MockHttpClient::new()),
        );
        assert_eq!(
            feed.changes_feed_path(),
            "_changes?feed=longpoll&limit=50&heartbeat=300000&since=12%3Aabc"
        );
    }

    #[test]
    fn filter_params_are_encoded() {
        let (feed, _) = feed_with(FeedMode::OneShot, None, Arc::new(MockHttpClient::new()));
        feed.set_filter(Some("app/by channel".into()));
        let mut params = Map::new();
        params.insert("channels".into(), json!("a,b"));
        params.insert("count".into(), json!(3));
        feed.set_filter_params(params);
        let path = feed.changes_feed_path();
        assert!(path.contains("&filter=app%2Fby+channel"));
        assert!(path.contains("&channels=a%2Cb"));
        // Non-string values are JSON-encoded before URL-encoding.
        assert!(path.contains("&count=3"));
    }

    #[test]
    fn doc_ids_install_the_doc_ids_filter() {
        let (feed, _) = feed_with(FeedMode::OneShot, None, Arc::new(MockHttpClient::new()));
        feed.set_doc_ids(vec!["a".into(), "b".into()]);
        let path = feed.changes_feed_path();
        assert!(path.contains("&filter=_doc_ids"));
        assert!(path.contains("doc_ids=%5B%22a%22%2C%22b%22%5D"));
    }

    #[test]
    fn empty_doc_ids_skip_the_filter() {
        let (feed, _) = feed_with(FeedMode::OneShot, None, Arc::new(MockHttpClient::new()));
        feed.set_doc_ids(Vec::new());
        assert!(!feed.changes_feed_path().contains("filter"));
    }

    #[test]
    fn continuous_mode_is_refused() {
        let (feed, _) = feed_with(FeedMode::Continuous, None, Arc::new(MockHttpClient::new()));
        assert!(matches!(
            feed.start(),
            Err(ReplicationError::UnsupportedFeedMode("continuous"))
        ));
    }

    #[test]
    fn one_shot_emits_records_and_stops() {
        let http = Arc::new(MockHttpClient::new());
        let body = br#"{"results":[
            {"seq":1,"id":"a","changes":[{"rev":"1-x"}]},
            {"seq":2,"id":"b","changes":[{"rev":"1-y"}]}
        ],"last_seq":2}"#;
        http.push_response(HttpResponse::new(200, Vec::new(), body.to_vec()));

        let (feed, client) = feed_with(FeedMode::OneShot, None, http);
        feed.start().unwrap();
        wait_until(|| client.stopped.load(Ordering::SeqCst));

        let changes = client.changes.lock();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].doc_id, "a");
        assert_eq!(changes[0].revs, vec!["1-x".to_string()]);
        assert_eq!(feed.last_sequence(), Some(json!(2)));
        assert!(client.stop_error.lock().is_none());
    }

    #[test]
    fn error_status_stops_with_error() {
        let http = Arc::new(MockHttpClient::new());
        http.push_response(HttpResponse::new(403, Vec::new(), Vec::new()));

        let (feed, client) = feed_with(FeedMode::OneShot, None, http);
        feed.start().unwrap();
        wait_until(|| client.stopped.load(Ordering::SeqCst));

        assert!(client.changes.lock().is_empty());
        let error = client.stop_error.lock().take().unwrap();
        assert_eq!(error.status(), Some(403));
    }

    #[test]
    fn stop_before_start_still_notifies() {
        let (feed, client) = feed_with(FeedMode::OneShot, None, Arc::new(MockHttpClient::new()));
        feed.stop();
        assert!(client.stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn change_entry_requires_seq_and_id() {
        assert!(ChangeEntry::from_json(&json!({"id": "a"})).is_none());
        assert!(ChangeEntry::from_json(&json!({"seq": 1})).is_none());
        let entry = ChangeEntry::from_json(&json!({
            "seq": "7-x", "id": "d", "changes": [{"rev": "2-a"}, {"rev": "2-b"}]
        }))
        .unwrap();
        assert_eq!(entry.seq_string(), "7-x");
        assert_eq!(entry.revs.len(), 2);
    }
}
