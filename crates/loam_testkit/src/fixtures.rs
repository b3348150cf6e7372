//! Harness wiring a local store, a blob store and a fake remote together.

use crate::remote::FakeRemote;
use loam_blob::BlobStore;
use loam_core::{LocalStore, MemoryStore, WorkExecutor};
use loam_replicator::{HttpClient, Replicator, ReplicatorConfig, TokenRegistry};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Everything a replication end-to-end test needs.
pub struct ReplicationHarness {
    /// The local document store.
    pub store: Arc<MemoryStore>,
    /// The local attachment store.
    pub blobs: Arc<BlobStore>,
    /// The fake remote peer.
    pub remote: Arc<FakeRemote>,
    /// The shared work executor.
    pub executor: WorkExecutor,
    session_counter: Arc<AtomicU32>,
    registry: Arc<TokenRegistry>,
    _dir: TempDir,
}

impl ReplicationHarness {
    /// A fresh harness with an empty local store and an empty remote.
    /// Installs a test tracing subscriber on first use.
    #[must_use]
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = tempfile::tempdir().expect("harness temp dir");
        let blobs =
            BlobStore::open(&dir.path().join("attachments")).expect("harness blob store");
        Self {
            store: Arc::new(MemoryStore::new()),
            blobs: Arc::new(blobs),
            remote: FakeRemote::new(),
            executor: WorkExecutor::new("harness"),
            session_counter: Arc::new(AtomicU32::new(0)),
            registry: Arc::new(TokenRegistry::new()),
            _dir: dir,
        }
    }

    /// The token/assertion registry shared by this harness's replications.
    #[must_use]
    pub fn registry(&self) -> Arc<TokenRegistry> {
        Arc::clone(&self.registry)
    }

    /// Builds a replicator for an arbitrary configuration.
    #[must_use]
    pub fn replicator(&self, config: ReplicatorConfig) -> Replicator {
        Replicator::new(
            Arc::clone(&self.store) as Arc<dyn LocalStore>,
            Arc::clone(&self.blobs),
            Arc::clone(&self.remote) as Arc<dyn HttpClient>,
            self.executor.clone(),
            Arc::clone(&self.session_counter),
            Arc::clone(&self.registry),
            config,
        )
    }

    /// A one-shot pull from the fake remote.
    #[must_use]
    pub fn puller(&self) -> Replicator {
        self.replicator(ReplicatorConfig::pull(self.remote.url()))
    }

    /// A one-shot push to the fake remote.
    #[must_use]
    pub fn pusher(&self) -> Replicator {
        self.replicator(ReplicatorConfig::push(self.remote.url()))
    }

    /// The checkpoint document id a replication of this store against this
    /// remote would use.
    #[must_use]
    pub fn checkpoint_id(&self, push: bool) -> String {
        loam_replicator::checkpoint_doc_id(
            &self.store.private_uuid(),
            self.remote.url().as_str(),
            push,
        )
    }
}

impl Default for ReplicationHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `pred` until it holds or `timeout` elapses. Returns whether the
/// condition was met.
pub fn wait_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}
