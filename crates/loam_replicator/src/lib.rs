//! Bidirectional replication against a CouchDB-compatible remote.
//!
//! The engine is a long-running state machine coordinating asynchronous
//! HTTP work:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            Replicator                                │
//! │                                                                      │
//! │  ┌────────────┐    ┌─────────────┐    ┌────────────────────────────┐ │
//! │  │ ChangeFeed │───►│ Batcher     │───►│ process_inbox              │ │
//! │  │ (_changes) │    │ (inbox)     │    │  pull: fetch + store       │ │
//! │  └────────────┘    └─────────────┘    │  push: _revs_diff + upload │ │
//! │        │                              └────────────────────────────┘ │
//! │        ▼                                            │                │
//! │  ┌────────────┐                        ┌────────────▼─────────────┐  │
//! │  │ Backoff    │                        │ Checkpoint (_local/<id>) │  │
//! │  └────────────┘                        └──────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All state transitions run on a single-threaded work executor; HTTP
//! requests run on a small request pool and post their completions back.
//! Progress is checkpointed to a `_local/<id>` document on the remote and
//! mirrored into the local store, so replications resume where they left
//! off.

pub mod auth;
pub mod backoff;
pub mod batcher;
pub mod checkpoint;
pub mod error;
pub mod feed;
pub mod multipart;
pub mod pool;
pub mod replicator;
pub mod stream;
pub mod tracker;
pub mod transport;

mod puller;
mod pusher;

pub use auth::{Authorizer, FacebookAuthorizer, PersonaAuthorizer, TokenRegistry};
pub use backoff::Backoff;
pub use batcher::Batcher;
pub use checkpoint::{checkpoint_doc_id, Checkpoint};
pub use error::{ReplicationError, ReplicationResult};
pub use feed::{ChangeEntry, ChangeFeed, ChangeFeedClient, FeedMode};
pub use multipart::{MultipartDocReader, MultipartWriter};
pub use pool::RequestPool;
pub use replicator::{ReplicationEvent, ReplicationStatus, Replicator, ReplicatorConfig};
pub use transport::{
    CancelToken, CookieJar, HttpClient, HttpClientFactory, HttpRequest, HttpResponse, Method,
};
