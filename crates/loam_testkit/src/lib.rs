//! Test fixtures for the replication engine.
//!
//! [`FakeRemote`] is an in-memory peer speaking the `_changes` /
//! `_revs_diff` / `_bulk_docs` / `_local` surface directly through the
//! [`HttpClient`](loam_replicator::HttpClient) trait, so end-to-end
//! replication scenarios run in-process with no sockets.

mod fixtures;
mod remote;

pub use fixtures::{wait_until, ReplicationHarness};
pub use remote::FakeRemote;
