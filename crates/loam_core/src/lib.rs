//! Core of an embeddable, schemaless JSON document database.
//!
//! Documents are multi-versioned: each write creates an immutable revision
//! identified by `N-hash`, and a strictly increasing per-database sequence
//! orders all writes. Storage is consumed through the narrow [`LocalStore`]
//! trait; [`MemoryStore`] is the in-memory reference implementation.
//! Secondary indexes are materialised by user-defined map/reduce functions
//! (see [`View`]) and updated incrementally from the sequence counter.

mod attachment;
mod collation;
mod error;
mod executor;
mod manager;
mod memory;
mod query;
mod revision;
mod store;
mod view;

pub use attachment::{AttachmentEncoding, AttachmentRef};
pub use collation::{collate, Collation};
pub use error::{CoreError, CoreResult};
pub use executor::{ScheduledTask, WorkExecutor};
pub use manager::Manager;
pub use memory::MemoryStore;
pub use query::{group_key, group_together, total_values, QueryOptions, QueryRow};
pub use revision::{Body, RevId, Revision};
pub use store::{ChangesOptions, LocalStore};
pub use view::{Emitter, MapFn, ReduceFn, View, ViewRow};
