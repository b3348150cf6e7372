//! The storage interface the engine is written against.

use crate::error::CoreResult;
use crate::revision::{RevId, Revision};

/// Options for [`LocalStore::changes_since`].
#[derive(Debug, Clone)]
pub struct ChangesOptions {
    /// Maximum number of revisions to return.
    pub limit: usize,
    /// Include document bodies in the returned revisions.
    pub include_docs: bool,
    /// Include non-winning current revisions (conflicts).
    pub include_conflicts: bool,
}

impl Default for ChangesOptions {
    fn default() -> Self {
        Self {
            limit: usize::MAX,
            include_docs: true,
            include_conflicts: false,
        }
    }
}

/// The narrow storage interface the replication engine and the view indexer
/// consume.
///
/// The on-disk schema behind this trait is not the engine's business: it sees
/// sequences, revision trees and checkpoint bookkeeping, nothing else.
/// Implementations must be thread-safe; the engine calls in from its work
/// executor and from feed threads.
pub trait LocalStore: Send + Sync {
    /// Whether the store is open. Replications refuse to start against a
    /// closed store.
    fn is_open(&self) -> bool;

    /// A stable, private UUID for this database instance. Feeds the
    /// checkpoint id so it is unguessable from the outside.
    fn private_uuid(&self) -> String;

    /// The highest sequence number ever assigned.
    fn last_sequence_number(&self) -> u64;

    /// The locally cached replication sequence for a checkpoint id.
    fn last_sequence_for(&self, checkpoint_id: &str) -> CoreResult<Option<String>>;

    /// Persists the replication sequence for a checkpoint id.
    fn set_last_sequence(&self, seq: &str, checkpoint_id: &str, push: bool) -> CoreResult<()>;

    /// Whether this exact revision exists locally with its content.
    fn contains_revision(&self, doc_id: &str, rev_id: &RevId) -> bool;

    /// Filters `candidates` down to the revisions missing locally.
    fn find_missing_revisions(
        &self,
        candidates: &[(String, RevId)],
    ) -> CoreResult<Vec<(String, RevId)>>;

    /// Inserts a revision pulled from elsewhere, together with its history
    /// (newest first, starting with the revision's own id). Ancestors that
    /// are not present locally are recorded as stubs.
    fn force_insert(&self, rev: Revision, history: &[RevId]) -> CoreResult<u64>;

    /// Current winning revisions with `sequence > seq`, ordered by sequence.
    fn changes_since(&self, seq: u64, options: &ChangesOptions) -> CoreResult<Vec<Revision>>;

    /// The winning revision of a document, or `None` if the document does
    /// not exist or is deleted.
    fn winning_revision(&self, doc_id: &str) -> CoreResult<Option<Revision>>;

    /// Loads one specific revision with its body.
    fn revision_body(&self, doc_id: &str, rev_id: &RevId) -> CoreResult<Option<Revision>>;

    /// Revision history of a revision, newest first (starting with itself).
    fn revision_history(&self, doc_id: &str, rev_id: &RevId) -> CoreResult<Vec<RevId>>;

    /// Winning revisions of the given documents, in input order; missing
    /// documents are skipped.
    fn documents_with_ids(&self, doc_ids: &[String]) -> CoreResult<Vec<Revision>>;

    /// Current, non-deleted winners with `sequence > seq`, ordered by doc id.
    /// This is the indexer's scan.
    fn winners_since(&self, seq: u64) -> CoreResult<Vec<Revision>>;

    /// Sequences at or below `seq` that have been superseded by a revision
    /// with `sequence > seq` (i.e. parents of newer revisions). The indexer
    /// deletes their emitted rows.
    fn superseded_sequences_since(&self, seq: u64) -> CoreResult<Vec<u64>>;

    /// Opens a transaction. Transactions nest; only the outermost commit or
    /// rollback takes effect.
    fn begin_transaction(&self) -> CoreResult<()>;

    /// Closes the innermost transaction; `success = false` rolls the
    /// outermost transaction back.
    fn end_transaction(&self, success: bool) -> CoreResult<()>;

    /// Registers a replication session as active against this store.
    fn add_active_replication(&self, session_id: &str);

    /// Unregisters a replication session.
    fn forget_replication(&self, session_id: &str);

    /// Session ids of currently registered replications.
    fn active_replications(&self) -> Vec<String>;
}
