use crate::model::{
    ExternalSync, FinalizeOutcome, LedgerAppend, LedgerEntry, LedgerFinalize, LedgerHandle,
    LedgerLookup, NewSubmission, SubmissionHandle, SubmissionRecord,
};
use crate::StorageResult;
use async_trait::async_trait;

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

/// Storage interface for the mutable per-submission row.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Open a row in `submitted` state before any external call.
    async fn create(&self, submission: NewSubmission) -> StorageResult<SubmissionHandle>;

    /// Rewrite the row with everything the collector returned, moving the
    /// status to `processing`. `processed_at` is set only if not already
    /// set. Rejected when the row is past `submitted`.
    async fn reconcile(&self, handle: &SubmissionHandle, sync: ExternalSync) -> StorageResult<()>;

    /// Terminal failure path. Rejected only when the row already reached
    /// a terminal state.
    async fn mark_failed(&self, handle: &SubmissionHandle, message: &str) -> StorageResult<()>;

    /// Number of rows for (form, agent) whose third-party status is
    /// `submitted`. Backs the submission-quota gate.
    async fn count_submitted(&self, form_id: &str, agent_id: &str) -> StorageResult<u64>;

    /// Read one record back.
    async fn get_submission(&self, id: i64) -> StorageResult<Option<SubmissionRecord>>;
}

/// Storage interface for the transaction ledger.
///
/// Entries are created once in `pending` state and move to a terminal
/// state at most once. Insert failures must be survivable for callers:
/// ledger unavailability never blocks the primary business operation.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append an entry and return a handle addressing the created row.
    async fn insert(&self, entry: LedgerAppend) -> StorageResult<LedgerHandle>;

    /// Apply the terminal update to the entry selected by `lookup`.
    /// Returns [`FinalizeOutcome::NoMatch`] when nothing pending matches.
    async fn finalize(
        &self,
        lookup: LedgerLookup,
        update: LedgerFinalize,
    ) -> StorageResult<FinalizeOutcome>;

    /// Read one entry back.
    async fn get_entry(&self, id: i64) -> StorageResult<Option<LedgerEntry>>;

    /// List entries newest-first.
    async fn list_entries(&self, window: QueryWindow) -> StorageResult<Vec<LedgerEntry>>;
}
