use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of one submission record.
///
/// Transitions are strictly forward: `submitted -> processing ->
/// (success | failed)`, with `submitted -> failed` allowed when the
/// external call never succeeds. Adapters reject anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Submitted,
    Processing,
    Success,
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Terminal-capable status of a ledger entry.
///
/// The raw third-party wording (`successful`, `auth_failed`, ...) is kept
/// separately in `third_party_status`; this enum is the normalized
/// lifecycle column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Success,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Handle to a created submission row, threaded through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionHandle {
    pub id: i64,
}

/// Handle to an inserted ledger entry.
///
/// Returned by [`crate::LedgerStore::insert`] so that the finalizing step
/// can address the exact row it opened instead of re-locating it by a
/// nullable transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerHandle {
    pub id: i64,
    pub transaction_id: Option<String>,
}

/// Fields required to open a submission row in `submitted` state.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub form_id: String,
    pub agent_id: String,
    pub customer_id: String,
    pub payload: Value,
}

/// Everything the external collector returned that the local row mirrors.
///
/// Applied as a single atomic update by
/// [`crate::SubmissionStore::reconcile`].
#[derive(Debug, Clone, Default)]
pub struct ExternalSync {
    pub submission_id: Option<String>,
    pub third_party_status: String,
    pub external_response: Value,
    pub form_title: Option<String>,
    pub form_description: Option<String>,
    pub organization_id: Option<String>,
    pub organization_name: Option<String>,
    pub sync_status: String,
    pub submitter_type: String,
    pub submitter_display: Option<String>,
    pub submitter_api_key_name: Option<String>,
    pub validation_status: String,
    pub validation_errors: Option<Value>,
    pub workflow_current_step: Option<String>,
    pub workflow_steps: Option<Value>,
    pub is_flagged: bool,
    pub api_key_name: Option<String>,
    pub external_id: Option<String>,
}

/// One submission attempt as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: i64,
    pub form_id: String,
    pub agent_id: String,
    pub customer_id: String,
    pub payload: Value,
    pub status: SubmissionStatus,
    pub submission_id: Option<String>,
    pub third_party_status: Option<String>,
    pub external_response: Option<Value>,
    pub form_title: Option<String>,
    pub form_description: Option<String>,
    pub organization_id: Option<String>,
    pub organization_name: Option<String>,
    pub sync_status: Option<String>,
    pub submitter_type: Option<String>,
    pub submitter_display: Option<String>,
    pub submitter_api_key_name: Option<String>,
    pub validation_status: Option<String>,
    pub validation_errors: Option<Value>,
    pub workflow_current_step: Option<String>,
    pub workflow_steps: Option<Value>,
    pub is_flagged: bool,
    pub api_key_name: Option<String>,
    pub external_id: Option<String>,
    pub error_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// Set exactly once, on the first successful reconciliation.
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new ledger entry.
#[derive(Debug, Clone)]
pub struct LedgerAppend {
    /// Usually `None` at creation; a real identifier arrives with the
    /// downstream payment and is backfilled at finalize time.
    pub transaction_id: Option<String>,
    pub status: LedgerStatus,
    pub third_party_status: String,
    pub description: String,
    /// Amount in minor currency units.
    pub amount: i64,
    pub customer_charge: i64,
    pub agent_id: String,
    pub agent_name: String,
    pub service: String,
    pub reference: Option<String>,
    pub customer_id: String,
    pub token: Option<String>,
}

/// Terminal update applied to a pending ledger entry.
#[derive(Debug, Clone)]
pub struct LedgerFinalize {
    pub status: LedgerStatus,
    pub third_party_status: String,
    pub token: Option<String>,
    pub description: String,
    /// When present, replaces the entry's transaction id (two-phase
    /// identity assignment: the commission id becomes the ledger key).
    pub assign_transaction_id: Option<String>,
}

/// How the finalizing step locates the entry to update.
#[derive(Debug, Clone)]
pub enum LedgerLookup {
    /// The handle returned by the insert. Preferred: addresses one row.
    Handle(LedgerHandle),
    /// Match by a known transaction identifier.
    TransactionId(String),
    /// Fallback: most recent pending entry for the actor and service.
    ///
    /// Inherently racy when one agent runs concurrent submissions; kept
    /// only for updates that arrive without a handle.
    LatestPending { agent_id: String, service: String },
}

/// Result of a finalize attempt. `NoMatch` is a logged no-op, not an
/// error: the at-most-one-terminal-transition contract means a second
/// finalize finds nothing pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Updated,
    NoMatch,
}

/// One ledger entry as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub transaction_id: Option<String>,
    pub status: LedgerStatus,
    pub third_party_status: String,
    pub description: String,
    pub amount: i64,
    pub customer_charge: i64,
    pub agent_id: String,
    pub agent_name: String,
    pub service: String,
    pub reference: Option<String>,
    pub customer_id: String,
    pub token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
