//! In-memory reference implementation of the storage traits.
//!
//! Deterministic and test-friendly. Production deployments use the
//! PostgreSQL adapter as the source of truth.

use crate::model::{
    ExternalSync, FinalizeOutcome, LedgerAppend, LedgerEntry, LedgerFinalize, LedgerHandle,
    LedgerLookup, LedgerStatus, NewSubmission, SubmissionHandle, SubmissionRecord,
    SubmissionStatus,
};
use crate::traits::{LedgerStore, QueryWindow, SubmissionStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

/// In-memory storage adapter implementing both store traits.
#[derive(Default)]
pub struct InMemoryStorage {
    submissions: RwLock<HashMap<i64, SubmissionRecord>>,
    ledger: RwLock<Vec<LedgerEntry>>,
    next_submission_id: AtomicI64,
    next_ledger_id: AtomicI64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all submission rows, for assertions in tests.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.submissions
            .read()
            .map(|guard| guard.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SubmissionStore for InMemoryStorage {
    async fn create(&self, submission: NewSubmission) -> StorageResult<SubmissionHandle> {
        let mut guard = self
            .submissions
            .write()
            .map_err(|_| StorageError::Backend("submissions lock poisoned".to_string()))?;

        let id = self.next_submission_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let record = SubmissionRecord {
            id,
            form_id: submission.form_id,
            agent_id: submission.agent_id,
            customer_id: submission.customer_id,
            payload: submission.payload,
            status: SubmissionStatus::Submitted,
            submission_id: None,
            third_party_status: None,
            external_response: None,
            form_title: None,
            form_description: None,
            organization_id: None,
            organization_name: None,
            sync_status: None,
            submitter_type: None,
            submitter_display: None,
            submitter_api_key_name: None,
            validation_status: None,
            validation_errors: None,
            workflow_current_step: None,
            workflow_steps: None,
            is_flagged: false,
            api_key_name: None,
            external_id: None,
            error_message: None,
            submitted_at: now,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };
        guard.insert(id, record);
        Ok(SubmissionHandle { id })
    }

    async fn reconcile(&self, handle: &SubmissionHandle, sync: ExternalSync) -> StorageResult<()> {
        let mut guard = self
            .submissions
            .write()
            .map_err(|_| StorageError::Backend("submissions lock poisoned".to_string()))?;
        let record = guard.get_mut(&handle.id).ok_or_else(|| {
            StorageError::NotFound(format!("submission {} not found", handle.id))
        })?;

        if record.status != SubmissionStatus::Submitted {
            return Err(StorageError::InvariantViolation(format!(
                "cannot reconcile submission {} in state {}",
                handle.id,
                record.status.as_str()
            )));
        }

        let now = Utc::now();
        record.submission_id = sync.submission_id;
        record.status = SubmissionStatus::Processing;
        record.third_party_status = Some(sync.third_party_status);
        record.external_response = Some(sync.external_response);
        record.form_title = sync.form_title;
        record.form_description = sync.form_description;
        record.organization_id = sync.organization_id;
        record.organization_name = sync.organization_name;
        record.sync_status = Some(sync.sync_status);
        record.submitter_type = Some(sync.submitter_type);
        record.submitter_display = sync.submitter_display;
        record.submitter_api_key_name = sync.submitter_api_key_name;
        record.validation_status = Some(sync.validation_status);
        record.validation_errors = sync.validation_errors;
        record.workflow_current_step = sync.workflow_current_step;
        record.workflow_steps = sync.workflow_steps;
        record.is_flagged = sync.is_flagged;
        record.api_key_name = sync.api_key_name;
        record.external_id = sync.external_id;
        if record.processed_at.is_none() {
            record.processed_at = Some(now);
        }
        record.updated_at = now;
        Ok(())
    }

    async fn mark_failed(&self, handle: &SubmissionHandle, message: &str) -> StorageResult<()> {
        let mut guard = self
            .submissions
            .write()
            .map_err(|_| StorageError::Backend("submissions lock poisoned".to_string()))?;
        let record = guard.get_mut(&handle.id).ok_or_else(|| {
            StorageError::NotFound(format!("submission {} not found", handle.id))
        })?;

        if matches!(
            record.status,
            SubmissionStatus::Success | SubmissionStatus::Failed
        ) {
            return Err(StorageError::InvariantViolation(format!(
                "submission {} already terminal in state {}",
                handle.id,
                record.status.as_str()
            )));
        }

        record.status = SubmissionStatus::Failed;
        record.error_message = Some(message.to_string());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn count_submitted(&self, form_id: &str, agent_id: &str) -> StorageResult<u64> {
        let guard = self
            .submissions
            .read()
            .map_err(|_| StorageError::Backend("submissions lock poisoned".to_string()))?;
        Ok(guard
            .values()
            .filter(|record| {
                record.form_id == form_id
                    && record.agent_id == agent_id
                    && record.third_party_status.as_deref() == Some("submitted")
            })
            .count() as u64)
    }

    async fn get_submission(&self, id: i64) -> StorageResult<Option<SubmissionRecord>> {
        let guard = self
            .submissions
            .read()
            .map_err(|_| StorageError::Backend("submissions lock poisoned".to_string()))?;
        Ok(guard.get(&id).cloned())
    }
}

#[async_trait]
impl LedgerStore for InMemoryStorage {
    async fn insert(&self, entry: LedgerAppend) -> StorageResult<LedgerHandle> {
        let mut guard = self
            .ledger
            .write()
            .map_err(|_| StorageError::Backend("ledger lock poisoned".to_string()))?;

        let id = self.next_ledger_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let stored = LedgerEntry {
            id,
            transaction_id: entry.transaction_id.clone(),
            status: entry.status,
            third_party_status: entry.third_party_status,
            description: entry.description,
            amount: entry.amount,
            customer_charge: entry.customer_charge,
            agent_id: entry.agent_id,
            agent_name: entry.agent_name,
            service: entry.service,
            reference: entry.reference,
            customer_id: entry.customer_id,
            token: entry.token,
            created_at: now,
            updated_at: now,
        };
        guard.push(stored);
        Ok(LedgerHandle {
            id,
            transaction_id: entry.transaction_id,
        })
    }

    async fn finalize(
        &self,
        lookup: LedgerLookup,
        update: LedgerFinalize,
    ) -> StorageResult<FinalizeOutcome> {
        let mut guard = self
            .ledger
            .write()
            .map_err(|_| StorageError::Backend("ledger lock poisoned".to_string()))?;

        let target = match &lookup {
            LedgerLookup::Handle(handle) => guard
                .iter_mut()
                .find(|entry| entry.id == handle.id && entry.status == LedgerStatus::Pending),
            LedgerLookup::TransactionId(transaction_id) => guard.iter_mut().find(|entry| {
                entry.transaction_id.as_deref() == Some(transaction_id.as_str())
                    && entry.status == LedgerStatus::Pending
            }),
            LedgerLookup::LatestPending { agent_id, service } => guard
                .iter_mut()
                .filter(|entry| {
                    entry.agent_id == *agent_id
                        && entry.service == *service
                        && entry.status == LedgerStatus::Pending
                })
                .max_by_key(|entry| (entry.created_at, entry.id)),
        };

        let Some(entry) = target else {
            return Ok(FinalizeOutcome::NoMatch);
        };

        entry.status = update.status;
        entry.third_party_status = update.third_party_status;
        entry.token = update.token;
        entry.description = update.description;
        if let Some(transaction_id) = update.assign_transaction_id {
            entry.transaction_id = Some(transaction_id);
        }
        entry.updated_at = Utc::now();
        Ok(FinalizeOutcome::Updated)
    }

    async fn get_entry(&self, id: i64) -> StorageResult<Option<LedgerEntry>> {
        let guard = self
            .ledger
            .read()
            .map_err(|_| StorageError::Backend("ledger lock poisoned".to_string()))?;
        Ok(guard.iter().find(|entry| entry.id == id).cloned())
    }

    async fn list_entries(&self, window: QueryWindow) -> StorageResult<Vec<LedgerEntry>> {
        let guard = self
            .ledger
            .read()
            .map_err(|_| StorageError::Backend("ledger lock poisoned".to_string()))?;
        let mut entries: Vec<LedgerEntry> = guard.clone();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let entries = entries
            .into_iter()
            .skip(window.offset)
            .take(if window.limit == 0 {
                usize::MAX
            } else {
                window.limit
            })
            .collect();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_submission() -> NewSubmission {
        NewSubmission {
            form_id: "form-1".to_string(),
            agent_id: "agent-9".to_string(),
            customer_id: "agent-9".to_string(),
            payload: json!({"name": "x"}),
        }
    }

    fn pending_entry(agent_id: &str) -> LedgerAppend {
        LedgerAppend {
            transaction_id: None,
            status: LedgerStatus::Pending,
            third_party_status: "pending".to_string(),
            description: "form submission".to_string(),
            amount: 0,
            customer_charge: 0,
            agent_id: agent_id.to_string(),
            agent_name: "Agent".to_string(),
            service: "data_collection".to_string(),
            reference: Some("form-1".to_string()),
            customer_id: agent_id.to_string(),
            token: None,
        }
    }

    fn success_update() -> LedgerFinalize {
        LedgerFinalize {
            status: LedgerStatus::Success,
            third_party_status: "approved".to_string(),
            token: Some("sub-1".to_string()),
            description: "done".to_string(),
            assign_transaction_id: Some("txn-77".to_string()),
        }
    }

    #[tokio::test]
    async fn reconcile_moves_submitted_to_processing_once() {
        let store = InMemoryStorage::new();
        let handle = store.create(new_submission()).await.unwrap();

        store
            .reconcile(
                &handle,
                ExternalSync {
                    submission_id: Some("sub-1".to_string()),
                    third_party_status: "approved".to_string(),
                    external_response: json!({"ok": true}),
                    sync_status: "synced".to_string(),
                    submitter_type: "api".to_string(),
                    validation_status: "valid".to_string(),
                    ..ExternalSync::default()
                },
            )
            .await
            .unwrap();

        let record = store.get_submission(handle.id).await.unwrap().unwrap();
        assert_eq!(record.status, SubmissionStatus::Processing);
        assert_eq!(record.submission_id.as_deref(), Some("sub-1"));
        assert!(record.processed_at.is_some());

        // A second reconcile must be rejected: the row moved forward.
        let err = store
            .reconcile(&handle, ExternalSync::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn mark_failed_rejects_terminal_rows() {
        let store = InMemoryStorage::new();
        let handle = store.create(new_submission()).await.unwrap();
        store.mark_failed(&handle, "upstream timeout").await.unwrap();

        let record = store.get_submission(handle.id).await.unwrap().unwrap();
        assert_eq!(record.status, SubmissionStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("upstream timeout"));

        let err = store.mark_failed(&handle, "again").await.unwrap_err();
        assert!(matches!(err, StorageError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn count_submitted_matches_third_party_status_only() {
        let store = InMemoryStorage::new();
        let first = store.create(new_submission()).await.unwrap();
        let _second = store.create(new_submission()).await.unwrap();

        store
            .reconcile(
                &first,
                ExternalSync {
                    third_party_status: "submitted".to_string(),
                    external_response: json!({}),
                    sync_status: "synced".to_string(),
                    submitter_type: "api".to_string(),
                    validation_status: "valid".to_string(),
                    ..ExternalSync::default()
                },
            )
            .await
            .unwrap();

        // Only the reconciled row carries a third-party status.
        let count = store.count_submitted("form-1", "agent-9").await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn finalize_by_handle_updates_exactly_one_pending_row() {
        let store = InMemoryStorage::new();
        let handle = store.insert(pending_entry("agent-9")).await.unwrap();
        let _other = store.insert(pending_entry("agent-9")).await.unwrap();

        let outcome = store
            .finalize(LedgerLookup::Handle(handle.clone()), success_update())
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Updated);

        let entry = store.get_entry(handle.id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Success);
        assert_eq!(entry.transaction_id.as_deref(), Some("txn-77"));
        assert_eq!(entry.token.as_deref(), Some("sub-1"));

        // The same handle finalizes at most once.
        let outcome = store
            .finalize(LedgerLookup::Handle(handle), success_update())
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::NoMatch);
    }

    #[tokio::test]
    async fn latest_pending_fallback_picks_newest_entry_for_actor() {
        let store = InMemoryStorage::new();
        let _older = store.insert(pending_entry("agent-9")).await.unwrap();
        let newer = store.insert(pending_entry("agent-9")).await.unwrap();
        let _other_agent = store.insert(pending_entry("agent-5")).await.unwrap();

        let outcome = store
            .finalize(
                LedgerLookup::LatestPending {
                    agent_id: "agent-9".to_string(),
                    service: "data_collection".to_string(),
                },
                success_update(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Updated);

        let entry = store.get_entry(newer.id).await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Success);
    }

    #[tokio::test]
    async fn finalize_without_pending_rows_is_a_no_op() {
        let store = InMemoryStorage::new();
        let outcome = store
            .finalize(
                LedgerLookup::LatestPending {
                    agent_id: "agent-9".to_string(),
                    service: "data_collection".to_string(),
                },
                success_update(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::NoMatch);
    }
}
