//! PostgreSQL adapter for the agency storage traits.
//!
//! This adapter is the transactional source of truth. Every operation is
//! a single statement; lifecycle guards live in the `WHERE` clauses so a
//! row can never transition backwards even under concurrent writers.

use crate::model::{
    ExternalSync, FinalizeOutcome, LedgerAppend, LedgerEntry, LedgerFinalize, LedgerHandle,
    LedgerLookup, LedgerStatus, NewSubmission, SubmissionHandle, SubmissionRecord,
    SubmissionStatus,
};
use crate::traits::{LedgerStore, QueryWindow, SubmissionStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS agency_submissions (
                id BIGSERIAL PRIMARY KEY,
                form_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL,
                submission_id TEXT,
                third_party_status TEXT,
                external_response JSONB,
                form_title TEXT,
                form_description TEXT,
                organization_id TEXT,
                organization_name TEXT,
                sync_status TEXT,
                submitter_type TEXT,
                submitter_display TEXT,
                submitter_api_key_name TEXT,
                validation_status TEXT,
                validation_errors JSONB,
                workflow_current_step TEXT,
                workflow_steps JSONB,
                is_flagged BOOLEAN NOT NULL DEFAULT FALSE,
                api_key_name TEXT,
                external_id TEXT,
                error_message TEXT,
                submitted_at TIMESTAMPTZ NOT NULL,
                processed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS agency_submissions_form_agent_idx
                ON agency_submissions (form_id, agent_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS agency_ledger_entries (
                id BIGSERIAL PRIMARY KEY,
                transaction_id TEXT,
                status TEXT NOT NULL,
                third_party_status TEXT NOT NULL,
                description TEXT NOT NULL,
                amount BIGINT NOT NULL,
                customer_charge BIGINT NOT NULL,
                agent_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                service TEXT NOT NULL,
                reference TEXT,
                customer_id TEXT NOT NULL,
                token TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS agency_ledger_agent_service_idx
                ON agency_ledger_entries (agent_id, service, status)
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for PostgresStorage {
    async fn create(&self, submission: NewSubmission) -> StorageResult<SubmissionHandle> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO agency_submissions
                (form_id, agent_id, customer_id, payload, status, submitted_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6, $6)
            RETURNING id
            "#,
        )
        .bind(submission.form_id)
        .bind(submission.agent_id)
        .bind(submission.customer_id)
        .bind(submission.payload)
        .bind(SubmissionStatus::Submitted.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(SubmissionHandle { id })
    }

    async fn reconcile(&self, handle: &SubmissionHandle, sync: ExternalSync) -> StorageResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE agency_submissions
               SET submission_id = $1,
                   status = $2,
                   third_party_status = $3,
                   external_response = $4,
                   form_title = $5,
                   form_description = $6,
                   organization_id = $7,
                   organization_name = $8,
                   sync_status = $9,
                   submitter_type = $10,
                   submitter_display = $11,
                   submitter_api_key_name = $12,
                   validation_status = $13,
                   validation_errors = $14,
                   workflow_current_step = $15,
                   workflow_steps = $16,
                   is_flagged = $17,
                   api_key_name = $18,
                   external_id = $19,
                   processed_at = COALESCE(processed_at, $20),
                   updated_at = $20
             WHERE id = $21
               AND status = 'submitted'
            "#,
        )
        .bind(sync.submission_id)
        .bind(SubmissionStatus::Processing.as_str())
        .bind(sync.third_party_status)
        .bind(sync.external_response)
        .bind(sync.form_title)
        .bind(sync.form_description)
        .bind(sync.organization_id)
        .bind(sync.organization_name)
        .bind(sync.sync_status)
        .bind(sync.submitter_type)
        .bind(sync.submitter_display)
        .bind(sync.submitter_api_key_name)
        .bind(sync.validation_status)
        .bind(sync.validation_errors)
        .bind(sync.workflow_current_step)
        .bind(sync.workflow_steps)
        .bind(sync.is_flagged)
        .bind(sync.api_key_name)
        .bind(sync.external_id)
        .bind(now)
        .bind(handle.id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            let exists = self.get_submission(handle.id).await?.is_some();
            if exists {
                return Err(StorageError::InvariantViolation(format!(
                    "cannot reconcile submission {} past submitted state",
                    handle.id
                )));
            }
            return Err(StorageError::NotFound(format!(
                "submission {} not found",
                handle.id
            )));
        }

        Ok(())
    }

    async fn mark_failed(&self, handle: &SubmissionHandle, message: &str) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE agency_submissions
               SET status = 'failed',
                   error_message = $1,
                   updated_at = $2
             WHERE id = $3
               AND status IN ('submitted', 'processing')
            "#,
        )
        .bind(message)
        .bind(Utc::now())
        .bind(handle.id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            let exists = self.get_submission(handle.id).await?.is_some();
            if exists {
                return Err(StorageError::InvariantViolation(format!(
                    "submission {} already terminal",
                    handle.id
                )));
            }
            return Err(StorageError::NotFound(format!(
                "submission {} not found",
                handle.id
            )));
        }

        Ok(())
    }

    async fn count_submitted(&self, form_id: &str, agent_id: &str) -> StorageResult<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS submission_count
              FROM agency_submissions
             WHERE form_id = $1
               AND agent_id = $2
               AND third_party_status = 'submitted'
            "#,
        )
        .bind(form_id)
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let count: i64 = row
            .try_get("submission_count")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count.max(0) as u64)
    }

    async fn get_submission(&self, id: i64) -> StorageResult<Option<SubmissionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, form_id, agent_id, customer_id, payload, status, submission_id,
                   third_party_status, external_response, form_title, form_description,
                   organization_id, organization_name, sync_status, submitter_type,
                   submitter_display, submitter_api_key_name, validation_status,
                   validation_errors, workflow_current_step, workflow_steps, is_flagged,
                   api_key_name, external_id, error_message, submitted_at, processed_at,
                   created_at, updated_at
              FROM agency_submissions
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(submission_row_to_record).transpose()
    }
}

#[async_trait]
impl LedgerStore for PostgresStorage {
    async fn insert(&self, entry: LedgerAppend) -> StorageResult<LedgerHandle> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO agency_ledger_entries
                (transaction_id, status, third_party_status, description, amount,
                 customer_charge, agent_id, agent_name, service, reference, customer_id,
                 token, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            RETURNING id
            "#,
        )
        .bind(entry.transaction_id.clone())
        .bind(entry.status.as_str())
        .bind(entry.third_party_status)
        .bind(entry.description)
        .bind(entry.amount)
        .bind(entry.customer_charge)
        .bind(entry.agent_id)
        .bind(entry.agent_name)
        .bind(entry.service)
        .bind(entry.reference)
        .bind(entry.customer_id)
        .bind(entry.token)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
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
        let now = Utc::now();
        let base = r#"
            UPDATE agency_ledger_entries
               SET status = $1,
                   third_party_status = $2,
                   token = $3,
                   description = $4,
                   transaction_id = COALESCE($5, transaction_id),
                   updated_at = $6
        "#;

        let result = match lookup {
            LedgerLookup::Handle(handle) => {
                let sql = format!("{base} WHERE id = $7 AND status = 'pending'");
                sqlx::query(&sql)
                    .bind(update.status.as_str())
                    .bind(update.third_party_status)
                    .bind(update.token)
                    .bind(update.description)
                    .bind(update.assign_transaction_id)
                    .bind(now)
                    .bind(handle.id)
                    .execute(&self.pool)
                    .await
            }
            LedgerLookup::TransactionId(transaction_id) => {
                let sql = format!("{base} WHERE transaction_id = $7 AND status = 'pending'");
                sqlx::query(&sql)
                    .bind(update.status.as_str())
                    .bind(update.third_party_status)
                    .bind(update.token)
                    .bind(update.description)
                    .bind(update.assign_transaction_id)
                    .bind(now)
                    .bind(transaction_id)
                    .execute(&self.pool)
                    .await
            }
            LedgerLookup::LatestPending { agent_id, service } => {
                let sql = format!(
                    r#"{base}
                     WHERE id = (
                        SELECT id FROM agency_ledger_entries
                         WHERE agent_id = $7 AND service = $8 AND status = 'pending'
                         ORDER BY created_at DESC, id DESC
                         LIMIT 1
                     )"#
                );
                sqlx::query(&sql)
                    .bind(update.status.as_str())
                    .bind(update.third_party_status)
                    .bind(update.token)
                    .bind(update.description)
                    .bind(update.assign_transaction_id)
                    .bind(now)
                    .bind(agent_id)
                    .bind(service)
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(FinalizeOutcome::NoMatch);
        }
        Ok(FinalizeOutcome::Updated)
    }

    async fn get_entry(&self, id: i64) -> StorageResult<Option<LedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, transaction_id, status, third_party_status, description, amount,
                   customer_charge, agent_id, agent_name, service, reference, customer_id,
                   token, created_at, updated_at
              FROM agency_ledger_entries
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(ledger_row_to_record).transpose()
    }

    async fn list_entries(&self, window: QueryWindow) -> StorageResult<Vec<LedgerEntry>> {
        let rows = if window.limit == 0 {
            sqlx::query(
                r#"
                SELECT id, transaction_id, status, third_party_status, description, amount,
                       customer_charge, agent_id, agent_name, service, reference, customer_id,
                       token, created_at, updated_at
                  FROM agency_ledger_entries
                 ORDER BY created_at DESC, id DESC
                 OFFSET $1
                "#,
            )
            .bind(to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            sqlx::query(
                r#"
                SELECT id, transaction_id, status, third_party_status, description, amount,
                       customer_charge, agent_id, agent_name, service, reference, customer_id,
                       token, created_at, updated_at
                  FROM agency_ledger_entries
                 ORDER BY created_at DESC, id DESC
                 LIMIT $1 OFFSET $2
                "#,
            )
            .bind(to_i64(window.limit)?)
            .bind(to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(ledger_row_to_record).collect()
    }
}

fn submission_row_to_record(row: sqlx::postgres::PgRow) -> StorageResult<SubmissionRecord> {
    let status: String = row
        .try_get("status")
        .map_err(|e| StorageError::Backend(e.to_string()))?;

    Ok(SubmissionRecord {
        id: row
            .try_get("id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        form_id: row
            .try_get("form_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        agent_id: row
            .try_get("agent_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        customer_id: row
            .try_get("customer_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        payload: row
            .try_get("payload")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        status: parse_submission_status(&status)?,
        submission_id: row
            .try_get("submission_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        third_party_status: row
            .try_get("third_party_status")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        external_response: row
            .try_get("external_response")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        form_title: row
            .try_get("form_title")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        form_description: row
            .try_get("form_description")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        organization_id: row
            .try_get("organization_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        organization_name: row
            .try_get("organization_name")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        sync_status: row
            .try_get("sync_status")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        submitter_type: row
            .try_get("submitter_type")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        submitter_display: row
            .try_get("submitter_display")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        submitter_api_key_name: row
            .try_get("submitter_api_key_name")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        validation_status: row
            .try_get("validation_status")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        validation_errors: row
            .try_get("validation_errors")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        workflow_current_step: row
            .try_get("workflow_current_step")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        workflow_steps: row
            .try_get("workflow_steps")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        is_flagged: row
            .try_get("is_flagged")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        api_key_name: row
            .try_get("api_key_name")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        external_id: row
            .try_get("external_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        submitted_at: row
            .try_get("submitted_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        processed_at: row
            .try_get("processed_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn ledger_row_to_record(row: sqlx::postgres::PgRow) -> StorageResult<LedgerEntry> {
    let status: String = row
        .try_get("status")
        .map_err(|e| StorageError::Backend(e.to_string()))?;

    Ok(LedgerEntry {
        id: row
            .try_get("id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        transaction_id: row
            .try_get("transaction_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        status: parse_ledger_status(&status)?,
        third_party_status: row
            .try_get("third_party_status")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        description: row
            .try_get("description")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        amount: row
            .try_get("amount")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        customer_charge: row
            .try_get("customer_charge")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        agent_id: row
            .try_get("agent_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        agent_name: row
            .try_get("agent_name")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        service: row
            .try_get("service")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        reference: row
            .try_get("reference")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        customer_id: row
            .try_get("customer_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        token: row
            .try_get("token")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn parse_submission_status(raw: &str) -> StorageResult<SubmissionStatus> {
    match raw {
        "submitted" => Ok(SubmissionStatus::Submitted),
        "processing" => Ok(SubmissionStatus::Processing),
        "success" => Ok(SubmissionStatus::Success),
        "failed" => Ok(SubmissionStatus::Failed),
        _ => Err(StorageError::Serialization(format!(
            "unknown submission status `{raw}`"
        ))),
    }
}

fn parse_ledger_status(raw: &str) -> StorageResult<LedgerStatus> {
    match raw {
        "pending" => Ok(LedgerStatus::Pending),
        "success" => Ok(LedgerStatus::Success),
        "failed" => Ok(LedgerStatus::Failed),
        _ => Err(StorageError::Serialization(format!(
            "unknown ledger status `{raw}`"
        ))),
    }
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput("window value too large".to_string()))
}
