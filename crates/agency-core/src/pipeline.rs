//! The transactional submission pipeline.
//!
//! One run: validate, open a pending ledger entry, open a local record,
//! relay the payload to the external collector, reconcile the record,
//! trigger the commission payout, finalize the ledger. The external call
//! is the only step allowed to abort; ledger and record writes are
//! observability, not gates, and the payout is fully isolated.
//!
//! Every write is its own atomic statement. A crash between steps leaves
//! the ledger and the record individually consistent but possibly
//! divergent; the pipeline records truth as far as it got.

use crate::commission::{CommissionInvoker, CommissionResult};
use crate::error::SubmitError;
use crate::gateway::{Gateway, GatewayRequest};
use crate::stage::{SubmitStage, SubmitStageMachine};
use agency_storage::{
    ExternalSync, FinalizeOutcome, LedgerAppend, LedgerFinalize, LedgerHandle, LedgerLookup,
    LedgerStatus, LedgerStore, NewSubmission, SubmissionHandle, SubmissionStore,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Service tag written into ledger entries for form submissions.
pub const DATA_COLLECTION_SERVICE: &str = "data_collection";

/// The actor extracted from the caller's validated credential.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
}

/// One submission request, already stripped of transport concerns.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub form_id: String,
    pub data: Option<Value>,
    /// Status forwarded to the collector; defaults to `submitted`.
    pub forwarded_status: Option<String>,
    /// The caller's bearer credential, forwarded to the collector.
    pub bearer_token: String,
    pub language: String,
    pub agent: AgentIdentity,
}

/// Composed result of a successful run.
#[derive(Debug)]
pub struct SubmissionOutcome {
    /// The collector's response body, verbatim.
    pub response: Value,
    /// Local record id, when the record write succeeded.
    pub record_id: Option<i64>,
    /// Local lifecycle status reported to the caller.
    pub status: &'static str,
    pub commission: CommissionResult,
}

/// Orchestrates one submission end to end.
pub struct SubmissionPipeline {
    collector: Arc<dyn Gateway>,
    ledger: Arc<dyn LedgerStore>,
    records: Arc<dyn SubmissionStore>,
    commission: CommissionInvoker,
}

impl SubmissionPipeline {
    pub fn new(
        collector: Arc<dyn Gateway>,
        ledger: Arc<dyn LedgerStore>,
        records: Arc<dyn SubmissionStore>,
        commission: CommissionInvoker,
    ) -> Self {
        Self {
            collector,
            ledger,
            records,
            commission,
        }
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmissionOutcome, SubmitError> {
        let mut stages = SubmitStageMachine::new();

        // Validation failures are fast-fail: no ledger entry, no record.
        if request.form_id.trim().is_empty() {
            return Err(SubmitError::Validation {
                message_key: "validation.missing_form_id",
                field: "formId",
            });
        }
        let Some(data) = request.data.clone() else {
            return Err(SubmitError::Validation {
                message_key: "validation.missing_form_fields",
                field: "data",
            });
        };

        info!(
            form_id = %request.form_id,
            agent_id = %request.agent.id,
            language = %request.language,
            "submitting form data"
        );

        stages.advance(SubmitStage::LedgerPending)?;
        let ledger_handle = self.open_ledger_entry(&request).await;

        stages.advance(SubmitStage::RecordCreated)?;
        let record_handle = self.open_record(&request, &data).await;

        stages.advance(SubmitStage::ExternalCall)?;
        let call = GatewayRequest::post(
            format!("/external/forms/{}/submit", request.form_id),
            json!({
                "data": data,
                "status": request
                    .forwarded_status
                    .clone()
                    .unwrap_or_else(|| "submitted".to_string()),
            }),
        )
        .with_bearer(request.bearer_token.clone())
        .with_language(request.language.clone());

        let body = match self.collector.call(call).await {
            Ok(body) => body,
            Err(err) => {
                stages.advance(SubmitStage::Failed)?;
                self.record_failure(&request, record_handle, ledger_handle, &err.to_string())
                    .await;
                return Err(SubmitError::Gateway(err));
            }
        };

        stages.advance(SubmitStage::Reconciling)?;
        let CollectorOutcome {
            submission_id,
            external_status,
            sync,
        } = parse_collector_response(&body);

        if let Some(handle) = &record_handle {
            if let Err(err) = self.records.reconcile(handle, sync).await {
                // The external call already succeeded; local divergence is
                // logged and the caller still gets a success.
                error!(record_id = handle.id, error = %err, "failed to reconcile submission record");
            } else {
                info!(
                    record_id = handle.id,
                    submission_id = submission_id.as_deref().unwrap_or("-"),
                    "submission record updated with collector response"
                );
            }
        }

        stages.advance(SubmitStage::SideEffect)?;
        let commission = self
            .commission
            .invoke(&request.agent.id, &request.agent.name)
            .await;
        info!(
            agent_id = %request.agent.id,
            success = commission.success,
            transaction_id = commission.transaction_id.as_deref().unwrap_or("-"),
            "commission generation attempt completed"
        );

        stages.advance(SubmitStage::Finalizing)?;
        self.finalize_ledger(
            &request,
            ledger_handle,
            submission_id.as_deref(),
            &external_status,
            &body,
            &commission,
        )
        .await;

        stages.advance(SubmitStage::Done)?;
        Ok(SubmissionOutcome {
            response: body,
            record_id: record_handle.map(|handle| handle.id),
            status: "processing",
            commission,
        })
    }

    async fn open_ledger_entry(&self, request: &SubmitRequest) -> Option<LedgerHandle> {
        let entry = LedgerAppend {
            transaction_id: None,
            status: LedgerStatus::Pending,
            third_party_status: "pending".to_string(),
            description: format!(
                "Form submission - form: {}, agent: {}",
                request.form_id, request.agent.name
            ),
            amount: 0,
            customer_charge: 0,
            agent_id: request.agent.id.clone(),
            agent_name: request.agent.name.clone(),
            service: DATA_COLLECTION_SERVICE.to_string(),
            reference: Some(request.form_id.clone()),
            customer_id: request.agent.id.clone(),
            token: None,
        };
        match self.ledger.insert(entry).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                // Ledger unavailability never blocks the submission.
                error!(form_id = %request.form_id, error = %err, "failed to create pending ledger entry");
                None
            }
        }
    }

    async fn open_record(&self, request: &SubmitRequest, data: &Value) -> Option<SubmissionHandle> {
        let submission = NewSubmission {
            form_id: request.form_id.clone(),
            agent_id: request.agent.id.clone(),
            customer_id: request.agent.id.clone(),
            payload: data.clone(),
        };
        match self.records.create(submission).await {
            Ok(handle) => {
                info!(record_id = handle.id, form_id = %request.form_id, "submission saved");
                Some(handle)
            }
            Err(err) => {
                // Local persistence is best-effort before the external call.
                error!(form_id = %request.form_id, error = %err, "failed to save submission record");
                None
            }
        }
    }

    async fn finalize_ledger(
        &self,
        request: &SubmitRequest,
        ledger_handle: Option<LedgerHandle>,
        submission_id: Option<&str>,
        external_status: &str,
        body: &Value,
        commission: &CommissionResult,
    ) {
        let commission_id = commission
            .transaction_id
            .clone()
            .or_else(|| text(commission.data.as_ref().and_then(|d| d.get("id"))));
        let third_party_status =
            text(body.get("status")).unwrap_or_else(|| external_status.to_string());
        let description = format!(
            "Form submission - submission: {}, form: {}, agent: {}, commission: {}",
            submission_id.unwrap_or("N/A"),
            request.form_id,
            request.agent.name,
            commission_id.as_deref().unwrap_or("N/A"),
        );

        let lookup = match ledger_handle {
            Some(handle) => LedgerLookup::Handle(handle),
            None => LedgerLookup::LatestPending {
                agent_id: request.agent.id.clone(),
                service: DATA_COLLECTION_SERVICE.to_string(),
            },
        };
        let update = LedgerFinalize {
            status: LedgerStatus::Success,
            third_party_status,
            token: submission_id.map(str::to_string),
            description,
            assign_transaction_id: commission_id,
        };

        match self.ledger.finalize(lookup, update).await {
            Ok(FinalizeOutcome::Updated) => {
                info!(form_id = %request.form_id, "submission ledger entry finalized");
            }
            Ok(FinalizeOutcome::NoMatch) => {
                warn!(form_id = %request.form_id, "no pending ledger entry to finalize");
            }
            Err(err) => {
                error!(form_id = %request.form_id, error = %err, "failed to finalize ledger entry");
            }
        }
    }

    async fn record_failure(
        &self,
        request: &SubmitRequest,
        record_handle: Option<SubmissionHandle>,
        ledger_handle: Option<LedgerHandle>,
        message: &str,
    ) {
        if let Some(handle) = &record_handle {
            if let Err(err) = self.records.mark_failed(handle, message).await {
                error!(record_id = handle.id, error = %err, "failed to mark submission record failed");
            }
        }

        let lookup = match ledger_handle {
            Some(handle) => LedgerLookup::Handle(handle),
            None => LedgerLookup::LatestPending {
                agent_id: request.agent.id.clone(),
                service: DATA_COLLECTION_SERVICE.to_string(),
            },
        };
        let update = LedgerFinalize {
            status: LedgerStatus::Failed,
            third_party_status: "failed".to_string(),
            token: None,
            description: format!(
                "Form submission failed - form: {}, agent: {}, error: {}",
                request.form_id, request.agent.name, message
            ),
            assign_transaction_id: None,
        };
        match self.ledger.finalize(lookup, update).await {
            Ok(FinalizeOutcome::Updated) => {}
            Ok(FinalizeOutcome::NoMatch) => {
                warn!(form_id = %request.form_id, "no pending ledger entry to mark failed");
            }
            Err(err) => {
                error!(form_id = %request.form_id, error = %err, "failed to finalize failed ledger entry");
            }
        }
    }
}

/// What the pipeline pulls out of the collector's response body.
#[derive(Debug)]
struct CollectorOutcome {
    submission_id: Option<String>,
    external_status: String,
    sync: ExternalSync,
}

fn parse_collector_response(body: &Value) -> CollectorOutcome {
    let submission = body.get("submission");
    let api_details = body.get("apiDetails");
    let form = nested(submission, "form");
    let organization = nested(submission, "organization");
    let validation = nested(submission, "validation");
    let workflow = nested(submission, "workflow");
    let submitter_display = nested(submission, "submitterDisplay");

    let submission_id = text(body.get("submissionId"))
        .or_else(|| text(nested(api_details, "submissionId")))
        .or_else(|| text(nested(submission, "_id")));
    let external_status = text(nested(submission, "status"))
        .or_else(|| text(body.get("status")))
        .unwrap_or_else(|| "processing".to_string());

    let sync = ExternalSync {
        submission_id: submission_id.clone(),
        third_party_status: external_status.clone(),
        external_response: body.clone(),
        form_title: text(nested(form, "title")),
        form_description: text(nested(form, "description")),
        organization_id: text(nested(organization, "_id")),
        organization_name: text(nested(organization, "name")),
        sync_status: text(nested(submission, "syncStatus")).unwrap_or_else(|| "synced".to_string()),
        submitter_type: text(nested(submission, "submissionType"))
            .unwrap_or_else(|| "api".to_string()),
        submitter_display: text(nested(submitter_display, "displayName")),
        submitter_api_key_name: text(nested(submitter_display, "apiKeyName"))
            .or_else(|| text(nested(api_details, "apiKeyName"))),
        validation_status: if nested(validation, "isValid").and_then(Value::as_bool) == Some(true) {
            "valid".to_string()
        } else {
            "invalid".to_string()
        },
        validation_errors: nested(validation, "errors").cloned(),
        workflow_current_step: text(nested(workflow, "currentStep")),
        workflow_steps: nested(workflow, "steps").cloned(),
        is_flagged: nested(nested(submission, "flags"), "isFlagged").and_then(Value::as_bool)
            == Some(true),
        api_key_name: text(nested(api_details, "apiKeyName")),
        external_id: text(nested(api_details, "externalId")),
    };

    CollectorOutcome {
        submission_id,
        external_status,
        sync,
    }
}

fn nested<'a>(root: Option<&'a Value>, key: &str) -> Option<&'a Value> {
    root.and_then(|value| value.get(key))
}

fn text(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}
