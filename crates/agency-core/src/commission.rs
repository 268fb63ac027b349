//! Commission payout triggered after a successful form submission.
//!
//! The invoker never lets a failure escape its boundary: the pipeline
//! always receives a [`CommissionResult`], so the primary submission
//! outcome cannot be downgraded by a payout problem.

use crate::config::CommissionConfig;
use crate::error::GatewayError;
use crate::gateway::{Gateway, GatewayRequest};
use agency_storage::{LedgerAppend, LedgerFinalize, LedgerLookup, LedgerStatus, LedgerStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Service tag written into ledger entries for payout transactions.
pub const COMMISSION_SERVICE: &str = "commission";

const PAYMENT_PATH: &str = "/rest/payments/confirmMemberPayment";

/// Outcome of one payout attempt. Folded into the pipeline response and
/// the ledger finalization; never persisted on its own.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommissionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl CommissionResult {
    fn failure(message: &str, error: impl Into<String>, transaction_id: Option<String>) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            data: None,
            error: Some(error.into()),
            transaction_id,
        }
    }
}

/// Invokes the core-banking payment API and keeps the ledger honest about
/// the attempt.
pub struct CommissionInvoker {
    gateway: Arc<dyn Gateway>,
    ledger: Arc<dyn LedgerStore>,
    config: CommissionConfig,
}

impl CommissionInvoker {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        ledger: Arc<dyn LedgerStore>,
        config: CommissionConfig,
    ) -> Self {
        Self {
            gateway,
            ledger,
            config,
        }
    }

    /// Generate a payout for `agent_id`.
    ///
    /// The success check is deliberately lenient: any 2xx response counts,
    /// and a payload without the expected `id`/`pending` pair is logged as
    /// an unexpected format, not failed.
    pub async fn invoke(&self, agent_id: &str, agent_name: &str) -> CommissionResult {
        if agent_id.trim().is_empty() {
            warn!("missing agent id for commission generation");
            return CommissionResult::failure(
                "Agent id is required for commission generation",
                "MISSING_AGENT_ID",
                None,
            );
        }

        let transaction_id = Uuid::new_v4().to_string();

        let entry = LedgerAppend {
            transaction_id: Some(transaction_id.clone()),
            status: LedgerStatus::Pending,
            third_party_status: "pending".to_string(),
            description: format!("{} - initiating payment", self.config.description),
            amount: self.config.amount,
            customer_charge: 0,
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            service: COMMISSION_SERVICE.to_string(),
            reference: None,
            customer_id: agent_id.to_string(),
            token: None,
        };

        // No payout without an audit trail: a ledger outage aborts the
        // commission, not the submission that triggered it.
        let handle = match self.ledger.insert(entry).await {
            Ok(handle) => handle,
            Err(err) => {
                error!(%transaction_id, error = %err, "failed to open pending commission entry");
                return CommissionResult::failure(
                    "Failed to generate commission",
                    err.to_string(),
                    Some(transaction_id),
                );
            }
        };

        let payload = json!({
            "toMemberId": agent_id,
            "amount": self.config.amount.to_string(),
            "transferTypeId": self.config.transfer_type_id,
            "currencySymbol": self.config.currency_symbol,
            "description": self.config.description,
        });

        info!(
            %transaction_id,
            agent_id,
            amount = self.config.amount,
            transfer_type_id = %self.config.transfer_type_id,
            "generating agent commission"
        );

        match self.gateway.call(GatewayRequest::post(PAYMENT_PATH, payload)).await {
            Ok(body) => {
                let payment_id = text(body.get("id"));
                let pending_flag = body.get("pending").cloned();

                let finalize = if let (Some(id), Some(_)) = (&payment_id, &pending_flag) {
                    info!(%transaction_id, agent_id, payment_id = %id, "agent commission generated");
                    LedgerFinalize {
                        status: LedgerStatus::Success,
                        third_party_status: "successful".to_string(),
                        token: Some(id.clone()),
                        description: format!("Commission payment successful - payment id: {id}"),
                        assign_transaction_id: None,
                    }
                } else {
                    warn!(%transaction_id, agent_id, response = %body, "unexpected commission response format");
                    LedgerFinalize {
                        status: LedgerStatus::Success,
                        third_party_status: "success".to_string(),
                        token: payment_id.clone().or_else(|| Some(body.to_string())),
                        description: "Commission payment processed with unexpected response format"
                            .to_string(),
                        assign_transaction_id: None,
                    }
                };

                if let Err(err) = self
                    .ledger
                    .finalize(LedgerLookup::Handle(handle), finalize)
                    .await
                {
                    error!(%transaction_id, error = %err, "failed to finalize commission entry");
                }

                let data = match (&payment_id, &pending_flag) {
                    (Some(id), Some(pending)) => json!({"id": id, "pending": pending}),
                    _ => body,
                };

                CommissionResult {
                    success: true,
                    message: "Commission generated successfully".to_string(),
                    data: Some(data),
                    error: None,
                    transaction_id: Some(transaction_id),
                }
            }
            Err(err) => {
                let (third_party_status, description) = match &err {
                    GatewayError::AuthFailed => (
                        "auth_failed".to_string(),
                        format!("Authentication failed: {err}"),
                    ),
                    other => ("failed".to_string(), other.to_string()),
                };

                error!(%transaction_id, agent_id, error = %err, "error generating agent commission");

                let finalize = LedgerFinalize {
                    status: LedgerStatus::Failed,
                    third_party_status,
                    token: None,
                    description,
                    assign_transaction_id: None,
                };
                if let Err(ledger_err) = self
                    .ledger
                    .finalize(LedgerLookup::Handle(handle), finalize)
                    .await
                {
                    error!(%transaction_id, error = %ledger_err, "failed to finalize failed commission entry");
                }

                CommissionResult::failure(
                    "Failed to generate commission",
                    err.to_string(),
                    Some(transaction_id),
                )
            }
        }
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}
