//! Pre-submission gates.
//!
//! Both gates choose availability over strictness: when their own
//! infrastructure fails they let the request through instead of blocking
//! it. Only a definite negative answer rejects.

use agency_core::{Gateway, GatewayError, GatewayRequest};
use agency_storage::SubmissionStore;
use axum::http::StatusCode;
use serde_json::{json, Value};
use tracing::{error, info, warn};

const ACCOUNT_STATUS_PATH: &str = "/rest/accounts/default/status";

/// Outcome of one gate check.
#[derive(Debug)]
pub enum GateDecision {
    Allow,
    Reject {
        status: StatusCode,
        message_key: &'static str,
        data: Value,
    },
}

/// Reject when the service account balance is below `minimum_balance`.
///
/// Fails open on any gateway failure other than a definite credential
/// problem.
pub async fn check_account_balance(payments: &dyn Gateway, minimum_balance: i64) -> GateDecision {
    match payments.call(GatewayRequest::get(ACCOUNT_STATUS_PATH)).await {
        Ok(body) => {
            let balance = body
                .get("availableBalance")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let minimum = minimum_balance as f64;
            info!(balance, minimum, sufficient = balance >= minimum, "account balance check");

            if balance < minimum {
                warn!(balance, minimum, "insufficient account balance");
                return GateDecision::Reject {
                    status: StatusCode::BAD_REQUEST,
                    message_key: "data_collection.insufficient_balance",
                    data: json!({
                        "currentBalance": balance,
                        "minimumRequired": minimum_balance,
                        "deficit": minimum - balance,
                    }),
                };
            }
            GateDecision::Allow
        }
        Err(GatewayError::AuthFailed) => {
            error!("account authentication failed during balance check");
            GateDecision::Reject {
                status: StatusCode::UNAUTHORIZED,
                message_key: "data_collection.authentication_failed",
                data: Value::Null,
            }
        }
        Err(err) => {
            error!(error = %err, "error checking account balance");
            GateDecision::Allow
        }
    }
}

/// Reject when the agent already has `submission_limit` submitted rows
/// for this form. Fails open on storage failure.
pub async fn check_submission_limit(
    records: &dyn SubmissionStore,
    form_id: &str,
    agent_id: &str,
    submission_limit: u64,
) -> GateDecision {
    match records.count_submitted(form_id, agent_id).await {
        Ok(count) => {
            info!(form_id, agent_id, current_submissions = count, limit = submission_limit, "form submission limit check");
            if count >= submission_limit {
                warn!(form_id, agent_id, current_submissions = count, "form submission limit exceeded");
                return GateDecision::Reject {
                    status: StatusCode::TOO_MANY_REQUESTS,
                    message_key: "data_collection.submission_limit_reached",
                    // The advertised limit differs from the enforced
                    // threshold; both literals are kept as-is.
                    data: json!({
                        "limit": 5,
                        "currentSubmissions": count,
                        "formId": form_id,
                    }),
                };
            }
            GateDecision::Allow
        }
        Err(err) => {
            error!(error = %err, "error checking form submission limit");
            GateDecision::Allow
        }
    }
}
