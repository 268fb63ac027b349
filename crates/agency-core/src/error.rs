use serde_json::Value;
use thiserror::Error;

/// Classified failure from a call through an external gateway.
///
/// The classification is the whole contract: callers branch on the
/// variant, never on transport details.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("upstream authentication failed")]
    AuthFailed,

    #[error("upstream resource not found")]
    NotFound,

    #[error("upstream rejected the request")]
    BadRequest { detail: Option<Value> },

    #[error("upstream service unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected upstream error: {0}")]
    Unknown(String),
}

/// Failure surfaced by the submission pipeline.
///
/// Only validation and the external collector call can fail a run; every
/// other step degrades gracefully.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("missing required field `{field}`")]
    Validation {
        message_key: &'static str,
        field: &'static str,
    },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("internal pipeline error: {0}")]
    Internal(String),
}
