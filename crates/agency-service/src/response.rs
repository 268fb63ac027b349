//! The structured response envelope.
//!
//! Every response carries a success flag and a message key for
//! localization; failure detail rides along in `error`. Callers never see
//! a raw stack trace.

use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "statusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub language: String,
}

impl Envelope {
    pub fn ok(message_key: impl Into<String>, data: Value, language: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message_key.into(),
            data: Some(data),
            status_code: None,
            error: None,
            language: language.into(),
        }
    }

    pub fn error(
        message_key: impl Into<String>,
        language: impl Into<String>,
        status: StatusCode,
        detail: Option<Value>,
    ) -> Self {
        Self {
            success: false,
            message: message_key.into(),
            data: None,
            status_code: Some(status.as_u16()),
            error: detail,
            language: language.into(),
        }
    }

    /// Error envelope with structured payload data (gate rejections carry
    /// limit/balance detail in `data`, not `error`).
    pub fn rejected(
        message_key: impl Into<String>,
        language: impl Into<String>,
        status: StatusCode,
        data: Value,
    ) -> Self {
        Self {
            success: false,
            message: message_key.into(),
            data: Some(data),
            status_code: Some(status.as_u16()),
            error: None,
            language: language.into(),
        }
    }
}
