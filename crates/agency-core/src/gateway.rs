//! Generic client for the external REST collaborators.
//!
//! The client attaches the endpoint's static credential, a bounded
//! timeout, and the caller's language tag, and classifies failures into a
//! small taxonomy. It does not retry, log, or persist; those are caller
//! policies.

use crate::config::{Credential, EndpointConfig};
use crate::error::GatewayError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMethod {
    Get,
    Post,
}

/// One outbound request through a gateway.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: GatewayMethod,
    pub path: String,
    pub payload: Option<Value>,
    /// Caller-supplied bearer credential forwarded upstream, on top of
    /// the endpoint's own static credential.
    pub bearer: Option<String>,
    pub language: Option<String>,
}

impl GatewayRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: GatewayMethod::Get,
            path: path.into(),
            payload: None,
            bearer: None,
            language: None,
        }
    }

    pub fn post(path: impl Into<String>, payload: Value) -> Self {
        Self {
            method: GatewayMethod::Post,
            path: path.into(),
            payload: Some(payload),
            bearer: None,
            language: None,
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Seam for outbound REST calls, mockable in tests.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn call(&self, request: GatewayRequest) -> Result<Value, GatewayError>;
}

/// reqwest-backed gateway bound to one endpoint configuration.
pub struct HttpGateway {
    client: reqwest::Client,
    config: EndpointConfig,
    user_agent: String,
}

impl HttpGateway {
    pub fn new(config: EndpointConfig, user_agent: impl Into<String>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Unknown(e.to_string()))?;
        Ok(Self {
            client,
            config,
            user_agent: user_agent.into(),
        })
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn call(&self, request: GatewayRequest) -> Result<Value, GatewayError> {
        let url = format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            request.path
        );

        let mut builder = match request.method {
            GatewayMethod::Get => self.client.get(&url),
            GatewayMethod::Post => self.client.post(&url),
        };

        builder = builder
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, &self.user_agent);

        builder = match &self.config.credential {
            Credential::ApiKey(key) => builder.header("X-API-Key", key),
            Credential::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
        };

        if let Some(language) = &request.language {
            builder = builder.header(reqwest::header::ACCEPT_LANGUAGE, language);
        }
        if let Some(bearer) = &request.bearer {
            builder = builder.bearer_auth(bearer);
        }
        if let Some(payload) = &request.payload {
            builder = builder.json(payload);
        }

        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();
        let body = response.json::<Value>().await.ok();

        if status.is_success() {
            return Ok(body.unwrap_or(Value::Null));
        }
        Err(classify_status(status, body))
    }
}

fn classify_transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() || err.is_connect() {
        return GatewayError::Unavailable(err.to_string());
    }
    GatewayError::Unknown(err.to_string())
}

fn classify_status(status: StatusCode, body: Option<Value>) -> GatewayError {
    // Some upstreams report credential problems with a 4xx body code
    // instead of a 401 status.
    let invalid_credentials = body
        .as_ref()
        .and_then(|b| b.get("errorCode"))
        .and_then(Value::as_str)
        == Some("INVALID_CREDENTIALS");

    match status {
        StatusCode::UNAUTHORIZED => GatewayError::AuthFailed,
        _ if invalid_credentials => GatewayError::AuthFailed,
        StatusCode::NOT_FOUND => GatewayError::NotFound,
        StatusCode::BAD_REQUEST => GatewayError::BadRequest {
            detail: body.as_ref().and_then(|b| b.get("details")).cloned(),
        },
        _ => GatewayError::Unknown(format!(
            "upstream returned {}: {}",
            status,
            body.unwrap_or(Value::Null)
        )),
    }
}
