//! Explicit configuration for the service.
//!
//! One `AgencyConfig` is built at process start and passed by reference
//! into each component. Business logic never reads the process
//! environment.

use std::time::Duration;

/// Static credential attached to every request through a gateway.
#[derive(Debug, Clone)]
pub enum Credential {
    /// `X-API-Key` header value.
    ApiKey(String),
    /// HTTP basic authentication pair.
    Basic { username: String, password: String },
}

/// One outbound endpoint: base URL, fixed credential, bounded timeout.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub base_url: String,
    pub credential: Credential,
    pub timeout: Duration,
}

impl EndpointConfig {
    /// Data-collection endpoint. Collector calls tolerate slow uploads.
    pub fn collector(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            credential: Credential::ApiKey(api_key.into()),
            timeout: Duration::from_secs(30),
        }
    }

    /// Core-banking payments endpoint. Financial calls fail fast.
    pub fn payments(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            credential: Credential::Basic {
                username: username.into(),
                password: password.into(),
            },
            timeout: Duration::from_secs(10),
        }
    }
}

/// Commission payout policy.
#[derive(Debug, Clone)]
pub struct CommissionConfig {
    /// Amount in minor currency units.
    pub amount: i64,
    pub transfer_type_id: String,
    pub currency_symbol: String,
    pub description: String,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            amount: 500,
            transfer_type_id: "178".to_string(),
            currency_symbol: "Rwf".to_string(),
            description: "Commission payment to agent".to_string(),
        }
    }
}

/// Thresholds for the pre-submission gates.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Maximum `submitted` rows per (form, agent) before rejecting.
    pub submission_limit: u64,
    /// Minimum account balance required to accept a submission, in minor
    /// currency units.
    pub minimum_balance: i64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            submission_limit: 10,
            minimum_balance: 500,
        }
    }
}

/// Full service configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AgencyConfig {
    pub collector: EndpointConfig,
    pub payments: EndpointConfig,
    pub commission: CommissionConfig,
    pub gates: GateConfig,
    pub user_agent: String,
}

impl AgencyConfig {
    pub fn new(collector: EndpointConfig, payments: EndpointConfig) -> Self {
        Self {
            collector,
            payments,
            commission: CommissionConfig::default(),
            gates: GateConfig::default(),
            user_agent: "Agency-DataCollection-Service/1.0".to_string(),
        }
    }
}
