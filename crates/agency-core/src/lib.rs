//! Core orchestration for the agency data-collection service.
//!
//! The center of this crate is the submission pipeline: validate, open a
//! pending ledger entry and a local record, relay the payload to the
//! external collector, reconcile local state, trigger the commission
//! payout, finalize the ledger. Each secondary effect is isolated behind
//! its own `Result` so one slow or broken collaborator cannot change the
//! primary outcome.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod commission;
pub mod config;
mod error;
pub mod gateway;
pub mod pipeline;
mod stage;

pub use commission::{CommissionInvoker, CommissionResult};
pub use config::{AgencyConfig, CommissionConfig, Credential, EndpointConfig, GateConfig};
pub use error::{GatewayError, SubmitError};
pub use gateway::{Gateway, GatewayMethod, GatewayRequest, HttpGateway};
pub use pipeline::{AgentIdentity, SubmissionOutcome, SubmissionPipeline, SubmitRequest};
pub use stage::{SubmitStage, SubmitStageMachine};
