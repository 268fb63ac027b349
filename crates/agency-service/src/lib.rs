//! REST surface for the agency data-collection service.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod auth;
pub mod gates;
pub mod response;

use agency_core::{
    AgencyConfig, AgentIdentity, CommissionInvoker, GateConfig, Gateway, GatewayError,
    GatewayRequest, HttpGateway, SubmissionOutcome, SubmissionPipeline, SubmitError,
    SubmitRequest,
};
use agency_storage::{LedgerStore, SubmissionStore};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gates::GateDecision;
use response::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<SubmissionPipeline>,
    collector: Arc<dyn Gateway>,
    payments: Arc<dyn Gateway>,
    records: Arc<dyn SubmissionStore>,
    gates: GateConfig,
    storage_backend: &'static str,
}

impl AppState {
    /// Wire live gateways from the configuration.
    pub fn new(
        config: &AgencyConfig,
        ledger: Arc<dyn LedgerStore>,
        records: Arc<dyn SubmissionStore>,
        storage_backend: &'static str,
    ) -> Result<Self, GatewayError> {
        let collector: Arc<dyn Gateway> = Arc::new(HttpGateway::new(
            config.collector.clone(),
            config.user_agent.clone(),
        )?);
        let payments: Arc<dyn Gateway> = Arc::new(HttpGateway::new(
            config.payments.clone(),
            config.user_agent.clone(),
        )?);
        Ok(Self::with_gateways(
            config,
            collector,
            payments,
            ledger,
            records,
            storage_backend,
        ))
    }

    /// Wire explicit gateways; used by tests and alternative transports.
    pub fn with_gateways(
        config: &AgencyConfig,
        collector: Arc<dyn Gateway>,
        payments: Arc<dyn Gateway>,
        ledger: Arc<dyn LedgerStore>,
        records: Arc<dyn SubmissionStore>,
        storage_backend: &'static str,
    ) -> Self {
        let commission = CommissionInvoker::new(
            payments.clone(),
            ledger.clone(),
            config.commission.clone(),
        );
        let pipeline = Arc::new(SubmissionPipeline::new(
            collector.clone(),
            ledger,
            records.clone(),
            commission,
        ));
        Self {
            pipeline,
            collector,
            payments,
            records,
            gates: config.gates.clone(),
            storage_backend,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/external/forms", get(get_external_forms))
        .route("/external/forms/:form_id/submit", post(submit_form))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Envelope-carrying error returned by every handler.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    envelope: Envelope,
}

impl ApiError {
    fn new(
        status: StatusCode,
        message_key: &'static str,
        language: &str,
        detail: Option<Value>,
    ) -> Self {
        Self {
            status,
            envelope: Envelope::error(message_key, language, status, detail),
        }
    }

    fn rejected(status: StatusCode, message_key: &'static str, language: &str, data: Value) -> Self {
        let envelope = if data.is_null() {
            Envelope::error(message_key, language, status, None)
        } else {
            Envelope::rejected(message_key, language, status, data)
        };
        Self { status, envelope }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "agency-service",
        storage_backend: state.storage_backend,
    })
}

async fn get_external_forms(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Envelope>, ApiError> {
    let language = language_from(&headers);
    tracing::info!(%language, "fetching external forms");

    match state
        .collector
        .call(GatewayRequest::get("/external/forms").with_language(language.clone()))
        .await
    {
        Ok(body) => Ok(Json(Envelope::ok(
            "data_collection.forms_retrieved_successfully",
            body,
            language,
        ))),
        Err(GatewayError::AuthFailed) => Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "data_collection.authentication_failed",
            &language,
            None,
        )),
        Err(GatewayError::NotFound) => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "data_collection.forms_not_found",
            &language,
            None,
        )),
        Err(GatewayError::Unavailable(_)) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "data_collection.service_unavailable",
            &language,
            None,
        )),
        Err(err) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "common.server_error",
            &language,
            Some(json!({"error": err.to_string()})),
        )),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SubmitBody {
    data: Option<Value>,
    status: Option<String>,
}

async fn submit_form(
    State(state): State<AppState>,
    Path(form_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<SubmitBody>>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let language = language_from(&headers);

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let Some(token) = auth::bearer_token(auth_header) else {
        warn!("missing authorization token");
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "auth.missing_token",
            &language,
            None,
        ));
    };
    let Some(claims) = auth::decode_claims(token) else {
        warn!("invalid or malformed token");
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "auth.invalid_token",
            &language,
            None,
        ));
    };
    let Some(agent_id) = claims.id.clone() else {
        warn!("unable to extract agent id from token");
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "auth.unidentified_agent",
            &language,
            None,
        ));
    };

    match gates::check_account_balance(state.payments.as_ref(), state.gates.minimum_balance).await
    {
        GateDecision::Allow => {}
        GateDecision::Reject {
            status,
            message_key,
            data,
        } => return Err(ApiError::rejected(status, message_key, &language, data)),
    }
    match gates::check_submission_limit(
        state.records.as_ref(),
        &form_id,
        &agent_id,
        state.gates.submission_limit,
    )
    .await
    {
        GateDecision::Allow => {}
        GateDecision::Reject {
            status,
            message_key,
            data,
        } => return Err(ApiError::rejected(status, message_key, &language, data)),
    }

    let body = body.map(|Json(body)| body).unwrap_or_default();
    let request = SubmitRequest {
        form_id,
        data: body.data,
        forwarded_status: body.status,
        bearer_token: token.to_string(),
        language: language.clone(),
        agent: AgentIdentity {
            id: agent_id,
            name: claims.agent_name(),
        },
    };

    match state.pipeline.submit(request).await {
        Ok(outcome) => Ok((
            StatusCode::CREATED,
            Json(Envelope::ok(
                "data_collection.form_submitted_successfully",
                compose_submission_data(outcome),
                language,
            )),
        )),
        Err(err) => Err(map_submit_error(err, &language)),
    }
}

fn compose_submission_data(outcome: SubmissionOutcome) -> Value {
    let mut map = match outcome.response {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("response".to_string(), other);
            map
        }
    };
    map.insert("dbId".to_string(), json!(outcome.record_id));
    map.insert("status".to_string(), json!(outcome.status));
    map.insert(
        "commission".to_string(),
        serde_json::to_value(&outcome.commission).unwrap_or(Value::Null),
    );
    Value::Object(map)
}

fn map_submit_error(err: SubmitError, language: &str) -> ApiError {
    match err {
        SubmitError::Validation { message_key, field } => ApiError::new(
            StatusCode::BAD_REQUEST,
            message_key,
            language,
            Some(json!({"missingFields": [field]})),
        ),
        SubmitError::Gateway(GatewayError::BadRequest { detail }) => ApiError::new(
            StatusCode::BAD_REQUEST,
            "data_collection.invalid_form_data",
            language,
            detail.map(|detail| json!({"details": detail})),
        ),
        SubmitError::Gateway(GatewayError::AuthFailed) => ApiError::new(
            StatusCode::UNAUTHORIZED,
            "data_collection.authentication_failed",
            language,
            None,
        ),
        SubmitError::Gateway(GatewayError::Unavailable(_)) => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "data_collection.service_unavailable",
            language,
            None,
        ),
        SubmitError::Gateway(err) => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "common.server_error",
            language,
            Some(json!({"error": err.to_string()})),
        ),
        SubmitError::Internal(message) => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "common.server_error",
            language,
            Some(json!({"error": message})),
        ),
    }
}

fn language_from(headers: &HeaderMap) -> String {
    headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "en".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agency_storage::memory::InMemoryStorage;
    use agency_storage::{ExternalSync, NewSubmission};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const BALANCE_PATH: &str = "/rest/accounts/default/status";
    const PAYMENT_PATH: &str = "/rest/payments/confirmMemberPayment";

    struct RoutedGateway {
        routes: HashMap<String, Result<Value, GatewayError>>,
        calls: AtomicUsize,
    }

    impl RoutedGateway {
        fn new(routes: Vec<(&str, Result<Value, GatewayError>)>) -> Arc<Self> {
            Arc::new(Self {
                routes: routes
                    .into_iter()
                    .map(|(path, response)| (path.to_string(), response))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Gateway for RoutedGateway {
        async fn call(&self, request: GatewayRequest) -> Result<Value, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.routes
                .get(&request.path)
                .cloned()
                .unwrap_or_else(|| Err(GatewayError::NotFound))
        }
    }

    fn collector_success_body() -> Value {
        json!({"submission": {"status": "approved", "_id": "sub1"}})
    }

    fn healthy_payments() -> Arc<RoutedGateway> {
        RoutedGateway::new(vec![
            (BALANCE_PATH, Ok(json!({"availableBalance": 22500}))),
            (PAYMENT_PATH, Ok(json!({"id": 7, "pending": false}))),
        ])
    }

    fn test_state(
        collector: Arc<RoutedGateway>,
        payments: Arc<RoutedGateway>,
    ) -> (AppState, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let config = AgencyConfig::new(
            agency_core::EndpointConfig::collector("http://collector.test", "key"),
            agency_core::EndpointConfig::payments("http://payments.test", "user", "pass"),
        );
        let state = AppState::with_gateways(
            &config,
            collector,
            payments,
            storage.clone(),
            storage.clone(),
            "memory",
        );
        (state, storage)
    }

    fn token() -> String {
        auth::encode_token(&json!({"id": "agent-9", "name": "Agent Nine"}))
    }

    fn submit_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/external/forms/f1/submit")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", token()))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn successful_submission_returns_created_envelope() {
        let collector = RoutedGateway::new(vec![(
            "/external/forms/f1/submit",
            Ok(collector_success_body()),
        )]);
        let (state, storage) = test_state(collector, healthy_payments());
        let app = build_router(state);

        let response = app
            .oneshot(submit_request(json!({"data": {"name": "x"}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = body_json(response).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(
            body["message"],
            json!("data_collection.form_submitted_successfully")
        );
        assert_eq!(body["data"]["status"], json!("processing"));
        assert!(body["data"]["dbId"].is_number());
        assert_eq!(body["data"]["commission"]["success"], json!(true));

        let records = storage.submissions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].submission_id.as_deref(), Some("sub1"));
    }

    #[tokio::test]
    async fn missing_data_returns_validation_envelope() {
        let collector = RoutedGateway::new(vec![(
            "/external/forms/f1/submit",
            Ok(collector_success_body()),
        )]);
        let (state, storage) = test_state(collector.clone(), healthy_payments());
        let app = build_router(state);

        let response = app
            .oneshot(submit_request(json!({"status": "submitted"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["message"], json!("validation.missing_form_fields"));
        assert_eq!(body["error"]["missingFields"], json!(["data"]));

        // Fast-fail: nothing was written and the collector was never hit.
        assert!(storage.submissions().is_empty());
        assert_eq!(
            collector.calls.load(Ordering::SeqCst),
            0,
            "collector must not be called on validation failure"
        );
    }

    #[tokio::test]
    async fn collector_outage_maps_to_service_unavailable() {
        let collector = RoutedGateway::new(vec![(
            "/external/forms/f1/submit",
            Err(GatewayError::Unavailable("timed out".to_string())),
        )]);
        let (state, _storage) = test_state(collector, healthy_payments());
        let app = build_router(state);

        let response = app
            .oneshot(submit_request(json!({"data": {"name": "x"}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["message"], json!("data_collection.service_unavailable"));
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let collector = RoutedGateway::new(vec![]);
        let (state, _storage) = test_state(collector, healthy_payments());
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/external/forms/f1/submit")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"data": {}}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = body_json(response).await;
        assert_eq!(body["message"], json!("auth.missing_token"));
    }

    #[tokio::test]
    async fn insufficient_balance_blocks_before_the_collector() {
        let collector = RoutedGateway::new(vec![(
            "/external/forms/f1/submit",
            Ok(collector_success_body()),
        )]);
        let payments = RoutedGateway::new(vec![
            (BALANCE_PATH, Ok(json!({"availableBalance": 120}))),
            (PAYMENT_PATH, Ok(json!({"id": 7, "pending": false}))),
        ]);
        let (state, _storage) = test_state(collector.clone(), payments);
        let app = build_router(state);

        let response = app
            .oneshot(submit_request(json!({"data": {"name": "x"}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["message"], json!("data_collection.insufficient_balance"));
        assert_eq!(body["data"]["minimumRequired"], json!(500));
        assert_eq!(collector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn balance_gate_outage_fails_open() {
        let collector = RoutedGateway::new(vec![(
            "/external/forms/f1/submit",
            Ok(collector_success_body()),
        )]);
        let payments = RoutedGateway::new(vec![
            (
                BALANCE_PATH,
                Err(GatewayError::Unavailable("down".to_string())),
            ),
            (PAYMENT_PATH, Ok(json!({"id": 7, "pending": false}))),
        ]);
        let (state, _storage) = test_state(collector, payments);
        let app = build_router(state);

        let response = app
            .oneshot(submit_request(json!({"data": {"name": "x"}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn submission_quota_rejects_with_too_many_requests() {
        let collector = RoutedGateway::new(vec![(
            "/external/forms/f1/submit",
            Ok(collector_success_body()),
        )]);
        let (state, storage) = test_state(collector, healthy_payments());

        for _ in 0..10 {
            let handle = storage
                .create(NewSubmission {
                    form_id: "f1".to_string(),
                    agent_id: "agent-9".to_string(),
                    customer_id: "agent-9".to_string(),
                    payload: json!({}),
                })
                .await
                .unwrap();
            storage
                .reconcile(
                    &handle,
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
        }

        let app = build_router(state);
        let response = app
            .oneshot(submit_request(json!({"data": {"name": "x"}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = body_json(response).await;
        assert_eq!(
            body["message"],
            json!("data_collection.submission_limit_reached")
        );
        assert_eq!(body["data"]["currentSubmissions"], json!(10));
    }

    #[tokio::test]
    async fn forms_proxy_maps_upstream_not_found() {
        let collector = RoutedGateway::new(vec![("/external/forms", Err(GatewayError::NotFound))]);
        let (state, _storage) = test_state(collector, healthy_payments());
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/external/forms")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["message"], json!("data_collection.forms_not_found"));
    }

    #[tokio::test]
    async fn forms_proxy_passes_the_body_through() {
        let collector = RoutedGateway::new(vec![(
            "/external/forms",
            Ok(json!({"forms": [{"id": "f1", "title": "Census"}]})),
        )]);
        let (state, _storage) = test_state(collector, healthy_payments());
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/external/forms")
                    .header("accept-language", "fr-FR,fr;q=0.9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["language"], json!("fr-FR"));
        assert_eq!(body["data"]["forms"][0]["id"], json!("f1"));
    }

    #[tokio::test]
    async fn health_reports_the_storage_backend() {
        let (state, _storage) = test_state(RoutedGateway::new(vec![]), healthy_payments());
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["storage_backend"], json!("memory"));
    }
}
