//! REST API server for the advisory orchestrator
//!
//! Exposes advisory runs and the audit trail over HTTP

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, OrchestrationError};
use crate::models::AdvisoryRequest;
use crate::orchestrator::Orchestrator;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Taxonomy kind of the failure, if any
    pub kind: Option<ErrorKind>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            kind: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            kind: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn failure(error: &OrchestrationError) -> Self {
        Self {
            kind: Some(error.kind()),
            ..Self::error(error.to_string())
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ConfigurationError | ErrorKind::ArgumentMismatch | ErrorKind::InvalidInput => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::CapabilityFailure => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Advisory Endpoint
/// =============================

async fn run_advisory(
    State(state): State<ApiState>,
    Json(req): Json<AdvisoryRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    info!(profile = %req.profile.name, "Received advisory request");

    match state.orchestrator.run(req).await {
        Ok(result) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "report": result.report,
                "report_hash": result.report_hash,
                "audit_id": result.audit_id,
                "reasoning_trace": result.reasoning_trace,
            }))),
        ),
        Err(e) => {
            warn!(kind = %e.kind(), error = %e, "Advisory request failed");
            (status_for(e.kind()), Json(ApiResponse::failure(&e)))
        }
    }
}

/// =============================
/// Audit Endpoint
/// =============================

async fn get_audit_record(
    State(state): State<ApiState>,
    Path(audit_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let Ok(audit_id) = Uuid::parse_str(&audit_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!("Invalid audit id: {}", audit_id))),
        );
    };

    let audit_log = state.orchestrator.audit_log();
    match audit_log.get(audit_id).await {
        Ok(Some(record)) => match audit_log.verify_integrity(audit_id).await {
            Ok(verified) => (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({
                    "record": record,
                    "verified": verified,
                }))),
            ),
            Err(e) => {
                warn!(audit_id = %audit_id, error = %e, "Audit verification failed");
                (status_for(e.kind()), Json(ApiResponse::failure(&e)))
            }
        },
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("No audit record {}", audit_id))),
        ),
        Err(e) => (status_for(e.kind()), Json(ApiResponse::failure(&e))),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/advisory", post(run_advisory))
        .route("/api/v1/audit/:audit_id", get(get_audit_record))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::models::UserProfile;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let root = env!("CARGO_MANIFEST_DIR");
        let config = OrchestratorConfig {
            news_dir: format!("{}/demos/news_data", root),
            reports_dir: format!("{}/demos/reports_data", root),
            ..OrchestratorConfig::default()
        };
        create_router(Arc::new(Orchestrator::from_config(&config).unwrap()))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn advisory_request(request: &AdvisoryRequest) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/advisory")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(request).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_advisory_then_audit_lookup() {
        let app = router();

        let response = app
            .clone()
            .oneshot(advisory_request(&AdvisoryRequest::new(UserProfile::demo())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        let audit_id = body["data"]["audit_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/audit/{}", audit_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["verified"], true);
    }

    #[tokio::test]
    async fn test_invalid_profile_is_unprocessable() {
        let mut request = AdvisoryRequest::new(UserProfile::demo());
        request.profile.investment_amount = -5.0;

        let response = router().oneshot(advisory_request(&request)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = body_json(response).await;
        assert_eq!(body["kind"], "InvalidInput");
    }

    #[test]
    fn test_internal_failures_map_to_server_error() {
        let broken = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = OrchestrationError::from(broken);
        let response = ApiResponse::failure(&error);

        assert!(!response.success);
        assert_eq!(response.kind, Some(ErrorKind::Internal));
        assert_eq!(status_for(error.kind()), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_audit_id() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/audit/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
