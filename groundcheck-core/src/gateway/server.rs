//! HTTP gateway server built on axum.

use super::auth::GatewayAuth;
use crate::config::ServerConfig;
use crate::error::AnalysisError;
use crate::orchestrator::AnalysisOrchestrator;
use crate::types::AnalysisRequest;
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Thread-safe shared gateway reference for axum handlers.
pub type SharedGateway = Arc<GatewayServer>;

/// JSON body returned for every non-2xx response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// The HTTP gateway.
pub struct GatewayServer {
    config: ServerConfig,
    auth: GatewayAuth,
    orchestrator: AnalysisOrchestrator,
    started_at: chrono::DateTime<Utc>,
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("config", &self.config)
            .field("model", &self.orchestrator.model_name())
            .field("retriever", &self.orchestrator.retriever().name())
            .finish()
    }
}

impl GatewayServer {
    pub fn new(config: ServerConfig, orchestrator: AnalysisOrchestrator) -> Self {
        let auth = GatewayAuth::from_config(&config);
        Self {
            config,
            auth,
            orchestrator,
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn auth(&self) -> &GatewayAuth {
        &self.auth
    }

    pub fn orchestrator(&self) -> &AnalysisOrchestrator {
        &self.orchestrator
    }

    /// Uptime in seconds since the server was created.
    pub fn uptime_secs(&self) -> u64 {
        let elapsed = Utc::now() - self.started_at;
        elapsed.num_seconds().max(0) as u64
    }
}

fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: error.to_string(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for AnalysisError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AnalysisError::InvalidInput { .. } => (StatusCode::BAD_REQUEST, "invalid_input"),
            AnalysisError::SegmentationFailed { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "segmentation_failed")
            }
            AnalysisError::DeadlineExceeded { .. } => {
                (StatusCode::GATEWAY_TIMEOUT, "deadline_exceeded")
            }
            AnalysisError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
        };
        error_response(status, code, self.to_string())
    }
}

/// Build an axum Router with the analysis, health, and banner routes.
pub fn router(shared: SharedGateway) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/aiqa/analysis/analyze", post(analyze_handler))
        .with_state(shared)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "groundcheck",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["POST /aiqa/analysis/analyze", "GET /health"],
    }))
}

/// Health check endpoint. Always 200; retriever trouble shows as `degraded`.
async fn health_handler(State(gw): State<SharedGateway>) -> impl IntoResponse {
    let retriever = gw.orchestrator().retriever();
    let (status, retriever_status) = match retriever.health_check().await {
        Ok(()) => ("ok", serde_json::json!({ "name": retriever.name(), "status": "ok" })),
        Err(e) => {
            warn!(retriever = %retriever.name(), error = %e, "Retriever health check failed");
            (
                "degraded",
                serde_json::json!({
                    "name": retriever.name(),
                    "status": "unavailable",
                    "error": e.to_string(),
                }),
            )
        }
    };
    Json(serde_json::json!({
        "status": status,
        "model": gw.orchestrator().model_name(),
        "retriever": retriever_status,
        "uptime_secs": gw.uptime_secs(),
    }))
}

/// Run one analysis. The client disconnecting drops this future, which
/// cancels the in-flight thread pipelines.
///
/// The token is checked before the body, so unauthenticated callers never
/// see parse errors.
async fn analyze_handler(
    State(gw): State<SharedGateway>,
    headers: HeaderMap,
    body: Result<Json<AnalysisRequest>, JsonRejection>,
) -> Response {
    if !gw.auth().authorize(&headers) {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid API token",
        );
    }
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return rejection.into_response(),
    };
    match gw.orchestrator().analyze(&request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Start the gateway on the configured address.
///
/// This is an async function that runs until cancelled.
pub async fn run(gw: SharedGateway) -> Result<(), std::io::Error> {
    let addr = format!("{}:{}", gw.config().host, gw.config().port);
    if gw.auth().is_open_mode() {
        warn!("No auth tokens configured; the analysis endpoint is open");
    }
    let app = router(gw);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
