//! Route handlers for the model API.
//!
//! - POST   /model/generate_response
//! - GET    /model/health
//! - GET    /model/variants
//! - POST   /model/setup
//! - GET    /model/setup
//! - DELETE /model/setup
//! - GET    /metrics

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::record::VariantStatus;
use crate::cache::variant::VariantId;
use crate::config::Config;
use crate::inference::coordinator::{CoordinatorError, InferenceCoordinator};
use crate::metrics::ServiceMetrics;
use crate::pipeline::job::SetupJob;
use crate::server::envelope::Envelope;

/// Application state shared across handlers.
pub struct AppState {
    pub coordinator: InferenceCoordinator,
    pub setup_job: SetupJob,
    pub metrics: ServiceMetrics,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Generation and describe share one pool of permits.
    let limit = GlobalConcurrencyLimitLayer::new(state.config.server.max_concurrent_requests.max(1));
    Router::new()
        .route(
            "/model/generate_response",
            post(generate_response).layer(limit.clone()),
        )
        .route("/model/health", get(health).layer(limit))
        .route("/model/variants", get(variants))
        .route(
            "/model/setup",
            post(start_setup).get(setup_status).delete(cancel_setup),
        )
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Inference request body. `json_input` is accepted for older clients.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default, alias = "json_input")]
    pub company_data_payload: Option<Value>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    pub model_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VariantsResponse {
    pub uptime_secs: u64,
    pub setup_running: bool,
    pub variants: Vec<VariantStatus>,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn generate_response(
    State(state): State<Arc<AppState>>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Envelope {
    let request_id = Uuid::new_v4().to_string();

    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => {
            warn!(request_id, error = %rejection, "Rejected request body");
            return Envelope::error(400, rejection.body_text());
        }
    };

    let variant = req
        .model_type
        .unwrap_or_else(|| state.config.model.default_variant.to_string());
    let max_tokens = match req.max_tokens {
        None => state.config.sampling.default_max_tokens,
        // Non-positive values are rejected by the coordinator as zero.
        Some(n) => usize::try_from(n).unwrap_or(0),
    };
    let Some(payload) = req.company_data_payload else {
        return CoordinatorError::Validation("company_data_payload is required".to_string()).into();
    };

    info!(request_id, model_type = %variant, max_tokens, "Generate request");

    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let result = tokio::time::timeout(
        timeout,
        state.coordinator.generate(payload, &variant, max_tokens),
    )
    .await;

    match result {
        Ok(Ok(result)) => {
            info!(request_id, processing_time = result.processing_time, "Generate request done");
            Envelope::ok("Response generated successfully", result)
        }
        Ok(Err(e)) => {
            warn!(request_id, error = %e, code = e.status_code(), "Generate request failed");
            e.into()
        }
        Err(_) => {
            warn!(request_id, timeout_secs = timeout.as_secs(), "Generate request timed out");
            let label = variant
                .parse::<VariantId>()
                .map(VariantId::as_str)
                .unwrap_or("unknown");
            state.metrics.record_request(label, "timeout");
            Envelope::error(
                504,
                format!("Request timed out after {}s", timeout.as_secs()),
            )
        }
    }
}

async fn health(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> Envelope {
    let variant = query
        .model_type
        .unwrap_or_else(|| state.config.model.default_variant.to_string());

    match state.coordinator.describe(&variant).await {
        Ok(desc) => Envelope::ok(format!("Model {variant} is ready"), desc),
        Err(e @ CoordinatorError::ModelUnavailable(_)) => Envelope::error(404, e.to_string()),
        Err(e) => e.into(),
    }
}

async fn variants(State(state): State<Arc<AppState>>) -> Envelope {
    let body = VariantsResponse {
        uptime_secs: state.start_time.elapsed().as_secs(),
        setup_running: state.setup_job.is_running(),
        variants: state.coordinator.cache().statuses().await,
    };
    Envelope::ok("Variant status", body)
}

async fn start_setup(State(state): State<Arc<AppState>>) -> Envelope {
    if state.setup_job.try_start().await {
        info!("Setup run started");
        Envelope::with_code(202, "Setup started", json!({}))
    } else {
        Envelope::error(409, "A setup run is already in progress")
    }
}

async fn setup_status(State(state): State<Arc<AppState>>) -> Envelope {
    let running = state.setup_job.is_running();
    match state.setup_job.last_run().await {
        Some(run) => {
            let message = match (&run.error, run.cancelled) {
                (Some(e), _) => e.to_string(),
                (None, true) => "Setup cancelled".to_string(),
                (None, false) => "Model setup completed successfully".to_string(),
            };
            Envelope::ok(message, json!({ "running": running, "last_run": run }))
        }
        None => Envelope::ok(
            if running { "Setup running" } else { "No setup run yet" },
            json!({ "running": running }),
        ),
    }
}

async fn cancel_setup(State(state): State<Arc<AppState>>) -> Envelope {
    if state.setup_job.cancel().await {
        Envelope::ok("Cancellation requested", json!({}))
    } else {
        Envelope::error(404, "No setup run in progress")
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
