//! REST surface
//!
//! Stable paths consumed by external collaborators. Validation failures
//! return `{"error": ...}` with 400; internal faults with 500.

pub mod routes;

use crate::config::Config;
use crate::ensemble::{BayesianRecalibrator, EnsembleEngine, WeightStore};
use crate::errors::CoreError;
use crate::gateway::session::SessionManager;
use crate::models::Outcome;
use crate::orders::OrderPipeline;
use crate::storage::TradeStore;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<TradeStore>,
    pub weights: Arc<WeightStore>,
    pub engine: Arc<EnsembleEngine>,
    pub pipeline: Arc<OrderPipeline>,
    pub session: Arc<SessionManager>,
    pub recalibrator: Arc<BayesianRecalibrator>,
    /// Freshly recorded outcomes flow to the recalibration loop.
    pub outcome_tx: mpsc::UnboundedSender<Outcome>,
}

/// JSON error envelope with the mapped status code
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/evaluate", post(routes::evaluate))
        .route("/outcome", post(routes::record_outcome))
        .route("/history", get(routes::history))
        .route("/stats", get(routes::stats))
        .route("/drift", get(routes::drift))
        .route("/calibration", get(routes::calibration))
        .route("/outcomes", get(routes::outcomes))
        .route("/weights", get(routes::get_weights).post(routes::patch_weights))
        .route("/weights/history", get(routes::weights_history))
        .route("/weights/simulate", post(routes::simulate_weights))
        .route("/walk-forward", post(routes::walk_forward))
        .route("/edge-metrics", post(routes::edge_metrics_handler))
        .route("/health", get(routes::health))
        .route("/orders", post(routes::place_order))
        .route("/orders/bracket", post(routes::place_bracket))
        .route("/orders/:order_id/modify", post(routes::modify_order))
        .route("/orders/:order_id/cancel", post(routes::cancel_order))
        .route("/orders/cancel-all", post(routes::cancel_all))
        .route("/flatten", post(routes::flatten))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
