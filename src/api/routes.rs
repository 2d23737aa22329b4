//! API route handlers
//!
//! Thin translation between JSON request shapes and the core components.
//! All real logic lives in the components; handlers validate, call, and
//! shape the response.

use crate::analytics::{
    bootstrap_cis, detect_drift, edge_metrics, feature_attribution, monte_carlo_drawdown,
    rolling_metrics, run_walk_forward, WalkForwardConfig,
};
use crate::api::{ApiError, AppState};
use crate::ensemble::scorer::{score_ensemble, ProviderScore};
use crate::ensemble::ScoringRequest;
use crate::models::{
    DecisionType, Direction, Evaluation, FeatureVector, ModelOutput, Outcome, ProviderId, Regime,
};
use crate::orders::{BracketIntent, OrderChanges, OrderIntent, PlaceResult};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

const DEFAULT_BOOTSTRAP_SEED: u64 = 20240214;

// -------------------------------------------------------------------------
// Evaluate
// -------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub symbol: String,
    pub direction: String,
    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub features: Option<FeatureVector>,
}

#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    pub evaluation: Evaluation,
    pub model_outputs: Vec<ModelOutput>,
    pub latencies_ms: HashMap<ProviderId, i64>,
}

pub async fn evaluate(
    State(state): State<AppState>,
    Json(request): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, ApiError> {
    let direction = Direction::parse(&request.direction)
        .ok_or_else(|| ApiError::bad_request("direction must be long or short"))?;

    let (evaluation, model_outputs) = state
        .engine
        .evaluate(ScoringRequest {
            symbol: request.symbol,
            direction,
            entry_price: request.entry_price,
            stop_price: request.stop_price,
            features: request.features.unwrap_or_default(),
        })
        .await?;

    let latencies_ms = model_outputs
        .iter()
        .map(|output| (output.provider, output.latency_ms))
        .collect();
    Ok(Json(EvaluateResponse {
        evaluation,
        model_outputs,
        latencies_ms,
    }))
}

// -------------------------------------------------------------------------
// Outcomes
// -------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OutcomeRequest {
    pub evaluation_id: String,
    pub trade_taken: bool,
    #[serde(default)]
    pub decision_type: Option<String>,
    pub actual_entry: Option<f64>,
    pub actual_exit: Option<f64>,
    pub r_multiple: Option<f64>,
    pub exit_reason: Option<String>,
}

pub async fn record_outcome(
    State(state): State<AppState>,
    Json(request): Json<OutcomeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state
        .store
        .get_evaluation(&request.evaluation_id)?
        .is_none()
    {
        return Err(ApiError::bad_request(format!(
            "unknown evaluation {}",
            request.evaluation_id
        )));
    }

    let decision_type = match request.decision_type.as_deref() {
        Some(raw) => DecisionType::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("unknown decision type {raw}")))?,
        None if request.trade_taken => DecisionType::TookTrade,
        None => DecisionType::PassedSetup,
    };

    let outcome = Outcome {
        evaluation_id: request.evaluation_id.clone(),
        trade_taken: request.trade_taken,
        decision_type,
        actual_entry: request.actual_entry,
        actual_exit: request.actual_exit,
        r_multiple: request.r_multiple,
        exit_reason: request.exit_reason,
        recorded_at: Utc::now(),
    };

    let inserted = state.store.insert_outcome(&outcome)?;
    if inserted {
        let _ = state.outcome_tx.send(outcome);
    }
    Ok(Json(json!({
        "evaluation_id": request.evaluation_id,
        "recorded": inserted,
    })))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

pub async fn outcomes(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcomes = state
        .store
        .get_recent_outcomes(params.limit.unwrap_or(100))?;
    Ok(Json(json!({
        "count": outcomes.len(),
        "outcomes": outcomes,
    })))
}

// -------------------------------------------------------------------------
// History & stats
// -------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub evaluation: Evaluation,
    pub outcome: Option<Outcome>,
}

pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let evaluations = state
        .store
        .get_recent_evaluations(params.limit.unwrap_or(50))?;
    let mut entries = Vec::with_capacity(evaluations.len());
    for evaluation in evaluations {
        let outcome = state.store.get_outcome_for_eval(&evaluation.id)?;
        entries.push(HistoryEntry {
            evaluation,
            outcome,
        });
    }
    Ok(Json(json!({
        "count": entries.len(),
        "history": entries,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub seed: Option<u64>,
}

pub async fn stats(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rs = realized_rs(&state, 500)?;
    let seed = params.seed.unwrap_or(DEFAULT_BOOTSTRAP_SEED);
    let rolling = rolling_metrics(&rs);
    let bootstrap = bootstrap_cis(&rs, seed);
    let monte_carlo = monte_carlo_drawdown(&rs, seed);

    let records = state.store.get_evals_for_simulation(90, None)?;
    let samples: Vec<(HashMap<String, f64>, f64)> = records
        .iter()
        .filter_map(|record| {
            let outcome = record.outcome.as_ref()?;
            if !outcome.trade_taken {
                return None;
            }
            let r = outcome.r_multiple?;
            let features = record
                .evaluation
                .features
                .numeric_features()
                .into_iter()
                .filter_map(|(name, value)| value.map(|v| (name.to_string(), v)))
                .collect();
            Some((features, r))
        })
        .collect();
    let attribution = feature_attribution(&samples);

    Ok(Json(json!({
        "trades": rs.len(),
        "rolling": rolling,
        "bootstrap": bootstrap,
        "monte_carlo": monte_carlo,
        "attribution": attribution,
    })))
}

fn realized_rs(state: &AppState, limit: usize) -> Result<Vec<f64>, ApiError> {
    // Chronological order: the store returns newest first.
    let mut outcomes = state.store.get_recent_outcomes(limit)?;
    outcomes.reverse();
    Ok(outcomes
        .iter()
        .filter(|o| o.trade_taken)
        .filter_map(|o| o.r_multiple)
        .collect())
}

// -------------------------------------------------------------------------
// Drift & calibration
// -------------------------------------------------------------------------

pub async fn drift(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let rows = state.store.get_model_outcomes_for_drift(30)?;
    let rs = realized_rs(&state, 500)?;
    let report = detect_drift(&rows, &rs, state.config.drift.calibration_threshold);
    Ok(Json(serde_json::to_value(report).unwrap_or_default()))
}

pub async fn calibration(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut regimes = serde_json::Map::new();
    for regime in Regime::ALL {
        let mut providers = serde_json::Map::new();
        for provider in ProviderId::ALL {
            let prior = state.recalibrator.prior(regime, provider);
            providers.insert(
                provider.as_str().to_string(),
                json!({
                    "correct": prior.correct,
                    "incorrect": prior.incorrect,
                    "accuracy": prior.accuracy(),
                }),
            );
        }
        regimes.insert(regime.as_str().to_string(), providers.into());
    }
    Ok(Json(json!({
        "priors": regimes,
        "posterior_trending": state.recalibrator.posterior_weights(Regime::Trending),
    })))
}

// -------------------------------------------------------------------------
// Weights
// -------------------------------------------------------------------------

pub async fn get_weights(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state.weights.snapshot();
    Ok(Json(serde_json::to_value(snapshot).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct WeightsPatch {
    #[serde(default)]
    pub weights: Option<HashMap<ProviderId, f64>>,
    #[serde(default)]
    pub penalty_k: Option<f64>,
}

pub async fn patch_weights(
    State(state): State<AppState>,
    Json(patch): Json<WeightsPatch>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if patch.weights.is_none() && patch.penalty_k.is_none() {
        return Err(ApiError::bad_request("patch changes nothing"));
    }
    let target = patch
        .weights
        .unwrap_or_else(|| state.weights.snapshot().weights);
    let updated = state
        .weights
        .apply_update(&target, patch.penalty_k, "manual_update", 0.0)?
        .unwrap_or_else(|| state.weights.snapshot());
    Ok(Json(serde_json::to_value(updated).unwrap_or_default()))
}

pub async fn weights_history(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let history = state.weights.history(params.limit.unwrap_or(50))?;
    Ok(Json(json!({
        "count": history.len(),
        "history": history,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SimulateRequest {
    pub weights: HashMap<ProviderId, f64>,
    #[serde(default)]
    pub penalty_k: Option<f64>,
    #[serde(default)]
    pub days: Option<i64>,
    #[serde(default)]
    pub symbol: Option<String>,
}

/// Re-score stored evaluations with substituted weights through the
/// production scorer.
pub async fn simulate_weights(
    State(state): State<AppState>,
    Json(request): Json<SimulateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    for (provider, weight) in &request.weights {
        if *weight < 0.0 || !weight.is_finite() {
            return Err(ApiError::bad_request(format!(
                "weight for {provider} must be non-negative"
            )));
        }
    }
    let penalty_k = request
        .penalty_k
        .unwrap_or_else(|| state.weights.snapshot().penalty_k);
    let records = state
        .store
        .get_evals_for_simulation(request.days.unwrap_or(30), request.symbol.as_deref())?;

    let mut rescored = 0usize;
    let mut would_trade = 0usize;
    let mut flipped = 0usize;
    let mut accepted_rs = Vec::new();
    for record in &records {
        let scores: Vec<ProviderScore> = record
            .model_outputs
            .iter()
            .filter(|o| o.compliant)
            .filter_map(|o| {
                Some(ProviderScore {
                    provider: o.provider,
                    trade_score: o.trade_score?,
                    expected_rr: o.expected_rr,
                    confidence: o.confidence,
                    should_trade: o.should_trade.unwrap_or(false),
                })
            })
            .collect();
        let Ok(ensemble) = score_ensemble(&scores, &request.weights, penalty_k) else {
            continue;
        };
        rescored += 1;
        if ensemble.should_trade {
            would_trade += 1;
            if let Some(outcome) = &record.outcome {
                if outcome.trade_taken {
                    if let Some(r) = outcome.r_multiple {
                        accepted_rs.push(r);
                    }
                }
            }
        }
        if ensemble.should_trade != record.evaluation.ensemble.should_trade {
            flipped += 1;
        }
    }

    let wins = accepted_rs.iter().filter(|r| **r > 0.0).count();
    let win_rate = if accepted_rs.is_empty() {
        0.0
    } else {
        wins as f64 / accepted_rs.len() as f64
    };
    let avg_r = if accepted_rs.is_empty() {
        0.0
    } else {
        accepted_rs.iter().sum::<f64>() / accepted_rs.len() as f64
    };

    Ok(Json(json!({
        "rescored": rescored,
        "would_trade": would_trade,
        "decision_flips": flipped,
        "realized_trades": accepted_rs.len(),
        "win_rate": win_rate,
        "avg_r": avg_r,
    })))
}

// -------------------------------------------------------------------------
// Walk-forward & edge metrics
// -------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WalkForwardRequest {
    #[serde(default)]
    pub train_size: Option<usize>,
    #[serde(default)]
    pub test_size: Option<usize>,
    #[serde(default)]
    pub days: Option<i64>,
    #[serde(default)]
    pub symbol: Option<String>,
}

pub async fn walk_forward(
    State(state): State<AppState>,
    Json(request): Json<WalkForwardRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut config = WalkForwardConfig::default();
    if let Some(train_size) = request.train_size {
        config.train_size = train_size;
    }
    if let Some(test_size) = request.test_size {
        config.test_size = test_size;
    }
    if config.train_size == 0 || config.test_size == 0 {
        return Err(ApiError::bad_request("window sizes must be positive"));
    }
    let records = state
        .store
        .get_evals_for_simulation(request.days.unwrap_or(90), request.symbol.as_deref())?;
    let report = run_walk_forward(&records, &config);
    Ok(Json(serde_json::to_value(report).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct EdgeMetricsRequest {
    pub outcomes: Vec<f64>,
    #[serde(default)]
    pub alpha: Option<f64>,
}

pub async fn edge_metrics_handler(
    Json(request): Json<EdgeMetricsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.outcomes.is_empty() {
        return Err(ApiError::bad_request("outcomes must not be empty"));
    }
    let alpha = request.alpha.unwrap_or(0.05);
    if alpha <= 0.0 || alpha > 0.5 {
        return Err(ApiError::bad_request("alpha must be in (0, 0.5]"));
    }
    let report = edge_metrics(&request.outcomes, alpha);
    Ok(Json(serde_json::to_value(report).unwrap_or_default()))
}

// -------------------------------------------------------------------------
// Session health
// -------------------------------------------------------------------------

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.session.health().snapshot();
    Json(json!({
        "session_state": state.session.state().to_string(),
        "connection": snapshot,
    }))
}

// -------------------------------------------------------------------------
// Orders
// -------------------------------------------------------------------------

pub async fn place_order(
    State(state): State<AppState>,
    Json(intent): Json<OrderIntent>,
) -> Result<Json<PlaceResult>, ApiError> {
    Ok(Json(state.pipeline.place_order(intent).await?))
}

#[derive(Debug, Deserialize)]
pub struct BracketRequest {
    #[serde(flatten)]
    pub intent: BracketIntent,
    #[serde(default)]
    pub advanced: bool,
}

pub async fn place_bracket(
    State(state): State<AppState>,
    Json(request): Json<BracketRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = if request.advanced {
        state.pipeline.place_advanced_bracket(request.intent).await?
    } else {
        state.pipeline.place_bracket(request.intent).await?
    };
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

pub async fn modify_order(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    Json(changes): Json<OrderChanges>,
) -> Result<Json<PlaceResult>, ApiError> {
    Ok(Json(state.pipeline.modify_order(order_id, changes).await?))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
) -> Result<Json<PlaceResult>, ApiError> {
    Ok(Json(state.pipeline.cancel_order(order_id).await?))
}

pub async fn cancel_all(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.pipeline.cancel_all().await?;
    Ok(Json(json!({ "cancelled": "all" })))
}

pub async fn flatten(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let closed = state.pipeline.flatten_all().await?;
    Ok(Json(json!({
        "closed": closed.len(),
        "orders": closed,
    })))
}
