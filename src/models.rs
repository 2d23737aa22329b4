//! Core data model
//!
//! Entities shared across the gateway, order pipeline, linker, ensemble
//! and analytics. Persisted shapes live in `storage`; everything here is
//! plain data with serde derives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Trade direction of an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(Direction::Long),
            "short" => Some(Direction::Short),
            _ => None,
        }
    }
}

/// Order side as sent to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Execution side as reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecSide {
    #[serde(rename = "BOT")]
    Bought,
    #[serde(rename = "SLD")]
    Sold,
}

impl ExecSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecSide::Bought => "BOT",
            ExecSide::Sold => "SLD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BOT" => Some(ExecSide::Bought),
            "SLD" => Some(ExecSide::Sold),
            _ => None,
        }
    }

    /// Direction an opening fill on this side implies.
    pub fn implied_direction(&self) -> Direction {
        match self {
            ExecSide::Bought => Direction::Long,
            ExecSide::Sold => Direction::Short,
        }
    }
}

/// Coarse market regime derived from ATR-percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Trending,
    Chop,
    Volatile,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Trending => "TRENDING",
            Regime::Chop => "CHOP",
            Regime::Volatile => "VOLATILE",
        }
    }

    pub const ALL: [Regime; 3] = [Regime::Trending, Regime::Chop, Regime::Volatile];

    /// Map a volatility-regime label onto the three coarse regimes.
    pub fn from_volatility_label(label: &str) -> Self {
        match label {
            "high" | "extreme" => Regime::Volatile,
            "low" => Regime::Chop,
            _ => Regime::Trending,
        }
    }
}

/// Per-evaluation market snapshot captured at scoring time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    pub rvol: Option<f64>,
    pub vwap_deviation_pct: Option<f64>,
    pub spread_pct: Option<f64>,
    pub volume_acceleration: Option<f64>,
    pub atr_pct: Option<f64>,
    pub gap_pct: Option<f64>,
    pub range_position: Option<f64>,
    pub price_extension: Option<f64>,
    pub index_alignment: Option<f64>,
    pub time_of_day: Option<String>,
    pub minutes_since_open: Option<f64>,
    pub volatility_regime: Option<String>,
    pub liquidity_bucket: Option<String>,
}

impl FeatureVector {
    /// Numeric features by name, for median-split attribution.
    pub fn numeric_features(&self) -> Vec<(&'static str, Option<f64>)> {
        vec![
            ("rvol", self.rvol),
            ("vwap_deviation_pct", self.vwap_deviation_pct),
            ("spread_pct", self.spread_pct),
            ("volume_acceleration", self.volume_acceleration),
            ("atr_pct", self.atr_pct),
            ("gap_pct", self.gap_pct),
            ("range_position", self.range_position),
            ("price_extension", self.price_extension),
            ("index_alignment", self.index_alignment),
            ("minutes_since_open", self.minutes_since_open),
        ]
    }

    pub fn regime(&self) -> Regime {
        self.volatility_regime
            .as_deref()
            .map(Regime::from_volatility_label)
            .unwrap_or(Regime::Trending)
    }
}

/// Scoring provider identity. Iteration order is weight-declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Gpt,
    Gemini,
    Claude,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [ProviderId::Gpt, ProviderId::Gemini, ProviderId::Claude];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Gpt => "gpt",
            ProviderId::Gemini => "gemini",
            ProviderId::Claude => "claude",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gpt" => Some(ProviderId::Gpt),
            "gemini" => Some(ProviderId::Gemini),
            "claude" => Some(ProviderId::Claude),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider's parsed scoring response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOutput {
    pub evaluation_id: String,
    pub provider: ProviderId,
    pub raw_response: String,
    pub compliant: bool,
    pub error: Option<String>,
    pub latency_ms: i64,
    pub trade_score: Option<f64>,
    pub component_risks: Option<HashMap<String, f64>>,
    pub expected_rr: Option<f64>,
    pub confidence: Option<f64>,
    pub should_trade: Option<bool>,
    pub reasoning: Option<String>,
    pub model_version: Option<String>,
    pub prompt_hash: Option<String>,
    pub token_count: Option<i64>,
    pub response_id: Option<String>,
}

impl ModelOutput {
    pub fn failed(evaluation_id: &str, provider: ProviderId, error: String, latency_ms: i64) -> Self {
        Self {
            evaluation_id: evaluation_id.to_string(),
            provider,
            raw_response: String::new(),
            compliant: false,
            error: Some(error),
            latency_ms,
            trade_score: None,
            component_risks: None,
            expected_rr: None,
            confidence: None,
            should_trade: None,
            reasoning: None,
            model_version: None,
            prompt_hash: None,
            token_count: None,
            response_id: None,
        }
    }
}

/// Aggregated consensus over the compliant provider outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub weighted_score: f64,
    pub median_score: f64,
    pub final_score: f64,
    pub expected_rr: Option<f64>,
    pub confidence: f64,
    pub should_trade: bool,
    pub unanimous: bool,
    pub majority_trade: bool,
    pub score_spread: f64,
    pub disagreement_penalty: f64,
    pub providers_used: Vec<ProviderId>,
}

/// Immutable snapshot of one scored (symbol, direction) setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub features: FeatureVector,
    pub ensemble: EnsembleResult,
    /// Weights snapshotted at scoring time so re-scoring is reproducible.
    pub weights_used: HashMap<ProviderId, f64>,
    pub guardrail_allowed: bool,
    pub prefilter_passed: bool,
}

impl Evaluation {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// What was ultimately done with an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    TookTrade,
    PassedSetup,
    EnsembleNo,
    RiskGateBlocked,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::TookTrade => "took_trade",
            DecisionType::PassedSetup => "passed_setup",
            DecisionType::EnsembleNo => "ensemble_no",
            DecisionType::RiskGateBlocked => "risk_gate_blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "took_trade" => Some(DecisionType::TookTrade),
            "passed_setup" => Some(DecisionType::PassedSetup),
            "ensemble_no" => Some(DecisionType::EnsembleNo),
            "risk_gate_blocked" => Some(DecisionType::RiskGateBlocked),
            _ => None,
        }
    }
}

/// Realised result for an evaluation. At most one per evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub evaluation_id: String,
    pub trade_taken: bool,
    pub decision_type: DecisionType,
    pub actual_entry: Option<f64>,
    pub actual_exit: Option<f64>,
    pub r_multiple: Option<f64>,
    pub exit_reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// R-multiple from entry/stop/exit. None when the stop sits on the entry
/// (risk is zero, the ratio is undefined).
pub fn r_multiple(direction: Direction, entry: f64, stop: f64, exit: f64) -> Option<f64> {
    let risk = match direction {
        Direction::Long => entry - stop,
        Direction::Short => stop - entry,
    };
    if risk.abs() < f64::EPSILON {
        return None;
    }
    let gain = match direction {
        Direction::Long => exit - entry,
        Direction::Short => entry - exit,
    };
    Some(gain / risk)
}

/// An order intent as persisted. Status mutates via the persistent listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: String,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub aux_price: Option<f64>,
    pub trailing_percent: Option<f64>,
    pub time_in_force: String,
    pub parent_order_id: Option<i64>,
    pub oca_group: Option<String>,
    pub oca_type: Option<i32>,
    pub status: String,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub strategy_version: Option<String>,
    pub order_source: String,
    pub correlation_id: String,
    pub evaluation_id: Option<String>,
    pub journal_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal order statuses: no further status events are expected.
pub fn is_terminal_status(status: &str) -> bool {
    matches!(status, "Filled" | "Cancelled" | "ApiCancelled")
}

/// A single fill reported by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub exec_id: String,
    pub order_id: i64,
    pub symbol: String,
    pub side: ExecSide,
    pub shares: f64,
    pub price: f64,
    pub cum_qty: f64,
    pub avg_price: f64,
    pub account: Option<String>,
    pub commission: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub executed_at: DateTime<Utc>,
    pub correlation_id: String,
}

/// How an execution was tied back to an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Explicit,
    Heuristic,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Explicit => "explicit",
            LinkType::Heuristic => "heuristic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explicit" => Some(LinkType::Explicit),
            "heuristic" => Some(LinkType::Heuristic),
            _ => None,
        }
    }
}

/// Many-to-many mapping between evaluations and orders, with metadata.
/// (evaluation_id, order_id) is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalExecutionLink {
    pub evaluation_id: String,
    pub order_id: i64,
    pub exec_id: String,
    pub link_type: LinkType,
    pub confidence: f64,
    pub symbol: String,
    pub direction: Option<Direction>,
    pub created_at: DateTime<Utc>,
}

/// Current ensemble weights plus the penalty coefficient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleWeights {
    pub weights: HashMap<ProviderId, f64>,
    /// Quadratic disagreement penalty coefficient.
    pub penalty_k: f64,
    pub sample_size: u64,
    pub updated_at: DateTime<Utc>,
}

impl EnsembleWeights {
    /// Normalise in place so weights sum to 1. No-op for an all-zero map.
    pub fn normalize(&mut self) {
        let total: f64 = self.weights.values().sum();
        if total > f64::EPSILON {
            for w in self.weights.values_mut() {
                *w /= total;
            }
        }
    }
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        let mut weights = HashMap::new();
        weights.insert(ProviderId::Gpt, 0.4);
        weights.insert(ProviderId::Gemini, 0.3);
        weights.insert(ProviderId::Claude, 0.3);
        Self {
            weights,
            penalty_k: 1.0,
            sample_size: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Append-only record of a weights change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub weights: HashMap<ProviderId, f64>,
    pub penalty_k: f64,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}
