//! Scoring providers and fan-out
//!
//! Each provider is a capability behind `ScoringProvider`; the engine
//! fans out one task per provider, waits for all of them, and tolerates
//! any subset failing. Responses outside the schema are demoted to
//! provider failures so a single bad reply can never poison consensus.

use crate::config::{AutoEvalConfig, OrchestratorConfig, ProviderConfig};
use crate::errors::{CoreError, CoreResult};
use crate::models::{
    Direction, Evaluation, FeatureVector, ModelOutput, ProviderId,
};
use crate::ensemble::scorer::{score_ensemble, ProviderScore};
use crate::ensemble::weights::WeightStore;
use crate::storage::TradeStore;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// What a provider is asked to score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringRequest {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub features: FeatureVector,
}

/// A provider's parsed scoring payload, pre-validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedScore {
    pub trade_score: f64,
    #[serde(default)]
    pub component_risks: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub expected_rr: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub should_trade: bool,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub token_count: Option<i64>,
    #[serde(skip)]
    pub raw_response: String,
}

/// Schema bounds. Violations demote the response to a provider failure.
pub fn validate_parsed(provider: ProviderId, parsed: &ParsedScore) -> CoreResult<()> {
    if !(0.0..=100.0).contains(&parsed.trade_score) {
        return Err(CoreError::SchemaMismatch {
            provider: provider.as_str().to_string(),
            detail: format!("trade score {} outside [0,100]", parsed.trade_score),
        });
    }
    if let Some(confidence) = parsed.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(CoreError::SchemaMismatch {
                provider: provider.as_str().to_string(),
                detail: format!("confidence {confidence} outside [0,1]"),
            });
        }
    }
    Ok(())
}

#[async_trait]
pub trait ScoringProvider: Send + Sync {
    fn id(&self) -> ProviderId;
    async fn score(&self, request: &ScoringRequest) -> anyhow::Result<ParsedScore>;
}

/// HTTP-backed provider. All three external services speak the same
/// JSON scoring contract; only endpoint, key and timeout differ.
pub struct HttpScoringProvider {
    id: ProviderId,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpScoringProvider {
    pub fn new(id: ProviderId, client: reqwest::Client, config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://api.{}.invalid/v1/score", id.as_str()));
        Self {
            id,
            client,
            base_url,
            api_key: config.api_key.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

#[async_trait]
impl ScoringProvider for HttpScoringProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn score(&self, request: &ScoringRequest) -> anyhow::Result<ParsedScore> {
        let mut builder = self
            .client
            .post(&self.base_url)
            .timeout(self.timeout)
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            anyhow::bail!("{} returned {status}: {body}", self.id);
        }
        let mut parsed: ParsedScore = serde_json::from_str(&body)?;
        parsed.raw_response = body;
        Ok(parsed)
    }
}

/// Orchestrates fan-out, consensus and persistence for one evaluation
pub struct EnsembleEngine {
    providers: Vec<Arc<dyn ScoringProvider>>,
    weights: Arc<WeightStore>,
    store: Arc<TradeStore>,
    orchestrator: OrchestratorConfig,
    /// Bounds simultaneous scoring fan-outs; excess work is rejected,
    /// never silently dropped.
    throttle: Arc<Semaphore>,
    max_concurrent: usize,
}

impl EnsembleEngine {
    pub fn new(
        providers: Vec<Arc<dyn ScoringProvider>>,
        weights: Arc<WeightStore>,
        store: Arc<TradeStore>,
        orchestrator: OrchestratorConfig,
        auto_eval: &AutoEvalConfig,
    ) -> Self {
        Self {
            providers,
            weights,
            store,
            orchestrator,
            throttle: Arc::new(Semaphore::new(auto_eval.max_concurrent)),
            max_concurrent: auto_eval.max_concurrent,
        }
    }

    pub fn from_configs(
        provider_configs: &HashMap<ProviderId, ProviderConfig>,
        weights: Arc<WeightStore>,
        store: Arc<TradeStore>,
        orchestrator: OrchestratorConfig,
        auto_eval: &AutoEvalConfig,
    ) -> Self {
        let client = reqwest::Client::new();
        let providers: Vec<Arc<dyn ScoringProvider>> = ProviderId::ALL
            .iter()
            .filter_map(|id| {
                let config = provider_configs.get(id)?;
                if config.api_key.is_none() && config.base_url.is_none() {
                    debug!(provider = %id, "provider unconfigured, skipping");
                    return None;
                }
                Some(Arc::new(HttpScoringProvider::new(*id, client.clone(), config))
                    as Arc<dyn ScoringProvider>)
            })
            .collect();
        Self::new(providers, weights, store, orchestrator, auto_eval)
    }

    /// One model output per provider, failures included.
    async fn fan_out(&self, evaluation_id: &str, request: &ScoringRequest) -> Vec<ModelOutput> {
        let tasks = self.providers.iter().map(|provider| {
            let provider = Arc::clone(provider);
            let request = request.clone();
            let evaluation_id = evaluation_id.to_string();
            tokio::spawn(async move {
                let started = Instant::now();
                let result = provider.score(&request).await;
                let latency_ms = started.elapsed().as_millis() as i64;
                match result {
                    Ok(parsed) => match validate_parsed(provider.id(), &parsed) {
                        Ok(()) => ModelOutput {
                            evaluation_id,
                            provider: provider.id(),
                            raw_response: parsed.raw_response.clone(),
                            compliant: true,
                            error: None,
                            latency_ms,
                            trade_score: Some(parsed.trade_score),
                            component_risks: parsed.component_risks.clone(),
                            expected_rr: parsed.expected_rr,
                            confidence: parsed.confidence,
                            should_trade: Some(parsed.should_trade),
                            reasoning: parsed.reasoning.clone(),
                            model_version: parsed.model_version.clone(),
                            prompt_hash: None,
                            token_count: parsed.token_count,
                            response_id: parsed.response_id.clone(),
                        },
                        Err(schema_err) => {
                            warn!(provider = %provider.id(), error = %schema_err, "non-compliant response");
                            ModelOutput::failed(
                                &evaluation_id,
                                provider.id(),
                                schema_err.to_string(),
                                latency_ms,
                            )
                        }
                    },
                    Err(e) => {
                        warn!(provider = %provider.id(), error = %e, "provider call failed");
                        ModelOutput::failed(&evaluation_id, provider.id(), e.to_string(), latency_ms)
                    }
                }
            })
        });

        join_all(tasks)
            .await
            .into_iter()
            .filter_map(|joined| joined.ok())
            .collect()
    }

    /// Score a setup: fan out, aggregate the compliant subset, persist
    /// the evaluation and every model output.
    pub async fn evaluate(&self, request: ScoringRequest) -> CoreResult<(Evaluation, Vec<ModelOutput>)> {
        let _permit = self
            .throttle
            .clone()
            .try_acquire_owned()
            .map_err(|_| CoreError::ThrottleSaturated {
                max: self.max_concurrent,
            })?;

        if request.symbol.trim().is_empty() {
            return Err(CoreError::validation("symbol must not be empty"));
        }

        let evaluation_id = Evaluation::new_id();
        let outputs = self.fan_out(&evaluation_id, &request).await;

        let snapshot = self.weights.snapshot();
        let scores: Vec<ProviderScore> = outputs
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

        let ensemble = score_ensemble(&scores, &snapshot.weights, snapshot.penalty_k)?;
        let guardrail_allowed = ensemble.should_trade
            && ensemble.confidence >= self.orchestrator.required_agreement;

        let evaluation = Evaluation {
            id: evaluation_id.clone(),
            symbol: request.symbol.clone(),
            direction: request.direction,
            entry_price: request.entry_price,
            stop_price: request.stop_price,
            created_at: Utc::now(),
            features: request.features.clone(),
            ensemble,
            weights_used: snapshot.weights.clone(),
            guardrail_allowed,
            prefilter_passed: true,
        };

        self.store.insert_evaluation(&evaluation)?;
        for output in &outputs {
            self.store.insert_model_output(output)?;
        }
        self.weights.bump_sample_size();

        info!(
            evaluation_id,
            symbol = evaluation.symbol,
            final_score = evaluation.ensemble.final_score,
            should_trade = evaluation.ensemble.should_trade,
            providers = scores.len(),
            "evaluation scored"
        );
        Ok((evaluation, outputs))
    }
}
