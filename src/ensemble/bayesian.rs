//! Bayesian weight recalibration
//!
//! Per-(regime, provider) priors accumulate correct/incorrect direction
//! calls weighted by the magnitude of the realised R-multiple. Every 50
//! outcomes the current weights blend 30% toward the posterior, clamped
//! and renormalised by the weight store. Priors persist as a versioned
//! JSON document written atomically; a corrupt file falls back to
//! defaults instead of failing startup.

use crate::errors::{CoreError, CoreResult};
use crate::models::{Direction, Evaluation, ModelOutput, Outcome, ProviderId, Regime};
use crate::ensemble::weights::WeightStore;
use crate::storage::TradeStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PRIORS_VERSION: u32 = 1;
/// Recalibrate after this many recorded outcomes.
const RECALIBRATION_INTERVAL: u64 = 50;
/// Blend fraction toward the posterior.
const BLEND: f64 = 0.3;
/// Skip the update when the post-clamp change is below this.
const MIN_TOTAL_CHANGE: f64 = 0.01;

/// Sufficient statistic for one (regime, provider) cell
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderPrior {
    pub correct: f64,
    pub incorrect: f64,
}

impl ProviderPrior {
    pub fn record(&mut self, correct: bool, weight: f64) {
        if correct {
            self.correct += weight;
        } else {
            self.incorrect += weight;
        }
    }

    /// Posterior accuracy with a symmetric smoothing prior, so an empty
    /// cell sits at 0.5 rather than exploding.
    pub fn accuracy(&self) -> f64 {
        (self.correct + 1.0) / (self.correct + self.incorrect + 2.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PriorsDocument {
    version: u32,
    regimes: HashMap<String, HashMap<String, ProviderPrior>>,
}

impl Default for PriorsDocument {
    fn default() -> Self {
        Self {
            version: PRIORS_VERSION,
            regimes: HashMap::new(),
        }
    }
}

/// Whether a provider's output agreed with the realised direction.
/// Score > 50 with a should-trade vote reads bullish; a short trade
/// inverts the agreement.
pub fn prediction_correct(
    direction: Direction,
    trade_score: f64,
    should_trade: bool,
    r_multiple: f64,
) -> bool {
    let bullish = trade_score > 50.0 && should_trade;
    let agrees_with_trade = match direction {
        Direction::Long => bullish,
        Direction::Short => !bullish,
    };
    agrees_with_trade == (r_multiple > 0.0)
}

pub struct BayesianRecalibrator {
    priors: Mutex<PriorsDocument>,
    path: PathBuf,
    store: Arc<TradeStore>,
    weights: Arc<WeightStore>,
    outcomes_seen: AtomicU64,
}

impl BayesianRecalibrator {
    pub fn new(
        path: impl AsRef<Path>,
        store: Arc<TradeStore>,
        weights: Arc<WeightStore>,
    ) -> CoreResult<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let priors = Self::load(&path);
        let outcomes_seen = store.count_outcomes()?;
        Ok(Arc::new(Self {
            priors: Mutex::new(priors),
            path,
            store,
            weights,
            outcomes_seen: AtomicU64::new(outcomes_seen),
        }))
    }

    fn load(path: &Path) -> PriorsDocument {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<PriorsDocument>(&raw) {
                Ok(doc) if doc.version == PRIORS_VERSION => doc,
                Ok(doc) => {
                    warn!(version = doc.version, "unknown priors version, starting fresh");
                    PriorsDocument::default()
                }
                Err(e) => {
                    warn!(error = %e, "corrupt priors file, starting fresh");
                    PriorsDocument::default()
                }
            },
            Err(_) => PriorsDocument::default(),
        }
    }

    /// Write temp file then rename, so a crash mid-write never leaves a
    /// torn document.
    fn persist(&self) -> CoreResult<()> {
        let doc = self.priors.lock().clone();
        let raw = serde_json::to_string_pretty(&doc)
            .map_err(|e| CoreError::Other(anyhow::anyhow!(e)))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw).map_err(|e| CoreError::Other(anyhow::anyhow!(e)))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| CoreError::Other(anyhow::anyhow!(e)))?;
        Ok(())
    }

    pub fn prior(&self, regime: Regime, provider: ProviderId) -> ProviderPrior {
        self.priors
            .lock()
            .regimes
            .get(regime.as_str())
            .and_then(|providers| providers.get(provider.as_str()))
            .copied()
            .unwrap_or_default()
    }

    /// Fold one realised outcome into the priors. Ignores outcomes
    /// without a trade or without a known R-multiple.
    pub fn record_outcome(
        &self,
        evaluation: &Evaluation,
        outputs: &[ModelOutput],
        outcome: &Outcome,
    ) -> CoreResult<bool> {
        if !outcome.trade_taken {
            return Ok(false);
        }
        let Some(r) = outcome.r_multiple else {
            return Ok(false);
        };

        let regime = evaluation.features.regime();
        {
            let mut doc = self.priors.lock();
            let cell = doc
                .regimes
                .entry(regime.as_str().to_string())
                .or_default();
            for output in outputs.iter().filter(|o| o.compliant) {
                let Some(score) = output.trade_score else {
                    continue;
                };
                let correct = prediction_correct(
                    evaluation.direction,
                    score,
                    output.should_trade.unwrap_or(false),
                    r,
                );
                cell.entry(output.provider.as_str().to_string())
                    .or_default()
                    .record(correct, r.abs());
            }
        }
        self.persist()?;

        let seen = self.outcomes_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen % RECALIBRATION_INTERVAL == 0 {
            self.recalibrate()?;
        }
        Ok(true)
    }

    /// Posterior over TRENDING priors, blended into the current weights.
    pub fn recalibrate(&self) -> CoreResult<bool> {
        let current = self.weights.snapshot();
        let posterior = self.posterior_weights(Regime::Trending);

        let mut target = HashMap::new();
        for provider in ProviderId::ALL {
            let cur = current.weights.get(&provider).copied().unwrap_or(0.0);
            let post = posterior.get(&provider).copied().unwrap_or(cur);
            target.insert(provider, cur + BLEND * (post - cur));
        }

        let applied = self.weights.apply_update(
            &target,
            None,
            "bayesian_recalibration",
            MIN_TOTAL_CHANGE,
        )?;
        match &applied {
            Some(updated) => info!(weights = ?updated.weights, "weights recalibrated"),
            None => debug!("recalibration change below threshold, skipped"),
        }
        Ok(applied.is_some())
    }

    /// Normalised posterior accuracies for one regime.
    pub fn posterior_weights(&self, regime: Regime) -> HashMap<ProviderId, f64> {
        let accuracies: HashMap<ProviderId, f64> = ProviderId::ALL
            .iter()
            .map(|provider| (*provider, self.prior(regime, *provider).accuracy()))
            .collect();
        let total: f64 = accuracies.values().sum();
        accuracies
            .into_iter()
            .map(|(provider, acc)| (provider, acc / total))
            .collect()
    }

    /// Consume freshly recorded outcomes from the linker.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Outcome>) {
        while let Some(outcome) = rx.recv().await {
            let evaluation = match self.store.get_evaluation(&outcome.evaluation_id) {
                Ok(Some(evaluation)) => evaluation,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "evaluation lookup failed");
                    continue;
                }
            };
            let outputs = match self.store.get_model_outputs(&outcome.evaluation_id) {
                Ok(outputs) => outputs,
                Err(e) => {
                    warn!(error = %e, "model output lookup failed");
                    continue;
                }
            };
            if let Err(e) = self.record_outcome(&evaluation, &outputs, &outcome) {
                warn!(error = %e, "bayesian update failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EnsembleResult, FeatureVector};
    use chrono::Utc;

    fn eval_with_regime(label: &str, direction: Direction) -> Evaluation {
        Evaluation {
            id: "E1".to_string(),
            symbol: "AAPL".to_string(),
            direction,
            entry_price: Some(150.0),
            stop_price: Some(148.0),
            created_at: Utc::now(),
            features: FeatureVector {
                volatility_regime: Some(label.to_string()),
                ..Default::default()
            },
            ensemble: EnsembleResult {
                weighted_score: 70.0,
                median_score: 70.0,
                final_score: 70.0,
                expected_rr: None,
                confidence: 0.8,
                should_trade: true,
                unanimous: true,
                majority_trade: true,
                score_spread: 0.0,
                disagreement_penalty: 0.0,
                providers_used: vec![ProviderId::Gpt],
            },
            weights_used: HashMap::from([(ProviderId::Gpt, 1.0)]),
            guardrail_allowed: true,
            prefilter_passed: true,
        }
    }

    fn output(provider: ProviderId, score: f64, should_trade: bool) -> ModelOutput {
        ModelOutput {
            evaluation_id: "E1".to_string(),
            provider,
            raw_response: String::new(),
            compliant: true,
            error: None,
            latency_ms: 100,
            trade_score: Some(score),
            component_risks: None,
            expected_rr: None,
            confidence: Some(0.8),
            should_trade: Some(should_trade),
            reasoning: None,
            model_version: None,
            prompt_hash: None,
            token_count: None,
            response_id: None,
        }
    }

    fn outcome(r: Option<f64>) -> Outcome {
        Outcome {
            evaluation_id: "E1".to_string(),
            trade_taken: true,
            decision_type: crate::models::DecisionType::TookTrade,
            actual_entry: Some(150.0),
            actual_exit: Some(152.0),
            r_multiple: r,
            exit_reason: Some("auto_detected".to_string()),
            recorded_at: Utc::now(),
        }
    }

    fn recalibrator(dir: &tempfile::TempDir) -> Arc<BayesianRecalibrator> {
        let store = Arc::new(TradeStore::open_in_memory().unwrap());
        let weights = Arc::new(
            WeightStore::new(
                Arc::clone(&store),
                &HashMap::from([
                    (ProviderId::Gpt, 0.4),
                    (ProviderId::Gemini, 0.3),
                    (ProviderId::Claude, 0.3),
                ]),
                1.0,
            )
            .unwrap(),
        );
        BayesianRecalibrator::new(dir.path().join("priors.json"), store, weights).unwrap()
    }

    #[test]
    fn prediction_correctness_inverts_for_shorts() {
        // Bullish call on a winning long: correct.
        assert!(prediction_correct(Direction::Long, 70.0, true, 1.0));
        // Bullish call on a losing long: incorrect.
        assert!(!prediction_correct(Direction::Long, 70.0, true, -0.5));
        // Bullish call on a winning short: the model disagreed with the
        // trade, so it was wrong.
        assert!(!prediction_correct(Direction::Short, 70.0, true, 1.0));
        // Bearish call on a winning short: correct.
        assert!(prediction_correct(Direction::Short, 30.0, false, 1.0));
    }

    #[test]
    fn updates_are_weighted_by_r_magnitude() {
        let dir = tempfile::tempdir().unwrap();
        let recal = recalibrator(&dir);
        let eval = eval_with_regime("normal", Direction::Long);

        recal
            .record_outcome(&eval, &[output(ProviderId::Gpt, 70.0, true)], &outcome(Some(2.0)))
            .unwrap();
        let prior = recal.prior(Regime::Trending, ProviderId::Gpt);
        assert_eq!(prior.correct, 2.0);
        assert_eq!(prior.incorrect, 0.0);

        recal
            .record_outcome(&eval, &[output(ProviderId::Gpt, 70.0, true)], &outcome(Some(-0.5)))
            .unwrap();
        let prior = recal.prior(Regime::Trending, ProviderId::Gpt);
        assert_eq!(prior.correct, 2.0);
        assert_eq!(prior.incorrect, 0.5);
    }

    #[test]
    fn regime_routing_follows_volatility_label() {
        let dir = tempfile::tempdir().unwrap();
        let recal = recalibrator(&dir);
        let eval = eval_with_regime("high", Direction::Long);
        recal
            .record_outcome(&eval, &[output(ProviderId::Gpt, 70.0, true)], &outcome(Some(1.0)))
            .unwrap();
        assert!(recal.prior(Regime::Volatile, ProviderId::Gpt).correct > 0.0);
        assert_eq!(recal.prior(Regime::Trending, ProviderId::Gpt).correct, 0.0);
    }

    #[test]
    fn outcomes_without_r_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let recal = recalibrator(&dir);
        let eval = eval_with_regime("normal", Direction::Long);
        let recorded = recal
            .record_outcome(&eval, &[output(ProviderId::Gpt, 70.0, true)], &outcome(None))
            .unwrap();
        assert!(!recorded);
        assert_eq!(recal.prior(Regime::Trending, ProviderId::Gpt), ProviderPrior::default());
    }

    #[test]
    fn priors_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("priors.json");
        {
            let recal = recalibrator(&dir);
            let eval = eval_with_regime("normal", Direction::Long);
            recal
                .record_outcome(&eval, &[output(ProviderId::Gpt, 70.0, true)], &outcome(Some(1.5)))
                .unwrap();
        }
        assert!(path.exists());

        let store = Arc::new(TradeStore::open_in_memory().unwrap());
        let weights = Arc::new(
            WeightStore::new(Arc::clone(&store), &HashMap::new(), 1.0).unwrap(),
        );
        let reloaded = BayesianRecalibrator::new(&path, store, weights).unwrap();
        assert_eq!(reloaded.prior(Regime::Trending, ProviderId::Gpt).correct, 1.5);
    }

    #[test]
    fn corrupt_priors_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("priors.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = Arc::new(TradeStore::open_in_memory().unwrap());
        let weights = Arc::new(
            WeightStore::new(Arc::clone(&store), &HashMap::new(), 1.0).unwrap(),
        );
        let recal = BayesianRecalibrator::new(&path, store, weights).unwrap();
        assert_eq!(recal.prior(Regime::Chop, ProviderId::Claude), ProviderPrior::default());
    }

    #[test]
    fn recalibration_blends_toward_the_better_provider() {
        let dir = tempfile::tempdir().unwrap();
        let recal = recalibrator(&dir);
        let eval = eval_with_regime("normal", Direction::Long);

        // gpt keeps being right, claude keeps being wrong.
        for _ in 0..10 {
            recal
                .record_outcome(
                    &eval,
                    &[
                        output(ProviderId::Gpt, 70.0, true),
                        output(ProviderId::Claude, 70.0, true),
                    ],
                    &outcome(Some(1.0)),
                )
                .unwrap();
            recal
                .record_outcome(
                    &eval,
                    &[output(ProviderId::Claude, 70.0, true)],
                    &outcome(Some(-1.0)),
                )
                .unwrap();
        }

        let before = recal.weights.snapshot();
        assert!(recal.recalibrate().unwrap());
        let after = recal.weights.snapshot();

        assert!(after.weights[&ProviderId::Gpt] > before.weights[&ProviderId::Gpt]);
        assert!(after.weights[&ProviderId::Claude] < before.weights[&ProviderId::Claude]);
        let total: f64 = after.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn repeated_recalibration_converges_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let recal = recalibrator(&dir);
        let eval = eval_with_regime("normal", Direction::Long);
        for _ in 0..3 {
            recal
                .record_outcome(&eval, &[output(ProviderId::Gpt, 70.0, true)], &outcome(Some(1.0)))
                .unwrap();
        }
        let mut applied = true;
        for _ in 0..20 {
            applied = recal.recalibrate().unwrap();
            if !applied {
                break;
            }
        }
        assert!(!applied, "repeated blending should converge below the skip threshold");
    }
}
