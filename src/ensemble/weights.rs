//! Ensemble weights store
//!
//! Singleton-with-history: the current per-provider weights plus an
//! append-only history of snapshots. Every update flows through one
//! path that clamps per-provider deltas to ±0.10, floors at zero and
//! normalises to sum 1, so the weights invariant holds no matter who
//! calls.

use crate::errors::{CoreError, CoreResult};
use crate::models::{EnsembleWeights, ProviderId, WeightSnapshot};
use crate::storage::TradeStore;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Largest move any single provider weight may make in one update.
pub const MAX_WEIGHT_DELTA: f64 = 0.10;

pub struct WeightStore {
    current: RwLock<EnsembleWeights>,
    store: Arc<TradeStore>,
}

impl WeightStore {
    /// Seed from configured weights (normalised), falling back to the
    /// most recent history snapshot when one exists.
    pub fn new(
        store: Arc<TradeStore>,
        configured: &HashMap<ProviderId, f64>,
        penalty_k: f64,
    ) -> CoreResult<Self> {
        let mut weights = EnsembleWeights {
            weights: configured.clone(),
            penalty_k,
            sample_size: 0,
            updated_at: Utc::now(),
        };
        if let Some(latest) = store.get_weight_history(1)?.into_iter().next() {
            weights.weights = latest.weights;
            weights.penalty_k = latest.penalty_k;
        }
        weights.normalize();
        Ok(Self {
            current: RwLock::new(weights),
            store,
        })
    }

    pub fn snapshot(&self) -> EnsembleWeights {
        self.current.read().clone()
    }

    pub fn history(&self, limit: usize) -> CoreResult<Vec<WeightSnapshot>> {
        self.store.get_weight_history(limit)
    }

    pub fn bump_sample_size(&self) {
        self.current.write().sample_size += 1;
    }

    /// Move the current weights toward `target`, clamped and normalised.
    /// Returns `None` (and appends nothing) when the post-clamp total
    /// absolute change is below `min_total_change`.
    pub fn apply_update(
        &self,
        target: &HashMap<ProviderId, f64>,
        penalty_k: Option<f64>,
        reason: &str,
        min_total_change: f64,
    ) -> CoreResult<Option<EnsembleWeights>> {
        for (provider, weight) in target {
            if *weight < 0.0 || !weight.is_finite() {
                return Err(CoreError::Validation(format!(
                    "weight for {provider} must be non-negative"
                )));
            }
        }

        let mut guard = self.current.write();
        let before = guard.weights.clone();

        let mut updated: HashMap<ProviderId, f64> = HashMap::new();
        for provider in ProviderId::ALL {
            let current = before.get(&provider).copied().unwrap_or(0.0);
            let wanted = target.get(&provider).copied().unwrap_or(current);
            let delta = (wanted - current).clamp(-MAX_WEIGHT_DELTA, MAX_WEIGHT_DELTA);
            updated.insert(provider, (current + delta).max(0.0));
        }

        let total: f64 = updated.values().sum();
        if total > f64::EPSILON {
            for weight in updated.values_mut() {
                *weight /= total;
            }
        }

        let total_change: f64 = ProviderId::ALL
            .iter()
            .map(|p| {
                (updated.get(p).copied().unwrap_or(0.0) - before.get(p).copied().unwrap_or(0.0))
                    .abs()
            })
            .sum();
        if total_change < min_total_change {
            return Ok(None);
        }

        guard.weights = updated;
        if let Some(k) = penalty_k {
            guard.penalty_k = k;
        }
        guard.updated_at = Utc::now();
        let result = guard.clone();
        drop(guard);

        self.store.append_weight_history(&WeightSnapshot {
            weights: result.weights.clone(),
            penalty_k: result.penalty_k,
            reason: reason.to_string(),
            recorded_at: result.updated_at,
        })?;
        info!(reason, total_change, "ensemble weights updated");
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight_store() -> WeightStore {
        let store = Arc::new(TradeStore::open_in_memory().unwrap());
        let configured = HashMap::from([
            (ProviderId::Gpt, 0.4),
            (ProviderId::Gemini, 0.3),
            (ProviderId::Claude, 0.3),
        ]);
        WeightStore::new(store, &configured, 1.0).unwrap()
    }

    fn assert_invariant(weights: &EnsembleWeights) {
        let total: f64 = weights.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6, "sum = {total}");
        assert!(weights.weights.values().all(|w| *w >= 0.0));
    }

    #[test]
    fn updates_preserve_the_weights_invariant() {
        let ws = weight_store();
        let target = HashMap::from([
            (ProviderId::Gpt, 0.9),
            (ProviderId::Gemini, 0.05),
            (ProviderId::Claude, 0.05),
        ]);
        let updated = ws.apply_update(&target, None, "manual_update", 0.0).unwrap().unwrap();
        assert_invariant(&updated);
    }

    #[test]
    fn per_provider_delta_is_clamped() {
        let ws = weight_store();
        let before = ws.snapshot();
        let target = HashMap::from([(ProviderId::Gpt, 1.0)]);
        let updated = ws.apply_update(&target, None, "manual_update", 0.0).unwrap().unwrap();

        // Pre-normalisation the move was +0.10 at most; normalisation can
        // only shrink weights further, never grow the gap past the clamp.
        let gpt_before = before.weights[&ProviderId::Gpt];
        let gpt_after = updated.weights[&ProviderId::Gpt];
        assert!(gpt_after - gpt_before <= MAX_WEIGHT_DELTA + 1e-9);
        assert_invariant(&updated);
    }

    #[test]
    fn small_changes_are_skipped() {
        let ws = weight_store();
        let current = ws.snapshot().weights;
        let mut target = current.clone();
        if let Some(w) = target.get_mut(&ProviderId::Gpt) {
            *w += 0.001;
        }
        let result = ws.apply_update(&target, None, "bayesian_recalibration", 0.01).unwrap();
        assert!(result.is_none());
        assert!(ws.history(10).unwrap().is_empty());
    }

    #[test]
    fn updates_append_history() {
        let ws = weight_store();
        let target = HashMap::from([(ProviderId::Claude, 0.38)]);
        ws.apply_update(&target, Some(1.5), "bayesian_recalibration", 0.0)
            .unwrap()
            .unwrap();
        let history = ws.history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "bayesian_recalibration");
        assert_eq!(history[0].penalty_k, 1.5);
    }

    #[test]
    fn negative_target_is_rejected() {
        let ws = weight_store();
        let target = HashMap::from([(ProviderId::Gpt, -0.2)]);
        assert!(ws.apply_update(&target, None, "manual_update", 0.0).is_err());
    }

    #[test]
    fn reload_picks_up_latest_history() {
        let store = Arc::new(TradeStore::open_in_memory().unwrap());
        let configured = HashMap::from([
            (ProviderId::Gpt, 0.4),
            (ProviderId::Gemini, 0.3),
            (ProviderId::Claude, 0.3),
        ]);
        {
            let ws = WeightStore::new(Arc::clone(&store), &configured, 1.0).unwrap();
            ws.apply_update(
                &HashMap::from([(ProviderId::Gpt, 0.5)]),
                None,
                "manual_update",
                0.0,
            )
            .unwrap();
        }
        let reloaded = WeightStore::new(Arc::clone(&store), &configured, 1.0).unwrap();
        let snapshot = reloaded.snapshot();
        assert!(snapshot.weights[&ProviderId::Gpt] > 0.4);
        assert_invariant(&snapshot);
    }
}
