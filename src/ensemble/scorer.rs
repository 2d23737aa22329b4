//! Consensus scoring
//!
//! Combines whatever subset of providers responded. Weights renormalise
//! over that subset, so a failed provider's weight is redistributed
//! proportionally. A quadratic disagreement penalty shaves the weighted
//! score when providers diverge. The simulator calls this exact function
//! with substituted weights; there is no separate scoring path.

use crate::errors::{CoreError, CoreResult};
use crate::models::{EnsembleResult, ProviderId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Trade scores at or above this are a "should trade" consensus.
pub const SHOULD_TRADE_THRESHOLD: f64 = 40.0;

/// One compliant provider response, reduced to its scoring fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderScore {
    pub provider: ProviderId,
    pub trade_score: f64,
    pub expected_rr: Option<f64>,
    pub confidence: Option<f64>,
    pub should_trade: bool,
}

fn weighted_mean(pairs: &[(f64, f64)]) -> Option<f64> {
    let total: f64 = pairs.iter().map(|(w, _)| w).sum();
    if total <= f64::EPSILON {
        return None;
    }
    Some(pairs.iter().map(|(w, v)| w * v).sum::<f64>() / total)
}

fn median(values: &mut Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Combine the responding providers under the given weights.
///
/// Requires at least one score; an empty slice is `NoProvidersAvailable`.
pub fn score_ensemble(
    scores: &[ProviderScore],
    weights: &HashMap<ProviderId, f64>,
    penalty_k: f64,
) -> CoreResult<EnsembleResult> {
    if scores.is_empty() {
        return Err(CoreError::NoProvidersAvailable);
    }

    // Normalise over the subset that responded. When every responding
    // provider carries zero weight, fall back to equal weighting.
    let raw: Vec<f64> = scores
        .iter()
        .map(|s| weights.get(&s.provider).copied().unwrap_or(0.0).max(0.0))
        .collect();
    let total: f64 = raw.iter().sum();
    let normalized: Vec<f64> = if total > f64::EPSILON {
        raw.iter().map(|w| w / total).collect()
    } else {
        vec![1.0 / scores.len() as f64; scores.len()]
    };

    let weighted_score: f64 = scores
        .iter()
        .zip(&normalized)
        .map(|(s, w)| w * s.trade_score)
        .sum();

    let mut all_scores: Vec<f64> = scores.iter().map(|s| s.trade_score).collect();
    let median_score = median(&mut all_scores);
    let max = all_scores.iter().cloned().fold(f64::MIN, f64::max);
    let min = all_scores.iter().cloned().fold(f64::MAX, f64::min);
    let score_spread = max - min;

    let disagreement_penalty = penalty_k * score_spread * score_spread / 10_000.0;
    let final_score = (weighted_score - disagreement_penalty).max(0.0);
    let should_trade = final_score >= SHOULD_TRADE_THRESHOLD;

    let trade_votes = scores.iter().filter(|s| s.should_trade).count();
    let unanimous = trade_votes == scores.len() || trade_votes == 0;
    let majority_trade = trade_votes * 2 > scores.len();

    let expected_rr = weighted_mean(
        &scores
            .iter()
            .zip(&normalized)
            .filter_map(|(s, w)| s.expected_rr.map(|rr| (*w, rr)))
            .collect::<Vec<_>>(),
    );
    let confidence = weighted_mean(
        &scores
            .iter()
            .zip(&normalized)
            .filter_map(|(s, w)| s.confidence.map(|c| (*w, c)))
            .collect::<Vec<_>>(),
    )
    .unwrap_or(0.0);

    Ok(EnsembleResult {
        weighted_score,
        median_score,
        final_score,
        expected_rr,
        confidence,
        should_trade,
        unanimous,
        majority_trade,
        score_spread,
        disagreement_penalty,
        providers_used: scores.iter().map(|s| s.provider).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(provider: ProviderId, trade_score: f64, should_trade: bool) -> ProviderScore {
        ProviderScore {
            provider,
            trade_score,
            expected_rr: Some(2.0),
            confidence: Some(0.8),
            should_trade,
        }
    }

    fn default_weights() -> HashMap<ProviderId, f64> {
        HashMap::from([
            (ProviderId::Gpt, 0.4),
            (ProviderId::Claude, 0.3),
            (ProviderId::Gemini, 0.3),
        ])
    }

    #[test]
    fn consensus_survives_provider_loss() {
        // gemini failed; surviving weights renormalise to 4/7 and 3/7.
        let scores = vec![
            score(ProviderId::Gpt, 70.0, true),
            score(ProviderId::Claude, 72.0, true),
        ];
        let result = score_ensemble(&scores, &default_weights(), 1.0).unwrap();

        let expected = 70.0 * 4.0 / 7.0 + 72.0 * 3.0 / 7.0;
        assert!((result.weighted_score - expected).abs() < 1e-9);
        assert!((result.weighted_score - 70.857).abs() < 1e-3);
        assert!(result.should_trade);
        assert!(result.unanimous);
        assert!(result.majority_trade);
    }

    #[test]
    fn no_providers_is_an_error() {
        let result = score_ensemble(&[], &default_weights(), 1.0);
        assert!(matches!(result, Err(CoreError::NoProvidersAvailable)));
    }

    #[test]
    fn disagreement_penalty_is_quadratic_in_spread() {
        let scores = vec![
            score(ProviderId::Gpt, 90.0, true),
            score(ProviderId::Claude, 50.0, true),
        ];
        let result = score_ensemble(&scores, &default_weights(), 2.0).unwrap();
        assert_eq!(result.score_spread, 40.0);
        // 2.0 * 40^2 / 10000
        assert!((result.disagreement_penalty - 0.32).abs() < 1e-9);
        assert!((result.final_score - (result.weighted_score - 0.32)).abs() < 1e-9);
    }

    #[test]
    fn final_score_floors_at_zero() {
        let scores = vec![
            score(ProviderId::Gpt, 0.0, false),
            score(ProviderId::Claude, 100.0, true),
        ];
        // Huge k drives the penalty past the weighted score.
        let result = score_ensemble(&scores, &default_weights(), 1000.0).unwrap();
        assert_eq!(result.final_score, 0.0);
        assert!(!result.should_trade);
    }

    #[test]
    fn median_of_even_and_odd_sets() {
        let scores = vec![
            score(ProviderId::Gpt, 60.0, true),
            score(ProviderId::Claude, 70.0, true),
            score(ProviderId::Gemini, 80.0, true),
        ];
        let result = score_ensemble(&scores, &default_weights(), 1.0).unwrap();
        assert_eq!(result.median_score, 70.0);

        let scores = vec![
            score(ProviderId::Gpt, 60.0, true),
            score(ProviderId::Claude, 70.0, true),
        ];
        let result = score_ensemble(&scores, &default_weights(), 1.0).unwrap();
        assert_eq!(result.median_score, 65.0);
    }

    #[test]
    fn unanimity_and_majority_flags() {
        let split = vec![
            score(ProviderId::Gpt, 60.0, true),
            score(ProviderId::Claude, 45.0, true),
            score(ProviderId::Gemini, 20.0, false),
        ];
        let result = score_ensemble(&split, &default_weights(), 1.0).unwrap();
        assert!(!result.unanimous);
        assert!(result.majority_trade);

        let all_no = vec![
            score(ProviderId::Gpt, 10.0, false),
            score(ProviderId::Claude, 15.0, false),
        ];
        let result = score_ensemble(&all_no, &default_weights(), 1.0).unwrap();
        assert!(result.unanimous);
        assert!(!result.majority_trade);
    }

    #[test]
    fn zero_weight_subset_falls_back_to_equal() {
        let weights = HashMap::from([(ProviderId::Gemini, 1.0)]);
        let scores = vec![
            score(ProviderId::Gpt, 60.0, true),
            score(ProviderId::Claude, 80.0, true),
        ];
        let result = score_ensemble(&scores, &weights, 1.0).unwrap();
        assert!((result.weighted_score - 70.0).abs() < 1e-9);
    }

    #[test]
    fn single_provider_keeps_full_weight() {
        let scores = vec![score(ProviderId::Claude, 55.0, true)];
        let result = score_ensemble(&scores, &default_weights(), 1.0).unwrap();
        assert!((result.weighted_score - 55.0).abs() < 1e-9);
        assert_eq!(result.score_spread, 0.0);
        assert_eq!(result.disagreement_penalty, 0.0);
    }
}
