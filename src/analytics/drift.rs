//! Provider calibration drift
//!
//! Buckets each provider's confidence scores and compares the realised
//! win rate in each bucket to what a calibrated model would produce.
//! Sustained deviation past the threshold flags the provider; a gap
//! between long- and short-window win rates flags a regime shift.

use crate::models::ProviderId;
use crate::storage::DriftRow;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::HashMap;

/// Outcomes needed before a provider is judged at all.
const MIN_PROVIDER_SAMPLES: usize = 30;
/// Observations needed in a bucket before it contributes.
const MIN_BUCKET_SAMPLES: usize = 5;
/// Long/short window sizes for regime-shift detection.
const REGIME_LONG_WINDOW: usize = 50;
const REGIME_SHORT_WINDOW: usize = 10;
const REGIME_SHIFT_THRESHOLD: f64 = 0.15;

const BUCKET_BOUNDS: [(f64, f64); 4] = [(0.0, 25.0), (25.0, 50.0), (50.0, 75.0), (75.0, 100.0)];
const EXPECTED_WIN_RATES: [f64; 4] = [0.125, 0.375, 0.625, 0.875];

#[derive(Debug, Clone, Serialize)]
pub struct BucketStat {
    pub range: String,
    pub expected_win_rate: f64,
    pub actual_win_rate: f64,
    pub observations: usize,
    pub deviation: f64,
    /// Two-sided p-value of the deviation under a normal approximation
    /// of the binomial. Informational; the drift flag uses the fixed
    /// threshold.
    pub p_value: Option<f64>,
    pub drifting: bool,
}

fn deviation_p_value(actual: f64, expected: f64, n: usize) -> Option<f64> {
    let variance = expected * (1.0 - expected) / n as f64;
    if variance <= 0.0 {
        return None;
    }
    let z = (actual - expected) / variance.sqrt();
    let normal = Normal::new(0.0, 1.0).ok()?;
    Some(2.0 * (1.0 - normal.cdf(z.abs())))
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderDrift {
    pub provider: ProviderId,
    pub samples: usize,
    pub buckets: Vec<BucketStat>,
    pub drifting: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub providers: Vec<ProviderDrift>,
    pub regime_shift_detected: bool,
    pub recommendation: String,
}

fn bucket_index(confidence_pct: f64) -> usize {
    match confidence_pct {
        c if c < 25.0 => 0,
        c if c < 50.0 => 1,
        c if c < 75.0 => 2,
        _ => 3,
    }
}

/// `rows` must be chronological; `recent_rs` is the realised R series
/// (chronological) used for the regime-shift check. Confidence comes in
/// on the model-output scale of [0, 1].
pub fn detect_drift(rows: &[DriftRow], recent_rs: &[f64], threshold: f64) -> DriftReport {
    let mut by_provider: HashMap<ProviderId, Vec<&DriftRow>> = HashMap::new();
    for row in rows {
        by_provider.entry(row.provider).or_default().push(row);
    }

    let mut providers = Vec::new();
    for provider in ProviderId::ALL {
        let Some(samples) = by_provider.get(&provider) else {
            continue;
        };
        if samples.len() < MIN_PROVIDER_SAMPLES {
            continue;
        }

        let mut wins = [0usize; 4];
        let mut counts = [0usize; 4];
        for row in samples {
            let index = bucket_index(row.confidence * 100.0);
            counts[index] += 1;
            if row.r_multiple > 0.0 {
                wins[index] += 1;
            }
        }

        let buckets: Vec<BucketStat> = (0..4)
            .filter(|&i| counts[i] >= MIN_BUCKET_SAMPLES)
            .map(|i| {
                let actual = wins[i] as f64 / counts[i] as f64;
                let deviation = (actual - EXPECTED_WIN_RATES[i]).abs();
                BucketStat {
                    range: format!("{}-{}", BUCKET_BOUNDS[i].0 as u32, BUCKET_BOUNDS[i].1 as u32),
                    expected_win_rate: EXPECTED_WIN_RATES[i],
                    actual_win_rate: actual,
                    observations: counts[i],
                    deviation,
                    p_value: deviation_p_value(actual, EXPECTED_WIN_RATES[i], counts[i]),
                    drifting: deviation > threshold,
                }
            })
            .collect();

        let drifting = buckets.iter().any(|b| b.drifting);
        providers.push(ProviderDrift {
            provider,
            samples: samples.len(),
            buckets,
            drifting,
        });
    }

    let regime_shift_detected = regime_shift(recent_rs);

    let drifting_names: Vec<&str> = providers
        .iter()
        .filter(|p| p.drifting)
        .map(|p| p.provider.as_str())
        .collect();
    let recommendation = if drifting_names.is_empty() && !regime_shift_detected {
        "All providers calibrated; no action needed.".to_string()
    } else if regime_shift_detected {
        format!(
            "Recent win rate diverges from the long window; consider re-running walk-forward validation. Drifting providers: {}.",
            if drifting_names.is_empty() { "none".to_string() } else { drifting_names.join(", ") }
        )
    } else {
        format!(
            "Providers {} are miscalibrated; consider reducing their weights or refreshing prompts.",
            drifting_names.join(", ")
        )
    };

    DriftReport {
        providers,
        regime_shift_detected,
        recommendation,
    }
}

/// Win rate over the last 50 outcomes against the last 10; a gap
/// strictly beyond the threshold (with at least 10 samples) is a shift.
fn regime_shift(recent_rs: &[f64]) -> bool {
    if recent_rs.len() < REGIME_SHORT_WINDOW {
        return false;
    }
    let win_rate = |slice: &[f64]| {
        slice.iter().filter(|r| **r > 0.0).count() as f64 / slice.len() as f64
    };
    let long_start = recent_rs.len().saturating_sub(REGIME_LONG_WINDOW);
    let short_start = recent_rs.len().saturating_sub(REGIME_SHORT_WINDOW);
    let long = win_rate(&recent_rs[long_start..]);
    let short = win_rate(&recent_rs[short_start..]);
    (long - short).abs() > REGIME_SHIFT_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(provider: ProviderId, confidence: f64, wins: usize, losses: usize) -> Vec<DriftRow> {
        let mut out = Vec::new();
        for _ in 0..wins {
            out.push(DriftRow {
                provider,
                confidence,
                r_multiple: 1.0,
            });
        }
        for _ in 0..losses {
            out.push(DriftRow {
                provider,
                confidence,
                r_multiple: -1.0,
            });
        }
        out
    }

    #[test]
    fn calibrated_provider_is_not_drifting() {
        // 0.8 confidence bucket expects 0.875; give it 28/32 = 0.875.
        let rows = rows(ProviderId::Gpt, 0.8, 28, 4);
        let report = detect_drift(&rows, &[], 0.15);
        assert_eq!(report.providers.len(), 1);
        assert!(!report.providers[0].drifting);
    }

    #[test]
    fn deviation_exactly_at_threshold_is_not_drift() {
        // Bucket 50-75 expects 0.625. 31/40 = 0.775, deviation exactly 0.15.
        let rows = rows(ProviderId::Gpt, 0.6, 31, 9);
        let report = detect_drift(&rows, &[], 0.15);
        assert!(!report.providers[0].drifting);
    }

    #[test]
    fn deviation_past_threshold_is_drift() {
        // 32/40 = 0.8, deviation 0.175 > 0.15.
        let rows = rows(ProviderId::Gpt, 0.6, 32, 8);
        let report = detect_drift(&rows, &[], 0.15);
        assert!(report.providers[0].drifting);
        assert!(report.recommendation.contains("gpt"));
    }

    #[test]
    fn small_samples_are_ignored() {
        let rows = rows(ProviderId::Gpt, 0.6, 10, 10); // 20 < 30
        let report = detect_drift(&rows, &[], 0.15);
        assert!(report.providers.is_empty());
    }

    #[test]
    fn sparse_buckets_do_not_contribute() {
        let mut all = rows(ProviderId::Gpt, 0.8, 28, 4);
        // Three wildly wrong observations in the 0-25 bucket: below the
        // five-sample floor, so they cannot flag the provider.
        all.extend(rows(ProviderId::Gpt, 0.1, 3, 0));
        let report = detect_drift(&all, &[], 0.15);
        assert!(!report.providers[0].drifting);
        assert_eq!(report.providers[0].buckets.len(), 1);
    }

    #[test]
    fn regime_shift_needs_a_gap_past_the_threshold() {
        // long 28/50 = 0.56, short 5/10 = 0.5: gap 0.06, no shift
        let mut no_shift = vec![1.0; 23];
        no_shift.extend(vec![-1.0; 17]);
        no_shift.extend([1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0]);
        let report = detect_drift(&[], &no_shift, 0.15);
        assert!(!report.regime_shift_detected);

        // long 33/50 = 0.66, short 0/10 = 0.0: gap 0.66, shift
        let mut shift = vec![1.0; 33];
        shift.extend(vec![-1.0; 7]);
        shift.extend(vec![-1.0; 10]);
        let report = detect_drift(&[], &shift, 0.15);
        assert!(report.regime_shift_detected);
    }

    #[test]
    fn exact_threshold_gap_is_not_a_shift() {
        // gap exactly 0.15 with a 20-long series: long 11/20 = 0.55,
        // short 4/10 = 0.4
        let mut series = vec![1.0; 7];
        series.extend(vec![-1.0; 3]);
        series.extend([1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0]);
        let report = detect_drift(&[], &series, 0.15);
        assert!(!report.regime_shift_detected);
    }

    #[test]
    fn too_few_samples_never_shift() {
        let report = detect_drift(&[], &[1.0; 9], 0.15);
        assert!(!report.regime_shift_detected);
    }
}
