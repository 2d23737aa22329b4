//! Rolling risk metrics, bootstrap confidence intervals, Monte-Carlo
//! drawdown and feature attribution
//!
//! Every resampling routine takes an explicit seed and draws from a
//! ChaCha8 generator, so identical inputs produce bit-identical output
//! across runs and platforms.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::HashMap;

/// Trades per rolling window.
pub const ROLLING_WINDOW: usize = 20;
/// Bootstrap / Monte-Carlo resample count.
pub const RESAMPLES: usize = 1_000;
/// Annualisation factor for Sharpe and Sortino.
const ANNUALIZE: f64 = 252.0;
/// Monte-Carlo equity starts at 10R: each trade risks a tenth of the
/// starting stake, the usual footing for ruin analysis.
const MC_STARTING_EQUITY: f64 = 10.0;
/// A sim "ruins" when its max drawdown reaches this fraction.
const RUIN_DRAWDOWN: f64 = 0.5;

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut out = values.to_vec();
    out.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    out
}

fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let rank = (p * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[rank.min(sorted_values.len() - 1)]
}

fn win_rate(rs: &[f64]) -> f64 {
    if rs.is_empty() {
        return 0.0;
    }
    rs.iter().filter(|r| **r > 0.0).count() as f64 / rs.len() as f64
}

fn expectancy(rs: &[f64]) -> f64 {
    let wins: Vec<f64> = rs.iter().copied().filter(|r| *r > 0.0).collect();
    let losses: Vec<f64> = rs.iter().copied().filter(|r| *r <= 0.0).collect();
    let wr = win_rate(rs);
    wr * mean(&wins) - (1.0 - wr) * mean(&losses).abs()
}

fn sharpe(rs: &[f64]) -> f64 {
    let std = population_std(rs);
    if std < f64::EPSILON {
        return 0.0;
    }
    mean(rs) / std * ANNUALIZE.sqrt()
}

fn sortino(rs: &[f64]) -> f64 {
    let m = mean(rs);
    let downside: Vec<f64> = rs.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return 0.0;
    }
    let downside_dev =
        (downside.iter().map(|r| r.powi(2)).sum::<f64>() / rs.len() as f64).sqrt();
    if downside_dev < f64::EPSILON {
        return 0.0;
    }
    m / downside_dev * ANNUALIZE.sqrt()
}

/// Fractional drawdowns below the running equity peak, one per step.
fn fractional_drawdowns(equity: &[f64]) -> Vec<f64> {
    let mut peak = f64::MIN;
    equity
        .iter()
        .map(|&value| {
            peak = peak.max(value);
            if peak > 0.0 {
                ((peak - value) / peak).max(0.0)
            } else {
                0.0
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct RollingMetrics {
    pub window: usize,
    pub trades: usize,
    pub win_rate: f64,
    pub avg_r: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown: f64,
    pub cumulative_r: f64,
    pub equity_curve: Vec<f64>,
}

/// Metrics over the most recent `ROLLING_WINDOW` trades.
pub fn rolling_metrics(r_multiples: &[f64]) -> RollingMetrics {
    let start = r_multiples.len().saturating_sub(ROLLING_WINDOW);
    let window = &r_multiples[start..];

    let mut equity = Vec::with_capacity(window.len());
    let mut cumulative = 0.0;
    for r in window {
        cumulative += r;
        equity.push(cumulative);
    }
    let max_drawdown = fractional_drawdowns(&equity)
        .into_iter()
        .fold(0.0, f64::max);

    RollingMetrics {
        window: ROLLING_WINDOW,
        trades: window.len(),
        win_rate: win_rate(window),
        avg_r: mean(window),
        sharpe: sharpe(window),
        sortino: sortino(window),
        max_drawdown,
        cumulative_r: cumulative,
        equity_curve: equity,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub point: f64,
    /// Lower bound clears the no-edge reference.
    pub significant: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub resamples: usize,
    pub seed: u64,
    pub win_rate: ConfidenceInterval,
    pub avg_r: ConfidenceInterval,
    pub expectancy: ConfidenceInterval,
    pub sharpe: ConfidenceInterval,
}

/// Percentile bootstrap over the realised R-multiples. Deterministic for
/// a given seed.
pub fn bootstrap_cis(r_multiples: &[f64], seed: u64) -> BootstrapReport {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let n = r_multiples.len();

    let mut win_rates = Vec::with_capacity(RESAMPLES);
    let mut avg_rs = Vec::with_capacity(RESAMPLES);
    let mut expectancies = Vec::with_capacity(RESAMPLES);
    let mut sharpes = Vec::with_capacity(RESAMPLES);

    if n > 0 {
        let mut sample = vec![0.0; n];
        for _ in 0..RESAMPLES {
            for slot in sample.iter_mut() {
                *slot = r_multiples[rng.gen_range(0..n)];
            }
            win_rates.push(win_rate(&sample));
            avg_rs.push(mean(&sample));
            expectancies.push(expectancy(&sample));
            sharpes.push(sharpe(&sample));
        }
    }

    let interval = |samples: &[f64], point: f64, reference: f64| {
        let s = sorted(samples);
        let lower = percentile(&s, 0.025);
        let upper = percentile(&s, 0.975);
        ConfidenceInterval {
            lower,
            upper,
            point,
            significant: lower > reference,
        }
    };

    BootstrapReport {
        resamples: RESAMPLES,
        seed,
        win_rate: interval(&win_rates, win_rate(r_multiples), 0.5),
        avg_r: interval(&avg_rs, mean(r_multiples), 0.0),
        expectancy: interval(&expectancies, expectancy(r_multiples), 0.0),
        sharpe: interval(&sharpes, sharpe(r_multiples), 0.0),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonteCarloReport {
    pub simulations: usize,
    pub seed: u64,
    pub mean_max_drawdown: f64,
    pub median_max_drawdown: f64,
    pub p95_max_drawdown: f64,
    pub p99_max_drawdown: f64,
    /// Fraction of simulations whose max drawdown reached 50%.
    pub ruin_probability: f64,
}

/// Bootstrap equity-curve reconstruction: at each step sample one trade's
/// R with replacement, track the max fractional drawdown.
pub fn monte_carlo_drawdown(r_multiples: &[f64], seed: u64) -> MonteCarloReport {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let n = r_multiples.len();
    let mut max_dds = Vec::with_capacity(RESAMPLES);

    if n > 0 {
        for _ in 0..RESAMPLES {
            let mut equity = MC_STARTING_EQUITY;
            let mut peak = equity;
            let mut max_dd: f64 = 0.0;
            for _ in 0..n {
                equity += r_multiples[rng.gen_range(0..n)];
                equity = equity.max(0.0);
                peak = peak.max(equity);
                if peak > 0.0 {
                    max_dd = max_dd.max((peak - equity) / peak);
                }
            }
            max_dds.push(max_dd);
        }
    }

    let s = sorted(&max_dds);
    let ruined = max_dds.iter().filter(|dd| **dd >= RUIN_DRAWDOWN).count();
    MonteCarloReport {
        simulations: RESAMPLES,
        seed,
        mean_max_drawdown: mean(&max_dds),
        median_max_drawdown: percentile(&s, 0.5),
        p95_max_drawdown: percentile(&s, 0.95),
        p99_max_drawdown: percentile(&s, 0.99),
        ruin_probability: if max_dds.is_empty() {
            0.0
        } else {
            ruined as f64 / max_dds.len() as f64
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureLift {
    pub feature: String,
    pub observations: usize,
    pub median: f64,
    pub low_half_win_rate: f64,
    pub high_half_win_rate: f64,
    pub lift: f64,
    pub significant: bool,
}

/// Median-split attribution: does the upper half of a feature's values
/// win more often than the lower half?
pub fn feature_attribution(
    samples: &[(HashMap<String, f64>, f64)],
) -> Vec<FeatureLift> {
    let mut by_feature: HashMap<String, Vec<(f64, f64)>> = HashMap::new();
    for (features, r) in samples {
        for (name, value) in features {
            by_feature
                .entry(name.clone())
                .or_default()
                .push((*value, *r));
        }
    }

    let mut lifts: Vec<FeatureLift> = by_feature
        .into_iter()
        .filter(|(_, pairs)| pairs.len() >= 20)
        .map(|(feature, pairs)| {
            let values = sorted(&pairs.iter().map(|(v, _)| *v).collect::<Vec<_>>());
            let median = if values.len() % 2 == 1 {
                values[values.len() / 2]
            } else {
                (values[values.len() / 2 - 1] + values[values.len() / 2]) / 2.0
            };

            let low: Vec<f64> = pairs
                .iter()
                .filter(|(v, _)| *v <= median)
                .map(|(_, r)| *r)
                .collect();
            let high: Vec<f64> = pairs
                .iter()
                .filter(|(v, _)| *v > median)
                .map(|(_, r)| *r)
                .collect();

            let low_half_win_rate = win_rate(&low);
            let high_half_win_rate = win_rate(&high);
            let lift = high_half_win_rate - low_half_win_rate;
            FeatureLift {
                feature,
                observations: pairs.len(),
                median,
                low_half_win_rate,
                high_half_win_rate,
                lift,
                significant: lift.abs() > 0.05 && low.len() >= 10 && high.len() >= 10,
            }
        })
        .collect();
    lifts.sort_by(|a, b| {
        b.lift
            .abs()
            .partial_cmp(&a.lift.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    lifts
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeMetricsValues {
    pub recovery_factor: f64,
    pub cvar: f64,
    pub skewness: f64,
    pub ulcer_index: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeMetricsReport {
    pub alpha: f64,
    pub metrics: EdgeMetricsValues,
}

/// Summary metrics over a raw outcome series.
///
/// Recovery factor is total return over the worst fractional drawdown;
/// CVaR is the mean of the worst `alpha` tail (reported signed);
/// skewness is the population third moment; the ulcer index is the RMS
/// fractional drawdown.
pub fn edge_metrics(outcomes: &[f64], alpha: f64) -> EdgeMetricsReport {
    let mut equity = Vec::with_capacity(outcomes.len());
    let mut cumulative = 0.0;
    for r in outcomes {
        cumulative += r;
        equity.push(cumulative);
    }

    let drawdowns = fractional_drawdowns(&equity);
    let max_dd = drawdowns.iter().copied().fold(0.0, f64::max);
    let recovery_factor = if max_dd > f64::EPSILON {
        cumulative / max_dd
    } else {
        0.0
    };

    let cvar = {
        let s = sorted(outcomes);
        if s.is_empty() {
            0.0
        } else {
            let tail = ((alpha * s.len() as f64).ceil() as usize).max(1);
            mean(&s[..tail])
        }
    };

    let skewness = {
        let m2 = outcomes
            .iter()
            .map(|r| (r - mean(outcomes)).powi(2))
            .sum::<f64>()
            / outcomes.len().max(1) as f64;
        let m3 = outcomes
            .iter()
            .map(|r| (r - mean(outcomes)).powi(3))
            .sum::<f64>()
            / outcomes.len().max(1) as f64;
        if m2 > f64::EPSILON {
            m3 / m2.powf(1.5)
        } else {
            0.0
        }
    };

    let ulcer_index = if drawdowns.is_empty() {
        0.0
    } else {
        (drawdowns.iter().map(|dd| dd * dd).sum::<f64>() / drawdowns.len() as f64).sqrt()
    };

    EdgeMetricsReport {
        alpha,
        metrics: EdgeMetricsValues {
            recovery_factor,
            cvar,
            skewness,
            ulcer_index,
        },
    }
}
