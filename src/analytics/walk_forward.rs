//! Walk-forward weight validation
//!
//! Slides a (train, test) window over historical trade-taken
//! evaluations. Each train slice runs a coarse grid search over provider
//! weight triples and penalty coefficients, re-scoring stored model
//! outputs through the production scorer; the winning tuple is then
//! judged out-of-sample on the test slice.

use crate::ensemble::scorer::{score_ensemble, ProviderScore};
use crate::models::ProviderId;
use crate::storage::SimulationRecord;
use serde::Serialize;
use std::collections::HashMap;

/// Grid search penalty candidates.
const PENALTY_GRID: [f64; 4] = [0.5, 1.0, 1.5, 2.0];
/// A tuple needs this many accepted train trades to qualify.
const MIN_TRAIN_TRADES: usize = 5;
const ANNUALIZE: f64 = 252.0;

#[derive(Debug, Clone)]
pub struct WalkForwardConfig {
    pub train_size: usize,
    pub test_size: usize,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            train_size: 40,
            test_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowResult {
    pub window_index: usize,
    pub best_weights: HashMap<ProviderId, f64>,
    pub best_penalty_k: f64,
    pub train_expectancy: f64,
    pub test_trades: usize,
    pub win_rate: f64,
    pub avg_r: f64,
    pub sharpe: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardReport {
    pub windows: Vec<WindowResult>,
    pub evaluations_used: usize,
    /// At least 60% of windows beat a coin flip out of sample.
    pub edge_stable: bool,
    /// Later windows' win rate fell visibly below earlier windows'.
    pub edge_decay_detected: bool,
}

/// Weight triples in 0.1 steps, each at least 0.05, summing to 1.
fn weight_grid() -> Vec<HashMap<ProviderId, f64>> {
    let mut grid = Vec::new();
    for i in 0..=10u32 {
        for j in 0..=(10 - i) {
            let k = 10 - i - j;
            let (a, b, c) = (i as f64 / 10.0, j as f64 / 10.0, k as f64 / 10.0);
            if a < 0.05 || b < 0.05 || c < 0.05 {
                continue;
            }
            grid.push(HashMap::from([
                (ProviderId::Claude, a),
                (ProviderId::Gpt, b),
                (ProviderId::Gemini, c),
            ]));
        }
    }
    grid
}

fn provider_scores(record: &SimulationRecord) -> Vec<ProviderScore> {
    record
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
        .collect()
}

/// R-multiples of the records a weight tuple would have traded.
fn accepted_rs(
    records: &[SimulationRecord],
    weights: &HashMap<ProviderId, f64>,
    penalty_k: f64,
) -> Vec<f64> {
    records
        .iter()
        .filter_map(|record| {
            let scores = provider_scores(record);
            let ensemble = score_ensemble(&scores, weights, penalty_k).ok()?;
            if !ensemble.should_trade {
                return None;
            }
            record.outcome.as_ref()?.r_multiple
        })
        .collect()
}

fn expectancy(rs: &[f64]) -> f64 {
    if rs.is_empty() {
        return 0.0;
    }
    let wins: Vec<f64> = rs.iter().copied().filter(|r| *r > 0.0).collect();
    let losses: Vec<f64> = rs.iter().copied().filter(|r| *r <= 0.0).collect();
    let win_rate = wins.len() as f64 / rs.len() as f64;
    let avg_win = if wins.is_empty() {
        0.0
    } else {
        wins.iter().sum::<f64>() / wins.len() as f64
    };
    let avg_loss = if losses.is_empty() {
        0.0
    } else {
        (losses.iter().sum::<f64>() / losses.len() as f64).abs()
    };
    win_rate * avg_win - (1.0 - win_rate) * avg_loss
}

fn slice_stats(rs: &[f64]) -> (f64, f64, f64) {
    if rs.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let win_rate = rs.iter().filter(|r| **r > 0.0).count() as f64 / rs.len() as f64;
    let avg = rs.iter().sum::<f64>() / rs.len() as f64;
    let variance = rs.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / rs.len() as f64;
    let sharpe = if variance.sqrt() < f64::EPSILON {
        0.0
    } else {
        avg / variance.sqrt() * ANNUALIZE.sqrt()
    };
    (win_rate, avg, sharpe)
}

/// Run the full walk-forward pass over chronologically ordered records.
/// Records without a trade-taken outcome and known R are dropped first.
pub fn run_walk_forward(
    records: &[SimulationRecord],
    config: &WalkForwardConfig,
) -> WalkForwardReport {
    let tradeable: Vec<&SimulationRecord> = records
        .iter()
        .filter(|record| {
            record
                .outcome
                .as_ref()
                .is_some_and(|o| o.trade_taken && o.r_multiple.is_some())
        })
        .collect();

    let grid = weight_grid();
    let mut windows = Vec::new();
    let window_len = config.train_size + config.test_size;

    let mut start = 0;
    while start + window_len <= tradeable.len() {
        let train: Vec<SimulationRecord> = tradeable[start..start + config.train_size]
            .iter()
            .map(|r| (*r).clone())
            .collect();
        let test: Vec<SimulationRecord> = tradeable
            [start + config.train_size..start + window_len]
            .iter()
            .map(|r| (*r).clone())
            .collect();

        let mut best: Option<(HashMap<ProviderId, f64>, f64, f64)> = None;
        for weights in &grid {
            for penalty_k in PENALTY_GRID {
                let rs = accepted_rs(&train, weights, penalty_k);
                if rs.len() < MIN_TRAIN_TRADES {
                    continue;
                }
                let train_expectancy = expectancy(&rs);
                let better = best
                    .as_ref()
                    .map_or(true, |(_, _, current)| train_expectancy > *current);
                if better {
                    best = Some((weights.clone(), penalty_k, train_expectancy));
                }
            }
        }

        if let Some((best_weights, best_penalty_k, train_expectancy)) = best {
            let test_rs = accepted_rs(&test, &best_weights, best_penalty_k);
            let (win_rate, avg_r, sharpe) = slice_stats(&test_rs);
            windows.push(WindowResult {
                window_index: windows.len(),
                best_weights,
                best_penalty_k,
                train_expectancy,
                test_trades: test_rs.len(),
                win_rate,
                avg_r,
                sharpe,
            });
        }

        start += config.test_size;
    }

    let edge_stable = !windows.is_empty() && {
        let positive = windows.iter().filter(|w| w.win_rate > 0.5).count();
        positive as f64 / windows.len() as f64 >= 0.6
    };

    let edge_decay_detected = windows.len() >= 4 && {
        let rates: Vec<f64> = windows.iter().map(|w| w.win_rate).collect();
        let half = rates.len() / 2;
        let first = rates[..half].iter().sum::<f64>() / half as f64;
        let second = rates[half..].iter().sum::<f64>() / (rates.len() - half) as f64;
        second < first - 0.05
    };

    WalkForwardReport {
        windows,
        evaluations_used: tradeable.len(),
        edge_stable,
        edge_decay_detected,
    }
}
