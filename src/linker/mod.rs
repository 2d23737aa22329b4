//! Execution auto-linker
//!
//! Ties fills back to the evaluations that motivated them. An explicit
//! evaluation id on the order wins outright; otherwise a time + direction
//! + price heuristic picks the best recent candidate. Commission reports
//! debounce a per-correlation position-close check that records the
//! realised outcome once the position nets to flat.

use crate::errors::CoreResult;
use crate::models::{
    r_multiple, DecisionType, Direction, EvalExecutionLink, ExecSide, ExecutionRecord, LinkType,
    Outcome,
};
use crate::storage::{EvalCandidate, TradeStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Heuristic candidates must precede the fill by at most this much.
const LINK_WINDOW_MIN: i64 = 30;
/// Heuristic links below this confidence are rejected.
const MIN_LINK_CONFIDENCE: f64 = 0.1;
/// A position is closed once |net shares| falls under this.
const FLAT_EPSILON: f64 = 1e-3;

/// Work fed to the linker by the persistent listeners
#[derive(Debug)]
pub enum LinkerEvent {
    Execution(ExecutionRecord),
    Commission { exec_id: String },
}

/// Net signed share count: BOT adds, SLD subtracts.
pub fn position_net(execs: &[ExecutionRecord]) -> f64 {
    execs
        .iter()
        .map(|e| match e.side {
            ExecSide::Bought => e.shares,
            ExecSide::Sold => -e.shares,
        })
        .sum()
}

pub fn is_position_closed(execs: &[ExecutionRecord]) -> bool {
    !execs.is_empty() && position_net(execs).abs() < FLAT_EPSILON
}

/// Share-weighted average price over one side's fills.
pub fn side_vwap(execs: &[ExecutionRecord], side: ExecSide) -> Option<f64> {
    let mut shares = 0.0;
    let mut notional = 0.0;
    for exec in execs.iter().filter(|e| e.side == side) {
        shares += exec.shares;
        notional += exec.price * exec.shares;
    }
    (shares > 0.0).then(|| notional / shares)
}

/// Confidence that `candidate` motivated this fill: 70% linear time decay
/// over the 30-minute window, 30% price proximity to the intended entry.
pub fn heuristic_confidence(
    exec_time: DateTime<Utc>,
    exec_price: f64,
    exec_direction: Direction,
    candidate: &EvalCandidate,
) -> Option<f64> {
    if let Some(direction) = candidate.direction {
        if direction != exec_direction {
            return None;
        }
    }
    let age = exec_time - candidate.created_at;
    if age < ChronoDuration::zero() || age > ChronoDuration::minutes(LINK_WINDOW_MIN) {
        return None;
    }

    let window_ms = (LINK_WINDOW_MIN * 60 * 1000) as f64;
    let time_score = 1.0 - age.num_milliseconds() as f64 / window_ms;
    let price_score = match candidate.entry_price {
        Some(entry) if entry > 0.0 => {
            (1.0 - (exec_price - entry).abs() / entry * 10.0).max(0.0)
        }
        _ => 0.0,
    };
    Some(0.7 * time_score + 0.3 * price_score)
}

pub struct AutoLinker {
    store: Arc<TradeStore>,
    debounce: Duration,
    close_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    outcome_tx: Mutex<Option<mpsc::UnboundedSender<Outcome>>>,
}

impl AutoLinker {
    pub fn new(store: Arc<TradeStore>) -> Arc<Self> {
        Self::with_debounce(store, Duration::from_secs(2))
    }

    pub fn with_debounce(store: Arc<TradeStore>, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            debounce,
            close_timers: Mutex::new(HashMap::new()),
            outcome_tx: Mutex::new(None),
        })
    }

    /// Freshly recorded outcomes are forwarded here (recalibration, drift).
    pub fn set_outcome_sink(&self, tx: mpsc::UnboundedSender<Outcome>) {
        *self.outcome_tx.lock() = Some(tx);
    }

    /// Consume listener events until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<LinkerEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                LinkerEvent::Execution(exec) => {
                    if let Err(e) = self.try_link_execution(&exec) {
                        warn!(exec_id = exec.exec_id, error = %e, "linking failed");
                    }
                }
                LinkerEvent::Commission { exec_id } => match self.store.get_execution(&exec_id) {
                    Ok(Some(exec)) => self.schedule_close_check(exec.correlation_id.clone()),
                    Ok(None) => debug!(exec_id, "commission for unknown execution"),
                    Err(e) => warn!(exec_id, error = %e, "execution lookup failed"),
                },
            }
        }
    }

    /// Link one execution to its evaluation: explicit id first, heuristic
    /// fallback. Duplicate (evaluation, order) links are silently skipped.
    pub fn try_link_execution(&self, exec: &ExecutionRecord) -> CoreResult<()> {
        let order = match self.store.get_order(exec.order_id)? {
            Some(order) => order,
            None => return Ok(()),
        };

        if let Some(eval_id) = &order.evaluation_id {
            if let Some(eval) = self.store.get_evaluation(eval_id)? {
                let inserted = self.store.insert_link(&EvalExecutionLink {
                    evaluation_id: eval.id.clone(),
                    order_id: exec.order_id,
                    exec_id: exec.exec_id.clone(),
                    link_type: LinkType::Explicit,
                    confidence: 1.0,
                    symbol: exec.symbol.clone(),
                    direction: Some(eval.direction),
                    created_at: Utc::now(),
                })?;
                if inserted {
                    info!(
                        eval_id = eval.id,
                        order_id = exec.order_id,
                        "explicit eval link recorded"
                    );
                }
                return Ok(());
            }
        }

        let exec_direction = exec.side.implied_direction();
        let since = exec.executed_at - ChronoDuration::minutes(LINK_WINDOW_MIN);
        let candidates = self
            .store
            .get_recent_evals_for_symbol(&exec.symbol, since)?;

        let best = candidates
            .iter()
            .filter_map(|candidate| {
                heuristic_confidence(exec.executed_at, exec.price, exec_direction, candidate)
                    .map(|confidence| (confidence, candidate))
            })
            .max_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.created_at.cmp(&b.1.created_at))
                    .then_with(|| a.1.id.cmp(&b.1.id))
            });

        if let Some((confidence, candidate)) = best {
            if confidence < MIN_LINK_CONFIDENCE {
                debug!(
                    exec_id = exec.exec_id,
                    confidence, "best heuristic candidate below threshold"
                );
                return Ok(());
            }
            let inserted = self.store.insert_link(&EvalExecutionLink {
                evaluation_id: candidate.id.clone(),
                order_id: exec.order_id,
                exec_id: exec.exec_id.clone(),
                link_type: LinkType::Heuristic,
                confidence,
                symbol: exec.symbol.clone(),
                direction: candidate.direction,
                created_at: Utc::now(),
            })?;
            if inserted {
                info!(
                    eval_id = candidate.id,
                    order_id = exec.order_id,
                    confidence,
                    "heuristic eval link recorded"
                );
            }
        }
        Ok(())
    }

    /// Debounced per correlation id; a newer commission report replaces
    /// the live timer so the check runs once per burst of fills.
    pub fn schedule_close_check(self: &Arc<Self>, correlation_id: String) {
        let linker = Arc::clone(self);
        let key = correlation_id.clone();
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            linker.close_timers.lock().remove(&key);
            if let Err(e) = linker.check_position_closed(&key) {
                warn!(correlation_id = key, error = %e, "close check failed");
            }
        });
        if let Some(previous) = self
            .close_timers
            .lock()
            .insert(correlation_id, handle)
        {
            previous.abort();
        }
    }

    /// If the correlation's fills net to flat and a linked evaluation has
    /// no outcome yet, compute VWAP entry/exit and record the R-multiple.
    pub fn check_position_closed(&self, correlation_id: &str) -> CoreResult<()> {
        let execs = self.store.get_executions_by_correlation(correlation_id)?;
        if !is_position_closed(&execs) {
            return Ok(());
        }

        let Some(eval_id) = self.linked_eval_for_correlation(correlation_id)? else {
            debug!(correlation_id, "closed position has no linked evaluation");
            return Ok(());
        };
        if self.store.get_outcome_for_eval(&eval_id)?.is_some() {
            return Ok(());
        }
        let Some(eval) = self.store.get_evaluation(&eval_id)? else {
            return Ok(());
        };

        let Some(outcome) = build_close_outcome(&eval_id, eval.direction, eval.stop_price, &execs, "auto_detected")
        else {
            return Ok(());
        };

        if self.store.insert_outcome(&outcome)? {
            info!(
                eval_id,
                r_multiple = ?outcome.r_multiple,
                "position closed, outcome recorded"
            );
            if let Some(tx) = self.outcome_tx.lock().as_ref() {
                let _ = tx.send(outcome);
            }
        }
        Ok(())
    }

    fn linked_eval_for_correlation(&self, correlation_id: &str) -> CoreResult<Option<String>> {
        for order in self.store.get_orders_by_correlation(correlation_id)? {
            let links = self.store.get_links_for_order(order.order_id)?;
            if let Some(link) = links.first() {
                return Ok(Some(link.evaluation_id.clone()));
            }
        }
        Ok(None)
    }

    /// Startup pass for positions that closed while the process was
    /// offline: any linked, outcome-less evaluation whose correlation
    /// nets to flat gets a reconciliation outcome.
    pub fn reconcile_offline(&self) -> CoreResult<usize> {
        let mut recorded = 0;
        for eval in self.store.get_recent_evaluations(200)? {
            if self.store.get_links_for_eval(&eval.id)?.is_empty() {
                continue;
            }
            if self.store.get_outcome_for_eval(&eval.id)?.is_some() {
                continue;
            }
            let Some(link) = self.store.get_links_for_eval(&eval.id)?.into_iter().next() else {
                continue;
            };
            let Some(order) = self.store.get_order(link.order_id)? else {
                continue;
            };
            let execs = self
                .store
                .get_executions_by_correlation(&order.correlation_id)?;
            if !is_position_closed(&execs) {
                continue;
            }
            let Some(outcome) = build_close_outcome(
                &eval.id,
                eval.direction,
                eval.stop_price,
                &execs,
                "reconcile_closed_offline",
            ) else {
                continue;
            };
            if self.store.insert_outcome(&outcome)? {
                recorded += 1;
                if let Some(tx) = self.outcome_tx.lock().as_ref() {
                    let _ = tx.send(outcome);
                }
            }
        }
        if recorded > 0 {
            info!(recorded, "offline close reconciliation complete");
        }
        Ok(recorded)
    }
}

/// VWAP entry/exit and R-multiple for a flat correlation.
fn build_close_outcome(
    eval_id: &str,
    direction: Direction,
    stop_price: Option<f64>,
    execs: &[ExecutionRecord],
    exit_reason: &str,
) -> Option<Outcome> {
    let buy_vwap = side_vwap(execs, ExecSide::Bought)?;
    let sell_vwap = side_vwap(execs, ExecSide::Sold)?;
    let (entry, exit) = match direction {
        Direction::Long => (buy_vwap, sell_vwap),
        Direction::Short => (sell_vwap, buy_vwap),
    };
    let r = stop_price.and_then(|stop| r_multiple(direction, entry, stop, exit));
    Some(Outcome {
        evaluation_id: eval_id.to_string(),
        trade_taken: true,
        decision_type: DecisionType::TookTrade,
        actual_entry: Some(entry),
        actual_exit: Some(exit),
        r_multiple: r,
        exit_reason: Some(exit_reason.to_string()),
        recorded_at: Utc::now(),
    })
}
