//! Durable store adapter
//!
//! SQLite-backed persistence for evaluations, model outputs, outcomes,
//! orders, executions, eval-execution links and weight history. All
//! inserts are idempotent on their natural keys; callers never need a
//! global lock. WAL mode keeps reads concurrent with writes.

use crate::errors::{CoreError, CoreResult};
use crate::models::{
    DecisionType, Direction, EnsembleResult, EvalExecutionLink, Evaluation, ExecSide,
    ExecutionRecord, FeatureVector, LinkType, ModelOutput, OrderRecord, OrderSide, Outcome,
    ProviderId, WeightSnapshot,
};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS evaluations (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    direction TEXT NOT NULL,
    entry_price REAL,
    stop_price REAL,
    created_at INTEGER NOT NULL,
    features_json TEXT NOT NULL,
    ensemble_json TEXT NOT NULL,
    weights_json TEXT NOT NULL,
    guardrail_allowed INTEGER NOT NULL,
    prefilter_passed INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_evals_symbol_time
    ON evaluations(symbol, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_evals_time
    ON evaluations(created_at DESC);

CREATE TABLE IF NOT EXISTS model_outputs (
    evaluation_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    raw_response TEXT NOT NULL,
    compliant INTEGER NOT NULL,
    error TEXT,
    latency_ms INTEGER NOT NULL,
    trade_score REAL,
    component_risks_json TEXT,
    expected_rr REAL,
    confidence REAL,
    should_trade INTEGER,
    reasoning TEXT,
    model_version TEXT,
    prompt_hash TEXT,
    token_count INTEGER,
    response_id TEXT,
    PRIMARY KEY (evaluation_id, provider)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS outcomes (
    evaluation_id TEXT PRIMARY KEY,
    trade_taken INTEGER NOT NULL,
    decision_type TEXT NOT NULL,
    actual_entry REAL,
    actual_exit REAL,
    r_multiple REAL,
    exit_reason TEXT,
    recorded_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS orders (
    order_id INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    quantity REAL NOT NULL,
    limit_price REAL,
    aux_price REAL,
    trailing_percent REAL,
    time_in_force TEXT NOT NULL,
    parent_order_id INTEGER,
    oca_group TEXT,
    oca_type INTEGER,
    status TEXT NOT NULL,
    filled_quantity REAL NOT NULL DEFAULT 0,
    avg_fill_price REAL,
    strategy_version TEXT,
    order_source TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    evaluation_id TEXT,
    journal_id TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_correlation
    ON orders(correlation_id);

CREATE TABLE IF NOT EXISTS executions (
    exec_id TEXT PRIMARY KEY,
    order_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    shares REAL NOT NULL,
    price REAL NOT NULL,
    cum_qty REAL NOT NULL,
    avg_price REAL NOT NULL,
    account TEXT,
    commission REAL,
    realized_pnl REAL,
    executed_at INTEGER NOT NULL,
    correlation_id TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_execs_correlation
    ON executions(correlation_id, executed_at);
CREATE INDEX IF NOT EXISTS idx_execs_order
    ON executions(order_id);

CREATE TABLE IF NOT EXISTS eval_execution_links (
    evaluation_id TEXT NOT NULL,
    order_id INTEGER NOT NULL,
    exec_id TEXT NOT NULL,
    link_type TEXT NOT NULL,
    confidence REAL NOT NULL,
    symbol TEXT NOT NULL,
    direction TEXT,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (evaluation_id, order_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_links_order
    ON eval_execution_links(order_id);

CREATE TABLE IF NOT EXISTS weight_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    weights_json TEXT NOT NULL,
    penalty_k REAL NOT NULL,
    reason TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
);
"#;

fn to_json<T: Serialize>(value: &T) -> CoreResult<String> {
    serde_json::to_string(value).map_err(|e| CoreError::Other(anyhow::anyhow!(e)))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> CoreResult<T> {
    serde_json::from_str(raw).map_err(|e| CoreError::Other(anyhow::anyhow!(e)))
}

fn ts_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Candidate evaluation for heuristic linking
#[derive(Debug, Clone, Serialize)]
pub struct EvalCandidate {
    pub id: String,
    pub symbol: String,
    pub direction: Option<Direction>,
    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// One (provider, confidence, realised R) row for drift analysis
#[derive(Debug, Clone, Serialize)]
pub struct DriftRow {
    pub provider: ProviderId,
    pub confidence: f64,
    pub r_multiple: f64,
}

/// Everything needed to re-score one historical evaluation
#[derive(Debug, Clone)]
pub struct SimulationRecord {
    pub evaluation: Evaluation,
    pub model_outputs: Vec<ModelOutput>,
    pub outcome: Option<Outcome>,
}

/// SQLite-backed durable store. Cheap to clone via `Arc`.
pub struct TradeStore {
    conn: Mutex<Connection>,
}

impl TradeStore {
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!(path = %path.as_ref().display(), "trade store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---------------------------------------------------------------------
    // Orders
    // ---------------------------------------------------------------------

    /// Idempotent on order id.
    pub fn insert_order(&self, order: &OrderRecord) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT OR IGNORE INTO orders (
                order_id, symbol, side, order_type, quantity, limit_price,
                aux_price, trailing_percent, time_in_force, parent_order_id,
                oca_group, oca_type, status, filled_quantity, avg_fill_price,
                strategy_version, order_source, correlation_id, evaluation_id,
                journal_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        )?
        .execute(params![
            order.order_id,
            order.symbol,
            order.side.as_str(),
            order.order_type,
            order.quantity,
            order.limit_price,
            order.aux_price,
            order.trailing_percent,
            order.time_in_force,
            order.parent_order_id,
            order.oca_group,
            order.oca_type,
            order.status,
            order.filled_quantity,
            order.avg_fill_price,
            order.strategy_version,
            order.order_source,
            order.correlation_id,
            order.evaluation_id,
            order.journal_id,
            ts_millis(order.created_at),
        ])?;
        Ok(())
    }

    pub fn update_order_status(
        &self,
        order_id: i64,
        status: &str,
        filled: Option<f64>,
        avg_price: Option<f64>,
    ) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE orders SET
                status = ?2,
                filled_quantity = COALESCE(?3, filled_quantity),
                avg_fill_price = COALESCE(?4, avg_fill_price)
             WHERE order_id = ?1",
        )?
        .execute(params![order_id, status, filled, avg_price])?;
        Ok(())
    }

    /// Overwrite the mutable order fields after a confirmed modify.
    pub fn update_order_fields(&self, order: &OrderRecord) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE orders SET
                quantity = ?2, limit_price = ?3, aux_price = ?4,
                trailing_percent = ?5, time_in_force = ?6, status = ?7
             WHERE order_id = ?1",
        )?
        .execute(params![
            order.order_id,
            order.quantity,
            order.limit_price,
            order.aux_price,
            order.trailing_percent,
            order.time_in_force,
            order.status,
        ])?;
        Ok(())
    }

    pub fn get_order(&self, order_id: i64) -> CoreResult<Option<OrderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM orders WHERE order_id = ?1")?;
        stmt.query_row([order_id], Self::row_to_order)
            .optional()
            .map_err(CoreError::from)
    }

    pub fn get_orders_by_correlation(&self, correlation_id: &str) -> CoreResult<Vec<OrderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM orders WHERE correlation_id = ?1 ORDER BY order_id",
        )?;
        let rows = stmt
            .query_map([correlation_id], Self::row_to_order)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_order(row: &Row<'_>) -> rusqlite::Result<OrderRecord> {
        let side: String = row.get("side")?;
        Ok(OrderRecord {
            order_id: row.get("order_id")?,
            symbol: row.get("symbol")?,
            side: OrderSide::parse(&side).unwrap_or(OrderSide::Buy),
            order_type: row.get("order_type")?,
            quantity: row.get("quantity")?,
            limit_price: row.get("limit_price")?,
            aux_price: row.get("aux_price")?,
            trailing_percent: row.get("trailing_percent")?,
            time_in_force: row.get("time_in_force")?,
            parent_order_id: row.get("parent_order_id")?,
            oca_group: row.get("oca_group")?,
            oca_type: row.get("oca_type")?,
            status: row.get("status")?,
            filled_quantity: row.get("filled_quantity")?,
            avg_fill_price: row.get("avg_fill_price")?,
            strategy_version: row.get("strategy_version")?,
            order_source: row.get("order_source")?,
            correlation_id: row.get("correlation_id")?,
            evaluation_id: row.get("evaluation_id")?,
            journal_id: row.get("journal_id")?,
            created_at: from_millis(row.get("created_at")?),
        })
    }

    // ---------------------------------------------------------------------
    // Executions
    // ---------------------------------------------------------------------

    /// Idempotent on exec id.
    pub fn insert_execution(&self, exec: &ExecutionRecord) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT OR IGNORE INTO executions (
                exec_id, order_id, symbol, side, shares, price, cum_qty,
                avg_price, account, commission, realized_pnl, executed_at,
                correlation_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?
        .execute(params![
            exec.exec_id,
            exec.order_id,
            exec.symbol,
            exec.side.as_str(),
            exec.shares,
            exec.price,
            exec.cum_qty,
            exec.avg_price,
            exec.account,
            exec.commission,
            exec.realized_pnl,
            ts_millis(exec.executed_at),
            exec.correlation_id,
        ])?;
        Ok(())
    }

    pub fn update_execution_commission(
        &self,
        exec_id: &str,
        commission: f64,
        realized_pnl: Option<f64>,
    ) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE executions SET
                commission = ?2,
                realized_pnl = COALESCE(?3, realized_pnl)
             WHERE exec_id = ?1",
        )?
        .execute(params![exec_id, commission, realized_pnl])?;
        Ok(())
    }

    pub fn get_execution(&self, exec_id: &str) -> CoreResult<Option<ExecutionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM executions WHERE exec_id = ?1")?;
        stmt.query_row([exec_id], Self::row_to_execution)
            .optional()
            .map_err(CoreError::from)
    }

    pub fn get_executions_by_correlation(
        &self,
        correlation_id: &str,
    ) -> CoreResult<Vec<ExecutionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM executions WHERE correlation_id = ?1 ORDER BY executed_at, exec_id",
        )?;
        let rows = stmt
            .query_map([correlation_id], Self::row_to_execution)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
        let side: String = row.get("side")?;
        Ok(ExecutionRecord {
            exec_id: row.get("exec_id")?,
            order_id: row.get("order_id")?,
            symbol: row.get("symbol")?,
            side: ExecSide::parse(&side).unwrap_or(ExecSide::Bought),
            shares: row.get("shares")?,
            price: row.get("price")?,
            cum_qty: row.get("cum_qty")?,
            avg_price: row.get("avg_price")?,
            account: row.get("account")?,
            commission: row.get("commission")?,
            realized_pnl: row.get("realized_pnl")?,
            executed_at: from_millis(row.get("executed_at")?),
            correlation_id: row.get("correlation_id")?,
        })
    }

    // ---------------------------------------------------------------------
    // Evaluations & model outputs
    // ---------------------------------------------------------------------

    /// Idempotent on evaluation id. Evaluations are immutable once written.
    pub fn insert_evaluation(&self, eval: &Evaluation) -> CoreResult<()> {
        let features = to_json(&eval.features)?;
        let ensemble = to_json(&eval.ensemble)?;
        let weights = to_json(&eval.weights_used)?;
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT OR IGNORE INTO evaluations (
                id, symbol, direction, entry_price, stop_price, created_at,
                features_json, ensemble_json, weights_json, guardrail_allowed,
                prefilter_passed
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?
        .execute(params![
            eval.id,
            eval.symbol,
            eval.direction.as_str(),
            eval.entry_price,
            eval.stop_price,
            ts_millis(eval.created_at),
            features,
            ensemble,
            weights,
            eval.guardrail_allowed as i64,
            eval.prefilter_passed as i64,
        ])?;
        Ok(())
    }

    pub fn insert_model_output(&self, output: &ModelOutput) -> CoreResult<()> {
        let risks = output
            .component_risks
            .as_ref()
            .map(to_json)
            .transpose()?;
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT OR IGNORE INTO model_outputs (
                evaluation_id, provider, raw_response, compliant, error,
                latency_ms, trade_score, component_risks_json, expected_rr,
                confidence, should_trade, reasoning, model_version,
                prompt_hash, token_count, response_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16)",
        )?
        .execute(params![
            output.evaluation_id,
            output.provider.as_str(),
            output.raw_response,
            output.compliant as i64,
            output.error,
            output.latency_ms,
            output.trade_score,
            risks,
            output.expected_rr,
            output.confidence,
            output.should_trade.map(|b| b as i64),
            output.reasoning,
            output.model_version,
            output.prompt_hash,
            output.token_count,
            output.response_id,
        ])?;
        Ok(())
    }

    pub fn get_evaluation(&self, id: &str) -> CoreResult<Option<Evaluation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM evaluations WHERE id = ?1")?;
        let raw = stmt
            .query_row([id], Self::row_to_eval_raw)
            .optional()?;
        raw.map(Self::eval_from_raw).transpose()
    }

    pub fn get_model_outputs(&self, evaluation_id: &str) -> CoreResult<Vec<ModelOutput>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM model_outputs WHERE evaluation_id = ?1 ORDER BY provider",
        )?;
        let rows = stmt
            .query_map([evaluation_id], Self::row_to_model_output)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Candidates for heuristic linking: same symbol, created since `since`.
    pub fn get_recent_evals_for_symbol(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> CoreResult<Vec<EvalCandidate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, direction, entry_price, stop_price, created_at
             FROM evaluations
             WHERE symbol = ?1 AND created_at >= ?2
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![symbol, ts_millis(since)], |row| {
                let direction: String = row.get("direction")?;
                Ok(EvalCandidate {
                    id: row.get("id")?,
                    symbol: row.get("symbol")?,
                    direction: Direction::parse(&direction),
                    entry_price: row.get("entry_price")?,
                    stop_price: row.get("stop_price")?,
                    created_at: from_millis(row.get("created_at")?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_model_output(row: &Row<'_>) -> rusqlite::Result<ModelOutput> {
        let provider: String = row.get("provider")?;
        let risks: Option<String> = row.get("component_risks_json")?;
        Ok(ModelOutput {
            evaluation_id: row.get("evaluation_id")?,
            provider: ProviderId::parse(&provider).unwrap_or(ProviderId::Gpt),
            raw_response: row.get("raw_response")?,
            compliant: row.get::<_, i64>("compliant")? != 0,
            error: row.get("error")?,
            latency_ms: row.get("latency_ms")?,
            trade_score: row.get("trade_score")?,
            component_risks: risks.and_then(|r| serde_json::from_str(&r).ok()),
            expected_rr: row.get("expected_rr")?,
            confidence: row.get("confidence")?,
            should_trade: row
                .get::<_, Option<i64>>("should_trade")?
                .map(|v| v != 0),
            reasoning: row.get("reasoning")?,
            model_version: row.get("model_version")?,
            prompt_hash: row.get("prompt_hash")?,
            token_count: row.get("token_count")?,
            response_id: row.get("response_id")?,
        })
    }

    // ---------------------------------------------------------------------
    // Outcomes
    // ---------------------------------------------------------------------

    /// Idempotent on evaluation id. Returns true when a row was inserted,
    /// false when an outcome already existed (no-op).
    pub fn insert_outcome(&self, outcome: &Outcome) -> CoreResult<bool> {
        let conn = self.conn.lock();
        let inserted = conn
            .prepare_cached(
                "INSERT OR IGNORE INTO outcomes (
                    evaluation_id, trade_taken, decision_type, actual_entry,
                    actual_exit, r_multiple, exit_reason, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?
            .execute(params![
                outcome.evaluation_id,
                outcome.trade_taken as i64,
                outcome.decision_type.as_str(),
                outcome.actual_entry,
                outcome.actual_exit,
                outcome.r_multiple,
                outcome.exit_reason,
                ts_millis(outcome.recorded_at),
            ])?;
        Ok(inserted > 0)
    }

    pub fn get_outcome_for_eval(&self, evaluation_id: &str) -> CoreResult<Option<Outcome>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT * FROM outcomes WHERE evaluation_id = ?1")?;
        stmt.query_row([evaluation_id], Self::row_to_outcome)
            .optional()
            .map_err(CoreError::from)
    }

    pub fn get_recent_outcomes(&self, limit: usize) -> CoreResult<Vec<Outcome>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM outcomes ORDER BY recorded_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], Self::row_to_outcome)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_outcomes(&self) -> CoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM outcomes", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn row_to_outcome(row: &Row<'_>) -> rusqlite::Result<Outcome> {
        let decision: String = row.get("decision_type")?;
        Ok(Outcome {
            evaluation_id: row.get("evaluation_id")?,
            trade_taken: row.get::<_, i64>("trade_taken")? != 0,
            decision_type: DecisionType::parse(&decision).unwrap_or(DecisionType::PassedSetup),
            actual_entry: row.get("actual_entry")?,
            actual_exit: row.get("actual_exit")?,
            r_multiple: row.get("r_multiple")?,
            exit_reason: row.get("exit_reason")?,
            recorded_at: from_millis(row.get("recorded_at")?),
        })
    }

    // ---------------------------------------------------------------------
    // Links
    // ---------------------------------------------------------------------

    /// Returns false when a link for (evaluation, order) already exists.
    pub fn insert_link(&self, link: &EvalExecutionLink) -> CoreResult<bool> {
        let conn = self.conn.lock();
        let inserted = conn
            .prepare_cached(
                "INSERT OR IGNORE INTO eval_execution_links (
                    evaluation_id, order_id, exec_id, link_type, confidence,
                    symbol, direction, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?
            .execute(params![
                link.evaluation_id,
                link.order_id,
                link.exec_id,
                link.link_type.as_str(),
                link.confidence,
                link.symbol,
                link.direction.map(|d| d.as_str()),
                ts_millis(link.created_at),
            ])?;
        Ok(inserted > 0)
    }

    pub fn get_links_for_order(&self, order_id: i64) -> CoreResult<Vec<EvalExecutionLink>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM eval_execution_links WHERE order_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([order_id], Self::row_to_link)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_links_for_eval(&self, evaluation_id: &str) -> CoreResult<Vec<EvalExecutionLink>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM eval_execution_links WHERE evaluation_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([evaluation_id], Self::row_to_link)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_link(row: &Row<'_>) -> rusqlite::Result<EvalExecutionLink> {
        let link_type: String = row.get("link_type")?;
        let direction: Option<String> = row.get("direction")?;
        Ok(EvalExecutionLink {
            evaluation_id: row.get("evaluation_id")?,
            order_id: row.get("order_id")?,
            exec_id: row.get("exec_id")?,
            link_type: LinkType::parse(&link_type).unwrap_or(LinkType::Heuristic),
            confidence: row.get("confidence")?,
            symbol: row.get("symbol")?,
            direction: direction.as_deref().and_then(Direction::parse),
            created_at: from_millis(row.get("created_at")?),
        })
    }

    // ---------------------------------------------------------------------
    // Analytics queries
    // ---------------------------------------------------------------------

    /// Per-provider (confidence, realised R) pairs over the last `days`.
    pub fn get_model_outcomes_for_drift(&self, days: i64) -> CoreResult<Vec<DriftRow>> {
        let since = ts_millis(Utc::now() - chrono::Duration::days(days));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT m.provider, m.confidence, o.r_multiple
             FROM model_outputs m
             JOIN outcomes o ON o.evaluation_id = m.evaluation_id
             JOIN evaluations e ON e.id = m.evaluation_id
             WHERE o.trade_taken = 1
               AND o.r_multiple IS NOT NULL
               AND m.compliant = 1
               AND m.confidence IS NOT NULL
               AND e.created_at >= ?1
             ORDER BY e.created_at",
        )?;
        let rows = stmt
            .query_map([since], |row| {
                let provider: String = row.get(0)?;
                Ok((provider, row.get::<_, f64>(1)?, row.get::<_, f64>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(provider, confidence, r_multiple)| {
                ProviderId::parse(&provider).map(|provider| DriftRow {
                    provider,
                    confidence,
                    r_multiple,
                })
            })
            .collect())
    }

    /// Evaluations (with outputs and outcomes) for replay/simulation,
    /// oldest first.
    pub fn get_evals_for_simulation(
        &self,
        days: i64,
        symbol: Option<&str>,
    ) -> CoreResult<Vec<SimulationRecord>> {
        let since = ts_millis(Utc::now() - chrono::Duration::days(days));
        let raws: Vec<EvalRaw> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM evaluations
                 WHERE created_at >= ?1 AND (?2 IS NULL OR symbol = ?2)
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![since, symbol], Self::row_to_eval_raw)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut records = Vec::with_capacity(raws.len());
        for raw in raws {
            let evaluation = Self::eval_from_raw(raw)?;
            let model_outputs = self.get_model_outputs(&evaluation.id)?;
            let outcome = self.get_outcome_for_eval(&evaluation.id)?;
            records.push(SimulationRecord {
                evaluation,
                model_outputs,
                outcome,
            });
        }
        Ok(records)
    }

    /// Most recent evaluations regardless of symbol, newest first.
    pub fn get_recent_evaluations(&self, limit: usize) -> CoreResult<Vec<Evaluation>> {
        let raws: Vec<EvalRaw> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM evaluations ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit], Self::row_to_eval_raw)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        raws.into_iter().map(Self::eval_from_raw).collect()
    }

    // ---------------------------------------------------------------------
    // Weight history
    // ---------------------------------------------------------------------

    pub fn append_weight_history(&self, snapshot: &WeightSnapshot) -> CoreResult<()> {
        let weights = to_json(&snapshot.weights)?;
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO weight_history (weights_json, penalty_k, reason, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![
            weights,
            snapshot.penalty_k,
            snapshot.reason,
            ts_millis(snapshot.recorded_at),
        ])?;
        Ok(())
    }

    pub fn get_weight_history(&self, limit: usize) -> CoreResult<Vec<WeightSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT weights_json, penalty_k, reason, recorded_at
             FROM weight_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(weights, penalty_k, reason, recorded_at)| {
                Ok(WeightSnapshot {
                    weights: from_json(&weights)?,
                    penalty_k,
                    reason,
                    recorded_at: from_millis(recorded_at),
                })
            })
            .collect()
    }
}

/// Raw evaluation row before the JSON columns are decoded.
struct EvalRaw {
    id: String,
    symbol: String,
    direction: String,
    entry_price: Option<f64>,
    stop_price: Option<f64>,
    created_at: i64,
    features_json: String,
    ensemble_json: String,
    weights_json: String,
    guardrail_allowed: i64,
    prefilter_passed: i64,
}

impl TradeStore {
    fn row_to_eval_raw(row: &Row<'_>) -> rusqlite::Result<EvalRaw> {
        Ok(EvalRaw {
            id: row.get("id")?,
            symbol: row.get("symbol")?,
            direction: row.get("direction")?,
            entry_price: row.get("entry_price")?,
            stop_price: row.get("stop_price")?,
            created_at: row.get("created_at")?,
            features_json: row.get("features_json")?,
            ensemble_json: row.get("ensemble_json")?,
            weights_json: row.get("weights_json")?,
            guardrail_allowed: row.get("guardrail_allowed")?,
            prefilter_passed: row.get("prefilter_passed")?,
        })
    }

    fn eval_from_raw(raw: EvalRaw) -> CoreResult<Evaluation> {
        let features: FeatureVector = from_json(&raw.features_json)?;
        let ensemble: EnsembleResult = from_json(&raw.ensemble_json)?;
        let weights_used: HashMap<ProviderId, f64> = from_json(&raw.weights_json)?;
        Ok(Evaluation {
            id: raw.id,
            symbol: raw.symbol,
            direction: Direction::parse(&raw.direction).unwrap_or(Direction::Long),
            entry_price: raw.entry_price,
            stop_price: raw.stop_price,
            created_at: from_millis(raw.created_at),
            features,
            ensemble,
            weights_used,
            guardrail_allowed: raw.guardrail_allowed != 0,
            prefilter_passed: raw.prefilter_passed != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_eval(id: &str, symbol: &str) -> Evaluation {
        Evaluation {
            id: id.to_string(),
            symbol: symbol.to_string(),
            direction: Direction::Long,
            entry_price: Some(150.0),
            stop_price: Some(148.0),
            created_at: Utc::now(),
            features: FeatureVector::default(),
            ensemble: EnsembleResult {
                weighted_score: 70.0,
                median_score: 70.0,
                final_score: 68.0,
                expected_rr: Some(2.0),
                confidence: 0.8,
                should_trade: true,
                unanimous: true,
                majority_trade: true,
                score_spread: 4.0,
                disagreement_penalty: 2.0,
                providers_used: vec![ProviderId::Gpt, ProviderId::Claude],
            },
            weights_used: HashMap::from([
                (ProviderId::Gpt, 0.5),
                (ProviderId::Claude, 0.5),
            ]),
            guardrail_allowed: true,
            prefilter_passed: true,
        }
    }

    fn test_order(order_id: i64, correlation_id: &str) -> OrderRecord {
        OrderRecord {
            order_id,
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            order_type: "LMT".to_string(),
            quantity: 100.0,
            limit_price: Some(150.0),
            aux_price: None,
            trailing_percent: None,
            time_in_force: "DAY".to_string(),
            parent_order_id: None,
            oca_group: None,
            oca_type: None,
            status: "PendingSubmit".to_string(),
            filled_quantity: 0.0,
            avg_fill_price: None,
            strategy_version: None,
            order_source: "api".to_string(),
            correlation_id: correlation_id.to_string(),
            evaluation_id: None,
            journal_id: None,
            created_at: Utc::now(),
        }
    }

    fn test_exec(exec_id: &str, order_id: i64, correlation_id: &str) -> ExecutionRecord {
        ExecutionRecord {
            exec_id: exec_id.to_string(),
            order_id,
            symbol: "AAPL".to_string(),
            side: ExecSide::Bought,
            shares: 100.0,
            price: 150.05,
            cum_qty: 100.0,
            avg_price: 150.05,
            account: None,
            commission: None,
            realized_pnl: None,
            executed_at: Utc::now(),
            correlation_id: correlation_id.to_string(),
        }
    }

    #[test]
    fn evaluation_round_trips_with_exact_weights() {
        let store = TradeStore::open_in_memory().unwrap();
        let eval = test_eval("E1", "AAPL");
        store.insert_evaluation(&eval).unwrap();

        let loaded = store.get_evaluation("E1").unwrap().unwrap();
        assert_eq!(loaded.symbol, "AAPL");
        assert_eq!(loaded.weights_used, eval.weights_used);
        assert_eq!(loaded.ensemble.final_score, 68.0);
    }

    #[test]
    fn order_insert_is_idempotent() {
        let store = TradeStore::open_in_memory().unwrap();
        let order = test_order(1, "C1");
        store.insert_order(&order).unwrap();
        let mut dup = order.clone();
        dup.quantity = 999.0;
        store.insert_order(&dup).unwrap();

        let loaded = store.get_order(1).unwrap().unwrap();
        assert_eq!(loaded.quantity, 100.0);
    }

    #[test]
    fn status_update_preserves_unset_fields() {
        let store = TradeStore::open_in_memory().unwrap();
        store.insert_order(&test_order(1, "C1")).unwrap();
        store
            .update_order_status(1, "Filled", Some(100.0), Some(150.1))
            .unwrap();
        store.update_order_status(1, "Filled", None, None).unwrap();

        let loaded = store.get_order(1).unwrap().unwrap();
        assert_eq!(loaded.filled_quantity, 100.0);
        assert_eq!(loaded.avg_fill_price, Some(150.1));
    }

    #[test]
    fn execution_insert_idempotent_and_commission_update() {
        let store = TradeStore::open_in_memory().unwrap();
        store.insert_execution(&test_exec("X1", 1, "C1")).unwrap();
        store.insert_execution(&test_exec("X1", 1, "C1")).unwrap();
        store
            .update_execution_commission("X1", 1.25, Some(42.0))
            .unwrap();

        let execs = store.get_executions_by_correlation("C1").unwrap();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].commission, Some(1.25));
        assert_eq!(execs[0].realized_pnl, Some(42.0));
    }

    #[test]
    fn outcome_is_idempotent_per_evaluation() {
        let store = TradeStore::open_in_memory().unwrap();
        store.insert_evaluation(&test_eval("E1", "AAPL")).unwrap();
        let outcome = Outcome {
            evaluation_id: "E1".to_string(),
            trade_taken: true,
            decision_type: DecisionType::TookTrade,
            actual_entry: Some(150.0),
            actual_exit: Some(152.0),
            r_multiple: Some(1.0),
            exit_reason: Some("auto_detected".to_string()),
            recorded_at: Utc::now(),
        };
        assert!(store.insert_outcome(&outcome).unwrap());
        assert!(!store.insert_outcome(&outcome).unwrap());

        let loaded = store.get_outcome_for_eval("E1").unwrap().unwrap();
        assert_eq!(loaded.r_multiple, Some(1.0));
    }

    #[test]
    fn link_uniqueness_per_eval_order_pair() {
        let store = TradeStore::open_in_memory().unwrap();
        let link = EvalExecutionLink {
            evaluation_id: "E1".to_string(),
            order_id: 1,
            exec_id: "X1".to_string(),
            link_type: LinkType::Explicit,
            confidence: 1.0,
            symbol: "AAPL".to_string(),
            direction: Some(Direction::Long),
            created_at: Utc::now(),
        };
        assert!(store.insert_link(&link).unwrap());
        let mut heuristic = link.clone();
        heuristic.link_type = LinkType::Heuristic;
        heuristic.exec_id = "X2".to_string();
        assert!(!store.insert_link(&heuristic).unwrap());

        let links = store.get_links_for_order(1).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].link_type, LinkType::Explicit);
    }

    #[test]
    fn weight_history_round_trips() {
        let store = TradeStore::open_in_memory().unwrap();
        let snapshot = WeightSnapshot {
            weights: HashMap::from([
                (ProviderId::Gpt, 0.4),
                (ProviderId::Gemini, 0.3),
                (ProviderId::Claude, 0.3),
            ]),
            penalty_k: 1.0,
            reason: "bayesian_recalibration".to_string(),
            recorded_at: Utc::now(),
        };
        store.append_weight_history(&snapshot).unwrap();
        let history = store.get_weight_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "bayesian_recalibration");
        assert_eq!(history[0].weights, snapshot.weights);
    }

    #[test]
    fn recent_evals_for_symbol_filters_by_time_and_symbol() {
        let store = TradeStore::open_in_memory().unwrap();
        store.insert_evaluation(&test_eval("E1", "AAPL")).unwrap();
        store.insert_evaluation(&test_eval("E2", "TSLA")).unwrap();

        let since = Utc::now() - chrono::Duration::minutes(30);
        let candidates = store.get_recent_evals_for_symbol("AAPL", since).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "E1");
    }

    #[test]
    fn simulation_records_include_outputs_and_outcome() {
        let store = TradeStore::open_in_memory().unwrap();
        store.insert_evaluation(&test_eval("E1", "AAPL")).unwrap();
        let output = ModelOutput {
            evaluation_id: "E1".to_string(),
            provider: ProviderId::Gpt,
            raw_response: "{}".to_string(),
            compliant: true,
            error: None,
            latency_ms: 800,
            trade_score: Some(70.0),
            component_risks: None,
            expected_rr: Some(2.0),
            confidence: Some(0.8),
            should_trade: Some(true),
            reasoning: None,
            model_version: Some("gpt-4o".to_string()),
            prompt_hash: None,
            token_count: Some(900),
            response_id: None,
        };
        store.insert_model_output(&output).unwrap();

        let records = store.get_evals_for_simulation(7, Some("AAPL")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].model_outputs.len(), 1);
        assert!(records[0].outcome.is_none());
    }
}
