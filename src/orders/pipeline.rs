//! Order construction and submission
//!
//! Intents validate, persist, then go out through the session. Brackets
//! hold the whole triplet at the gateway until the stop-loss commits it.
//! Modification reuses the original order id so contingent-order links
//! survive; a cancel-and-reopen would break OCA groups.

use crate::config::GatewayConfig;
use crate::errors::{CoreError, CoreResult};
use crate::gateway::broker::PendingKey;
use crate::gateway::session::SessionManager;
use crate::gateway::wire::{GatewayEvent, GatewayRequest, WireOrder};
use crate::models::{OrderRecord, OrderSide};
use crate::orders::validate::validate_order;
use crate::storage::TradeStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Status reported when the gateway never confirmed inside the timeout.
/// The order is in flight; the persistent listener reconciles it later.
pub const STATUS_SUBMITTED_TIMEOUT: &str = "Submitted (timeout waiting for confirmation)";

/// A validated order request before ids are assigned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: String,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub aux_price: Option<f64>,
    pub trailing_percent: Option<f64>,
    pub time_in_force: String,
    pub oca_type: Option<i32>,
    pub discretionary_amount: Option<f64>,
    pub evaluation_id: Option<String>,
    pub order_source: String,
}

/// Entry plus exit prices for a bracket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketIntent {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub entry_type: String,
    pub entry_limit: Option<f64>,
    pub take_profit: f64,
    pub stop_loss: f64,
    /// "STP", "TRAIL" or "TRAIL LIMIT".
    pub stop_type: String,
    pub trailing_percent: Option<f64>,
    pub time_in_force: String,
    pub oca_type: Option<i32>,
    pub evaluation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceResult {
    pub order_id: i64,
    pub status: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BracketResult {
    pub parent_id: i64,
    pub take_profit_id: i64,
    pub stop_loss_id: i64,
    pub correlation_id: String,
    pub oca_group: Option<String>,
    pub status: String,
}

/// Fields a modify may change. Parent id and OCA group are never
/// touchable; they come from the gateway's own view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderChanges {
    pub quantity: Option<f64>,
    pub limit_price: Option<f64>,
    pub aux_price: Option<f64>,
    pub trailing_percent: Option<f64>,
    pub time_in_force: Option<String>,
}

/// Overlay `changes` on the gateway's view of an order. Returns the new
/// order and whether anything actually changed.
pub fn apply_changes(current: &WireOrder, changes: &OrderChanges) -> (WireOrder, bool) {
    let mut updated = current.clone();
    if let Some(quantity) = changes.quantity {
        updated.quantity = quantity;
    }
    if let Some(limit_price) = changes.limit_price {
        updated.limit_price = Some(limit_price);
    }
    if let Some(aux_price) = changes.aux_price {
        updated.aux_price = Some(aux_price);
    }
    if let Some(trailing_percent) = changes.trailing_percent {
        updated.trailing_percent = Some(trailing_percent);
    }
    if let Some(tif) = &changes.time_in_force {
        updated.time_in_force = tif.clone();
    }
    let changed = updated != *current;
    (updated, changed)
}

/// Build the three wire orders of a bracket. Parent and take-profit are
/// held (`transmit = false`); only the stop-loss transmits, committing
/// the triplet atomically at the gateway.
pub fn build_bracket_orders(
    intent: &BracketIntent,
    parent_id: i64,
    oca_group: Option<String>,
) -> [WireOrder; 3] {
    let child_side = intent.side.flipped();
    let oca_type = oca_group.as_ref().map(|_| intent.oca_type.unwrap_or(1));

    let parent = WireOrder {
        order_id: parent_id,
        symbol: intent.symbol.clone(),
        side: intent.side.as_str().to_string(),
        order_type: intent.entry_type.clone(),
        quantity: intent.quantity,
        limit_price: intent.entry_limit,
        aux_price: None,
        trailing_percent: None,
        time_in_force: intent.time_in_force.clone(),
        parent_order_id: None,
        oca_group: None,
        oca_type: None,
        discretionary_amount: None,
        transmit: false,
        evaluation_id: intent.evaluation_id.clone(),
    };

    let take_profit = WireOrder {
        order_id: parent_id + 1,
        symbol: intent.symbol.clone(),
        side: child_side.as_str().to_string(),
        order_type: "LMT".to_string(),
        quantity: intent.quantity,
        limit_price: Some(intent.take_profit),
        aux_price: None,
        trailing_percent: None,
        time_in_force: intent.time_in_force.clone(),
        parent_order_id: Some(parent_id),
        oca_group: oca_group.clone(),
        oca_type,
        discretionary_amount: None,
        transmit: false,
        evaluation_id: intent.evaluation_id.clone(),
    };

    let stop_loss = WireOrder {
        order_id: parent_id + 2,
        symbol: intent.symbol.clone(),
        side: child_side.as_str().to_string(),
        order_type: intent.stop_type.clone(),
        quantity: intent.quantity,
        limit_price: None,
        aux_price: (intent.trailing_percent.is_none()).then_some(intent.stop_loss),
        trailing_percent: intent.trailing_percent,
        time_in_force: intent.time_in_force.clone(),
        parent_order_id: Some(parent_id),
        oca_group,
        oca_type,
        discretionary_amount: None,
        transmit: true,
        evaluation_id: intent.evaluation_id.clone(),
    };

    [parent, take_profit, stop_loss]
}

pub struct OrderPipeline {
    session: Arc<SessionManager>,
    store: Arc<TradeStore>,
    config: GatewayConfig,
}

impl OrderPipeline {
    pub fn new(session: Arc<SessionManager>, store: Arc<TradeStore>, config: GatewayConfig) -> Self {
        Self {
            session,
            store,
            config,
        }
    }

    fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.config.order_timeout_ms)
    }

    fn record_from_wire(&self, wire: &WireOrder, correlation_id: &str, source: &str) -> OrderRecord {
        OrderRecord {
            order_id: wire.order_id,
            symbol: wire.symbol.clone(),
            side: OrderSide::parse(&wire.side).unwrap_or(OrderSide::Buy),
            order_type: wire.order_type.clone(),
            quantity: wire.quantity,
            limit_price: wire.limit_price,
            aux_price: wire.aux_price,
            trailing_percent: wire.trailing_percent,
            time_in_force: wire.time_in_force.clone(),
            parent_order_id: wire.parent_order_id,
            oca_group: wire.oca_group.clone(),
            oca_type: wire.oca_type,
            status: "PendingSubmit".to_string(),
            filled_quantity: 0.0,
            avg_fill_price: None,
            strategy_version: None,
            order_source: source.to_string(),
            correlation_id: correlation_id.to_string(),
            evaluation_id: wire.evaluation_id.clone(),
            journal_id: None,
            created_at: Utc::now(),
        }
    }

    /// Await the first status (or order-level error) for an order id.
    async fn await_order_status(
        &self,
        order_id: i64,
        mut pending: crate::gateway::broker::PendingRequest,
    ) -> CoreResult<String> {
        let deadline = tokio::time::Instant::now() + self.order_timeout();
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(CoreError::Timeout(self.config.order_timeout_ms))?;
            match pending.next_event(remaining).await? {
                GatewayEvent::OrderStatus { status, filled, avg_fill_price, .. } => {
                    info!(order_id, status, filled, avg_fill_price, "order status");
                    return Ok(status);
                }
                GatewayEvent::Error { code, message, .. } => {
                    return Err(CoreError::Gateway { code, message });
                }
                _ => {}
            }
        }
    }

    /// Validate, persist, submit, await confirmation. A timeout is not an
    /// error: the order is in flight and the persistent listener updates
    /// the record when the status event eventually arrives.
    pub async fn place_order(&self, intent: OrderIntent) -> CoreResult<PlaceResult> {
        validate_order(&intent)?;

        let channel = self.session.with_session(self.order_timeout()).await?;
        let order_id = self.session.next_order_id();
        let correlation_id = Uuid::new_v4().to_string();

        let wire = WireOrder {
            order_id,
            symbol: intent.symbol.clone(),
            side: intent.side.as_str().to_string(),
            order_type: intent.order_type.clone(),
            quantity: intent.quantity,
            limit_price: intent.limit_price,
            aux_price: intent.aux_price,
            trailing_percent: intent.trailing_percent,
            time_in_force: intent.time_in_force.clone(),
            parent_order_id: None,
            oca_group: None,
            oca_type: intent.oca_type,
            discretionary_amount: intent.discretionary_amount,
            transmit: true,
            evaluation_id: intent.evaluation_id.clone(),
        };

        let mut record = self.record_from_wire(&wire, &correlation_id, &intent.order_source);
        record.evaluation_id = intent.evaluation_id.clone();
        self.store.insert_order(&record)?;

        let pending = self
            .session
            .broker()
            .register(PendingKey::Order(order_id));
        channel.send(GatewayRequest::PlaceOrder { order: wire })?;

        let status = match self.await_order_status(order_id, pending).await {
            Ok(status) => status,
            Err(CoreError::Timeout(_)) => STATUS_SUBMITTED_TIMEOUT.to_string(),
            Err(err) => return Err(err),
        };

        Ok(PlaceResult {
            order_id,
            status,
            correlation_id,
        })
    }

    /// Bracket without OCA linkage between the children.
    pub async fn place_bracket(&self, intent: BracketIntent) -> CoreResult<BracketResult> {
        self.place_bracket_inner(intent, false).await
    }

    /// Bracket whose children share an OCA group: when one fills, the
    /// gateway cancels the other.
    pub async fn place_advanced_bracket(&self, intent: BracketIntent) -> CoreResult<BracketResult> {
        self.place_bracket_inner(intent, true).await
    }

    async fn place_bracket_inner(
        &self,
        intent: BracketIntent,
        advanced: bool,
    ) -> CoreResult<BracketResult> {
        let entry_intent = OrderIntent {
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: intent.entry_type.clone(),
            quantity: intent.quantity,
            limit_price: intent.entry_limit,
            aux_price: None,
            trailing_percent: None,
            time_in_force: intent.time_in_force.clone(),
            oca_type: intent.oca_type,
            discretionary_amount: None,
            evaluation_id: intent.evaluation_id.clone(),
            order_source: "bracket".to_string(),
        };
        validate_order(&entry_intent)?;
        if !(intent.take_profit > 0.0 && intent.stop_loss > 0.0) {
            return Err(CoreError::validation("bracket exit prices must be positive"));
        }

        let channel = self.session.with_session(self.order_timeout()).await?;
        let parent_id = self.session.allocate_order_ids(3);
        let correlation_id = Uuid::new_v4().to_string();
        let oca_group = advanced
            .then(|| format!("bracket_{}_{}", parent_id, Utc::now().timestamp_millis()));

        let orders = build_bracket_orders(&intent, parent_id, oca_group.clone());

        // All three rows are durable before anything transmits, so the
        // store stays consistent if the process dies mid-submit.
        for wire in &orders {
            let record = self.record_from_wire(wire, &correlation_id, "bracket");
            self.store.insert_order(&record)?;
        }

        let pending = self
            .session
            .broker()
            .register(PendingKey::Order(parent_id));
        for wire in orders.iter().cloned() {
            channel.send(GatewayRequest::PlaceOrder { order: wire })?;
        }

        let status = match self.await_order_status(parent_id, pending).await {
            Ok(status) => status,
            Err(CoreError::Timeout(_)) => STATUS_SUBMITTED_TIMEOUT.to_string(),
            Err(err) => return Err(err),
        };

        Ok(BracketResult {
            parent_id,
            take_profit_id: parent_id + 1,
            stop_loss_id: parent_id + 2,
            correlation_id,
            oca_group,
            status,
        })
    }

    /// Fetch the gateway's live open-orders list.
    async fn fetch_open_orders(&self) -> CoreResult<Vec<(WireOrder, String)>> {
        let channel = self.session.with_session(self.order_timeout()).await?;
        let req_id = channel.req_id();
        let mut pending = self
            .session
            .broker()
            .register(PendingKey::Request(req_id));
        channel.send(GatewayRequest::ReqOpenOrders { req_id })?;

        let events = pending
            .collect_until(self.order_timeout(), |event| {
                matches!(event, GatewayEvent::OpenOrderEnd { .. })
            })
            .await?;

        Ok(events
            .into_iter()
            .filter_map(|event| match event {
                GatewayEvent::OpenOrder { order, status, .. } => Some((order, status)),
                _ => None,
            })
            .collect())
    }

    /// Modify an order in place under its original id. Parent id and OCA
    /// group are taken verbatim from the gateway's view. The store is
    /// updated only after the gateway confirms; an explicit rejection
    /// leaves it untouched.
    pub async fn modify_order(
        &self,
        order_id: i64,
        changes: OrderChanges,
    ) -> CoreResult<PlaceResult> {
        let open_orders = self.fetch_open_orders().await?;
        let (current, status) = open_orders
            .into_iter()
            .find(|(order, _)| order.order_id == order_id)
            .ok_or_else(|| {
                CoreError::Validation(format!("order {order_id} is not in the open-orders list"))
            })?;

        if !matches!(status.as_str(), "PreSubmitted" | "Submitted") {
            return Err(CoreError::Validation(format!(
                "order {order_id} is not modifiable in status {status}"
            )));
        }

        let (updated, changed) = apply_changes(&current, &changes);
        if !changed {
            return Err(CoreError::validation("modify changes no fields"));
        }

        let channel = self.session.with_session(self.order_timeout()).await?;
        let pending = self
            .session
            .broker()
            .register(PendingKey::Order(order_id));
        channel.send(GatewayRequest::PlaceOrder {
            order: updated.clone(),
        })?;

        let (status, confirmed) = match self.await_order_status(order_id, pending).await {
            Ok(status) => (status, true),
            // Probably accepted; the listener reconciles if it was not.
            Err(CoreError::Timeout(_)) => (STATUS_SUBMITTED_TIMEOUT.to_string(), true),
            Err(err) => return Err(err),
        };

        if confirmed {
            if let Some(mut record) = self.store.get_order(order_id)? {
                record.quantity = updated.quantity;
                record.limit_price = updated.limit_price;
                record.aux_price = updated.aux_price;
                record.trailing_percent = updated.trailing_percent;
                record.time_in_force = updated.time_in_force.clone();
                record.status = status.clone();
                self.store.update_order_fields(&record)?;
            }
        }

        let correlation_id = self
            .store
            .get_order(order_id)?
            .map(|record| record.correlation_id)
            .unwrap_or_default();

        Ok(PlaceResult {
            order_id,
            status,
            correlation_id,
        })
    }

    pub async fn cancel_order(&self, order_id: i64) -> CoreResult<PlaceResult> {
        let channel = self.session.with_session(self.order_timeout()).await?;
        let pending = self
            .session
            .broker()
            .register(PendingKey::Order(order_id));
        channel.send(GatewayRequest::CancelOrder { order_id })?;

        let status = match self.await_order_status(order_id, pending).await {
            Ok(status) => status,
            Err(CoreError::Timeout(_)) => "PendingCancel".to_string(),
            Err(err) => return Err(err),
        };

        let correlation_id = self
            .store
            .get_order(order_id)?
            .map(|record| record.correlation_id)
            .unwrap_or_default();

        Ok(PlaceResult {
            order_id,
            status,
            correlation_id,
        })
    }

    pub async fn cancel_all(&self) -> CoreResult<()> {
        let channel = self.session.with_session(self.order_timeout()).await?;
        channel.send(GatewayRequest::CancelAll)?;
        Ok(())
    }

    /// Close every non-zero position at market with IOC orders, after a
    /// global cancel and a short settle delay. Flatten bypasses the risk
    /// gate: it is the risk gate's own action.
    pub async fn flatten_all(&self) -> CoreResult<Vec<PlaceResult>> {
        self.cancel_all().await?;
        tokio::time::sleep(Duration::from_millis(self.config.flatten_settle_ms)).await;

        let channel = self.session.with_session(self.order_timeout()).await?;
        let req_id = channel.req_id();
        let mut pending = self
            .session
            .broker()
            .register(PendingKey::Request(req_id));
        channel.send(GatewayRequest::ReqPositions { req_id })?;

        let events = pending
            .collect_until(self.order_timeout(), |event| {
                matches!(event, GatewayEvent::PositionEnd { .. })
            })
            .await?;

        let mut results = Vec::new();
        for event in events {
            let GatewayEvent::Position { symbol, quantity, .. } = event else {
                continue;
            };
            if quantity.abs() < 1e-9 {
                continue;
            }
            let side = if quantity > 0.0 {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            warn!(symbol, quantity, "flattening position at market");
            let result = self
                .place_order(OrderIntent {
                    symbol,
                    side,
                    order_type: "MKT".to_string(),
                    quantity: quantity.abs(),
                    limit_price: None,
                    aux_price: None,
                    trailing_percent: None,
                    time_in_force: "IOC".to_string(),
                    oca_type: None,
                    discretionary_amount: None,
                    evaluation_id: None,
                    order_source: "flatten".to_string(),
                })
                .await?;
            results.push(result);
        }
        Ok(results)
    }
}
