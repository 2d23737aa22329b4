//! Persistent order listeners
//!
//! Attached once at process start and never unregistered; they survive
//! reconnects because the broker keeps global listeners across session
//! drops. Every status change, fill and commission is reconciled into
//! the store regardless of which request (or which process) initiated
//! the order.

use crate::gateway::broker::RequestBroker;
use crate::gateway::wire::GatewayEvent;
use crate::linker::LinkerEvent;
use crate::models::{is_terminal_status, ExecSide, ExecutionRecord};
use crate::storage::TradeStore;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub fn attach_persistent_listeners(
    broker: &RequestBroker,
    store: Arc<TradeStore>,
    linker_tx: mpsc::UnboundedSender<LinkerEvent>,
) {
    broker.global_listener(move |event| match event {
        GatewayEvent::OrderStatus {
            order_id,
            status,
            filled,
            avg_fill_price,
            ..
        } => {
            match store.get_order(*order_id) {
                Ok(Some(_)) => {
                    let avg = (*avg_fill_price > 0.0).then_some(*avg_fill_price);
                    if let Err(e) =
                        store.update_order_status(*order_id, status, Some(*filled), avg)
                    {
                        warn!(order_id, error = %e, "order status update failed");
                    } else if is_terminal_status(status) {
                        debug!(order_id, status, "order reached terminal status");
                    }
                }
                Ok(None) => debug!(order_id, status, "status for unknown order ignored"),
                Err(e) => warn!(order_id, error = %e, "order lookup failed"),
            }
        }
        GatewayEvent::ExecDetails { execution, .. } => {
            let order = match store.get_order(execution.order_id) {
                Ok(Some(order)) => order,
                Ok(None) => {
                    debug!(
                        order_id = execution.order_id,
                        exec_id = execution.exec_id,
                        "fill for unknown order ignored"
                    );
                    return;
                }
                Err(e) => {
                    warn!(order_id = execution.order_id, error = %e, "order lookup failed");
                    return;
                }
            };

            let record = ExecutionRecord {
                exec_id: execution.exec_id.clone(),
                order_id: execution.order_id,
                symbol: execution.symbol.clone(),
                side: ExecSide::parse(&execution.side).unwrap_or(ExecSide::Bought),
                shares: execution.shares,
                price: execution.price,
                cum_qty: execution.cum_qty,
                avg_price: execution.avg_price,
                account: execution.account.clone(),
                commission: None,
                realized_pnl: None,
                executed_at: Utc
                    .timestamp_millis_opt(execution.time)
                    .single()
                    .unwrap_or_else(Utc::now),
                correlation_id: order.correlation_id.clone(),
            };
            if let Err(e) = store.insert_execution(&record) {
                warn!(exec_id = record.exec_id, error = %e, "execution insert failed");
                return;
            }
            let _ = linker_tx.send(LinkerEvent::Execution(record));
        }
        GatewayEvent::CommissionReport {
            exec_id,
            commission,
            realized_pnl,
        } => {
            if let Err(e) = store.update_execution_commission(exec_id, *commission, *realized_pnl)
            {
                warn!(exec_id, error = %e, "commission update failed");
                return;
            }
            let _ = linker_tx.send(LinkerEvent::Commission {
                exec_id: exec_id.clone(),
            });
        }
        _ => {}
    });
}
