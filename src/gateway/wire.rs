//! Gateway wire protocol
//!
//! Newline-delimited JSON frames, internally tagged by `type`. Requests
//! carry a numeric `req_id` where the gateway echoes one back; commission
//! reports are tagged by exec id and news bulletins are untagged.

use serde::{Deserialize, Serialize};

/// Connection lost; the gateway asks clients to retry in 10 s.
pub const CODE_CONNECTION_LOST: i32 = 1100;
/// Connection restored in place; reconnecting would drop a live session.
pub const CODE_CONNECTION_RESTORED: i32 = 1102;
/// Configured client id is already in use by another session.
pub const CODE_CLIENT_ID_IN_USE: i32 = 326;

/// Transient broker-side notices. Logged, never propagated to requests.
pub const NON_FATAL_CODES: &[i32] = &[1101, 2100, 2104, 2106, 2107, 2108, 2158];

/// How a gateway error code affects the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Logged only.
    NonFatal,
    /// Reconnect with the standard backoff.
    Fatal,
    /// Reconnect with a fixed 10 s delay.
    ConnectionLost,
    /// Session recovers in place; do not reconnect.
    ConnectionRestored,
}

pub fn classify_error_code(code: i32) -> ErrorSeverity {
    match code {
        CODE_CONNECTION_LOST => ErrorSeverity::ConnectionLost,
        CODE_CONNECTION_RESTORED => ErrorSeverity::ConnectionRestored,
        c if NON_FATAL_CODES.contains(&c) => ErrorSeverity::NonFatal,
        _ => ErrorSeverity::Fatal,
    }
}

/// Order fields as they cross the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireOrder {
    pub order_id: i64,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub quantity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_percent: Option<f64>,
    pub time_in_force: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_order_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oca_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oca_type: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discretionary_amount: Option<f64>,
    /// False holds the order at the gateway until a later sibling commits
    /// the whole group.
    pub transmit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_id: Option<String>,
}

/// Fill fields as they cross the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireExecution {
    pub exec_id: String,
    pub order_id: i64,
    pub symbol: String,
    pub side: String,
    pub shares: f64,
    pub price: f64,
    pub cum_qty: f64,
    pub avg_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// Unix millis.
    pub time: i64,
}

/// Outbound frames
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayRequest {
    StartApi { client_id: u32 },
    Heartbeat { seq: u64 },
    PlaceOrder { order: WireOrder },
    CancelOrder { order_id: i64 },
    CancelAll,
    ReqOpenOrders { req_id: i64 },
    ReqPositions { req_id: i64 },
    ReqExecutions { req_id: i64 },
    ReqNewsBulletins { req_id: i64 },
    CancelNewsBulletins { req_id: i64 },
}

/// Inbound frames
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Handshake acknowledgement carrying the first valid order id.
    ConnectAck {
        server_version: i32,
        client_id: u32,
        next_order_id: i64,
    },
    HeartbeatAck {
        seq: u64,
    },
    OrderStatus {
        order_id: i64,
        status: String,
        filled: f64,
        remaining: f64,
        avg_fill_price: f64,
    },
    OpenOrder {
        #[serde(skip_serializing_if = "Option::is_none")]
        req_id: Option<i64>,
        order: WireOrder,
        status: String,
    },
    OpenOrderEnd {
        req_id: i64,
    },
    ExecDetails {
        #[serde(skip_serializing_if = "Option::is_none")]
        req_id: Option<i64>,
        execution: WireExecution,
    },
    ExecDetailsEnd {
        req_id: i64,
    },
    Position {
        req_id: i64,
        symbol: String,
        quantity: f64,
        avg_cost: f64,
    },
    PositionEnd {
        req_id: i64,
    },
    /// Tagged by exec id only; never carries a request id.
    CommissionReport {
        exec_id: String,
        commission: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        realized_pnl: Option<f64>,
    },
    /// Untagged stream.
    NewsBulletin {
        msg_id: i64,
        message: String,
        origin_exchange: String,
    },
    /// `req_id` of -1 means connection-level.
    Error {
        req_id: i64,
        code: i32,
        message: String,
    },
}

impl GatewayEvent {
    /// The request id this event correlates to, if any.
    pub fn req_id(&self) -> Option<i64> {
        match self {
            GatewayEvent::OpenOrder { req_id, .. } => *req_id,
            GatewayEvent::OpenOrderEnd { req_id } => Some(*req_id),
            GatewayEvent::ExecDetails { req_id, .. } => *req_id,
            GatewayEvent::ExecDetailsEnd { req_id } => Some(*req_id),
            GatewayEvent::Position { req_id, .. } => Some(*req_id),
            GatewayEvent::PositionEnd { req_id } => Some(*req_id),
            GatewayEvent::Error { req_id, .. } if *req_id >= 0 => Some(*req_id),
            _ => None,
        }
    }

    /// The order id this event correlates to, if any.
    pub fn order_id(&self) -> Option<i64> {
        match self {
            GatewayEvent::OrderStatus { order_id, .. } => Some(*order_id),
            GatewayEvent::OpenOrder { order, .. } => Some(order.order_id),
            GatewayEvent::ExecDetails { execution, .. } => Some(execution.order_id),
            _ => None,
        }
    }
}

/// Serialize one frame. The trailing newline is the frame delimiter.
pub fn encode_frame<T: Serialize>(msg: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_event(line: &str) -> serde_json::Result<GatewayEvent> {
    serde_json::from_str(line.trim_end())
}

pub fn decode_request(line: &str) -> serde_json::Result<GatewayRequest> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trip() {
        let event = GatewayEvent::OrderStatus {
            order_id: 42,
            status: "Submitted".to_string(),
            filled: 0.0,
            remaining: 100.0,
            avg_fill_price: 0.0,
        };
        let line = encode_frame(&event).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(decode_event(&line).unwrap(), event);
    }

    #[test]
    fn request_round_trip() {
        let request = GatewayRequest::ReqOpenOrders { req_id: 7 };
        let line = encode_frame(&request).unwrap();
        assert_eq!(decode_request(&line).unwrap(), request);
    }

    #[test]
    fn commission_report_has_no_req_id() {
        let event = GatewayEvent::CommissionReport {
            exec_id: "X1".to_string(),
            commission: 1.25,
            realized_pnl: None,
        };
        assert_eq!(event.req_id(), None);
        assert_eq!(event.order_id(), None);
    }

    #[test]
    fn connection_level_error_has_no_req_id() {
        let event = GatewayEvent::Error {
            req_id: -1,
            code: 1100,
            message: "connectivity lost".to_string(),
        };
        assert_eq!(event.req_id(), None);
    }

    #[test]
    fn error_code_classification() {
        assert_eq!(classify_error_code(1100), ErrorSeverity::ConnectionLost);
        assert_eq!(classify_error_code(1102), ErrorSeverity::ConnectionRestored);
        assert_eq!(classify_error_code(2104), ErrorSeverity::NonFatal);
        assert_eq!(classify_error_code(504), ErrorSeverity::Fatal);
    }
}
