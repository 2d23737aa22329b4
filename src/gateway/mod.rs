//! Brokerage gateway plumbing
//!
//! One live TCP session to the gateway, a request/response broker that
//! turns the inbound event stream into futures, and process-wide
//! connection health tracking.

pub mod broker;
pub mod health;
pub mod session;
pub mod wire;

pub use broker::{EventSubscription, PendingKey, RequestBroker};
pub use health::{ConnectionHealth, HealthSnapshot};
pub use session::{
    heartbeat_action, reconnect_backoff_ms, HeartbeatAction, NewsStream, SessionManager,
    SessionState,
};
pub use wire::{ErrorSeverity, GatewayEvent, GatewayRequest, WireExecution, WireOrder};
