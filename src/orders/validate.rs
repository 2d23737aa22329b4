//! Order validation
//!
//! Pure checks that run before any network I/O. Unknown order types are
//! forwarded with a warning; the gateway is the authority on what it
//! accepts.

use crate::errors::{CoreError, CoreResult};
use crate::orders::pipeline::OrderIntent;
use tracing::warn;

const KNOWN_ORDER_TYPES: &[&str] = &[
    "MKT", "LMT", "STP", "STP LMT", "TRAIL", "TRAIL LIMIT", "REL", "MOC", "LOC", "MIT",
];

pub fn validate_order(intent: &OrderIntent) -> CoreResult<()> {
    if intent.symbol.trim().is_empty() {
        return Err(CoreError::validation("symbol must not be empty"));
    }
    if !(intent.quantity > 0.0) {
        return Err(CoreError::validation("quantity must be positive"));
    }

    let order_type = intent.order_type.as_str();
    if !KNOWN_ORDER_TYPES.contains(&order_type) {
        warn!(order_type, "unknown order type, forwarding to gateway");
    }

    if matches!(order_type, "LMT" | "STP LMT" | "TRAIL LIMIT") && intent.limit_price.is_none() {
        return Err(CoreError::Validation(format!(
            "{order_type} orders require a limit price"
        )));
    }

    if matches!(order_type, "STP" | "STP LMT") && intent.aux_price.is_none() {
        return Err(CoreError::Validation(format!(
            "{order_type} orders require an aux (stop trigger) price"
        )));
    }

    if matches!(order_type, "TRAIL" | "TRAIL LIMIT") {
        let has_amount = intent.aux_price.is_some();
        let has_percent = intent.trailing_percent.is_some();
        if has_amount == has_percent {
            return Err(CoreError::Validation(format!(
                "{order_type} orders require exactly one of trailing amount or trailing percent"
            )));
        }
    }

    if let Some(oca_type) = intent.oca_type {
        if !(1..=3).contains(&oca_type) {
            return Err(CoreError::validation("OCA type must be 1, 2 or 3"));
        }
    }

    if intent.discretionary_amount.is_some() && order_type != "REL" {
        return Err(CoreError::validation(
            "discretionary amount is only valid for REL orders",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;

    fn base_intent(order_type: &str) -> OrderIntent {
        OrderIntent {
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            order_type: order_type.to_string(),
            quantity: 100.0,
            limit_price: None,
            aux_price: None,
            trailing_percent: None,
            time_in_force: "DAY".to_string(),
            oca_type: None,
            discretionary_amount: None,
            evaluation_id: None,
            order_source: "test".to_string(),
        }
    }

    #[test]
    fn market_order_passes() {
        assert!(validate_order(&base_intent("MKT")).is_ok());
    }

    #[test]
    fn empty_symbol_rejected() {
        let mut intent = base_intent("MKT");
        intent.symbol = "  ".to_string();
        assert!(validate_order(&intent).is_err());
    }

    #[test]
    fn non_positive_quantity_rejected() {
        let mut intent = base_intent("MKT");
        intent.quantity = 0.0;
        assert!(validate_order(&intent).is_err());
        intent.quantity = -10.0;
        assert!(validate_order(&intent).is_err());
    }

    #[test]
    fn limit_types_require_limit_price() {
        for order_type in ["LMT", "STP LMT", "TRAIL LIMIT"] {
            let mut intent = base_intent(order_type);
            intent.aux_price = Some(95.0);
            intent.trailing_percent = None;
            assert!(validate_order(&intent).is_err(), "{order_type}");
            intent.limit_price = Some(100.0);
            assert!(validate_order(&intent).is_ok(), "{order_type}");
        }
    }

    #[test]
    fn stop_types_require_aux_price() {
        let intent = base_intent("STP");
        assert!(validate_order(&intent).is_err());
        let mut intent = base_intent("STP");
        intent.aux_price = Some(95.0);
        assert!(validate_order(&intent).is_ok());
    }

    #[test]
    fn trail_requires_exactly_one_trailing_field() {
        let intent = base_intent("TRAIL");
        assert!(validate_order(&intent).is_err());

        let mut amount = base_intent("TRAIL");
        amount.aux_price = Some(1.5);
        assert!(validate_order(&amount).is_ok());

        let mut percent = base_intent("TRAIL");
        percent.trailing_percent = Some(2.0);
        assert!(validate_order(&percent).is_ok());

        let mut both = base_intent("TRAIL");
        both.aux_price = Some(1.5);
        both.trailing_percent = Some(2.0);
        assert!(validate_order(&both).is_err());
    }

    #[test]
    fn oca_type_range() {
        for oca in [1, 2, 3] {
            let mut intent = base_intent("MKT");
            intent.oca_type = Some(oca);
            assert!(validate_order(&intent).is_ok());
        }
        let mut intent = base_intent("MKT");
        intent.oca_type = Some(4);
        assert!(validate_order(&intent).is_err());
    }

    #[test]
    fn discretionary_only_for_rel() {
        let mut rel = base_intent("REL");
        rel.discretionary_amount = Some(0.05);
        assert!(validate_order(&rel).is_ok());

        let mut mkt = base_intent("MKT");
        mkt.discretionary_amount = Some(0.05);
        assert!(validate_order(&mkt).is_err());
    }

    #[test]
    fn unknown_order_type_is_forwarded() {
        assert!(validate_order(&base_intent("PEG MID")).is_ok());
    }
}
