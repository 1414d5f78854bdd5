//! Order parameters passed to `place_order`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::*;

// ============================================================================
// Order
// ============================================================================

/// Order parameters. Unset prices are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_quantity: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_type: Option<OrderType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lmt_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_price: Option<f64>,
    pub transmit: bool,
}

impl Order {
    pub fn limit(action: Action, quantity: Decimal, limit_price: f64) -> Self {
        Self {
            action: Some(action),
            total_quantity: Some(quantity),
            order_type: Some(OrderType::Limit),
            lmt_price: Some(limit_price),
            transmit: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_order_sets_price_and_type() {
        let o = Order::limit(Action::Buy, Decimal::from(1000), 0.01);
        assert_eq!(o.order_type, Some(OrderType::Limit));
        assert_eq!(o.lmt_price, Some(0.01));
        assert_eq!(o.aux_price, None);
        assert!(o.transmit);

        let json = serde_json::to_value(&o).unwrap();
        assert_eq!(json["action"], "BUY");
        assert_eq!(json["totalQuantity"], "1000");
    }
}
