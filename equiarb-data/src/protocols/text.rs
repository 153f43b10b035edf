use serde::Deserialize;
use std::collections::HashSet;

use crate::{error::FeedError, model::order_update::OrderUpdate};

/// JSON envelope carried by text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum TextMessage {
    Order(OrderUpdate),
    Error(String),
    Message(serde_json::Value),
}

pub fn parse_text(payload: &str) -> Result<TextMessage, FeedError> {
    serde_json::from_str::<TextMessage>(payload).map_err(|error| FeedError::Deserialise {
        error,
        payload: payload.to_owned(),
    })
}

/// Keep order updates only for symbols this process trades.
pub fn filter_order(update: OrderUpdate, symbols: &HashSet<String>) -> Option<OrderUpdate> {
    symbols
        .contains(&update.trading_symbol)
        .then_some(update)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::order_update::OrderStatus;

    #[test]
    fn parses_order_envelope() {
        let payload = r#"{"type":"order","data":{"order_id":"220303000308932","tradingsymbol":"SBIN","exchange":"NSE","status":"COMPLETE","transaction_type":"BUY","product":"MIS","quantity":30,"filled_quantity":30,"average_price":470.25}}"#;

        let message = parse_text(payload).unwrap();
        let TextMessage::Order(update) = message else {
            panic!("expected order update, got {message:?}");
        };

        assert_eq!(update.trading_symbol, "SBIN");
        assert_eq!(update.status, OrderStatus::Complete);
        assert!(update.status.is_final());
        assert_eq!(update.filled_quantity, 30);
    }

    #[test]
    fn parses_error_envelope() {
        let message = parse_text(r#"{"type":"error","data":"invalid token"}"#).unwrap();
        assert!(matches!(message, TextMessage::Error(msg) if msg == "invalid token"));
    }

    #[test]
    fn malformed_text_is_a_deserialise_error() {
        assert!(matches!(
            parse_text("not json"),
            Err(FeedError::Deserialise { .. })
        ));
    }

    #[test]
    fn order_updates_are_filtered_by_symbol() {
        let update = OrderUpdate {
            order_id: "1".to_string(),
            trading_symbol: "INFY".to_string(),
            exchange: "BSE".to_string(),
            status: OrderStatus::Open,
            transaction_type: "SELL".to_string(),
            product: "CNC".to_string(),
            quantity: 1,
            filled_quantity: 0,
            average_price: None,
            status_message: None,
        };

        let symbols = HashSet::from(["INFY".to_string()]);
        assert!(filter_order(update.clone(), &symbols).is_some());
        assert!(filter_order(update, &HashSet::new()).is_none());
    }
}
