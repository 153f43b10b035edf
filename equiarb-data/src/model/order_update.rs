use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order postback pushed by the venue as a text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    #[serde(rename = "tradingsymbol")]
    pub trading_symbol: String,
    #[serde(default)]
    pub exchange: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub transaction_type: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub quantity: u64,
    #[serde(default)]
    pub filled_quantity: u64,
    #[serde(default)]
    pub average_price: Option<Decimal>,
    #[serde(default)]
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderStatus {
    Open,
    Complete,
    Cancelled,
    Rejected,
    Other(String),
}

impl From<String> for OrderStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            "OPEN" => OrderStatus::Open,
            "COMPLETE" => OrderStatus::Complete,
            "CANCELLED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Other(status),
        }
    }
}

impl From<OrderStatus> for String {
    fn from(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Open => "OPEN".to_string(),
            OrderStatus::Complete => "COMPLETE".to_string(),
            OrderStatus::Cancelled => "CANCELLED".to_string(),
            OrderStatus::Rejected => "REJECTED".to_string(),
            OrderStatus::Other(status) => status,
        }
    }
}

impl OrderStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OrderStatus::Complete | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}
