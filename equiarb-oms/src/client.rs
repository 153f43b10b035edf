use async_trait::async_trait;
use equiarb_data::{OrderStatus, OrderUpdate};
use equiarb_strategy::{ProductType, Side};
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::OrderError;

pub type OrderId = String;

/*----- */
// Requests & account models
/*----- */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Validity {
    Day,
    /// Immediate-or-cancel: unfilled quantity is cancelled by the venue.
    Ioc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub venue: String,
    pub trading_symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub product: ProductType,
    pub order_type: OrderType,
    pub validity: Validity,
    pub price: Option<Decimal>,
}

impl OrderRequest {
    pub fn limit_ioc(
        venue: impl Into<String>,
        trading_symbol: impl Into<String>,
        side: Side,
        quantity: u64,
        product: ProductType,
        price: Decimal,
    ) -> Self {
        Self {
            venue: venue.into(),
            trading_symbol: trading_symbol.into(),
            side,
            quantity,
            product,
            order_type: OrderType::Limit,
            validity: Validity::Ioc,
            price: Some(price),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Margins {
    pub available: Decimal,
    pub utilised: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub trading_symbol: String,
    pub venue: String,
    pub product: ProductType,
    pub quantity: i64,
    pub average_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub trading_symbol: String,
    pub venue: String,
    pub quantity: u64,
}

/*----- */
// Order client
/*----- */
/// Remote order-placement and account API.
#[async_trait]
pub trait OrderClient: Send + Sync {
    async fn place_order(&self, request: OrderRequest) -> Result<OrderId, OrderError>;

    async fn margins(&self) -> Result<Margins, OrderError>;

    async fn positions(&self) -> Result<Vec<Position>, OrderError>;

    async fn holdings(&self) -> Result<Vec<Holding>, OrderError>;
}

/*----- */
// Paper client
/*----- */
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Never,
    Side(Side),
    Venue(String),
    /// Reject with the given probability.
    Random(f64),
}

/// Net open quantity of one symbol in the paper account and the price it was
/// last filled at.
#[derive(Debug, Clone, Copy, Default)]
struct PaperExposure {
    quantity: i64,
    price: Decimal,
}

/// Accepts orders locally without touching a venue. Used for dry runs and
/// tests.
///
/// Every accepted order fills in full at its limit price and settles at once:
/// the account margin is debited by the notional of the open net position of
/// the symbol, so a completed buy and sell pair leaves it unchanged. When a
/// postback channel is attached each fill is reported as a `COMPLETE` order
/// update, the way a venue reports an IOC fill.
#[derive(Debug)]
pub struct PaperOrderClient {
    account_margin: Decimal,
    margins: Mutex<Margins>,
    exposure: Mutex<HashMap<String, PaperExposure>>,
    holdings: Vec<Holding>,
    rejection: Rejection,
    latency: Duration,
    next_id: AtomicU64,
    placed: Mutex<Vec<OrderRequest>>,
    postbacks: Option<mpsc::UnboundedSender<OrderUpdate>>,
}

impl PaperOrderClient {
    pub fn new(available: Decimal) -> Self {
        Self {
            account_margin: available,
            margins: Mutex::new(Margins {
                available,
                utilised: Decimal::ZERO,
            }),
            exposure: Mutex::new(HashMap::new()),
            holdings: Vec::new(),
            rejection: Rejection::Never,
            latency: Duration::ZERO,
            next_id: AtomicU64::new(1),
            placed: Mutex::new(Vec::new()),
            postbacks: None,
        }
    }

    pub fn with_postbacks(self, postbacks: mpsc::UnboundedSender<OrderUpdate>) -> Self {
        Self {
            postbacks: Some(postbacks),
            ..self
        }
    }

    pub fn with_rejection(self, rejection: Rejection) -> Self {
        Self { rejection, ..self }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        Self { latency, ..self }
    }

    pub fn with_holdings(self, holdings: Vec<Holding>) -> Self {
        Self { holdings, ..self }
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().clone()
    }

    /// Apply a fill to the symbol's net position and re-derive the margin.
    fn settle(&self, request: &OrderRequest, price: Decimal) {
        let mut exposure = self.exposure.lock();

        let position = exposure.entry(request.trading_symbol.clone()).or_default();
        position.quantity += match request.side {
            Side::Buy => request.quantity as i64,
            Side::Sell => -(request.quantity as i64),
        };
        position.price = price;

        let utilised = exposure
            .values()
            .map(|position| Decimal::from(position.quantity.unsigned_abs()) * position.price)
            .sum::<Decimal>();

        *self.margins.lock() = Margins {
            available: self.account_margin - utilised,
            utilised,
        };
    }

    fn post_fill(&self, order_id: &OrderId, request: &OrderRequest, price: Decimal) {
        let Some(postbacks) = &self.postbacks else {
            return;
        };

        let update = OrderUpdate {
            order_id: order_id.clone(),
            trading_symbol: request.trading_symbol.clone(),
            exchange: request.venue.clone(),
            status: OrderStatus::Complete,
            transaction_type: match request.side {
                Side::Buy => "BUY".to_string(),
                Side::Sell => "SELL".to_string(),
            },
            product: request.product.as_str().to_string(),
            quantity: request.quantity,
            filled_quantity: request.quantity,
            average_price: Some(price),
            status_message: None,
        };

        if postbacks.send(update).is_err() {
            debug!(order_id = %order_id, message = "Paper postback receiver dropped");
        }
    }

    fn rejects(&self, request: &OrderRequest) -> bool {
        match &self.rejection {
            Rejection::Never => false,
            Rejection::Side(side) => *side == request.side,
            Rejection::Venue(venue) => *venue == request.venue,
            Rejection::Random(probability) => rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0)),
        }
    }
}

#[async_trait]
impl OrderClient for PaperOrderClient {
    async fn place_order(&self, request: OrderRequest) -> Result<OrderId, OrderError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.rejects(&request) {
            return Err(OrderError::Rejected(format!(
                "paper rejection for {:?} {} on {}",
                request.side, request.trading_symbol, request.venue
            )));
        }

        let order_id = format!("paper-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(
            order_id = %order_id,
            venue = %request.venue,
            symbol = %request.trading_symbol,
            side = ?request.side,
            quantity = request.quantity,
            price = ?request.price,
            message = "Paper order accepted"
        );

        let price = request.price.unwrap_or_default();
        self.settle(&request, price);
        self.post_fill(&order_id, &request, price);

        self.placed.lock().push(request);
        Ok(order_id)
    }

    async fn margins(&self) -> Result<Margins, OrderError> {
        Ok(*self.margins.lock())
    }

    async fn positions(&self) -> Result<Vec<Position>, OrderError> {
        let positions = self
            .placed
            .lock()
            .iter()
            .map(|order| Position {
                trading_symbol: order.trading_symbol.clone(),
                venue: order.venue.clone(),
                product: order.product,
                quantity: match order.side {
                    Side::Buy => order.quantity as i64,
                    Side::Sell => -(order.quantity as i64),
                },
                average_price: order.price.unwrap_or_default(),
            })
            .collect();

        Ok(positions)
    }

    async fn holdings(&self) -> Result<Vec<Holding>, OrderError> {
        Ok(self.holdings.clone())
    }
}
