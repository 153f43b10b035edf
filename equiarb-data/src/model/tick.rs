use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    assets::level::{Depth, Level},
    shared::subscription_models::{Segment, StreamMode},
};

/*----- */
// Tick
/*----- */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument_token: u32,
    pub mode: StreamMode,
    pub tradable: bool,
    pub last_price: Decimal,
    pub quote: Option<QuoteSummary>,
    pub exchange_time: Option<DateTime<Utc>>,
    pub depth: Depth,
    /// Wall-clock time the carrying frame was read off the socket. Shared by
    /// every tick decoded from the same frame.
    pub received_time: DateTime<Utc>,
}

impl Tick {
    pub fn ltp(instrument_token: u32, last_price: Decimal, received_time: DateTime<Utc>) -> Self {
        Self {
            instrument_token,
            mode: StreamMode::Ltp,
            tradable: Segment::from_token(instrument_token).is_tradable(),
            last_price,
            quote: None,
            exchange_time: None,
            depth: Depth::default(),
            received_time,
        }
    }

    /// Builder used by the matching tests and the paper feed.
    pub fn with_depth(
        instrument_token: u32,
        buy: Vec<Level>,
        sell: Vec<Level>,
        received_time: DateTime<Utc>,
    ) -> Self {
        let last_price = buy
            .first()
            .or(sell.first())
            .map(|level| level.price)
            .unwrap_or_default();

        Self {
            mode: StreamMode::Full,
            depth: Depth::new(buy, sell),
            ..Self::ltp(instrument_token, last_price, received_time)
        }
    }

    pub fn segment(&self) -> Segment {
        Segment::from_token(self.instrument_token)
    }
}

/*----- */
// Quote summary
/*----- */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteSummary {
    pub last_traded_quantity: u32,
    pub average_traded_price: Decimal,
    pub volume_traded: u32,
    pub total_buy_quantity: u32,
    pub total_sell_quantity: u32,
    pub ohlc: Ohlc,
    pub last_trade_time: Option<DateTime<Utc>>,
    pub open_interest: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}
