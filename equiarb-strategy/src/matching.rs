use equiarb_data::{Level, Tick};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    cost::{CostModel, ProductType},
    error::StrategyError,
};

/*----- */
// Threshold policy
/*----- */
#[derive(Debug, Clone, Copy)]
pub enum ThresholdPolicy<'a> {
    /// Constant coefficient, no re-validation.
    Fixed(Decimal),
    /// Coefficient at the reference value, re-validated against the value a
    /// partial walk actually achieves.
    CostAware {
        coef: Decimal,
        product: ProductType,
        min_profit_percent: Decimal,
        model: &'a dyn CostModel,
    },
}

impl ThresholdPolicy<'_> {
    pub fn coef(&self) -> Decimal {
        match self {
            ThresholdPolicy::Fixed(coef) => *coef,
            ThresholdPolicy::CostAware { coef, .. } => *coef,
        }
    }

    fn coef_at(&self, value: Decimal) -> Option<Decimal> {
        match self {
            ThresholdPolicy::Fixed(_) => None,
            ThresholdPolicy::CostAware {
                product,
                min_profit_percent,
                model,
                ..
            } => Some(model.required_coef(*product, value, *min_profit_percent)),
        }
    }
}

/*----- */
// Match
/*----- */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub buy_token: u32,
    pub sell_token: u32,
    /// Worst ask consumed; the buy limit price.
    pub buy_price: Decimal,
    /// Worst bid consumed; the sell limit price.
    pub sell_price: Decimal,
    pub quantity: u64,
    pub spread_coef: Decimal,
    pub threshold: Decimal,
}

impl Match {
    pub fn buy_value(&self) -> Decimal {
        self.buy_price * Decimal::from(self.quantity)
    }

    pub fn sell_value(&self) -> Decimal {
        self.sell_price * Decimal::from(self.quantity)
    }
}

pub fn spread_coef(bid: Decimal, ask: Decimal) -> Decimal {
    if ask.is_zero() {
        return Decimal::ZERO;
    }
    (bid - ask) / ask
}

/// Look for an arbitrage between two listings of the same security.
///
/// Strategy 1 buys on `second` and sells on `first`; strategy 2 is the mirror
/// and only runs when strategy 1 finds nothing, so the same liquidity is never
/// counted twice. `max_holdings` further caps the quantity when set.
pub fn find_match(
    first: &Tick,
    second: &Tick,
    policy: &ThresholdPolicy<'_>,
    max_buy_quantity: u64,
    max_holdings: Option<u64>,
) -> Result<Option<Match>, StrategyError> {
    if first.instrument_token == second.instrument_token {
        return Err(StrategyError::SameInstrument {
            token: first.instrument_token,
        });
    }

    let cap = max_holdings.map_or(max_buy_quantity, |holdings| holdings.min(max_buy_quantity));
    if cap == 0 {
        return Ok(None);
    }

    let strategies = [(first, second), (second, first)];
    for (sell_side, buy_side) in strategies {
        let found = walk(&sell_side.depth.buy, &buy_side.depth.sell, policy, cap).map(|walked| Match {
            buy_token: buy_side.instrument_token,
            sell_token: sell_side.instrument_token,
            buy_price: walked.buy_price,
            sell_price: walked.sell_price,
            quantity: walked.quantity,
            spread_coef: spread_coef(walked.sell_price, walked.buy_price),
            threshold: walked.threshold,
        });

        if found.is_some() {
            return Ok(found);
        }
    }

    Ok(None)
}

struct Walked {
    buy_price: Decimal,
    sell_price: Decimal,
    quantity: u64,
    threshold: Decimal,
}

/// Consume `bids` against `asks` while the top-of-book spread clears the
/// threshold. Works on owned copies so the ticks are left untouched.
fn walk(bids: &[Level], asks: &[Level], policy: &ThresholdPolicy<'_>, cap: u64) -> Option<Walked> {
    let threshold = policy.coef();
    let mut bids = bids.to_vec();
    let mut asks = asks.to_vec();
    let (mut bid_index, mut ask_index) = (0, 0);
    let mut accumulated: u64 = 0;
    let (mut buy_price, mut sell_price) = (Decimal::ZERO, Decimal::ZERO);

    while accumulated < cap && bid_index < bids.len() && ask_index < asks.len() {
        let bid = &mut bids[bid_index];
        let ask = &mut asks[ask_index];

        let coef = spread_coef(bid.price, ask.price);
        if coef < threshold || coef <= Decimal::ZERO {
            break;
        }

        let take = bid.quantity.min(ask.quantity).min(cap - accumulated);
        accumulated += take;
        buy_price = ask.price;
        sell_price = bid.price;

        bid.quantity -= take;
        ask.quantity -= take;
        if bid.quantity == 0 {
            bid_index += 1;
        }
        if ask.quantity == 0 {
            ask_index += 1;
        }
    }

    if accumulated == 0 {
        return None;
    }

    // Below the cap the trade value differs from the reference value the
    // threshold was computed for
    let mut applied = threshold;
    if accumulated < cap {
        if let Some(required) = policy.coef_at(buy_price * Decimal::from(accumulated)) {
            let realised = spread_coef(sell_price, buy_price);
            if realised < required {
                debug!(
                    quantity = accumulated,
                    realised = %realised,
                    required = %required,
                    message = "Partial fill no longer clears its charges"
                );
                return None;
            }
            applied = required;
        }
    }

    Some(Walked {
        buy_price,
        sell_price,
        quantity: accumulated,
        threshold: applied,
    })
}
