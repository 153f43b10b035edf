use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    cost::{ProductType, Side},
    matching::Match,
    pair::InstrumentPair,
};

/*----- */
// Opportunity state
/*----- */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityState {
    Detected,
    DiscardedStale,
    Held,
    Queued,
    Dequeued,
    Ordering,
    Finalized,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityFlags {
    pub stale: bool,
    pub on_hold: bool,
    pub low_margin_hold: bool,
    pub cooldown_hold: bool,
    pub ordering_disabled: bool,
    pub internal_fault: bool,
    pub needs_reconciliation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegOutcome {
    Pending,
    Ordered { order_id: String },
    Failed { reason: String },
}

/*----- */
// Leg
/*----- */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub side: Side,
    pub instrument_token: u32,
    pub venue: String,
    pub price: Decimal,
    pub quantity: u64,
    /// Source tick ingest time for this side of the decision.
    pub tick_received_time: DateTime<Utc>,
    pub task_received_at: Option<DateTime<Utc>>,
    pub ordered_at: Option<DateTime<Utc>>,
    pub outcome: LegOutcome,
}

impl Leg {
    pub fn order_id(&self) -> Option<&str> {
        match &self.outcome {
            LegOutcome::Ordered { order_id } => Some(order_id),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, LegOutcome::Failed { .. })
    }

    pub fn value(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

/*----- */
// Opportunity
/*----- */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub trading_symbol: String,
    pub product: ProductType,
    pub buy: Leg,
    pub sell: Leg,
    pub quantity: u64,
    pub spread_coef: Decimal,
    pub threshold: Decimal,
    pub leverage: Decimal,
    pub required_margin: Decimal,
    pub detected_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub dequeued_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub state: OpportunityState,
    pub flags: OpportunityFlags,
    pub note: Option<String>,
}

impl Opportunity {
    pub fn new(
        pair: &InstrumentPair,
        found: Match,
        buy_tick_received: DateTime<Utc>,
        sell_tick_received: DateTime<Utc>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let leg = |side: Side, instrument_token: u32, price: Decimal, tick_received_time| Leg {
            side,
            instrument_token,
            venue: pair.venue_of(instrument_token).unwrap_or_default().to_string(),
            price,
            quantity: found.quantity,
            tick_received_time,
            task_received_at: None,
            ordered_at: None,
            outcome: LegOutcome::Pending,
        };

        Self {
            id: Uuid::new_v4(),
            trading_symbol: pair.trading_symbol.clone(),
            product: pair.product(),
            buy: leg(Side::Buy, found.buy_token, found.buy_price, buy_tick_received),
            sell: leg(Side::Sell, found.sell_token, found.sell_price, sell_tick_received),
            quantity: found.quantity,
            spread_coef: found.spread_coef,
            threshold: found.threshold,
            leverage: pair.leverage,
            required_margin: pair.margin_for(found.buy_price + found.sell_price, found.quantity),
            detected_at,
            queued_at: None,
            dequeued_at: None,
            finalized_at: None,
            state: OpportunityState::Detected,
            flags: OpportunityFlags::default(),
            note: None,
        }
    }

    pub fn leg(&self, side: Side) -> &Leg {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    pub fn leg_mut(&mut self, side: Side) -> &mut Leg {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }

    /// Margin blocked by one leg alone.
    pub fn leg_margin(&self, side: Side) -> Decimal {
        self.leg(side).value() / self.leverage
    }

    pub fn gross_profit(&self) -> Decimal {
        self.sell.value() - self.buy.value()
    }

    pub fn mark_queued(&mut self, at: DateTime<Utc>) {
        self.state = OpportunityState::Queued;
        self.queued_at = Some(at);
    }

    pub fn mark_dequeued(&mut self, at: DateTime<Utc>) {
        self.state = OpportunityState::Dequeued;
        self.dequeued_at = Some(at);
    }

    pub fn mark_stale(&mut self, at: DateTime<Utc>) {
        self.state = OpportunityState::DiscardedStale;
        self.flags.stale = true;
        self.finalized_at = Some(at);
    }

    pub fn mark_held(&mut self, at: DateTime<Utc>, note: impl Into<String>) {
        self.state = OpportunityState::Held;
        self.flags.on_hold = true;
        self.note = Some(note.into());
        self.finalized_at = Some(at);
    }

    pub fn mark_fault(&mut self, at: DateTime<Utc>, note: impl Into<String>) {
        self.flags.internal_fault = true;
        self.note = Some(note.into());
        self.state = OpportunityState::Finalized;
        self.finalized_at = Some(at);
    }

    /// Close out after both legs ran; exactly one failed leg means the
    /// position is lopsided.
    pub fn finalize(&mut self, at: DateTime<Utc>) {
        self.flags.needs_reconciliation = self.buy.is_failed() != self.sell.is_failed();
        self.state = OpportunityState::Finalized;
        self.finalized_at = Some(at);
    }
}
