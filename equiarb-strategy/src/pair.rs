use rust_decimal::Decimal;
use std::sync::Arc;

use crate::{
    cost::{ChargeSchedule, CostModel, ProductType},
    error::StrategyError,
    matching::ThresholdPolicy,
};

/// One listing of a security: its feed token and the venue it trades on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub instrument_token: u32,
    pub venue: String,
}

impl Listing {
    pub fn new(instrument_token: u32, venue: impl Into<String>) -> Self {
        Self {
            instrument_token,
            venue: venue.into(),
        }
    }
}

/*----- */
// Instrument pair
/*----- */
/// The same security listed on two venues, with its trading parameters.
/// The threshold coefficient is cached and recomputed by every setter that
/// feeds the cost model.
#[derive(Debug, Clone)]
pub struct InstrumentPair {
    pub trading_symbol: String,
    pub first: Listing,
    pub second: Listing,
    pub leverage: Decimal,
    pub ordering_enabled: bool,
    pub max_holdings: Option<u64>,
    product: ProductType,
    min_profit_percent: Decimal,
    reference_value: Decimal,
    threshold: Decimal,
    cost_model: Arc<dyn CostModel>,
}

impl InstrumentPair {
    pub fn builder() -> InstrumentPairBuilder {
        InstrumentPairBuilder::new()
    }

    pub fn product(&self) -> ProductType {
        self.product
    }

    pub fn min_profit_percent(&self) -> Decimal {
        self.min_profit_percent
    }

    pub fn reference_value(&self) -> Decimal {
        self.reference_value
    }

    pub fn threshold_coef(&self) -> Decimal {
        self.threshold
    }

    pub fn cost_model(&self) -> &dyn CostModel {
        self.cost_model.as_ref()
    }

    pub fn set_min_profit_percent(&mut self, min_profit_percent: Decimal) {
        self.min_profit_percent = min_profit_percent;
        self.refresh_threshold();
    }

    pub fn set_product(&mut self, product: ProductType) {
        self.product = product;
        self.refresh_threshold();
    }

    pub fn set_reference_value(&mut self, reference_value: Decimal) {
        self.reference_value = reference_value;
        self.refresh_threshold();
    }

    pub fn set_cost_model(&mut self, cost_model: Arc<dyn CostModel>) {
        self.cost_model = cost_model;
        self.refresh_threshold();
    }

    fn refresh_threshold(&mut self) {
        self.threshold = self.cost_model.required_coef(
            self.product,
            self.reference_value,
            self.min_profit_percent,
        );
    }

    pub fn policy(&self) -> ThresholdPolicy<'_> {
        ThresholdPolicy::CostAware {
            coef: self.threshold,
            product: self.product,
            min_profit_percent: self.min_profit_percent,
            model: self.cost_model.as_ref(),
        }
    }

    pub fn tokens(&self) -> (u32, u32) {
        (self.first.instrument_token, self.second.instrument_token)
    }

    pub fn contains(&self, instrument_token: u32) -> bool {
        self.first.instrument_token == instrument_token
            || self.second.instrument_token == instrument_token
    }

    /// Token of the same security on the other venue.
    pub fn equivalent_of(&self, instrument_token: u32) -> Option<u32> {
        if instrument_token == self.first.instrument_token {
            Some(self.second.instrument_token)
        } else if instrument_token == self.second.instrument_token {
            Some(self.first.instrument_token)
        } else {
            None
        }
    }

    pub fn venue_of(&self, instrument_token: u32) -> Option<&str> {
        [&self.first, &self.second]
            .into_iter()
            .find(|listing| listing.instrument_token == instrument_token)
            .map(|listing| listing.venue.as_str())
    }

    /// Margin blocked by one leg at the broker's leverage.
    pub fn margin_for(&self, price: Decimal, quantity: u64) -> Decimal {
        price * Decimal::from(quantity) / self.leverage
    }
}

/*----- */
// Instrument pair builder
/*----- */
#[derive(Debug, Default)]
pub struct InstrumentPairBuilder {
    trading_symbol: Option<String>,
    first: Option<Listing>,
    second: Option<Listing>,
    product: Option<ProductType>,
    leverage: Option<Decimal>,
    min_profit_percent: Option<Decimal>,
    reference_value: Option<Decimal>,
    ordering_enabled: bool,
    max_holdings: Option<u64>,
    cost_model: Option<Arc<dyn CostModel>>,
}

impl InstrumentPairBuilder {
    pub fn new() -> Self {
        Self {
            ordering_enabled: true,
            ..Default::default()
        }
    }

    pub fn trading_symbol(self, value: impl Into<String>) -> Self {
        Self {
            trading_symbol: Some(value.into()),
            ..self
        }
    }

    pub fn first(self, value: Listing) -> Self {
        Self {
            first: Some(value),
            ..self
        }
    }

    pub fn second(self, value: Listing) -> Self {
        Self {
            second: Some(value),
            ..self
        }
    }

    pub fn product(self, value: ProductType) -> Self {
        Self {
            product: Some(value),
            ..self
        }
    }

    pub fn leverage(self, value: Decimal) -> Self {
        Self {
            leverage: Some(value),
            ..self
        }
    }

    pub fn min_profit_percent(self, value: Decimal) -> Self {
        Self {
            min_profit_percent: Some(value),
            ..self
        }
    }

    pub fn reference_value(self, value: Decimal) -> Self {
        Self {
            reference_value: Some(value),
            ..self
        }
    }

    pub fn ordering_enabled(self, value: bool) -> Self {
        Self {
            ordering_enabled: value,
            ..self
        }
    }

    pub fn max_holdings(self, value: Option<u64>) -> Self {
        Self {
            max_holdings: value,
            ..self
        }
    }

    pub fn cost_model(self, value: Arc<dyn CostModel>) -> Self {
        Self {
            cost_model: Some(value),
            ..self
        }
    }

    pub fn build(self) -> Result<InstrumentPair, StrategyError> {
        let trading_symbol = self
            .trading_symbol
            .ok_or(StrategyError::BuilderIncomplete("trading_symbol"))?;
        let first = self.first.ok_or(StrategyError::BuilderIncomplete("first"))?;
        let second = self.second.ok_or(StrategyError::BuilderIncomplete("second"))?;

        if first.instrument_token == second.instrument_token {
            return Err(StrategyError::IdenticalInstruments {
                symbol: trading_symbol,
                token: first.instrument_token,
            });
        }

        let leverage = self.leverage.unwrap_or(Decimal::ONE);
        if leverage < Decimal::ONE {
            return Err(StrategyError::InvalidPair {
                symbol: trading_symbol,
                reason: format!("leverage {leverage} is below 1"),
            });
        }

        let min_profit_percent = self.min_profit_percent.unwrap_or_default();
        if min_profit_percent.is_sign_negative() {
            return Err(StrategyError::InvalidPair {
                symbol: trading_symbol,
                reason: format!("min profit percent {min_profit_percent} is negative"),
            });
        }

        let mut pair = InstrumentPair {
            trading_symbol,
            first,
            second,
            leverage,
            ordering_enabled: self.ordering_enabled,
            max_holdings: self.max_holdings,
            product: self.product.ok_or(StrategyError::BuilderIncomplete("product"))?,
            min_profit_percent,
            reference_value: self
                .reference_value
                .ok_or(StrategyError::BuilderIncomplete("reference_value"))?,
            threshold: Decimal::ZERO,
            cost_model: self
                .cost_model
                .unwrap_or_else(|| Arc::new(ChargeSchedule::equity())),
        };
        pair.refresh_threshold();

        Ok(pair)
    }
}
