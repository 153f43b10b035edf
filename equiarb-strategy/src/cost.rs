use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt::Debug};

/*----- */
// Product & side
/*----- */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductType {
    /// Intraday, squared off the same session.
    Mis,
    /// Delivery.
    Cnc,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Mis => "MIS",
            ProductType::Cnc => "CNC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/*----- */
// Cost model
/*----- */
/// `fixed + rate * value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRate {
    pub fixed: Decimal,
    pub rate: Decimal,
}

impl ChargeRate {
    pub const fn new(fixed: Decimal, rate: Decimal) -> Self {
        Self { fixed, rate }
    }

    pub fn apply(&self, value: Decimal) -> Decimal {
        self.fixed + self.rate * value
    }
}

pub trait CostModel: Debug + Send + Sync {
    fn version(&self) -> &str;

    /// Round-trip (buy + sell) charges for a pair traded at `value`.
    fn pair_charges(&self, product: ProductType, value: Decimal) -> ChargeRate;

    /// Estimated charges for one leg.
    fn leg_charges(&self, product: ProductType, side: Side, value: Decimal) -> Decimal;

    /// Minimum spread coefficient for the trade to clear its charges plus
    /// `min_profit_percent`.
    fn required_coef(
        &self,
        product: ProductType,
        value: Decimal,
        min_profit_percent: Decimal,
    ) -> Decimal {
        let charges = self.pair_charges(product, value);
        let profit = min_profit_percent / Decimal::ONE_HUNDRED;

        if value <= Decimal::ZERO {
            return if charges.fixed.is_zero() {
                charges.rate * (Decimal::ONE + profit) + profit
            } else {
                Decimal::MAX
            };
        }

        charges.apply(value) * (Decimal::ONE + profit) / value + profit
    }
}

/*----- */
// Charge schedule
/*----- */
/// Charges for trades whose value is strictly above `above` (or any value
/// when `above` is unset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeTier {
    pub above: Option<Decimal>,
    pub pair: ChargeRate,
    pub buy: ChargeRate,
    pub sell: ChargeRate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeSchedule {
    pub version: String,
    tiers: HashMap<ProductType, Vec<ChargeTier>>,
}

pub const INTRADAY_BREAKPOINT: Decimal = Decimal::from_parts(66_000, 0, 0, false, 0);

impl ChargeSchedule {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            tiers: HashMap::new(),
        }
    }

    pub fn with_tier(mut self, product: ProductType, tier: ChargeTier) -> Self {
        let tiers = self.tiers.entry(product).or_default();
        tiers.push(tier);
        // Highest breakpoint first, catch-all last
        tiers.sort_by(|a, b| b.above.cmp(&a.above));
        self
    }

    fn tier(&self, product: ProductType, value: Decimal) -> Option<&ChargeTier> {
        self.tiers.get(&product)?.iter().find(|tier| match tier.above {
            Some(above) => value > above,
            None => true,
        })
    }

    /// Equity brokerage, STT, exchange and stamp charges as used for NSE/BSE
    /// cash arbitrage.
    pub fn equity() -> Self {
        Self::new("equity-v1")
            .with_tier(
                ProductType::Cnc,
                ChargeTier {
                    above: None,
                    pair: ChargeRate::new(Decimal::new(1593, 2), Decimal::new(2241, 6)),
                    buy: ChargeRate::new(Decimal::ZERO, Decimal::new(1196, 6)),
                    sell: ChargeRate::new(Decimal::new(1593, 2), Decimal::new(1046, 6)),
                },
            )
            .with_tier(
                ProductType::Mis,
                ChargeTier {
                    above: Some(INTRADAY_BREAKPOINT),
                    pair: ChargeRate::new(Decimal::new(472, 1), Decimal::new(38, 5)),
                    buy: ChargeRate::new(Decimal::new(236, 1), Decimal::new(76, 6)),
                    sell: ChargeRate::new(Decimal::new(236, 1), Decimal::new(296, 6)),
                },
            )
            .with_tier(
                ProductType::Mis,
                ChargeTier {
                    above: None,
                    pair: ChargeRate::new(Decimal::ZERO, Decimal::new(11, 4)),
                    buy: ChargeRate::new(Decimal::ZERO, Decimal::new(43, 5)),
                    sell: ChargeRate::new(Decimal::ZERO, Decimal::new(65, 5)),
                },
            )
    }
}

impl Default for ChargeSchedule {
    fn default() -> Self {
        Self::equity()
    }
}

impl CostModel for ChargeSchedule {
    fn version(&self) -> &str {
        &self.version
    }

    fn pair_charges(&self, product: ProductType, value: Decimal) -> ChargeRate {
        self.tier(product, value)
            .map(|tier| tier.pair)
            .unwrap_or(ChargeRate::new(Decimal::ZERO, Decimal::ZERO))
    }

    fn leg_charges(&self, product: ProductType, side: Side, value: Decimal) -> Decimal {
        self.tier(product, value)
            .map(|tier| match side {
                Side::Buy => tier.buy.apply(value),
                Side::Sell => tier.sell.apply(value),
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn required_coef_per_tier() {
        struct TestCase {
            product: ProductType,
            value: Decimal,
            min_profit_percent: Decimal,
            expected: Decimal,
        }

        let model = ChargeSchedule::equity();
        let cases = vec![
            // TC0: intraday below breakpoint is value independent
            TestCase {
                product: ProductType::Mis,
                value: dec!(50000),
                min_profit_percent: dec!(0),
                expected: dec!(0.0011),
            },
            // TC1: intraday above breakpoint
            TestCase {
                product: ProductType::Mis,
                value: dec!(100000),
                min_profit_percent: dec!(0),
                expected: dec!(0.000852),
            },
            // TC2: delivery with profit margin
            TestCase {
                product: ProductType::Cnc,
                value: dec!(100000),
                min_profit_percent: dec!(0.1),
                expected: dec!(0.0034027003),
            },
            // TC3: exactly at the breakpoint uses the lower tier
            TestCase {
                product: ProductType::Mis,
                value: dec!(66000),
                min_profit_percent: dec!(0),
                expected: dec!(0.0011),
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual = model.required_coef(test.product, test.value, test.min_profit_percent);
            assert_eq!(actual, test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn zero_value_with_fixed_charge_is_unreachable() {
        let model = ChargeSchedule::equity();
        assert_eq!(
            model.required_coef(ProductType::Cnc, Decimal::ZERO, dec!(0)),
            Decimal::MAX
        );
        assert_eq!(
            model.required_coef(ProductType::Mis, Decimal::ZERO, dec!(0)),
            dec!(0.0011)
        );
    }

    #[test]
    fn leg_charges_follow_side() {
        let model = ChargeSchedule::equity();

        assert_eq!(
            model.leg_charges(ProductType::Cnc, Side::Buy, dec!(100000)),
            dec!(119.6)
        );
        assert_eq!(
            model.leg_charges(ProductType::Cnc, Side::Sell, dec!(100000)),
            dec!(120.53)
        );
        assert_eq!(
            model.leg_charges(ProductType::Mis, Side::Sell, dec!(100000)),
            dec!(53.2)
        );
    }
}
