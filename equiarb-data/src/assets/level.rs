use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// One price level of a depth ladder.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub quantity: u64,
    pub orders: u16,
}

impl Level {
    pub fn new(price: Decimal, quantity: u64, orders: u16) -> Self {
        Self {
            price,
            quantity,
            orders,
        }
    }

    pub fn value(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} : {})", self.price, self.quantity)
    }
}

/// Both sides of the book as sent by the venue: `buy` holds bids best first,
/// `sell` holds asks best first.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Depth {
    pub buy: Vec<Level>,
    pub sell: Vec<Level>,
}

impl Depth {
    pub fn new(buy: Vec<Level>, sell: Vec<Level>) -> Self {
        Self { buy, sell }
    }

    pub fn best_bid(&self) -> Option<&Level> {
        self.buy.first()
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.sell.first()
    }

    pub fn is_empty(&self) -> bool {
        self.buy.is_empty() && self.sell.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn level_value_is_exact() {
        let level = Level::new(dec!(1886.45), 30, 2);
        assert_eq!(level.value(), dec!(56593.50));
    }

    #[test]
    fn best_levels_come_from_the_front() {
        let depth = Depth::new(
            vec![Level::new(dec!(10.5), 1, 1), Level::new(dec!(10.4), 5, 1)],
            vec![Level::new(dec!(10.6), 2, 1)],
        );

        assert_eq!(depth.best_bid().map(|l| l.price), Some(dec!(10.5)));
        assert_eq!(depth.best_ask().map(|l| l.price), Some(dec!(10.6)));
        assert!(Depth::default().best_ask().is_none());
    }
}
