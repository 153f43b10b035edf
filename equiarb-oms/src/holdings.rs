use equiarb_strategy::ProductType;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

use crate::{
    client::{Holding, OrderClient, Position},
    error::OrderError,
};

/*----- */
// Holdings book
/*----- */
/// Delivery quantity of each symbol that can still be sold, across venues.
/// Settled holdings plus today's net delivery position, floored at zero.
#[derive(Debug, Default)]
pub struct HoldingsBook {
    sellable: RwLock<HashMap<String, u64>>,
}

impl HoldingsBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sellable(&self, trading_symbol: &str) -> u64 {
        self.sellable
            .read()
            .get(trading_symbol)
            .copied()
            .unwrap_or(0)
    }

    pub fn update(&self, holdings: &[Holding], positions: &[Position]) {
        let mut net = HashMap::<String, i64>::new();

        holdings.iter().for_each(|holding| {
            *net.entry(holding.trading_symbol.clone()).or_default() += holding.quantity as i64
        });
        positions
            .iter()
            .filter(|position| position.product == ProductType::Cnc)
            .for_each(|position| {
                *net.entry(position.trading_symbol.clone()).or_default() += position.quantity
            });

        *self.sellable.write() = net
            .into_iter()
            .map(|(symbol, quantity)| (symbol, quantity.max(0) as u64))
            .collect();
    }

    pub async fn refresh_from(&self, client: &dyn OrderClient) -> Result<(), OrderError> {
        let holdings = client.holdings().await?;
        let positions = client.positions().await?;
        self.update(&holdings, &positions);

        info!(
            symbols = self.sellable.read().len(),
            message = "Holdings refreshed from broker"
        );
        Ok(())
    }
}
