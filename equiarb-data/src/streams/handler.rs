use std::time::Duration;

use crate::{
    error::FeedError,
    model::{order_update::OrderUpdate, tick::Tick},
};

/// Connection events, one method per event. Called from the connection
/// task, so implementations must return quickly and hand work off to
/// another task.
pub trait TickerHandler: Send + Sync + 'static {
    fn on_ticks(&self, ticks: Vec<Tick>);

    fn on_connect(&self, _connection: &str) {}

    fn on_close(&self, _connection: &str, _reason: Option<&FeedError>) {}

    fn on_error(&self, _connection: &str, _error: &FeedError) {}

    fn on_reconnect(&self, _connection: &str, _attempt: u32, _delay: Duration) {}

    fn on_no_reconnect(&self, _connection: &str) {}

    fn on_order_update(&self, _update: OrderUpdate) {}
}
