use equiarb_data::{FeedError, OrderUpdate, Tick, TickerHandler};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug)]
pub enum EngineEvent {
    Ticks(Vec<Tick>),
    OrderUpdate(OrderUpdate),
}

/// Connection-side half of the engine channel. Every connection shares one
/// `EngineFeed`; the engine task owns the receiver.
#[derive(Debug)]
pub struct EngineFeed {
    receiver_dropped: AtomicBool,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineFeed {
    pub fn new(event_tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            receiver_dropped: AtomicBool::new(false),
            event_tx,
        }
    }

    fn send(&self, event: EngineEvent) {
        if self.receiver_dropped.load(Ordering::Relaxed) {
            return;
        }

        if self.event_tx.send(event).is_err() {
            warn!(
                action = "setting receiver_dropped = true",
                why = "engine receiver dropped",
                "cannot send EngineEvents"
            );
            self.receiver_dropped.store(true, Ordering::Relaxed);
        }
    }
}

impl TickerHandler for EngineFeed {
    fn on_ticks(&self, ticks: Vec<Tick>) {
        self.send(EngineEvent::Ticks(ticks));
    }

    fn on_order_update(&self, update: OrderUpdate) {
        self.send(EngineEvent::OrderUpdate(update));
    }

    fn on_connect(&self, connection: &str) {
        info!(connection, message = "Ticker connected");
    }

    fn on_close(&self, connection: &str, reason: Option<&FeedError>) {
        match reason {
            Some(error) => warn!(connection, error = %error, message = "Ticker connection closed"),
            None => info!(connection, message = "Ticker stopped"),
        }
    }

    fn on_reconnect(&self, connection: &str, attempt: u32, delay: Duration) {
        info!(connection, attempt, delay = ?delay, message = "Ticker reconnecting");
    }

    fn on_no_reconnect(&self, connection: &str) {
        error!(
            connection,
            action = "No further market data from this group",
            message = "Ticker gave up reconnecting"
        );
    }
}
