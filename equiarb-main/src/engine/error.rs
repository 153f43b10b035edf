use equiarb_data::FeedError;
use equiarb_oms::{OrderError, SharedCounterError};
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to build engine due to missing: {0}")]
    BuilderIncomplete(&'static str),

    #[error("Instrument {0} belongs to more than one pair")]
    DuplicateInstrument(u32),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Shared counters error: {0}")]
    SharedCounters(#[from] SharedCounterError),

    #[error("Order client error: {0}")]
    Order(#[from] OrderError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),
}
