use equiarb_strategy::Side;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

/*----- */
// Order client errors
/*----- */
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrderError {
    #[error("order rejected by venue: {0}")]
    Rejected(String),

    #[error("order api rate limited")]
    RateLimited,

    #[error("order api session expired")]
    SessionExpired,

    #[error("order api transport error: {0}")]
    Transport(String),
}

/*----- */
// Admission
/*----- */
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionDenied {
    #[error("{symbol} cooling down for another {remaining:?}")]
    CoolingDown { symbol: String, remaining: Duration },

    #[error("all {capacity} admission slots in use")]
    NoSlot { capacity: u32 },

    #[error("insufficient margin: required {required}, available {available}")]
    InsufficientMargin {
        required: Decimal,
        available: Decimal,
    },
}

#[derive(Debug, Error)]
pub enum SharedCounterError {
    #[error("shared counter file io: {0}")]
    Io(#[from] std::io::Error),

    #[error("shared counter file is {len} bytes, expected at least {expected}")]
    TooSmall { len: u64, expected: u64 },

    #[error("shared counter file has unrecognised header {found:#x}")]
    BadMagic { found: u64 },
}

/*----- */
// Execution
/*----- */
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("opportunity superseded by newer market data")]
    StaleOpportunity,

    #[error("{side:?} leg failed: {source}")]
    OrderRejected { side: Side, source: OrderError },

    #[error("internal fault: {0}")]
    InternalFault(String),

    #[error("execution queue is full")]
    QueueFull,

    #[error("execution queue is closed")]
    QueueClosed,
}
