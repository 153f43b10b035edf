use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("pair {symbol} uses instrument {token} on both venues")]
    IdenticalInstruments { symbol: String, token: u32 },

    #[error("cannot match instrument {token} against itself")]
    SameInstrument { token: u32 },

    #[error("invalid pair {symbol}: {reason}")]
    InvalidPair { symbol: String, reason: String },

    #[error("failed to build pair as {0} is mandatory")]
    BuilderIncomplete(&'static str),
}
