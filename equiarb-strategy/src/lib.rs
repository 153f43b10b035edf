pub mod cost;
pub mod error;
pub mod matching;
pub mod opportunity;
pub mod pair;

pub use cost::{ChargeSchedule, CostModel, ProductType, Side};
pub use error::StrategyError;
pub use matching::{find_match, Match, ThresholdPolicy};
pub use opportunity::{LegOutcome, Opportunity, OpportunityFlags, OpportunityState};
pub use pair::{InstrumentPair, Listing};
