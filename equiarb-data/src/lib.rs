pub mod assets;
pub mod cache;
pub mod error;
pub mod model;
pub mod protocols;
pub mod shared;
pub mod streams;

pub use assets::level::{Depth, Level};
pub use cache::TickCache;
pub use error::{FeedError, ProtocolError};
pub use model::{
    order_update::{OrderStatus, OrderUpdate},
    tick::Tick,
};
pub use shared::subscription_models::{Segment, StreamMode, SubscriptionBook};
pub use streams::{
    consumer::{FeedConfig, ReconnectPolicy, TickerConnection},
    handler::TickerHandler,
    StreamHandle,
};
