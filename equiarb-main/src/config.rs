use config::{Config, Environment, File, FileFormat};
use equiarb_data::{
    shared::subscription_models::DEFAULT_GROUP_CAPACITY,
    streams::consumer::{
        DEFAULT_RECONNECT_MAX_DELAY_SECS, DEFAULT_RECONNECT_MAX_TRIES,
    },
    ReconnectPolicy, StreamMode,
};
use equiarb_oms::admission::{DEFAULT_ADMISSION_CAPACITY, DEFAULT_COOLDOWN};
use equiarb_strategy::{CostModel, InstrumentPair, Listing, ProductType, StrategyError};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use url::Url;

pub const ENV_PREFIX: &str = "EQUIARB";
pub const DEFAULT_FEED_URL: &str = "wss://ws.kite.trade";
pub const DEFAULT_REFERENCE_TRADE_VALUE: Decimal = Decimal::from_parts(50_000, 0, 0, false, 0);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid feed url: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid pair: {0}")]
    Pair(#[from] StrategyError),

    #[error("instrument {token} is listed by both {first} and {second}")]
    DuplicateToken {
        token: u32,
        first: String,
        second: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/*----- */
// Application config
/*----- */
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub feed: FeedSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub pairs: Vec<PairSettings>,
}

impl AppConfig {
    /// Layer the TOML file under `EQUIARB__*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path))
            .add_source(environment())
            .build()?
            .try_deserialize::<AppConfig>()?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()?
            .try_deserialize::<AppConfig>()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pairs.is_empty() {
            return Err(ConfigError::Invalid("no pairs configured".to_string()));
        }
        if self.engine.admission_capacity == 0 {
            return Err(ConfigError::Invalid(
                "admission_capacity must be at least 1".to_string(),
            ));
        }
        if self.engine.reference_trade_value <= Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "reference_trade_value must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.engine.paper_rejection_probability) {
            return Err(ConfigError::Invalid(
                "paper_rejection_probability must be within [0, 1]".to_string(),
            ));
        }

        // Each instrument maps to exactly one pair
        let mut owners = HashMap::<u32, &str>::new();
        for pair in &self.pairs {
            for token in [pair.token_a, pair.token_b] {
                if let Some(first) = owners.insert(token, &pair.trading_symbol) {
                    if first != pair.trading_symbol || pair.token_a == pair.token_b {
                        return Err(ConfigError::DuplicateToken {
                            token,
                            first: first.to_string(),
                            second: pair.trading_symbol.clone(),
                        });
                    }
                    return Err(ConfigError::Invalid(format!(
                        "{} is configured twice",
                        pair.trading_symbol
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn instrument_pairs(
        &self,
        cost_model: Arc<dyn CostModel>,
    ) -> Result<Vec<InstrumentPair>, ConfigError> {
        self.pairs
            .iter()
            .map(|pair| pair.build(self.engine.reference_trade_value, Arc::clone(&cost_model)))
            .collect()
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

/*----- */
// Feed
/*----- */
#[derive(Debug, Clone, Deserialize)]
pub struct FeedSettings {
    #[serde(default = "default_feed_url")]
    pub url: String,
    pub api_key: String,
    pub access_token: String,
    #[serde(default = "default_group_capacity")]
    pub group_capacity: usize,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,
    #[serde(default = "default_reconnect_max_tries")]
    pub reconnect_max_tries: u32,
    #[serde(default = "default_mode")]
    pub mode: StreamMode,
}

impl FeedSettings {
    /// Streaming endpoint with the session credentials attached.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.url)?;
        url.query_pairs_mut()
            .append_pair("api_key", &self.api_key)
            .append_pair("access_token", &self.access_token);
        Ok(url)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reconnect_max_delay_secs, self.reconnect_max_tries)
    }
}

fn default_feed_url() -> String {
    DEFAULT_FEED_URL.to_string()
}

fn default_group_capacity() -> usize {
    DEFAULT_GROUP_CAPACITY
}

fn default_ping_interval_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_secs() -> u64 {
    DEFAULT_RECONNECT_MAX_DELAY_SECS
}

fn default_reconnect_max_tries() -> u32 {
    DEFAULT_RECONNECT_MAX_TRIES
}

fn default_mode() -> StreamMode {
    StreamMode::Full
}

/*----- */
// Engine
/*----- */
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub admission_capacity: u32,
    /// Defaults to the admission capacity.
    pub workers: Option<usize>,
    pub cooldown_secs: u64,
    pub reference_trade_value: Decimal,
    pub min_trade_value: Decimal,
    /// Starting margin. Fetched from the order client when unset.
    pub initial_margin: Option<Decimal>,
    pub shared_counters_path: Option<PathBuf>,
    pub audit_log_path: Option<PathBuf>,
    pub paper_rejection_probability: f64,
    pub stats_interval_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            admission_capacity: DEFAULT_ADMISSION_CAPACITY,
            workers: None,
            cooldown_secs: DEFAULT_COOLDOWN.as_secs(),
            reference_trade_value: DEFAULT_REFERENCE_TRADE_VALUE,
            min_trade_value: Decimal::ZERO,
            initial_margin: None,
            shared_counters_path: None,
            audit_log_path: None,
            paper_rejection_probability: 0.0,
            stats_interval_secs: 300,
        }
    }
}

impl EngineSettings {
    pub fn workers(&self) -> usize {
        self.workers
            .unwrap_or(self.admission_capacity as usize)
            .max(1)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

/*----- */
// Pairs
/*----- */
#[derive(Debug, Clone, Deserialize)]
pub struct PairSettings {
    pub trading_symbol: String,
    pub token_a: u32,
    pub venue_a: String,
    pub token_b: u32,
    pub venue_b: String,
    pub product: ProductType,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    #[serde(default)]
    pub min_profit_percent: Decimal,
    #[serde(default = "default_ordering_enabled")]
    pub ordering_enabled: bool,
    #[serde(default)]
    pub max_holdings: Option<u64>,
}

impl PairSettings {
    pub fn build(
        &self,
        reference_value: Decimal,
        cost_model: Arc<dyn CostModel>,
    ) -> Result<InstrumentPair, ConfigError> {
        let pair = InstrumentPair::builder()
            .trading_symbol(self.trading_symbol.clone())
            .first(Listing::new(self.token_a, self.venue_a.clone()))
            .second(Listing::new(self.token_b, self.venue_b.clone()))
            .product(self.product)
            .leverage(self.leverage)
            .min_profit_percent(self.min_profit_percent)
            .reference_value(reference_value)
            .ordering_enabled(self.ordering_enabled)
            .max_holdings(self.max_holdings)
            .cost_model(cost_model)
            .build()?;

        Ok(pair)
    }
}

fn default_leverage() -> Decimal {
    Decimal::ONE
}

fn default_ordering_enabled() -> bool {
    true
}
