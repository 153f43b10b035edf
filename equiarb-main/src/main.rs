use clap::Parser;
use equiarb_data::{
    shared::subscription_models::partition_pairs, FeedConfig, FeedError, SubscriptionBook,
    TickCache, TickerConnection,
};
use equiarb_main::{
    args::Args,
    config::{AppConfig, EngineSettings},
    engine::{error::EngineError, feed::EngineFeed, ArbEngine},
};
use equiarb_oms::{
    AdmissionController, AuditSink, CounterStore, ExecutionContext, ExecutionPipeline, Holding,
    HoldingsBook, InMemoryAuditLog, JsonLinesAuditLog, LocalCounters, OrderClient,
    PaperOrderClient, Rejection, SharedCounters,
};
use equiarb_strategy::{ChargeSchedule, ProductType};
use itertools::Itertools;
use rust_decimal::Decimal;
use std::{collections::HashSet, sync::Arc};
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{error, info, warn};

/*----- */
// Main
/*----- */
#[tokio::main]
pub async fn main() {
    // Initialise logging
    init_logging();

    let args = Args::parse();
    if let Err(error) = run(args).await {
        error!(error = %error, message = "equiarb stopped");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), EngineError> {
    let config = AppConfig::load(&args.config)?;
    let schedule = Arc::new(ChargeSchedule::equity());
    let pairs = config.instrument_pairs(schedule.clone())?;

    info!(
        config = %args.config.display(),
        pairs = pairs.len(),
        cost_model = %schedule.version,
        message = "Configuration loaded"
    );

    /*---------- Order client & admission ---------- */
    warn!(message = "Orders are routed to the paper client");
    // The paper account holds the configured cap of every delivery pair
    let paper_holdings = pairs
        .iter()
        .filter(|pair| pair.product() == ProductType::Cnc)
        .filter_map(|pair| {
            pair.max_holdings.map(|quantity| Holding {
                trading_symbol: pair.trading_symbol.clone(),
                venue: pair.first.venue.clone(),
                quantity,
            })
        })
        .collect_vec();
    let (postback_tx, postback_rx) = mpsc::unbounded_channel();
    let client = Arc::new(
        PaperOrderClient::new(config.engine.initial_margin.unwrap_or_default())
            .with_rejection(match config.engine.paper_rejection_probability {
                probability if probability > 0.0 => Rejection::Random(probability),
                _ => Rejection::Never,
            })
            .with_holdings(paper_holdings)
            .with_postbacks(postback_tx),
    );
    let available = match config.engine.initial_margin {
        Some(margin) => margin,
        None => client.margins().await?.available,
    };
    let admission = AdmissionController::new(
        counters(&config.engine, available)?,
        config.engine.cooldown(),
    );

    let holdings = Arc::new(HoldingsBook::new());
    holdings.refresh_from(client.as_ref()).await?;

    /*---------- Audit ---------- */
    let (audit, audit_writer) = match &config.engine.audit_log_path {
        Some(path) => {
            let (log, writer) = JsonLinesAuditLog::spawn(path.clone());
            (Arc::new(log) as Arc<dyn AuditSink>, Some(writer))
        }
        None => {
            warn!(message = "No audit_log_path configured, audit records are kept in memory");
            (Arc::new(InMemoryAuditLog::new()) as Arc<dyn AuditSink>, None)
        }
    };

    /*---------- Engine ---------- */
    let cache = Arc::new(TickCache::new());
    let pipeline = ExecutionPipeline::spawn(
        config.engine.admission_capacity as usize,
        config.engine.workers(),
        ExecutionContext {
            admission: Arc::clone(&admission),
            cache: Arc::clone(&cache),
            client: client.clone(),
            audit: Arc::clone(&audit),
        },
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let feed = Arc::new(EngineFeed::new(event_tx));

    let symbols = pairs
        .iter()
        .map(|pair| pair.trading_symbol.clone())
        .collect::<HashSet<_>>();
    let groups = partition_pairs(
        &pairs.iter().map(|pair| pair.tokens()).collect_vec(),
        config.feed.group_capacity,
    );

    let engine = ArbEngine::builder()
        .pairs(pairs)
        .cache(cache)
        .admission(admission)
        .holdings(holdings)
        .pipeline(pipeline)
        .audit(Arc::clone(&audit))
        .client(client)
        .event_rx(event_rx)
        .postbacks(postback_rx)
        .min_trade_value(config.engine.min_trade_value)
        .stats_interval(config.engine.stats_interval())
        .build()?;
    let engine = tokio::spawn(engine.run());

    /*---------- Ticker connections ---------- */
    let url = config.feed.endpoint()?;
    let mut handles = Vec::with_capacity(groups.len());
    let mut connections = JoinSet::new();

    for (index, tokens) in groups.into_iter().enumerate() {
        let feed_config = FeedConfig {
            name: format!("ticker-{index}"),
            url: url.clone(),
            ping_interval: config.feed.ping_interval(),
            reconnect: config.feed.reconnect_policy(),
        };
        info!(
            connection = %feed_config.name,
            instruments = tokens.len(),
            message = "Starting ticker connection"
        );

        let (connection, handle) = TickerConnection::new(
            feed_config,
            Arc::clone(&feed),
            SubscriptionBook::new(&tokens, config.feed.mode),
            symbols.clone(),
        );
        handles.push(handle);
        connections.spawn(connection.run());
    }

    // The engine stops once every connection has released the feed
    drop(feed);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(action = "Stopping ticker connections", message = "Shutdown requested");
            handles.iter().for_each(|handle| {
                let _ = handle.stop();
            });
        }
        _ = join_connections(&mut connections) => {}
    }
    join_connections(&mut connections).await;

    if let Err(error) = engine.await {
        error!(error = %error, message = "Engine task ended abnormally");
    }

    drop(audit);
    if let Some(writer) = audit_writer {
        let _ = writer.await;
    }

    info!(message = "equiarb stopped");
    Ok(())
}

fn counters(
    settings: &EngineSettings,
    available: Decimal,
) -> Result<Arc<dyn CounterStore>, EngineError> {
    let capacity = settings.admission_capacity;

    let counters: Arc<dyn CounterStore> = match &settings.shared_counters_path {
        Some(path) if path.exists() => {
            let counters = SharedCounters::open(path)?;
            info!(
                path = %path.display(),
                capacity = counters.capacity(),
                message = "Joined shared admission counters"
            );
            Arc::new(counters)
        }
        Some(path) => Arc::new(SharedCounters::create(path, capacity, available)?),
        None => Arc::new(LocalCounters::new(capacity, available)),
    };

    Ok(counters)
}

async fn join_connections(connections: &mut JoinSet<Result<(), FeedError>>) {
    while let Some(result) = connections.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => error!(error = %error, message = "Ticker connection ended"),
            Err(error) => error!(error = %error, message = "Ticker connection task failed"),
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        // Disable colours on release builds
        .with_ansi(cfg!(debug_assertions))
        // Enable Json formatting
        .json()
        // Install this Tracing subscriber as global default
        .init()
}
