pub mod error;
pub mod feed;

use chrono::Utc;
use equiarb_data::{shared::stats::ArrivalStats, OrderUpdate, Tick, TickCache};
use equiarb_oms::{
    execution::EnqueueRejected, AdmissionController, AdmissionDenied, AuditSink,
    ExecutionError, ExecutionPipeline, HoldingsBook, OrderClient, QueuedOpportunity,
};
use equiarb_strategy::{find_match, InstrumentPair, Opportunity, ProductType, Side};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::{error::EngineError, feed::EngineEvent};

pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(300);

/// What happened to one detected opportunity.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Enqueued(Uuid),
    DiscardedStale(Uuid),
    /// Ordering is disabled for the pair; recorded only.
    Recorded(Uuid),
    Held { id: Uuid, reason: AdmissionDenied },
    Rejected { id: Uuid, error: ExecutionError },
}

struct Detection {
    pair: usize,
    opportunity: Opportunity,
    ticks: [Arc<Tick>; 2],
}

/*----- */
// Arbitrage engine
/*----- */
/// Consumes tick batches from every connection, merges them into the cache,
/// runs matching for each updated pair, then admits and enqueues.
pub struct ArbEngine {
    pairs: Vec<InstrumentPair>,
    pair_by_token: HashMap<u32, usize>,
    cache: Arc<TickCache>,
    admission: Arc<AdmissionController>,
    holdings: Arc<HoldingsBook>,
    pipeline: ExecutionPipeline,
    audit: Arc<dyn AuditSink>,
    client: Arc<dyn OrderClient>,
    event_rx: mpsc::UnboundedReceiver<EngineEvent>,
    postbacks: Option<mpsc::UnboundedReceiver<OrderUpdate>>,
    min_trade_value: Decimal,
    stats: ArrivalStats,
    stats_interval: Duration,
}

impl ArbEngine {
    pub fn builder() -> ArbEngineBuilder {
        ArbEngineBuilder::new()
    }

    pub async fn run(mut self) {
        let mut stats_timer = tokio::time::interval(self.stats_interval);
        stats_timer.tick().await;

        loop {
            tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(EngineEvent::Ticks(ticks)) => {
                        self.process_ticks(ticks);
                    }
                    Some(EngineEvent::OrderUpdate(update)) => self.on_order_update(update),
                    None => break,
                },
                update = next_postback(&mut self.postbacks) => match update {
                    Some(update) => self.on_order_update(update),
                    None => self.postbacks = None,
                },
                _ = stats_timer.tick() => self.log_arrival_stats(),
            }
        }

        info!(
            action = "Draining execution pipeline",
            message = "All ticker connections ended"
        );
        self.log_arrival_stats();
        self.shutdown().await;
    }

    /// Wait for queued opportunities to finish.
    pub async fn shutdown(self) {
        self.pipeline.shutdown().await;
    }

    pub fn process_ticks(&mut self, ticks: Vec<Tick>) -> Vec<Dispatch> {
        let updated = self.cache.merge(ticks);
        updated
            .iter()
            .for_each(|tick| self.stats.record(tick.instrument_token, tick.received_time));

        // Both listings of a pair may update in one batch; evaluate once
        let mut evaluated = HashSet::new();
        updated
            .iter()
            .filter(|tick| {
                self.pair_by_token
                    .get(&tick.instrument_token)
                    .is_some_and(|pair| evaluated.insert(*pair))
            })
            .filter_map(|tick| self.detect(tick))
            .map(|detection| self.dispatch(detection))
            .collect()
    }

    fn detect(&self, tick: &Arc<Tick>) -> Option<Detection> {
        let index = *self.pair_by_token.get(&tick.instrument_token)?;
        let pair = &self.pairs[index];
        let equivalent = self.cache.latest(pair.equivalent_of(tick.instrument_token)?)?;

        if !tick.tradable || !equivalent.tradable {
            return None;
        }

        let ask = tick.depth.best_ask()?.price;
        if ask <= Decimal::ZERO {
            return None;
        }

        let max_buy_quantity = self.max_buy_quantity(pair, ask);
        if max_buy_quantity == 0 {
            debug!(
                symbol = %pair.trading_symbol,
                available = %self.admission.available(),
                message = "No margin for a single unit"
            );
            return None;
        }

        let (first, second) = if tick.instrument_token == pair.first.instrument_token {
            (Arc::clone(tick), equivalent)
        } else {
            (equivalent, Arc::clone(tick))
        };

        let found = match find_match(
            &first,
            &second,
            &pair.policy(),
            max_buy_quantity,
            self.sell_cap(pair),
        ) {
            Ok(Some(found)) => found,
            Ok(None) => return None,
            Err(error) => {
                warn!(symbol = %pair.trading_symbol, error = %error, message = "Matching failed");
                return None;
            }
        };

        if found.buy_value() < self.min_trade_value {
            debug!(
                symbol = %pair.trading_symbol,
                value = %found.buy_value(),
                minimum = %self.min_trade_value,
                message = "Match below minimum trade value"
            );
            return None;
        }

        let (buy_tick, sell_tick) = if found.buy_token == first.instrument_token {
            (&first, &second)
        } else {
            (&second, &first)
        };
        let opportunity = Opportunity::new(
            pair,
            found,
            buy_tick.received_time,
            sell_tick.received_time,
            Utc::now(),
        );

        Some(Detection {
            pair: index,
            opportunity,
            ticks: [first, second],
        })
    }

    /// Largest quantity whose two legs fit the available margin at `ask`.
    fn max_buy_quantity(&self, pair: &InstrumentPair, ask: Decimal) -> u64 {
        (self.admission.available() * pair.leverage / (Decimal::TWO * ask))
            .floor()
            .to_u64()
            .unwrap_or(0)
    }

    /// Delivery sells are bounded by the holdings that are still sellable.
    fn sell_cap(&self, pair: &InstrumentPair) -> Option<u64> {
        match pair.product() {
            ProductType::Cnc if pair.ordering_enabled => {
                let sellable = self.holdings.sellable(&pair.trading_symbol);
                Some(pair.max_holdings.map_or(sellable, |cap| cap.min(sellable)))
            }
            _ => pair.max_holdings,
        }
    }

    fn dispatch(&self, detection: Detection) -> Dispatch {
        let Detection {
            pair,
            mut opportunity,
            ticks,
        } = detection;
        let pair = &self.pairs[pair];
        let id = opportunity.id;

        if ticks.iter().any(|tick| self.cache.is_stale(tick)) {
            opportunity.mark_stale(Utc::now());
            opportunity.note = Some(ExecutionError::StaleOpportunity.to_string());
            self.audit.record_opportunity(&opportunity);
            return Dispatch::DiscardedStale(id);
        }

        if !pair.ordering_enabled {
            opportunity.flags.ordering_disabled = true;
            opportunity.finalized_at = Some(Utc::now());
            self.audit.record_opportunity(&opportunity);
            return Dispatch::Recorded(id);
        }

        let permit = match self
            .admission
            .admit(&opportunity.trading_symbol, opportunity.required_margin)
        {
            Ok(permit) => permit,
            Err(reason) => {
                match &reason {
                    AdmissionDenied::CoolingDown { .. } => opportunity.flags.cooldown_hold = true,
                    AdmissionDenied::InsufficientMargin { .. } => {
                        opportunity.flags.low_margin_hold = true
                    }
                    AdmissionDenied::NoSlot { .. } => {}
                }
                opportunity.mark_held(Utc::now(), reason.to_string());
                debug!(
                    id = %id,
                    symbol = %opportunity.trading_symbol,
                    reason = %reason,
                    message = "Opportunity held"
                );
                self.audit.record_opportunity(&opportunity);
                return Dispatch::Held { id, reason };
            }
        };

        let model = pair.cost_model();
        let charges = model.leg_charges(opportunity.product, Side::Buy, opportunity.buy.value())
            + model.leg_charges(opportunity.product, Side::Sell, opportunity.sell.value());
        info!(
            id = %id,
            symbol = %opportunity.trading_symbol,
            buy_venue = %opportunity.buy.venue,
            sell_venue = %opportunity.sell.venue,
            buy_price = %opportunity.buy.price,
            sell_price = %opportunity.sell.price,
            quantity = opportunity.quantity,
            spread_coef = %opportunity.spread_coef.round_dp(6),
            estimated_net = %(opportunity.gross_profit() - charges).round_dp(2),
            message = "Opportunity admitted"
        );

        self.audit
            .record_ticks(ticks.iter().map(|tick| Tick::clone(tick)).collect());

        match self.pipeline.try_enqueue(QueuedOpportunity {
            opportunity,
            permit,
        }) {
            Ok(()) => Dispatch::Enqueued(id),
            Err(EnqueueRejected { error, queued }) => {
                let QueuedOpportunity {
                    mut opportunity,
                    permit,
                } = *queued;
                drop(permit);

                match error {
                    ExecutionError::QueueFull => opportunity.mark_held(Utc::now(), error.to_string()),
                    _ => opportunity.mark_fault(Utc::now(), error.to_string()),
                }
                warn!(id = %id, error = %error, message = "Failed to enqueue opportunity");
                self.audit.record_opportunity(&opportunity);
                Dispatch::Rejected { id, error }
            }
        }
    }

    fn on_order_update(&self, update: OrderUpdate) {
        self.audit.record_order_update(&update);

        if update.status.is_final() {
            tokio::spawn(refresh_account(
                Arc::clone(&self.client),
                Arc::clone(&self.admission),
                Arc::clone(&self.holdings),
            ));
        }
    }

    fn log_arrival_stats(&self) {
        for summary in self.stats.summaries() {
            info!(
                instrument_token = summary.instrument_token,
                count = summary.count,
                min_ms = summary.min_ms,
                max_ms = summary.max_ms,
                mean_ms = summary.mean_ms,
                std_ms = summary.std_ms,
                message = "Tick inter-arrival"
            );
        }
    }
}

/// Pull the broker's balance and holdings after an order settles. The margin
/// re-base is deferred to the execution workers while pairs are in flight.
pub async fn refresh_account(
    client: Arc<dyn OrderClient>,
    admission: Arc<AdmissionController>,
    holdings: Arc<HoldingsBook>,
) {
    if let Err(error) = admission.resync_from(client.as_ref()).await {
        warn!(error = %error, message = "Failed to fetch margins for resync");
    }
    if let Err(error) = holdings.refresh_from(client.as_ref()).await {
        warn!(error = %error, message = "Failed to refresh holdings");
    }
}

async fn next_postback(
    postbacks: &mut Option<mpsc::UnboundedReceiver<OrderUpdate>>,
) -> Option<OrderUpdate> {
    match postbacks {
        Some(postbacks) => postbacks.recv().await,
        None => std::future::pending().await,
    }
}

/*----- */
// Arbitrage engine builder
/*----- */
#[derive(Default)]
pub struct ArbEngineBuilder {
    pairs: Option<Vec<InstrumentPair>>,
    cache: Option<Arc<TickCache>>,
    admission: Option<Arc<AdmissionController>>,
    holdings: Option<Arc<HoldingsBook>>,
    pipeline: Option<ExecutionPipeline>,
    audit: Option<Arc<dyn AuditSink>>,
    client: Option<Arc<dyn OrderClient>>,
    event_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    postbacks: Option<mpsc::UnboundedReceiver<OrderUpdate>>,
    min_trade_value: Option<Decimal>,
    stats_interval: Option<Duration>,
}

impl ArbEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pairs(self, value: Vec<InstrumentPair>) -> Self {
        Self {
            pairs: Some(value),
            ..self
        }
    }

    pub fn cache(self, value: Arc<TickCache>) -> Self {
        Self {
            cache: Some(value),
            ..self
        }
    }

    pub fn admission(self, value: Arc<AdmissionController>) -> Self {
        Self {
            admission: Some(value),
            ..self
        }
    }

    pub fn holdings(self, value: Arc<HoldingsBook>) -> Self {
        Self {
            holdings: Some(value),
            ..self
        }
    }

    pub fn pipeline(self, value: ExecutionPipeline) -> Self {
        Self {
            pipeline: Some(value),
            ..self
        }
    }

    pub fn audit(self, value: Arc<dyn AuditSink>) -> Self {
        Self {
            audit: Some(value),
            ..self
        }
    }

    pub fn client(self, value: Arc<dyn OrderClient>) -> Self {
        Self {
            client: Some(value),
            ..self
        }
    }

    pub fn event_rx(self, value: mpsc::UnboundedReceiver<EngineEvent>) -> Self {
        Self {
            event_rx: Some(value),
            ..self
        }
    }

    /// Order updates produced by the order client itself rather than the
    /// ticker connections.
    pub fn postbacks(self, value: mpsc::UnboundedReceiver<OrderUpdate>) -> Self {
        Self {
            postbacks: Some(value),
            ..self
        }
    }

    pub fn min_trade_value(self, value: Decimal) -> Self {
        Self {
            min_trade_value: Some(value),
            ..self
        }
    }

    pub fn stats_interval(self, value: Duration) -> Self {
        Self {
            stats_interval: Some(value),
            ..self
        }
    }

    pub fn build(self) -> Result<ArbEngine, EngineError> {
        let pairs = self.pairs.ok_or(EngineError::BuilderIncomplete("pairs"))?;

        let mut pair_by_token = HashMap::with_capacity(pairs.len() * 2);
        for (index, pair) in pairs.iter().enumerate() {
            let (first, second) = pair.tokens();
            for token in [first, second] {
                if pair_by_token.insert(token, index).is_some() {
                    return Err(EngineError::DuplicateInstrument(token));
                }
            }
        }

        Ok(ArbEngine {
            pairs,
            pair_by_token,
            cache: self.cache.ok_or(EngineError::BuilderIncomplete("cache"))?,
            admission: self
                .admission
                .ok_or(EngineError::BuilderIncomplete("admission"))?,
            holdings: self
                .holdings
                .ok_or(EngineError::BuilderIncomplete("holdings"))?,
            pipeline: self
                .pipeline
                .ok_or(EngineError::BuilderIncomplete("pipeline"))?,
            audit: self.audit.ok_or(EngineError::BuilderIncomplete("audit"))?,
            client: self.client.ok_or(EngineError::BuilderIncomplete("client"))?,
            event_rx: self
                .event_rx
                .ok_or(EngineError::BuilderIncomplete("event_rx"))?,
            postbacks: self.postbacks,
            min_trade_value: self.min_trade_value.unwrap_or_default(),
            stats: ArrivalStats::default(),
            stats_interval: self.stats_interval.unwrap_or(DEFAULT_STATS_INTERVAL),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration};
    use equiarb_data::{Level, OrderStatus};
    use equiarb_oms::{
        audit::AuditRecord, ExecutionContext, Holding, InMemoryAuditLog, LocalCounters,
        OrderRequest, PaperOrderClient, Rejection,
    };
    use equiarb_strategy::{ChargeSchedule, Listing, OpportunityState, ProductType};
    use rust_decimal_macros::dec;

    const NSE_TOKEN: u32 = 779521;
    const BSE_TOKEN: u32 = 128028676;

    struct Harness {
        engine: ArbEngine,
        admission: Arc<AdmissionController>,
        holdings: Arc<HoldingsBook>,
        client: Arc<PaperOrderClient>,
        audit: Arc<InMemoryAuditLog>,
        _event_tx: mpsc::UnboundedSender<EngineEvent>,
    }

    fn pair(ordering_enabled: bool) -> InstrumentPair {
        InstrumentPair::builder()
            .trading_symbol("SBIN")
            .first(Listing::new(NSE_TOKEN, "NSE"))
            .second(Listing::new(BSE_TOKEN, "BSE"))
            .product(ProductType::Mis)
            .leverage(dec!(5))
            .reference_value(dec!(50000))
            .ordering_enabled(ordering_enabled)
            .cost_model(Arc::new(ChargeSchedule::equity()))
            .build()
            .unwrap()
    }

    fn delivery_pair() -> InstrumentPair {
        InstrumentPair::builder()
            .trading_symbol("SBIN")
            .first(Listing::new(NSE_TOKEN, "NSE"))
            .second(Listing::new(BSE_TOKEN, "BSE"))
            .product(ProductType::Cnc)
            .leverage(dec!(1))
            .reference_value(dec!(50000))
            .cost_model(Arc::new(ChargeSchedule::equity()))
            .build()
            .unwrap()
    }

    fn harness(available: Decimal, ordering_enabled: bool, min_trade_value: Decimal) -> Harness {
        harness_with(
            pair(ordering_enabled),
            PaperOrderClient::new(available),
            available,
            min_trade_value,
            None,
        )
    }

    fn harness_with(
        pair: InstrumentPair,
        client: PaperOrderClient,
        available: Decimal,
        min_trade_value: Decimal,
        postbacks: Option<mpsc::UnboundedReceiver<OrderUpdate>>,
    ) -> Harness {
        let admission = AdmissionController::new(
            Arc::new(LocalCounters::new(4, available)),
            Duration::from_secs(60),
        );
        let holdings = Arc::new(HoldingsBook::new());
        let client = Arc::new(client);
        let audit = Arc::new(InMemoryAuditLog::new());
        let cache = Arc::new(TickCache::new());
        let pipeline = ExecutionPipeline::spawn(
            4,
            4,
            ExecutionContext {
                admission: Arc::clone(&admission),
                cache: Arc::clone(&cache),
                client: client.clone(),
                audit: audit.clone(),
            },
        );
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut builder = ArbEngine::builder()
            .pairs(vec![pair])
            .cache(cache)
            .admission(Arc::clone(&admission))
            .holdings(Arc::clone(&holdings))
            .pipeline(pipeline)
            .audit(audit.clone())
            .client(client.clone())
            .event_rx(event_rx)
            .min_trade_value(min_trade_value);
        if let Some(postbacks) = postbacks {
            builder = builder.postbacks(postbacks);
        }

        Harness {
            engine: builder.build().unwrap(),
            admission,
            holdings,
            client,
            audit,
            _event_tx: event_tx,
        }
    }

    /// NSE bids 501 x 10, BSE asks 500 x 10: buy on BSE, sell on NSE.
    fn crossed_batch(at: DateTime<Utc>) -> Vec<Tick> {
        vec![
            Tick::with_depth(
                NSE_TOKEN,
                vec![Level::new(dec!(501), 10, 1)],
                vec![Level::new(dec!(501.5), 10, 1)],
                at,
            ),
            Tick::with_depth(
                BSE_TOKEN,
                vec![Level::new(dec!(499), 10, 1)],
                vec![Level::new(dec!(500), 10, 1)],
                at,
            ),
        ]
    }

    #[tokio::test]
    async fn crossed_books_are_enqueued_and_executed() {
        let mut harness = harness(dec!(100000), true, Decimal::ZERO);

        let dispatched = harness.engine.process_ticks(crossed_batch(Utc::now()));
        assert_eq!(dispatched.len(), 1);
        assert!(matches!(dispatched[0], Dispatch::Enqueued(_)));

        harness.engine.shutdown().await;

        let executed = harness.audit.opportunities();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].state, OpportunityState::Finalized);
        assert_eq!(executed[0].buy.venue, "BSE");
        assert_eq!(executed[0].sell.venue, "NSE");
        assert_eq!(executed[0].quantity, 10);
        assert_eq!(harness.client.placed().len(), 2);
        assert!(harness
            .audit
            .records()
            .iter()
            .any(|record| matches!(record, AuditRecord::Ticks { ticks, .. } if ticks.len() == 2)));

        // Legs stay committed
        assert_eq!(harness.admission.available(), dec!(97998));
    }

    #[tokio::test]
    async fn no_match_without_equivalent_tick() {
        let mut harness = harness(dec!(100000), true, Decimal::ZERO);
        let mut batch = crossed_batch(Utc::now());
        batch.truncate(1);

        assert!(harness.engine.process_ticks(batch).is_empty());
        harness.engine.shutdown().await;
        assert!(harness.audit.records().is_empty());
    }

    #[tokio::test]
    async fn small_matches_are_filtered() {
        let mut harness = harness(dec!(100000), true, dec!(10000));

        assert!(harness.engine.process_ticks(crossed_batch(Utc::now())).is_empty());
        harness.engine.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_pairs_are_only_recorded() {
        let mut harness = harness(dec!(100000), false, Decimal::ZERO);

        let dispatched = harness.engine.process_ticks(crossed_batch(Utc::now()));
        assert!(matches!(dispatched[0], Dispatch::Recorded(_)));
        harness.engine.shutdown().await;

        let recorded = harness.audit.opportunities();
        assert!(recorded[0].flags.ordering_disabled);
        assert!(harness.client.placed().is_empty());
        assert_eq!(harness.admission.slots_in_use(), 0);
    }

    #[tokio::test]
    async fn full_admission_holds_the_opportunity() {
        let mut harness = harness(dec!(100000), true, Decimal::ZERO);
        let in_flight = ["INFY", "TCS", "HDFC", "ITC"]
            .into_iter()
            .map(|symbol| harness.admission.admit(symbol, dec!(10)).unwrap())
            .collect::<Vec<_>>();

        let dispatched = harness.engine.process_ticks(crossed_batch(Utc::now()));
        assert!(matches!(
            &dispatched[0],
            Dispatch::Held { reason: AdmissionDenied::NoSlot { capacity: 4 }, .. }
        ));

        drop(in_flight);
        harness.engine.shutdown().await;

        let held = harness.audit.opportunities();
        assert_eq!(held[0].state, OpportunityState::Held);
        assert!(held[0].flags.on_hold);
        assert!(harness.client.placed().is_empty());
    }

    #[tokio::test]
    async fn low_margin_holds_the_opportunity() {
        let mut harness = harness(dec!(100000), true, Decimal::ZERO);
        // Leaves 1000: five units fit at the BSE ask but not with the sell leg
        let _reserved = harness.admission.admit("INFY", dec!(99000)).unwrap();
        let mut batch = crossed_batch(Utc::now());
        batch.reverse();

        let dispatched = harness.engine.process_ticks(batch);
        assert!(matches!(
            &dispatched[0],
            Dispatch::Held { reason: AdmissionDenied::InsufficientMargin { .. }, .. }
        ));

        harness.engine.shutdown().await;
        assert!(harness.audit.opportunities()[0].flags.low_margin_hold);
    }

    #[tokio::test]
    async fn older_ticks_do_not_trigger_matching() {
        let mut harness = harness(dec!(100000), true, Decimal::ZERO);
        let now = Utc::now();

        assert_eq!(harness.engine.process_ticks(crossed_batch(now)).len(), 1);

        // Rejected by the cache, so nothing is re-evaluated
        let late = crossed_batch(now - ChronoDuration::seconds(1));
        assert!(harness.engine.process_ticks(late).is_empty());
        harness.engine.shutdown().await;
    }

    #[tokio::test]
    async fn final_order_updates_are_audited() {
        let harness = harness(dec!(100000), true, Decimal::ZERO);
        let update = OrderUpdate {
            order_id: "1".to_string(),
            trading_symbol: "SBIN".to_string(),
            exchange: "NSE".to_string(),
            status: OrderStatus::Complete,
            transaction_type: "SELL".to_string(),
            product: "MIS".to_string(),
            quantity: 10,
            filled_quantity: 10,
            average_price: Some(dec!(501)),
            status_message: None,
        };

        harness.engine.on_order_update(update);
        refresh_account(
            harness.client.clone(),
            Arc::clone(&harness.admission),
            Arc::clone(&harness.holdings),
        )
        .await;

        assert!(matches!(
            harness.audit.records().as_slice(),
            [AuditRecord::OrderUpdate { .. }]
        ));
        assert_eq!(harness.admission.available(), dec!(100000));
        harness.engine.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_ticks_are_left_out_of_arrival_stats() {
        let mut harness = harness(dec!(100000), false, Decimal::ZERO);
        let now = Utc::now();

        harness.engine.process_ticks(crossed_batch(now));
        harness
            .engine
            .process_ticks(crossed_batch(now + ChronoDuration::milliseconds(100)));
        harness
            .engine
            .process_ticks(crossed_batch(now - ChronoDuration::seconds(1)));

        let summaries = harness.engine.stats.summaries();
        assert_eq!(summaries.len(), 2);
        assert!(summaries
            .iter()
            .all(|summary| summary.count == 1 && summary.max_ms == 100.0));
        harness.engine.shutdown().await;
    }

    /// NSE bids 520 x 10, BSE asks 500 x 10: wide enough for delivery charges.
    fn delivery_batch(at: DateTime<Utc>) -> Vec<Tick> {
        vec![
            Tick::with_depth(
                NSE_TOKEN,
                vec![Level::new(dec!(520), 10, 1)],
                vec![Level::new(dec!(521), 10, 1)],
                at,
            ),
            Tick::with_depth(
                BSE_TOKEN,
                vec![Level::new(dec!(499), 10, 1)],
                vec![Level::new(dec!(500), 10, 1)],
                at,
            ),
        ]
    }

    #[tokio::test]
    async fn delivery_sells_shrink_the_holdings_cap() {
        let client = PaperOrderClient::new(dec!(100000))
            .with_holdings(vec![Holding {
                trading_symbol: "SBIN".to_string(),
                venue: "NSE".to_string(),
                quantity: 4,
            }])
            .with_rejection(Rejection::Side(Side::Buy));
        let mut harness = harness_with(delivery_pair(), client, dec!(100000), Decimal::ZERO, None);

        // Nothing is sellable until the broker has been read
        let now = Utc::now();
        assert!(harness.engine.process_ticks(delivery_batch(now)).is_empty());

        harness
            .holdings
            .refresh_from(harness.client.as_ref())
            .await
            .unwrap();
        assert_eq!(harness.holdings.sellable("SBIN"), 4);

        let dispatched = harness
            .engine
            .process_ticks(delivery_batch(now + ChronoDuration::seconds(1)));
        assert!(matches!(dispatched[0], Dispatch::Enqueued(_)));
        while harness.audit.opportunities().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(harness.audit.opportunities()[0].quantity, 4);

        // Only the sell leg filled, so the holdings are gone
        refresh_account(
            harness.client.clone(),
            Arc::clone(&harness.admission),
            Arc::clone(&harness.holdings),
        )
        .await;
        assert_eq!(harness.holdings.sellable("SBIN"), 0);
        assert!(harness
            .engine
            .process_ticks(delivery_batch(now + ChronoDuration::seconds(2)))
            .is_empty());

        harness.engine.shutdown().await;
    }

    #[tokio::test]
    async fn client_postbacks_reach_the_engine() {
        let (postback_tx, postback_rx) = mpsc::unbounded_channel();
        let client = PaperOrderClient::new(dec!(100000)).with_postbacks(postback_tx);
        let Harness {
            engine,
            client,
            audit,
            _event_tx: event_tx,
            ..
        } = harness_with(pair(true), client, dec!(100000), Decimal::ZERO, Some(postback_rx));
        let engine = tokio::spawn(engine.run());

        client
            .place_order(OrderRequest::limit_ioc(
                "NSE",
                "SBIN",
                Side::Sell,
                10,
                ProductType::Mis,
                dec!(501),
            ))
            .await
            .unwrap();
        while audit.records().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            audit.records().as_slice(),
            [AuditRecord::OrderUpdate { .. }]
        ));

        drop(event_tx);
        engine.await.unwrap();
    }

    #[test]
    fn builder_rejects_shared_instruments() {
        let (_event_tx, event_rx) = mpsc::unbounded_channel();
        let result = ArbEngine::builder()
            .pairs(vec![pair(true), pair(true)])
            .event_rx(event_rx)
            .build();

        assert!(matches!(result, Err(EngineError::DuplicateInstrument(NSE_TOKEN))));
    }
}
