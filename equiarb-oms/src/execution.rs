use chrono::{DateTime, Utc};
use equiarb_data::TickCache;
use equiarb_strategy::{LegOutcome, Opportunity, OpportunityState, Side};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    admission::{AdmissionController, AdmissionPermit},
    audit::AuditSink,
    client::{OrderClient, OrderId, OrderRequest},
    error::{ExecutionError, OrderError},
};

/// An admitted opportunity together with the resources it holds.
#[derive(Debug)]
pub struct QueuedOpportunity {
    pub opportunity: Opportunity,
    pub permit: AdmissionPermit,
}

/// Handed back when the queue cannot take an opportunity.
#[derive(Debug)]
pub struct EnqueueRejected {
    pub error: ExecutionError,
    pub queued: Box<QueuedOpportunity>,
}

/// Collaborators shared by every worker.
pub struct ExecutionContext {
    pub admission: Arc<AdmissionController>,
    pub cache: Arc<TickCache>,
    pub client: Arc<dyn OrderClient>,
    pub audit: Arc<dyn AuditSink>,
}

/*----- */
// Execution pipeline
/*----- */
/// Bounded queue drained by a fixed pool of workers. Each worker re-checks
/// staleness, then places both legs concurrently.
pub struct ExecutionPipeline {
    queue_tx: mpsc::Sender<QueuedOpportunity>,
    workers: Vec<JoinHandle<()>>,
}

impl ExecutionPipeline {
    pub fn spawn(capacity: usize, workers: usize, context: ExecutionContext) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let context = Arc::new(context);

        let workers = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&queue_rx),
                    Arc::clone(&context),
                ))
            })
            .collect();

        Self { queue_tx, workers }
    }

    pub fn try_enqueue(&self, mut queued: QueuedOpportunity) -> Result<(), EnqueueRejected> {
        queued.opportunity.mark_queued(Utc::now());

        self.queue_tx.try_send(queued).map_err(|error| {
            let (error, mut queued) = match error {
                mpsc::error::TrySendError::Full(queued) => (ExecutionError::QueueFull, queued),
                mpsc::error::TrySendError::Closed(queued) => (ExecutionError::QueueClosed, queued),
            };
            queued.opportunity.state = OpportunityState::Detected;
            queued.opportunity.queued_at = None;

            EnqueueRejected {
                error,
                queued: Box::new(queued),
            }
        })
    }

    /// Close the queue and wait for in-flight work to drain.
    pub async fn shutdown(self) {
        drop(self.queue_tx);
        for worker in self.workers {
            if let Err(error) = worker.await {
                error!(error = %error, message = "Execution worker ended abnormally");
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    queue_rx: Arc<Mutex<mpsc::Receiver<QueuedOpportunity>>>,
    context: Arc<ExecutionContext>,
) {
    loop {
        let next = queue_rx.lock().await.recv().await;
        let Some(queued) = next else {
            break;
        };

        // Run each opportunity in its own task so a panic is contained here
        // and the permit is released while unwinding
        let snapshot = queued.opportunity.clone();
        let task = tokio::spawn(execute(Arc::clone(&context), queued));

        let opportunity = match task.await {
            Ok(opportunity) => opportunity,
            Err(join_error) => {
                let mut opportunity = snapshot;
                let fault = ExecutionError::InternalFault(join_error.to_string());
                error!(
                    worker,
                    id = %opportunity.id,
                    symbol = %opportunity.trading_symbol,
                    error = %fault,
                    action = "Continuing with next opportunity",
                    message = "Execution task failed"
                );
                opportunity.mark_fault(Utc::now(), fault.to_string());
                opportunity
            }
        };

        // The permit is gone, so a margin resync deferred on it can run now
        if context.admission.take_resync_pending() {
            if let Err(error) = context.admission.resync_from(context.client.as_ref()).await {
                warn!(worker, error = %error, message = "Failed to fetch margins for resync");
            }
        }

        context.audit.record_opportunity(&opportunity);
    }

    info!(worker, message = "Execution worker stopped");
}

/// Drive one admitted opportunity from dequeue to finalization.
pub async fn execute(context: Arc<ExecutionContext>, queued: QueuedOpportunity) -> Opportunity {
    let QueuedOpportunity {
        mut opportunity,
        mut permit,
    } = queued;
    opportunity.mark_dequeued(Utc::now());

    if let Err(fault) = validate(&opportunity) {
        warn!(
            id = %opportunity.id,
            symbol = %opportunity.trading_symbol,
            error = %fault,
            message = "Discarding malformed opportunity"
        );
        opportunity.mark_fault(Utc::now(), fault.to_string());
        return opportunity;
    }

    if is_stale(&context.cache, &opportunity) {
        opportunity.mark_stale(Utc::now());
        opportunity.note = Some(ExecutionError::StaleOpportunity.to_string());
        info!(
            id = %opportunity.id,
            symbol = %opportunity.trading_symbol,
            message = "Opportunity went stale while queued, released"
        );
        return opportunity;
    }

    /*---------- Ordering ---------- */
    permit.commit();
    opportunity.state = OpportunityState::Ordering;

    let buy = tokio::spawn(place_leg(
        Arc::clone(&context.client),
        leg_request(&opportunity, Side::Buy),
    ));
    let sell = tokio::spawn(place_leg(
        Arc::clone(&context.client),
        leg_request(&opportunity, Side::Sell),
    ));
    let (buy, sell) = tokio::join!(buy, sell);

    let mut placed_any = false;
    for (side, report) in [(Side::Buy, buy), (Side::Sell, sell)] {
        let leg = opportunity.leg_mut(side);
        match report {
            Ok(report) => {
                leg.task_received_at = Some(report.task_received_at);
                leg.ordered_at = Some(report.ordered_at);
                leg.outcome = match report.result {
                    Ok(order_id) => {
                        placed_any = true;
                        LegOutcome::Ordered { order_id }
                    }
                    Err(source) => LegOutcome::Failed {
                        reason: ExecutionError::OrderRejected { side, source }.to_string(),
                    },
                };
            }
            Err(join_error) => {
                leg.outcome = LegOutcome::Failed {
                    reason: ExecutionError::InternalFault(join_error.to_string()).to_string(),
                };
            }
        }

        if leg.is_failed() {
            let refunded = permit.refund(opportunity.leg_margin(side));
            warn!(
                id = %opportunity.id,
                symbol = %opportunity.trading_symbol,
                side = ?side,
                outcome = ?opportunity.leg(side).outcome,
                refunded = %refunded,
                message = "Order leg failed"
            );
        }
    }

    if placed_any {
        permit.start_cooldown();
    }
    opportunity.finalize(Utc::now());

    info!(
        id = %opportunity.id,
        symbol = %opportunity.trading_symbol,
        quantity = opportunity.quantity,
        buy_order = ?opportunity.buy.order_id(),
        sell_order = ?opportunity.sell.order_id(),
        needs_reconciliation = opportunity.flags.needs_reconciliation,
        message = "Opportunity finalized"
    );

    opportunity
}

fn validate(opportunity: &Opportunity) -> Result<(), ExecutionError> {
    if opportunity.quantity == 0 {
        return Err(ExecutionError::InternalFault("zero quantity".to_string()));
    }
    if opportunity.buy.venue.is_empty() || opportunity.sell.venue.is_empty() {
        return Err(ExecutionError::InternalFault("leg venue missing".to_string()));
    }
    Ok(())
}

/// Either source tick has been superseded in the cache.
pub fn is_stale(cache: &TickCache, opportunity: &Opportunity) -> bool {
    [&opportunity.buy, &opportunity.sell]
        .into_iter()
        .any(|leg| cache.is_superseded(leg.instrument_token, leg.tick_received_time))
}

fn leg_request(opportunity: &Opportunity, side: Side) -> OrderRequest {
    let leg = opportunity.leg(side);
    OrderRequest::limit_ioc(
        leg.venue.clone(),
        opportunity.trading_symbol.clone(),
        side,
        leg.quantity,
        opportunity.product,
        leg.price,
    )
}

struct LegReport {
    task_received_at: DateTime<Utc>,
    ordered_at: DateTime<Utc>,
    result: Result<OrderId, OrderError>,
}

async fn place_leg(client: Arc<dyn OrderClient>, request: OrderRequest) -> LegReport {
    let task_received_at = Utc::now();
    let result = client.place_order(request).await;

    LegReport {
        task_received_at,
        ordered_at: Utc::now(),
        result,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        admission::AdmissionController,
        audit::InMemoryAuditLog,
        client::{PaperOrderClient, Rejection},
        counters::LocalCounters,
    };
    use equiarb_data::Tick;
    use equiarb_strategy::{InstrumentPair, Listing, Match, ProductType};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const NSE_TOKEN: u32 = 779521;
    const BSE_TOKEN: u32 = 128028676;

    fn opportunity(at: DateTime<Utc>) -> Opportunity {
        let pair = InstrumentPair::builder()
            .trading_symbol("SBIN")
            .first(Listing::new(NSE_TOKEN, "NSE"))
            .second(Listing::new(BSE_TOKEN, "BSE"))
            .product(ProductType::Mis)
            .leverage(dec!(5))
            .reference_value(dec!(50000))
            .build()
            .unwrap();

        let found = Match {
            buy_token: BSE_TOKEN,
            sell_token: NSE_TOKEN,
            buy_price: dec!(500),
            sell_price: dec!(501),
            quantity: 10,
            spread_coef: dec!(0.002),
            threshold: dec!(0.0011),
        };

        Opportunity::new(&pair, found, at, at, at)
    }

    struct Harness {
        controller: Arc<AdmissionController>,
        client: Arc<PaperOrderClient>,
        cache: Arc<TickCache>,
        audit: Arc<InMemoryAuditLog>,
    }

    impl Harness {
        fn new(client: PaperOrderClient) -> Self {
            Self {
                controller: AdmissionController::new(
                    Arc::new(LocalCounters::new(4, dec!(10000))),
                    Duration::from_secs(30),
                ),
                client: Arc::new(client),
                cache: Arc::new(TickCache::new()),
                audit: Arc::new(InMemoryAuditLog::new()),
            }
        }

        fn context(&self) -> ExecutionContext {
            ExecutionContext {
                admission: Arc::clone(&self.controller),
                cache: Arc::clone(&self.cache),
                client: self.client.clone(),
                audit: self.audit.clone(),
            }
        }

        fn queued(&self, opportunity: Opportunity) -> QueuedOpportunity {
            let permit = self
                .controller
                .admit(&opportunity.trading_symbol, opportunity.required_margin)
                .unwrap();
            QueuedOpportunity {
                opportunity,
                permit,
            }
        }
    }

    #[tokio::test]
    async fn both_legs_are_placed_and_margin_stays_committed() {
        let harness = Harness::new(PaperOrderClient::new(dec!(10000)));
        let queued = harness.queued(opportunity(Utc::now()));

        let result = execute(Arc::new(harness.context()), queued).await;

        assert_eq!(result.state, OpportunityState::Finalized);
        assert!(result.buy.order_id().is_some());
        assert!(result.sell.order_id().is_some());
        assert!(result.buy.task_received_at.is_some());
        assert!(result.sell.ordered_at.is_some());
        assert!(!result.flags.needs_reconciliation);

        let placed = harness.client.placed();
        assert_eq!(placed.len(), 2);
        assert!(placed.iter().all(|order| order.quantity == 10));

        assert_eq!(harness.controller.available(), dec!(7998));
        assert_eq!(harness.controller.slots_in_use(), 0);
        assert!(harness.controller.cooldown_remaining("SBIN").is_some());
    }

    #[tokio::test]
    async fn failed_leg_refunds_its_share_and_flags_reconciliation() {
        let harness = Harness::new(
            PaperOrderClient::new(dec!(10000)).with_rejection(Rejection::Side(Side::Sell)),
        );
        let queued = harness.queued(opportunity(Utc::now()));

        let result = execute(Arc::new(harness.context()), queued).await;

        assert!(result.buy.order_id().is_some());
        assert!(result.sell.is_failed());
        assert!(result.flags.needs_reconciliation);
        assert_eq!(harness.controller.available(), dec!(9000));
    }

    #[tokio::test]
    async fn superseded_opportunity_is_discarded_at_dequeue() {
        let harness = Harness::new(PaperOrderClient::new(dec!(10000)));
        let detected_at = Utc::now();
        let queued = harness.queued(opportunity(detected_at));

        // Newer data for the buy instrument arrives while queued
        harness.cache.merge(vec![Tick::ltp(
            BSE_TOKEN,
            dec!(500.05),
            detected_at + chrono::Duration::milliseconds(1),
        )]);

        let result = execute(Arc::new(harness.context()), queued).await;

        assert_eq!(result.state, OpportunityState::DiscardedStale);
        assert!(result.flags.stale);
        assert!(harness.client.placed().is_empty());
        assert_eq!(harness.controller.available(), dec!(10000));
        assert_eq!(harness.controller.slots_in_use(), 0);
        assert!(harness.controller.cooldown_remaining("SBIN").is_none());
    }

    #[tokio::test]
    async fn malformed_opportunity_is_a_fault_and_releases() {
        let harness = Harness::new(PaperOrderClient::new(dec!(10000)));
        let mut opportunity = opportunity(Utc::now());
        opportunity.sell.venue.clear();
        let queued = harness.queued(opportunity);

        let result = execute(Arc::new(harness.context()), queued).await;

        assert!(result.flags.internal_fault);
        assert!(harness.client.placed().is_empty());
        assert_eq!(harness.controller.available(), dec!(10000));
    }

    #[tokio::test]
    async fn pipeline_drains_and_persists_on_shutdown() {
        let harness = Harness::new(PaperOrderClient::new(dec!(10000)));
        let pipeline = ExecutionPipeline::spawn(4, 2, harness.context());

        pipeline
            .try_enqueue(harness.queued(opportunity(Utc::now())))
            .unwrap();
        pipeline.shutdown().await;

        let persisted = harness.audit.opportunities();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].state, OpportunityState::Finalized);
        assert!(persisted[0].queued_at.is_some());
        assert!(persisted[0].dequeued_at.is_some());
    }

    #[tokio::test]
    async fn paper_settlement_keeps_the_budget_available() {
        let (postback_tx, mut postback_rx) = mpsc::unbounded_channel();
        let harness = Harness::new(PaperOrderClient::new(dec!(10000)).with_postbacks(postback_tx));
        let pipeline = ExecutionPipeline::spawn(4, 1, harness.context());

        // Ten pairs at 2002 each commit twice the budget
        for round in 0..10 {
            let mut opportunity = opportunity(Utc::now());
            opportunity.trading_symbol = format!("SBIN{round}");
            pipeline.try_enqueue(harness.queued(opportunity)).unwrap();

            for _ in 0..2 {
                let update = postback_rx.recv().await.unwrap();
                assert!(update.status.is_final());
                harness
                    .controller
                    .resync_from(harness.client.as_ref())
                    .await
                    .unwrap();
            }
            while harness.audit.opportunities().len() <= round {
                tokio::task::yield_now().await;
            }

            assert_eq!(harness.controller.available(), dec!(10000), "round {round} failed");
            assert_eq!(harness.controller.slots_in_use(), 0, "round {round} failed");
        }

        pipeline.shutdown().await;
        assert_eq!(harness.client.placed().len(), 20);
        assert!(harness
            .audit
            .opportunities()
            .iter()
            .all(|opportunity| opportunity.state == OpportunityState::Finalized));
    }
}
