use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info};

use crate::{
    client::OrderClient,
    counters::{from_minor, to_minor, CounterStore},
    error::{AdmissionDenied, OrderError},
};

pub const DEFAULT_ADMISSION_CAPACITY: u32 = 4;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/*----- */
// Admission controller
/*----- */
/// Gates opportunities on symbol cooldown, a bounded number of in-flight
/// pairs, and the shared margin balance, in that order.
#[derive(Debug)]
pub struct AdmissionController {
    counters: Arc<dyn CounterStore>,
    cooldown: Duration,
    cooldowns: Mutex<HashMap<String, Instant>>,
    resync_pending: AtomicBool,
}

impl AdmissionController {
    pub fn new(counters: Arc<dyn CounterStore>, cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            counters,
            cooldown,
            cooldowns: Mutex::new(HashMap::new()),
            resync_pending: AtomicBool::new(false),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.counters.capacity()
    }

    pub fn available(&self) -> Decimal {
        from_minor(self.counters.available_minor())
    }

    pub fn slots_in_use(&self) -> u32 {
        self.counters.slots_used()
    }

    pub fn admit(
        self: &Arc<Self>,
        symbol: &str,
        required_margin: Decimal,
    ) -> Result<AdmissionPermit, AdmissionDenied> {
        if let Some(remaining) = self.cooldown_remaining(symbol) {
            return Err(AdmissionDenied::CoolingDown {
                symbol: symbol.to_string(),
                remaining,
            });
        }

        if !self.counters.try_acquire_slot() {
            return Err(AdmissionDenied::NoSlot {
                capacity: self.counters.capacity(),
            });
        }

        let required = to_minor(required_margin);
        if let Err(available) = self.counters.try_reserve_minor(required) {
            self.counters.release_slot();
            return Err(AdmissionDenied::InsufficientMargin {
                required: from_minor(required),
                available: from_minor(available),
            });
        }

        debug!(
            symbol,
            reserved = %from_minor(required),
            available = %self.available(),
            slots_in_use = self.slots_in_use(),
            message = "Admitted opportunity"
        );

        Ok(AdmissionPermit {
            controller: Arc::clone(self),
            symbol: symbol.to_string(),
            reserved_minor: required,
            returned_minor: 0,
            committed: false,
        })
    }

    pub fn cooldown_remaining(&self, symbol: &str) -> Option<Duration> {
        let mut cooldowns = self.cooldowns.lock();
        let now = Instant::now();

        match cooldowns.get(symbol) {
            Some(until) if *until > now => Some(*until - now),
            Some(_) => {
                cooldowns.remove(symbol);
                None
            }
            None => None,
        }
    }

    pub fn start_cooldown(&self, symbol: &str) {
        self.cooldowns
            .lock()
            .insert(symbol.to_string(), Instant::now() + self.cooldown);
    }

    /// Re-base the balance from the broker. Every slot is held for the
    /// store, so no admission reserves against a balance that is about to be
    /// replaced. Deferred while pairs are in flight since their reservations
    /// are not yet reflected upstream.
    pub fn resync(&self, available: Decimal) -> bool {
        self.resync_pending.store(true, Ordering::Release);

        if !self.counters.try_claim_all_slots() {
            debug!(
                slots_in_use = self.slots_in_use(),
                message = "Deferring margin resync while orders are in flight"
            );
            return false;
        }

        self.resync_pending.store(false, Ordering::Release);
        self.counters.set_available_minor(to_minor(available));
        self.counters.release_all_slots();

        info!(available = %available, message = "Margin resynced from broker");
        true
    }

    /// Fetch the broker's balance and re-base. The request stays pending
    /// when the fetch fails or pairs are in flight.
    pub async fn resync_from(&self, client: &dyn OrderClient) -> Result<bool, OrderError> {
        self.resync_pending.store(true, Ordering::Release);
        let margins = client.margins().await?;
        Ok(self.resync(margins.available))
    }

    /// Clears and returns whether a resync was deferred.
    pub fn take_resync_pending(&self) -> bool {
        self.resync_pending.swap(false, Ordering::AcqRel)
    }
}

/*----- */
// Admission permit
/*----- */
/// Holds one slot and one margin reservation. Dropping the permit frees the
/// slot and returns whatever margin was not committed to orders.
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    symbol: String,
    reserved_minor: i64,
    returned_minor: i64,
    committed: bool,
}

impl AdmissionPermit {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn reserved(&self) -> Decimal {
        from_minor(self.reserved_minor)
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Margin is now backing live orders and stays spent on drop.
    pub fn commit(&mut self) {
        self.committed = true;
    }

    /// Return the share of the reservation tied to a leg that never reached
    /// the venue. Returns the amount actually released.
    pub fn refund(&mut self, amount: Decimal) -> Decimal {
        let amount = to_minor(amount).min(self.reserved_minor - self.returned_minor);
        if amount <= 0 {
            return Decimal::ZERO;
        }

        self.controller.counters.release_minor(amount);
        self.returned_minor += amount;
        from_minor(amount)
    }

    pub fn start_cooldown(&self) {
        self.controller.start_cooldown(&self.symbol);
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.committed {
            let outstanding = self.reserved_minor - self.returned_minor;
            if outstanding > 0 {
                self.controller.counters.release_minor(outstanding);
            }
        }
        self.controller.counters.release_slot();
    }
}
