use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::model::tick::Tick;

type TickMap = HashMap<u32, Arc<Tick>>;

/// Latest tick per instrument, shared by every connection and the engine.
///
/// Readers load an immutable snapshot without locking. Writers build the
/// next map from the current one and publish it in a single swap, so a batch
/// is seen either entirely or not at all.
#[derive(Debug, Default)]
pub struct TickCache {
    ticks: ArcSwap<TickMap>,
    writer: Mutex<()>,
}

impl TickCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch, keeping an existing entry when the incoming tick is
    /// older. Returns the cached tick for every token the batch updated.
    pub fn merge(&self, batch: Vec<Tick>) -> Vec<Arc<Tick>> {
        let _guard = self.writer.lock();

        let mut next = TickMap::clone(&self.ticks.load());
        let mut seen = HashSet::with_capacity(batch.len());
        let mut updated = Vec::with_capacity(batch.len());

        for tick in batch {
            let token = tick.instrument_token;
            if let Some(current) = next.get(&token) {
                if current.received_time > tick.received_time {
                    continue;
                }
            }

            next.insert(token, Arc::new(tick));
            if seen.insert(token) {
                updated.push(token);
            }
        }

        let updated = updated
            .into_iter()
            .filter_map(|token| next.get(&token).cloned())
            .collect();

        self.ticks.store(Arc::new(next));
        updated
    }

    pub fn latest(&self, instrument_token: u32) -> Option<Arc<Tick>> {
        self.ticks.load().get(&instrument_token).cloned()
    }

    pub fn snapshot(&self) -> Arc<TickMap> {
        self.ticks.load_full()
    }

    pub fn len(&self) -> usize {
        self.ticks.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once a newer tick for the same instrument has been cached.
    pub fn is_stale(&self, tick: &Tick) -> bool {
        self.is_superseded(tick.instrument_token, tick.received_time)
    }

    pub fn is_superseded(&self, instrument_token: u32, received_time: DateTime<Utc>) -> bool {
        self.ticks
            .load()
            .get(&instrument_token)
            .is_some_and(|current| current.received_time > received_time)
    }
}
