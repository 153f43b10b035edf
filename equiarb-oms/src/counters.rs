use memmap2::MmapMut;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use std::{
    fmt::Debug,
    fs::OpenOptions,
    mem::size_of,
    path::{Path, PathBuf},
    sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering},
};
use tracing::info;

use crate::error::SharedCounterError;

/// Margin is counted in minor currency units (two decimal places).
pub const MINOR_UNIT_SCALE: u32 = 2;

/// Round up so that a reservation never under-counts.
pub fn to_minor(amount: Decimal) -> i64 {
    (amount * Decimal::ONE_HUNDRED)
        .ceil()
        .to_i64()
        .unwrap_or(i64::MAX)
}

pub fn from_minor(amount: i64) -> Decimal {
    Decimal::new(amount, MINOR_UNIT_SCALE)
}

/*----- */
// Counter store
/*----- */
/// Storage for the margin balance and the in-flight slot count. Every
/// mutation is a single atomic operation so stores may live in memory
/// shared between processes.
pub trait CounterStore: Debug + Send + Sync {
    fn margin(&self) -> &AtomicI64;

    fn slots_in_use(&self) -> &AtomicU32;

    fn capacity(&self) -> u32;

    fn available_minor(&self) -> i64 {
        self.margin().load(Ordering::Acquire)
    }

    /// Compare-and-subtract. On failure nothing changes and the balance seen
    /// at the time is returned.
    fn try_reserve_minor(&self, amount: i64) -> Result<(), i64> {
        self.margin()
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                (available >= amount).then_some(available - amount)
            })
            .map(|_| ())
    }

    fn release_minor(&self, amount: i64) {
        self.margin().fetch_add(amount, Ordering::AcqRel);
    }

    fn set_available_minor(&self, amount: i64) {
        self.margin().store(amount.max(0), Ordering::Release);
    }

    fn try_acquire_slot(&self) -> bool {
        let capacity = self.capacity();
        self.slots_in_use()
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < capacity).then_some(used + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .slots_in_use()
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_sub(1)
            });
    }

    fn slots_used(&self) -> u32 {
        self.slots_in_use().load(Ordering::Acquire)
    }

    /// Take every slot at once, only when none is in use. While held, no
    /// admission can reserve margin.
    fn try_claim_all_slots(&self) -> bool {
        let capacity = self.capacity();
        self.slots_in_use()
            .compare_exchange(0, capacity, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_all_slots(&self) {
        self.slots_in_use().store(0, Ordering::Release);
    }
}

/*----- */
// In-process counters
/*----- */
#[derive(Debug)]
pub struct LocalCounters {
    margin: AtomicI64,
    slots_in_use: AtomicU32,
    capacity: u32,
}

impl LocalCounters {
    pub fn new(capacity: u32, available: Decimal) -> Self {
        Self {
            margin: AtomicI64::new(to_minor(available).max(0)),
            slots_in_use: AtomicU32::new(0),
            capacity,
        }
    }
}

impl CounterStore for LocalCounters {
    fn margin(&self) -> &AtomicI64 {
        &self.margin
    }

    fn slots_in_use(&self) -> &AtomicU32 {
        &self.slots_in_use
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }
}

/*----- */
// Shared-memory counters
/*----- */
const SHARED_MAGIC: u64 = 0x4551_4152_4243_0001;

#[repr(C)]
struct SharedRegion {
    magic: AtomicU64,
    capacity: AtomicU32,
    slots_in_use: AtomicU32,
    margin: AtomicI64,
}

/// Counters in a memory-mapped file so that workers in separate processes
/// draw on one margin balance and one slot pool. The coordinator creates the
/// file; workers open it.
#[derive(Debug)]
pub struct SharedCounters {
    path: PathBuf,
    mmap: MmapMut,
}

impl SharedCounters {
    pub fn create(
        path: impl AsRef<Path>,
        capacity: u32,
        available: Decimal,
    ) -> Result<Self, SharedCounterError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size_of::<SharedRegion>() as u64)?;

        // SAFETY: the file was just sized for the region and is only ever
        // mutated through atomics in SharedRegion.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let counters = Self { path, mmap };

        let region = counters.region();
        region.capacity.store(capacity, Ordering::Release);
        region.slots_in_use.store(0, Ordering::Release);
        region
            .margin
            .store(to_minor(available).max(0), Ordering::Release);
        region.magic.store(SHARED_MAGIC, Ordering::Release);

        info!(
            path = %counters.path.display(),
            capacity,
            available = %available,
            message = "Created shared admission counters"
        );

        Ok(counters)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, SharedCounterError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let len = file.metadata()?.len();
        let expected = size_of::<SharedRegion>() as u64;
        if len < expected {
            return Err(SharedCounterError::TooSmall { len, expected });
        }

        // SAFETY: length checked above; the region is only accessed through
        // atomics.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let counters = Self { path, mmap };

        let found = counters.region().magic.load(Ordering::Acquire);
        if found != SHARED_MAGIC {
            return Err(SharedCounterError::BadMagic { found });
        }

        Ok(counters)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn region(&self) -> &SharedRegion {
        // SAFETY: the mapping is page aligned, at least size_of::<SharedRegion>()
        // bytes long, lives as long as self, and SharedRegion is repr(C) made
        // only of atomics so concurrent access from other mappings is sound.
        unsafe { &*(self.mmap.as_ptr() as *const SharedRegion) }
    }
}

impl CounterStore for SharedCounters {
    fn margin(&self) -> &AtomicI64 {
        &self.region().margin
    }

    fn slots_in_use(&self) -> &AtomicU32 {
        &self.region().slots_in_use
    }

    fn capacity(&self) -> u32 {
        self.region().capacity.load(Ordering::Acquire)
    }
}
