use core::cmp::Ordering;
use core::time::Duration;
use parking_lot::Mutex;

use crate::{IdGenStatus, SnowflakeId, TimeSource};

/// How long a blocked allocation sleeps before reading the clock again.
const BACKOFF: Duration = Duration::from_millis(1);

/// Where the sequence restarts when the millisecond advances.
///
/// Uniqueness does not depend on this choice; it only affects which low bits
/// the first id of each millisecond carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SequenceReset {
    /// Always restart at 0.
    #[default]
    Zero,
    /// Restart at `now & 1`, alternating odd and even first sequences from
    /// one millisecond to the next.
    AlternateParity,
}

impl SequenceReset {
    const fn first_sequence(self, now: u64) -> u64 {
        match self {
            Self::Zero => 0,
            Self::AlternateParity => now & 1,
        }
    }
}

/// The mutable part of an allocator. Everything in here is only touched with
/// the allocator lock held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AllocatorState {
    pub(crate) partition: u64,
    pub(crate) last_timestamp: u64,
    pub(crate) sequence: u64,
}

impl AllocatorState {
    pub(crate) const fn new(partition: u64) -> Self {
        Self {
            partition,
            last_timestamp: 0,
            sequence: 0,
        }
    }

    /// Attempts to mint one id for the clock reading `now`.
    pub(crate) fn poll(&mut self, now: u64, reset: SequenceReset) -> IdGenStatus {
        match now.cmp(&self.last_timestamp) {
            Ordering::Equal => {
                if self.sequence < SnowflakeId::max_sequence() {
                    self.sequence += 1;
                    IdGenStatus::Ready { id: self.current() }
                } else {
                    IdGenStatus::Pending {
                        yield_until: self.last_timestamp + 1,
                    }
                }
            }
            Ordering::Greater => {
                self.last_timestamp = now;
                self.sequence = reset.first_sequence(now);
                IdGenStatus::Ready { id: self.current() }
            }
            Ordering::Less => Self::cold_clock_behind(self.last_timestamp),
        }
    }

    #[cold]
    #[inline(never)]
    fn cold_clock_behind(last_timestamp: u64) -> IdGenStatus {
        IdGenStatus::Pending {
            yield_until: last_timestamp,
        }
    }

    const fn current(&self) -> SnowflakeId {
        SnowflakeId::from_components(self.partition, self.last_timestamp, self.sequence)
    }
}

/// A lock-based Snowflake allocator shared by every caller in the process.
///
/// All allocations are serialized through one [`parking_lot::Mutex`] guarding
/// the partition, the last timestamp used and the sequence. The lock is held
/// for the whole of a batch, so the ids of one [`allocate`](Self::allocate)
/// call are contiguous in generation order.
///
/// Allocation never fails. It blocks only when:
/// - 4096 ids have already been handed out in the current millisecond, or
/// - the clock reads earlier than the last timestamp used.
///
/// In both cases it sleeps in short steps until the clock has moved past the
/// blocking point, so an id is never reissued and ids from one allocator stay
/// ordered by `(timestamp, sequence)`.
///
/// # Example
///
/// ```
/// use micsrv_id::{IdAllocator, SnowflakeId, WallClock};
///
/// let allocator = IdAllocator::new(3, WallClock::default());
/// let ids = allocator.allocate(3, 2);
///
/// let first = SnowflakeId::from_raw(ids[0]);
/// let second = SnowflakeId::from_raw(ids[1]);
/// assert!(first.ordering_key() < second.ordering_key());
/// ```
pub struct IdAllocator<T>
where
    T: TimeSource,
{
    state: Mutex<AllocatorState>,
    time: T,
    reset: SequenceReset,
}

impl<T> IdAllocator<T>
where
    T: TimeSource,
{
    /// Creates an allocator for `partition_hint`, normalized into the valid
    /// partition range.
    pub fn new(partition_hint: i64, time: T) -> Self {
        let partition = SnowflakeId::normalize_partition(partition_hint);
        Self {
            state: Mutex::new(AllocatorState::new(partition)),
            time,
            reset: SequenceReset::default(),
        }
    }

    /// Selects where the sequence restarts on a new millisecond.
    #[must_use]
    pub fn with_sequence_reset(mut self, reset: SequenceReset) -> Self {
        self.reset = reset;
        self
    }

    /// The partition the next id will carry.
    pub fn partition(&self) -> u64 {
        self.state.lock().partition
    }

    /// Re-points the allocator at another partition. The timestamp and
    /// sequence state carry over, so ordering holds across the switch.
    pub fn set_partition(&self, partition_hint: i64) {
        self.state.lock().partition = SnowflakeId::normalize_partition(partition_hint);
    }

    /// Mints one id for the current partition.
    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        self.mint(&mut state).to_raw()
    }

    /// Switches to `partition_hint` and mints `count` ids in one critical
    /// section.
    ///
    /// Returns an empty vector when `count` is zero.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn allocate(&self, partition_hint: i64, count: usize) -> Vec<u64> {
        let mut state = self.state.lock();
        state.partition = SnowflakeId::normalize_partition(partition_hint);

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.mint(&mut state).to_raw());
        }
        ids
    }

    fn mint(&self, state: &mut AllocatorState) -> SnowflakeId {
        let mut stalled_for = None;
        loop {
            let now = self.time.current_millis();
            match state.poll(now, self.reset) {
                IdGenStatus::Ready { id } => {
                    if let Some(waited) = stalled_for {
                        tracing::trace!(gap_ms = waited, "allocator resumed");
                    }
                    return id;
                }
                IdGenStatus::Pending { yield_until } => {
                    if now < state.last_timestamp && stalled_for.is_none() {
                        tracing::warn!(
                            now,
                            last_timestamp = state.last_timestamp,
                            "clock moved backwards, waiting for it to catch up"
                        );
                    }
                    stalled_for.get_or_insert(yield_until.saturating_sub(now));
                    std::thread::sleep(BACKOFF);
                }
            }
        }
    }
}
