use crate::allocator::AllocatorState;
use crate::{IdAllocator, IdGenStatus, SequenceReset, SnowflakeId, TimeSource, WallClock};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::scope;

struct MockTime {
    millis: u64,
}

impl TimeSource for MockTime {
    fn current_millis(&self) -> u64 {
        self.millis
    }
}

/// Replays a scripted list of clock readings, one per call, then keeps
/// returning the last one.
#[derive(Clone)]
struct StepTime {
    values: Arc<Mutex<VecDeque<u64>>>,
}

impl StepTime {
    fn new(values: impl IntoIterator<Item = u64>) -> Self {
        Self {
            values: Arc::new(Mutex::new(values.into_iter().collect())),
        }
    }

    fn remaining(&self) -> usize {
        self.values.lock().unwrap().len()
    }
}

impl TimeSource for StepTime {
    fn current_millis(&self) -> u64 {
        let mut values = self.values.lock().unwrap();
        if values.len() > 1 {
            values.pop_front().unwrap()
        } else {
            *values.front().expect("step clock needs at least one value")
        }
    }
}

trait IdGenStatusExt {
    fn unwrap_ready(self) -> SnowflakeId;
    fn unwrap_pending(self) -> u64;
}

impl IdGenStatusExt for IdGenStatus {
    fn unwrap_ready(self) -> SnowflakeId {
        match self {
            Self::Ready { id } => id,
            Self::Pending { yield_until } => {
                panic!("unexpected pending (yield until: {yield_until})")
            }
        }
    }

    fn unwrap_pending(self) -> u64 {
        match self {
            Self::Ready { id } => panic!("unexpected ready ({id:?})"),
            Self::Pending { yield_until } => yield_until,
        }
    }
}

fn assert_strictly_ordered(ids: &[u64]) {
    for pair in ids.windows(2) {
        let a = SnowflakeId::from_raw(pair[0]);
        let b = SnowflakeId::from_raw(pair[1]);
        assert!(
            a.ordering_key() < b.ordering_key(),
            "out of order: {a:?} then {b:?}"
        );
    }
}

#[test]
fn layout_packs_and_unpacks_fields() {
    let id = SnowflakeId::from_components(1023, SnowflakeId::TIMESTAMP_MASK, 4095);
    assert_eq!(id.partition(), 1023);
    assert_eq!(id.timestamp(), SnowflakeId::TIMESTAMP_MASK);
    assert_eq!(id.sequence(), 4095);
    // reserved bit stays clear so ids survive a round trip through i64
    assert!(id.to_raw() <= i64::MAX as u64);

    let id = SnowflakeId::from_components(5, 1_000, 7);
    assert_eq!(id.to_raw(), (5 << 53) | (1_000 << 12) | 7);
    assert_eq!(SnowflakeId::from_raw(id.to_raw()), id);
}

#[test]
fn partition_hints_wrap_into_range() {
    assert_eq!(SnowflakeId::normalize_partition(0), 0);
    assert_eq!(SnowflakeId::normalize_partition(1023), 1023);
    assert_eq!(SnowflakeId::normalize_partition(1024), 0);
    assert_eq!(SnowflakeId::normalize_partition(1030), 6);
    assert_eq!(SnowflakeId::normalize_partition(-1), 1023);

    let allocator = IdAllocator::new(-1, MockTime { millis: 42 });
    assert_eq!(allocator.partition(), 1023);

    let ids = allocator.allocate(2048 + 5, 1);
    assert_eq!(SnowflakeId::from_raw(ids[0]).partition(), 5);
    assert_eq!(allocator.partition(), 5);
}

#[test]
fn sequence_increments_within_same_tick() {
    let mut state = AllocatorState::new(1);
    let id1 = state.poll(42, SequenceReset::Zero).unwrap_ready();
    let id2 = state.poll(42, SequenceReset::Zero).unwrap_ready();
    let id3 = state.poll(42, SequenceReset::Zero).unwrap_ready();

    assert_eq!(id1.timestamp(), 42);
    assert_eq!(id2.timestamp(), 42);
    assert_eq!(id3.timestamp(), 42);
    assert_eq!(id1.sequence(), 0);
    assert_eq!(id2.sequence(), 1);
    assert_eq!(id3.sequence(), 2);
    assert!(id1 < id2 && id2 < id3);
}

#[test]
fn pending_when_sequence_exhausted() {
    let mut state = AllocatorState {
        partition: 0,
        last_timestamp: 42,
        sequence: SnowflakeId::max_sequence(),
    };
    let yield_until = state.poll(42, SequenceReset::Zero).unwrap_pending();
    assert_eq!(yield_until, 43);
    assert_eq!(state.sequence, SnowflakeId::max_sequence());

    let id = state.poll(43, SequenceReset::Zero).unwrap_ready();
    assert_eq!(id.timestamp(), 43);
    assert_eq!(id.sequence(), 0);
}

#[test]
fn pending_when_clock_behind() {
    let mut state = AllocatorState {
        partition: 0,
        last_timestamp: 100,
        sequence: 3,
    };
    let before = state.clone();

    let yield_until = state.poll(95, SequenceReset::Zero).unwrap_pending();
    assert_eq!(yield_until, 100);
    assert_eq!(state, before, "a regressed reading must not touch state");

    let id = state.poll(100, SequenceReset::Zero).unwrap_ready();
    assert_eq!(id.ordering_key(), (100, 4));
}

#[test]
fn alternate_parity_reset_follows_millisecond() {
    let mut state = AllocatorState::new(0);
    let odd = state.poll(43, SequenceReset::AlternateParity).unwrap_ready();
    assert_eq!(odd.sequence(), 1);
    let even = state.poll(44, SequenceReset::AlternateParity).unwrap_ready();
    assert_eq!(even.sequence(), 0);
    let next = state.poll(44, SequenceReset::AlternateParity).unwrap_ready();
    assert_eq!(next.sequence(), 1);
}

#[test]
fn allocator_waits_for_next_millisecond_when_sequence_exhausted() {
    // 4096 readings of 42 fill the millisecond, the 4097th sees it full and
    // the allocator has to wait for 43.
    let readings = core::iter::repeat_n(42, 4097).chain([43]);
    let time = StepTime::new(readings);
    let allocator = IdAllocator::new(9, time.clone());

    let ids = allocator.allocate(9, 4097);
    assert_eq!(ids.len(), 4097);
    assert_strictly_ordered(&ids);

    let last = SnowflakeId::from_raw(ids[4096]);
    assert_eq!(last.timestamp(), 43);
    assert_eq!(last.sequence(), 0);
    assert_eq!(time.remaining(), 1);
}

#[test]
fn allocator_survives_clock_regression() {
    // The clock jumps back 5ms after three ids and crawls forward again.
    let time = StepTime::new([100, 100, 100, 95, 96, 97, 98, 99, 100, 101]);
    let allocator = IdAllocator::new(1, time.clone());

    let before = allocator.allocate(1, 3);
    let after = allocator.allocate(1, 2);

    let all: Vec<u64> = before.iter().chain(after.iter()).copied().collect();
    assert_strictly_ordered(&all);

    let unique: HashSet<u64> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len(), "an id was reissued");

    for raw in &all {
        assert!(SnowflakeId::from_raw(*raw).timestamp() >= 100);
    }
    assert_eq!(SnowflakeId::from_raw(after[0]).ordering_key(), (100, 3));
    assert_eq!(SnowflakeId::from_raw(after[1]).ordering_key(), (101, 0));
    // every regressed reading was consumed before generation resumed
    assert_eq!(time.remaining(), 1);
}

#[test]
fn allocator_ids_unique_and_ordered() {
    let allocator = IdAllocator::new(17, WallClock::default());
    let ids = allocator.allocate(17, 50_000);

    let unique: HashSet<u64> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());
    assert_strictly_ordered(&ids);
    assert!(
        ids.iter()
            .all(|raw| SnowflakeId::from_raw(*raw).partition() == 17)
    );
}

#[test]
fn next_id_uses_current_partition() {
    let allocator = IdAllocator::new(2, WallClock::default());
    let a = SnowflakeId::from_raw(allocator.next_id());
    allocator.set_partition(3);
    let b = SnowflakeId::from_raw(allocator.next_id());

    assert_eq!(a.partition(), 2);
    assert_eq!(b.partition(), 3);
    assert!(a.ordering_key() < b.ordering_key());
}

#[test]
fn zero_count_allocates_nothing() {
    let allocator = IdAllocator::new(0, MockTime { millis: 7 });
    assert!(allocator.allocate(0, 0).is_empty());
}

#[test]
fn concurrent_callers_never_collide() {
    const CALLERS: usize = 100;
    const IDS_PER_CALLER: usize = 100;

    let allocator = IdAllocator::new(12, WallClock::default());
    let seen = Mutex::new(HashSet::with_capacity(CALLERS * IDS_PER_CALLER));

    scope(|s| {
        for _ in 0..CALLERS {
            s.spawn(|| {
                let mut local = Vec::with_capacity(IDS_PER_CALLER);
                for _ in 0..IDS_PER_CALLER {
                    local.extend(allocator.allocate(12, 1));
                }
                assert_strictly_ordered(&local);

                let mut seen = seen.lock().unwrap();
                for id in local {
                    assert!(seen.insert(id), "duplicate id {id}");
                }
            });
        }
    });

    assert_eq!(seen.into_inner().unwrap().len(), CALLERS * IDS_PER_CALLER);
}
