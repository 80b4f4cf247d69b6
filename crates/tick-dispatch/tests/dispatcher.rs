//! Integration tests for tick-dispatch

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tick_dispatch::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ============================================================================
// Test Partitions and Policies
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Zone {
    A,
    B,
    Numbered(u32),
}

impl Partition for Zone {}

/// A → `a_thread`, B → 1, numbered zones by number plus `shift`.
#[derive(Clone, Default)]
struct ZonePolicy {
    a_thread: Arc<AtomicI32>,
    shift: Arc<AtomicI32>,
    asked: Arc<Mutex<Vec<Zone>>>,
}

impl ThreadProvider<Zone> for ZonePolicy {
    fn find_thread(&self, zone: &Zone) -> i32 {
        self.asked.lock().push(*zone);
        match zone {
            Zone::A => self.a_thread.load(Ordering::SeqCst),
            Zone::B => 1,
            Zone::Numbered(n) => *n as i32 + self.shift.load(Ordering::SeqCst),
        }
    }
}

fn dispatcher(threads: usize) -> (TickDispatcher<Zone>, ZonePolicy) {
    init_tracing();
    let policy = ZonePolicy::default();
    let dispatcher = TickDispatcher::new(policy.clone(), threads).unwrap();
    (dispatcher, policy)
}

// ============================================================================
// Tick Recorder
// ============================================================================

#[derive(Clone, Debug)]
struct Call {
    element: &'static str,
    time: Timestamp,
    thread: String,
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    fn element(self: &Arc<Self>, name: &'static str) -> TickableRef {
        let recorder = Arc::clone(self);
        tickable_fn(move |time| {
            let thread = thread::current().name().unwrap_or_default().to_owned();
            recorder.calls.lock().push(Call {
                element: name,
                time,
                thread,
            });
            Ok(())
        })
    }

    fn take(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock())
    }
}

// ============================================================================
// Concrete Scenarios
// ============================================================================

#[test]
fn test_registered_element_ticks_once() {
    let (mut dispatcher, _) = dispatcher(2);
    let recorder = Arc::new(Recorder::default());
    let t1 = recorder.element("T1");

    dispatcher.queue_partition_load(Zone::A);
    dispatcher.queue_partition_load(Zone::B);
    dispatcher.queue_element_update(Arc::clone(&t1), Zone::A);
    let stats = dispatcher.update_and_await(100).unwrap();

    let calls = recorder.take();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].element, "T1");
    assert_eq!(calls[0].time, 100);
    assert_eq!(calls[0].thread, "tick-thread-0");
    assert_eq!(stats.applied, 3);
    assert_eq!(stats.ticked, 1);
    assert_eq!(dispatcher.thread_of(&Zone::B), Some(1));

    // Unloading A leaves no context referencing T1
    dispatcher.queue_partition_unload(Zone::A);
    dispatcher.update_and_await(101).unwrap();
    assert!(recorder.take().is_empty());
    assert!(!dispatcher.is_loaded(&Zone::A));
    assert_eq!(dispatcher.partition_of(&t1), None);
    assert_eq!(dispatcher.element_count(), 0);
}

#[test]
fn test_update_before_round_moves_element() {
    let (mut dispatcher, _) = dispatcher(2);
    let recorder = Arc::new(Recorder::default());
    let t1 = recorder.element("T1");

    dispatcher.queue_partition_load(Zone::A);
    dispatcher.queue_partition_load(Zone::B);
    dispatcher.queue_element_update(Arc::clone(&t1), Zone::A);
    dispatcher.queue_element_update(Arc::clone(&t1), Zone::B);
    dispatcher.update_and_await(7).unwrap();

    let calls = recorder.take();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].thread, "tick-thread-1");
    assert_eq!(dispatcher.partition_of(&t1), Some(Zone::B));
    assert_eq!(dispatcher.elements_per_thread(), vec![0, 1]);
}

#[test]
fn test_policy_change_migrates_on_refresh() {
    let (mut dispatcher, policy) = dispatcher(2);
    let recorder = Arc::new(Recorder::default());

    dispatcher.queue_partition_load(Zone::A);
    dispatcher.queue_element_update(recorder.element("T1"), Zone::A);
    dispatcher.queue_element_update(recorder.element("T2"), Zone::A);
    dispatcher.update_and_await(1).unwrap();
    assert!(recorder.take().iter().all(|call| call.thread == "tick-thread-0"));

    policy.a_thread.store(1, Ordering::SeqCst);
    let stats = dispatcher.refresh_threads(Duration::MAX);
    assert_eq!(stats.migrated, 1);
    assert_eq!(dispatcher.thread_of(&Zone::A), Some(1));
    assert_eq!(dispatcher.contexts_per_thread(), vec![0, 1]);

    dispatcher.update_and_await(2).unwrap();
    let calls = recorder.take();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|call| call.thread == "tick-thread-1"));
}

// ============================================================================
// Dispatch Properties
// ============================================================================

#[test]
fn test_every_element_ticked_once_per_round() {
    let (mut dispatcher, policy) = dispatcher(4);
    let counts: Arc<Mutex<HashMap<u32, u32>>> = Arc::default();

    for zone in 0..16 {
        dispatcher.queue_partition_load(Zone::Numbered(zone));
    }
    for element in 0..64_u32 {
        let counts = Arc::clone(&counts);
        dispatcher.queue_element_update(
            tickable_fn(move |_time| {
                *counts.lock().entry(element).or_default() += 1;
                Ok(())
            }),
            Zone::Numbered(element % 16),
        );
    }

    for round in 1..=5 {
        // Shuffle ownership between rounds
        policy.shift.store(round, Ordering::SeqCst);
        dispatcher.refresh_threads(Duration::MAX);

        let stats = dispatcher.update_and_await(round as u64).unwrap();
        assert_eq!(stats.ticked, 64);

        let per_thread = dispatcher.contexts_per_thread();
        assert_eq!(per_thread.iter().sum::<usize>(), 16);
    }

    let counts = counts.lock();
    assert_eq!(counts.len(), 64);
    assert!(counts.values().all(|&ticks| ticks == 5));
}

#[test]
fn test_partition_is_ticked_by_one_thread_per_round() {
    let (mut dispatcher, policy) = dispatcher(3);
    let seen: Arc<Mutex<Vec<(u32, String)>>> = Arc::default();

    for zone in 0..9 {
        dispatcher.queue_partition_load(Zone::Numbered(zone));
        for _ in 0..4 {
            let seen = Arc::clone(&seen);
            dispatcher.queue_element_update(
                tickable_fn(move |_time| {
                    let thread = thread::current().name().unwrap_or_default().to_owned();
                    seen.lock().push((zone, thread));
                    Ok(())
                }),
                Zone::Numbered(zone),
            );
        }
    }

    for round in 0..4 {
        policy.shift.store(round, Ordering::SeqCst);
        dispatcher.refresh_threads(Duration::MAX);
        dispatcher.update_and_await(0).unwrap();

        let mut owners: HashMap<u32, String> = HashMap::new();
        for (zone, thread) in std::mem::take(&mut *seen.lock()) {
            let owner = owners.entry(zone).or_insert_with(|| thread.clone());
            assert_eq!(*owner, thread, "zone {zone} ticked by two threads");
        }
        assert_eq!(owners.len(), 9);
    }
}

#[test]
fn test_refresh_is_bounded_and_fair() {
    let (mut dispatcher, policy) = dispatcher(2);
    for zone in 0..10 {
        dispatcher.queue_partition_load(Zone::Numbered(zone));
    }
    dispatcher.update_and_await(0).unwrap();
    assert_eq!(dispatcher.rebalance_len(), 10);

    // An unbounded pass still examines each partition once
    policy.asked.lock().clear();
    let stats = dispatcher.refresh_threads(Duration::MAX);
    assert_eq!(stats.scanned, 10);
    assert_eq!(policy.asked.lock().len(), 10);

    // A zero budget examines one partition per call and keeps rotating
    policy.asked.lock().clear();
    for _ in 0..10 {
        assert_eq!(dispatcher.refresh_threads(Duration::ZERO).scanned, 1);
    }
    let mut asked = policy.asked.lock().clone();
    asked.sort_by_key(|zone| match zone {
        Zone::Numbered(n) => *n,
        _ => u32::MAX,
    });
    assert_eq!(asked, (0..10).map(Zone::Numbered).collect::<Vec<_>>());
    assert_eq!(dispatcher.rebalance_len(), 10);
}

#[test]
fn test_unload_is_idempotent() {
    let (mut dispatcher, _) = dispatcher(2);
    let recorder = Arc::new(Recorder::default());

    dispatcher.queue_partition_unload(Zone::B);
    dispatcher.queue_partition_load(Zone::A);
    dispatcher.queue_element_update(recorder.element("T1"), Zone::A);
    dispatcher.queue_partition_unload(Zone::A);
    dispatcher.queue_partition_unload(Zone::A);
    let stats = dispatcher.update_and_await(0).unwrap();

    assert_eq!(stats.applied, 5);
    assert_eq!(stats.ticked, 0);
    assert_eq!(dispatcher.partition_count(), 0);
    assert_eq!(dispatcher.element_count(), 0);
    assert_eq!(dispatcher.rebalance_len(), 0);
    assert_eq!(dispatcher.contexts_per_thread(), vec![0, 0]);
    assert_eq!(dispatcher.purge_stale(), 0);

    // The partition can be loaded again afterwards
    dispatcher.queue_partition_load(Zone::A);
    dispatcher.update_and_await(1).unwrap();
    assert!(dispatcher.is_loaded(&Zone::A));
}

#[test]
fn test_failing_elements_do_not_stop_round() {
    let (mut dispatcher, _) = dispatcher(2);
    let recorder = Arc::new(Recorder::default());

    dispatcher.queue_partition_load(Zone::A);
    dispatcher.queue_partition_load(Zone::B);
    dispatcher.queue_element_update(tickable_fn(|_time| panic!("tick exploded")), Zone::A);
    dispatcher.queue_element_update(recorder.element("healthy-a"), Zone::A);
    dispatcher.queue_element_update(
        tickable_fn(|_time| Err(TickError::failed("out of fuel"))),
        Zone::B,
    );
    dispatcher.queue_element_update(recorder.element("healthy-b"), Zone::B);

    for time in 0..3 {
        let stats = dispatcher.update_and_await(time).unwrap();
        assert_eq!(stats.ticked, 4);
        assert_eq!(stats.failed, 2);
    }
    assert_eq!(recorder.take().len(), 6);
}

#[test]
fn test_removed_element_stops_ticking() {
    let (mut dispatcher, _) = dispatcher(2);
    let recorder = Arc::new(Recorder::default());
    let t1 = recorder.element("T1");
    let t2 = recorder.element("T2");

    dispatcher.queue_partition_load(Zone::B);
    dispatcher.queue_element_update(Arc::clone(&t1), Zone::B);
    dispatcher.queue_element_update(Arc::clone(&t2), Zone::B);
    dispatcher.update_and_await(0).unwrap();
    assert_eq!(recorder.take().len(), 2);

    dispatcher.queue_element_remove(Arc::clone(&t1));
    dispatcher.update_and_await(1).unwrap();
    let calls = recorder.take();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].element, "T2");
    assert_eq!(dispatcher.element_count(), 1);
}

// ============================================================================
// Producers and Self-Ticking Partitions
// ============================================================================

#[test]
fn test_concurrent_producers_through_handles() {
    let (mut dispatcher, _) = dispatcher(4);
    let ticks = Arc::new(AtomicU32::new(0));

    let producers: Vec<_> = (0..4)
        .map(|zone| {
            let handle = dispatcher.handle();
            let ticks = Arc::clone(&ticks);
            thread::spawn(move || {
                handle.queue_partition_load(Zone::Numbered(zone));
                for _ in 0..25 {
                    let ticks = Arc::clone(&ticks);
                    handle.queue_element_update(
                        tickable_fn(move |_time| {
                            ticks.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }),
                        Zone::Numbered(zone),
                    );
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    assert_eq!(dispatcher.pending_updates(), 104);
    let stats = dispatcher.update_and_await(0).unwrap();
    assert_eq!(stats.applied, 104);
    assert_eq!(stats.ticked, 100);
    assert_eq!(ticks.load(Ordering::SeqCst), 100);
    assert_eq!(dispatcher.element_count(), 100);
}

/// A partition that ticks itself.
#[derive(Clone)]
struct Beacon {
    id: u32,
    pulses: Arc<AtomicU32>,
    tickable: TickableRef,
}

impl Beacon {
    fn new(id: u32) -> Self {
        let pulses = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&pulses);
        Self {
            id,
            pulses,
            tickable: tickable_fn(move |_time| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        }
    }
}

impl std::fmt::Debug for Beacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Beacon").field("id", &self.id).finish()
    }
}

impl PartialEq for Beacon {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Beacon {}

impl Hash for Beacon {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Partition for Beacon {
    fn as_tickable(&self) -> Option<TickableRef> {
        Some(Arc::clone(&self.tickable))
    }
}

#[test]
fn test_self_ticking_partition() {
    init_tracing();
    let mut dispatcher = TickDispatcher::new(|beacon: &Beacon| beacon.id as i32, 2).unwrap();
    let beacon = Beacon::new(1);

    dispatcher.queue_partition_load(beacon.clone());
    dispatcher.update_and_await(0).unwrap();
    dispatcher.update_and_await(1).unwrap();

    assert_eq!(beacon.pulses.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.element_count(), 1);
    assert_eq!(dispatcher.partition_of(&beacon.tickable), Some(beacon.clone()));

    dispatcher.queue_partition_unload(beacon.clone());
    dispatcher.update_and_await(2).unwrap();
    assert_eq!(beacon.pulses.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.element_count(), 0);
}

#[test]
fn test_join_after_rounds() {
    let (mut dispatcher, _) = dispatcher(3);
    dispatcher.queue_partition_load(Zone::A);
    dispatcher.queue_element_update(tickable_fn(|_time| Ok(())), Zone::A);
    dispatcher.update_and_await(0).unwrap();

    dispatcher.join().unwrap();
}
