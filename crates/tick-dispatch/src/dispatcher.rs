//! The tick dispatcher.
//!
//! # Round Model
//!
//! ```text
//! producers (any thread)            driver (one thread)
//! ──────────────────────            ──────────────────────────────────────────
//! queue_partition_load ─┐           update_and_await(time):
//! queue_element_update ─┼─► queue ─►  1. drain queue, apply to tables
//! queue_element_remove ─┤             2. WaitGroup over the workers
//! queue_partition_unload┘             3. hand each worker (time, barrier)
//!                                     4. wait for every worker to finish
//!                                   refresh_threads(budget):
//!                                     rotate rebalance queue, migrate whole
//!                                     contexts to the provider's new choice
//! ```
//!
//! All tables are owned by the dispatcher and only change through `&mut self`,
//! which also keeps a round and a rebalance pass from ever overlapping.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::sync::WaitGroup;
use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;
use tracing::{debug, info, trace, warn};

use crate::context::{ContextArena, ContextId, DispatchContext};
use crate::error::{DispatchError, DispatchResult};
use crate::provider::{RefreshType, ThreadProvider, thread_index};
use crate::thread::{TickThread, panic_message};
use crate::tickable::{ElementKey, Partition, Tickable, TickableRef, Timestamp, downgrade};
use crate::update::{DispatchHandle, DispatchUpdate, UpdateQueue};

type FxHashMap<K, V> = HashMap<K, V, FxBuildHasher>;

/// Where an element is currently bound.
struct ElementBinding {
    /// Non-owning handle; the owning reference lives in the context.
    handle: Weak<dyn Tickable>,
    context: ContextId,
}

/// Outcome of one tick round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoundStats {
    /// Pending updates applied before ticking.
    pub applied: usize,
    /// Elements whose tick was invoked.
    pub ticked: usize,
    /// Elements whose tick returned an error or panicked.
    pub failed: usize,
    /// Wall time spent in the round, including the drain.
    pub elapsed: Duration,
}

/// Outcome of one rebalance pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// Partitions examined.
    pub scanned: usize,
    /// Partitions whose context moved to another thread.
    pub migrated: usize,
}

/// Dispatches partition-local tickable elements onto a fixed pool of threads.
///
/// Registration is asynchronous: the `queue_*` methods (also available on a
/// [`DispatchHandle`] for other threads) only record the change, and every
/// recorded change is applied at the start of the next
/// [`update_and_await`](Self::update_and_await).
pub struct TickDispatcher<P: Partition> {
    provider: Box<dyn ThreadProvider<P>>,
    threads: Vec<TickThread>,
    /// Defines how computation is dispatched to the available threads.
    partitions: FxHashMap<P, ContextId>,
    /// Thread and partition of every live context.
    contexts: ContextArena<P>,
    /// Retrieves the context of an element without scanning partitions.
    elements: FxHashMap<ElementKey, ElementBinding>,
    /// Every loaded partition exactly once, in rebalance order.
    rebalance_queue: VecDeque<P>,
    /// Updates applied at the start of the next round.
    updates: Arc<UpdateQueue<P>>,
    shut_down: AtomicBool,
}

impl<P: Partition> TickDispatcher<P> {
    /// Spawn `thread_count` tick threads assigned to by `provider`.
    pub fn new(
        provider: impl ThreadProvider<P> + 'static,
        thread_count: usize,
    ) -> DispatchResult<Self> {
        if thread_count == 0 {
            return Err(DispatchError::NoThreads);
        }

        // Already spawned threads are stopped by their Drop if a later spawn fails
        let threads = (0..thread_count)
            .map(TickThread::spawn)
            .collect::<DispatchResult<Vec<_>>>()?;

        info!("Started tick dispatcher with {} thread(s)", thread_count);

        Ok(Self {
            provider: Box::new(provider),
            threads,
            partitions: FxHashMap::default(),
            contexts: ContextArena::new(),
            elements: FxHashMap::default(),
            rebalance_queue: VecDeque::new(),
            updates: Arc::new(UpdateQueue::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// A cloneable handle for queueing updates from other threads.
    #[must_use]
    pub fn handle(&self) -> DispatchHandle<P> {
        DispatchHandle::new(Arc::clone(&self.updates))
    }

    /// Signal that a partition was loaded and should be given a thread.
    pub fn queue_partition_load(&self, partition: P) {
        self.updates.push(DispatchUpdate::PartitionLoad(partition));
    }

    /// Signal that a partition was unloaded and its context should be dropped.
    pub fn queue_partition_unload(&self, partition: P) {
        self.updates.push(DispatchUpdate::PartitionUnload(partition));
    }

    /// Signal that an element was added to, or moved into, a partition.
    pub fn queue_element_update(&self, tickable: TickableRef, partition: P) {
        self.updates
            .push(DispatchUpdate::ElementUpdate(tickable, partition));
    }

    /// Signal that an element should no longer be ticked.
    pub fn queue_element_remove(&self, tickable: TickableRef) {
        self.updates.push(DispatchUpdate::ElementRemove(tickable));
    }

    /// Apply every pending update, tick all elements once and wait for every
    /// thread to finish.
    ///
    /// # Arguments
    /// * `time` - The round's start time, in milliseconds
    pub fn update_and_await(&mut self, time: Timestamp) -> DispatchResult<RoundStats> {
        if self.is_shut_down() {
            return Err(DispatchError::ShutDown);
        }

        let start = Instant::now();
        let applied = self.apply_updates();

        // Start the tick and wait for every thread that starts ticking to finish
        let done = WaitGroup::new();
        for thread in &self.threads {
            thread.start_tick(&done, time);
        }
        done.wait();

        let mut stats = RoundStats {
            applied,
            ..RoundStats::default()
        };
        for thread in &self.threads {
            let report = thread.report();
            stats.ticked += report.ticked;
            stats.failed += report.failed;
        }
        stats.elapsed = start.elapsed();

        trace!(
            "Tick round at {} applied {} update(s), ticked {} element(s) in {:?}",
            time, stats.applied, stats.ticked, stats.elapsed
        );

        Ok(stats)
    }

    /// Re-evaluate the thread of loaded partitions, round-robin.
    ///
    /// Examines at most as many partitions as are loaded when the call starts,
    /// and stops early once `budget` has elapsed. Repeated calls continue where
    /// the previous one stopped, so every partition is eventually revisited.
    pub fn refresh_threads(&mut self, budget: Duration) -> RefreshStats {
        let mut stats = RefreshStats::default();
        if self.provider.refresh_type() == RefreshType::Never {
            return stats;
        }

        let start = Instant::now();
        let mut remaining = self.rebalance_queue.len();

        while remaining > 0 {
            let Some(partition) = self.rebalance_queue.pop_front() else {
                break;
            };
            remaining -= 1;
            stats.scanned += 1;

            if self.migrate_if_needed(&partition) {
                stats.migrated += 1;
            }

            self.rebalance_queue.push_back(partition);
            if start.elapsed() >= budget {
                break;
            }
        }

        if stats.migrated > 0 {
            debug!(
                "Refresh moved {} of {} scanned partition(s)",
                stats.migrated, stats.scanned
            );
        }

        stats
    }

    /// Stop every tick thread and wake the parked ones.
    ///
    /// Ticks already in progress run to completion. Later rounds fail with
    /// [`DispatchError::ShutDown`].
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            info!("Shutting down {} tick thread(s)", self.threads.len());
        }
        for thread in &self.threads {
            thread.shutdown();
        }
    }

    /// Shut down and wait for every tick thread to exit.
    pub fn join(mut self) -> DispatchResult<()> {
        self.shutdown();

        let mut result = Ok(());
        for thread in &mut self.threads {
            if let Err(e) = thread.join() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Drop element bindings that no longer point at a live element or
    /// context. Returns the number of bindings dropped.
    ///
    /// Unload and remove already keep the element table exact; this is only a
    /// backstop against bindings leaking if that ever fails.
    pub fn purge_stale(&mut self) -> usize {
        let before = self.elements.len();
        let contexts = &self.contexts;
        self.elements.retain(|_, binding| {
            binding.handle.strong_count() > 0 && contexts.contains(binding.context)
        });

        let purged = before - self.elements.len();
        if purged > 0 {
            warn!("Purged {} stale element binding(s)", purged);
        }
        purged
    }

    /// Number of tick threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Number of loaded partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Number of registered elements.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Number of updates waiting for the next round.
    #[must_use]
    pub fn pending_updates(&self) -> usize {
        self.updates.len()
    }

    /// Number of partitions in the rebalance queue.
    #[must_use]
    pub fn rebalance_len(&self) -> usize {
        self.rebalance_queue.len()
    }

    /// Whether `partition` is loaded.
    #[must_use]
    pub fn is_loaded(&self, partition: &P) -> bool {
        self.partitions.contains_key(partition)
    }

    /// Index of the thread that owns `partition`'s context.
    #[must_use]
    pub fn thread_of(&self, partition: &P) -> Option<usize> {
        let id = self.partitions.get(partition)?;
        self.contexts.get(*id).map(|entry| entry.thread)
    }

    /// The partition `tickable` is currently bound to.
    #[must_use]
    pub fn partition_of(&self, tickable: &TickableRef) -> Option<P> {
        let binding = self.elements.get(&ElementKey::of(tickable))?;
        self.contexts
            .get(binding.context)
            .map(|entry| entry.partition.clone())
    }

    /// Number of contexts owned by each thread, by thread index.
    #[must_use]
    pub fn contexts_per_thread(&self) -> Vec<usize> {
        self.threads
            .iter()
            .map(|thread| thread.contexts().len())
            .collect()
    }

    /// Number of elements owned by each thread, by thread index.
    #[must_use]
    pub fn elements_per_thread(&self) -> Vec<usize> {
        self.threads
            .iter()
            .map(|thread| thread.contexts().values().map(DispatchContext::len).sum())
            .collect()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn apply_updates(&mut self) -> usize {
        // Bounded by the length at drain start so busy producers cannot keep
        // the drain going forever.
        let pending = self.updates.len();
        let mut applied = 0;

        while applied < pending {
            let Some(update) = self.updates.pop() else {
                break;
            };
            applied += 1;

            match update {
                DispatchUpdate::PartitionLoad(partition) => self.load_partition(partition),
                DispatchUpdate::PartitionUnload(partition) => self.unload_partition(&partition),
                DispatchUpdate::ElementUpdate(tickable, partition) => {
                    self.update_element(tickable, &partition);
                }
                DispatchUpdate::ElementRemove(tickable) => self.remove_element(&tickable),
            }
        }

        applied
    }

    /// Normalized thread choice for `partition`, or `None` if the provider
    /// panicked.
    fn find_thread(&self, partition: &P) -> Option<usize> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.provider.find_thread(partition))) {
            Ok(raw) => Some(thread_index(raw, self.threads.len())),
            Err(payload) => {
                warn!(
                    "Thread provider panicked, keeping the current assignment: {}",
                    panic_message(payload.as_ref())
                );
                None
            }
        }
    }

    fn load_partition(&mut self, partition: P) {
        if self.partitions.contains_key(&partition) {
            trace!("Ignoring load of an already loaded partition");
            return;
        }

        let thread = self.find_thread(&partition).unwrap_or(0);
        let id = self.contexts.allocate(thread, partition.clone());
        self.threads[thread]
            .contexts()
            .insert(id, DispatchContext::new());

        self.partitions.insert(partition.clone(), id);
        self.rebalance_queue.push_back(partition.clone());
        debug!("Loaded partition as {:?} on tick thread {}", id, thread);

        if let Some(tickable) = partition.as_tickable() {
            self.update_element(tickable, &partition);
        }
    }

    fn unload_partition(&mut self, partition: &P) {
        let Some(id) = self.partitions.remove(partition) else {
            trace!("Ignoring unload of a partition that is not loaded");
            return;
        };

        if let Some(entry) = self.contexts.free(id) {
            let removed = self.threads[entry.thread].contexts().remove(&id);
            if let Some(mut context) = removed {
                // Elements left in an unloaded partition are no longer registered
                for element in context.drain() {
                    self.elements.remove(&ElementKey::of(&element));
                }
            }
            debug!("Unloaded {:?} from tick thread {}", id, entry.thread);
        }

        if let Some(position) = self.rebalance_queue.iter().position(|p| p == partition) {
            self.rebalance_queue.remove(position);
        }

        // A self-ticking partition may have been moved into another context
        if let Some(tickable) = partition.as_tickable() {
            self.remove_element(&tickable);
        }
    }

    fn update_element(&mut self, tickable: TickableRef, partition: &P) {
        let key = ElementKey::of(&tickable);
        if let Some(binding) = self.elements.remove(&key) {
            self.detach(&tickable, binding.context);
        }

        let Some(&id) = self.partitions.get(partition) else {
            debug!("Element moved into a partition that is not loaded, it will not be ticked");
            return;
        };
        let Some(thread) = self.contexts.get(id).map(|entry| entry.thread) else {
            return;
        };

        if let Some(context) = self.threads[thread].contexts().get_mut(&id) {
            context.push(Arc::clone(&tickable));
        }
        self.elements.insert(
            key,
            ElementBinding {
                handle: downgrade(&tickable),
                context: id,
            },
        );
        trace!("Bound element to {:?} on tick thread {}", id, thread);
    }

    fn remove_element(&mut self, tickable: &TickableRef) {
        if let Some(binding) = self.elements.remove(&ElementKey::of(tickable)) {
            self.detach(tickable, binding.context);
        }
    }

    /// Take `tickable` out of the context `id`, if that context is still live.
    fn detach(&self, tickable: &TickableRef, id: ContextId) {
        if let Some(entry) = self.contexts.get(id) {
            if let Some(context) = self.threads[entry.thread].contexts().get_mut(&id) {
                context.remove(tickable);
            }
        }
    }

    /// Move `partition`'s whole context to the provider's current choice.
    fn migrate_if_needed(&mut self, partition: &P) -> bool {
        let Some(&id) = self.partitions.get(partition) else {
            return false;
        };
        let Some(previous) = self.contexts.get(id).map(|entry| entry.thread) else {
            return false;
        };
        let Some(next) = self.find_thread(partition) else {
            return false;
        };
        if next == previous {
            return false;
        }

        let Some(context) = self.threads[previous].contexts().remove(&id) else {
            return false;
        };
        self.threads[next].contexts().insert(id, context);
        if let Some(entry) = self.contexts.get_mut(id) {
            entry.thread = next;
        }

        debug!(
            "Moved {:?} from tick thread {} to tick thread {}",
            id, previous, next
        );
        true
    }
}

impl<P: Partition> Drop for TickDispatcher<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<P: Partition> fmt::Debug for TickDispatcher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickDispatcher")
            .field("threads", &self.threads.len())
            .field("partitions", &self.partitions.len())
            .field("contexts", &self.contexts.len())
            .field("elements", &self.elements.len())
            .field("pending", &self.updates.len())
            .finish()
    }
}
