//! Thread assignment policies.

use std::sync::atomic::{AtomicI32, Ordering};

/// How often the dispatcher should re-ask a provider for partition threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RefreshType {
    /// The thread chosen at load time is final; rebalance passes are skipped.
    Never,
    /// Every rebalance pass re-evaluates the partitions it scans.
    #[default]
    Always,
}

/// Maps a partition to a preferred worker thread.
///
/// The returned value may be any `i32`; the dispatcher normalizes it to a
/// valid index with `|value| mod thread_count`. Providers should return a
/// well-distributed hash, small ranges cluster partitions onto few threads.
pub trait ThreadProvider<P>: Send {
    /// Preferred thread for `partition`.
    fn find_thread(&self, partition: &P) -> i32;

    /// Whether rebalance passes should consult this provider.
    fn refresh_type(&self) -> RefreshType {
        RefreshType::Always
    }
}

impl<P, F> ThreadProvider<P> for F
where
    F: Fn(&P) -> i32 + Send,
{
    fn find_thread(&self, partition: &P) -> i32 {
        self(partition)
    }
}

/// Hands out threads round-robin in the order partitions are loaded.
///
/// The counter advances on every call, so re-asking would move partitions
/// around for no reason; rebalance is disabled for this provider.
#[derive(Debug, Default)]
pub struct CounterProvider {
    counter: AtomicI32,
}

impl CounterProvider {
    /// Create a counter starting at thread 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counter: AtomicI32::new(0),
        }
    }
}

impl<P> ThreadProvider<P> for CounterProvider {
    fn find_thread(&self, _partition: &P) -> i32 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    fn refresh_type(&self) -> RefreshType {
        RefreshType::Never
    }
}

/// Puts every partition on the first thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProvider;

impl<P> ThreadProvider<P> for SingleProvider {
    fn find_thread(&self, _partition: &P) -> i32 {
        0
    }

    fn refresh_type(&self) -> RefreshType {
        RefreshType::Never
    }
}

/// Normalize a provider result to a thread index.
///
/// Uses the unsigned magnitude so `i32::MIN` maps to a valid index instead of
/// staying negative.
#[must_use]
pub fn thread_index(raw: i32, thread_count: usize) -> usize {
    debug_assert!(thread_count > 0, "thread_count must be non-zero");
    raw.unsigned_abs() as usize % thread_count
}
