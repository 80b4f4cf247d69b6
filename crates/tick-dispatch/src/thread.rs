//! Worker threads.
//!
//! Each [`TickThread`] owns the dispatch contexts assigned to it and parks
//! between rounds. The driver hands it a round (time + barrier handle) and
//! unparks it; the worker ticks every element of every owned context, then
//! drops its barrier handle and parks again.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::sync::WaitGroup;
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxBuildHasher;
use tracing::{debug, error, warn};

use crate::context::{ContextId, DispatchContext};
use crate::error::{DispatchError, DispatchResult};
use crate::tickable::Timestamp;

/// Contexts owned by one worker.
pub(crate) type ContextMap = HashMap<ContextId, DispatchContext, FxBuildHasher>;

/// What a worker did during its last round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadReport {
    /// Elements whose tick was invoked.
    pub ticked: usize,
    /// Elements whose tick returned an error or panicked.
    pub failed: usize,
}

struct PendingRound {
    time: Timestamp,
    done: WaitGroup,
}

struct Shared {
    index: usize,
    contexts: Mutex<ContextMap>,
    round: Mutex<Option<PendingRound>>,
    stop: AtomicBool,
    ticked: AtomicUsize,
    failed: AtomicUsize,
}

/// A dedicated thread ticking the contexts it owns.
pub struct TickThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl TickThread {
    /// Spawn worker `index`. It parks until its first round.
    pub(crate) fn spawn(index: usize) -> DispatchResult<Self> {
        let shared = Arc::new(Shared {
            index,
            contexts: Mutex::new(ContextMap::default()),
            round: Mutex::new(None),
            stop: AtomicBool::new(false),
            ticked: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("tick-thread-{index}"))
            .spawn(move || worker.run())
            .map_err(|source| DispatchError::Spawn { index, source })?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Index of this worker in the pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Lock the contexts owned by this worker.
    ///
    /// Only the driver calls this, and only between rounds, so the lock is
    /// uncontended.
    pub(crate) fn contexts(&self) -> MutexGuard<'_, ContextMap> {
        self.shared.contexts.lock()
    }

    /// Hand this worker a round.
    ///
    /// A worker with nothing to tick completes immediately without being
    /// woken; a stopped or dead worker is skipped so the barrier cannot hang
    /// on it.
    pub(crate) fn start_tick(&self, done: &WaitGroup, time: Timestamp) {
        self.shared.ticked.store(0, Ordering::Relaxed);
        self.shared.failed.store(0, Ordering::Relaxed);

        if self.shared.stop.load(Ordering::Acquire) {
            return;
        }

        let Some(handle) = &self.handle else {
            return;
        };

        if handle.is_finished() {
            error!("tick thread {} is no longer running, skipping it", self.index());
            return;
        }

        if self.shared.contexts.lock().is_empty() {
            return;
        }

        *self.shared.round.lock() = Some(PendingRound {
            time,
            done: done.clone(),
        });
        handle.thread().unpark();
    }

    /// Counters from the last round this worker took part in.
    ///
    /// Only meaningful after the round's barrier has completed.
    #[must_use]
    pub fn report(&self) -> ThreadReport {
        ThreadReport {
            ticked: self.shared.ticked.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Ask the worker to exit and wake it if parked.
    ///
    /// A tick in progress is not interrupted; the worker exits after it.
    pub(crate) fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    /// Wait for the worker to exit. Call [`TickThread::shutdown`] first.
    pub(crate) fn join(&mut self) -> DispatchResult<()> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| DispatchError::WorkerPanicked {
                index: self.index(),
            }),
            None => Ok(()),
        }
    }
}

impl Drop for TickThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run(&self) {
        debug!("tick thread {} started", self.index);

        while !self.stop.load(Ordering::Acquire) {
            let Some(round) = self.round.lock().take() else {
                thread::park();
                continue;
            };
            self.tick_round(round);
        }

        // A round handed over concurrently with shutdown must still release
        // the barrier.
        drop(self.round.lock().take());
        debug!("tick thread {} stopped", self.index);
    }

    fn tick_round(&self, round: PendingRound) {
        let PendingRound { time, done } = round;

        match panic::catch_unwind(AssertUnwindSafe(|| self.tick_contexts(time))) {
            Ok(report) => {
                self.ticked.store(report.ticked, Ordering::Relaxed);
                self.failed.store(report.failed, Ordering::Relaxed);
            }
            Err(payload) => {
                error!(
                    "tick thread {} aborted its round at {}: {}",
                    self.index,
                    time,
                    panic_message(payload.as_ref())
                );
            }
        }

        // The context lock is released by now; signal completion last.
        drop(done);
    }

    fn tick_contexts(&self, time: Timestamp) -> ThreadReport {
        let contexts = self.contexts.lock();
        let mut report = ThreadReport::default();

        for context in contexts.values() {
            for element in context.elements() {
                report.ticked += 1;
                match panic::catch_unwind(AssertUnwindSafe(|| element.tick(time))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        report.failed += 1;
                        warn!(
                            "tick thread {} failed to tick element at {}: {}",
                            self.index, time, e
                        );
                    }
                    Err(payload) => {
                        report.failed += 1;
                        error!(
                            "tick thread {} caught a panic while ticking element at {}: {}",
                            self.index,
                            time,
                            panic_message(payload.as_ref())
                        );
                    }
                }
            }
        }

        report
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
