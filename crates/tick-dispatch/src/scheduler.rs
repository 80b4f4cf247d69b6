//! Fixed-rate driver for a [`TickDispatcher`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::dispatcher::TickDispatcher;
use crate::error::DispatchResult;
use crate::tickable::{Partition, Timestamp};

/// Timing of a [`TickLoop`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickLoopConfig {
    /// Time between the starts of two rounds.
    pub tick_interval: Duration,
    /// Upper bound for the rebalance pass after each round.
    pub max_refresh_budget: Duration,
    /// How far behind schedule the loop may fall before warning.
    pub overrun_warn_threshold: Duration,
    /// Stop after this many rounds. `0` runs until stopped.
    pub max_rounds: u64,
    /// Run [`TickDispatcher::purge_stale`] every this many rounds. `0` never
    /// purges.
    pub purge_interval: u64,
}

impl Default for TickLoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            max_refresh_budget: Duration::from_millis(5),
            overrun_warn_threshold: Duration::from_secs(2),
            max_rounds: 0,
            purge_interval: 0,
        }
    }
}

impl TickLoopConfig {
    /// Config ticking `tps` times per second, other values default.
    #[must_use]
    pub fn from_tps(tps: u32) -> Self {
        Self {
            tick_interval: Duration::from_secs(1) / tps.max(1),
            ..Self::default()
        }
    }
}

/// Totals over a whole [`TickLoop::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickLoopStats {
    /// Rounds completed.
    pub rounds: u64,
    /// Element ticks invoked across all rounds.
    pub ticked: u64,
    /// Element ticks that errored or panicked.
    pub failed: u64,
    /// Partitions migrated by rebalance passes.
    pub migrated: u64,
    /// Stale element bindings dropped by periodic purges.
    pub purged: u64,
    /// Times the loop fell behind by more than the warn threshold.
    pub overruns: u64,
}

/// Drives a dispatcher at a fixed rate.
pub struct TickLoop;

impl TickLoop {
    /// Run rounds until `stop` is set or `config.max_rounds` is reached.
    ///
    /// Each iteration calls `before_round` (the caller's own single-threaded
    /// work, typically queueing updates), runs one round and then a rebalance
    /// pass limited to the time left in the tick. A loop that falls behind
    /// skips the missed ticks instead of running them back to back.
    pub fn run<P, F>(
        dispatcher: &mut TickDispatcher<P>,
        config: &TickLoopConfig,
        stop: &AtomicBool,
        mut before_round: F,
    ) -> DispatchResult<TickLoopStats>
    where
        P: Partition,
        F: FnMut(&TickDispatcher<P>, Timestamp),
    {
        let mut stats = TickLoopStats::default();
        let mut next_tick = Instant::now();

        info!(
            "Tick loop running every {:?} on {} thread(s)",
            config.tick_interval,
            dispatcher.thread_count()
        );

        while !stop.load(Ordering::Acquire) {
            if config.max_rounds != 0 && stats.rounds >= config.max_rounds {
                break;
            }

            let time = now_millis();
            before_round(dispatcher, time);

            let round = dispatcher.update_and_await(time)?;
            stats.rounds += 1;
            stats.ticked += round.ticked as u64;
            stats.failed += round.failed as u64;

            let deadline = next_tick + config.tick_interval;
            let budget = config
                .max_refresh_budget
                .min(deadline.saturating_duration_since(Instant::now()));
            stats.migrated += dispatcher.refresh_threads(budget).migrated as u64;

            if config.purge_interval != 0 && stats.rounds % config.purge_interval == 0 {
                stats.purged += dispatcher.purge_stale() as u64;
            }

            let now = Instant::now();
            if now < deadline {
                thread::sleep(deadline - now);
                next_tick = deadline;
            } else {
                let behind = now - deadline;
                if behind > config.overrun_warn_threshold {
                    let skipped = behind.as_nanos() / config.tick_interval.as_nanos().max(1);
                    warn!(
                        "Can't keep up! Running {}ms behind, skipping {} tick(s)",
                        behind.as_millis(),
                        skipped
                    );
                    stats.overruns += 1;
                }
                next_tick = now;
            }
        }

        info!("Tick loop stopped after {} round(s)", stats.rounds);
        Ok(stats)
    }
}

/// Milliseconds since the Unix epoch, `0` if the clock is before it.
#[must_use]
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as Timestamp)
}
