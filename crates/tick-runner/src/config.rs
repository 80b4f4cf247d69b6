//! Runner configuration from environment variables.

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use tick_dispatch::TickLoopConfig;

/// Settings for the demo world and its tick loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Number of tick threads.
    pub threads: usize,
    /// Rounds per second.
    pub target_tps: u32,
    /// Upper bound for the rebalance pass after each round.
    pub refresh_budget: Duration,
    /// Half edge length of the loaded square of chunks.
    pub world_radius: i32,
    /// Number of wandering entities.
    pub entity_count: usize,
    /// Edge length of a region, in chunks.
    pub chunks_per_region: i32,
    /// Stop after this many ticks, `0` runs until Ctrl-C.
    pub max_ticks: u64,
    /// Ticks between stale binding purges, `0` disables them.
    pub purge_interval: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism().map_or(4, NonZeroUsize::get),
            target_tps: 20,
            refresh_budget: Duration::from_millis(5),
            world_radius: 8,
            entity_count: 256,
            chunks_per_region: 4,
            max_ticks: 0,
            purge_interval: 200,
        }
    }
}

impl RunnerConfig {
    /// Read every setting from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            threads: env_or("TICK_THREADS", defaults.threads).max(1),
            target_tps: env_or("TARGET_TPS", defaults.target_tps).max(1),
            refresh_budget: Duration::from_millis(env_or(
                "REFRESH_BUDGET_MS",
                defaults.refresh_budget.as_millis() as u64,
            )),
            world_radius: env_or("WORLD_RADIUS", defaults.world_radius).max(0),
            entity_count: env_or("ENTITY_COUNT", defaults.entity_count),
            chunks_per_region: env_or("CHUNKS_PER_REGION", defaults.chunks_per_region).max(1),
            max_ticks: env_or("MAX_TICKS", defaults.max_ticks),
            purge_interval: env_or("PURGE_INTERVAL", defaults.purge_interval),
        }
    }

    /// Tick loop timing derived from these settings.
    pub fn tick_loop(&self) -> TickLoopConfig {
        TickLoopConfig {
            max_refresh_budget: self.refresh_budget,
            max_rounds: self.max_ticks,
            purge_interval: self.purge_interval,
            ..TickLoopConfig::from_tps(self.target_tps)
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_loop_from_defaults() {
        let config = RunnerConfig {
            threads: 2,
            ..RunnerConfig::default()
        };
        let tick_loop = config.tick_loop();

        assert_eq!(tick_loop.tick_interval, Duration::from_millis(50));
        assert_eq!(tick_loop.max_refresh_budget, Duration::from_millis(5));
        assert_eq!(tick_loop.max_rounds, 0);
        assert_eq!(tick_loop.purge_interval, 200);
    }

    #[test]
    fn test_unset_variable_uses_default() {
        assert_eq!(env_or("TICK_RUNNER_TEST_UNSET_VARIABLE", 17_u32), 17);
    }
}
