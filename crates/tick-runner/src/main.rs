//! Demo runner for the partitioned tick dispatcher
//!
//! This binary:
//! 1. Loads a square of self-ticking chunks, grouped onto threads by region
//! 2. Spawns entities that wander between chunks and re-register as they go
//! 3. Drives everything with a fixed-rate tick loop until Ctrl-C or `MAX_TICKS`
//! 4. Unloads the world and joins the tick threads
//!
//! Configuration is read from environment variables, see [`RunnerConfig`].

mod config;
mod world;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tick_dispatch::{TickDispatcher, TickLoop, now_millis};
use tick_spatial::RegionProvider;
use tracing::info;

use crate::config::RunnerConfig;
use crate::world::DemoWorld;

/// Rounds between status reports.
const REPORT_INTERVAL: u64 = 100;

fn main() -> eyre::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tick_runner=info".parse()?)
                .add_directive("tick_dispatch=info".parse()?),
        )
        .init();

    let config = RunnerConfig::from_env();
    info!("Starting tick runner: {:?}", config);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::Release);
        })?;
    }

    let mut dispatcher = TickDispatcher::new(
        RegionProvider::new(config.chunks_per_region),
        config.threads,
    )?;
    let handle = dispatcher.handle();
    let world = DemoWorld::populate(&handle, &config);

    info!(
        "Queued {} chunk(s) and {} entit(ies)",
        world.chunk_count(),
        world.entity_count()
    );

    let mut rounds: u64 = 0;
    let stats = TickLoop::run(&mut dispatcher, &config.tick_loop(), &stop, |dispatcher, _time| {
        rounds += 1;
        if rounds.is_multiple_of(REPORT_INTERVAL) {
            info!(
                "Tick {}: {} partition(s), {} element(s), contexts per thread {:?}",
                rounds,
                dispatcher.partition_count(),
                dispatcher.element_count(),
                dispatcher.contexts_per_thread()
            );
        }
    })?;

    info!(
        "Ran {} tick(s): {} element tick(s), {} failed, {} migration(s), {} purged, {} overrun(s)",
        stats.rounds, stats.ticked, stats.failed, stats.migrated, stats.purged, stats.overruns
    );
    info!("Chunks ticked themselves {} time(s)", world.chunk_ticks());

    // Cleanup
    world.unload(&handle);
    dispatcher.update_and_await(now_millis())?;
    info!(
        "Unloaded world, {} element(s) still registered",
        dispatcher.element_count()
    );

    dispatcher.join()?;
    info!("Shut down");

    Ok(())
}
