//! Partitioned tick dispatch.
//!
//! Tickable elements are grouped under partitions (units of spatial locality).
//! Every loaded partition gets a dispatch context owned by exactly one worker
//! thread, and every round ticks each registered element once on the thread
//! that owns its partition.
//!
//! # Architecture
//!
//! ```text
//! TickDispatcher
//!   ├── Partition ──► ContextId ──► owning TickThread
//!   │                    └── DispatchContext (elements)
//!   └── Tickable  ──► ContextId
//! ```
//!
//! # Round Model
//!
//! ```text
//! Round N (time T):
//! 1. Drain pending updates (loads, unloads, element moves)
//! 2. Wake every worker with work, each ticks its own contexts at T
//! 3. Barrier: wait for every woken worker
//! 4. Optional rebalance: move whole contexts between workers
//! ```

mod context;
mod dispatcher;
mod error;
mod provider;
mod scheduler;
mod thread;
mod tickable;
mod update;

pub use context::{ContextId, DispatchContext};
pub use dispatcher::{RefreshStats, RoundStats, TickDispatcher};
pub use error::{DispatchError, DispatchResult, TickError};
pub use provider::{CounterProvider, RefreshType, SingleProvider, ThreadProvider, thread_index};
pub use scheduler::{TickLoop, TickLoopConfig, TickLoopStats, now_millis};
pub use thread::ThreadReport;
pub use tickable::{Partition, Tickable, TickableRef, Timestamp, tickable_fn};
pub use update::{DispatchHandle, DispatchUpdate};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CounterProvider, DispatchError, DispatchHandle, Partition, RefreshType, SingleProvider,
        ThreadProvider, TickDispatcher, TickError, TickLoop, TickLoopConfig, Tickable,
        TickableRef, Timestamp, tickable_fn,
    };
}
