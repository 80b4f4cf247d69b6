//! Spatial partitions for the tick dispatcher.
//!
//! Chunks are the partitions; regions are square groups of chunks used only
//! to keep neighbouring chunks on the same tick thread.
//!
//! ```text
//! Region (chunks_per_region x chunks_per_region)
//!   └── Chunk (partition, one dispatch context)
//!         └── Entity (tickable element, position determines which chunk)
//! ```

mod chunk;
mod provider;

pub use chunk::{
    CHUNK_SIZE, Chunk, ChunkPartition, ChunkPos, Position, RegionPos, chebyshev_distance,
};
pub use provider::{ChunkProvider, RegionProvider};
