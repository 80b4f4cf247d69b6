//! Chunk and region coordinates, and the self-ticking chunk partition.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tick_dispatch::{Partition, TickError, Tickable, TickableRef, Timestamp};

/// Blocks along one horizontal edge of a chunk.
pub const CHUNK_SIZE: i32 = 16;

/// Chunk coordinates in chunk-space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    /// Create a chunk position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The chunk containing block `(x, z)`.
    #[must_use]
    pub const fn from_block(x: i32, z: i32) -> Self {
        Self::new(x.div_euclid(CHUNK_SIZE), z.div_euclid(CHUNK_SIZE))
    }

    /// The region containing this chunk.
    ///
    /// `chunks_per_region` is clamped to at least 1.
    #[must_use]
    pub fn region(self, chunks_per_region: i32) -> RegionPos {
        let size = chunks_per_region.max(1);
        RegionPos::new(self.x.div_euclid(size), self.z.div_euclid(size))
    }

    /// Every chunk within `radius` of `self`, row by row.
    pub fn square(self, radius: i32) -> impl Iterator<Item = Self> {
        let radius = radius.max(0);
        (-radius..=radius)
            .flat_map(move |dz| (-radius..=radius).map(move |dx| Self::new(self.x + dx, self.z + dz)))
    }
}

impl Partition for ChunkPos {}

/// Region coordinates in region-space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    /// Create a region position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

/// World position of an entity.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    /// Create a new position
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The chunk this position falls in.
    #[must_use]
    pub fn chunk(&self) -> ChunkPos {
        let size = f64::from(CHUNK_SIZE);
        ChunkPos::new(
            (self.x / size).floor() as i32,
            (self.z / size).floor() as i32,
        )
    }
}

/// Compute Chebyshev distance between two chunk positions.
#[must_use]
pub fn chebyshev_distance(a: ChunkPos, b: ChunkPos) -> i32 {
    let dx = (a.x - b.x).abs();
    let dz = (a.z - b.z).abs();
    dx.max(dz)
}

/// A partition that knows which chunk it covers.
pub trait ChunkPartition: Partition {
    /// The chunk this partition covers.
    fn chunk_pos(&self) -> ChunkPos;
}

impl ChunkPartition for ChunkPos {
    fn chunk_pos(&self) -> ChunkPos {
        *self
    }
}

struct ChunkState {
    pos: ChunkPos,
    ticks: AtomicU64,
    last_tick: AtomicU64,
}

impl Tickable for ChunkState {
    fn tick(&self, time: Timestamp) -> Result<(), TickError> {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.last_tick.store(time, Ordering::Relaxed);
        Ok(())
    }
}

/// A loaded chunk that is ticked as an element of its own partition.
///
/// Clones share state; equality and hashing only look at the position.
#[derive(Clone)]
pub struct Chunk {
    state: Arc<ChunkState>,
}

impl Chunk {
    /// Create a chunk that has never been ticked.
    #[must_use]
    pub fn new(pos: ChunkPos) -> Self {
        Self {
            state: Arc::new(ChunkState {
                pos,
                ticks: AtomicU64::new(0),
                last_tick: AtomicU64::new(0),
            }),
        }
    }

    /// Position of this chunk.
    #[must_use]
    pub fn pos(&self) -> ChunkPos {
        self.state.pos
    }

    /// How many times the chunk itself has been ticked.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.state.ticks.load(Ordering::Relaxed)
    }

    /// Time of the last tick, `0` if never ticked.
    #[must_use]
    pub fn last_tick(&self) -> Timestamp {
        self.state.last_tick.load(Ordering::Relaxed)
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.pos() == other.pos()
    }
}

impl Eq for Chunk {}

impl Hash for Chunk {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pos().hash(state);
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("x", &self.state.pos.x)
            .field("z", &self.state.pos.z)
            .field("ticks", &self.ticks())
            .finish()
    }
}

impl Partition for Chunk {
    fn as_tickable(&self) -> Option<TickableRef> {
        let tickable: TickableRef = self.state.clone();
        Some(tickable)
    }
}

impl ChunkPartition for Chunk {
    fn chunk_pos(&self) -> ChunkPos {
        self.pos()
    }
}
