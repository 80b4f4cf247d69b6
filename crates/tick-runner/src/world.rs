//! Demo world: a square of self-ticking chunks and entities wandering
//! between them.

use std::f64::consts::TAU;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use tick_dispatch::{DispatchHandle, TickError, Tickable, TickableRef, Timestamp};
use tick_spatial::{CHUNK_SIZE, Chunk, ChunkPos, Position};
use tracing::debug;

use crate::config::RunnerConfig;

type ChunkIndex = FxHashMap<ChunkPos, Chunk>;

/// Blocks an entity can cover per tick, at most.
const MAX_SPEED: f64 = 2.0;

struct Motion {
    position: Position,
    velocity: (f64, f64),
    chunk: ChunkPos,
}

/// An entity that moves every tick and re-registers itself when it crosses
/// into another chunk.
pub struct Entity {
    id: u32,
    this: Weak<Entity>,
    motion: Mutex<Motion>,
    min: f64,
    max: f64,
    chunks: Arc<ChunkIndex>,
    dispatch: DispatchHandle<Chunk>,
}

impl Entity {
    fn new(
        id: u32,
        position: Position,
        velocity: (f64, f64),
        (min, max): (f64, f64),
        chunks: Arc<ChunkIndex>,
        dispatch: DispatchHandle<Chunk>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            motion: Mutex::new(Motion {
                position,
                velocity,
                chunk: position.chunk(),
            }),
            min,
            max,
            chunks,
            dispatch,
        })
    }

    /// Current position.
    pub fn position(&self) -> Position {
        self.motion.lock().position
    }

    /// Chunk the entity was last registered in.
    pub fn chunk(&self) -> ChunkPos {
        self.motion.lock().chunk
    }

    fn step(&self, motion: &mut Motion) {
        let (vx, vz) = motion.velocity;
        let (x, vx) = bounce(motion.position.x + vx, vx, self.min, self.max);
        let (z, vz) = bounce(motion.position.z + vz, vz, self.min, self.max);
        motion.position.x = x;
        motion.position.z = z;
        motion.velocity = (vx, vz);
    }
}

/// Reflect a coordinate back into `[min, max)`.
fn bounce(value: f64, velocity: f64, min: f64, max: f64) -> (f64, f64) {
    if value < min {
        (min + (min - value), velocity.abs())
    } else if value >= max {
        let reflected = max - (value - max) - f64::EPSILON * max.abs().max(1.0);
        (reflected, -velocity.abs())
    } else {
        (value, velocity)
    }
}

impl Tickable for Entity {
    fn tick(&self, _time: Timestamp) -> Result<(), TickError> {
        let mut motion = self.motion.lock();
        self.step(&mut motion);

        let chunk = motion.position.chunk();
        if chunk == motion.chunk {
            return Ok(());
        }
        motion.chunk = chunk;
        drop(motion);

        let this: TickableRef = self
            .this
            .upgrade()
            .ok_or_else(|| TickError::failed(format!("entity {} was dropped", self.id)))?;

        match self.chunks.get(&chunk) {
            Some(partition) => self.dispatch.queue_element_update(this, partition.clone()),
            None => self.dispatch.queue_element_remove(this),
        }
        Ok(())
    }
}

/// All chunks and entities of the demo.
pub struct DemoWorld {
    chunks: Arc<ChunkIndex>,
    entities: Vec<Arc<Entity>>,
}

impl DemoWorld {
    /// Build the world and queue every chunk and entity for registration.
    pub fn populate(dispatch: &DispatchHandle<Chunk>, config: &RunnerConfig) -> Self {
        let radius = config.world_radius.max(0);
        let chunks: Arc<ChunkIndex> = Arc::new(
            ChunkPos::default()
                .square(radius)
                .map(|pos| (pos, Chunk::new(pos)))
                .collect(),
        );

        for chunk in chunks.values() {
            dispatch.queue_partition_load(chunk.clone());
        }

        let bounds = (
            f64::from(-radius * CHUNK_SIZE),
            f64::from((radius + 1) * CHUNK_SIZE),
        );
        let span = bounds.1 - bounds.0;

        let entities = (0..config.entity_count as u32)
            .map(|id| {
                let seed = seed(id);
                let position = Position::new(
                    bounds.0 + unit(seed) * span,
                    64.0,
                    bounds.0 + unit(seed.rotate_left(21)) * span,
                );
                let angle = unit(seed.rotate_left(42)) * TAU;
                let speed = MAX_SPEED * (0.25 + 0.75 * unit(seed.rotate_left(7)));
                let velocity = (angle.cos() * speed, angle.sin() * speed);

                Entity::new(
                    id,
                    position,
                    velocity,
                    bounds,
                    Arc::clone(&chunks),
                    dispatch.clone(),
                )
            })
            .collect::<Vec<_>>();

        for entity in &entities {
            let chunk = entity.chunk();
            if let Some(partition) = chunks.get(&chunk) {
                let element: TickableRef = entity.clone();
                dispatch.queue_element_update(element, partition.clone());
            }
        }

        debug!(
            "Populated {} chunk(s) and {} entit(ies)",
            chunks.len(),
            entities.len()
        );

        Self { chunks, entities }
    }

    /// Queue every chunk for unloading.
    pub fn unload(&self, dispatch: &DispatchHandle<Chunk>) {
        for chunk in self.chunks.values() {
            dispatch.queue_partition_unload(chunk.clone());
        }
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Total self-ticks across all chunks.
    pub fn chunk_ticks(&self) -> u64 {
        self.chunks.values().map(Chunk::ticks).sum()
    }

    /// The entities, in spawn order.
    pub fn entities(&self) -> &[Arc<Entity>] {
        &self.entities
    }
}

fn seed(id: u32) -> u64 {
    let mut hasher = FxHasher::default();
    id.hash(&mut hasher);
    hasher.finish()
}

/// Map the low bits of `seed` into `[0, 1)`.
fn unit(seed: u64) -> f64 {
    (seed & 0xFFFF) as f64 / 65536.0
}
