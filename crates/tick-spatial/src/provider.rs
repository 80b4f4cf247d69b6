//! Locality-aware thread providers for chunk partitions.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use tick_dispatch::ThreadProvider;

use crate::chunk::ChunkPartition;

fn fx_hash(value: &impl Hash) -> i32 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    // Truncation is fine, the dispatcher reduces the value modulo the thread count
    hasher.finish() as i32
}

/// Keeps every chunk of a region on the same tick thread.
///
/// Neighbouring chunks usually interact, so grouping them by region keeps most
/// cross-chunk work on one thread. Regions themselves are spread by hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionProvider {
    /// Edge length of a region, in chunks.
    pub chunks_per_region: i32,
}

impl RegionProvider {
    /// Create a provider grouping `chunks_per_region` x `chunks_per_region`
    /// chunks.
    #[must_use]
    pub const fn new(chunks_per_region: i32) -> Self {
        Self { chunks_per_region }
    }
}

impl Default for RegionProvider {
    fn default() -> Self {
        Self::new(4)
    }
}

impl<P: ChunkPartition> ThreadProvider<P> for RegionProvider {
    fn find_thread(&self, partition: &P) -> i32 {
        fx_hash(&partition.chunk_pos().region(self.chunks_per_region))
    }
}

/// Spreads chunks individually by hashing their position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkProvider;

impl<P: ChunkPartition> ThreadProvider<P> for ChunkProvider {
    fn find_thread(&self, partition: &P) -> i32 {
        fx_hash(&partition.chunk_pos())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tick_dispatch::{RefreshType, thread_index};

    use super::*;
    use crate::chunk::{Chunk, ChunkPos};

    fn thread_of<P: ChunkPartition>(provider: &impl ThreadProvider<P>, partition: &P) -> usize {
        thread_index(provider.find_thread(partition), 4)
    }

    #[test]
    fn test_region_keeps_chunks_together() {
        let provider = RegionProvider::new(4);
        let home = thread_of(&provider, &ChunkPos::new(0, 0));

        for chunk in ChunkPos::new(0, 0).square(3) {
            if chunk.x >= 0 && chunk.z >= 0 {
                assert_eq!(thread_of(&provider, &chunk), home);
            }
        }

        // Negative chunks belong to their own regions, not region (0, 0)
        assert_eq!(
            thread_of(&provider, &ChunkPos::new(-1, -1)),
            thread_of(&provider, &ChunkPos::new(-4, -4))
        );
    }

    #[test]
    fn test_regions_spread_over_threads() {
        let provider = RegionProvider::new(4);
        let used: HashSet<usize> = ChunkPos::default()
            .square(32)
            .map(|chunk| thread_of(&provider, &chunk))
            .collect();
        assert_eq!(used.len(), 4);
    }

    #[test]
    fn test_chunk_and_position_agree() {
        let chunk = Chunk::new(ChunkPos::new(-7, 12));
        assert_eq!(
            ChunkProvider.find_thread(&chunk),
            ChunkProvider.find_thread(&ChunkPos::new(-7, 12))
        );
        assert_eq!(
            RegionProvider::default().find_thread(&chunk),
            RegionProvider::default().find_thread(&ChunkPos::new(-7, 12))
        );
    }

    #[test]
    fn test_spatial_providers_refresh() {
        assert_eq!(
            ThreadProvider::<ChunkPos>::refresh_type(&ChunkProvider),
            RefreshType::Always
        );
        assert_eq!(
            ThreadProvider::<ChunkPos>::refresh_type(&RegionProvider::default()),
            RefreshType::Always
        );
    }
}
