//! Pending registration updates and the producer-side handle.

use std::fmt;
use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::tickable::TickableRef;

/// A registration change waiting to be applied at the next round.
pub enum DispatchUpdate<P> {
    /// A partition became active.
    PartitionLoad(P),
    /// A partition became inactive.
    PartitionUnload(P),
    /// An element now belongs to the given partition.
    ElementUpdate(TickableRef, P),
    /// An element should no longer be ticked.
    ElementRemove(TickableRef),
}

impl<P: fmt::Debug> fmt::Debug for DispatchUpdate<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartitionLoad(partition) => f.debug_tuple("PartitionLoad").field(partition).finish(),
            Self::PartitionUnload(partition) => {
                f.debug_tuple("PartitionUnload").field(partition).finish()
            }
            Self::ElementUpdate(_, partition) => {
                f.debug_tuple("ElementUpdate").field(partition).finish()
            }
            Self::ElementRemove(_) => f.write_str("ElementRemove"),
        }
    }
}

/// Multi-producer queue of pending updates, drained once per round.
pub(crate) type UpdateQueue<P> = SegQueue<DispatchUpdate<P>>;

/// Cloneable handle for queueing registration changes from any thread.
///
/// Every method only appends to a lock-free queue; nothing is applied until
/// the dispatcher runs its next round.
pub struct DispatchHandle<P> {
    updates: Arc<UpdateQueue<P>>,
}

impl<P> DispatchHandle<P> {
    pub(crate) const fn new(updates: Arc<UpdateQueue<P>>) -> Self {
        Self { updates }
    }

    /// Signal that a partition was loaded and should be given a thread.
    pub fn queue_partition_load(&self, partition: P) {
        self.updates.push(DispatchUpdate::PartitionLoad(partition));
    }

    /// Signal that a partition was unloaded and its context should be dropped.
    pub fn queue_partition_unload(&self, partition: P) {
        self.updates.push(DispatchUpdate::PartitionUnload(partition));
    }

    /// Signal that an element was added to, or moved into, a partition.
    pub fn queue_element_update(&self, tickable: TickableRef, partition: P) {
        self.updates
            .push(DispatchUpdate::ElementUpdate(tickable, partition));
    }

    /// Signal that an element should no longer be ticked.
    pub fn queue_element_remove(&self, tickable: TickableRef) {
        self.updates.push(DispatchUpdate::ElementRemove(tickable));
    }

    /// Number of updates waiting for the next round.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.updates.len()
    }
}

impl<P> Clone for DispatchHandle<P> {
    fn clone(&self) -> Self {
        Self {
            updates: Arc::clone(&self.updates),
        }
    }
}

impl<P> fmt::Debug for DispatchHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("pending", &self.updates.len())
            .finish()
    }
}
