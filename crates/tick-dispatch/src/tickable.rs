//! The tickable capability and partition identity.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use crate::TickError;

/// Wall-clock start time of a tick round, in milliseconds.
pub type Timestamp = u64;

/// A unit of work that is advanced once per tick round.
///
/// Implementations are shared between the producer that registers them and the
/// worker thread that ticks them, so `tick` takes `&self`; mutable state lives
/// behind interior mutability.
pub trait Tickable: Send + Sync {
    /// Advance by one discrete time step.
    ///
    /// An error is logged by the worker thread and does not affect any other
    /// element in the round.
    fn tick(&self, time: Timestamp) -> Result<(), TickError>;
}

/// Shared handle to a tickable element.
///
/// Identity is the allocation behind the `Arc`: two clones of the same handle
/// are the same element, two separately allocated elements never are.
pub type TickableRef = Arc<dyn Tickable>;

/// A unit of spatial locality that tickable elements are grouped under.
///
/// The scheduler never constructs partitions; it only compares and hashes the
/// values it is given.
pub trait Partition: Clone + Eq + Hash + Send + 'static {
    /// The element this partition ticks as itself, if it is self-ticking.
    ///
    /// A self-ticking partition is registered as an element of its own context
    /// when it is loaded and deregistered when it is unloaded.
    fn as_tickable(&self) -> Option<TickableRef> {
        None
    }
}

/// Identity of an element, derived from its allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ElementKey(usize);

impl ElementKey {
    pub(crate) fn of(tickable: &TickableRef) -> Self {
        Self(Arc::as_ptr(tickable).cast::<()>() as usize)
    }
}

/// Returns true if both handles point at the same element.
pub(crate) fn same_element(a: &TickableRef, b: &TickableRef) -> bool {
    ElementKey::of(a) == ElementKey::of(b)
}

/// Downgrades an element handle for the element table.
pub(crate) fn downgrade(tickable: &TickableRef) -> Weak<dyn Tickable> {
    Arc::downgrade(tickable)
}

/// Wrap a closure as a tickable element.
pub fn tickable_fn<F>(f: F) -> TickableRef
where
    F: Fn(Timestamp) -> Result<(), TickError> + Send + Sync + 'static,
{
    Arc::new(f)
}

impl<F> Tickable for F
where
    F: Fn(Timestamp) -> Result<(), TickError> + Send + Sync,
{
    fn tick(&self, time: Timestamp) -> Result<(), TickError> {
        self(time)
    }
}
