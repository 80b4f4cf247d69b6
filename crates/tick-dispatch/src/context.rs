//! Dispatch contexts and the generation-checked context arena.
//!
//! A [`DispatchContext`] holds the elements of one loaded partition. The
//! context value itself lives in the context map of the worker thread that
//! owns it and is moved between workers on migration. The driver keeps a
//! [`ContextArena`] recording, per live [`ContextId`], which thread owns the
//! context and which partition it belongs to.
//!
//! Context ids use a generational index so ids held by element bindings go
//! stale the moment their partition is unloaded, even if the slot is reused.

use std::fmt;

use smallvec::SmallVec;

use crate::tickable::{TickableRef, same_element};

/// Generation counter to detect stale context ids.
/// Incremented each time a context slot is freed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Generation(u32);

impl Generation {
    /// Create a new generation (starts at 0).
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Increment the generation counter.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// Identifier of a live dispatch context.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId {
    /// Index into the arena.
    index: u32,
    /// Generation of the slot when this id was handed out.
    generation: Generation,
}

impl ContextId {
    const fn new(index: u32, generation: Generation) -> Self {
        Self { index, generation }
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({}v{})", self.index, self.generation.0)
    }
}

/// The elements of one loaded partition.
///
/// Not synchronized: mutated by the driver between rounds and read by the
/// owning worker during a round, never both at once.
#[derive(Default)]
pub struct DispatchContext {
    elements: SmallVec<[TickableRef; 4]>,
}

impl DispatchContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element.
    pub fn push(&mut self, element: TickableRef) {
        self.elements.push(element);
    }

    /// Remove an element, returning true if it was present.
    pub fn remove(&mut self, element: &TickableRef) -> bool {
        if let Some(position) = self.elements.iter().position(|e| same_element(e, element)) {
            self.elements.remove(position);
            true
        } else {
            false
        }
    }

    /// Elements in insertion order.
    pub fn elements(&self) -> impl Iterator<Item = &TickableRef> {
        self.elements.iter()
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the context holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Take every element out of the context.
    pub fn drain(&mut self) -> impl Iterator<Item = TickableRef> + '_ {
        self.elements.drain(..)
    }
}

impl fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("elements", &self.elements.len())
            .finish()
    }
}

/// Driver-side record of a live context.
#[derive(Debug)]
pub struct ContextEntry<P> {
    /// Index of the worker thread that owns the context.
    pub thread: usize,
    /// The partition the context belongs to.
    pub partition: P,
}

struct Slot<P> {
    generation: Generation,
    entry: Option<ContextEntry<P>>,
}

/// Allocator for context ids with generation tracking.
///
/// Maintains a free list of recycled slots and tracks the current generation
/// for each slot.
pub struct ContextArena<P> {
    slots: Vec<Slot<P>>,
    free_list: Vec<u32>,
    live: usize,
}

impl<P> Default for ContextArena<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> ContextArena<P> {
    /// Create an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
        }
    }

    /// Allocate an id for a context owned by `thread`.
    pub fn allocate(&mut self, thread: usize, partition: P) -> ContextId {
        self.live += 1;
        let entry = Some(ContextEntry { thread, partition });

        if let Some(index) = self.free_list.pop() {
            // Reuse a recycled slot
            let slot = &mut self.slots[index as usize];
            slot.entry = entry;
            ContextId::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            let generation = Generation::new();
            self.slots.push(Slot { generation, entry });
            ContextId::new(index, generation)
        }
    }

    /// Free a context id, returning its entry if the id was live.
    pub fn free(&mut self, id: ContextId) -> Option<ContextEntry<P>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        let entry = slot.entry.take()?;
        // Increment generation to invalidate existing ids
        slot.generation = slot.generation.next();
        self.free_list.push(id.index);
        self.live -= 1;
        Some(entry)
    }

    /// Look up a live context.
    #[must_use]
    pub fn get(&self, id: ContextId) -> Option<&ContextEntry<P>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Look up a live context mutably.
    pub fn get_mut(&mut self, id: ContextId) -> Option<&mut ContextEntry<P>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Whether `id` refers to a live context.
    #[must_use]
    pub fn contains(&self, id: ContextId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live contexts.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    /// Whether no contexts are live.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }
}
