// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Bookkeeping for transient playback nodes.
//!
//! A [`NodePool`] is a generational arena: every live node gets a stable [`NodeHandle`],
//! and finishing a node frees its slot in constant time. Stale handles (for nodes that
//! already ended or were disposed) are simply ignored, which makes every release path
//! safe to race against natural completion.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Global pool ID counter.
static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies the pool that owns a node, so completions can be routed back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u32);

/// A stable reference to a slot in a [`NodePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

/// Everything the audio side needs to report a node back to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackTag {
    pub pool: PoolId,
    pub handle: NodeHandle,
}

/// How a node left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Playback ran to completion.
    Ended,
    /// The node was force-released before it finished.
    Disposed,
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// A generational arena of live transient nodes.
pub struct NodePool<T> {
    id: PoolId,
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    live: usize,
    ended: u64,
    disposed: u64,
}

impl<T> NodePool<T> {
    /// Creates an empty pool with a fresh ID.
    pub fn new() -> Self {
        Self {
            id: PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)),
            slots: Vec::new(),
            free_head: None,
            live: 0,
            ended: 0,
            disposed: 0,
        }
    }

    /// Returns the ID of this pool.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Builds the tag the audio side reports back for the given handle.
    pub fn tag(&self, handle: NodeHandle) -> PlaybackTag {
        PlaybackTag {
            pool: self.id,
            handle,
        }
    }

    /// Registers a live node and returns its handle.
    pub fn insert(&mut self, value: T) -> NodeHandle {
        self.live += 1;
        match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let (generation, next_free) = match slot {
                    Slot::Vacant {
                        generation,
                        next_free,
                    } => (*generation, *next_free),
                    Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
                };
                *slot = Slot::Occupied { generation, value };
                self.free_head = next_free;
                NodeHandle { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    value,
                });
                NodeHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Returns the node for the handle if it is still live.
    pub fn get(&self, handle: NodeHandle) -> Option<&T> {
        match self.slots.get(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Returns true if the handle refers to a live node.
    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Removes a live node, recording how it finished. Returns `None` if the node had
    /// already left the pool.
    pub fn finish(&mut self, handle: NodeHandle, terminal: Terminal) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {}
            _ => return None,
        }

        let next_generation = handle.generation.wrapping_add(1);
        let previous = std::mem::replace(
            slot,
            Slot::Vacant {
                generation: next_generation,
                next_free: self.free_head,
            },
        );
        self.free_head = Some(handle.index);
        self.live -= 1;
        match terminal {
            Terminal::Ended => self.ended += 1,
            Terminal::Disposed => self.disposed += 1,
        }

        match previous {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Force-releases every live node, returning them with their handles.
    pub fn dispose_all(&mut self) -> Vec<(NodeHandle, T)> {
        let handles: Vec<NodeHandle> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, .. } => Some(NodeHandle {
                    index: index as u32,
                    generation: *generation,
                }),
                Slot::Vacant { .. } => None,
            })
            .collect();

        handles
            .into_iter()
            .filter_map(|handle| {
                self.finish(handle, Terminal::Disposed)
                    .map(|value| (handle, value))
            })
            .collect()
    }

    /// Returns the number of live nodes.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns true if there are no live nodes.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of nodes that ended naturally.
    pub fn ended_count(&self) -> u64 {
        self.ended
    }

    /// Number of nodes that were force-released.
    pub fn disposed_count(&self) -> u64 {
        self.disposed
    }
}

impl<T> Default for NodePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for NodePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePool")
            .field("id", &self.id)
            .field("live", &self.live)
            .field("ended", &self.ended)
            .field("disposed", &self.disposed)
            .finish()
    }
}
