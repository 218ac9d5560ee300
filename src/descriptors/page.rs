//! Descriptor Page
//!
//! A single CPU descriptor heap plus the free list that sub-allocates it.
//!
//! # Free List
//!
//! Free blocks are indexed twice:
//!
//! ```text
//! by_offset: BTreeMap<offset, size>      ── neighbour lookup for coalescing
//! by_size:   BTreeSet<(size, offset)>    ── smallest block ≥ n (best fit)
//! ```
//!
//! The offset stored in `by_size` is the back-reference into `by_offset`, so
//! both indices can always be updated together in O(log n).
//!
//! Frees are deferred: a freed range waits in a FIFO of stale entries,
//! stamped with the frame it was freed in, until
//! [`release_stale`](DescriptorPage::release_stale) is called with a frame
//! the GPU has retired.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::errors::Result;
use crate::hal::{CpuDescriptorHandle, DescriptorHeap, DescriptorHeapKind, Device};
use crate::token::FrameNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StaleDescriptors {
    offset: u32,
    size: u32,
    frame: FrameNumber,
}

/// Offset-and-size indexed free list over `[0, capacity)`.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    by_offset: BTreeMap<u32, u32>,
    by_size: BTreeSet<(u32, u32)>,
}

impl FreeList {
    pub(crate) fn with_capacity(capacity: u32) -> Self {
        let mut list = Self::default();
        if capacity > 0 {
            list.insert(0, capacity);
        }
        list
    }

    fn insert(&mut self, offset: u32, size: u32) {
        self.by_offset.insert(offset, size);
        self.by_size.insert((size, offset));
    }

    fn remove(&mut self, offset: u32, size: u32) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(size, offset));
    }

    /// Whether a single block of at least `count` slots exists.
    pub(crate) fn has_space(&self, count: u32) -> bool {
        self.by_size.range((count, 0)..).next().is_some()
    }

    /// Take `count` slots from the smallest block that fits.
    pub(crate) fn allocate(&mut self, count: u32) -> Option<u32> {
        let &(size, offset) = self.by_size.range((count, 0)..).next()?;
        self.remove(offset, size);
        if size > count {
            self.insert(offset + count, size - count);
        }
        Some(offset)
    }

    /// Return `[offset, offset + size)` and merge it with adjacent blocks.
    pub(crate) fn free(&mut self, offset: u32, size: u32) {
        let mut start = offset;
        let mut len = size;

        let left = self
            .by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s))
            .filter(|&(o, s)| o + s == offset);
        let right = self
            .by_offset
            .range(offset + size..)
            .next()
            .map(|(&o, &s)| (o, s))
            .filter(|&(o, _)| o == offset + size);

        if let Some((o, s)) = left {
            self.remove(o, s);
            start = o;
            len += s;
        }
        if let Some((o, s)) = right {
            self.remove(o, s);
            len += s;
        }

        self.insert(start, len);
    }

    pub(crate) fn block_count(&self) -> usize {
        self.by_offset.len()
    }

    pub(crate) fn total(&self) -> u32 {
        self.by_offset.values().sum()
    }

    pub(crate) fn blocks(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.by_offset.iter().map(|(&o, &s)| (o, s))
    }
}

/// One native CPU descriptor heap managed by a
/// [`DescriptorAllocator`](super::DescriptorAllocator).
pub(crate) struct DescriptorPage {
    device: Arc<dyn Device>,
    heap: DescriptorHeap,
    free_list: FreeList,
    stale: VecDeque<StaleDescriptors>,
    num_free_handles: u32,
}

impl DescriptorPage {
    pub(crate) fn new(
        device: Arc<dyn Device>,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<Self> {
        let heap = device.create_descriptor_heap(kind, capacity, false)?;
        Ok(Self {
            device,
            heap,
            free_list: FreeList::with_capacity(capacity),
            stale: VecDeque::new(),
            num_free_handles: capacity,
        })
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.heap.capacity
    }

    #[inline]
    pub(crate) fn increment(&self) -> u32 {
        self.heap.increment
    }

    /// Free slots that can be handed out right now (stale ones excluded).
    #[inline]
    pub(crate) fn num_free_handles(&self) -> u32 {
        self.num_free_handles
    }

    #[inline]
    pub(crate) fn has_space(&self, count: u32) -> bool {
        self.free_list.has_space(count)
    }

    pub(crate) fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    pub(crate) fn handle_at(&self, offset: u32) -> CpuDescriptorHandle {
        self.heap.cpu_start.offset(offset, self.heap.increment)
    }

    /// Returns the slot offset of the new block, or `None` if no single
    /// free block holds `count` slots.
    pub(crate) fn allocate(&mut self, count: u32) -> Option<u32> {
        if count > self.num_free_handles {
            return None;
        }
        let offset = self.free_list.allocate(count)?;
        self.num_free_handles -= count;
        Some(offset)
    }

    /// Queue `[offset, offset + count)` for release once `frame` retires.
    pub(crate) fn free(&mut self, offset: u32, count: u32, frame: FrameNumber) {
        self.stale.push_back(StaleDescriptors {
            offset,
            size: count,
            frame,
        });
    }

    /// Return every stale range freed at or before `frame` to the free list.
    pub(crate) fn release_stale(&mut self, frame: FrameNumber) -> u32 {
        let mut released = 0;
        while let Some(entry) = self.stale.front().copied() {
            if entry.frame > frame {
                break;
            }
            self.stale.pop_front();
            self.free_list.free(entry.offset, entry.size);
            self.num_free_handles += entry.size;
            released += entry.size;
        }
        debug_assert_eq!(self.free_list.total(), self.num_free_handles);
        released
    }

    #[cfg(test)]
    pub(crate) fn stale_count(&self) -> usize {
        self.stale.len()
    }
}

impl Drop for DescriptorPage {
    fn drop(&mut self) {
        self.device.destroy_descriptor_heap(self.heap.id);
    }
}
