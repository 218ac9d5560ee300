//! Descriptor Block Allocator
//!
//! Hands out contiguous blocks of CPU descriptors of one heap kind from a
//! growing pool of [`DescriptorPage`]s.
//!
//! ```text
//! ┌─────────────── DescriptorAllocator (kind) ───────────────┐
//! │ Mutex {                                                   │
//! │   pages:     [DescriptorPage]  ←── creation order         │
//! │   available: {page index}      ←── pages with free slots  │
//! │ }                                                         │
//! │ clock: FrameClock              ←── stamps frees on drop   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`DescriptorAllocation`] refers to its page by index, never by
//! reference: pages live exactly as long as the allocator. Dropping the
//! allocation queues its range as stale; the range only becomes reusable
//! after [`DescriptorAllocator::release_stale_descriptors`] is called with
//! a frame at or past the one it was freed in.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::page::DescriptorPage;
use crate::errors::{EmberError, Result};
use crate::hal::{CpuDescriptorHandle, DescriptorHeapKind, Device};
use crate::settings::GpuSettings;
use crate::token::{FrameClock, FrameNumber};

struct PoolState {
    pages: Vec<DescriptorPage>,
    available: BTreeSet<usize>,
}

/// Pool of CPU descriptor pages for one [`DescriptorHeapKind`].
pub struct DescriptorAllocator {
    kind: DescriptorHeapKind,
    device: Arc<dyn Device>,
    descriptors_per_page: u32,
    max_descriptors_per_page: u32,
    clock: Arc<FrameClock>,
    state: Mutex<PoolState>,
}

impl DescriptorAllocator {
    #[must_use]
    pub fn new(
        device: Arc<dyn Device>,
        kind: DescriptorHeapKind,
        settings: &GpuSettings,
        clock: Arc<FrameClock>,
    ) -> Self {
        Self {
            kind,
            device,
            descriptors_per_page: settings.descriptors_per_page,
            max_descriptors_per_page: settings.max_descriptors_per_page,
            clock,
            state: Mutex::new(PoolState {
                pages: Vec::new(),
                available: BTreeSet::new(),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// Allocate `count` contiguous descriptors.
    ///
    /// Never waits for the GPU. Pages are tried in creation order; if none
    /// has a large enough block, a page of `max(descriptors_per_page, count)`
    /// slots is created.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn allocate(self: &Arc<Self>, count: u32) -> Result<DescriptorAllocation> {
        assert!(count > 0, "descriptor allocations must not be empty");
        if count > self.max_descriptors_per_page {
            log::error!(
                "{:?} descriptor request of {} exceeds the page limit of {}",
                self.kind,
                count,
                self.max_descriptors_per_page
            );
            return Err(EmberError::DescriptorRequestTooLarge {
                kind: self.kind,
                requested: count,
                max: self.max_descriptors_per_page,
            });
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut exhausted: SmallVec<[usize; 4]> = SmallVec::new();
        let mut found = None;
        for &index in &state.available {
            let page = &mut state.pages[index];
            if !page.has_space(count) {
                continue;
            }
            if let Some(offset) = page.allocate(count) {
                if page.num_free_handles() == 0 {
                    exhausted.push(index);
                }
                found = Some((index, offset));
                break;
            }
        }
        for index in exhausted {
            state.available.remove(&index);
        }

        let (page_index, offset) = match found {
            Some(hit) => hit,
            None => {
                let capacity = self.descriptors_per_page.max(count);
                let mut page = DescriptorPage::new(self.device.clone(), self.kind, capacity)
                    .inspect_err(|e| {
                        log::error!("Failed to create {:?} descriptor page: {e}", self.kind);
                    })?;
                let offset = page.allocate(count).ok_or_else(|| {
                    EmberError::creation("descriptor page", "fresh page cannot hold request")
                })?;

                let index = state.pages.len();
                if page.num_free_handles() > 0 {
                    state.available.insert(index);
                }
                state.pages.push(page);
                log::info!(
                    "{:?} descriptor pool grew to {} pages (new page: {} slots)",
                    self.kind,
                    state.pages.len(),
                    capacity
                );
                (index, offset)
            }
        };

        let page = &state.pages[page_index];
        Ok(DescriptorAllocation {
            base: page.handle_at(offset),
            count,
            increment: page.increment(),
            page: page_index,
            offset,
            pool: self.clone(),
        })
    }

    /// Return every range freed at or before `frame` to its page.
    ///
    /// Call once per engine frame with the newest frame the GPU retired.
    pub fn release_stale_descriptors(&self, frame: FrameNumber) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut released = 0;
        for (index, page) in state.pages.iter_mut().enumerate() {
            released += page.release_stale(frame);
            if page.num_free_handles() > 0 {
                state.available.insert(index);
            }
        }
        if released > 0 {
            log::trace!(
                "{:?}: released {} stale descriptors up to {}",
                self.kind,
                released,
                frame
            );
        }
    }

    fn free(&self, page: usize, offset: u32, count: u32) {
        let frame = self.clock.current();
        self.state.lock().pages[page].free(offset, count, frame);
    }

    // ── Introspection ──────────────────────────────────────────────────────

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    #[must_use]
    pub fn page_capacity(&self, page: usize) -> u32 {
        self.state.lock().pages[page].capacity()
    }

    /// Slots available for allocation across all pages (stale ones excluded).
    #[must_use]
    pub fn num_free_handles(&self) -> u32 {
        self.state
            .lock()
            .pages
            .iter()
            .map(DescriptorPage::num_free_handles)
            .sum()
    }

    /// Number of free blocks in `page`; 1 means fully coalesced.
    #[must_use]
    pub fn free_block_count(&self, page: usize) -> usize {
        self.state.lock().pages[page].free_list().block_count()
    }

    /// `(offset, size)` of every free block of `page`, in offset order.
    #[must_use]
    pub fn free_blocks(&self, page: usize) -> Vec<(u32, u32)> {
        self.state.lock().pages[page].free_list().blocks().collect()
    }

    /// Whether `page` currently sits in the available index.
    #[must_use]
    pub fn is_page_available(&self, page: usize) -> bool {
        self.state.lock().available.contains(&page)
    }
}

impl fmt::Debug for DescriptorAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorAllocator")
            .field("kind", &self.kind)
            .field("descriptors_per_page", &self.descriptors_per_page)
            .finish_non_exhaustive()
    }
}

/// A contiguous block of CPU descriptors.
///
/// Dropping it frees the block, stamped with the allocator clock's current
/// frame.
pub struct DescriptorAllocation {
    base: CpuDescriptorHandle,
    count: u32,
    increment: u32,
    page: usize,
    offset: u32,
    pool: Arc<DescriptorAllocator>,
}

impl DescriptorAllocation {
    /// Handle of the `index`-th descriptor in the block.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn handle(&self, index: u32) -> CpuDescriptorHandle {
        assert!(
            index < self.count,
            "descriptor index {index} out of range for a block of {}",
            self.count
        );
        self.base.offset(index, self.increment)
    }

    #[inline]
    #[must_use]
    pub fn base(&self) -> CpuDescriptorHandle {
        self.base
    }

    #[inline]
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.pool.kind
    }

    /// Index of the owning page in its allocator.
    #[inline]
    #[must_use]
    pub fn page_index(&self) -> usize {
        self.page
    }

    /// Slot offset of the block inside its page.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

impl Drop for DescriptorAllocation {
    fn drop(&mut self) {
        self.pool.free(self.page, self.offset, self.count);
    }
}

impl fmt::Debug for DescriptorAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorAllocation")
            .field("kind", &self.pool.kind)
            .field("page", &self.page)
            .field("offset", &self.offset)
            .field("count", &self.count)
            .finish()
    }
}
