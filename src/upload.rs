//! Upload Page Allocator
//!
//! Linear allocator for CPU-written, GPU-read memory (dynamic vertex data,
//! per-draw constants, staging for buffer copies).
//!
//! # Design
//!
//! ```text
//! ┌──────────────────── UploadAllocator ────────────────────┐
//! │ pages:     [UploadPage]   (mapped for allocator life)   │
//! │ available: [page index]   (pages not yet used)          │
//! │ current:   page index     (bump cursor lives here)      │
//! │                                                         │
//! │ allocate(size, align) → UploadAllocation                │
//! │ reset()               → every page available, cursor 0  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Memory Strategy
//!
//! - Pages are never unmapped or freed while the allocator lives; `reset`
//!   only rewinds cursors. Steady-state recording allocates nothing.
//! - A request never spans pages, so it must fit into one page.
//! - `reset` must only be called once the GPU finished reading every
//!   allocation. The owning [`CommandList`](crate::CommandList) does this
//!   when the reclamation worker resets it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;

use crate::errors::{EmberError, Result};
use crate::hal::{Device, GpuAddress, MappedPage, ResourceHandle};

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// A writable range of upload memory plus the GPU address it is visible at.
pub struct UploadAllocation<'a> {
    memory: &'a mut dyn MappedPage,
    offset: u64,
    size: u64,
    /// GPU address of the first byte.
    pub gpu_address: GpuAddress,
    /// The upload resource the range lives in.
    pub resource: ResourceHandle,
}

impl UploadAllocation<'_> {
    /// Byte offset of the range inside [`resource`](Self::resource).
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the range (the requested size rounded up to the alignment).
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy `bytes` to the start of the range.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is larger than the range.
    pub fn write(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() as u64 <= self.size,
            "upload write of {} bytes overflows a {}-byte allocation",
            bytes.len(),
            self.size
        );
        self.memory.write(self.offset, bytes);
    }

    /// Copy a slice of plain-old-data values to the start of the range.
    pub fn write_pod<T: Pod>(&mut self, data: &[T]) {
        self.write(bytemuck::cast_slice(data));
    }
}

impl fmt::Debug for UploadAllocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadAllocation")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("gpu_address", &self.gpu_address)
            .finish_non_exhaustive()
    }
}

/// One mapped page with a bump cursor.
struct UploadPage {
    memory: Box<dyn MappedPage>,
    cursor: u64,
}

impl UploadPage {
    fn capacity(&self) -> u64 {
        self.memory.size()
    }

    fn has_space(&self, size: u64, alignment: u64) -> bool {
        let aligned_size = align_up(size, alignment);
        let aligned_offset = align_up(self.cursor, alignment);
        aligned_offset
            .checked_add(aligned_size)
            .is_some_and(|end| end <= self.capacity())
    }

    /// Callers check [`has_space`](Self::has_space) first.
    fn allocate(&mut self, size: u64, alignment: u64) -> UploadAllocation<'_> {
        let aligned_size = align_up(size, alignment);
        let offset = align_up(self.cursor, alignment);
        self.cursor = offset + aligned_size;

        UploadAllocation {
            gpu_address: self.memory.gpu_address().offset(offset),
            resource: self.memory.resource(),
            memory: self.memory.as_mut(),
            offset,
            size: aligned_size,
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Bump allocator over a pool of fixed-size upload pages.
pub struct UploadAllocator {
    device: Arc<dyn Device>,
    page_size: u64,
    pages: Vec<UploadPage>,
    available: VecDeque<usize>,
    current: Option<usize>,
}

impl UploadAllocator {
    /// Create an allocator whose pages hold `page_size` bytes each.
    ///
    /// No memory is mapped until the first allocation.
    #[must_use]
    pub fn new(device: Arc<dyn Device>, page_size: u64) -> Self {
        Self {
            device,
            page_size,
            pages: Vec::new(),
            available: VecDeque::new(),
            current: None,
        }
    }

    /// Allocate `size` bytes aligned to `alignment`.
    ///
    /// Fails with [`EmberError::UploadTooLarge`] when the request cannot fit
    /// into a single page even after alignment.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<UploadAllocation<'_>> {
        let alignment = alignment.max(1);
        if align_up(size, alignment) > self.page_size {
            log::error!(
                "Upload request of {} bytes (alignment {}) exceeds the {}-byte page size",
                size,
                alignment,
                self.page_size
            );
            return Err(EmberError::UploadTooLarge {
                requested: size,
                page_size: self.page_size,
            });
        }

        let index = match self.current {
            Some(i) if self.pages[i].has_space(size, alignment) => i,
            _ => {
                let i = self.request_page()?;
                self.current = Some(i);
                i
            }
        };

        Ok(self.pages[index].allocate(size, alignment))
    }

    /// Make every page available again and rewind all cursors.
    ///
    /// Memory stays mapped for reuse.
    pub fn reset(&mut self) {
        self.current = None;
        self.available.clear();
        for (i, page) in self.pages.iter_mut().enumerate() {
            page.reset();
            self.available.push_back(i);
        }
    }

    #[inline]
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of pages mapped so far (used and available).
    #[inline]
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn request_page(&mut self) -> Result<usize> {
        if let Some(i) = self.available.pop_front() {
            return Ok(i);
        }

        let memory = self.device.create_upload_page(self.page_size).inspect_err(|e| {
            log::error!("Failed to map upload page: {e}");
        })?;
        self.pages.push(UploadPage { memory, cursor: 0 });
        log::info!(
            "Upload allocator grew to {} pages of {} bytes",
            self.pages.len(),
            self.page_size
        );
        Ok(self.pages.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless::HeadlessDevice;

    fn allocator(page_size: u64) -> UploadAllocator {
        UploadAllocator::new(Arc::new(HeadlessDevice::new()), page_size)
    }

    #[test]
    fn test_align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(255, 256), 256);
        assert_eq!(align_up(u64::MAX, 256), u64::MAX / 256 * 256);
    }

    #[test]
    fn test_allocations_respect_alignment() {
        let mut upload = allocator(1024);

        let a = upload.allocate(1, 1).unwrap();
        assert_eq!(a.offset(), 0);
        let base = a.gpu_address;

        let b = upload.allocate(1, 16).unwrap();
        assert_eq!(b.offset(), 16);
        assert_eq!(b.gpu_address, base.offset(16));

        let c = upload.allocate(16, 256).unwrap();
        assert_eq!(c.offset(), 256);
        assert_eq!(upload.page_count(), 1);
    }

    #[test]
    fn test_exact_page_size_fills_the_page() {
        let mut upload = allocator(256);

        let full = upload.allocate(256, 1).unwrap();
        assert_eq!(full.offset(), 0);
        assert_eq!(full.size(), 256);

        let current = upload.current.unwrap();
        assert!(!upload.pages[current].has_space(1, 1));

        // The next request lands on a fresh page.
        let next = upload.allocate(1, 1).unwrap();
        assert_eq!(next.offset(), 0);
        assert_eq!(upload.page_count(), 2);
    }

    #[test]
    fn test_oversized_request_is_rejected() {
        let mut upload = allocator(256);
        let err = upload.allocate(257, 1).unwrap_err();
        assert!(matches!(
            err,
            EmberError::UploadTooLarge {
                requested: 257,
                page_size: 256
            }
        ));
        assert_eq!(upload.page_count(), 0);
    }

    #[test]
    fn test_reset_reuses_pages_without_mapping_more() {
        let mut upload = allocator(128);
        upload.allocate(128, 1).unwrap();
        upload.allocate(128, 1).unwrap();
        assert_eq!(upload.page_count(), 2);

        upload.reset();
        let first = upload.allocate(64, 1).unwrap();
        assert_eq!(first.offset(), 0);
        upload.allocate(128, 1).unwrap();
        assert_eq!(upload.page_count(), 2);
    }

    #[test]
    fn test_writes_land_in_page_memory() {
        let device = HeadlessDevice::new();
        let mut upload = UploadAllocator::new(Arc::new(device.clone()), 64);

        upload.allocate(4, 1).unwrap().write(&[9, 9, 9, 9]);
        let mut alloc = upload.allocate(8, 4).unwrap();
        alloc.write_pod(&[0x0403_0201u32, 0x0807_0605]);
        let resource = alloc.resource;

        let bytes = device.read_buffer(resource);
        assert_eq!(&bytes[..12], &[9, 9, 9, 9, 1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
