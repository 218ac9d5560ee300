//! Dynamic Descriptor Stager
//!
//! Batches per-draw descriptor writes into GPU-visible heaps.
//!
//! ```text
//!  stage_descriptors(root, off, handles)     commit_staged_descriptors()
//!  ─────────────────────────────────────     ───────────────────────────────
//!  CPU staging array                          GPU-visible heap (current)
//!  ┌────────┬────────────┬──────┐            ┌──────┬──────┬──────────────┐
//!  │ root 1 │   root 3   │root 5│ ─ dirty ─► │ used │ new  │     free     │
//!  └────────┴────────────┴──────┘   ranges   └──────┴──────┴──────────────┘
//!                                                   ▲ set_root_descriptor_table
//! ```
//!
//! Handles are staged into a CPU-side array laid out by the current root
//! signature. At draw time only the dirty tables are copied into the current
//! GPU-visible heap, then bound. When the heap runs out of room a new one is
//! taken from the pool and every table is re-marked dirty, since a heap
//! switch invalidates the ranges copied into the previous heap.

use std::collections::VecDeque;
use std::sync::Arc;

use smallvec::SmallVec;

use super::layout::{MAX_ROOT_PARAMETERS, RootSignature};
use crate::errors::{EmberError, Result};
use crate::hal::{
    BindPoint, CommandEncoder, CpuDescriptorHandle, DescriptorHeap, DescriptorHeapId,
    DescriptorHeapKind, Device, GpuDescriptorHandle,
};

/// The shader-visible heaps currently bound on a command list, one slot per
/// shader-visible kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundDescriptorHeaps {
    heaps: [Option<DescriptorHeapId>; 2],
}

impl BoundDescriptorHeaps {
    /// Returns `true` when the binding changed.
    ///
    /// # Panics
    ///
    /// Panics for RTV and DSV heaps, which are never shader visible.
    pub fn set(&mut self, kind: DescriptorHeapKind, heap: DescriptorHeapId) -> bool {
        assert!(kind.is_shader_visible(), "{kind:?} heaps cannot be bound");
        let slot = &mut self.heaps[kind.index()];
        let changed = *slot != Some(heap);
        *slot = Some(heap);
        changed
    }

    #[must_use]
    pub fn get(&self, kind: DescriptorHeapKind) -> Option<DescriptorHeapId> {
        self.heaps.get(kind.index()).copied().flatten()
    }

    #[must_use]
    pub fn ids(&self) -> SmallVec<[DescriptorHeapId; 2]> {
        self.heaps.iter().flatten().copied().collect()
    }

    pub fn clear(&mut self) {
        self.heaps = [None; 2];
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TableCache {
    count: u32,
    staging_base: u32,
}

#[derive(Debug, Clone, Copy)]
struct CurrentHeap {
    pool_index: usize,
    cpu_cursor: CpuDescriptorHandle,
    gpu_cursor: GpuDescriptorHandle,
    free_handles: u32,
}

/// Stages and commits descriptors of one shader-visible heap kind.
pub struct DynamicDescriptorHeap {
    device: Arc<dyn Device>,
    kind: DescriptorHeapKind,
    descriptors_per_heap: u32,
    increment: u32,

    staging: Vec<CpuDescriptorHandle>,
    tables: [TableCache; MAX_ROOT_PARAMETERS],
    table_mask: u32,
    stale_mask: u32,

    heap_pool: Vec<DescriptorHeap>,
    available: VecDeque<usize>,
    current: Option<CurrentHeap>,
}

impl DynamicDescriptorHeap {
    /// # Panics
    ///
    /// Panics if `kind` is not shader visible.
    #[must_use]
    pub fn new(device: Arc<dyn Device>, kind: DescriptorHeapKind, descriptors_per_heap: u32) -> Self {
        assert!(
            kind.is_shader_visible(),
            "dynamic descriptor heaps must be CBV/SRV/UAV or sampler, got {kind:?}"
        );
        let increment = device.descriptor_increment(kind);
        Self {
            device,
            kind,
            descriptors_per_heap,
            increment,
            staging: vec![CpuDescriptorHandle::NULL; descriptors_per_heap as usize],
            tables: [TableCache::default(); MAX_ROOT_PARAMETERS],
            table_mask: 0,
            stale_mask: 0,
            heap_pool: Vec::new(),
            available: VecDeque::new(),
            current: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// Lay out the staging array for `signature`'s tables of this kind.
    ///
    /// Clears all dirty bits; previously staged handles are discarded.
    pub fn parse_root_signature(&mut self, signature: &RootSignature) -> Result<()> {
        self.stale_mask = 0;
        self.tables = [TableCache::default(); MAX_ROOT_PARAMETERS];
        self.table_mask = signature.descriptor_table_mask(self.kind);

        let mut offset = 0u32;
        let mut mask = self.table_mask;
        while mask != 0 {
            let root_index = mask.trailing_zeros();
            mask &= mask - 1;

            let count = signature.num_descriptors(root_index);
            self.tables[root_index as usize] = TableCache {
                count,
                staging_base: offset,
            };
            offset = offset.checked_add(count).ok_or_else(|| {
                self.table_mask = 0;
                EmberError::InvalidRootSignature(format!(
                    "{:?} descriptor tables span more than u32::MAX descriptors",
                    self.kind
                ))
            })?;
        }

        if offset > self.descriptors_per_heap {
            log::error!(
                "Root signature needs {} {:?} descriptors, dynamic heaps hold {}",
                offset,
                self.kind,
                self.descriptors_per_heap
            );
            self.table_mask = 0;
            return Err(EmberError::DynamicDescriptorsExhausted {
                kind: self.kind,
                requested: offset,
                capacity: self.descriptors_per_heap,
            });
        }
        Ok(())
    }

    /// Copy `handles` into the staging range of the table at `root_index`,
    /// starting `offset` descriptors into the table.
    ///
    /// # Panics
    ///
    /// Panics if `root_index` is not a table of this kind in the current root
    /// signature, or the write leaves the table's declared range.
    pub fn stage_descriptors(&mut self, root_index: u32, offset: u32, handles: &[CpuDescriptorHandle]) {
        assert!(
            (root_index as usize) < MAX_ROOT_PARAMETERS && self.table_mask & (1 << root_index) != 0,
            "root index {root_index} is not a {:?} descriptor table",
            self.kind
        );
        let table = self.tables[root_index as usize];
        let end = u64::from(offset) + handles.len() as u64;
        assert!(
            end <= u64::from(table.count),
            "staging descriptors [{offset}, {end}) outside the {} declared at root index {root_index}",
            table.count
        );

        let start = (table.staging_base + offset) as usize;
        self.staging[start..start + handles.len()].copy_from_slice(handles);
        self.stale_mask |= 1 << root_index;
    }

    /// Descriptors that the next commit would copy.
    #[must_use]
    pub fn stale_descriptor_count(&self) -> u32 {
        self.count_in(self.stale_mask)
    }

    /// Copy every dirty table into the GPU-visible heap and bind it.
    pub fn commit_staged_descriptors(
        &mut self,
        encoder: &mut dyn CommandEncoder,
        bound: &mut BoundDescriptorHeaps,
        bind_point: BindPoint,
    ) -> Result<()> {
        let needed = self.stale_descriptor_count();
        if needed == 0 {
            return Ok(());
        }

        if self.current.is_none_or(|heap| heap.free_handles < needed) {
            self.switch_heap(encoder, bound, needed)?;
        }
        let Some(heap) = self.current.as_mut() else {
            return Ok(());
        };

        let mut mask = self.stale_mask;
        while mask != 0 {
            let root_index = mask.trailing_zeros();
            mask &= mask - 1;

            let table = self.tables[root_index as usize];
            let start = table.staging_base as usize;
            let sources = &self.staging[start..start + table.count as usize];

            self.device
                .copy_descriptors(self.kind, heap.cpu_cursor, sources);
            encoder.set_root_descriptor_table(bind_point, root_index, heap.gpu_cursor);

            heap.cpu_cursor = heap.cpu_cursor.offset(table.count, self.increment);
            heap.gpu_cursor = heap.gpu_cursor.offset(table.count, self.increment);
            heap.free_handles -= table.count;
        }

        self.stale_mask = 0;
        Ok(())
    }

    /// Copy a single CPU descriptor into the GPU-visible heap and return its
    /// GPU handle, for APIs that take a GPU handle directly (UAV clears).
    pub fn copy_descriptor(
        &mut self,
        encoder: &mut dyn CommandEncoder,
        bound: &mut BoundDescriptorHeaps,
        cpu: CpuDescriptorHandle,
    ) -> Result<GpuDescriptorHandle> {
        if self.current.is_none_or(|heap| heap.free_handles < 1) {
            self.switch_heap(encoder, bound, 1)?;
        }
        let Some(heap) = self.current.as_mut() else {
            return Err(EmberError::DynamicDescriptorsExhausted {
                kind: self.kind,
                requested: 1,
                capacity: self.descriptors_per_heap,
            });
        };

        self.device.copy_descriptors(self.kind, heap.cpu_cursor, &[cpu]);
        let gpu = heap.gpu_cursor;
        heap.cpu_cursor = heap.cpu_cursor.offset(1, self.increment);
        heap.gpu_cursor = heap.gpu_cursor.offset(1, self.increment);
        heap.free_handles -= 1;
        Ok(gpu)
    }

    /// Return every heap to the pool and forget the root signature layout.
    ///
    /// Only call once the GPU finished with the command list.
    pub fn reset(&mut self) {
        self.available = (0..self.heap_pool.len()).collect();
        self.current = None;
        self.table_mask = 0;
        self.stale_mask = 0;
        self.tables = [TableCache::default(); MAX_ROOT_PARAMETERS];
        self.staging.fill(CpuDescriptorHandle::NULL);
    }

    /// Heaps created so far.
    #[inline]
    #[must_use]
    pub fn heap_count(&self) -> usize {
        self.heap_pool.len()
    }

    fn count_in(&self, mask: u32) -> u32 {
        let mut total = 0;
        let mut mask = mask;
        while mask != 0 {
            let root_index = mask.trailing_zeros();
            mask &= mask - 1;
            total += self.tables[root_index as usize].count;
        }
        total
    }

    fn switch_heap(
        &mut self,
        encoder: &mut dyn CommandEncoder,
        bound: &mut BoundDescriptorHeaps,
        needed: u32,
    ) -> Result<()> {
        if needed > self.descriptors_per_heap {
            log::error!(
                "A single commit needs {} {:?} descriptors, dynamic heaps hold {}",
                needed,
                self.kind,
                self.descriptors_per_heap
            );
            return Err(EmberError::DynamicDescriptorsExhausted {
                kind: self.kind,
                requested: needed,
                capacity: self.descriptors_per_heap,
            });
        }

        let pool_index = self.request_heap()?;
        let heap = self.heap_pool[pool_index];
        let gpu_start = heap.gpu_start.ok_or_else(|| {
            EmberError::creation("dynamic descriptor heap", "heap is not shader visible")
        })?;

        self.current = Some(CurrentHeap {
            pool_index,
            cpu_cursor: heap.cpu_start,
            gpu_cursor: gpu_start,
            free_handles: heap.capacity,
        });
        if bound.set(self.kind, heap.id) {
            encoder.set_descriptor_heaps(&bound.ids());
        }

        // The previous heap's copies are no longer visible.
        self.stale_mask = self.table_mask;
        Ok(())
    }

    fn request_heap(&mut self) -> Result<usize> {
        if let Some(index) = self.available.pop_front() {
            return Ok(index);
        }

        let heap = self
            .device
            .create_descriptor_heap(self.kind, self.descriptors_per_heap, true)
            .inspect_err(|e| log::error!("Failed to create dynamic {:?} heap: {e}", self.kind))?;
        self.heap_pool.push(heap);
        log::info!(
            "Dynamic {:?} descriptor heaps grew to {} ({} slots each)",
            self.kind,
            self.heap_pool.len(),
            self.descriptors_per_heap
        );
        Ok(self.heap_pool.len() - 1)
    }

    #[cfg(test)]
    fn current_pool_index(&self) -> Option<usize> {
        self.current.map(|heap| heap.pool_index)
    }
}

impl Drop for DynamicDescriptorHeap {
    fn drop(&mut self) {
        for heap in &self.heap_pool {
            self.device.destroy_descriptor_heap(heap.id);
        }
    }
}
