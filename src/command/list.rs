//! Command List
//!
//! A recording session: one native encoder plus everything needed to record
//! into it without touching shared state.
//!
//! ```text
//! ┌──────────────────────── CommandList ────────────────────────┐
//! │ encoder         Box<dyn CommandEncoder>                     │
//! │ tracker         ResourceStateTracker   (barriers, pending)  │
//! │ upload          UploadAllocator        (dynamic data)       │
//! │ dynamic_heaps   [CBV/SRV/UAV, Sampler] DynamicDescriptorHeap│
//! │ staging_pages   oversized copy sources, freed on reset      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every draw and dispatch first flushes queued barriers, then commits
//! staged descriptors, then records the native call.
//!
//! Lists are handed out by a [`CommandQueue`](crate::CommandQueue) and come
//! back to it on submission; the queue's reclamation worker resets them once
//! the GPU has finished.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::Pod;

use super::queue::PoolSlot;
use crate::buffer::{GpuBuffer, IndexElement};
use crate::descriptors::{BoundDescriptorHeaps, DynamicDescriptorHeap, RootSignature};
use crate::errors::{EmberError, Result};
use crate::hal::{
    BindPoint, CommandEncoder, CpuDescriptorHandle, DescriptorHeapKind, Device,
    GpuAddress, GpuDescriptorHandle, HeapType, IndexBufferView, MappedPage, QueueKind, ResourceDesc,
    ResourceHandle, ResourceStates, RootSignatureId, Subresource, VertexBufferView,
};
use crate::settings::GpuSettings;
use crate::state::{GlobalResourceStates, GlobalStatesGuard, ResourceStateTracker};
use crate::upload::{UploadAllocation, UploadAllocator};

/// Alignment of dynamic constant buffers.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

static NEXT_LIST_ID: AtomicU64 = AtomicU64::new(1);

/// A recording session.
pub struct CommandList {
    id: u64,
    kind: QueueKind,
    device: Arc<dyn Device>,
    global: Arc<GlobalResourceStates>,

    encoder: Box<dyn CommandEncoder>,
    tracker: ResourceStateTracker,
    upload: UploadAllocator,
    dynamic_heaps: [DynamicDescriptorHeap; 2],
    bound_heaps: BoundDescriptorHeaps,
    root_signature: Option<(BindPoint, RootSignatureId)>,

    staging_pages: Vec<Box<dyn MappedPage>>,
    /// Set for lists handed out by a queue.
    pub(super) pool_slot: Option<PoolSlot>,
}

impl CommandList {
    pub fn new(
        device: Arc<dyn Device>,
        kind: QueueKind,
        settings: &GpuSettings,
        global: Arc<GlobalResourceStates>,
    ) -> Result<Self> {
        let encoder = device.create_command_encoder(kind).inspect_err(|e| {
            log::error!("Failed to create {kind:?} command list: {e}");
        })?;

        let dynamic_heaps = DescriptorHeapKind::SHADER_VISIBLE.map(|heap_kind| {
            DynamicDescriptorHeap::new(
                device.clone(),
                heap_kind,
                settings.dynamic_heap_capacity(heap_kind),
            )
        });

        Ok(Self {
            id: NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            upload: UploadAllocator::new(device.clone(), settings.upload_page_size),
            device,
            global,
            encoder,
            tracker: ResourceStateTracker::new(),
            dynamic_heaps,
            bound_heaps: BoundDescriptorHeaps::default(),
            root_signature: None,
            staging_pages: Vec::new(),
            pool_slot: None,
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// The native recording handle.
    #[inline]
    #[must_use]
    pub fn encoder(&self) -> &dyn CommandEncoder {
        self.encoder.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn tracker(&self) -> &ResourceStateTracker {
        &self.tracker
    }

    #[must_use]
    pub fn dynamic_heap(&self, kind: DescriptorHeapKind) -> &DynamicDescriptorHeap {
        assert!(kind.is_shader_visible(), "no dynamic {kind:?} heap");
        &self.dynamic_heaps[kind.index()]
    }

    // ========================================================================
    // Barriers
    // ========================================================================

    /// Transition `resource` to `after`. The barrier is queued until the next
    /// flush, draw, dispatch or copy.
    pub fn transition_barrier(
        &mut self,
        resource: ResourceHandle,
        after: ResourceStates,
        subresource: Subresource,
    ) {
        self.tracker.transition_resource(resource, after, subresource);
    }

    /// `None` orders all UAV accesses.
    pub fn uav_barrier(&mut self, resource: Option<ResourceHandle>) {
        self.tracker.uav_barrier(resource);
    }

    pub fn aliasing_barrier(&mut self, before: Option<ResourceHandle>, after: Option<ResourceHandle>) {
        self.tracker.aliasing_barrier(before, after);
    }

    /// Record every queued barrier now. Returns how many were recorded.
    pub fn flush_resource_barriers(&mut self) -> u32 {
        self.tracker.flush_resource_barriers(self.encoder.as_mut())
    }

    // ========================================================================
    // Copies
    // ========================================================================

    pub fn copy_resource(&mut self, dst: ResourceHandle, src: ResourceHandle) {
        self.transition_barrier(dst, ResourceStates::COPY_DEST, Subresource::All);
        self.transition_barrier(src, ResourceStates::COPY_SOURCE, Subresource::All);
        self.flush_resource_barriers();
        self.encoder.copy_resource(dst, src);
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: ResourceHandle,
        dst_offset: u64,
        src: ResourceHandle,
        src_offset: u64,
        num_bytes: u64,
    ) {
        self.transition_barrier(dst, ResourceStates::COPY_DEST, Subresource::All);
        self.transition_barrier(src, ResourceStates::COPY_SOURCE, Subresource::All);
        self.flush_resource_barriers();
        self.encoder
            .copy_buffer_region(dst, dst_offset, src, src_offset, num_bytes);
    }

    /// Create a device-local buffer and record a copy of `data` into it.
    ///
    /// The buffer is registered with the global state table in `COMMON` and
    /// left in `COPY_DEST`. Empty `data` yields a null buffer and records
    /// nothing. Data larger than one upload page is staged through a
    /// dedicated upload resource released when the list is reset.
    pub fn copy_buffer<T: Pod>(&mut self, data: &[T]) -> Result<GpuBuffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Ok(GpuBuffer::null());
        }
        let size = bytes.len() as u64;

        let resource = self
            .device
            .create_resource(
                &ResourceDesc::buffer(size),
                HeapType::Default,
                ResourceStates::COMMON,
            )
            .inspect_err(|e| log::error!("Failed to create {size}-byte buffer: {e}"))?;
        self.global.register(resource, ResourceStates::COMMON);

        if let Err(e) = self.record_buffer_upload(resource, bytes) {
            self.global.unregister(resource);
            self.device.destroy_resource(resource);
            return Err(e);
        }

        let gpu_address = self.device.gpu_address(resource).unwrap_or_default();
        Ok(GpuBuffer::new(resource, size, gpu_address))
    }

    fn record_buffer_upload(&mut self, resource: ResourceHandle, bytes: &[u8]) -> Result<()> {
        let size = bytes.len() as u64;
        if size <= self.upload.page_size() {
            let mut staging = self.upload.allocate(size, 1)?;
            staging.write(bytes);
            let (src, src_offset) = (staging.resource, staging.offset());
            self.transition_barrier(resource, ResourceStates::COPY_DEST, Subresource::All);
            self.flush_resource_barriers();
            self.encoder
                .copy_buffer_region(resource, 0, src, src_offset, size);
        } else {
            let mut page = self.device.create_upload_page(size).inspect_err(|e| {
                log::error!("Failed to create {size}-byte staging buffer: {e}");
            })?;
            page.write(0, bytes);
            self.transition_barrier(resource, ResourceStates::COPY_DEST, Subresource::All);
            self.flush_resource_barriers();
            self.encoder
                .copy_buffer_region(resource, 0, page.resource(), 0, size);
            log::debug!(
                "Command list {} staged {} bytes through a dedicated upload buffer",
                self.id,
                size
            );
            self.staging_pages.push(page);
        }
        Ok(())
    }

    // ========================================================================
    // Dynamic data
    // ========================================================================

    /// Allocate transient upload memory that stays valid until the list is
    /// reset.
    pub fn allocate_upload(&mut self, size: u64, alignment: u64) -> Result<UploadAllocation<'_>> {
        self.upload.allocate(size, alignment)
    }

    /// Upload `vertices` and bind them to vertex buffer `slot`.
    pub fn set_dynamic_vertex_buffer<T: Pod>(&mut self, slot: u32, vertices: &[T]) -> Result<()> {
        let (location, size_in_bytes) = self.upload_slice(vertices, align_of::<T>() as u64)?;
        self.encoder.set_vertex_buffers(
            slot,
            &[VertexBufferView {
                location,
                size_in_bytes,
                stride_in_bytes: size_of::<T>() as u32,
            }],
        );
        Ok(())
    }

    /// Upload `indices` and bind them as the index buffer.
    pub fn set_dynamic_index_buffer<T: IndexElement>(&mut self, indices: &[T]) -> Result<()> {
        let (location, size_in_bytes) = self.upload_slice(indices, align_of::<T>() as u64)?;
        self.encoder.set_index_buffer(&IndexBufferView {
            location,
            size_in_bytes,
            format: T::FORMAT,
        });
        Ok(())
    }

    /// Upload `data` as a 256-byte aligned constant buffer and bind it as the
    /// root CBV at `root_index`.
    pub fn set_graphics_dynamic_constant_buffer<T: Pod>(&mut self, root_index: u32, data: &T) -> Result<()> {
        let (location, _) =
            self.upload_slice(std::slice::from_ref(data), CONSTANT_BUFFER_ALIGNMENT)?;
        self.encoder
            .set_root_constant_buffer_view(BindPoint::Graphics, root_index, location);
        Ok(())
    }

    /// Set inline root constants.
    pub fn set_32bit_constants(&mut self, bind_point: BindPoint, root_index: u32, values: &[u32]) {
        self.encoder
            .set_root_constants(bind_point, root_index, values, 0);
    }

    fn upload_slice<T: Pod>(&mut self, data: &[T], alignment: u64) -> Result<(GpuAddress, u32)> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as u64;
        let size_in_bytes = u32::try_from(size).map_err(|_| EmberError::UploadTooLarge {
            requested: size,
            page_size: self.upload.page_size(),
        })?;

        let mut allocation = self.upload.allocate(size, alignment)?;
        allocation.write(bytes);
        Ok((allocation.gpu_address, size_in_bytes))
    }

    // ========================================================================
    // Binding
    // ========================================================================

    pub fn set_graphics_root_signature(&mut self, signature: &RootSignature) -> Result<()> {
        self.set_root_signature(BindPoint::Graphics, signature)
    }

    pub fn set_compute_root_signature(&mut self, signature: &RootSignature) -> Result<()> {
        self.set_root_signature(BindPoint::Compute, signature)
    }

    fn set_root_signature(&mut self, bind_point: BindPoint, signature: &RootSignature) -> Result<()> {
        let key = (bind_point, signature.id());
        if self.root_signature == Some(key) {
            return Ok(());
        }
        for heap in &mut self.dynamic_heaps {
            heap.parse_root_signature(signature)?;
        }
        self.encoder.set_root_signature(bind_point, signature.id());
        self.root_signature = Some(key);
        Ok(())
    }

    /// Transition `resource` to a shader-readable state and stage its SRV.
    pub fn set_shader_resource_view(
        &mut self,
        root_index: u32,
        offset: u32,
        resource: ResourceHandle,
        view: CpuDescriptorHandle,
    ) {
        self.transition_barrier(resource, ResourceStates::ALL_SHADER_RESOURCE, Subresource::All);
        self.stage_descriptors(DescriptorHeapKind::CbvSrvUav, root_index, offset, &[view]);
    }

    /// Transition `resource` to `UNORDERED_ACCESS` and stage its UAV.
    pub fn set_unordered_access_view(
        &mut self,
        root_index: u32,
        offset: u32,
        resource: ResourceHandle,
        view: CpuDescriptorHandle,
    ) {
        self.transition_barrier(resource, ResourceStates::UNORDERED_ACCESS, Subresource::All);
        self.stage_descriptors(DescriptorHeapKind::CbvSrvUav, root_index, offset, &[view]);
    }

    /// Transition `buffer` to a constant-buffer state and stage its CBV.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is null.
    pub fn set_constant_buffer_view(
        &mut self,
        root_index: u32,
        offset: u32,
        buffer: &GpuBuffer,
        view: CpuDescriptorHandle,
    ) {
        let Some(resource) = buffer.resource() else {
            panic!("cannot bind a null buffer as a constant buffer view");
        };
        self.transition_barrier(
            resource,
            ResourceStates::VERTEX_AND_CONSTANT_BUFFER,
            Subresource::All,
        );
        self.stage_descriptors(DescriptorHeapKind::CbvSrvUav, root_index, offset, &[view]);
    }

    /// Stage CPU descriptors into the table at `root_index`.
    ///
    /// # Panics
    ///
    /// Panics for non-shader-visible kinds or a write outside the table's
    /// declared range.
    pub fn stage_descriptors(
        &mut self,
        kind: DescriptorHeapKind,
        root_index: u32,
        offset: u32,
        handles: &[CpuDescriptorHandle],
    ) {
        assert!(kind.is_shader_visible(), "no dynamic {kind:?} heap");
        self.dynamic_heaps[kind.index()].stage_descriptors(root_index, offset, handles);
    }

    /// Copy one CPU descriptor into the GPU-visible heap of its kind.
    pub fn copy_descriptor(
        &mut self,
        kind: DescriptorHeapKind,
        cpu: CpuDescriptorHandle,
    ) -> Result<GpuDescriptorHandle> {
        assert!(kind.is_shader_visible(), "no dynamic {kind:?} heap");
        self.dynamic_heaps[kind.index()].copy_descriptor(
            self.encoder.as_mut(),
            &mut self.bound_heaps,
            cpu,
        )
    }

    // ========================================================================
    // Work
    // ========================================================================

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> Result<()> {
        self.prepare(BindPoint::Graphics)?;
        self.encoder
            .draw_instanced(vertex_count, instance_count, start_vertex, start_instance);
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) -> Result<()> {
        self.prepare(BindPoint::Graphics)?;
        self.encoder.draw_indexed_instanced(
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        );
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.prepare(BindPoint::Compute)?;
        self.encoder.dispatch(x, y, z);
        Ok(())
    }

    fn prepare(&mut self, bind_point: BindPoint) -> Result<()> {
        self.flush_resource_barriers();
        for heap in &mut self.dynamic_heaps {
            heap.commit_staged_descriptors(self.encoder.as_mut(), &mut self.bound_heaps, bind_point)?;
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Close the list for submission.
    ///
    /// Pending barriers are resolved against `global` and recorded into
    /// `pending`, which must execute right before this list; the list's final
    /// states are then committed to `global`. Returns the number of barriers
    /// recorded into `pending`.
    pub fn close(
        &mut self,
        pending: &mut CommandList,
        global: &mut GlobalStatesGuard<'_>,
        elide_redundant: bool,
    ) -> Result<u32> {
        self.flush_resource_barriers();
        self.encoder.close().inspect_err(|e| {
            log::error!("Failed to close command list {}: {e}", self.id);
        })?;

        let flush = self.tracker.flush_pending_resource_barriers(
            pending.encoder.as_mut(),
            global,
            elide_redundant,
        );
        self.tracker.commit_final_resource_states(global);
        Ok(flush.emitted)
    }

    /// Close a list that carries no pending barriers of its own (an
    /// auxiliary barrier list).
    pub fn close_standalone(&mut self) -> Result<()> {
        self.flush_resource_barriers();
        self.encoder.close().inspect_err(|e| {
            log::error!("Failed to close command list {}: {e}", self.id);
        })
    }

    /// Start recording again. Only call once the GPU finished the previous
    /// recording.
    pub fn reset(&mut self) -> Result<()> {
        self.encoder.reset()?;
        self.tracker.reset();
        self.upload.reset();
        for heap in &mut self.dynamic_heaps {
            heap.reset();
        }
        self.bound_heaps.clear();
        self.root_signature = None;
        self.staging_pages.clear();
        Ok(())
    }
}

impl fmt::Debug for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("pending_barriers", &self.tracker.pending_count())
            .finish_non_exhaustive()
    }
}
