//! GPU Context
//!
//! Owns the services every queue and command list shares:
//!
//! - the [`Device`]
//! - the [`GlobalResourceStates`] table
//! - one [`DescriptorAllocator`] per descriptor heap kind
//! - the [`FrameClock`] that stamps descriptor frees
//!
//! Nothing here is process-global. Create one context per device and pass it
//! (or the pieces it hands out) to whoever needs it; tests build isolated
//! contexts over a [`HeadlessDevice`](crate::hal::headless::HeadlessDevice).
//!
//! # Per-frame housekeeping
//!
//! ```rust,ignore
//! let frame = ctx.advance_frame();
//! // ... record and submit ...
//! ctx.release_stale_descriptors(retired_frame);
//! ```

use std::fmt;
use std::sync::Arc;

use crate::buffer::GpuBuffer;
use crate::command::CommandQueue;
use crate::descriptors::{DescriptorAllocation, DescriptorAllocator};
use crate::errors::Result;
use crate::hal::{DescriptorHeapKind, Device, HeapType, QueueKind, ResourceDesc, ResourceHandle, ResourceStates, ViewDesc};
use crate::settings::GpuSettings;
use crate::state::GlobalResourceStates;
use crate::token::{FrameClock, FrameNumber};

/// Per-device services shared by every queue and command list.
pub struct GpuContext {
    device: Arc<dyn Device>,
    settings: GpuSettings,
    global_states: Arc<GlobalResourceStates>,
    frame_clock: Arc<FrameClock>,
    descriptor_allocators: [Arc<DescriptorAllocator>; DescriptorHeapKind::COUNT],
}

impl GpuContext {
    #[must_use]
    pub fn new(device: Arc<dyn Device>, settings: GpuSettings) -> Self {
        let frame_clock = Arc::new(FrameClock::new());
        let descriptor_allocators = DescriptorHeapKind::ALL.map(|kind| {
            Arc::new(DescriptorAllocator::new(
                device.clone(),
                kind,
                &settings,
                frame_clock.clone(),
            ))
        });

        log::info!(
            "GPU context ready: {} descriptors per page, {} byte upload pages",
            settings.descriptors_per_page,
            settings.upload_page_size
        );

        Self {
            device,
            settings,
            global_states: Arc::new(GlobalResourceStates::new()),
            frame_clock,
            descriptor_allocators,
        }
    }

    #[inline]
    #[must_use]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    #[inline]
    #[must_use]
    pub fn settings(&self) -> &GpuSettings {
        &self.settings
    }

    #[inline]
    #[must_use]
    pub fn global_states(&self) -> &Arc<GlobalResourceStates> {
        &self.global_states
    }

    #[inline]
    #[must_use]
    pub fn frame_clock(&self) -> &Arc<FrameClock> {
        &self.frame_clock
    }

    /// Create a queue with its own command list pool and reclamation worker.
    pub fn create_queue(&self, kind: QueueKind) -> Result<CommandQueue> {
        CommandQueue::new(
            self.device.clone(),
            kind,
            self.settings.clone(),
            self.global_states.clone(),
        )
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Create a buffer and register it in `initial_state`.
    pub fn create_buffer(&self, size: u64, heap: HeapType, initial_state: ResourceStates) -> Result<GpuBuffer> {
        let resource = self.create_resource(&ResourceDesc::buffer(size), heap, initial_state)?;
        let gpu_address = self.device.gpu_address(resource).unwrap_or_default();
        Ok(GpuBuffer::new(resource, size, gpu_address))
    }

    /// Create a texture and register it in `initial_state`.
    pub fn create_texture(&self, desc: &ResourceDesc, initial_state: ResourceStates) -> Result<ResourceHandle> {
        debug_assert!(!desc.is_buffer(), "use create_buffer for buffers");
        self.create_resource(desc, HeapType::Default, initial_state)
    }

    fn create_resource(&self, desc: &ResourceDesc, heap: HeapType, initial_state: ResourceStates) -> Result<ResourceHandle> {
        let resource = self
            .device
            .create_resource(desc, heap, initial_state)
            .inspect_err(|e| log::error!("Failed to create resource {desc:?}: {e}"))?;
        self.global_states.register(resource, initial_state);
        Ok(resource)
    }

    /// Unregister and destroy `resource`.
    ///
    /// The caller guarantees the GPU no longer uses it.
    pub fn destroy_resource(&self, resource: ResourceHandle) {
        self.global_states.unregister(resource);
        self.device.destroy_resource(resource);
    }

    /// Track a resource created outside the context.
    pub fn register_resource(&self, resource: ResourceHandle, initial_state: ResourceStates) {
        self.global_states.register(resource, initial_state);
    }

    pub fn unregister_resource(&self, resource: ResourceHandle) {
        self.global_states.unregister(resource);
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    #[must_use]
    pub fn descriptor_allocator(&self, kind: DescriptorHeapKind) -> &Arc<DescriptorAllocator> {
        &self.descriptor_allocators[kind.index()]
    }

    /// Allocate `count` contiguous CPU descriptors of `kind`.
    pub fn allocate_descriptors(&self, kind: DescriptorHeapKind, count: u32) -> Result<DescriptorAllocation> {
        self.descriptor_allocator(kind).allocate(count)
    }

    /// Allocate one descriptor of `kind` and write `view` into it.
    pub fn create_view(&self, kind: DescriptorHeapKind, view: &ViewDesc) -> Result<DescriptorAllocation> {
        let allocation = self.allocate_descriptors(kind, 1)?;
        self.device.write_descriptor(allocation.base(), view);
        Ok(allocation)
    }

    /// Release descriptors freed at or before `frame` in every pool.
    pub fn release_stale_descriptors(&self, frame: FrameNumber) {
        for allocator in &self.descriptor_allocators {
            allocator.release_stale_descriptors(frame);
        }
    }

    /// Start the next frame; descriptors dropped from now on are stamped
    /// with it.
    pub fn advance_frame(&self) -> FrameNumber {
        self.frame_clock.advance()
    }
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("settings", &self.settings)
            .field("frame", &self.frame_clock.current())
            .field("resources", &self.global_states.len())
            .finish_non_exhaustive()
    }
}
