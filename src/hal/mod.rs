//! Hardware Abstraction Layer
//!
//! The core never talks to a native graphics API directly. Everything it
//! needs from the driver is expressed by the object-safe traits in this
//! module:
//!
//! | Trait              | Native concept                                   |
//! |--------------------|--------------------------------------------------|
//! | [`Device`]         | resource / heap / command list / fence factory   |
//! | [`CommandEncoder`] | a command list's native recording handle         |
//! | [`NativeQueue`]    | the queue lists are executed on                  |
//! | [`Fence`]          | GPU completion primitive keyed by a `u64` value  |
//! | [`MappedPage`]     | persistently mapped upload memory                |
//!
//! The value types ([`ResourceStates`], [`ResourceBarrier`], descriptor
//! handles, views) follow the explicit-API model: resources have a usage
//! state, barriers move them between states, descriptors live in heaps.
//!
//! [`headless::HeadlessDevice`] implements every trait in-process and is
//! what the test suite runs against.

pub mod headless;

use std::any::Any;
use std::sync::Arc;

use bitflags::bitflags;
use slotmap::new_key_type;

use crate::errors::Result;

new_key_type! {
    /// Opaque handle to a GPU buffer or texture.
    ///
    /// The core never owns the resource behind a handle; it only tracks the
    /// handle's state.
    pub struct ResourceHandle;

    /// Opaque handle to a native descriptor heap.
    pub struct DescriptorHeapId;
}

// ============================================================================
// Resource States & Barriers
// ============================================================================

bitflags! {
    /// GPU usage state of a resource.
    ///
    /// Bit values match the D3D12 resource state flags so a native backend
    /// can pass them through unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceStates: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
        const ALL_SHADER_RESOURCE = Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits();
    }
}

/// Which part of a resource a transition applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subresource {
    /// Every subresource of the resource.
    All,
    /// A single mip/array slice.
    Index(u32),
}

/// A state transition of a resource (or one of its subresources).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransitionBarrier {
    pub resource: ResourceHandle,
    pub subresource: Subresource,
    pub before: ResourceStates,
    pub after: ResourceStates,
}

impl TransitionBarrier {
    /// Whether this barrier changes anything on the GPU.
    #[inline]
    #[must_use]
    pub fn is_effective(&self) -> bool {
        self.before != self.after
    }
}

/// A synchronization command recorded into a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceBarrier {
    Transition(TransitionBarrier),
    /// Orders UAV accesses. `None` means "all UAV accesses".
    Uav { resource: Option<ResourceHandle> },
    /// Switches which placed resource owns aliased memory.
    Aliasing {
        before: Option<ResourceHandle>,
        after: Option<ResourceHandle>,
    },
}

impl ResourceBarrier {
    #[must_use]
    pub fn transition(
        resource: ResourceHandle,
        before: ResourceStates,
        after: ResourceStates,
        subresource: Subresource,
    ) -> Self {
        ResourceBarrier::Transition(TransitionBarrier {
            resource,
            subresource,
            before,
            after,
        })
    }

    /// The transition payload, if this is a transition barrier.
    #[inline]
    #[must_use]
    pub fn as_transition(&self) -> Option<&TransitionBarrier> {
        match self {
            ResourceBarrier::Transition(t) => Some(t),
            _ => None,
        }
    }
}

// ============================================================================
// Queues, Heaps & Handles
// ============================================================================

/// Kind of queue a command list is recorded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Direct,
    Compute,
    Copy,
}

/// Pipeline a root signature / descriptor table is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}

/// Kind of descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

impl DescriptorHeapKind {
    pub const COUNT: usize = 4;

    pub const ALL: [Self; Self::COUNT] = [Self::CbvSrvUav, Self::Sampler, Self::Rtv, Self::Dsv];

    /// Kinds that can be bound to the pipeline as GPU-visible heaps.
    pub const SHADER_VISIBLE: [Self; 2] = [Self::CbvSrvUav, Self::Sampler];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::CbvSrvUav => 0,
            Self::Sampler => 1,
            Self::Rtv => 2,
            Self::Dsv => 3,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_shader_visible(self) -> bool {
        matches!(self, Self::CbvSrvUav | Self::Sampler)
    }
}

/// CPU address of a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CpuDescriptorHandle(pub u64);

impl CpuDescriptorHandle {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(index) * u64::from(increment))
    }

    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// GPU address of a descriptor slot in a shader-visible heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(index) * u64::from(increment))
    }

    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// GPU virtual address of buffer memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GpuAddress(pub u64);

impl GpuAddress {
    #[inline]
    #[must_use]
    pub fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// A native descriptor heap as returned by [`Device::create_descriptor_heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeap {
    pub id: DescriptorHeapId,
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    /// Distance in bytes between two consecutive descriptor slots.
    pub increment: u32,
    pub cpu_start: CpuDescriptorHandle,
    /// Present only for shader-visible heaps.
    pub gpu_start: Option<GpuDescriptorHandle>,
}

/// Identity of a root signature, used by the encoder to bind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootSignatureId(pub u64);

// ============================================================================
// Resources & Views
// ============================================================================

/// Memory pool a resource is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// Device-local, not CPU accessible.
    Default,
    /// CPU-writable, GPU-readable.
    Upload,
    /// GPU-writable, CPU-readable.
    Readback,
}

/// Shape of a GPU resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDesc {
    Buffer {
        size: u64,
    },
    Texture2d {
        width: u32,
        height: u32,
        array_size: u16,
        mip_levels: u16,
        format: wgpu::TextureFormat,
    },
}

impl ResourceDesc {
    #[inline]
    #[must_use]
    pub fn buffer(size: u64) -> Self {
        ResourceDesc::Buffer { size }
    }

    /// Number of individually trackable subresources.
    #[must_use]
    pub fn subresource_count(&self) -> u32 {
        match self {
            ResourceDesc::Buffer { .. } => 1,
            ResourceDesc::Texture2d {
                array_size,
                mip_levels,
                ..
            } => u32::from(*array_size) * u32::from(*mip_levels),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_buffer(&self) -> bool {
        matches!(self, ResourceDesc::Buffer { .. })
    }
}

/// Payload written into a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewDesc {
    ShaderResource {
        resource: ResourceHandle,
    },
    UnorderedAccess {
        resource: ResourceHandle,
    },
    ConstantBuffer {
        location: GpuAddress,
        size: u32,
    },
    RenderTarget {
        resource: ResourceHandle,
    },
    DepthStencil {
        resource: ResourceHandle,
    },
    Sampler {
        filter: wgpu::FilterMode,
        address_mode: wgpu::AddressMode,
    },
    /// A valid descriptor that reads as zero.
    Null,
}

/// Vertex buffer binding for the input assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub location: GpuAddress,
    pub size_in_bytes: u32,
    pub stride_in_bytes: u32,
}

/// Index buffer binding for the input assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferView {
    pub location: GpuAddress,
    pub size_in_bytes: u32,
    pub format: wgpu::IndexFormat,
}

// ============================================================================
// Traits
// ============================================================================

/// Factory for every native object the core uses.
pub trait Device: Send + Sync {
    fn create_resource(
        &self,
        desc: &ResourceDesc,
        heap: HeapType,
        initial_state: ResourceStates,
    ) -> Result<ResourceHandle>;

    fn destroy_resource(&self, resource: ResourceHandle);

    fn resource_desc(&self, resource: ResourceHandle) -> Option<ResourceDesc>;

    /// GPU address of a buffer. `None` for textures and unknown handles.
    fn gpu_address(&self, resource: ResourceHandle) -> Option<GpuAddress>;

    /// Create an upload-heap buffer of `size` bytes that stays mapped for
    /// the lifetime of the returned page.
    fn create_upload_page(&self, size: u64) -> Result<Box<dyn MappedPage>>;

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<DescriptorHeap>;

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId);

    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32;

    /// Write a view into a CPU descriptor slot.
    fn write_descriptor(&self, dest: CpuDescriptorHandle, view: &ViewDesc);

    /// Copy `sources` (one descriptor each) into consecutive slots starting
    /// at `dest_start`.
    fn copy_descriptors(
        &self,
        kind: DescriptorHeapKind,
        dest_start: CpuDescriptorHandle,
        sources: &[CpuDescriptorHandle],
    );

    fn create_command_encoder(&self, kind: QueueKind) -> Result<Box<dyn CommandEncoder>>;

    fn create_queue(&self, kind: QueueKind) -> Result<Arc<dyn NativeQueue>>;

    fn create_fence(&self, initial_value: u64) -> Result<Arc<dyn Fence>>;
}

/// Native recording handle of a command list.
pub trait CommandEncoder: Send + 'static {
    fn kind(&self) -> QueueKind;

    /// Start recording again. Only valid once the GPU finished the previous
    /// recording.
    fn reset(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]);

    fn copy_resource(&mut self, dst: ResourceHandle, src: ResourceHandle);

    fn copy_buffer_region(
        &mut self,
        dst: ResourceHandle,
        dst_offset: u64,
        src: ResourceHandle,
        src_offset: u64,
        num_bytes: u64,
    );

    fn set_descriptor_heaps(&mut self, heaps: &[DescriptorHeapId]);

    fn set_root_signature(&mut self, bind_point: BindPoint, signature: RootSignatureId);

    fn set_root_descriptor_table(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        base: GpuDescriptorHandle,
    );

    fn set_root_constant_buffer_view(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        location: GpuAddress,
    );

    fn set_root_constants(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        values: &[u32],
        dest_offset: u32,
    );

    fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]);

    fn set_index_buffer(&mut self, view: &IndexBufferView);

    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    );

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    );

    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    fn as_any(&self) -> &dyn Any;
}

/// Native queue that executes closed command lists in order.
pub trait NativeQueue: Send + Sync {
    fn kind(&self) -> QueueKind;

    fn execute_command_lists(&self, lists: &[&dyn CommandEncoder]) -> Result<()>;

    /// Have the GPU set `fence` to `value` once all prior work completes.
    fn signal(&self, fence: &dyn Fence, value: u64) -> Result<()>;

    /// Make the GPU wait until `fence` reaches `value` before running
    /// later submissions. Does not block the CPU.
    fn wait(&self, fence: &dyn Fence, value: u64) -> Result<()>;
}

/// GPU completion primitive.
pub trait Fence: Send + Sync {
    fn completed_value(&self) -> u64;

    /// Block the calling thread until the fence reaches `value`.
    fn wait_for_value(&self, value: u64);

    fn as_any(&self) -> &dyn Any;
}

/// Persistently mapped upload memory.
pub trait MappedPage: Send {
    /// The upload-heap resource backing this page.
    fn resource(&self) -> ResourceHandle;

    fn gpu_address(&self) -> GpuAddress;

    fn size(&self) -> u64;

    /// Copy `bytes` into the mapped memory at `offset`.
    fn write(&mut self, offset: u64, bytes: &[u8]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_read_contains_copy_source() {
        assert!(ResourceStates::GENERIC_READ.contains(ResourceStates::COPY_SOURCE));
        assert!(!ResourceStates::GENERIC_READ.contains(ResourceStates::COPY_DEST));
        assert!(ResourceStates::COMMON.is_empty());
    }

    #[test]
    fn test_descriptor_handle_offset() {
        let base = CpuDescriptorHandle(0x1000);
        assert_eq!(base.offset(3, 32), CpuDescriptorHandle(0x1000 + 96));
        assert!(!base.is_null());
        assert!(CpuDescriptorHandle::NULL.is_null());
    }

    #[test]
    fn test_texture_subresource_count() {
        let desc = ResourceDesc::Texture2d {
            width: 64,
            height: 64,
            array_size: 2,
            mip_levels: 4,
            format: wgpu::TextureFormat::Rgba8Unorm,
        };
        assert_eq!(desc.subresource_count(), 8);
        assert_eq!(ResourceDesc::buffer(16).subresource_count(), 1);
    }
}
