//! Buffer handles returned by the core.

use bytemuck::Pod;

use crate::hal::{GpuAddress, ResourceHandle};

/// A device-local buffer created by the core.
///
/// Zero-length uploads produce a *null* buffer: valid to pass around, never
/// backed by a resource. The handle does not own the resource; destroy it
/// through [`GpuContext::destroy_resource`](crate::GpuContext::destroy_resource)
/// once the GPU is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuBuffer {
    resource: Option<ResourceHandle>,
    size: u64,
    gpu_address: GpuAddress,
}

impl GpuBuffer {
    #[must_use]
    pub fn new(resource: ResourceHandle, size: u64, gpu_address: GpuAddress) -> Self {
        Self {
            resource: Some(resource),
            size,
            gpu_address,
        }
    }

    #[must_use]
    pub const fn null() -> Self {
        Self {
            resource: None,
            size: 0,
            gpu_address: GpuAddress(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.resource.is_none()
    }

    #[inline]
    #[must_use]
    pub fn resource(&self) -> Option<ResourceHandle> {
        self.resource
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn gpu_address(&self) -> GpuAddress {
        self.gpu_address
    }
}

/// Element types usable in a dynamic index buffer.
pub trait IndexElement: Pod {
    const FORMAT: wgpu::IndexFormat;
}

impl IndexElement for u16 {
    const FORMAT: wgpu::IndexFormat = wgpu::IndexFormat::Uint16;
}

impl IndexElement for u32 {
    const FORMAT: wgpu::IndexFormat = wgpu::IndexFormat::Uint32;
}
