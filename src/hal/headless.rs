//! Headless Device
//!
//! An in-process implementation of every [`hal`](super) trait. It has no
//! GPU behind it, but it behaves like one from the core's point of view:
//!
//! - Buffers own real byte storage. Copy commands move bytes when the
//!   command list is executed, so uploads can be read back.
//! - Descriptor heaps own real slots. Writes and copies store [`ViewDesc`]s
//!   which can be inspected through CPU or GPU handles.
//! - Every executed command is appended to a log, in queue order.
//! - Fences are signalled as soon as the queue reaches them, unless the
//!   GPU is paused with [`HeadlessDevice::pause_gpu`]; then signals are held
//!   back until [`HeadlessDevice::resume_gpu`], which models in-flight work.
//!
//! ```text
//! ┌──────────────── HeadlessDevice ────────────────┐
//! │ resources:   SlotMap<ResourceHandle, Resource> │
//! │ heaps:       SlotMap<DescriptorHeapId, Heap>   │
//! │ descriptors: cpu address → ViewDesc            │
//! │ executed:    [ExecutedCommand]                 │
//! │ gate:        paused? + held fence signals      │
//! └────────────────────────────────────────────────┘
//! ```

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use super::{
    BindPoint, CommandEncoder, CpuDescriptorHandle, DescriptorHeap, DescriptorHeapId,
    DescriptorHeapKind, Device, Fence, GpuAddress, GpuDescriptorHandle, HeapType,
    IndexBufferView, MappedPage, NativeQueue, QueueKind, ResourceBarrier, ResourceDesc,
    ResourceHandle, ResourceStates, RootSignatureId, VertexBufferView, ViewDesc,
};
use crate::errors::{EmberError, Result};

const CPU_DESCRIPTOR_BASE: u64 = 0x0010_0000;
const GPU_DESCRIPTOR_BASE: u64 = 0x4000_0000_0000;
const GPU_VA_BASE: u64 = 0x0001_0000_0000;
const GPU_VA_ALIGNMENT: u64 = 64 * 1024;
const HEAP_GAP: u64 = 4096;

// ─── Recorded commands ────────────────────────────────────────────────────────

/// A command recorded by a [`HeadlessEncoder`] or issued on a queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Barriers(Vec<ResourceBarrier>),
    CopyResource {
        dst: ResourceHandle,
        src: ResourceHandle,
    },
    CopyBufferRegion {
        dst: ResourceHandle,
        dst_offset: u64,
        src: ResourceHandle,
        src_offset: u64,
        num_bytes: u64,
    },
    SetDescriptorHeaps(Vec<DescriptorHeapId>),
    SetRootSignature {
        bind_point: BindPoint,
        signature: RootSignatureId,
    },
    SetRootDescriptorTable {
        bind_point: BindPoint,
        root_index: u32,
        base: GpuDescriptorHandle,
    },
    SetRootConstantBufferView {
        bind_point: BindPoint,
        root_index: u32,
        location: GpuAddress,
    },
    SetRootConstants {
        bind_point: BindPoint,
        root_index: u32,
        values: Vec<u32>,
        dest_offset: u32,
    },
    SetVertexBuffers {
        start_slot: u32,
        views: Vec<VertexBufferView>,
    },
    SetIndexBuffer(IndexBufferView),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    /// Queue-level fence signal.
    Signal { value: u64 },
    /// Queue-level GPU wait.
    Wait { value: u64 },
}

/// A command as executed by a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedCommand {
    pub queue: QueueKind,
    pub command: Command,
}

// ─── Device state ─────────────────────────────────────────────────────────────

struct HeadlessResource {
    desc: ResourceDesc,
    gpu_address: Option<GpuAddress>,
    data: Option<Arc<Mutex<Vec<u8>>>>,
}

struct DeviceState {
    resources: SlotMap<ResourceHandle, HeadlessResource>,
    heaps: SlotMap<DescriptorHeapId, DescriptorHeap>,
    descriptors: FxHashMap<u64, ViewDesc>,
    next_cpu_descriptor: u64,
    next_gpu_descriptor: u64,
    next_gpu_address: u64,
    executed: Vec<ExecutedCommand>,
}

#[derive(Default)]
struct GpuGate {
    paused: bool,
    held: Vec<(Arc<FenceState>, u64)>,
}

struct Shared {
    state: Mutex<DeviceState>,
    gate: Mutex<GpuGate>,
    /// `n > 0`: the `n`-th creation from now fails.
    fail_countdown: AtomicUsize,
}

impl Shared {
    fn check_creation(&self, object: &'static str) -> Result<()> {
        let previous = self
            .fail_countdown
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            return Err(EmberError::creation(object, "injected headless failure"));
        }
        Ok(())
    }
}

/// In-process [`Device`] implementation.
#[derive(Clone)]
pub struct HeadlessDevice {
    shared: Arc<Shared>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DeviceState {
                    resources: SlotMap::with_key(),
                    heaps: SlotMap::with_key(),
                    descriptors: FxHashMap::default(),
                    next_cpu_descriptor: CPU_DESCRIPTOR_BASE,
                    next_gpu_descriptor: GPU_DESCRIPTOR_BASE,
                    next_gpu_address: GPU_VA_BASE,
                    executed: Vec::new(),
                }),
                gate: Mutex::new(GpuGate::default()),
                fail_countdown: AtomicUsize::new(0),
            }),
        }
    }

    // ── Test controls ──────────────────────────────────────────────────────

    /// Hold back fence signals until [`resume_gpu`](Self::resume_gpu).
    pub fn pause_gpu(&self) {
        self.shared.gate.lock().paused = true;
    }

    /// Release every held fence signal, in submission order.
    pub fn resume_gpu(&self) {
        let held = {
            let mut gate = self.shared.gate.lock();
            gate.paused = false;
            std::mem::take(&mut gate.held)
        };
        for (fence, value) in held {
            fence.complete(value);
        }
    }

    /// Make the next `create_*` call fail.
    pub fn fail_next_creation(&self) {
        self.fail_creation_after(0);
    }

    /// Let `successes` more `create_*` calls succeed, then fail one.
    pub fn fail_creation_after(&self, successes: usize) {
        self.shared
            .fail_countdown
            .store(successes + 1, Ordering::Release);
    }

    // ── Inspection ─────────────────────────────────────────────────────────

    /// Every command executed so far, across all queues.
    #[must_use]
    pub fn executed_commands(&self) -> Vec<ExecutedCommand> {
        self.shared.state.lock().executed.clone()
    }

    /// Every barrier executed so far, flattened in execution order.
    #[must_use]
    pub fn executed_barriers(&self) -> Vec<ResourceBarrier> {
        self.shared
            .state
            .lock()
            .executed
            .iter()
            .filter_map(|c| match &c.command {
                Command::Barriers(b) => Some(b.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn clear_executed(&self) {
        self.shared.state.lock().executed.clear();
    }

    /// Contents of a buffer. Empty for textures and unknown handles.
    #[must_use]
    pub fn read_buffer(&self, resource: ResourceHandle) -> Vec<u8> {
        let data = self
            .shared
            .state
            .lock()
            .resources
            .get(resource)
            .and_then(|r| r.data.clone());
        data.map(|d| d.lock().clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.shared.state.lock().resources.len()
    }

    #[must_use]
    pub fn descriptor_heap_count(&self) -> usize {
        self.shared.state.lock().heaps.len()
    }

    /// The view stored at a CPU descriptor slot.
    #[must_use]
    pub fn descriptor(&self, handle: CpuDescriptorHandle) -> Option<ViewDesc> {
        self.shared.state.lock().descriptors.get(&handle.0).copied()
    }

    /// The view stored at a GPU descriptor slot of a shader-visible heap.
    #[must_use]
    pub fn gpu_descriptor(&self, handle: GpuDescriptorHandle) -> Option<ViewDesc> {
        let state = self.shared.state.lock();
        let cpu = state.heaps.values().find_map(|heap| {
            let gpu_start = heap.gpu_start?;
            let len = u64::from(heap.capacity) * u64::from(heap.increment);
            (handle.0 >= gpu_start.0 && handle.0 < gpu_start.0 + len)
                .then(|| heap.cpu_start.0 + (handle.0 - gpu_start.0))
        })?;
        state.descriptors.get(&cpu).copied()
    }

    fn increment(kind: DescriptorHeapKind) -> u32 {
        match kind {
            DescriptorHeapKind::CbvSrvUav => 32,
            DescriptorHeapKind::Sampler => 16,
            DescriptorHeapKind::Rtv | DescriptorHeapKind::Dsv => 8,
        }
    }
}

impl DeviceState {
    fn allocate_gpu_va(&mut self, size: u64) -> GpuAddress {
        let address = GpuAddress(self.next_gpu_address);
        let span = size.max(1).div_ceil(GPU_VA_ALIGNMENT) * GPU_VA_ALIGNMENT;
        self.next_gpu_address += span;
        address
    }

    fn execute(&mut self, queue: QueueKind, command: &Command) {
        match *command {
            Command::CopyResource { dst, src } => {
                self.copy_bytes(dst, 0, src, 0, None);
            }
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                num_bytes,
            } => {
                self.copy_bytes(dst, dst_offset, src, src_offset, Some(num_bytes));
            }
            _ => {}
        }
        self.executed.push(ExecutedCommand {
            queue,
            command: command.clone(),
        });
    }

    fn copy_bytes(
        &self,
        dst: ResourceHandle,
        dst_offset: u64,
        src: ResourceHandle,
        src_offset: u64,
        num_bytes: Option<u64>,
    ) {
        let (Some(src_data), Some(dst_data)) = (
            self.resources.get(src).and_then(|r| r.data.clone()),
            self.resources.get(dst).and_then(|r| r.data.clone()),
        ) else {
            return;
        };

        let bytes = {
            let src = src_data.lock();
            let start = src_offset as usize;
            let end = num_bytes.map_or(src.len(), |n| start + n as usize);
            if end > src.len() {
                log::warn!("Headless copy reads past the end of the source buffer");
                return;
            }
            src[start..end].to_vec()
        };

        let mut dst = dst_data.lock();
        let start = dst_offset as usize;
        let end = (start + bytes.len()).min(dst.len());
        if start > end {
            log::warn!("Headless copy writes past the end of the destination buffer");
            return;
        }
        let len = end - start;
        dst[start..end].copy_from_slice(&bytes[..len]);
    }
}

impl Device for HeadlessDevice {
    fn create_resource(
        &self,
        desc: &ResourceDesc,
        _heap: HeapType,
        _initial_state: ResourceStates,
    ) -> Result<ResourceHandle> {
        self.shared.check_creation("resource")?;
        let mut state = self.shared.state.lock();
        let (gpu_address, data) = match *desc {
            ResourceDesc::Buffer { size } => (
                Some(state.allocate_gpu_va(size)),
                Some(Arc::new(Mutex::new(vec![0u8; size as usize]))),
            ),
            ResourceDesc::Texture2d { .. } => (None, None),
        };
        Ok(state.resources.insert(HeadlessResource {
            desc: *desc,
            gpu_address,
            data,
        }))
    }

    fn destroy_resource(&self, resource: ResourceHandle) {
        self.shared.state.lock().resources.remove(resource);
    }

    fn resource_desc(&self, resource: ResourceHandle) -> Option<ResourceDesc> {
        self.shared.state.lock().resources.get(resource).map(|r| r.desc)
    }

    fn gpu_address(&self, resource: ResourceHandle) -> Option<GpuAddress> {
        self.shared
            .state
            .lock()
            .resources
            .get(resource)
            .and_then(|r| r.gpu_address)
    }

    fn create_upload_page(&self, size: u64) -> Result<Box<dyn MappedPage>> {
        self.shared.check_creation("upload page")?;
        let data = Arc::new(Mutex::new(vec![0u8; size as usize]));
        let mut state = self.shared.state.lock();
        let gpu_address = state.allocate_gpu_va(size);
        let resource = state.resources.insert(HeadlessResource {
            desc: ResourceDesc::buffer(size),
            gpu_address: Some(gpu_address),
            data: Some(data.clone()),
        });
        Ok(Box::new(HeadlessPage {
            resource,
            gpu_address,
            size,
            data,
            shared: self.shared.clone(),
        }))
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<DescriptorHeap> {
        self.shared.check_creation("descriptor heap")?;
        if shader_visible && !kind.is_shader_visible() {
            return Err(EmberError::creation(
                "descriptor heap",
                format!("{kind:?} heaps cannot be shader visible"),
            ));
        }

        let increment = Self::increment(kind);
        let span = u64::from(capacity) * u64::from(increment) + HEAP_GAP;
        let mut state = self.shared.state.lock();

        let cpu_start = CpuDescriptorHandle(state.next_cpu_descriptor);
        state.next_cpu_descriptor += span;
        let gpu_start = shader_visible.then(|| {
            let start = GpuDescriptorHandle(state.next_gpu_descriptor);
            state.next_gpu_descriptor += span;
            start
        });

        let id = state.heaps.insert_with_key(|id| DescriptorHeap {
            id,
            kind,
            capacity,
            increment,
            cpu_start,
            gpu_start,
        });
        Ok(state.heaps[id])
    }

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId) {
        let mut state = self.shared.state.lock();
        if let Some(heap) = state.heaps.remove(heap) {
            let start = heap.cpu_start.0;
            let end = start + u64::from(heap.capacity) * u64::from(heap.increment);
            state.descriptors.retain(|&addr, _| addr < start || addr >= end);
        }
    }

    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32 {
        Self::increment(kind)
    }

    fn write_descriptor(&self, dest: CpuDescriptorHandle, view: &ViewDesc) {
        self.shared.state.lock().descriptors.insert(dest.0, *view);
    }

    fn copy_descriptors(
        &self,
        kind: DescriptorHeapKind,
        dest_start: CpuDescriptorHandle,
        sources: &[CpuDescriptorHandle],
    ) {
        let increment = Self::increment(kind);
        let mut state = self.shared.state.lock();
        for (i, src) in sources.iter().enumerate() {
            let view = state
                .descriptors
                .get(&src.0)
                .copied()
                .unwrap_or(ViewDesc::Null);
            state
                .descriptors
                .insert(dest_start.offset(i as u32, increment).0, view);
        }
    }

    fn create_command_encoder(&self, kind: QueueKind) -> Result<Box<dyn CommandEncoder>> {
        self.shared.check_creation("command list")?;
        Ok(Box::new(HeadlessEncoder {
            kind,
            commands: Vec::new(),
            closed: false,
        }))
    }

    fn create_queue(&self, kind: QueueKind) -> Result<Arc<dyn NativeQueue>> {
        self.shared.check_creation("command queue")?;
        Ok(Arc::new(HeadlessQueue {
            kind,
            shared: self.shared.clone(),
        }))
    }

    fn create_fence(&self, initial_value: u64) -> Result<Arc<dyn Fence>> {
        self.shared.check_creation("fence")?;
        Ok(Arc::new(HeadlessFence {
            state: Arc::new(FenceState {
                value: Mutex::new(initial_value),
                reached: Condvar::new(),
            }),
        }))
    }
}

// ─── Upload page ──────────────────────────────────────────────────────────────

struct HeadlessPage {
    resource: ResourceHandle,
    gpu_address: GpuAddress,
    size: u64,
    data: Arc<Mutex<Vec<u8>>>,
    shared: Arc<Shared>,
}

impl MappedPage for HeadlessPage {
    fn resource(&self) -> ResourceHandle {
        self.resource
    }

    fn gpu_address(&self) -> GpuAddress {
        self.gpu_address
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) {
        let start = offset as usize;
        self.data.lock()[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl Drop for HeadlessPage {
    fn drop(&mut self) {
        self.shared.state.lock().resources.remove(self.resource);
    }
}

// ─── Command encoder ──────────────────────────────────────────────────────────

/// Native recording handle of the headless backend.
pub struct HeadlessEncoder {
    kind: QueueKind,
    commands: Vec<Command>,
    closed: bool,
}

impl HeadlessEncoder {
    /// Commands recorded since the last reset.
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn record(&mut self, command: Command) {
        debug_assert!(!self.closed, "recording into a closed command list");
        self.commands.push(command);
    }
}

impl CommandEncoder for HeadlessEncoder {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn reset(&mut self) -> Result<()> {
        self.commands.clear();
        self.closed = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(EmberError::CommandList(
                "command list closed twice without a reset".to_string(),
            ));
        }
        self.closed = true;
        Ok(())
    }

    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]) {
        self.record(Command::Barriers(barriers.to_vec()));
    }

    fn copy_resource(&mut self, dst: ResourceHandle, src: ResourceHandle) {
        self.record(Command::CopyResource { dst, src });
    }

    fn copy_buffer_region(
        &mut self,
        dst: ResourceHandle,
        dst_offset: u64,
        src: ResourceHandle,
        src_offset: u64,
        num_bytes: u64,
    ) {
        self.record(Command::CopyBufferRegion {
            dst,
            dst_offset,
            src,
            src_offset,
            num_bytes,
        });
    }

    fn set_descriptor_heaps(&mut self, heaps: &[DescriptorHeapId]) {
        self.record(Command::SetDescriptorHeaps(heaps.to_vec()));
    }

    fn set_root_signature(&mut self, bind_point: BindPoint, signature: RootSignatureId) {
        self.record(Command::SetRootSignature {
            bind_point,
            signature,
        });
    }

    fn set_root_descriptor_table(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        base: GpuDescriptorHandle,
    ) {
        self.record(Command::SetRootDescriptorTable {
            bind_point,
            root_index,
            base,
        });
    }

    fn set_root_constant_buffer_view(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        location: GpuAddress,
    ) {
        self.record(Command::SetRootConstantBufferView {
            bind_point,
            root_index,
            location,
        });
    }

    fn set_root_constants(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        values: &[u32],
        dest_offset: u32,
    ) {
        self.record(Command::SetRootConstants {
            bind_point,
            root_index,
            values: values.to_vec(),
            dest_offset,
        });
    }

    fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]) {
        self.record(Command::SetVertexBuffers {
            start_slot,
            views: views.to_vec(),
        });
    }

    fn set_index_buffer(&mut self, view: &IndexBufferView) {
        self.record(Command::SetIndexBuffer(*view));
    }

    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) {
        self.record(Command::Draw {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        });
    }

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        self.record(Command::DrawIndexed {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.record(Command::Dispatch { x, y, z });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ─── Queue & fence ────────────────────────────────────────────────────────────

struct HeadlessQueue {
    kind: QueueKind,
    shared: Arc<Shared>,
}

fn headless_fence(fence: &dyn Fence) -> Result<&HeadlessFence> {
    fence.as_any().downcast_ref::<HeadlessFence>().ok_or_else(|| {
        EmberError::CommandList("fence does not belong to the headless device".to_string())
    })
}

impl NativeQueue for HeadlessQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn execute_command_lists(&self, lists: &[&dyn CommandEncoder]) -> Result<()> {
        let mut state = self.shared.state.lock();
        for list in lists {
            let encoder = list
                .as_any()
                .downcast_ref::<HeadlessEncoder>()
                .ok_or_else(|| {
                    EmberError::CommandList(
                        "command list does not belong to the headless device".to_string(),
                    )
                })?;
            if !encoder.closed {
                return Err(EmberError::CommandList(
                    "executing a command list that is still recording".to_string(),
                ));
            }
            for command in &encoder.commands {
                state.execute(self.kind, command);
            }
        }
        Ok(())
    }

    fn signal(&self, fence: &dyn Fence, value: u64) -> Result<()> {
        let fence = headless_fence(fence)?;
        self.shared.state.lock().executed.push(ExecutedCommand {
            queue: self.kind,
            command: Command::Signal { value },
        });

        let mut gate = self.shared.gate.lock();
        if gate.paused {
            gate.held.push((fence.state.clone(), value));
        } else {
            drop(gate);
            fence.state.complete(value);
        }
        Ok(())
    }

    fn wait(&self, fence: &dyn Fence, value: u64) -> Result<()> {
        headless_fence(fence)?;
        self.shared.state.lock().executed.push(ExecutedCommand {
            queue: self.kind,
            command: Command::Wait { value },
        });
        Ok(())
    }
}

struct FenceState {
    value: Mutex<u64>,
    reached: Condvar,
}

impl FenceState {
    fn complete(&self, value: u64) {
        let mut current = self.value.lock();
        if value > *current {
            *current = value;
        }
        self.reached.notify_all();
    }
}

struct HeadlessFence {
    state: Arc<FenceState>,
}

impl Fence for HeadlessFence {
    fn completed_value(&self) -> u64 {
        *self.state.value.lock()
    }

    fn wait_for_value(&self, value: u64) {
        let mut current = self.state.value.lock();
        while *current < value {
            self.state.reached.wait(&mut current);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
