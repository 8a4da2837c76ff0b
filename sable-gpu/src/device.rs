//! Contracts between the renderer core and the device layer.
//!
//! The core does not own the device, queues, or fences; everything it needs
//! from them goes through these traits. Fences are per-queue monotonically
//! advancing 64-bit counters: waiting on value `v` returns once the queue
//! has executed through `v`.

use std::fmt;

use bitflags::bitflags;
use slotmap::new_key_type;

use crate::state::ResourceState;

new_key_type! {
    /// Generational key for device buffers.
    pub struct BufferKey;
}

/// Which hardware queue a command list records for / a fence belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Direct,
    Compute,
}

/// Opaque identity of a device resource, stable for its lifetime. This is
/// what barriers and the render graph's resource table refer to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u64);

impl ResourceId {
    pub const INVALID: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// Memory class a buffer lives in, mirroring the platform's heap types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    /// CPU-write, GPU-read; persistently mapped; stuck in generic-read.
    Upload,
    /// GPU-write, CPU-read; mapped on demand; stuck in copy-dest.
    Readback,
    /// GPU-local.
    Default,
}

#[derive(Clone, Debug)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub kind: BufferKind,
    pub initial_state: ResourceState,
    pub allow_uav: bool,
}

/// Handle to a device buffer plus the metadata hot paths need. Cheap to
/// copy; the actual storage lives in the device behind the generational
/// key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuBuffer {
    pub(crate) raw: BufferKey,
    pub(crate) size: u64,
    pub(crate) gpu_va: u64,
    /// Mapped CPU pointer for upload buffers, null otherwise.
    pub(crate) data: *mut u8,
}

// The pointer aliases device-owned storage that outlives the handle.
unsafe impl Send for GpuBuffer {}
unsafe impl Sync for GpuBuffer {}

impl GpuBuffer {
    pub fn id(&self) -> ResourceId {
        ResourceId(slotmap::Key::data(&self.raw).as_ffi())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_va(&self) -> u64 {
        self.gpu_va
    }

    /// Mapped CPU memory; null for buffers that are not host-visible.
    pub fn data(&self) -> *mut u8 {
        self.data
    }

    pub(crate) fn key(&self) -> BufferKey {
        self.raw
    }
}

/// A barrier record as the graph emits them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    Transition {
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    },
    /// UAV hazard between back-to-back writes (acceleration structures).
    Uav { resource: ResourceId },
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccelBuildFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
        const PERFORM_UPDATE = 1 << 4;
    }
}

/// One triangle-geometry range of a bottom-level build, addressed into the
/// scene mega-buffers by GPU virtual address.
#[derive(Clone, Copy, Debug)]
pub struct AccelGeometry {
    pub vertex_va: u64,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub index_va: u64,
    pub index_count: u32,
    /// Per-build 3x4 transform address, or 0 for none.
    pub transform_va: u64,
}

#[derive(Clone, Debug)]
pub enum AccelBuildInputs {
    BottomLevel {
        geometries: Vec<AccelGeometry>,
        flags: AccelBuildFlags,
    },
    TopLevel {
        instance_count: u32,
        instances_va: u64,
        flags: AccelBuildFlags,
    },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AccelPrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
    pub update_scratch_size: u64,
}

#[derive(Clone, Debug)]
pub struct AccelBuildDesc {
    pub inputs: AccelBuildInputs,
    pub dest_va: u64,
    pub scratch_va: u64,
    /// Source for in-place updates, 0 otherwise.
    pub source_va: u64,
    /// Where to write the compacted-size postbuild result, if requested.
    pub compacted_size_dst_va: u64,
}

/// Identity baked into persisted caches; a mismatch on load forces a
/// rebuild of the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub adapter_id: u64,
    pub driver_version: u64,
}

#[derive(Debug)]
pub enum DeviceError {
    OutOfMemory,
    /// Persisted cache blob failed validation.
    CacheCorrupted,
    DriverMismatch,
    AdapterMismatch,
    Io(std::io::Error),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "device out of memory"),
            Self::CacheCorrupted => write!(f, "persisted cache is corrupted"),
            Self::DriverMismatch => write!(f, "cache was produced by a different driver version"),
            Self::AdapterMismatch => write!(f, "cache was produced on different hardware"),
            Self::Io(e) => write!(f, "cache i/o failed: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Recording surface for one command list. Lists are recorded on worker
/// threads and submitted through [`GpuDevice::submit`].
pub trait CommandList: Send {
    fn queue(&self) -> QueueKind;
    fn set_name(&mut self, name: &str);
    fn resource_barriers(&mut self, barriers: &[Barrier]);
    fn copy_buffer(&mut self, src: GpuBuffer, src_offset: u64, dst: GpuBuffer, dst_offset: u64, bytes: u64);
    fn build_acceleration_structure(&mut self, desc: &AccelBuildDesc);
    /// Copies `src_va`'s acceleration structure into `dest_va` compacted.
    fn compact_acceleration_structure(&mut self, dest_va: u64, src_va: u64);
    /// Resolves the queue timestamp into `dst` at `slot * 8` bytes.
    fn write_timestamp(&mut self, dst: GpuBuffer, slot: u32);
    fn as_any(&mut self) -> &mut dyn std::any::Any;
}

/// The device adapter. One implementation per backend; the engine and the
/// tests use [`crate::HeadlessDevice`].
pub trait GpuDevice: Send + Sync {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer, DeviceError>;
    fn destroy_buffer(&self, buffer: GpuBuffer);

    /// Maps a readback buffer. The pointer is invalidated by GPU writes;
    /// re-map after every fence wait per the platform's caching rules.
    fn map_buffer(&self, buffer: GpuBuffer) -> *mut u8;
    fn unmap_buffer(&self, buffer: GpuBuffer);

    fn begin_command_list(&self, queue: QueueKind) -> Box<dyn CommandList>;
    /// Executes the list and signals its queue's fence; returns the value
    /// that signal produces.
    fn submit(&self, list: Box<dyn CommandList>) -> u64;

    /// Signals `queue`'s fence, returning the signaled value.
    fn signal(&self, queue: QueueKind) -> u64;
    /// The value the next signal/submit on `queue` will produce.
    fn next_fence_value(&self, queue: QueueKind) -> u64;
    fn completed_value(&self, queue: QueueKind) -> u64;
    /// GPU-side wait: `waiting` stalls until `source`'s fence passes `value`.
    fn queue_wait(&self, waiting: QueueKind, source: QueueKind, value: u64);
    /// CPU-side blocking wait on `queue`'s fence.
    fn wait_cpu(&self, queue: QueueKind, value: u64);

    fn accel_prebuild_info(&self, inputs: &AccelBuildInputs) -> AccelPrebuildInfo;

    /// Timestamp ticks per second.
    fn timestamp_frequency(&self) -> u64;

    fn identity(&self) -> DeviceIdentity;
}
