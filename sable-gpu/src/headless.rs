//! In-process device implementation.
//!
//! Buffers are CPU-backed, submissions execute their recorded commands
//! immediately, and each submit signals its queue's fence. Fence values
//! therefore behave exactly like the real thing with a zero-latency GPU:
//! a value only completes once something signals it, so fence-deferred
//! recycling paths still see genuinely pending entries.
//!
//! Tests inspect the submission log to assert on barriers, copies, and
//! cross-queue waits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};
use slotmap::SlotMap;

use crate::device::*;

const VA_ALIGNMENT: u64 = 256;
/// Fixed overhead plus per-primitive cost for acceleration structures.
const ACCEL_BASE_SIZE: u64 = 256;
const ACCEL_PER_TRIANGLE: u64 = 64;
const ACCEL_PER_INSTANCE: u64 = 64;

struct BufferEntry {
    name: String,
    size: u64,
    kind: BufferKind,
    storage: Box<[u8]>,
    gpu_va: u64,
    mapped: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordedCommand {
    Barriers(Vec<Barrier>),
    CopyBuffer {
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        dst_offset: u64,
        bytes: u64,
    },
    BuildAccel {
        dest_va: u64,
        source_va: u64,
        compacted_size_dst_va: u64,
    },
    CompactAccel {
        dest_va: u64,
        src_va: u64,
    },
    WriteTimestamp {
        dst: ResourceId,
        slot: u32,
    },
}

/// One executed command list, in submission order.
#[derive(Clone, Debug)]
pub struct Submission {
    pub queue: QueueKind,
    pub name: String,
    pub fence_value: u64,
    pub commands: Vec<RecordedCommand>,
}

/// A recorded GPU-side cross-queue wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueWait {
    pub waiting: QueueKind,
    pub source: QueueKind,
    pub value: u64,
}

struct FenceState {
    next: AtomicU64,
    completed: AtomicU64,
}

impl FenceState {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            completed: AtomicU64::new(0),
        }
    }
}

struct Hub {
    buffers: SlotMap<BufferKey, BufferEntry>,
    /// va range start -> key, for resolving raw GPU addresses.
    va_ranges: BTreeMap<u64, BufferKey>,
    next_va: u64,
}

pub struct HeadlessDevice {
    hub: RwLock<Hub>,
    direct: FenceState,
    compute: FenceState,
    fence_mutex: Mutex<()>,
    fence_cv: Condvar,
    submissions: Mutex<Vec<Submission>>,
    queue_waits: Mutex<Vec<QueueWait>>,
    /// Monotone tick source backing timestamp writes.
    ticks: AtomicU64,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            hub: RwLock::new(Hub {
                buffers: SlotMap::with_key(),
                va_ranges: BTreeMap::new(),
                next_va: VA_ALIGNMENT,
            }),
            direct: FenceState::new(),
            compute: FenceState::new(),
            fence_mutex: Mutex::new(()),
            fence_cv: Condvar::new(),
            submissions: Mutex::new(Vec::new()),
            queue_waits: Mutex::new(Vec::new()),
            ticks: AtomicU64::new(0),
        }
    }

    fn fence(&self, queue: QueueKind) -> &FenceState {
        match queue {
            QueueKind::Direct => &self.direct,
            QueueKind::Compute => &self.compute,
        }
    }

    fn advance_fence(&self, queue: QueueKind) -> u64 {
        let fence = self.fence(queue);
        let value = fence.next.fetch_add(1, Ordering::AcqRel);
        fence.completed.fetch_max(value, Ordering::AcqRel);
        let _guard = self.fence_mutex.lock();
        self.fence_cv.notify_all();
        value
    }

    /// Deterministic compacted size for an acceleration structure that was
    /// built into `result_size` bytes.
    pub fn compacted_size(result_size: u64) -> u64 {
        (result_size * 55 / 100).next_multiple_of(VA_ALIGNMENT)
    }

    /// Submission log in execution order. Test-facing.
    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    /// Recorded GPU-side cross-queue waits. Test-facing.
    pub fn queue_waits(&self) -> Vec<QueueWait> {
        self.queue_waits.lock().clone()
    }

    pub fn clear_logs(&self) {
        self.submissions.lock().clear();
        self.queue_waits.lock().clear();
    }

    /// Reads `len` bytes out of a buffer. Test-facing.
    pub fn read_buffer(&self, buffer: GpuBuffer, offset: u64, len: u64) -> Vec<u8> {
        let hub = self.hub.read();
        let entry = hub.buffers.get(buffer.key()).expect("stale buffer handle");
        entry.storage[offset as usize..(offset + len) as usize].to_vec()
    }

    /// Debug name a buffer was created with. Test-facing.
    pub fn buffer_name(&self, buffer: GpuBuffer) -> String {
        let hub = self.hub.read();
        hub.buffers
            .get(buffer.key())
            .map(|entry| entry.name.clone())
            .unwrap_or_default()
    }

    fn execute(&self, commands: &[RecordedCommand]) {
        let mut hub = self.hub.write();
        for command in commands {
            match *command {
                RecordedCommand::Barriers(_) => {}
                RecordedCommand::CopyBuffer { src, src_offset, dst, dst_offset, bytes } => {
                    let src_key = resolve_id(&hub, src);
                    let dst_key = resolve_id(&hub, dst);
                    let chunk: Vec<u8> = {
                        let entry = &hub.buffers[src_key];
                        entry.storage[src_offset as usize..(src_offset + bytes) as usize].to_vec()
                    };
                    let entry = &mut hub.buffers[dst_key];
                    entry.storage[dst_offset as usize..(dst_offset + bytes) as usize]
                        .copy_from_slice(&chunk);
                }
                RecordedCommand::BuildAccel { dest_va, compacted_size_dst_va, .. } => {
                    debug_assert_ne!(dest_va, 0, "acceleration structure build without destination");
                    if compacted_size_dst_va != 0 {
                        // postbuild query: write the compacted size where asked
                        let result_size = resolve_va(&hub, dest_va)
                            .map(|(key, _)| hub.buffers[key].size)
                            .unwrap_or(0);
                        let compacted = Self::compacted_size(result_size);
                        if let Some((key, offset)) = resolve_va(&hub, compacted_size_dst_va) {
                            let entry = &mut hub.buffers[key];
                            entry.storage[offset as usize..offset as usize + 8]
                                .copy_from_slice(&compacted.to_le_bytes());
                        }
                    }
                }
                RecordedCommand::CompactAccel { .. } => {}
                RecordedCommand::WriteTimestamp { dst, slot } => {
                    let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
                    let key = resolve_id(&hub, dst);
                    let entry = &mut hub.buffers[key];
                    let offset = slot as usize * 8;
                    entry.storage[offset..offset + 8].copy_from_slice(&tick.to_le_bytes());
                }
            }
        }
    }
}

fn resolve_id(hub: &Hub, id: ResourceId) -> BufferKey {
    let key = slotmap::KeyData::from_ffi(id.0).into();
    debug_assert!(hub.buffers.contains_key(key), "stale resource id in command");
    key
}

/// Maps a raw GPU address back to (buffer, byte offset).
fn resolve_va(hub: &Hub, va: u64) -> Option<(BufferKey, u64)> {
    let (&start, &key) = hub.va_ranges.range(..=va).next_back()?;
    let entry = hub.buffers.get(key)?;
    if va < start + entry.size {
        Some((key, va - start))
    } else {
        None
    }
}

struct HeadlessCommandList {
    queue: QueueKind,
    name: String,
    commands: Vec<RecordedCommand>,
}

impl CommandList for HeadlessCommandList {
    fn queue(&self) -> QueueKind {
        self.queue
    }

    fn set_name(&mut self, name: &str) {
        self.name.clear();
        self.name.push_str(name);
    }

    fn resource_barriers(&mut self, barriers: &[Barrier]) {
        self.commands.push(RecordedCommand::Barriers(barriers.to_vec()));
    }

    fn copy_buffer(&mut self, src: GpuBuffer, src_offset: u64, dst: GpuBuffer, dst_offset: u64, bytes: u64) {
        debug_assert!(src_offset + bytes <= src.size() && dst_offset + bytes <= dst.size());
        self.commands.push(RecordedCommand::CopyBuffer {
            src: src.id(),
            src_offset,
            dst: dst.id(),
            dst_offset,
            bytes,
        });
    }

    fn build_acceleration_structure(&mut self, desc: &AccelBuildDesc) {
        self.commands.push(RecordedCommand::BuildAccel {
            dest_va: desc.dest_va,
            source_va: desc.source_va,
            compacted_size_dst_va: desc.compacted_size_dst_va,
        });
    }

    fn compact_acceleration_structure(&mut self, dest_va: u64, src_va: u64) {
        self.commands.push(RecordedCommand::CompactAccel { dest_va, src_va });
    }

    fn write_timestamp(&mut self, dst: GpuBuffer, slot: u32) {
        debug_assert!((slot as u64 + 1) * 8 <= dst.size());
        self.commands.push(RecordedCommand::WriteTimestamp { dst: dst.id(), slot });
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer, DeviceError> {
        let mut hub = self.hub.write();
        let size = desc.size.max(1);
        let gpu_va = hub.next_va;
        hub.next_va = (gpu_va + size).next_multiple_of(VA_ALIGNMENT);

        let mut entry = BufferEntry {
            name: desc.name.to_owned(),
            size,
            kind: desc.kind,
            storage: vec![0u8; size as usize].into_boxed_slice(),
            gpu_va,
            mapped: false,
        };
        // upload heaps stay persistently mapped
        let data = if desc.kind == BufferKind::Upload {
            entry.mapped = true;
            entry.storage.as_mut_ptr()
        } else {
            std::ptr::null_mut()
        };

        let key = hub.buffers.insert(entry);
        hub.va_ranges.insert(gpu_va, key);

        Ok(GpuBuffer { raw: key, size, gpu_va, data })
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        let mut hub = self.hub.write();
        if let Some(entry) = hub.buffers.remove(buffer.key()) {
            hub.va_ranges.remove(&entry.gpu_va);
        }
    }

    fn map_buffer(&self, buffer: GpuBuffer) -> *mut u8 {
        let mut hub = self.hub.write();
        let entry = hub.buffers.get_mut(buffer.key()).expect("stale buffer handle");
        debug_assert!(entry.kind == BufferKind::Readback, "only readback buffers re-map");
        debug_assert!(!entry.mapped, "buffer '{}' mapped twice", entry.name);
        entry.mapped = true;
        entry.storage.as_mut_ptr()
    }

    fn unmap_buffer(&self, buffer: GpuBuffer) {
        let mut hub = self.hub.write();
        if let Some(entry) = hub.buffers.get_mut(buffer.key()) {
            entry.mapped = false;
        }
    }

    fn begin_command_list(&self, queue: QueueKind) -> Box<dyn CommandList> {
        Box::new(HeadlessCommandList {
            queue,
            name: String::new(),
            commands: Vec::new(),
        })
    }

    fn submit(&self, mut list: Box<dyn CommandList>) -> u64 {
        let queue = list.queue();
        let list = list
            .as_any()
            .downcast_mut::<HeadlessCommandList>()
            .expect("foreign command list submitted to the headless device");

        self.execute(&list.commands);
        let fence_value = self.advance_fence(queue);
        self.submissions.lock().push(Submission {
            queue,
            name: std::mem::take(&mut list.name),
            fence_value,
            commands: std::mem::take(&mut list.commands),
        });
        fence_value
    }

    fn signal(&self, queue: QueueKind) -> u64 {
        self.advance_fence(queue)
    }

    fn next_fence_value(&self, queue: QueueKind) -> u64 {
        self.fence(queue).next.load(Ordering::Acquire)
    }

    fn completed_value(&self, queue: QueueKind) -> u64 {
        self.fence(queue).completed.load(Ordering::Acquire)
    }

    fn queue_wait(&self, waiting: QueueKind, source: QueueKind, value: u64) {
        self.queue_waits.lock().push(QueueWait { waiting, source, value });
    }

    fn wait_cpu(&self, queue: QueueKind, value: u64) {
        let fence = self.fence(queue);
        let mut guard = self.fence_mutex.lock();
        while fence.completed.load(Ordering::Acquire) < value {
            self.fence_cv.wait(&mut guard);
        }
    }

    fn accel_prebuild_info(&self, inputs: &AccelBuildInputs) -> AccelPrebuildInfo {
        let result_size = match inputs {
            AccelBuildInputs::BottomLevel { geometries, .. } => {
                let triangles: u64 = geometries.iter().map(|g| (g.index_count / 3) as u64).sum();
                ACCEL_BASE_SIZE + triangles * ACCEL_PER_TRIANGLE
            }
            AccelBuildInputs::TopLevel { instance_count, .. } => {
                ACCEL_BASE_SIZE + *instance_count as u64 * ACCEL_PER_INSTANCE
            }
        };
        AccelPrebuildInfo {
            result_size,
            scratch_size: (result_size / 2).max(VA_ALIGNMENT),
            update_scratch_size: (result_size / 4).max(VA_ALIGNMENT),
        }
    }

    fn timestamp_frequency(&self) -> u64 {
        // one tick per nanosecond
        1_000_000_000
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            adapter_id: 0x5ab1_e000,
            driver_version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ResourceState;

    fn device() -> HeadlessDevice {
        HeadlessDevice::new()
    }

    fn make_buffer(dev: &HeadlessDevice, name: &str, size: u64, kind: BufferKind) -> GpuBuffer {
        dev.create_buffer(&BufferDesc {
            name,
            size,
            kind,
            initial_state: ResourceState::COMMON,
            allow_uav: false,
        })
        .unwrap()
    }

    #[test]
    fn fences_complete_on_signal_only() {
        let dev = device();
        assert_eq!(dev.completed_value(QueueKind::Direct), 0);
        assert_eq!(dev.next_fence_value(QueueKind::Direct), 1);

        let v = dev.signal(QueueKind::Direct);
        assert_eq!(v, 1);
        assert_eq!(dev.completed_value(QueueKind::Direct), 1);
        assert_eq!(dev.next_fence_value(QueueKind::Direct), 2);
        // queues are independent
        assert_eq!(dev.completed_value(QueueKind::Compute), 0);
    }

    #[test]
    fn submit_executes_copies() {
        let dev = device();
        let src = make_buffer(&dev, "src", 64, BufferKind::Upload);
        let dst = make_buffer(&dev, "dst", 64, BufferKind::Default);

        unsafe {
            std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), src.data(), 4);
        }

        let mut list = dev.begin_command_list(QueueKind::Direct);
        list.copy_buffer(src, 0, dst, 8, 4);
        let fence = dev.submit(list);

        assert_eq!(dev.completed_value(QueueKind::Direct), fence);
        assert_eq!(dev.read_buffer(dst, 8, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn upload_buffers_are_persistently_mapped() {
        let dev = device();
        let up = make_buffer(&dev, "up", 16, BufferKind::Upload);
        assert!(!up.data().is_null());
        let def = make_buffer(&dev, "def", 16, BufferKind::Default);
        assert!(def.data().is_null());
    }

    #[test]
    fn postbuild_query_writes_compacted_size() {
        let dev = device();
        let inputs = AccelBuildInputs::BottomLevel {
            geometries: vec![AccelGeometry {
                vertex_va: 0,
                vertex_count: 300,
                vertex_stride: 32,
                index_va: 0,
                index_count: 300,
                transform_va: 0,
            }],
            flags: AccelBuildFlags::ALLOW_COMPACTION,
        };
        let prebuild = dev.accel_prebuild_info(&inputs);
        let blas = make_buffer(&dev, "blas", prebuild.result_size, BufferKind::Default);
        let postbuild = make_buffer(&dev, "postbuild", 8, BufferKind::Default);

        let mut list = dev.begin_command_list(QueueKind::Compute);
        list.build_acceleration_structure(&AccelBuildDesc {
            inputs,
            dest_va: blas.gpu_va(),
            scratch_va: 0,
            source_va: 0,
            compacted_size_dst_va: postbuild.gpu_va(),
        });
        dev.submit(list);

        let bytes = dev.read_buffer(postbuild, 0, 8);
        let compacted = u64::from_le_bytes(bytes.try_into().unwrap());
        assert_eq!(compacted, HeadlessDevice::compacted_size(prebuild.result_size));
        assert!(compacted < prebuild.result_size);
    }

    #[test]
    fn queue_waits_are_recorded() {
        let dev = device();
        dev.queue_wait(QueueKind::Compute, QueueKind::Direct, 3);
        assert_eq!(
            dev.queue_waits(),
            vec![QueueWait { waiting: QueueKind::Compute, source: QueueKind::Direct, value: 3 }]
        );
    }
}
