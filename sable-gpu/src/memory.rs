//! GPU memory management: per-thread upload rings, readback buffers, and
//! pooled default-heap allocations with fence-deferred recycling.
//!
//! Release never frees immediately. Everything released is queued with the
//! direct queue's *next* fence value and becomes reusable once `recycle`
//! observes that value completed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use sable_task::{ThreadIndexTable, MAX_THREADS};

use crate::device::{BufferDesc, BufferKind, GpuBuffer, GpuDevice, QueueKind, ResourceId};
use crate::path_hash;
use crate::state::ResourceState;

/// Granularity of the per-thread upload rings. Oversized requests get a
/// dedicated page.
const UPLOAD_PAGE_SIZE: u64 = 256 * 1024;

#[derive(Clone, Copy, Debug)]
struct PageHandle {
    thread_idx: u16,
    pool_idx: u16,
}

/// A suballocation out of a thread's upload ring. The mapped pointer stays
/// valid until the allocation is released back to [`GpuMemory`].
pub struct UploadHeapBuffer {
    resource: GpuBuffer,
    offset: u64,
    gpu_va: u64,
    ptr: *mut u8,
    size: u64,
    page: PageHandle,
}

unsafe impl Send for UploadHeapBuffer {}

impl UploadHeapBuffer {
    pub fn resource(&self) -> GpuBuffer {
        self.resource
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn gpu_va(&self) -> u64 {
        self.gpu_va
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copies `data` into the mapped allocation at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.size as usize, "upload overrun");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }
    }
}

/// A standalone readback allocation with an explicit map/unmap contract:
/// the mapped pointer is not persistent across GPU writes.
pub struct ReadbackHeapBuffer {
    resource: GpuBuffer,
    mapped: *mut u8,
}

unsafe impl Send for ReadbackHeapBuffer {}

impl ReadbackHeapBuffer {
    pub fn resource(&self) -> GpuBuffer {
        self.resource
    }

    pub fn size(&self) -> u64 {
        self.resource.size()
    }

    pub fn mapped_ptr(&self) -> *mut u8 {
        debug_assert!(!self.mapped.is_null(), "readback buffer is not mapped");
        self.mapped
    }

    /// Reads `len` bytes starting at `offset` out of the mapped buffer.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        debug_assert!(!self.mapped.is_null(), "readback buffer is not mapped");
        assert!(offset + len <= self.size() as usize);
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.mapped.add(offset), out.as_mut_ptr(), len);
        }
        out
    }
}

/// A pooled GPU-local buffer with a stable path identity derived from its
/// debug name.
#[derive(Clone, Copy, Debug)]
pub struct DefaultHeapBuffer {
    path_id: u64,
    resource: GpuBuffer,
}

impl DefaultHeapBuffer {
    pub fn path_id(&self) -> u64 {
        self.path_id
    }

    pub fn resource(&self) -> GpuBuffer {
        self.resource
    }

    pub fn id(&self) -> ResourceId {
        self.resource.id()
    }

    pub fn gpu_va(&self) -> u64 {
        self.resource.gpu_va()
    }

    pub fn size(&self) -> u64 {
        self.resource.size()
    }
}

struct UploadPage {
    buffer: GpuBuffer,
    capacity: u64,
    head: u64,
    /// Live suballocations on this page.
    outstanding: u32,
    /// No longer the bump target; waiting for its allocations to drain.
    retired: bool,
}

struct StagedCopy {
    src: GpuBuffer,
    src_offset: u64,
    dst: GpuBuffer,
    bytes: u64,
}

#[derive(Default)]
struct ThreadContext {
    pages: Vec<Option<UploadPage>>,
    current: Option<usize>,
    free_slots: Vec<usize>,
    /// (fence, pool index) pairs waiting on the GPU.
    pending_pages: Vec<(u64, usize)>,
    /// Released default-heap/readback resources waiting on the GPU.
    pending_releases: Vec<(u64, GpuBuffer)>,
    /// Copies batched into the end-of-frame resource-upload list.
    staged_copies: Vec<StagedCopy>,
}

/// Process-wide GPU memory service. Per-thread state is sized to the
/// platform's maximum thread count; each slot is guarded by its own lock so
/// same-thread access never contends and cross-thread releases stay legal.
pub struct GpuMemory {
    device: Arc<dyn GpuDevice>,
    threads: Vec<Mutex<ThreadContext>>,
    thread_table: Arc<ThreadIndexTable>,
    frame_index: AtomicU64,
}

impl GpuMemory {
    pub fn new(device: Arc<dyn GpuDevice>, thread_table: Arc<ThreadIndexTable>) -> Self {
        Self {
            device,
            threads: (0..MAX_THREADS).map(|_| Mutex::new(ThreadContext::default())).collect(),
            thread_table,
            frame_index: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn begin_frame(&self) {
        self.frame_index.fetch_add(1, Ordering::Relaxed);
    }

    //-------------------------------------------------------------------------
    // Upload heap
    //-------------------------------------------------------------------------

    /// Suballocates `size` bytes (aligned to `alignment`) from the calling
    /// thread's upload ring.
    pub fn get_upload_heap_buffer(&self, size: u64, alignment: u64) -> UploadHeapBuffer {
        debug_assert!(alignment.is_power_of_two());
        let thread_idx = self.thread_table.current_index();
        let mut ctx = self.threads[thread_idx].lock();

        // retire the current page if the request does not fit
        if let Some(idx) = ctx.current {
            let fits = {
                let page = ctx.pages[idx].as_ref().expect("current page missing");
                align_up(page.head, alignment) + size <= page.capacity
            };
            if !fits {
                self.retire_page(&mut ctx, idx);
                ctx.current = None;
            }
        }

        let pool_idx = match ctx.current {
            Some(idx) => idx,
            None => {
                let idx = self.acquire_page(&mut ctx, size.max(UPLOAD_PAGE_SIZE));
                ctx.current = Some(idx);
                idx
            }
        };

        let page = ctx.pages[pool_idx].as_mut().expect("page slot empty");
        let offset = align_up(page.head, alignment);
        page.head = offset + size;
        page.outstanding += 1;

        UploadHeapBuffer {
            resource: page.buffer,
            offset,
            gpu_va: page.buffer.gpu_va() + offset,
            ptr: unsafe { page.buffer.data().add(offset as usize) },
            size,
            page: PageHandle {
                thread_idx: thread_idx as u16,
                pool_idx: pool_idx as u16,
            },
        }
    }

    /// Returns an upload allocation. Its page is queued for reuse with the
    /// next direct-queue fence once all of its allocations are back.
    pub fn release_upload_heap_buffer(&self, buffer: UploadHeapBuffer) {
        let ctx = &self.threads[buffer.page.thread_idx as usize];
        let mut ctx = ctx.lock();
        let pool_idx = buffer.page.pool_idx as usize;
        {
            let page = ctx.pages[pool_idx].as_mut().expect("released into empty page slot");
            debug_assert!(page.outstanding > 0);
            page.outstanding -= 1;
        }
        let drained = {
            let page = ctx.pages[pool_idx].as_ref().unwrap();
            page.retired && page.outstanding == 0
        };
        if drained {
            let fence = self.device.next_fence_value(QueueKind::Direct);
            ctx.pending_pages.push((fence, pool_idx));
        }
    }

    fn acquire_page(&self, ctx: &mut ThreadContext, capacity: u64) -> usize {
        // prefer a reclaimed slot whose buffer is big enough
        if let Some(pos) = ctx
            .free_slots
            .iter()
            .position(|&slot| ctx.pages[slot].as_ref().is_some_and(|p| p.capacity >= capacity))
        {
            let slot = ctx.free_slots.swap_remove(pos);
            let page = ctx.pages[slot].as_mut().unwrap();
            page.head = 0;
            page.retired = false;
            debug_assert_eq!(page.outstanding, 0);
            return slot;
        }

        let buffer = self
            .device
            .create_buffer(&BufferDesc {
                name: "upload_ring_page",
                size: capacity,
                kind: BufferKind::Upload,
                initial_state: ResourceState::GENERIC_READ,
                allow_uav: false,
            })
            .expect("upload page allocation failed");

        let page = UploadPage {
            buffer,
            capacity,
            head: 0,
            outstanding: 0,
            retired: false,
        };
        let slot = match ctx.pages.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                ctx.pages.push(None);
                ctx.pages.len() - 1
            }
        };
        ctx.pages[slot] = Some(page);
        slot
    }

    fn retire_page(&self, ctx: &mut ThreadContext, pool_idx: usize) {
        let page = ctx.pages[pool_idx].as_mut().expect("retiring empty page slot");
        page.retired = true;
        if page.outstanding == 0 {
            let fence = self.device.next_fence_value(QueueKind::Direct);
            ctx.pending_pages.push((fence, pool_idx));
        }
    }

    //-------------------------------------------------------------------------
    // Readback heap
    //-------------------------------------------------------------------------

    pub fn get_readback_heap_buffer(&self, size: u64) -> ReadbackHeapBuffer {
        let resource = self
            .device
            .create_buffer(&BufferDesc {
                name: "readback",
                size,
                kind: BufferKind::Readback,
                initial_state: ResourceState::COPY_DEST,
                allow_uav: false,
            })
            .expect("readback allocation failed");
        ReadbackHeapBuffer {
            resource,
            mapped: std::ptr::null_mut(),
        }
    }

    pub fn map_readback(&self, buffer: &mut ReadbackHeapBuffer) {
        buffer.mapped = self.device.map_buffer(buffer.resource);
    }

    pub fn unmap_readback(&self, buffer: &mut ReadbackHeapBuffer) {
        self.device.unmap_buffer(buffer.resource);
        buffer.mapped = std::ptr::null_mut();
    }

    pub fn release_readback_heap_buffer(&self, buffer: ReadbackHeapBuffer) {
        self.defer_release(buffer.resource);
    }

    //-------------------------------------------------------------------------
    // Default heap
    //-------------------------------------------------------------------------

    pub fn get_default_heap_buffer(
        &self,
        name: &str,
        size: u64,
        initial_state: ResourceState,
        allow_uav: bool,
    ) -> DefaultHeapBuffer {
        let resource = self
            .device
            .create_buffer(&BufferDesc {
                name,
                size,
                kind: BufferKind::Default,
                initial_state,
                allow_uav,
            })
            .expect("default-heap allocation failed");
        DefaultHeapBuffer {
            path_id: path_hash(name),
            resource,
        }
    }

    /// Creates a default-heap buffer and stages `data` into it; the copy
    /// lands on the resource-upload command list at end of frame.
    pub fn get_default_heap_buffer_init(
        &self,
        name: &str,
        size: u64,
        post_copy_state: ResourceState,
        allow_uav: bool,
        data: &[u8],
    ) -> DefaultHeapBuffer {
        debug_assert!(data.len() as u64 <= size);
        let buffer = self.get_default_heap_buffer(name, size, post_copy_state, allow_uav);
        self.upload_to_default_heap_buffer(&buffer, data);
        buffer
    }

    pub fn upload_to_default_heap_buffer(&self, buffer: &DefaultHeapBuffer, data: &[u8]) {
        let staging = self.get_upload_heap_buffer(data.len() as u64, 16);
        staging.write(0, data);

        let thread_idx = self.thread_table.current_index();
        let mut ctx = self.threads[thread_idx].lock();
        ctx.staged_copies.push(StagedCopy {
            src: staging.resource(),
            src_offset: staging.offset(),
            dst: buffer.resource(),
            bytes: data.len() as u64,
        });
        drop(ctx);
        // the staging block rides the normal fence-deferred path
        self.release_upload_heap_buffer(staging);
    }

    pub fn release_default_heap_buffer(&self, buffer: DefaultHeapBuffer) {
        self.defer_release(buffer.resource);
    }

    fn defer_release(&self, resource: GpuBuffer) {
        let fence = self.device.next_fence_value(QueueKind::Direct);
        let thread_idx = self.thread_table.current_index();
        self.threads[thread_idx].lock().pending_releases.push((fence, resource));
    }

    //-------------------------------------------------------------------------
    // Frame maintenance
    //-------------------------------------------------------------------------

    /// Submits every staged copy on one dedicated upload command list.
    /// Called once at end of frame, before present.
    pub fn submit_resource_copies(&self) {
        profiling::scope!("submit_resource_copies");

        let mut copies = Vec::new();
        for slot in &self.threads {
            copies.append(&mut slot.lock().staged_copies);
        }
        if copies.is_empty() {
            return;
        }

        let mut list = self.device.begin_command_list(QueueKind::Direct);
        list.set_name("resource_upload");
        for copy in &copies {
            list.copy_buffer(copy.src, copy.src_offset, copy.dst, 0, copy.bytes);
        }
        let fence = self.device.submit(list);
        log::debug!("submitted {} resource copies (fence {})", copies.len(), fence);
    }

    /// Walks each thread's pending lists once and releases everything whose
    /// fence value has completed on the direct queue.
    pub fn recycle(&self) {
        profiling::scope!("gpu_memory_recycle");
        let completed = self.device.completed_value(QueueKind::Direct);

        for slot in &self.threads {
            let mut ctx = slot.lock();

            let mut i = 0;
            while i < ctx.pending_pages.len() {
                if ctx.pending_pages[i].0 <= completed {
                    let (_, pool_idx) = ctx.pending_pages.swap_remove(i);
                    ctx.free_slots.push(pool_idx);
                } else {
                    i += 1;
                }
            }

            let mut i = 0;
            while i < ctx.pending_releases.len() {
                if ctx.pending_releases[i].0 <= completed {
                    let (_, resource) = ctx.pending_releases.swap_remove(i);
                    self.device.destroy_buffer(resource);
                } else {
                    i += 1;
                }
            }
        }
    }

    /// Drains every pending release regardless of fences. Shutdown only,
    /// after the terminal fence wait.
    pub fn shutdown(&self) {
        for slot in &self.threads {
            let mut ctx = slot.lock();
            for (_, resource) in ctx.pending_releases.drain(..) {
                self.device.destroy_buffer(resource);
            }
            ctx.pending_pages.clear();
            for page in ctx.pages.drain(..).flatten() {
                self.device.destroy_buffer(page.buffer);
            }
            ctx.current = None;
            ctx.free_slots.clear();
        }
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}
