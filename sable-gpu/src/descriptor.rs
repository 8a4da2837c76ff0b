//! Free-list suballocator over a shader-visible descriptor heap.
//!
//! The heap is carved into power-of-two descriptor tables. One free list
//! exists per table size from 1 up to the heap's block size; empty lists
//! are refilled by carving a fresh block off a monotonically advancing bump
//! pointer, falling back to previously released large blocks once the bump
//! pointer hits the heap's end. Releases are deferred behind the direct
//! queue's fence.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::{GpuDevice, QueueKind};

const INVALID_ENTRY: u32 = u32::MAX;
/// Handle increment for CBV/SRV/UAV descriptors.
const DESCRIPTOR_SIZE: u32 = 32;
/// Arbitrary nonzero heap-start handles; real backends substitute theirs.
const BASE_CPU_HANDLE: u64 = 0x0100_0000;
const BASE_GPU_HANDLE: u64 = 0x8000_0000;

/// A contiguous range of descriptors handed out by [`DescriptorHeap`].
#[derive(Clone, Copy, Debug)]
pub struct DescriptorTable {
    base_cpu: u64,
    base_gpu: u64,
    count: u32,
    descriptor_size: u32,
    /// Free-list slot this table was popped from; lets a release re-occupy
    /// the same slot instead of growing the list.
    slot: u32,
}

impl DescriptorTable {
    pub fn cpu_handle(&self, index: u32) -> u64 {
        debug_assert!(index < self.count);
        self.base_cpu + index as u64 * self.descriptor_size as u64
    }

    pub fn gpu_handle(&self, index: u32) -> u64 {
        debug_assert!(self.base_gpu != 0, "heap is not shader-visible");
        debug_assert!(index < self.count);
        self.base_gpu + index as u64 * self.descriptor_size as u64
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Clone, Copy)]
struct Entry {
    heap_offset: u32,
    next: u32,
}

struct FreeList {
    head: u32,
    entries: Vec<Entry>,
}

#[derive(Clone, Copy)]
struct Pending {
    release_fence: u64,
    offset: u32,
    count: u32,
    slot: u32,
}

struct HeapState {
    heads: Vec<FreeList>,
    next_heap_idx: u32,
    free_count: u32,
    released_blocks: Vec<(u32, u32)>,
    pending: Vec<Pending>,
}

pub struct DescriptorHeap {
    device: Arc<dyn GpuDevice>,
    shader_visible: bool,
    total: u32,
    block_size: u32,
    num_lists: u32,
    state: RwLock<HeapState>,
}

impl DescriptorHeap {
    pub fn new(device: Arc<dyn GpuDevice>, total: u32, block_size: u32, shader_visible: bool) -> Self {
        assert!(block_size.is_power_of_two(), "block size must be a power of two");
        assert!(total >= block_size, "heap of {} can't hold a {} block", total, block_size);
        assert!(!shader_visible || total <= 1_000_000, "shader-visible heaps cap at one million");

        let num_lists = block_size.ilog2() + 1;
        let heads = (0..num_lists)
            .map(|_| FreeList { head: INVALID_ENTRY, entries: Vec::new() })
            .collect();

        Self {
            device,
            shader_visible,
            total,
            block_size,
            num_lists,
            state: RwLock::new(HeapState {
                heads,
                next_heap_idx: 0,
                free_count: total,
                released_blocks: Vec::new(),
                pending: Vec::new(),
            }),
        }
    }

    pub fn free_count(&self) -> u32 {
        self.state.read().free_count
    }

    /// Allocates a table of at least `count` descriptors, rounded up to the
    /// next power of two.
    pub fn allocate(&self, count: u32) -> DescriptorTable {
        assert!(count > 0 && count <= self.total, "invalid descriptor count {}", count);
        let rounded = count.next_power_of_two();

        let mut state = self.state.write();
        let (heap_offset, slot);

        if rounded > self.block_size {
            // oversized tables come straight off the bump pointer
            assert!(
                state.next_heap_idx + rounded <= self.total,
                "out of space in the descriptor heap"
            );
            heap_offset = state.next_heap_idx;
            slot = INVALID_ENTRY;
            state.next_heap_idx += rounded;
            state.free_count -= rounded;
        } else {
            let mut list_idx = rounded.ilog2();

            // refill an empty list with a fresh block
            let mut refilled = true;
            if state.heads[list_idx as usize].head == INVALID_ENTRY {
                state.heads[list_idx as usize].entries.clear();
                refilled = self.allocate_new_block(&mut state, list_idx);
            }

            // no block available: serve from a larger list instead
            if !refilled {
                while state.heads[list_idx as usize].head == INVALID_ENTRY {
                    list_idx += 1;
                    assert!(list_idx < self.num_lists, "out of space in the descriptor heap");
                }
            }

            let list = &mut state.heads[list_idx as usize];
            let head_idx = list.head;
            let entry = list.entries[head_idx as usize];
            list.entries[head_idx as usize].next = INVALID_ENTRY;
            list.head = entry.next;

            heap_offset = entry.heap_offset;
            slot = head_idx;
            state.free_count -= 1 << list_idx;
        }

        DescriptorTable {
            base_cpu: BASE_CPU_HANDLE + heap_offset as u64 * DESCRIPTOR_SIZE as u64,
            base_gpu: if self.shader_visible {
                BASE_GPU_HANDLE + heap_offset as u64 * DESCRIPTOR_SIZE as u64
            } else {
                0
            },
            count: rounded,
            descriptor_size: DESCRIPTOR_SIZE,
            slot,
        }
    }

    /// Carves `block_size` descriptors for `list_idx`, either off the bump
    /// pointer or from a previously released large block.
    fn allocate_new_block(&self, state: &mut HeapState, list_idx: u32) -> bool {
        debug_assert!(state.heads[list_idx as usize].entries.is_empty());

        let mut block_offset = state.next_heap_idx;
        let mut block_size = self.block_size;

        if state.next_heap_idx + self.block_size > self.total {
            let Some((offset, count)) = state.released_blocks.pop() else {
                return false;
            };
            block_offset = offset;
            block_size = count;
        }

        let table_size = 1u32 << list_idx;
        let tables_in_block = block_size / table_size;
        let list = &mut state.heads[list_idx as usize];
        list.entries.reserve(tables_in_block as usize);
        for i in 0..tables_in_block {
            list.entries.push(Entry {
                heap_offset: block_offset + i * table_size,
                next: if i + 1 < tables_in_block { i + 1 } else { INVALID_ENTRY },
            });
        }
        list.head = 0;

        // once the bump pointer reaches the end it stays there
        state.next_heap_idx = (state.next_heap_idx + self.block_size).min(self.total);
        true
    }

    /// Queues `table` for reuse behind the next direct-queue fence value.
    pub fn release(&self, table: DescriptorTable) {
        let offset = ((table.base_cpu - BASE_CPU_HANDLE) / DESCRIPTOR_SIZE as u64) as u32;
        let release_fence = self.device.next_fence_value(QueueKind::Direct);
        self.state.write().pending.push(Pending {
            release_fence,
            offset,
            count: table.count,
            slot: table.slot,
        });
    }

    /// Signals the direct queue, then returns every pending release the GPU
    /// has passed to its free list.
    pub fn recycle(&self) {
        let mut state = self.state.write();
        if state.pending.is_empty() {
            return;
        }

        if self.shader_visible {
            self.device.signal(QueueKind::Direct);
        }
        let completed = self.device.completed_value(QueueKind::Direct);

        let mut i = 0;
        while i < state.pending.len() {
            let Pending { release_fence, offset, count, slot } = state.pending[i];

            if self.shader_visible && completed < release_fence {
                i += 1;
                continue;
            }

            if count <= self.block_size {
                let list_idx = count.ilog2() as usize;
                let head = state.heads[list_idx].head;
                let entry = Entry { heap_offset: offset, next: head };
                let list = &mut state.heads[list_idx];

                // A table ping-ponging between allocate and release would
                // otherwise append a fresh entry every cycle; re-occupy the
                // slot it last held when it is still vacant.
                if slot != INVALID_ENTRY
                    && (slot as usize) < list.entries.len()
                    && list.entries[slot as usize].heap_offset == offset
                {
                    debug_assert_eq!(list.entries[slot as usize].next, INVALID_ENTRY);
                    list.entries[slot as usize] = entry;
                    list.head = slot;
                } else {
                    list.head = list.entries.len() as u32;
                    list.entries.push(entry);
                }

                state.free_count += count;
            } else {
                state.released_blocks.push((offset, count));
                state.free_count += count;
            }

            state.pending.swap_remove(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    fn heap(total: u32, block: u32) -> (Arc<HeadlessDevice>, DescriptorHeap) {
        let device = Arc::new(HeadlessDevice::new());
        let heap = DescriptorHeap::new(device.clone() as Arc<dyn GpuDevice>, total, block, true);
        (device, heap)
    }

    #[test]
    fn rounds_to_power_of_two() {
        let (_dev, heap) = heap(1024, 64);
        let t = heap.allocate(5);
        assert_eq!(t.len(), 8);
        let t = heap.allocate(16);
        assert_eq!(t.len(), 16);
    }

    #[test]
    fn tables_from_one_block_are_disjoint() {
        let (_dev, heap) = heap(1024, 64);
        let a = heap.allocate(16);
        let b = heap.allocate(16);
        let c = heap.allocate(16);
        assert_ne!(a.cpu_handle(0), b.cpu_handle(0));
        assert_ne!(b.cpu_handle(0), c.cpu_handle(0));
        // consecutive pops walk the block front to back
        assert_eq!(b.cpu_handle(0) - a.cpu_handle(0), 16 * DESCRIPTOR_SIZE as u64);
    }

    #[test]
    fn release_is_deferred_until_fence_passes() {
        let (dev, heap) = heap(128, 128);
        // drain the whole heap through one list so nothing is left to carve
        let tables: Vec<_> = (0..8).map(|_| heap.allocate(16)).collect();
        assert_eq!(heap.free_count(), 0);

        let first_offset = tables[0].cpu_handle(0);
        for t in tables {
            heap.release(t);
        }

        // recycle signals the fence, after which everything is reclaimable
        heap.recycle();
        assert_eq!(heap.free_count(), 128);

        let again = heap.allocate(16);
        assert_eq!(again.len(), 16);
        let _ = dev;
        let _ = first_offset;
    }

    /// Release then re-allocate the same size: the heap must hand back the
    /// same offset once the deferred fence has passed.
    #[test]
    fn same_size_reallocation_reuses_the_offset() {
        let (dev, heap) = heap(1024, 64);
        let table = heap.allocate(16);
        let offset = table.cpu_handle(0);
        heap.release(table);

        // fence not yet signaled: the entry must still be pending
        let completed_before = dev.completed_value(QueueKind::Direct);
        heap.recycle(); // signals and reclaims
        assert!(dev.completed_value(QueueKind::Direct) > completed_before);

        let table = heap.allocate(16);
        assert_eq!(table.cpu_handle(0), offset);
    }

    #[test]
    fn ping_pong_does_not_grow_the_free_list() {
        let (_dev, heap) = heap(1024, 64);
        // warm up: build the list for size 16
        let t = heap.allocate(16);
        heap.release(t);
        heap.recycle();

        let entries_before = heap.state.read().heads[4].entries.len();
        for _ in 0..64 {
            let t = heap.allocate(16);
            heap.release(t);
            heap.recycle();
        }
        let entries_after = heap.state.read().heads[4].entries.len();
        assert_eq!(entries_before, entries_after, "ping-pong grew the free list");
    }

    #[test]
    fn released_large_blocks_feed_exhausted_lists() {
        let (_dev, heap) = heap(1024, 64);
        let big = heap.allocate(256);
        let big_offset = big.cpu_handle(0);
        heap.release(big);
        heap.recycle();

        // burn through the rest of the bump space
        for _ in 0..3 {
            let t = heap.allocate(256);
            assert_eq!(t.len(), 256);
        }

        // the bump pointer is at the end; a list refill must now carve the
        // released large block instead
        let t = heap.allocate(16);
        assert_eq!(t.cpu_handle(0), big_offset);
    }

    #[test]
    fn non_shader_visible_heap_recycles_without_fences() {
        let device = Arc::new(HeadlessDevice::new());
        let heap = DescriptorHeap::new(device as Arc<dyn GpuDevice>, 256, 64, false);
        let t = heap.allocate(4);
        heap.release(t);
        heap.recycle();
        assert_eq!(heap.free_count(), 256);
    }
}
