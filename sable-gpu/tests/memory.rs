//! Fenced recycling behavior of the GPU memory service.

use std::sync::Arc;

use sable_gpu::{
    GpuDevice, GpuMemory, HeadlessDevice, QueueKind, RecordedCommand, ResourceState,
};
use sable_task::ThreadIndexTable;

fn service() -> (Arc<HeadlessDevice>, GpuMemory) {
    let device = Arc::new(HeadlessDevice::new());
    let table = Arc::new(ThreadIndexTable::new());
    table.register_current();
    let memory = GpuMemory::new(device.clone() as Arc<dyn GpuDevice>, table);
    (device, memory)
}

#[test]
fn upload_allocations_are_mapped_and_addressable() {
    let (_device, memory) = service();
    let a = memory.get_upload_heap_buffer(256, 16);
    let b = memory.get_upload_heap_buffer(64, 256);

    // same page, non-overlapping, aligned
    assert_eq!(a.resource(), b.resource());
    assert_eq!(b.offset() % 256, 0);
    assert!(b.offset() >= a.offset() + a.size());
    assert_eq!(a.gpu_va(), a.resource().gpu_va() + a.offset());

    a.write(0, &[7u8; 16]);
    memory.release_upload_heap_buffer(a);
    memory.release_upload_heap_buffer(b);
}

#[test]
fn upload_pages_recycle_only_after_their_fence() {
    let (device, memory) = service();

    // fill one page and force a second so the first retires
    let first = memory.get_upload_heap_buffer(200 * 1024, 16);
    let first_page = first.resource();
    let second = memory.get_upload_heap_buffer(200 * 1024, 16);
    assert_ne!(first_page, second.resource());

    memory.release_upload_heap_buffer(first);
    // fence not signaled yet: the page must not come back
    memory.recycle();
    let third = memory.get_upload_heap_buffer(200 * 1024, 16);
    assert_ne!(third.resource(), first_page);
    memory.release_upload_heap_buffer(third);

    // signal the pending value, recycle, and the retired page is reused
    device.signal(QueueKind::Direct);
    memory.recycle();
    memory.release_upload_heap_buffer(second);
    let fourth = memory.get_upload_heap_buffer(200 * 1024, 16);
    assert_eq!(fourth.resource(), first_page);
}

#[test]
fn default_heap_init_goes_through_the_upload_batch() {
    let (device, memory) = service();
    let data: Vec<u8> = (0..64u8).collect();
    let buffer = memory.get_default_heap_buffer_init(
        "instance_table",
        64,
        ResourceState::NON_PIXEL_SHADER_RESOURCE,
        false,
        &data,
    );

    // nothing hits the device until the batched submit
    assert!(device.submissions().is_empty());
    memory.submit_resource_copies();

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].name, "resource_upload");
    assert!(matches!(submissions[0].commands[0], RecordedCommand::CopyBuffer { .. }));

    // the copy actually landed
    assert_eq!(device.read_buffer(buffer.resource(), 0, 64), data);
}

#[test]
fn default_heap_release_is_fence_deferred() {
    let (device, memory) = service();
    let buffer = memory.get_default_heap_buffer("scratch", 128, ResourceState::COMMON, true);
    let resource = buffer.resource();
    memory.release_default_heap_buffer(buffer);

    // still alive: reads go through
    memory.recycle();
    assert_eq!(device.read_buffer(resource, 0, 4), vec![0, 0, 0, 0]);

    device.signal(QueueKind::Direct);
    memory.recycle();
    // destroyed now; the name lookup comes back empty
    assert!(device.buffer_name(resource).is_empty());
}

#[test]
fn readback_map_contract() {
    let (device, memory) = service();
    let src = memory.get_upload_heap_buffer(16, 16);
    src.write(0, &[0xaa; 16]);
    let mut readback = memory.get_readback_heap_buffer(16);

    let mut list = device.begin_command_list(QueueKind::Direct);
    list.copy_buffer(src.resource(), src.offset(), readback.resource(), 0, 16);
    device.submit(list);

    memory.map_readback(&mut readback);
    assert_eq!(readback.read(0, 16), vec![0xaa; 16]);
    memory.unmap_readback(&mut readback);

    memory.release_upload_heap_buffer(src);
    memory.release_readback_heap_buffer(readback);
    device.signal(QueueKind::Direct);
    memory.recycle();
}

#[test]
fn path_ids_derive_from_names() {
    let (_device, memory) = service();
    let a = memory.get_default_heap_buffer("tlas", 64, ResourceState::ACCELERATION_STRUCTURE, true);
    let b = memory.get_default_heap_buffer("tlas", 64, ResourceState::ACCELERATION_STRUCTURE, true);
    assert_eq!(a.path_id(), b.path_id());
    assert_eq!(a.path_id(), sable_gpu::path_hash("tlas"));
}
