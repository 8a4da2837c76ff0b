//! Registry of named shader-facing resources.
//!
//! Producers (the acceleration-structure manager, the scene) publish
//! buffers and descriptor tables here under their path IDs; render passes
//! look them up by the same IDs when recording.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::descriptor::DescriptorTable;
use crate::device::{GpuBuffer, ResourceId};
use crate::path_hash;

/// A published buffer: enough for a pass to bind or barrier it.
#[derive(Clone, Copy, Debug)]
pub struct SharedBuffer {
    pub id: ResourceId,
    pub gpu_va: u64,
    pub size: u64,
}

impl From<GpuBuffer> for SharedBuffer {
    fn from(buffer: GpuBuffer) -> Self {
        Self {
            id: buffer.id(),
            gpu_va: buffer.gpu_va(),
            size: buffer.size(),
        }
    }
}

#[derive(Default)]
pub struct SharedResources {
    buffers: RwLock<HashMap<u64, SharedBuffer>>,
    tables: RwLock<HashMap<u64, DescriptorTable>>,
}

impl SharedResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes (or replaces) a buffer under `path_id`.
    pub fn insert_or_assign_buffer(&self, path_id: u64, buffer: SharedBuffer) {
        self.buffers.write().insert(path_id, buffer);
    }

    pub fn insert_or_assign_buffer_named(&self, name: &str, buffer: SharedBuffer) {
        self.insert_or_assign_buffer(path_hash(name), buffer);
    }

    pub fn find_buffer(&self, path_id: u64) -> Option<SharedBuffer> {
        self.buffers.read().get(&path_id).copied()
    }

    pub fn find_buffer_named(&self, name: &str) -> Option<SharedBuffer> {
        self.find_buffer(path_hash(name))
    }

    pub fn remove_buffer(&self, path_id: u64) -> Option<SharedBuffer> {
        self.buffers.write().remove(&path_id)
    }

    pub fn insert_or_assign_table(&self, path_id: u64, table: DescriptorTable) {
        self.tables.write().insert(path_id, table);
    }

    pub fn find_table(&self, path_id: u64) -> Option<DescriptorTable> {
        self.tables.read().get(&path_id).copied()
    }

    pub fn remove_table(&self, path_id: u64) -> Option<DescriptorTable> {
        self.tables.write().remove(&path_id)
    }

    pub fn clear(&self) {
        self.buffers.write().clear();
        self.tables.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(va: u64) -> SharedBuffer {
        SharedBuffer { id: ResourceId(va), gpu_va: va, size: 64 }
    }

    #[test]
    fn insert_or_assign_keeps_the_last_value() {
        let shared = SharedResources::new();
        shared.insert_or_assign_buffer(1, buf(100));
        shared.insert_or_assign_buffer(1, buf(200));
        assert_eq!(shared.find_buffer(1).unwrap().gpu_va, 200);
    }

    #[test]
    fn find_after_clear_is_absent() {
        let shared = SharedResources::new();
        for i in 0..16 {
            shared.insert_or_assign_buffer(i, buf(i));
        }
        shared.clear();
        for i in 0..16 {
            assert!(shared.find_buffer(i).is_none());
        }
    }

    #[test]
    fn named_lookup_round_trips() {
        let shared = SharedResources::new();
        shared.insert_or_assign_buffer_named("rt_frame_instances", buf(42));
        assert_eq!(shared.find_buffer_named("rt_frame_instances").unwrap().gpu_va, 42);
        assert!(shared.find_buffer_named("rt_frame_instancez").is_none());
    }

    #[test]
    fn remove_returns_the_entry() {
        let shared = SharedResources::new();
        shared.insert_or_assign_buffer(9, buf(9));
        assert!(shared.remove_buffer(9).is_some());
        assert!(shared.remove_buffer(9).is_none());
        assert!(shared.find_buffer(9).is_none());
    }
}
