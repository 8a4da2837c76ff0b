//! GPU memory, descriptor management, and the device-layer contracts the
//! renderer core talks through.
//!
//! The core never owns the device, queues, or swap chain; it signals and
//! waits through the thin [`GpuDevice`]/[`CommandList`] adapters defined
//! here. [`HeadlessDevice`] is a complete in-process implementation used by
//! the engine in headless runs and by every test.

mod descriptor;
mod device;
mod headless;
mod memory;
mod pso;
mod shared;
mod state;
mod timing;

pub use descriptor::{DescriptorHeap, DescriptorTable};
pub use device::{
    AccelBuildDesc, AccelBuildFlags, AccelBuildInputs, AccelGeometry, AccelPrebuildInfo, Barrier,
    BufferDesc, BufferKind, CommandList, DeviceError, DeviceIdentity, GpuBuffer, GpuDevice,
    QueueKind, ResourceId,
};
pub use headless::{HeadlessDevice, QueueWait, RecordedCommand, Submission};
pub use memory::{DefaultHeapBuffer, GpuMemory, ReadbackHeapBuffer, UploadHeapBuffer};
pub use pso::{PsoLibrary, PSO_CACHE_DIR};
pub use shared::{SharedBuffer, SharedResources};
pub use state::ResourceState;
pub use timing::GpuTimer;

/// Stable 64-bit identity for a logical resource name (FNV-1a). Usable in
/// const contexts so pass modules can precompute their path IDs.
pub const fn path_hash(name: &str) -> u64 {
    let bytes = name.as_bytes();
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::path_hash;

    #[test]
    fn path_hash_is_stable_and_distinct() {
        const A: u64 = path_hash("gbuffer_albedo");
        assert_eq!(A, path_hash("gbuffer_albedo"));
        assert_ne!(path_hash("gbuffer_albedo"), path_hash("gbuffer_normal"));
        assert_ne!(path_hash(""), path_hash("a"));
    }
}
