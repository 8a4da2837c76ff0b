use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::Affine3A;

/// Instance subgroup masks, used at trace time to subset the TLAS.
pub const SUBGROUP_EMISSIVE: u8 = 1 << 0;
pub const SUBGROUP_NON_EMISSIVE: u8 = 1 << 1;
pub const SUBGROUP_ALL: u8 = 0xff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshMode {
    /// Never re-transformed; folded into the merged static BLAS.
    Static,
    /// Own BLAS, rebuilt or refitted per frame.
    Dynamic,
}

/// Range of a mesh inside the scene mega-buffers.
#[derive(Clone, Copy, Debug)]
pub struct MeshRef {
    pub base_vertex: u32,
    pub vertex_count: u32,
    pub base_index: u32,
    pub index_count: u32,
    pub material: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct RtInstance {
    pub id: u64,
    pub mesh: MeshRef,
    pub to_world: Affine3A,
    pub mode: MeshMode,
    /// Dynamic only: full rebuild requested this frame. Set on first
    /// appearance and after topology changes.
    pub rebuild: bool,
    /// Dynamic only: refit in place this frame. Mutually exclusive with
    /// `rebuild`.
    pub update: bool,
    pub subgroup_mask: u8,
}

/// Per-frame scene inputs consumed by the acceleration-structure manager.
#[derive(Clone, Copy)]
pub struct RtSceneView<'a> {
    pub instances: &'a [RtInstance],
    /// The static instance set changed; the merged static BLAS must be
    /// rebuilt (and re-compacted).
    pub static_instances_changed: bool,
    pub vertex_buffer_va: u64,
    pub index_buffer_va: u64,
    pub vertex_stride: u32,
}

impl<'a> RtSceneView<'a> {
    pub fn static_instances(&self) -> impl Iterator<Item = &RtInstance> {
        self.instances.iter().filter(|i| i.mode == MeshMode::Static)
    }

    pub fn dynamic_instances(&self) -> impl Iterator<Item = &RtInstance> {
        self.instances.iter().filter(|i| i.mode == MeshMode::Dynamic)
    }

    pub fn num_static(&self) -> u32 {
        self.static_instances().count() as u32
    }
}

/// One entry of the frame instance table, fetched by `InstanceID` in hit
/// shaders. Layout: `[all static instances][all dynamic instances]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MeshInstance {
    pub material: u32,
    pub base_vertex: u32,
    pub base_index: u32,
    pub _pad0: u32,
    /// Rotation of the instance transform. The BLAS-build transform is
    /// lost to hit shaders, so it rides in the table instead.
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
    pub _pad1: f32,
}

/// Hardware TLAS instance descriptor layout: a 3x4 row-major transform,
/// packed id/mask and flags/hit-group words, and the BLAS address.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct TlasInstanceDesc {
    pub transform: [[f32; 4]; 3],
    pub id_and_mask: u32,
    pub flags_and_hit_group: u32,
    pub blas_va: u64,
}

bitflags! {
    /// Hardware per-instance trace flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TlasInstanceFlags: u32 {
        const TRIANGLE_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FRONT_CCW = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NON_OPAQUE = 1 << 3;
    }
}

impl TlasInstanceDesc {
    /// All meshes are currently forced opaque at trace time; per-material
    /// opacity would thread through here if it ever becomes registration
    /// data.
    pub fn new(to_world: &Affine3A, instance_id: u32, mask: u8, blas_va: u64) -> Self {
        debug_assert!(instance_id < (1 << 24), "instance id exceeds 24 bits");
        Self {
            transform: transform_rows(to_world),
            id_and_mask: instance_id | ((mask as u32) << 24),
            flags_and_hit_group: TlasInstanceFlags::FORCE_OPAQUE.bits() << 24,
            blas_va,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.id_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.id_and_mask >> 24) as u8
    }
}

/// Rows of the 3x4 affine as the hardware consumes them.
pub(crate) fn transform_rows(m: &Affine3A) -> [[f32; 4]; 3] {
    let mut rows = [[0.0f32; 4]; 3];
    for (r, row) in rows.iter_mut().enumerate() {
        row[0] = m.matrix3.x_axis[r];
        row[1] = m.matrix3.y_axis[r];
        row[2] = m.matrix3.z_axis[r];
        row[3] = m.translation[r];
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn desc_packs_id_and_mask() {
        let desc = TlasInstanceDesc::new(&Affine3A::IDENTITY, 42, SUBGROUP_EMISSIVE, 0x1000);
        assert_eq!(desc.instance_id(), 42);
        assert_eq!(desc.mask(), SUBGROUP_EMISSIVE);
        assert_eq!(desc.blas_va, 0x1000);
        assert_eq!(desc.flags_and_hit_group >> 24, TlasInstanceFlags::FORCE_OPAQUE.bits());
    }

    #[test]
    fn transform_rows_carry_translation_in_last_column() {
        let m = Affine3A::from_scale_rotation_translation(
            Vec3::ONE,
            Quat::IDENTITY,
            Vec3::new(1.0, 2.0, 3.0),
        );
        let rows = transform_rows(&m);
        assert_eq!(rows[0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(rows[1], [0.0, 1.0, 0.0, 2.0]);
        assert_eq!(rows[2], [0.0, 0.0, 1.0, 3.0]);
    }
}
