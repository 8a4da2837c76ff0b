//! Minimal scene representation feeding the culling BVH, the render graph,
//! and the acceleration-structure manager.
//!
//! Asset parsing lives outside the core; a scene is just the instance set
//! with transforms, bounds, and ray-tracing flags, plus the mega-buffer
//! addresses mesh geometry was packed into.

use glam::{Affine3A, Mat4, Quat, Vec3, Vec3A};

use sable_bvh::BvhInput;
use sable_gpu::path_hash;
use sable_math::{Aabb, ViewFrustum};
use sable_rt::{MeshMode, MeshRef, RtInstance, SUBGROUP_EMISSIVE, SUBGROUP_NON_EMISSIVE};

#[derive(Clone, Copy, Debug)]
pub struct SceneInstance {
    pub id: u64,
    pub mesh: MeshRef,
    pub to_world: Affine3A,
    pub mode: MeshMode,
    pub emissive: bool,
    /// Object-space bounds; world bounds derive from `to_world`.
    pub local_aabb: Aabb,
    pub rebuild_pending: bool,
    pub update_pending: bool,
}

impl SceneInstance {
    pub fn world_aabb(&self) -> Aabb {
        // conservative transform of the local box
        let c = self.to_world.transform_point3a(self.local_aabb.center);
        let m = &self.to_world.matrix3;
        let e = self.local_aabb.extents;
        let extents = Vec3A::new(
            m.x_axis.x.abs() * e.x + m.y_axis.x.abs() * e.y + m.z_axis.x.abs() * e.z,
            m.x_axis.y.abs() * e.x + m.y_axis.y.abs() * e.y + m.z_axis.y.abs() * e.z,
            m.x_axis.z.abs() * e.x + m.y_axis.z.abs() * e.y + m.z_axis.z.abs() * e.z,
        );
        Aabb::new(c, extents)
    }

    fn subgroup_mask(&self) -> u8 {
        if self.emissive {
            SUBGROUP_EMISSIVE
        } else {
            SUBGROUP_NON_EMISSIVE
        }
    }
}

pub struct Camera {
    pub view_to_world: Mat4,
    pub v_fov: f32,
    pub aspect_ratio: f32,
    pub near_z: f32,
    pub far_z: f32,
}

impl Camera {
    pub fn frustum(&self) -> ViewFrustum {
        ViewFrustum::new(self.v_fov, self.aspect_ratio, self.near_z, self.far_z)
    }
}

pub struct Scene {
    pub instances: Vec<SceneInstance>,
    pub camera: Camera,
    pub vertex_buffer_va: u64,
    pub index_buffer_va: u64,
    pub vertex_stride: u32,
    /// Set when the static instance set changed; cleared after the
    /// acceleration structures observe it.
    pub static_instances_changed: bool,
}

impl Scene {
    /// Procedural placeholder content: a grid of static boxes plus a few
    /// spinning dynamic ones.
    pub fn demo(static_count: u32, dynamic_count: u32) -> Self {
        let mut instances = Vec::new();
        let unit = Aabb::new(Vec3A::ZERO, Vec3A::splat(1.0));

        for i in 0..static_count {
            let pos = Vec3::new((i % 8) as f32 * 4.0, ((i / 8) % 8) as f32 * 4.0, (i / 64) as f32 * 4.0);
            instances.push(SceneInstance {
                id: path_hash("static") ^ i as u64,
                mesh: MeshRef {
                    base_vertex: i * 24,
                    vertex_count: 24,
                    base_index: i * 36,
                    index_count: 36,
                    material: i % 4,
                },
                to_world: Affine3A::from_translation(pos),
                mode: MeshMode::Static,
                emissive: false,
                local_aabb: unit,
                rebuild_pending: false,
                update_pending: false,
            });
        }
        for i in 0..dynamic_count {
            let pos = Vec3::new(i as f32 * 6.0, 20.0, 10.0);
            instances.push(SceneInstance {
                id: path_hash("dynamic") ^ i as u64,
                mesh: MeshRef {
                    base_vertex: (static_count + i) * 24,
                    vertex_count: 24,
                    base_index: (static_count + i) * 36,
                    index_count: 36,
                    material: 4 + i % 2,
                },
                to_world: Affine3A::from_translation(pos),
                mode: MeshMode::Dynamic,
                emissive: i % 2 == 0,
                local_aabb: unit,
                // first appearance requires a fresh build
                rebuild_pending: true,
                update_pending: false,
            });
        }

        Self {
            instances,
            camera: Camera {
                view_to_world: Mat4::from_translation(Vec3::new(14.0, 14.0, -30.0)),
                v_fov: 60f32.to_radians(),
                aspect_ratio: 16.0 / 9.0,
                near_z: 0.1,
                far_z: 500.0,
            },
            vertex_buffer_va: 0,
            index_buffer_va: 0,
            vertex_stride: 32,
            static_instances_changed: true,
        }
    }

    /// Animates dynamic instances and flags them for BLAS refit. Instances
    /// still awaiting their first build keep the rebuild flag instead.
    pub fn update_transforms(&mut self, dt: f32) {
        for inst in &mut self.instances {
            if inst.mode == MeshMode::Dynamic {
                inst.to_world = Affine3A::from_quat(Quat::from_rotation_y(dt)) * inst.to_world;
                inst.update_pending = !inst.rebuild_pending;
            }
        }
    }

    /// Clears the flags the acceleration structures consumed this frame.
    pub fn end_frame(&mut self) {
        self.static_instances_changed = false;
        for inst in &mut self.instances {
            inst.rebuild_pending = false;
            inst.update_pending = false;
        }
    }

    /// The per-frame view the acceleration-structure manager consumes.
    /// `rt_instances` must outlive the recording callbacks, so the caller
    /// snapshots it per frame.
    pub fn rt_instances(&self) -> Vec<RtInstance> {
        self.instances
            .iter()
            .map(|inst| RtInstance {
                id: inst.id,
                mesh: inst.mesh,
                to_world: inst.to_world,
                mode: inst.mode,
                rebuild: inst.rebuild_pending,
                update: inst.update_pending,
                subgroup_mask: inst.subgroup_mask(),
            })
            .collect()
    }

    pub fn bvh_inputs(&self) -> Vec<BvhInput> {
        self.instances
            .iter()
            .map(|inst| BvhInput { id: inst.id, aabb: inst.world_aabb() })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_aabb_follows_the_transform() {
        let inst = SceneInstance {
            id: 1,
            mesh: MeshRef { base_vertex: 0, vertex_count: 3, base_index: 0, index_count: 3, material: 0 },
            to_world: Affine3A::from_translation(Vec3::new(10.0, 0.0, 0.0)),
            mode: MeshMode::Static,
            emissive: false,
            local_aabb: Aabb::new(Vec3A::ZERO, Vec3A::splat(1.0)),
            rebuild_pending: false,
            update_pending: false,
        };
        let world = inst.world_aabb();
        assert_eq!(world.center, Vec3A::new(10.0, 0.0, 0.0));
        assert_eq!(world.extents, Vec3A::splat(1.0));
    }

    #[test]
    fn demo_scene_marks_first_dynamic_appearance() {
        let scene = Scene::demo(16, 4);
        assert!(scene.static_instances_changed);
        assert!(scene
            .instances
            .iter()
            .filter(|i| i.mode == MeshMode::Dynamic)
            .all(|i| i.rebuild_pending));
    }
}
