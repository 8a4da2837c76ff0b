use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3A, Vec4};

use crate::Aabb;

/// View frustum as six inward-facing planes `(n, d)` with
/// `dot(n, p) + d >= 0` for points inside.
///
/// Plane order: left, right, bottom, top, near, far.
#[derive(Clone, Copy, Debug)]
pub struct ViewFrustum {
    pub planes: [Vec4; 6],
}

/// Plane data in the layout compute shaders consume.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct PackedFrustum {
    pub planes: [[f32; 4]; 6],
}

impl ViewFrustum {
    /// Builds a view-space frustum looking down +Z.
    ///
    /// `v_fov` is the full vertical field of view in radians.
    pub fn new(v_fov: f32, aspect_ratio: f32, near_z: f32, far_z: f32) -> Self {
        debug_assert!(near_z > 0.0 && far_z > near_z, "invalid frustum depth range");

        let t = (v_fov * 0.5).tan();
        let left = Vec4::new(1.0, 0.0, aspect_ratio * t, 0.0);
        let right = Vec4::new(-1.0, 0.0, aspect_ratio * t, 0.0);
        let bottom = Vec4::new(0.0, 1.0, t, 0.0);
        let top = Vec4::new(0.0, -1.0, t, 0.0);
        let near = Vec4::new(0.0, 0.0, 1.0, -near_z);
        let far = Vec4::new(0.0, 0.0, -1.0, far_z);

        Self {
            planes: [
                normalize_plane(left),
                normalize_plane(right),
                normalize_plane(bottom),
                normalize_plane(top),
                near,
                far,
            ],
        }
    }

    /// Transforms the frustum by `m` (e.g. view-to-world). Planes transform
    /// by the inverse-transpose of the point transform.
    pub fn transform(&self, m: &Mat4) -> Self {
        let it = m.inverse().transpose();
        let mut planes = [Vec4::ZERO; 6];
        for (dst, src) in planes.iter_mut().zip(self.planes.iter()) {
            *dst = normalize_plane(it * *src);
        }
        Self { planes }
    }

    /// Frustum-vs-AABB separating-axis test using the plane normals as axes.
    ///
    /// Conservative in the usual way: a box outside the frustum but not
    /// fully outside any single plane still reports an intersection.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        let c = aabb.center;
        let e = aabb.extents;

        for plane in &self.planes {
            let n = Vec3A::new(plane.x, plane.y, plane.z);
            // projection radius of the box onto the plane normal
            let r = e.dot(n.abs());
            let dist = n.dot(c) + plane.w;
            if dist < -r {
                return false;
            }
        }
        true
    }

    pub fn packed(&self) -> PackedFrustum {
        PackedFrustum {
            planes: self.planes.map(|p| p.to_array()),
        }
    }
}

fn normalize_plane(p: Vec4) -> Vec4 {
    let len = Vec3A::new(p.x, p.y, p.z).length();
    if len > 0.0 {
        p / len
    } else {
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn unit_box_at(p: Vec3A) -> Aabb {
        Aabb::new(p, Vec3A::splat(0.5))
    }

    #[test]
    fn boxes_on_axis_are_inside() {
        let f = ViewFrustum::new(60f32.to_radians(), 1.0, 0.1, 100.0);
        assert!(f.intersects_aabb(&unit_box_at(Vec3A::new(0.0, 0.0, 10.0))));
        assert!(f.intersects_aabb(&unit_box_at(Vec3A::new(0.0, 0.0, 99.0))));
    }

    #[test]
    fn boxes_outside_planes_are_rejected() {
        let f = ViewFrustum::new(60f32.to_radians(), 1.0, 0.1, 100.0);
        // behind the camera
        assert!(!f.intersects_aabb(&unit_box_at(Vec3A::new(0.0, 0.0, -5.0))));
        // beyond the far plane
        assert!(!f.intersects_aabb(&unit_box_at(Vec3A::new(0.0, 0.0, 200.0))));
        // far off to the side at a shallow depth
        assert!(!f.intersects_aabb(&unit_box_at(Vec3A::new(50.0, 0.0, 1.0))));
    }

    #[test]
    fn transform_moves_the_frustum() {
        let f = ViewFrustum::new(60f32.to_radians(), 1.0, 0.1, 50.0);
        let world = f.transform(&Mat4::from_translation(Vec3::new(100.0, 0.0, 0.0)));
        assert!(world.intersects_aabb(&unit_box_at(Vec3A::new(100.0, 0.0, 10.0))));
        assert!(!world.intersects_aabb(&unit_box_at(Vec3A::new(0.0, 0.0, 10.0))));
    }

    #[test]
    fn straddling_near_plane_intersects() {
        let f = ViewFrustum::new(90f32.to_radians(), 1.0, 1.0, 100.0);
        assert!(f.intersects_aabb(&unit_box_at(Vec3A::new(0.0, 0.0, 1.0))));
    }
}
