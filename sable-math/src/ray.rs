use glam::{BVec3A, Vec3A};

use crate::Aabb;

const PARALLEL_EPS: f32 = 1e-20;

#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3A,
    pub dir: Vec3A,
}

impl Ray {
    pub fn new(origin: Vec3A, dir: Vec3A) -> Self {
        Self { origin, dir }
    }

    /// Precomputes the reciprocal direction and parallel-axis mask so a
    /// traversal can run the slab test per node without re-deriving them.
    pub fn slabs(&self) -> SlabRay {
        SlabRay {
            origin: self.origin,
            inv_dir: Vec3A::ONE / self.dir,
            parallel: self.dir.abs().cmple(Vec3A::splat(PARALLEL_EPS)),
        }
    }
}

/// A ray prepared for repeated slab tests.
#[derive(Clone, Copy, Debug)]
pub struct SlabRay {
    origin: Vec3A,
    inv_dir: Vec3A,
    parallel: BVec3A,
}

impl SlabRay {
    /// Slab-method ray/AABB intersection. Returns the entry distance `t`
    /// (clamped to zero when the origin is inside the box), or `None`.
    pub fn intersect_aabb(&self, aabb: &Aabb) -> Option<f32> {
        // translate so the ray origin sits at the world origin
        let c = aabb.center - self.origin;
        let lo = c - aabb.extents;
        let hi = c + aabb.extents;

        // a parallel axis intersects only if the origin lies inside its slab
        let outside = lo.cmpgt(Vec3A::ZERO) | hi.cmplt(Vec3A::ZERO);
        if (self.parallel & outside).any() {
            return None;
        }

        let t1 = Vec3A::select(self.parallel, Vec3A::splat(f32::NEG_INFINITY), lo * self.inv_dir);
        let t2 = Vec3A::select(self.parallel, Vec3A::splat(f32::INFINITY), hi * self.inv_dir);

        // farthest entry and nearest exit across the three slabs
        let t_enter = t1.min(t2).max_element();
        let t_exit = t1.max(t2).min_element();

        if t_enter <= t_exit && t_exit >= 0.0 {
            Some(t_enter.max(0.0))
        } else {
            None
        }
    }
}
