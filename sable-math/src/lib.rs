//! Collision math shared by the culling BVH and the renderer core.
//!
//! Everything here is built on `glam`'s SIMD types (`Vec3A`/`Vec4`), so the
//! per-node tests in BVH traversal stay branch-light and vectorized.

mod aabb;
mod frustum;
mod ray;

pub use aabb::{Aabb, Containment};
pub use frustum::{PackedFrustum, ViewFrustum};
pub use ray::{Ray, SlabRay};
