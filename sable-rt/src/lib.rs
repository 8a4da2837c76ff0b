//! Ray-tracing acceleration structure management.
//!
//! Instances are partitioned into *static* (never re-transformed; one
//! merged BLAS built once and compacted over the following frames) and
//! *dynamic* (one BLAS each, rebuilt or refitted per frame). A fresh TLAS
//! is built every frame over the live BLAS set, and a companion instance
//! table is uploaded so shaders can recover material and mesh data from
//! `InstanceID` with a single fetch.

mod blas;
mod instance;
mod tlas;

pub use blas::{DynamicBlas, StaticBlas};
pub use instance::{
    MeshInstance, MeshMode, MeshRef, RtInstance, RtSceneView, TlasInstanceDesc, TlasInstanceFlags,
    SUBGROUP_ALL, SUBGROUP_EMISSIVE, SUBGROUP_NON_EMISSIVE,
};
pub use tlas::{Tlas, RT_FRAME_MESH_INSTANCES, RT_TLAS};
