//! Real-time ray-tracing renderer core.
//!
//! The [`engine::Engine`] owns the device adapters, the worker pools, GPU
//! memory, the render graph, and the acceleration-structure manager, and
//! drives them through the per-frame sequence: update, cull, register,
//! build, submit, present, recycle.

pub mod engine;
pub mod scene;
pub mod timer;

pub use engine::Engine;
pub use scene::{Camera, Scene, SceneInstance};
pub use timer::Timer;
