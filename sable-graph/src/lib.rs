//! Per-frame render graph: pass registration, dependency declaration, DAG
//! construction with cross-queue synchronization, barrier insertion, and
//! aggregation into per-command-list submission units.
//!
//! Frame workflow:
//!
//! 0. `begin_frame()`
//! 1. Passes register themselves (`register_render_pass`) and their
//!    resources (`register_resource`)
//! 2. `move_to_post_register()`
//! 3. Passes declare `add_input` / `add_output` with expected states
//! 4. `build()` sorts the DAG, inserts barriers, aggregates nodes, and
//!    emits one worker task per aggregate

mod graph;

pub use graph::{
    dummy_res, GraphExecContext, RecordCallback, RenderGraph, RenderNodeHandle, RenderNodeType,
    AggregateSnapshot, MAX_RENDER_PASSES, MAX_RESOURCES, MAX_RESOURCE_PRODUCERS,
};
