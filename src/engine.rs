//! The owning object for the device adapters and every core subsystem,
//! plus the per-frame control flow.

use std::path::Path;
use std::sync::Arc;

use bumpalo::Bump;
use parking_lot::Mutex;

use sable_bvh::{Bvh, BvhUpdateInput};
use sable_gpu::{
    path_hash, DefaultHeapBuffer, DescriptorHeap, DescriptorTable, GpuDevice, GpuMemory, GpuTimer,
    PsoLibrary, QueueKind, ResourceState, SharedResources, PSO_CACHE_DIR,
};
use sable_graph::{GraphExecContext, RecordCallback, RenderGraph, RenderNodeType};
use sable_rt::{MeshMode, RtSceneView, Tlas};
use sable_task::{SignalRegistry, TaskSet, ThreadIndexTable, WorkerPool};

use crate::scene::Scene;
use crate::timer::Timer;

const BACK_BUFFER: u64 = path_hash("back_buffer");
const GBUFFER: u64 = path_hash("gbuffer_color");
const DEPTH_BUFFER: u64 = path_hash("depth_buffer");
const LIGHTING: u64 = path_hash("rt_lighting");
const SCENE_ACCEL: u64 = path_hash("rt_scene_accel");

const SIGNAL_CAPACITY: usize = 1024;
const DESCRIPTOR_HEAP_SIZE: u32 = 4096;
const DESCRIPTOR_BLOCK_SIZE: u32 = 64;
const BACKGROUND_POOL_SIZE: usize = 2;
const PSO_SLOT_COUNT: usize = 64;
const MAX_TIMED_PASSES: u32 = 16;

/// Stand-in frame targets. A windowed backend would hand the graph its
/// swap-chain images instead; the core only needs stable identities.
struct FrameTargets {
    back_buffer: DefaultHeapBuffer,
    gbuffer: DefaultHeapBuffer,
    depth: DefaultHeapBuffer,
    lighting: DefaultHeapBuffer,
    /// Graph-facing identity for the scene acceleration structures.
    accel: DefaultHeapBuffer,
}

pub struct Engine {
    device: Arc<dyn GpuDevice>,
    #[allow(dead_code)]
    thread_table: Arc<ThreadIndexTable>,
    signals: Arc<SignalRegistry>,
    foreground: WorkerPool,
    background: WorkerPool,
    memory: Arc<GpuMemory>,
    descriptors: DescriptorHeap,
    shared: Arc<SharedResources>,
    graph: RenderGraph,
    tlas: Arc<Mutex<Tlas>>,
    bvh: Bvh,
    gpu_timer: Arc<Mutex<GpuTimer>>,
    pso: PsoLibrary,
    timer: Timer,
    frame_arena: Bump,
    targets: FrameTargets,
    /// Shader-visible views over the frame targets, one slot per target.
    target_views: DescriptorTable,
    visible: Vec<u64>,
    pub scene: Scene,
}

impl Engine {
    pub fn init(device: Arc<dyn GpuDevice>, scene: Scene) -> Self {
        let thread_table = Arc::new(ThreadIndexTable::new());
        thread_table.register_current();
        let signals = Arc::new(SignalRegistry::new(SIGNAL_CAPACITY));

        let foreground = WorkerPool::new(
            WorkerPool::default_foreground_size(),
            "sable_worker",
            Arc::clone(&signals),
            Arc::clone(&thread_table),
        );
        let background = WorkerPool::new(
            BACKGROUND_POOL_SIZE,
            "sable_background",
            Arc::clone(&signals),
            Arc::clone(&thread_table),
        );

        let memory = Arc::new(GpuMemory::new(Arc::clone(&device), Arc::clone(&thread_table)));
        let descriptors = DescriptorHeap::new(
            Arc::clone(&device),
            DESCRIPTOR_HEAP_SIZE,
            DESCRIPTOR_BLOCK_SIZE,
            true,
        );

        let (pso, pso_error) = PsoLibrary::open(
            Path::new(PSO_CACHE_DIR),
            "sable_main",
            device.identity(),
            PSO_SLOT_COUNT,
        );
        if pso_error.is_some() {
            // recovered: the library was reset to empty and will rebuild
            log::info!("PSO library will be rebuilt this run");
        }

        let targets = FrameTargets {
            back_buffer: memory.get_default_heap_buffer(
                "back_buffer",
                4,
                ResourceState::PRESENT,
                false,
            ),
            gbuffer: memory.get_default_heap_buffer("gbuffer_color", 4, ResourceState::COMMON, false),
            depth: memory.get_default_heap_buffer("depth_buffer", 4, ResourceState::COMMON, false),
            lighting: memory.get_default_heap_buffer("rt_lighting", 4, ResourceState::COMMON, true),
            accel: memory.get_default_heap_buffer(
                "rt_scene_accel",
                4,
                ResourceState::ACCELERATION_STRUCTURE,
                true,
            ),
        };

        let shared = Arc::new(SharedResources::new());
        let target_views = descriptors.allocate(5);
        shared.insert_or_assign_table(path_hash("frame_target_views"), target_views);

        let gpu_timer = Arc::new(Mutex::new(GpuTimer::new(&memory, MAX_TIMED_PASSES)));

        log::info!(
            "engine initialized: {} foreground workers, {} scene instances",
            WorkerPool::default_foreground_size(),
            scene.instances.len()
        );

        Self {
            device,
            thread_table,
            signals,
            foreground,
            background,
            memory,
            descriptors,
            shared,
            graph: RenderGraph::new(),
            tlas: Arc::new(Mutex::new(Tlas::new())),
            bvh: Bvh::new(),
            gpu_timer,
            pso,
            timer: Timer::new(),
            frame_arena: Bump::new(),
            targets,
            target_views,
            visible: Vec::new(),
            scene,
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn shared_resources(&self) -> &Arc<SharedResources> {
        &self.shared
    }

    pub fn render_graph(&self) -> &RenderGraph {
        &self.graph
    }

    pub fn descriptor_heap(&self) -> &DescriptorHeap {
        &self.descriptors
    }

    pub fn pso_library_mut(&mut self) -> &mut PsoLibrary {
        &mut self.pso
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Instances that survived frustum culling in the last frame.
    pub fn visible_instances(&self) -> &[u64] {
        &self.visible
    }

    /// Runs one frame: update, cull, register, build, submit, present,
    /// recycle.
    pub fn render_frame(&mut self) {
        profiling::scope!("render_frame");

        self.timer.tick();
        self.frame_arena.reset();
        self.memory.begin_frame();
        self.graph.begin_frame();

        self.update_phase();
        self.foreground.flush();

        self.cull_phase();

        self.register_and_build_phase();
        self.foreground.flush();

        // end of frame: flush batched uploads and present
        self.memory.submit_resource_copies();
        self.device.signal(QueueKind::Direct);
        self.scene.end_frame();

        {
            let mut gpu_timer = self.gpu_timer.lock();
            gpu_timer.advance_frame(&self.memory);
            for (name, duration) in gpu_timer.results() {
                log::debug!("gpu '{}': {:?}", name, duration);
            }
        }

        // reclaim everything whose fence has passed
        self.descriptors.recycle();
        self.memory.recycle();
    }

    fn update_phase(&mut self) {
        profiling::scope!("update_phase");
        let arena = &self.frame_arena;

        // snapshot dynamic bounds so the BVH refit knows the old boxes
        let old_bounds = bumpalo::collections::Vec::from_iter_in(
            self.scene
                .instances
                .iter()
                .filter(|i| i.mode == MeshMode::Dynamic)
                .map(|i| (i.id, i.world_aabb())),
            arena,
        );

        self.scene.update_transforms(self.timer.delta_secs());

        if !self.bvh.is_built() || self.scene.static_instances_changed {
            self.bvh.build(&self.scene.bvh_inputs());
        } else {
            let updates = bumpalo::collections::Vec::from_iter_in(
                self.scene
                    .instances
                    .iter()
                    .filter(|i| i.mode == MeshMode::Dynamic)
                    .zip(old_bounds.iter())
                    .map(|(inst, &(id, old_aabb))| {
                        debug_assert_eq!(inst.id, id);
                        BvhUpdateInput {
                            id,
                            old_aabb,
                            new_aabb: inst.world_aabb(),
                        }
                    }),
                arena,
            );
            self.bvh.update(&updates);
        }
    }

    fn cull_phase(&mut self) {
        profiling::scope!("cull_phase");
        self.visible.clear();
        let frustum = self.scene.camera.frustum();
        self.bvh
            .frustum_cull(&frustum, &self.scene.camera.view_to_world, &mut self.visible);
        log::debug!(
            "frustum culling: {} / {} instances visible",
            self.visible.len(),
            self.scene.instances.len()
        );
    }

    /// Registers this frame's passes and resources on the graph, declares
    /// their dependencies, builds, and submits the resulting task set.
    fn register_and_build_phase(&mut self) {
        profiling::scope!("register_and_build");

        let frame = self.timer.frame_count();

        self.graph.register_resource(
            self.targets.back_buffer.id(),
            BACK_BUFFER,
            ResourceState::PRESENT,
            true,
        );
        self.graph
            .register_resource(self.targets.gbuffer.id(), GBUFFER, ResourceState::COMMON, true);
        self.graph
            .register_resource(self.targets.depth.id(), DEPTH_BUFFER, ResourceState::COMMON, true);
        self.graph
            .register_resource(self.targets.lighting.id(), LIGHTING, ResourceState::COMMON, true);
        // acceleration structures never leave their state
        self.graph.register_resource(
            self.targets.accel.id(),
            SCENE_ACCEL,
            ResourceState::ACCELERATION_STRUCTURE,
            false,
        );

        // the frame's GPU span opens on the first pass and closes on the
        // final aggregate through the end-of-frame hook
        let frame_span: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));

        // acceleration-structure build (compute on the direct queue)
        let as_callback: RecordCallback = {
            let tlas = Arc::clone(&self.tlas);
            let memory = Arc::clone(&self.memory);
            let shared = Arc::clone(&self.shared);
            let gpu_timer = Arc::clone(&self.gpu_timer);
            let frame_span = Arc::clone(&frame_span);
            let instances = Arc::new(self.scene.rt_instances());
            let static_changed = self.scene.static_instances_changed;
            let vertex_va = self.scene.vertex_buffer_va;
            let index_va = self.scene.index_buffer_va;
            let stride = self.scene.vertex_stride;
            Arc::new(move |cmd| {
                *frame_span.lock() = gpu_timer.lock().begin_pass(cmd, "frame");

                let view = RtSceneView {
                    instances: &instances,
                    static_instances_changed: static_changed,
                    vertex_buffer_va: vertex_va,
                    index_buffer_va: index_va,
                    vertex_stride: stride,
                };
                let mut tlas = tlas.lock();
                tlas.render(cmd, &view, &memory, frame);
                tlas.build_frame_instance_table(&view, &memory, &shared);
            })
        };
        let as_pass =
            self.graph
                .register_render_pass("rt_as_build", RenderNodeType::Compute, as_callback);

        let gbuffer_pass = self.graph.register_render_pass(
            "gbuffer",
            RenderNodeType::Render,
            Arc::new(|_cmd| {
                // geometry recording lives with the scene renderer
            }),
        );
        let lighting_pass = self.graph.register_render_pass(
            "rt_lighting",
            RenderNodeType::AsyncCompute,
            Arc::new(|_cmd| {}),
        );
        let composite_pass = self.graph.register_render_pass(
            "composite",
            RenderNodeType::Render,
            Arc::new(|_cmd| {}),
        );

        self.graph.move_to_post_register();

        self.graph
            .add_output(as_pass, SCENE_ACCEL, ResourceState::ACCELERATION_STRUCTURE);
        self.graph.add_output(gbuffer_pass, GBUFFER, ResourceState::RENDER_TARGET);
        self.graph.add_output(gbuffer_pass, DEPTH_BUFFER, ResourceState::DEPTH_WRITE);
        self.graph
            .add_input(lighting_pass, SCENE_ACCEL, ResourceState::ACCELERATION_STRUCTURE);
        self.graph
            .add_input(lighting_pass, GBUFFER, ResourceState::NON_PIXEL_SHADER_RESOURCE);
        self.graph.add_output(lighting_pass, LIGHTING, ResourceState::UNORDERED_ACCESS);
        self.graph
            .add_input(composite_pass, LIGHTING, ResourceState::PIXEL_SHADER_RESOURCE);
        self.graph.add_output(composite_pass, BACK_BUFFER, ResourceState::RENDER_TARGET);

        let end_frame_hook: RecordCallback = {
            let gpu_timer = Arc::clone(&self.gpu_timer);
            Arc::new(move |cmd| {
                if let Some(slot) = frame_span.lock().take() {
                    gpu_timer.lock().end_pass(cmd, slot);
                }
            })
        };

        let mut task_set = TaskSet::new();
        let ctx = GraphExecContext {
            device: Arc::clone(&self.device),
            back_buffer_path: BACK_BUFFER,
            end_frame_hook: Some(end_frame_hook),
        };
        self.graph.build(&mut task_set, &ctx);
        task_set.finalize(&self.signals);
        self.foreground.enqueue_set(task_set);
    }

    /// Queues fire-and-forget work on the background pool.
    pub fn submit_background(&self, name: &str, func: impl FnOnce() + Send + 'static) {
        self.background
            .enqueue(sable_task::Task::new(name, sable_task::TaskPriority::Background, func));
    }

    /// Drains outstanding work, waits out the GPU, persists caches, and
    /// tears the pools down.
    pub fn shutdown(&mut self) {
        log::info!("engine shutting down after {} frames", self.timer.frame_count());

        self.foreground.flush();
        self.background.flush();

        // drain the GPU: signal the terminal fences and wait them out
        let direct = self.device.signal(QueueKind::Direct);
        let compute = self.device.signal(QueueKind::Compute);
        self.device.wait_cpu(QueueKind::Direct, direct);
        self.device.wait_cpu(QueueKind::Compute, compute);

        self.tlas.lock().clear(&self.memory);
        self.gpu_timer.lock().shutdown(&self.memory);
        self.memory.release_default_heap_buffer(self.targets.back_buffer);
        self.memory.release_default_heap_buffer(self.targets.gbuffer);
        self.memory.release_default_heap_buffer(self.targets.depth);
        self.memory.release_default_heap_buffer(self.targets.lighting);
        self.memory.release_default_heap_buffer(self.targets.accel);
        self.memory.shutdown();

        self.descriptors.release(self.target_views);
        self.descriptors.recycle();

        if let Err(err) = self.pso.flush_to_disk() {
            log::error!("failed to persist the PSO library: {}", err);
        }

        self.foreground.shutdown();
        self.background.shutdown();
    }
}
