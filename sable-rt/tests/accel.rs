//! Acceleration-structure lifecycle against the headless device.

use std::sync::Arc;

use glam::{Affine3A, Quat, Vec3};
use sable_gpu::{
    Barrier, GpuDevice, GpuMemory, HeadlessDevice, QueueKind, RecordedCommand, SharedResources,
};
use sable_rt::{
    MeshMode, MeshRef, RtInstance, RtSceneView, Tlas, MeshInstance, RT_FRAME_MESH_INSTANCES,
    SUBGROUP_EMISSIVE, SUBGROUP_NON_EMISSIVE,
};
use sable_task::ThreadIndexTable;

struct Harness {
    device: Arc<HeadlessDevice>,
    memory: GpuMemory,
    shared: SharedResources,
    tlas: Tlas,
    frame: u64,
}

impl Harness {
    fn new() -> Self {
        let device = Arc::new(HeadlessDevice::new());
        let table = Arc::new(ThreadIndexTable::new());
        table.register_current();
        let memory = GpuMemory::new(device.clone() as Arc<dyn GpuDevice>, table);
        Self {
            device,
            memory,
            shared: SharedResources::new(),
            tlas: Tlas::new(),
            frame: 0,
        }
    }

    /// Runs one frame of acceleration-structure work and completes it.
    fn run_frame(&mut self, scene: &RtSceneView) {
        self.frame += 1;
        self.memory.begin_frame();

        let mut cmd = self.device.begin_command_list(QueueKind::Compute);
        cmd.set_name("tlas_build");
        self.tlas.render(&mut *cmd, scene, &self.memory, self.frame);
        self.tlas.build_frame_instance_table(scene, &self.memory, &self.shared);
        self.device.submit(cmd);

        self.memory.submit_resource_copies();
        self.device.signal(QueueKind::Direct);
        self.memory.recycle();
    }
}

fn mesh(base_vertex: u32, material: u32) -> MeshRef {
    MeshRef {
        base_vertex,
        vertex_count: 24,
        base_index: base_vertex * 3,
        index_count: 36,
        material,
    }
}

fn static_instance(id: u64, material: u32) -> RtInstance {
    RtInstance {
        id,
        mesh: mesh(id as u32 * 24, material),
        to_world: Affine3A::from_translation(Vec3::new(id as f32, 0.0, 0.0)),
        mode: MeshMode::Static,
        rebuild: false,
        update: false,
        subgroup_mask: SUBGROUP_NON_EMISSIVE,
    }
}

fn dynamic_instance(id: u64, rebuild: bool, update: bool) -> RtInstance {
    RtInstance {
        id,
        mesh: mesh(1000 + id as u32 * 24, 7),
        to_world: Affine3A::from_scale_rotation_translation(
            Vec3::splat(2.0),
            Quat::from_rotation_y(0.5),
            Vec3::new(0.0, id as f32, 0.0),
        ),
        mode: MeshMode::Dynamic,
        rebuild,
        update,
        subgroup_mask: SUBGROUP_EMISSIVE,
    }
}

fn view(instances: &[RtInstance], static_changed: bool) -> RtSceneView {
    RtSceneView {
        instances,
        static_instances_changed: static_changed,
        vertex_buffer_va: 0x10_0000,
        index_buffer_va: 0x20_0000,
        vertex_stride: 32,
    }
}

/// The static BLAS compaction pipeline: build at F, size copy at F+2,
/// compaction at F+3, live swap at F+4.
#[test]
fn static_blas_compaction_timeline() {
    let mut h = Harness::new();
    let instances: Vec<RtInstance> = (0..100).map(|i| static_instance(i, i as u32)).collect();

    // frame F: the static set changed
    h.run_frame(&view(&instances, true));
    let built_va = h.tlas.static_blas_va();
    assert_ne!(built_va, 0);

    let builds_at = |device: &HeadlessDevice| {
        device
            .submissions()
            .iter()
            .flat_map(|s| s.commands.clone())
            .filter(|c| matches!(c, RecordedCommand::BuildAccel { .. }))
            .count()
    };
    // static BLAS build + TLAS build
    assert_eq!(builds_at(&h.device), 2);

    // accel work is recorded on the "tlas_build" list; the per-frame
    // instance-table upload rides its own "resource_upload" list
    let tlas_commands = |device: &HeadlessDevice| -> Vec<RecordedCommand> {
        device
            .submissions()
            .iter()
            .filter(|s| s.name == "tlas_build")
            .flat_map(|s| s.commands.clone())
            .collect()
    };

    // frame F+1: nothing compaction-related is issued
    h.device.clear_logs();
    h.run_frame(&view(&instances, false));
    assert!(tlas_commands(&h.device).iter().all(|c| !matches!(
        c,
        RecordedCommand::CopyBuffer { .. } | RecordedCommand::CompactAccel { .. }
    )));

    // frame F+2: the compacted size is copied to readback
    h.device.clear_logs();
    h.run_frame(&view(&instances, false));
    let copied = tlas_commands(&h.device)
        .iter()
        .any(|c| matches!(c, RecordedCommand::CopyBuffer { .. }));
    assert!(copied, "compaction size copy missing at F+2");

    // frame F+3: compaction into a tightly-sized buffer
    h.device.clear_logs();
    h.run_frame(&view(&instances, false));
    let compact = tlas_commands(&h.device)
        .into_iter()
        .find_map(|c| match c {
            RecordedCommand::CompactAccel { dest_va, src_va } => Some((dest_va, src_va)),
            _ => None,
        })
        .expect("compaction missing at F+3");
    assert_eq!(compact.1, built_va);
    assert_ne!(compact.0, built_va);
    // the uncompacted structure is still what the TLAS references this frame
    assert_eq!(h.tlas.static_blas_va(), built_va);

    // frame F+4: the compacted buffer is the live static BLAS
    h.run_frame(&view(&instances, false));
    assert_eq!(h.tlas.static_blas_va(), compact.0);
}

#[test]
fn uav_barriers_are_batched_before_the_tlas_build() {
    let mut h = Harness::new();
    let mut instances: Vec<RtInstance> = (0..4).map(|i| static_instance(i, 0)).collect();
    for i in 0..3 {
        instances.push(dynamic_instance(100 + i, true, false));
    }

    h.run_frame(&view(&instances, true));

    let submission = &h.device.submissions()[0];
    // exactly one barrier batch, carrying one UAV barrier per build
    let barrier_batches: Vec<&Vec<Barrier>> = submission
        .commands
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::Barriers(b) => Some(b),
            _ => None,
        })
        .collect();
    assert_eq!(barrier_batches.len(), 1);
    assert_eq!(barrier_batches[0].len(), 4); // static + 3 dynamic
    assert!(barrier_batches[0].iter().all(|b| matches!(b, Barrier::Uav { .. })));

    // the batch sits after every BLAS build and before the TLAS build
    let barrier_pos = submission
        .commands
        .iter()
        .position(|c| matches!(c, RecordedCommand::Barriers(_)))
        .unwrap();
    let last_build = submission
        .commands
        .iter()
        .rposition(|c| matches!(c, RecordedCommand::BuildAccel { .. }))
        .unwrap();
    assert!(barrier_pos < last_build, "TLAS build must follow the barrier batch");
}

#[test]
fn dynamic_updates_refit_in_place() {
    let mut h = Harness::new();
    let first = vec![dynamic_instance(5, true, false)];
    h.run_frame(&view(&first, false));
    let tlas_before = h.tlas.tlas_va();
    assert_ne!(tlas_before, 0);

    h.device.clear_logs();
    let updated = vec![dynamic_instance(5, false, true)];
    h.run_frame(&view(&updated, false));

    // the refit writes into the same destination it reads from
    let refit = h
        .device
        .submissions()
        .iter()
        .flat_map(|s| s.commands.clone())
        .find_map(|c| match c {
            RecordedCommand::BuildAccel { dest_va, source_va, .. } if source_va != 0 => {
                Some((dest_va, source_va))
            }
            _ => None,
        })
        .expect("no in-place update was recorded");
    assert_eq!(refit.0, refit.1);
}

#[test]
fn instance_table_is_static_then_dynamic() {
    let mut h = Harness::new();
    let instances = vec![
        static_instance(0, 11),
        dynamic_instance(50, true, false),
        static_instance(1, 22),
        dynamic_instance(51, true, false),
    ];
    h.run_frame(&view(&instances, true));

    let table = h.tlas.instance_table().expect("instance table missing");
    let bytes = h.device.read_buffer(table.resource(), 0, table.size());
    let entries: Vec<MeshInstance> = bytemuck::pod_collect_to_vec(&bytes);
    assert_eq!(entries.len(), 4);

    // statics first, in scene order, then dynamics
    assert_eq!(entries[0].material, 11);
    assert_eq!(entries[1].material, 22);
    assert_eq!(entries[2].material, 7);
    assert_eq!(entries[3].material, 7);

    // decomposed transform data rides along for hit shaders
    assert!((entries[2].scale[0] - 2.0).abs() < 1e-5);

    // published under its shared name
    let published = h.shared.find_buffer_named(RT_FRAME_MESH_INSTANCES).unwrap();
    assert_eq!(published.gpu_va, table.gpu_va());
}

#[test]
fn tlas_reuses_buffers_that_still_fit() {
    let mut h = Harness::new();
    let instances: Vec<RtInstance> = (0..8).map(|i| dynamic_instance(i, true, false)).collect();
    h.run_frame(&view(&instances, false));
    let tlas_va = h.tlas.tlas_va();

    // same instance count next frame: no reallocation
    let steady: Vec<RtInstance> = (0..8).map(|i| dynamic_instance(i, false, true)).collect();
    h.run_frame(&view(&steady, false));
    assert_eq!(h.tlas.tlas_va(), tlas_va);
}
