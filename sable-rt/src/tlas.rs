use sable_gpu::{
    AccelBuildDesc, AccelBuildFlags, AccelBuildInputs, Barrier, CommandList, DefaultHeapBuffer,
    GpuMemory, ResourceState, SharedResources, UploadHeapBuffer, path_hash,
};

use crate::blas::{DynamicBlas, StaticBlas};
use crate::instance::{MeshInstance, RtSceneView, TlasInstanceDesc, SUBGROUP_ALL};

/// Shared-resource names the manager publishes each frame.
pub const RT_TLAS: &str = "rt_tlas";
pub const RT_FRAME_MESH_INSTANCES: &str = "rt_frame_mesh_instances";

const INSTANCE_DESC_ALIGNMENT: u64 = 16;
const NEVER_REBUILT: u64 = u64::MAX;

/// Top-level acceleration structure and its companion instance table.
///
/// `render` is recorded on a compute-capable command list once per frame:
/// it rebuilds or refits the BLAS set, then rebuilds the TLAS over it. The
/// static BLAS compaction pipeline is spread across frames:
///
/// * F: static set changed, fresh build + compacted-size query
/// * F+2: query result copied to readback (the build is long done)
/// * F+3: compaction into a tightly-sized buffer; scratch released
/// * F+4: the compacted buffer becomes the live static BLAS
#[derive(Default)]
pub struct Tlas {
    static_blas: StaticBlas,
    /// Sorted by instance id so the table order is stable between frames.
    dynamic_blases: Vec<DynamicBlas>,
    tlas_buffer: Option<DefaultHeapBuffer>,
    scratch: Option<DefaultHeapBuffer>,
    instance_descs: Option<UploadHeapBuffer>,
    instance_table: Option<DefaultHeapBuffer>,
    static_rebuilt_frame: u64,
    num_static: u32,
}

impl Tlas {
    pub fn new() -> Self {
        Self {
            static_rebuilt_frame: NEVER_REBUILT,
            ..Default::default()
        }
    }

    pub fn static_blas_va(&self) -> u64 {
        self.static_blas.gpu_va()
    }

    pub fn tlas_va(&self) -> u64 {
        self.tlas_buffer.as_ref().map_or(0, |b| b.gpu_va())
    }

    /// The frame instance table, once built.
    pub fn instance_table(&self) -> Option<&DefaultHeapBuffer> {
        self.instance_table.as_ref()
    }

    /// Records all acceleration-structure work for this frame.
    pub fn render(
        &mut self,
        cmd: &mut dyn CommandList,
        scene: &RtSceneView,
        memory: &GpuMemory,
        frame: u64,
    ) {
        self.rebuild_or_update_blases(cmd, scene, memory, frame);
        self.rebuild_tlas(cmd, scene, memory);
    }

    fn rebuild_or_update_blases(
        &mut self,
        cmd: &mut dyn CommandList,
        scene: &RtSceneView,
        memory: &GpuMemory,
        frame: u64,
    ) {
        // Acceleration structures never leave the accel-structure state, so
        // writes are ordered by UAV barriers, not transitions. Batching them
        // into a single point right before the TLAS build avoids one GPU
        // sync per BLAS.
        let mut uav_barriers: Vec<Barrier> = Vec::new();

        self.num_static = scene.num_static();

        if scene.static_instances_changed {
            self.static_rebuilt_frame = frame;
            self.static_blas.rebuild(cmd, scene, memory);
            if let Some(id) = self.static_blas.resource_id() {
                uav_barriers.push(Barrier::Uav { resource: id });
            }
        } else if self.static_rebuilt_frame != NEVER_REBUILT {
            // rebuild was issued in frame F; by F+2 the build and its size
            // query are guaranteed complete
            if frame == self.static_rebuilt_frame + 2 {
                self.static_blas.copy_compaction_size(cmd);
            } else if frame == self.static_rebuilt_frame + 3 {
                self.static_blas.do_compaction(cmd, memory);
            } else if frame == self.static_rebuilt_frame + 4 {
                self.static_blas.compaction_completed(memory);
            }
        }

        for inst in scene.dynamic_instances() {
            debug_assert!(!(inst.rebuild && inst.update), "rebuild and update are exclusive");

            if inst.rebuild {
                let idx = match self.find_dynamic_blas(inst.id) {
                    Some(idx) => idx,
                    None => {
                        // first appearance; keep the array sorted by id
                        let idx = self
                            .dynamic_blases
                            .partition_point(|b| b.instance_id < inst.id);
                        self.dynamic_blases.insert(idx, DynamicBlas::new(inst.id, inst.mesh));
                        idx
                    }
                };
                self.dynamic_blases[idx].rebuild(cmd, scene, memory, frame);
                if let Some(id) = self.dynamic_blases[idx].blas_resource_id() {
                    uav_barriers.push(Barrier::Uav { resource: id });
                }
            } else if inst.update {
                let idx = self
                    .find_dynamic_blas(inst.id)
                    .expect("instance flagged for update was never built");
                self.dynamic_blases[idx].update(cmd, scene, memory);
                if let Some(id) = self.dynamic_blases[idx].blas_resource_id() {
                    uav_barriers.push(Barrier::Uav { resource: id });
                }
            }
        }

        if !uav_barriers.is_empty() {
            cmd.resource_barriers(&uav_barriers);
        }
    }

    fn rebuild_tlas(&mut self, cmd: &mut dyn CommandList, scene: &RtSceneView, memory: &GpuMemory) {
        let has_static = self.num_static > 0 && self.static_blas.is_built();
        let num_instances = self.dynamic_blases.len() as u32 + has_static as u32;
        if num_instances == 0 {
            return;
        }

        // fresh instance-desc buffer every frame
        if let Some(old) = self.instance_descs.take() {
            memory.release_upload_heap_buffer(old);
        }
        let descs = memory.get_upload_heap_buffer(
            num_instances as u64 * std::mem::size_of::<TlasInstanceDesc>() as u64,
            INSTANCE_DESC_ALIGNMENT,
        );

        let mut slot = 0usize;
        if has_static {
            // every static mesh was baked in world space; identity transform
            let desc = TlasInstanceDesc::new(
                &glam::Affine3A::IDENTITY,
                0,
                SUBGROUP_ALL,
                self.static_blas.gpu_va(),
            );
            descs.write(0, bytemuck::bytes_of(&desc));
            slot += 1;
        }

        // InstanceID = index into the frame instance table: statics occupy
        // [0, num_static), dynamic instance d sits at num_static + d
        for (d, inst) in scene.dynamic_instances().enumerate() {
            let idx = self
                .find_dynamic_blas(inst.id)
                .expect("dynamic instance without a BLAS at TLAS build");
            let desc = TlasInstanceDesc::new(
                &inst.to_world,
                self.num_static + d as u32,
                inst.subgroup_mask,
                self.dynamic_blases[idx].gpu_va(),
            );
            descs.write(slot * std::mem::size_of::<TlasInstanceDesc>(), bytemuck::bytes_of(&desc));
            slot += 1;
        }
        debug_assert_eq!(slot as u32, num_instances);

        let inputs = AccelBuildInputs::TopLevel {
            instance_count: num_instances,
            instances_va: descs.gpu_va(),
            flags: AccelBuildFlags::PREFER_FAST_TRACE,
        };
        let prebuild = memory.device().accel_prebuild_info(&inputs);
        assert!(prebuild.result_size > 0, "TLAS prebuild failed");

        if self.tlas_buffer.as_ref().map_or(true, |b| b.size() < prebuild.result_size) {
            // the previous TLAS rides the fence-deferred release path
            if let Some(old) = self.tlas_buffer.take() {
                memory.release_default_heap_buffer(old);
            }
            self.tlas_buffer = Some(memory.get_default_heap_buffer(
                "tlas",
                prebuild.result_size,
                ResourceState::ACCELERATION_STRUCTURE,
                true,
            ));
        }
        if self.scratch.as_ref().map_or(true, |b| b.size() < prebuild.scratch_size) {
            if let Some(old) = self.scratch.take() {
                memory.release_default_heap_buffer(old);
            }
            self.scratch = Some(memory.get_default_heap_buffer(
                "tlas_scratch",
                prebuild.scratch_size,
                ResourceState::COMMON,
                true,
            ));
        }

        cmd.build_acceleration_structure(&AccelBuildDesc {
            inputs,
            dest_va: self.tlas_buffer.as_ref().unwrap().gpu_va(),
            scratch_va: self.scratch.as_ref().unwrap().gpu_va(),
            source_va: 0,
            compacted_size_dst_va: 0,
        });
        self.instance_descs = Some(descs);
    }

    /// Uploads the `[static][dynamic]` instance table and publishes it (and
    /// the TLAS) through the shared-resource registry.
    pub fn build_frame_instance_table(
        &mut self,
        scene: &RtSceneView,
        memory: &GpuMemory,
        shared: &SharedResources,
    ) {
        let num_instances = scene.instances.len();
        if num_instances == 0 {
            return;
        }

        let mut table: Vec<MeshInstance> = Vec::with_capacity(num_instances);
        let mut push = |inst: &crate::instance::RtInstance| {
            let (scale, rotation, _translation) =
                inst.to_world.to_scale_rotation_translation();
            table.push(MeshInstance {
                material: inst.mesh.material,
                base_vertex: inst.mesh.base_vertex,
                base_index: inst.mesh.base_index,
                _pad0: 0,
                rotation: rotation.to_array(),
                scale: scale.to_array(),
                _pad1: 0.0,
            });
        };
        for inst in scene.static_instances() {
            push(inst);
        }
        for inst in scene.dynamic_instances() {
            push(inst);
        }

        let bytes: &[u8] = bytemuck::cast_slice(&table);
        let needs_alloc = self
            .instance_table
            .as_ref()
            .map_or(true, |b| b.size() < bytes.len() as u64);
        if needs_alloc {
            if let Some(old) = self.instance_table.take() {
                memory.release_default_heap_buffer(old);
            }
            self.instance_table = Some(memory.get_default_heap_buffer_init(
                RT_FRAME_MESH_INSTANCES,
                bytes.len() as u64,
                ResourceState::NON_PIXEL_SHADER_RESOURCE,
                false,
                bytes,
            ));
        } else {
            memory
                .upload_to_default_heap_buffer(self.instance_table.as_ref().unwrap(), bytes);
        }

        shared.insert_or_assign_buffer_named(
            RT_FRAME_MESH_INSTANCES,
            self.instance_table.as_ref().unwrap().resource().into(),
        );
        if let Some(tlas) = &self.tlas_buffer {
            shared.insert_or_assign_buffer(path_hash(RT_TLAS), tlas.resource().into());
        }
    }

    fn find_dynamic_blas(&self, instance_id: u64) -> Option<usize> {
        self.dynamic_blases
            .binary_search_by_key(&instance_id, |b| b.instance_id)
            .ok()
    }

    pub fn clear(&mut self, memory: &GpuMemory) {
        self.static_blas.clear(memory);
        for mut blas in self.dynamic_blases.drain(..) {
            blas.clear(memory);
        }
        for buffer in [self.tlas_buffer.take(), self.scratch.take(), self.instance_table.take()]
            .into_iter()
            .flatten()
        {
            memory.release_default_heap_buffer(buffer);
        }
        if let Some(descs) = self.instance_descs.take() {
            memory.release_upload_heap_buffer(descs);
        }
        self.static_rebuilt_frame = NEVER_REBUILT;
    }
}
