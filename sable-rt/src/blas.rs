use sable_gpu::{
    AccelBuildDesc, AccelBuildFlags, AccelBuildInputs, AccelGeometry, CommandList,
    DefaultHeapBuffer, GpuMemory, ReadbackHeapBuffer, ResourceState, UploadHeapBuffer,
};

use crate::instance::{transform_rows, MeshRef, RtSceneView};

const TRANSFORM_3X4_SIZE: u64 = 12 * 4;
const TRANSFORM_3X4_ALIGNMENT: u64 = 16;

fn geometry_for(mesh: &MeshRef, scene: &RtSceneView, transform_va: u64) -> AccelGeometry {
    AccelGeometry {
        vertex_va: scene.vertex_buffer_va + mesh.base_vertex as u64 * scene.vertex_stride as u64,
        vertex_count: mesh.vertex_count,
        vertex_stride: scene.vertex_stride,
        index_va: scene.index_buffer_va + mesh.base_index as u64 * 4,
        index_count: mesh.index_count,
        transform_va,
    }
}

//=============================================================================
// StaticBLAS
//=============================================================================

/// The merged bottom-level structure over every static instance.
///
/// Built once per static-set change with `PREFER_FAST_TRACE |
/// ALLOW_COMPACTION` plus a compacted-size query, then compacted over the
/// following frames (the surrounding [`crate::Tlas`] drives the schedule).
#[derive(Default)]
pub struct StaticBlas {
    blas: Option<DefaultHeapBuffer>,
    compacted: Option<DefaultHeapBuffer>,
    scratch: Option<DefaultHeapBuffer>,
    postbuild_info: Option<DefaultHeapBuffer>,
    postbuild_readback: Option<ReadbackHeapBuffer>,
    build_transforms: Option<UploadHeapBuffer>,
}

impl StaticBlas {
    /// GPU address of the live structure, or 0 before the first build.
    pub fn gpu_va(&self) -> u64 {
        self.blas.as_ref().map_or(0, |b| b.gpu_va())
    }

    pub fn resource_id(&self) -> Option<sable_gpu::ResourceId> {
        self.blas.as_ref().map(|b| b.id())
    }

    pub fn is_built(&self) -> bool {
        self.blas.is_some()
    }

    /// Issues one build over all static instances, with the compacted-size
    /// postbuild query.
    pub fn rebuild(&mut self, cmd: &mut dyn CommandList, scene: &RtSceneView, memory: &GpuMemory) {
        let num_static = scene.num_static();
        if num_static == 0 {
            return;
        }

        self.fill_transform_buffer(scene, memory);
        let transforms_va = self.build_transforms.as_ref().unwrap().gpu_va();

        let geometries: Vec<AccelGeometry> = scene
            .static_instances()
            .enumerate()
            .map(|(i, inst)| {
                geometry_for(&inst.mesh, scene, transforms_va + i as u64 * TRANSFORM_3X4_SIZE)
            })
            .collect();

        let inputs = AccelBuildInputs::BottomLevel {
            geometries,
            flags: AccelBuildFlags::PREFER_FAST_TRACE | AccelBuildFlags::ALLOW_COMPACTION,
        };
        let prebuild = memory.device().accel_prebuild_info(&inputs);
        assert!(prebuild.result_size > 0, "acceleration-structure prebuild failed");

        // keep the old buffer when it is already large enough
        if self.blas.as_ref().map_or(true, |b| b.size() < prebuild.result_size) {
            if let Some(old) = self.blas.take() {
                memory.release_default_heap_buffer(old);
            }
            self.blas = Some(memory.get_default_heap_buffer(
                "static_blas",
                prebuild.result_size,
                ResourceState::ACCELERATION_STRUCTURE,
                true,
            ));
        }
        self.scratch = Some(memory.get_default_heap_buffer(
            "static_blas_scratch",
            prebuild.scratch_size,
            ResourceState::COMMON,
            true,
        ));
        self.postbuild_info = Some(memory.get_default_heap_buffer(
            "static_blas_postbuild",
            8,
            ResourceState::COMMON,
            true,
        ));
        self.postbuild_readback = Some(memory.get_readback_heap_buffer(8));

        cmd.build_acceleration_structure(&AccelBuildDesc {
            inputs,
            dest_va: self.blas.as_ref().unwrap().gpu_va(),
            scratch_va: self.scratch.as_ref().unwrap().gpu_va(),
            source_va: 0,
            compacted_size_dst_va: self.postbuild_info.as_ref().unwrap().gpu_va(),
        });
    }

    fn fill_transform_buffer(&mut self, scene: &RtSceneView, memory: &GpuMemory) {
        if let Some(old) = self.build_transforms.take() {
            memory.release_upload_heap_buffer(old);
        }
        let num_static = scene.num_static() as u64;
        let buffer =
            memory.get_upload_heap_buffer(num_static * TRANSFORM_3X4_SIZE, TRANSFORM_3X4_ALIGNMENT);

        for (i, inst) in scene.static_instances().enumerate() {
            let rows = transform_rows(&inst.to_world);
            buffer.write(i * TRANSFORM_3X4_SIZE as usize, bytemuck::cast_slice(&rows));
        }
        self.build_transforms = Some(buffer);
    }

    /// Copies the compacted-size query result into the readback buffer.
    pub fn copy_compaction_size(&mut self, cmd: &mut dyn CommandList) {
        let info = self.postbuild_info.as_ref().expect("no compaction query in flight");
        let readback = self.postbuild_readback.as_ref().unwrap();

        cmd.resource_barriers(&[sable_gpu::Barrier::Transition {
            resource: info.id(),
            before: ResourceState::UNORDERED_ACCESS,
            after: ResourceState::COPY_SOURCE,
        }]);
        cmd.copy_buffer(info.resource(), 0, readback.resource(), 0, 8);
    }

    /// Reads the compacted size back and issues the compaction into a
    /// tightly-sized buffer. The uncompacted structure stays live (and
    /// fence-deferred released) until [`Self::compaction_completed`].
    pub fn do_compaction(&mut self, cmd: &mut dyn CommandList, memory: &GpuMemory) {
        let mut readback = self.postbuild_readback.take().expect("compaction size was not copied");
        memory.map_readback(&mut readback);
        let compacted_size = u64::from_le_bytes(readback.read(0, 8).try_into().unwrap());
        memory.unmap_readback(&mut readback);
        memory.release_readback_heap_buffer(readback);

        assert!(compacted_size > 0, "compacted size query returned zero");
        log::info!(
            "compacting static BLAS: {} -> {} bytes",
            self.blas.as_ref().map_or(0, |b| b.size()),
            compacted_size
        );

        let compacted = memory.get_default_heap_buffer(
            "static_blas_compacted",
            compacted_size,
            ResourceState::ACCELERATION_STRUCTURE,
            true,
        );
        cmd.compact_acceleration_structure(
            compacted.gpu_va(),
            self.blas.as_ref().expect("compaction without a build").gpu_va(),
        );
        self.compacted = Some(compacted);

        if let Some(scratch) = self.scratch.take() {
            memory.release_default_heap_buffer(scratch);
        }
        if let Some(info) = self.postbuild_info.take() {
            memory.release_default_heap_buffer(info);
        }
    }

    /// Swaps the compacted structure in as the live static BLAS.
    pub fn compaction_completed(&mut self, memory: &GpuMemory) {
        let compacted = self.compacted.take().expect("no compaction in flight");
        if let Some(old) = self.blas.take() {
            memory.release_default_heap_buffer(old);
        }
        self.blas = Some(compacted);
    }

    pub fn clear(&mut self, memory: &GpuMemory) {
        for buffer in [
            self.blas.take(),
            self.compacted.take(),
            self.scratch.take(),
            self.postbuild_info.take(),
        ]
        .into_iter()
        .flatten()
        {
            memory.release_default_heap_buffer(buffer);
        }
        if let Some(readback) = self.postbuild_readback.take() {
            memory.release_readback_heap_buffer(readback);
        }
        if let Some(transforms) = self.build_transforms.take() {
            memory.release_upload_heap_buffer(transforms);
        }
    }
}

//=============================================================================
// DynamicBLAS
//=============================================================================

/// One rebuildable/refittable BLAS per dynamic instance.
pub struct DynamicBlas {
    pub(crate) instance_id: u64,
    mesh: MeshRef,
    blas: Option<DefaultHeapBuffer>,
    scratch: Option<DefaultHeapBuffer>,
    frame_built: u64,
}

impl DynamicBlas {
    pub fn new(instance_id: u64, mesh: MeshRef) -> Self {
        Self {
            instance_id,
            mesh,
            blas: None,
            scratch: None,
            frame_built: 0,
        }
    }

    pub fn gpu_va(&self) -> u64 {
        self.blas.as_ref().map_or(0, |b| b.gpu_va())
    }

    /// Frame of the most recent full rebuild.
    pub fn frame_built(&self) -> u64 {
        self.frame_built
    }

    fn build_inputs(&self, scene: &RtSceneView, perform_update: bool) -> AccelBuildInputs {
        let mut flags = AccelBuildFlags::PREFER_FAST_BUILD | AccelBuildFlags::ALLOW_UPDATE;
        if perform_update {
            flags |= AccelBuildFlags::PERFORM_UPDATE;
        }
        AccelBuildInputs::BottomLevel {
            geometries: vec![geometry_for(&self.mesh, scene, 0)],
            flags,
        }
    }

    pub fn rebuild(
        &mut self,
        cmd: &mut dyn CommandList,
        scene: &RtSceneView,
        memory: &GpuMemory,
        frame: u64,
    ) {
        let inputs = self.build_inputs(scene, false);
        let prebuild = memory.device().accel_prebuild_info(&inputs);
        assert!(prebuild.result_size > 0, "acceleration-structure prebuild failed");

        if self.blas.as_ref().map_or(true, |b| b.size() < prebuild.result_size) {
            if let Some(old) = self.blas.take() {
                memory.release_default_heap_buffer(old);
            }
            self.blas = Some(memory.get_default_heap_buffer(
                "dynamic_blas",
                prebuild.result_size,
                ResourceState::ACCELERATION_STRUCTURE,
                true,
            ));
        }
        self.ensure_scratch(prebuild.scratch_size, memory);

        cmd.build_acceleration_structure(&AccelBuildDesc {
            inputs,
            dest_va: self.blas.as_ref().unwrap().gpu_va(),
            scratch_va: self.scratch.as_ref().unwrap().gpu_va(),
            source_va: 0,
            compacted_size_dst_va: 0,
        });
        self.frame_built = frame;
    }

    /// Refit in place, reusing the previous scratch when it still fits.
    pub fn update(&mut self, cmd: &mut dyn CommandList, scene: &RtSceneView, memory: &GpuMemory) {
        let inputs = self.build_inputs(scene, true);
        let prebuild = memory.device().accel_prebuild_info(&inputs);
        self.ensure_scratch(prebuild.update_scratch_size, memory);

        let dest_va = self.blas.as_ref().expect("update before first build").gpu_va();
        cmd.build_acceleration_structure(&AccelBuildDesc {
            inputs,
            dest_va,
            scratch_va: self.scratch.as_ref().unwrap().gpu_va(),
            source_va: dest_va,
            compacted_size_dst_va: 0,
        });
    }

    fn ensure_scratch(&mut self, size: u64, memory: &GpuMemory) {
        if self.scratch.as_ref().map_or(true, |s| s.size() < size) {
            if let Some(old) = self.scratch.take() {
                memory.release_default_heap_buffer(old);
            }
            self.scratch = Some(memory.get_default_heap_buffer(
                "dynamic_blas_scratch",
                size,
                ResourceState::UNORDERED_ACCESS,
                true,
            ));
        }
    }

    pub fn blas_resource_id(&self) -> Option<sable_gpu::ResourceId> {
        self.blas.as_ref().map(|b| b.id())
    }

    pub fn clear(&mut self, memory: &GpuMemory) {
        if let Some(blas) = self.blas.take() {
            memory.release_default_heap_buffer(blas);
        }
        if let Some(scratch) = self.scratch.take() {
            memory.release_default_heap_buffer(scratch);
        }
    }
}
