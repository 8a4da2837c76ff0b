use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use arrayvec::ArrayString;
use parking_lot::{Mutex, RwLock};

use sable_gpu::{Barrier, CommandList, GpuDevice, QueueKind, ResourceId, ResourceState};
use sable_task::TaskSet;

pub const MAX_RENDER_PASSES: usize = 32;
pub const MAX_RESOURCES: usize = 64;
pub const MAX_RESOURCE_PRODUCERS: usize = 5;

const MAX_NODE_NAME_LEN: usize = 16;
const MAX_AGGREGATE_NAME_LEN: usize = 64;

const INVALID_PRODUCER: u16 = u16::MAX;

/// Path IDs below this value are placeholder resources: they participate in
/// ordering edges but never receive barriers.
const NUM_DUMMY_RESOURCES: u64 = 4;

/// Placeholder path ID for pure-ordering dependencies (no device resource
/// behind it). `slot < 4`.
pub const fn dummy_res(slot: u64) -> u64 {
    assert!(slot < NUM_DUMMY_RESOURCES);
    slot
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderNodeType {
    Render,
    Compute,
    AsyncCompute,
}

impl RenderNodeType {
    fn is_async_compute(self) -> bool {
        self == Self::AsyncCompute
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderNodeHandle(i32);

impl RenderNodeHandle {
    pub const INVALID: Self = Self(-1);

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

/// Pass recording callback: a cheap, clonable indirect call.
pub type RecordCallback = Arc<dyn Fn(&mut dyn CommandList) + Send + Sync>;

/// Per-frame inputs `build` needs from the surrounding engine.
pub struct GraphExecContext {
    pub device: Arc<dyn GpuDevice>,
    /// Path ID of the current back buffer, or 0. Its tracked state is
    /// forced to present after the barrier walk.
    pub back_buffer_path: u64,
    /// Recorded on the final aggregate, for end-of-frame GPU timings.
    pub end_frame_hook: Option<RecordCallback>,
}

//=============================================================================
// Frame resources
//=============================================================================

struct ResourceMetadata {
    id: u64,
    res: ResourceId,
    state: ResourceState,
    window_size_dependent: bool,
    curr_producer: AtomicU16,
    producers: [AtomicU16; MAX_RESOURCE_PRODUCERS],
}

impl ResourceMetadata {
    fn new(id: u64, res: ResourceId, state: ResourceState, window_size_dependent: bool) -> Self {
        Self {
            id,
            res,
            state,
            window_size_dependent,
            curr_producer: AtomicU16::new(0),
            producers: Default::default(),
        }
    }

    fn reset_producers(&self) {
        self.curr_producer.store(0, Ordering::Relaxed);
        for producer in &self.producers {
            producer.store(INVALID_PRODUCER, Ordering::Relaxed);
        }
    }

    fn producer_count(&self) -> usize {
        self.curr_producer.load(Ordering::Relaxed) as usize
    }

    fn producer(&self, idx: usize) -> i32 {
        let value = self.producers[idx].load(Ordering::Relaxed);
        if value == INVALID_PRODUCER {
            -1
        } else {
            value as i32
        }
    }
}

//=============================================================================
// Nodes
//=============================================================================

#[derive(Clone, Copy, Debug)]
struct Dependency {
    res_id: u64,
    expected: ResourceState,
}

#[derive(Default)]
struct RenderNode {
    name: ArrayString<MAX_NODE_NAME_LEN>,
    node_type: Option<RenderNodeType>,
    callback: Option<RecordCallback>,
    inputs: Vec<Dependency>,
    outputs: Vec<Dependency>,
    barriers: Vec<Barrier>,
    indegree: i32,
    batch_idx: i32,
    has_unsupported_barrier: bool,
    /// Sorted index of the single cross-queue producer to wait on, or -1.
    gpu_dep_source: i32,
    /// Output slots whose barrier is skipped because the same resource also
    /// appears as an input of this node (self-edge).
    output_mask: u32,
    /// Index of the aggregate this node landed in after joining.
    agg_index: i32,
}

impl RenderNode {
    fn reset(&mut self, name: &str, node_type: RenderNodeType, callback: RecordCallback) {
        self.name.clear();
        let mut end = name.len().min(MAX_NODE_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        self.name.push_str(&name[..end]);

        self.node_type = Some(node_type);
        self.callback = Some(callback);
        self.inputs.clear();
        self.outputs.clear();
        self.barriers.clear();
        self.indegree = 0;
        self.batch_idx = -1;
        self.has_unsupported_barrier = false;
        self.gpu_dep_source = -1;
        self.output_mask = 0;
        self.agg_index = -1;
    }

    fn clear(&mut self) {
        self.node_type = None;
        self.callback = None;
        self.inputs.clear();
        self.outputs.clear();
        self.barriers.clear();
    }

    fn is_async_compute(&self) -> bool {
        self.node_type.is_some_and(RenderNodeType::is_async_compute)
    }
}

//=============================================================================
// Aggregates
//=============================================================================

struct AggregateNode {
    name: ArrayString<MAX_AGGREGATE_NAME_LEN>,
    is_async_compute: bool,
    has_unsupported_barrier: bool,
    is_last: bool,
    barriers: Vec<Barrier>,
    callbacks: Vec<RecordCallback>,
    /// Index of the aggregate whose completion fence gates this one, or -1.
    gpu_dep: i32,
}

impl AggregateNode {
    fn new(is_async_compute: bool) -> Self {
        Self {
            name: ArrayString::new(),
            is_async_compute,
            has_unsupported_barrier: false,
            is_last: false,
            barriers: Vec::new(),
            callbacks: Vec::new(),
            gpu_dep: -1,
        }
    }

    fn append(&mut self, node: &mut RenderNode, mapped_gpu_dep: i32) {
        debug_assert_eq!(
            self.is_async_compute,
            node.is_async_compute(),
            "aggregate nodes must not mix queue types"
        );
        debug_assert!(
            !node.has_unsupported_barrier || node.is_async_compute(),
            "only async-compute nodes carry unsupported barriers"
        );

        self.barriers.append(&mut node.barriers);
        self.callbacks
            .push(node.callback.clone().expect("node registered without a callback"));
        self.gpu_dep = self.gpu_dep.max(mapped_gpu_dep);
        self.has_unsupported_barrier |= node.has_unsupported_barrier;

        if !self.name.is_empty() {
            let _ = self.name.try_push('_');
        }
        let room = self.name.remaining_capacity().min(node.name.len());
        let mut end = room;
        while !node.name.is_char_boundary(end) {
            end -= 1;
        }
        let _ = self.name.try_push_str(&node.name[..end]);
    }
}

/// Read-only view of one built aggregate. Debug/test introspection.
#[derive(Clone, Debug)]
pub struct AggregateSnapshot {
    pub name: String,
    pub is_async_compute: bool,
    pub has_unsupported_barrier: bool,
    pub is_last: bool,
    pub barriers: Vec<Barrier>,
    pub pass_count: usize,
    pub gpu_dep: i32,
}

/// State shared with the emitted worker tasks for one frame.
struct FrameExec {
    device: Arc<dyn GpuDevice>,
    aggregates: Vec<AggregateNode>,
    completion_fences: Vec<AtomicU64>,
    end_frame_hook: Option<RecordCallback>,
}

//=============================================================================
// RenderGraph
//=============================================================================

pub struct RenderGraph {
    nodes: Vec<Mutex<RenderNode>>,
    curr_pass: AtomicI32,
    frame_resources: RwLock<Vec<ResourceMetadata>>,
    prev_frame_resource_count: usize,
    snapshots: Vec<AggregateSnapshot>,
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderGraph {
    pub fn new() -> Self {
        Self {
            nodes: (0..MAX_RENDER_PASSES).map(|_| Mutex::new(RenderNode::default())).collect(),
            curr_pass: AtomicI32::new(0),
            frame_resources: RwLock::new(Vec::with_capacity(MAX_RESOURCES)),
            prev_frame_resource_count: 0,
            snapshots: Vec::new(),
        }
    }

    //-------------------------------------------------------------------------
    // Registration
    //-------------------------------------------------------------------------

    /// Clears the per-frame arrays and every resource's producer table.
    /// Tracked resource states persist across frames.
    pub fn begin_frame(&mut self) {
        let resources = self.frame_resources.get_mut();
        self.prev_frame_resource_count = resources.len();
        for resource in resources.iter() {
            resource.reset_producers();
        }

        for node in &mut self.nodes {
            node.get_mut().clear();
        }
        self.curr_pass.store(0, Ordering::Relaxed);
        self.snapshots.clear();
    }

    /// Drops a resource entry (used when a resource is recreated).
    /// Must be called before `begin_frame`.
    pub fn remove_resource(&mut self, path_id: u64) {
        let resources = self.frame_resources.get_mut();
        if let Ok(pos) = resources.binary_search_by_key(&path_id, |r| r.id) {
            resources.remove(pos);
        }
    }

    pub fn remove_resources(&mut self, path_ids: &[u64]) {
        for &path_id in path_ids {
            self.remove_resource(path_id);
        }
    }

    /// Drops every window-size-dependent resource; called on swap-chain
    /// resize so the recreated targets re-register fresh.
    pub fn purge_window_size_dependent(&mut self) {
        let resources = self.frame_resources.get_mut();
        resources.retain(|r| !r.window_size_dependent);
        self.prev_frame_resource_count = resources.len();
    }

    /// Adds a pass for this frame and returns its handle.
    pub fn register_render_pass(
        &self,
        name: &str,
        node_type: RenderNodeType,
        callback: RecordCallback,
    ) -> RenderNodeHandle {
        let h = self.curr_pass.fetch_add(1, Ordering::Relaxed);
        assert!(
            (h as usize) < MAX_RENDER_PASSES,
            "render pass '{}' exceeds the {}-pass frame capacity",
            name,
            MAX_RENDER_PASSES
        );
        self.nodes[h as usize].lock().reset(name, node_type, callback);
        RenderNodeHandle(h)
    }

    /// Registers a resource for this frame. An existing entry with the same
    /// path keeps its tracked state unless the device handle changed.
    pub fn register_resource(
        &self,
        res: ResourceId,
        path_id: u64,
        init_state: ResourceState,
        window_size_dependent: bool,
    ) {
        assert!(
            !res.is_valid() || path_id >= NUM_DUMMY_RESOURCES,
            "resource path {} collides with the placeholder range",
            path_id
        );

        let mut resources = self.frame_resources.write();

        if let Ok(pos) = resources[..self.prev_frame_resource_count]
            .binary_search_by_key(&path_id, |r| r.id)
        {
            let entry = &mut resources[pos];
            if entry.res != res {
                log::warn!(
                    "resource {:#x} re-registered with a different device handle; replacing",
                    path_id
                );
                *entry = ResourceMetadata::new(path_id, res, init_state, window_size_dependent);
            }
            return;
        }

        assert!(
            resources.len() < MAX_RESOURCES,
            "resource {:#x} exceeds the {}-resource frame capacity",
            path_id,
            MAX_RESOURCES
        );
        resources.push(ResourceMetadata::new(path_id, res, init_state, window_size_dependent));
    }

    /// Sorts the frame-resource array by path ID so later lookups binary
    /// search. No `register_*` calls are legal after this.
    pub fn move_to_post_register(&mut self) {
        let resources = self.frame_resources.get_mut();
        resources.sort_by_key(|r| r.id);

        // duplicate path IDs: keep the latest registration
        let mut i = 1;
        while i < resources.len() {
            if resources[i].id == resources[i - 1].id {
                log::warn!("duplicate registration for resource {:#x}; replacing", resources[i].id);
                resources.remove(i - 1);
            } else {
                i += 1;
            }
        }
    }

    //-------------------------------------------------------------------------
    // Dependency declaration
    //-------------------------------------------------------------------------

    pub fn add_input(&self, h: RenderNodeHandle, path_id: u64, expected: ResourceState) {
        assert!(h.is_valid() && h.0 < self.curr_pass.load(Ordering::Relaxed), "invalid pass handle");
        assert!(
            ResourceState::READ_STATES.contains(expected),
            "pass '{}': {} is not a legal read state",
            self.nodes[h.0 as usize].lock().name,
            expected.name()
        );
        self.nodes[h.0 as usize].lock().inputs.push(Dependency { res_id: path_id, expected });
    }

    pub fn add_output(&self, h: RenderNodeHandle, path_id: u64, expected: ResourceState) {
        assert!(h.is_valid() && h.0 < self.curr_pass.load(Ordering::Relaxed), "invalid pass handle");
        {
            let node = self.nodes[h.0 as usize].lock();
            assert!(
                ResourceState::WRITE_STATES.intersects(expected),
                "pass '{}': {} is not a legal write state",
                node.name,
                expected.name()
            );
            assert!(
                !node.is_async_compute() || expected.legal_on_compute(),
                "pass '{}': transition to {} is not supported on an async-compute command list",
                node.name,
                expected.name()
            );
        }
        self.nodes[h.0 as usize].lock().outputs.push(Dependency { res_id: path_id, expected });

        let resources = self.frame_resources.read();
        let pos = resources
            .binary_search_by_key(&path_id, |r| r.id)
            .unwrap_or_else(|_| panic!("output declared on unregistered resource {:#x}", path_id));

        let entry = &resources[pos];
        let producer_idx = entry.curr_producer.fetch_add(1, Ordering::Relaxed) as usize;
        assert!(
            producer_idx < MAX_RESOURCE_PRODUCERS,
            "resource {:#x} exceeds {} producers",
            path_id,
            MAX_RESOURCE_PRODUCERS
        );
        entry.producers[producer_idx].store(h.0 as u16, Ordering::Relaxed);
    }

    //-------------------------------------------------------------------------
    // Build
    //-------------------------------------------------------------------------

    /// Builds the frame DAG and emits one worker task per aggregate into
    /// `task_set`. Deterministic for identical registrations.
    pub fn build(&mut self, task_set: &mut TaskSet, ctx: &GraphExecContext) {
        profiling::scope!("render_graph_build");

        let num_nodes = self.curr_pass.load(Ordering::Relaxed) as usize;
        assert!(num_nodes > 0, "no render passes were registered this frame");

        // 1 + 2: indegree initialization and edge assembly
        let mut adjacent_tail: Vec<Vec<RenderNodeHandle>> = vec![Vec::new(); num_nodes];
        self.assemble_edges(num_nodes, &mut adjacent_tail);

        // 3: topological sort with longest-path batch indices
        let (mapping, order) = self.sort(num_nodes, &adjacent_tail);

        // 4 + 5: barrier insertion and cross-queue dependency resolution
        self.insert_resource_barriers(num_nodes, &mapping, &order, ctx.back_buffer_path);

        // 6: merge same-queue runs per batch into aggregates
        let aggregates = self.join_render_nodes(num_nodes);
        self.snapshots = aggregates
            .iter()
            .map(|agg| AggregateSnapshot {
                name: agg.name.to_string(),
                is_async_compute: agg.is_async_compute,
                has_unsupported_barrier: agg.has_unsupported_barrier,
                is_last: agg.is_last,
                barriers: agg.barriers.clone(),
                pass_count: agg.callbacks.len(),
                gpu_dep: agg.gpu_dep,
            })
            .collect();

        // 7: task emission
        self.emit_tasks(aggregates, task_set, ctx);

        log::debug!("built render graph: {} passes, {} aggregates", num_nodes, self.snapshots.len());
    }

    fn assemble_edges(&mut self, num_nodes: usize, adjacent_tail: &mut [Vec<RenderNodeHandle>]) {
        let resources = self.frame_resources.read();

        for curr in 0..num_nodes {
            let node = self.nodes[curr].get_mut();
            let mut indegree = 0;

            for input_idx in 0..node.inputs.len() {
                let input = node.inputs[input_idx];
                let pos = resources
                    .binary_search_by_key(&input.res_id, |r| r.id)
                    .unwrap_or_else(|_| {
                        panic!("input declared on unregistered resource {:#x}", input.res_id)
                    });
                let entry = &resources[pos];

                // a resource untouched this frame contributes nothing; its
                // state was produced in a prior frame
                for producer_idx in 0..entry.producer_count() {
                    let producer = entry.producer(producer_idx);
                    if producer == curr as i32 {
                        // Self-edge: the resource ping-pongs inside this
                        // pass. Barriers run before recording, so the graph
                        // only transitions it into the input state; the
                        // matching output barrier is masked off and the pass
                        // handles (and restores) further transitions itself.
                        debug_assert!(!node.outputs.is_empty(), "self-edge without outputs");
                        for (slot, output) in node.outputs.iter().enumerate() {
                            if output.res_id == input.res_id {
                                node.output_mask |= 1 << slot;
                                break;
                            }
                        }
                    } else if producer < curr as i32 {
                        adjacent_tail[producer as usize].push(RenderNodeHandle(curr as i32));
                        indegree += 1;
                    }
                    // A later-registered producer is a write-after-read: no
                    // data flows into this pass, and same-queue submission
                    // order (plus the writer's own barrier) already orders
                    // the hazard. An edge here would make ping-pong chains
                    // cyclic.
                }
            }

            node.indegree = indegree;
        }
    }

    /// Kahn topological sort; batch index is the longest-path depth. Nodes
    /// are reordered into execution order. Returns the pre-sort-handle to
    /// sorted-index mapping (producer tables were recorded against pre-sort
    /// handles) and its inverse.
    fn sort(
        &mut self,
        num_nodes: usize,
        adjacent_tail: &[Vec<RenderNodeHandle>],
    ) -> (Vec<i32>, Vec<i32>) {
        let mut sorted: Vec<i32> = Vec::with_capacity(num_nodes);

        for curr in 0..num_nodes {
            let node = self.nodes[curr].get_mut();
            if node.indegree == 0 {
                node.batch_idx = 0;
                sorted.push(curr as i32);
            }
        }
        assert!(!sorted.is_empty(), "render graph has a cycle: no pass with zero dependencies");

        let mut head = 0;
        while head < sorted.len() {
            let curr = sorted[head] as usize;
            head += 1;
            for &adjacent in &adjacent_tail[curr] {
                let node = self.nodes[adjacent.0 as usize].get_mut();
                node.indegree -= 1;
                if node.indegree == 0 {
                    sorted.push(adjacent.0);
                }
            }
        }
        assert_eq!(sorted.len(), num_nodes, "render graph has a cycle");

        // longest path to each node, in topological order
        for i in 0..num_nodes {
            let curr = sorted[i] as usize;
            let curr_batch = self.nodes[curr].get_mut().batch_idx;
            for &adjacent in &adjacent_tail[curr] {
                let node = self.nodes[adjacent.0 as usize].get_mut();
                node.batch_idx = node.batch_idx.max(curr_batch + 1);
            }
        }

        sorted.sort_by_key(|&h| self.nodes[h as usize].get_mut().batch_idx);

        // pre-sort handle -> execution-order index
        let mut mapping = vec![-1i32; num_nodes];
        for (sorted_idx, &handle) in sorted.iter().enumerate() {
            mapping[handle as usize] = sorted_idx as i32;
        }

        // shuffle the nodes into execution order
        let mut reordered: Vec<RenderNode> = sorted
            .iter()
            .map(|&h| std::mem::take(self.nodes[h as usize].get_mut()))
            .collect();
        for (i, node) in reordered.drain(..).enumerate() {
            *self.nodes[i].get_mut() = node;
        }

        (mapping, sorted)
    }

    /// Walks nodes in execution order inserting transition barriers and
    /// resolving cross-queue GPU dependencies.
    fn insert_resource_barriers(
        &mut self,
        num_nodes: usize,
        mapping: &[i32],
        order: &[i32],
        back_buffer: u64,
    ) {
        let resources = self.frame_resources.get_mut();

        // Per-queue watermark, keyed by the *consumer's* queue: the largest
        // sorted index of an other-queue producer that queue has already
        // fenced against. A later consumer on the same queue needs no fence
        // for anything at or below its watermark.
        let mut last_synced_on_direct = -1i32;
        let mut last_synced_on_compute = -1i32;

        // the sort left nodes plain; split borrows per iteration
        let nodes = &mut self.nodes[..num_nodes];

        for curr in 0..num_nodes {
            // collect producer queue info before mutably borrowing the node
            let (is_async, inputs): (bool, Vec<Dependency>) = {
                let node = nodes[curr].get_mut();
                (node.is_async_compute(), node.inputs.clone())
            };

            let mut largest_producer_sorted = -1i32;

            for input in &inputs {
                if input.res_id < NUM_DUMMY_RESOURCES {
                    continue;
                }
                let pos = resources
                    .binary_search_by_key(&input.res_id, |r| r.id)
                    .expect("input resource vanished between declaration and build");
                let tracked = resources[pos].state;

                if !tracked.intersects(input.expected) {
                    let node = nodes[curr].get_mut();
                    // an unsupported *after* state was rejected at declaration
                    node.has_unsupported_barrier |=
                        is_async && tracked.intersects(ResourceState::INVALID_COMPUTE_STATES);
                    node.barriers.push(Barrier::Transition {
                        resource: resources[pos].res,
                        before: tracked,
                        after: input.expected,
                    });
                    resources[pos].state = input.expected;
                }

                // Cross-queue sync: find the producer with the largest
                // execution index on the other queue. A single fence wait on
                // it covers every earlier producer of this input.
                let curr_unsorted = order[curr];
                let num_producers = resources[pos].producer_count();
                for producer_idx in 0..num_producers {
                    let unsorted = resources[pos].producer(producer_idx);
                    // self and write-after-read producers carry no data in
                    if unsorted < 0 || unsorted >= curr_unsorted {
                        continue;
                    }
                    let sorted_handle = mapping[unsorted as usize];
                    let producer_async = nodes[sorted_handle as usize].get_mut().is_async_compute();
                    if producer_async != is_async {
                        let producer_batch = nodes[sorted_handle as usize].get_mut().batch_idx;
                        let consumer_batch = nodes[curr].get_mut().batch_idx;
                        debug_assert!(
                            producer_batch < consumer_batch,
                            "cross-queue producer is not ordered before its consumer"
                        );
                        largest_producer_sorted = largest_producer_sorted.max(sorted_handle);
                    }
                }
            }

            // Skip the fence when an earlier node on this queue already
            // synced with an equal-or-later producer.
            let last_synced = if is_async {
                &mut last_synced_on_compute
            } else {
                &mut last_synced_on_direct
            };
            if largest_producer_sorted != -1 && *last_synced < largest_producer_sorted {
                *last_synced = largest_producer_sorted;
                nodes[curr].get_mut().gpu_dep_source = largest_producer_sorted;
            }

            // outputs
            let outputs: Vec<Dependency> = nodes[curr].get_mut().outputs.clone();
            for (slot, output) in outputs.iter().enumerate() {
                if output.res_id < NUM_DUMMY_RESOURCES {
                    continue;
                }
                let skip_barrier = (1u32 << slot) & nodes[curr].get_mut().output_mask != 0;

                let pos = resources
                    .binary_search_by_key(&output.res_id, |r| r.id)
                    .expect("output resource vanished between declaration and build");
                let tracked = resources[pos].state;

                if !skip_barrier && !tracked.intersects(output.expected) {
                    let node = nodes[curr].get_mut();
                    node.has_unsupported_barrier |=
                        is_async && tracked.intersects(ResourceState::INVALID_COMPUTE_STATES);
                    node.barriers.push(Barrier::Transition {
                        resource: resources[pos].res,
                        before: tracked,
                        after: output.expected,
                    });
                }

                // the declared write state holds after the pass either way
                resources[pos].state = output.expected;
            }
        }

        // the presentation path transitions the back buffer itself; force
        // the tracked state so no end-of-frame barrier is generated
        if back_buffer != 0 {
            if let Ok(pos) = resources.binary_search_by_key(&back_buffer, |r| r.id) {
                resources[pos].state = ResourceState::PRESENT;
            }
        }
    }

    /// Merges consecutive same-queue nodes within each batch into
    /// aggregates, each recorded on a single command list.
    fn join_render_nodes(&mut self, num_nodes: usize) -> Vec<AggregateNode> {
        let mut aggregates: Vec<AggregateNode> = Vec::with_capacity(num_nodes);

        let mut curr_batch = 0i32;
        let mut direct_nodes: Vec<usize> = Vec::new();
        let mut async_nodes: Vec<usize> = Vec::new();

        fn flush_batch(
            nodes: &mut [Mutex<RenderNode>],
            aggregates: &mut Vec<AggregateNode>,
            direct_nodes: &mut Vec<usize>,
            async_nodes: &mut Vec<usize>,
        ) {
            debug_assert!(!direct_nodes.is_empty() || !async_nodes.is_empty());

            if !async_nodes.is_empty() {
                aggregates.push(AggregateNode::new(true));
                for &n in async_nodes.iter() {
                    let agg_idx = aggregates.len() - 1;
                    let mapped_dep = {
                        let dep = nodes[n].get_mut().gpu_dep_source;
                        if dep == -1 {
                            -1
                        } else {
                            nodes[dep as usize].get_mut().agg_index
                        }
                    };
                    let node = nodes[n].get_mut();
                    aggregates[agg_idx].append(node, mapped_dep);
                    node.agg_index = agg_idx as i32;
                }
            }

            if !direct_nodes.is_empty() {
                // An async-compute aggregate with an unsupported barrier
                // syncs with the direct queue right before dispatch; that
                // fence subsumes any direct-queue fence in this batch.
                let fence_superfluous = !async_nodes.is_empty()
                    && aggregates.last().is_some_and(|a| a.has_unsupported_barrier);
                let has_gpu_fence = direct_nodes
                    .iter()
                    .any(|&n| nodes[n].get_mut().gpu_dep_source != -1);

                aggregates.push(AggregateNode::new(false));
                for &n in direct_nodes.iter() {
                    let agg_idx = aggregates.len() - 1;
                    let mapped_dep = {
                        let dep = nodes[n].get_mut().gpu_dep_source;
                        if dep == -1 {
                            -1
                        } else {
                            nodes[dep as usize].get_mut().agg_index
                        }
                    };
                    let node = nodes[n].get_mut();
                    aggregates[agg_idx].append(node, mapped_dep);
                    node.agg_index = agg_idx as i32;
                }

                if has_gpu_fence && fence_superfluous {
                    aggregates.last_mut().unwrap().gpu_dep = -1;
                }
            }

            direct_nodes.clear();
            async_nodes.clear();
        }

        for curr in 0..num_nodes {
            if self.nodes[curr].get_mut().batch_idx != curr_batch {
                flush_batch(&mut self.nodes, &mut aggregates, &mut direct_nodes, &mut async_nodes);
                curr_batch = self.nodes[curr].get_mut().batch_idx;
            }
            if self.nodes[curr].get_mut().is_async_compute() {
                async_nodes.push(curr);
            } else {
                direct_nodes.push(curr);
            }
        }
        flush_batch(&mut self.nodes, &mut aggregates, &mut direct_nodes, &mut async_nodes);

        aggregates.last_mut().expect("no aggregates were built").is_last = true;
        aggregates
    }

    /// One worker task per aggregate. Consecutive aggregates are chained
    /// with edges so command lists *record and submit* in declaration
    /// order; the GPU queues still run independently subject only to the
    /// cross-queue fences resolved during build.
    fn emit_tasks(
        &mut self,
        aggregates: Vec<AggregateNode>,
        task_set: &mut TaskSet,
        ctx: &GraphExecContext,
    ) {
        let count = aggregates.len();
        let exec = Arc::new(FrameExec {
            device: Arc::clone(&ctx.device),
            completion_fences: (0..count).map(|_| AtomicU64::new(u64::MAX)).collect(),
            aggregates,
            end_frame_hook: ctx.end_frame_hook.clone(),
        });

        let mut prev_task = None;
        for i in 0..count {
            let exec = Arc::clone(&exec);
            let name: String = exec.aggregates[i].name.to_string();
            let task = task_set.task(&name, move || run_aggregate(&exec, i));
            if let Some(prev) = prev_task {
                task_set.add_outgoing_edge(prev, task);
            }
            prev_task = Some(task);
        }
    }

    /// Aggregates of the last built frame. Debug/test introspection.
    pub fn aggregate_snapshots(&self) -> &[AggregateSnapshot] {
        &self.snapshots
    }

    /// Tracked state of a resource, if registered.
    pub fn tracked_state(&self, path_id: u64) -> Option<ResourceState> {
        let resources = self.frame_resources.read();
        resources
            .binary_search_by_key(&path_id, |r| r.id)
            .ok()
            .map(|pos| resources[pos].state)
    }

    /// Dumps the built graph through `log::debug!`.
    pub fn log_graph(&self) {
        log::debug!("render graph: {} aggregates", self.snapshots.len());
        for (i, agg) in self.snapshots.iter().enumerate() {
            log::debug!(
                "  [{}] {} queue={} gpu_dep={} unsupported={}",
                i,
                agg.name,
                if agg.is_async_compute { "compute" } else { "direct" },
                agg.gpu_dep,
                agg.has_unsupported_barrier
            );
            for barrier in &agg.barriers {
                if let Barrier::Transition { resource, before, after } = barrier {
                    log::debug!("    res {:?}: {} -> {}", resource, before.name(), after.name());
                }
            }
        }
    }
}

/// The body of one aggregate's worker task (what a worker does when it
/// picks the aggregate up).
fn run_aggregate(exec: &FrameExec, index: usize) {
    profiling::scope!("run_aggregate");

    let agg = &exec.aggregates[index];
    let queue = if agg.is_async_compute { QueueKind::Compute } else { QueueKind::Direct };

    let mut cmd = exec.device.begin_command_list(queue);
    cmd.set_name(&agg.name);

    if agg.has_unsupported_barrier {
        // the before states cannot transition on compute: run the merged
        // barrier batch on a graphics list and make the compute queue wait
        let mut barrier_cmd = exec.device.begin_command_list(QueueKind::Direct);
        barrier_cmd.set_name("barrier");
        barrier_cmd.resource_barriers(&agg.barriers);
        let fence = exec.device.submit(barrier_cmd);
        exec.device.queue_wait(QueueKind::Compute, QueueKind::Direct, fence);
    } else if !agg.barriers.is_empty() {
        cmd.resource_barriers(&agg.barriers);
    }

    for callback in &agg.callbacks {
        callback(&mut *cmd);
    }

    if !agg.has_unsupported_barrier && agg.gpu_dep != -1 {
        let fence = exec.completion_fences[agg.gpu_dep as usize].load(Ordering::Acquire);
        assert!(fence != u64::MAX, "GPU dependency has not been submitted");
        if agg.is_async_compute {
            exec.device.queue_wait(QueueKind::Compute, QueueKind::Direct, fence);
        } else {
            exec.device.queue_wait(QueueKind::Direct, QueueKind::Compute, fence);
        }
    }

    if agg.is_last {
        if let Some(hook) = &exec.end_frame_hook {
            hook(&mut *cmd);
        }
    }

    let fence = exec.device.submit(cmd);
    exec.completion_fences[index].store(fence, Ordering::Release);
}
