//! Whole-engine frame loop against the headless device.

use std::sync::Arc;

use sable::{Engine, Scene};
use sable_gpu::{GpuDevice, HeadlessDevice, QueueKind, ResourceState};
use sable_rt::RT_FRAME_MESH_INSTANCES;

fn engine_with_device() -> (Arc<HeadlessDevice>, Engine) {
    let device = Arc::new(HeadlessDevice::new());
    let engine = Engine::init(device.clone() as Arc<dyn GpuDevice>, Scene::demo(64, 4));
    (device, engine)
}

#[test]
fn frames_submit_and_recycle() {
    let (device, mut engine) = engine_with_device();

    for _ in 0..6 {
        engine.render_frame();
    }

    // every frame submits the three queue aggregates plus the resource
    // upload batch
    let submissions = device.submissions();
    assert!(submissions.len() >= 6 * 3);
    assert!(submissions.iter().any(|s| s.queue == QueueKind::Compute));
    assert!(submissions.iter().any(|s| s.name == "resource_upload"));

    // fences advanced on both queues
    assert!(device.completed_value(QueueKind::Direct) > 0);
    assert!(device.completed_value(QueueKind::Compute) > 0);

    engine.shutdown();
}

#[test]
fn graph_shape_reaches_a_steady_state() {
    let (_device, mut engine) = engine_with_device();

    let mut shapes = Vec::new();
    for _ in 0..4 {
        engine.render_frame();
        shapes.push(
            engine
                .render_graph()
                .aggregate_snapshots()
                .iter()
                .map(|s| (s.name.clone(), s.is_async_compute, s.barriers.len(), s.gpu_dep))
                .collect::<Vec<_>>(),
        );
    }

    // identical registrations: identical aggregates once states settle
    assert_eq!(shapes[2], shapes[3]);
    engine.shutdown();
}

#[test]
fn async_lighting_consumes_the_gbuffer_through_the_detour() {
    let (device, mut engine) = engine_with_device();
    engine.render_frame();

    // the gbuffer's render-target state cannot transition on compute, so
    // the async lighting aggregate runs its barriers on a graphics list
    // and the compute queue waits on that fence
    let snapshots = engine.render_graph().aggregate_snapshots();
    let lighting = snapshots
        .iter()
        .find(|s| s.name.contains("rt_lighting"))
        .expect("lighting aggregate missing");
    assert!(lighting.is_async_compute);
    assert!(lighting.has_unsupported_barrier);

    let waits = device.queue_waits();
    assert!(waits
        .iter()
        .any(|w| w.waiting == QueueKind::Compute && w.source == QueueKind::Direct));

    engine.shutdown();
}

#[test]
fn instance_table_is_published_and_back_buffer_presents() {
    let (_device, mut engine) = engine_with_device();
    engine.render_frame();

    assert!(engine
        .shared_resources()
        .find_buffer_named(RT_FRAME_MESH_INSTANCES)
        .is_some());

    assert_eq!(
        engine.render_graph().tracked_state(sable_gpu::path_hash("back_buffer")),
        Some(ResourceState::PRESENT)
    );

    engine.shutdown();
}

#[test]
fn culling_tracks_the_camera() {
    let (_device, mut engine) = engine_with_device();
    engine.render_frame();
    let visible = engine.visible_instances().len();
    assert!(visible > 0, "demo camera should see part of the scene");
    assert!(visible <= engine.scene.instances.len());
    engine.shutdown();
}

#[test]
fn background_work_completes_by_shutdown() {
    let (_device, mut engine) = engine_with_device();
    let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
    for _ in 0..4 {
        let hits = Arc::clone(&hits);
        engine.submit_background("prefetch", move || {
            hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        });
    }
    engine.render_frame();
    engine.shutdown();
    assert_eq!(hits.load(std::sync::atomic::Ordering::Relaxed), 4);
}
