//! Clears a back buffer to a cycling color for a few frames on the headless device.
//!
//! Run with `RUST_LOG=scoria=debug cargo run --example clear` to watch the pools fill
//! up during the first frames and then stay put.
use glam::UVec2;
use scoria::backend::headless::{ExecutionMode, Headless, HeadlessConfig, HeadlessDevice};
use scoria::prelude::*;
use tracing_subscriber::EnvFilter;

const FRAMES: u32 = 120;
const FRAMES_IN_FLIGHT: usize = 2;

fn hue_to_rgb(hue: f32) -> [f32; 4] {
    let h = hue / 60.0;
    let x = 1.0 - (h % 2.0 - 1.0).abs();
    let (r, g, b) = match h as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    [r, g, b, 1.0]
}

fn main() -> scoria::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let raw = HeadlessDevice::new(HeadlessConfig {
        mode: ExecutionMode::Threaded,
        latency: std::time::Duration::from_millis(2),
        ..Default::default()
    });
    let manager = CommandListManager::new(Device::<Headless>::new(raw.clone()), ManagerConfig::default())?;

    let mut back_buffers = (0..FRAMES_IN_FLIGHT)
        .map(|i| {
            ColorBuffer::new(
                &manager,
                &format!("back buffer {i}"),
                UVec2::new(1920, 1080),
                Format::R8G8B8A8Unorm,
                [0.0; 4],
                false,
            )
        })
        .collect::<scoria::Result<Vec<_>>>()?;
    let mut frame_fences = vec![0; FRAMES_IN_FLIGHT];

    for frame in 0..FRAMES {
        let index = frame as usize % FRAMES_IN_FLIGHT;
        manager.wait_for_fence(frame_fences[index])?;
        let back_buffer = &mut back_buffers[index];

        let mut list = manager.begin_named(QueueKind::Direct, "clear")?;
        list.transition_resource(back_buffer, ResourceStates::RENDER_TARGET, false);
        let color = hue_to_rgb((frame as f32 * 3.0) % 360.0);
        list.graphics().clear_color_with(back_buffer, color);
        list.transition_resource(back_buffer, ResourceStates::PRESENT, false);
        frame_fences[index] = list.close_and_execute(false)?;
    }

    manager.shutdown()?;
    let stats = raw.stats();
    tracing::info!(
        "{} frames: {} submissions, {} clears, {} barriers in {} calls, {} command lists created",
        FRAMES,
        stats.submissions,
        stats.clears,
        stats.barriers,
        stats.barrier_calls,
        stats.command_lists_created
    );
    Ok(())
}
