//! Two clients sharing one camera over the in-memory driver
//!
//! Run with: cargo run --example loopback [FRAMES]
//!
//! A producer task captures frames from the mock camera at ~30 fps. Two
//! clients consume them concurrently:
//!
//! - `preview` holds one frame at a time and releases it immediately
//! - `recorder` holds up to three frames and is deliberately slow, so it
//!   skips frames once its quota is full
//!
//! ```text
//!   MockCamera ──► HardwareCameraProxy ──┬──► preview  (quota 1) ──► ChannelSink
//!                                        └──► recorder (quota 3) ──► ChannelSink
//! ```
//!
//! Set `RUST_LOG=camera_mux=debug` to see every frame being fanned out.

use std::sync::Arc;
use std::time::Duration;

use camera_mux::driver::mock::MockDriver;
use camera_mux::{CameraRegistry, ChannelSink, ClientCameraProxy, FrameReceiver};

const CAMERA_ID: &str = "front";

/// Drain a client's frames until the end-of-stream marker
async fn consume(
    name: &'static str,
    client: Arc<ClientCameraProxy>,
    mut frames: FrameReceiver,
    work: Duration,
) -> usize {
    let mut seen = 0;
    while let Some(frame) = frames.recv().await {
        if frame.is_end_of_stream() {
            println!("[{}] end of stream after {} frames", name, seen);
            break;
        }
        seen += 1;
        tokio::time::sleep(work).await;
        // Frames still queued after close were already returned by the registry
        if let Err(e) = client.done_with_frame(frame) {
            if client.is_open() {
                eprintln!("[{}] release failed: {}", name, e);
            }
        }
    }
    seen
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let frames: u32 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 90,
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("camera_mux=info".parse()?),
        )
        .init();

    let driver = MockDriver::new([CAMERA_ID, "rear"]);
    let registry = CameraRegistry::new(driver.clone());

    for desc in registry.list_cameras()? {
        println!("Found camera: {}", desc);
    }

    let preview = registry.open_camera(CAMERA_ID)?;
    let recorder = registry.open_camera(CAMERA_ID)?;
    recorder.set_max_frames_in_flight(3)?;

    let (preview_sink, preview_rx) = ChannelSink::new();
    let (recorder_sink, recorder_rx) = ChannelSink::new();
    preview.start_video_stream(Arc::new(preview_sink))?;
    recorder.start_video_stream(Arc::new(recorder_sink))?;

    let preview_task = tokio::spawn(consume(
        "preview",
        preview.clone(),
        preview_rx,
        Duration::from_millis(1),
    ));
    let recorder_task = tokio::spawn(consume(
        "recorder",
        recorder.clone(),
        recorder_rx,
        Duration::from_millis(80),
    ));

    let camera = driver
        .camera(CAMERA_ID)
        .ok_or("camera not opened by the driver")?;
    let mut ticker = tokio::time::interval(Duration::from_millis(33));
    for _ in 0..frames {
        ticker.tick().await;
        camera.emit_frame();
    }

    registry.close_camera(&preview);
    let preview_frames = preview_task.await?;

    if let Some(hw) = registry.hardware_camera(CAMERA_ID) {
        let stats = hw.stats();
        println!(
            "Stats: received={} delivered={} dropped={} returned={} drop_ratio={:.2}",
            stats.frames_received,
            stats.frames_delivered,
            stats.frames_dropped,
            stats.frames_returned,
            stats.drop_ratio(),
        );
    }

    registry.close_camera(&recorder);
    let recorder_frames = recorder_task.await?;

    println!(
        "preview consumed {}, recorder consumed {}, cameras still open: {}",
        preview_frames,
        recorder_frames,
        registry.active_camera_count()
    );

    Ok(())
}
