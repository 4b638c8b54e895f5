//! Camera registry implementation
//!
//! The entry point for consumers: discovers physical cameras, shares one
//! `HardwareCameraProxy` between every client of the same camera, and
//! tracks the current owner of the physical display.

use std::sync::{Arc, Mutex};

use super::config::RegistryConfig;
use super::display::{DisplayHandle, DisplaySlot};
use crate::camera::{ClientCameraProxy, HardwareCameraProxy};
use crate::driver::{CameraDesc, CameraDriver, DisplayState};
use crate::error::{CameraError, Result};
use crate::lock;
use crate::stats::RegistryStats;

/// Directory of open cameras and the display
///
/// A camera id maps to at most one `HardwareCameraProxy` at a time. The
/// proxy lives as long as it has clients; closing the last client closes
/// the physical camera. A camera whose clients were dropped without being
/// closed is closed by the next `open_camera`, `active_camera_count` or
/// `stats` call.
pub struct CameraRegistry {
    driver: Arc<dyn CameraDriver>,

    /// Open hardware cameras
    cameras: Mutex<Vec<Arc<HardwareCameraProxy>>>,

    /// Current display owner, held weakly
    display: Mutex<DisplaySlot>,

    /// Configuration
    config: RegistryConfig,
}

impl CameraRegistry {
    /// Create a registry with default configuration
    pub fn new(driver: Arc<dyn CameraDriver>) -> Self {
        Self::with_config(driver, RegistryConfig::default())
    }

    /// Create a registry with custom configuration
    pub fn with_config(driver: Arc<dyn CameraDriver>, config: RegistryConfig) -> Self {
        Self {
            driver,
            cameras: Mutex::new(Vec::new()),
            display: Mutex::new(DisplaySlot::default()),
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Cameras the driver currently reports
    ///
    /// Every call queries the driver again.
    pub fn list_cameras(&self) -> Result<impl Iterator<Item = CameraDesc>> {
        let cameras = self.driver.list_cameras().map_err(|e| {
            tracing::warn!(error = %e, "Driver failed to enumerate cameras");
            CameraError::from_driver(e, CameraError::UnderlyingService)
        })?;
        Ok(cameras.into_iter())
    }

    /// Open a camera for a new client
    ///
    /// Reuses the hardware camera if another client already has `camera_id`
    /// open; otherwise opens it through the driver. Cameras whose clients
    /// were all dropped without `close_camera` are closed first.
    pub fn open_camera(&self, camera_id: &str) -> Result<Arc<ClientCameraProxy>> {
        let mut cameras = lock(&self.cameras);
        self.close_abandoned(&mut cameras);

        if let Some(hw) = cameras.iter().find(|hw| hw.camera_id() == camera_id) {
            let client = hw.mint_client().inspect_err(|err| {
                tracing::warn!(camera = camera_id, error = %err, "Could not add client");
            })?;

            tracing::info!(
                camera = camera_id,
                client = client.id(),
                clients = hw.client_count(),
                "Camera opened (shared)"
            );
            return Ok(client);
        }

        let camera = self.driver.open_camera(camera_id).map_err(|e| {
            tracing::warn!(camera = camera_id, error = %e, "Driver failed to open camera");
            CameraError::from_driver(e, CameraError::CameraNotAvailable(camera_id.to_string()))
        })?;

        let hw = match HardwareCameraProxy::new(camera.clone(), self.config.clone()) {
            Ok(hw) => hw,
            Err(err) => {
                tracing::error!(camera = camera_id, error = %err, "Could not wrap camera");
                self.driver.close_camera(camera);
                return Err(err);
            }
        };

        let client = match hw.mint_client() {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(camera = camera_id, error = %err, "Could not add first client");
                self.driver.close_camera(hw.hw_camera());
                return Err(err);
            }
        };

        cameras.push(hw);

        tracing::info!(
            camera = camera_id,
            client = client.id(),
            cameras = cameras.len(),
            "Camera opened (new)"
        );
        Ok(client)
    }

    /// Close a client; the physical camera closes with its last client
    pub fn close_camera(&self, client: &ClientCameraProxy) {
        let Some(hw) = client.hardware_camera() else {
            tracing::warn!(client = client.id(), "Close of a camera that is not open");
            return;
        };

        // Outside the registry lock: disowning stops the client's stream,
        // which calls back into its sink
        hw.disown_client(client);

        let mut cameras = lock(&self.cameras);
        if !hw.is_idle() {
            tracing::debug!(
                camera = %hw.info(),
                clients = hw.client_count(),
                "Camera kept open for remaining clients"
            );
            return;
        }

        let before = cameras.len();
        cameras.retain(|open| !Arc::ptr_eq(open, &hw));
        if cameras.len() == before {
            // A concurrent close of the last clients got here first
            tracing::debug!(camera = %hw.info(), "Camera already torn down");
            return;
        }
        drop(cameras);

        self.driver.close_camera(hw.hw_camera());
        tracing::info!(camera = %hw.info(), "Camera closed");
    }

    /// Close hardware cameras left without clients by dropped proxies
    fn close_abandoned(&self, cameras: &mut Vec<Arc<HardwareCameraProxy>>) {
        let (abandoned, open): (Vec<_>, Vec<_>) =
            cameras.drain(..).partition(|hw| hw.is_idle());
        *cameras = open;

        for hw in abandoned {
            self.driver.close_camera(hw.hw_camera());
            tracing::info!(camera = %hw.info(), "Camera closed, its clients were dropped");
        }
    }

    /// Take ownership of the physical display
    ///
    /// Supersedes any previous owner; the driver invalidates its handle.
    pub fn open_display(&self) -> Result<Arc<DisplayHandle>> {
        let display = self.driver.open_display().map_err(|e| {
            tracing::warn!(error = %e, "Driver failed to open display");
            CameraError::from_driver(e, CameraError::DisplayNotAvailable)
        })?;

        let (handle, previous) = lock(&self.display).replace(display);

        match previous {
            Some(previous) => tracing::info!(
                generation = handle.generation(),
                superseded = previous,
                "Display opened, previous owner superseded"
            ),
            None => tracing::info!(generation = handle.generation(), "Display opened"),
        }
        Ok(handle)
    }

    /// Release the display
    ///
    /// A handle that is no longer the current owner is ignored.
    pub fn close_display(&self, handle: &DisplayHandle) {
        {
            let mut slot = lock(&self.display);
            if !slot.is_current(handle) {
                tracing::warn!(
                    generation = handle.generation(),
                    "Ignoring close of a display that is not the current owner"
                );
                return;
            }
            slot.clear();
        }

        self.driver.close_display(handle.hw_display());
        tracing::info!(generation = handle.generation(), "Display closed");
    }

    /// State of the current display, or `NotOpen` if nobody owns it
    pub fn get_display_state(&self) -> DisplayState {
        let current = lock(&self.display).current();
        match current {
            Some(handle) => handle.state(),
            None => DisplayState::NotOpen,
        }
    }

    /// Number of physical cameras currently open
    pub fn active_camera_count(&self) -> usize {
        let mut cameras = lock(&self.cameras);
        self.close_abandoned(&mut cameras);
        cameras.len()
    }

    /// The hardware camera serving `camera_id`, if open
    pub fn hardware_camera(&self, camera_id: &str) -> Option<Arc<HardwareCameraProxy>> {
        lock(&self.cameras)
            .iter()
            .find(|hw| hw.camera_id() == camera_id)
            .cloned()
    }

    /// Snapshot of every open camera
    pub fn stats(&self) -> RegistryStats {
        let cameras: Vec<_> = {
            let mut cameras = lock(&self.cameras);
            self.close_abandoned(&mut cameras);
            cameras.iter().cloned().collect()
        };
        let display_open = lock(&self.display).current().is_some();

        RegistryStats {
            cameras: cameras.iter().map(|hw| hw.stats()).collect(),
            display_open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockDriver, MockFaults};
    use crate::test_support::RecordingSink;

    fn registry(ids: &[&str]) -> (CameraRegistry, Arc<MockDriver>) {
        let driver = MockDriver::new(ids.iter().copied());
        (CameraRegistry::new(driver.clone()), driver)
    }

    #[test]
    fn test_list_cameras() {
        let (registry, _driver) = registry(&["front", "rear"]);

        let ids: Vec<String> = registry
            .list_cameras()
            .unwrap()
            .map(|desc| desc.camera_id)
            .collect();
        assert_eq!(ids, vec!["front", "rear"]);

        // Restartable: a second call queries again
        assert_eq!(registry.list_cameras().unwrap().count(), 2);
    }

    #[test]
    fn test_same_id_shares_hardware() {
        let (registry, driver) = registry(&["front"]);

        let a = registry.open_camera("front").unwrap();
        let b = registry.open_camera("front").unwrap();

        assert_eq!(driver.open_count("front"), 1);
        assert_eq!(registry.active_camera_count(), 1);
        assert!(Arc::ptr_eq(
            &a.hardware_camera().unwrap(),
            &b.hardware_camera().unwrap()
        ));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_different_ids_get_separate_hardware() {
        let (registry, driver) = registry(&["front", "rear"]);

        let _a = registry.open_camera("front").unwrap();
        let _b = registry.open_camera("rear").unwrap();

        assert_eq!(registry.active_camera_count(), 2);
        assert_eq!(driver.open_count("front"), 1);
        assert_eq!(driver.open_count("rear"), 1);
    }

    #[test]
    fn test_open_unavailable_camera() {
        let (registry, driver) = registry(&["front"]);
        driver.set_unavailable("front", true);

        let err = registry.open_camera("front").unwrap_err();
        assert_eq!(err, CameraError::CameraNotAvailable("front".into()));
        assert_eq!(registry.active_camera_count(), 0);

        assert!(registry.open_camera("side").is_err());

        // Not fatal: the camera can be opened once it comes back
        driver.set_unavailable("front", false);
        assert!(registry.open_camera("front").is_ok());
    }

    #[test]
    fn test_wrap_failure_closes_camera() {
        let (registry, driver) = registry(&["front"]);
        driver.set_faults(
            "front",
            MockFaults {
                fail_info: true,
                ..Default::default()
            },
        );

        let err = registry.open_camera("front").unwrap_err();
        assert!(err.is_dead_object());
        assert_eq!(driver.open_count("front"), 1);
        assert_eq!(driver.close_count("front"), 1);
        assert_eq!(registry.active_camera_count(), 0);
    }

    #[test]
    fn test_first_mint_failure_not_registered() {
        let (registry, driver) = registry(&["front"]);
        driver.set_faults(
            "front",
            MockFaults {
                max_buffers: Some(0),
                ..Default::default()
            },
        );

        let err = registry.open_camera("front").unwrap_err();
        assert_eq!(err, CameraError::BufferNotAvailable { requested: 1 });
        assert_eq!(registry.active_camera_count(), 0);
        assert_eq!(driver.close_count("front"), 1);
    }

    #[test]
    fn test_shared_mint_failure_keeps_existing_client() {
        let (registry, driver) = registry(&["front"]);
        driver.set_faults(
            "front",
            MockFaults {
                max_buffers: Some(1),
                ..Default::default()
            },
        );

        let first = registry.open_camera("front").unwrap();
        let err = registry.open_camera("front").unwrap_err();

        assert_eq!(err, CameraError::BufferNotAvailable { requested: 2 });
        assert_eq!(registry.active_camera_count(), 1);
        assert_eq!(first.hardware_camera().unwrap().client_count(), 1);
    }

    #[test]
    fn test_two_clients_share_frame() {
        let (registry, driver) = registry(&["front"]);
        let a = registry.open_camera("front").unwrap();
        let b = registry.open_camera("front").unwrap();
        let sink_a = RecordingSink::new();
        let sink_b = RecordingSink::new();
        a.start_video_stream(sink_a.clone()).unwrap();
        b.start_video_stream(sink_b.clone()).unwrap();

        let mock = driver.camera("front").unwrap();
        mock.emit_frame_with_id(7);
        let hw = registry.hardware_camera("front").unwrap();
        assert_eq!(hw.frame_records()[0].ref_count, 2);

        a.done_with_frame(sink_a.last_frame().unwrap()).unwrap();
        assert_eq!(hw.frame_records()[0].ref_count, 1);
        assert!(mock.returned_frames().is_empty());

        b.done_with_frame(sink_b.last_frame().unwrap()).unwrap();
        assert_eq!(mock.returned_frames(), vec![7]);
    }

    #[test]
    fn test_quota_declines_excess_frame() {
        let (registry, driver) = registry(&["front"]);
        let client = registry.open_camera("front").unwrap();
        let sink = RecordingSink::new();
        client.start_video_stream(sink.clone()).unwrap();

        let mock = driver.camera("front").unwrap();
        mock.emit_frame_with_id(3);
        mock.emit_frame_with_id(4);

        assert_eq!(sink.frame_ids(), vec![3]);
        assert_eq!(mock.returned_frames(), vec![4]);
    }

    #[test]
    fn test_last_close_tears_down() {
        let (registry, driver) = registry(&["front"]);
        let a = registry.open_camera("front").unwrap();
        let b = registry.open_camera("front").unwrap();
        let first_hw = a.hardware_camera().unwrap();

        registry.close_camera(&a);
        assert_eq!(registry.active_camera_count(), 1);
        assert_eq!(driver.close_count("front"), 0);

        registry.close_camera(&b);
        assert_eq!(registry.active_camera_count(), 0);
        assert_eq!(driver.close_count("front"), 1);

        let c = registry.open_camera("front").unwrap();
        assert!(!Arc::ptr_eq(&first_hw, &c.hardware_camera().unwrap()));
        assert_eq!(driver.open_count("front"), 2);
    }

    #[test]
    fn test_close_with_frames_outstanding() {
        let (registry, driver) = registry(&["front"]);
        let client = registry.open_camera("front").unwrap();
        let sink = RecordingSink::new();
        client.start_video_stream(sink.clone()).unwrap();
        let mock = driver.camera("front").unwrap();
        mock.emit_frame_with_id(9);

        registry.close_camera(&client);

        assert_eq!(sink.end_markers(), 1);
        assert_eq!(mock.returned_frames(), vec![9]);
        assert!(!mock.is_streaming());
        assert_eq!(driver.close_count("front"), 1);
    }

    #[test]
    fn test_close_twice_is_harmless() {
        let (registry, driver) = registry(&["front"]);
        let client = registry.open_camera("front").unwrap();

        registry.close_camera(&client);
        registry.close_camera(&client);

        assert_eq!(driver.close_count("front"), 1);
        assert_eq!(registry.active_camera_count(), 0);
    }

    #[test]
    fn test_double_release_keeps_other_holder() {
        let (registry, driver) = registry(&["front"]);
        let a = registry.open_camera("front").unwrap();
        let b = registry.open_camera("front").unwrap();
        let sink_a = RecordingSink::new();
        let sink_b = RecordingSink::new();
        a.start_video_stream(sink_a.clone()).unwrap();
        b.start_video_stream(sink_b.clone()).unwrap();
        let mock = driver.camera("front").unwrap();
        mock.emit_frame_with_id(7);

        let frame = sink_a.last_frame().unwrap();
        a.done_with_frame(frame.clone()).unwrap();
        assert!(a.done_with_frame(frame).is_err());

        assert!(mock.returned_frames().is_empty());
        assert_eq!(b.held_frames(), 1);
        b.done_with_frame(sink_b.last_frame().unwrap()).unwrap();
        assert_eq!(mock.returned_frames(), vec![7]);
    }

    #[test]
    fn test_dropped_client_releases_camera() {
        let (registry, driver) = registry(&["front"]);
        let client = registry.open_camera("front").unwrap();
        client.start_video_stream(RecordingSink::new()).unwrap();
        let mock = driver.camera("front").unwrap();
        mock.emit_frame_with_id(5);

        drop(client);

        assert!(!mock.is_streaming());
        assert_eq!(mock.returned_frames(), vec![5]);
        assert_eq!(registry.active_camera_count(), 0);
        assert_eq!(driver.close_count("front"), 1);

        let _again = registry.open_camera("front").unwrap();
        assert_eq!(driver.close_count("front"), 1);
        assert_eq!(driver.open_count("front"), 2);
        assert_eq!(registry.active_camera_count(), 1);
    }

    #[test]
    fn test_abandoned_camera_closed_by_other_open() {
        let (registry, driver) = registry(&["front", "rear"]);
        drop(registry.open_camera("front").unwrap());

        let _rear = registry.open_camera("rear").unwrap();

        assert_eq!(driver.close_count("front"), 1);
        assert_eq!(registry.active_camera_count(), 1);
    }

    #[test]
    fn test_concurrent_close_of_last_clients() {
        for _ in 0..50 {
            let (registry, driver) = registry(&["front"]);
            let registry = Arc::new(registry);
            let a = registry.open_camera("front").unwrap();
            let b = registry.open_camera("front").unwrap();
            a.start_video_stream(RecordingSink::new()).unwrap();
            b.start_video_stream(RecordingSink::new()).unwrap();
            driver.camera("front").unwrap().emit_frame_with_id(1);

            let closers: Vec<_> = [a, b]
                .into_iter()
                .map(|client| {
                    let registry = registry.clone();
                    std::thread::spawn(move || registry.close_camera(&client))
                })
                .collect();
            for closer in closers {
                closer.join().unwrap();
            }

            assert_eq!(driver.close_count("front"), 1);
            assert_eq!(registry.active_camera_count(), 0);
        }
    }

    #[test]
    fn test_display_supersede() {
        let (registry, driver) = registry(&[]);

        let first = registry.open_display().unwrap();
        let second = registry.open_display().unwrap();
        assert_eq!(driver.display_open_count(), 2);

        // Stale close is ignored and the second owner survives
        registry.close_display(&first);
        assert_eq!(driver.display_close_count(), 0);
        assert_eq!(registry.get_display_state(), DisplayState::NotVisible);

        registry.close_display(&second);
        assert_eq!(driver.display_close_count(), 1);
        assert_eq!(registry.get_display_state(), DisplayState::NotOpen);
    }

    #[test]
    fn test_display_state_without_owner() {
        let (registry, driver) = registry(&[]);
        assert_eq!(registry.get_display_state(), DisplayState::NotOpen);

        let handle = registry.open_display().unwrap();
        drop(handle);
        assert_eq!(registry.get_display_state(), DisplayState::NotOpen);
        assert_eq!(driver.display_close_count(), 0);
    }

    #[test]
    fn test_display_unavailable() {
        let (registry, driver) = registry(&[]);
        driver.set_display_unavailable(true);

        assert_eq!(
            registry.open_display().unwrap_err(),
            CameraError::DisplayNotAvailable
        );
        assert_eq!(registry.get_display_state(), DisplayState::NotOpen);
    }

    #[test]
    fn test_stats() {
        let (registry, driver) = registry(&["front", "rear"]);
        let a = registry.open_camera("front").unwrap();
        let _b = registry.open_camera("front").unwrap();
        let _c = registry.open_camera("rear").unwrap();
        let _display = registry.open_display().unwrap();
        a.start_video_stream(RecordingSink::new()).unwrap();
        driver.camera("front").unwrap().emit_frame();

        let stats = registry.stats();
        assert_eq!(stats.active_cameras(), 2);
        assert_eq!(stats.total_clients(), 3);
        assert!(stats.display_open);

        let front = stats
            .cameras
            .iter()
            .find(|c| c.camera_id == "front")
            .unwrap();
        assert_eq!(front.frames_received, 1);
        assert_eq!(front.outstanding_frames, 1);
        assert_eq!(front.frames_requested, 2);
    }

    #[tokio::test]
    async fn test_channel_sink_consumer() {
        let (registry, driver) = registry(&["front"]);
        let client = registry.open_camera("front").unwrap();
        let (sink, mut frames) = crate::sink::ChannelSink::new();
        client.start_video_stream(Arc::new(sink)).unwrap();

        let mock = driver.camera("front").unwrap();
        mock.emit_frame_with_id(1);
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.buffer_id, 1);
        client.done_with_frame(frame).unwrap();

        mock.emit_frame_with_id(2);
        registry.close_camera(&client);

        assert_eq!(frames.recv().await.unwrap().buffer_id, 2);
        assert!(frames.recv().await.unwrap().is_end_of_stream());
        assert_eq!(mock.returned_frames(), vec![1, 2]);
    }
}
