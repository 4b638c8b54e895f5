//! Client camera proxy
//!
//! What a consumer actually holds after opening a camera. It looks like a
//! private camera: it has its own stream state and its own quota of frames
//! it may hold at once, while the physical stream and buffer pool belong to
//! the `HardwareCameraProxy` behind it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, error, info, warn};

use super::hardware::HardwareCameraProxy;
use super::state::StreamState;
use crate::driver::CameraDesc;
use crate::error::{CameraError, Result};
use crate::frame::FrameBuffer;
use crate::lock;
use crate::sink::FrameSink;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-client values the hardware camera reads without reaching the client
///
/// Shared between the client and its slot on the hardware camera, so quota
/// sums and the "anyone still streaming" check never upgrade a client.
#[derive(Debug)]
pub(crate) struct ClientShare {
    frames_allowed: AtomicU32,
    streaming: AtomicBool,
}

impl ClientShare {
    pub(crate) fn frames_allowed(&self) -> u32 {
        self.frames_allowed.load(Ordering::Acquire)
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }
}

struct ClientState {
    stream_state: StreamState,
    sink: Option<Arc<dyn FrameSink>>,
    held: VecDeque<FrameBuffer>,
    share: Arc<ClientShare>,
}

impl ClientState {
    fn set_state(&mut self, next: StreamState) {
        self.stream_state = next;
        self.share.streaming.store(next.is_running(), Ordering::Release);
    }

    fn transition(&mut self, next: StreamState, client: u64) {
        if !self.stream_state.can_transition_to(next) {
            warn!(
                client = client,
                from = %self.stream_state,
                to = %next,
                "Unexpected stream state transition"
            );
        }
        self.set_state(next);
    }
}

/// One consumer's session on a physical camera
pub struct ClientCameraProxy {
    id: u64,
    desc: CameraDesc,
    owner: Mutex<Weak<HardwareCameraProxy>>,
    share: Arc<ClientShare>,
    inner: Mutex<ClientState>,
}

impl ClientCameraProxy {
    pub(crate) fn new(
        owner: Weak<HardwareCameraProxy>,
        desc: CameraDesc,
        frames_allowed: u32,
    ) -> Arc<Self> {
        let share = Arc::new(ClientShare {
            frames_allowed: AtomicU32::new(frames_allowed),
            streaming: AtomicBool::new(false),
        });

        Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            desc,
            owner: Mutex::new(owner),
            share: share.clone(),
            inner: Mutex::new(ClientState {
                stream_state: StreamState::Stopped,
                sink: None,
                held: VecDeque::new(),
                share,
            }),
        })
    }

    pub(crate) fn share(&self) -> Arc<ClientShare> {
        self.share.clone()
    }

    /// Process-unique client id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Descriptor of the underlying physical camera
    pub fn info(&self) -> &CameraDesc {
        &self.desc
    }

    /// The hardware camera this client is attached to, if still open
    pub fn hardware_camera(&self) -> Option<Arc<HardwareCameraProxy>> {
        lock(&self.owner).upgrade()
    }

    /// Whether the client is still attached to a hardware camera
    pub fn is_open(&self) -> bool {
        self.hardware_camera().is_some()
    }

    /// Frames this client may hold at once
    pub fn frames_allowed(&self) -> u32 {
        self.share.frames_allowed()
    }

    pub(crate) fn set_frames_allowed(&self, frames: u32) {
        self.share.frames_allowed.store(frames, Ordering::Release);
    }

    /// Frames delivered and not yet released
    pub fn held_frames(&self) -> usize {
        lock(&self.inner).held.len()
    }

    /// Current stream state
    pub fn stream_state(&self) -> StreamState {
        lock(&self.inner).stream_state
    }

    /// Whether this client wants frames
    pub fn is_streaming(&self) -> bool {
        self.stream_state().is_running()
    }

    /// Change how many frames this client may hold at once
    ///
    /// The hardware buffer pool is resized first; if the driver refuses, the
    /// quota is left unchanged.
    pub fn set_max_frames_in_flight(&self, frames: u32) -> Result<()> {
        if frames == 0 {
            error!(client = self.id, "Rejecting a quota of zero frames");
            return Err(CameraError::InvalidArgument(
                "at least one frame must be allowed".into(),
            ));
        }

        let owner = self.hardware_camera().ok_or(CameraError::OwnershipLost)?;
        owner.resize_client(self, frames).inspect_err(|err| {
            warn!(client = self.id, frames = frames, error = %err, "Quota change refused");
        })?;

        debug!(client = self.id, frames = frames, "Quota changed");
        Ok(())
    }

    /// Start receiving frames on `sink`
    pub fn start_video_stream(&self, sink: Arc<dyn FrameSink>) -> Result<()> {
        {
            let mut inner = lock(&self.inner);
            if !inner.stream_state.is_stopped() {
                warn!(client = self.id, state = %inner.stream_state, "Stream already running");
                return Err(CameraError::StreamAlreadyRunning);
            }
            inner.sink = Some(sink);
            inner.transition(StreamState::Running, self.id);
        }

        let started = match self.hardware_camera() {
            Some(owner) => owner.client_stream_starting(),
            None => Err(CameraError::OwnershipLost),
        };

        if let Err(err) = started {
            {
                let mut inner = lock(&self.inner);
                inner.set_state(StreamState::Stopped);
                inner.sink = None;
            }
            error!(client = self.id, error = %err, "Failed to start stream");
            return Err(match err {
                CameraError::DeadObject(_) | CameraError::OwnershipLost => err,
                _ => CameraError::UnderlyingService,
            });
        }

        info!(client = self.id, camera = %self.desc, "Stream started");
        Ok(())
    }

    /// Offer a frame to this client
    ///
    /// Called by the hardware camera during fan-out. Returns whether the
    /// client took the frame; a declined frame is not the client's to
    /// release.
    pub(crate) fn deliver_frame(&self, buffer: FrameBuffer) -> bool {
        if buffer.is_end_of_stream() {
            self.end_stream_from_driver();
            return false;
        }

        let sink = {
            let mut inner = lock(&self.inner);
            if !inner.stream_state.is_running() {
                return false;
            }

            let allowed = self.frames_allowed() as usize;
            if inner.held.len() >= allowed {
                debug!(
                    client = self.id,
                    frame = buffer.buffer_id,
                    held = inner.held.len(),
                    allowed = allowed,
                    "Skipping frame, client at quota"
                );
                return false;
            }

            let Some(sink) = inner.sink.clone() else {
                return false;
            };
            inner.held.push_back(buffer.clone());
            sink
        };

        sink.deliver_frame(buffer);
        true
    }

    fn end_stream_from_driver(&self) {
        let sink = {
            let mut inner = lock(&self.inner);
            match inner.stream_state {
                // Stopped already, or our own stop is delivering the marker
                StreamState::Stopped | StreamState::Stopping => return,
                StreamState::Running => {
                    warn!(client = self.id, "Stream stopped unexpectedly");
                }
            }
            inner.set_state(StreamState::Stopped);
            inner.sink.take()
        };

        if let Some(sink) = sink {
            sink.deliver_frame(FrameBuffer::end_of_stream());
        }
    }

    /// Give a delivered frame back
    pub fn done_with_frame(&self, buffer: FrameBuffer) -> Result<()> {
        if buffer.is_end_of_stream() {
            debug!(client = self.id, "Ignoring release of the end-of-stream marker");
            return Ok(());
        }

        let held = {
            let mut inner = lock(&self.inner);
            let position = inner
                .held
                .iter()
                .position(|b| b.buffer_id == buffer.buffer_id);
            position.and_then(|index| inner.held.remove(index))
        };

        let Some(held) = held else {
            error!(
                client = self.id,
                frame = buffer.buffer_id,
                "Release of a frame this client does not hold"
            );
            return Err(CameraError::InvalidArgument(format!(
                "frame {} is not held",
                buffer.buffer_id
            )));
        };

        match self.hardware_camera() {
            Some(owner) => {
                owner.done_with_frame(held);
                Ok(())
            }
            None => {
                warn!(client = self.id, frame = held.buffer_id, "Frame released after close");
                Err(CameraError::OwnershipLost)
            }
        }
    }

    /// Stop receiving frames
    ///
    /// The sink gets the end-of-stream marker before this returns. Frames
    /// still held stay valid until released.
    pub fn stop_video_stream(&self) {
        let sink = {
            let mut inner = lock(&self.inner);
            if !inner.stream_state.is_running() {
                return;
            }
            inner.transition(StreamState::Stopping, self.id);
            inner.sink.clone()
        };

        if let Some(sink) = sink {
            sink.deliver_frame(FrameBuffer::end_of_stream());
        }

        {
            let mut inner = lock(&self.inner);
            inner.transition(StreamState::Stopped, self.id);
            inner.sink = None;
        }
        info!(client = self.id, camera = %self.desc, "Stream stopped");

        if let Some(owner) = self.hardware_camera() {
            owner.client_stream_ending();
        }
    }

    /// Final teardown, run by the owner while disowning this client
    ///
    /// Safe to call more than once.
    pub(crate) fn shutdown(&self) {
        let (was_running, held) = {
            let mut inner = lock(&self.inner);
            let was_running = !inner.stream_state.is_stopped();
            if was_running {
                inner.set_state(StreamState::Stopped);
                inner.sink = None;
            }
            (was_running, std::mem::take(&mut inner.held))
        };

        if was_running {
            // No end marker: the consumer is most likely gone
            warn!(client = self.id, "Client shut down with its stream running");
        }

        if let Some(owner) = self.hardware_camera() {
            if !held.is_empty() {
                warn!(
                    client = self.id,
                    frames = held.len(),
                    "Returning frames still held at shutdown"
                );
            }
            for buffer in held {
                owner.done_with_frame(buffer);
            }
            if was_running {
                owner.client_stream_ending();
            }
        }

        // Only after every buffer has gone back through the owner
        *lock(&self.owner) = Weak::new();
    }

    /// Read a vendor extension value
    pub fn get_extended_info(&self, key: u32) -> i32 {
        match self.hardware_camera() {
            Some(owner) => owner.get_extended_info(key),
            None => 0,
        }
    }

    /// Write a vendor extension value
    pub fn set_extended_info(&self, key: u32, value: i32) -> Result<()> {
        let owner = self.hardware_camera().ok_or(CameraError::OwnershipLost)?;
        owner.set_extended_info(key, value)
    }
}

impl Drop for ClientCameraProxy {
    fn drop(&mut self) {
        let owner = self
            .owner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade();
        // Closed clients were already detached by `shutdown`
        let Some(owner) = owner else {
            return;
        };
        let _detaching = owner.detaching();

        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        let was_running = !inner.stream_state.is_stopped();
        inner.set_state(StreamState::Stopped);
        inner.sink = None;
        let held = std::mem::take(&mut inner.held);

        warn!(
            client = self.id,
            frames = held.len(),
            running = was_running,
            "Client dropped without being closed"
        );
        for buffer in held {
            owner.done_with_frame(buffer);
        }

        // This client no longer counts as streaming nor toward the pool size
        if was_running {
            owner.client_stream_ending();
        }
        if let Err(err) = owner.renegotiate_quota(0) {
            warn!(client = self.id, error = %err, "Could not shrink buffer pool for dropped client");
        }
    }
}

impl std::fmt::Debug for ClientCameraProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCameraProxy")
            .field("id", &self.id)
            .field("camera", &self.desc.camera_id)
            .field("frames_allowed", &self.frames_allowed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::driver::mock::{MockCamera, MockDriver, MockFaults};
    use crate::driver::CameraDriver;
    use crate::frame::PixelFormat;
    use crate::registry::RegistryConfig;
    use crate::test_support::RecordingSink;

    fn attach() -> (
        Arc<HardwareCameraProxy>,
        Arc<ClientCameraProxy>,
        Arc<MockCamera>,
    ) {
        let driver = MockDriver::new(["rear"]);
        let camera = driver.open_camera("rear").unwrap();
        let proxy = HardwareCameraProxy::new(camera, RegistryConfig::default()).unwrap();
        let client = proxy.mint_client().unwrap();
        (proxy, client, driver.camera("rear").unwrap())
    }

    fn frame(id: u32) -> FrameBuffer {
        FrameBuffer::new(id, Bytes::from_static(&[1, 2]), 2, 1, PixelFormat::Yuyv)
    }

    #[test]
    fn test_defaults() {
        let (_proxy, client, _mock) = attach();

        assert_eq!(client.frames_allowed(), 1);
        assert_eq!(client.held_frames(), 0);
        assert_eq!(client.stream_state(), StreamState::Stopped);
        assert_eq!(client.info().camera_id, "rear");
        assert!(client.is_open());
    }

    #[test]
    fn test_ids_are_unique() {
        let (proxy, first, _mock) = attach();
        let second = proxy.mint_client().unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_stopped_client_declines() {
        let (_proxy, client, _mock) = attach();
        assert!(!client.deliver_frame(frame(1)));
        assert_eq!(client.held_frames(), 0);
    }

    #[test]
    fn test_quota_enforced() {
        let (_proxy, client, _mock) = attach();
        client.set_max_frames_in_flight(2).unwrap();
        let sink = RecordingSink::new();
        client.start_video_stream(sink.clone()).unwrap();

        assert!(client.deliver_frame(frame(1)));
        assert!(client.deliver_frame(frame(2)));
        assert!(!client.deliver_frame(frame(3)));
        assert_eq!(client.held_frames(), 2);
        assert_eq!(sink.frame_ids(), vec![1, 2]);
    }

    #[test]
    fn test_release_makes_room() {
        let (_proxy, client, mock) = attach();
        let sink = RecordingSink::new();
        client.start_video_stream(sink.clone()).unwrap();

        mock.emit_frame_with_id(3);
        mock.emit_frame_with_id(4);
        assert_eq!(sink.frame_ids(), vec![3]);

        client.done_with_frame(sink.last_frame().unwrap()).unwrap();
        mock.emit_frame_with_id(5);
        assert_eq!(sink.frame_ids(), vec![3, 5]);
        assert_eq!(mock.returned_frames(), vec![4, 3]);
    }

    #[test]
    fn test_zero_quota_rejected() {
        let (_proxy, client, mock) = attach();
        let err = client.set_max_frames_in_flight(0).unwrap_err();

        assert!(matches!(err, CameraError::InvalidArgument(_)));
        assert_eq!(client.frames_allowed(), 1);
        assert_eq!(mock.quota_requests(), vec![1]);
    }

    #[test]
    fn test_quota_refused_leaves_state() {
        let (proxy, client, mock) = attach();
        mock.set_faults(MockFaults {
            max_buffers: Some(4),
            ..Default::default()
        });

        let err = client.set_max_frames_in_flight(5).unwrap_err();
        assert_eq!(err, CameraError::BufferNotAvailable { requested: 5 });
        assert_eq!(client.frames_allowed(), 1);
        assert_eq!(proxy.frames_requested(), 1);

        client.set_max_frames_in_flight(4).unwrap();
        assert_eq!(client.frames_allowed(), 4);
        assert_eq!(proxy.frames_requested(), 4);
    }

    #[test]
    fn test_double_start_rejected() {
        let (_proxy, client, mock) = attach();
        client.start_video_stream(RecordingSink::new()).unwrap();

        let err = client.start_video_stream(RecordingSink::new()).unwrap_err();
        assert_eq!(err, CameraError::StreamAlreadyRunning);
        assert!(client.is_streaming());
        assert_eq!(mock.start_count(), 1);
    }

    #[test]
    fn test_start_failure_rolls_back() {
        let (_proxy, client, mock) = attach();
        mock.set_faults(MockFaults {
            fail_start: true,
            ..Default::default()
        });

        let err = client.start_video_stream(RecordingSink::new()).unwrap_err();
        assert_eq!(err, CameraError::UnderlyingService);
        assert_eq!(client.stream_state(), StreamState::Stopped);

        // A later start works once the driver recovers
        mock.set_faults(MockFaults::default());
        client.start_video_stream(RecordingSink::new()).unwrap();
        assert!(client.is_streaming());
    }

    #[test]
    fn test_start_transport_failure() {
        let (_proxy, client, mock) = attach();
        mock.set_transport_down(true);

        let err = client.start_video_stream(RecordingSink::new()).unwrap_err();
        assert!(err.is_dead_object());
    }

    #[test]
    fn test_stop_delivers_end_marker() {
        let (_proxy, client, mock) = attach();
        let sink = RecordingSink::new();
        client.start_video_stream(sink.clone()).unwrap();
        mock.emit_frame_with_id(1);

        client.stop_video_stream();

        assert_eq!(sink.end_markers(), 1);
        assert_eq!(client.stream_state(), StreamState::Stopped);
        assert!(!mock.is_streaming());
        // Held frames stay valid after stop
        assert_eq!(client.held_frames(), 1);
        client.done_with_frame(sink.last_frame().unwrap()).unwrap();
        assert_eq!(mock.returned_frames(), vec![1]);

        // Stopping twice is a no-op
        client.stop_video_stream();
        assert_eq!(sink.end_markers(), 1);
    }

    #[test]
    fn test_restart_after_stop() {
        let (_proxy, client, mock) = attach();
        client.start_video_stream(RecordingSink::new()).unwrap();
        client.stop_video_stream();
        client.start_video_stream(RecordingSink::new()).unwrap();

        assert_eq!(mock.start_count(), 2);
        assert!(mock.is_streaming());
    }

    #[test]
    fn test_unknown_release_has_no_effect() {
        let (proxy, client, mock) = attach();
        let sink = RecordingSink::new();
        client.start_video_stream(sink.clone()).unwrap();
        mock.emit_frame_with_id(8);

        assert!(client.done_with_frame(frame(9)).is_err());
        assert_eq!(client.held_frames(), 1);

        client.done_with_frame(frame(8)).unwrap();
        // Second release of the same frame is a protocol violation
        assert!(client.done_with_frame(frame(8)).is_err());
        assert_eq!(mock.returned_frames(), vec![8]);
        assert_eq!(proxy.outstanding_frames(), 0);
    }

    #[test]
    fn test_shutdown_mid_stream() {
        let (proxy, client, mock) = attach();
        let sink = RecordingSink::new();
        client.start_video_stream(sink.clone()).unwrap();
        mock.emit_frame_with_id(2);

        client.shutdown();

        assert_eq!(client.stream_state(), StreamState::Stopped);
        assert_eq!(sink.end_markers(), 0);
        assert_eq!(mock.returned_frames(), vec![2]);
        assert!(!mock.is_streaming());
        assert!(!client.is_open());
        assert_eq!(proxy.outstanding_frames(), 0);

        // Idempotent
        client.shutdown();
        assert_eq!(mock.returned_frames(), vec![2]);
    }

    #[test]
    fn test_calls_after_shutdown() {
        let (_proxy, client, _mock) = attach();
        client.shutdown();

        assert_eq!(
            client.set_max_frames_in_flight(2),
            Err(CameraError::OwnershipLost)
        );
        assert_eq!(
            client.start_video_stream(RecordingSink::new()),
            Err(CameraError::OwnershipLost)
        );
        assert_eq!(client.stream_state(), StreamState::Stopped);
        assert_eq!(client.get_extended_info(1), 0);
    }

    #[test]
    fn test_extended_info_passthrough() {
        let (_proxy, client, mock) = attach();
        client.set_extended_info(0x10, 42).unwrap();

        assert_eq!(client.get_extended_info(0x10), 42);
        assert_eq!(client.get_extended_info(0x11), 0);

        mock.set_transport_down(true);
        assert!(client.set_extended_info(0x10, 1).unwrap_err().is_dead_object());
    }

    #[test]
    fn test_drop_returns_frames() {
        let (proxy, client, mock) = attach();
        client.start_video_stream(RecordingSink::new()).unwrap();
        mock.emit_frame_with_id(6);

        drop(client);

        assert_eq!(mock.returned_frames(), vec![6]);
        assert_eq!(proxy.outstanding_frames(), 0);
        assert_eq!(proxy.client_count(), 0);
    }

    #[test]
    fn test_drop_mid_stream_stops_hardware() {
        let (proxy, client, mock) = attach();
        let other = proxy.mint_client().unwrap();
        client.set_max_frames_in_flight(3).unwrap();
        client.start_video_stream(RecordingSink::new()).unwrap();
        assert_eq!(mock.quota_requests(), vec![1, 2, 4]);

        drop(client);

        assert!(!mock.is_streaming());
        assert_eq!(proxy.stream_state(), StreamState::Stopped);
        // Only the surviving client's quota is left
        assert_eq!(mock.quota_requests(), vec![1, 2, 4, 1]);
        assert_eq!(proxy.frames_requested(), 1);
        assert_eq!(proxy.client_count(), 1);
        assert!(other.is_open());
    }

    #[test]
    fn test_drop_keeps_stream_for_others() {
        let (proxy, client, mock) = attach();
        let other = proxy.mint_client().unwrap();
        client.start_video_stream(RecordingSink::new()).unwrap();
        let sink = RecordingSink::new();
        other.start_video_stream(sink.clone()).unwrap();

        drop(client);

        assert!(mock.is_streaming());
        mock.emit_frame_with_id(12);
        assert_eq!(sink.frame_ids(), vec![12]);
        assert_eq!(proxy.frame_records()[0].ref_count, 1);
    }

    #[test]
    fn test_drop_after_close_is_quiet() {
        let (proxy, client, mock) = attach();
        client.start_video_stream(RecordingSink::new()).unwrap();
        proxy.disown_client(&client);
        let requests = mock.quota_requests();

        drop(client);

        assert_eq!(mock.quota_requests(), requests);
        assert_eq!(mock.stop_count(), 1);
    }
}
