//! In-memory driver for tests and demos
//!
//! `MockDriver` behaves like a well-mannered physical driver: it hands out
//! cameras by id, records every call made into it, and lets the caller
//! inject failures. Frames are produced on demand with
//! [`MockCamera::emit_frame`] from whatever thread calls it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::{CameraDesc, CameraDriver, DisplayDesc, DisplayState, HwCamera, HwDisplay};
use crate::error::DriverError;
use crate::frame::{FrameBuffer, PixelFormat};
use crate::lock;
use crate::sink::FrameSink;

const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;

/// Failures to inject into cameras opened after the call
#[derive(Debug, Clone, Default)]
pub struct MockFaults {
    /// `info()` fails with a transport error
    pub fail_info: bool,
    /// `set_max_frames_in_flight` rejects counts above this limit
    pub max_buffers: Option<u32>,
    /// `start_video_stream` is rejected
    pub fail_start: bool,
}

#[derive(Default)]
struct DriverState {
    cameras: HashMap<String, Arc<MockCamera>>,
    open_counts: HashMap<String, usize>,
    close_counts: HashMap<String, usize>,
    faults: HashMap<String, MockFaults>,
    unavailable: HashSet<String>,
    display: Option<Arc<MockDisplay>>,
    display_opens: usize,
    display_closes: usize,
    display_unavailable: bool,
}

/// In-memory camera driver
pub struct MockDriver {
    descs: Vec<CameraDesc>,
    state: Mutex<DriverState>,
}

impl MockDriver {
    /// Create a driver exposing the given camera ids
    pub fn new<I, S>(camera_ids: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            descs: camera_ids.into_iter().map(CameraDesc::new).collect(),
            state: Mutex::new(DriverState::default()),
        })
    }

    /// The most recently opened camera with this id, if still open
    pub fn camera(&self, camera_id: &str) -> Option<Arc<MockCamera>> {
        lock(&self.state).cameras.get(camera_id).cloned()
    }

    /// The most recently opened display, if still open
    pub fn display(&self) -> Option<Arc<MockDisplay>> {
        lock(&self.state).display.clone()
    }

    /// Number of successful `open_camera` calls for this id
    pub fn open_count(&self, camera_id: &str) -> usize {
        lock(&self.state).open_counts.get(camera_id).copied().unwrap_or(0)
    }

    /// Number of `close_camera` calls for this id
    pub fn close_count(&self, camera_id: &str) -> usize {
        lock(&self.state).close_counts.get(camera_id).copied().unwrap_or(0)
    }

    /// Number of successful `open_display` calls
    pub fn display_open_count(&self) -> usize {
        lock(&self.state).display_opens
    }

    /// Number of `close_display` calls
    pub fn display_close_count(&self) -> usize {
        lock(&self.state).display_closes
    }

    /// Inject faults into cameras with this id opened from now on
    pub fn set_faults(&self, camera_id: &str, faults: MockFaults) {
        lock(&self.state).faults.insert(camera_id.to_string(), faults);
    }

    /// Make `open_camera` fail for this id
    pub fn set_unavailable(&self, camera_id: &str, unavailable: bool) {
        let mut state = lock(&self.state);
        if unavailable {
            state.unavailable.insert(camera_id.to_string());
        } else {
            state.unavailable.remove(camera_id);
        }
    }

    /// Make `open_display` fail
    pub fn set_display_unavailable(&self, unavailable: bool) {
        lock(&self.state).display_unavailable = unavailable;
    }
}

impl CameraDriver for MockDriver {
    fn list_cameras(&self) -> Result<Vec<CameraDesc>, DriverError> {
        Ok(self.descs.clone())
    }

    fn open_camera(&self, camera_id: &str) -> Result<Arc<dyn HwCamera>, DriverError> {
        let desc = self
            .descs
            .iter()
            .find(|d| d.camera_id == camera_id)
            .cloned()
            .ok_or_else(|| DriverError::NotAvailable(camera_id.to_string()))?;

        let mut state = lock(&self.state);
        if state.unavailable.contains(camera_id) {
            return Err(DriverError::NotAvailable(camera_id.to_string()));
        }

        let faults = state.faults.get(camera_id).cloned().unwrap_or_default();
        let camera = Arc::new(MockCamera::new(desc, faults));
        state.cameras.insert(camera_id.to_string(), camera.clone());
        *state.open_counts.entry(camera_id.to_string()).or_default() += 1;

        Ok(camera)
    }

    fn close_camera(&self, camera: Arc<dyn HwCamera>) {
        camera.stop_video_stream();

        let closed = Arc::as_ptr(&camera) as *const ();
        let mut state = lock(&self.state);
        let camera_id = state
            .cameras
            .iter()
            .find(|(_, open)| Arc::as_ptr(open) as *const () == closed)
            .map(|(id, _)| id.clone());

        if let Some(camera_id) = camera_id {
            state.cameras.remove(&camera_id);
            *state.close_counts.entry(camera_id).or_default() += 1;
        }
    }

    fn open_display(&self) -> Result<Arc<dyn HwDisplay>, DriverError> {
        let mut state = lock(&self.state);
        if state.display_unavailable {
            return Err(DriverError::NotAvailable("display".into()));
        }

        // A new owner invalidates the previous one
        if let Some(previous) = state.display.take() {
            previous.set_dead();
        }

        let display = Arc::new(MockDisplay::new(state.display_opens as u32));
        state.display = Some(display.clone());
        state.display_opens += 1;

        Ok(display)
    }

    fn close_display(&self, display: Arc<dyn HwDisplay>) {
        let mut state = lock(&self.state);
        state.display_closes += 1;

        let is_current = state
            .display
            .as_ref()
            .is_some_and(|current| current.info() == display.info());
        if is_current {
            state.display = None;
        }
    }
}

#[derive(Default)]
struct CameraState {
    target: Option<Arc<dyn FrameSink>>,
    quota_requests: Vec<u32>,
    returned: Vec<u32>,
    outstanding: HashSet<u32>,
    extended: HashMap<u32, i32>,
    starts: usize,
    stops: usize,
}

/// Camera handed out by [`MockDriver`]
pub struct MockCamera {
    desc: CameraDesc,
    faults: Mutex<MockFaults>,
    transport_down: AtomicBool,
    next_frame_id: AtomicU32,
    state: Mutex<CameraState>,
}

impl MockCamera {
    fn new(desc: CameraDesc, faults: MockFaults) -> Self {
        Self {
            desc,
            faults: Mutex::new(faults),
            transport_down: AtomicBool::new(false),
            next_frame_id: AtomicU32::new(1),
            state: Mutex::new(CameraState::default()),
        }
    }

    /// Capture a frame with the next sequential id and deliver it
    ///
    /// Returns the frame id, or `None` if the camera is not streaming.
    pub fn emit_frame(&self) -> Option<u32> {
        let id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        self.emit_frame_with_id(id).then_some(id)
    }

    /// Deliver a frame with a caller-chosen id; returns whether it was sent
    pub fn emit_frame_with_id(&self, buffer_id: u32) -> bool {
        let target = {
            let mut state = lock(&self.state);
            let Some(target) = state.target.clone() else {
                return false;
            };
            state.outstanding.insert(buffer_id);
            target
        };

        let memory = Bytes::from(buffer_id.to_le_bytes().to_vec());
        target.deliver_frame(FrameBuffer::new(
            buffer_id,
            memory,
            FRAME_WIDTH,
            FRAME_HEIGHT,
            PixelFormat::Nv21,
        ));
        true
    }

    /// Deliver the end-of-stream marker, as a driver does when capture dies
    pub fn emit_end_of_stream(&self) {
        let target = lock(&self.state).target.take();
        if let Some(target) = target {
            target.deliver_frame(FrameBuffer::end_of_stream());
        }
    }

    /// Make every subsequent call fail with a transport error
    pub fn set_transport_down(&self, down: bool) {
        self.transport_down.store(down, Ordering::Relaxed);
    }

    /// Replace the injected faults
    pub fn set_faults(&self, faults: MockFaults) {
        *lock(&self.faults) = faults;
    }

    /// Every count passed to `set_max_frames_in_flight`, accepted or not
    pub fn quota_requests(&self) -> Vec<u32> {
        lock(&self.state).quota_requests.clone()
    }

    /// Ids of buffers given back through `done_with_frame`, in order
    pub fn returned_frames(&self) -> Vec<u32> {
        lock(&self.state).returned.clone()
    }

    /// Ids delivered but not yet given back
    pub fn outstanding_frames(&self) -> usize {
        lock(&self.state).outstanding.len()
    }

    /// Whether a stream target is registered
    pub fn is_streaming(&self) -> bool {
        lock(&self.state).target.is_some()
    }

    /// Number of accepted `start_video_stream` calls
    pub fn start_count(&self) -> usize {
        lock(&self.state).starts
    }

    /// Number of `stop_video_stream` calls that stopped a running stream
    pub fn stop_count(&self) -> usize {
        lock(&self.state).stops
    }

    fn check_transport(&self) -> Result<(), DriverError> {
        if self.transport_down.load(Ordering::Relaxed) {
            Err(DriverError::Transport(format!("{} unreachable", self.desc)))
        } else {
            Ok(())
        }
    }
}

impl HwCamera for MockCamera {
    fn info(&self) -> Result<CameraDesc, DriverError> {
        self.check_transport()?;
        if lock(&self.faults).fail_info {
            return Err(DriverError::Transport(format!("{} info unavailable", self.desc)));
        }
        Ok(self.desc.clone())
    }

    fn set_max_frames_in_flight(&self, count: u32) -> Result<(), DriverError> {
        lock(&self.state).quota_requests.push(count);
        self.check_transport()?;

        match lock(&self.faults).max_buffers {
            Some(max) if count > max => Err(DriverError::Rejected(format!(
                "{} buffers requested, {} available",
                count, max
            ))),
            _ => Ok(()),
        }
    }

    fn start_video_stream(&self, target: Arc<dyn FrameSink>) -> Result<(), DriverError> {
        self.check_transport()?;
        if lock(&self.faults).fail_start {
            return Err(DriverError::Rejected("stream start refused".into()));
        }

        let mut state = lock(&self.state);
        state.target = Some(target);
        state.starts += 1;
        Ok(())
    }

    fn stop_video_stream(&self) {
        let mut state = lock(&self.state);
        if state.target.take().is_some() {
            state.stops += 1;
        }
    }

    fn done_with_frame(&self, buffer: FrameBuffer) {
        let mut state = lock(&self.state);
        state.outstanding.remove(&buffer.buffer_id);
        state.returned.push(buffer.buffer_id);
    }

    fn get_extended_info(&self, key: u32) -> i32 {
        lock(&self.state).extended.get(&key).copied().unwrap_or(0)
    }

    fn set_extended_info(&self, key: u32, value: i32) -> Result<(), DriverError> {
        self.check_transport()?;
        lock(&self.state).extended.insert(key, value);
        Ok(())
    }
}

/// Display handed out by [`MockDriver`]
pub struct MockDisplay {
    desc: DisplayDesc,
    state: Mutex<DisplayState>,
    next_target: AtomicU32,
    presented: Mutex<Vec<u32>>,
}

impl MockDisplay {
    fn new(serial: u32) -> Self {
        Self {
            desc: DisplayDesc {
                display_id: format!("mock-display-{}", serial),
                vendor_flags: 0,
            },
            state: Mutex::new(DisplayState::NotVisible),
            next_target: AtomicU32::new(1),
            presented: Mutex::new(Vec::new()),
        }
    }

    fn set_dead(&self) {
        *lock(&self.state) = DisplayState::Dead;
    }

    /// Ids of target buffers handed back for presentation
    pub fn presented(&self) -> Vec<u32> {
        lock(&self.presented).clone()
    }
}

impl HwDisplay for MockDisplay {
    fn info(&self) -> DisplayDesc {
        self.desc.clone()
    }

    fn state(&self) -> DisplayState {
        *lock(&self.state)
    }

    fn set_state(&self, state: DisplayState) -> Result<(), DriverError> {
        let mut current = lock(&self.state);
        if *current == DisplayState::Dead {
            return Err(DriverError::Rejected("display ownership lost".into()));
        }
        *current = state;
        Ok(())
    }

    fn get_target_buffer(&self) -> Result<FrameBuffer, DriverError> {
        if self.state() == DisplayState::Dead {
            return Err(DriverError::Rejected("display ownership lost".into()));
        }
        let id = self.next_target.fetch_add(1, Ordering::Relaxed);
        Ok(FrameBuffer::new(
            id,
            Bytes::from(vec![0u8; 4]),
            FRAME_WIDTH,
            FRAME_HEIGHT,
            PixelFormat::Rgba8888,
        ))
    }

    fn return_target_buffer(&self, buffer: FrameBuffer) -> Result<(), DriverError> {
        lock(&self.presented).push(buffer.buffer_id);
        let mut state = lock(&self.state);
        if *state == DisplayState::VisibleOnNextFrame {
            *state = DisplayState::Visible;
        }
        Ok(())
    }
}
