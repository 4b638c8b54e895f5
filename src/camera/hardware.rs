//! Hardware camera proxy
//!
//! One `HardwareCameraProxy` exists per physical camera that is open. It
//! owns the driver connection, sizes the driver's buffer pool from the
//! quotas of its clients, and fans every captured frame out to them.
//!
//! # Locking
//!
//! Two locks per proxy:
//!
//! - `control` serializes quota renegotiation and stream start/stop, so a
//!   sum of client quotas is never computed from a value another
//!   renegotiation is about to change.
//! - `state` guards the attached-client list, the frame table and the
//!   aggregate stream state. It is held only for bookkeeping, never while
//!   calling the driver or a client, and never while a client `Arc` could
//!   be dropped.
//!
//! Neither lock is held while a client `Arc` could be dropped: a dropped
//! client calls back in to end its stream and shrink the pool. Quota sums
//! and the streaming check read each slot's `ClientShare` instead.
//!
//! Frames are fanned out without any proxy lock held, so a client sink may
//! hand a frame straight back from inside its delivery callback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, error, info, warn};

use super::client::{ClientCameraProxy, ClientShare};
use super::record::{FrameRecord, FrameTable};
use super::state::StreamState;
use crate::driver::{CameraDesc, HwCamera};
use crate::error::{CameraError, Result};
use crate::frame::FrameBuffer;
use crate::lock;
use crate::registry::RegistryConfig;
use crate::sink::FrameSink;
use crate::stats::{CameraStats, FrameCounters};

struct ClientSlot {
    id: u64,
    client: Weak<ClientCameraProxy>,
    share: Arc<ClientShare>,
}

impl ClientSlot {
    fn is_alive(&self) -> bool {
        self.client.strong_count() > 0
    }
}

/// Counts a disown for as long as it is in progress
pub(crate) struct DisownInProgress<'a>(&'a AtomicUsize);

impl<'a> DisownInProgress<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for DisownInProgress<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct HardwareState {
    clients: Vec<ClientSlot>,
    frames: FrameTable,
    stream_state: StreamState,
    frames_requested: u32,
}

/// Owner of one physical camera, shared by all of its clients
///
/// Outside this crate it is read-only: frames, quotas and streams are
/// driven through `ClientCameraProxy` and `CameraRegistry`, so a client
/// cannot release a buffer it does not hold.
///
/// ```compile_fail
/// use camera_mux::{ClientCameraProxy, FrameBuffer};
///
/// fn release_behind_the_client(client: &ClientCameraProxy, frame: FrameBuffer) {
///     if let Some(hw) = client.hardware_camera() {
///         hw.done_with_frame(frame);
///     }
/// }
/// ```
pub struct HardwareCameraProxy {
    camera: Arc<dyn HwCamera>,
    desc: CameraDesc,
    config: RegistryConfig,
    self_ref: Weak<HardwareCameraProxy>,
    control: Mutex<()>,
    state: Mutex<HardwareState>,
    disowning: AtomicUsize,
    counters: FrameCounters,
}

impl HardwareCameraProxy {
    /// Wrap an opened physical camera
    ///
    /// Fails if the camera cannot describe itself; the caller still owns the
    /// camera in that case and must close it.
    pub(crate) fn new(camera: Arc<dyn HwCamera>, config: RegistryConfig) -> Result<Arc<Self>> {
        let desc = camera
            .info()
            .map_err(|e| CameraError::from_driver(e, CameraError::UnderlyingService))?;

        Ok(Arc::new_cyclic(|self_ref| Self {
            camera,
            desc,
            config,
            self_ref: self_ref.clone(),
            control: Mutex::new(()),
            state: Mutex::new(HardwareState {
                clients: Vec::new(),
                frames: FrameTable::new(),
                stream_state: StreamState::Stopped,
                frames_requested: 0,
            }),
            disowning: AtomicUsize::new(0),
            counters: FrameCounters::new(),
        }))
    }

    /// Descriptor of the physical camera
    pub fn info(&self) -> &CameraDesc {
        &self.desc
    }

    /// Physical camera id
    pub fn camera_id(&self) -> &str {
        &self.desc.camera_id
    }

    pub(crate) fn hw_camera(&self) -> Arc<dyn HwCamera> {
        self.camera.clone()
    }

    /// Create a client bound to this camera and grow the buffer pool for it
    pub(crate) fn mint_client(&self) -> Result<Arc<ClientCameraProxy>> {
        let control = lock(&self.control);

        // Grow the pool before the client exists, so a refusal has no client
        // to drop under `control`
        if let Err(err) =
            self.renegotiate_locked(&control, i64::from(self.config.default_frames_in_flight))
        {
            warn!(
                camera = %self.desc,
                error = %err,
                "Could not grow buffer pool for new client"
            );
            return Err(err);
        }

        let client = ClientCameraProxy::new(
            self.self_ref.clone(),
            self.desc.clone(),
            self.config.default_frames_in_flight,
        );

        let mut state = lock(&self.state);
        // Slots of dropped clients only hold a `Weak` and the share
        state.clients.retain(ClientSlot::is_alive);
        state.clients.push(ClientSlot {
            id: client.id(),
            client: Arc::downgrade(&client),
            share: client.share(),
        });

        info!(
            camera = %self.desc,
            client = client.id(),
            clients = state.clients.len(),
            "Client attached"
        );

        Ok(client)
    }

    /// Detach a client: stop its stream, drain its frames and shrink the
    /// buffer pool
    pub(crate) fn disown_client(&self, client: &ClientCameraProxy) {
        if !self.is_attached(client.id()) {
            error!(
                camera = %self.desc,
                client = client.id(),
                "Asked to disown a client that is not attached"
            );
            return;
        }

        // Entered while the slot is still present, so `is_idle` never sees
        // a client that is halfway out
        let _in_progress = DisownInProgress::enter(&self.disowning);

        client.stop_video_stream();

        let removed = {
            let mut state = lock(&self.state);
            let before = state.clients.len();
            state.clients.retain(|slot| slot.id != client.id());
            before != state.clients.len()
        };
        if !removed {
            // Lost a race with a concurrent disown of the same client
            return;
        }

        client.shutdown();

        let control = lock(&self.control);
        if let Err(err) = self.renegotiate_locked(&control, 0) {
            error!(
                camera = %self.desc,
                error = %err,
                "Could not shrink buffer pool after client left"
            );
        }

        info!(
            camera = %self.desc,
            client = client.id(),
            clients = self.client_count(),
            "Client disowned"
        );
    }

    /// Request the sum of client quotas plus `delta` from the driver
    pub(crate) fn renegotiate_quota(&self, delta: i64) -> Result<()> {
        let control = lock(&self.control);
        self.renegotiate_locked(&control, delta)
    }

    /// Change one client's quota and the pool size together
    pub(crate) fn resize_client(&self, client: &ClientCameraProxy, frames: u32) -> Result<()> {
        let control = lock(&self.control);

        if !self.is_attached(client.id()) {
            return Err(CameraError::OwnershipLost);
        }

        let delta = i64::from(frames) - i64::from(client.frames_allowed());
        self.renegotiate_locked(&control, delta)?;
        client.set_frames_allowed(frames);
        Ok(())
    }

    fn renegotiate_locked(&self, _control: &MutexGuard<'_, ()>, delta: i64) -> Result<()> {
        let allowed: i64 = lock(&self.state)
            .clients
            .iter()
            .filter(|slot| slot.is_alive())
            .map(|slot| i64::from(slot.share.frames_allowed()))
            .sum();

        let floor = i64::from(self.config.min_hardware_frames.max(1));
        let total = (allowed + delta).clamp(floor, i64::from(u32::MAX)) as u32;

        if let Err(err) = self.camera.set_max_frames_in_flight(total) {
            warn!(
                camera = %self.desc,
                requested = total,
                error = %err,
                "Driver refused buffer count"
            );
            return Err(CameraError::from_driver(
                err,
                CameraError::BufferNotAvailable { requested: total },
            ));
        }

        let mut state = lock(&self.state);
        state.frames_requested = total;
        let in_use = state.frames.resize(total as usize);
        if in_use > total as usize {
            // Held frames are left alone; they drain as clients release them
            warn!(
                camera = %self.desc,
                in_use = in_use,
                requested = total,
                "More frames in use than the driver now provides"
            );
        }

        debug!(camera = %self.desc, buffers = total, "Buffer pool resized");
        Ok(())
    }

    /// A client is starting its stream; start the hardware if it is idle
    pub(crate) fn client_stream_starting(&self) -> Result<()> {
        let _control = lock(&self.control);

        let stopped = lock(&self.state).stream_state.is_stopped();
        if !stopped {
            return Ok(());
        }

        let target: Arc<dyn FrameSink> = Arc::new(FrameTarget {
            proxy: self.self_ref.clone(),
        });
        if let Err(err) = self.camera.start_video_stream(target) {
            error!(camera = %self.desc, error = %err, "Driver refused to start stream");
            return Err(CameraError::from_driver(err, CameraError::UnderlyingService));
        }

        lock(&self.state).stream_state = StreamState::Running;
        info!(camera = %self.desc, "Hardware stream started");
        Ok(())
    }

    /// A client has stopped; stop the hardware if nobody is running anymore
    pub(crate) fn client_stream_ending(&self) {
        let _control = lock(&self.control);

        let still_running = lock(&self.state)
            .clients
            .iter()
            .any(|slot| slot.is_alive() && slot.share.is_streaming());
        if still_running {
            debug!(camera = %self.desc, "Hardware stream kept for remaining clients");
            return;
        }

        let was_running = {
            let mut state = lock(&self.state);
            let was_running = !state.stream_state.is_stopped();
            if was_running {
                state.stream_state = StreamState::Stopping;
            }
            was_running
        };
        if !was_running {
            return;
        }

        self.camera.stop_video_stream();
        lock(&self.state).stream_state = StreamState::Stopped;
        info!(camera = %self.desc, "Hardware stream stopped");
    }

    /// Driver callback: one captured frame, or the end-of-stream marker
    pub(crate) fn on_frame_ready(&self, buffer: FrameBuffer) {
        if buffer.is_end_of_stream() {
            self.on_end_of_stream();
            return;
        }

        self.counters.record_received();
        let frame_id = buffer.buffer_id;

        let candidates: Vec<Weak<ClientCameraProxy>> = {
            let mut state = lock(&self.state);

            if state.frames.ref_count(frame_id).is_some() {
                error!(
                    camera = %self.desc,
                    frame = frame_id,
                    "Driver delivered a frame that is still outstanding, ignoring"
                );
                return;
            }

            let candidates: Vec<_> = state
                .clients
                .iter()
                .filter(|slot| slot.is_alive())
                .map(|slot| slot.client.clone())
                .collect();

            // One reference per candidate plus one held by the fan-out
            // itself, so a client releasing synchronously can never bring
            // the count to zero before every client has been offered the frame
            if !candidates.is_empty() {
                state.frames.acquire(frame_id, candidates.len() as u32 + 1);
            }
            candidates
        };

        if candidates.is_empty() {
            self.counters.record_dropped();
            debug!(camera = %self.desc, frame = frame_id, "No clients, frame returned");
            self.return_to_driver(buffer);
            return;
        }

        let mut accepted = 0u32;
        for weak in &candidates {
            if let Some(client) = weak.upgrade() {
                if client.deliver_frame(buffer.clone()) {
                    accepted += 1;
                }
            }
        }

        let unclaimed = candidates.len() as u32 - accepted + 1;
        let remaining = lock(&self.state).frames.release(frame_id, unclaimed);

        if accepted > 0 {
            self.counters.record_delivered(u64::from(accepted));
        } else {
            self.counters.record_dropped();
        }

        match remaining {
            Some(0) => {
                debug!(
                    camera = %self.desc,
                    frame = frame_id,
                    accepted = accepted,
                    "Frame released during delivery"
                );
                self.return_to_driver(buffer);
            }
            Some(refs) => {
                debug!(camera = %self.desc, frame = frame_id, refs = refs, "Frame fanned out");
            }
            None => {
                error!(
                    camera = %self.desc,
                    frame = frame_id,
                    "Frame record vanished during fan-out"
                );
            }
        }
    }

    fn on_end_of_stream(&self) {
        let (was_running, candidates) = {
            let mut state = lock(&self.state);
            let was_running = state.stream_state.is_running();
            state.stream_state = StreamState::Stopped;
            let candidates: Vec<_> = state.clients.iter().map(|s| s.client.clone()).collect();
            (was_running, candidates)
        };

        if was_running {
            warn!(camera = %self.desc, "Hardware stream ended by the driver");
        } else {
            debug!(camera = %self.desc, "End of hardware stream");
        }

        for weak in &candidates {
            if let Some(client) = weak.upgrade() {
                client.deliver_frame(FrameBuffer::end_of_stream());
            }
        }
    }

    /// A client has released a frame
    pub(crate) fn done_with_frame(&self, buffer: FrameBuffer) {
        let frame_id = buffer.buffer_id;
        let remaining = lock(&self.state).frames.release(frame_id, 1);

        match remaining {
            Some(0) => self.return_to_driver(buffer),
            Some(refs) => {
                debug!(camera = %self.desc, frame = frame_id, refs = refs, "Frame still held");
            }
            None => {
                error!(
                    camera = %self.desc,
                    frame = frame_id,
                    "Release of a frame that is not outstanding"
                );
            }
        }
    }

    fn return_to_driver(&self, buffer: FrameBuffer) {
        self.counters.record_returned();
        self.camera.done_with_frame(buffer);
    }

    /// Read a vendor extension value from the driver
    pub fn get_extended_info(&self, key: u32) -> i32 {
        self.camera.get_extended_info(key)
    }

    /// Write a vendor extension value to the driver
    pub(crate) fn set_extended_info(&self, key: u32, value: i32) -> Result<()> {
        self.camera
            .set_extended_info(key, value)
            .map_err(|e| {
                let rejected = format!("extended info key {:#x} rejected", key);
                CameraError::from_driver(e, CameraError::InvalidArgument(rejected))
            })
    }

    fn is_attached(&self, client_id: u64) -> bool {
        lock(&self.state)
            .clients
            .iter()
            .any(|slot| slot.id == client_id && slot.is_alive())
    }

    /// Number of attached clients that are still alive
    pub fn client_count(&self) -> usize {
        lock(&self.state)
            .clients
            .iter()
            .filter(|slot| slot.is_alive())
            .count()
    }

    /// Hold off teardown while a dropped client returns its frames
    pub(crate) fn detaching(&self) -> DisownInProgress<'_> {
        DisownInProgress::enter(&self.disowning)
    }

    /// No client attached and no disown still returning frames
    pub(crate) fn is_idle(&self) -> bool {
        self.disowning.load(Ordering::Acquire) == 0 && self.client_count() == 0
    }

    /// Number of frames held by at least one client
    pub fn outstanding_frames(&self) -> usize {
        lock(&self.state).frames.outstanding()
    }

    /// In-use frame records
    pub fn frame_records(&self) -> Vec<FrameRecord> {
        lock(&self.state).frames.in_use()
    }

    /// Aggregate stream state of the physical camera
    pub fn stream_state(&self) -> StreamState {
        lock(&self.state).stream_state
    }

    /// Buffer count last accepted by the driver
    pub fn frames_requested(&self) -> u32 {
        lock(&self.state).frames_requested
    }

    /// Snapshot of counters and bookkeeping
    pub fn stats(&self) -> CameraStats {
        let (received, delivered, dropped, returned) = self.counters.snapshot();
        let state = lock(&self.state);

        CameraStats {
            camera_id: self.desc.camera_id.clone(),
            client_count: state.clients.iter().filter(|s| s.is_alive()).count(),
            outstanding_frames: state.frames.outstanding(),
            frames_requested: state.frames_requested,
            stream_state: state.stream_state,
            frames_received: received,
            frames_delivered: delivered,
            frames_dropped: dropped,
            frames_returned: returned,
        }
    }
}

/// Frame target registered with the driver
///
/// Holds the proxy weakly so a running driver stream never keeps a closed
/// camera alive.
struct FrameTarget {
    proxy: Weak<HardwareCameraProxy>,
}

impl FrameSink for FrameTarget {
    fn deliver_frame(&self, buffer: FrameBuffer) {
        match self.proxy.upgrade() {
            Some(proxy) => proxy.on_frame_ready(buffer),
            None => debug!(frame = buffer.buffer_id, "Frame for a closed camera dropped"),
        }
    }
}
