//! Statistics for hardware cameras and the registry

use std::sync::atomic::{AtomicU64, Ordering};

use crate::camera::StreamState;

/// Running frame counters for one hardware camera
#[derive(Debug, Default)]
pub struct FrameCounters {
    received: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    returned: AtomicU64,
}

impl FrameCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame arrived from the driver
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// `count` clients accepted a frame
    pub fn record_delivered(&self, count: u64) {
        self.delivered.fetch_add(count, Ordering::Relaxed);
    }

    /// No client accepted a frame
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A buffer went back to the driver
    pub fn record_returned(&self) {
        self.returned.fetch_add(1, Ordering::Relaxed);
    }

    /// (received, delivered, dropped, returned)
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.received.load(Ordering::Relaxed),
            self.delivered.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
            self.returned.load(Ordering::Relaxed),
        )
    }
}

/// Point-in-time view of one hardware camera
#[derive(Debug, Clone)]
pub struct CameraStats {
    /// Physical camera id
    pub camera_id: String,
    /// Attached clients
    pub client_count: usize,
    /// Buffers held by at least one client
    pub outstanding_frames: usize,
    /// Buffer count last accepted by the driver
    pub frames_requested: u32,
    /// Whether the physical stream is running
    pub stream_state: StreamState,
    /// Frames received from the driver
    pub frames_received: u64,
    /// Sum over frames of the clients that accepted them
    pub frames_delivered: u64,
    /// Frames no client accepted
    pub frames_dropped: u64,
    /// Buffers returned to the driver
    pub frames_returned: u64,
}

impl CameraStats {
    /// Fraction of received frames nobody accepted
    pub fn drop_ratio(&self) -> f64 {
        if self.frames_received > 0 {
            self.frames_dropped as f64 / self.frames_received as f64
        } else {
            0.0
        }
    }
}

/// Point-in-time view of the whole registry
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Per-camera stats of every open hardware camera
    pub cameras: Vec<CameraStats>,
    /// Whether a display owner is tracked
    pub display_open: bool,
}

impl RegistryStats {
    /// Number of open hardware cameras
    pub fn active_cameras(&self) -> usize {
        self.cameras.len()
    }

    /// Attached clients across all cameras
    pub fn total_clients(&self) -> usize {
        self.cameras.iter().map(|c| c.client_count).sum()
    }
}
