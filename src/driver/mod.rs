//! Physical driver interface
//!
//! The driver enumerates and opens physical cameras and the single
//! physical display. Everything in this crate talks to hardware only
//! through these traits, so any backend (a HAL binding, a V4L2 wrapper,
//! the in-memory [`mock`] driver) can sit underneath.
//!
//! All methods are synchronous and may be called from any thread. A camera
//! delivers frames to the target passed to `start_video_stream` on a thread
//! of its own choosing.

pub mod mock;

use std::sync::Arc;

use crate::error::DriverError;
use crate::frame::FrameBuffer;
use crate::sink::FrameSink;

/// Identity and capabilities of one physical camera
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CameraDesc {
    /// Driver-unique camera identifier
    pub camera_id: String,
    /// Vendor-specific capability flags, passed through untouched
    pub vendor_flags: u32,
}

impl CameraDesc {
    /// Create a camera descriptor
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            vendor_flags: 0,
        }
    }

    /// Set the vendor flags
    pub fn with_vendor_flags(mut self, flags: u32) -> Self {
        self.vendor_flags = flags;
        self
    }
}

impl std::fmt::Display for CameraDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.camera_id)
    }
}

/// Identity and capabilities of the physical display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayDesc {
    /// Driver-unique display identifier
    pub display_id: String,
    /// Vendor-specific capability flags, passed through untouched
    pub vendor_flags: u32,
}

/// Visibility state of the display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayState {
    /// Nobody owns the display
    #[default]
    NotOpen,
    /// Owned, but not showing content
    NotVisible,
    /// Content becomes visible with the next returned target buffer
    VisibleOnNextFrame,
    /// Content is on screen
    Visible,
    /// The display has been taken away or failed
    Dead,
}

/// Entry point of the physical driver
pub trait CameraDriver: Send + Sync {
    /// Enumerate the physical cameras
    fn list_cameras(&self) -> Result<Vec<CameraDesc>, DriverError>;

    /// Open a physical camera for exclusive use
    fn open_camera(&self, camera_id: &str) -> Result<Arc<dyn HwCamera>, DriverError>;

    /// Release a camera obtained from `open_camera`
    fn close_camera(&self, camera: Arc<dyn HwCamera>);

    /// Take exclusive ownership of the display, invalidating any previous owner
    fn open_display(&self) -> Result<Arc<dyn HwDisplay>, DriverError>;

    /// Release a display obtained from `open_display`
    fn close_display(&self, display: Arc<dyn HwDisplay>);
}

/// An open physical camera
pub trait HwCamera: Send + Sync {
    /// Descriptor of this camera
    fn info(&self) -> Result<CameraDesc, DriverError>;

    /// Ask the driver to make `count` buffers available for simultaneous use
    fn set_max_frames_in_flight(&self, count: u32) -> Result<(), DriverError>;

    /// Start capturing; every frame is handed to `target`
    fn start_video_stream(&self, target: Arc<dyn FrameSink>) -> Result<(), DriverError>;

    /// Stop capturing
    fn stop_video_stream(&self);

    /// Give a delivered buffer back to the driver
    fn done_with_frame(&self, buffer: FrameBuffer);

    /// Read a vendor extension value
    fn get_extended_info(&self, key: u32) -> i32;

    /// Write a vendor extension value
    fn set_extended_info(&self, key: u32, value: i32) -> Result<(), DriverError>;
}

/// The open physical display
pub trait HwDisplay: Send + Sync {
    /// Descriptor of this display
    fn info(&self) -> DisplayDesc;

    /// Current visibility state
    fn state(&self) -> DisplayState;

    /// Request a visibility state
    fn set_state(&self, state: DisplayState) -> Result<(), DriverError>;

    /// Borrow the buffer the owner should draw into next
    fn get_target_buffer(&self) -> Result<FrameBuffer, DriverError>;

    /// Hand a drawn target buffer back for presentation
    fn return_target_buffer(&self, buffer: FrameBuffer) -> Result<(), DriverError>;
}
