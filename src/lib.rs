//! Camera stream multiplexing
//!
//! Lets several independent clients consume the same physical camera at
//! once. Each client believes it owns the camera: it starts and stops its
//! own stream and picks how many frames it may hold. Underneath, one driver
//! stream runs per physical camera and every captured buffer is shared
//! between the clients that accepted it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use camera_mux::driver::mock::MockDriver;
//! use camera_mux::{CameraRegistry, ChannelSink};
//!
//! # async fn run() -> camera_mux::error::Result<()> {
//! let registry = CameraRegistry::new(MockDriver::new(["front"]));
//! let client = registry.open_camera("front")?;
//!
//! let (sink, mut frames) = ChannelSink::new();
//! client.start_video_stream(Arc::new(sink))?;
//!
//! while let Some(frame) = frames.recv().await {
//!     if frame.is_end_of_stream() {
//!         break;
//!     }
//!     client.done_with_frame(frame)?;
//! }
//! registry.close_camera(&client);
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod camera;
pub mod driver;
pub mod error;
pub mod frame;
pub mod registry;
pub mod sink;
pub mod stats;

#[cfg(test)]
mod test_support;

pub use camera::{ClientCameraProxy, HardwareCameraProxy, StreamState};
pub use driver::{CameraDesc, CameraDriver, DisplayDesc, DisplayState};
pub use error::{CameraError, DriverError, Result};
pub use frame::{FrameBuffer, PixelFormat};
pub use registry::{CameraRegistry, DisplayHandle, RegistryConfig};
pub use sink::{ChannelSink, FrameReceiver, FrameSink};
pub use stats::{CameraStats, RegistryStats};

/// Lock a mutex, carrying on with the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
