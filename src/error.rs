//! Error types
//!
//! `DriverError` is what a physical driver reports back to this crate;
//! `CameraError` is what this crate reports to its own callers.

use thiserror::Error;

/// Result type alias using `CameraError`
pub type Result<T> = std::result::Result<T, CameraError>;

/// Failure reported by the physical driver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The requested device or resource does not exist or is busy
    #[error("not available: {0}")]
    NotAvailable(String),

    /// The driver understood the request and refused it
    #[error("rejected: {0}")]
    Rejected(String),

    /// The call to the driver did not complete
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Failure reported by the camera registry and its proxies
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CameraError {
    /// The driver could not open the requested camera
    #[error("camera not available: {0}")]
    CameraNotAvailable(String),

    /// The driver could not hand out the display
    #[error("display not available")]
    DisplayNotAvailable,

    /// The driver refused the aggregate in-flight buffer count
    #[error("buffer quota of {requested} not available")]
    BufferNotAvailable {
        /// Total number of buffers that was requested from the driver
        requested: u32,
    },

    /// Argument out of range
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `start_video_stream` on a stream that is not stopped
    #[error("stream already running")]
    StreamAlreadyRunning,

    /// The client has been closed or its hardware camera is gone
    #[error("ownership lost")]
    OwnershipLost,

    /// The hardware camera failed an operation on behalf of the client
    #[error("underlying service error")]
    UnderlyingService,

    /// A driver call failed to complete
    #[error("dead object: {0}")]
    DeadObject(String),
}

impl CameraError {
    /// Translate a driver failure, keeping transport failures as `DeadObject`
    /// and reporting every other refusal as `refused`.
    pub(crate) fn from_driver(err: DriverError, refused: CameraError) -> Self {
        match err {
            DriverError::Transport(reason) => CameraError::DeadObject(reason),
            DriverError::NotAvailable(_) | DriverError::Rejected(_) => refused,
        }
    }

    /// Whether this error means the driver connection itself is gone
    pub fn is_dead_object(&self) -> bool {
        matches!(self, CameraError::DeadObject(_))
    }
}
