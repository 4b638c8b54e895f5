//! Frame and camera statistics

pub mod metrics;

pub use metrics::{CameraStats, FrameCounters, RegistryStats};
