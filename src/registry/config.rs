//! Registry configuration

/// Configuration shared by the registry and every hardware camera it opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Frames a newly opened client may hold before frames are skipped
    pub default_frames_in_flight: u32,

    /// Lower bound on the buffer count requested from the driver, kept even
    /// when no client is attached
    pub min_hardware_frames: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_frames_in_flight: 1,
            min_hardware_frames: 1,
        }
    }
}

impl RegistryConfig {
    /// Set the per-client default quota (at least 1)
    pub fn default_frames_in_flight(mut self, frames: u32) -> Self {
        self.default_frames_in_flight = frames.max(1);
        self
    }

    /// Set the minimum hardware buffer count (at least 1)
    pub fn min_hardware_frames(mut self, frames: u32) -> Self {
        self.min_hardware_frames = frames.max(1);
        self
    }
}
