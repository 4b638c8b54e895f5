//! Stream state machine
//!
//! `Stopped -> Running -> Stopping -> Stopped`. A client is `Stopping` only
//! while its end-of-stream marker is being delivered; teardown may force
//! any state straight back to `Stopped`.

/// Lifecycle of a video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Not streaming; initial and terminal state
    #[default]
    Stopped,
    /// Frames are flowing
    Running,
    /// End-of-stream marker is being delivered
    Stopping,
}

impl StreamState {
    /// Whether frames should flow
    pub fn is_running(self) -> bool {
        self == StreamState::Running
    }

    /// Whether the stream is fully stopped
    pub fn is_stopped(self) -> bool {
        self == StreamState::Stopped
    }

    /// Whether `next` is a legal transition from this state
    pub fn can_transition_to(self, next: StreamState) -> bool {
        matches!(
            (self, next),
            (StreamState::Stopped, StreamState::Running)
                | (StreamState::Running, StreamState::Stopping)
                | (StreamState::Stopping, StreamState::Stopped)
                // forced teardown
                | (_, StreamState::Stopped)
        )
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamState::Stopped => "stopped",
            StreamState::Running => "running",
            StreamState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}
