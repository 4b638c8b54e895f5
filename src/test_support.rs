//! Helpers shared by unit tests

use std::sync::{Arc, Mutex};

use crate::frame::FrameBuffer;
use crate::lock;
use crate::sink::FrameSink;

/// Sink that keeps everything delivered to it
#[derive(Default)]
pub(crate) struct RecordingSink {
    frames: Mutex<Vec<FrameBuffer>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ids of real frames, in delivery order
    pub(crate) fn frame_ids(&self) -> Vec<u32> {
        self.frames().iter().map(|f| f.buffer_id).collect()
    }

    /// Real frames, in delivery order
    pub(crate) fn frames(&self) -> Vec<FrameBuffer> {
        lock(&self.frames)
            .iter()
            .filter(|f| !f.is_end_of_stream())
            .cloned()
            .collect()
    }

    pub(crate) fn last_frame(&self) -> Option<FrameBuffer> {
        self.frames().pop()
    }

    /// Number of end-of-stream markers received
    pub(crate) fn end_markers(&self) -> usize {
        lock(&self.frames)
            .iter()
            .filter(|f| f.is_end_of_stream())
            .count()
    }
}

impl FrameSink for RecordingSink {
    fn deliver_frame(&self, buffer: FrameBuffer) {
        lock(&self.frames).push(buffer);
    }
}
