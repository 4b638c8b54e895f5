//! Frame sinks
//!
//! A sink is whatever receives frames: the client behind a
//! `ClientCameraProxy`, or the `HardwareCameraProxy` itself when it is
//! registered with the driver. Delivery is synchronous and must not block;
//! a sink that needs to hand frames to async code should use
//! [`ChannelSink`].

use tokio::sync::mpsc;

use crate::frame::FrameBuffer;

/// Receiver of frames
pub trait FrameSink: Send + Sync {
    /// Called once per frame. The end-of-stream marker is delivered through
    /// this same call.
    fn deliver_frame(&self, buffer: FrameBuffer);
}

impl<F> FrameSink for F
where
    F: Fn(FrameBuffer) + Send + Sync,
{
    fn deliver_frame(&self, buffer: FrameBuffer) {
        self(buffer)
    }
}

/// Sink that forwards frames into an unbounded tokio channel
///
/// Quota enforcement happens upstream in the client proxy, so the channel
/// never holds more than the client's allowed frames plus the end marker.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<FrameBuffer>,
}

impl ChannelSink {
    /// Create a connected sink/receiver pair
    pub fn new() -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, FrameReceiver { rx })
    }
}

impl FrameSink for ChannelSink {
    fn deliver_frame(&self, buffer: FrameBuffer) {
        if self.tx.send(buffer).is_err() {
            tracing::debug!("Frame receiver dropped, discarding frame");
        }
    }
}

/// Async side of a [`ChannelSink`]
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::UnboundedReceiver<FrameBuffer>,
}

impl FrameReceiver {
    /// Wait for the next frame
    ///
    /// Returns `None` once the sink has been dropped and the queue drained.
    pub async fn recv(&mut self) -> Option<FrameBuffer> {
        self.rx.recv().await
    }

    /// Take the next frame if one is queued
    pub fn try_recv(&mut self) -> Option<FrameBuffer> {
        self.rx.try_recv().ok()
    }

    /// Number of frames waiting in the queue
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
