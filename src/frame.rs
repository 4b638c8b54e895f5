//! Frame buffer descriptors
//!
//! A `FrameBuffer` describes one captured image. The memory behind it is
//! owned by the driver; this crate only moves the descriptor around and
//! tracks it by `buffer_id`. Cloning is cheap because the memory handle is
//! reference counted `Bytes`.

use bytes::Bytes;

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// 32-bit RGBA
    #[default]
    Rgba8888,
    /// 24-bit packed RGB
    Rgb888,
    /// YUV 4:2:0 semi-planar, VU interleaved
    Nv21,
    /// YUV 4:2:0 planar
    Yv12,
    /// YUV 4:2:2 packed
    Yuyv,
}

/// One driver-owned frame buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Driver-assigned identifier, stable while the buffer is outstanding
    pub buffer_id: u32,
    /// Opaque memory handle; empty for the end-of-stream marker
    pub memory: Bytes,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Row stride in pixels
    pub stride: u32,
    /// Pixel layout
    pub format: PixelFormat,
    /// Driver usage flags, passed through untouched
    pub usage: u32,
}

impl FrameBuffer {
    /// Create a frame buffer descriptor
    pub fn new(buffer_id: u32, memory: Bytes, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            buffer_id,
            memory,
            width,
            height,
            stride: width,
            format,
            usage: 0,
        }
    }

    /// The reserved marker that tells a sink no further frames will follow
    pub fn end_of_stream() -> Self {
        Self {
            buffer_id: 0,
            memory: Bytes::new(),
            width: 0,
            height: 0,
            stride: 0,
            format: PixelFormat::default(),
            usage: 0,
        }
    }

    /// Set the row stride
    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    /// Set the driver usage flags
    pub fn with_usage(mut self, usage: u32) -> Self {
        self.usage = usage;
        self
    }

    /// Whether this buffer is the end-of-stream marker
    pub fn is_end_of_stream(&self) -> bool {
        self.memory.is_empty()
    }
}

impl std::fmt::Display for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_end_of_stream() {
            write!(f, "end-of-stream")
        } else {
            write!(
                f,
                "frame#{} {}x{} {:?}",
                self.buffer_id, self.width, self.height, self.format
            )
        }
    }
}
