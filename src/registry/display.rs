//! Display ownership
//!
//! The physical display has a single owner at a time. Every successful
//! `open_display` produces a `DisplayHandle` tagged with a fresh generation;
//! the registry keeps only a weak reference to the newest one, so a stale
//! close from a superseded owner is recognized by its generation.

use std::sync::{Arc, Weak};

use crate::driver::{DisplayDesc, DisplayState, HwDisplay};
use crate::error::{CameraError, Result};
use crate::frame::FrameBuffer;

/// Ownership of the physical display
pub struct DisplayHandle {
    generation: u64,
    display: Arc<dyn HwDisplay>,
}

impl DisplayHandle {
    pub(crate) fn new(generation: u64, display: Arc<dyn HwDisplay>) -> Self {
        Self {
            generation,
            display,
        }
    }

    /// Generation this handle was issued under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Descriptor of the physical display
    pub fn info(&self) -> DisplayDesc {
        self.display.info()
    }

    /// Current visibility as reported by the driver
    pub fn state(&self) -> DisplayState {
        self.display.state()
    }

    /// Request a visibility change; fails once this handle has been superseded
    pub fn set_state(&self, state: DisplayState) -> Result<()> {
        self.display
            .set_state(state)
            .map_err(|e| CameraError::from_driver(e, CameraError::OwnershipLost))
    }

    /// Borrow the next buffer to draw into
    pub fn get_target_buffer(&self) -> Result<FrameBuffer> {
        self.display
            .get_target_buffer()
            .map_err(|e| CameraError::from_driver(e, CameraError::OwnershipLost))
    }

    /// Hand a drawn buffer back for presentation
    pub fn return_target_buffer(&self, buffer: FrameBuffer) -> Result<()> {
        self.display
            .return_target_buffer(buffer)
            .map_err(|e| CameraError::from_driver(e, CameraError::OwnershipLost))
    }

    pub(crate) fn hw_display(&self) -> Arc<dyn HwDisplay> {
        self.display.clone()
    }
}

impl std::fmt::Debug for DisplayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayHandle")
            .field("generation", &self.generation)
            .field("display", &self.display.info().display_id)
            .finish()
    }
}

/// Single slot holding the current display owner
#[derive(Default)]
pub(crate) struct DisplaySlot {
    next_generation: u64,
    current: Option<(u64, Weak<DisplayHandle>)>,
}

impl DisplaySlot {
    /// Issue a handle for a newly opened display, replacing any previous one.
    /// Returns the superseded generation, if there was one.
    pub(crate) fn replace(
        &mut self,
        display: Arc<dyn HwDisplay>,
    ) -> (Arc<DisplayHandle>, Option<u64>) {
        self.next_generation += 1;
        let handle = Arc::new(DisplayHandle::new(self.next_generation, display));
        let previous = self
            .current
            .replace((handle.generation, Arc::downgrade(&handle)))
            .map(|(generation, _)| generation);
        (handle, previous)
    }

    /// Whether `handle` is the current owner
    pub(crate) fn is_current(&self, handle: &DisplayHandle) -> bool {
        matches!(self.current, Some((generation, _)) if generation == handle.generation)
    }

    /// The current owner, if it is still alive
    pub(crate) fn current(&self) -> Option<Arc<DisplayHandle>> {
        self.current.as_ref().and_then(|(_, weak)| weak.upgrade())
    }

    pub(crate) fn clear(&mut self) {
        self.current = None;
    }
}
