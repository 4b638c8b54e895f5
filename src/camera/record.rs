//! Per-frame reference counting
//!
//! The hardware proxy keeps one `FrameRecord` per buffer that is out with
//! at least one client. Slots whose count has dropped to zero are free and
//! get reused by the next frame, so the table stays as large as the peak
//! number of outstanding buffers.

/// Reference count for one outstanding buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    /// Driver buffer id
    pub frame_id: u32,
    /// Clients that accepted the frame and have not released it
    pub ref_count: u32,
}

impl FrameRecord {
    fn is_free(&self) -> bool {
        self.ref_count == 0
    }
}

/// Table of outstanding buffers
#[derive(Debug, Default)]
pub(crate) struct FrameTable {
    records: Vec<FrameRecord>,
}

impl FrameTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start tracking `frame_id` with `refs` holders, reusing a free slot if
    /// there is one.
    pub(crate) fn acquire(&mut self, frame_id: u32, refs: u32) {
        let record = FrameRecord {
            frame_id,
            ref_count: refs,
        };

        match self.records.iter_mut().find(|r| r.is_free()) {
            Some(slot) => *slot = record,
            None => self.records.push(record),
        }
    }

    /// Drop `count` references to `frame_id`
    ///
    /// Returns the remaining count, or `None` if the frame is not tracked.
    /// A release larger than the outstanding count saturates at zero.
    pub(crate) fn release(&mut self, frame_id: u32, count: u32) -> Option<u32> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.frame_id == frame_id && !r.is_free())?;

        if count > record.ref_count {
            tracing::warn!(
                frame = frame_id,
                outstanding = record.ref_count,
                released = count,
                "Frame released more times than it was held"
            );
        }
        record.ref_count = record.ref_count.saturating_sub(count);
        Some(record.ref_count)
    }

    /// Current reference count of a tracked frame
    pub(crate) fn ref_count(&self, frame_id: u32) -> Option<u32> {
        self.records
            .iter()
            .find(|r| r.frame_id == frame_id && !r.is_free())
            .map(|r| r.ref_count)
    }

    /// Number of frames still held by at least one client
    pub(crate) fn outstanding(&self) -> usize {
        self.records.iter().filter(|r| !r.is_free()).count()
    }

    /// Snapshot of the in-use records
    pub(crate) fn in_use(&self) -> Vec<FrameRecord> {
        self.records.iter().filter(|r| !r.is_free()).copied().collect()
    }

    /// Rebuild the table for a new buffer count, keeping every record still
    /// in use. Returns the number of records kept.
    pub(crate) fn resize(&mut self, buffer_count: usize) -> usize {
        let mut records = Vec::with_capacity(buffer_count);
        records.extend(self.records.iter().filter(|r| !r.is_free()).copied());
        self.records = records;
        self.records.len()
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let mut table = FrameTable::new();
        table.acquire(7, 2);

        assert_eq!(table.ref_count(7), Some(2));
        assert_eq!(table.release(7, 1), Some(1));
        assert_eq!(table.release(7, 1), Some(0));

        // Released frames are no longer tracked
        assert_eq!(table.ref_count(7), None);
        assert_eq!(table.release(7, 1), None);
        assert_eq!(table.outstanding(), 0);
    }

    #[test]
    fn test_unknown_frame() {
        let mut table = FrameTable::new();
        table.acquire(1, 1);
        assert_eq!(table.release(2, 1), None);
        assert_eq!(table.ref_count(1), Some(1));
    }

    #[test]
    fn test_free_slot_reused() {
        let mut table = FrameTable::new();
        table.acquire(1, 1);
        table.acquire(2, 1);
        table.release(1, 1);

        table.acquire(3, 2);
        assert_eq!(table.slot_count(), 2);
        assert_eq!(table.ref_count(3), Some(2));
        assert_eq!(table.ref_count(2), Some(1));
    }

    #[test]
    fn test_over_release_saturates() {
        let mut table = FrameTable::new();
        table.acquire(4, 1);
        assert_eq!(table.release(4, 3), Some(0));
        assert_eq!(table.outstanding(), 0);
    }

    #[test]
    fn test_resize_keeps_referenced_records() {
        let mut table = FrameTable::new();
        table.acquire(1, 1);
        table.acquire(2, 2);
        table.acquire(3, 1);
        table.release(1, 1);
        table.release(3, 1);

        let kept = table.resize(1);
        assert_eq!(kept, 1);
        assert_eq!(
            table.in_use(),
            vec![FrameRecord {
                frame_id: 2,
                ref_count: 2
            }]
        );
    }
}
