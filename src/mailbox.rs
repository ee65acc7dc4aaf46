//! Single-slot "latest frame" handoff between a camera's producer and its
//! consumer. The newest publish always wins; unread frames are overwritten.

use chrono::{DateTime, Utc};
use image::RgbImage;
use std::sync::Mutex;

/// A decoded frame plus capture metadata.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: DateTime<Utc>,
    /// Publish sequence number, assigned by the mailbox. 0 before publish.
    pub seq: u64,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
            seq: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    published: u64,
}

/// Holds at most one frame. `publish` and `take` each hold the lock only for
/// the move or the copy, so a reader never sees half of a write.
#[derive(Default)]
pub struct FrameMailbox {
    slot: Mutex<Slot>,
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite whatever is held. Returns the sequence number stamped on the
    /// frame.
    pub fn publish(&self, mut frame: Frame) -> u64 {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        slot.published += 1;
        frame.seq = slot.published;
        slot.frame = Some(frame);
        slot.published
    }

    /// Private copy of the held frame, or `None` if nothing was published yet.
    pub fn take(&self) -> Option<Frame> {
        let slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        slot.frame.clone()
    }

    /// Like [`take`](Self::take) but only when the held frame is newer than
    /// `after`.
    pub fn take_newer(&self, after: u64) -> Option<Frame> {
        let slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        match &slot.frame {
            Some(f) if f.seq > after => Some(f.clone()),
            _ => None,
        }
    }

    /// Total number of publishes so far.
    pub fn published(&self) -> u64 {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).published
    }
}
