//! Single-slot frame hand-off between the transport callback and the render thread.
//!
//! One mutex guards the slot. It is held only for moves and swaps; conversion happens
//! before `publish` is called and rendering after the consumer has its frame, so the
//! critical section never covers I/O or pixel work.
//!
//! `pending` is `Some` exactly when the producer has written a frame the consumer has
//! not taken yet, so the update flag and the buffer always change together.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::frame::CanonicalFrame;

#[derive(Default)]
struct Slot {
    pending: Option<CanonicalFrame>,
    /// Frame the consumer gave back, or one that was superseded before it was read.
    spare: Option<CanonicalFrame>,
    published: u64,
    delivered: u64,
    superseded: u64,
}

/// Counters for frames that passed through the exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub published: u64,
    pub delivered: u64,
    /// Published frames replaced by a newer one before the consumer read them.
    pub superseded: u64,
}

#[derive(Default)]
pub struct FrameExchange {
    slot: Mutex<Slot>,
}

impl FrameExchange {
    pub fn new() -> Self {
        Self::default()
    }

    // The slot only ever holds whole frames moved in or out, so a panic on another
    // thread cannot leave it half-written.
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer side: make `frame` the newest frame.
    pub fn publish(&self, frame: CanonicalFrame) {
        let mut slot = self.lock();
        if let Some(unread) = slot.pending.replace(frame) {
            slot.superseded += 1;
            slot.spare = Some(unread);
        }
        slot.published += 1;
    }

    /// Consumer side: take the newest frame if one arrived since the last take.
    pub fn take_if_updated(&self) -> Option<CanonicalFrame> {
        let mut slot = self.lock();
        let frame = slot.pending.take()?;
        slot.delivered += 1;
        Some(frame)
    }

    /// Consumer side: replace `current` with the newest frame if there is one.
    /// The consumer's previous frame is kept as the producer's spare.
    pub fn swap_if_updated(&self, current: &mut Option<CanonicalFrame>) -> bool {
        let mut slot = self.lock();
        let Some(frame) = slot.pending.take() else {
            return false;
        };
        slot.delivered += 1;
        if let Some(previous) = current.replace(frame) {
            slot.spare = Some(previous);
        }
        true
    }

    /// Producer side: an allocation to convert the next frame into.
    pub fn take_spare(&self) -> Option<CanonicalFrame> {
        self.lock().spare.take()
    }

    pub fn has_update(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub fn stats(&self) -> ExchangeStats {
        let slot = self.lock();
        ExchangeStats {
            published: slot.published,
            delivered: slot.delivered,
            superseded: slot.superseded,
        }
    }
}
