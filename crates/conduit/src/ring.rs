//! Frame layout and the single mutator of the shared byte region.
//!
//! Layout of one frame:
//!
//! ```text
//! ┌───────────────┬──────────────────┬──────────────────┬────────────────┐
//! │ LEN: 4 B (LE) │ PAYLOAD: LEN B   │ POST: postfix B  │ CONTINUED: 1 B │
//! └───────────────┴──────────────────┴──────────────────┴────────────────┘
//! ```
//!
//! `CONTINUED = 1` marks a split frame whose payload continues in the next
//! frame; `0` closes a logical payload. Frames tile the region contiguously
//! within a cycle, so the consumer never needs a table of offsets: the next
//! frame starts where the previous one ended.

use crate::errors::SetupError;
use crate::shm::ShmSegment;
use crate::state::{Slot, StateView};
use std::ptr;

/// Length prefix, little-endian u32.
pub const PREFIX_SIZE: usize = 4;
/// Trailing continuation flag.
pub const FLAG_SIZE: usize = 1;
/// Continuation flag: logical payload complete.
pub const FRAME_FINAL: u8 = 0;
/// Continuation flag: remainder follows in the next frame.
pub const FRAME_CONTINUED: u8 = 1;

/// Producer cursor over the shared byte region.
///
/// `Ring` is the only type that writes the byte region or publishes
/// `WriteIndex`/`WriteCycle`. Frame bytes land before the index store, so a
/// peer that observes the advanced index also observes the frame.
pub struct Ring {
    data: ShmSegment,
    state: StateView,
    postfix: usize,
    cursor: usize,
    cycle: i32,
}

impl Ring {
    pub fn new(data: ShmSegment, state: StateView, postfix: usize) -> Result<Self, SetupError> {
        let min = PREFIX_SIZE + postfix + FLAG_SIZE;
        if data.len() <= min {
            return Err(SetupError::DataTooSmall { got: data.len(), need: min });
        }
        if data.len() > i32::MAX as usize {
            return Err(SetupError::DataTooLarge { got: data.len(), max: i32::MAX as usize });
        }
        Ok(Self { data, state, postfix, cursor: 0, cycle: 0 })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Prefix plus postfix overhead of one frame, excluding the flag byte.
    #[inline]
    pub fn extra(&self) -> usize {
        PREFIX_SIZE + self.postfix
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn cycle(&self) -> i32 {
        self.cycle
    }

    /// Bytes a frame carrying `len` payload bytes occupies.
    #[inline]
    pub fn frame_size(&self, len: usize) -> usize {
        self.extra() + len + FLAG_SIZE
    }

    /// Serialize one frame at the cursor and publish the new cursor.
    ///
    /// The caller guarantees `cursor + frame_size(payload.len()) <= capacity()`.
    pub fn store(&mut self, payload: &[u8], continued: bool) {
        let len = payload.len();
        debug_assert!(self.cursor + self.frame_size(len) <= self.capacity());

        // SAFETY: bounds hold by the caller's precondition; this side is the
        // only mutator of the data region. The postfix bytes stay reserved.
        unsafe {
            let dst = self.data.base().add(self.cursor);
            ptr::copy_nonoverlapping((len as u32).to_le_bytes().as_ptr(), dst, PREFIX_SIZE);
            ptr::copy_nonoverlapping(payload.as_ptr(), dst.add(PREFIX_SIZE), len);
            *dst.add(PREFIX_SIZE + len + self.postfix) =
                if continued { FRAME_CONTINUED } else { FRAME_FINAL };
        }

        self.cursor += self.frame_size(len);
        self.state.store(Slot::WriteIndex, self.cursor as i32);
        self.state.notify(Slot::WriteIndex);
    }

    /// Return the cursor to offset 0 and open the next cycle.
    ///
    /// The index is zeroed first, then the cycle is bumped (pre-increment:
    /// the published cycle always names the lap in progress). A reader that
    /// catches the index regressing before the new cycle value lands re-polls
    /// rather than treating it as corruption.
    pub fn wrap(&mut self) {
        self.state.store(Slot::WriteIndex, 0);
        self.cycle += 1;
        self.state.store(Slot::WriteCycle, self.cycle);
        self.state.notify(Slot::WriteIndex);
        self.cursor = 0;
    }
}
