//! Typed atomic view over the coordination words.
//!
//! Writer protocol:
//! 1. Write frame bytes to the data region
//! 2. Publish the new cursor into `WriteIndex` (sequentially consistent)
//! 3. Notify the `WriteIndex` futex
//!
//! Reader protocol:
//! 1. Load `WriteIndex`; if it advanced, the frame bytes are visible
//! 2. After consuming, publish `ReadIndex` and notify it
//!
//! Each side stores only its own three words; the other three are read-only
//! to it. Lifecycle transitions travel through the `*Process` words the same
//! way.

use crate::errors::SetupError;
use crate::futex::{self, WaitOutcome};
use crate::shm::ShmSegment;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

/// Minimum state-region size accepted at construction.
pub const MIN_STATE_BYTES: usize = 128;

/// Named state words. Indices are fixed and identical on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Slot {
    WriteIndex = 0,
    WriteCycle = 1,
    WriteProcess = 2,
    ReadIndex = 3,
    ReadCycle = 4,
    ReadProcess = 5,
}

/// Lifecycle sign published in a `*Process` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Sign {
    /// Not yet attached.
    Empty = 0,
    /// Attached and running.
    Ready = 1,
    /// Requesting an orderly end.
    Finishing = 2,
    /// Ended cleanly.
    Finished = 3,
    /// Ended with an error.
    Failed = 4,
}

impl Sign {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Sign::Empty),
            1 => Some(Sign::Ready),
            2 => Some(Sign::Finishing),
            3 => Some(Sign::Finished),
            4 => Some(Sign::Failed),
            _ => None,
        }
    }

    /// Whether this sign ends the peer's participation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Sign::Finished | Sign::Failed)
    }
}

/// Atomic view over the state words of one stream.
///
/// Cloning shares the underlying mapping. All loads and stores are
/// sequentially consistent; waits go through the futex so a peer in another
/// process mapping the same file is woken.
#[derive(Clone)]
pub struct StateView {
    seg: Arc<ShmSegment>,
}

impl StateView {
    pub fn new(seg: ShmSegment) -> Result<Self, SetupError> {
        if seg.len() < MIN_STATE_BYTES {
            return Err(SetupError::StateTooSmall { got: seg.len(), need: MIN_STATE_BYTES });
        }
        if seg.base() as usize % align_of::<AtomicI32>() != 0 {
            return Err(SetupError::StateMisaligned);
        }
        Ok(Self { seg: Arc::new(seg) })
    }

    #[inline]
    fn word(&self, slot: Slot) -> &AtomicI32 {
        // SAFETY: construction checked length and alignment; every slot index
        // is far below MIN_STATE_BYTES / 4; the mapping outlives `self`.
        unsafe { &*(self.seg.base() as *const AtomicI32).add(slot as usize) }
    }

    #[inline]
    pub fn load(&self, slot: Slot) -> i32 {
        self.word(slot).load(Ordering::SeqCst)
    }

    #[inline]
    pub fn store(&self, slot: Slot, value: i32) {
        self.word(slot).store(value, Ordering::SeqCst);
    }

    /// Block until the slot is notified or `timeout` expires. Returns
    /// `NotEqual` immediately when the stored value already differs from
    /// `expected`.
    pub fn wait(&self, slot: Slot, expected: i32, timeout: Option<Duration>) -> WaitOutcome {
        futex::wait(self.word(slot), expected, timeout)
    }

    /// Wake every waiter parked on the slot.
    pub fn notify(&self, slot: Slot) {
        futex::wake_all(self.word(slot));
    }

    /// Current sign of a process word; `None` if the word holds garbage.
    pub fn sign(&self, slot: Slot) -> Option<Sign> {
        Sign::from_i32(self.load(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn view(dir: &tempfile::TempDir) -> StateView {
        let seg = ShmSegment::create(dir.path().join("state"), MIN_STATE_BYTES).unwrap();
        StateView::new(seg).unwrap()
    }

    #[test]
    fn test_rejects_undersized_region() {
        let dir = tempdir().unwrap();
        let seg = ShmSegment::create(dir.path().join("small"), 64).unwrap();
        assert!(matches!(
            StateView::new(seg),
            Err(SetupError::StateTooSmall { got: 64, need: MIN_STATE_BYTES })
        ));
    }

    #[test]
    fn test_store_load_roundtrip_per_slot() {
        let dir = tempdir().unwrap();
        let view = view(&dir);

        view.store(Slot::WriteIndex, 7);
        view.store(Slot::ReadIndex, 3);
        view.store(Slot::WriteCycle, 1);

        assert_eq!(view.load(Slot::WriteIndex), 7);
        assert_eq!(view.load(Slot::ReadIndex), 3);
        assert_eq!(view.load(Slot::WriteCycle), 1);
        assert_eq!(view.load(Slot::ReadCycle), 0, "untouched slot stays zero");
    }

    #[test]
    fn test_two_views_over_one_file_share_words() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");

        let a = StateView::new(ShmSegment::create(&path, MIN_STATE_BYTES).unwrap()).unwrap();
        let b = StateView::new(ShmSegment::open(&path).unwrap()).unwrap();

        a.store(Slot::WriteProcess, Sign::Ready as i32);
        assert_eq!(b.sign(Slot::WriteProcess), Some(Sign::Ready));
    }

    #[test]
    fn test_wait_observes_changed_value() {
        let dir = tempdir().unwrap();
        let view = view(&dir);

        view.store(Slot::ReadIndex, 9);
        assert_eq!(
            view.wait(Slot::ReadIndex, 0, Some(Duration::from_millis(50))),
            WaitOutcome::NotEqual
        );
    }

    #[test]
    fn test_sign_mapping() {
        assert_eq!(Sign::from_i32(0), Some(Sign::Empty));
        assert_eq!(Sign::from_i32(2), Some(Sign::Finishing));
        assert_eq!(Sign::from_i32(99), None);
        assert!(Sign::Finished.is_terminal());
        assert!(Sign::Failed.is_terminal());
        assert!(!Sign::Ready.is_terminal());
    }
}
