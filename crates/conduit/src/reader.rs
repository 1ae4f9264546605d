//! Consuming peer of the stream.
//!
//! Mirrors the writer's wire contract: frames are parsed from the byte
//! region starting at the read cursor, `ReadIndex` advances (and is notified)
//! after every consumed frame, and the cursor wraps to offset 0 when the
//! written region of the current lap ends. The writer wraps only when fewer
//! than one empty frame of room remains, so "fewer than `extra + 1 + 1`
//! bytes left while one cycle behind" is exactly the wrap condition on this
//! side too.

use crate::errors::{ReaderError, SetupError};
use crate::ring::{FLAG_SIZE, FRAME_CONTINUED, FRAME_FINAL, PREFIX_SIZE};
use crate::shm::ShmSegment;
use crate::state::{Sign, Slot, StateView};
use std::time::{Duration, Instant};

/// Wait slice while idle: end-of-stream arrives on the process word but the
/// idle wait parks on the index word, so it re-checks both on this cadence.
const POLL_SLICE: Duration = Duration::from_millis(25);

pub struct StreamReader {
    state: StateView,
    data: ShmSegment,
    postfix: usize,
    cursor: usize,
    cycle: i32,
    /// Payload chunks of a split run, accumulated until the final frame.
    assembly: Vec<u8>,
    finished: bool,
}

impl StreamReader {
    /// Map the reader over the same two regions as the writer.
    pub fn new(
        state_seg: ShmSegment,
        data_seg: ShmSegment,
        postfix: usize,
    ) -> Result<Self, SetupError> {
        let state = StateView::new(state_seg)?;
        let min = PREFIX_SIZE + postfix + FLAG_SIZE;
        if data_seg.len() <= min {
            return Err(SetupError::DataTooSmall { got: data_seg.len(), need: min });
        }

        // This side owns the read words; start them from a clean slate.
        state.store(Slot::ReadIndex, 0);
        state.store(Slot::ReadCycle, 0);
        state.store(Slot::ReadProcess, Sign::Empty as i32);

        Ok(Self {
            state,
            data: data_seg,
            postfix,
            cursor: 0,
            cycle: 0,
            assembly: Vec::new(),
            finished: false,
        })
    }

    /// Publish readiness and wait for the writer to attach.
    pub fn synchronize(&mut self, timeout: Duration) -> Result<(), ReaderError> {
        self.state.store(Slot::ReadProcess, Sign::Ready as i32);
        self.state.notify(Slot::ReadProcess);

        let deadline = Instant::now() + timeout;
        loop {
            let raw = self.state.load(Slot::WriteProcess);
            match Sign::from_i32(raw) {
                Some(Sign::Ready) | Some(Sign::Finishing) | Some(Sign::Finished) => {
                    tracing::debug!("writer attached");
                    return Ok(());
                }
                Some(Sign::Failed) => return Err(ReaderError::PeerFailed),
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ReaderError::PeerStartTimeout);
            }
            self.state
                .wait(Slot::WriteProcess, raw, Some((deadline - now).min(POLL_SLICE)));
        }
    }

    /// Next complete logical payload, reassembled across splits.
    ///
    /// Returns `Ok(None)` once the writer finished and everything was
    /// consumed (and acknowledges the finish on the way out).
    pub fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ReaderError> {
        if self.finished {
            return Ok(None);
        }
        let deadline = Instant::now() + timeout;

        loop {
            let wc = self.state.load(Slot::WriteCycle);
            let wi = self.state.load(Slot::WriteIndex);

            if wc == self.cycle {
                if (wi as i64) < self.cursor as i64 {
                    // Wrap in progress: the index reset landed before the new
                    // cycle value. Re-poll; the pair settles in two stores.
                    // The deadline still applies in case the pair never
                    // settles (a corrupt or vanished writer).
                    if Instant::now() >= deadline {
                        return Err(ReaderError::RecvTimeout);
                    }
                    std::hint::spin_loop();
                    continue;
                }
                if wi as usize == self.cursor {
                    // Ring empty. End of stream, writer failure, or just idle.
                    match self.state.sign(Slot::WriteProcess) {
                        Some(Sign::Finishing) | Some(Sign::Finished) => {
                            self.acknowledge_finish();
                            return Ok(None);
                        }
                        Some(Sign::Failed) => return Err(ReaderError::PeerFailed),
                        _ => {}
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ReaderError::RecvTimeout);
                    }
                    self.state
                        .wait(Slot::WriteIndex, wi, Some((deadline - now).min(POLL_SLICE)));
                    continue;
                }
                // A frame is published at the cursor.
            } else if wc == self.cycle + 1 {
                let remaining = self.data.len() - self.cursor;
                if remaining <= PREFIX_SIZE + self.postfix + FLAG_SIZE {
                    self.wrap();
                    continue;
                }
                // Frames of our lap tile up to the writer's wrap point, which
                // lies at least one frame ahead of us here.
            } else {
                return Err(ReaderError::Corrupted("write cycle skew"));
            }

            if let Some(payload) = self.consume_frame()? {
                return Ok(Some(payload));
            }
        }
    }

    /// Ask the writer for an orderly end. Keep calling [`recv`] afterwards
    /// until it returns `Ok(None)`: the writer drains, publishes `Finishing`,
    /// and waits for this side's final acknowledgment.
    ///
    /// [`recv`]: StreamReader::recv
    pub fn request_finish(&self) {
        self.state.store(Slot::ReadProcess, Sign::Finishing as i32);
        self.state.notify(Slot::ReadProcess);
        tracing::debug!("requested orderly end");
    }

    /// Publish a failure sign; the watching writer tears down when it sees it.
    pub fn fail(&mut self) {
        self.finished = true;
        self.state.store(Slot::ReadProcess, Sign::Failed as i32);
        self.state.notify(Slot::ReadProcess);
    }

    fn wrap(&mut self) {
        self.cursor = 0;
        self.cycle += 1;
        // Cycle first, then index: the writer must never observe a zero
        // index paired with the previous cycle, or it would read it as the
        // ring being overwritten.
        self.state.store(Slot::ReadCycle, self.cycle);
        self.state.store(Slot::ReadIndex, 0);
        self.state.notify(Slot::ReadIndex);
    }

    fn acknowledge_finish(&mut self) {
        self.finished = true;
        self.state.store(Slot::ReadProcess, Sign::Finished as i32);
        self.state.notify(Slot::ReadProcess);
        tracing::debug!("acknowledged finish");
    }

    /// Parse the frame at the cursor, advance and publish the read index.
    /// Returns the reassembled payload once a final frame lands.
    fn consume_frame(&mut self) -> Result<Option<Vec<u8>>, ReaderError> {
        let size = self.data.len();
        if self.cursor + PREFIX_SIZE > size {
            return Err(ReaderError::Corrupted("length prefix out of bounds"));
        }

        // SAFETY: the frame bytes were published before the write index we
        // already observed; bounds are checked against the mapped length.
        let (len, continued, end) = unsafe {
            let base = self.data.base();
            let mut len_bytes = [0u8; PREFIX_SIZE];
            std::ptr::copy_nonoverlapping(
                base.add(self.cursor),
                len_bytes.as_mut_ptr(),
                PREFIX_SIZE,
            );
            let len = u32::from_le_bytes(len_bytes) as usize;
            let end = self.cursor + PREFIX_SIZE + len + self.postfix + FLAG_SIZE;
            if end > size {
                return Err(ReaderError::Corrupted("frame overruns the ring"));
            }
            let payload = std::slice::from_raw_parts(base.add(self.cursor + PREFIX_SIZE), len);
            self.assembly.extend_from_slice(payload);
            (len, *base.add(end - FLAG_SIZE), end)
        };

        tracing::trace!(len, continued, "consumed frame");
        self.cursor = end;
        self.state.store(Slot::ReadIndex, self.cursor as i32);
        self.state.notify(Slot::ReadIndex);

        match continued {
            FRAME_CONTINUED => Ok(None),
            FRAME_FINAL => Ok(Some(std::mem::take(&mut self.assembly))),
            _ => Err(ReaderError::Corrupted("invalid continuation flag")),
        }
    }
}
