//! Write engine and lifecycle controller.
//!
//! The writer is logically single-threaded: one mutex guards all local state
//! (ring cursor, overflow queue, flags) and every public entry point goes
//! through it. Two service threads stand in for asynchronous waits:
//!
//! - the lifecycle thread runs the startup handshake and then watches the
//!   reader's process word for termination or an end request;
//! - the drain thread parks until a write hits backpressure, then waits on
//!   the read index and flushes the overflow queue when the reader frees
//!   space.
//!
//! Each is a plain loop owning an `Arc` of the shared core; teardown wakes
//! their futex waits and lets them observe the writer is no longer writable.

use crate::config::Options;
use crate::errors::{SetupError, WriterError};
use crate::events::{Event, EventSink};
use crate::futex::WaitOutcome;
use crate::ring::Ring;
use crate::shm::ShmSegment;
use crate::state::{Sign, Slot, StateView};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Dispatch mode of the public write entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Payloads go straight to the ring.
    Normal,
    /// The ring filled up; payloads queue until the drain fires.
    Buffering,
}

/// Outcome of one engine pass.
enum EngineStep {
    /// Every byte of the payload reached the ring.
    Done,
    /// The ring is full relative to the reader. `rest` holds the bytes that
    /// did not fit; `expected` is the read index the drain waiter arms
    /// against.
    Backpressure { rest: Vec<u8>, expected: i32 },
}

struct Inner {
    ring: Ring,
    mode: WriteMode,
    overflow: VecDeque<Vec<u8>>,
    events: EventSink,
    ready: bool,
    ending: bool,
    ended: bool,
    finished: bool,
    errored: bool,
    destroyed: bool,
    closed: bool,
    need_drain: bool,
    watching: bool,
    end_on_drain: bool,
    sync_started: bool,
    process_sign: Sign,
    last_error: Option<WriterError>,
}

impl Inner {
    fn writable(&self) -> bool {
        !self.destroyed && !self.ending
    }
}

/// Parking spot for the drain waiter thread.
#[derive(Default)]
struct DrainCell {
    /// Read index value the ring filled up against; present while a wait is
    /// requested.
    expected: Option<i32>,
}

struct Shared {
    state: StateView,
    inner: Mutex<Inner>,
    drain_cell: Mutex<DrainCell>,
    drain_signal: Condvar,
    shutdown: AtomicBool,
    opts: Options,
}

impl Shared {
    /// The unified write algorithm. Loops instead of recursing: each pass
    /// re-reads the reader's cursor and either frames (part of) the payload,
    /// wraps, waits (sync), or reports backpressure (async).
    fn engine(
        &self,
        inner: &mut Inner,
        payload: &[u8],
        sync: bool,
    ) -> Result<EngineStep, WriterError> {
        let mut offset = 0usize;
        let mut spins = 0u32;

        loop {
            let rest = &payload[offset..];
            let r = self.state.load(Slot::ReadIndex);
            let rc = self.state.load(Slot::ReadCycle);
            let cursor = inner.ring.cursor() as i32;
            let cycle = inner.ring.cycle();

            // "behind": the reader is a lap behind, so it sits at or after our
            // cursor position and bounds how far we may write.
            let behind = r > cursor || rc < cycle;
            let limit = if behind { r } else { inner.ring.capacity() as i32 };

            if limit < cursor {
                return Err(WriterError::Corrupted("read index overwrote the write cursor"));
            }
            if rc > cycle {
                return Err(WriterError::Corrupted("read cycle ahead of the write cycle"));
            }

            let leftover =
                i64::from(limit) - i64::from(cursor) - inner.ring.extra() as i64 - 1;

            if leftover <= 0 {
                if behind {
                    // Ring full relative to the reader.
                    if sync {
                        if spins >= self.opts.read_spins {
                            return Err(WriterError::ReadTooLong);
                        }
                        spins += 1;
                        self.state.wait(Slot::ReadIndex, r, Some(self.opts.spin_timeout));
                        if self.state.load(Slot::ReadIndex) != r
                            || self.state.load(Slot::ReadCycle) != rc
                        {
                            // Progress restarts the budget.
                            spins = 0;
                        }
                        continue;
                    }
                    if self.state.load(Slot::ReadIndex) != r
                        || self.state.load(Slot::ReadCycle) != rc
                    {
                        // Resolved synchronously; go around again.
                        continue;
                    }
                    tracing::debug!(
                        queued = rest.len(),
                        read_index = r,
                        "ring full, buffering until the reader frees space"
                    );
                    return Ok(EngineStep::Backpressure { rest: rest.to_vec(), expected: r });
                }
                // End of the ring with the reader already past us: wrap.
                tracing::trace!(cycle = cycle + 1, "wrapping");
                inner.ring.wrap();
                continue;
            }

            let leftover = leftover as usize;
            if leftover < rest.len() {
                // Not enough contiguous room: frame a head that fills it
                // exactly and go around for the tail.
                tracing::trace!(head = leftover, tail = rest.len() - leftover, "splitting payload");
                inner.ring.store(&rest[..leftover], true);
                offset += leftover;
                continue;
            }

            inner.ring.store(rest, false);
            return Ok(EngineStep::Done);
        }
    }

    fn arm_drain(&self, expected: i32) {
        let mut cell = self.drain_cell.lock();
        cell.expected = Some(expected);
        self.drain_signal.notify_one();
    }

    /// Move queued payloads into the ring. Returns whether a deferred orderly
    /// end became due; the caller invokes it after unlocking.
    fn run_drain_locked(&self, inner: &mut Inner) -> bool {
        if !inner.writable() || !inner.need_drain {
            return false;
        }
        while let Some(head) = inner.overflow.pop_front() {
            match self.engine(inner, &head, false) {
                Ok(EngineStep::Done) => {}
                Ok(EngineStep::Backpressure { rest, expected }) => {
                    // Unwritten remainder goes back to the front: issue order
                    // survives the next round.
                    inner.overflow.push_front(rest);
                    self.arm_drain(expected);
                    return false;
                }
                Err(err) => {
                    self.destroy_locked(inner, Some(err));
                    return false;
                }
            }
        }
        inner.need_drain = false;
        inner.mode = WriteMode::Normal;
        inner.events.drain();
        tracing::debug!("overflow queue drained");
        std::mem::take(&mut inner.end_on_drain)
    }

    fn destroy(&self, err: Option<WriterError>) {
        let mut inner = self.inner.lock();
        self.destroy_locked(&mut inner, err);
    }

    fn destroy_locked(&self, inner: &mut Inner, err: Option<WriterError>) {
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        inner.watching = false;

        // Publish a terminal sign only while both sides are still live; a
        // side that already finished or failed keeps its word.
        let still_live =
            |s: Option<Sign>| matches!(s, Some(Sign::Ready) | Some(Sign::Empty));
        if still_live(self.state.sign(Slot::WriteProcess))
            && still_live(self.state.sign(Slot::ReadProcess))
        {
            let sign = if err.is_some() { Sign::Failed } else { Sign::Finished };
            inner.process_sign = sign;
            self.state.store(Slot::WriteProcess, sign as i32);
            self.state.notify(Slot::WriteProcess);
        }

        if let Some(err) = err {
            tracing::error!(error = %err, "writer destroyed");
            inner.errored = true;
            inner.last_error = Some(err.clone());
            inner.events.error(err);
        } else {
            tracing::debug!("writer destroyed");
        }
        inner.closed = true;
        inner.events.close();

        // Unpark both service threads so their pending waits observe the
        // teardown.
        self.shutdown.store(true, Ordering::SeqCst);
        self.state.notify(Slot::ReadIndex);
        self.state.notify(Slot::ReadProcess);
        self.drain_signal.notify_one();
    }

    /// Orderly end: publish `Finishing`, wait (bounded) for the reader's
    /// acknowledgment, settle as `Finished` or destroy.
    fn orderly_end(&self) {
        let mut inner = self.inner.lock();
        if !inner.writable() {
            return;
        }
        inner.ending = true;
        inner.watching = false;
        inner.process_sign = Sign::Finishing;
        // Kick the watch loop out of its wait so it observes `watching`.
        self.state.notify(Slot::ReadProcess);

        let origin0 = self.state.load(Slot::ReadProcess);
        if matches!(
            Sign::from_i32(origin0),
            Some(Sign::Ready) | Some(Sign::Empty) | Some(Sign::Finishing)
        ) {
            self.state.store(Slot::WriteProcess, Sign::Finishing as i32);
            self.state.notify(Slot::WriteProcess);
        }
        tracing::debug!("orderly end initiated");

        let mut origin = origin0;
        let mut spins = 0u32;
        let outcome = loop {
            let s = self.state.load(Slot::ReadProcess);
            match Sign::from_i32(s) {
                Some(Sign::Finished) => break Ok(()),
                Some(Sign::Failed) => break Err(WriterError::FinishReaderFailed),
                _ => {}
            }
            if spins >= self.opts.finish_spins {
                break Err(WriterError::FinishTimeout);
            }
            spins += 1;
            if s != origin {
                // Non-terminal movement; track the new value so the next wait
                // parks instead of spinning hot.
                origin = s;
            }
            self.state.wait(Slot::ReadProcess, origin, Some(self.opts.spin_timeout));
        };

        match outcome {
            Ok(()) => {
                inner.process_sign = Sign::Finished;
                self.state.store(Slot::WriteProcess, Sign::Finished as i32);
                self.state.notify(Slot::WriteProcess);
                inner.finished = true;
                inner.ended = true;
                inner.events.finish();
                tracing::info!("stream finished");
            }
            Err(err) => self.destroy_locked(&mut inner, Some(err)),
        }
    }
}

/// Startup handshake: publish `Ready`, then resolve the reader's word.
/// Returns false when the writer was destroyed along the way.
fn synchronize_phase(shared: &Shared) -> bool {
    let state = &shared.state;
    {
        // Publish under the lock: destroy and end settle the process word
        // through the same lock, so `Ready` can never overwrite a terminal
        // sign.
        let mut inner = shared.inner.lock();
        if !inner.writable() {
            return false;
        }
        inner.process_sign = Sign::Ready;
        state.store(Slot::WriteProcess, Sign::Ready as i32);
        state.notify(Slot::WriteProcess);
    }
    tracing::debug!("writer ready, resolving the reader");

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        match state.sign(Slot::ReadProcess) {
            Some(Sign::Ready) => {
                let mut inner = shared.inner.lock();
                if !inner.writable() {
                    return false;
                }
                inner.ready = true;
                inner.watching = true;
                inner.events.ready();
                tracing::info!("reader attached");
                return true;
            }
            Some(Sign::Empty) => {
                match state.wait(
                    Slot::ReadProcess,
                    Sign::Empty as i32,
                    Some(shared.opts.start_timeout),
                ) {
                    WaitOutcome::NotEqual => continue,
                    WaitOutcome::TimedOut => {
                        shared.destroy(Some(WriterError::ReaderStartTimeout));
                        return false;
                    }
                    WaitOutcome::Woken => match state.sign(Slot::ReadProcess) {
                        // Attached, or a spurious wake; the loop re-resolves.
                        Some(Sign::Ready) | Some(Sign::Empty) => continue,
                        _ => {
                            shared.destroy(Some(WriterError::ReaderExitedAtSync));
                            return false;
                        }
                    },
                }
            }
            Some(Sign::Finishing) | Some(Sign::Finished) | Some(Sign::Failed) => {
                shared.destroy(Some(WriterError::ReaderExitedBeforeSync));
                return false;
            }
            None => {
                shared.destroy(Some(WriterError::Corrupted("unknown reader sign")));
                return false;
            }
        }
    }
}

/// Liveness watch: react to the reader's process word until the stream ends.
fn watch_phase(shared: &Shared) {
    let state = &shared.state;
    loop {
        if shared.shutdown.load(Ordering::SeqCst) || !shared.inner.lock().watching {
            return;
        }
        let raw = state.load(Slot::ReadProcess);
        match Sign::from_i32(raw) {
            Some(Sign::Finishing) => {
                let end_now = {
                    let mut inner = shared.inner.lock();
                    if !inner.watching {
                        return;
                    }
                    if inner.overflow.is_empty() {
                        true
                    } else {
                        // Queued payloads first; the drain completion calls
                        // end for us.
                        if !inner.end_on_drain {
                            tracing::debug!("reader finishing; deferring end until drain");
                            inner.end_on_drain = true;
                        }
                        false
                    }
                };
                if end_now {
                    shared.orderly_end();
                    return;
                }
                state.wait(Slot::ReadProcess, raw, None);
            }
            Some(Sign::Failed) | Some(Sign::Finished) => {
                shared.destroy(Some(WriterError::ReaderExitedWhileWatch));
                return;
            }
            Some(Sign::Ready) | Some(Sign::Empty) => {
                state.wait(Slot::ReadProcess, raw, None);
            }
            None => {
                shared.destroy(Some(WriterError::Corrupted("unknown reader sign")));
                return;
            }
        }
    }
}

fn lifecycle_main(shared: Arc<Shared>) {
    if synchronize_phase(&shared) {
        watch_phase(&shared);
    }
}

/// Drain waiter: parks until a write hits backpressure, then waits for the
/// reader to move and flushes the overflow queue.
fn drain_main(shared: Arc<Shared>) {
    loop {
        let expected = {
            let mut cell = shared.drain_cell.lock();
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(v) = cell.expected.take() {
                    break v;
                }
                shared.drain_signal.wait(&mut cell);
            }
        };

        loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if !shared.inner.lock().writable() {
                // The queue is frozen; back to the parking spot.
                break;
            }
            match shared.state.wait(Slot::ReadIndex, expected, None) {
                WaitOutcome::Woken | WaitOutcome::NotEqual => {
                    let fire_end = {
                        let mut inner = shared.inner.lock();
                        shared.run_drain_locked(&mut inner)
                    };
                    if fire_end {
                        shared.orderly_end();
                    }
                    break;
                }
                WaitOutcome::TimedOut => continue,
            }
        }
    }
}

/// Writer side of the shared-memory byte stream.
///
/// Construct it over two mapped regions, call [`synchronize`] to run the
/// startup handshake, then push payloads with [`write`] (buffering, never
/// blocks) or [`write_sync`] (may block on a full ring). Lifecycle progress
/// arrives on the event receiver handed out at construction.
///
/// [`synchronize`]: StreamWriter::synchronize
/// [`write`]: StreamWriter::write
/// [`write_sync`]: StreamWriter::write_sync
pub struct StreamWriter {
    shared: Arc<Shared>,
    lifecycle: Option<JoinHandle<()>>,
    drainer: Option<JoinHandle<()>>,
}

impl StreamWriter {
    /// Map the writer over its state and data regions.
    ///
    /// The state region must span at least 128 bytes, the data region more
    /// than one empty frame. Returns the writer and its event receiver.
    pub fn new(
        state_seg: ShmSegment,
        data_seg: ShmSegment,
        opts: Options,
    ) -> Result<(Self, Receiver<Event>), SetupError> {
        let state = StateView::new(state_seg)?;
        let ring = Ring::new(data_seg, state.clone(), opts.postfix_size)?;

        // This side owns the write words; start them from a clean slate.
        state.store(Slot::WriteIndex, 0);
        state.store(Slot::WriteCycle, 0);
        state.store(Slot::WriteProcess, Sign::Empty as i32);

        let (events, rx) = EventSink::new();
        let shared = Arc::new(Shared {
            state,
            inner: Mutex::new(Inner {
                ring,
                mode: WriteMode::Normal,
                overflow: VecDeque::new(),
                events,
                ready: false,
                ending: false,
                ended: false,
                finished: false,
                errored: false,
                destroyed: false,
                closed: false,
                need_drain: false,
                watching: false,
                end_on_drain: false,
                sync_started: false,
                process_sign: Sign::Empty,
                last_error: None,
            }),
            drain_cell: Mutex::new(DrainCell::default()),
            drain_signal: Condvar::new(),
            shutdown: AtomicBool::new(false),
            opts,
        });

        let drainer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("conduit-drain".into())
                .spawn(move || drain_main(shared))?
        };

        Ok((Self { shared, lifecycle: None, drainer: Some(drainer) }, rx))
    }

    /// Publish readiness and start resolving the peer. Non-blocking: the
    /// outcome arrives on the event channel (`Ready` on success, `Error` +
    /// `Close` on failure).
    pub fn synchronize(&mut self) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.sync_started || inner.destroyed {
                return;
            }
            inner.sync_started = true;
        }
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("conduit-lifecycle".into())
            .spawn(move || lifecycle_main(shared))
        {
            Ok(handle) => self.lifecycle = Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn the lifecycle thread");
                self.shared.inner.lock().sync_started = false;
            }
        }
    }

    /// Queue `payload` for the stream without blocking.
    ///
    /// Returns `true` when the caller should stop producing until the next
    /// [`Event::Drain`] (the bytes are buffered, not lost), `false` when it
    /// may keep writing. A fatal fault destroys the writer and also returns
    /// `false`; check [`errored`](Self::errored) or the event channel.
    pub fn write(&self, payload: &[u8]) -> bool {
        self.write_inner(payload, false)
    }

    /// Like [`write`](Self::write), but blocks the calling thread on a full
    /// ring (bounded by `read_spins x spin_timeout`) instead of buffering.
    pub fn write_sync(&self, payload: &[u8]) -> bool {
        self.write_inner(payload, true)
    }

    fn write_inner(&self, payload: &[u8], sync: bool) -> bool {
        let mut inner = self.shared.inner.lock();
        if !inner.writable() {
            return false;
        }
        if inner.mode == WriteMode::Buffering {
            // One FIFO queue for every entry point: issue order survives the
            // drain boundary.
            inner.overflow.push_back(payload.to_vec());
            return true;
        }
        match self.shared.engine(&mut inner, payload, sync) {
            Ok(EngineStep::Done) => false,
            Ok(EngineStep::Backpressure { rest, expected }) => {
                inner.mode = WriteMode::Buffering;
                inner.need_drain = true;
                inner.overflow.push_back(rest);
                self.shared.arm_drain(expected);
                true
            }
            Err(err) => {
                self.shared.destroy_locked(&mut inner, Some(err));
                false
            }
        }
    }

    /// Try to move queued payloads into the ring right now. Returns `true`
    /// when the overflow queue fully drained.
    pub fn flush(&self) -> bool {
        let (fire_end, drained) = {
            let mut inner = self.shared.inner.lock();
            if inner.mode == WriteMode::Normal {
                return true;
            }
            let fire_end = self.shared.run_drain_locked(&mut inner);
            (fire_end, !inner.need_drain && !inner.destroyed)
        };
        if fire_end {
            self.shared.orderly_end();
        }
        drained
    }

    /// Request an orderly end: publish `Finishing` and wait (bounded) for the
    /// reader's acknowledgment. Idempotent.
    pub fn end(&self) {
        self.shared.orderly_end();
    }

    /// Tear the writer down cleanly. Idempotent; emits at most one `Close`.
    pub fn destroy(&self) {
        self.shared.destroy(None);
    }

    /// `true` until the writer is ending or destroyed.
    pub fn writable(&self) -> bool {
        self.shared.inner.lock().writable()
    }

    /// An orderly end was requested or completed.
    pub fn ended(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.ending || inner.ended
    }

    /// The orderly end completed and the reader acknowledged it.
    pub fn finished(&self) -> bool {
        self.shared.inner.lock().finished
    }

    /// A fatal fault destroyed the writer.
    pub fn errored(&self) -> bool {
        self.shared.inner.lock().errored
    }

    /// Both sides completed the startup handshake.
    pub fn ready(&self) -> bool {
        self.shared.inner.lock().ready
    }

    /// The writer is destroyed and `Close` was emitted.
    pub fn closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    /// Writes are currently buffering; resume after the next `Drain`.
    pub fn need_drain(&self) -> bool {
        self.shared.inner.lock().need_drain
    }

    /// Always `false`: the stream carries raw bytes, never framed objects.
    pub fn object_mode(&self) -> bool {
        false
    }

    /// The fault that destroyed the writer, if any.
    pub fn last_error(&self) -> Option<WriterError> {
        self.shared.inner.lock().last_error.clone()
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        {
            // Holding the cell lock while flipping the flag closes the window
            // between the drain thread's shutdown check and its condvar wait.
            let _cell = self.shared.drain_cell.lock();
            self.shared.shutdown.store(true, Ordering::SeqCst);
            self.shared.drain_signal.notify_one();
        }
        for handle in [self.drainer.take(), self.lifecycle.take()].into_iter().flatten() {
            // Keep waking until the thread leaves its futex wait; a single
            // wake can land in the window between its shutdown check and the
            // wait itself.
            while !handle.is_finished() {
                self.shared.state.notify(Slot::ReadIndex);
                self.shared.state.notify(Slot::ReadProcess);
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
    }
}
