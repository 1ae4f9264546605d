//! Futex wait/notify over 32-bit words in shared memory.
//!
//! Uses the shared (not process-private) futex form so that waiters and
//! wakers in different processes mapping the same page see each other. The
//! kernel re-validates the word under its own lock, so a waiter can never
//! miss a wake that happens after it observed `expected`.

use nix::errno::Errno;
use std::ptr;
use std::sync::atomic::AtomicI32;
use std::time::Duration;

/// Result of a single wait on a state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A notify arrived (or the kernel woke us spuriously); the caller must
    /// re-check the word.
    Woken,
    /// The timeout expired before any notify.
    TimedOut,
    /// The word already differed from `expected` when the wait was issued.
    NotEqual,
}

/// Block until `word` is notified, `timeout` elapses, or the stored value is
/// found to differ from `expected`. `None` waits indefinitely.
pub fn wait(word: &AtomicI32, expected: i32, timeout: Option<Duration>) -> WaitOutcome {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs() as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null::<libc::timespec>(), |t| t as *const libc::timespec);

    loop {
        // SAFETY: `word` lives in a mapping owned by the caller for the whole
        // call; FUTEX_WAIT only reads the word and sleeps.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
                ptr::null::<u32>(),
                0u32,
            )
        };
        if rc == 0 {
            return WaitOutcome::Woken;
        }
        match Errno::last() {
            Errno::EAGAIN => return WaitOutcome::NotEqual,
            Errno::ETIMEDOUT => return WaitOutcome::TimedOut,
            // Interrupted by a signal: the relative timeout restarts, which
            // callers tolerate (their budgets are spin counts, not deadlines).
            Errno::EINTR => continue,
            // Anything else is unexpected; report a wake and let the caller
            // re-verify the word.
            _ => return WaitOutcome::Woken,
        }
    }
}

/// Wake every waiter parked on `word`.
pub fn wake_all(word: &AtomicI32) {
    // SAFETY: FUTEX_WAKE does not dereference the word beyond using its
    // address as the wait-queue key.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        );
    }
}
