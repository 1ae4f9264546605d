use std::time::Duration;

/// Tunables for the writer's frame layout and wait budgets.
///
/// Defaults match the wire contract both sides were built against: a blocking
/// write gives a stalled reader at most `read_spins x spin_timeout` (10 s)
/// before failing, and synchronization waits 5 s for the peer to attach.
#[derive(Debug, Clone)]
pub struct Options {
    /// Reserved bytes between payload and continuation flag in every frame.
    pub postfix_size: usize,
    /// Bounded waits a blocking write spends on a stalled reader before
    /// giving up.
    pub read_spins: u32,
    /// Duration of one bounded wait in the blocking-write and finish loops.
    pub spin_timeout: Duration,
    /// How long synchronization waits for the reader to attach.
    pub start_timeout: Duration,
    /// Bounded waits the orderly end spends on the reader's acknowledgment.
    pub finish_spins: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            postfix_size: 0,
            read_spins: 10,
            spin_timeout: Duration::from_millis(1000),
            start_timeout: Duration::from_millis(5000),
            finish_spins: 10,
        }
    }
}
