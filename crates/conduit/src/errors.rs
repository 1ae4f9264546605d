use std::io;
use thiserror::Error;

/// Fatal stream faults observed by the writer.
///
/// Every variant tears the writer down: the error is recorded, emitted on the
/// event channel, and the writer transitions to destroyed. Backpressure is not
/// an error and never surfaces here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriterError {
    #[error("ring corrupted: {0}")]
    Corrupted(&'static str),

    #[error("reader made no progress within the spin budget")]
    ReadTooLong,

    #[error("reader did not attach before the start timeout")]
    ReaderStartTimeout,

    #[error("reader already terminated before synchronization")]
    ReaderExitedBeforeSync,

    #[error("reader left empty state but never became ready")]
    ReaderExitedAtSync,

    #[error("reader terminated while streaming")]
    ReaderExitedWhileWatch,

    #[error("reader did not acknowledge finish within the spin budget")]
    FinishTimeout,

    #[error("reader failed during the finish handshake")]
    FinishReaderFailed,
}

/// Faults observed by the consuming peer.
#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("writer did not attach before the start timeout")]
    PeerStartTimeout,

    #[error("writer failed")]
    PeerFailed,

    #[error("no complete message arrived within the receive timeout")]
    RecvTimeout,

    #[error("ring corrupted: {0}")]
    Corrupted(&'static str),
}

/// Errors raised while mapping or validating the shared regions.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("state region too small: {got} bytes, need at least {need}")]
    StateTooSmall { got: usize, need: usize },

    #[error("state region must be 4-byte aligned for atomic access")]
    StateMisaligned,

    #[error("data region too small: {got} bytes, need more than {need}")]
    DataTooSmall { got: usize, need: usize },

    #[error("data region too large: {got} bytes, max {max}")]
    DataTooLarge { got: usize, max: usize },
}
