//! One-way byte stream over shared memory between a single writer and a
//! single reader, coordinated through futex-backed atomic state words.
//!
//! The data region is treated as a ring of length-prefixed frames; payloads
//! that do not fit the remaining contiguous space are split across the wrap
//! boundary and reassembled by the reader. A pair of process words carries
//! the startup handshake, orderly shutdown, and peer-failure detection.

pub mod config;
pub mod errors;
pub mod events;
pub mod futex;
pub mod reader;
pub mod ring;
pub mod shm;
pub mod state;
pub mod writer;

pub use config::Options;
pub use errors::{ReaderError, SetupError, WriterError};
pub use events::Event;
pub use reader::StreamReader;
pub use shm::ShmSegment;
pub use state::{Sign, Slot, StateView};
pub use writer::StreamWriter;
