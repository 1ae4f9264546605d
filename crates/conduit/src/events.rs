//! Lifecycle notifications.
//!
//! The writer hands out one receiver at construction; events arrive in the
//! order the transitions happened. `Drain` may repeat, the others fire at
//! most once per writer.

use crate::errors::WriterError;
use std::sync::mpsc::{Receiver, Sender, channel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Both sides are attached; the stream is live.
    Ready,
    /// The overflow queue flushed to the ring; writing may resume.
    Drain,
    /// Orderly end completed and the reader acknowledged it.
    Finish,
    /// A fatal fault; `Close` follows.
    Error(WriterError),
    /// The writer is destroyed.
    Close,
}

pub(crate) struct EventSink {
    tx: Sender<Event>,
    ready_sent: bool,
    finish_sent: bool,
    error_sent: bool,
    close_sent: bool,
}

impl EventSink {
    pub(crate) fn new() -> (Self, Receiver<Event>) {
        let (tx, rx) = channel();
        let sink = Self {
            tx,
            ready_sent: false,
            finish_sent: false,
            error_sent: false,
            close_sent: false,
        };
        (sink, rx)
    }

    pub(crate) fn ready(&mut self) {
        if !self.ready_sent {
            self.ready_sent = true;
            let _ = self.tx.send(Event::Ready);
        }
    }

    pub(crate) fn drain(&mut self) {
        let _ = self.tx.send(Event::Drain);
    }

    pub(crate) fn finish(&mut self) {
        if !self.finish_sent {
            self.finish_sent = true;
            let _ = self.tx.send(Event::Finish);
        }
    }

    pub(crate) fn error(&mut self, err: WriterError) {
        if !self.error_sent {
            self.error_sent = true;
            let _ = self.tx.send(Event::Error(err));
        }
    }

    pub(crate) fn close(&mut self) {
        if !self.close_sent {
            self.close_sent = true;
            let _ = self.tx.send(Event::Close);
        }
    }
}
