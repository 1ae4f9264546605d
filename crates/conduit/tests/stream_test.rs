use conduit::state::MIN_STATE_BYTES;
use conduit::{Event, Options, ShmSegment, Slot, StateView, StreamReader, StreamWriter};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Build a writer/reader pair over two mappings of the same region files,
/// plus an extra state view for assertions.
fn pair(
    dir: &TempDir,
    capacity: usize,
    opts: Options,
) -> (StreamWriter, Receiver<Event>, StreamReader, StateView) {
    let state_path = dir.path().join("state");
    let data_path = dir.path().join("data");

    let writer_state = ShmSegment::create(&state_path, MIN_STATE_BYTES).unwrap();
    let writer_data = ShmSegment::create(&data_path, capacity).unwrap();
    let postfix = opts.postfix_size;
    let (writer, events) = StreamWriter::new(writer_state, writer_data, opts).unwrap();

    let reader = StreamReader::new(
        ShmSegment::open(&state_path).unwrap(),
        ShmSegment::open(&data_path).unwrap(),
        postfix,
    )
    .unwrap();

    let view = StateView::new(ShmSegment::open(&state_path).unwrap()).unwrap();
    (writer, events, reader, view)
}

/// A two-byte payload lands as one frame and round-trips.
///
/// Frame bytes: LEN=2 (LE), "AB", flag 0; the published write index is 7.
#[test]
fn test_single_frame_roundtrip() {
    let dir = TempDir::new().unwrap();
    let (writer, _events, mut reader, view) = pair(&dir, 64, Options::default());

    assert!(!writer.write_sync(b"AB"), "an empty ring must not backpressure");
    assert_eq!(view.load(Slot::WriteIndex), 7);
    assert_eq!(view.load(Slot::WriteCycle), 0);

    let msg = reader.recv(RECV_TIMEOUT).unwrap();
    assert_eq!(msg.as_deref(), Some(b"AB".as_slice()));
    assert_eq!(view.load(Slot::ReadIndex), 7, "reader publishes the consumed offset");
}

/// A payload of exactly `capacity - extra - 1` bytes fills the ring as a
/// single unsplit frame; the following write wraps into the next cycle.
#[test]
fn test_payload_filling_ring_exactly_then_wrap() {
    let dir = TempDir::new().unwrap();
    let (writer, _events, mut reader, view) = pair(&dir, 64, Options::default());

    let exact = vec![0x5Au8; 59];
    assert!(!writer.write_sync(&exact));
    assert_eq!(view.load(Slot::WriteIndex), 64);
    assert_eq!(view.load(Slot::WriteCycle), 0);

    let msg = reader.recv(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(msg, exact, "one frame, no split");

    assert!(!writer.write_sync(b"next"));
    assert_eq!(view.load(Slot::WriteCycle), 1, "second write triggered the wrap");
    assert_eq!(view.load(Slot::WriteIndex), 9);

    let msg = reader.recv(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(msg, b"next");
    assert_eq!(view.load(Slot::ReadCycle), 1, "reader followed into the new cycle");
}

/// Writer at the end of the ring, reader mid-ring on the same cycle: the
/// write wraps (index reset, cycle bumped) and frames at offset 0.
#[test]
fn test_wrap_when_reader_is_mid_ring() {
    let dir = TempDir::new().unwrap();
    let (writer, _events, mut reader, view) = pair(&dir, 64, Options::default());

    // Four frames totalling 59 bytes: 15 + 15 + 15 + 14.
    for payload in [&[1u8; 10][..], &[2u8; 10], &[3u8; 10], &[4u8; 9]] {
        assert!(!writer.write_sync(payload));
    }
    assert_eq!(view.load(Slot::WriteIndex), 59);

    // Reader consumes the first two frames and stops at offset 30.
    assert_eq!(reader.recv(RECV_TIMEOUT).unwrap().unwrap(), vec![1u8; 10]);
    assert_eq!(reader.recv(RECV_TIMEOUT).unwrap().unwrap(), vec![2u8; 10]);
    assert_eq!(view.load(Slot::ReadIndex), 30);

    // 5 bytes remain past the cursor; the frame needs 13, so the writer
    // wraps and lands at offset 0 of cycle 1.
    assert!(!writer.write_sync(b"ABCDEFGH"));
    assert_eq!(view.load(Slot::WriteCycle), 1);
    assert_eq!(view.load(Slot::WriteIndex), 13);

    // The reader drains its lap, wraps, and finds the new frame.
    assert_eq!(reader.recv(RECV_TIMEOUT).unwrap().unwrap(), vec![3u8; 10]);
    assert_eq!(reader.recv(RECV_TIMEOUT).unwrap().unwrap(), vec![4u8; 9]);
    assert_eq!(reader.recv(RECV_TIMEOUT).unwrap().unwrap(), b"ABCDEFGH");
    assert_eq!(view.load(Slot::ReadCycle), 1);
}

/// A payload larger than the whole ring splits into continued frames and the
/// reader reassembles it byte for byte.
#[test]
fn test_oversized_payload_splits_and_reassembles() {
    let dir = TempDir::new().unwrap();
    let (writer, _events, mut reader, _view) = pair(&dir, 64, Options::default());

    let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();

    // The sync write parks on the full ring until the reader frees space, so
    // the consumer runs on its own thread.
    let consumer = thread::spawn(move || reader.recv(Duration::from_secs(10)).unwrap().unwrap());

    assert!(!writer.write_sync(&payload));

    let received = consumer.join().expect("consumer thread panicked");
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload, "split payload must reassemble exactly");
}

/// Sequential writes appear at the reader in issue order, across splits and
/// wraps.
#[test]
fn test_issue_order_preserved_across_wraps() {
    let dir = TempDir::new().unwrap();
    let (writer, _events, mut reader, _view) = pair(&dir, 48, Options::default());

    let messages: Vec<Vec<u8>> = (0u8..20)
        .map(|i| vec![i; 3 + (i as usize * 7) % 40])
        .collect();

    let expected = messages.len();
    let consumer = thread::spawn(move || {
        let mut seen = Vec::new();
        for _ in 0..expected {
            seen.push(reader.recv(Duration::from_secs(10)).unwrap().unwrap());
        }
        seen
    });

    for msg in &messages {
        assert!(!writer.write_sync(msg));
    }

    let seen = consumer.join().expect("consumer thread panicked");
    assert_eq!(seen, messages, "payloads must arrive in issue order");
}

/// Backpressure law: once `write` returns true every later call returns true
/// until exactly one Drain event; afterwards writes succeed again and no
/// queued payload is lost or reordered.
#[test]
fn test_backpressure_buffers_then_drains_in_order() {
    let dir = TempDir::new().unwrap();
    let (writer, events, mut reader, view) = pair(&dir, 32, Options::default());

    // Fill the lap exactly: a 27-byte payload occupies all 32 bytes.
    assert!(!writer.write_sync(&[7u8; 27]));
    assert_eq!(view.load(Slot::WriteIndex), 32);

    // The stalled reader leaves no room after the wrap: buffering starts.
    assert!(writer.write(b"first queued"));
    assert!(writer.need_drain());
    assert!(writer.write(b"second queued"));
    assert!(writer.write(b"third queued"));
    assert_eq!(view.load(Slot::WriteIndex), 0, "nothing framed while buffering");
    assert_eq!(view.load(Slot::WriteCycle), 1, "the engine wrapped before stalling");

    // Unstall the reader; the drain thread flushes the queue as space frees.
    let consumer = thread::spawn(move || {
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(reader.recv(Duration::from_secs(10)).unwrap().unwrap());
        }
        seen
    });

    let seen = consumer.join().expect("consumer thread panicked");
    assert_eq!(
        seen,
        vec![
            vec![7u8; 27],
            b"first queued".to_vec(),
            b"second queued".to_vec(),
            b"third queued".to_vec(),
        ],
        "queued payloads must flush in issue order"
    );

    let drain = events
        .recv_timeout(Duration::from_secs(5))
        .expect("drain event should fire once the queue flushed");
    assert_eq!(drain, Event::Drain);
    assert!(!writer.need_drain());
    assert!(
        events.recv_timeout(Duration::from_millis(200)).is_err(),
        "exactly one drain event per backpressure episode"
    );

    // With the reader caught up the next write goes straight to the ring.
    assert!(!writer.write(b"after drain"));
}

/// flush() moves queued payloads into the ring once space exists.
#[test]
fn test_flush_drains_queue_once_reader_moves() {
    let dir = TempDir::new().unwrap();
    let (writer, _events, mut reader, view) = pair(&dir, 32, Options::default());

    assert!(!writer.write_sync(&[1u8; 27]));
    assert!(writer.write(b"queued"), "full ring buffers");
    assert!(!writer.flush(), "no space yet, queue stays");

    // Reader frees the whole lap.
    assert_eq!(reader.recv(RECV_TIMEOUT).unwrap().unwrap(), vec![1u8; 27]);

    // Either this flush or the drain thread moves the payload; both end with
    // an empty queue.
    writer.flush();
    let queued = reader.recv(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(queued, b"queued");
    assert!(!writer.need_drain());
    assert!(view.load(Slot::ReadIndex) > 0);
}

/// Postfix bytes are reserved per frame and stay invisible to the payload.
#[test]
fn test_postfix_bytes_are_transparent() {
    let dir = TempDir::new().unwrap();
    let opts = Options { postfix_size: 8, ..Options::default() };
    let (writer, _events, mut reader, view) = pair(&dir, 64, opts);

    assert!(!writer.write_sync(b"payload"));
    // 4 (prefix) + 7 (payload) + 8 (postfix) + 1 (flag)
    assert_eq!(view.load(Slot::WriteIndex), 20);

    assert_eq!(reader.recv(RECV_TIMEOUT).unwrap().unwrap(), b"payload");
}
