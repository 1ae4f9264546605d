use conduit::state::MIN_STATE_BYTES;
use conduit::{Options, ShmSegment, StreamReader, StreamWriter};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const RING_BYTES: usize = 1024 * 1024;

fn benchmark_write_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_sync");

    let sizes = [
        (64, "64B"),          // control messages
        (1024, "1KB"),        // small records
        (16 * 1024, "16KB"),  // batched records
        (256 * 1024, "256KB"), // large payloads, still within one lap
    ];

    for (size, label) in sizes.iter() {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state");
        let data_path = dir.path().join("data");

        let (writer, _events) = StreamWriter::new(
            ShmSegment::create(&state_path, MIN_STATE_BYTES).unwrap(),
            ShmSegment::create(&data_path, RING_BYTES).unwrap(),
            Options::default(),
        )
        .unwrap();

        let mut reader = StreamReader::new(
            ShmSegment::open(&state_path).unwrap(),
            ShmSegment::open(&data_path).unwrap(),
            0,
        )
        .unwrap();

        // Drain continuously so the writer never parks for long.
        let stop = Arc::new(AtomicBool::new(false));
        let stop_reader = Arc::clone(&stop);
        let consumer = thread::spawn(move || {
            while !stop_reader.load(Ordering::Relaxed) {
                match reader.recv(Duration::from_millis(50)) {
                    Ok(Some(_)) | Err(conduit::ReaderError::RecvTimeout) => {}
                    Ok(None) | Err(_) => break,
                }
            }
        });

        let data = vec![0x42u8; *size];
        group.throughput(criterion::Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("write", label), size, |b, _| {
            b.iter(|| {
                writer.write_sync(black_box(&data));
            });
        });

        stop.store(true, Ordering::Relaxed);
        consumer.join().expect("consumer thread panicked");
    }

    group.finish();
}

criterion_group!(benches, benchmark_write_sync);
criterion_main!(benches);
