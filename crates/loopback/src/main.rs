mod config;

use anyhow::{Context, Result, bail};
use conduit::state::MIN_STATE_BYTES;
use conduit::{Event, Options, ShmSegment, StreamReader, StreamWriter};
use config::LoopbackConfig;
use std::thread;
use std::time::{Duration, Instant};

/// Streams messages through a writer/reader pair wired over two shared
/// regions, with the reader standing in for the peer process, then performs
/// the orderly end and reports throughput.
fn main() -> Result<()> {
    let config = LoopbackConfig::from_env();
    common::setup_logging(config.profile);
    tracing::info!(?config, "loopback starting");

    let dir = tempfile::tempdir().context("Failed to create region directory")?;
    let state_path = dir.path().join("loopback_state");
    let data_path = dir.path().join("loopback_data");

    let (mut writer, events) = StreamWriter::new(
        ShmSegment::create(&state_path, MIN_STATE_BYTES)
            .context("Failed to create state region")?,
        ShmSegment::create(&data_path, config.ring_bytes)
            .context("Failed to create data region")?,
        Options::default(),
    )
    .context("Failed to build writer")?;

    let mut reader = StreamReader::new(
        ShmSegment::open(&state_path).context("Failed to open state region")?,
        ShmSegment::open(&data_path).context("Failed to open data region")?,
        0,
    )
    .context("Failed to build reader")?;

    let consumer = thread::spawn(move || -> Result<(u64, u64)> {
        reader
            .synchronize(Duration::from_secs(5))
            .context("Reader synchronization failed")?;
        let mut messages = 0u64;
        let mut bytes = 0u64;
        while let Some(msg) = reader
            .recv(Duration::from_secs(10))
            .context("Receive failed")?
        {
            messages += 1;
            bytes += msg.len() as u64;
        }
        Ok((messages, bytes))
    });

    writer.synchronize();
    match events.recv_timeout(Duration::from_secs(5)) {
        Ok(Event::Ready) => tracing::info!("stream ready"),
        other => bail!("expected the stream to become ready, got {:?}", other),
    }

    let started = Instant::now();
    let mut sent_bytes = 0u64;
    for i in 0..config.message_count {
        // Every eighth message outgrows the ring to exercise the split path.
        let size = if i % 8 == 7 {
            config.ring_bytes + config.message_bytes
        } else {
            config.message_bytes
        };
        let payload = vec![(i % 251) as u8; size];
        writer.write_sync(&payload);
        sent_bytes += size as u64;

        if writer.errored() {
            bail!("writer failed mid-stream: {:?}", writer.last_error());
        }
    }

    writer.end();
    let (messages, bytes) = consumer
        .join()
        .map_err(|_| anyhow::anyhow!("consumer thread panicked"))?
        .context("Consumer failed")?;

    let elapsed = started.elapsed();
    if messages != config.message_count || bytes != sent_bytes {
        bail!(
            "loopback mismatch: sent {} messages / {} bytes, received {} / {}",
            config.message_count,
            sent_bytes,
            messages,
            bytes
        );
    }

    tracing::info!(
        messages,
        bytes,
        elapsed_ms = elapsed.as_millis() as u64,
        mib_per_s = (bytes as f64 / (1024.0 * 1024.0)) / elapsed.as_secs_f64(),
        finished = writer.finished(),
        "loopback complete"
    );
    Ok(())
}
