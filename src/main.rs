//! stationrec — UDP-to-shared-ring station packet recorder.
//!
//! One instance binds one UDP endpoint, schedules itself against the packet
//! timeline derived from the feed's own timestamps, and publishes raw
//! packets into a shared ring buffer for independent reader processes. Run
//! `stationrec --help` for usage.

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod times;

use cli::Cli;
use config::FileConfig;
use station_capture::{packet_rate, scheduler, Session, MAX_PACKET_LEN};

const DEFAULT_OBS_SECS: f64 = 60.0;
const DEFAULT_RING_SECONDS: f64 = 5.0;
const DEFAULT_MIN_STARTUP_SECS: f64 = 10.0;
const DEFAULT_SEGMENTS: u64 = 64;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let mut session = Session::new();

    // CLI flags win over the config file, the file over built-in defaults.
    if let Some(port) = cli.port.or(file.port) {
        session.config.network.port = port;
    }
    if let Some(timeout) = cli.timeout.or(file.timeout) {
        session.config.network.timeout_secs = timeout;
    }
    if let Some(priority) = file.priority {
        session.config.network.priority = priority;
    }
    if let Some(batch) = cli.batch.or(file.batch) {
        session.config.schedule.batch_packets = batch;
    }
    let batch = session.config.schedule.batch_packets;
    // Kernel buffer sized for several batches of worst-case packets unless
    // the operator pinned it.
    session.config.network.buffer_bytes =
        file.buffer_bytes.unwrap_or(8 * batch * MAX_PACKET_LEN);

    let eager_packet_size = cli.packet_size.or(file.packet_size);
    if let Some(size) = eager_packet_size {
        session.config.network.packet_size = size;
    }

    if let Some(writes) = cli.writes_per_log.or(file.writes_per_log) {
        session.config.checks.writes_per_log = writes;
    }

    // Ring geometry: -m fixes the segment count, -s the amount of data the
    // whole ring should hold; the segment size follows in whole batches.
    // The clock mode is unknown before the first packet, so sizing assumes
    // the faster 200 MHz rate.
    let segments = cli.segments.or(file.segments).unwrap_or(DEFAULT_SEGMENTS);
    let ring_seconds = cli.ring_seconds.or(file.ring_seconds).unwrap_or(DEFAULT_RING_SECONDS);
    let rate = packet_rate(true);
    let batches_per_segment =
        (ring_seconds * rate / (batch as f64 * segments as f64)).floor() as u64;
    if batches_per_segment == 0 {
        bail!(
            "a {:.1} s ring cannot hold even one segment of {} x {} packets; \
             increase -s or decrease -m/-n",
            ring_seconds,
            segments,
            batch
        );
    }
    session.config.ring.key = cli.key.or(file.key).unwrap_or(session.config.network.port as i32);
    session.config.ring.segment_count = segments;
    session.config.ring.batches_per_segment = batches_per_segment;
    session.config.ring.num_readers = cli.readers.or(file.readers).unwrap_or(1);
    session.config.ring.force = cli.force;

    // Resolve the observation window and place it on the packet timeline.
    let length = cli.length.unwrap_or(DEFAULT_OBS_SECS);
    if cli.end.is_some() && cli.length.is_some() {
        tracing::warn!("ignoring -t {}s in favour of the explicit end time", length);
    }
    let window =
        times::resolve_window(cli.start.as_deref(), cli.end.as_deref(), length, cli.no_time_check)?;

    let min_startup = cli.min_startup.or(file.min_startup).unwrap_or(DEFAULT_MIN_STARTUP_SECS);
    if min_startup < 2.0 {
        bail!("minimum start-up window must be at least 2 seconds (got {})", min_startup);
    }

    // Fall back to the 200 MHz clock until the first packet confirms it.
    session.config.schedule.start_packet = times::packet_at(window.start, true)?;
    session.config.schedule.end_packet = times::packet_at(window.end, true)?;

    let segment_bytes = session.segment_bytes();
    let ring_bytes = segment_bytes * segments;
    tracing::info!(
        "recording port {} into ring 0x{:x}: {} segments of {} bytes (~{} MiB, ~{:.1} s of data)",
        session.config.network.port,
        session.config.ring.key,
        segments,
        segment_bytes,
        ring_bytes >> 20,
        (segments * batches_per_segment * batch as u64) as f64 / rate
    );
    tracing::info!(
        "start packet {}, end packet {}",
        session.config.schedule.start_packet,
        session.config.schedule.end_packet
    );

    times::sleep_until_near(window.start, min_startup);

    tracing::info!(
        "setting up networking{}",
        if eager_packet_size.is_some() { " and ring buffers" } else { "" }
    );
    session.prepare(eager_packet_size.is_some())?;

    scheduler::operate(&mut session).context("observation failed")?;

    tracing::info!("observation finished; cleaning up");
    session.cleanup();
    Ok(())
}
