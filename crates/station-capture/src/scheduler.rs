//! Capture scheduler: the warm-up/observe/finalize state machine.
//!
//! ```text
//! init -> AwaitFirstPacket -> WarmUp -> Observe -> Finalize -> done
//!              |                |          |           |
//!              +---- fatal -----+----------+-----------+
//! ```
//!
//! The scheduler owns the hot path: it peeks the first packet to learn the
//! stream's clock mode and packet size, consumes the run-in until the start
//! packet, then records whole batches into the ring until the end packet.
//! The only suspension points are the receive syscall (bounded by the socket
//! timeout), the ring write under reader back-pressure, the pre-observation
//! sleep, and teardown's detach wait.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::Duration;

use crate::batch::BatchBuffers;
use crate::error::{ConfigError, SchedulerError};
use crate::packet::{packet_rate, HeaderView, HEADER_LEN, MAX_PACKET_LEN};
use crate::session::{CheckPolicy, Session, SessionState};
use crate::status::{StatusLogger, StatusReport};

static STOP: AtomicBool = AtomicBool::new(false);
static INSTALL_HANDLERS: Once = Once::new();

extern "C" fn on_signal(_: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

/// The atomic stop flag, with SIGINT/SIGTERM handlers installed on first
/// use. The scheduler checks it between batches; an in-flight receive
/// completes (or times out) first, then the observation jumps to Finalize.
pub fn stop_flag() -> &'static AtomicBool {
    INSTALL_HANDLERS.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
    });
    &STOP
}

/// Run one full observation on a prepared session.
///
/// The network must be up; the ring is allocated lazily after the first
/// packet has set the packet size, unless it was allocated eagerly.
pub fn operate(session: &mut Session) -> Result<(), SchedulerError> {
    session.validate(session.state())?;
    if !session.state().contains(SessionState::NETWORK_READY) {
        return Err(ConfigError::new("state", "network has not been initialised").into());
    }

    await_first_packet(session)?;

    // Scratch is allocated once per session, now that the packet size is
    // known: one byte region, one iovec array, one mmsghdr array.
    session.batch = Some(BatchBuffers::new(
        session.config.schedule.batch_packets,
        session.config.network.packet_size,
    ));

    if !session.state().contains(SessionState::RINGBUFFER_READY) {
        session.setup_ring()?;
    }

    // Exactly one header record, before the first data byte.
    let record = header_record(session);
    let ring = session
        .ring
        .as_mut()
        .ok_or_else(|| ConfigError::new("state", "ring flagged ready but missing"))?;
    if !ring.header_written() {
        ring.write_header(record.as_bytes())?;
    }

    let logger = StatusLogger::spawn();
    let stop = stop_flag();

    let start = session.config.schedule.start_packet;
    if session.current_packet > start {
        tracing::warn!(
            "already past the observation start on port {} ({} packets missed)",
            session.config.network.port,
            session.current_packet - start
        );
        // Fold the missed run-up into the loss accounting and skip WarmUp.
        session.current_packet = start;
    } else {
        let gap_secs = (start - session.current_packet) as f64
            / packet_rate(session.clock_200mhz);
        let preroll = session.config.schedule.preroll_secs;
        if gap_secs > preroll {
            tracing::info!(
                "observation starts in {:.1} s; sleeping until {:.1} s before it",
                gap_secs,
                preroll
            );
            std::thread::sleep(Duration::from_secs_f64(gap_secs - preroll));
        }
        warm_up(session, &logger, stop)?;
    }

    observe(session, &logger, stop)?;
    finalize(session, &logger);
    Ok(())
}

/// AwaitFirstPacket: peek (non-consuming) one packet and derive the stream
/// parameters from its header. The `- 1` offset makes the subsequent
/// consuming receive read this same packet.
fn await_first_packet(session: &mut Session) -> Result<(), SchedulerError> {
    let port = session.config.network.port;
    let check_header = session.config.checks.first_packet_header;
    let check_payload = session.config.checks.first_packet_payload;
    let strict = session.config.checks.strict_init;
    let configured_size = session.config.network.packet_size;
    let ring_ready = session.state().contains(SessionState::RINGBUFFER_READY);

    let socket = session
        .socket
        .as_ref()
        .ok_or_else(|| ConfigError::new("state", "no socket open"))?;

    let mut scratch = [MaybeUninit::<u8>::uninit(); MAX_PACKET_LEN];
    let n = socket.peek(&mut scratch).map_err(SchedulerError::Peek)?;
    // Safety: peek initialised the first `n` bytes.
    let bytes = unsafe { std::slice::from_raw_parts(scratch.as_ptr() as *const u8, n) };

    let header = HeaderView::parse(bytes)?;
    if check_header {
        header.validate()?;
    }

    if check_payload {
        let end = (HEADER_LEN + header.payload_bytes() as usize).min(n);
        if bytes[HEADER_LEN.min(n)..end].iter().all(|b| *b == 0) {
            tracing::warn!("first packet on port {} contains only zero-valued samples", port);
            if strict {
                return Err(SchedulerError::ZeroPayload);
            }
        }
    }

    let observed_size = header.packet_bytes();
    if ring_ready && observed_size != configured_size {
        tracing::warn!(
            "observed packet size {} differs from the configured {}; \
             continuing with the observed size",
            observed_size,
            configured_size
        );
    }

    session.clock_200mhz = header.clock_200mhz();
    session.current_packet = header.packet_number() - 1;
    session.config.network.packet_size = observed_size;
    session.set_state(SessionState::NETWORK_CHECKED);

    tracing::info!(
        port,
        clock_200mhz = session.clock_200mhz,
        packet_size = observed_size,
        current_packet = session.current_packet,
        "first packet accepted"
    );
    Ok(())
}

/// WarmUp: consume the run-in, publishing batches once they come within one
/// batch of the start packet so the observation begins on a batch boundary.
fn warm_up(
    session: &mut Session,
    logger: &StatusLogger,
    stop: &AtomicBool,
) -> Result<(), SchedulerError> {
    let start = session.config.schedule.start_packet;
    let batch_packets = session.config.schedule.batch_packets as u64;

    while session.current_packet < start {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        let count = receive(session)?;
        let last = last_packet_number(session, count)?;

        if last >= start.saturating_sub(batch_packets) {
            // Readers expect whole batches: the overshoot past `start` is
            // published too.
            let written = write_to_ring(session, count)?;
            let seen = count as u64;
            let expected = last.saturating_sub(session.current_packet);
            let counters = &mut session.counters;
            counters.packets_seen += seen;
            counters.packets_expected += expected;
            counters.interval_seen += seen;
            counters.interval_expected += expected;
            counters.bytes_written += written;
        }
        session.current_packet = last;
    }

    tracing::info!("warm-up complete on port {}", session.config.network.port);
    logger.submit(snapshot(session));
    // The warm-up is logged separately; the observation starts from zero.
    session.counters.reset();
    Ok(())
}

/// Observe: record whole batches until the end packet.
fn observe(
    session: &mut Session,
    logger: &StatusLogger,
    stop: &AtomicBool,
) -> Result<(), SchedulerError> {
    let end = session.config.schedule.end_packet;
    let batch_packets = session.config.schedule.batch_packets;
    let policy = session.config.checks.per_batch;
    let writes_per_log = session.config.checks.writes_per_log;
    let port = session.config.network.port;

    tracing::info!("observation beginning on port {}", port);
    let mut writes_since_log = 0u32;

    while session.current_packet < end {
        if stop.load(Ordering::Relaxed) {
            tracing::warn!("stop requested on port {}; finishing early", port);
            break;
        }

        let count = receive(session)?;
        if count < batch_packets {
            tracing::warn!(
                "short receive on port {} ({} of {} packets)",
                port,
                count,
                batch_packets
            );
        }

        check_batch(session, count, policy)?;
        let last = last_packet_number(session, count)?;
        let written = write_to_ring(session, count)?;

        let seen = count as u64;
        let expected = last.saturating_sub(session.current_packet);
        let counters = &mut session.counters;
        counters.packets_seen += seen;
        counters.packets_expected += expected;
        counters.interval_seen += seen;
        counters.interval_expected += expected;
        counters.bytes_written += written;
        session.current_packet = last;

        writes_since_log += 1;
        if writes_since_log >= writes_per_log {
            writes_since_log = 0;
            logger.submit(snapshot(session));
            session.counters.reset_interval();
        }
    }
    Ok(())
}

/// Finalize: last status block, end-of-data signal, scratch release.
fn finalize(session: &mut Session, logger: &StatusLogger) {
    logger.submit(snapshot(session));
    if let Some(ring) = session.ring.as_ref() {
        ring.mark_end_of_data();
    }
    session.batch = None;
    session.set_state(SessionState::COMPLETE);
    tracing::info!(
        "observation complete on port {}: {} bytes written, {} of {} packets seen",
        session.config.network.port,
        session.counters.bytes_written,
        session.counters.packets_seen,
        session.counters.packets_expected
    );
}

fn receive(session: &mut Session) -> Result<usize, SchedulerError> {
    let fd = session
        .socket
        .as_ref()
        .ok_or_else(|| ConfigError::new("state", "no socket open"))?
        .as_raw_fd();
    let batch = session
        .batch
        .as_mut()
        .ok_or_else(|| ConfigError::new("state", "scratch not allocated"))?;
    Ok(batch.receive_batch(fd)?)
}

/// Packet number of the last packet in the batch, read from its own header
/// at offset `(count - 1) * packet_size`.
fn last_packet_number(session: &Session, count: usize) -> Result<u64, SchedulerError> {
    let batch = session
        .batch
        .as_ref()
        .ok_or_else(|| ConfigError::new("state", "scratch not allocated"))?;
    let index = count - 1;
    let header = HeaderView::parse(batch.packet(index))
        .map_err(|source| SchedulerError::CorruptHeader { index, count, source })?;
    Ok(header.packet_number())
}

fn write_to_ring(session: &mut Session, count: usize) -> Result<u64, SchedulerError> {
    let batch = session
        .batch
        .as_ref()
        .ok_or_else(|| ConfigError::new("state", "scratch not allocated"))?;
    let ring = session
        .ring
        .as_mut()
        .ok_or_else(|| ConfigError::new("state", "ring not allocated"))?;
    let written = ring.write(batch.filled(count))?;
    Ok(written as u64)
}

fn check_batch(
    session: &Session,
    count: usize,
    policy: CheckPolicy,
) -> Result<(), SchedulerError> {
    let batch = match &session.batch {
        Some(batch) => batch,
        None => return Err(ConfigError::new("state", "scratch not allocated").into()),
    };
    let check = |index: usize| {
        HeaderView::parse(batch.packet(index))
            .and_then(|header| header.validate())
            .map_err(|source| SchedulerError::CorruptHeader { index, count, source })
    };
    match policy {
        CheckPolicy::None => Ok(()),
        CheckPolicy::FirstLast => {
            check(0)?;
            check(count - 1)
        }
        CheckPolicy::Every => {
            for index in 0..count {
                check(index)?;
            }
            Ok(())
        }
    }
}

fn snapshot(session: &Session) -> StatusReport {
    StatusReport {
        port: session.config.network.port,
        current_packet: session.current_packet,
        start_packet: session.config.schedule.start_packet,
        end_packet: session.config.schedule.end_packet,
        interval_expected: session.counters.interval_expected,
        interval_seen: session.counters.interval_seen,
        total_expected: session.counters.packets_expected,
        total_seen: session.counters.packets_seen,
    }
}

/// ASCII key-value observation descriptor for the metadata ring.
fn header_record(session: &Session) -> String {
    let clock_mhz: u64 = if session.clock_200mhz { 200 } else { 160 };
    let start = session.config.schedule.start_packet;
    // Inverse of the packet-number formula at sequence 0, whole seconds.
    let utc_start = start * 16 * 1024 / (clock_mhz * 1_000_000);
    format!(
        "HDR_VERSION 1.0\n\
         INSTRUMENT stationrec\n\
         PORT {}\n\
         PACKET_SIZE {}\n\
         CLOCK_MHZ {}\n\
         START_PACKET {}\n\
         END_PACKET {}\n\
         UTC_START_UNIX {}\n\
         NUM_READERS {}\n",
        session.config.network.port,
        session.config.network.packet_size,
        clock_mhz,
        start,
        session.config.schedule.end_packet,
        utc_start,
        session.config.ring.num_readers,
    )
}
