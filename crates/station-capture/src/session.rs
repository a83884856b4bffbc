//! Session lifecycle and configuration.
//!
//! [`Session`] is the owning handle for one observation: it holds the
//! configuration record and exclusively owns the socket, the scratch
//! buffers and the ring pair. Sub-resources are reached through the session
//! and never hold pointers back into it. Teardown releases scratch, ring
//! and socket in that order on every exit path.

use std::time::Duration;

use bitflags::bitflags;

use crate::batch::BatchBuffers;
use crate::error::ConfigError;
use crate::packet::{self, HEADER_LEN, MAX_PACKET_LEN};
use crate::ring::{RingConfig, RingPublisher, MAX_RING_READERS};
use crate::socket::{NetworkConfig, SocketHandle, MAX_PORT, MIN_PORT};

pub const DEFAULT_BATCH_PACKETS: usize = 256;
pub const DEFAULT_WRITES_PER_LOG: u32 = 256;
/// Scheduler wakes this many seconds before the start packet.
pub const DEFAULT_PREROLL_SECS: f64 = 2.0;

bitflags! {
    /// Phase flags of one session; transitions are monotonic forward and
    /// checked as preconditions at component entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionState: u32 {
        /// Socket is bound and tuned; released only by teardown.
        const NETWORK_READY = 1 << 0;
        /// First packet inspected: packet size, clock mode and current
        /// packet are valid.
        const NETWORK_CHECKED = 1 << 1;
        /// Both rings are allocated and the writer role is open.
        const RINGBUFFER_READY = 1 << 2;
        /// The observation finished and end-of-data has been signalled.
        const COMPLETE = 1 << 3;
    }
}

/// Per-batch header validation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckPolicy {
    /// Trust the stream completely.
    None,
    /// Validate the first and last packet of each batch.
    #[default]
    FirstLast,
    /// Validate every packet of each batch.
    Every,
}

/// Observation window and batch shape.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub start_packet: u64,
    pub end_packet: u64,
    /// Packets per receive syscall; ~21 ms of data at the nominal rate.
    pub batch_packets: usize,
    pub preroll_secs: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_packet: 0,
            end_packet: 0,
            batch_packets: DEFAULT_BATCH_PACKETS,
            preroll_secs: DEFAULT_PREROLL_SECS,
        }
    }
}

/// Validation knobs.
#[derive(Debug, Clone)]
pub struct CheckConfig {
    /// Full header validation of the first peeked packet.
    pub first_packet_header: bool,
    /// Warn when the first packet's payload is all zeroes.
    pub first_packet_payload: bool,
    /// Promote the all-zero warning to a fatal startup error.
    pub strict_init: bool,
    pub per_batch: CheckPolicy,
    /// Status block emission cadence, in ring writes.
    pub writes_per_log: u32,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            first_packet_header: true,
            first_packet_payload: true,
            strict_init: false,
            per_batch: CheckPolicy::FirstLast,
            writes_per_log: DEFAULT_WRITES_PER_LOG,
        }
    }
}

/// The full configuration record for one observation.
#[derive(Debug, Clone, Default)]
pub struct RecorderConfig {
    pub network: NetworkConfig,
    pub schedule: ScheduleConfig,
    pub checks: CheckConfig,
    pub ring: RingConfig,
}

/// Packet-loss and throughput counters for one session.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub packets_seen: u64,
    pub packets_expected: u64,
    pub interval_seen: u64,
    pub interval_expected: u64,
    pub bytes_written: u64,
}

impl Counters {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn reset_interval(&mut self) {
        self.interval_seen = 0;
        self.interval_expected = 0;
    }
}

/// Owning handle for one capture session.
pub struct Session {
    pub config: RecorderConfig,
    state: SessionState,
    pub(crate) socket: Option<SocketHandle>,
    pub(crate) ring: Option<RingPublisher>,
    pub(crate) batch: Option<BatchBuffers>,
    pub counters: Counters,
    /// Valid once `NETWORK_CHECKED` is set.
    pub(crate) clock_200mhz: bool,
    /// Canonical position on the packet timeline; never decreases while the
    /// scheduler runs. Valid once `NETWORK_CHECKED` is set.
    pub(crate) current_packet: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A session with the immutable defaults installed.
    pub fn new() -> Self {
        Self {
            config: RecorderConfig::default(),
            state: SessionState::empty(),
            socket: None,
            ring: None,
            batch: None,
            counters: Counters::default(),
            clock_200mhz: false,
            current_packet: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, flag: SessionState) {
        self.state |= flag;
    }

    pub fn current_packet(&self) -> u64 {
        self.current_packet
    }

    pub fn clock_200mhz(&self) -> bool {
        self.clock_200mhz
    }

    /// Preflight every configuration field and compare the phase flags
    /// against `expected`.
    pub fn validate(&self, expected: SessionState) -> Result<(), ConfigError> {
        let c = &self.config;

        if c.network.port < MIN_PORT {
            return Err(ConfigError::new(
                "port",
                format!("{} is below the minimum of {}", c.network.port, MIN_PORT),
            ));
        }
        if c.network.port > MAX_PORT {
            return Err(ConfigError::new(
                "port",
                format!("{} is above the maximum of {}", c.network.port, MAX_PORT),
            ));
        }
        if c.network.buffer_bytes == 0 {
            return Err(ConfigError::new("buffer_bytes", "receive buffer target is unset"));
        }
        if !(0..=6).contains(&c.network.priority) {
            return Err(ConfigError::new(
                "priority",
                format!("{} is outside 0..=6", c.network.priority),
            ));
        }
        if c.network.packet_size < HEADER_LEN || c.network.packet_size > MAX_PACKET_LEN {
            return Err(ConfigError::new(
                "packet_size",
                format!(
                    "{} is outside {}..={}",
                    c.network.packet_size, HEADER_LEN, MAX_PACKET_LEN
                ),
            ));
        }
        if c.network.timeout_secs <= 2.0 {
            return Err(ConfigError::new(
                "timeout_secs",
                format!("{} must be greater than 2", c.network.timeout_secs),
            ));
        }

        if c.schedule.batch_packets == 0 {
            return Err(ConfigError::new("batch_packets", "at least one packet per batch"));
        }
        if c.schedule.preroll_secs < 0.0 {
            return Err(ConfigError::new("preroll_secs", "negative pre-roll"));
        }

        if c.ring.key < 0 {
            return Err(ConfigError::new("ring key", format!("{} is negative", c.ring.key)));
        }
        if c.ring.segment_count == 0 {
            return Err(ConfigError::new("segment_count", "at least one ring segment"));
        }
        if c.ring.batches_per_segment == 0 {
            return Err(ConfigError::new("batches_per_segment", "at least one batch per segment"));
        }
        if c.ring.num_readers == 0 || c.ring.num_readers as usize > MAX_RING_READERS {
            return Err(ConfigError::new(
                "num_readers",
                format!("{} is outside 1..={}", c.ring.num_readers, MAX_RING_READERS),
            ));
        }
        if c.ring.cleanup_timeout_secs < 0.0 {
            return Err(ConfigError::new("cleanup_timeout_secs", "negative cleanup timeout"));
        }

        // The observation window only has to make sense once the network is
        // up and the scheduler is about to use it.
        if expected.contains(SessionState::NETWORK_READY) {
            let floor = packet::epoch_packet(false);
            if c.schedule.start_packet < floor {
                return Err(ConfigError::new(
                    "start_packet",
                    format!("{} predates 2008 (uninitialised?)", c.schedule.start_packet),
                ));
            }
            if c.schedule.end_packet < floor {
                return Err(ConfigError::new(
                    "end_packet",
                    format!("{} predates 2008 (uninitialised?)", c.schedule.end_packet),
                ));
            }
            if c.schedule.end_packet <= c.schedule.start_packet {
                return Err(ConfigError::new("end_packet", "end is not after start"));
            }
            if self.socket.is_none() {
                return Err(ConfigError::new(
                    "state",
                    "network flagged ready but no socket is open",
                ));
            }
        }

        if self.state != expected {
            return Err(ConfigError::new(
                "state",
                format!("session is in {:?}, expected {:?}", self.state, expected),
            ));
        }
        Ok(())
    }

    /// Validate, open the socket, and optionally allocate the ring now.
    ///
    /// Eager allocation sizes segments from the configured packet size; the
    /// normal path waits for the first peeked packet to set it.
    pub fn prepare(&mut self, setup_ring_now: bool) -> Result<(), crate::error::SchedulerError> {
        self.validate(SessionState::empty())?;

        if !self.state.contains(SessionState::NETWORK_READY) {
            self.socket = Some(SocketHandle::open(&self.config.network)?);
            self.state |= SessionState::NETWORK_READY;
        }

        if setup_ring_now && !self.state.contains(SessionState::RINGBUFFER_READY) {
            self.setup_ring()?;
        }
        Ok(())
    }

    /// Allocate the ring pair, segments sized as whole batches of the
    /// session's packet size.
    pub(crate) fn setup_ring(&mut self) -> Result<(), crate::error::RingError> {
        let segment_bytes = self.segment_bytes();
        self.ring = Some(RingPublisher::attach_or_create(&self.config.ring, segment_bytes)?);
        self.state |= SessionState::RINGBUFFER_READY;
        Ok(())
    }

    /// One ring segment in bytes: `batches_per_segment x batch x packet`.
    pub fn segment_bytes(&self) -> u64 {
        self.config.ring.batches_per_segment
            * self.config.schedule.batch_packets as u64
            * self.config.network.packet_size as u64
    }

    /// Release everything this session owns: scratch, ring, socket, in that
    /// order. Idempotent; also runs on drop.
    pub fn cleanup(&mut self) {
        self.batch = None;

        if let Some(ring) = self.ring.take() {
            let timeout = Duration::from_secs_f64(self.config.ring.cleanup_timeout_secs.max(0.0));
            if let Err(err) = ring.detach(timeout) {
                tracing::warn!("ring teardown: {}", err);
            }
        }

        // Dropping the handle shuts the socket down both ways.
        self.socket = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}
