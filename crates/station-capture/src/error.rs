//! Error taxonomy for the capture pipeline.
//!
//! Each component owns its error enum; [`SchedulerError`] aggregates them for
//! the observation loop. Initialisation errors abort and trigger teardown,
//! per-batch header errors abort the observation, short receives and reader
//! lag never do.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// A configuration field failed its preflight check.
#[derive(Debug, Error)]
#[error("invalid {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self { field, reason: reason.into() }
    }
}

/// Socket construction and tuning failures.
#[derive(Debug, Error)]
pub enum NetError {
    /// The kernel recommends binding only to ports in [1024, 49151].
    #[error("requested a reserved port ({0})")]
    ReservedPort(u16),

    #[error("failed to create socket on port {port}: {source}")]
    Socket { port: u16, source: io::Error },

    #[error("failed to bind to port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("failed to {op} on port {port}: {source}")]
    SockOpt {
        op: &'static str,
        port: u16,
        source: io::Error,
    },

    /// The kernel refused to grow the receive buffer. `Display` includes the
    /// sysctl invocation the operator must run.
    #[error(
        "receive buffer on port {port} stuck at {actual} bytes (requested {requested}); \
         run `echo 'net.core.rmem_max={requested}' | sudo tee -a /etc/sysctl.conf && sudo sysctl -p`"
    )]
    BufferSize {
        port: u16,
        requested: usize,
        actual: usize,
    },
}

/// Station-header validation failures (§ header layout in `packet`).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("buffer holds {0} bytes, header needs 16")]
    Truncated(usize),

    #[error("station error bit is set")]
    ErrorBit,

    #[error("protocol version is {0}, expected 3")]
    BadVersion(u8),

    #[error("timestamp {0} predates 2008")]
    TimestampTooOld(u32),

    #[error("sequence {seq} exceeds clock maximum {max}")]
    SequenceTooLarge { seq: u32, max: u32 },

    #[error("{count} beamlets exceeds bit-mode maximum {max}")]
    TooManyBeamlets { count: u8, max: u8 },

    #[error("slice count is {0}, expected 16")]
    WrongSliceCount(u8),

    #[error("source padding bits are non-zero (0x{0:02x})")]
    NonZeroPadding(u8),
}

/// Shared-memory ring failures.
#[derive(Debug, Error)]
pub enum RingError {
    #[error("failed to create ring segment on key 0x{key:x}: {source}")]
    Create { key: i32, source: io::Error },

    #[error("failed to attach to ring segment on key 0x{key:x}: {source}")]
    Attach { key: i32, source: io::Error },

    #[error("ring segment on key 0x{key:x} is not one of ours (bad magic)")]
    BadMagic { key: i32 },

    #[error("write of {len} bytes exceeds ring capacity of {capacity} bytes")]
    WriteTooLarge { len: usize, capacity: u64 },

    #[error("header record already written for this observation")]
    HeaderRewrite,

    #[error("header record of {len} bytes exceeds the metadata segment ({max} bytes)")]
    HeaderTooLarge { len: usize, max: usize },

    #[error("all {max} reader slots on key 0x{key:x} are taken")]
    ReaderSlots { key: i32, max: usize },

    #[error("{readers} reader(s) still attached after {timeout:?}; destroying anyway")]
    DetachTimeout { readers: u32, timeout: Duration },
}

/// Vectored-receive failures.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The socket timeout expired with no packet received.
    #[error("receive timed out with no packets")]
    Timeout,

    /// A datagram was larger than its scratch slot and got truncated.
    #[error("datagram {index} truncated to the {slot} byte slot")]
    Truncated { index: usize, slot: usize },

    #[error("recvmmsg failed: {0}")]
    Syscall(io::Error),
}

/// Observation-level failures surfaced by the capture scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("first packet rejected: {0}")]
    FirstPacket(#[from] HeaderError),

    /// Distinct non-fatal condition; fatal only under strict startup checks.
    #[error("first packet payload is all zeroes")]
    ZeroPayload,

    #[error("unable to peek at first packet: {0}")]
    Peek(io::Error),

    #[error("corrupt header in packet {index} of {count}: {source}")]
    CorruptHeader {
        index: usize,
        count: usize,
        source: HeaderError,
    },
}
