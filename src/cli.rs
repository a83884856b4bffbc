//! CLI definitions for the recorder.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "stationrec",
    version,
    about = "Record a station UDP feed into a shared ring buffer\n\nOne instance binds one port, waits for the scheduled start packet, and publishes raw packets for independent ring readers.",
    long_about = None
)]
pub struct Cli {
    /// UDP port to record
    #[clap(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Output ring buffer key (metadata ring lives at key+1)
    #[clap(short = 'k', long = "key")]
    pub key: Option<i32>,

    /// Packets per receive operation
    #[clap(short = 'n', long = "batch")]
    pub batch: Option<usize>,

    /// Number of segments in the ring
    #[clap(short = 'm', long = "segments")]
    pub segments: Option<u64>,

    /// Target ring length in seconds of data (sets the segment size)
    #[clap(short = 's', long = "ring-seconds")]
    pub ring_seconds: Option<f64>,

    /// Number of reader processes that will attach
    #[clap(short = 'r', long = "readers")]
    pub readers: Option<u32>,

    /// Allocate the ring immediately for this packet size (recommended: 7824)
    #[clap(short = 'e', long = "packet-size")]
    pub packet_size: Option<usize>,

    /// Force-allocate: destroy any existing ring on the given keys first
    #[clap(short = 'f', long = "force")]
    pub force: bool,

    /// ISO-8601 start time (YYYY-MM-DDTHH:MM:SS, UTC; default: now)
    #[clap(short = 'S', long = "start")]
    pub start: Option<String>,

    /// ISO-8601 end time (overrides -t)
    #[clap(short = 'T', long = "end")]
    pub end: Option<String>,

    /// Observation length in seconds
    #[clap(short = 't', long = "length")]
    pub length: Option<f64>,

    /// Sleep until this many seconds before the start time
    #[clap(short = 'w', long = "min-startup")]
    pub min_startup: Option<f64>,

    /// Ring writes between status log blocks
    #[clap(short = 'l', long = "writes-per-log")]
    pub writes_per_log: Option<u32>,

    /// Socket receive timeout in seconds (must be greater than 2)
    #[clap(short = 'z', long = "timeout")]
    pub timeout: Option<f64>,

    /// Skip the end-of-observation time sanity checks
    #[clap(short = 'C', long = "no-time-check")]
    pub no_time_check: bool,

    /// TOML file providing defaults for any of the above
    #[clap(long = "config")]
    pub config: Option<PathBuf>,
}
