//! fill-buffer — replay a raw station packet capture.
//!
//! Reads one file per port and either writes the bytes straight into ring
//! buffers (`-u 0,...`) or transmits them as UDP packets via `sendmmsg`.
//! This is the test fixture that stands in for a live station feed: a
//! recorded session replayed through here into a fresh recorder reproduces
//! the original ring payload byte for byte.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::Read;
use std::net::ToSocketAddrs;
use std::ptr;
use std::time::Duration;

use station_capture::{NetworkConfig, RingConfig, RingPublisher, SocketHandle, MAX_PACKET_LEN};

const PACKET_SIZE: usize = MAX_PACKET_LEN;

#[derive(Parser)]
#[clap(
    name = "fill-buffer",
    version,
    about = "Replay a raw station packet file to a UDP port or directly into a ring buffer"
)]
struct Cli {
    /// Target port and per-port offset as "port,offset". Port 0 writes
    /// directly into the ring buffers selected by -k instead.
    #[clap(short = 'u', long = "udp", default_value = "16130,1")]
    udp: String,

    /// Target host for UDP replay
    #[clap(short = 'H', long = "host", default_value = "127.0.0.1")]
    host: String,

    /// Input file template; "{}" expands to the port index
    #[clap(short = 'i', long = "input")]
    input: String,

    /// Packets loaded and sent per operation
    #[clap(short = 'p', long = "packets", default_value_t = 1024)]
    packets: usize,

    /// Number of target ports
    #[clap(short = 'n', long = "ports", default_value_t = 1)]
    ports: usize,

    /// Ring key and per-port offset as "key,offset" (ring mode only)
    #[clap(short = 'k', long = "key", default_value = "16130,10")]
    key: String,

    /// Stop after this many packets per port (default: the whole file)
    #[clap(short = 't', long = "total")]
    total: Option<u64>,

    /// Milliseconds to wait between operations; an upper bound on throughput
    #[clap(short = 'w', long = "wait", default_value_t = 1)]
    wait_ms: u64,
}

fn parse_pair(text: &str, flag: &str) -> Result<(i32, i32)> {
    let (first, second) = text.split_once(',').unwrap_or((text, "1"));
    let first = first
        .trim()
        .parse()
        .with_context(|| format!("bad {} value '{}'", flag, text))?;
    let second = second
        .trim()
        .parse()
        .with_context(|| format!("bad {} offset '{}'", flag, text))?;
    Ok((first, second))
}

fn input_path(template: &str, index: usize) -> String {
    if template.contains("{}") {
        template.replacen("{}", &index.to_string(), 1)
    } else {
        template.to_string()
    }
}

/// Scratch and descriptor arrays for vectored transmission, the sending
/// mirror of the recorder's receive batch.
struct SendBatch {
    socket: SocketHandle,
    buf: Vec<u8>,
    /// Referenced only through the pointers held in `msgs`.
    #[allow(dead_code)]
    iovecs: Vec<libc::iovec>,
    msgs: Vec<libc::mmsghdr>,
}

impl SendBatch {
    fn new(socket: SocketHandle, capacity: usize) -> Self {
        let mut buf = vec![0u8; capacity * PACKET_SIZE];
        let mut iovecs: Vec<libc::iovec> = (0..capacity)
            .map(|i| libc::iovec {
                iov_base: buf[i * PACKET_SIZE..].as_mut_ptr() as *mut libc::c_void,
                iov_len: PACKET_SIZE,
            })
            .collect();
        let msgs: Vec<libc::mmsghdr> = (0..capacity)
            .map(|i| libc::mmsghdr {
                msg_hdr: libc::msghdr {
                    msg_name: ptr::null_mut(),
                    msg_namelen: 0,
                    msg_iov: &mut iovecs[i],
                    msg_iovlen: 1,
                    msg_control: ptr::null_mut(),
                    msg_controllen: 0,
                    msg_flags: 0,
                },
                msg_len: 0,
            })
            .collect();
        Self { socket, buf, iovecs, msgs }
    }

    fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Transmit the first `count` packet slots in one syscall.
    fn send(&mut self, count: usize) -> Result<usize> {
        let sent = unsafe {
            libc::sendmmsg(
                self.socket.as_raw_fd(),
                self.msgs.as_mut_ptr(),
                count as libc::c_uint,
                0,
            )
        };
        if sent < 0 {
            bail!(
                "sendmmsg to port {} failed: {}",
                self.socket.port(),
                std::io::Error::last_os_error()
            );
        }
        Ok(sent as usize)
    }
}

enum Target {
    Ring { publisher: RingPublisher, chunk: Vec<u8> },
    Udp(SendBatch),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let (port, port_offset) = parse_pair(&cli.udp, "-u")?;
    let (key, key_offset) = parse_pair(&cli.key, "-k")?;
    let ring_mode = port == 0;
    let total = cli.total.unwrap_or(u64::MAX);
    let chunk_bytes = cli.packets * PACKET_SIZE;

    tracing::info!(
        "replaying {} file(s) matching '{}', {} packets per operation",
        cli.ports,
        cli.input,
        cli.packets
    );

    let mut files = Vec::with_capacity(cli.ports);
    let mut targets = Vec::with_capacity(cli.ports);

    for index in 0..cli.ports {
        let path = input_path(&cli.input, index);
        let file =
            File::open(&path).with_context(|| format!("input file '{}' does not exist", path))?;
        files.push(file);

        if ring_mode {
            let ring_key = key + key_offset * index as i32;
            tracing::info!("writing port {} directly into ring 0x{:x}", index, ring_key);
            let config = RingConfig {
                key: ring_key,
                segment_count: 32,
                num_readers: 1,
                ..RingConfig::default()
            };
            // Segments hold four operations' worth of packets.
            let publisher =
                RingPublisher::attach_or_create(&config, 4 * chunk_bytes as u64)?;
            targets.push(Target::Ring { publisher, chunk: vec![0u8; chunk_bytes] });
        } else {
            let target_port = u16::try_from(port + port_offset * index as i32)
                .context("port/offset combination leaves u16 range")?;
            tracing::info!("transmitting port {} to {}:{}", index, cli.host, target_port);
            let socket = SocketHandle::open(&NetworkConfig {
                port: target_port,
                buffer_bytes: 64 * 1024,
                bind: false,
                ..NetworkConfig::default()
            })?;
            let addr = (cli.host.as_str(), target_port)
                .to_socket_addrs()
                .with_context(|| format!("failed to resolve host '{}'", cli.host))?
                .next()
                .with_context(|| format!("host '{}' resolved to no addresses", cli.host))?;
            socket
                .inner()
                .connect(&addr.into())
                .with_context(|| format!("unable to connect to {}", addr))?;
            targets.push(Target::Udp(SendBatch::new(socket, cli.packets)));
        }
    }

    let mut packet_count = 0u64;
    let mut full_reads = true;

    while packet_count < total && full_reads {
        for (index, (file, target)) in files.iter_mut().zip(targets.iter_mut()).enumerate() {
            let (read_bytes, written_packets) = match target {
                Target::Ring { publisher, chunk } => {
                    let read_bytes = read_chunk(file, chunk)?;
                    let written = publisher.write(&chunk[..read_bytes])?;
                    (read_bytes, written / PACKET_SIZE)
                }
                Target::Udp(batch) => {
                    let read_bytes = read_chunk(file, batch.buffer_mut())?;
                    let whole_packets = read_bytes / PACKET_SIZE;
                    if read_bytes % PACKET_SIZE != 0 {
                        tracing::warn!(
                            "port {}: trailing {} bytes are not a whole packet; dropped",
                            index,
                            read_bytes % PACKET_SIZE
                        );
                    }
                    let sent = if whole_packets > 0 { batch.send(whole_packets)? } else { 0 };
                    if sent < whole_packets {
                        tracing::warn!(
                            "port {}: sent {} of {} packets — is anything listening?",
                            index,
                            sent,
                            whole_packets
                        );
                    }
                    (read_bytes, sent)
                }
            };

            if read_bytes < chunk_bytes {
                tracing::info!("port {}: short read, likely EOF; finishing up", index);
                full_reads = false;
            }
            if index == 0 {
                packet_count += written_packets as u64;
            }
            tracing::info!("port {}: replayed {} packets", index, written_packets);
        }
        std::thread::sleep(Duration::from_millis(cli.wait_ms));
    }

    for target in targets {
        if let Target::Ring { publisher, .. } = target {
            publisher.mark_end_of_data();
            if let Err(err) = publisher.detach(Duration::from_secs(5)) {
                tracing::warn!("ring teardown: {}", err);
            }
        }
    }
    tracing::info!("replayed {} packets per port", packet_count);
    Ok(())
}

/// Fill `buf` from `file`, tolerating short reads mid-stream.
fn read_chunk(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        assert_eq!(parse_pair("16130,1", "-u").unwrap(), (16130, 1));
        assert_eq!(parse_pair("0", "-u").unwrap(), (0, 1));
        assert_eq!(parse_pair("4096, 10", "-k").unwrap(), (4096, 10));
        assert!(parse_pair("x,1", "-u").is_err());
    }

    #[test]
    fn test_input_path_template() {
        assert_eq!(input_path("udp_1613{}.raw", 2), "udp_16132.raw");
        assert_eq!(input_path("capture.raw", 2), "capture.raw");
    }
}
