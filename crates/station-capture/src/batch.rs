//! Vectored packet reception.
//!
//! One `recvmmsg` call pulls up to a batch of packets into a contiguous
//! scratch region, one packet per fixed-stride slot. The scratch bytes, the
//! iovec array and the mmsghdr array are allocated exactly once per session;
//! the descriptor pointers are set at construction and never mutated, so the
//! arrays stay cache-resident across the whole observation.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::error::BatchError;

/// Batch receive state: scratch bytes plus the descriptor arrays feeding
/// `recvmmsg`. Owned by the capture scheduler for the session lifetime.
pub struct BatchBuffers {
    buf: Vec<u8>,
    /// Referenced only through the pointers held in `msgs`.
    #[allow(dead_code)]
    iovecs: Vec<libc::iovec>,
    msgs: Vec<libc::mmsghdr>,
    packet_size: usize,
    capacity: usize,
}

// The raw pointers in `iovecs`/`msgs` target our own heap allocations, which
// stay put when the struct moves between threads.
unsafe impl Send for BatchBuffers {}

impl BatchBuffers {
    /// Allocate scratch for `capacity` packets of `packet_size` bytes each.
    pub fn new(capacity: usize, packet_size: usize) -> Self {
        let mut buf = vec![0u8; capacity * packet_size];
        let mut iovecs: Vec<libc::iovec> = (0..capacity)
            .map(|i| libc::iovec {
                iov_base: buf[i * packet_size..].as_mut_ptr() as *mut libc::c_void,
                iov_len: packet_size,
            })
            .collect();
        let msgs: Vec<libc::mmsghdr> = (0..capacity)
            .map(|i| libc::mmsghdr {
                msg_hdr: libc::msghdr {
                    // No peer address, no ancillary data: just the payload
                    // into slot i.
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

        Self { buf, iovecs, msgs, packet_size, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Receive up to a full batch in one syscall.
    ///
    /// Short reads (fewer packets than the batch size) are returned as-is;
    /// whether to retry is the scheduler's call. A timeout with zero packets
    /// surfaces as [`BatchError::Timeout`]; any other receive failure is
    /// fatal.
    pub fn receive_batch(&mut self, fd: RawFd) -> Result<usize, BatchError> {
        let count = unsafe {
            libc::recvmmsg(
                fd,
                self.msgs.as_mut_ptr(),
                self.capacity as libc::c_uint,
                0,
                ptr::null_mut(),
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::WouldBlock
                || err.kind() == io::ErrorKind::TimedOut
            {
                Err(BatchError::Timeout)
            } else {
                Err(BatchError::Syscall(err))
            };
        }

        let count = count as usize;
        for index in 0..count {
            if self.msgs[index].msg_hdr.msg_flags & libc::MSG_TRUNC != 0 {
                return Err(BatchError::Truncated { index, slot: self.packet_size });
            }
        }
        Ok(count)
    }

    /// Slot `index` of the scratch region.
    pub fn packet(&self, index: usize) -> &[u8] {
        let start = index * self.packet_size;
        &self.buf[start..start + self.packet_size]
    }

    /// The first `count` slots as one contiguous byte run, ready for the
    /// ring write.
    pub fn filled(&self, count: usize) -> &[u8] {
        &self.buf[..count * self.packet_size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Socket, Type};
    use std::net::SocketAddr;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    /// Loopback socket with a short timeout; the library-level minimum of
    /// two seconds is a config rule, not a kernel one.
    fn test_socket(timeout: Duration) -> (Socket, u16) {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        socket.bind(&addr.into()).unwrap();
        socket.set_read_timeout(Some(timeout)).unwrap();
        let port = socket
            .local_addr()
            .unwrap()
            .as_socket()
            .unwrap()
            .port();
        (socket, port)
    }

    #[test]
    fn test_batch_fills_fixed_stride_slots() {
        let (socket, port) = test_socket(Duration::from_millis(500));
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        let packet_size = 64;
        let mut batch = BatchBuffers::new(8, packet_size);
        for i in 0u8..8 {
            sender
                .send_to(&vec![i + 1; packet_size], ("127.0.0.1", port))
                .unwrap();
        }

        let count = batch.receive_batch(socket.as_raw_fd()).unwrap();
        assert_eq!(count, 8);
        for i in 0..8 {
            assert!(batch.packet(i).iter().all(|b| *b == i as u8 + 1));
        }
        assert_eq!(batch.filled(8).len(), 8 * packet_size);
    }

    #[test]
    fn test_short_read_observable() {
        let (socket, port) = test_socket(Duration::from_millis(200));
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut batch = BatchBuffers::new(16, 32);
        for _ in 0..5 {
            sender.send_to(&[9u8; 32], ("127.0.0.1", port)).unwrap();
        }
        // recvmmsg gets the five queued packets, then the receive timeout
        // expires waiting for the sixth.
        let count = batch.receive_batch(socket.as_raw_fd()).unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_timeout_with_no_packets() {
        let (socket, _port) = test_socket(Duration::from_millis(100));
        let mut batch = BatchBuffers::new(4, 32);
        assert!(matches!(
            batch.receive_batch(socket.as_raw_fd()),
            Err(BatchError::Timeout)
        ));
    }

    #[test]
    fn test_oversized_datagram_truncated() {
        let (socket, port) = test_socket(Duration::from_millis(200));
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut batch = BatchBuffers::new(4, 32);
        sender.send_to(&[1u8; 64], ("127.0.0.1", port)).unwrap();
        assert!(matches!(
            batch.receive_batch(socket.as_raw_fd()),
            Err(BatchError::Truncated { index: 0, slot: 32 })
        ));
    }
}
