//! Process-shared ring buffers over System V shared memory.
//!
//! A recorder publishes into a pair of rings addressed by numeric key: the
//! data ring at `K` and a single-segment metadata ring at `K + 1` that holds
//! one observation header record. Exactly one writer attaches; up to
//! [`MAX_RING_READERS`] independent reader processes attach and consume on
//! their own clock through the control block's counters — no other shared
//! state exists between the processes.
//!
//! Memory layout of one segment pair member:
//!
//! ```text
//! [ control page (4096 B) | segment 0 | segment 1 | ... | segment m-1 ]
//! ```
//!
//! The writer owns `head` (total bytes published); each reader owns one
//! `reader_tail` slot (total bytes released). Bytes between the minimum
//! active tail and `head` are unreleased and never overwritten: when every
//! segment is unreleased the writer blocks, which is the designed
//! back-pressure — capture must not drop packets silently.

use std::io;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::RingError;

/// Marks a control page as one of ours.
const RING_MAGIC: u64 = 0x5354_4154_3152_4e47;
/// First page of the mapping, before segment 0.
const CONTROL_BYTES: usize = 4096;
/// Metadata ring: one segment of this many bytes.
pub const HEADER_SEGMENT_BYTES: usize = 4096;
pub const MAX_RING_READERS: usize = 8;

/// Reader-drain polling granularity during detach.
const DETACH_POLL: Duration = Duration::from_millis(100);
/// Writer back-pressure polling granularity.
const WRITE_POLL: Duration = Duration::from_micros(500);

pub const DEFAULT_SEGMENT_COUNT: u64 = 64;
pub const DEFAULT_BATCHES_PER_SEGMENT: u64 = 4;
pub const DEFAULT_CLEANUP_TIMEOUT_SECS: f64 = 30.0;

/// Ring half of the recorder configuration.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Data ring key; the metadata ring lives at `key + 1`.
    pub key: i32,
    pub segment_count: u64,
    /// Segment size expressed in receive batches, so a segment is always an
    /// integer multiple of `packet_size x batch_packets`.
    pub batches_per_segment: u64,
    pub num_readers: u32,
    /// Destroy and re-create a pre-existing ring on the same keys.
    pub force: bool,
    /// How long detach waits for readers to disconnect before destroying.
    pub cleanup_timeout_secs: f64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            key: crate::socket::DEFAULT_PORT as i32,
            segment_count: DEFAULT_SEGMENT_COUNT,
            batches_per_segment: DEFAULT_BATCHES_PER_SEGMENT,
            num_readers: 1,
            force: false,
            cleanup_timeout_secs: DEFAULT_CLEANUP_TIMEOUT_SECS,
        }
    }
}

/// Control page shared by the writer and every reader.
#[repr(C)]
struct RingControl {
    magic: u64,
    segment_count: u64,
    segment_bytes: u64,
    expected_readers: u32,
    _reserved: u32,
    /// Total bytes published. Monotonic; only the writer stores.
    head: AtomicU64,
    /// Non-zero once the writer has signalled end of data.
    end_of_data: AtomicU32,
    readers_attached: AtomicU32,
    reader_active: [AtomicU32; MAX_RING_READERS],
    /// Total bytes released per reader slot. Monotonic; one writer each.
    reader_tail: [AtomicU64; MAX_RING_READERS],
}

const _: () = assert!(std::mem::size_of::<RingControl>() <= CONTROL_BYTES);

// ─── SysV segment plumbing ───────────────────────────────────────────────────

/// One attached System V shared-memory segment.
struct ShmSegment {
    id: libc::c_int,
    base: *mut u8,
}

// The mapping is plain bytes plus atomics; access discipline lives above.
unsafe impl Send for ShmSegment {}

impl ShmSegment {
    fn create(key: i32, total: usize) -> Result<Self, RingError> {
        let id = unsafe { libc::shmget(key, total, libc::IPC_CREAT | libc::IPC_EXCL | 0o600) };
        if id == -1 {
            return Err(RingError::Create { key, source: io::Error::last_os_error() });
        }
        Self::map(id, key).map_err(|e| {
            unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
            e
        })
    }

    fn attach(key: i32) -> Result<Self, RingError> {
        let id = unsafe { libc::shmget(key, 0, 0o600) };
        if id == -1 {
            return Err(RingError::Attach { key, source: io::Error::last_os_error() });
        }
        Self::map(id, key)
    }

    fn map(id: libc::c_int, key: i32) -> Result<Self, RingError> {
        let base = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if base as isize == -1 {
            return Err(RingError::Attach { key, source: io::Error::last_os_error() });
        }
        Ok(Self { id, base: base as *mut u8 })
    }

    /// Mark the segment for destruction; it disappears once every process
    /// has detached, and the key becomes reusable immediately.
    fn destroy(&self) {
        unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe { libc::shmdt(self.base as *const libc::c_void) };
    }
}

fn is_exists(err: &RingError) -> bool {
    matches!(err, RingError::Create { source, .. }
        if source.raw_os_error() == Some(libc::EEXIST))
}

/// Connect to whatever currently lives on `key` and destroy it. A key with
/// nothing behind it is fine — there is simply nothing to reclaim.
fn reclaim(key: i32) {
    match ShmSegment::attach(key) {
        Ok(seg) => {
            tracing::warn!("destroying stale ring segment on key 0x{:x}", key);
            seg.destroy();
        }
        Err(_) => {
            tracing::debug!("no stale ring segment on key 0x{:x}", key);
        }
    }
}

// ─── Writer role ─────────────────────────────────────────────────────────────

/// The single writer of one ring.
pub struct RingWriter {
    seg: ShmSegment,
    capacity: u64,
    /// Writer-local copy of `head`; the control page is the source of truth
    /// for readers, this avoids an atomic load per write.
    head: u64,
}

impl RingWriter {
    pub fn create(
        key: i32,
        segment_count: u64,
        segment_bytes: u64,
        expected_readers: u32,
    ) -> Result<Self, RingError> {
        let capacity = segment_count * segment_bytes;
        let seg = ShmSegment::create(key, CONTROL_BYTES + capacity as usize)?;

        // Fresh SysV segments are zero-filled; the atomics start at rest and
        // only the descriptive fields need storing before the magic publishes
        // the page.
        unsafe {
            let ctl = seg.base as *mut RingControl;
            std::ptr::addr_of_mut!((*ctl).segment_count).write_volatile(segment_count);
            std::ptr::addr_of_mut!((*ctl).segment_bytes).write_volatile(segment_bytes);
            std::ptr::addr_of_mut!((*ctl).expected_readers).write_volatile(expected_readers);
            fence(Ordering::Release);
            std::ptr::addr_of_mut!((*ctl).magic).write_volatile(RING_MAGIC);
        }

        Ok(Self { seg, capacity, head: 0 })
    }

    fn control(&self) -> &RingControl {
        unsafe { &*(self.seg.base as *const RingControl) }
    }

    fn data(&self) -> *mut u8 {
        unsafe { self.seg.base.add(CONTROL_BYTES) }
    }

    /// Lowest byte position still unreleased by an attached reader. With no
    /// reader attached nothing has been released, so the writer may fill the
    /// ring exactly once before blocking.
    fn released_floor(&self) -> u64 {
        let ctl = self.control();
        let mut floor = u64::MAX;
        let mut any = false;
        for slot in 0..MAX_RING_READERS {
            if ctl.reader_active[slot].load(Ordering::Acquire) != 0 {
                floor = floor.min(ctl.reader_tail[slot].load(Ordering::Acquire));
                any = true;
            }
        }
        if any {
            floor
        } else {
            0
        }
    }

    /// Publish `buf` into the ring, blocking while every segment is
    /// unreleased (designed back-pressure). Returns the bytes accepted,
    /// which is always `buf.len()`.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, RingError> {
        let len = buf.len() as u64;
        if len > self.capacity {
            return Err(RingError::WriteTooLarge { len: buf.len(), capacity: self.capacity });
        }
        if len == 0 {
            return Ok(0);
        }

        while self.head + len - self.released_floor() > self.capacity {
            std::thread::sleep(WRITE_POLL);
        }

        let offset = (self.head % self.capacity) as usize;
        let first = buf.len().min(self.capacity as usize - offset);
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.data().add(offset), first);
            if first < buf.len() {
                std::ptr::copy_nonoverlapping(
                    buf.as_ptr().add(first),
                    self.data(),
                    buf.len() - first,
                );
            }
        }

        self.head += len;
        self.control().head.store(self.head, Ordering::Release);
        Ok(buf.len())
    }

    /// Signal that no further writes will occur in this session.
    pub fn mark_end_of_data(&self) {
        self.control().end_of_data.store(1, Ordering::Release);
    }

    pub fn readers_attached(&self) -> u32 {
        self.control().readers_attached.load(Ordering::Acquire)
    }

    pub fn bytes_written(&self) -> u64 {
        self.head
    }

    fn destroy(&self) {
        self.seg.destroy();
    }
}

// ─── Reader role ─────────────────────────────────────────────────────────────

/// One reader of a ring, normally an external process. A reader that
/// attaches mid-stream starts at the writer's current position.
pub struct RingReader {
    seg: ShmSegment,
    slot: usize,
    capacity: u64,
    tail: u64,
}

impl RingReader {
    pub fn attach(key: i32) -> Result<Self, RingError> {
        let seg = ShmSegment::attach(key)?;
        fence(Ordering::Acquire);
        let (capacity, slot, tail) = unsafe {
            let ctl = &*(seg.base as *const RingControl);
            if std::ptr::addr_of!(ctl.magic).read_volatile() != RING_MAGIC {
                return Err(RingError::BadMagic { key });
            }
            let capacity = ctl.segment_count * ctl.segment_bytes;

            let mut claimed = None;
            for slot in 0..MAX_RING_READERS {
                if ctl.reader_active[slot]
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    claimed = Some(slot);
                    break;
                }
            }
            let slot = claimed.ok_or(RingError::ReaderSlots { key, max: MAX_RING_READERS })?;
            let tail = ctl.head.load(Ordering::Acquire);
            ctl.reader_tail[slot].store(tail, Ordering::Release);
            ctl.readers_attached.fetch_add(1, Ordering::AcqRel);
            (capacity, slot, tail)
        };
        Ok(Self { seg, slot, capacity, tail })
    }

    fn control(&self) -> &RingControl {
        unsafe { &*(self.seg.base as *const RingControl) }
    }

    fn data(&self) -> *const u8 {
        unsafe { self.seg.base.add(CONTROL_BYTES) as *const u8 }
    }

    /// Bytes published but not yet released by this reader.
    pub fn available(&self) -> u64 {
        self.control().head.load(Ordering::Acquire) - self.tail
    }

    /// Copy up to `out.len()` available bytes and release them.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = (self.available() as usize).min(out.len());
        if n == 0 {
            return 0;
        }
        let offset = (self.tail % self.capacity) as usize;
        let first = n.min(self.capacity as usize - offset);
        unsafe {
            std::ptr::copy_nonoverlapping(self.data().add(offset), out.as_mut_ptr(), first);
            if first < n {
                std::ptr::copy_nonoverlapping(self.data(), out.as_mut_ptr().add(first), n - first);
            }
        }
        self.tail += n as u64;
        self.control().reader_tail[self.slot].store(self.tail, Ordering::Release);
        n
    }

    /// True once the writer has signalled end of data and every published
    /// byte has been released by this reader.
    pub fn end_of_data(&self) -> bool {
        self.control().end_of_data.load(Ordering::Acquire) != 0 && self.available() == 0
    }

    /// Ring attributes published in the control page.
    pub fn segment_count(&self) -> u64 {
        self.control().segment_count
    }

    pub fn segment_bytes(&self) -> u64 {
        self.control().segment_bytes
    }

    pub fn expected_readers(&self) -> u32 {
        self.control().expected_readers
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        let ctl = self.control();
        ctl.reader_active[self.slot].store(0, Ordering::Release);
        ctl.readers_attached.fetch_sub(1, Ordering::AcqRel);
    }
}

// ─── Publisher: the writer-side ring pair ────────────────────────────────────

/// Writer role over the data ring at `key` and the metadata ring at `key+1`.
pub struct RingPublisher {
    key: i32,
    data: RingWriter,
    meta: RingWriter,
    header_written: bool,
}

impl RingPublisher {
    /// Allocate both rings. If a segment already exists on either key and
    /// `force` is set, the stale pair is destroyed and creation retried once.
    pub fn attach_or_create(config: &RingConfig, segment_bytes: u64) -> Result<Self, RingError> {
        match Self::create_pair(config, segment_bytes) {
            Ok(publisher) => Ok(publisher),
            Err(err) if config.force && is_exists(&err) => {
                tracing::warn!(
                    "ring allocation on key 0x{:x} failed ({}); reclaiming and retrying",
                    config.key,
                    err
                );
                reclaim(config.key);
                reclaim(config.key + 1);
                Self::create_pair(config, segment_bytes)
            }
            Err(err) => Err(err),
        }
    }

    fn create_pair(config: &RingConfig, segment_bytes: u64) -> Result<Self, RingError> {
        let data = RingWriter::create(
            config.key,
            config.segment_count,
            segment_bytes,
            config.num_readers,
        )?;
        let meta = match RingWriter::create(
            config.key + 1,
            1,
            HEADER_SEGMENT_BYTES as u64,
            config.num_readers,
        ) {
            Ok(meta) => meta,
            Err(err) => {
                data.destroy();
                return Err(err);
            }
        };
        Ok(Self { key: config.key, data, meta, header_written: false })
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    /// Enqueue raw packet data; blocks under reader back-pressure.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, RingError> {
        self.data.write(bytes)
    }

    /// Enqueue the single observation header record on the metadata ring.
    pub fn write_header(&mut self, bytes: &[u8]) -> Result<(), RingError> {
        if self.header_written {
            return Err(RingError::HeaderRewrite);
        }
        if bytes.len() > HEADER_SEGMENT_BYTES {
            return Err(RingError::HeaderTooLarge { len: bytes.len(), max: HEADER_SEGMENT_BYTES });
        }
        self.meta.write(bytes)?;
        self.header_written = true;
        Ok(())
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.data.bytes_written()
    }

    /// Signal readers that no further data writes will occur.
    pub fn mark_end_of_data(&self) {
        self.data.mark_end_of_data();
        self.meta.mark_end_of_data();
    }

    /// Close the writer role: wait up to `timeout` for every reader to
    /// disconnect (polling at 100 ms), then destroy both rings. Destruction
    /// happens even on timeout; the error only reports the stragglers.
    pub fn detach(self, timeout: Duration) -> Result<(), RingError> {
        let deadline = Instant::now() + timeout;
        let mut readers = self.data.readers_attached() + self.meta.readers_attached();
        while readers != 0 && Instant::now() < deadline {
            std::thread::sleep(DETACH_POLL);
            readers = self.data.readers_attached() + self.meta.readers_attached();
        }

        self.data.destroy();
        self.meta.destroy();

        if readers != 0 {
            return Err(RingError::DetachTimeout { readers, timeout });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_key;

    fn small_config(key: i32) -> RingConfig {
        RingConfig {
            key,
            segment_count: 4,
            batches_per_segment: 1,
            num_readers: 1,
            force: false,
            cleanup_timeout_secs: 1.0,
        }
    }

    #[test]
    fn test_write_read_roundtrip() {
        let key = test_key(0x10);
        let mut publisher =
            RingPublisher::attach_or_create(&small_config(key), 1024).unwrap();
        let mut reader = RingReader::attach(key).unwrap();
        assert_eq!(reader.segment_count(), 4);
        assert_eq!(reader.segment_bytes(), 1024);

        let payload: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();
        assert_eq!(publisher.write(&payload).unwrap(), payload.len());

        let mut out = vec![0u8; payload.len()];
        assert_eq!(reader.available(), payload.len() as u64);
        assert_eq!(reader.read(&mut out), payload.len());
        assert_eq!(out, payload);

        drop(reader);
        publisher.detach(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_wraparound_preserves_bytes() {
        let key = test_key(0x12);
        // Capacity 4 KiB; write 3 x 1.5 KiB chunks so the third wraps.
        let mut publisher =
            RingPublisher::attach_or_create(&small_config(key), 1024).unwrap();
        let mut reader = RingReader::attach(key).unwrap();

        for round in 0u8..3 {
            let chunk = vec![round + 1; 1536];
            publisher.write(&chunk).unwrap();
            let mut out = vec![0u8; 1536];
            assert_eq!(reader.read(&mut out), 1536);
            assert_eq!(out, chunk);
        }

        drop(reader);
        publisher.detach(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_header_record_written_once() {
        let key = test_key(0x14);
        let mut publisher =
            RingPublisher::attach_or_create(&small_config(key), 1024).unwrap();
        let mut meta_reader = RingReader::attach(key + 1).unwrap();

        publisher.write_header(b"HDR_VERSION 1.0\n").unwrap();
        assert!(matches!(
            publisher.write_header(b"again"),
            Err(RingError::HeaderRewrite)
        ));

        let mut out = vec![0u8; 64];
        let n = meta_reader.read(&mut out);
        assert_eq!(&out[..n], b"HDR_VERSION 1.0\n");

        drop(meta_reader);
        publisher.detach(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_force_reclaims_stale_ring() {
        let key = test_key(0x16);
        // Leave a stale pair behind: drop without detach keeps the segments
        // alive in the kernel with no process attached.
        let stale = RingPublisher::attach_or_create(&small_config(key), 1024).unwrap();
        drop(stale);

        // Without force the keys are busy.
        assert!(matches!(
            RingPublisher::attach_or_create(&small_config(key), 1024),
            Err(RingError::Create { .. })
        ));

        let mut config = small_config(key);
        config.force = true;
        let publisher = RingPublisher::attach_or_create(&config, 1024).unwrap();
        publisher.detach(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_detach_destroys_rings() {
        let key = test_key(0x18);
        let publisher = RingPublisher::attach_or_create(&small_config(key), 1024).unwrap();
        publisher.detach(Duration::from_secs(1)).unwrap();

        assert!(RingReader::attach(key).is_err());
        assert!(RingReader::attach(key + 1).is_err());
    }

    #[test]
    fn test_end_of_data_after_last_byte() {
        let key = test_key(0x1a);
        let mut publisher =
            RingPublisher::attach_or_create(&small_config(key), 1024).unwrap();
        let mut reader = RingReader::attach(key).unwrap();

        publisher.write(&[7u8; 512]).unwrap();
        publisher.mark_end_of_data();
        assert!(!reader.end_of_data(), "bytes still pending");

        let mut out = vec![0u8; 512];
        reader.read(&mut out);
        assert!(reader.end_of_data());

        drop(reader);
        publisher.detach(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_backpressure_blocks_writer_without_loss() {
        let key = test_key(0x1c);
        let mut config = small_config(key);
        config.segment_count = 2;
        // Capacity 2 KiB, payload 8 KiB: the writer must block on the slow
        // reader and every byte must still come through in order.
        let mut publisher = RingPublisher::attach_or_create(&config, 1024).unwrap();
        let mut reader = RingReader::attach(key).unwrap();

        let writer = std::thread::spawn(move || {
            for round in 0u8..8 {
                let chunk = vec![round; 1024];
                publisher.write(&chunk).unwrap();
            }
            publisher
        });

        let mut received = Vec::new();
        let mut out = vec![0u8; 1024];
        while received.len() < 8 * 1024 {
            let n = reader.read(&mut out);
            if n == 0 {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            received.extend_from_slice(&out[..n]);
            // Slow consumer; forces the ring full.
            std::thread::sleep(Duration::from_millis(20));
        }

        let publisher = writer.join().unwrap();
        for (i, byte) in received.iter().enumerate() {
            assert_eq!(*byte, (i / 1024) as u8, "byte {}", i);
        }

        drop(reader);
        publisher.detach(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_detach_times_out_with_attached_reader() {
        let key = test_key(0x1e);
        let publisher = RingPublisher::attach_or_create(&small_config(key), 1024).unwrap();
        let reader = RingReader::attach(key).unwrap();

        let started = Instant::now();
        let result = publisher.detach(Duration::from_millis(300));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(matches!(result, Err(RingError::DetachTimeout { readers: 1, .. })));
        drop(reader);
    }
}
