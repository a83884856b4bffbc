//! Station packet header codec.
//!
//! Every packet on the feed starts with a fixed 16-byte header:
//!
//! ```text
//! byte  0      protocol version (must be 3)
//! byte  1      source bits: error(0), clock(1), bit-mode(2-3), padding(4-7)
//! bytes 2-5    reserved
//! byte  6      beamlets on this port
//! byte  7      time slices per packet (must be 16)
//! bytes 8-11   timestamp, seconds since the Unix epoch (LE u32)
//! bytes 12-15  intra-second sequence counter (LE u32)
//! ```
//!
//! [`HeaderView`] is a zero-copy view over those 16 bytes; parsing and
//! validation never allocate. The derived packet number is the recorder's
//! canonical time coordinate and is strictly monotonic across the real
//! stream (one packet advances `sequence` by one slice count, i.e. 16).

use crate::error::HeaderError;

pub const HEADER_LEN: usize = 16;
pub const PROTOCOL_VERSION: u8 = 3;
pub const SLICES_PER_PACKET: u8 = 16;
/// Complex X/Y polarisation pairs per sample, 4 bytes at 8-bit depth.
pub const POLS_PER_SAMPLE: u32 = 4;
/// 2008-01-01T00:00:00Z; no station produced data before this.
pub const EPOCH_2008: u32 = 1_199_145_600;
/// Largest possible packet: 16 + 122 beamlets x 16 slices x 4 bytes.
pub const MAX_PACKET_LEN: usize = 7_824;

/// Clock-dependent sequence maxima: `clock_hz / 1024` samples per second.
pub const MAX_SEQUENCE_200MHZ: u32 = 195_313;
pub const MAX_SEQUENCE_160MHZ: u32 = 156_250;

#[inline]
pub fn max_sequence(clock_200mhz: bool) -> u32 {
    if clock_200mhz {
        MAX_SEQUENCE_200MHZ
    } else {
        MAX_SEQUENCE_160MHZ
    }
}

/// Beamlet ceiling per sample bit-mode (16/8/4-bit). The reserved fourth
/// encoding admits no beamlets at all, so it can never validate.
#[inline]
pub fn max_beamlets(bit_mode: u8) -> u8 {
    match bit_mode {
        0 => 61,
        1 => 122,
        2 => 244,
        _ => 0,
    }
}

/// Bytes per beamlet-slice: `4 / width_factor` with factors 0.5, 1, 2.
#[inline]
fn sample_bytes(bit_mode: u8) -> u32 {
    match bit_mode {
        0 => 8,
        1 => 4,
        2 => 2,
        _ => 0,
    }
}

/// Nominal packets per second for a clock mode (`clock_hz / 1024 / 16`).
#[inline]
pub fn packet_rate(clock_200mhz: bool) -> f64 {
    let clock_hz = if clock_200mhz { 200e6 } else { 160e6 };
    clock_hz / 1024.0 / 16.0
}

/// Monotonic packet number from raw header fields.
///
/// `((T * 1_000_000 * (160 + 40c) + 512) / 1024 + S) / 16`, 64-bit integer
/// arithmetic throughout.
#[inline]
pub fn packet_number(timestamp: u32, sequence: u32, clock_200mhz: bool) -> u64 {
    let clock = clock_200mhz as u64;
    ((timestamp as u64 * 1_000_000 * (160 + 40 * clock) + 512) / 1024 + sequence as u64) / 16
}

/// First valid packet number for a clock mode (the 2008 epoch).
#[inline]
pub fn epoch_packet(clock_200mhz: bool) -> u64 {
    packet_number(EPOCH_2008, 0, clock_200mhz)
}

/// Zero-copy view over the 16 leading header bytes of a station packet.
#[derive(Debug, Clone, Copy)]
pub struct HeaderView<'a> {
    raw: &'a [u8; HEADER_LEN],
}

impl<'a> HeaderView<'a> {
    /// Interpret the first 16 bytes of `buffer` as a station header.
    pub fn parse(buffer: &'a [u8]) -> Result<Self, HeaderError> {
        let raw: &[u8; HEADER_LEN] = buffer
            .get(..HEADER_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(HeaderError::Truncated(buffer.len()))?;
        Ok(Self { raw })
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.raw[0]
    }

    #[inline]
    pub fn error_bit(&self) -> bool {
        self.raw[1] & 0x01 != 0
    }

    /// Clock mode: false = 160 MHz, true = 200 MHz.
    #[inline]
    pub fn clock_200mhz(&self) -> bool {
        self.raw[1] & 0x02 != 0
    }

    /// Sample bit-mode: 0 = 16-bit, 1 = 8-bit, 2 = 4-bit.
    #[inline]
    pub fn bit_mode(&self) -> u8 {
        (self.raw[1] >> 2) & 0b11
    }

    /// The two padding fields of the source byte (bits 4-7), must be zero.
    #[inline]
    pub fn padding(&self) -> u8 {
        self.raw[1] & 0xf0
    }

    #[inline]
    pub fn beamlets(&self) -> u8 {
        self.raw[6]
    }

    #[inline]
    pub fn slices(&self) -> u8 {
        self.raw[7]
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        u32::from_le_bytes([self.raw[8], self.raw[9], self.raw[10], self.raw[11]])
    }

    #[inline]
    pub fn sequence(&self) -> u32 {
        u32::from_le_bytes([self.raw[12], self.raw[13], self.raw[14], self.raw[15]])
    }

    /// Sanity-check every header field. Pure and side-effect-free.
    pub fn validate(&self) -> Result<(), HeaderError> {
        if self.error_bit() {
            return Err(HeaderError::ErrorBit);
        }
        if self.version() != PROTOCOL_VERSION {
            return Err(HeaderError::BadVersion(self.version()));
        }
        if self.timestamp() < EPOCH_2008 {
            return Err(HeaderError::TimestampTooOld(self.timestamp()));
        }
        let max_seq = max_sequence(self.clock_200mhz());
        if self.sequence() > max_seq {
            return Err(HeaderError::SequenceTooLarge {
                seq: self.sequence(),
                max: max_seq,
            });
        }
        let max_beam = max_beamlets(self.bit_mode());
        if self.beamlets() > max_beam {
            return Err(HeaderError::TooManyBeamlets {
                count: self.beamlets(),
                max: max_beam,
            });
        }
        if self.slices() != SLICES_PER_PACKET {
            return Err(HeaderError::WrongSliceCount(self.slices()));
        }
        if self.padding() != 0 {
            return Err(HeaderError::NonZeroPadding(self.padding()));
        }
        Ok(())
    }

    /// Monotonic packet number derived from (timestamp, sequence, clock).
    #[inline]
    pub fn packet_number(&self) -> u64 {
        packet_number(self.timestamp(), self.sequence(), self.clock_200mhz())
    }

    /// Payload size implied by the header: `slices x beamlets x sample bytes`.
    #[inline]
    pub fn payload_bytes(&self) -> u32 {
        self.slices() as u32 * self.beamlets() as u32 * sample_bytes(self.bit_mode())
    }

    /// Total on-wire packet size, header included.
    #[inline]
    pub fn packet_bytes(&self) -> usize {
        HEADER_LEN + self.payload_bytes() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::build_packet;

    #[test]
    fn test_parse_roundtrip() {
        let pkt = build_packet(1_600_000_000, 1024, true, 1, 4);
        let hdr = HeaderView::parse(&pkt).unwrap();
        assert_eq!(hdr.version(), 3);
        assert!(hdr.clock_200mhz());
        assert_eq!(hdr.bit_mode(), 1);
        assert_eq!(hdr.beamlets(), 4);
        assert_eq!(hdr.slices(), 16);
        assert_eq!(hdr.timestamp(), 1_600_000_000);
        assert_eq!(hdr.sequence(), 1024);
        assert!(hdr.validate().is_ok());

        // Re-parsing the same 16 bytes yields the same packet number.
        let again = HeaderView::parse(&pkt[..HEADER_LEN]).unwrap();
        assert_eq!(again.packet_number(), hdr.packet_number());
    }

    #[test]
    fn test_truncated_buffer() {
        assert_eq!(
            HeaderView::parse(&[0u8; 8]).unwrap_err(),
            HeaderError::Truncated(8)
        );
    }

    #[test]
    fn test_packet_number_epoch() {
        // ((1199145600 * 1e6 * 200 + 512) / 1024 + 0) / 16
        assert_eq!(packet_number(EPOCH_2008, 0, true), 14_638_007_812_500);
        assert_eq!(packet_number(EPOCH_2008, 0, false), 11_710_406_250_000);
        assert_eq!(epoch_packet(true), 14_638_007_812_500);
    }

    #[test]
    fn test_packet_number_slice_stride() {
        // One packet carries 16 slices, so consecutive packets inside a
        // second advance `sequence` by 16 and the packet number by exactly 1.
        let ts = 1_600_000_000;
        for clock in [false, true] {
            let mut prev = packet_number(ts, 0, clock);
            for seq in (16..16 * 64).step_by(16) {
                let n = packet_number(ts, seq, clock);
                assert_eq!(n, prev + 1, "seq {} clock {}", seq, clock);
                prev = n;
            }
        }
    }

    #[test]
    fn test_packet_number_monotonic_across_seconds() {
        let last_in_second = packet_number(1_600_000_000, 195_296, true);
        let first_in_next = packet_number(1_600_000_001, 0, true);
        assert!(first_in_next > last_in_second);
    }

    #[test]
    fn test_validate_error_bit() {
        let mut pkt = build_packet(1_600_000_000, 0, true, 1, 4);
        pkt[1] |= 0x01;
        let hdr = HeaderView::parse(&pkt).unwrap();
        assert_eq!(hdr.validate().unwrap_err(), HeaderError::ErrorBit);
    }

    #[test]
    fn test_validate_bad_version() {
        let mut pkt = build_packet(1_600_000_000, 0, true, 1, 4);
        pkt[0] = 2;
        let hdr = HeaderView::parse(&pkt).unwrap();
        assert_eq!(hdr.validate().unwrap_err(), HeaderError::BadVersion(2));
    }

    #[test]
    fn test_validate_timestamp_too_old() {
        let pkt = build_packet(EPOCH_2008 - 1, 0, true, 1, 4);
        let hdr = HeaderView::parse(&pkt).unwrap();
        assert_eq!(
            hdr.validate().unwrap_err(),
            HeaderError::TimestampTooOld(EPOCH_2008 - 1)
        );
    }

    #[test]
    fn test_validate_sequence_clock_dependent() {
        // 180_000 is fine on the 200 MHz clock but out of range at 160 MHz.
        let fast = build_packet(1_600_000_000, 180_000, true, 1, 4);
        assert!(HeaderView::parse(&fast).unwrap().validate().is_ok());

        let slow = build_packet(1_600_000_000, 180_000, false, 1, 4);
        assert_eq!(
            HeaderView::parse(&slow).unwrap().validate().unwrap_err(),
            HeaderError::SequenceTooLarge {
                seq: 180_000,
                max: MAX_SEQUENCE_160MHZ
            }
        );
    }

    #[test]
    fn test_validate_beamlets_bit_mode_dependent() {
        // 100 beamlets fits 8-bit mode (max 122) but not 16-bit mode (max 61).
        let wide = build_packet(1_600_000_000, 0, true, 1, 100);
        assert!(HeaderView::parse(&wide).unwrap().validate().is_ok());

        let mut narrow = build_packet(1_600_000_000, 0, true, 1, 100);
        narrow[1] = (narrow[1] & !0b1100) | (0 << 2);
        assert_eq!(
            HeaderView::parse(&narrow).unwrap().validate().unwrap_err(),
            HeaderError::TooManyBeamlets { count: 100, max: 61 }
        );
    }

    #[test]
    fn test_validate_slice_count() {
        let mut pkt = build_packet(1_600_000_000, 0, true, 1, 4);
        pkt[7] = 15;
        assert_eq!(
            HeaderView::parse(&pkt).unwrap().validate().unwrap_err(),
            HeaderError::WrongSliceCount(15)
        );
    }

    #[test]
    fn test_validate_padding() {
        let mut pkt = build_packet(1_600_000_000, 0, true, 1, 4);
        pkt[1] |= 0x30;
        assert_eq!(
            HeaderView::parse(&pkt).unwrap().validate().unwrap_err(),
            HeaderError::NonZeroPadding(0x30)
        );
    }

    #[test]
    fn test_payload_bytes_per_bit_mode() {
        // 16-bit: 61 beamlets x 16 slices x 8 bytes + header = 7824.
        let b16 = build_packet(1_600_000_000, 0, true, 0, 61);
        assert_eq!(HeaderView::parse(&b16).unwrap().packet_bytes(), MAX_PACKET_LEN);

        // 8-bit: 122 x 16 x 4 + 16 = 7824.
        let b8 = build_packet(1_600_000_000, 0, true, 1, 122);
        assert_eq!(HeaderView::parse(&b8).unwrap().packet_bytes(), MAX_PACKET_LEN);

        // 4-bit: 244 x 16 x 2 + 16 = 7824.
        let b4 = build_packet(1_600_000_000, 0, true, 2, 244);
        assert_eq!(HeaderView::parse(&b4).unwrap().packet_bytes(), MAX_PACKET_LEN);
    }

    #[test]
    fn test_packet_rate() {
        assert!((packet_rate(true) - 12_207.03125).abs() < 1e-6);
        assert!((packet_rate(false) - 9_765.625).abs() < 1e-6);
    }
}
