//! Decoder for the Frontline air-interface framing.
//!
//! The sniff firmware delivers captured baseband traffic wrapped in ordinary
//! HCI ACL data packets. Inside the ACL envelope sit one or more Frontline
//! frames (the firmware batches fragments into a single read), each a fixed
//! header followed by the raw air payload. The header packs the baseband
//! packet type, the piconet clock, the link role and the payload header
//! (LLID + length) into a handful of bit fields.

use nom_derive::{Nom, Parse};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use thiserror::Error;

use crate::hci::HCI_ACLDATA_PKT;

/// Header length reported by BlueCore 2 firmware.
pub const HLEN_BC2: u8 = 14;
/// Header length reported by BlueCore 4 firmware (one pad byte).
pub const HLEN_BC4: u8 = 15;

/// LLID value marking LMP control traffic.
pub const LLID_LMP: u8 = 3;

const FP_TYPE_SHIFT: u8 = 3;
const FP_TYPE_MASK: u8 = 0xF;
const FP_ADDR_MASK: u8 = 0x7;
const FP_LEN_SHIFT: u16 = 3;
const FP_LEN_LLID_MASK: u16 = 0x3;
const FP_CLOCK_MASK: u32 = 0x0FFF_FFFF;
const FP_STATUS_SHIFT: u32 = 28;
const FP_SLAVE_MASK: u32 = 0x8000_0000;

/// Baseband packet types carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum PacketType {
    Null = 0,
    Poll = 1,
    Fhs = 2,
    Dm1 = 3,
    Dh1 = 4,
    Hv1 = 5,
    Hv2 = 6,
    Hv3 = 7,
    Dv = 8,
    Aux1 = 9,
    Dm3 = 10,
    Dh3 = 11,
    Dm5 = 14,
    Dh5 = 15,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("not an ACL data packet (tag 0x{0:02X})")]
    UnexpectedPacketType(u8),

    #[error("ACL envelope truncated ({0} bytes)")]
    TruncatedEnvelope(usize),

    #[error("ACL length mismatch (declared {declared}, remaining {actual})")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame header truncated ({0} bytes remaining)")]
    TruncatedHeader(usize),

    #[error("unknown header length {0}")]
    UnknownHeaderLength(u8),

    #[error("payload overruns read buffer (payload {declared}, remaining {remaining})")]
    PayloadOverrun { declared: usize, remaining: usize },

    #[error("empty LMP payload")]
    EmptyPdu,

    #[error("LMP extended opcode byte missing")]
    TruncatedExtendedOpcode,
}

/// The fixed Frontline frame header, as laid out on the wire.
#[derive(Nom, Debug, Clone, Copy)]
#[nom(LittleEndian)]
pub struct FrontlineHeader {
    pub hlen: u8,
    pub clock: u32,
    pub hdr0: u8,
    pub len: u16,
    pub timer: u32,
    pub chan: u8,
    pub seq: u8,
}

impl FrontlineHeader {
    /// Size of the packed header struct. `hlen` values larger than this
    /// (BC4) carry pad bytes between the struct and the payload.
    pub const LENGTH: usize = 14;

    /// Baseband packet type bits of `hdr0`.
    pub fn ptype(&self) -> u8 {
        (self.hdr0 >> FP_TYPE_SHIFT) & FP_TYPE_MASK
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.ptype())
    }

    /// Active member address bits of `hdr0`.
    pub fn addr(&self) -> u8 {
        self.hdr0 & FP_ADDR_MASK
    }

    /// Declared payload length.
    pub fn payload_len(&self) -> usize {
        (self.len >> FP_LEN_SHIFT) as usize
    }

    /// Logical link id of the payload.
    pub fn llid(&self) -> u8 {
        (self.len & FP_LEN_LLID_MASK) as u8
    }

    /// The 28-bit piconet clock.
    pub fn clock(&self) -> u32 {
        self.clock & FP_CLOCK_MASK
    }

    /// Status nibble above the clock bits.
    pub fn status(&self) -> u32 {
        self.clock >> FP_STATUS_SHIFT
    }

    /// True if the frame was sent by the piconet master.
    pub fn is_master(&self) -> bool {
        self.clock & FP_SLAVE_MASK == 0
    }
}

/// One decoded Frontline frame: header plus its borrowed payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct FrontlineFrame<'a> {
    pub header: FrontlineHeader,
    pub payload: &'a [u8],
}

/// Validates the outer ACL envelope of one raw read and returns the
/// Frontline frame bytes inside it.
pub fn strip_acl_envelope(buf: &[u8]) -> Result<&[u8], DecodeError> {
    let (&tag, rest) = buf
        .split_first()
        .ok_or(DecodeError::TruncatedEnvelope(0))?;
    if tag != HCI_ACLDATA_PKT {
        return Err(DecodeError::UnexpectedPacketType(tag));
    }
    if rest.len() < 4 {
        return Err(DecodeError::TruncatedEnvelope(buf.len()));
    }
    let dlen = u16::from_le_bytes([rest[2], rest[3]]) as usize;
    let frames = &rest[4..];
    if dlen != frames.len() {
        return Err(DecodeError::LengthMismatch {
            declared: dlen,
            actual: frames.len(),
        });
    }
    Ok(frames)
}

fn parse_frame(buf: &[u8]) -> Result<(&[u8], FrontlineFrame<'_>), DecodeError> {
    let (rest, header) =
        FrontlineHeader::parse(buf).map_err(|_| DecodeError::TruncatedHeader(buf.len()))?;
    let pad = match header.hlen {
        HLEN_BC2 => 0,
        HLEN_BC4 => 1,
        other => return Err(DecodeError::UnknownHeaderLength(other)),
    };
    let plen = header.payload_len();
    if rest.len() < pad + plen {
        return Err(DecodeError::PayloadOverrun {
            declared: plen,
            remaining: rest.len().saturating_sub(pad),
        });
    }
    let payload = &rest[pad..pad + plen];
    Ok((&rest[pad + plen..], FrontlineFrame { header, payload }))
}

/// Iterator over the firmware-concatenated frames in one read buffer.
///
/// Every step is bounds-checked against the remaining buffer. A malformed
/// frame yields a single `Err` and discards the rest of the buffer; the
/// capture session then carries on with the next read.
pub struct Fragments<'a> {
    buf: &'a [u8],
}

impl<'a> Fragments<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Fragments { buf }
    }
}

impl<'a> Iterator for Fragments<'a> {
    type Item = Result<FrontlineFrame<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        match parse_frame(self.buf) {
            Ok((rest, frame)) => {
                self.buf = rest;
                Some(Ok(frame))
            }
            Err(e) => {
                self.buf = &[];
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds one frame: header with the given fields plus payload bytes.
    fn frame(hlen: u8, clock: u32, ptype: u8, llid: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![hlen];
        v.extend_from_slice(&clock.to_le_bytes());
        v.push((ptype << 3) | 0x01); // hdr0: type + addr 1
        let len = ((payload.len() as u16) << 3) | llid as u16;
        v.extend_from_slice(&len.to_le_bytes());
        v.extend_from_slice(&0u32.to_le_bytes()); // timer
        v.push(1); // chan
        v.push(0); // seq
        if hlen == HLEN_BC4 {
            v.push(0); // pad
        }
        v.extend_from_slice(payload);
        v
    }

    fn envelope(frames: &[u8]) -> Vec<u8> {
        let mut v = vec![HCI_ACLDATA_PKT, 0x00, 0x00];
        v.extend_from_slice(&(frames.len() as u16).to_le_bytes());
        v.extend_from_slice(frames);
        v
    }

    #[test]
    fn header_fields_unpack() {
        let raw = frame(HLEN_BC2, 0x5123_4567, 4, LLID_LMP, &[0xAA, 0xBB]);
        let (rest, f) = parse_frame(&raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(f.header.ptype(), 4);
        assert_eq!(f.header.addr(), 1);
        assert_eq!(f.header.llid(), LLID_LMP);
        assert_eq!(f.header.payload_len(), 2);
        assert_eq!(f.header.clock(), 0x0123_4567);
        assert_eq!(f.header.status(), 0x5);
        assert!(f.header.is_master());
        assert_eq!(f.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn slave_bit_flips_role() {
        let raw = frame(HLEN_BC2, FP_SLAVE_MASK | 0x100, 4, 2, &[]);
        let (_, f) = parse_frame(&raw).unwrap();
        assert!(!f.header.is_master());
    }

    #[test]
    fn bc4_pad_byte_is_skipped() {
        let raw = frame(HLEN_BC4, 0, 4, 2, &[0x42]);
        let (rest, f) = parse_frame(&raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(f.payload, &[0x42]);
    }

    #[test]
    fn unknown_header_length_is_an_error() {
        let raw = frame(13, 0, 4, 2, &[]);
        assert_eq!(
            parse_frame(&raw).unwrap_err(),
            DecodeError::UnknownHeaderLength(13)
        );
    }

    #[test]
    fn payload_never_over_reads() {
        let mut raw = frame(HLEN_BC2, 0, 4, 2, &[1, 2, 3, 4]);
        raw.truncate(raw.len() - 2); // chop payload short of its declared length
        assert_eq!(
            parse_frame(&raw).unwrap_err(),
            DecodeError::PayloadOverrun {
                declared: 4,
                remaining: 2
            }
        );
    }

    #[test]
    fn truncated_header_is_an_error() {
        let raw = frame(HLEN_BC2, 0, 4, 2, &[]);
        assert_eq!(
            parse_frame(&raw[..7]).unwrap_err(),
            DecodeError::TruncatedHeader(7)
        );
    }

    #[test]
    fn two_back_to_back_frames_consume_whole_buffer() {
        let mut batch = frame(HLEN_BC2, 0, 4, 2, &[0x11]);
        batch.extend_from_slice(&frame(HLEN_BC2, 0, 3, LLID_LMP, &[0x22, 0x33]));
        let frames: Vec<_> = Fragments::new(&batch).collect::<Result<_, _>>().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, &[0x11]);
        assert_eq!(frames[1].payload, &[0x22, 0x33]);
        assert_eq!(frames[1].header.llid(), LLID_LMP);
    }

    #[test]
    fn fragments_stop_after_error() {
        let mut batch = frame(HLEN_BC2, 0, 4, 2, &[0x11]);
        batch.push(0xEE); // trailing garbage, too short for a header
        let mut it = Fragments::new(&batch);
        assert!(it.next().unwrap().is_ok());
        assert!(it.next().unwrap().is_err());
        assert!(it.next().is_none());
    }

    #[test]
    fn envelope_round_trip() {
        let inner = frame(HLEN_BC2, 0, 4, 2, &[0x11]);
        let buf = envelope(&inner);
        assert_eq!(strip_acl_envelope(&buf).unwrap(), &inner[..]);
    }

    #[test]
    fn envelope_rejects_wrong_tag() {
        let buf = [0x04, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(
            strip_acl_envelope(&buf).unwrap_err(),
            DecodeError::UnexpectedPacketType(0x04)
        );
    }

    #[test]
    fn envelope_rejects_length_mismatch() {
        let inner = frame(HLEN_BC2, 0, 4, 2, &[0x11]);
        let mut buf = envelope(&inner);
        buf[3] = buf[3].wrapping_add(1);
        assert!(matches!(
            strip_acl_envelope(&buf).unwrap_err(),
            DecodeError::LengthMismatch { .. }
        ));
    }

    #[test]
    fn envelope_rejects_truncation() {
        assert_eq!(
            strip_acl_envelope(&[]).unwrap_err(),
            DecodeError::TruncatedEnvelope(0)
        );
        assert_eq!(
            strip_acl_envelope(&[HCI_ACLDATA_PKT, 0x00]).unwrap_err(),
            DecodeError::TruncatedEnvelope(2)
        );
    }

    #[test]
    fn dv_packet_type_maps() {
        let raw = frame(HLEN_BC2, 0, 8, 2, &[]);
        let (_, f) = parse_frame(&raw).unwrap();
        assert_eq!(f.header.packet_type(), Some(PacketType::Dv));
    }
}
