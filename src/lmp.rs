//! LMP PDU decoding.
//!
//! An LMP payload starts with one byte holding the transaction id in the low
//! bit and the primary opcode in the remaining seven. Opcodes 124 through
//! 127 are escape opcodes and consume a second byte as the extended opcode.
//! Everything after that is the PDU body.

use crate::frontline::DecodeError;

pub const LMP_IN_RAND: u8 = 8;
pub const LMP_COMB_KEY: u8 = 9;
pub const LMP_AU_RAND: u8 = 11;
pub const LMP_SRES: u8 = 12;

const LMP_TID_MASK: u8 = 0x01;
const LMP_OP1_SHIFT: u8 = 1;
const EXTENDED_OPCODE_MIN: u8 = 124;
const EXTENDED_OPCODE_MAX: u8 = 127;

/// One decoded LMP PDU, borrowing its body from the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LmpPdu<'a> {
    pub tid: u8,
    pub opcode: u8,
    pub ext_opcode: Option<u8>,
    pub body: &'a [u8],
}

impl<'a> LmpPdu<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, DecodeError> {
        let (&first, mut body) = payload.split_first().ok_or(DecodeError::EmptyPdu)?;
        let tid = first & LMP_TID_MASK;
        let opcode = first >> LMP_OP1_SHIFT;
        let mut ext_opcode = None;
        if (EXTENDED_OPCODE_MIN..=EXTENDED_OPCODE_MAX).contains(&opcode) {
            let (&ext, rest) = body
                .split_first()
                .ok_or(DecodeError::TruncatedExtendedOpcode)?;
            ext_opcode = Some(ext);
            body = rest;
        }
        Ok(LmpPdu {
            tid,
            opcode,
            ext_opcode,
            body,
        })
    }
}
