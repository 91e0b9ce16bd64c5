//! hcidump-format capture file writer.
//!
//! Every decoded record is framed by the 12-byte hcidump header (total body
//! length, direction, zeroed timestamps; the firmware provides no usable
//! timestamps) and then one of two bodies: a plain ACL data record for
//! L2CAP payloads, or a vendor event record wrapping a raw LMP PDU in the
//! fixed 20-byte CSR layout that downstream analyzers understand.
//!
//! Records are assembled in memory and written with a single `write_all`,
//! so an interrupted capture never leaves a half-written record behind.

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use thiserror::Error;

use crate::hci::{EVT_VENDOR, HCI_ACLDATA_PKT, HCI_EVENT_PKT};

/// Size of the common hcidump record header.
pub const HCIDUMP_HDR_LEN: usize = 12;

/// Maximum LMP body carried in the vendor record.
pub const LMP_MAX_BODY: usize = 17;
/// Fixed size of the vendor LMP record body: channel id + role + padded
/// body + reserved byte.
pub const LMP_RECORD_BODY: usize = 1 + 1 + LMP_MAX_BODY + 1;

const LMP_CHANNEL_ID: u8 = 20;
const ROLE_MASTER: u8 = 0x10;
const ROLE_SLAVE: u8 = 0x0F;

#[derive(Error, Debug)]
pub enum DumpError {
    /// The dump destination failed; the stream is broken and must not be
    /// written to again.
    #[error("dump write failed: {0}")]
    Io(#[from] std::io::Error),

    /// The decoded LMP body does not fit the fixed vendor record. The
    /// record is skipped; the stream stays usable.
    #[error("LMP body too long for vendor record ({len} > {LMP_MAX_BODY})")]
    LmpBodyTooLong { len: usize },
}

impl DumpError {
    /// True if the dump stream is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DumpError::Io(_))
    }
}

/// Sequential hcidump record writer over any byte sink.
pub struct HcidumpWriter<W: Write> {
    inner: W,
}

impl<W: Write> HcidumpWriter<W> {
    pub fn new(inner: W) -> Self {
        HcidumpWriter { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Record header: total length, direction = inbound, zero timestamp.
    fn push_header(record: &mut Vec<u8>, total_len: usize) {
        record.write_u16::<LittleEndian>(total_len as u16).unwrap();
        record.push(1); // in
        record.push(0); // pad
        record.write_u32::<LittleEndian>(0).unwrap(); // ts_sec
        record.write_u32::<LittleEndian>(0).unwrap(); // ts_usec
    }

    /// Writes one ACL data record carrying a raw L2CAP payload. The LLID is
    /// packed into the flag bits of an otherwise-zero connection handle.
    pub fn write_acl(&mut self, llid: u8, payload: &[u8]) -> Result<(), DumpError> {
        let total_len = 1 + 4 + payload.len();
        let mut record = Vec::with_capacity(HCIDUMP_HDR_LEN + total_len);
        Self::push_header(&mut record, total_len);
        record.push(HCI_ACLDATA_PKT);
        record.write_u16::<LittleEndian>((llid as u16) << 12).unwrap();
        record
            .write_u16::<LittleEndian>(payload.len() as u16)
            .unwrap();
        record.extend_from_slice(payload);
        self.inner.write_all(&record)?;
        Ok(())
    }

    /// Writes one vendor event record carrying a raw LMP PDU. The body is
    /// validated against the fixed 17-byte area before anything is written;
    /// shorter bodies are zero-padded.
    pub fn write_lmp(&mut self, is_master: bool, pdu: &[u8]) -> Result<(), DumpError> {
        if pdu.len() > LMP_MAX_BODY {
            return Err(DumpError::LmpBodyTooLong { len: pdu.len() });
        }
        let total_len = 1 + 2 + LMP_RECORD_BODY;
        let mut record = Vec::with_capacity(HCIDUMP_HDR_LEN + total_len);
        Self::push_header(&mut record, total_len);
        record.push(HCI_EVENT_PKT);
        record.push(EVT_VENDOR);
        record.push(LMP_RECORD_BODY as u8);
        record.push(LMP_CHANNEL_ID);
        record.push(if is_master { ROLE_MASTER } else { ROLE_SLAVE });
        record.extend_from_slice(pdu);
        record.resize(record.len() + (LMP_MAX_BODY - pdu.len()), 0);
        record.push(0); // reserved
        self.inner.write_all(&record)?;
        Ok(())
    }
}
