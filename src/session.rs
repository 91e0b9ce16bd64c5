//! The per-capture session and its blocking read loop.
//!
//! One session drives one sniff socket and at most one dump stream. The
//! loop reads a raw frame batch, strips the ACL envelope, walks the
//! Frontline fragments and classifies each payload: auxiliary (DV) frames
//! are printed only, LMP control traffic is dumped, parsed and fed to the
//! PIN cracker, and everything else is treated as L2CAP data and dumped
//! as-is.
//!
//! Error handling follows the capture taxonomy: decode errors drop the
//! offending frame and keep the loop alive, dump I/O errors break the dump
//! stream but not the capture, and only transport faults end the session.

use std::fmt::Write as _;
use std::io::{self, Write};

use log::{debug, error, warn};

use crate::dump::HcidumpWriter;
use crate::frontline::{strip_acl_envelope, Fragments, FrontlineFrame, PacketType, LLID_LMP};
use crate::hci::HciTransport;
use crate::lmp::LmpPdu;
use crate::pin::PinCracker;

/// Size of one sniff socket read, matching the firmware's frame batches.
pub const READ_BUF_LEN: usize = 254;

/// Capture-time knobs.
#[derive(Debug, Default, Clone)]
pub struct SniffConfig {
    /// Baseband packet types to discard silently (e.g. NULL and POLL
    /// keepalive chatter).
    pub ignored_types: Vec<u8>,
    /// Discard frames with an empty payload.
    pub ignore_zero_len: bool,
    /// Arm the PIN-handshake cracker.
    pub pin_crack: bool,
}

/// The mutable per-capture context.
pub struct SniffSession<T, W: Write> {
    transport: T,
    dump: Option<HcidumpWriter<W>>,
    config: SniffConfig,
    pin: PinCracker,
    // Refreshed from each frame header; only valid while that frame is
    // being processed.
    master: bool,
    llid: u8,
    ptype: u8,
}

fn hex(buf: &[u8]) -> String {
    let mut out = String::with_capacity(buf.len() * 3);
    for byte in buf {
        write!(out, "{byte:02X} ").unwrap();
    }
    out
}

impl<T: HciTransport, W: Write> SniffSession<T, W> {
    pub fn new(transport: T, dump: Option<W>, config: SniffConfig) -> Self {
        let mut pin = PinCracker::new();
        if config.pin_crack {
            pin.arm();
        }
        SniffSession {
            transport,
            dump: dump.map(HcidumpWriter::new),
            config,
            pin,
            master: false,
            llid: 0,
            ptype: 0,
        }
    }

    /// Runs the blocking capture loop. Returns only on a transport fault.
    pub fn run(&mut self) -> io::Result<()> {
        let mut buf = [0u8; READ_BUF_LEN];
        loop {
            let len = self.transport.read_frame(&mut buf)?;
            self.process(&buf[..len]);
        }
    }

    /// Decodes one raw read. Malformed input is logged and dropped; the
    /// session stays usable.
    pub fn process(&mut self, buf: &[u8]) {
        let frames = match strip_acl_envelope(buf) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("discarding read: {e}");
                return;
            }
        };
        for fragment in Fragments::new(frames) {
            match fragment {
                Ok(frame) => self.handle_frame(&frame),
                Err(e) => warn!("discarding rest of read: {e}"),
            }
        }
    }

    fn handle_frame(&mut self, frame: &FrontlineFrame<'_>) {
        let hdr = &frame.header;
        self.master = hdr.is_master();
        self.llid = hdr.llid();
        self.ptype = hdr.ptype();

        if self.config.ignored_types.contains(&self.ptype) {
            debug!("ignoring frame type {}", self.ptype);
            return;
        }
        if self.config.ignore_zero_len && frame.payload.is_empty() {
            return;
        }

        print!(
            "HL 0x{:02X} Ch {:02} {} Clk 0x{:07X} Status 0x{:X} Hdr0 0x{:02X} [type: {} addr: {}] LLID {} Len {}",
            hdr.hlen,
            hdr.chan,
            if self.master { 'M' } else { 'S' },
            hdr.clock(),
            hdr.status(),
            hdr.hdr0,
            self.ptype,
            hdr.addr(),
            self.llid,
            frame.payload.len(),
        );
        if frame.payload.is_empty() {
            println!();
        } else {
            print!(" ");
            self.process_payload(frame.payload);
        }
    }

    fn process_payload(&mut self, payload: &[u8]) {
        if self.ptype == PacketType::Dv as u8 {
            // Channel-quality chatter; log only.
            println!("DV: {}", hex(payload));
        } else if self.llid == LLID_LMP {
            self.process_lmp(payload);
        } else {
            self.process_l2cap(payload);
        }
    }

    fn process_lmp(&mut self, payload: &[u8]) {
        if let Some(dump) = self.dump.as_mut() {
            if let Err(e) = dump.write_lmp(self.master, payload) {
                if e.is_fatal() {
                    error!("dump stream broken: {e}");
                    self.dump = None;
                } else {
                    warn!("skipping dump record: {e}");
                }
            }
        }

        let pdu = match LmpPdu::parse(payload) {
            Ok(pdu) => pdu,
            Err(e) => {
                println!();
                warn!("dropping LMP payload: {e}");
                return;
            }
        };
        print!("LMP Tid {} Op1 {}", pdu.tid, pdu.opcode);
        if let Some(op2) = pdu.ext_opcode {
            print!(" Op2 {op2}");
        }
        println!(": {}", hex(pdu.body));

        if let Some(material) = self.pin.observe(pdu.opcode, self.master, pdu.body) {
            println!("{material}");
        }
    }

    fn process_l2cap(&mut self, payload: &[u8]) {
        println!("L2CAP: {}", hex(payload));
        if let Some(dump) = self.dump.as_mut() {
            if let Err(e) = dump.write_acl(self.llid, payload) {
                error!("dump stream broken: {e}");
                self.dump = None;
            }
        }
    }

    /// True while the dump stream is attached and healthy.
    pub fn is_dumping(&self) -> bool {
        self.dump.is_some()
    }

    /// Tears the session down, handing back the dump sink (if it is still
    /// healthy) for inspection or closing.
    pub fn into_dump(self) -> Option<W> {
        self.dump.map(HcidumpWriter::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::{HCIDUMP_HDR_LEN, LMP_RECORD_BODY};
    use crate::frontline::{HLEN_BC2, LLID_LMP};
    use crate::hci::HCI_ACLDATA_PKT;
    use crate::lmp::{LMP_AU_RAND, LMP_COMB_KEY, LMP_IN_RAND, LMP_SRES};
    use std::collections::VecDeque;

    const SLAVE_BIT: u32 = 0x8000_0000;

    /// Transport replaying canned reads, then failing like a dead socket.
    struct ReplayTransport {
        reads: VecDeque<Vec<u8>>,
    }

    impl ReplayTransport {
        fn new(reads: Vec<Vec<u8>>) -> Self {
            ReplayTransport {
                reads: reads.into(),
            }
        }
    }

    impl HciTransport for ReplayTransport {
        fn vendor_command(&mut self, _: &[u8], _: &mut [u8]) -> io::Result<usize> {
            unimplemented!("not used by the capture loop")
        }

        fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(read) => {
                    buf[..read.len()].copy_from_slice(&read);
                    Ok(read.len())
                }
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "socket gone")),
            }
        }
    }

    fn frame(clock: u32, ptype: u8, llid: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![HLEN_BC2];
        v.extend_from_slice(&clock.to_le_bytes());
        v.push((ptype << 3) | 0x01);
        let len = ((payload.len() as u16) << 3) | llid as u16;
        v.extend_from_slice(&len.to_le_bytes());
        v.extend_from_slice(&0u32.to_le_bytes());
        v.push(1);
        v.push(0);
        v.extend_from_slice(payload);
        v
    }

    fn envelope(frames: &[u8]) -> Vec<u8> {
        let mut v = vec![HCI_ACLDATA_PKT, 0x00, 0x00];
        v.extend_from_slice(&(frames.len() as u16).to_le_bytes());
        v.extend_from_slice(frames);
        v
    }

    fn session(config: SniffConfig) -> SniffSession<ReplayTransport, Vec<u8>> {
        SniffSession::new(ReplayTransport::new(Vec::new()), Some(Vec::new()), config)
    }

    #[test]
    fn l2cap_payload_lands_in_dump() {
        let mut s = session(SniffConfig::default());
        s.process(&envelope(&frame(0, 4, 2, &[0xDE, 0xAD])));
        let out = s.into_dump().unwrap();
        // One ACL record: hcidump header + tag + acl header + payload.
        assert_eq!(out.len(), HCIDUMP_HDR_LEN + 1 + 4 + 2);
        assert_eq!(out[12], HCI_ACLDATA_PKT);
        assert_eq!(&out[17..], &[0xDE, 0xAD]);
    }

    #[test]
    fn lmp_payload_lands_in_dump_as_vendor_record() {
        let mut s = session(SniffConfig::default());
        let pdu = [(LMP_SRES << 1) | 1, 0x01, 0x02, 0x03, 0x04];
        s.process(&envelope(&frame(0, 3, LLID_LMP, &pdu)));
        let out = s.into_dump().unwrap();
        assert_eq!(out.len(), HCIDUMP_HDR_LEN + 1 + 2 + LMP_RECORD_BODY);
        assert_eq!(&out[17..17 + pdu.len()], &pdu[..]);
    }

    #[test]
    fn bad_envelope_leaves_session_untouched() {
        let mut s = session(SniffConfig::default());
        s.process(&[0x04, 0x01, 0x02]); // event tag, not ACL
        assert!(s.into_dump().unwrap().is_empty());
    }

    #[test]
    fn two_fragments_dispatch_independently() {
        let mut batch = frame(0, 4, 2, &[0x11]);
        batch.extend_from_slice(&frame(0, 4, 2, &[0x22]));
        let mut s = session(SniffConfig::default());
        s.process(&envelope(&batch));
        let out = s.into_dump().unwrap();
        // Two ACL records of one payload byte each.
        assert_eq!(out.len(), 2 * (HCIDUMP_HDR_LEN + 1 + 4 + 1));
    }

    #[test]
    fn ignored_type_skips_only_that_fragment() {
        let mut batch = frame(0, 0, 2, &[0x11]); // NULL, ignored
        batch.extend_from_slice(&frame(0, 4, 2, &[0x22]));
        let mut s = session(SniffConfig {
            ignored_types: vec![0, 1],
            ..Default::default()
        });
        s.process(&envelope(&batch));
        let out = s.into_dump().unwrap();
        assert_eq!(out.len(), HCIDUMP_HDR_LEN + 1 + 4 + 1);
        assert_eq!(out[17], 0x22);
    }

    #[test]
    fn zero_length_frames_can_be_ignored() {
        let mut s = session(SniffConfig {
            ignore_zero_len: true,
            ..Default::default()
        });
        s.process(&envelope(&frame(0, 4, 2, &[])));
        assert!(s.into_dump().unwrap().is_empty());
    }

    #[test]
    fn dv_frames_are_not_dumped() {
        let mut s = session(SniffConfig::default());
        s.process(&envelope(&frame(0, 8, 2, &[0x55])));
        assert!(s.into_dump().unwrap().is_empty());
    }

    fn lmp_frame(clock: u32, opcode: u8, body: &[u8]) -> Vec<u8> {
        let mut pdu = vec![opcode << 1];
        pdu.extend_from_slice(body);
        frame(clock, 3, LLID_LMP, &pdu)
    }

    #[test]
    fn pin_handshake_is_captured_across_reads() {
        let mut s = session(SniffConfig {
            pin_crack: true,
            ..Default::default()
        });
        // Master initiates; slave frames carry the slave clock bit.
        s.process(&envelope(&lmp_frame(0, LMP_IN_RAND, &[0x10; 16])));
        s.process(&envelope(&lmp_frame(0, LMP_COMB_KEY, &[0x21; 16])));
        s.process(&envelope(&lmp_frame(SLAVE_BIT, LMP_COMB_KEY, &[0x22; 16])));
        s.process(&envelope(&lmp_frame(0, LMP_AU_RAND, &[0x31; 16])));
        s.process(&envelope(&lmp_frame(SLAVE_BIT, LMP_AU_RAND, &[0x32; 16])));
        s.process(&envelope(&lmp_frame(SLAVE_BIT, LMP_SRES, &[0x41; 4])));
        s.process(&envelope(&lmp_frame(0, LMP_SRES, &[0x42; 4])));
        // The cracker re-armed itself after emitting.
        assert!(s.pin.is_armed());
        // All seven PDUs were also dumped as vendor records.
        let record = HCIDUMP_HDR_LEN + 1 + 2 + LMP_RECORD_BODY;
        assert_eq!(s.into_dump().unwrap().len(), 7 * record);
    }

    /// Sink that always fails, to exercise the broken-stream path.
    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn dump_fault_breaks_dumping_but_not_decoding() {
        let mut s = SniffSession::new(
            ReplayTransport::new(Vec::new()),
            Some(FailingSink),
            SniffConfig::default(),
        );
        assert!(s.is_dumping());
        s.process(&envelope(&frame(0, 4, 2, &[0xDE, 0xAD])));
        assert!(!s.is_dumping());
        // Decoding carries on with the stream gone.
        s.process(&envelope(&frame(0, 4, 2, &[0xBE, 0xEF])));
    }

    #[test]
    fn run_ends_on_transport_fault() {
        let reads = vec![envelope(&frame(0, 4, 2, &[0x11]))];
        let mut s = SniffSession::new(
            ReplayTransport::new(reads),
            Some(Vec::new()),
            SniffConfig::default(),
        );
        let err = s.run().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        // The read before the fault was decoded and dumped.
        assert!(!s.into_dump().unwrap().is_empty());
    }
}
