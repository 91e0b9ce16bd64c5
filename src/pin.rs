//! Passive capture of the legacy pairing PIN handshake.
//!
//! A PIN crack needs seven quantities off the air, in protocol order:
//! `IN_RAND`, both sides' `COMB_KEY`s, both `AU_RAND`s and both `SRES`s.
//! The accumulator tracks them as a bitmask and only accepts a quantity
//! once its prerequisites are present; out-of-order or duplicate PDUs are
//! dropped silently, since partial handshakes are the normal case on a
//! lossy sniff link.
//!
//! The cracking computation itself is out of scope; a completed capture is
//! emitted as a [`PinMaterial`] line for external tooling.

use std::fmt;

use log::debug;

use crate::lmp::{LMP_AU_RAND, LMP_COMB_KEY, LMP_IN_RAND, LMP_SRES};

const ACTIVE: u8 = 1 << 0;
const GOT_IN_RAND: u8 = 1 << 1;
const GOT_COMB1: u8 = 1 << 2;
const GOT_COMB2: u8 = 1 << 3;
const GOT_AU_RAND1: u8 = 1 << 4;
const GOT_SRES1: u8 = 1 << 5;
const GOT_AU_RAND2: u8 = 1 << 6;
const GOT_SRES2: u8 = 1 << 7;

const COMPLETE: u8 = 0xFF;

const SLOTS: usize = 7;
const SLOT_LEN: usize = 16;
/// Slots 5 and 6 hold SRES values, which are 4 bytes instead of 16.
const SRES_LEN: usize = 4;

/// A completed handshake capture: the seven quantities in emission order
/// plus which role initiated the pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinMaterial {
    /// True if the pairing initiator was the piconet master.
    pub initiator_is_master: bool,
    slots: [[u8; SLOT_LEN]; SLOTS],
}

impl PinMaterial {
    pub fn in_rand(&self) -> &[u8] {
        &self.slots[0]
    }

    pub fn comb_key_initiator(&self) -> &[u8] {
        &self.slots[1]
    }

    pub fn comb_key_responder(&self) -> &[u8] {
        &self.slots[2]
    }

    pub fn au_rand_initiator(&self) -> &[u8] {
        &self.slots[3]
    }

    pub fn au_rand_responder(&self) -> &[u8] {
        &self.slots[4]
    }

    pub fn sres_initiator(&self) -> &[u8] {
        &self.slots[5][..SRES_LEN]
    }

    pub fn sres_responder(&self) -> &[u8] {
        &self.slots[6][..SRES_LEN]
    }
}

impl fmt::Display for PinMaterial {
    /// The `btpincrack` seed line: initiating side first, then the seven
    /// quantities in slot order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "btpincrack Go ")?;
        if self.initiator_is_master {
            write!(f, "<master> <slave> ")?;
        } else {
            write!(f, "<slave> <master> ")?;
        }
        for (i, slot) in self.slots.iter().enumerate() {
            let len = if i >= 5 { SRES_LEN } else { SLOT_LEN };
            for byte in &slot[..len] {
                write!(f, "{byte:02x}")?;
            }
            write!(f, " ")?;
        }
        Ok(())
    }
}

/// The handshake accumulator.
///
/// Armed with [`arm`](PinCracker::arm), it consumes pairing PDUs via
/// [`observe`](PinCracker::observe) and returns a [`PinMaterial`] once all
/// seven quantities are in. It then re-arms itself automatically, so one
/// session captures successive pairing attempts; callers wanting
/// exactly-once capture must stop feeding it after the first emission.
#[derive(Debug, Default)]
pub struct PinCracker {
    state: u8,
    initiator_is_master: bool,
    slots: [[u8; SLOT_LEN]; SLOTS],
}

impl PinCracker {
    /// A disarmed cracker; `observe` is a no-op until armed.
    pub fn new() -> Self {
        PinCracker::default()
    }

    pub fn arm(&mut self) {
        self.state = ACTIVE;
    }

    pub fn is_armed(&self) -> bool {
        self.state != 0
    }

    fn store(&mut self, slot: usize, body: &[u8]) {
        let len = body.len().min(SLOT_LEN);
        self.slots[slot] = [0; SLOT_LEN];
        self.slots[slot][..len].copy_from_slice(&body[..len]);
    }

    /// Feeds one LMP PDU (primary opcode + body) observed under the given
    /// link role. Returns the completed capture when the last quantity
    /// arrives.
    pub fn observe(&mut self, opcode: u8, is_master: bool, body: &[u8]) -> Option<PinMaterial> {
        if !self.is_armed() {
            return None;
        }
        match opcode {
            LMP_IN_RAND => {
                // A fresh IN_RAND starts a new pairing attempt; any partial
                // capture is discarded.
                self.state = ACTIVE | GOT_IN_RAND;
                self.initiator_is_master = is_master;
                self.store(0, body);
            }
            LMP_COMB_KEY => {
                if self.state & GOT_IN_RAND == 0 {
                    debug!("comb_key before in_rand, dropped");
                    return None;
                }
                if is_master == self.initiator_is_master {
                    self.store(1, body);
                    self.state |= GOT_COMB1;
                } else {
                    self.store(2, body);
                    self.state |= GOT_COMB2;
                }
            }
            LMP_AU_RAND => {
                if self.state & GOT_COMB1 == 0 || self.state & GOT_COMB2 == 0 {
                    debug!("au_rand before both comb_keys, dropped");
                    return None;
                }
                if is_master == self.initiator_is_master {
                    self.store(3, body);
                    self.state |= GOT_AU_RAND1;
                } else {
                    self.store(4, body);
                    self.state |= GOT_AU_RAND2;
                }
            }
            LMP_SRES => {
                if is_master != self.initiator_is_master {
                    if self.state & GOT_AU_RAND1 == 0 {
                        debug!("responder sres before initiator au_rand, dropped");
                        return None;
                    }
                    self.store(6, body);
                    self.state |= GOT_SRES1;
                } else {
                    if self.state & GOT_AU_RAND2 == 0 {
                        debug!("initiator sres before responder au_rand, dropped");
                        return None;
                    }
                    self.store(5, body);
                    self.state |= GOT_SRES2;
                }
            }
            _ => return None,
        }

        if self.state != COMPLETE {
            return None;
        }
        let material = PinMaterial {
            initiator_is_master: self.initiator_is_master,
            slots: self.slots,
        };
        self.state = ACTIVE;
        Some(material)
    }
}
