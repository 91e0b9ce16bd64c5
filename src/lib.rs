//! Passive Bluetooth baseband sniffing with a CSR dongle running the
//! Frontline sniff firmware.
//!
//! The firmware is driven over a private debug channel (vendor HCI
//! commands) and streams captured air traffic back as ACL data packets in
//! its own Frontline framing. This crate decodes that framing down to the
//! LMP control protocol, passively collects the quantities of the legacy
//! pairing PIN handshake, and writes every decoded record to an
//! hcidump-format capture file for downstream analyzers.
//!
//! ## Example
//!
//! ```no_run
//! use csrsniff::hci::HciSocket;
//! use csrsniff::session::{SniffConfig, SniffSession};
//!
//! let socket = HciSocket::open("hci0")?;
//! socket.set_filter_all()?;
//! let dump = std::fs::File::create("capture.dump")?;
//! let config = SniffConfig {
//!     pin_crack: true,
//!     ..Default::default()
//! };
//! let mut session = SniffSession::new(socket, Some(dump), config);
//! session.run()?; // blocks until the transport fails
//! # Ok::<(), std::io::Error>(())
//! ```

#![deny(unused_must_use)]

pub mod debug;
pub mod dump;
pub mod frontline;
pub mod hci;
pub mod lmp;
pub mod pin;
pub mod session;
