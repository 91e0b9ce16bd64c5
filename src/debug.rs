//! The firmware's private debug-channel command protocol.
//!
//! Commands travel inside a vendor HCI command as a 22-byte frame: one
//! payload descriptor byte (fragment flags plus the debug channel number)
//! followed by a command type byte and a fixed 20-byte opaque data area.
//! Only `TIMER` has a meaningful response; the firmware answers on the
//! vendor event with the device clock at offset 2.

use log::debug;
use thiserror::Error;

use crate::hci::{BdAddr, HciTransport};

/// Payload descriptor flag: first fragment.
pub const FRAG_FIRST: u8 = 0x80;
/// Payload descriptor flag: last fragment.
pub const FRAG_LAST: u8 = 0x40;
/// Logical channel number of the debug channel.
pub const CHAN_DEBUG: u8 = 20;

const CMD_TIMER: u8 = 0x01;
const CMD_FILTER: u8 = 0x02;
const CMD_STOP: u8 = 0x03;
const CMD_START: u8 = 0x04;

/// Size of the opaque data area following the command type byte.
pub const DEBUG_DATA_LEN: usize = 20;
/// Total encoded frame size: descriptor + type + data area.
pub const DEBUG_FRAME_LEN: usize = 2 + DEBUG_DATA_LEN;

/// Size of the response buffer handed to the transport, matching the
/// firmware's fixed event payload.
pub const RESPONSE_LEN: usize = 254;

#[derive(Error, Debug)]
pub enum DebugError {
    #[error("debug command transport failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("malformed timer response ({len} bytes, need at least 6)")]
    ShortTimerResponse { len: usize },

    #[error("malformed debug frame ({0} bytes, expected {DEBUG_FRAME_LEN})")]
    BadFrameLength(usize),

    #[error("unexpected payload descriptor 0x{0:02X}")]
    BadDescriptor(u8),

    #[error("unknown debug command type 0x{0:02X}")]
    UnknownCommand(u8),
}

/// A debug-channel command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCommand {
    /// Query the device clock.
    Timer,
    /// Set the firmware's packet-type filter.
    Filter(u8),
    /// Stop sniffing.
    Stop,
    /// Start sniffing the piconet formed by `master` and `slave`.
    Start { master: BdAddr, slave: BdAddr },
}

impl DebugCommand {
    fn type_byte(&self) -> u8 {
        match self {
            DebugCommand::Timer => CMD_TIMER,
            DebugCommand::Filter(_) => CMD_FILTER,
            DebugCommand::Stop => CMD_STOP,
            DebugCommand::Start { .. } => CMD_START,
        }
    }

    /// Encodes the command into the fixed-size debug frame.
    ///
    /// `START` stores both addresses byte-reversed, as the firmware expects.
    pub fn encode(&self) -> [u8; DEBUG_FRAME_LEN] {
        let mut frame = [0u8; DEBUG_FRAME_LEN];
        frame[0] = FRAG_FIRST | FRAG_LAST | CHAN_DEBUG;
        frame[1] = self.type_byte();
        let data = &mut frame[2..];
        match self {
            DebugCommand::Timer | DebugCommand::Stop => {}
            DebugCommand::Filter(val) => data[0] = *val,
            DebugCommand::Start { master, slave } => {
                data[..6].copy_from_slice(&master.reversed());
                data[6..12].copy_from_slice(&slave.reversed());
            }
        }
        frame
    }

    /// Decodes an encoded debug frame back into a command.
    pub fn decode(frame: &[u8]) -> Result<DebugCommand, DebugError> {
        if frame.len() != DEBUG_FRAME_LEN {
            return Err(DebugError::BadFrameLength(frame.len()));
        }
        if frame[0] != FRAG_FIRST | FRAG_LAST | CHAN_DEBUG {
            return Err(DebugError::BadDescriptor(frame[0]));
        }
        let data = &frame[2..];
        match frame[1] {
            CMD_TIMER => Ok(DebugCommand::Timer),
            CMD_STOP => Ok(DebugCommand::Stop),
            CMD_FILTER => Ok(DebugCommand::Filter(data[0])),
            CMD_START => {
                let mut master = [0u8; 6];
                let mut slave = [0u8; 6];
                master.copy_from_slice(&data[..6]);
                slave.copy_from_slice(&data[6..12]);
                Ok(DebugCommand::Start {
                    master: BdAddr::from_reversed(master),
                    slave: BdAddr::from_reversed(slave),
                })
            }
            other => Err(DebugError::UnknownCommand(other)),
        }
    }
}

fn send<T: HciTransport>(
    transport: &mut T,
    cmd: &DebugCommand,
    response: &mut [u8; RESPONSE_LEN],
) -> Result<usize, DebugError> {
    debug!("debug command {cmd:?}");
    Ok(transport.vendor_command(&cmd.encode(), response)?)
}

/// Interprets a `TIMER` response buffer: an unsigned 32-bit device clock at
/// offset 2.
pub fn parse_timer_response(response: &[u8]) -> Result<u32, DebugError> {
    if response.len() < 6 {
        return Err(DebugError::ShortTimerResponse {
            len: response.len(),
        });
    }
    Ok(u32::from_le_bytes([
        response[2],
        response[3],
        response[4],
        response[5],
    ]))
}

/// Issues `TIMER` and returns the device clock.
pub fn read_timer<T: HciTransport>(transport: &mut T) -> Result<u32, DebugError> {
    let mut response = [0u8; RESPONSE_LEN];
    let len = send(transport, &DebugCommand::Timer, &mut response)?;
    parse_timer_response(&response[..len])
}

/// Issues `FILTER` with the given packet-type filter value.
pub fn set_filter<T: HciTransport>(transport: &mut T, value: u8) -> Result<(), DebugError> {
    let mut response = [0u8; RESPONSE_LEN];
    send(transport, &DebugCommand::Filter(value), &mut response)?;
    Ok(())
}

/// Issues `START` for the piconet formed by `master` and `slave`.
pub fn start_sniff<T: HciTransport>(
    transport: &mut T,
    master: BdAddr,
    slave: BdAddr,
) -> Result<(), DebugError> {
    let mut response = [0u8; RESPONSE_LEN];
    send(transport, &DebugCommand::Start { master, slave }, &mut response)?;
    Ok(())
}

/// Issues `STOP`.
pub fn stop_sniff<T: HciTransport>(transport: &mut T) -> Result<(), DebugError> {
    let mut response = [0u8; RESPONSE_LEN];
    send(transport, &DebugCommand::Stop, &mut response)?;
    Ok(())
}
