//! Raw HCI socket transport and Bluetooth core types.
//!
//! The sniff firmware talks over a plain raw HCI socket: vendor commands go
//! out on the command channel and captured air traffic comes back as ACL
//! data packets. Everything here is the transport collaborator; the decoders
//! only ever see byte buffers.

use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::debug;
use thiserror::Error;

/// H4 packet type indicator for HCI command packets.
pub const HCI_COMMAND_PKT: u8 = 0x01;
/// H4 packet type indicator for ACL data packets.
pub const HCI_ACLDATA_PKT: u8 = 0x02;
/// H4 packet type indicator for HCI event packets.
pub const HCI_EVENT_PKT: u8 = 0x04;

/// Vendor-specific HCI event code.
pub const EVT_VENDOR: u8 = 0xFF;

const OGF_VENDOR_CMD: u16 = 0x3F;
/// Opcode for the CSR vendor command (OGF 0x3F, OCF 0x0000).
pub const VENDOR_OPCODE: u16 = OGF_VENDOR_CMD << 10;

/// Response timeout for a debug-channel command round trip.
pub const VENDOR_TIMEOUT: Duration = Duration::from_millis(2000);

const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const HCI_CHANNEL_RAW: u16 = 0;
const SOL_HCI: i32 = 0;
const HCI_FILTER: i32 = 2;

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

/// A Bluetooth device address in display byte order (`AA:BB:CC:DD:EE:FF`
/// parses to `[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdAddr(pub [u8; 6]);

#[derive(Error, Debug)]
#[error("invalid Bluetooth address (expected AA:BB:CC:DD:EE:FF): {0:?}")]
pub struct AddrParseError(String);

impl FromStr for BdAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr = [0u8; 6];
        let mut parts = 0;
        for (i, part) in s.split(':').enumerate() {
            if i >= 6 {
                return Err(AddrParseError(s.to_owned()));
            }
            addr[i] = u8::from_str_radix(part, 16).map_err(|_| AddrParseError(s.to_owned()))?;
            parts += 1;
        }
        if parts != 6 {
            return Err(AddrParseError(s.to_owned()));
        }
        Ok(BdAddr(addr))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl BdAddr {
    /// Returns the address in the firmware's reversed wire order.
    pub fn reversed(&self) -> [u8; 6] {
        let mut rev = self.0;
        rev.reverse();
        rev
    }

    /// Builds an address back from the firmware's reversed wire order.
    pub fn from_reversed(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        BdAddr(bytes)
    }
}

/// The transport boundary between the decoders and the HCI device.
///
/// [`HciSocket`] is the real implementation; tests drive the session and the
/// debug codec with in-memory implementations instead.
pub trait HciTransport {
    /// Sends a vendor command with `params` and copies the parameters of the
    /// vendor event response into `response`, returning the number of bytes
    /// copied. Times out after [`VENDOR_TIMEOUT`].
    fn vendor_command(&mut self, params: &[u8], response: &mut [u8]) -> io::Result<usize>;

    /// Blocking read of one frame batch from the sniff socket.
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A raw HCI socket bound to one local device.
pub struct HciSocket {
    fd: RawFd,
}

/// Parses a device name like `hci0` (or a bare index) into a device id.
fn device_index(name: &str) -> io::Result<u16> {
    name.strip_prefix("hci")
        .unwrap_or(name)
        .parse()
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not an HCI device name: {name:?}"),
            )
        })
}

impl HciSocket {
    /// Opens a raw HCI socket bound to the named device (e.g. `hci0`).
    pub fn open(name: &str) -> io::Result<Self> {
        let dev_id = device_index(name)?;
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }
        debug!("opened {name} (dev id {dev_id})");
        Ok(HciSocket { fd })
    }

    fn set_filter(&self, type_mask: u32) -> io::Result<()> {
        let flt = HciFilter {
            type_mask,
            event_mask: [0xFFFF_FFFF; 2],
            opcode: 0,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                SOL_HCI,
                HCI_FILTER,
                &flt as *const _ as *const libc::c_void,
                mem::size_of::<HciFilter>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Installs a socket filter accepting all packet types and all events,
    /// as the capture loop needs to see the raw ACL stream.
    pub fn set_filter_all(&self) -> io::Result<()> {
        self.set_filter(0xFFFF_FFFF)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write on HCI socket",
            ));
        }
        Ok(())
    }

    fn read_raw(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n =
                unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }
            return Ok(n as usize);
        }
    }

    fn poll_readable(&self, deadline: Instant) -> io::Result<()> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "vendor command response timeout",
                ));
            }
            let mut pfd = libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as libc::c_int) };
            if rc < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }
            if rc == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "vendor command response timeout",
                ));
            }
            return Ok(());
        }
    }
}

impl HciTransport for HciSocket {
    fn vendor_command(&mut self, params: &[u8], response: &mut [u8]) -> io::Result<usize> {
        // Only events matter until the vendor response arrives.
        self.set_filter(1 << HCI_EVENT_PKT)?;

        let mut cmd = Vec::with_capacity(4 + params.len());
        cmd.push(HCI_COMMAND_PKT);
        cmd.extend_from_slice(&VENDOR_OPCODE.to_le_bytes());
        cmd.push(params.len() as u8);
        cmd.extend_from_slice(params);
        self.write_all(&cmd)?;

        let deadline = Instant::now() + VENDOR_TIMEOUT;
        let mut buf = [0u8; 260];
        loop {
            self.poll_readable(deadline)?;
            let n = self.read_raw(&mut buf)?;
            if n < 3 || buf[0] != HCI_EVENT_PKT || buf[1] != EVT_VENDOR {
                continue;
            }
            let plen = buf[2] as usize;
            let end = n.min(3 + plen);
            let copy = response.len().min(end - 3);
            response[..copy].copy_from_slice(&buf[3..3 + copy]);
            return Ok(copy);
        }
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_raw(buf)
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
