#![deny(unused_must_use)]

use std::fs::File;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;

use csrsniff::debug;
use csrsniff::hci::{BdAddr, HciSocket};
use csrsniff::session::{SniffConfig, SniffSession};

/// Passive Bluetooth baseband sniffer for CSR dongles running the Frontline
/// sniff firmware.
///
/// Drives the firmware over its vendor debug channel, decodes the captured
/// air traffic down to LMP, passively collects pairing PIN handshakes and
/// writes an hcidump-compatible capture file.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct SniffArgs {
    #[command(subcommand)]
    command: SniffCommand,
}

#[derive(Debug, Subcommand)]
enum SniffCommand {
    /// Query the device clock of the sniff firmware.
    Timer {
        /// HCI device running the sniff firmware (e.g. hci0).
        device: String,
    },

    /// Set the firmware's packet-type filter.
    Filter {
        device: String,
        /// Raw filter value, as understood by the firmware.
        value: u8,
    },

    /// Start sniffing the piconet formed by two devices.
    Start {
        device: String,
        /// Piconet master address (AA:BB:CC:DD:EE:FF).
        master: BdAddr,
        /// Piconet slave address.
        slave: BdAddr,
    },

    /// Stop sniffing.
    Stop { device: String },

    /// Capture, decode and print sniffed traffic until interrupted.
    Sniff {
        device: String,

        /// Write decoded records to an hcidump-format capture file.
        #[arg(long)]
        dump: Option<String>,

        /// Arm the pairing PIN-handshake capture; prints a `btpincrack`
        /// seed line whenever a complete handshake is observed.
        #[arg(long)]
        pin_crack: bool,

        /// Baseband packet type to discard silently; may be repeated
        /// (e.g. 0 and 1 to drop NULL/POLL keepalives).
        #[arg(long = "ignore-type", value_name = "TYPE")]
        ignored_types: Vec<u8>,

        /// Discard frames with an empty payload.
        #[arg(long)]
        ignore_zero: bool,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    match SniffArgs::parse().command {
        SniffCommand::Timer { device } => {
            let mut socket =
                HciSocket::open(&device).with_context(|| format!("opening {device}"))?;
            let clock = debug::read_timer(&mut socket).context("timer query")?;
            println!("timer: 0x{clock:08X}");
        }
        SniffCommand::Filter { device, value } => {
            let mut socket =
                HciSocket::open(&device).with_context(|| format!("opening {device}"))?;
            info!("filter packets: {value}");
            debug::set_filter(&mut socket, value).context("filter command")?;
        }
        SniffCommand::Start {
            device,
            master,
            slave,
        } => {
            let mut socket =
                HciSocket::open(&device).with_context(|| format!("opening {device}"))?;
            info!("start sniffing master {master} slave {slave}");
            debug::start_sniff(&mut socket, master, slave).context("start command")?;
        }
        SniffCommand::Stop { device } => {
            let mut socket =
                HciSocket::open(&device).with_context(|| format!("opening {device}"))?;
            debug::stop_sniff(&mut socket).context("stop command")?;
        }
        SniffCommand::Sniff {
            device,
            dump,
            pin_crack,
            ignored_types,
            ignore_zero,
        } => {
            let socket = HciSocket::open(&device).with_context(|| format!("opening {device}"))?;
            socket
                .set_filter_all()
                .context("installing socket filter")?;
            let dump = dump
                .map(|path| File::create(&path).with_context(|| format!("creating {path}")))
                .transpose()?;
            let config = SniffConfig {
                ignored_types,
                ignore_zero_len: ignore_zero,
                pin_crack,
            };
            let mut session = SniffSession::new(socket, dump, config);
            session.run().context("sniff read loop")?;
        }
    }
    Ok(())
}
