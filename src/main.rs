#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::PathBuf;

use anyhow::{anyhow, Context};

use everdrive_loader::protocol::RTC_LEN;
use everdrive_loader::{LinuxSession, Options};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    op: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Identify the device, then read its status, voltages and RTC
    Info,

    /// Read the supply voltage channels
    Voltage,

    /// Read the raw RTC registers
    RtcGet,

    /// Write the raw RTC registers (six hex octets, device order)
    RtcSet {
        #[structopt(parse(try_from_str = parse_rtc))]
        values: [u8; RTC_LEN],
    },

    /// Read device memory
    Read {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,

        length: usize,

        /// Write data to a file instead of the console
        #[structopt(long)]
        output: Option<PathBuf>,
    },

    /// Write device memory
    Write {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,

        #[structopt(flatten)]
        input: Input,
    },

    /// Push data into the device FIFO
    FifoWrite {
        #[structopt(flatten)]
        input: Input,
    },

    /// Pull data out of the device FIFO
    FifoRead { count: usize },
}

#[derive(Clone, Debug, StructOpt)]
pub struct Input {
    /// Hex encoded data
    #[structopt(long, conflicts_with = "file", required_unless = "file")]
    data: Option<String>,

    /// File to load data from
    #[structopt(long)]
    file: Option<PathBuf>,
}

impl Input {
    fn load(&self) -> anyhow::Result<Vec<u8>> {
        match (&self.data, &self.file) {
            (Some(d), _) => hex::decode(d).context("Invalid hex data"),
            (None, Some(f)) => {
                std::fs::read(f).with_context(|| format!("Failed to read {}", f.display()))
            }
            (None, None) => Err(anyhow!("No input data provided")),
        }
    }
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn parse_rtc(s: &str) -> Result<[u8; RTC_LEN], String> {
    let v = hex::decode(s.trim_start_matches("0x")).map_err(|e| e.to_string())?;
    if v.len() != RTC_LEN {
        return Err(format!("expected {} octets, got {}", RTC_LEN, v.len()));
    }

    let mut rtc = [0u8; RTC_LEN];
    rtc.copy_from_slice(&v);
    Ok(rtc)
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port");

    let mut s = LinuxSession::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("Error connecting to serial port {}", o.port))?;

    match o.op {
        Operation::Info => {
            let i = s.init()?;
            info!(
                "Device: {} (extended status 0x{:08x}, {})",
                i.extended.device,
                i.extended.raw,
                trust(i.extended.trusted)
            );
            info!("Status: 0x{:04x} ({})", i.status.raw, trust(i.status.trusted));
            info!("Voltages: {:04x?}", s.get_voltage()?);
            info!("RTC: {}", hex::encode(s.rtc_get()?));
        }
        Operation::Voltage => {
            let v = s.get_voltage()?;
            info!("Voltages: {:04x?}", v);
        }
        Operation::RtcGet => {
            let rtc = s.rtc_get()?;
            info!("RTC: {}", hex::encode(rtc));
        }
        Operation::RtcSet { values } => {
            s.rtc_set(&values)?;
            info!("RTC set to {}", hex::encode(values));
        }
        Operation::Read {
            address,
            length,
            output,
        } => {
            info!("Reading {} at 0x{:08x}", bytefmt::format(length as u64), address);

            let mut data = vec![0u8; length];
            s.read_mem(address, &mut data)?;

            match output {
                Some(f) => std::fs::write(&f, &data)
                    .with_context(|| format!("Failed to write {}", f.display()))?,
                None => info!("Memory: {}", hex::encode(&data)),
            }
        }
        Operation::Write { address, input } => {
            let data = input.load()?;

            info!("Writing {} at 0x{:08x}", bytefmt::format(data.len() as u64), address);
            s.write_mem(address, &data)?;
        }
        Operation::FifoWrite { input } => {
            let data = input.load()?;

            info!("Writing {} to FIFO", bytefmt::format(data.len() as u64));
            s.fifo_write(&data)?;
        }
        Operation::FifoRead { count } => {
            let data = s.fifo_read(count)?;
            info!("FIFO: {}", hex::encode(&data));
        }
    }

    Ok(())
}

fn trust(trusted: bool) -> &'static str {
    if trusted {
        "ok"
    } else {
        "untrusted"
    }
}
