//! Mega EverDrive USB serial protocol.
//!
//! Commands are framed with a self-checking header (see [`protocol::Header`])
//! followed by a command specific payload. Replies carry no framing of their
//! own, the host must know the shape of each reply in advance.

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

use core::convert::TryFrom;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(feature = "linux")]
pub use linux::LinuxSession;

pub mod protocol;
use protocol::*;

pub use protocol::{Command, DeviceKind, ExtendedStatus, RtcFields, Status, ADDR_FIFO};

/// Byte-wise duplex channel to the device
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> SerialPort<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Disconnected,
    Connected,
}

/// Transport level failures, always fatal to the operation in flight
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: core::fmt::Debug> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("short read, expected {expected} bytes but received {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("no transport attached")]
    Disconnected,

    #[error("transfer of {0} bytes does not fit a descriptor")]
    TransferTooLarge(usize),
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Give up on a reply after this long without progress (waits forever if unset)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub response_timeout_ms: Option<u32>,

    /// Period to poll for device responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: None,
            poll_delay_ms: 1,
        }
    }
}

/// Identification gathered by [`Session::init`]
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct DeviceInfo {
    pub extended: ExtendedStatus,
    pub status: Status,
}

pub struct Session<P, D, E> {
    state: State,
    options: Options,
    port: Option<P>,
    delay: D,
    _err: core::marker::PhantomData<E>,
}

impl<P, D, E> Session<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new session with no transport attached
    pub fn new(delay: D, options: Options) -> Self {
        Self {
            state: State::Disconnected,
            options,
            port: None,
            delay,
            _err: core::marker::PhantomData,
        }
    }

    /// Create a session already connected to the provided port
    pub fn with_port(port: P, delay: D, options: Options) -> Self {
        let mut s = Self::new(delay, options);
        s.connect(port);
        s
    }

    /// Fetch the session state
    pub fn state(&self) -> State {
        self.state
    }

    /// Attach a transport, replacing any previous one
    pub fn connect(&mut self, port: P) {
        debug!("Attaching transport");

        self.port = Some(port);
        self.state = State::Connected;
    }

    /// Detach and return the transport
    pub fn release(&mut self) -> Option<P> {
        self.state = State::Disconnected;
        self.port.take()
    }

    /// Identify the device and read its status.
    ///
    /// Purely informational, no other command depends on it.
    pub fn init(&mut self) -> Result<DeviceInfo, Error<E>> {
        debug!("Identifying device");
        let extended = self.extended_status()?;

        if extended.device.is_known() {
            info!("Found Mega EverDrive {}", extended.device);
        } else {
            warn!("Unrecognised device: {}", extended.device);
        }

        let status = self.status()?;

        Ok(DeviceInfo { extended, status })
    }

    /// Read the 16-bit status word
    pub fn status(&mut self) -> Result<Status, Error<E>> {
        self.send_cmd(Command::Status)?;
        self.flush()?;

        let status = Status::from(self.read_u16()?);
        if !status.trusted {
            warn!("Bad status reply 0x{:04x}", status.raw);
        }

        Ok(status)
    }

    /// Read and decode the 32-bit identification word
    pub fn extended_status(&mut self) -> Result<ExtendedStatus, Error<E>> {
        self.send_cmd(Command::ExtendedStatus)?;
        self.flush()?;

        let status = ExtendedStatus::from(self.read_u32()?);
        if status.check != STATUS2_CHECK {
            warn!("Bad extended status reply 0x{:08x}", status.raw);
        }
        if status.protocol_id != PROTOCOL_ID {
            warn!("Bad protocol id 0x{:02x}", status.protocol_id);
        }

        debug!("Extended status: {:?}", status);

        Ok(status)
    }

    /// Read the four voltage channels
    pub fn get_voltage(&mut self) -> Result<[u16; VOLTAGE_CHANNELS], Error<E>> {
        self.send_cmd(Command::GetVoltage)?;
        self.flush()?;

        let mut v = [0u16; VOLTAGE_CHANNELS];
        for c in v.iter_mut() {
            *c = self.read_u16()?;
        }

        debug!("Voltages: {:04x?}", v);

        Ok(v)
    }

    /// Read the raw RTC registers
    pub fn rtc_get(&mut self) -> Result<RtcFields, Error<E>> {
        self.send_cmd(Command::RtcGet)?;
        self.flush()?;

        let mut rtc = [0u8; RTC_LEN];
        for f in rtc.iter_mut() {
            *f = self.read_u8()?;
        }

        debug!("RTC: {:02x?}", rtc);

        Ok(rtc)
    }

    /// Write the raw RTC registers, in the order returned by [`Session::rtc_get`].
    ///
    /// The device does not acknowledge this command.
    pub fn rtc_set(&mut self, rtc: &RtcFields) -> Result<(), Error<E>> {
        self.send_cmd(Command::RtcSet)?;

        for f in rtc.iter() {
            self.write_u8(*f)?;
        }

        self.flush()
    }

    /// Read `data.len()` bytes of device memory starting at `address`.
    ///
    /// `data` is left untouched if the read fails.
    pub fn read_mem(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error<E>> {
        debug!("Reading {} bytes at 0x{:08x}", data.len(), address);

        // Checked before anything reaches the wire
        let len = u32::try_from(data.len()).map_err(|_| Error::TransferTooLarge(data.len()))?;

        self.send_cmd(Command::MemRead)?;
        self.write_descriptor(address, len)?;
        self.flush()?;

        // `data` is only touched once the whole payload has arrived
        let mut buff = vec![0u8; data.len()];
        self.read_exact(&mut buff)?;
        data.copy_from_slice(&buff);

        Ok(())
    }

    /// Write `data` to device memory starting at `address`.
    ///
    /// The whole buffer is declared in a single descriptor, the device does
    /// not acknowledge the transfer.
    pub fn write_mem(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        debug!("Writing {} bytes at 0x{:08x}", data.len(), address);

        let len = u32::try_from(data.len()).map_err(|_| Error::TransferTooLarge(data.len()))?;

        self.send_cmd(Command::MemWrite)?;
        self.write_descriptor(address, len)?;
        self.write_all(data)?;

        self.flush()
    }

    /// Read `count` bytes out of the device FIFO
    pub fn fifo_read(&mut self, count: usize) -> Result<Vec<u8>, Error<E>> {
        let mut data = vec![0u8; count];
        self.read_mem(ADDR_FIFO, &mut data)?;
        Ok(data)
    }

    /// Push `data` into the device FIFO.
    ///
    /// No chunking is applied, the caller must know how much the device
    /// can absorb in one transfer.
    pub fn fifo_write(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        self.write_mem(ADDR_FIFO, data)
    }

    /// Write the header for `command`.
    ///
    /// Any payload the command expects must follow before the device will
    /// respond, nothing is read back here.
    pub fn send_cmd(&mut self, command: Command) -> Result<(), Error<E>> {
        debug!("Sending command {:?}", command);

        let h = command.header();
        self.write_all(h.as_bytes())
    }

    // Transfer descriptor: address, length, flags
    fn write_descriptor(&mut self, address: u32, len: u32) -> Result<(), Error<E>> {
        self.write_u32(address)?;
        self.write_u32(len)?;
        self.write_u8(XFER_FLAGS)
    }

    /// Write a single byte to the wire
    pub fn write_u8(&mut self, value: u8) -> Result<(), Error<E>> {
        self.write_all(&[value])
    }

    /// Write a big-endian 16-bit value to the wire
    pub fn write_u16(&mut self, value: u16) -> Result<(), Error<E>> {
        self.write_all(&value.to_be_bytes())
    }

    /// Write a big-endian 32-bit value to the wire
    pub fn write_u32(&mut self, value: u32) -> Result<(), Error<E>> {
        self.write_all(&value.to_be_bytes())
    }

    /// Block until a single byte is received
    pub fn read_u8(&mut self) -> Result<u8, Error<E>> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    /// Block until a big-endian 16-bit value is received
    pub fn read_u16(&mut self) -> Result<u16, Error<E>> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    /// Block until a big-endian 32-bit value is received
    pub fn read_u32(&mut self) -> Result<u32, Error<E>> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn port(&mut self) -> Result<&mut P, Error<E>> {
        self.port.as_mut().ok_or(Error::Disconnected)
    }

    /// Write every byte of `data`, retrying while the port would block
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        trace!("--> {:02x?}", data);

        let port = self.port()?;
        for b in data {
            block!(port.write(*b)).map_err(Error::Serial)?;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error<E>> {
        let port = self.port()?;
        block!(port.flush()).map_err(Error::Serial)
    }

    /// Fill `data` from the wire.
    ///
    /// On error the contents of `data` are unspecified.
    pub fn read_exact(&mut self, data: &mut [u8]) -> Result<(), Error<E>> {
        let mut n = 0;
        let mut t = 0u32;

        while n < data.len() {
            // Attempt to read from serial port
            match self.port()?.read() {
                Ok(v) => {
                    data[n] = v;
                    n += 1;
                    t = 0;
                    continue;
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => {
                    debug!("Serial error after {} of {} bytes", n, data.len());
                    return Err(Error::Serial(e));
                }
            }

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);

            // Every poll counts for at least 1ms so a zero delay still expires
            if let Some(timeout) = self.options.response_timeout_ms {
                t = t.saturating_add(self.options.poll_delay_ms.max(1));
                if t > timeout {
                    error!("Receive timeout after {} of {} bytes", n, data.len());
                    return Err(Error::ShortRead {
                        expected: data.len(),
                        received: n,
                    });
                }
            }
        }

        trace!("<-- {:02x?}", data);

        Ok(())
    }
}
