//! Mega EverDrive USB protocol definitions
//!
//! Every request starts with a four byte header carrying a sentinel and a
//! command byte, each followed by its bitwise complement. All multi-byte
//! fields on the wire are big-endian.

use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

/// Header sentinel (`+`)
pub const CMD_PREAMBLE: u8 = b'+';

/// Header length in bytes
pub const HEADER_LEN: usize = 4;

pub const HDR_PREAMBLE: usize = 0;
pub const HDR_PREAMBLE_INV: usize = 1;
pub const HDR_CMD: usize = 2;
pub const HDR_CMD_INV: usize = 3;

pub const STATUS_MASK: u16 = 0xFF00;
pub const STATUS_CHECK: u16 = 0xA500;

pub const STATUS2_CHECK: u8 = 0x5A;
pub const PROTOCOL_ID: u8 = 0x05;

/// Device ingress / egress FIFO
pub const ADDR_FIFO: u32 = 0x0181_0000;

/// Flags byte sent with every transfer descriptor
pub const XFER_FLAGS: u8 = 0x00;

/// Number of voltage channels returned by [`Command::GetVoltage`]
pub const VOLTAGE_CHANNELS: usize = 4;

/// Number of octets exchanged by the RTC commands
pub const RTC_LEN: usize = 6;

/// Raw RTC register values, in device order
pub type RtcFields = [u8; RTC_LEN];

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    /// Fetch the 16-bit status word
    Status = 0x10,

    /// Read the four supply voltage channels
    GetVoltage = 0x13,

    /// Read the real time clock
    RtcGet = 0x14,

    /// Write the real time clock, no reply
    RtcSet = 0x15,

    /// Read memory at a given address
    MemRead = 0x19,

    /// Write memory at a given address, no reply
    MemWrite = 0x1A,

    /// Fetch the 32-bit identification word
    ExtendedStatus = 0x40,
}

impl Command {
    pub fn header(self) -> Header {
        Header::new(self)
    }
}

/// Request header, `[+, !+, cmd, !cmd]`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header([u8; HEADER_LEN]);

/// Reasons a received header can be rejected
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("bad preamble 0x{0:02x}")]
    Preamble(u8),
    #[error("preamble complement mismatch")]
    PreambleComplement,
    #[error("command complement mismatch")]
    CommandComplement,
    #[error("unknown command 0x{0:02x}")]
    UnknownCommand(u8),
}

impl Header {
    pub fn new(command: Command) -> Self {
        let c: u8 = command.into();

        let mut h = [0u8; HEADER_LEN];
        h[HDR_PREAMBLE] = CMD_PREAMBLE;
        h[HDR_PREAMBLE_INV] = !CMD_PREAMBLE;
        h[HDR_CMD] = c;
        h[HDR_CMD_INV] = !c;

        Self(h)
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.0
    }

    /// Validate a header and resolve its command
    pub fn parse(data: [u8; HEADER_LEN]) -> Result<Command, HeaderError> {
        if data[HDR_PREAMBLE] != CMD_PREAMBLE {
            return Err(HeaderError::Preamble(data[HDR_PREAMBLE]));
        }
        if data[HDR_PREAMBLE_INV] != !data[HDR_PREAMBLE] {
            return Err(HeaderError::PreambleComplement);
        }
        if data[HDR_CMD_INV] != !data[HDR_CMD] {
            return Err(HeaderError::CommandComplement);
        }

        Command::try_from_primitive(data[HDR_CMD]).map_err(|e| HeaderError::UnknownCommand(e.number))
    }
}

/// Hardware variant reported in the extended status word
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum DeviceKind {
    Pro = 0x18,
    Core = 0x25,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl DeviceKind {
    pub fn is_known(&self) -> bool {
        !matches!(self, DeviceKind::Unknown(_))
    }
}

impl core::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DeviceKind::Pro => write!(f, "pro"),
            DeviceKind::Core => write!(f, "core"),
            DeviceKind::Unknown(id) => write!(f, "unknown (0x{:02x})", id),
        }
    }
}

/// Reply to [`Command::Status`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub raw: u16,
    pub trusted: bool,
}

impl From<u16> for Status {
    fn from(raw: u16) -> Self {
        Self {
            raw,
            trusted: raw & STATUS_MASK == STATUS_CHECK,
        }
    }
}

/// Reply to [`Command::ExtendedStatus`]
///
/// Bits 31..24 carry a check byte, 23..16 the protocol id, 15..8 the
/// device id. The low byte is reserved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExtendedStatus {
    pub raw: u32,
    pub check: u8,
    pub protocol_id: u8,
    pub device: DeviceKind,
    /// Check byte and protocol id both matched
    pub trusted: bool,
}

impl From<u32> for ExtendedStatus {
    fn from(raw: u32) -> Self {
        let [check, protocol_id, device_id, _reserved] = raw.to_be_bytes();

        Self {
            raw,
            check,
            protocol_id,
            device: DeviceKind::from(device_id),
            trusted: check == STATUS2_CHECK && protocol_id == PROTOCOL_ID,
        }
    }
}
