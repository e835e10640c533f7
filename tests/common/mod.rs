//! Mock transports shared by the integration tests

// Not every test file uses every helper
#![allow(dead_code, unused_imports)]

use std::collections::{HashMap, VecDeque};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

pub use everdrive_loader::protocol::*;
pub use everdrive_loader::{DeviceInfo, Error, Options, Session, State};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum MockError {
    /// Nothing left to read
    Closed,
    /// Injected write failure
    Broken,
}

/// Delay that returns immediately and counts the time it should have taken
#[derive(Default, Debug)]
pub struct MockDelay {
    pub elapsed_ms: u64,
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += u64::from(ms);
    }
}

/// Scripted port: replies are preloaded, writes are captured
#[derive(Default, Debug)]
pub struct MockPort {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    /// Successful byte reads
    pub reads: usize,
    pub flushes: usize,
    /// Report `WouldBlock` instead of `Closed` once `rx` runs dry
    pub starve: bool,
    /// Interleave `WouldBlock` with every write and read
    pub stutter: bool,
    /// Fail writes once this many bytes have been accepted
    pub fail_after: Option<usize>,
    /// Report `WouldBlock` for this many reads before replying
    pub stall: usize,
    blocked: bool,
}

impl MockPort {
    pub fn new(reply: &[u8]) -> Self {
        Self {
            rx: reply.iter().cloned().collect(),
            ..Default::default()
        }
    }

    fn stutter(&mut self) -> bool {
        if !self.stutter {
            return false;
        }
        self.blocked = !self.blocked;
        self.blocked
    }
}

impl Write<u8> for MockPort {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        if self.stutter() {
            return Err(nb::Error::WouldBlock);
        }
        if let Some(n) = self.fail_after {
            if self.tx.len() >= n {
                return Err(nb::Error::Other(MockError::Broken));
            }
        }

        self.tx.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        self.flushes += 1;
        Ok(())
    }
}

impl Read<u8> for MockPort {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        if self.stutter() {
            return Err(nb::Error::WouldBlock);
        }
        if self.stall > 0 {
            self.stall -= 1;
            return Err(nb::Error::WouldBlock);
        }

        match self.rx.pop_front() {
            Some(b) => {
                self.reads += 1;
                Ok(b)
            }
            None if self.starve => Err(nb::Error::WouldBlock),
            None => Err(nb::Error::Other(MockError::Closed)),
        }
    }
}

pub type MockSession = Session<MockPort, MockDelay, MockError>;

pub fn mock_session(reply: &[u8]) -> MockSession {
    Session::with_port(MockPort::new(reply), MockDelay::default(), Options::default())
}

/// Hand back the port so captured traffic can be inspected
pub fn port(mut s: MockSession) -> MockPort {
    s.release().expect("session has no port")
}

/// Device simulator that decodes requests as they are written and queues replies
#[derive(Debug)]
pub struct LoopbackDevice {
    pub memory: HashMap<u32, u8>,
    pub status: u16,
    pub extended: u32,
    pub voltage: [u16; VOLTAGE_CHANNELS],
    pub rtc: RtcFields,
    /// Commands fully received, in order
    pub commands: Vec<Command>,
    pending: Vec<u8>,
    rx: VecDeque<u8>,
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self {
            memory: HashMap::new(),
            status: 0xA500,
            extended: 0x5A05_1800,
            voltage: [0x1388, 0x0CE4, 0x0000, 0x2EE0],
            rtc: [0x30, 0x15, 0x12, 0x19, 0x10, 0x26],
            commands: vec![],
            pending: vec![],
            rx: VecDeque::new(),
        }
    }
}

impl LoopbackDevice {
    fn descriptor(&self) -> Option<(u32, u32)> {
        if self.pending.len() < HEADER_LEN + 9 {
            return None;
        }

        let d = &self.pending[HEADER_LEN..];
        let addr = u32::from_be_bytes([d[0], d[1], d[2], d[3]]);
        let len = u32::from_be_bytes([d[4], d[5], d[6], d[7]]);
        assert_eq!(d[8], XFER_FLAGS, "unexpected descriptor flags");

        Some((addr, len))
    }

    fn process(&mut self) {
        if self.pending.len() < HEADER_LEN {
            return;
        }

        let mut h = [0u8; HEADER_LEN];
        h.copy_from_slice(&self.pending[..HEADER_LEN]);
        let cmd = Header::parse(h).expect("corrupt header");

        match cmd {
            Command::Status => self.rx.extend(&self.status.to_be_bytes()),
            Command::ExtendedStatus => self.rx.extend(&self.extended.to_be_bytes()),
            Command::GetVoltage => {
                for v in self.voltage.iter() {
                    self.rx.extend(&v.to_be_bytes());
                }
            }
            Command::RtcGet => self.rx.extend(&self.rtc),
            Command::RtcSet => {
                if self.pending.len() < HEADER_LEN + RTC_LEN {
                    return;
                }
                self.rtc.copy_from_slice(&self.pending[HEADER_LEN..]);
            }
            Command::MemRead => {
                let (addr, len) = match self.descriptor() {
                    Some(d) => d,
                    None => return,
                };
                for i in 0..len {
                    let b = self.memory.get(&(addr + i)).cloned().unwrap_or(0);
                    self.rx.push_back(b);
                }
            }
            Command::MemWrite => {
                let (addr, len) = match self.descriptor() {
                    Some(d) => d,
                    None => return,
                };
                if self.pending.len() < HEADER_LEN + 9 + len as usize {
                    return;
                }
                for (i, b) in self.pending[HEADER_LEN + 9..].iter().enumerate() {
                    self.memory.insert(addr + i as u32, *b);
                }
            }
        }

        self.commands.push(cmd);
        self.pending.clear();
    }
}

impl Write<u8> for LoopbackDevice {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        self.pending.push(word);
        self.process();
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        Ok(())
    }
}

impl Read<u8> for LoopbackDevice {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        self.rx.pop_front().ok_or(nb::Error::Other(MockError::Closed))
    }
}

pub type LoopbackSession = Session<LoopbackDevice, MockDelay, MockError>;

pub fn loopback_session() -> LoopbackSession {
    Session::with_port(LoopbackDevice::default(), MockDelay::default(), Options::default())
}
