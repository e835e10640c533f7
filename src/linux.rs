use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{Options, Session};

/// Session over a linux tty
pub type LinuxSession = Session<Serial, Delay, IoErrorKind>;

impl Session<Serial, Delay, IoErrorKind> {
    /// Open and configure a serial port, then attach it to a new session
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let path = port.as_ref();
        let mut port = Serial::open(path)?;

        // Raw 8N1, the USB CDC link ignores the baud rate but the tty layer does not
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        debug!("Opened serial port {}", path.display());

        // Return instance
        Ok(Self::with_port(port, Delay {}, options))
    }
}
