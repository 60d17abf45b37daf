//! Byte-level serial transport.
//!
//! The transport moves raw bytes with wall-clock timeouts and never
//! interprets payload.  A closed port (unplugged USB-RS485 dongle) can be
//! re-established with [`Transport::reopen`]; whether the in-flight
//! operation is retried is the caller's decision.

use std::io::{Read, Write};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{Error, Result};

/// Default baud rate of the ST UART bootloader setup targeted here.
pub const DEFAULT_BAUDRATE: u32 = 115_200;

/// Blocking byte transport with per-call timeouts.
pub trait Transport {
    /// Writes all bytes, completing within `timeout`.
    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<()>;

    /// Reads exactly `buf.len()` bytes, completing within `timeout`.
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()>;

    /// Discards everything pending in the receive buffer.
    fn drain(&mut self) -> Result<()>;

    /// Re-establishes a closed connection with the original settings.
    fn reopen(&mut self) -> Result<()>;
}

/// [`Transport`] backed by a system serial port, 8E1 as AN3155 requires.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    /// Opens `path` at `baud_rate` with even parity, eight data bits and one
    /// stop bit.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = Self::build(path, baud_rate)?;
        Ok(Self {
            path: path.to_owned(),
            baud_rate,
            port: Some(port),
        })
    }

    fn build(path: &str, baud_rate: u32) -> Result<Box<dyn serialport::SerialPort>> {
        debug!("opening serial port: {path} {baud_rate} 8E1");
        serialport::new(path, baud_rate)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::One)
            .data_bits(serialport::DataBits::Eight)
            .timeout(Duration::from_secs(1))
            .open()
            .map_err(from_serial_error)
    }

    pub fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("closing serial port: {}", self.path);
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::TransportClosed(String::from("port is not open")))
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port()?.set_timeout(timeout).map_err(from_serial_error)
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<()> {
        self.set_timeout(timeout)?;
        let port = self.port()?;
        trace!("tx {} bytes: {:02X?}", bytes.len(), bytes);
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        self.set_timeout(timeout)?;
        let port = self.port()?;
        port.read_exact(buf)?;
        trace!("rx {} bytes: {:02X?}", buf.len(), buf);
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        let port = self.port()?;
        let pending = port.bytes_to_read().map_err(from_serial_error)?;
        if pending > 0 {
            debug!("draining {pending} stale bytes");
        }
        port.clear(serialport::ClearBuffer::Input)
            .map_err(from_serial_error)
    }

    fn reopen(&mut self) -> Result<()> {
        warn!("reopening serial port: {}", self.path);
        self.port = None;
        let port = Self::build(&self.path, self.baud_rate)?;
        self.port = Some(port);
        Ok(())
    }
}

fn from_serial_error(e: serialport::Error) -> Error {
    match e.kind() {
        serialport::ErrorKind::NoDevice => Error::TransportClosed(e.to_string()),
        serialport::ErrorKind::Io(kind) => Error::from(std::io::Error::from(kind)),
        _ => Error::TransportIo(e.to_string()),
    }
}
