//! Bootloader command layer.
//!
//! One method per AN3155 command, each issuing its request frames and
//! awaiting the acknowledgements the protocol defines.  Every
//! request/response pair (except `sync`) is wrapped in a bounded low-level
//! retry: transient transport failures drain the input and try again, a
//! closed port is reopened first, and a NACK is reported to the caller
//! untouched so the session can charge it to the right budget.

use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::frame::{self, Command, Response};
use crate::transport::Transport;

/// Wall-clock budgets for the individual protocol phases.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    /// Waiting for the ACK of the sync byte.
    pub sync: Duration,
    /// Waiting for a normal command ACK.
    pub command: Duration,
    /// Waiting for the ACK that completes a sector erase.
    pub erase: Duration,
    /// Waiting for a read-back byte stream.
    pub read_data: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            sync: Duration::from_millis(200),
            command: Duration::from_millis(500),
            erase: Duration::from_secs(5),
            read_data: Duration::from_secs(1),
        }
    }
}

/// Bootloader protocol version, packed major/minor as the device reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolVersion(pub u8);

impl ProtocolVersion {
    pub fn major(&self) -> u8 {
        self.0 >> 4
    }

    pub fn minor(&self) -> u8 {
        self.0 & 0x0F
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Which erase command a device implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EraseKind {
    Standard,
    Extended,
}

/// Result of `GET`: protocol version and the raw supported command bytes.
#[derive(Clone, Debug)]
pub struct GetInfo {
    pub version: ProtocolVersion,
    pub commands: Vec<u8>,
}

impl GetInfo {
    pub fn supports(&self, command: Command) -> bool {
        self.commands.contains(&command.byte())
    }

    /// Picks the erase flavor from the advertised command set.  The two
    /// commands are mutually exclusive on real devices.
    pub fn erase_kind(&self) -> Result<EraseKind> {
        if self.supports(Command::ExtendedErase) {
            Ok(EraseKind::Extended)
        } else if self.supports(Command::Erase) {
            Ok(EraseKind::Standard)
        } else {
            Err(Error::InvalidRequest {
                command: "erase",
                reason: String::from("device advertises no erase command"),
            })
        }
    }
}

/// Driver for one bootloader conversation over a lent transport.
pub struct Bootloader<T> {
    transport: T,
    timeouts: Timeouts,
    retry_limit: u32,
    reopens: u32,
}

impl<T: Transport> Bootloader<T> {
    pub fn new(transport: T, timeouts: Timeouts, retry_limit: u32) -> Self {
        Self {
            transport,
            timeouts,
            retry_limit: retry_limit.max(1),
            reopens: 0,
        }
    }

    /// Number of transport reopens performed so far.
    pub fn reopens(&self) -> u32 {
        self.reopens
    }

    /// Discards stale input, e.g. before talking to a freshly entered
    /// bootloader.
    pub fn drain(&mut self) -> Result<()> {
        self.transport.drain()
    }

    /// Sends the baudrate sync byte.  Emitted exactly once per bootloader
    /// entry and never retried: the device detects the baud rate on this
    /// byte alone.
    ///
    /// A NACK here usually means the device was already synchronized, but
    /// can also follow a stray byte on the bus, so it is surfaced as a
    /// warning instead of being silently accepted.
    pub fn sync(&mut self) -> Result<()> {
        debug!("writing baudrate sync byte");
        self.transport
            .write(&[frame::SYNC_BYTE], self.timeouts.sync)?;
        let mut buf = [0u8];
        self.transport.read_exact(&mut buf, self.timeouts.sync)?;
        match frame::response(buf[0])? {
            Response::Ack => Ok(()),
            Response::Nack => {
                warn!("sync NACKed; treating the bootloader as already synchronized");
                Ok(())
            }
        }
    }

    /// `GET`: protocol version and supported commands.
    pub fn get(&mut self) -> Result<GetInfo> {
        self.request("GET", |t, to| {
            send_command(t, Command::Get, to)?;
            let mut count = [0u8];
            t.read_exact(&mut count, to.read_data)?;
            // Version byte plus `count` command bytes.
            let mut buf = vec![0u8; count[0] as usize + 1];
            t.read_exact(&mut buf, to.read_data)?;
            await_ack(t, to.command)?;
            let info = GetInfo {
                version: ProtocolVersion(buf[0]),
                commands: buf[1..].to_vec(),
            };
            trace!("GET: version {}, commands {:02X?}", info.version, info.commands);
            Ok(info)
        })
    }

    /// `GET_ID`: the 12-bit product ID.
    pub fn get_id(&mut self) -> Result<u16> {
        self.request("GET_ID", |t, to| {
            send_command(t, Command::GetId, to)?;
            let mut count = [0u8];
            t.read_exact(&mut count, to.read_data)?;
            let mut buf = vec![0u8; count[0] as usize + 1];
            t.read_exact(&mut buf, to.read_data)?;
            await_ack(t, to.command)?;
            if buf.len() != 2 {
                return Err(Error::ProtocolGarbage(count[0]));
            }
            let pid = u16::from_be_bytes(buf[..2].try_into().unwrap());
            debug!("GET_ID: 0x{pid:03X}");
            Ok(pid)
        })
    }

    /// `READ_MEMORY`: fills `buf` from `address`.
    pub fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() || buf.len() > frame::MAX_PAYLOAD {
            return Err(Error::InvalidRequest {
                command: "READ_MEMORY",
                reason: format!("{} bytes", buf.len()),
            });
        }
        let length = frame::read_length_frame(buf.len())?;
        self.request("READ_MEMORY", move |t, to| {
            send_command(t, Command::ReadMemory, to)?;
            t.write(&frame::address_frame(address), to.command)?;
            await_ack(t, to.command)?;
            t.write(&length, to.command)?;
            await_ack(t, to.command)?;
            t.read_exact(&mut buf[..], to.read_data)?;
            Ok(())
        })
    }

    /// `WRITE_MEMORY`: programs `bytes` at `address`.  The device only
    /// accepts word-aligned addresses and payload lengths that are a
    /// multiple of four.
    pub fn write_memory(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() || bytes.len() > frame::MAX_PAYLOAD || bytes.len() % 4 != 0 {
            return Err(Error::InvalidRequest {
                command: "WRITE_MEMORY",
                reason: format!("{} bytes", bytes.len()),
            });
        }
        if address % 4 != 0 {
            return Err(Error::InvalidRequest {
                command: "WRITE_MEMORY",
                reason: format!("unaligned address 0x{address:08X}"),
            });
        }
        let payload = frame::length_payload_frame(bytes)?;
        self.request("WRITE_MEMORY", move |t, to| {
            send_command(t, Command::WriteMemory, to)?;
            t.write(&frame::address_frame(address), to.command)?;
            await_ack(t, to.command)?;
            t.write(&payload, to.command)?;
            // The device acknowledges once the flash write finished.
            await_ack(t, to.command)?;
            Ok(())
        })
    }

    /// Erases a single sector.  One sector per invocation keeps a failing
    /// sector retryable in isolation.
    pub fn erase_sector(&mut self, sector: u16, kind: EraseKind) -> Result<()> {
        info!("erasing sector {sector}");
        let list = match kind {
            EraseKind::Standard => {
                if sector > u8::MAX as u16 {
                    return Err(Error::InvalidRequest {
                        command: "ERASE",
                        reason: format!("sector {sector} needs extended erase"),
                    });
                }
                frame::erase_page_list(&[sector as u8])?
            }
            EraseKind::Extended => frame::extended_erase_list(&[sector])?,
        };
        let command = match kind {
            EraseKind::Standard => Command::Erase,
            EraseKind::Extended => Command::ExtendedErase,
        };
        self.request("ERASE", move |t, to| {
            send_command(t, command, to)?;
            t.write(&list, to.command)?;
            await_ack(t, command.ack_timeout(to))?;
            Ok(())
        })
    }

    /// `GO`: jumps to `address`.  After the address is acknowledged the
    /// device leaves the bootloader, so nothing further is expected.
    pub fn go(&mut self, address: u32) -> Result<()> {
        info!("starting application at 0x{address:08X}");
        self.request("GO", move |t, to| {
            send_command(t, Command::Go, to)?;
            t.write(&frame::address_frame(address), to.command)?;
            await_ack(t, to.command)?;
            Ok(())
        })
    }

    /// Runs one request/response closure under the low-level retry budget.
    fn request<R>(
        &mut self,
        name: &'static str,
        mut exchange: impl FnMut(&mut T, &Timeouts) -> Result<R>,
    ) -> Result<R> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match exchange(&mut self.transport, &self.timeouts) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match error {
                // The caller decides what a NACK means for this command.
                Error::CommandRejected => return Err(error),
                Error::TransportClosed(_) if attempt < self.retry_limit => {
                    warn!("{name}: transport closed, reopening (attempt {attempt})");
                    self.transport.reopen()?;
                    self.reopens += 1;
                }
                ref e if e.is_transient() && attempt < self.retry_limit => {
                    debug!("{name}: {error}, retrying (attempt {attempt})");
                    let _ = self.transport.drain();
                }
                _ => return Err(error),
            }
        }
    }
}

fn send_command<T: Transport>(t: &mut T, command: Command, timeouts: &Timeouts) -> Result<()> {
    trace!("sending command {command:?}");
    t.write(&frame::command_frame(command), timeouts.command)?;
    await_ack(t, timeouts.command)
}

fn await_ack<T: Transport>(t: &mut T, timeout: Duration) -> Result<()> {
    let mut buf = [0u8];
    t.read_exact(&mut buf, timeout)?;
    match frame::response(buf[0])? {
        Response::Ack => Ok(()),
        Response::Nack => Err(Error::CommandRejected),
    }
}
