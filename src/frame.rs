//! ST AN3155 frame codec.
//!
//! Every request on the wire is one of three frame shapes: a command frame
//! (`[CMD, CMD ^ 0xFF]`), an address frame (four big-endian bytes plus their
//! XOR), or a length-prefixed payload (`[N-1, payload, XOR(N-1, payload)]`).
//! Responses are a single byte, ACK or NACK.

use std::time::Duration;

use crate::bootloader::Timeouts;
use crate::error::{Error, Result};

/// Baudrate sync byte sent once per session before the first command.
pub const SYNC_BYTE: u8 = 0x7F;

/// Accepted
pub const ACK: u8 = 0x79;
/// Not accepted
pub const NACK: u8 = 0x1F;

/// Maximum payload of a single read or write memory command.
pub const MAX_PAYLOAD: usize = u8::MAX as usize + 1;

/// Mass-erase sentinel for the standard erase command.
pub const MASS_ERASE: [u8; 2] = [0xFF, 0x00];

/// Special extended-erase sentinels (two-byte codes, checksum appended by
/// [`extended_erase_special`]).
pub const EXT_MASS_ERASE: u16 = 0xFFFF;
pub const EXT_BANK1_ERASE: u16 = 0xFFFE;
pub const EXT_BANK2_ERASE: u16 = 0xFFFD;

/// Bootloader commands used by this tool.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Gets the protocol version and the command set supported by the device.
    Get = 0x00,
    /// Gets the chip product ID.
    GetId = 0x02,
    /// Reads up to 256 bytes of memory starting from a given address.
    ReadMemory = 0x11,
    /// Jumps to application code at a given address.
    Go = 0x21,
    /// Writes up to 256 bytes to RAM or flash starting from a given address.
    WriteMemory = 0x31,
    /// Erases flash sectors given as one-byte indices.
    Erase = 0x43,
    /// Erases flash sectors given as two-byte indices (bootloader v3.0+).
    ExtendedErase = 0x44,
}

impl Command {
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// How long to wait for the final ACK of this command.
    ///
    /// Erases run for seconds on large sectors; everything else answers
    /// within the normal command window.
    pub fn ack_timeout(self, timeouts: &Timeouts) -> Duration {
        match self {
            Command::Erase | Command::ExtendedErase => timeouts.erase,
            _ => timeouts.command,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0x00 => Ok(Self::Get),
            0x02 => Ok(Self::GetId),
            0x11 => Ok(Self::ReadMemory),
            0x21 => Ok(Self::Go),
            0x31 => Ok(Self::WriteMemory),
            0x43 => Ok(Self::Erase),
            0x44 => Ok(Self::ExtendedErase),
            other => Err(Error::ProtocolGarbage(other)),
        }
    }
}

/// Single-byte response from the bootloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Response {
    Ack,
    Nack,
}

/// Decodes a response byte.  Anything that is neither ACK nor NACK is noise
/// on the bus and must not be interpreted.
pub fn response(byte: u8) -> Result<Response> {
    match byte {
        ACK => Ok(Response::Ack),
        NACK => Ok(Response::Nack),
        other => Err(Error::ProtocolGarbage(other)),
    }
}

/// XOR of all bytes, the protocol's checksum.
pub fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ *b)
}

pub fn command_frame(command: Command) -> [u8; 2] {
    let byte = command.byte();
    [byte, byte ^ 0xFF]
}

pub fn address_frame(address: u32) -> [u8; 5] {
    let bytes = address.to_be_bytes();
    [
        bytes[0],
        bytes[1],
        bytes[2],
        bytes[3],
        xor(&bytes),
    ]
}

/// `[N-1, payload, XOR]` for 1..=256 payload bytes.
pub fn length_payload_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD {
        return Err(Error::InvalidRequest {
            command: "length-payload",
            reason: format!("payload of {} bytes", payload.len()),
        });
    }
    let n = (payload.len() - 1) as u8;
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(n);
    frame.extend_from_slice(payload);
    frame.push(n ^ xor(payload));
    Ok(frame)
}

/// `[N-1, !(N-1)]` announcing how many bytes a read should return.
pub fn read_length_frame(count: usize) -> Result<[u8; 2]> {
    if count == 0 || count > MAX_PAYLOAD {
        return Err(Error::InvalidRequest {
            command: "read length",
            reason: format!("{count} bytes"),
        });
    }
    let n = (count - 1) as u8;
    Ok([n, n ^ 0xFF])
}

/// Standard erase page list: `[N-1, pages, XOR]`.
pub fn erase_page_list(pages: &[u8]) -> Result<Vec<u8>> {
    if pages.is_empty() || pages.len() > u8::MAX as usize {
        return Err(Error::InvalidRequest {
            command: "erase",
            reason: format!("{} pages", pages.len()),
        });
    }
    let n = (pages.len() - 1) as u8;
    let mut frame = Vec::with_capacity(pages.len() + 2);
    frame.push(n);
    frame.extend_from_slice(pages);
    frame.push(n ^ xor(pages));
    Ok(frame)
}

/// Extended erase page list: big-endian u16 count minus one, big-endian u16
/// page numbers, XOR over all preceding bytes.
pub fn extended_erase_list(pages: &[u16]) -> Result<Vec<u8>> {
    if pages.is_empty() || pages.len() > (EXT_BANK2_ERASE - 1) as usize {
        return Err(Error::InvalidRequest {
            command: "extended erase",
            reason: format!("{} pages", pages.len()),
        });
    }
    let n = (pages.len() - 1) as u16;
    let mut frame = Vec::with_capacity(2 * pages.len() + 3);
    frame.extend_from_slice(&n.to_be_bytes());
    for page in pages {
        frame.extend_from_slice(&page.to_be_bytes());
    }
    frame.push(xor(&frame));
    Ok(frame)
}

/// Extended-erase special request (mass or bank erase) with its checksum.
pub fn extended_erase_special(code: u16) -> [u8; 3] {
    let bytes = code.to_be_bytes();
    [bytes[0], bytes[1], bytes[0] ^ bytes[1]]
}

/// Decodes a command frame, rejecting a bad complement byte.
pub fn parse_command_frame(frame: &[u8; 2]) -> Result<Command> {
    if frame[1] != frame[0] ^ 0xFF {
        return Err(Error::ProtocolGarbage(frame[1]));
    }
    Command::try_from(frame[0])
}

/// Decodes an address frame, rejecting a bad checksum.
pub fn parse_address_frame(frame: &[u8; 5]) -> Result<u32> {
    if xor(&frame[..4]) != frame[4] {
        return Err(Error::ProtocolGarbage(frame[4]));
    }
    Ok(u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]))
}

/// Decodes a `[N-1, payload, XOR]` frame and returns the payload.
pub fn parse_length_payload(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < 3 {
        return Err(Error::ProtocolGarbage(*frame.last().unwrap_or(&0)));
    }
    let n = frame[0] as usize + 1;
    if frame.len() != n + 2 {
        return Err(Error::ProtocolGarbage(frame[0]));
    }
    let payload = &frame[1..1 + n];
    if frame[0] ^ xor(payload) != frame[n + 1] {
        return Err(Error::ProtocolGarbage(frame[n + 1]));
    }
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_round_trip() {
        for command in [
            Command::Get,
            Command::GetId,
            Command::ReadMemory,
            Command::Go,
            Command::WriteMemory,
            Command::Erase,
            Command::ExtendedErase,
        ] {
            let frame = command_frame(command);
            assert_eq!(frame[1], frame[0] ^ 0xFF);
            assert_eq!(parse_command_frame(&frame).unwrap(), command);
        }
    }

    #[test]
    fn command_frame_rejects_bad_complement() {
        let mut frame = command_frame(Command::Get);
        frame[1] ^= 0x01;
        assert!(matches!(
            parse_command_frame(&frame),
            Err(Error::ProtocolGarbage(_))
        ));
    }

    #[test]
    fn address_frame_round_trip() {
        for address in [0x0000_0000, 0x0800_0000, 0x0807_FFFF, 0xFFFF_FFFF] {
            let frame = address_frame(address);
            assert_eq!(frame[4], xor(&frame[..4]));
            assert_eq!(parse_address_frame(&frame).unwrap(), address);
        }
    }

    #[test]
    fn length_payload_round_trip() {
        for len in [1usize, 2, 255, 256] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let frame = length_payload_frame(&payload).unwrap();
            assert_eq!(frame[0], (len - 1) as u8);
            assert_eq!(*frame.last().unwrap(), xor(&frame[..frame.len() - 1]));
            assert_eq!(parse_length_payload(&frame).unwrap(), payload);
        }
    }

    #[test]
    fn length_payload_rejects_empty_and_oversized() {
        assert!(length_payload_frame(&[]).is_err());
        assert!(length_payload_frame(&[0u8; 257]).is_err());
    }

    #[test]
    fn read_length_frame_is_complemented() {
        let frame = read_length_frame(256).unwrap();
        assert_eq!(frame, [0xFF, 0x00]);
        let frame = read_length_frame(1).unwrap();
        assert_eq!(frame, [0x00, 0xFF]);
    }

    #[test]
    fn erase_list_checksums() {
        let frame = erase_page_list(&[0, 1, 2]).unwrap();
        assert_eq!(frame[0], 2);
        assert_eq!(*frame.last().unwrap(), 2 ^ 0 ^ 1 ^ 2);

        let frame = extended_erase_list(&[0x0004]).unwrap();
        assert_eq!(&frame[..4], &[0x00, 0x00, 0x00, 0x04]);
        assert_eq!(frame[4], 0x04);
    }

    #[test]
    fn erase_sentinels() {
        assert_eq!(MASS_ERASE, [0xFF, 0x00]);
        assert_eq!(extended_erase_special(EXT_MASS_ERASE), [0xFF, 0xFF, 0x00]);
        assert_eq!(extended_erase_special(EXT_BANK1_ERASE), [0xFF, 0xFE, 0x01]);
        assert_eq!(extended_erase_special(EXT_BANK2_ERASE), [0xFF, 0xFD, 0x02]);
    }

    #[test]
    fn response_decoding() {
        assert_eq!(response(ACK).unwrap(), Response::Ack);
        assert_eq!(response(NACK).unwrap(), Response::Nack);
        assert!(matches!(response(0x55), Err(Error::ProtocolGarbage(0x55))));
    }
}
