use thiserror::Error as ThisError;

/// Error kinds surfaced by the programming core.
///
/// Transport and protocol kinds are retried by the command layer; the
/// remaining kinds carry the terminal outcome of a session or of the
/// whole run.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("serial transport timed out")]
    TransportTimeout,

    #[error("serial transport closed: {0}")]
    TransportClosed(String),

    #[error("serial transport I/O error: {0}")]
    TransportIo(String),

    #[error("unexpected byte from bootloader: 0x{0:02X}")]
    ProtocolGarbage(u8),

    #[error("command rejected by bootloader (NACK)")]
    CommandRejected,

    #[error(
        "verify mismatch at 0x{address:08X}+{offset}: wrote 0x{expected:02X}, read 0x{actual:02X}"
    )]
    VerifyMismatch {
        address: u32,
        offset: usize,
        expected: u8,
        actual: u8,
    },

    #[error("sector {0} not blank after erase")]
    EraseCheckFailed(u16),

    #[error("unsupported device: product id 0x{0:03X}")]
    UnsupportedDevice(u16),

    #[error("sector {0} could not be programmed within the retry budget")]
    SectorUnrecoverable(u16),

    #[error("context hook failed: {0}")]
    Hook(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid programming plan: {0}")]
    Plan(String),

    #[error("invalid firmware image: {0}")]
    Image(String),

    #[error("invalid target list: {0}")]
    TargetSpec(String),

    #[error("invalid {command} request: {reason}")]
    InvalidRequest {
        command: &'static str,
        reason: String,
    },
}

impl Error {
    /// Kinds the command layer may retry after a drain (or, for a closed
    /// port, after a reopen).
    pub(crate) fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransportTimeout
                | Error::TransportClosed(_)
                | Error::TransportIo(_)
                | Error::ProtocolGarbage(_)
        )
    }

    /// Kinds that consume one attempt of an erase or write/verify budget
    /// instead of aborting the session outright.
    pub(crate) fn consumes_attempt(&self) -> bool {
        matches!(
            self,
            Error::CommandRejected
                | Error::VerifyMismatch { .. }
                | Error::EraseCheckFailed(_)
                | Error::TransportTimeout
                | Error::TransportIo(_)
                | Error::ProtocolGarbage(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::TransportTimeout,
            ErrorKind::NotFound | ErrorKind::BrokenPipe | ErrorKind::PermissionDenied => {
                Error::TransportClosed(e.to_string())
            }
            _ => Error::TransportIo(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
