//! Error types.
//!
//! Every failure that reaches a client is reduced to a POSIX errno and sent
//! as a negative return code. The variants keep enough detail to tell a
//! transport failure from a device that did not cooperate from a request that
//! made no sense.

use std::io;

use thiserror::Error;

pub use nix::errno::Errno;

/// Errno constants, re-exported for `use rsow::errno::*`.
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// A failed step while talking to a device on the bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("no presence pulse on bus")]
    NoPresence,

    #[error("echo mismatch: sent {sent:02X?}, read back {echoed:02X?}")]
    Echo { sent: Vec<u8>, echoed: Vec<u8> },

    #[error("CRC8 check failed")]
    Crc8,

    #[error("CRC16 check failed")]
    Crc16,

    #[error("device did not have data ready")]
    NotReady,

    #[error("short transfer: wanted {wanted} bytes, got {got}")]
    Short { wanted: usize, got: usize },

    #[error("readback differs from data written")]
    Verify,
}

#[derive(Debug, Error)]
pub enum Error {
    /// A request-level error carried as an errno.
    #[error("{0}")]
    No(Errno),

    /// Transport failure on a socket or adapter.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Device communication failure.
    #[error("bus transaction failed: {0}")]
    Transaction(#[from] TransactionError),
}

impl Error {
    /// The errno sent to clients for this error.
    pub fn errno(&self) -> Errno {
        match *self {
            Error::No(e) => e,
            Error::Io(ref e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
            Error::Transaction(_) => Errno::EIO,
        }
    }

    /// Device communication failures are the only errors worth repeating.
    pub fn is_retryable(&self) -> bool {
        matches!(*self, Error::Transaction(_))
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::No(e)
    }
}
