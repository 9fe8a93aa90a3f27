//! Crate-wide error taxonomy
//!
//! Callers are expected to match on the variant class rather than the message
//! text: `InvalidArgument` means the caller broke a documented precondition,
//! `Runtime` means a call arrived in the wrong lifecycle phase, and
//! `DeviceIo` wraps a register transaction failure with the offset and
//! transfer direction attached.

use std::fmt;
use std::io;

use thiserror::Error;

/// Transfer direction attached to device I/O failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MsrflowError {
    /// A caller-supplied value or handle is out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A call arrived out of lifecycle order.
    #[error("runtime contract violation: {0}")]
    Runtime(String),

    /// A register device transaction failed.
    #[error("register {direction} failed at offset {offset:#x}: {source}")]
    DeviceIo {
        offset: u64,
        direction: Direction,
        source: io::Error,
    },

    /// A per-cpu register device could not be opened under any driver.
    #[error("failed to open register device for cpu {cpu}: {source}")]
    DeviceOpen { cpu: u32, source: io::Error },

    /// The requested operation exists but has no implementation here.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A named signal, control, or domain instance does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A value does not fit the register field it targets.
    #[error("field overflow: {0}")]
    Overflow(String),

    /// Malformed metadata or control-file input.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("field codec error: {0}")]
    Field(#[from] msrflow_raw::FieldError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, MsrflowError>;

/// Map a nix errno to a [`MsrflowError::DeviceIo`] for the given access.
pub fn device_io(offset: u64, direction: Direction, errno: nix::Error) -> MsrflowError {
    MsrflowError::DeviceIo {
        offset,
        direction,
        source: io::Error::from_raw_os_error(errno as i32),
    }
}
