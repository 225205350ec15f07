//! Error taxonomy for the marshaller.
//!
//! Everything except [`IoctlError::Failure`] is detected before the native
//! call is made.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::buffer::ByteOrder;
use crate::scratch::ScratchSlot;

/// Errors returned by both ioctl entry points.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoctlError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] ArgumentError),

    #[error("{kind} offset {offset} outside payload of {capacity} bytes")]
    OutOfBounds {
        kind: OffsetKind,
        offset: isize,
        capacity: usize,
    },

    #[error(
        "scratch buffer overrun: {requested} bytes requested, capacity is {capacity}; \
         supply a stable buffer for larger data"
    )]
    ScratchBufferOverrun { requested: usize, capacity: usize },

    #[error("{slot} scratch buffer is already in use on this thread; ioctl calls cannot nest")]
    Reentrant { slot: ScratchSlot },

    #[error("invalid POSIX file descriptor: {fd}")]
    InvalidDescriptor { fd: RawFd },

    #[error("ioctl failed: {}", io::Error::from_raw_os_error(*errno))]
    Failure { errno: i32 },
}

/// Caller mistakes reported through [`IoctlError::InvalidArgument`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("payload pointer is null")]
    NullPayload,

    #[error("offset table pointer is null")]
    NullOffsets,

    #[error("offset table pointer is not aligned to {align} bytes")]
    MisalignedOffsets { align: usize },

    #[error("offset table must have an even number of entries, got {count}")]
    OddOffsetCount { count: usize },

    #[error("offset table of {len} bytes is not a whole number of {word_size}-byte words")]
    RaggedOffsets { len: usize, word_size: usize },

    #[error("offset table byte order must be native ({native}), got {requested}")]
    ByteOrder {
        requested: ByteOrder,
        native: ByteOrder,
    },

    #[error("window {start}..{end} exceeds stable buffer of {len} bytes")]
    Window { start: usize, end: usize, len: usize },
}

/// Which half of a relocation pair an out-of-bounds offset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetKind {
    /// Where the pointer is written.
    Hole,
    /// What the pointer points at.
    Target,
}

impl fmt::Display for OffsetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetKind::Hole => f.write_str("hole"),
            OffsetKind::Target => f.write_str("target"),
        }
    }
}

impl IoctlError {
    /// POSIX error code reported by the driver, if the native call failed.
    pub fn errno(&self) -> Option<i32> {
        match self {
            IoctlError::Failure { errno } => Some(*errno),
            _ => None,
        }
    }
}

impl From<IoctlError> for io::Error {
    fn from(err: IoctlError) -> Self {
        match err {
            IoctlError::Failure { errno } => io::Error::from_raw_os_error(errno),
            other => io::Error::new(io::ErrorKind::InvalidInput, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, IoctlError>;
