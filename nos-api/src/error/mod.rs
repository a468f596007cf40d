//! Error handling module for the NOS virtual memory subsystem

use core::fmt;
use alloc::string::{String, ToString};

use crate::core::types::{MapId, RawVirtAddr};

/// Why an `mmap` request was refused.
///
/// A rejected mapping has no effect on the caller's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapRejection {
    /// The descriptor is standard input or standard output
    ReservedDescriptor,
    /// The descriptor does not name an open file
    BadDescriptor,
    /// The file could not be reopened for the mapping
    Unreadable,
    /// The file has no bytes to map
    EmptyFile,
    /// The start address is null or not page-aligned
    BadAddress,
    /// The range leaves user space
    OutOfRange,
    /// A page of the range is already declared
    Overlap,
}

impl fmt::Display for MmapRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            MmapRejection::ReservedDescriptor => "reserved descriptor",
            MmapRejection::BadDescriptor => "bad file descriptor",
            MmapRejection::Unreadable => "file cannot be reopened",
            MmapRejection::EmptyFile => "file is empty",
            MmapRejection::BadAddress => "address is null or unaligned",
            MmapRejection::OutOfRange => "range leaves user space",
            MmapRejection::Overlap => "range overlaps declared pages",
        };
        f.write_str(reason)
    }
}

/// How the caller must react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Resource exhaustion or a broken backing store; the enclosing
    /// operation cannot complete.
    Fatal,
    /// A contract violation by the process; the process is killed.
    ProcessTerminating,
    /// The request is refused with a defined failure value.
    Rejected,
}

/// Common error type used throughout the NOS virtual memory subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No physical frame or metadata could be allocated
    OutOfMemory,
    /// Every swap slot is occupied
    OutOfSwap,
    /// A backing file returned fewer bytes than declared
    ShortRead {
        /// Bytes the page declared
        expected: usize,
        /// Bytes the file produced
        actual: usize,
    },
    /// A backing file accepted fewer bytes than written
    ShortWrite {
        /// Bytes the page holds
        expected: usize,
        /// Bytes the file accepted
        actual: usize,
    },
    /// The address-space installer refused the translation
    InstallFailed(RawVirtAddr),
    /// Access to an address with no page and no stack-growth claim
    IllegalAccess(RawVirtAddr),
    /// Write to a page declared read-only
    WriteToReadOnly(RawVirtAddr),
    /// Unmap of a mapping id the process does not own
    UnknownMapping(MapId),
    /// `mmap` refused the request
    MappingRejected(MmapRejection),
    /// A page is already declared at this address
    AlreadyDeclared(RawVirtAddr),
    /// The resource is still in use
    Busy(String),
    /// Invalid argument
    InvalidArgument(String),
    /// Block device failure
    IoError(String),
    /// Configuration error
    ConfigError(String),
    /// A boot-time singleton was initialized twice
    AlreadyInitialized,
    /// A boot-time singleton was used before initialization
    NotInitialized,
}

impl Error {
    /// Classifies the error per the subsystem's error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::OutOfMemory
            | Error::OutOfSwap
            | Error::ShortRead { .. }
            | Error::ShortWrite { .. }
            | Error::InstallFailed(_)
            | Error::IoError(_)
            | Error::ConfigError(_)
            | Error::AlreadyInitialized
            | Error::NotInitialized => ErrorClass::Fatal,
            Error::IllegalAccess(_)
            | Error::WriteToReadOnly(_)
            | Error::UnknownMapping(_)
            | Error::AlreadyDeclared(_)
            | Error::Busy(_)
            | Error::InvalidArgument(_) => ErrorClass::ProcessTerminating,
            Error::MappingRejected(_) => ErrorClass::Rejected,
        }
    }

    /// Returns true if the error ends the enclosing operation outright.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::OutOfSwap => write!(f, "Swap space exhausted"),
            Error::ShortRead { expected, actual } => {
                write!(f, "Short read: expected {} bytes, got {}", expected, actual)
            }
            Error::ShortWrite { expected, actual } => {
                write!(f, "Short write: expected {} bytes, wrote {}", expected, actual)
            }
            Error::InstallFailed(addr) => write!(f, "Cannot install page {:#x}", addr),
            Error::IllegalAccess(addr) => write!(f, "Illegal access at {:#x}", addr),
            Error::WriteToReadOnly(addr) => write!(f, "Write to read-only page at {:#x}", addr),
            Error::UnknownMapping(id) => write!(f, "Unknown mapping id {}", id),
            Error::MappingRejected(reason) => write!(f, "Mapping rejected: {}", reason),
            Error::AlreadyDeclared(addr) => write!(f, "Page {:#x} already declared", addr),
            Error::Busy(msg) => write!(f, "Resource busy: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::IoError(msg) => write!(f, "I/O error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Error::AlreadyInitialized => write!(f, "Already initialized"),
            Error::NotInitialized => write!(f, "Not initialized"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<MmapRejection> for Error {
    fn from(reason: MmapRejection) -> Self {
        Error::MappingRejected(reason)
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

/// Creates a new invalid argument error
pub fn invalid_argument(msg: &str) -> Error {
    Error::InvalidArgument(msg.to_string())
}

/// Creates a new busy error
pub fn busy(msg: &str) -> Error {
    Error::Busy(msg.to_string())
}

/// Creates a new IO error
pub fn io_error(msg: &str) -> Error {
    Error::IoError(msg.to_string())
}

/// Creates a new config error
pub fn config_error(msg: &str) -> Error {
    Error::ConfigError(msg.to_string())
}

/// Creates a new out of memory error
pub fn out_of_memory() -> Error {
    Error::OutOfMemory
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(Error::OutOfSwap.class(), ErrorClass::Fatal);
        assert_eq!(Error::ShortRead { expected: 10, actual: 3 }.class(), ErrorClass::Fatal);
        assert_eq!(Error::IllegalAccess(0x1000).class(), ErrorClass::ProcessTerminating);
        assert_eq!(Error::UnknownMapping(3).class(), ErrorClass::ProcessTerminating);
        assert_eq!(
            Error::MappingRejected(MmapRejection::Overlap).class(),
            ErrorClass::Rejected
        );
        assert!(out_of_memory().is_fatal());
        assert!(!invalid_argument("x").is_fatal());
    }

    #[test]
    fn test_rejection_conversion() {
        let err: Error = MmapRejection::EmptyFile.into();
        assert_eq!(err, Error::MappingRejected(MmapRejection::EmptyFile));
    }
}
