//! NOS API - Core interfaces and types for the NOS virtual memory subsystem
//!
//! This crate provides the types, the error model and the collaborator
//! interfaces that the virtual memory core (`nos-vm`) is written against.
//! Everything the core consumes from the rest of the kernel is expressed as a
//! trait here, so the core can be driven by real drivers or by in-memory
//! doubles alike.
//!
//! # Architecture
//!
//! - **Core**: identifiers and constants (`Pid`, `Fd`, `MapId`, exit codes)
//! - **Error**: the common error type and its classification
//! - **Memory**: file, block device and address-space collaborators
//! - **Process**: the process-control collaborator used to kill a process
//!
//! # Usage
//!
//! ```rust
//! use nos_api::error::{Error, ErrorClass, Result};
//!
//! fn claim() -> Result<usize> {
//!     Err(Error::OutOfSwap)
//! }
//!
//! assert_eq!(claim().unwrap_err().class(), ErrorClass::Fatal);
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

// Core modules
pub mod core;
pub mod error;
pub mod memory;
pub mod process;

// Re-export commonly used types
pub use crate::core::types::*;
pub use crate::error::{Error, ErrorClass, MmapRejection, Result};
pub use crate::memory::interface::{BlockDevice, FileDescriptorTable, FileHandle, PageInstaller};
pub use crate::process::interface::ProcessControl;
