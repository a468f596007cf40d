//! Process management interface

use crate::core::types::Pid;

/// Hook into the process manager used to kill a process.
///
/// The virtual memory core tears down the address space itself; the process
/// manager only records the status so the parent can collect it and stops
/// scheduling the thread.
pub trait ProcessControl: Send + Sync {
    /// Terminates `pid` with exit `status`.
    fn terminate(&self, pid: Pid, status: i32);
}
