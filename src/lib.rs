//! # `ucow`: user-level fork with copy-on-write.
//!
//! `fork` creates a new environment by duplicating the calling one. A naive
//! implementation copies the whole address space eagerly, which is wasteful:
//! in the common pattern where the child immediately replaces its image,
//! almost none of the copied pages are ever touched. Copy-on-write defers
//! the work. Parent and child initially share every physical frame; pages
//! that were writable are mapped read-only with a software copy-on-write
//! bit set in **both** environments. When either side writes to such a
//! page, the hardware denies the write and the kernel delivers a page
//! fault to a user-level handler, which copies the page into a fresh
//! private frame and re-maps it writable. The write then retries and
//! succeeds. A page is copied at most once per environment, and only if it
//! is actually written.
//!
//! The protocol lives entirely in user space, on top of a small set of
//! kernel primitives (frame allocation, mapping installation, environment
//! creation and activation) consumed through the [`env::EnvServices`]
//! trait. The crate is organized leaves first:
//!
//! - [`addressing`]: virtual addresses, page numbers, the user memory
//!   layout.
//! - [`page_table`]: page table entries and permission bits, including the
//!   software [`page_table::PteFlags::COW`] bit.
//! - [`env`]: environments, fault causes, and the kernel service trait.
//! - [`vmview`]: a read-only view of the caller's own mappings.
//! - [`fault`]: the copy-on-write fault handler.
//! - [`duppage`]: the per-page duplication policy.
//! - [`fork`]: the orchestrator, plus the fully shared `sfork` variant.
//! - [`machine`]: an in-memory machine backing the tests and the monitor.
//! - [`monitor`]: a command-line debugger over raw page mappings.
//!
//! ## The one page that is never shared
//!
//! The fault handler runs on a dedicated exception stack. If that page
//! were itself copy-on-write, the first fault would fault again while
//! pushing the handler's frames, and fault handling would recurse until
//! the environment dies. The exception stack is therefore excluded from
//! duplication entirely and every child receives a fresh, private,
//! writable one. Getting this wrong does not crash immediately; it
//! deadlocks or corrupts memory later, which is why the invariant is
//! checked at fault-delivery time by the [`machine`].
//!
//! ## Error model
//!
//! Nothing in this protocol is retriable. A fault that is not a write to a
//! copy-on-write page indicates a bug elsewhere; an allocation or mapping
//! failure mid-protocol would leave two address spaces desynchronized if
//! ignored. Both classes terminate the affected operation immediately:
//! errors propagate as [`KernelError`] and the delivery mechanism kills
//! the environment rather than resume it in an inconsistent state.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addressing;
pub mod duppage;
pub mod env;
pub mod fault;
pub mod fork;
pub mod kprint;
pub mod machine;
pub mod monitor;
pub mod page_table;
pub mod vmview;

pub use fork::{ForkResult, fork, sfork};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of failure encountered
/// while handling a primitive the protocol consumes. None of them is
/// transient; every one ends the operation in progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such environment or mapping. (ENOENT)
    NoSuchEntry,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding error code.
    pub fn into_isize(self) -> isize {
        match self {
            KernelError::OperationNotPermitted => -1,
            KernelError::NoSuchEntry => -2,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::InvalidArgument => -22,
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            KernelError::OperationNotPermitted => "operation not permitted",
            KernelError::NoSuchEntry => "no such entry",
            KernelError::NoMemory => "out of memory",
            KernelError::InvalidAccess => "permission denied",
            KernelError::BadAddress => "bad address",
            KernelError::InvalidArgument => "invalid argument",
        };
        f.write_str(msg)
    }
}
