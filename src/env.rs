//! Environments and the kernel services they consume.
//!
//! An environment is a schedulable process abstraction with its own address
//! space. The copy-on-write protocol in this crate runs entirely in user
//! space; everything it cannot do by itself (allocating frames, installing
//! mappings, creating a child, activating it) is reached through the
//! [`EnvServices`] trait defined here. The protocol modules depend only on
//! this trait, never on a concrete kernel.
//!
//! One deliberate design point: an environment learns its own identity from
//! [`EnvServices::getenvid`] on the context it was entered with, not from a
//! process-wide variable. A fork duplicates the parent's memory verbatim,
//! so any identity stored in duplicated memory would be wrong in the child
//! until repaired. Passing the identity through the context removes that
//! failure mode entirely.

use crate::{
    KernelError,
    addressing::{Va, Vpn},
    page_table::{Pte, PteFlags},
};

/// An environment identity.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct EnvId(usize);

impl EnvId {
    /// Build an environment identity from its raw index.
    #[inline]
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Cast the identity into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

impl core::fmt::Debug for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Env({})", self.0)
    }
}

/// Scheduling state of an environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnvStatus {
    /// Exists but may not be scheduled. A freshly created child starts here
    /// and stays here until the orchestrator activates it.
    NotRunnable,
    /// May be scheduled.
    Runnable,
    /// Terminated by a fatal fault. Its mappings have been torn down and no
    /// further operation on it succeeds.
    Dying,
}

/// The two sides of a completed `exofork`.
///
/// The creation primitive returns once in each environment. The parent
/// receives the child's identity; the child, whose execution context was
/// duplicated retroactively, observes the child side instead of an id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Exofork {
    /// Returned in the parent, carrying the new child's identity.
    Parent(EnvId),
    /// Returned in the child.
    Child,
}

bitflags::bitflags! {
    /// Decoded cause of a page fault, following the x86 error code layout.
    pub struct FaultCause: usize {
        /// The fault was a protection violation on a present page. Clear
        /// when the page was simply not mapped.
        const PROTECTION = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The faulting access came from user mode.
        const USER = 1 << 2;
    }
}

/// State handed to a fault handler: where the fault happened and why.
#[derive(Clone, Copy, Debug)]
pub struct UserTrapframe {
    /// The faulting virtual address.
    pub fault_va: Va,
    /// Decoded cause of the fault.
    pub cause: FaultCause,
}

/// Entry point the kernel transfers control to on a page fault.
///
/// The handler runs synchronously in the faulting environment, on its
/// private exception stack. Returning `Ok` resumes the environment, which
/// retries the faulting access. Returning an error terminates it.
pub type FaultEntry =
    fn(&mut dyn EnvServices, &UserTrapframe) -> Result<(), KernelError>;

/// Kernel primitives consumed by the copy-on-write protocol.
///
/// Each method mirrors one system call of the underlying kernel. An
/// implementation is bound to a calling environment; operations naming
/// another environment succeed only for the caller itself or one of its
/// children. All failures are final from the protocol's point of view:
/// nothing here is retried.
pub trait EnvServices {
    /// Identity of the calling environment.
    fn getenvid(&self) -> EnvId;

    /// Read the caller's own current mapping for `vpn`.
    ///
    /// Reflects the live address space at the instant of the call; results
    /// must not be cached across calls, since mappings are mutated
    /// concurrently by faults and by the other party of a fork.
    ///
    /// # Returns
    /// - `Some(Pte)` if `vpn` is below the user ceiling and present.
    /// - `None` otherwise.
    fn lookup_mapping(&self, vpn: Vpn) -> Option<Pte>;

    /// Allocate a fresh zeroed frame and map it at `va` in `env`.
    ///
    /// An existing mapping at `va` is replaced.
    fn page_alloc(&mut self, env: EnvId, va: Va, flags: PteFlags) -> Result<(), KernelError>;

    /// Map the frame currently mapped at `src_va` in `src` into `dst` at
    /// `dst_va` with the given flags.
    ///
    /// Used both for sharing a frame with a child and for re-mapping the
    /// caller's own page with changed permissions.
    fn page_map(
        &mut self,
        src: EnvId,
        src_va: Va,
        dst: EnvId,
        dst_va: Va,
        flags: PteFlags,
    ) -> Result<(), KernelError>;

    /// Remove the mapping at `va` in `env`, if any.
    fn page_unmap(&mut self, env: EnvId, va: Va) -> Result<(), KernelError>;

    /// Create a new, empty child environment.
    ///
    /// The child starts with no mappings and [`EnvStatus::NotRunnable`].
    /// See [`Exofork`] for the double return.
    fn exofork(&mut self) -> Result<Exofork, KernelError>;

    /// Install the fault-delivery entry point on `env`.
    fn install_fault_trampoline(
        &mut self,
        env: EnvId,
        entry: FaultEntry,
    ) -> Result<(), KernelError>;

    /// Mark `env` runnable or not runnable.
    fn set_status(&mut self, env: EnvId, status: EnvStatus) -> Result<(), KernelError>;

    /// Register `entry` as the caller's own fault handler.
    ///
    /// On first use this also establishes the caller's exception stack and
    /// delivery entry point. Idempotent: calling it again only replaces the
    /// handler.
    fn register_fault_handler(&mut self, entry: FaultEntry) -> Result<(), KernelError>;

    /// An ordinary memory read by the calling environment.
    fn read_bytes(&mut self, va: Va, buf: &mut [u8]) -> Result<(), KernelError>;

    /// An ordinary memory write by the calling environment.
    ///
    /// A write through a write-protected page is exactly the access that
    /// faults and drives the copy-on-write transition.
    fn write_bytes(&mut self, va: Va, buf: &[u8]) -> Result<(), KernelError>;
}
