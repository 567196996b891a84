//! User-level fork with copy-on-write.
//!
//! [`fork`] creates a child environment that initially shares every page of
//! the parent's address space. Read-only pages are shared outright;
//! writable pages are mapped copy-on-write in both environments, so the
//! first write on either side triggers a fault that the handler in
//! [`crate::fault`] resolves into a private copy. The expensive eager copy
//! of the whole address space never happens; only pages that are actually
//! written get duplicated, and only when they are written.
//!
//! One page is exempt from all of this: the exception stack. The fault
//! handler itself runs on it, so it must always be privately writable in
//! every environment. Marking it copy-on-write would make the very first
//! fault recurse forever. The orchestrator skips it during duplication and
//! gives the child a fresh private one instead.
//!
//! [`sfork`] is the fully shared variant: parent and child share writable
//! pages directly and observe each other's writes. Only the normal stack
//! is duplicated copy-on-write, so each side keeps private call frames.

use alloc::vec::Vec;

use crate::{
    KernelError, debug,
    addressing::{PAGE_SIZE, USTACK_TOP, UXSTACK_BASE, Va, Vpn},
    duppage::{duppage, share_page},
    env::{EnvId, EnvServices, EnvStatus, Exofork},
    fault::do_copy_on_write,
    page_table::PteFlags,
    vmview::AddressSpaceView,
};

/// The two sides of a completed fork.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ForkResult {
    /// Returned in the parent, carrying the new child's identity.
    Parent(EnvId),
    /// Returned in the child. The child's identity is available from
    /// [`EnvServices::getenvid`] on its own context.
    Child,
}

/// Create a child sharing the parent's address space copy-on-write.
///
/// The orchestration is a single pass with no rollback:
/// 1. Register the copy-on-write fault handler for the caller.
/// 2. Create an empty child. The child side of the double return reports
///    [`ForkResult::Child`] immediately; its identity comes from the entry
///    context, so there is no duplicated self-reference to repair.
/// 3. Duplicate every present user page into the child via
///    [`duppage`], except the exception-stack page.
/// 4. Install the child's fault-delivery entry point.
/// 5. Allocate a fresh private exception stack for the child.
/// 6. Mark the child runnable.
///
/// Any failure after the child exists is fatal to the call; no partial
/// child cleanup is attempted, since a half-initialized child is not
/// recoverable.
pub fn fork(sys: &mut dyn EnvServices) -> Result<ForkResult, KernelError> {
    fork_with(sys, duppage)
}

/// Create a child sharing the parent's writable pages directly.
///
/// Identical orchestration to [`fork`], but pages are handed to the child
/// through [`share_page`]: a writable page stays writable on both sides
/// and the two environments communicate through it. The exception stack is
/// excluded as always, and the normal user stack page is duplicated
/// copy-on-write instead of shared, so each side keeps a private stack.
pub fn sfork(sys: &mut dyn EnvServices) -> Result<ForkResult, KernelError> {
    let ustack_vpn = Va::new(USTACK_TOP - PAGE_SIZE)
        .ok_or(KernelError::BadAddress)?
        .page_number();
    fork_with(sys, move |sys, child, vpn| {
        if vpn == ustack_vpn {
            duppage(sys, child, vpn)
        } else {
            share_page(sys, child, vpn)
        }
    })
}

fn fork_with(
    sys: &mut dyn EnvServices,
    mut policy: impl FnMut(&mut dyn EnvServices, EnvId, Vpn) -> Result<(), KernelError>,
) -> Result<ForkResult, KernelError> {
    sys.register_fault_handler(do_copy_on_write)?;

    let child = match sys.exofork()? {
        Exofork::Child => return Ok(ForkResult::Child),
        Exofork::Parent(child) => child,
    };
    debug!("{:?}: forked {:?}", sys.getenvid(), child);

    // The exception stack is never duplicated: it must stay privately
    // writable so that fault handling cannot itself fault.
    let uxstack_vpn = UXSTACK_BASE.page_number();
    let present: Vec<Vpn> = AddressSpaceView::new(sys).present_vpns().collect();
    for vpn in present {
        if vpn == uxstack_vpn {
            continue;
        }
        policy(sys, child, vpn)?;
    }

    sys.install_fault_trampoline(child, do_copy_on_write)?;
    sys.page_alloc(
        child,
        UXSTACK_BASE,
        PteFlags::P | PteFlags::RW | PteFlags::US,
    )?;
    sys.set_status(child, EnvStatus::Runnable)?;
    Ok(ForkResult::Parent(child))
}
