//! The copy-on-write page-fault handler.
//!
//! When either side of a fork writes to a still-shared page, the hardware
//! denies the write and the kernel delivers the fault to this handler on
//! the environment's exception stack. The handler's job is the shared to
//! private transition: give the faulting environment its own copy of the
//! page, writable, at the same virtual address, then let the write retry.
//!
//! Only one kind of fault is legitimate here: a write to a page carrying
//! the copy-on-write bit. A fault with any other cause means a bug
//! elsewhere, not a condition this protocol can repair, and terminates the
//! environment.

use crate::{
    KernelError, debug,
    addressing::{PAGE_SIZE, PFTEMP},
    env::{EnvServices, FaultCause, UserTrapframe},
    page_table::PteFlags,
    vmview::AddressSpaceView,
};

/// Handle a copy-on-write fault by creating a private copy of the faulted
/// page.
///
/// The substitution runs in three steps whose order matters:
/// 1. Allocate a fresh frame and map it at the [`PFTEMP`] scratch address,
///    writable.
/// 2. Copy the full contents of the faulting page into the scratch page.
///    The read goes through the old, still-shared mapping.
/// 3. Re-map the faulting page onto the new frame, writable, replacing the
///    copy-on-write mapping, and only then drop the scratch mapping.
///
/// Swapping steps 2 and 3 would copy from the new, uninitialized frame;
/// tearing down the scratch mapping before the re-map would lose the only
/// reference to the copy. After the sequence the faulting environment
/// exclusively owns the page and the retried write succeeds.
///
/// # Errors
/// - [`KernelError::InvalidAccess`] if the fault was not a write, or the
///   page is present but not copy-on-write. Both are protocol violations;
///   the delivery mechanism terminates the environment.
/// - [`KernelError::BadAddress`] if the faulting page is not mapped at all.
/// - Allocation or mapping failures propagate unchanged. There is no retry
///   and no unwind; a partial substitution would leave the address space
///   inconsistent, so the environment dies instead.
pub fn do_copy_on_write(
    sys: &mut dyn EnvServices,
    tf: &UserTrapframe,
) -> Result<(), KernelError> {
    if !tf.cause.contains(FaultCause::WRITE) {
        return Err(KernelError::InvalidAccess);
    }
    let vpn = tf.fault_va.page_number();
    let pte = AddressSpaceView::new(sys)
        .pte(vpn)
        .ok_or(KernelError::BadAddress)?;
    if !pte.flags().contains(PteFlags::COW) {
        // Present but not copy-on-write: a genuine protection violation.
        return Err(KernelError::InvalidAccess);
    }

    let me = sys.getenvid();
    let base = tf.fault_va.page_down();
    let perm = PteFlags::P | PteFlags::RW | PteFlags::US;
    debug!("{:?}: cow fault at {:?}, copying {:?}", me, tf.fault_va, vpn);

    sys.page_alloc(me, PFTEMP, perm)?;
    let mut contents = [0u8; PAGE_SIZE];
    sys.read_bytes(base, &mut contents)?;
    sys.write_bytes(PFTEMP, &contents)?;
    sys.page_map(me, PFTEMP, me, base, perm)?;
    sys.page_unmap(me, PFTEMP)?;
    Ok(())
}
