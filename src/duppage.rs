//! Per-page duplication policy.
//!
//! [`duppage`] decides, for one page of the parent, how the child comes to
//! see it: shared read-only forever, or shared copy-on-write until the
//! first write. [`share_page`] is the alternative policy of the fully
//! shared fork variant, which hands the child the parent's mapping
//! unchanged, writable and all.
//!
//! The subtle part of `duppage` is the second map call. Once the frame is
//! referenced by both environments, the parent must not keep it writable;
//! a later parent write would silently corrupt the child's view. So after
//! mapping the frame copy-on-write into the child, the parent re-maps its
//! own page with exactly the same bits. This is required even when the
//! parent's page was already copy-on-write, so that the bits applied to
//! the child always mirror what the parent now holds.

use crate::{
    KernelError,
    addressing::Vpn,
    env::{EnvId, EnvServices},
    page_table::PteFlags,
    vmview::AddressSpaceView,
};

/// Map the parent's page `vpn` into `child` at the same virtual address,
/// following the copy-on-write decision table.
///
/// - A page that is neither writable nor copy-on-write is mapped into the
///   child with its permission bits unchanged. Read-only pages can be
///   shared indefinitely without ever needing a private copy.
/// - A writable or already copy-on-write page is mapped into the child
///   with the writable bit cleared and the copy-on-write bit set, and the
///   parent's own mapping is then replaced with those same bits.
///
/// Both installs complete before this function returns; a parent left
/// writable and shared is an acceptable transient, but a parent not yet
/// re-mapped at all would be a bug. Errors from the mapping interface are
/// fatal and propagate unchanged.
pub fn duppage(
    sys: &mut dyn EnvServices,
    child: EnvId,
    vpn: Vpn,
) -> Result<(), KernelError> {
    let pte = AddressSpaceView::new(sys)
        .pte(vpn)
        .ok_or(KernelError::NoSuchEntry)?;
    let me = sys.getenvid();
    let va = vpn.base();
    let flags = pte.flags() & PteFlags::SYSCALL;

    if !flags.intersects(PteFlags::RW | PteFlags::COW) {
        sys.page_map(me, va, child, va, flags)?;
        return Ok(());
    }

    let flags = (flags & !PteFlags::RW) | PteFlags::COW;
    sys.page_map(me, va, child, va, flags)?;
    sys.page_map(me, va, me, va, flags)?;
    Ok(())
}

/// Map the parent's page `vpn` into `child` with its permission bits
/// unchanged.
///
/// This is the sharing policy of the fully shared fork variant: a writable
/// page stays writable on both sides and both environments see each
/// other's writes through the common frame. No copy-on-write bit is
/// introduced.
pub fn share_page(
    sys: &mut dyn EnvServices,
    child: EnvId,
    vpn: Vpn,
) -> Result<(), KernelError> {
    let pte = AddressSpaceView::new(sys)
        .pte(vpn)
        .ok_or(KernelError::NoSuchEntry)?;
    let me = sys.getenvid();
    let va = vpn.base();
    sys.page_map(me, va, child, va, pte.flags() & PteFlags::SYSCALL)?;
    Ok(())
}
