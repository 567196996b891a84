//! Read-only view of the caller's own address space.
//!
//! The duplication policy and the fault handler both make decisions from
//! the current permission bits of a page. [`AddressSpaceView`] is the thin,
//! side-effect-free lens they use: every accessor re-queries the live
//! mapping through [`EnvServices::lookup_mapping`], so a decision is always
//! made against the state at the instant of the call. Nothing is cached;
//! the other party of a fork mutates these mappings concurrently.

use crate::{
    addressing::Vpn,
    env::EnvServices,
    page_table::{Pte, PteFlags},
};

/// A read-only abstraction over the calling environment's mappings.
pub struct AddressSpaceView<'a> {
    sys: &'a dyn EnvServices,
}

impl<'a> AddressSpaceView<'a> {
    /// Build a view over the calling environment of `sys`.
    pub fn new(sys: &'a dyn EnvServices) -> Self {
        Self { sys }
    }

    /// The current entry for `vpn`, if present.
    ///
    /// Only pages below the user ceiling resolve; everything at or above it
    /// reads as unmapped.
    #[inline]
    pub fn pte(&self, vpn: Vpn) -> Option<Pte> {
        if vpn < Vpn::USER_LIMIT {
            self.sys.lookup_mapping(vpn)
        } else {
            None
        }
    }

    /// The current flags for `vpn`, empty if unmapped.
    #[inline]
    pub fn flags(&self, vpn: Vpn) -> PteFlags {
        self.pte(vpn).map(|pte| pte.flags()).unwrap_or(PteFlags::empty())
    }

    /// All currently present user pages, in ascending order.
    ///
    /// The scan terminates at the user ceiling. Each page is re-checked
    /// against the live mapping as the iterator advances.
    pub fn present_vpns(&self) -> impl Iterator<Item = Vpn> + '_ {
        (0..Vpn::USER_LIMIT.into_usize())
            .map(Vpn::new)
            .filter(move |vpn| self.pte(*vpn).is_some())
    }
}
