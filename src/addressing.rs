//! Virtual addresses, page numbers, and the user memory layout.
//!
//! The copy-on-write protocol manages memory in fixed-size pages. This module
//! provides the two address abstractions the rest of the crate works with:
//! [`Va`], a byte-granular virtual address, and [`Vpn`], the number of the
//! page that contains it. Keeping the two as distinct types prevents the
//! classic mistake of handing a raw address to an interface that expects a
//! page number, or the reverse.
//!
//! The module also pins down the user memory layout the protocol assumes:
//! user mappings live below [`USER_TOP`], the exception stack occupies the
//! single page ending at [`UXSTACK_TOP`], the normal stack grows down from
//! [`USTACK_TOP`], and [`PFTEMP`] names the scratch page the fault handler
//! uses while it builds a private copy.

/// The size of a single page in memory, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page number from a given address.
pub const PAGE_SHIFT: usize = 12;

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// Ceiling of the user address space. No user mapping exists at or above
/// this address.
pub const USER_TOP: usize = 0xeec0_0000;

/// Top of the exception stack. The page below this address is reserved for
/// running the page-fault handler and is never shared between environments.
pub const UXSTACK_TOP: usize = USER_TOP;

/// Top of the normal user stack. Sits below the exception stack with one
/// unmapped guard page in between.
pub const USTACK_TOP: usize = UXSTACK_TOP - 2 * PAGE_SIZE;

/// Base of the exception-stack page.
pub const UXSTACK_BASE: Va = Va(UXSTACK_TOP - PAGE_SIZE);

/// Scratch virtual page reserved for the fault handler. A fresh frame is
/// briefly mapped here while the contents of a faulting page are copied.
pub const PFTEMP: Va = Va(0x007f_f000);

/// Represents a user virtual address.
///
/// The `Va` struct is a lightweight wrapper around a `usize` value that
/// represents an address in an environment's virtual address space. It
/// provides utility methods for address validation, page alignment, and
/// conversion to a page number.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is valid.
    ///
    /// # Returns
    /// - `Some(Va)` if the address is below the canonical boundary.
    /// - `None` otherwise.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the virtual address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the virtual address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// The number of the page containing this address.
    #[inline]
    pub const fn page_number(self) -> Vpn {
        Vpn(self.0 >> PAGE_SHIFT)
    }

    /// The byte offset of this address within its page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Whether this address belongs to the user address space.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < USER_TOP
    }
}

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va({:#x})", self.0)
    }
}

/// A virtual page number.
///
/// One `Vpn` identifies one fixed-size page of virtual address space. It is
/// derived from an address by dividing by [`PAGE_SIZE`], and recovers the
/// base address of the page with [`Vpn::base`].
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Vpn(usize);

impl Vpn {
    /// The first page number at or above the user-space ceiling. The scan in
    /// the fork orchestrator terminates here.
    pub const USER_LIMIT: Vpn = Vpn(USER_TOP >> PAGE_SHIFT);

    /// Build a page number from its raw index.
    #[inline]
    pub const fn new(pn: usize) -> Self {
        Self(pn)
    }

    /// Cast the page number into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// The base virtual address of this page.
    #[inline]
    pub const fn base(self) -> Va {
        Va(self.0 << PAGE_SHIFT)
    }
}

impl core::fmt::Debug for Vpn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Vpn({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn va_page_math() {
        let va = Va::new(0x1234_5678).unwrap();
        assert_eq!(va.page_number().into_usize(), 0x12345);
        assert_eq!(va.offset(), 0x678);
        assert_eq!(va.page_down().into_usize(), 0x1234_5000);
        assert_eq!(va.page_number().base().into_usize(), 0x1234_5000);
    }

    #[test]
    fn va_rejects_noncanonical() {
        assert!(Va::new(0xffff_8000_0000_0000).is_none());
        assert!(Va::new(usize::MAX).is_none());
    }

    #[test]
    fn layout_is_consistent() {
        assert!(UXSTACK_BASE.is_user());
        assert_eq!(UXSTACK_BASE.offset(), 0);
        assert!(USTACK_TOP < UXSTACK_BASE.into_usize());
        assert!(PFTEMP.is_user());
        assert_eq!(PFTEMP.offset(), 0);
        assert_eq!(Vpn::USER_LIMIT.base().into_usize(), USER_TOP);
    }
}
