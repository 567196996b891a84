//! Page table entries and their permission bits.
//!
//! A [`Pte`] packs a physical frame number together with a small set of
//! permission bits, mirroring the last-level entry format of x86_64 paging.
//! The protocol in this crate never walks real hardware tables; the entry
//! format exists so that the permission bookkeeping of copy-on-write can be
//! expressed exactly, bit for bit.
//!
//! One bit deserves special attention: [`PteFlags::COW`]. The hardware
//! reserves bits 9 through 11 of an entry for software use, and this crate
//! claims bit 11 to mark a page as copy-on-write. The bit has no meaning to
//! an MMU; it is the protocol's private note that a write to the page must
//! be turned into a private copy before it may succeed.

use crate::addressing::{PAGE_SHIFT, PAGE_MASK};

bitflags::bitflags! {
    /// Permission bits of a page table entry.
    pub struct PteFlags: usize {
        /// Present; must be 1 for the mapping to exist.
        const P = 1 << 0;
        /// Read/write; if 0, writes to the page are not allowed.
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed.
        const US = 1 << 2;
        /// Accessed; set when the page has been read or written.
        const A = 1 << 5;
        /// Dirty; set when the page has been written.
        const D = 1 << 6;
        /// Page size; reserved for large-page mappings. This protocol never
        /// sets it, but the debugger decodes it.
        const PS = 1 << 7;
        /// First software-available bit.
        const AVL0 = 1 << 9;
        /// Second software-available bit.
        const AVL1 = 1 << 10;
        /// Copy-on-write. Occupies the third software-available bit; set on
        /// both sides of a shared writable page so that the first write
        /// faults and produces a private copy.
        const COW = 1 << 11;

        /// The bits a user environment may pass through the mapping
        /// interface. Everything else (accessed, dirty, large page) is
        /// owned by the kernel side and stripped on duplication.
        const SYSCALL = Self::P.bits
            | Self::RW.bits
            | Self::US.bits
            | Self::AVL0.bits
            | Self::AVL1.bits
            | Self::COW.bits;
    }
}

/// A physical frame identity.
///
/// Two mappings referencing the same `FrameId` share the same backing
/// memory. The copy-on-write state of the protocol is exactly the set of
/// frames referenced by more than one environment.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct FrameId(usize);

impl FrameId {
    /// Build a frame identity from its raw index.
    #[inline]
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Cast the frame identity into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

impl core::fmt::Debug for FrameId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Frame({:#x})", self.0)
    }
}

/// Page Table Entry (PTE).
///
/// The entry holds the frame number in its upper bits and the permission
/// flags in its lower 12 bits. A mapping exists only while [`PteFlags::P`]
/// is set; [`Pte::frame`] returns `None` otherwise.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Pte(usize);

impl Pte {
    /// Build an entry mapping `frame` with the given flags.
    #[inline]
    pub const fn new(frame: FrameId, flags: PteFlags) -> Self {
        Self((frame.into_usize() << PAGE_SHIFT) | flags.bits())
    }

    /// Get the frame referenced by this entry.
    ///
    /// # Returns
    /// - `Some(FrameId)` if the entry is present.
    /// - `None` if the entry is not present.
    #[inline]
    pub const fn frame(&self) -> Option<FrameId> {
        if self.flags().contains(PteFlags::P) {
            Some(FrameId(self.0 >> PAGE_SHIFT))
        } else {
            None
        }
    }

    /// Get the flags associated with this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Replace the flags of this entry, keeping the frame.
    #[inline]
    pub fn set_flags(&mut self, flags: PteFlags) -> &mut Self {
        self.0 = (self.0 & !PAGE_MASK) | flags.bits();
        self
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(frame) = self.frame() {
            write!(f, "Pte({:#x}, {:?})", frame.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_packs_frame_and_flags() {
        let pte = Pte::new(FrameId::new(0x42), PteFlags::P | PteFlags::US);
        assert_eq!(pte.frame(), Some(FrameId::new(0x42)));
        assert_eq!(pte.flags(), PteFlags::P | PteFlags::US);
    }

    #[test]
    fn non_present_entry_has_no_frame() {
        let pte = Pte::new(FrameId::new(0x42), PteFlags::US);
        assert_eq!(pte.frame(), None);
    }

    #[test]
    fn set_flags_keeps_frame() {
        let mut pte = Pte::new(FrameId::new(7), PteFlags::P | PteFlags::RW | PteFlags::US);
        pte.set_flags((pte.flags() & !PteFlags::RW) | PteFlags::COW);
        assert_eq!(pte.frame(), Some(FrameId::new(7)));
        assert!(pte.flags().contains(PteFlags::COW));
        assert!(!pte.flags().contains(PteFlags::RW));
    }

    #[test]
    fn cow_is_a_software_bit() {
        assert!(PteFlags::SYSCALL.contains(PteFlags::COW));
        assert_eq!(PteFlags::COW.bits(), 0x800);
        assert!(!PteFlags::SYSCALL.contains(PteFlags::D));
        assert!(!PteFlags::SYSCALL.contains(PteFlags::A));
        assert!(!PteFlags::SYSCALL.contains(PteFlags::PS));
    }
}
