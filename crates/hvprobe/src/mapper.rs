//! Memory-mapping collaborator.
//!
//! The probes need a handful of things only the host memory manager can
//! provide: private pages with their own leaf page-table entry, direct
//! access to that entry, the address of the external timer's register
//! window, and the list of pages the current context executes from.

use alloc::vec::Vec;

use crate::arch::defs::{PTE_NO_EXECUTE, PTE_PFN_MASK};

/// Host memory-manager services.
///
/// All addresses are virtual and page aligned unless noted.
pub trait PageMapper {
    /// Allocate one zeroed page mapped by a 4 KiB leaf entry that no other
    /// mapping shares.
    fn allocate_page(&self) -> Option<u64>;

    fn free_page(&self, va: u64);

    /// Current leaf entry mapping `va`.
    fn read_pte(&self, va: u64) -> Option<u64>;

    /// Overwrite the leaf entry mapping `va`.  No translation is
    /// invalidated; that is the caller's business.
    ///
    /// # Safety
    ///
    /// `va` must be a page returned by [`allocate_page`](Self::allocate_page)
    /// or one of [`context_pages`](Self::context_pages), and `pte` must keep
    /// every access the caller performs valid.
    unsafe fn write_pte(&self, va: u64, pte: u64);

    /// Virtual base of the HPET register window, if the platform has one.
    fn hpet_base(&self) -> Option<u64>;

    /// Pages that must stay executable while NX enforcement is being
    /// tested: the running code, the vector table and its handlers, the
    /// descriptor tables, the TSS and the stack.
    fn context_pages(&self) -> Vec<u64>;
}

/// Replace the frame number of `pte` with that of `frame_pte`.
pub fn with_frame(pte: u64, frame_pte: u64) -> u64 {
    (pte & !PTE_PFN_MASK) | (frame_pte & PTE_PFN_MASK)
}

pub fn with_no_execute(pte: u64, xd: bool) -> u64 {
    if xd {
        pte | PTE_NO_EXECUTE
    } else {
        pte & !PTE_NO_EXECUTE
    }
}
