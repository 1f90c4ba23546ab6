// SPDX-License-Identifier: MPL-2.0

//! The boundary with the MMU primitive layer.
//!
//! The pager never edits page tables or touches the physical-frame
//! allocator directly; everything goes through [`MmuDriver`]. Production
//! kernels back this trait with the real MMU; the test suite backs it with
//! an in-memory fake.

use bitflags::bitflags;

use crate::prelude::*;

/// A physical memory address.
pub type Paddr = usize;

/// A virtual memory address.
pub type Vaddr = usize;

/// An address-space identifier, tagging TLB entries per process.
pub type Asid = u16;

/// The shift of the base page size.
pub const PAGE_SHIFT: usize = 12;

/// The size of a base page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// The mask covering the offset bits of an address.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

bitflags! {
    /// Flags accepted by [`MmuDriver::alloc_ram`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RamAllocFlags: u32 {
        /// Normal write-back cached memory.
        const NORMAL_CACHED = 1 << 0;
        /// The allocation does not need to be zeroed.
        const NO_WIPE = 1 << 1;
        /// The allocator must not satisfy the request by reclaiming pages
        /// from the pager itself.
        const NO_PAGER_RECLAIM = 1 << 2;
    }
}

/// The allocator-visible type of a physical page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    /// The page may be discarded by the pager under pressure.
    Discard,
    /// The page may be moved by the defragmenter but not discarded.
    Movable,
    /// The page is fixed in place.
    Fixed,
}

/// Placement constraints handed down from the RAM defragmenter.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocConstraint {
    /// A zone the allocation must avoid, if any.
    pub block_zone: Option<u32>,
    /// Whether the rest of the zones below the blocked one are also
    /// excluded (a general defragmentation pass is running).
    pub block_rest: bool,
}

bitflags! {
    /// Access permissions of a mapping, and of an attempted access.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccessPerms: u32 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXECUTE = 1 << 2;
    }
}

bitflags! {
    /// Hardware-visible attribute bits of a [`Pte`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// The entry is accessible at all.
        const ACCESSIBLE = 1 << 0;
        /// The entry permits writes.
        const WRITABLE = 1 << 1;
    }
}

/// A page-table entry: a frame address plus permission bits.
///
/// The pager reads and rewrites entries only through [`MmuDriver`]; this
/// type is the value it shuttles across that boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    paddr: Paddr,
    flags: PteFlags,
}

impl Pte {
    /// Creates an entry pointing at `paddr` with the given flags.
    pub fn new(paddr: Paddr, flags: PteFlags) -> Self {
        debug_assert_eq!(paddr & PAGE_MASK, 0);
        Self { paddr, flags }
    }

    /// The physical address of the mapped frame.
    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    /// Whether the entry is accessible.
    pub fn is_accessible(&self) -> bool {
        self.flags.contains(PteFlags::ACCESSIBLE)
    }

    /// Whether the entry permits writes.
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITABLE)
    }

    /// Returns the entry made accessible, writably so if `writable`.
    pub fn make_accessible(self, writable: bool) -> Self {
        let mut flags = self.flags | PteFlags::ACCESSIBLE;
        flags.set(PteFlags::WRITABLE, writable);
        Self { flags, ..self }
    }

    /// Returns the entry with all access revoked.
    pub fn make_inaccessible(self) -> Self {
        Self {
            flags: self.flags - (PteFlags::ACCESSIBLE | PteFlags::WRITABLE),
            ..self
        }
    }

    /// Returns the entry redirected to a new frame, keeping permissions.
    pub fn with_paddr(self, paddr: Paddr) -> Self {
        debug_assert_eq!(paddr & PAGE_MASK, 0);
        Self { paddr, ..self }
    }
}

/// The MMU primitive layer consumed by the pager.
///
/// Implementations provide frame allocation, PTE editing and TLB/cache
/// maintenance. All methods may be called concurrently; `alloc_ram` and
/// `free_ram` are only called while the caller holds the `RamAllocLock`,
/// which the implementation may rely on for a stable free-pool view.
pub trait MmuDriver: Send + Sync {
    /// Allocates one physical page of the given kind.
    fn alloc_ram(
        &self,
        flags: RamAllocFlags,
        kind: PageKind,
        constraint: AllocConstraint,
    ) -> Result<Paddr>;

    /// Returns one physical page to the system free pool.
    fn free_ram(&self, paddr: Paddr, kind: PageKind);

    /// Re-initialises allocator state for a page the pager recycles
    /// without freeing, making it equivalent to a fresh allocation.
    fn pages_allocated(&self, paddr: Paddr, flags: RamAllocFlags);

    /// Notifies the MMU that a frame has returned to the pager's free
    /// state; clears any mapping residue it tracks for the frame.
    fn page_freed(&self, paddr: Paddr);

    /// Converts a page between allocator-visible kinds.
    fn change_page_type(&self, paddr: Paddr, from: PageKind, to: PageKind);

    /// Reads the PTE mapping `vaddr` in address space `asid`, or `None`
    /// if no page table covers the address or the entry is unallocated.
    fn read_pte(&self, asid: Asid, vaddr: Vaddr) -> Option<Pte>;

    /// Writes the PTE mapping `vaddr` in address space `asid`.
    fn write_pte(&self, asid: Asid, vaddr: Vaddr, pte: Pte);

    /// Performs cache maintenance after a single PTE update.
    fn pte_updated(&self, vaddr: Vaddr);

    /// Invalidates the TLB entry for one page in one address space.
    fn invalidate_tlb_entry(&self, asid: Asid, vaddr: Vaddr);

    /// The physical address of the demand-paged page-table page that maps
    /// `vaddr`, or `None` if the covering table is not itself paged.
    fn page_table_page(&self, asid: Asid, vaddr: Vaddr) -> Option<Paddr>;

    /// Finds the mapping covering `[start, start + size)` in address
    /// space `asid`, returning it with the page offset of `start` within
    /// the mapping and the mapping's instance count at lookup time.
    fn find_mapping(
        &self,
        asid: Asid,
        start: Vaddr,
        size: usize,
    ) -> Option<(Arc<crate::manager::Mapping>, usize, u32)>;

    /// One past the highest physical address backed by RAM; sizes the
    /// frame table.
    fn max_paddr(&self) -> Paddr;
}
