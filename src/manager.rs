// SPDX-License-Identifier: MPL-2.0

//! The boundary with the per-object memory managers.
//!
//! Each memory object (a run of ROM, an executable's code segment, a
//! process's writable data) is owned by a manager that knows how to fetch
//! its pages and how to restrict their mappings. The pager only knows the
//! [`MemoryManager`] trait; ROM, code and data paging are different
//! implementations of it.
//!
//! Managers keep a memory object alive across a lock drop by cloning its
//! `Arc` while the `MmuLock` is still held and dropping the clone after
//! reacquisition.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::{
    frame::FrameId,
    mmu::{AccessPerms, AllocConstraint, Asid, Paddr, Vaddr, PAGE_MASK},
    pager::Pager,
    prelude::*,
    sync::CleaningGuard,
};

/// How a page's mappings are to be restricted when it ages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageRestriction {
    /// Make every mapping of the page no-access, so the next touch faults
    /// and rejuvenates it.
    NoAccessForOld,
}

/// The five-operation interface every memory manager provides.
///
/// All operations are invoked by the pager with the `MmuLock` **dropped**
/// and a reference open on the memory object; implementations may call
/// back into the pager freely.
pub trait MemoryManager: Send + Sync {
    /// The allocator-visible kind of the pages this manager commits.
    fn page_kind(&self) -> crate::mmu::PageKind {
        crate::mmu::PageKind::Discard
    }

    /// Revokes the frame from all users of the memory object, writing it
    /// back first if it is dirty (the caller holds the page-cleaning lock
    /// in that case).
    ///
    /// On failure the manager must have returned the frame to the live
    /// list (typically via [`Pager::paged_in`]) before returning.
    fn steal_page(
        &self,
        pager: &Pager,
        memory: &Arc<MemoryObject>,
        frame: FrameId,
    ) -> Result<()>;

    /// Applies a mapping restriction to the frame, and reports the new
    /// writability to the pager via [`Pager::page_restricted`].
    fn restrict_page(
        &self,
        pager: &Pager,
        memory: &Arc<MemoryObject>,
        frame: FrameId,
        restriction: PageRestriction,
    ) -> Result<()>;

    /// Moves the frame's contents to a freshly allocated frame honouring
    /// `constraint`, re-maps all users, and returns the new physical
    /// address. Used by the RAM defragmenter for pages the pager cannot
    /// steal.
    fn move_page(
        &self,
        pager: &Pager,
        memory: &Arc<MemoryObject>,
        frame: FrameId,
        constraint: AllocConstraint,
    ) -> Result<Paddr>;

    /// Writes the given frames to backing store and marks each cleaned
    /// frame via [`Pager::page_cleaned`]. Entries the manager could not
    /// clean are replaced with `None`. The cleaning guard doubles as the
    /// write-request slot's mutex witness.
    fn clean_pages(
        &self,
        pager: &Pager,
        cleaning: &CleaningGuard<'_>,
        frames: &mut [Option<FrameId>],
        background: bool,
    );

    /// Pages in the memory at `index` after a fault that rejuvenation
    /// could not serve.
    fn handle_fault(
        &self,
        pager: &Pager,
        memory: &Arc<MemoryObject>,
        index: usize,
        mapping: &Arc<Mapping>,
        map_instance: u32,
        perms: AccessPerms,
    ) -> Result<()>;
}

/// The committed-page array of a memory object: which of its page indices
/// are currently backed, and by which frame.
#[derive(Default)]
pub struct PageArray {
    pages: alloc::collections::BTreeMap<usize, Paddr>,
}

impl PageArray {
    /// The frame committed at `index`, if any.
    pub fn page(&self, index: usize) -> Option<Paddr> {
        self.pages.get(&index).copied()
    }

    /// Commits `paddr` at `index`.
    pub fn set_page(&mut self, index: usize, paddr: Paddr) {
        debug_assert_eq!(paddr & PAGE_MASK, 0);
        self.pages.insert(index, paddr);
    }

    /// Decommits `index`.
    pub fn clear_page(&mut self, index: usize) {
        self.pages.remove(&index);
    }
}

/// A memory object: a contiguous range of pageable memory owned by one
/// manager.
pub struct MemoryObject {
    manager: Arc<dyn MemoryManager>,
    pages: Mutex<PageArray>,
    read_only: bool,
    demand_paged: bool,
}

impl MemoryObject {
    /// Creates a demand-paged memory object owned by `manager`.
    pub fn new(manager: Arc<dyn MemoryManager>, read_only: bool) -> Arc<Self> {
        Arc::new(Self {
            manager,
            pages: Mutex::new(PageArray::default()),
            read_only,
            demand_paged: true,
        })
    }

    /// Creates an unpaged memory object (the pin façade treats locking it
    /// as a no-op).
    pub fn new_unpaged(manager: Arc<dyn MemoryManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            pages: Mutex::new(PageArray::default()),
            read_only: false,
            demand_paged: false,
        })
    }

    /// The owning manager.
    pub fn manager(&self) -> &Arc<dyn MemoryManager> {
        &self.manager
    }

    /// The committed-page array.
    pub fn pages(&self) -> &Mutex<PageArray> {
        &self.pages
    }

    /// The frame committed at `index`, if any.
    pub fn page(&self, index: usize) -> Option<Paddr> {
        self.pages.lock().page(index)
    }

    /// Whether writes to this object are forbidden.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the object's pages are demand paged at all.
    pub fn is_demand_paged(&self) -> bool {
        self.demand_paged
    }
}

/// A mapping of a memory object into an address space.
///
/// The instance count distinguishes reuses of the same mapping object; a
/// fault that raced a detach sees a mismatch and aborts.
pub struct Mapping {
    memory: Mutex<Option<Arc<MemoryObject>>>,
    instance_count: AtomicU32,
    detached: AtomicBool,
    start_index: usize,
    base: Vaddr,
    size: usize,
    asid: Asid,
    perms: AccessPerms,
}

impl Mapping {
    /// Maps `memory` from page `start_index` at `base` for `size` bytes.
    pub fn new(
        memory: Arc<MemoryObject>,
        start_index: usize,
        base: Vaddr,
        size: usize,
        asid: Asid,
        perms: AccessPerms,
    ) -> Arc<Self> {
        Arc::new(Self {
            memory: Mutex::new(Some(memory)),
            instance_count: AtomicU32::new(1),
            detached: AtomicBool::new(false),
            start_index,
            base,
            size,
            asid,
            perms,
        })
    }

    /// The mapped memory object, unless the mapping has been detached.
    pub fn memory(&self) -> Option<Arc<MemoryObject>> {
        self.memory.lock().clone()
    }

    /// The current instance count.
    pub fn instance_count(&self) -> u32 {
        self.instance_count.load(Ordering::Acquire)
    }

    /// Whether a detach is in progress.
    pub fn being_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Detaches the mapping from its memory and bumps the instance count,
    /// invalidating faults and pins taken against the old instance.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        *self.memory.lock() = None;
        self.instance_count.fetch_add(1, Ordering::AcqRel);
        self.detached.store(false, Ordering::Release);
    }

    /// The first page index of the memory object covered by this mapping.
    pub fn start_index(&self) -> usize {
        self.start_index
    }

    /// The base virtual address.
    pub fn base(&self) -> Vaddr {
        self.base
    }

    /// The mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The address space the mapping lives in.
    pub fn asid(&self) -> Asid {
        self.asid
    }

    /// The mapping's access permissions.
    pub fn perms(&self) -> AccessPerms {
        self.perms
    }

    /// Whether the mapping covers `[start, start + size)`.
    pub fn covers(&self, start: Vaddr, size: usize) -> bool {
        start >= self.base && start + size <= self.base + self.size
    }
}
