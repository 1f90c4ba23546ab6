// SPDX-License-Identifier: MPL-2.0

//! The demand-paging lock: the client-facing façade for pinning a virtual
//! range for the duration of a critical section, so code that cannot
//! tolerate a page fault (ISRs, drivers holding fast mutexes) can touch
//! pageable memory.
//!
//! A lock is allocated once with a worst-case size, which reserves the
//! replacement pages up front; `lock` then pins the actual range, and
//! `unlock` releases it, without any allocation on the hot path.

use crate::{
    frame::FrameId,
    mmu::{AccessPerms, Vaddr, PAGE_MASK, PAGE_SHIFT},
    pager::{Pager, PinArgs},
    prelude::*,
    thread::ThreadContext,
};

/// Page tables that may need pinning alongside `count` pages.
fn max_page_tables(count: usize) -> usize {
    // A range of N pages can straddle N/pages-per-table + 1 tables.
    count / (crate::mmu::PAGE_SIZE / core::mem::size_of::<usize>()) + 1
}

/// Pages that must stay reserved to pin one page table.
const PAGES_TO_PIN_ONE_PAGE_TABLE: usize = 1;

/// The pin state backing one demand-paging lock: which frames the lock
/// currently holds pinned.
struct VirtualPinMapping {
    capacity: usize,
    pinned: Vec<FrameId>,
}

impl VirtualPinMapping {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pinned: Vec::with_capacity(capacity),
        }
    }

    /// Pins `count` pages of `memory` starting at `index`. All pages must
    /// be resident; a missing page rolls back everything and reports
    /// `NotFound`.
    fn pin(
        &mut self,
        pager: &Pager,
        memory: &Arc<crate::manager::MemoryObject>,
        index: usize,
        count: usize,
        _perms: AccessPerms,
    ) -> Result<()> {
        debug_assert!(self.pinned.is_empty());
        debug_assert!(count <= self.capacity);

        let mut args = PinArgs::reserve();
        for i in index..index + count {
            let Some(paddr) = memory.page(i) else {
                self.unpin(pager);
                return Err(Error::NotFound);
            };
            let id = FrameId::from_paddr(paddr);
            pager.pin(id, &mut args);
            self.pinned.push(id);
        }
        Ok(())
    }

    fn unpin(&mut self, pager: &Pager) {
        let mut args = PinArgs::reserve();
        for id in self.pinned.drain(..) {
            pager.unpin(id, &mut args);
        }
    }
}

/// A client-held lock that pins a virtual range against paging.
pub struct DemandPagingLock {
    max_pages: usize,
    reserved_pages: usize,
    locked_pages: usize,
    pin_mapping: Option<VirtualPinMapping>,
}

impl DemandPagingLock {
    /// An unallocated lock; call [`alloc`] before use.
    ///
    /// [`alloc`]: Self::alloc
    pub fn new() -> Self {
        Self {
            max_pages: 0,
            reserved_pages: 0,
            locked_pages: 0,
            pin_mapping: None,
        }
    }

    /// Reserves resources to later lock any range of up to `size` bytes:
    /// one page more than the range can span, plus whole pages for each
    /// page table that pinning may remove from the live list.
    pub fn alloc(&mut self, pager: &Pager, size: usize) -> Result<()> {
        log::trace!("demand-paging lock alloc({})", size);
        debug_assert!(size > 0);
        self.max_pages = ((size - 1 + PAGE_MASK) >> PAGE_SHIFT) + 1;

        let reserve =
            self.max_pages + max_page_tables(self.max_pages) * PAGES_TO_PIN_ONE_PAGE_TABLE;
        if !pager.reserve_pages(reserve, &mut self.reserved_pages) {
            return Err(Error::NoMemory);
        }
        self.pin_mapping = Some(VirtualPinMapping::new(self.max_pages));
        Ok(())
    }

    /// Pins `[start, start + size)` in `thread`'s address space.
    ///
    /// Returns `Ok(false)` if the memory is not demand paged (nothing to
    /// do), `Ok(true)` if pages were pinned, and `BadDescriptor` if the
    /// mapping is stale or a page is missing.
    pub fn lock(
        &mut self,
        pager: &Pager,
        thread: &ThreadContext,
        start: Vaddr,
        size: usize,
    ) -> Result<bool> {
        assert_eq!(self.locked_pages, 0, "demand-paging lock already in use");

        let offset = start & PAGE_MASK;
        let nr_pages = (size + offset + PAGE_MASK) >> PAGE_SHIFT;
        assert!(nr_pages <= self.max_pages);

        let Some((mapping, page_offset, instance)) =
            pager.mmu().find_mapping(thread.asid, start, size)
        else {
            return Err(Error::BadDescriptor);
        };

        if instance != mapping.instance_count() {
            // The mapping has been reused.
            return Err(Error::BadDescriptor);
        }
        let Some(memory) = mapping.memory() else {
            return Err(Error::BadDescriptor);
        };

        if !memory.is_demand_paged() {
            return Ok(false);
        }

        let index = page_offset + mapping.start_index();
        let count = nr_pages;
        let pin_mapping = self
            .pin_mapping
            .as_mut()
            .expect("demand-paging lock used before alloc");
        match pin_mapping.pin(pager, &memory, index, count, mapping.perms()) {
            Ok(()) => {
                self.locked_pages = count;
                Ok(true)
            }
            // Some memory was not present; the range was bad.
            Err(Error::NotFound) => Err(Error::BadDescriptor),
            Err(e) => Err(e),
        }
    }

    /// Unpins whatever [`lock`] pinned.
    ///
    /// [`lock`]: Self::lock
    pub fn unlock(&mut self, pager: &Pager) {
        if self.locked_pages == 0 {
            return;
        }
        if let Some(pin_mapping) = self.pin_mapping.as_mut() {
            pin_mapping.unpin(pager);
        }
        self.locked_pages = 0;
    }

    /// Releases the lock's reservation entirely.
    pub fn free(&mut self, pager: &Pager) {
        self.unlock(pager);
        self.pin_mapping = None;
        pager.unreserve_pages(&mut self.reserved_pages);
        self.max_pages = 0;
    }
}

impl Default for DemandPagingLock {
    fn default() -> Self {
        Self::new()
    }
}
