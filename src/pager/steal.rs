// SPDX-License-Identifier: MPL-2.0

//! The steal/discard engine.
//!
//! Victim selection walks the live-list tails oldest-first; revoking a
//! frame from its owner crosses into the owning manager with the
//! `MmuLock` dropped. Dirty victims additionally require the
//! `PageCleaningLock`, signalled to callers with the `NeedsCleaning`
//! sentinel so they can acquire it outside the `MmuLock` and retry.

use crate::{
    events::PageEvent,
    frame::{FrameId, FrameKind, PagedState},
    manager::MemoryObject,
    mmu::{AllocConstraint, PageKind, RamAllocFlags},
    pager::{Pager, PagerInner},
    prelude::*,
    sync::{CleaningGuard, MmuGuard, RamAllocGuard},
};

/// Whether the defragmenter may steal this page rather than move it.
///
/// Pinned pages cannot be stolen, and dirty pages are not worth cleaning
/// during a general defragmentation pass.
fn discard_can_steal_page(inner: &PagerInner, id: FrameId, block_rest: bool) -> bool {
    let frame = inner.frames.get(id);
    frame.kind == FrameKind::Unused
        || (frame.state != PagedState::Pinned && (!block_rest || !frame.dirty))
}

impl Pager {
    /// Picks the oldest frame on the live list and tries to steal it.
    ///
    /// Returns `NeedsCleaning` if the victim is dirty and `cleaning` is
    /// not held; the caller must acquire the page-cleaning lock (with the
    /// `MmuLock` dropped) and retry. Any other error comes from the
    /// owning manager and the caller should also retry.
    pub(crate) fn try_steal_oldest<'a>(
        &'a self,
        guard: MmuGuard<'a, PagerInner>,
        ram: &RamAllocGuard<'_>,
        cleaning: Option<&CleaningGuard<'_>>,
    ) -> (MmuGuard<'a, PagerInner>, Result<FrameId>) {
        let id = if let Some(id) = guard.oldest_clean.tail() {
            id
        } else if let Some(id) = guard.oldest_dirty.tail() {
            id
        } else if let Some(id) = guard.old.tail() {
            id
        } else {
            assert!(!guard.young.is_empty());
            guard.young.tail().unwrap()
        };

        if guard.frames.get(id).dirty && cleaning.is_none() {
            return (guard, Err(Error::NeedsCleaning));
        }

        let (guard, r) = self.steal_page(guard, ram, id);
        match r {
            Ok(()) => {
                let guard = self.balance_ages(guard);
                (guard, Ok(id))
            }
            Err(e) => (guard, Err(e)),
        }
    }

    /// Steals the oldest frame, acquiring the page-cleaning lock on demand
    /// and retrying until a frame is obtained.
    pub(crate) fn steal_oldest<'a>(
        &'a self,
        mut guard: MmuGuard<'a, PagerInner>,
        ram: &RamAllocGuard<'_>,
    ) -> (MmuGuard<'a, PagerInner>, FrameId) {
        let mut cleaning: Option<CleaningGuard<'_>> = None;
        loop {
            let (g, r) = self.try_steal_oldest(guard, ram, cleaning.as_ref());
            guard = g;
            match r {
                Ok(id) => {
                    if cleaning.is_some() {
                        drop(guard);
                        cleaning = None;
                        guard = self.lock_inner();
                    }
                    return (guard, id);
                }
                Err(Error::NeedsCleaning) => {
                    assert!(cleaning.is_none());
                    drop(guard);
                    cleaning = Some(self.page_cleaning_lock().lock());
                    guard = self.lock_inner();
                }
                Err(_) => {} // retry
            }
        }
    }

    /// Revokes a frame from its owning memory object.
    ///
    /// The frame is removed from the live list and marked unpaged before
    /// anything else; the `MmuLock` is only dropped after that, around the
    /// manager callback (which unmaps the frame from all users and, for a
    /// dirty frame, writes it back under the caller's cleaning lock).
    pub(crate) fn steal_page<'a>(
        &'a self,
        mut guard: MmuGuard<'a, PagerInner>,
        _ram: &RamAllocGuard<'_>,
        id: FrameId,
    ) -> (MmuGuard<'a, PagerInner>, Result<()>) {
        self.remove_page(&mut guard, id);

        let r = if guard.frames.get(id).kind == FrameKind::Unused {
            // The page has no owner, so nothing needs revoking.
            Ok(())
        } else {
            debug_assert_eq!(guard.frames.get(id).kind, FrameKind::Managed);
            match guard.frames.get(id).owner() {
                Some(memory) => {
                    let manager = memory.manager().clone();
                    drop(guard);
                    let r = manager.steal_page(self, &memory, id);
                    drop(memory);
                    guard = self.lock_inner();
                    r
                }
                // The owner died; its decommit already revoked the page.
                None => Ok(()),
            }
        };

        if r.is_ok() {
            self.event(PageEvent::PageOut, id);
        }
        (guard, r)
    }

    /// Allocates one page from the system pool into the cache's free
    /// count. Returns `None` when the system is out of memory.
    pub(crate) fn get_page_from_system(
        &self,
        _ram: &RamAllocGuard<'_>,
        flags: RamAllocFlags,
        constraint: AllocConstraint,
    ) -> Option<FrameId> {
        let paddr = self
            .mmu()
            .alloc_ram(
                flags | RamAllocFlags::NO_PAGER_RECLAIM,
                PageKind::Discard,
                constraint,
            )
            .ok()?;

        let mut inner = self.lock_inner();
        inner.free_pages += 1;
        let id = inner
            .frames
            .frame_from_paddr(paddr)
            .expect("allocated frame beyond the frame table");
        drop(inner);

        Some(id)
    }

    /// Returns an unpaged frame to the system pool, dropping the
    /// `MmuLock` around the MMU call.
    pub(crate) fn return_page_to_system<'a>(
        &'a self,
        mut guard: MmuGuard<'a, PagerInner>,
        _ram: &RamAllocGuard<'_>,
        id: FrameId,
    ) -> MmuGuard<'a, PagerInner> {
        // Must be unpaged here, otherwise the MMU free path would hand the
        // page straight back to the pager.
        debug_assert_eq!(guard.frames.get(id).state, PagedState::Unpaged);
        debug_assert!(guard.free_pages > 0);
        guard.free_pages -= 1;

        drop(guard);
        self.mmu().free_ram(id.paddr(), PageKind::Discard);
        self.lock_inner()
    }

    /// Steals the oldest frame and returns it to the system.
    pub(crate) fn return_oldest_page_to_system<'a>(
        &'a self,
        guard: MmuGuard<'a, PagerInner>,
        ram: &RamAllocGuard<'_>,
    ) -> MmuGuard<'a, PagerInner> {
        let (guard, id) = self.steal_oldest(guard, ram);
        self.return_page_to_system(guard, ram, id)
    }

    /// Grows the live list by one page from the system.
    pub(crate) fn try_grow_live_list<'a>(
        &'a self,
        guard: MmuGuard<'a, PagerInner>,
        ram: &RamAllocGuard<'_>,
    ) -> (MmuGuard<'a, PagerInner>, bool) {
        drop(guard);
        let spare = self.get_page_from_system(
            ram,
            RamAllocFlags::NORMAL_CACHED | RamAllocFlags::NO_WIPE,
            AllocConstraint::default(),
        );
        let mut guard = self.lock_inner();

        match spare {
            Some(id) => {
                self.add_as_free(&mut guard, id);
                (guard, true)
            }
            None => (guard, false),
        }
    }

    /// Shrinks the cache while it holds more pages than its maximum.
    pub(crate) fn remove_excess_pages<'a>(
        &'a self,
        mut guard: MmuGuard<'a, PagerInner>,
        ram: &RamAllocGuard<'_>,
    ) -> MmuGuard<'a, PagerInner> {
        while guard.have_too_many_pages() {
            guard = self.return_oldest_page_to_system(guard, ram);
        }
        guard
    }

    /// Allocates a frame for a page-in, preferring the cache's own free
    /// pages, then the system pool, then stealing; blocks until one is
    /// obtained. The returned frame is unpaged and owned by the caller.
    pub fn page_in_alloc_page(&self, flags: RamAllocFlags) -> FrameId {
        let mut cleaning: Option<CleaningGuard<'_>> = None;
        let mut ram = self.ram_alloc_lock().lock();
        let mut guard = self.lock_inner();

        // `Some(guard)` in the break value means the frame was stolen from
        // the live list and still needs allocator re-initialisation; `None`
        // means it came fresh from the system pool.
        let (stolen, id) = 'find: loop {
            // Try recycling a free page already on the live list.
            let free_tail = guard
                .oldest_clean
                .tail()
                .filter(|id| guard.frames.get(*id).kind == FrameKind::Unused);

            if free_tail.is_none() {
                // Try the system pool while below the maximum.
                if !guard.have_maximum_pages() {
                    drop(guard);
                    if let Some(id) = self.get_page_from_system(&ram, flags, Default::default())
                    {
                        break 'find (None, id);
                    }
                    guard = self.lock_inner();
                }

                // A clean page is the cheapest steal.
                if !guard.oldest_clean.is_empty() {
                    // fall through to the steal below
                } else if guard.oldest_dirty.len() > 1 {
                    // Clean a batch of dirty pages in one go. Taking the
                    // page-cleaning lock means releasing the RAM-alloc
                    // lock first to respect the lock order for other
                    // threads' sake; if we already hold it, just clean.
                    if cleaning.is_none() {
                        drop(guard);
                        drop(ram);
                        let fresh = self.page_cleaning_lock().lock();
                        let inner = self.lock_inner();
                        // Waiting on the cleaning lock may have produced
                        // clean pages already; if so skip the cleaning.
                        let inner = if inner.oldest_clean.is_empty() {
                            let (inner, _) = self.clean_some_pages_locked(inner, &fresh, false);
                            inner
                        } else {
                            inner
                        };
                        drop(inner);
                        drop(fresh);
                        ram = self.ram_alloc_lock().lock();
                        guard = self.lock_inner();
                    } else {
                        let (g, _) =
                            self.clean_some_pages_locked(guard, cleaning.as_ref().unwrap(), false);
                        guard = g;
                    }
                    if !guard.oldest_clean.is_empty() {
                        continue 'find;
                    }
                }
            }

            // As a last resort, steal the oldest page whatever it is.
            assert!(
                !guard.oldest_clean.is_empty()
                    || !guard.oldest_dirty.is_empty()
                    || !guard.old.is_empty()
                    || !guard.young.is_empty()
            );
            let (g, r) = self.try_steal_oldest(guard, &ram, cleaning.as_ref());
            guard = g;
            match r {
                Ok(id) => break 'find (Some(guard), id),
                Err(Error::NeedsCleaning) => {
                    assert!(cleaning.is_none());
                    drop(guard);
                    cleaning = Some(self.page_cleaning_lock().lock());
                    guard = self.lock_inner();
                }
                Err(_) => {} // steal failed, restart the whole search
            }
        };

        if let Some(guard) = stolen {
            drop(guard);
            // Make the stolen page's state the same as a fresh allocation.
            self.mmu().pages_allocated(id.paddr(), flags);
        }

        drop(cleaning);
        drop(ram);
        id
    }

    /// Allocates `count` frames for a multi-page page-in, freeing any
    /// partial allocation on failure.
    pub fn page_in_alloc_pages(&self, count: usize, flags: RamAllocFlags) -> Vec<FrameId> {
        let mut pages = Vec::with_capacity(count);
        while pages.len() < count {
            pages.push(self.page_in_alloc_page(flags));
        }
        pages
    }

    /// Returns frames obtained from [`page_in_alloc_page`] that were not
    /// used after all.
    ///
    /// [`page_in_alloc_page`]: Self::page_in_alloc_page
    pub fn page_in_free_pages(&self, pages: &[FrameId]) {
        for &id in pages {
            let mut inner = self.lock_inner();
            match inner.frames.get(id).state {
                PagedState::Young | PagedState::Old | PagedState::OldestClean
                | PagedState::OldestDirty => {
                    self.remove_page(&mut inner, id);
                    self.add_as_free(&mut inner, id);
                }
                PagedState::Unpaged => {
                    self.add_as_free(&mut inner, id);
                }
                PagedState::Pinned | PagedState::PinnedMoved => {
                    panic!("freeing pinned page-in frame {:?}", id)
                }
            }
        }
    }

    /// Surrenders free pages to the system while at least `count` remain.
    /// Returns whether all `count` pages were surrendered.
    pub fn get_free_pages(&self, ram: &RamAllocGuard<'_>, count: usize) -> bool {
        log::trace!("pager get_free_pages({})", count);

        let mut remaining = count;
        let mut guard = self.lock_inner();
        while remaining > 0 && guard.free_pages >= remaining {
            guard = self.return_oldest_page_to_system(guard, ram);
            remaining -= 1;
        }
        drop(guard);

        remaining == 0
    }

    /// Donates committed discardable pages of `memory` to the live list,
    /// making them stealable under pressure.
    pub fn donate_pages(&self, memory: &Arc<MemoryObject>, indices: &[usize]) {
        let ram = self.ram_alloc_lock().lock();
        let mut guard = self.lock_inner();

        for &index in indices {
            let Some(paddr) = memory.page(index) else {
                continue; // page is not present
            };
            let Some(id) = guard.frames.frame_from_paddr(paddr) else {
                continue;
            };
            match guard.frames.get(id).state {
                PagedState::Unpaged => {
                    // Make the page discardable before it joins the live
                    // list; donors commit movable pages.
                    debug_assert_eq!(memory.manager().page_kind(), PageKind::Movable);
                    self.mmu()
                        .change_page_type(paddr, PageKind::Movable, PageKind::Discard);
                }
                PagedState::Young | PagedState::Old | PagedState::OldestClean
                | PagedState::OldestDirty => continue, // already donated

                PagedState::Pinned | PagedState::PinnedMoved => {
                    debug_assert!(false, "donating pinned page {:?}", id);
                    continue;
                }
            }

            self.add_as_youngest(&mut guard, id);
            guard.free_pages += 1;
            self.event(PageEvent::PageDonate, id);

            guard = self.remove_excess_pages(guard, &ram);
            guard = self.balance_ages(guard);
        }

        drop(guard);
        drop(ram);
    }

    /// Reclaims previously donated pages from the live list, restoring
    /// them to their owner's sole use.
    ///
    /// Returns `NotFound` if any page had already been stolen, and
    /// `NoMemory` if the live list could not be regrown to cover a
    /// reclaimed slot.
    pub fn reclaim_pages(&self, memory: &Arc<MemoryObject>, indices: &[usize]) -> Result<()> {
        let ram = self.ram_alloc_lock().lock();
        let mut guard = self.lock_inner();

        let mut r = Ok(());
        let mut iter = indices.iter();
        let mut pending: Option<usize> = None;
        loop {
            let index = match pending.take() {
                Some(index) => index,
                None => match iter.next() {
                    Some(&index) => index,
                    None => break,
                },
            };

            let Some(paddr) = memory.page(index) else {
                r = Err(Error::NotFound); // too late, the page has gone
                continue;
            };
            let Some(id) = guard.frames.frame_from_paddr(paddr) else {
                r = Err(Error::NotFound);
                continue;
            };
            let change_type = match guard.frames.get(id).state {
                PagedState::Unpaged => continue, // already reclaimed

                PagedState::Young | PagedState::Old | PagedState::OldestClean
                | PagedState::OldestDirty => true,

                PagedState::Pinned | PagedState::PinnedMoved => {
                    debug_assert!(false, "reclaiming pinned page {:?}", id);
                    false
                }
            };

            // The live list needs a page in hand before one is removed.
            if guard.free_pages < 1 {
                let (g, ok) = self.try_grow_live_list(guard, &ram);
                guard = g;
                if !ok {
                    r = Err(Error::NoMemory);
                    break;
                }
                // Retry this page; growing dropped the lock.
                pending = Some(index);
                continue;
            }

            if change_type {
                debug_assert_eq!(memory.manager().page_kind(), PageKind::Movable);
                self.mmu()
                    .change_page_type(paddr, PageKind::Discard, PageKind::Movable);
            }

            debug_assert!(guard.free_pages > 0);
            guard.free_pages -= 1;
            self.remove_page(&mut guard, id);

            self.event(PageEvent::PageReclaim, id);

            guard = self.balance_ages(guard);
        }

        // Growing may have added a spare page without removing one, which
        // can leave the cache oversized.
        guard = self.remove_excess_pages(guard, &ram);

        drop(guard);
        drop(ram);
        r
    }

    /// Discards one frame on behalf of the RAM defragmenter.
    ///
    /// Pinned frames, and dirty frames during a general defragmentation,
    /// are moved by the owning manager instead of stolen. Otherwise the
    /// frame is stolen and returned to the system, allocating a
    /// replacement first if the cache is at its minimum so the discard
    /// does not shrink it below that.
    pub fn discard_page(
        &self,
        ram: &RamAllocGuard<'_>,
        id: FrameId,
        constraint: AllocConstraint,
    ) -> Result<()> {
        log::trace!("pager discard_page {:?}", id);

        let mut guard = self.lock_inner();

        if !discard_can_steal_page(&guard, id, constraint.block_rest) {
            // The page is pinned, or dirty during a general defrag, so ask
            // the manager to move it instead.
            let frame = guard.frames.get(id);
            debug_assert_eq!(frame.kind, FrameKind::Managed);
            let memory = frame.owner().ok_or(Error::NotFound)?;
            let manager = memory.manager().clone();
            drop(guard);
            return manager.move_page(self, &memory, id, constraint).map(|_| ());
        }

        let mut r = Ok(());
        let mut replacement: Option<FrameId> = None;
        let mut cleaning: Option<CleaningGuard<'_>> = None;

        loop {
            let need_page = guard.free_pages == 0 && replacement.is_none();
            let need_cleaning = guard.frames.get(id).dirty && cleaning.is_none();
            if !need_page && !need_cleaning {
                break;
            }
            drop(guard);

            if need_page {
                // The live list is at its minimum; get a page in hand so
                // the discard does not shrink it below that.
                let flags = RamAllocFlags::NORMAL_CACHED | RamAllocFlags::NO_WIPE;
                match self.get_page_from_system(ram, flags, constraint) {
                    Some(new) => replacement = Some(new),
                    None => {
                        r = Err(Error::NoMemory);
                        guard = self.lock_inner();
                        break;
                    }
                }
            }

            if need_cleaning {
                // The victim needs writing back; take the cleaning lock so
                // the steal below can do that.
                cleaning = Some(self.page_cleaning_lock().lock());
            }

            // Re-check the predicates now the lock is reacquired.
            guard = self.lock_inner();
            if !discard_can_steal_page(&guard, id, constraint.block_rest) {
                r = Err(Error::InUse);
                break;
            }
        }

        if r.is_ok() {
            let (g, steal_r) = self.steal_page(guard, ram, id);
            guard = g;
            r = steal_r;
        }

        if r.is_ok() && guard.free_pages == 0 {
            match replacement.take() {
                Some(new) => {
                    // Discarding the old page would shrink the live list
                    // below minimum, so feed in the page in hand.
                    self.add_as_free(&mut guard, new);
                }
                None => {
                    // The live list shrank while the page was being
                    // cleaned and there is no page in hand; give up.
                    self.add_as_free(&mut guard, id);
                    guard = self.balance_ages(guard);
                    r = Err(Error::InUse);
                }
            }
        }

        if r.is_ok() {
            guard = self.return_page_to_system(guard, ram, id);
            guard = self.balance_ages(guard);
        }

        if let Some(new) = replacement {
            // The replacement was not needed after all. Its allocation is
            // counted in the free total, so either the live list absorbs
            // it or the system takes it back.
            if guard.free_pages == 0 {
                self.add_as_free(&mut guard, new);
            } else {
                guard = self.return_page_to_system(guard, ram, new);
            }
        }

        drop(guard);
        drop(cleaning);
        r
    }

    /// Steals every live frame back to the free pool, then shrinks the
    /// cache to its minimum. The HAL flush-cache entry.
    pub fn flush_all(&self) {
        let ram = self.ram_alloc_lock().lock();
        let cleaning = self.page_cleaning_lock().lock();

        log::debug!("pager flush_all: {:?}", self.live_counts());

        let mut guard = self.lock_inner();
        let nr_frames = guard.frames.len();
        for n in 0..nr_frames {
            let id = FrameId(n);
            let frame = guard.frames.get(id);
            if frame.state.is_live() && frame.kind != FrameKind::Unused {
                let (g, r) = self.steal_page(guard, &ram, id);
                guard = g;
                if r.is_ok() {
                    self.add_as_free(&mut guard, id);
                }
            }
            if n % 16 == 15 {
                guard = self.inner_lock().flash(guard);
            }
        }
        drop(guard);

        // Reduce the live list to its minimum.
        while self.get_free_pages(&ram, 1) {}

        log::debug!("pager flush_all done: {:?}", self.live_counts());

        drop(cleaning);
        drop(ram);
    }
}
