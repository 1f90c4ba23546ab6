// SPDX-License-Identifier: MPL-2.0

//! The pin manager and reservation accounting.
//!
//! Pinning removes a frame from replacement consideration. Each pin
//! consumes a replacement page so the live list does not shrink: either
//! one counted in the caller's [`PinArgs`], or (for clients that reserved
//! ahead of time) a slot in the reserve pool, marked on the frame itself.

use crate::{
    events::PageEvent,
    frame::{FrameId, PagedState},
    pager::{Pager, PagerInner},
    prelude::*,
    sync::{MmuGuard, RamAllocGuard},
};

/// Replacement-page accounting for a pin operation.
#[derive(Debug, Default)]
pub struct PinArgs {
    /// Debit the reserve pool instead of carrying replacement pages.
    pub use_reserve: bool,
    /// Replacement pages in hand.
    pub replacement_pages: usize,
}

impl PinArgs {
    /// Arguments for a pinner that reserved pages ahead of time.
    pub fn reserve() -> Self {
        Self {
            use_reserve: true,
            replacement_pages: 0,
        }
    }

    /// Whether `count` further pins can be paid for.
    pub fn have_sufficient_pages(&self, count: usize) -> bool {
        self.use_reserve || self.replacement_pages >= count
    }

    /// Ensures `count` replacement pages are in hand, growing the live
    /// list as needed.
    pub fn alloc_replacement_pages(&mut self, pager: &Pager, count: usize) -> Result<()> {
        if self.use_reserve {
            return Ok(());
        }
        if count > self.replacement_pages {
            pager.alloc_pin_replacement_pages(count - self.replacement_pages)?;
            self.replacement_pages = count;
        }
        Ok(())
    }

    /// Returns any replacement pages still in hand.
    pub fn free_replacement_pages(&mut self, pager: &Pager) {
        if !self.use_reserve && self.replacement_pages != 0 {
            pager.free_pin_replacement_pages(self.replacement_pages);
        }
        self.replacement_pages = 0;
    }
}

impl Pager {
    /// Pins a frame, removing it from the live list on the first pin.
    pub fn pin(&self, id: FrameId, args: &mut PinArgs) {
        let guard = self.lock_inner();
        drop(self.pin_locked(guard, id, args));
    }

    pub(crate) fn pin_locked<'a>(
        &'a self,
        mut guard: MmuGuard<'a, PagerInner>,
        id: FrameId,
        args: &mut PinArgs,
    ) -> MmuGuard<'a, PagerInner> {
        debug_assert!(args.have_sufficient_pages(1));

        let state = guard.frames.get(id).state;
        guard.frames.get_mut(id).pin_count += 1;
        self.event(PageEvent::PagePin, id);

        match state {
            PagedState::Young | PagedState::Old | PagedState::OldestClean
            | PagedState::OldestDirty => {
                guard.unlink_live(id);
                debug_assert_eq!(guard.frames.get(id).pin_count, 1);
            }
            PagedState::Pinned => {
                // Re-entrant pin; the counter is all that changes.
                debug_assert!(guard.frames.get(id).pin_count > 1);
                return guard;
            }
            PagedState::Unpaged => {
                // Could be a page in the process of being stolen, or one
                // that is never on the live list at all.
                debug_assert_eq!(guard.frames.get(id).pin_count, 1);
            }
            PagedState::PinnedMoved => {
                panic!("pinning moved frame {:?}", id)
            }
        }

        guard.frames.get_mut(id).state = PagedState::Pinned;
        guard.pinned_count += 1;

        if args.use_reserve {
            // This pin counts as coming from the reserve pool.
            guard.frames.get_mut(id).pinned_reserve = true;
        } else {
            args.replacement_pages -= 1;
        }

        self.balance_ages(guard)
    }

    /// Unpins a frame; the last unpin restores it to the live list as the
    /// youngest page and returns a replacement to `args` (unless the pin
    /// came from the reserve pool).
    pub fn unpin(&self, id: FrameId, args: &mut PinArgs) {
        let guard = self.lock_inner();
        drop(self.unpin_locked(guard, id, args));
    }

    pub(crate) fn unpin_locked<'a>(
        &'a self,
        mut guard: MmuGuard<'a, PagerInner>,
        id: FrameId,
        args: &mut PinArgs,
    ) -> MmuGuard<'a, PagerInner> {
        {
            let frame = guard.frames.get(id);
            debug_assert_eq!(frame.state, PagedState::Pinned);
            debug_assert!(frame.pin_count > 0);
        }

        guard.frames.get_mut(id).pin_count -= 1;
        self.event(PageEvent::PageUnpin, id);
        if guard.frames.get(id).pin_count > 0 {
            return guard;
        }

        guard.frames.get_mut(id).state = PagedState::Unpaged;
        guard.pinned_count -= 1;

        let was_reserve = guard.frames.get(id).pinned_reserve;
        guard.frames.get_mut(id).pinned_reserve = false;
        if !was_reserve {
            // Not a reserve pin, so there is now a spare replacement page
            // to use again or free later.
            debug_assert!(!args.use_reserve);
            args.replacement_pages += 1;
        }

        self.add_as_youngest(&mut guard, id);
        self.balance_ages(guard)
    }

    /// Grows the live list until `count` free pages are in hand, then
    /// debits them for use as pin replacements.
    pub fn alloc_pin_replacement_pages(&self, count: usize) -> Result<()> {
        log::trace!("pager alloc_pin_replacement_pages({})", count);

        let ram = self.ram_alloc_lock().lock();
        let mut guard = self.lock_inner();

        let ok = loop {
            if guard.free_pages >= count {
                guard.free_pages -= count;
                break true;
            }
            let (g, grown) = self.try_grow_live_list(guard, &ram);
            guard = g;
            if !grown {
                break false;
            }
        };

        drop(guard);
        drop(ram);
        if ok {
            Ok(())
        } else {
            Err(Error::NoMemory)
        }
    }

    /// Credits `count` pin-replacement pages back to the free pool.
    pub fn free_pin_replacement_pages(&self, count: usize) {
        log::trace!("pager free_pin_replacement_pages({})", count);

        let ram = self.ram_alloc_lock().lock();
        let mut guard = self.lock_inner();

        guard.free_pages += count;
        guard = self.remove_excess_pages(guard, &ram);

        drop(guard);
        drop(ram);
    }

    /// Moves one page from the free pool into the reserve, raising the
    /// minimum if the cache is at its floor.
    fn reserve_page<'a>(
        &'a self,
        mut guard: MmuGuard<'a, PagerInner>,
        ram: &RamAllocGuard<'_>,
    ) -> (MmuGuard<'a, PagerInner>, bool) {
        debug_assert!(guard.min_page_count >= guard.min_limit + guard.reserve_page_count);

        while guard.min_page_count == guard.min_limit + guard.reserve_page_count
            && guard.free_pages == 0
        {
            let (g, grown) = self.try_grow_live_list(guard, ram);
            guard = g;
            if !grown {
                return (guard, false);
            }
        }
        if guard.min_page_count == guard.min_limit + guard.reserve_page_count {
            guard.min_page_count += 1;
            guard.free_pages -= 1;
            if guard.min_page_count > guard.max_page_count {
                guard.max_page_count = guard.min_page_count;
            }
        }
        guard.reserve_page_count += 1;

        debug_assert!(guard.min_page_count >= guard.min_limit + guard.reserve_page_count);
        debug_assert!(guard.min_page_count + guard.free_pages <= guard.max_page_count);
        (guard, true)
    }

    /// Reserves `required` pages for later reserve-pool pins, recording
    /// progress in `count` so a partial reservation can be reversed. The
    /// `MmuLock` is flashed between pages to let higher-priority work in.
    ///
    /// Returns whether the full amount was reserved; on failure all
    /// progress is already reversed.
    pub fn reserve_pages(&self, required: usize, count: &mut usize) -> bool {
        let ram = self.ram_alloc_lock().lock();
        let mut guard = self.lock_inner();

        while *count < required {
            let (g, ok) = self.reserve_page(guard, &ram);
            guard = g;
            if !ok {
                break;
            }
            *count += 1;
            guard = self.inner_lock().flash(guard);
        }
        let enough = *count == required;

        drop(guard);
        drop(ram);

        if !enough {
            self.unreserve_pages(count);
        }
        enough
    }

    /// Releases `count` reserved pages back to the free pool.
    pub fn unreserve_pages(&self, count: &mut usize) {
        let mut guard = self.lock_inner();
        debug_assert!(guard.reserve_page_count >= *count);
        guard.reserve_page_count -= *count;
        *count = 0;
    }
}
