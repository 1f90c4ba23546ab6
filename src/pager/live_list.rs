// SPDX-License-Identifier: MPL-2.0

//! Live-list maintenance: the state-change helpers, age balancing, and
//! the page-in completion paths used by the memory managers.
//!
//! All transitions of a frame's paged state funnel through this module so
//! the queue counts and the state machine can never disagree. Everything
//! here runs under the `MmuLock`; the only operations that drop it are
//! [`Pager::balance_ages`] (for the deferred restriction callback) and
//! [`Pager::restrict_page`] itself.

use crate::{
    config::MAX_OLDEST_PAGES,
    events::PageEvent,
    frame::{FrameId, FrameKind, PagedState},
    manager::PageRestriction,
    pager::{set_clean, Pager, PagerInner, PinArgs},
    prelude::*,
    sync::MmuGuard,
};

impl Pager {
    /// Inserts an unpaged frame at the head of the young list.
    pub(crate) fn add_as_youngest(&self, inner: &mut PagerInner, id: FrameId) {
        debug_assert_eq!(inner.frames.get(id).state, PagedState::Unpaged);

        inner.frames.get_mut(id).state = PagedState::Young;
        let PagerInner { frames, young, .. } = inner;
        young.push_head(frames, id);
    }

    /// Marks a frame free with the MMU and inserts it at the head of the
    /// oldest-clean list.
    pub(crate) fn add_as_free(&self, inner: &mut PagerInner, id: FrameId) {
        debug_assert_eq!(inner.frames.get(id).state, PagedState::Unpaged);
        self.mmu().page_freed(id.paddr());

        inner.frames.get_mut(id).state = PagedState::OldestClean;
        let PagerInner {
            frames,
            oldest_clean,
            ..
        } = inner;
        oldest_clean.push_head(frames, id);

        self.event(PageEvent::PageInFree, id);
    }

    /// Dequeues a frame from whichever sublist it is on and marks it
    /// unpaged. Forbidden for pinned frames.
    pub(crate) fn remove_page(&self, inner: &mut PagerInner, id: FrameId) {
        let state = inner.frames.get(id).state;
        match state {
            PagedState::Young | PagedState::Old | PagedState::OldestClean
            | PagedState::OldestDirty => {
                inner.unlink_live(id);
            }
            PagedState::Unpaged => {
                // A demand-paged page-table page can already be unpaged
                // here when its table was freed concurrently.
                return;
            }
            PagedState::Pinned | PagedState::PinnedMoved => {
                panic!("removing pinned frame {:?} from the live list", id)
            }
        }
        let frame = inner.frames.get_mut(id);
        frame.state = PagedState::Unpaged;
        frame.modifier = 0;
    }

    /// Called when a manager decommits a page. Keeps the frame's slot in
    /// the cache by moving it to the oldest-clean list.
    ///
    /// Returns `NotFound` if the frame is not the pager's to keep: it was
    /// already unpaged, or it is a moved pinned frame that must go back to
    /// the free pool.
    pub fn page_freed(&self, id: FrameId) -> Result<()> {
        let mut inner = self.lock_inner();
        match inner.frames.get(id).state {
            PagedState::Unpaged => return Err(Error::NotFound),

            PagedState::Young | PagedState::Old | PagedState::OldestClean
            | PagedState::OldestDirty => {
                inner.unlink_live(id);
            }

            PagedState::Pinned => {
                // A pinned mapping is being unmapped while the memory is
                // decommitted; the unpin path will restore the frame, so
                // there is nothing to do now.
                return Ok(());
            }

            PagedState::PinnedMoved => {
                // The frame was pinned when it was moved and has not been
                // returned to the free pool yet; it must be unpaged before
                // that happens.
                inner.frames.get_mut(id).state = PagedState::Unpaged;
                return Err(Error::NotFound);
            }
        }

        if inner.frames.get(id).dirty {
            inner.frames.get_mut(id).writable = false;
            set_clean(&mut inner, id);
        }

        inner.frames.get_mut(id).state = PagedState::OldestClean;
        let PagerInner {
            frames,
            oldest_clean,
            ..
        } = &mut *inner;
        oldest_clean.push_head(frames, id);

        Ok(())
    }

    /// Splices `new` into `old`'s live-list position when the MMU
    /// relocates a frame. A pinned `old` becomes [`PagedState::PinnedMoved`]
    /// instead, to be handed back to the free pool on its next touch.
    pub fn replace_page(&self, old: FrameId, new: FrameId) {
        let mut inner = self.lock_inner();
        let state = inner.frames.get(old).state;
        match state {
            PagedState::Young | PagedState::Old | PagedState::OldestClean
            | PagedState::OldestDirty => {
                debug_assert_eq!(inner.frames.get(new).state, PagedState::Unpaged);
                {
                    let PagerInner {
                        frames,
                        young,
                        old: old_q,
                        oldest_clean,
                        oldest_dirty,
                        ..
                    } = &mut *inner;
                    let queue = match state {
                        PagedState::Young => young,
                        PagedState::Old => old_q,
                        PagedState::OldestClean => oldest_clean,
                        PagedState::OldestDirty => oldest_dirty,
                        _ => unreachable!(),
                    };
                    queue.replace(frames, old, new);
                }
                inner.frames.get_mut(new).state = state;
                let frame = inner.frames.get_mut(old);
                frame.state = PagedState::Unpaged;
                frame.modifier = 0;
            }
            PagedState::Pinned => {
                let frame = inner.frames.get_mut(old);
                frame.pin_count = 0;
                frame.pinned_reserve = false;
                frame.state = PagedState::PinnedMoved;
                inner.pinned_count -= 1;
            }
            // Pinned-moved frames keep the RAM-alloc lock held for their
            // whole lifetime, and unpaged frames cannot be moved at all.
            PagedState::PinnedMoved | PagedState::Unpaged => {
                panic!("replacing frame {:?} in state {:?}", old, state)
            }
        }
    }

    /// Restores the young/old and old/oldest ratios after a mutation.
    ///
    /// May drop and reacquire the `MmuLock`: the restriction of a freshly
    /// aged page calls into the owning manager, which is deferred to the
    /// very end so the counts are stable while the lock is held.
    pub(crate) fn balance_ages<'a>(
        &'a self,
        mut guard: MmuGuard<'a, PagerInner>,
    ) -> MmuGuard<'a, PagerInner> {
        let mut restrict = None;
        {
            let inner = &mut *guard;
            let oldest = inner.oldest_count();
            if (inner.old.len() + oldest) * inner.young_old_ratio < inner.young.len() {
                // Need more old pages, so age the oldest young page.
                debug_assert!(!inner.young.is_empty());
                let PagerInner {
                    frames, young, old, ..
                } = inner;
                let id = young.pop_tail(frames).unwrap();
                frames.get_mut(id).state = PagedState::Old;
                old.push_head(frames, id);
                self.event(PageEvent::PageAged, id);
                // Restricting the page may drop the lock, so defer it.
                restrict = Some(id);
            }

            let oldest = inner.oldest_count();
            if oldest < MAX_OLDEST_PAGES && oldest * inner.old_oldest_ratio < inner.old.len() {
                debug_assert!(!inner.old.is_empty());
                let PagerInner {
                    frames,
                    old,
                    oldest_clean,
                    oldest_dirty,
                    ..
                } = inner;
                let id = old.pop_tail(frames).unwrap();
                if frames.get(id).dirty {
                    frames.get_mut(id).state = PagedState::OldestDirty;
                    oldest_dirty.push_head(frames, id);
                    self.event(PageEvent::PageAgedDirty, id);
                    self.cleaner().notify_pages_to_clean();
                } else {
                    frames.get_mut(id).state = PagedState::OldestClean;
                    oldest_clean.push_head(frames, id);
                    self.event(PageEvent::PageAgedClean, id);
                }
            }
        }

        if let Some(id) = restrict {
            // Make the freshly aged page inaccessible so its next touch
            // rejuvenates it.
            let (guard2, _) = self.restrict_page(guard, id, PageRestriction::NoAccessForOld);
            guard = guard2;
        }
        guard
    }

    /// Asks the owning manager to restrict access to a page.
    ///
    /// Drops the `MmuLock` across the manager callback, keeping the memory
    /// object alive with a reference opened under the lock.
    pub(crate) fn restrict_page<'a>(
        &'a self,
        guard: MmuGuard<'a, PagerInner>,
        id: FrameId,
        restriction: PageRestriction,
    ) -> (MmuGuard<'a, PagerInner>, Result<()>) {
        let frame = guard.frames.get(id);
        if frame.kind != FrameKind::Managed {
            // The page has no owner, so there is nothing to restrict.
            return (guard, Ok(()));
        }
        let Some(memory) = frame.owner() else {
            return (guard, Ok(()));
        };
        let manager = memory.manager().clone();

        drop(guard);
        let r = manager.restrict_page(self, &memory, id, restriction);
        drop(memory);
        let guard = self.inner_lock().lock();

        (guard, r)
    }

    /// Completes a page-in: the frame is resident and mapped, make it the
    /// youngest (or refresh it if it is pinned).
    pub fn paged_in(&self, id: FrameId) {
        let mut guard = self.lock_inner();
        match guard.frames.get(id).state {
            PagedState::Young | PagedState::Old | PagedState::OldestClean
            | PagedState::OldestDirty => {
                self.remove_page(&mut guard, id);
                self.add_as_youngest(&mut guard, id);
                drop(self.balance_ages(guard));
            }
            PagedState::Unpaged => {
                self.add_as_youngest(&mut guard, id);
                drop(self.balance_ages(guard));
            }
            PagedState::Pinned => {
                // Clear the modifier so a concurrent move of this page can
                // detect the access; for unpinned pages the remove path
                // does this.
                guard.frames.get_mut(id).modifier = 0;
            }
            PagedState::PinnedMoved => {
                panic!("paged-in frame {:?} was moved while pinned", id)
            }
        }
    }

    /// Completes a page-in whose page turned out to be unneeded: the frame
    /// goes straight to the free end of the cache.
    pub fn paged_in_unneeded(&self, id: FrameId) {
        let mut inner = self.lock_inner();
        self.event(PageEvent::PageInUnneeded, id);
        self.add_as_free(&mut inner, id);
    }

    /// Completes a page-in that must leave the page pinned.
    pub fn paged_in_pinned(&self, id: FrameId, args: &mut PinArgs) {
        let guard = self.lock_inner();
        drop(self.pin_locked(guard, id, args));
    }
}
