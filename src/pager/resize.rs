// SPDX-License-Identifier: MPL-2.0

//! The cache-resize protocol.

use crate::{
    config::ABSOLUTE_MAX_PAGE_COUNT,
    pager::Pager,
    prelude::*,
};

impl Pager {
    /// Resizes the live list to `[min, max]` pages.
    ///
    /// `min` is clamped up to the minimum page limit plus the reserve;
    /// `max` is clamped to the absolute maximum and then to at least
    /// `min`. A zero `max` restores the boot-time sizes. The maximum is
    /// grown before anything shrinks; raising the minimum consumes free
    /// pages first and then grows the list, failing with `NoMemory` when
    /// the system has nothing left; lowering the maximum returns free
    /// pages to the system.
    pub fn resize_live_list(&self, min: usize, max: usize) -> Result<()> {
        let ram = self.ram_alloc_lock().lock();
        let mut guard = self.lock_inner();
        assert!(guard.initialised);
        assert!(guard.young_old_ratio != 0);

        let (mut min, mut max) = if max == 0 {
            (guard.init_min, guard.init_max)
        } else {
            (min, max)
        };
        max = max.min(ABSOLUTE_MAX_PAGE_COUNT);
        if min > max {
            return Err(Error::InvalidArgs);
        }

        log::debug!(
            "pager resize_live_list({}, {}) current min={} free={} max={}",
            min,
            max,
            guard.min_page_count,
            guard.free_pages,
            guard.max_page_count
        );

        // The minimum page limit depends on the request pool, which may
        // have grown since the last resize.
        guard.min_limit = self.minimum_page_limit(guard.young_old_ratio);
        min = min.max(guard.min_limit + guard.reserve_page_count);
        max = max.max(min);

        // Increase the maximum first so nothing below overshoots it.
        if max > guard.max_page_count {
            guard.max_page_count = max;
        }

        // Reduce the minimum by moving slots from the minimum to the free
        // pool.
        if guard.min_page_count > min {
            let spare = guard.min_page_count - min;
            guard.min_page_count -= spare;
            guard.free_pages += spare;
        }

        // Increase the minimum, consuming free pages first, then growing
        // the live list.
        let mut r = Ok(());
        while guard.min_page_count < min {
            let new_min = min.min(guard.min_page_count + guard.free_pages);
            let delta = new_min - guard.min_page_count;
            if delta != 0 {
                guard.min_page_count = new_min;
                guard.free_pages -= delta;
                continue;
            }

            let (g, grown) = self.try_grow_live_list(guard, &ram);
            guard = g;
            if !grown {
                r = Err(Error::NoMemory);
                break;
            }
        }

        // Reduce the maximum, returning the free pages to the system so
        // the cache settles at its minimum.
        while guard.max_page_count > max {
            if guard.free_pages > 0 {
                guard = self.return_oldest_page_to_system(guard, &ram);
            } else {
                guard.max_page_count = max;
            }
        }

        log::debug!(
            "pager resize_live_list end min={} free={} max={}",
            guard.min_page_count,
            guard.free_pages,
            guard.max_page_count
        );

        drop(guard);
        drop(ram);
        r
    }
}
