// SPDX-License-Identifier: MPL-2.0

//! The cleaner interface: selecting oldest-dirty frames and handing them
//! to the data-paging manager for write-back.

use crate::{
    config::{MAX_PAGES_TO_CLEAN, PAGE_COLOUR_COUNT},
    frame::{FrameId, PagedState},
    pager::{Pager, PagerInner},
    sync::{CleaningGuard, MmuGuard},
};

const SELECTOR_MAX: usize = MAX_PAGES_TO_CLEAN;
const SELECTOR_LEN: usize = MAX_PAGES_TO_CLEAN.next_multiple_of(PAGE_COLOUR_COUNT);

/// Picks candidates so that the chosen frames' colour indices form a
/// contiguous sequence (modulo [`PAGE_COLOUR_COUNT`]), as the write-back
/// path requires on cache architectures with page colouring.
///
/// Candidates land in the first empty slot of their colour class; each
/// slot tracks the length of the contiguous run of filled slots ending at
/// it, and the best run (possibly wrapping round the array) wins.
struct ColourRunSelector {
    slots: [Option<FrameId>; SELECTOR_LEN],
    run_len: [u8; SELECTOR_LEN],
    longest_start: usize,
    longest_len: usize,
}

impl ColourRunSelector {
    fn new() -> Self {
        Self {
            slots: [None; SELECTOR_LEN],
            run_len: [0; SELECTOR_LEN],
            longest_start: 0,
            longest_len: 0,
        }
    }

    fn found_longest_run(&self) -> bool {
        self.longest_len >= SELECTOR_MAX
    }

    fn add_candidate(&mut self, id: FrameId, colour: usize) {
        debug_assert!(colour < PAGE_COLOUR_COUNT);
        let mut i = colour;
        while i < SELECTOR_LEN {
            if self.slots[i].is_none() {
                self.slots[i] = Some(id);
                self.run_len[i] = if i == 0 { 1 } else { self.run_len[i - 1] + 1 };
                let mut j = i + 1;
                while j < SELECTOR_LEN && self.run_len[j] != 0 {
                    self.run_len[j] += self.run_len[i];
                    j += 1;
                }
                let current = self.run_len[j - 1] as usize;
                if current > self.longest_len {
                    self.longest_len = current;
                    self.longest_start = j - current;
                }
                break;
            }
            i += PAGE_COLOUR_COUNT;
        }
    }

    fn find_longest_run(mut self, out: &mut [Option<FrameId>]) -> usize {
        if self.longest_len == 0 {
            return 0;
        }

        if self.longest_len < SELECTOR_MAX
            && self.slots[0].is_some()
            && self.slots[SELECTOR_LEN - 1].is_some()
        {
            // A run ending at the last slot may continue from the first.
            let mut i = 1;
            while self.slots[i].is_some() {
                i += 1;
            }
            let wrapped = self.run_len[SELECTOR_LEN - 1] as usize + self.run_len[i - 1] as usize;
            if wrapped > self.longest_len {
                self.longest_len = wrapped;
                self.longest_start = SELECTOR_LEN - self.run_len[SELECTOR_LEN - 1] as usize;
            }
        }

        self.longest_len = self.longest_len.min(SELECTOR_MAX);
        debug_assert!(self.longest_start < SELECTOR_LEN);

        let head = self
            .longest_len
            .min(SELECTOR_LEN - self.longest_start);
        out[..head]
            .copy_from_slice(&self.slots[self.longest_start..self.longest_start + head]);
        out[head..self.longest_len].copy_from_slice(&self.slots[..self.longest_len - head]);

        self.longest_len
    }
}

impl Pager {
    /// Walks the oldest-dirty list from its tail, collecting up to
    /// [`MAX_PAGES_TO_CLEAN`] non-writable frames whose colours form a
    /// sequential run. Returns the number of frames written to `out`.
    fn select_pages_to_clean(
        &self,
        inner: &PagerInner,
        out: &mut [Option<FrameId>; MAX_PAGES_TO_CLEAN],
    ) -> usize {
        let mut selector = ColourRunSelector::new();

        for id in inner.oldest_dirty.iter_from_tail(&inner.frames) {
            let frame = inner.frames.get(id);
            if frame.writable {
                // The page may be in the process of being restricted,
                // stolen or decommitted; skip it rather than check, as the
                // write-back validation catches the rare case anyway.
                continue;
            }
            selector.add_candidate(id, frame.colour());
            if selector.found_longest_run() {
                break;
            }
        }

        selector.find_longest_run(&mut out[..])
    }

    /// Selects a batch of oldest-dirty frames, hands them to the
    /// data-paging manager for write-back, and moves the cleaned frames to
    /// the head of the oldest-clean list. Returns the batch size.
    pub(crate) fn clean_some_pages_locked<'a>(
        &'a self,
        mut guard: MmuGuard<'a, PagerInner>,
        cleaning: &CleaningGuard<'_>,
        background: bool,
    ) -> (MmuGuard<'a, PagerInner>, usize) {
        let mut selected = [None; MAX_PAGES_TO_CLEAN];
        let count = self.select_pages_to_clean(&guard, &mut selected);
        if count == 0 {
            return (guard, 0);
        }

        let manager = self
            .data_manager()
            .expect("dirty pages without a data-paging manager")
            .clone();

        drop(guard);
        manager.clean_pages(self, cleaning, &mut selected[..count], background);
        guard = self.lock_inner();

        for id in selected[..count].iter().flatten().copied() {
            {
                let frame = guard.frames.get(id);
                debug_assert_eq!(frame.state, PagedState::OldestDirty);
                debug_assert!(!frame.dirty && !frame.writable);
            }
            let PagerInner {
                frames,
                oldest_clean,
                oldest_dirty,
                ..
            } = &mut *guard;
            oldest_dirty.unlink(frames, id);
            frames.get_mut(id).state = PagedState::OldestClean;
            oldest_clean.push_head(frames, id);
        }

        (guard, count)
    }

    /// Cleans one batch of dirty frames. The entry point of the background
    /// page-cleaner thread; returns the number of frames selected, zero
    /// when there was nothing to clean.
    pub fn clean_some_pages(&self, background: bool) -> usize {
        let cleaning = self.page_cleaning_lock().lock();
        let guard = self.lock_inner();
        let (guard, count) = self.clean_some_pages_locked(guard, &cleaning, background);
        drop(guard);
        drop(cleaning);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_of(colours: &[usize]) -> usize {
        let mut selector = ColourRunSelector::new();
        for (n, &colour) in colours.iter().enumerate() {
            selector.add_candidate(FrameId(n), colour);
        }
        let mut out = [None; MAX_PAGES_TO_CLEAN];
        selector.find_longest_run(&mut out)
    }

    #[test]
    fn empty_selector_selects_nothing() {
        assert_eq!(run_of(&[]), 0);
    }

    #[test]
    fn single_candidate() {
        assert_eq!(run_of(&[2]), 1);
    }

    #[test]
    fn sequential_colours_accumulate() {
        assert_eq!(run_of(&[0, 1, 2, 3]), 4);
    }

    #[test]
    fn gap_splits_runs() {
        // Colours 0 and 2 never touch, colour pairs (0,1) do.
        assert_eq!(run_of(&[0, 2]), 1);
        assert_eq!(run_of(&[0, 1]), 2);
    }

    #[test]
    fn wrapping_run_detected() {
        // Slots 3 and 4 (colour 3 then colour 0's second slot) abut across
        // the colour boundary; a run ending at the array's last slot
        // continues from its first.
        let colours: [usize; 6] = [3, 0, 1, 2, 3, 0];
        assert!(run_of(&colours) >= 4);
    }

    #[test]
    fn full_array_caps_at_max() {
        let mut colours = alloc::vec::Vec::new();
        for _ in 0..MAX_PAGES_TO_CLEAN {
            for c in 0..PAGE_COLOUR_COUNT {
                colours.push(c);
            }
        }
        assert_eq!(run_of(&colours), MAX_PAGES_TO_CLEAN);
    }

    #[test]
    fn ordering_follows_slot_sequence() {
        let mut selector = ColourRunSelector::new();
        selector.add_candidate(FrameId(10), 0);
        selector.add_candidate(FrameId(11), 1);
        selector.add_candidate(FrameId(12), 2);
        let mut out = [None; MAX_PAGES_TO_CLEAN];
        let n = selector.find_longest_run(&mut out);
        assert_eq!(n, 3);
        assert_eq!(out[..3], [Some(FrameId(10)), Some(FrameId(11)), Some(FrameId(12))]);
    }
}
