// SPDX-License-Identifier: MPL-2.0

//! Index-linked queues over the frame table.
//!
//! The links live inside the frame descriptors; the queue itself is only a
//! head, a tail and a count. Using table indices instead of pointers keeps
//! the structure valid if descriptor storage is ever relocated.

use crate::frame::{table::FrameTable, FrameId};

/// One doubly-linked queue of frames. The head is the youngest end, the
/// tail the oldest.
#[derive(Default)]
pub(crate) struct FrameQueue {
    head: Option<FrameId>,
    tail: Option<FrameId>,
    len: usize,
}

impl FrameQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The oldest frame, if any.
    pub(crate) fn tail(&self) -> Option<FrameId> {
        self.tail
    }

    /// Inserts `id` at the head.
    pub(crate) fn push_head(&mut self, frames: &mut FrameTable, id: FrameId) {
        debug_assert!(!frames.get(id).is_linked());

        let old_head = self.head;
        {
            let frame = frames.get_mut(id);
            frame.link.prev = None;
            frame.link.next = old_head;
        }
        match old_head {
            Some(head) => frames.get_mut(head).link.prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    /// Unlinks `id`, which must be on this queue.
    pub(crate) fn unlink(&mut self, frames: &mut FrameTable, id: FrameId) {
        debug_assert!(self.len > 0);

        let link = frames.get(id).link;
        match link.prev {
            Some(prev) => frames.get_mut(prev).link.next = link.next,
            None => {
                debug_assert_eq!(self.head, Some(id));
                self.head = link.next;
            }
        }
        match link.next {
            Some(next) => frames.get_mut(next).link.prev = link.prev,
            None => {
                debug_assert_eq!(self.tail, Some(id));
                self.tail = link.prev;
            }
        }
        let frame = frames.get_mut(id);
        frame.link.prev = None;
        frame.link.next = None;
        self.len -= 1;
    }

    /// Removes and returns the oldest frame.
    pub(crate) fn pop_tail(&mut self, frames: &mut FrameTable) -> Option<FrameId> {
        let tail = self.tail?;
        self.unlink(frames, tail);
        Some(tail)
    }

    /// Splices `new` into the exact list position of `old` and unlinks
    /// `old`.
    pub(crate) fn replace(&mut self, frames: &mut FrameTable, old: FrameId, new: FrameId) {
        debug_assert!(!frames.get(new).is_linked());

        let link = frames.get(old).link;
        frames.get_mut(new).link = link;
        match link.prev {
            Some(prev) => frames.get_mut(prev).link.next = Some(new),
            None => self.head = Some(new),
        }
        match link.next {
            Some(next) => frames.get_mut(next).link.prev = Some(new),
            None => self.tail = Some(new),
        }
        let frame = frames.get_mut(old);
        frame.link.prev = None;
        frame.link.next = None;
    }

    /// Walks the queue from the oldest end towards the head.
    pub(crate) fn iter_from_tail<'a>(
        &'a self,
        frames: &'a FrameTable,
    ) -> impl Iterator<Item = FrameId> + 'a {
        let mut cursor = self.tail;
        core::iter::from_fn(move || {
            let id = cursor?;
            cursor = frames.get(id).link.prev;
            Some(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::PAGE_SIZE;

    fn fixture(nr: usize) -> (FrameTable, FrameQueue) {
        (FrameTable::new(nr * PAGE_SIZE), FrameQueue::new())
    }

    #[test]
    fn push_pop_order() {
        let (mut frames, mut queue) = fixture(4);
        for i in 0..4 {
            queue.push_head(&mut frames, FrameId(i));
        }
        assert_eq!(queue.len(), 4);
        // Oldest out first.
        assert_eq!(queue.pop_tail(&mut frames), Some(FrameId(0)));
        assert_eq!(queue.pop_tail(&mut frames), Some(FrameId(1)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn unlink_middle() {
        let (mut frames, mut queue) = fixture(3);
        for i in 0..3 {
            queue.push_head(&mut frames, FrameId(i));
        }
        queue.unlink(&mut frames, FrameId(1));
        let order: Vec<_> = queue.iter_from_tail(&frames).collect();
        assert_eq!(order, [FrameId(0), FrameId(2)]);
        assert!(!frames.get(FrameId(1)).is_linked());
    }

    #[test]
    fn replace_keeps_position() {
        let (mut frames, mut queue) = fixture(4);
        for i in 0..3 {
            queue.push_head(&mut frames, FrameId(i));
        }
        queue.replace(&mut frames, FrameId(1), FrameId(3));
        let order: Vec<_> = queue.iter_from_tail(&frames).collect();
        assert_eq!(order, [FrameId(0), FrameId(3), FrameId(2)]);
    }

    #[test]
    fn replace_at_ends() {
        let (mut frames, mut queue) = fixture(4);
        queue.push_head(&mut frames, FrameId(0));
        queue.replace(&mut frames, FrameId(0), FrameId(2));
        assert_eq!(queue.tail(), Some(FrameId(2)));
        assert_eq!(queue.pop_tail(&mut frames), Some(FrameId(2)));
        assert!(queue.is_empty());
    }
}
