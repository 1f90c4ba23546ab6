// SPDX-License-Identifier: MPL-2.0

use crate::{
    frame::{FrameDescriptor, FrameId},
    mmu::{Paddr, PAGE_SHIFT},
    prelude::*,
};

/// The dense table of frame descriptors, keyed by physical frame number.
///
/// Sized once at initialisation from the highest RAM address; looking up a
/// descriptor is a single index operation.
pub struct FrameTable {
    slots: Vec<FrameDescriptor>,
}

impl FrameTable {
    /// Creates descriptors for every frame below `max_paddr`.
    pub(crate) fn new(max_paddr: Paddr) -> Self {
        let nr_frames = max_paddr >> PAGE_SHIFT;
        let mut slots = Vec::with_capacity(nr_frames);
        slots.resize_with(nr_frames, FrameDescriptor::new);
        Self { slots }
    }

    /// The frame containing `paddr`, or `None` if it is beyond RAM.
    pub fn frame_from_paddr(&self, paddr: Paddr) -> Option<FrameId> {
        let id = FrameId::from_paddr(paddr);
        (id.0 < self.slots.len()).then_some(id)
    }

    /// The number of frames the table covers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table covers no frames.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn get(&self, id: FrameId) -> &FrameDescriptor {
        &self.slots[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: FrameId) -> &mut FrameDescriptor {
        &mut self.slots[id.0]
    }
}
