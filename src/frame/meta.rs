// SPDX-License-Identifier: MPL-2.0

//! Per-physical-page metadata.
//!
//! One descriptor exists for every base page of RAM, held in a dense
//! process-wide table keyed by physical frame number. The pager never owns
//! the storage; it mutates the fields under the `MmuLock`.

use crate::{
    manager::MemoryObject,
    mmu::{Paddr, PAGE_SHIFT},
    prelude::*,
};

/// The index of a frame in the frame table (its physical frame number).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub(crate) usize);

impl FrameId {
    /// The physical address of the frame.
    pub fn paddr(self) -> Paddr {
        self.0 << PAGE_SHIFT
    }

    /// The frame containing `paddr` (which need not be page aligned).
    pub fn from_paddr(paddr: Paddr) -> Self {
        Self(paddr >> PAGE_SHIFT)
    }
}

/// What a frame is used for, from the pager's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Not attached to any memory object.
    Unused,
    /// Owned by a memory object under a paging manager.
    Managed,
    /// In some other use the pager does not track.
    Other,
}

/// The pager's classification of a frame.
///
/// `Young`, `Old`, `OldestClean` and `OldestDirty` are the four live-list
/// sublists; membership is exclusive. Pinned frames are on no sublist.
/// `PinnedMoved` is transient: the frame was pinned when the MMU moved it,
/// and is handed back to the free pool on the next touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagedState {
    /// Not on the live list.
    Unpaged,
    /// On the young list.
    Young,
    /// On the old list.
    Old,
    /// On the oldest-clean list.
    OldestClean,
    /// On the oldest-dirty list.
    OldestDirty,
    /// Pinned by one or more clients.
    Pinned,
    /// Was pinned when its contents were moved to another frame.
    PinnedMoved,
}

impl PagedState {
    /// Whether the state denotes membership of one of the four live-list
    /// sublists.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Young | Self::Old | Self::OldestClean | Self::OldestDirty
        )
    }
}

/// Intrusive list linkage, as frame-table indices rather than pointers.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Link {
    pub(crate) prev: Option<FrameId>,
    pub(crate) next: Option<FrameId>,
}

/// The metadata of one physical page.
pub(crate) struct FrameDescriptor {
    pub(crate) kind: FrameKind,
    pub(crate) state: PagedState,
    pub(crate) pin_count: u32,
    pub(crate) dirty: bool,
    pub(crate) writable: bool,
    pub(crate) pinned_reserve: bool,
    /// Changed on every move of the frame; cleared by an access, so a
    /// mover can detect that it raced one.
    pub(crate) modifier: usize,
    pub(crate) owner: Option<Weak<MemoryObject>>,
    pub(crate) index_in_owner: usize,
    pub(crate) link: Link,
}

impl FrameDescriptor {
    pub(crate) fn new() -> Self {
        Self {
            kind: FrameKind::Unused,
            state: PagedState::Unpaged,
            pin_count: 0,
            dirty: false,
            writable: false,
            pinned_reserve: false,
            modifier: 0,
            owner: None,
            index_in_owner: 0,
            link: Link::default(),
        }
    }

    /// The owning memory object, if it is still alive.
    pub(crate) fn owner(&self) -> Option<Arc<MemoryObject>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    /// The frame's colour class, derived from its index in its owner.
    pub(crate) fn colour(&self) -> usize {
        self.index_in_owner & (crate::config::PAGE_COLOUR_COUNT - 1)
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.link.prev.is_some() || self.link.next.is_some()
    }
}
