// SPDX-License-Identifier: MPL-2.0

//! Paging events and their counters.
//!
//! Every notable transition of a frame raises an event. Counters are kept
//! per kind and are readable and resettable through the HAL; the events
//! themselves are also emitted to the log at trace level for external
//! instrumentation.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    frame::FrameId,
    mmu::{AccessPerms, Vaddr},
};

/// The kinds of paging event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum PageEvent {
    /// A page-in began (fault could not be served by rejuvenation).
    PageInStart,
    /// A frame was added to the free end of the live list.
    PageInFree,
    /// A page-in completed but the page was no longer needed.
    PageInUnneeded,
    /// A frame was stolen from its owner.
    PageOut,
    /// A committed page was donated to the live list.
    PageDonate,
    /// A donated page was reclaimed from the live list.
    PageReclaim,
    /// A young frame aged into the old list.
    PageAged,
    /// An old frame aged into the oldest-clean list.
    PageAgedClean,
    /// An old frame aged into the oldest-dirty list.
    PageAgedDirty,
    /// A frame was pinned.
    PagePin,
    /// A frame was unpinned.
    PageUnpin,
    /// A resident frame was promoted back to youngest.
    PageRejuvenate,
}

const EVENT_COUNT: usize = PageEvent::PageRejuvenate as usize + 1;

/// A snapshot of the event counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmEventInfo {
    counts: [u64; EVENT_COUNT],
}

impl VmEventInfo {
    /// The number of events of the given kind since the last reset.
    pub fn count(&self, event: PageEvent) -> u64 {
        self.counts[event as usize]
    }
}

pub(crate) struct EventCounters {
    counts: [AtomicU64; EVENT_COUNT],
}

impl EventCounters {
    pub(crate) const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            counts: [ZERO; EVENT_COUNT],
        }
    }

    pub(crate) fn record(&self, event: PageEvent, frame: FrameId) {
        self.counts[event as usize].fetch_add(1, Ordering::Relaxed);
        log::trace!("paging event {:?} frame {:?}", event, frame);
    }

    /// Records a fault-related event carrying its program counter, fault
    /// address and attempted permissions.
    pub(crate) fn record_fault(
        &self,
        event: PageEvent,
        frame: Option<FrameId>,
        pc: Vaddr,
        addr: Vaddr,
        perms: AccessPerms,
    ) {
        self.counts[event as usize].fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "paging event {:?} frame {:?} pc {:#x} addr {:#x} perms {:?}",
            event,
            frame,
            pc,
            addr,
            perms
        );
    }

    pub(crate) fn snapshot(&self) -> VmEventInfo {
        let mut counts = [0; EVENT_COUNT];
        for (slot, count) in counts.iter_mut().zip(self.counts.iter()) {
            *slot = count.load(Ordering::Relaxed);
        }
        VmEventInfo { counts }
    }

    pub(crate) fn reset(&self) {
        for count in self.counts.iter() {
            count.store(0, Ordering::Relaxed);
        }
    }
}
