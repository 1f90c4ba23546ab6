// SPDX-License-Identifier: MPL-2.0

//! The pager proper.
//!
//! Submodules carve up the implementation: live-list maintenance and
//! aging, the steal/discard engine, the cleaner interface, the pin
//! manager, the fault handler and the resize protocol. They all operate
//! on the same [`PagerInner`] state under the `MmuLock`.

mod clean;
mod fault;
mod live_list;
mod pin;
mod resize;
mod steal;

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;

pub use self::{
    fault::PageFault,
    pin::PinArgs,
};

use crate::{
    config::{
        BootPagingConfig, ABSOLUTE_MAX_PAGE_COUNT, ABSOLUTE_MIN_PAGE_COUNT,
        DEFAULT_MIN_PAGES, DEFAULT_OLD_OLDEST_RATIO, DEFAULT_YOUNG_OLD_RATIO, MIN_OLD_PAGES,
        MIN_YOUNG_PAGES,
    },
    events::{EventCounters, PageEvent, VmEventInfo},
    frame::{FrameId, FrameKind, FrameQueue, FrameTable, PagedState},
    manager::{MemoryManager, MemoryObject},
    mmu::{MmuDriver, RamAllocFlags, PAGE_SHIFT},
    monitor::{NullMonitor, PageCleanerHandle, SwapBackend, ThrashMonitor},
    prelude::*,
    sync::{MmuGuard, MmuLock, PageCleaningLock, RamAllocLock},
};

/// The live-list state and counters guarded by the `MmuLock`.
pub(crate) struct PagerInner {
    pub(crate) frames: FrameTable,

    pub(crate) young: FrameQueue,
    pub(crate) old: FrameQueue,
    pub(crate) oldest_clean: FrameQueue,
    pub(crate) oldest_dirty: FrameQueue,

    pub(crate) min_page_count: usize,
    pub(crate) max_page_count: usize,
    pub(crate) min_limit: usize,
    pub(crate) reserve_page_count: usize,
    pub(crate) free_pages: usize,
    pub(crate) dirty_pages: usize,
    pub(crate) pinned_count: usize,

    pub(crate) young_old_ratio: usize,
    pub(crate) old_oldest_ratio: usize,
    pub(crate) init_min: usize,
    pub(crate) init_max: usize,
    pub(crate) initialised: bool,
}

impl PagerInner {
    pub(crate) fn oldest_count(&self) -> usize {
        self.oldest_clean.len() + self.oldest_dirty.len()
    }

    /// More pages than the configured maximum are committed to the cache.
    pub(crate) fn have_too_many_pages(&self) -> bool {
        self.min_page_count + self.free_pages > self.max_page_count
    }

    pub(crate) fn have_maximum_pages(&self) -> bool {
        self.min_page_count + self.free_pages >= self.max_page_count
    }

    /// Unlinks a frame from the live-list queue matching its current
    /// state, which must be one of the four live states.
    pub(crate) fn unlink_live(&mut self, id: FrameId) {
        let state = self.frames.get(id).state;
        let Self {
            frames,
            young,
            old,
            oldest_clean,
            oldest_dirty,
            ..
        } = self;
        let queue = match state {
            PagedState::Young => young,
            PagedState::Old => old,
            PagedState::OldestClean => oldest_clean,
            PagedState::OldestDirty => oldest_dirty,
            _ => panic!("frame {:?} not on a live-list queue: {:?}", id, state),
        };
        debug_assert!(!queue.is_empty());
        queue.unlink(frames, id);
    }
}

/// Marks a frame as carrying modified data that may currently be written
/// through some mapping.
pub(crate) fn set_writable(inner: &mut PagerInner, id: FrameId) {
    let frame = inner.frames.get_mut(id);
    if !frame.dirty {
        frame.dirty = true;
        inner.dirty_pages += 1;
    }
    inner.frames.get_mut(id).writable = true;
}

pub(crate) fn set_clean(inner: &mut PagerInner, id: FrameId) {
    let frame = inner.frames.get_mut(id);
    debug_assert!(!frame.writable);
    if frame.dirty {
        frame.dirty = false;
        inner.dirty_pages -= 1;
    }
}

/// External collaborators handed to the pager at construction.
pub struct Collaborators {
    /// The thrash monitor.
    pub thrash: Arc<dyn ThrashMonitor>,
    /// The background page-cleaner thread.
    pub cleaner: Arc<dyn PageCleanerHandle>,
    /// The swap manager, when writable-data paging is configured.
    pub swap: Option<Arc<dyn SwapBackend>>,
    /// The data-paging manager, target of the cleaning interface.
    pub data_manager: Option<Arc<dyn MemoryManager>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        let null = Arc::new(NullMonitor);
        Self {
            thrash: null.clone(),
            cleaner: null,
            swap: None,
            data_manager: None,
        }
    }
}

/// A snapshot of the live-list geometry, in bytes, for the HAL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheInfo {
    /// The configured minimum cache size.
    pub min_size: usize,
    /// The configured maximum cache size.
    pub max_size: usize,
    /// The committed size (minimum plus free).
    pub current_size: usize,
    /// The part of the committed size not pinned down by the minimum.
    pub max_free_size: usize,
}

/// A snapshot of the live-list counters, in pages, for diagnostics and
/// tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveCounts {
    /// Young-list length.
    pub young: usize,
    /// Old-list length.
    pub old: usize,
    /// Oldest-clean-list length.
    pub oldest_clean: usize,
    /// Oldest-dirty-list length.
    pub oldest_dirty: usize,
    /// Frames currently pinned off the live list.
    pub pinned: usize,
    /// Minimum live-list size.
    pub min: usize,
    /// Maximum live-list size.
    pub max: usize,
    /// Free pages held beyond the minimum.
    pub free: usize,
    /// Pages reserved for pinning.
    pub reserve: usize,
    /// Dirty pages on the live list.
    pub dirty: usize,
}

/// Diagnostic state of one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageDiagInfo {
    /// What the frame is used for.
    pub kind: FrameKind,
    /// Its live-list classification.
    pub state: PagedState,
    /// Whether it carries unwritten modifications.
    pub dirty: bool,
    /// Whether some mapping may currently write it.
    pub writable: bool,
    /// Its pin count.
    pub pin_count: u32,
}

/// The demand-paging cache manager.
pub struct Pager {
    mmu: Arc<dyn MmuDriver>,
    thrash: Arc<dyn ThrashMonitor>,
    cleaner: Arc<dyn PageCleanerHandle>,
    swap: Option<Arc<dyn SwapBackend>>,
    data_manager: Once<Arc<dyn MemoryManager>>,
    inner: MmuLock<PagerInner>,
    ram_alloc: RamAllocLock,
    cleaning: Arc<PageCleaningLock>,
    events: EventCounters,
    read_request_count: AtomicUsize,
}

impl Pager {
    /// Creates a pager over the given MMU layer. The cache is unusable
    /// until [`init_cache`] runs.
    ///
    /// [`init_cache`]: Self::init_cache
    pub fn new(mmu: Arc<dyn MmuDriver>, collaborators: Collaborators) -> Arc<Self> {
        let frames = FrameTable::new(mmu.max_paddr());
        let data_manager = Once::new();
        if let Some(manager) = collaborators.data_manager {
            data_manager.call_once(|| manager);
        }
        Arc::new(Self {
            mmu,
            thrash: collaborators.thrash,
            cleaner: collaborators.cleaner,
            swap: collaborators.swap,
            data_manager,
            inner: MmuLock::new(PagerInner {
                frames,
                young: FrameQueue::new(),
                old: FrameQueue::new(),
                oldest_clean: FrameQueue::new(),
                oldest_dirty: FrameQueue::new(),
                min_page_count: 0,
                max_page_count: 0,
                min_limit: 0,
                reserve_page_count: 0,
                free_pages: 0,
                dirty_pages: 0,
                pinned_count: 0,
                young_old_ratio: 0,
                old_oldest_ratio: 0,
                init_min: 0,
                init_max: 0,
                initialised: false,
            }),
            ram_alloc: RamAllocLock::new(),
            cleaning: Arc::new(PageCleaningLock::new()),
            events: EventCounters::new(),
            read_request_count: AtomicUsize::new(0),
        })
    }

    /// Populates the live list to its minimum size.
    ///
    /// Runs on the boot path before multi-threaded operation begins, after
    /// any paging devices have been installed.
    pub fn init_cache(&self, config: &BootPagingConfig) -> Result<()> {
        let ram = self.ram_alloc.lock();
        let mut inner = self.inner.lock();
        assert!(!inner.initialised);

        inner.young_old_ratio = if config.young_old_ratio != 0 {
            config.young_old_ratio as usize
        } else {
            DEFAULT_YOUNG_OLD_RATIO as usize
        };
        inner.old_oldest_ratio = if config.old_oldest_ratio != 0 {
            config.old_oldest_ratio as usize
        } else {
            DEFAULT_OLD_OLDEST_RATIO as usize
        };

        inner.min_limit = self.minimum_page_limit(inner.young_old_ratio);

        let ratio = inner.young_old_ratio;
        let mut min = if config.paging_enabled() {
            DEFAULT_MIN_PAGES
        } else {
            // No paging is enabled, so the minimum allowable cache with
            // the current young/old ratio suffices.
            MIN_YOUNG_PAGES * (ratio + 1)
        };
        if config.min_pages != 0 {
            min = config.min_pages;
        }
        min = min.max(ABSOLUTE_MIN_PAGE_COUNT);
        min = min.max(inner.min_limit + inner.reserve_page_count);
        inner.min_page_count = min;
        inner.init_min = min;

        let mut max = if config.max_pages != 0 {
            config.max_pages
        } else {
            usize::MAX
        };
        max = max.min(ABSOLUTE_MAX_PAGE_COUNT);
        inner.max_page_count = max;
        inner.init_max = max;

        log::info!(
            "pager cache init: min={} max={} young/old={} old/oldest={}",
            min,
            max,
            inner.young_old_ratio,
            inner.old_oldest_ratio
        );

        // Verify the page counts are valid.
        assert!(max >= min);
        let min_old_and_oldest = min / (1 + ratio);
        assert!(min_old_and_oldest >= MIN_OLD_PAGES);
        assert!(min - min_old_and_oldest >= MIN_YOUNG_PAGES);
        assert!(ratio <= (min - MIN_OLD_PAGES) / MIN_OLD_PAGES);
        assert!(min_old_and_oldest / (1 + inner.old_oldest_ratio) > 0);

        // Reserved pages were allocated before this point and are already
        // on the oldest-clean list; only allocate the remainder.
        debug_assert_eq!(inner.oldest_clean.len(), inner.reserve_page_count);
        let flags =
            RamAllocFlags::NORMAL_CACHED | RamAllocFlags::NO_WIPE | RamAllocFlags::NO_PAGER_RECLAIM;
        for _ in inner.reserve_page_count..min {
            let paddr = self
                .mmu
                .alloc_ram(flags, crate::mmu::PageKind::Discard, Default::default())?;
            let id = inner
                .frames
                .frame_from_paddr(paddr)
                .expect("allocated frame beyond the frame table");
            self.add_as_free(&mut inner, id);
        }
        inner.initialised = true;

        drop(inner);
        drop(ram);
        Ok(())
    }

    /// The minimum the live-list minimum may ever be set to: enough young
    /// pages to execute the worst-case instruction at the configured
    /// ratio, plus the pages reserved for in-flight read requests.
    fn minimum_page_limit(&self, young_old_ratio: usize) -> usize {
        let limit = MIN_YOUNG_PAGES * (1 + young_old_ratio) / young_old_ratio
            + self.reserved_request_pages();
        limit.max(ABSOLUTE_MIN_PAGE_COUNT)
    }

    fn reserved_request_pages(&self) -> usize {
        self.read_request_count.load(Ordering::Relaxed)
            * (crate::request::MAX_REQUEST_PAGES + 1)
    }

    pub(crate) fn mmu(&self) -> &dyn MmuDriver {
        &*self.mmu
    }

    pub(crate) fn thrash(&self) -> &dyn ThrashMonitor {
        &*self.thrash
    }

    pub(crate) fn cleaner(&self) -> &dyn PageCleanerHandle {
        &*self.cleaner
    }

    pub(crate) fn swap(&self) -> Option<&Arc<dyn SwapBackend>> {
        self.swap.as_ref()
    }

    pub(crate) fn data_manager(&self) -> Option<&Arc<dyn MemoryManager>> {
        self.data_manager.get()
    }

    pub(crate) fn lock_inner(&self) -> MmuGuard<'_, PagerInner> {
        self.inner.lock()
    }

    pub(crate) fn inner_lock(&self) -> &MmuLock<PagerInner> {
        &self.inner
    }

    /// The lock over the physical-frame allocator.
    pub fn ram_alloc_lock(&self) -> &RamAllocLock {
        &self.ram_alloc
    }

    /// The lock serialising dirty-frame write-back.
    pub fn page_cleaning_lock(&self) -> &PageCleaningLock {
        &self.cleaning
    }

    pub(crate) fn cleaning_lock_arc(&self) -> Arc<PageCleaningLock> {
        self.cleaning.clone()
    }

    pub(crate) fn event(&self, event: PageEvent, id: FrameId) {
        self.events.record(event, id);
    }

    pub(crate) fn events(&self) -> &EventCounters {
        &self.events
    }

    pub(crate) fn note_read_requests(&self, count: usize) {
        self.read_request_count.fetch_add(count, Ordering::Relaxed);
    }

    /// Attaches a frame to a memory object: the manager has committed it
    /// at `index`.
    pub fn set_frame_managed(&self, id: FrameId, memory: &Arc<MemoryObject>, index: usize) {
        let mut inner = self.inner.lock();
        let frame = inner.frames.get_mut(id);
        frame.kind = FrameKind::Managed;
        frame.owner = Some(Arc::downgrade(memory));
        frame.index_in_owner = index;
    }

    /// Detaches a frame from its memory object.
    pub fn set_frame_unused(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        let frame = inner.frames.get_mut(id);
        frame.kind = FrameKind::Unused;
        frame.owner = None;
        frame.index_in_owner = 0;
    }

    /// Notes that a mapping of the frame has become writable and its
    /// contents modified. Called by managers on write access.
    pub fn page_dirtied(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        set_writable(&mut inner, id);
    }

    /// Notes that all mappings of the frame have been made non-writable.
    /// Called by managers from their restriction path.
    pub fn page_restricted(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        inner.frames.get_mut(id).writable = false;
    }

    /// Notes that the frame's contents have reached backing store. Called
    /// by the data-paging manager once write-back completes.
    pub fn page_cleaned(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        inner.frames.get_mut(id).writable = false;
        set_clean(&mut inner, id);
    }

    /// Whether any frames are waiting to be cleaned.
    pub fn has_pages_to_clean(&self) -> bool {
        !self.inner.lock().oldest_dirty.is_empty()
    }

    /// Diagnostic state of the frame, if it is within RAM.
    pub fn page_info(&self, id: FrameId) -> Option<PageDiagInfo> {
        let inner = self.inner.lock();
        if id.0 >= inner.frames.len() {
            return None;
        }
        let frame = inner.frames.get(id);
        Some(PageDiagInfo {
            kind: frame.kind,
            state: frame.state,
            dirty: frame.dirty,
            writable: frame.writable,
            pin_count: frame.pin_count,
        })
    }

    /// A consistent snapshot of the live-list geometry in bytes.
    pub fn live_list_info(&self) -> CacheInfo {
        let inner = self.inner.lock();
        CacheInfo {
            min_size: inner.min_page_count << PAGE_SHIFT,
            max_size: inner.max_page_count << PAGE_SHIFT,
            current_size: (inner.min_page_count + inner.free_pages) << PAGE_SHIFT,
            max_free_size: inner.free_pages << PAGE_SHIFT,
        }
    }

    /// A consistent snapshot of the live-list counters in pages.
    pub fn live_counts(&self) -> LiveCounts {
        let inner = self.inner.lock();
        LiveCounts {
            young: inner.young.len(),
            old: inner.old.len(),
            oldest_clean: inner.oldest_clean.len(),
            oldest_dirty: inner.oldest_dirty.len(),
            pinned: inner.pinned_count,
            min: inner.min_page_count,
            max: inner.max_page_count,
            free: inner.free_pages,
            reserve: inner.reserve_page_count,
            dirty: inner.dirty_pages,
        }
    }

    /// A snapshot of the paging event counters.
    pub fn event_info(&self) -> VmEventInfo {
        self.events.snapshot()
    }

    /// Zeroes the paging event counters.
    pub fn reset_event_info(&self) {
        self.events.reset();
    }
}
