// SPDX-License-Identifier: MPL-2.0

//! The paging-request pool.
//!
//! Each paging device carries a small pool of read-request slots, plus a
//! single write-request slot for devices that page data out. The slots
//! serialise concurrent operations that collide on the same
//! `(memory object, page index)` region: a second faulter on an in-flight
//! region blocks on the first slot's mutex and, by the time it runs, the
//! page is resident and its fault takes the rejuvenation fast path.
//!
//! Slot bookkeeping (the free list, usage counters and in-flight regions)
//! lives under the pool's own lock; each slot's transfer state is guarded
//! by the slot mutex. The write slot's mutex *is* the page-cleaning lock.

use bitflags::bitflags;

use crate::{
    config::{PAGE_COLOUR_COUNT, READ_REQUESTS_PER_DEVICE},
    manager::MemoryObject,
    mmu::{PAGE_SHIFT, PAGE_SIZE},
    pager::Pager,
    prelude::*,
    sync::{CleaningGuard, PageCleaningLock},
};

/// The most pages a single paging request can cover.
pub const MAX_REQUEST_PAGES: usize = crate::config::MAX_PAGES_TO_CLEAN;

bitflags! {
    /// What a paging device can page.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PagingDeviceKinds: u32 {
        /// ROM paging.
        const ROM = 1 << 0;
        /// Executable-code paging.
        const CODE = 1 << 1;
        /// Writable-data paging.
        const DATA = 1 << 2;
    }
}

/// Identity key of a memory object, for collision checks only.
fn memory_key(memory: &Arc<MemoryObject>) -> usize {
    Arc::as_ptr(memory) as usize
}

/// The region a slot is operating on: up to [`MAX_REQUEST_PAGES`]
/// `(memory, index)` pairs, contiguous for reads, arbitrary for writes.
#[derive(Clone, Copy)]
struct UseRegion {
    count: usize,
    memory: [usize; MAX_REQUEST_PAGES],
    index: [usize; MAX_REQUEST_PAGES],
}

impl UseRegion {
    const fn empty() -> Self {
        Self {
            count: 0,
            memory: [0; MAX_REQUEST_PAGES],
            index: [0; MAX_REQUEST_PAGES],
        }
    }

    fn set_contiguous(&mut self, key: usize, index: usize, count: usize) {
        debug_assert_eq!(self.count, 0);
        debug_assert!(count > 0 && count <= MAX_REQUEST_PAGES);
        for i in 0..count {
            self.memory[i] = key;
            self.index[i] = index + i;
        }
        self.count = count;
    }

    fn set_discontiguous(&mut self, entries: &[(usize, usize)]) {
        debug_assert_eq!(self.count, 0);
        debug_assert!(!entries.is_empty() && entries.len() <= MAX_REQUEST_PAGES);
        for (i, &(key, index)) in entries.iter().enumerate() {
            self.memory[i] = key;
            self.index[i] = index;
        }
        self.count = entries.len();
    }

    fn reset(&mut self) {
        debug_assert!(self.count > 0);
        self.count = 0;
    }

    fn collides(&self, key: usize, index: usize, count: usize) -> bool {
        for i in 0..self.count {
            if self.memory[i] == key && self.index[i].wrapping_sub(index) < count {
                return true;
            }
        }
        false
    }
}

/// The transfer window of one slot: a contiguous buffer large enough for
/// a maximal request at any page colour.
pub struct TransferBuffer {
    data: Box<[u8]>,
}

impl TransferBuffer {
    fn new() -> Self {
        Self {
            data: vec![0; (MAX_REQUEST_PAGES + PAGE_COLOUR_COUNT) * PAGE_SIZE].into_boxed_slice(),
        }
    }

    /// A window for transferring `count` pages at the given colour, so
    /// the device sees the same cache-colour alignment as the target
    /// frames.
    pub fn map_pages(&mut self, colour: usize, count: usize) -> &mut [u8] {
        debug_assert!(count <= MAX_REQUEST_PAGES);
        let colour = colour & (PAGE_COLOUR_COUNT - 1);
        &mut self.data[colour << PAGE_SHIFT..(colour + count) << PAGE_SHIFT]
    }
}

struct PoolState {
    free: Vec<usize>,
    usage: Vec<usize>,
    uses: Vec<UseRegion>,
    write_use: UseRegion,
    seed: u32,
}

impl PoolState {
    fn release_slot(&mut self, slot: usize) {
        debug_assert!(self.usage[slot] > 0);
        self.usage[slot] -= 1;
        if self.usage[slot] == 0 {
            self.free.push(slot);
        }
    }

    /// The linear-congruential tie-break for picking a busy slot to wait
    /// on. Not random in any strong sense, and deterministic for a fixed
    /// seed, which keeps tests reproducible.
    fn random_slot(&mut self, nr_slots: usize) -> usize {
        self.seed = self.seed.wrapping_mul(69069).wrapping_add(1);
        ((self.seed as u64 * nr_slots as u64) >> 32) as usize
    }
}

/// An acquired read slot. Dropping it releases the region and wakes any
/// faulter that joined the in-flight read.
pub struct ReadRequest<'a> {
    pool: &'a PagingRequestPool,
    slot: usize,
    buffer: Option<spin::MutexGuard<'a, TransferBuffer>>,
}

impl ReadRequest<'_> {
    /// The slot's transfer buffer.
    pub fn buffer(&mut self) -> &mut TransferBuffer {
        self.buffer.as_mut().unwrap()
    }
}

impl Drop for ReadRequest<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.uses[self.slot].reset();
        state.release_slot(self.slot);
        // Only release the slot mutex once the region is cleared, so a
        // woken waiter's collision recheck sees consistent state.
        drop(state);
        self.buffer.take();
    }
}

/// The acquired write slot. The caller already holds the page-cleaning
/// lock, which is this slot's mutex; dropping only clears the region.
pub struct WriteRequest<'a> {
    pool: &'a PagingRequestPool,
    buffer: Option<spin::MutexGuard<'a, TransferBuffer>>,
}

impl WriteRequest<'_> {
    /// The slot's transfer buffer.
    pub fn buffer(&mut self) -> &mut TransferBuffer {
        self.buffer.as_mut().unwrap()
    }
}

impl Drop for WriteRequest<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.write_use.reset();
        drop(state);
        self.buffer.take();
    }
}

/// The pool of read-request slots plus the optional write slot.
pub struct PagingRequestPool {
    state: spin::Mutex<PoolState>,
    slots: Vec<spin::Mutex<TransferBuffer>>,
    write_slot: Option<spin::Mutex<TransferBuffer>>,
    cleaning: Arc<PageCleaningLock>,
}

impl PagingRequestPool {
    pub(crate) fn new(
        nr_read_slots: usize,
        with_write_slot: bool,
        cleaning: Arc<PageCleaningLock>,
    ) -> Self {
        let mut slots = Vec::with_capacity(nr_read_slots);
        slots.resize_with(nr_read_slots, || spin::Mutex::new(TransferBuffer::new()));
        Self {
            state: spin::Mutex::new(PoolState {
                free: (0..nr_read_slots).rev().collect(),
                usage: vec![0; nr_read_slots],
                uses: vec![UseRegion::empty(); nr_read_slots],
                write_use: UseRegion::empty(),
                seed: 33333,
            }),
            slots,
            write_slot: with_write_slot.then(|| spin::Mutex::new(TransferBuffer::new())),
            cleaning,
        }
    }

    /// Acquires a read slot covering `count` pages of `memory` starting at
    /// `index`.
    ///
    /// Returns `None` when the region collides with an operation that
    /// appeared while this one was being set up, most importantly an
    /// in-flight write-back, which is first waited out via the
    /// page-cleaning lock. The caller re-checks residency and retries.
    pub fn acquire_read(
        &self,
        memory: &Arc<MemoryObject>,
        index: usize,
        count: usize,
    ) -> Option<ReadRequest<'_>> {
        debug_assert!(count > 0 && count <= MAX_REQUEST_PAGES);
        let key = memory_key(memory);
        let nr_slots = self.slots.len();

        let mut state = self.state.lock();

        if self.write_slot.is_some() && state.write_use.collides(key, index, count) {
            // The writer holds the page-cleaning lock for the whole
            // write-back; waiting on it serialises this read behind the
            // write.
            drop(state);
            drop(self.cleaning.lock());
            return None;
        }

        // Prefer the slot already reading this region, else a free slot,
        // else wait on an arbitrary busy one.
        let slot = (0..nr_slots)
            .find(|&s| state.uses[s].collides(key, index, count))
            .or_else(|| state.free.pop())
            .unwrap_or_else(|| {
                let slot = state.random_slot(nr_slots);
                debug_assert!(state.usage[slot] > 0);
                slot
            });
        state.usage[slot] += 1;
        drop(state);

        // Joining an in-flight read blocks here until it completes.
        let buffer = self.slots[slot].lock();

        let mut state = self.state.lock();
        let write_collides =
            self.write_slot.is_some() && state.write_use.collides(key, index, count);
        let read_collides = (0..nr_slots)
            .any(|s| s != slot && state.uses[s].collides(key, index, count));
        if write_collides || read_collides {
            // Another operation claimed the region first; give up and let
            // the caller retry.
            state.release_slot(slot);
            drop(state);
            drop(buffer);
            return None;
        }

        state.uses[slot].set_contiguous(key, index, count);
        drop(state);

        Some(ReadRequest {
            pool: self,
            slot,
            buffer: Some(buffer),
        })
    }

    /// Acquires the write slot for the given pages.
    ///
    /// The caller holds the page-cleaning lock, which makes a colliding
    /// read structurally impossible: a page must be present and dirty to
    /// be written, absent to be read, and moving between those states
    /// passes through a read that waits on the first request.
    pub fn acquire_write<'a>(
        &'a self,
        _cleaning: &CleaningGuard<'_>,
        entries: &[(&Arc<MemoryObject>, usize)],
    ) -> WriteRequest<'a> {
        let write_slot = self
            .write_slot
            .as_ref()
            .expect("write request on a device without data paging");
        debug_assert!(!entries.is_empty() && entries.len() <= MAX_REQUEST_PAGES);

        let mut keyed = [(0usize, 0usize); MAX_REQUEST_PAGES];
        for (out, &(memory, index)) in keyed.iter_mut().zip(entries) {
            *out = (memory_key(memory), index);
        }

        let mut state = self.state.lock();
        state.write_use.set_discontiguous(&keyed[..entries.len()]);
        drop(state);

        WriteRequest {
            pool: self,
            buffer: Some(write_slot.lock()),
        }
    }
}

/// A paging device as the pager sees it: what it pages, and its request
/// pool.
pub struct PagingDevice {
    kinds: PagingDeviceKinds,
    pool: PagingRequestPool,
}

impl PagingDevice {
    /// What the device pages.
    pub fn kinds(&self) -> PagingDeviceKinds {
        self.kinds
    }

    /// The device's request pool.
    pub fn pool(&self) -> &PagingRequestPool {
        &self.pool
    }
}

impl Pager {
    /// Registers a paging device, creating its request pool. Must happen
    /// before [`Pager::init_cache`] so the reserved request pages are
    /// counted into the minimum page limit.
    pub fn install_paging_device(
        &self,
        kinds: PagingDeviceKinds,
        read_unit_shift: usize,
    ) -> Arc<PagingDevice> {
        log::debug!(
            "installing paging device kinds={:?} read_unit_shift={}",
            kinds,
            read_unit_shift
        );
        assert!(read_unit_shift <= PAGE_SHIFT);
        assert!(!self.lock_inner().initialised);

        let with_write_slot = kinds.contains(PagingDeviceKinds::DATA);
        let pool = PagingRequestPool::new(
            READ_REQUESTS_PER_DEVICE,
            with_write_slot,
            self.cleaning_lock_arc(),
        );
        self.note_read_requests(READ_REQUESTS_PER_DEVICE);

        if !kinds.is_empty() {
            self.thrash().start();
        }
        if with_write_slot {
            self.cleaner().start();
        }

        Arc::new(PagingDevice { kinds, pool })
    }
}
