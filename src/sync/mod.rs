// SPDX-License-Identifier: MPL-2.0

//! The pager's serialisation primitives.
//!
//! Three locks, with a strict acquisition order:
//!
//! 1. [`RamAllocLock`]: coarse mutex over the underlying physical-frame
//!    allocator. Held whenever the pager may ask the MMU for, or return,
//!    a frame, and across whole operations that need a stable free-pool
//!    view (resize, donation, reclamation, flush).
//! 2. [`PageCleaningLock`]: serialises write-back of dirty frames. Must
//!    be acquired with the `MmuLock` dropped.
//! 3. [`MmuLock`]: short-term spinlock-class mutex guarding the live
//!    list, all frame-descriptor fields and PTE-level consistency.
//!
//! An outer lock may be held without the inner ones; an inner lock is
//! never acquired while a required outer lock is absent. Functions that
//! require an outer lock take its guard as a parameter, so the
//! requirement is checked by the compiler rather than asserted at run
//! time.

mod mmu_lock;

pub use self::mmu_lock::{MmuGuard, MmuLock};

/// The coarse mutex protecting the underlying MMU frame allocator.
pub struct RamAllocLock {
    inner: spin::Mutex<()>,
}

/// Witness that the [`RamAllocLock`] is held.
pub struct RamAllocGuard<'a> {
    _inner: spin::MutexGuard<'a, ()>,
}

impl RamAllocLock {
    pub(crate) const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(()),
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock(&self) -> RamAllocGuard<'_> {
        RamAllocGuard {
            _inner: self.inner.lock(),
        }
    }
}

/// The mutex serialising write-back of dirty frames to the swap device.
pub struct PageCleaningLock {
    inner: spin::Mutex<()>,
}

/// Witness that the [`PageCleaningLock`] is held.
///
/// Passed by reference into the operations that may only run under the
/// lock: cleaning, and stealing a dirty frame.
pub struct CleaningGuard<'a> {
    _inner: spin::MutexGuard<'a, ()>,
}

impl PageCleaningLock {
    pub(crate) const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(()),
        }
    }

    /// Acquires the lock. The caller must not hold the `MmuLock`.
    pub fn lock(&self) -> CleaningGuard<'_> {
        CleaningGuard {
            _inner: self.inner.lock(),
        }
    }
}
