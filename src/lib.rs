// SPDX-License-Identifier: MPL-2.0

//! The demand-paging cache manager of a virtual-memory subsystem.
//!
//! The pager maintains the set of physical frames backing demand-paged
//! memory on a four-generation *live list* (young, old, oldest-clean,
//! oldest-dirty), decides which frames to evict under memory pressure,
//! coordinates page-in and page-out with the memory managers that own the
//! pages, and arbitrates pinning of frames by clients that cannot tolerate
//! a page fault.
//!
//! The pager is not a thread; it runs in the context of its callers. All
//! live-list and frame-descriptor state is guarded by the [`MmuLock`],
//! nested inside the [`PageCleaningLock`] and the [`RamAllocLock`]
//! (acquisition order is strictly outermost-first). Operations that must
//! release the `MmuLock` mid-sequence take its guard by value and return
//! it, so every suspension point is visible in the signature.
//!
//! [`MmuLock`]: sync::MmuLock
//! [`PageCleaningLock`]: sync::PageCleaningLock
//! [`RamAllocLock`]: sync::RamAllocLock

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]
#![warn(missing_docs)]

extern crate alloc;

use alloc::sync::Arc;

use spin::Once;

pub mod config;
mod error;
pub mod events;
pub mod frame;
pub mod hal;
pub mod manager;
pub mod mmu;
pub mod monitor;
pub mod pager;
pub mod pin_lock;
pub mod prelude;
pub mod request;
pub mod sync;
pub mod thread;

pub use self::{
    error::Error,
    pager::{CacheInfo, Pager},
    prelude::Result,
};

static THE_PAGER: Once<Arc<Pager>> = Once::new();

/// Installs the process-wide pager singleton.
///
/// Must be called on the boot path before multi-threaded operation begins;
/// later calls return the already-installed instance.
pub fn init_the_pager(pager: Arc<Pager>) -> &'static Arc<Pager> {
    THE_PAGER.call_once(|| pager)
}

/// Returns the process-wide pager singleton.
///
/// # Panics
///
/// Panics if [`init_the_pager`] has not run yet.
pub fn the_pager() -> &'static Arc<Pager> {
    THE_PAGER
        .get()
        .expect("pager used before initialisation")
}
