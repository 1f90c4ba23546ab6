// SPDX-License-Identifier: MPL-2.0

//! External collaborators the pager notifies or queries.
//!
//! The thrash monitor, the background page-cleaner thread and the swap
//! manager live outside the pager; it reaches them only through these
//! traits. The defaults are inert, which is also what the test suite
//! uses unless a test observes the notifications.

/// The thrash monitor, sampling paging activity.
pub trait ThrashMonitor: Send + Sync {
    /// A page-in is starting.
    fn notify_start_paging(&self) {}

    /// A page-in has finished.
    fn notify_end_paging(&self) {}

    /// The current thrash level, 0..=255.
    fn thrash_level(&self) -> u32 {
        0
    }

    /// Updates the thresholds at which thrashing is signalled.
    fn set_thresholds(&self, low: u32, high: u32) -> crate::Result<()> {
        let _ = (low, high);
        Ok(())
    }

    /// Paging devices are installed; start sampling.
    fn start(&self) {}
}

/// Handle on the background page-cleaner thread.
pub trait PageCleanerHandle: Send + Sync {
    /// Frames have entered the oldest-dirty list; the cleaner should run.
    fn notify_pages_to_clean(&self) {}

    /// Data paging is enabled; start the cleaner thread.
    fn start(&self) {}
}

/// A snapshot of backing-swap usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwapInfo {
    /// Total swap size in bytes.
    pub total: usize,
    /// Free swap in bytes.
    pub free: usize,
}

/// The swap manager backing writable-data paging.
pub trait SwapBackend: Send + Sync {
    /// Current swap usage.
    fn swap_info(&self) -> SwapInfo;

    /// Updates the free-swap thresholds at which low/good notifications
    /// are raised.
    fn set_swap_thresholds(&self, low: usize, good: usize) -> crate::Result<()>;
}

/// The inert default collaborator set.
#[derive(Default)]
pub struct NullMonitor;

impl ThrashMonitor for NullMonitor {}
impl PageCleanerHandle for NullMonitor {}
