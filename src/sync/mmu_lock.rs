// SPDX-License-Identifier: MPL-2.0

use core::ops::{Deref, DerefMut};

/// The spinlock-class mutex guarding live-list and frame-descriptor state.
///
/// All list edits happen under this lock, and it must be held across a
/// `remove` and the following state change so that no observer can see a
/// dequeued frame still carrying a list-membership state.
///
/// Unlike an ordinary mutex it offers [`flash`]: a drop-and-reacquire in a
/// single call, yielding to any higher-priority waiter. Every use of
/// `flash` is a suspension point; the caller must re-validate whatever it
/// read before flashing.
///
/// [`flash`]: Self::flash
pub struct MmuLock<T> {
    inner: spin::Mutex<T>,
}

/// Exclusive access to the state protected by an [`MmuLock`].
pub struct MmuGuard<'a, T> {
    inner: spin::MutexGuard<'a, T>,
}

impl<T> MmuLock<T> {
    pub(crate) const fn new(val: T) -> Self {
        Self {
            inner: spin::Mutex::new(val),
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock(&self) -> MmuGuard<'_, T> {
        MmuGuard {
            inner: self.inner.lock(),
        }
    }

    /// Releases and immediately reacquires the lock.
    ///
    /// This is the pager's intentional yield point: any thread spinning on
    /// the lock gets a chance to take it between the release and the
    /// reacquisition.
    pub fn flash<'a>(&'a self, guard: MmuGuard<'a, T>) -> MmuGuard<'a, T> {
        drop(guard);
        core::hint::spin_loop();
        self.lock()
    }
}

impl<T> Deref for MmuGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for MmuGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
