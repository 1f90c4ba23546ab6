// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// A PTE was absent, a mapping was stale, or a frame is no longer
    /// managed; the fault path recovers by delegating to the owning
    /// manager.
    NotFound,
    /// A frame was pinned or dirtied while a defragmentation discard was
    /// in flight; the caller retries on a different frame.
    InUse,
    /// The live list could not be grown, or no replacement frame could be
    /// allocated.
    NoMemory,
    /// A realtime thread faulted on paged memory outside a sanctioned
    /// path; the exception is delivered to the thread.
    Abort,
    /// A pin-lock client supplied a stale mapping or a range with missing
    /// pages.
    BadDescriptor,
    /// The selected steal victim is dirty and the caller does not hold the
    /// page-cleaning lock. Recovered internally by acquiring the lock and
    /// retrying; never surfaced to callers of the public API.
    NeedsCleaning,
    /// The calling thread lacks the capability required by a control
    /// operation.
    AccessDenied,
    /// The operation is not supported by the current paging configuration.
    NotSupported,
    /// An argument was out of range.
    InvalidArgs,
}
