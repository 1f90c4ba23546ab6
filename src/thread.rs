// SPDX-License-Identifier: MPL-2.0

//! The slice of a kernel thread the pager needs to see.
//!
//! A faulting thread arrives at the pager as a [`ThreadContext`]: its
//! scheduling class, whether it is inside a critical section, which remote
//! thread (if any) it is acting for, and the capabilities relevant to the
//! control surface. Kills issued by the realtime-fault policy land on the
//! shared [`ThreadHandle`]; a kill against a thread in a critical section
//! is deferred and recorded as pending.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{mmu::Asid, prelude::*};

/// Where an exception trap attributes a faulting access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExcLocation {
    /// The fault is on the thread's own address space.
    Local,
    /// The fault is on the address space of the IPC client.
    Remote,
}

/// The kill state of a thread, shared with the scheduler.
#[derive(Debug, Default)]
pub struct ThreadHandle {
    killed: AtomicBool,
    pending_kill: AtomicBool,
}

impl ThreadHandle {
    /// Creates a live handle.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether the thread has been killed.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Whether a kill is pending on leaving the critical section.
    pub fn has_pending_kill(&self) -> bool {
        self.pending_kill.load(Ordering::Acquire)
    }

    pub(crate) fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub(crate) fn defer_kill(&self) {
        self.pending_kill.store(true, Ordering::Release);
    }
}

/// The faulting (or calling) thread as seen by the pager.
pub struct ThreadContext {
    /// The thread's address space.
    pub asid: Asid,
    /// The thread must not take unbounded paging faults.
    pub realtime: bool,
    /// The thread is inside a critical section; kills are deferred.
    pub in_critical_section: bool,
    /// The thread has declared a paging trap around the faulting access.
    pub paging_trap: bool,
    /// The thread holds the `WriteDeviceData` capability.
    pub write_device_data: bool,
    /// The thread's own kill state.
    pub handle: Arc<ThreadHandle>,
    /// Set when the thread is accessing another thread's address space as
    /// an IPC server.
    pub ipc_client: Option<Arc<ThreadHandle>>,
    /// Where the active exception trap attributes the access, if a trap
    /// is installed.
    pub ipc_trap: Option<ExcLocation>,
}

impl ThreadContext {
    /// A plain non-realtime thread in address space `asid`.
    pub fn new(asid: Asid) -> Self {
        Self {
            asid,
            realtime: false,
            in_critical_section: false,
            paging_trap: false,
            write_device_data: false,
            handle: ThreadHandle::new(),
            ipc_client: None,
            ipc_trap: None,
        }
    }

    /// Kills this thread, deferring if it is in a critical section.
    pub(crate) fn kill_current(&self) {
        if self.in_critical_section {
            self.handle.defer_kill();
        } else {
            self.handle.kill();
        }
    }
}
