// SPDX-License-Identifier: MPL-2.0

//! The user-visible control surface of the pager.
//!
//! A single dispatcher mirrors the kernel HAL group: flush the cache,
//! resize it, read and reset the event counters, query swap and thrash
//! state, and inspect one page's diagnostic state. Mutating requests
//! require the calling thread to hold the `WriteDeviceData` capability.

use align_ext::AlignExt;

use crate::{
    events::VmEventInfo,
    frame::{FrameKind, PagedState},
    mmu::{Vaddr, PAGE_SHIFT, PAGE_SIZE},
    monitor::SwapInfo,
    pager::{CacheInfo, Pager},
    prelude::*,
    thread::ThreadContext,
};

/// A request to the VM HAL group.
#[derive(Clone, Copy, Debug)]
pub enum VmHalRequest {
    /// Steal every live page back to the free pool and shrink the cache.
    FlushCache,
    /// Resize the cache; sizes in bytes, rounded up to whole pages.
    SetCacheSize {
        /// New minimum size in bytes.
        min_bytes: usize,
        /// New maximum size in bytes.
        max_bytes: usize,
    },
    /// Read the cache geometry.
    GetCacheSize,
    /// Read the paging event counters.
    GetEventInfo,
    /// Zero the paging event counters.
    ResetEventInfo,
    /// Read backing-swap usage.
    GetSwapInfo,
    /// Read the current thrash level.
    GetThrashLevel,
    /// Update the free-swap notification thresholds.
    SetSwapThresholds {
        /// Free-swap level at which the low warning raises.
        low: usize,
        /// Free-swap level at which the warning clears.
        good: usize,
    },
    /// Update the thrash-level thresholds.
    SetThrashThresholds {
        /// Level at which thrashing is signalled.
        low: u32,
        /// Level at which thrashing is considered over.
        high: u32,
    },
    /// Inspect the paging state of one virtual address.
    PageState {
        /// The address to inspect.
        addr: Vaddr,
    },
}

/// The reply to a [`VmHalRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmHalReply {
    /// The request completed with nothing to report.
    Done,
    /// Cache geometry.
    CacheSize(CacheInfo),
    /// Event counters.
    EventInfo(VmEventInfo),
    /// Swap usage.
    SwapInfo(SwapInfo),
    /// Thrash level.
    ThrashLevel(u32),
    /// Diagnostic page state.
    PageState(PageState),
}

/// Diagnostic state of one virtual address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageState {
    /// The address lies in a demand-paged mapping.
    pub paged: bool,
    /// A PTE exists for the address.
    pub pte_present: bool,
    /// The PTE is currently accessible.
    pub pte_valid: bool,
    /// The backing frame's kind, when a frame is mapped.
    pub kind: Option<FrameKind>,
    /// The backing frame's paged state, when a frame is mapped.
    pub state: Option<PagedState>,
}

/// Dispatches one VM HAL request on behalf of `thread`.
pub fn vm_hal(pager: &Pager, thread: &ThreadContext, request: VmHalRequest) -> Result<VmHalReply> {
    match request {
        VmHalRequest::FlushCache => {
            check_write_device_data(thread)?;
            pager.flush_all();
            Ok(VmHalReply::Done)
        }

        VmHalRequest::SetCacheSize {
            min_bytes,
            max_bytes,
        } => {
            check_write_device_data(thread)?;
            let min = min_bytes.align_up(PAGE_SIZE) >> PAGE_SHIFT;
            let max = max_bytes.align_up(PAGE_SIZE) >> PAGE_SHIFT;
            pager.resize_live_list(min, max)?;
            Ok(VmHalReply::Done)
        }

        VmHalRequest::GetCacheSize => Ok(VmHalReply::CacheSize(pager.live_list_info())),

        VmHalRequest::GetEventInfo => Ok(VmHalReply::EventInfo(pager.event_info())),

        VmHalRequest::ResetEventInfo => {
            check_write_device_data(thread)?;
            pager.reset_event_info();
            Ok(VmHalReply::Done)
        }

        VmHalRequest::GetSwapInfo => {
            let swap = pager.swap().ok_or(Error::NotSupported)?;
            Ok(VmHalReply::SwapInfo(swap.swap_info()))
        }

        VmHalRequest::GetThrashLevel => Ok(VmHalReply::ThrashLevel(pager.thrash().thrash_level())),

        VmHalRequest::SetSwapThresholds { low, good } => {
            check_write_device_data(thread)?;
            if low > good {
                return Err(Error::InvalidArgs);
            }
            let swap = pager.swap().ok_or(Error::NotSupported)?;
            swap.set_swap_thresholds(low, good)?;
            Ok(VmHalReply::Done)
        }

        VmHalRequest::SetThrashThresholds { low, high } => {
            check_write_device_data(thread)?;
            if low > high {
                return Err(Error::InvalidArgs);
            }
            pager.thrash().set_thresholds(low, high)?;
            Ok(VmHalReply::Done)
        }

        VmHalRequest::PageState { addr } => {
            Ok(VmHalReply::PageState(page_state(pager, thread, addr)))
        }
    }
}

fn check_write_device_data(thread: &ThreadContext) -> Result<()> {
    if thread.write_device_data {
        Ok(())
    } else {
        Err(Error::AccessDenied)
    }
}

fn page_state(pager: &Pager, thread: &ThreadContext, addr: Vaddr) -> PageState {
    let mut info = PageState::default();

    if let Some((mapping, _, instance)) = pager.mmu().find_mapping(thread.asid, addr, 1) {
        if instance == mapping.instance_count() {
            if let Some(memory) = mapping.memory() {
                info.paged = memory.is_demand_paged();
            }
        }
    }

    let Some(pte) = pager.mmu().read_pte(thread.asid, addr) else {
        return info;
    };
    info.pte_present = true;
    info.pte_valid = pte.is_accessible();

    if let Some(diag) = pager.page_info(crate::frame::FrameId::from_paddr(pte.paddr())) {
        info.kind = Some(diag.kind);
        info.state = Some(diag.state);
    }

    info
}
