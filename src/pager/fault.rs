// SPDX-License-Identifier: MPL-2.0

//! The page-fault entry point.
//!
//! A fault first tries the rejuvenation fast path under the `MmuLock`: if
//! the page is still resident, its PTE is made accessible again and the
//! frame moves back to the head of the young list. Only when that fails
//! does the fault cross into the owning manager for a real page-in.

use crate::{
    events::PageEvent,
    frame::{FrameId, FrameKind, PagedState},
    manager::{Mapping, MemoryObject},
    mmu::{AccessPerms, Asid, Pte, Vaddr, PAGE_MASK},
    pager::{set_writable, Pager, PagerInner},
    prelude::*,
    sync::MmuGuard,
    thread::{ExcLocation, ThreadContext},
};

/// Everything the fault dispatcher hands the pager about one fault.
pub struct PageFault<'a> {
    /// The faulting instruction.
    pub pc: Vaddr,
    /// The address whose access faulted.
    pub addr: Vaddr,
    /// The address space the fault occurred in.
    pub asid: Asid,
    /// The page index of `addr` within the memory object.
    pub index: usize,
    /// The permissions of the attempted access.
    pub perms: AccessPerms,
    /// The memory object mapped at the fault address.
    pub memory: Arc<MemoryObject>,
    /// The mapping the fault came through.
    pub mapping: Arc<Mapping>,
    /// The mapping's instance count when the fault was dispatched.
    pub map_instance: u32,
    /// The faulting thread.
    pub thread: &'a ThreadContext,
}

/// A realtime thread must not fault on paged memory unless it declared a
/// paging trap, or the fault is attributable to the IPC client whose
/// address space it is accessing. An unsanctioned fault kills the thread
/// at fault and aborts the access; a kill of the current thread inside a
/// critical section is deferred, and the abort lets the exception be
/// taken.
fn check_realtime_thread_fault(thread: &ThreadContext) -> Result<()> {
    if thread.paging_trap {
        return Ok(());
    }

    match (&thread.ipc_client, thread.ipc_trap) {
        // Accessing a remote address space with no trap installed is
        // taken to be the remote side's bad address.
        (Some(client), None) | (Some(client), Some(ExcLocation::Remote)) => {
            log::warn!("realtime thread faulted on paged memory for its client");
            client.kill();
            Err(Error::Abort)
        }
        _ => {
            log::warn!("realtime thread faulted on paged memory");
            thread.kill_current();
            Err(Error::Abort)
        }
    }
}

impl Pager {
    /// Handles a data or instruction fault on demand-paged memory.
    ///
    /// Returns `Ok` when the access can be restarted, `Abort` when the
    /// thread must take the exception instead, and any page-in error
    /// otherwise.
    pub fn handle_page_fault(&self, fault: &PageFault<'_>) -> Result<()> {
        let guard = self.lock_inner();
        let (guard, r) = self.try_rejuvenate(guard, fault);
        drop(guard);

        match r {
            Ok(()) => Ok(()),
            Err(Error::Abort) => Err(Error::Abort),
            Err(_) => {
                // Not resident; have the owning manager page it in.
                self.events().record_fault(
                    PageEvent::PageInStart,
                    None,
                    fault.pc,
                    fault.addr,
                    fault.perms,
                );
                self.thrash().notify_start_paging();

                let manager = fault.memory.manager().clone();
                let r = manager.handle_fault(
                    self,
                    &fault.memory,
                    fault.index,
                    &fault.mapping,
                    fault.map_instance,
                    fault.perms,
                );

                self.thrash().notify_end_paging();
                r
            }
        }
    }

    /// Looks up the faulting PTE and its frame, verifying the mapping has
    /// not been detached or reused since the fault was dispatched.
    fn pte_and_frame(&self, inner: &PagerInner, fault: &PageFault<'_>) -> Result<(Pte, FrameId)> {
        if fault.map_instance != fault.mapping.instance_count() || fault.mapping.being_detached() {
            return Err(Error::Abort);
        }

        let pte = self
            .mmu()
            .read_pte(fault.asid, fault.addr)
            .ok_or(Error::NotFound)?;
        let id = inner
            .frames
            .frame_from_paddr(pte.paddr())
            .ok_or(Error::NotFound)?;
        Ok((pte, id))
    }

    /// The fault fast path: make a still-resident page accessible again
    /// and promote it to youngest.
    fn try_rejuvenate<'a>(
        &'a self,
        mut guard: MmuGuard<'a, PagerInner>,
        fault: &PageFault<'_>,
    ) -> (MmuGuard<'a, PagerInner>, Result<()>) {
        let (mut pte, mut id) = match self.pte_and_frame(&guard, fault) {
            Ok(found) => found,
            Err(e) => {
                if fault.thread.realtime {
                    // The page is out; a realtime thread may only wait for
                    // it on a sanctioned path.
                    drop(guard);
                    let policy = check_realtime_thread_fault(fault.thread);
                    guard = self.lock_inner();
                    if policy.is_err() {
                        return (guard, policy);
                    }
                }
                return (guard, Err(e));
            }
        };

        let mut kind = guard.frames.get(id).kind;
        let mut state = guard.frames.get(id).state;

        if fault.thread.realtime
            && state != PagedState::Pinned
            && state != PagedState::PinnedMoved
        {
            // Unpinned paged memory; same policy as the non-resident case.
            drop(guard);
            let policy = check_realtime_thread_fault(fault.thread);
            guard = self.lock_inner();
            if policy.is_err() {
                return (guard, policy);
            }
            // The lock was released, so everything must be re-verified.
            match self.pte_and_frame(&guard, fault) {
                Ok(found) => (pte, id) = found,
                Err(e) => return (guard, Err(e)),
            }
            kind = guard.frames.get(id).kind;
            state = guard.frames.get(id).state;
        }

        if kind != FrameKind::Managed || state == PagedState::Unpaged {
            return (guard, Err(Error::NotFound));
        }

        let mut memory = match guard.frames.get(id).owner() {
            Some(memory) => memory,
            None => return (guard, Err(Error::NotFound)),
        };
        let index = guard.frames.get(id).index_in_owner;

        let Some(committed) = memory.page(index) else {
            return (guard, Err(Error::NotFound));
        };
        if committed != id.paddr() {
            // The page has been (or is being) moved and this mapping still
            // referenced the old frame; switch to the frame the owner's
            // page array holds.
            let Some(moved) = guard.frames.frame_from_paddr(committed) else {
                return (guard, Err(Error::NotFound));
            };
            id = moved;

            let frame = guard.frames.get(id);
            if frame.kind != FrameKind::Managed || frame.state == PagedState::Unpaged {
                return (guard, Err(Error::NotFound));
            }
            state = frame.state;
            memory = match frame.owner() {
                Some(memory) => memory,
                None => return (guard, Err(Error::NotFound)),
            };

            pte = pte.with_paddr(committed);
        }

        let write = fault.perms.contains(AccessPerms::WRITE);
        if write {
            // The faulting mapping permits writes and is still attached,
            // so the object cannot be read-only.
            debug_assert!(!memory.is_read_only());
            set_writable(&mut guard, id);
        }

        let page_va = fault.addr & !PAGE_MASK;
        let pte = pte.make_accessible(write);
        self.mmu().write_pte(fault.asid, page_va, pte);
        self.mmu().pte_updated(page_va);
        self.mmu().invalidate_tlb_entry(fault.asid, page_va);

        self.events().record_fault(
            PageEvent::PageRejuvenate,
            Some(id),
            fault.pc,
            fault.addr,
            fault.perms,
        );

        let balance = if state.is_live() {
            self.remove_page(&mut guard, id);
            self.add_as_youngest(&mut guard, id);
            // Balancing is delayed until the page-table page has been
            // rejuvenated, to keep the lock held across both.
            true
        } else {
            debug_assert!(state == PagedState::Pinned || state == PagedState::PinnedMoved);
            // Clear the modifier so a concurrent move of this pinned page
            // detects the access.
            guard.frames.get_mut(id).modifier = 0;
            false
        };

        guard = self.rejuvenate_page_table(guard, fault.asid, fault.addr);

        if balance {
            guard = self.balance_ages(guard);
        }

        (guard, Ok(()))
    }

    /// Keeps the demand-paged page-table page mapping `addr` young too.
    fn rejuvenate_page_table<'a>(
        &'a self,
        mut guard: MmuGuard<'a, PagerInner>,
        asid: Asid,
        addr: Vaddr,
    ) -> MmuGuard<'a, PagerInner> {
        let Some(pt_paddr) = self.mmu().page_table_page(asid, addr) else {
            return guard;
        };
        let Some(id) = guard.frames.frame_from_paddr(pt_paddr) else {
            return guard;
        };

        match guard.frames.get(id).state {
            PagedState::Young | PagedState::Old | PagedState::OldestClean
            | PagedState::OldestDirty => {
                self.remove_page(&mut guard, id);
                self.add_as_youngest(&mut guard, id);
                self.balance_ages(guard)
            }
            PagedState::Unpaged => {
                self.add_as_youngest(&mut guard, id);
                self.balance_ages(guard)
            }
            PagedState::Pinned => guard,
            PagedState::PinnedMoved => {
                debug_assert!(false, "page-table frame {:?} moved while pinned", id);
                guard
            }
        }
    }
}
