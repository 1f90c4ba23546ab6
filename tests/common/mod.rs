// SPDX-License-Identifier: MPL-2.0

//! Shared test fixture: an in-memory MMU, a scriptable memory manager and
//! a warmed-up pager.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use vm_pager::{
    config::BootPagingConfig,
    frame::FrameId,
    manager::{Mapping, MemoryManager, MemoryObject, PageRestriction},
    mmu::{
        AccessPerms, AllocConstraint, Asid, MmuDriver, Paddr, PageKind, Pte, PteFlags,
        RamAllocFlags, Vaddr, PAGE_SIZE,
    },
    pager::{Collaborators, PageFault, Pager},
    request::PagingDevice,
    sync::CleaningGuard,
    thread::ThreadContext,
    Error, Result,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct FakeMmuState {
    free: Vec<Paddr>,
    allocated: BTreeSet<Paddr>,
    ptes: BTreeMap<(Asid, Vaddr), Pte>,
    page_table_pages: BTreeMap<(Asid, Vaddr), Paddr>,
    mappings: Vec<Arc<Mapping>>,
    tlb_invalidations: usize,
}

/// An in-memory MMU layer: a free pool of frame numbers, a PTE map and a
/// mapping registry.
pub struct FakeMmu {
    max_paddr: Paddr,
    state: Mutex<FakeMmuState>,
}

impl FakeMmu {
    pub fn new(nr_frames: usize) -> Arc<Self> {
        Arc::new(Self {
            max_paddr: nr_frames * PAGE_SIZE,
            state: Mutex::new(FakeMmuState {
                free: (0..nr_frames).rev().map(|n| n * PAGE_SIZE).collect(),
                allocated: BTreeSet::new(),
                ptes: BTreeMap::new(),
                page_table_pages: BTreeMap::new(),
                mappings: Vec::new(),
                tlb_invalidations: 0,
            }),
        })
    }

    pub fn register_mapping(&self, mapping: &Arc<Mapping>) {
        self.state.lock().unwrap().mappings.push(mapping.clone());
    }

    pub fn free_pool_size(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    pub fn tlb_invalidations(&self) -> usize {
        self.state.lock().unwrap().tlb_invalidations
    }

    /// Removes every PTE referencing `paddr`, as an unmap during a steal
    /// would.
    pub fn unmap_frame(&self, paddr: Paddr) {
        let mut state = self.state.lock().unwrap();
        state.ptes.retain(|_, pte| pte.paddr() != paddr);
    }

    /// Strips access from every PTE referencing `paddr`, as an aging
    /// restriction would.
    pub fn restrict_frame(&self, paddr: Paddr) {
        let mut state = self.state.lock().unwrap();
        for pte in state.ptes.values_mut() {
            if pte.paddr() == paddr {
                *pte = pte.make_inaccessible();
            }
        }
    }
}

impl MmuDriver for FakeMmu {
    fn alloc_ram(
        &self,
        _flags: RamAllocFlags,
        _kind: PageKind,
        _constraint: AllocConstraint,
    ) -> Result<Paddr> {
        let mut state = self.state.lock().unwrap();
        let paddr = state.free.pop().ok_or(Error::NoMemory)?;
        state.allocated.insert(paddr);
        Ok(paddr)
    }

    fn free_ram(&self, paddr: Paddr, _kind: PageKind) {
        let mut state = self.state.lock().unwrap();
        assert!(state.allocated.remove(&paddr), "double free of {paddr:#x}");
        state.free.push(paddr);
    }

    fn pages_allocated(&self, paddr: Paddr, _flags: RamAllocFlags) {
        assert!(self.state.lock().unwrap().allocated.contains(&paddr));
    }

    fn page_freed(&self, paddr: Paddr) {
        // A frame entering the free state must not stay mapped anywhere.
        self.unmap_frame(paddr);
    }

    fn change_page_type(&self, paddr: Paddr, _from: PageKind, _to: PageKind) {
        assert!(self.state.lock().unwrap().allocated.contains(&paddr));
    }

    fn read_pte(&self, asid: Asid, vaddr: Vaddr) -> Option<Pte> {
        let page_va = vaddr & !(PAGE_SIZE - 1);
        self.state.lock().unwrap().ptes.get(&(asid, page_va)).copied()
    }

    fn write_pte(&self, asid: Asid, vaddr: Vaddr, pte: Pte) {
        let page_va = vaddr & !(PAGE_SIZE - 1);
        self.state.lock().unwrap().ptes.insert((asid, page_va), pte);
    }

    fn pte_updated(&self, _vaddr: Vaddr) {}

    fn invalidate_tlb_entry(&self, _asid: Asid, _vaddr: Vaddr) {
        self.state.lock().unwrap().tlb_invalidations += 1;
    }

    fn page_table_page(&self, asid: Asid, vaddr: Vaddr) -> Option<Paddr> {
        let chunk = vaddr & !(2 * 1024 * 1024 - 1);
        self.state
            .lock()
            .unwrap()
            .page_table_pages
            .get(&(asid, chunk))
            .copied()
    }

    fn find_mapping(
        &self,
        asid: Asid,
        start: Vaddr,
        size: usize,
    ) -> Option<(Arc<Mapping>, usize, u32)> {
        let state = self.state.lock().unwrap();
        let mapping = state
            .mappings
            .iter()
            .find(|m| m.asid() == asid && m.covers(start, size))?
            .clone();
        let offset = (start - mapping.base()) / PAGE_SIZE;
        let instance = mapping.instance_count();
        Some((mapping, offset, instance))
    }

    fn max_paddr(&self) -> Paddr {
        self.max_paddr
    }
}

/// A memory manager whose pages live nowhere: page-ins fill frames out of
/// thin air and write-backs just mark them clean. Records what the pager
/// asked of it.
pub struct TestManager {
    mmu: Arc<FakeMmu>,
    kind: PageKind,
    pub device: Mutex<Option<Arc<PagingDevice>>>,
    pub stolen: Mutex<Vec<FrameId>>,
    pub cleaned: Mutex<Vec<FrameId>>,
    pub fault_count: AtomicUsize,
}

impl TestManager {
    pub fn new(mmu: Arc<FakeMmu>) -> Arc<Self> {
        Self::with_kind(mmu, PageKind::Discard)
    }

    pub fn with_kind(mmu: Arc<FakeMmu>, kind: PageKind) -> Arc<Self> {
        Arc::new(Self {
            mmu,
            kind,
            device: Mutex::new(None),
            stolen: Mutex::new(Vec::new()),
            cleaned: Mutex::new(Vec::new()),
            fault_count: AtomicUsize::new(0),
        })
    }

    pub fn faults(&self) -> usize {
        self.fault_count.load(Ordering::SeqCst)
    }

    fn commit(
        &self,
        pager: &Pager,
        memory: &Arc<MemoryObject>,
        mapping: &Arc<Mapping>,
        index: usize,
        perms: AccessPerms,
        id: FrameId,
    ) {
        memory.pages().lock().set_page(index, id.paddr());
        pager.set_frame_managed(id, memory, index);

        let va = mapping.base() + (index - mapping.start_index()) * PAGE_SIZE;
        let writable = perms.contains(AccessPerms::WRITE);
        let mut flags = PteFlags::ACCESSIBLE;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.mmu.write_pte(mapping.asid(), va, Pte::new(id.paddr(), flags));
        if writable {
            pager.page_dirtied(id);
        }
    }
}

impl MemoryManager for TestManager {
    fn page_kind(&self) -> PageKind {
        self.kind
    }

    fn steal_page(
        &self,
        pager: &Pager,
        memory: &Arc<MemoryObject>,
        frame: FrameId,
    ) -> Result<()> {
        let info = pager.page_info(frame).unwrap();
        if info.pin_count > 0 {
            return Err(Error::InUse);
        }

        self.mmu.unmap_frame(frame.paddr());
        if info.dirty {
            // The caller holds the page-cleaning lock for dirty steals;
            // pretend the contents reached the swap device.
            pager.page_cleaned(frame);
        }

        let index = {
            let pages = memory.pages().lock();
            (0..4096)
                .find(|&i| pages.page(i) == Some(frame.paddr()))
        };
        if let Some(index) = index {
            memory.pages().lock().clear_page(index);
        }
        pager.set_frame_unused(frame);

        self.stolen.lock().unwrap().push(frame);
        Ok(())
    }

    fn restrict_page(
        &self,
        pager: &Pager,
        _memory: &Arc<MemoryObject>,
        frame: FrameId,
        _restriction: PageRestriction,
    ) -> Result<()> {
        self.mmu.restrict_frame(frame.paddr());
        pager.page_restricted(frame);
        Ok(())
    }

    fn move_page(
        &self,
        pager: &Pager,
        memory: &Arc<MemoryObject>,
        frame: FrameId,
        constraint: AllocConstraint,
    ) -> Result<Paddr> {
        let new_paddr = self.mmu.alloc_ram(
            RamAllocFlags::NORMAL_CACHED,
            self.kind,
            constraint,
        )?;
        let new = FrameId::from_paddr(new_paddr);

        let index = {
            let pages = memory.pages().lock();
            (0..4096)
                .find(|&i| pages.page(i) == Some(frame.paddr()))
                .ok_or(Error::NotFound)?
        };

        pager.replace_page(frame, new);
        memory.pages().lock().set_page(index, new_paddr);
        pager.set_frame_managed(new, memory, index);
        pager.set_frame_unused(frame);
        self.mmu.unmap_frame(frame.paddr());
        Ok(new_paddr)
    }

    fn clean_pages(
        &self,
        pager: &Pager,
        _cleaning: &CleaningGuard<'_>,
        frames: &mut [Option<FrameId>],
        _background: bool,
    ) {
        // No device transfer happens here; the pages' contents live
        // nowhere, so write-back is just the bookkeeping.
        for id in frames.iter().flatten().copied() {
            pager.page_cleaned(id);
            self.cleaned.lock().unwrap().push(id);
        }
    }

    fn handle_fault(
        &self,
        pager: &Pager,
        memory: &Arc<MemoryObject>,
        index: usize,
        mapping: &Arc<Mapping>,
        map_instance: u32,
        perms: AccessPerms,
    ) -> Result<()> {
        if map_instance != mapping.instance_count() || mapping.being_detached() {
            return Err(Error::NotFound);
        }
        self.fault_count.fetch_add(1, Ordering::SeqCst);

        let device = self.device.lock().unwrap().clone();
        let Some(device) = device else {
            // No paging device; page in without request arbitration.
            if memory.page(index).is_none() {
                let id = pager.page_in_alloc_page(RamAllocFlags::NORMAL_CACHED);
                self.commit(pager, memory, mapping, index, perms, id);
                pager.paged_in(id);
            }
            return Ok(());
        };

        loop {
            if let Some(paddr) = memory.page(index) {
                // Someone else paged it in; refresh and report success.
                pager.paged_in(FrameId::from_paddr(paddr));
                return Ok(());
            }
            let Some(mut request) = device.pool().acquire_read(memory, index, 1) else {
                // Collided with an in-flight write-back; retry.
                continue;
            };
            if memory.page(index).is_some() {
                drop(request);
                continue;
            }

            let id = pager.page_in_alloc_page(RamAllocFlags::NORMAL_CACHED);
            // Stand-in for the device transfer into the slot's window.
            let window = request.buffer().map_pages(index & 3, 1);
            window[0] = index as u8;

            self.commit(pager, memory, mapping, index, perms, id);
            pager.paged_in(id);
            drop(request);
            return Ok(());
        }
    }
}

/// A pager wired to a fake MMU, one memory object and one mapping.
pub struct Fixture {
    pub mmu: Arc<FakeMmu>,
    pub pager: Arc<Pager>,
    pub manager: Arc<TestManager>,
    pub memory: Arc<MemoryObject>,
    pub mapping: Arc<Mapping>,
    pub nr_frames: usize,
}

pub const TEST_ASID: Asid = 7;
pub const MAP_BASE: Vaddr = 0x4000_0000;
pub const MAP_PAGES: usize = 4096;

impl Fixture {
    pub fn new(nr_frames: usize, config: BootPagingConfig) -> Self {
        Self::build(nr_frames, config, false)
    }

    /// A fixture whose manager routes page-ins through a data-paging
    /// device's request pool.
    pub fn with_device(nr_frames: usize, config: BootPagingConfig) -> Self {
        Self::build(nr_frames, config, true)
    }

    fn build(nr_frames: usize, config: BootPagingConfig, with_device: bool) -> Self {
        init_logging();

        let mmu = FakeMmu::new(nr_frames);
        let manager = TestManager::new(mmu.clone());
        let pager = Pager::new(
            mmu.clone(),
            Collaborators {
                data_manager: Some(manager.clone() as Arc<dyn MemoryManager>),
                ..Collaborators::default()
            },
        );

        if with_device {
            let device = pager.install_paging_device(
                vm_pager::request::PagingDeviceKinds::DATA,
                vm_pager::mmu::PAGE_SHIFT,
            );
            *manager.device.lock().unwrap() = Some(device);
        }

        pager.init_cache(&config).unwrap();

        let memory = MemoryObject::new(manager.clone() as Arc<dyn MemoryManager>, false);
        let mapping = Mapping::new(
            memory.clone(),
            0,
            MAP_BASE,
            MAP_PAGES * PAGE_SIZE,
            TEST_ASID,
            AccessPerms::READ | AccessPerms::WRITE,
        );
        mmu.register_mapping(&mapping);

        Self {
            mmu,
            pager,
            manager,
            memory,
            mapping,
            nr_frames,
        }
    }

    pub fn va_of(&self, index: usize) -> Vaddr {
        MAP_BASE + index * PAGE_SIZE
    }

    pub fn thread(&self) -> ThreadContext {
        ThreadContext::new(TEST_ASID)
    }

    pub fn fault(&self, thread: &ThreadContext, index: usize, perms: AccessPerms) -> Result<()> {
        let fault = PageFault {
            pc: 0x8000,
            addr: self.va_of(index),
            asid: TEST_ASID,
            index,
            perms,
            memory: self.memory.clone(),
            mapping: self.mapping.clone(),
            map_instance: self.mapping.instance_count(),
            thread,
        };
        self.pager.handle_page_fault(&fault)
    }

    pub fn fault_read(&self, index: usize) -> Result<()> {
        self.fault(&self.thread(), index, AccessPerms::READ)
    }

    pub fn fault_write(&self, index: usize) -> Result<()> {
        self.fault(&self.thread(), index, AccessPerms::READ | AccessPerms::WRITE)
    }

    /// The frame currently backing `index`, if resident.
    pub fn frame_of(&self, index: usize) -> Option<FrameId> {
        self.memory.page(index).map(FrameId::from_paddr)
    }

    /// Decommits `index` the way a manager would.
    pub fn decommit(&self, index: usize) -> Result<()> {
        let id = self.frame_of(index).ok_or(Error::NotFound)?;
        let r = self.pager.page_freed(id);
        self.memory.pages().lock().clear_page(index);
        self.pager.set_frame_unused(id);
        self.mmu.unmap_frame(id.paddr());
        r
    }

    /// Checks the structural invariants: every frame's paged state agrees
    /// with the queue counts, and the reservation arithmetic holds.
    pub fn check_invariants(&self) {
        use vm_pager::frame::PagedState;

        let counts = self.pager.live_counts();
        let mut young = 0;
        let mut old = 0;
        let mut oldest_clean = 0;
        let mut oldest_dirty = 0;
        let mut pinned = 0;
        let mut dirty = 0;
        for n in 0..self.nr_frames {
            let info = self
                .pager
                .page_info(FrameId::from_paddr(n * PAGE_SIZE))
                .unwrap();
            match info.state {
                PagedState::Young => young += 1,
                PagedState::Old => old += 1,
                PagedState::OldestClean => oldest_clean += 1,
                PagedState::OldestDirty => oldest_dirty += 1,
                PagedState::Pinned => pinned += 1,
                PagedState::Unpaged | PagedState::PinnedMoved => {}
            }
            if info.dirty {
                dirty += 1;
            }
            if info.state == PagedState::OldestDirty {
                assert!(info.dirty, "oldest-dirty frame {n} is clean");
            }
        }

        assert_eq!(young, counts.young);
        assert_eq!(old, counts.old);
        assert_eq!(oldest_clean, counts.oldest_clean);
        assert_eq!(oldest_dirty, counts.oldest_dirty);
        assert_eq!(pinned, counts.pinned);
        assert_eq!(dirty, counts.dirty);

        assert!(
            counts.min + counts.free <= counts.max,
            "min {} + free {} exceeds max {}",
            counts.min,
            counts.free,
            counts.max
        );
        assert!(counts.min >= counts.reserve);
    }
}
