// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios driving the pager against the fake MMU.

mod common;

use common::Fixture;
use vm_pager::{
    config::BootPagingConfig,
    events::PageEvent,
    frame::{FrameId, PagedState},
    mmu::{AccessPerms, MmuDriver, PageKind, RamAllocFlags},
    pager::PinArgs,
    Error,
};

fn small_config(min: usize, max: usize) -> BootPagingConfig {
    BootPagingConfig {
        min_pages: min,
        max_pages: max,
        data_paging: true,
        ..BootPagingConfig::default()
    }
}

#[test]
fn cold_fault_then_rejuvenate() {
    let fx = Fixture::new(512, small_config(64, 64));

    // Warm the cache so the aging lists are populated.
    for index in 0..200 {
        fx.fault_read(index).unwrap();
    }
    fx.check_invariants();

    let faults_before = fx.manager.faults();
    fx.fault_read(300).unwrap();
    assert_eq!(fx.manager.faults(), faults_before + 1);
    let id = fx.frame_of(300).unwrap();
    assert_eq!(fx.pager.page_info(id).unwrap().state, PagedState::Young);

    // Touching the same page again is served by rejuvenation alone.
    let rejuvenations = fx.pager.event_info().count(PageEvent::PageRejuvenate);
    fx.fault_read(300).unwrap();
    assert_eq!(fx.manager.faults(), faults_before + 1);
    assert_eq!(
        fx.pager.event_info().count(PageEvent::PageRejuvenate),
        rejuvenations + 1
    );
    assert_eq!(fx.pager.page_info(id).unwrap().state, PagedState::Young);
    fx.check_invariants();
}

#[test]
fn steal_dirty_under_pressure() {
    let fx = Fixture::new(256, small_config(16, 16));

    // Write faults leave dirty pages behind; aging restricts them and
    // sorts them onto the oldest-dirty list.
    for index in 0..64 {
        fx.fault_write(index).unwrap();
    }
    fx.check_invariants();

    let before = fx.pager.live_counts();
    assert!(before.oldest_dirty > 0, "no dirty pages aged: {before:?}");

    // A cleaning pass moves the batch to the oldest-clean list.
    let cleaned = fx.pager.clean_some_pages(false);
    assert!(cleaned > 0);
    let after = fx.pager.live_counts();
    assert_eq!(after.oldest_dirty, before.oldest_dirty - cleaned);
    assert_eq!(after.oldest_clean, before.oldest_clean + cleaned);
    assert!(!fx.manager.cleaned.lock().unwrap().is_empty());
    fx.check_invariants();

    // Allocating under pressure steals the now-clean tail.
    let old_count = after.old;
    let id = fx.pager.page_in_alloc_page(RamAllocFlags::NORMAL_CACHED);
    let final_counts = fx.pager.live_counts();
    assert_eq!(fx.pager.page_info(id).unwrap().state, PagedState::Unpaged);
    assert_eq!(final_counts.oldest_clean, after.oldest_clean - 1);
    assert_eq!(final_counts.old, old_count);

    fx.pager.page_in_free_pages(&[id]);
    fx.check_invariants();
}

#[test]
fn pressure_cleans_when_everything_is_dirty() {
    let fx = Fixture::new(256, small_config(16, 16));

    for index in 0..64 {
        fx.fault_write(index).unwrap();
    }
    // Allocation must make progress even if it has to clean first.
    let id = fx.pager.page_in_alloc_page(RamAllocFlags::NORMAL_CACHED);
    assert_eq!(fx.pager.page_info(id).unwrap().state, PagedState::Unpaged);
    fx.pager.page_in_free_pages(&[id]);
    fx.check_invariants();
}

#[test]
fn resize_grows_live_list() {
    let fx = Fixture::new(2048, small_config(256, 1024));

    let before = fx.pager.live_counts();
    assert_eq!((before.min, before.free, before.max), (256, 0, 1024));

    fx.pager.resize_live_list(768, 1024).unwrap();

    let after = fx.pager.live_counts();
    assert_eq!((after.min, after.free, after.max), (768, 0, 1024));
    fx.check_invariants();
}

#[test]
fn resize_shrinks_under_hold() {
    let fx = Fixture::new(4096, small_config(1024, 4096));

    // Donate 100 committed movable pages so the cache holds free pages.
    let donor_manager =
        common::TestManager::with_kind(fx.mmu.clone(), PageKind::Movable);
    let donor = vm_pager::manager::MemoryObject::new(donor_manager, false);
    let indices: Vec<usize> = (0..100).collect();
    for &i in &indices {
        let paddr = fx
            .mmu
            .alloc_ram(
                RamAllocFlags::NORMAL_CACHED,
                PageKind::Movable,
                Default::default(),
            )
            .unwrap();
        donor.pages().lock().set_page(i, paddr);
        fx.pager
            .set_frame_managed(FrameId::from_paddr(paddr), &donor, i);
    }
    fx.pager.donate_pages(&donor, &indices);

    let before = fx.pager.live_counts();
    assert_eq!((before.min, before.free, before.max), (1024, 100, 4096));

    let pool_before = fx.mmu.free_pool_size();
    fx.pager.resize_live_list(512, 1024).unwrap();

    let after = fx.pager.live_counts();
    assert_eq!((after.min, after.free, after.max), (512, 0, 1024));
    // The 512 slots freed from the minimum plus the 100 donated pages all
    // went back to the system.
    assert_eq!(fx.mmu.free_pool_size(), pool_before + 612);
    fx.check_invariants();
}

#[test]
fn pin_from_reserve_across_resize() {
    let fx = Fixture::new(512, small_config(64, 128));
    for index in 0..8 {
        fx.fault_read(index).unwrap();
    }

    let mut reserved = 0;
    assert!(fx.pager.reserve_pages(3, &mut reserved));
    assert_eq!(reserved, 3);

    let free_before = fx.pager.live_counts().free;
    let mut args = PinArgs::reserve();
    let pinned: Vec<FrameId> = (0..3).map(|i| fx.frame_of(i).unwrap()).collect();
    for &id in &pinned {
        fx.pager.pin(id, &mut args);
    }

    let counts = fx.pager.live_counts();
    assert_eq!(counts.reserve, 3);
    assert_eq!(counts.free, free_before);
    assert_eq!(counts.pinned, 3);

    // Shrinking to the floor must tolerate the pinned reserve.
    fx.pager.resize_live_list(1, 128).unwrap();
    let counts = fx.pager.live_counts();
    assert!(counts.min >= counts.reserve);
    for &id in &pinned {
        assert_eq!(fx.pager.page_info(id).unwrap().state, PagedState::Pinned);
    }

    for &id in &pinned {
        fx.pager.unpin(id, &mut args);
        assert_eq!(fx.pager.page_info(id).unwrap().state, PagedState::Young);
    }
    assert_eq!(fx.pager.live_counts().pinned, 0);
    assert_eq!(args.replacement_pages, 0);

    fx.pager.unreserve_pages(&mut reserved);
    assert_eq!(fx.pager.live_counts().reserve, 0);
    fx.check_invariants();
}

#[test]
fn realtime_fault_aborts_and_kills() {
    let fx = Fixture::new(512, small_config(64, 64));
    for index in 0..8 {
        fx.fault_read(index).unwrap();
    }
    let before = fx.pager.live_counts();
    let faults_before = fx.manager.faults();

    let mut thread = fx.thread();
    thread.realtime = true;
    let r = fx.fault(&thread, 100, AccessPerms::READ);

    assert_eq!(r, Err(Error::Abort));
    assert!(thread.handle.is_killed());
    assert_eq!(fx.manager.faults(), faults_before);
    assert_eq!(fx.pager.live_counts(), before);
}

#[test]
fn realtime_kill_deferred_in_critical_section() {
    let fx = Fixture::new(512, small_config(64, 64));

    let mut thread = fx.thread();
    thread.realtime = true;
    thread.in_critical_section = true;
    let r = fx.fault(&thread, 100, AccessPerms::READ);

    assert_eq!(r, Err(Error::Abort));
    assert!(!thread.handle.is_killed());
    assert!(thread.handle.has_pending_kill());
}

#[test]
fn realtime_fault_allowed_through_paging_trap() {
    let fx = Fixture::new(512, small_config(64, 64));

    let mut thread = fx.thread();
    thread.realtime = true;
    thread.paging_trap = true;
    fx.fault(&thread, 100, AccessPerms::READ).unwrap();

    assert!(!thread.handle.is_killed());
    assert!(fx.frame_of(100).is_some());
}

#[test]
fn realtime_remote_fault_kills_client() {
    let fx = Fixture::new(512, small_config(64, 64));

    let client = vm_pager::thread::ThreadHandle::new();
    let mut thread = fx.thread();
    thread.realtime = true;
    thread.ipc_client = Some(client.clone());
    thread.ipc_trap = Some(vm_pager::thread::ExcLocation::Remote);

    let r = fx.fault(&thread, 100, AccessPerms::READ);
    assert_eq!(r, Err(Error::Abort));
    assert!(client.is_killed());
    assert!(!thread.handle.is_killed());
}

#[test]
fn flush_all_empties_the_cache() {
    let fx = Fixture::new(512, small_config(64, 128));
    for index in 0..40 {
        fx.fault_write(index).unwrap();
    }
    fx.check_invariants();

    fx.pager.flush_all();

    let counts = fx.pager.live_counts();
    // Every managed frame was stolen back to the free pool and the cache
    // shrank to its minimum.
    assert_eq!(counts.free, 0);
    assert_eq!(counts.young + counts.old, 0);
    assert_eq!(counts.oldest_clean, counts.min);
    assert_eq!(counts.dirty, 0);
    fx.check_invariants();

    // Pages fault back in afterwards.
    fx.fault_read(3).unwrap();
    assert!(fx.frame_of(3).is_some());
}

#[test]
fn discard_returns_frame_to_system() {
    let fx = Fixture::new(512, small_config(64, 128));
    for index in 0..32 {
        fx.fault_read(index).unwrap();
    }

    let id = fx.frame_of(10).unwrap();
    let before = fx.pager.live_counts();
    let ram = fx.pager.ram_alloc_lock().lock();
    fx.pager
        .discard_page(&ram, id, Default::default())
        .unwrap();
    drop(ram);

    let after = fx.pager.live_counts();
    assert_eq!(fx.pager.page_info(id).unwrap().state, PagedState::Unpaged);
    assert!(fx.frame_of(10).is_none());
    assert!(after.min + after.free >= before.min + before.free - 1);
    fx.check_invariants();
}

#[test]
fn discard_moves_pinned_page() {
    let fx = Fixture::new(512, small_config(64, 128));
    for index in 0..8 {
        fx.fault_read(index).unwrap();
    }

    let id = fx.frame_of(5).unwrap();
    let mut args = PinArgs::default();
    args.alloc_replacement_pages(&fx.pager, 1).unwrap();
    fx.pager.pin(id, &mut args);

    let ram = fx.pager.ram_alloc_lock().lock();
    fx.pager
        .discard_page(&ram, id, Default::default())
        .unwrap();
    drop(ram);

    // The manager moved the contents to a new frame; the old one is a
    // moved pinned frame on its way back to the free pool.
    let new = fx.frame_of(5).unwrap();
    assert_ne!(new, id);
    assert_eq!(
        fx.pager.page_info(id).unwrap().state,
        PagedState::PinnedMoved
    );

    // The first touch notices and hands it back.
    assert_eq!(fx.pager.page_freed(id), Err(Error::NotFound));
    assert_eq!(fx.pager.page_info(id).unwrap().state, PagedState::Unpaged);
    assert_eq!(fx.pager.page_freed(id), Err(Error::NotFound));
}

#[test]
fn decommit_keeps_slot_in_cache() {
    let fx = Fixture::new(512, small_config(64, 64));
    for index in 0..8 {
        fx.fault_read(index).unwrap();
    }

    let id = fx.frame_of(4).unwrap();
    let before = fx.pager.live_counts();
    fx.decommit(4).unwrap();

    let after = fx.pager.live_counts();
    assert_eq!(fx.pager.page_info(id).unwrap().state, PagedState::OldestClean);
    assert_eq!(after.oldest_clean, before.oldest_clean + 1);
    assert_eq!(after.young, before.young - 1);
    fx.check_invariants();
}
