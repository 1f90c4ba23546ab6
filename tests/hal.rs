// SPDX-License-Identifier: MPL-2.0

//! The VM HAL control surface.

mod common;

use common::Fixture;
use vm_pager::{
    config::BootPagingConfig,
    events::PageEvent,
    frame::{FrameKind, PagedState},
    hal::{vm_hal, VmHalReply, VmHalRequest},
    mmu::PAGE_SIZE,
    Error,
};

fn config() -> BootPagingConfig {
    BootPagingConfig {
        min_pages: 64,
        max_pages: 128,
        data_paging: true,
        ..BootPagingConfig::default()
    }
}

#[test]
fn mutating_requests_need_write_device_data() {
    let fx = Fixture::new(512, config());
    let thread = fx.thread();

    let denied = vm_hal(&fx.pager, &thread, VmHalRequest::FlushCache);
    assert_eq!(denied.unwrap_err(), Error::AccessDenied);

    let denied = vm_hal(
        &fx.pager,
        &thread,
        VmHalRequest::SetCacheSize {
            min_bytes: 64 * PAGE_SIZE,
            max_bytes: 128 * PAGE_SIZE,
        },
    );
    assert_eq!(denied.unwrap_err(), Error::AccessDenied);

    // Reads are unprivileged.
    vm_hal(&fx.pager, &thread, VmHalRequest::GetCacheSize).unwrap();
    vm_hal(&fx.pager, &thread, VmHalRequest::GetEventInfo).unwrap();
}

#[test]
fn cache_size_round_trips_through_hal() {
    let fx = Fixture::new(512, config());
    let mut thread = fx.thread();
    thread.write_device_data = true;

    vm_hal(
        &fx.pager,
        &thread,
        VmHalRequest::SetCacheSize {
            min_bytes: 96 * PAGE_SIZE,
            max_bytes: 128 * PAGE_SIZE,
        },
    )
    .unwrap();

    let VmHalReply::CacheSize(info) =
        vm_hal(&fx.pager, &thread, VmHalRequest::GetCacheSize).unwrap()
    else {
        panic!("wrong reply kind");
    };
    assert_eq!(info.min_size, 96 * PAGE_SIZE);
    assert_eq!(info.max_size, 128 * PAGE_SIZE);
    assert_eq!(info.current_size, 96 * PAGE_SIZE);
}

#[test]
fn event_counters_reset_through_hal() {
    let fx = Fixture::new(512, config());
    fx.fault_read(0).unwrap();
    fx.fault_read(0).unwrap();

    let mut thread = fx.thread();
    thread.write_device_data = true;

    let VmHalReply::EventInfo(events) =
        vm_hal(&fx.pager, &thread, VmHalRequest::GetEventInfo).unwrap()
    else {
        panic!("wrong reply kind");
    };
    assert!(events.count(PageEvent::PageInStart) > 0);
    assert!(events.count(PageEvent::PageRejuvenate) > 0);

    vm_hal(&fx.pager, &thread, VmHalRequest::ResetEventInfo).unwrap();
    let VmHalReply::EventInfo(events) =
        vm_hal(&fx.pager, &thread, VmHalRequest::GetEventInfo).unwrap()
    else {
        panic!("wrong reply kind");
    };
    assert_eq!(events.count(PageEvent::PageInStart), 0);
}

#[test]
fn page_state_reports_resident_page() {
    let fx = Fixture::new(512, config());
    fx.fault_read(3).unwrap();
    let thread = fx.thread();

    let VmHalReply::PageState(state) = vm_hal(
        &fx.pager,
        &thread,
        VmHalRequest::PageState {
            addr: common::MAP_BASE + 3 * PAGE_SIZE,
        },
    )
    .unwrap() else {
        panic!("wrong reply kind");
    };

    assert!(state.paged);
    assert!(state.pte_present);
    assert!(state.pte_valid);
    assert_eq!(state.kind, Some(FrameKind::Managed));
    assert_eq!(state.state, Some(PagedState::Young));

    // An unmapped address reports nothing present.
    let VmHalReply::PageState(state) = vm_hal(
        &fx.pager,
        &thread,
        VmHalRequest::PageState { addr: 0x100 },
    )
    .unwrap() else {
        panic!("wrong reply kind");
    };
    assert!(!state.paged);
    assert!(!state.pte_present);
}

#[test]
fn swap_queries_unsupported_without_backend() {
    let fx = Fixture::new(512, config());
    let thread = fx.thread();

    let r = vm_hal(&fx.pager, &thread, VmHalRequest::GetSwapInfo);
    assert_eq!(r.unwrap_err(), Error::NotSupported);
}
