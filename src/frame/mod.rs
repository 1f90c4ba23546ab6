// SPDX-License-Identifier: MPL-2.0

//! Frame descriptors, the dense frame table and the live-list queues.

mod list;
mod meta;
mod table;

pub use self::{
    meta::{FrameId, FrameKind, PagedState},
    table::FrameTable,
};

pub(crate) use self::{list::FrameQueue, meta::FrameDescriptor};
