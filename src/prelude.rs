// SPDX-License-Identifier: MPL-2.0

//! The crate prelude.

/// The common result type of pager operations.
pub type Result<T> = core::result::Result<T, crate::error::Error>;

pub use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};

pub use crate::error::Error;
