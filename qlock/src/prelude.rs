// SPDX-License-Identifier: MPL-2.0

//! The prelude.

/// The `Result` type alias used throughout the crate.
pub type Result<T> = core::result::Result<T, crate::error::Error>;

pub(crate) use crate::error::Error;
