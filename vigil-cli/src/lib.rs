// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A continuous test runner for Go projects.
//!
//! This crate is the command-line front end; the watch-and-rerun machinery
//! lives in [`vigil_runner`].

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;
mod reporter;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
