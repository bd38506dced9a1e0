// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The watch runner.
//!
//! The main structure in this module is [`WatchRunner`].

mod dispatcher;
mod executor;
mod hooks;

pub use dispatcher::{ShutdownReport, StopHandle, WatchRunner, WatchRunnerBuilder};
pub use hooks::{HookOutcome, ShutdownHooks};
