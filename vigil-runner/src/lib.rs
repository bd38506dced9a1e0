// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for vigil, a continuous test runner for Go projects.
//!
//! The library watches a source tree, re-runs `go test` when relevant files
//! change, parses the command's output incrementally into structured
//! events, and aggregates them into a per-run result tree. The `vigil`
//! binary provides the command-line interface on top of it.
//!
//! The main entry point is [`runner::WatchRunner`].

pub mod aggregate;
pub mod config;
pub mod debounce;
pub mod errors;
pub mod events;
pub mod parser;
pub mod pattern;
mod process;
pub mod runner;
pub mod signal;
mod stopwatch;
pub mod watcher;
