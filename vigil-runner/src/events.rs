// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events emitted through the watch pipeline.
//!
//! Two layers of events live here. [`TestEvent`] is the parsed form of one
//! line of test-command output, produced by the streaming parser and consumed
//! by the aggregator. [`WatchEvent`] is the published form: the watch loop
//! drives a consumer callback with these, covering run lifecycle, individual
//! test events, and asynchronous errors.

use crate::{
    aggregate::{ResultNode, RunCounts},
    errors::WatchError,
    watcher::{FileChangeEvent, FileChangeKind},
};
use camino::Utf8PathBuf;
use chrono::{DateTime, FixedOffset};
use std::{fmt, time::Duration};

/// The action recorded by one test event.
///
/// `Run` begins a test, `Pass`/`Fail`/`Skip` end one, and `Output` carries a
/// line of free-form output. Events with no test name describe the package
/// itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestAction {
    /// The test has started running.
    Run,
    /// The test passed.
    Pass,
    /// The test failed.
    Fail,
    /// The test was skipped.
    Skip,
    /// A line of output was produced.
    Output,
}

impl TestAction {
    /// Maps a wire-format action string to a `TestAction`.
    ///
    /// The upstream protocol also emits `start`, `pause`, `cont` and `bench`
    /// actions; those return `None` and are dropped by the parser.
    pub fn from_wire(action: &str) -> Option<Self> {
        match action {
            "run" => Some(Self::Run),
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "skip" => Some(Self::Skip),
            "output" => Some(Self::Output),
            _ => None,
        }
    }

    /// Returns true if this action ends a test or package.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Pass | Self::Fail | Self::Skip)
    }

    /// Returns the action as a static string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for TestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured event decoded from the test command's output.
#[derive(Clone, Debug, PartialEq)]
pub struct TestEvent {
    /// The wall-clock time the event was recorded, if the wire format
    /// carried one. Text-fallback output has no timestamps.
    pub timestamp: Option<DateTime<FixedOffset>>,

    /// The action this event records.
    pub action: TestAction,

    /// The import path of the package the event belongs to.
    ///
    /// Empty until resolved: in text-fallback mode the package is only
    /// known once its summary line arrives.
    pub package: String,

    /// The test name, with subtests encoded as `parent/child`.
    ///
    /// `None` for package-level events.
    pub test: Option<String>,

    /// The output line, on [`TestAction::Output`] events.
    pub output: Option<String>,

    /// Elapsed time, on terminal actions.
    pub elapsed: Option<Duration>,
}

impl TestEvent {
    /// Returns the (package, test) key for this event.
    pub fn key(&self) -> (&str, Option<&str>) {
        (&self.package, self.test.as_deref())
    }
}

/// What caused a run to start.
#[derive(Clone, Debug, PartialEq)]
pub enum RunTrigger {
    /// The initial run performed at watch startup.
    Startup,

    /// A debounced filesystem change.
    FileChange {
        /// The debounce key that fired.
        key: String,

        /// The change that armed the debouncer most recently.
        path: Utf8PathBuf,
    },
}

/// A request to execute the test command once.
///
/// Immutable once created; produced by the watch loop after a debounce
/// fires (or at startup), consumed by the run worker.
#[derive(Clone, Debug)]
pub struct RunRequest {
    /// The package pattern to run tests for, e.g. `./...` or `./parser`.
    pub target: String,

    /// An optional test-name filter forwarded to the command.
    pub test_filter: Option<String>,

    /// The execution deadline for this run.
    pub timeout: Duration,

    /// What caused this request.
    pub trigger: RunTrigger,
}

/// Why an in-flight run was canceled.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CancelReason {
    /// A newer trigger superseded this run.
    Superseded,

    /// The watch loop is shutting down.
    Shutdown,
}

impl CancelReason {
    pub(crate) fn to_static_str(self) -> &'static str {
        match self {
            Self::Superseded => "superseded",
            Self::Shutdown => "shutdown",
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The command ran to completion and exited.
    ///
    /// An exit code of 1 is the conventional tests-failed status; the
    /// result tree distinguishes test failures from command failures.
    Exited {
        /// The exit code, if the process exited normally.
        code: Option<i32>,
    },

    /// The run exceeded its execution timeout and was terminated.
    TimedOut {
        /// The configured timeout.
        after: Duration,
    },

    /// The run was canceled before completion.
    Canceled {
        /// Why the run was canceled.
        reason: CancelReason,
    },

    /// The command could not be started or supervised.
    Failed {
        /// The underlying error.
        error: crate::errors::ChildError,
    },
}

impl RunOutcome {
    /// Returns true if the run ran to natural completion.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Exited { .. })
    }
}

/// Why the watch loop is shutting down.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownReason {
    /// An OS signal requested shutdown.
    Signal,

    /// The consumer requested shutdown through the stop handle.
    Requested,

    /// The filesystem event stream ended unexpectedly.
    WatcherClosed,
}

/// An event published by the watch loop.
#[derive(Debug)]
pub struct WatchEvent {
    /// When the event was published.
    pub timestamp: DateTime<FixedOffset>,

    /// What the event is.
    pub kind: WatchEventKind,
}

/// The kinds of events published by the watch loop.
#[derive(Debug)]
pub enum WatchEventKind {
    /// Watching has started.
    WatchStarted {
        /// The root being watched.
        root: Utf8PathBuf,
    },

    /// A relevant file change was observed (after include/exclude
    /// filtering, before debouncing).
    FileChanged {
        /// The absolute path that changed.
        path: Utf8PathBuf,

        /// The kind of change.
        kind: FileChangeKind,
    },

    /// A run has started.
    RunStarted {
        /// Monotonically increasing run id, starting at 1.
        run_id: u64,

        /// What caused the run.
        trigger: RunTrigger,
    },

    /// A test event was observed during the active run.
    Test {
        /// The id of the run the event belongs to.
        run_id: u64,

        /// The parsed event.
        event: TestEvent,
    },

    /// A run finished, was canceled, or failed.
    RunFinished {
        /// The id of the finished run.
        run_id: u64,

        /// How the run ended.
        outcome: RunOutcome,

        /// The aggregated result tree. For canceled runs this is partial,
        /// with unresolved nodes left running.
        results: ResultNode,

        /// Tallies over the tree's test and subtest nodes.
        counts: RunCounts,

        /// Wall time from run start to completion.
        elapsed: Duration,
    },

    /// An asynchronous error was reported by one of the workers.
    Error {
        /// The error.
        error: WatchError,
    },

    /// The watch loop has begun shutting down.
    ShuttingDown {
        /// Why shutdown began.
        reason: ShutdownReason,
    },
}

impl WatchEvent {
    pub(crate) fn now(kind: WatchEventKind) -> Self {
        Self {
            timestamp: chrono::Local::now().fixed_offset(),
            kind,
        }
    }

    pub(crate) fn file_changed(change: &FileChangeEvent) -> Self {
        // Keep the timestamp the watcher recorded at detection time.
        Self {
            timestamp: change.timestamp,
            kind: WatchEventKind::FileChanged {
                path: change.path.clone(),
                kind: change.kind,
            },
        }
    }
}
