// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by vigil.

use camino::Utf8PathBuf;
use std::{fmt, time::Duration};
use thiserror::Error;

/// A boxed error returned by a shutdown hook.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error that occurred while constructing a
/// [`FileWatcher`](crate::watcher::FileWatcher).
///
/// Construction is all-or-nothing: if any of these is returned, no watches
/// were left behind.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CreateWatcherError {
    /// The watch root does not exist.
    #[error("watch root `{root}` does not exist")]
    RootNotFound {
        /// The root that was requested.
        root: Utf8PathBuf,
    },

    /// The watch root exists but is not a directory.
    #[error("watch root `{root}` is not a directory")]
    RootNotDirectory {
        /// The root that was requested.
        root: Utf8PathBuf,
    },

    /// The OS notification backend could not be initialized.
    #[error("failed to initialize filesystem notifications")]
    Init {
        /// The underlying error.
        #[source]
        error: notify::Error,
    },

    /// A directory under the root could not be registered for watching.
    #[error("failed to watch directory `{dir}`")]
    Register {
        /// The directory that could not be watched.
        dir: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: notify::Error,
    },
}

/// An error that occurred while spawning or supervising the test command.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChildError {
    /// The command could not be started.
    #[error("failed to start test command `{command}`")]
    Spawn {
        /// The rendered command line.
        command: String,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// An error occurred while reading the child's output.
    #[error("error reading test command output")]
    Read {
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// An error occurred while waiting for the child to exit.
    #[error("error waiting for test command to exit")]
    Wait {
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// A failure reported for one shutdown hook.
///
/// Hook failures are collected rather than short-circuiting: every hook is
/// attempted even if an earlier one fails, times out, or panics.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShutdownHookError {
    /// The hook returned an error.
    #[error("shutdown hook `{name}` failed")]
    Failed {
        /// The hook's registered name.
        name: String,

        /// The error returned by the hook.
        #[source]
        error: BoxedError,
    },

    /// The hook did not finish before the shared shutdown deadline.
    #[error("shutdown hook `{name}` timed out after {timeout:?}")]
    TimedOut {
        /// The hook's registered name.
        name: String,

        /// The shared shutdown timeout.
        timeout: Duration,
    },

    /// The hook panicked.
    #[error("shutdown hook `{name}` panicked: {message}")]
    Panicked {
        /// The hook's registered name.
        name: String,

        /// The panic payload, rendered as a string.
        message: String,
    },
}

/// An asynchronous error surfaced on the watch event stream.
///
/// These are not fatal to the watch loop: the pipeline returns to idle and
/// waits for the next trigger.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WatchError {
    /// The OS notification backend reported an error while watching.
    #[error("filesystem watcher error")]
    Notify {
        /// The underlying error.
        #[source]
        error: notify::Error,
    },

    /// A newly created directory could not be added to the watch set.
    #[error("failed to watch new directory `{dir}`")]
    WatchNewDir {
        /// The directory that could not be watched.
        dir: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: notify::Error,
    },

    /// The test command failed to run.
    #[error("test command failed")]
    Child {
        /// The underlying error.
        #[source]
        error: ChildError,
    },

    /// The test command exited unsuccessfully without reporting any tests.
    ///
    /// Ordinary test failures show up in the result tree instead; this
    /// usually means a build error or a bad command line.
    #[error("test command `{command}` {}", exit_reason(*.code))]
    CommandFailed {
        /// The rendered command line.
        command: String,

        /// The exit code, if the process exited normally.
        code: Option<i32>,

        /// Captured standard error, trimmed of trailing whitespace.
        stderr: String,
    },

    /// A worker task panicked; the panic was recovered at the task boundary.
    #[error("worker `{worker}` panicked: {message}")]
    WorkerPanic {
        /// Which worker panicked.
        worker: &'static str,

        /// The panic payload, rendered as a string.
        message: String,
    },
}

fn exit_reason(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "was terminated by a signal".to_owned(),
    }
}

/// An error that prevented the watch loop from starting.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WatchSetupError {
    /// The configured test command could not be parsed.
    #[error("failed to parse test command")]
    Command {
        /// The underlying error.
        #[source]
        error: CommandParseError,
    },

    /// The file watcher could not be constructed.
    #[error("failed to set up file watching")]
    Watcher {
        /// The underlying error.
        #[source]
        error: CreateWatcherError,
    },

    /// OS signal handlers could not be installed.
    #[error("failed to install signal handlers")]
    SignalHandler {
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The Tokio runtime failed to start.
    #[error("failed to create Tokio runtime")]
    TokioRuntimeCreate {
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while splitting a configured command string.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommandParseError {
    /// The command string could not be split into words.
    #[error("invalid command line `{input}`")]
    Split {
        /// The input that failed to parse.
        input: String,

        /// The underlying error.
        #[source]
        error: shell_words::ParseError,
    },

    /// The command string was empty.
    #[error("command line is empty")]
    Empty,
}

/// Displays an error together with its whole source chain.
///
/// The top-level message comes first; each source follows on its own
/// `caused by:` line.
pub struct DisplayErrorChain<E>(E);

impl<E: std::error::Error> DisplayErrorChain<E> {
    /// Wraps an error for chain display.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: std::error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cause = self.0.source();
        while let Some(error) = cause {
            write!(f, "\n  caused by: {error}")?;
            cause = error.source();
        }
        Ok(())
    }
}
