// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors for the command-line front end.
//!
//! The errors in this module are user facing and are displayed through
//! [`ExpectedError::display_to_stderr`], which colorizes them.

use crate::output::StderrStyles;
use camino::Utf8PathBuf;
use owo_colors::OwoColorize;
use std::error::Error;
use thiserror::Error;
use tracing::error;
use vigil_runner::errors::WatchSetupError;

/// A failure the CLI anticipates and renders itself, without a backtrace.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExpectedError {
    /// The config file could not be read.
    #[error("failed to read config file")]
    ConfigReadFailed {
        /// The path that was requested.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The config file could not be parsed.
    #[error("failed to parse config file")]
    ConfigParseFailed {
        /// The path that was read.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: toml::de::Error,
    },

    /// The requested watch root is not a directory.
    #[error("watch root is not a directory")]
    RootNotFound {
        /// The root that was requested.
        root: Utf8PathBuf,
    },

    /// The watch session could not be set up.
    #[error("failed to set up the watch session")]
    Setup {
        /// The underlying error.
        #[source]
        error: WatchSetupError,
    },
}

impl ExpectedError {
    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigReadFailed { .. }
            | Self::ConfigParseFailed { .. }
            | Self::RootNotFound { .. }
            | Self::Setup { .. } => 2,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::ConfigReadFailed { path, error } => {
                error!(
                    "failed to read config file `{}`",
                    path.style(styles.bold)
                );
                Some(error as &dyn Error)
            }
            Self::ConfigParseFailed { path, error } => {
                error!(
                    "failed to parse config file `{}`",
                    path.style(styles.bold)
                );
                Some(error as &dyn Error)
            }
            Self::RootNotFound { root } => {
                error!(
                    "watch root `{}` is not a directory",
                    root.style(styles.bold)
                );
                None
            }
            Self::Setup { error } => {
                error!("{}", error);
                error.source()
            }
        };

        while let Some(error) = next_error {
            error!(target: "vigil::no_heading", "\nCaused by:\n  {}", error);
            next_error = error.source();
        }
    }
}
