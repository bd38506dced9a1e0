// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for the watch pipeline.
//!
//! [`WatchConfig`] is a resolved value object: the library does not read
//! configuration files. The binary crate loads TOML, applies flag overrides,
//! and hands the finished value in.

use crate::errors::CommandParseError;
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::time::Duration;

/// How much of the tree a file change re-runs.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum RunScope {
    /// Any change runs the whole suite under `./...`. One debounce key, so
    /// bursts across files coalesce into a single run.
    #[default]
    All,

    /// A change runs only the containing package's tests. Debounce keys are
    /// per package.
    Package,
}

/// Which wire format the parser should expect.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ParserMode {
    /// Decide per run by inspecting the first non-empty line.
    #[default]
    Auto,

    /// JSON-lines protocol only.
    Protocol,

    /// Text fallback only.
    Text,
}

/// Resolved configuration for one watch session.
///
/// Every field has a default, so a configuration file may set any subset.
/// Durations deserialize from humantime strings (`"500ms"`, `"5m"`).
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WatchConfig {
    /// The directory to watch, and the working directory for the test
    /// command.
    pub root: Utf8PathBuf,

    /// The base test command, as a shell-split string. The run target (and
    /// `-run <filter>` when a test filter is set) is appended per run.
    pub command: String,

    /// Value passed to the test command as `-run <filter>` on every run.
    pub test_filter: Option<String>,

    /// Glob patterns a changed path must match to trigger a run.
    pub include: Vec<String>,

    /// Glob patterns that exempt a changed path from triggering.
    pub exclude: Vec<String>,

    /// Directory patterns never registered for watching.
    pub ignore_dirs: Vec<String>,

    /// Quiet interval a debounce key must see before its run fires.
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,

    /// Execution deadline for one run.
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,

    /// Shared deadline for all shutdown hooks.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Grace period between asking the test command to terminate and
    /// killing it.
    #[serde(with = "humantime_serde")]
    pub terminate_grace: Duration,

    /// How much of the tree a change re-runs.
    pub scope: RunScope,

    /// Which wire format to expect.
    pub parser_mode: ParserMode,

    /// Run the full suite once at watch start, before any change.
    pub run_on_start: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            command: "go test -json".to_owned(),
            test_filter: None,
            include: vec!["**/*.go".to_owned()],
            exclude: Vec::new(),
            ignore_dirs: vec![
                "**/vendor/**".to_owned(),
                "**/.git/**".to_owned(),
                "**/node_modules/**".to_owned(),
            ],
            debounce: Duration::from_millis(500),
            run_timeout: Duration::from_secs(5 * 60),
            shutdown_timeout: Duration::from_secs(30),
            terminate_grace: Duration::from_secs(2),
            scope: RunScope::default(),
            parser_mode: ParserMode::default(),
            run_on_start: true,
        }
    }
}

impl WatchConfig {
    /// Splits the configured command string into a [`TestCommand`].
    pub fn test_command(&self) -> Result<TestCommand, CommandParseError> {
        TestCommand::parse(&self.command, self.root.clone())
    }
}

/// The executable and base arguments for the external test command.
#[derive(Clone, Debug, PartialEq)]
pub struct TestCommand {
    /// The program to execute.
    pub program: String,

    /// Base arguments, before the per-run target and filter.
    pub args: Vec<String>,

    /// The working directory the command runs in.
    pub cwd: Utf8PathBuf,
}

impl TestCommand {
    /// Parses a shell-split command string.
    pub fn parse(input: &str, cwd: Utf8PathBuf) -> Result<Self, CommandParseError> {
        let mut words = shell_words::split(input)
            .map_err(|error| CommandParseError::Split {
                input: input.to_owned(),
                error,
            })?
            .into_iter();
        let program = words.next().ok_or(CommandParseError::Empty)?;
        Ok(Self {
            program,
            args: words.collect(),
            cwd,
        })
    }

    /// Returns the full argument list for one run: base arguments, then the
    /// target, then `-run <filter>` when a filter is set.
    pub fn args_for(&self, target: &str, test_filter: Option<&str>) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(target.to_owned());
        if let Some(filter) = test_filter {
            args.push("-run".to_owned());
            args.push(filter.to_owned());
        }
        args
    }

    /// The rendered command line, for logs and error messages.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_file_merges_with_defaults() {
        let config: WatchConfig = toml::from_str(indoc! {r#"
            command = "go test -json -count=1"
            debounce = "250ms"
            run-timeout = "2m"
            scope = "package"
            test-filter = "TestParser.*"
        "#})
        .expect("config should parse");

        assert_eq!(config.command, "go test -json -count=1");
        assert_eq!(config.test_filter.as_deref(), Some("TestParser.*"));
        assert_eq!(config.debounce, Duration::from_millis(250));
        assert_eq!(config.run_timeout, Duration::from_secs(120));
        assert_eq!(config.scope, RunScope::Package);
        // Untouched fields keep their defaults.
        assert_eq!(config.include, vec!["**/*.go".to_owned()]);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert!(config.run_on_start);
    }

    #[test]
    fn command_splits_and_appends_target() {
        let command =
            TestCommand::parse("go test -json -count=1", Utf8PathBuf::from(".")).unwrap();
        assert_eq!(command.program, "go");
        assert_eq!(command.args, vec!["test", "-json", "-count=1"]);

        assert_eq!(
            command.args_for("./...", None),
            vec!["test", "-json", "-count=1", "./..."]
        );
        assert_eq!(
            command.args_for("./parser", Some("TestFlush")),
            vec!["test", "-json", "-count=1", "./parser", "-run", "TestFlush"]
        );
    }

    #[test]
    fn quoted_arguments_survive_splitting() {
        let command = TestCommand::parse(
            r#"go test -json -ldflags "-X main.version=dev""#,
            Utf8PathBuf::from("."),
        )
        .unwrap();
        assert_eq!(
            command.args,
            vec!["test", "-json", "-ldflags", "-X main.version=dev"]
        );
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = TestCommand::parse("   ", Utf8PathBuf::from(".")).unwrap_err();
        assert!(matches!(err, CommandParseError::Empty));
    }

    #[test]
    fn kebab_case_keys_deserialize() {
        let config: WatchConfig = toml::from_str("ignore-dirs = []").unwrap();
        assert!(config.ignore_dirs.is_empty());
    }
}
