// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::ExpectedError,
    output::{OutputContext, OutputOpts, clap_styles},
    reporter::Reporter,
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, ValueEnum};
use std::{io, time::Duration};
use tracing::warn;
use vigil_runner::{
    config::{ParserMode, RunScope, WatchConfig},
    events::ShutdownReason,
    runner::WatchRunnerBuilder,
    signal::SignalHandlerKind,
};

/// A continuous test runner for Go projects.
///
/// Watches a project tree and reruns its tests whenever source files
/// change, streaming parsed results as they arrive.
#[derive(Debug, Parser)]
#[command(version, name = "vigil", styles = clap_styles::style())]
pub struct VigilApp {
    /// Project root to watch [default: .]
    #[arg(value_name = "PATH")]
    root: Option<Utf8PathBuf>,

    #[command(flatten)]
    output: OutputOpts,

    #[command(flatten)]
    config_opts: ConfigOpts,

    #[command(flatten)]
    watch_opts: WatchOpts,
}

impl VigilApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code.
    ///
    /// Zero means the watch session ended cleanly; one means it ended with
    /// a failed shutdown hook or a dead file watcher.
    pub fn exec(self, output: OutputContext) -> Result<i32, ExpectedError> {
        let config = self.resolve_config()?;
        if !config.root.as_std_path().is_dir() {
            return Err(ExpectedError::RootNotFound { root: config.root });
        }

        let runner = WatchRunnerBuilder::new(config)
            .build(SignalHandlerKind::Standard)
            .map_err(|error| ExpectedError::Setup { error })?;

        let mut reporter = Reporter::new(output, io::stdout());
        let mut write_failed = false;
        let report = runner
            .watch(move |event| {
                if write_failed {
                    return;
                }
                if let Err(error) = reporter.report_event(&event) {
                    warn!(%error, "cannot write to stdout; suppressing further output");
                    write_failed = true;
                }
            })
            .map_err(|error| ExpectedError::Setup { error })?;

        let clean = report.is_clean() && report.reason != ShutdownReason::WatcherClosed;
        Ok(if clean { 0 } else { 1 })
    }

    /// Builds the effective configuration: config file first, then flag
    /// overrides on top.
    fn resolve_config(&self) -> Result<WatchConfig, ExpectedError> {
        let search_root = self.root.as_deref().unwrap_or(Utf8Path::new("."));
        let mut config = self.config_opts.load_config(search_root)?;
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        self.watch_opts.apply(&mut config);
        Ok(config)
    }
}

#[derive(Debug, Args)]
struct ConfigOpts {
    /// Config file [default: <PATH>/vigil.toml]
    #[arg(long, global = true, value_name = "PATH")]
    pub config_file: Option<Utf8PathBuf>,
}

impl ConfigOpts {
    /// Loads the watch configuration for the given root.
    ///
    /// An explicitly requested config file must exist; the default
    /// `vigil.toml` at the root does not have to.
    fn load_config(&self, root: &Utf8Path) -> Result<WatchConfig, ExpectedError> {
        match &self.config_file {
            Some(path) => read_config(path),
            None => {
                let path = root.join("vigil.toml");
                match std::fs::read_to_string(&path) {
                    Ok(input) => parse_config(&path, &input),
                    Err(error) if error.kind() == io::ErrorKind::NotFound => {
                        Ok(WatchConfig::default())
                    }
                    Err(error) => Err(ExpectedError::ConfigReadFailed { path, error }),
                }
            }
        }
    }
}

fn read_config(path: &Utf8Path) -> Result<WatchConfig, ExpectedError> {
    let input =
        std::fs::read_to_string(path).map_err(|error| ExpectedError::ConfigReadFailed {
            path: path.to_owned(),
            error,
        })?;
    parse_config(path, &input)
}

fn parse_config(path: &Utf8Path, input: &str) -> Result<WatchConfig, ExpectedError> {
    toml::from_str(input).map_err(|error| ExpectedError::ConfigParseFailed {
        path: path.to_owned(),
        error,
    })
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Watch options")]
struct WatchOpts {
    /// Test command to run [default: go test -json]
    #[arg(long, value_name = "COMMAND")]
    command: Option<String>,

    /// Pass `-run <PATTERN>` to every test invocation
    #[arg(long, short = 't', value_name = "PATTERN")]
    test_filter: Option<String>,

    /// What a file change reruns: all, package
    #[arg(
        long,
        value_enum,
        hide_possible_values = true,
        value_name = "SCOPE"
    )]
    scope: Option<ScopeOpt>,

    /// Wire format to expect from the test command: auto, protocol, text
    #[arg(
        long,
        value_enum,
        hide_possible_values = true,
        value_name = "MODE"
    )]
    parser_mode: Option<ParserModeOpt>,

    /// Quiet period after a change before a run starts
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    debounce: Option<Duration>,

    /// Deadline for a single run
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    run_timeout: Option<Duration>,

    /// Skip the full run normally performed at watch start
    #[arg(long)]
    no_run_on_start: bool,
}

impl WatchOpts {
    fn apply(&self, config: &mut WatchConfig) {
        if let Some(command) = &self.command {
            config.command = command.clone();
        }
        if let Some(filter) = &self.test_filter {
            config.test_filter = Some(filter.clone());
        }
        if let Some(scope) = self.scope {
            config.scope = scope.into();
        }
        if let Some(mode) = self.parser_mode {
            config.parser_mode = mode.into();
        }
        if let Some(debounce) = self.debounce {
            config.debounce = debounce;
        }
        if let Some(run_timeout) = self.run_timeout {
            config.run_timeout = run_timeout;
        }
        if self.no_run_on_start {
            config.run_on_start = false;
        }
    }
}

/// Mirror of [`RunScope`] with clap's `ValueEnum` derived.
#[derive(Copy, Clone, Debug, ValueEnum)]
enum ScopeOpt {
    All,
    Package,
}

impl From<ScopeOpt> for RunScope {
    fn from(value: ScopeOpt) -> Self {
        match value {
            ScopeOpt::All => Self::All,
            ScopeOpt::Package => Self::Package,
        }
    }
}

/// Mirror of [`ParserMode`] with clap's `ValueEnum` derived.
#[derive(Copy, Clone, Debug, ValueEnum)]
enum ParserModeOpt {
    Auto,
    Protocol,
    Text,
}

impl From<ParserModeOpt> for ParserMode {
    fn from(value: ParserModeOpt) -> Self {
        match value {
            ParserModeOpt::Auto => Self::Auto,
            ParserModeOpt::Protocol => Self::Protocol,
            ParserModeOpt::Text => Self::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> VigilApp {
        VigilApp::try_parse_from(std::iter::once("vigil").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn clap_command_is_well_formed() {
        use clap::CommandFactory;
        VigilApp::command().debug_assert();
    }

    #[test]
    fn defaults_apply_without_a_config_file() {
        let temp = Utf8TempDir::new().unwrap();
        let app = parse(&[temp.path().as_str()]);
        let config = app.resolve_config().unwrap();

        assert_eq!(config.root, temp.path());
        assert_eq!(config.command, "go test -json");
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert!(config.run_on_start);
    }

    #[test]
    fn config_file_is_found_at_the_root() {
        let temp = Utf8TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("vigil.toml"),
            indoc! {r#"
                command = "go test -json -count=1"
                debounce = "250ms"
                scope = "package"
            "#},
        )
        .unwrap();

        let app = parse(&[temp.path().as_str()]);
        let config = app.resolve_config().unwrap();

        assert_eq!(config.command, "go test -json -count=1");
        assert_eq!(config.debounce, Duration::from_millis(250));
        assert_eq!(config.scope, RunScope::Package);
    }

    #[test]
    fn flags_override_the_config_file() {
        let temp = Utf8TempDir::new().unwrap();
        std::fs::write(temp.path().join("vigil.toml"), "debounce = \"250ms\"\n").unwrap();

        let app = parse(&[
            temp.path().as_str(),
            "--debounce",
            "1s",
            "--test-filter",
            "TestParser.*",
            "--scope",
            "package",
            "--no-run-on-start",
        ]);
        let config = app.resolve_config().unwrap();

        assert_eq!(config.debounce, Duration::from_secs(1));
        assert_eq!(config.test_filter.as_deref(), Some("TestParser.*"));
        assert_eq!(config.scope, RunScope::Package);
        assert!(!config.run_on_start);
    }

    #[test]
    fn explicit_config_file_must_exist() {
        let temp = Utf8TempDir::new().unwrap();
        let missing = temp.path().join("missing.toml");

        let app = parse(&["--config-file", missing.as_str()]);
        let error = app.resolve_config().unwrap_err();

        assert!(matches!(error, ExpectedError::ConfigReadFailed { .. }));
    }

    #[test]
    fn malformed_config_file_is_a_parse_error() {
        let temp = Utf8TempDir::new().unwrap();
        std::fs::write(temp.path().join("vigil.toml"), "debounce = 17\n").unwrap();

        let app = parse(&[temp.path().as_str()]);
        let error = app.resolve_config().unwrap_err();

        assert!(matches!(error, ExpectedError::ConfigParseFailed { .. }));
    }
}
