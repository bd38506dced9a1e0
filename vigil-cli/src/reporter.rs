// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Renders watch events to the terminal.
//!
//! Run headers and per-test status lines stream as they happen; when a run
//! finishes, a summary line and a result tree follow. Without `--verbose`
//! the tree is limited to failing subtrees, so a green run stays compact.

use crate::output::OutputContext;
use owo_colors::{OwoColorize, Style};
use std::{
    io::{self, Write},
    time::Duration,
};
use vigil_runner::{
    aggregate::{NodeStatus, ResultNode, RunCounts},
    errors::{DisplayErrorChain, WatchError},
    events::{
        CancelReason, RunOutcome, RunTrigger, ShutdownReason, TestAction, TestEvent, WatchEvent,
        WatchEventKind,
    },
};

/// Renders watch events as they are published.
///
/// Events arrive from a single watch loop, one at a time and in publication
/// order, so the reporter needs no state beyond its styles.
pub(crate) struct Reporter<W> {
    writer: W,
    verbose: bool,
    styles: Styles,
}

impl<W: Write> Reporter<W> {
    pub(crate) fn new(output: OutputContext, writer: W) -> Self {
        let mut styles = Styles::default();
        if output.color.should_colorize(supports_color::Stream::Stdout) {
            styles.colorize();
        }

        Self {
            writer,
            verbose: output.verbose,
            styles,
        }
    }

    /// Renders one event, flushing afterwards so output streams promptly
    /// even when stdout is not a terminal.
    pub(crate) fn report_event(&mut self, event: &WatchEvent) -> io::Result<()> {
        self.write_event(event)?;
        self.writer.flush()
    }

    fn write_event(&mut self, event: &WatchEvent) -> io::Result<()> {
        match &event.kind {
            WatchEventKind::WatchStarted { root } => {
                writeln!(
                    self.writer,
                    "{:>12} {}",
                    "Watching".style(self.styles.pass),
                    root.style(self.styles.count),
                )
            }
            WatchEventKind::FileChanged { path, kind } => {
                if self.verbose {
                    writeln!(
                        self.writer,
                        "{:>12} {path} ({kind})",
                        "Changed".style(self.styles.count),
                    )?;
                }
                Ok(())
            }
            WatchEventKind::RunStarted { run_id, trigger } => {
                write!(
                    self.writer,
                    "{:>12} run {} ",
                    "Starting".style(self.styles.pass),
                    format!("#{run_id}").style(self.styles.count),
                )?;
                match trigger {
                    RunTrigger::Startup => write!(self.writer, "(startup)")?,
                    RunTrigger::FileChange { key, path } => {
                        write!(self.writer, "({key}: {path} changed)")?;
                    }
                }
                writeln!(self.writer, " at {}", event.timestamp.format("%H:%M:%S"))
            }
            WatchEventKind::Test { event, .. } => self.write_test_event(event),
            WatchEventKind::RunFinished {
                run_id,
                outcome,
                results,
                counts,
                elapsed,
            } => self.write_run_finished(*run_id, outcome, results, *counts, *elapsed),
            WatchEventKind::Error { error } => self.write_error(error),
            WatchEventKind::ShuttingDown { reason } => {
                writeln!(
                    self.writer,
                    "{:>12} ({})",
                    "Stopping".style(self.styles.skip),
                    shutdown_reason_str(*reason),
                )
            }
        }
    }

    fn write_test_event(&mut self, event: &TestEvent) -> io::Result<()> {
        match event.action {
            TestAction::Run => Ok(()),
            TestAction::Output => {
                if self.verbose {
                    if let Some(output) = &event.output {
                        writeln!(self.writer, "{output}")?;
                    }
                }
                Ok(())
            }
            TestAction::Pass => self.write_test_line("PASS", self.styles.pass, event),
            TestAction::Fail => self.write_test_line("FAIL", self.styles.fail, event),
            TestAction::Skip => self.write_test_line("SKIP", self.styles.skip, event),
        }
    }

    /// Writes the status line for one finished test. Package-level terminal
    /// events are folded into the run summary instead.
    fn write_test_line(&mut self, word: &str, style: Style, event: &TestEvent) -> io::Result<()> {
        let Some(test) = event.test.as_deref() else {
            return Ok(());
        };
        write!(self.writer, "{:>12} ", word.style(style))?;
        self.write_duration(event.elapsed)?;
        let package = display_package(&event.package);
        writeln!(self.writer, "{package} {test}")
    }

    fn write_run_finished(
        &mut self,
        run_id: u64,
        outcome: &RunOutcome,
        results: &ResultNode,
        counts: RunCounts,
        elapsed: Duration,
    ) -> io::Result<()> {
        match outcome {
            RunOutcome::Exited { .. } => {
                let summary_style = if counts.has_failures() {
                    self.styles.fail
                } else {
                    self.styles.pass
                };
                write!(self.writer, "{:>12} ", "Summary".style(summary_style))?;
                self.write_elapsed(elapsed)?;
                writeln!(
                    self.writer,
                    "run {}: {} {} run: {counts}",
                    format!("#{run_id}").style(self.styles.count),
                    counts.total.style(self.styles.count),
                    tests_str(counts.total),
                )?;
            }
            RunOutcome::TimedOut { after } => {
                write!(self.writer, "{:>12} ", "Timed out".style(self.styles.fail))?;
                self.write_elapsed(elapsed)?;
                write!(
                    self.writer,
                    "run {}: terminated after {}",
                    format!("#{run_id}").style(self.styles.count),
                    humantime::format_duration(*after),
                )?;
                if counts.total > 0 {
                    write!(self.writer, "; {counts}")?;
                }
                writeln!(self.writer)?;
            }
            RunOutcome::Canceled { reason } => {
                write!(self.writer, "{:>12} ", "Canceled".style(self.styles.skip))?;
                self.write_elapsed(elapsed)?;
                write!(
                    self.writer,
                    "run {} ({})",
                    format!("#{run_id}").style(self.styles.count),
                    cancel_reason_str(*reason),
                )?;
                if counts.total > 0 {
                    write!(self.writer, "; {counts}")?;
                }
                writeln!(self.writer)?;
            }
            RunOutcome::Failed { error } => {
                write!(self.writer, "{:>12} ", "Failed".style(self.styles.fail))?;
                self.write_elapsed(elapsed)?;
                writeln!(
                    self.writer,
                    "run {}: {}",
                    format!("#{run_id}").style(self.styles.count),
                    DisplayErrorChain::new(error),
                )?;
            }
        }

        self.write_tree(results, 0, !self.verbose)
    }

    /// Renders the result tree below a summary line. With `only_failures`,
    /// subtrees without a failed node are skipped entirely.
    fn write_tree(
        &mut self,
        node: &ResultNode,
        depth: usize,
        only_failures: bool,
    ) -> io::Result<()> {
        for child in node.children.values() {
            if only_failures && !subtree_failed(child) {
                continue;
            }
            let indent = 2 + depth * 2;
            let name = display_package(&child.name);
            write!(self.writer, "{:indent$}{name}: ", "")?;
            write!(
                self.writer,
                "{}",
                child.status.as_str().style(self.status_style(child.status)),
            )?;
            if let Some(elapsed) = child.elapsed {
                write!(self.writer, " ({:.3}s)", elapsed.as_secs_f64())?;
            }
            writeln!(self.writer)?;
            if child.status == NodeStatus::Failed {
                if let Some(error) = &child.error {
                    let message_indent = indent + 2;
                    writeln!(
                        self.writer,
                        "{:message_indent$}{}",
                        "",
                        error.message.style(self.styles.fail_output),
                    )?;
                }
            }
            self.write_tree(child, depth + 1, only_failures)?;
        }
        Ok(())
    }

    fn write_error(&mut self, error: &WatchError) -> io::Result<()> {
        writeln!(
            self.writer,
            "{:>12} {}",
            "Error".style(self.styles.fail),
            DisplayErrorChain::new(error),
        )?;
        if let WatchError::CommandFailed { stderr, .. } = error {
            for line in stderr.lines() {
                writeln!(self.writer, "             {}", line.style(self.styles.fail_output))?;
            }
        }
        Ok(())
    }

    fn write_duration(&mut self, duration: Option<Duration>) -> io::Result<()> {
        match duration {
            // * > means right-align.
            // * 8 is the number of characters to pad to.
            // * .3 means print three digits after the decimal point.
            Some(duration) => write!(self.writer, "[{:>8.3?}s] ", duration.as_secs_f64()),
            None => write!(self.writer, "[{:>9}] ", "-"),
        }
    }

    fn write_elapsed(&mut self, elapsed: Duration) -> io::Result<()> {
        write!(self.writer, "[{:>8.3?}s] ", elapsed.as_secs_f64())
    }

    fn status_style(&self, status: NodeStatus) -> Style {
        match status {
            NodeStatus::Running => self.styles.running,
            NodeStatus::Passed => self.styles.pass,
            NodeStatus::Failed => self.styles.fail,
            NodeStatus::Skipped => self.styles.skip,
        }
    }
}

/// Text-fallback events whose package summary never arrived carry an empty
/// package name.
fn display_package(package: &str) -> &str {
    if package.is_empty() { "?" } else { package }
}

fn subtree_failed(node: &ResultNode) -> bool {
    node.status == NodeStatus::Failed || node.children.values().any(subtree_failed)
}

fn tests_str(count: usize) -> &'static str {
    if count == 1 { "test" } else { "tests" }
}

fn cancel_reason_str(reason: CancelReason) -> &'static str {
    match reason {
        CancelReason::Superseded => "superseded",
        CancelReason::Shutdown => "shutdown",
    }
}

fn shutdown_reason_str(reason: ShutdownReason) -> &'static str {
    match reason {
        ShutdownReason::Signal => "signal",
        ShutdownReason::Requested => "requested",
        ShutdownReason::WatcherClosed => "watcher closed",
    }
}

#[derive(Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    skip: Style,
    running: Style,
    fail_output: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
        self.running = Style::new().magenta().bold();
        self.fail_output = Style::new().magenta();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Color;
    use camino::Utf8PathBuf;
    use chrono::DateTime;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use vigil_runner::aggregate::ResultAggregator;

    fn render(events: &[WatchEvent], verbose: bool) -> String {
        let output = OutputContext {
            verbose,
            color: Color::Never,
        };
        let mut reporter = Reporter::new(output, Vec::new());
        for event in events {
            reporter.report_event(event).unwrap();
        }
        String::from_utf8(reporter.writer).unwrap()
    }

    fn at(time: &str, kind: WatchEventKind) -> WatchEvent {
        WatchEvent {
            timestamp: DateTime::parse_from_rfc3339(&format!("2026-02-03T{time}+00:00")).unwrap(),
            kind,
        }
    }

    fn test_event(
        action: TestAction,
        package: &str,
        test: Option<&str>,
        elapsed_ms: Option<u64>,
    ) -> TestEvent {
        TestEvent {
            timestamp: None,
            action,
            package: package.to_owned(),
            test: test.map(str::to_owned),
            output: None,
            elapsed: elapsed_ms.map(Duration::from_millis),
        }
    }

    fn output_event(package: &str, test: Option<&str>, line: &str) -> TestEvent {
        TestEvent {
            output: Some(line.to_owned()),
            ..test_event(TestAction::Output, package, test, None)
        }
    }

    /// The events of a run with one passing and one failing test, the way
    /// the watch loop publishes them.
    fn failing_run_events() -> Vec<TestEvent> {
        vec![
            test_event(TestAction::Run, "example.com/demo", Some("TestA"), None),
            test_event(TestAction::Pass, "example.com/demo", Some("TestA"), Some(10)),
            test_event(TestAction::Run, "example.com/demo", Some("TestB"), None),
            output_event(
                "example.com/demo",
                Some("TestB"),
                "    some failure at file.go:42",
            ),
            test_event(TestAction::Fail, "example.com/demo", Some("TestB"), Some(20)),
            test_event(TestAction::Fail, "example.com/demo", None, Some(35)),
        ]
    }

    fn aggregate(events: &[TestEvent]) -> ResultNode {
        let mut aggregator = ResultAggregator::new();
        for event in events {
            aggregator.record(event);
        }
        aggregator.finish()
    }

    #[test]
    fn lifecycle_lines_are_verb_aligned() {
        let events = vec![
            at(
                "14:02:10",
                WatchEventKind::WatchStarted {
                    root: Utf8PathBuf::from("demos/app"),
                },
            ),
            at(
                "14:02:11",
                WatchEventKind::RunStarted {
                    run_id: 1,
                    trigger: RunTrigger::Startup,
                },
            ),
            at(
                "14:02:30",
                WatchEventKind::RunStarted {
                    run_id: 2,
                    trigger: RunTrigger::FileChange {
                        key: "./parser".to_owned(),
                        path: Utf8PathBuf::from("parser/lex.go"),
                    },
                },
            ),
            at(
                "14:02:45",
                WatchEventKind::ShuttingDown {
                    reason: ShutdownReason::Signal,
                },
            ),
        ];

        assert_eq!(
            render(&events, false),
            indoc! {"
                    Watching demos/app
                    Starting run #1 (startup) at 14:02:11
                    Starting run #2 (./parser: parser/lex.go changed) at 14:02:30
                    Stopping (signal)
            "}
        );
    }

    #[test]
    fn file_changes_only_appear_when_verbose() {
        let events = vec![at(
            "14:02:29",
            WatchEventKind::FileChanged {
                path: Utf8PathBuf::from("parser/lex.go"),
                kind: vigil_runner::watcher::FileChangeKind::Modified,
            },
        )];

        assert_eq!(render(&events, false), "");
        assert_eq!(
            render(&events, true),
            "     Changed parser/lex.go (modified)\n"
        );
    }

    #[test]
    fn terminal_test_events_stream_as_status_lines() {
        let events: Vec<WatchEvent> = failing_run_events()
            .into_iter()
            .map(|event| at("14:02:12", WatchEventKind::Test { run_id: 1, event }))
            .collect();

        // Run and output events stay silent without --verbose, and the
        // package-level terminal event folds into the summary.
        assert_eq!(
            render(&events, false),
            indoc! {"
                        PASS [   0.010s] example.com/demo TestA
                        FAIL [   0.020s] example.com/demo TestB
            "}
        );
    }

    #[test]
    fn verbose_streams_output_lines() {
        let events = vec![at(
            "14:02:12",
            WatchEventKind::Test {
                run_id: 1,
                event: output_event("example.com/demo", Some("TestB"), "    file.go:42: boom"),
            },
        )];

        assert_eq!(render(&events, true), "    file.go:42: boom\n");
    }

    #[test]
    fn failed_run_summary_shows_failing_subtree() {
        let results = aggregate(&failing_run_events());
        let counts = results.counts();
        let events = vec![at(
            "14:02:13",
            WatchEventKind::RunFinished {
                run_id: 1,
                outcome: RunOutcome::Exited { code: Some(1) },
                results,
                counts,
                elapsed: Duration::from_millis(35),
            },
        )];

        assert_eq!(
            render(&events, false),
            indoc! {"
                     Summary [   0.035s] run #1: 2 tests run: 1 passed, 1 failed, 0 skipped
                  example.com/demo: failed (0.035s)
                    TestB: failed (0.020s)
                      some failure at file.go:42
            "}
        );
    }

    #[test]
    fn verbose_summary_shows_the_whole_tree() {
        let results = aggregate(&failing_run_events());
        let counts = results.counts();
        let events = vec![at(
            "14:02:13",
            WatchEventKind::RunFinished {
                run_id: 1,
                outcome: RunOutcome::Exited { code: Some(1) },
                results,
                counts,
                elapsed: Duration::from_millis(35),
            },
        )];

        assert_eq!(
            render(&events, true),
            indoc! {"
                     Summary [   0.035s] run #1: 2 tests run: 1 passed, 1 failed, 0 skipped
                  example.com/demo: failed (0.035s)
                    TestA: passed (0.010s)
                    TestB: failed (0.020s)
                      some failure at file.go:42
            "}
        );
    }

    #[test]
    fn passing_run_summary_is_a_single_line() {
        let results = aggregate(&[
            test_event(TestAction::Pass, "example.com/demo", Some("TestA"), Some(10)),
            test_event(TestAction::Pass, "example.com/demo", None, Some(12)),
        ]);
        let counts = results.counts();
        let events = vec![at(
            "14:02:13",
            WatchEventKind::RunFinished {
                run_id: 3,
                outcome: RunOutcome::Exited { code: Some(0) },
                results,
                counts,
                elapsed: Duration::from_millis(12),
            },
        )];

        assert_eq!(
            render(&events, false),
            "     Summary [   0.012s] run #3: 1 test run: 1 passed, 0 failed, 0 skipped\n"
        );
    }

    #[test]
    fn canceled_run_reports_reason_and_unresolved_counts() {
        let results = aggregate(&[test_event(
            TestAction::Run,
            "example.com/demo",
            Some("TestSlow"),
            None,
        )]);
        let counts = results.counts();
        let events = vec![at(
            "14:02:14",
            WatchEventKind::RunFinished {
                run_id: 2,
                outcome: RunOutcome::Canceled {
                    reason: CancelReason::Superseded,
                },
                results,
                counts,
                elapsed: Duration::from_millis(812),
            },
        )];

        assert_eq!(
            render(&events, false),
            "    Canceled [   0.812s] run #2 (superseded); 0 passed, 0 failed, 0 skipped, 1 unresolved\n"
        );
    }

    #[test]
    fn timed_out_run_reports_the_deadline() {
        let events = vec![at(
            "14:07:13",
            WatchEventKind::RunFinished {
                run_id: 4,
                outcome: RunOutcome::TimedOut {
                    after: Duration::from_secs(300),
                },
                results: ResultNode::empty_root(),
                counts: RunCounts::default(),
                elapsed: Duration::from_secs(300),
            },
        )];

        assert_eq!(
            render(&events, false),
            "   Timed out [ 300.000s] run #4: terminated after 5m\n"
        );
    }

    #[test]
    fn command_failure_lists_captured_stderr() {
        let events = vec![at(
            "14:02:13",
            WatchEventKind::Error {
                error: WatchError::CommandFailed {
                    command: "go test -json ./...".to_owned(),
                    code: Some(2),
                    stderr: "main.go:3:1: undefined: fmt.Pritnln".to_owned(),
                },
            },
        )];

        assert_eq!(
            render(&events, false),
            indoc! {"
                       Error test command `go test -json ./...` exited with code 2
                             main.go:3:1: undefined: fmt.Pritnln
            "}
        );
    }
}
