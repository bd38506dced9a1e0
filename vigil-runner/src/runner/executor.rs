// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution of a single test run.
//!
//! Each run is one spawned task that owns the child process, the streaming
//! parser, and the result aggregator. Parsed test events are forwarded to
//! the dispatcher as they appear; the completed result tree travels back
//! through the task's return value.

use crate::{
    aggregate::{ResultAggregator, ResultNode},
    config::{ParserMode, TestCommand},
    errors::{ChildError, WatchError},
    events::{CancelReason, RunOutcome, RunRequest, TestEvent},
    parser::StreamParser,
    process::{OutputBuffers, TestProcess},
    stopwatch::stopwatch,
};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Everything the dispatcher learns when a run ends.
#[derive(Debug)]
pub(super) struct RunCompletion {
    pub(super) run_id: u64,
    pub(super) outcome: RunOutcome,
    pub(super) results: ResultNode,
    pub(super) elapsed: Duration,

    /// Set when the command exited unsuccessfully without reporting any
    /// tests, which usually means a build error or a bad command line.
    pub(super) command_error: Option<WatchError>,
}

/// A handle to an in-flight run.
pub(super) struct RunHandle {
    pub(super) run_id: u64,
    pub(super) task: JoinHandle<RunCompletion>,
    cancel_tx: Option<oneshot::Sender<CancelReason>>,
}

impl RunHandle {
    /// Asks the run to stop. Idempotent; the first reason wins.
    pub(super) fn cancel(&mut self, reason: CancelReason) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(reason);
        }
    }
}

/// Starts one run as a task and returns a handle to it.
pub(super) fn spawn_run(
    run_id: u64,
    request: RunRequest,
    command: TestCommand,
    parser_mode: ParserMode,
    terminate_grace: Duration,
    events_tx: mpsc::UnboundedSender<(u64, TestEvent)>,
) -> RunHandle {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let task = tokio::spawn(execute_run(
        run_id,
        request,
        command,
        parser_mode,
        terminate_grace,
        events_tx,
        cancel_rx,
    ));
    RunHandle {
        run_id,
        task,
        cancel_tx: Some(cancel_tx),
    }
}

async fn execute_run(
    run_id: u64,
    request: RunRequest,
    command: TestCommand,
    parser_mode: ParserMode,
    terminate_grace: Duration,
    events_tx: mpsc::UnboundedSender<(u64, TestEvent)>,
    mut cancel_rx: oneshot::Receiver<CancelReason>,
) -> RunCompletion {
    let stopwatch = stopwatch();
    let mut parser = StreamParser::new(parser_mode);
    let mut aggregator = ResultAggregator::new();
    let mut buffers = OutputBuffers::new();

    let mut process =
        match TestProcess::spawn(&command, &request.target, request.test_filter.as_deref()) {
            Ok(process) => process,
            Err(error) => {
                warn!(run_id, %error, "failed to start test command");
                return RunCompletion {
                    run_id,
                    outcome: RunOutcome::Failed { error },
                    results: aggregator.finish(),
                    elapsed: stopwatch.elapsed(),
                    command_error: None,
                };
            }
        };
    debug!(run_id, command = %process.command_line(), "test command started");

    let timeout = tokio::time::sleep(request.timeout);
    tokio::pin!(timeout);
    let mut canceled: Option<CancelReason> = None;
    let mut timed_out = false;
    let mut read_error: Option<ChildError> = None;

    // Drain both streams to end-of-file even after a cancel or timeout, so
    // the exit status can be collected and no buffered output is lost.
    while !process.output_done() {
        tokio::select! {
            reason = &mut cancel_rx, if canceled.is_none() && !timed_out => {
                // A dropped sender means the dispatcher is gone; treat it
                // like a shutdown cancel.
                let reason = reason.unwrap_or(CancelReason::Shutdown);
                debug!(run_id, reason = reason.to_static_str(), "canceling run");
                canceled = Some(reason);
                process.terminate(terminate_grace).await;
            }
            () = &mut timeout, if canceled.is_none() && !timed_out => {
                debug!(run_id, after = ?request.timeout, "run deadline hit");
                timed_out = true;
                process.terminate(terminate_grace).await;
            }
            res = process.fill_buf(&mut buffers) => {
                if let Err(error) = res {
                    // The failing stream is fused, so the loop still ends.
                    read_error.get_or_insert(error);
                    continue;
                }
                let chunk = buffers.stdout.split();
                if !chunk.is_empty() {
                    for event in parser.feed_chunk(&chunk) {
                        aggregator.record(&event);
                        let _ = events_tx.send((run_id, event));
                    }
                }
            }
        }
    }

    for event in parser.finish() {
        aggregator.record(&event);
        let _ = events_tx.send((run_id, event));
    }

    let status = process.wait().await;
    let results = aggregator.finish();
    let elapsed = stopwatch.elapsed();

    let outcome = if let Some(reason) = canceled {
        RunOutcome::Canceled { reason }
    } else if timed_out {
        RunOutcome::TimedOut {
            after: request.timeout,
        }
    } else if let Some(error) = read_error {
        RunOutcome::Failed { error }
    } else {
        match status {
            Ok(status) => RunOutcome::Exited {
                code: status.code(),
            },
            Err(error) => RunOutcome::Failed { error },
        }
    };

    let command_error =
        command_error_for(&outcome, &results, process.command_line(), &buffers.stderr);
    debug!(run_id, ?outcome, ?elapsed, "run finished");

    RunCompletion {
        run_id,
        outcome,
        results,
        elapsed,
        command_error,
    }
}

/// Classifies an unsuccessful exit. Exit code 1 with parsed results is the
/// ordinary tests-failed status and lives in the result tree; anything else
/// non-zero (or code 1 with an empty tree) is a command-level failure.
fn command_error_for(
    outcome: &RunOutcome,
    results: &ResultNode,
    command_line: &str,
    stderr: &[u8],
) -> Option<WatchError> {
    let RunOutcome::Exited { code } = outcome else {
        return None;
    };
    let command_failed = match code {
        Some(0) => false,
        Some(1) => results.is_empty(),
        _ => true,
    };
    command_failed.then(|| WatchError::CommandFailed {
        command: command_line.to_owned(),
        code: *code,
        stderr: String::from_utf8_lossy(stderr).trim_end().to_owned(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{aggregate::NodeStatus, events::RunTrigger};
    use camino::Utf8PathBuf;
    use pretty_assertions::assert_eq;

    fn shell(script: &str) -> TestCommand {
        TestCommand {
            program: "/bin/sh".to_owned(),
            args: vec!["-c".to_owned(), script.to_owned()],
            cwd: Utf8PathBuf::from("."),
        }
    }

    fn request(timeout: Duration) -> RunRequest {
        RunRequest {
            target: "./...".to_owned(),
            test_filter: None,
            timeout,
            trigger: RunTrigger::Startup,
        }
    }

    fn start(
        run_id: u64,
        script: &str,
        timeout: Duration,
    ) -> (RunHandle, mpsc::UnboundedReceiver<(u64, TestEvent)>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = spawn_run(
            run_id,
            request(timeout),
            shell(script),
            ParserMode::Auto,
            Duration::from_millis(200),
            events_tx,
        );
        (handle, events_rx)
    }

    fn drain(events_rx: &mut mpsc::UnboundedReceiver<(u64, TestEvent)>) -> Vec<TestEvent> {
        let mut events = Vec::new();
        while let Ok((_, event)) = events_rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn protocol_run_streams_events_and_builds_tree() {
        let script = r#"
            echo '{"Action":"run","Package":"example.com/demo","Test":"TestOne"}'
            echo '{"Action":"pass","Package":"example.com/demo","Test":"TestOne","Elapsed":0.01}'
            echo '{"Action":"pass","Package":"example.com/demo","Elapsed":0.02}'
        "#;
        let (handle, mut events_rx) = start(7, script, Duration::from_secs(30));

        let completion = handle.task.await.unwrap();
        let events = drain(&mut events_rx);

        assert!(matches!(completion.outcome, RunOutcome::Exited { code: Some(0) }));
        assert_eq!(completion.run_id, 7);
        assert!(completion.command_error.is_none());
        assert_eq!(events.len(), 3);

        let package = &completion.results.children["example.com/demo"];
        assert_eq!(package.children["TestOne"].status, NodeStatus::Passed);
        let counts = completion.results.counts();
        assert_eq!((counts.total, counts.passed), (1, 1));
    }

    #[tokio::test]
    async fn exit_one_with_results_is_a_test_failure() {
        let script = r#"
            echo '{"Action":"run","Package":"p","Test":"TestBad"}'
            echo '{"Action":"fail","Package":"p","Test":"TestBad","Elapsed":0.01}'
            echo '{"Action":"fail","Package":"p","Elapsed":0.01}'
            exit 1
        "#;
        let (handle, _events_rx) = start(1, script, Duration::from_secs(30));

        let completion = handle.task.await.unwrap();

        assert!(matches!(completion.outcome, RunOutcome::Exited { code: Some(1) }));
        assert!(
            completion.command_error.is_none(),
            "a failing test is not a command failure"
        );
        assert_eq!(
            completion.results.children["p"].children["TestBad"].status,
            NodeStatus::Failed
        );
    }

    #[tokio::test]
    async fn unsuccessful_exit_without_results_reports_command_error() {
        let script = "echo 'main.go:3:8: undefined: fmt.Pritnln' 1>&2; exit 2";
        let (handle, _events_rx) = start(1, script, Duration::from_secs(30));

        let completion = handle.task.await.unwrap();

        assert!(matches!(completion.outcome, RunOutcome::Exited { code: Some(2) }));
        assert!(completion.results.is_empty());
        match completion.command_error {
            Some(WatchError::CommandFailed { code, stderr, .. }) => {
                assert_eq!(code, Some(2));
                assert!(stderr.contains("undefined: fmt.Pritnln"), "stderr: {stderr}");
            }
            other => panic!("expected a command failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_terminates_and_keeps_partial_tree() {
        let script = r#"
            echo '{"Action":"run","Package":"p","Test":"TestSlow"}'
            sleep 30
        "#;
        let (mut handle, mut events_rx) = start(1, script, Duration::from_secs(60));

        // Wait for the run to be visibly underway before canceling.
        let first = tokio::time::timeout(Duration::from_secs(10), events_rx.recv())
            .await
            .expect("first event should arrive")
            .expect("channel open");
        assert_eq!(first.1.test.as_deref(), Some("TestSlow"));

        let started = std::time::Instant::now();
        handle.cancel(CancelReason::Superseded);
        let completion = handle.task.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            completion.outcome,
            RunOutcome::Canceled { reason: CancelReason::Superseded }
        ));
        assert_eq!(
            completion.results.children["p"].children["TestSlow"].status,
            NodeStatus::Running
        );
    }

    #[tokio::test]
    async fn deadline_times_the_run_out() {
        let (handle, _events_rx) = start(1, "sleep 30", Duration::from_millis(300));

        let started = std::time::Instant::now();
        let completion = handle.task.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            completion.outcome,
            RunOutcome::TimedOut { after } if after == Duration::from_millis(300)
        ));
        assert!(completion.command_error.is_none());
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_failed_outcome() {
        let command = TestCommand {
            program: "/nonexistent/for-sure-not-a-binary".to_owned(),
            args: Vec::new(),
            cwd: Utf8PathBuf::from("."),
        };
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let handle = spawn_run(
            1,
            request(Duration::from_secs(5)),
            command,
            ParserMode::Auto,
            Duration::from_millis(200),
            events_tx,
        );

        let completion = handle.task.await.unwrap();

        assert!(matches!(
            completion.outcome,
            RunOutcome::Failed { error: ChildError::Spawn { .. } }
        ));
        assert!(completion.results.is_empty());
        assert!(completion.command_error.is_none());
    }
}
