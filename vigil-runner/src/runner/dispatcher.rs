// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The watch loop.
//!
//! One dispatcher task owns every input source: filesystem changes,
//! debounce firings, parsed test events, run completions, OS signals, and
//! stop requests. It is also the only caller of the consumer callback, so
//! published events arrive strictly in order. At most one run is in flight
//! at a time; a newer trigger cancels the active run and waits for it to
//! wind down before its replacement starts, so a superseded run's partial
//! results are never published after its successor's.

use super::{
    executor::{self, RunCompletion, RunHandle},
    hooks::{HookOutcome, ShutdownHooks, panic_payload_to_string},
};
use crate::{
    config::{RunScope, TestCommand, WatchConfig},
    debounce::Debouncer,
    errors::{WatchError, WatchSetupError},
    events::{
        CancelReason, RunRequest, RunTrigger, ShutdownReason, TestEvent, WatchEvent,
        WatchEventKind,
    },
    signal::{SignalHandler, SignalHandlerKind},
    watcher::{FileChangeEvent, FileWatcher, WatchFilter},
};
use camino::Utf8Path;
use futures::future::OptionFuture;
use tokio::{sync::mpsc, task::JoinError};
use tracing::{debug, warn};

/// Builder for [`WatchRunner`].
#[derive(Debug)]
pub struct WatchRunnerBuilder {
    config: WatchConfig,
}

impl WatchRunnerBuilder {
    /// Creates a builder from resolved configuration.
    pub fn new(config: WatchConfig) -> Self {
        Self { config }
    }

    /// Validates the configuration and creates the runner, along with the
    /// Tokio runtime it executes on.
    pub fn build(self, signal_handler: SignalHandlerKind) -> Result<WatchRunner, WatchSetupError> {
        let command = self
            .config
            .test_command()
            .map_err(|error| WatchSetupError::Command { error })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("vigil-watch-worker")
            .build()
            .map_err(|error| WatchSetupError::TokioRuntimeCreate { error })?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = signal_handler
            .build()
            .map_err(|error| WatchSetupError::SignalHandler { error })?;

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        Ok(WatchRunner {
            config: self.config,
            command,
            runtime,
            signal_handler,
            hooks: ShutdownHooks::new(),
            stop_tx,
            stop_rx,
        })
    }
}

/// The watch loop. Created with [`WatchRunnerBuilder::build`].
#[derive(Debug)]
pub struct WatchRunner {
    config: WatchConfig,
    command: TestCommand,
    runtime: tokio::runtime::Runtime,
    signal_handler: SignalHandler,
    hooks: ShutdownHooks,
    stop_tx: mpsc::UnboundedSender<()>,
    stop_rx: mpsc::UnboundedReceiver<()>,
}

impl WatchRunner {
    /// Returns a handle other threads can use to stop the watch loop.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Returns the shutdown hook registry for this runner.
    pub fn shutdown_hooks(&self) -> ShutdownHooks {
        self.hooks.clone()
    }

    /// Watches the configured root and runs tests until an OS signal, a
    /// [`StopHandle::stop`] call, or the change stream closing ends the
    /// loop.
    ///
    /// The callback observes every published [`WatchEvent`], in order, one
    /// at a time. Returns once shutdown, including all shutdown hooks, has
    /// completed.
    pub fn watch<F>(self, callback: F) -> Result<ShutdownReport, WatchSetupError>
    where
        F: FnMut(WatchEvent) + Send,
    {
        let Self {
            config,
            command,
            runtime,
            signal_handler,
            hooks,
            stop_tx,
            stop_rx,
        } = self;
        // Only external stop handles keep the stop channel open.
        drop(stop_tx);

        let result = runtime.block_on(async {
            let filter = WatchFilter::new(&config);
            let watcher = FileWatcher::new(&config.root, filter)
                .map_err(|error| WatchSetupError::Watcher { error })?;

            let (run_tx, run_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let debouncer = Debouncer::new(config.debounce);
            let mut cx = DispatcherContext {
                callback,
                config,
                command,
                hooks,
                debouncer,
                run_tx,
                events_tx,
                next_run_id: 1,
            };
            Ok(cx
                .run(watcher, signal_handler, run_rx, events_rx, stop_rx)
                .await)
        });

        // Abandoned hook tasks and child I/O must not keep the process
        // stuck; drop the runtime without waiting for them.
        runtime.shutdown_background();
        result
    }
}

/// Requests that the watch loop stop.
///
/// Cheap to clone and safe to use from any thread. Stopping an
/// already-stopped loop is a no-op.
#[derive(Clone, Debug)]
pub struct StopHandle {
    stop_tx: mpsc::UnboundedSender<()>,
}

impl StopHandle {
    /// Asks the watch loop to begin shutdown.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// What [`WatchRunner::watch`] reports when the loop exits.
#[derive(Debug)]
pub struct ShutdownReport {
    /// Why the loop exited.
    pub reason: ShutdownReason,

    /// Per-hook results, in execution order.
    pub hook_outcomes: Vec<HookOutcome>,
}

impl ShutdownReport {
    /// Returns true if every shutdown hook completed cleanly.
    pub fn is_clean(&self) -> bool {
        self.hook_outcomes.iter().all(HookOutcome::is_ok)
    }
}

/// One unit of work for the dispatcher, normalized from whichever input
/// source produced it.
enum InternalEvent {
    Change(FileChangeEvent),
    WatchError(WatchError),
    WatcherClosed,
    Request(RunRequest),
    Test { run_id: u64, event: TestEvent },
    RunJoined(Result<RunCompletion, JoinError>),
    Signal,
    Stop,
}

struct DispatcherContext<F> {
    callback: F,
    config: WatchConfig,
    command: TestCommand,
    hooks: ShutdownHooks,
    debouncer: Debouncer,
    run_tx: mpsc::UnboundedSender<RunRequest>,
    events_tx: mpsc::UnboundedSender<(u64, TestEvent)>,
    next_run_id: u64,
}

impl<F> DispatcherContext<F>
where
    F: FnMut(WatchEvent) + Send,
{
    async fn run(
        &mut self,
        mut watcher: FileWatcher,
        mut signal_handler: SignalHandler,
        mut run_rx: mpsc::UnboundedReceiver<RunRequest>,
        mut events_rx: mpsc::UnboundedReceiver<(u64, TestEvent)>,
        mut stop_rx: mpsc::UnboundedReceiver<()>,
    ) -> ShutdownReport {
        debug!(root = %watcher.root(), "watching for changes");
        self.publish(WatchEvent::now(WatchEventKind::WatchStarted {
            root: watcher.root().to_owned(),
        }));

        let mut current: Option<RunHandle> = None;
        let mut signals_done = false;
        let mut stop_done = false;

        if self.config.run_on_start {
            let request = self.startup_request();
            self.start_run(&mut current, request);
        }

        let reason = loop {
            let internal_event = tokio::select! {
                change = watcher.next_change() => {
                    match change {
                        Some(Ok(change)) => InternalEvent::Change(change),
                        Some(Err(error)) => InternalEvent::WatchError(error),
                        None => InternalEvent::WatcherClosed,
                    }
                }
                request = run_rx.recv() => {
                    match request {
                        Some(request) => InternalEvent::Request(request),
                        // A sender lives in self, so the channel cannot
                        // close.
                        None => continue,
                    }
                }
                event = events_rx.recv() => {
                    match event {
                        Some((run_id, event)) => InternalEvent::Test { run_id, event },
                        None => continue,
                    }
                }
                joined = OptionFuture::from(current.as_mut().map(|handle| &mut handle.task)),
                    if current.is_some() =>
                {
                    match joined {
                        Some(result) => InternalEvent::RunJoined(result),
                        None => continue,
                    }
                }
                signal = signal_handler.recv(), if !signals_done => {
                    match signal {
                        Some(signal) => {
                            debug!(?signal, "received shutdown signal");
                            InternalEvent::Signal
                        }
                        None => {
                            signals_done = true;
                            continue;
                        }
                    }
                }
                stop = stop_rx.recv(), if !stop_done => {
                    match stop {
                        Some(()) => InternalEvent::Stop,
                        None => {
                            stop_done = true;
                            continue;
                        }
                    }
                }
            };

            match internal_event {
                InternalEvent::Change(change) => {
                    self.handle_change(change, watcher.root()).await;
                }
                InternalEvent::WatchError(error) => self.publish_error(error),
                InternalEvent::WatcherClosed => {
                    warn!("file change stream ended");
                    break ShutdownReason::WatcherClosed;
                }
                InternalEvent::Request(request) => {
                    self.handle_request(&mut current, &mut events_rx, request).await;
                }
                InternalEvent::Test { run_id, event } => self.publish_test(run_id, event),
                InternalEvent::RunJoined(result) => {
                    current = None;
                    self.finish_run(result, &mut events_rx);
                }
                InternalEvent::Signal => break ShutdownReason::Signal,
                InternalEvent::Stop => break ShutdownReason::Requested,
            }
        };

        self.shutdown(reason, current, watcher, &mut events_rx).await
    }

    /// Publishes the change and (re)arms the debouncer for its key.
    async fn handle_change(&mut self, change: FileChangeEvent, root: &Utf8Path) {
        let target = run_target(self.config.scope, root, &change.path);
        debug!(path = %change.path, kind = %change.kind, key = %target, "file change");
        self.publish(WatchEvent::file_changed(&change));

        let request = RunRequest {
            target: target.clone(),
            test_filter: self.config.test_filter.clone(),
            timeout: self.config.run_timeout,
            trigger: RunTrigger::FileChange {
                key: target.clone(),
                path: change.path,
            },
        };
        let run_tx = self.run_tx.clone();
        self.debouncer
            .trigger(target, move || {
                let _ = run_tx.send(request);
            })
            .await;
    }

    /// Starts the requested run, superseding the active one if any.
    async fn handle_request(
        &mut self,
        current: &mut Option<RunHandle>,
        events_rx: &mut mpsc::UnboundedReceiver<(u64, TestEvent)>,
        request: RunRequest,
    ) {
        if let Some(mut handle) = current.take() {
            debug!(run_id = handle.run_id, "superseding active run");
            handle.cancel(CancelReason::Superseded);
            let result = handle.task.await;
            self.finish_run(result, events_rx);
        }
        self.start_run(current, request);
    }

    fn start_run(&mut self, current: &mut Option<RunHandle>, request: RunRequest) {
        let run_id = self.next_run_id;
        self.next_run_id += 1;
        debug!(run_id, target = %request.target, "starting test run");
        self.publish(WatchEvent::now(WatchEventKind::RunStarted {
            run_id,
            trigger: request.trigger.clone(),
        }));
        *current = Some(executor::spawn_run(
            run_id,
            request,
            self.command.clone(),
            self.config.parser_mode,
            self.config.terminate_grace,
            self.events_tx.clone(),
        ));
    }

    /// Publishes a completed run: any of its test events still queued
    /// first, so they always precede its `RunFinished` event.
    fn finish_run(
        &mut self,
        result: Result<RunCompletion, JoinError>,
        events_rx: &mut mpsc::UnboundedReceiver<(u64, TestEvent)>,
    ) {
        while let Ok((run_id, event)) = events_rx.try_recv() {
            self.publish_test(run_id, event);
        }

        match result {
            Ok(completion) => {
                let RunCompletion {
                    run_id,
                    outcome,
                    results,
                    elapsed,
                    command_error,
                } = completion;
                debug!(run_id, ?outcome, "run finished");
                let counts = results.counts();
                self.publish(WatchEvent::now(WatchEventKind::RunFinished {
                    run_id,
                    outcome,
                    results,
                    counts,
                    elapsed,
                }));
                if let Some(error) = command_error {
                    self.publish_error(error);
                }
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    panic_payload_to_string(join_error.into_panic())
                } else {
                    join_error.to_string()
                };
                self.publish_error(WatchError::WorkerPanic {
                    worker: "executor",
                    message,
                });
            }
        }
    }

    async fn shutdown(
        &mut self,
        reason: ShutdownReason,
        mut current: Option<RunHandle>,
        watcher: FileWatcher,
        events_rx: &mut mpsc::UnboundedReceiver<(u64, TestEvent)>,
    ) -> ShutdownReport {
        debug!(?reason, "shutting down");
        self.publish(WatchEvent::now(WatchEventKind::ShuttingDown { reason }));
        self.debouncer.clear().await;

        if let Some(mut handle) = current.take() {
            handle.cancel(CancelReason::Shutdown);
            let result = handle.task.await;
            self.finish_run(result, events_rx);
        }
        watcher.close();

        let hook_outcomes = self.hooks.execute(self.config.shutdown_timeout).await;
        ShutdownReport {
            reason,
            hook_outcomes,
        }
    }

    fn startup_request(&self) -> RunRequest {
        RunRequest {
            target: "./...".to_owned(),
            test_filter: self.config.test_filter.clone(),
            timeout: self.config.run_timeout,
            trigger: RunTrigger::Startup,
        }
    }

    fn publish(&mut self, event: WatchEvent) {
        (self.callback)(event);
    }

    fn publish_test(&mut self, run_id: u64, event: TestEvent) {
        self.publish(WatchEvent::now(WatchEventKind::Test { run_id, event }));
    }

    fn publish_error(&mut self, error: WatchError) {
        warn!(%error, "watch error");
        self.publish(WatchEvent::now(WatchEventKind::Error { error }));
    }
}

/// The debounce key and run target for a change. `All` scope coalesces
/// every change into one `./...` run; `Package` scope runs the changed
/// file's containing directory, expressed relative to the watch root
/// since that is the command's working directory.
fn run_target(scope: RunScope, root: &Utf8Path, path: &Utf8Path) -> String {
    match scope {
        RunScope::All => "./...".to_owned(),
        RunScope::Package => {
            let rel = path.strip_prefix(root).unwrap_or(path);
            let dir = rel
                .parent()
                .map(Utf8Path::as_str)
                .filter(|dir| !dir.is_empty())
                .unwrap_or(".");
            format!("./{dir}")
        }
    }
}
