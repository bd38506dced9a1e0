// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Spawning and supervising the external test command.
//!
//! The child runs in its own process group so that termination reaches the
//! whole tree the command spawns, not just the immediate child. Output is
//! drained through fused buffered readers; the exit status is only
//! collected once both streams have hit end-of-file, so no trailing output
//! is lost.

use crate::{config::TestCommand, errors::ChildError};
use bytes::BytesMut;
use std::{io, process::Stdio, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child as TokioChild, ChildStderr, ChildStdout},
};

/// The size of each buffered reader's buffer, and the initial capacity of
/// the output accumulators. The (normal) page size on most systems.
const CHUNK_SIZE: usize = 4 * 1024;

/// A `BufReader` over an `AsyncRead` that tracks whether the stream has
/// ended.
#[derive(Debug)]
struct FusedBufReader<R> {
    reader: BufReader<R>,
    done: bool,
}

impl<R: AsyncRead + Unpin> FusedBufReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(CHUNK_SIZE, reader),
            done: false,
        }
    }

    async fn fill_buf(&mut self, acc: &mut BytesMut) -> Result<(), io::Error> {
        if self.done {
            return Ok(());
        }

        let res = self.reader.fill_buf().await;
        match res {
            Ok(buf) => {
                acc.extend_from_slice(buf);
                if buf.is_empty() {
                    self.done = true;
                }
                let len = buf.len();
                self.reader.consume(len);
                Ok(())
            }
            Err(error) => {
                self.done = true;
                Err(error)
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// A version of [`FusedBufReader::fill_buf`] that works with an
/// `Option<FusedBufReader>`.
async fn fill_buf_opt<R: AsyncRead + Unpin>(
    reader: Option<&mut FusedBufReader<R>>,
    acc: &mut BytesMut,
) -> Result<(), io::Error> {
    if let Some(reader) = reader {
        reader.fill_buf(acc).await
    } else {
        Ok(())
    }
}

/// A version of [`FusedBufReader::is_done`] that works with an
/// `Option<FusedBufReader>`.
fn is_done_opt<R: AsyncRead + Unpin>(reader: &Option<FusedBufReader<R>>) -> bool {
    reader.as_ref().is_none_or(|r| r.is_done())
}

/// The child's output streams.
#[derive(Debug)]
struct ChildStreams {
    stdout: Option<FusedBufReader<ChildStdout>>,
    stderr: Option<FusedBufReader<ChildStderr>>,
}

impl ChildStreams {
    fn new(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> Self {
        Self {
            stdout: stdout.map(FusedBufReader::new),
            stderr: stderr.map(FusedBufReader::new),
        }
    }

    fn is_done(&self) -> bool {
        is_done_opt(&self.stdout) && is_done_opt(&self.stderr)
    }

    /// Appends available data from either stream to `acc`. A single step:
    /// the caller loops until [`is_done`](Self::is_done). Cancel-safe,
    /// since the underlying [`AsyncBufReadExt::fill_buf`] is cancel-safe.
    async fn fill_buf(&mut self, acc: &mut OutputBuffers) -> Result<(), ChildError> {
        let Self { stdout, stderr } = self;
        // Wait until either of these makes progress.
        tokio::select! {
            res = fill_buf_opt(stdout.as_mut(), &mut acc.stdout), if !is_done_opt(stdout) => {
                res.map_err(|error| ChildError::Read { error })
            }
            res = fill_buf_opt(stderr.as_mut(), &mut acc.stderr), if !is_done_opt(stderr) => {
                res.map_err(|error| ChildError::Read { error })
            }
            // If both are done, do nothing.
            else => {
                Ok(())
            }
        }
    }
}

/// Accumulators the caller owns and drains between fill steps.
#[derive(Debug)]
pub(crate) struct OutputBuffers {
    pub(crate) stdout: BytesMut,
    pub(crate) stderr: BytesMut,
}

impl OutputBuffers {
    pub(crate) fn new() -> Self {
        Self {
            stdout: BytesMut::with_capacity(CHUNK_SIZE),
            stderr: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }
}

/// A spawned test command together with its output streams.
#[derive(Debug)]
pub(crate) struct TestProcess {
    child: TokioChild,
    streams: ChildStreams,
    command_line: String,
}

impl TestProcess {
    /// Spawns the command with the given run target and optional test
    /// filter appended, in its own process group, with both output streams
    /// piped and stdin closed.
    pub(crate) fn spawn(
        command: &TestCommand,
        target: &str,
        test_filter: Option<&str>,
    ) -> Result<Self, ChildError> {
        let args = command.args_for(target, test_filter);
        let command_line = shell_words::join(
            std::iter::once(command.program.as_str()).chain(args.iter().map(String::as_str)),
        );

        let mut cmd = std::process::Command::new(&command.program);
        cmd.args(&args)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        imp::cmd_pre_exec(&mut cmd);

        let mut cmd: tokio::process::Command = cmd.into();
        let mut child = cmd.spawn().map_err(|error| ChildError::Spawn {
            command: command_line.clone(),
            error,
        })?;

        let streams = ChildStreams::new(child.stdout.take(), child.stderr.take());
        Ok(Self {
            child,
            streams,
            command_line,
        })
    }

    /// The rendered command line, for logs and error messages.
    pub(crate) fn command_line(&self) -> &str {
        &self.command_line
    }

    /// True once both output streams have reached end-of-file.
    pub(crate) fn output_done(&self) -> bool {
        self.streams.is_done()
    }

    /// One fill step; see [`ChildStreams::fill_buf`].
    pub(crate) async fn fill_buf(&mut self, acc: &mut OutputBuffers) -> Result<(), ChildError> {
        self.streams.fill_buf(acc).await
    }

    /// Collects the exit status. Call after the output is drained.
    pub(crate) async fn wait(&mut self) -> Result<std::process::ExitStatus, ChildError> {
        self.child
            .wait()
            .await
            .map_err(|error| ChildError::Wait { error })
    }

    /// Asks the process group to terminate, escalating to a kill after the
    /// grace period. Returns once the group has been signaled; the caller
    /// still drains output and waits for the exit status.
    pub(crate) async fn terminate(&mut self, grace: Duration) {
        imp::terminate_child(&mut self.child, grace).await;
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use libc::{SIGKILL, SIGTERM};
    use std::os::unix::process::CommandExt;

    /// Pre-execution configuration on Unix: the child gets its own process
    /// group.
    pub(super) fn cmd_pre_exec(cmd: &mut std::process::Command) {
        cmd.process_group(0);
    }

    pub(super) async fn terminate_child(child: &mut TokioChild, grace: Duration) {
        match child.id() {
            Some(pid) => {
                let pid = pid as i32;
                unsafe {
                    // The child was set up as its own process group leader
                    // in cmd_pre_exec -- signal the whole group.
                    libc::kill(-pid, SIGTERM)
                };

                let sleep = tokio::time::sleep(grace);
                tokio::select! {
                    biased;

                    _ = child.wait() => {
                        // The process exited within the grace period.
                    }
                    _ = sleep => {
                        // The process didn't exit -- need to do a hard shutdown.
                        unsafe {
                            // Send SIGKILL to the entire process group.
                            libc::kill(-pid, SIGKILL);
                        }
                    }
                }
            }
            None => {
                // This means that the process has already exited.
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::*;

    pub(super) fn cmd_pre_exec(_cmd: &mut std::process::Command) {
        // TODO: set a process group / job object on Windows so termination
        // reaches grandchildren.
    }

    pub(super) async fn terminate_child(child: &mut TokioChild, _grace: Duration) {
        // There is no graceful termination request on Windows; kill
        // directly.
        let _ = child.start_kill();
    }
}
