// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The plain-text fallback format (`go test -v` without `-json`).
//!
//! Text output carries no package names on its test lines: the package is
//! only learned from the summary line (`ok  <pkg> ...` / `FAIL <pkg> ...`)
//! that follows all of that package's tests. Events are therefore buffered
//! in an insertion-ordered map keyed by test name and flushed, in original
//! line order, when the summary arrives. Stream end flushes whatever is
//! left, so a canceled run still yields its events (with the package left
//! empty when no summary was seen).

use crate::events::{TestAction, TestEvent};
use indexmap::IndexMap;
use std::time::Duration;

#[derive(Debug)]
struct SeqEvent {
    /// Position of the source line within the run; flushes sort by this to
    /// restore original order across tests.
    seq: u64,
    event: TestEvent,
}

/// Streaming parser for the text format. One instance per run.
#[derive(Debug)]
pub(super) struct TextParser {
    /// Buffered events, keyed by test name (empty key for package-level
    /// output), in insertion order.
    pending: IndexMap<String, Vec<SeqEvent>>,

    /// Tests that have started but not finished, innermost last.
    active: Vec<String>,

    /// The most recently finished test; trailing output (coverage lines
    /// and the like) attaches here when nothing is active.
    last_finalized: Option<String>,

    /// The package named by the most recent summary line; used only as the
    /// stream-end fallback for leftover events.
    last_package: Option<String>,

    next_seq: u64,
}

impl TextParser {
    pub(super) fn new() -> Self {
        Self {
            pending: IndexMap::new(),
            active: Vec::new(),
            last_finalized: None,
            last_package: None,
            next_seq: 0,
        }
    }

    /// Classifies one line. Most lines buffer internally and return
    /// nothing; a summary line returns the whole resolved package.
    pub(super) fn feed_line(&mut self, line: &str) -> Vec<TestEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }

        // Whole-run noise: the bare verdict lines and the exit status.
        if line == "PASS" || line == "FAIL" || line.starts_with("exit status") {
            return Vec::new();
        }
        // "?   <pkg> [no test files]" markers carry nothing aggregatable.
        if line.starts_with('?') {
            return Vec::new();
        }

        if let Some((package, action, elapsed)) = parse_summary(line) {
            let mut events = self.flush(&package);
            events.push(TestEvent {
                timestamp: None,
                action,
                package: package.clone(),
                test: None,
                output: None,
                elapsed,
            });
            self.last_package = Some(package);
            return events;
        }

        if let Some(rest) = line.strip_prefix("=== RUN ") {
            let name = rest.trim().to_owned();
            self.buffer(Some(name.clone()), TestAction::Run, None, None);
            self.active.push(name);
            return Vec::new();
        }

        if let Some((action, name, elapsed)) = parse_result_marker(line) {
            self.buffer(Some(name.clone()), action, None, elapsed);
            self.active.retain(|active| active != &name);
            self.last_finalized = Some(name);
            return Vec::new();
        }

        // Anything else is output for the active test, or for the most
        // recently finished one when nothing is active.
        let target = self
            .active
            .last()
            .cloned()
            .or_else(|| self.last_finalized.clone());
        self.buffer(target, TestAction::Output, Some(line.to_owned()), None);
        Vec::new()
    }

    /// Ends the stream: leftover events are flushed against the last known
    /// package, or left unresolved when no summary was ever seen. No
    /// package-level terminal event is fabricated.
    pub(super) fn finish(mut self) -> Vec<TestEvent> {
        let package = self.last_package.clone().unwrap_or_default();
        self.flush(&package)
    }

    fn buffer(
        &mut self,
        test: Option<String>,
        action: TestAction,
        output: Option<String>,
        elapsed: Option<Duration>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = test.clone().unwrap_or_default();
        self.pending.entry(key).or_default().push(SeqEvent {
            seq,
            event: TestEvent {
                timestamp: None,
                action,
                package: String::new(),
                test,
                output,
                elapsed,
            },
        });
    }

    /// Assigns `package` to everything buffered and drains it in original
    /// line order. Resets the per-package state.
    fn flush(&mut self, package: &str) -> Vec<TestEvent> {
        let mut flushed: Vec<SeqEvent> = self
            .pending
            .drain(..)
            .flat_map(|(_, events)| events)
            .collect();
        flushed.sort_by_key(|se| se.seq);
        self.active.clear();
        self.last_finalized = None;
        flushed
            .into_iter()
            .map(|mut se| {
                se.event.package = package.to_owned();
                se.event
            })
            .collect()
    }
}

/// Parses `ok  <pkg> 0.035s` / `FAIL <pkg> [build failed]` summary lines.
fn parse_summary(line: &str) -> Option<(String, TestAction, Option<Duration>)> {
    let mut fields = line.split_whitespace();
    let verdict = fields.next()?;
    let action = match verdict {
        "ok" => TestAction::Pass,
        "FAIL" => TestAction::Fail,
        _ => return None,
    };
    let package = fields.next()?.to_owned();
    let elapsed = fields.find_map(parse_seconds);
    Some((package, action, elapsed))
}

/// Parses `--- PASS: TestA (0.01s)` result markers (already trimmed, so
/// indented subtest markers look the same).
fn parse_result_marker(line: &str) -> Option<(TestAction, String, Option<Duration>)> {
    let rest = line.strip_prefix("--- ")?;
    let mut fields = rest.split_whitespace();
    let action = match fields.next()?.trim_end_matches(':') {
        "PASS" => TestAction::Pass,
        "FAIL" => TestAction::Fail,
        "SKIP" => TestAction::Skip,
        _ => return None,
    };
    let name = fields.next()?.to_owned();
    let elapsed = fields
        .next()
        .and_then(|field| parse_seconds(field.trim_start_matches('(').trim_end_matches(')')));
    Some((action, name, elapsed))
}

/// Parses a `0.035s` style token.
fn parse_seconds(token: &str) -> Option<Duration> {
    let secs: f64 = token.strip_suffix('s')?.parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}
