// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming decoding of test-command output.
//!
//! The test command's output arrives as byte chunks that may split lines
//! arbitrarily. [`StreamParser`] reassembles lines and feeds them to a
//! per-run [`LineParser`], which decodes either the JSON-lines protocol
//! (`go test -json`) or the plain text format (`go test -v`), auto-detected
//! on the first non-empty line unless the configuration forces a mode.
//!
//! Decoding never fails: malformed protocol lines are skipped, truncated
//! trailing data yields whatever was understood, and a canceled run's
//! partial output still produces a usable event sequence.

mod diagnostics;
mod protocol;
mod text;

pub use diagnostics::{ErrorContext, SourceLocation, extract_error_context};

use crate::{config::ParserMode, events::TestEvent};
use bytes::BytesMut;
use protocol::LineVerdict;
use text::TextParser;

/// Reassembles chunk-split bytes into complete lines.
///
/// Lines are surrendered without their trailing `\n` (and `\r`, for CRLF
/// output). Bytes after the last newline stay buffered until more data
/// arrives or [`take_remainder`](Self::take_remainder) is called.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns the complete lines it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            // Drop the newline, and a preceding carriage return if any.
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Returns the unterminated trailing fragment, if any.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }
}

#[derive(Debug)]
enum ModeState {
    /// Waiting for the first non-empty line to pick a mode.
    Undetermined,
    Protocol,
    Text(TextParser),
}

/// Decodes one run's output, line at a time, into [`TestEvent`]s.
#[derive(Debug)]
pub struct LineParser {
    state: ModeState,
}

impl LineParser {
    /// Creates a parser for the given mode.
    pub fn new(mode: ParserMode) -> Self {
        let state = match mode {
            ParserMode::Auto => ModeState::Undetermined,
            ParserMode::Protocol => ModeState::Protocol,
            ParserMode::Text => ModeState::Text(TextParser::new()),
        };
        Self { state }
    }

    /// The wire format in effect, once known.
    pub fn wire_format(&self) -> Option<&'static str> {
        match &self.state {
            ModeState::Undetermined => None,
            ModeState::Protocol => Some("protocol"),
            ModeState::Text(_) => Some("text"),
        }
    }

    /// Decodes one line, returning any events it completed.
    ///
    /// In text mode most lines buffer internally and the events appear
    /// later, when the package-summary line resolves them.
    pub fn feed_line(&mut self, line: &str) -> Vec<TestEvent> {
        match &mut self.state {
            ModeState::Undetermined => {
                if line.trim().is_empty() {
                    return Vec::new();
                }
                // A line that decodes as a protocol record settles the mode,
                // even if its action is one we drop. Anything else falls
                // back to text.
                if line.trim_start().starts_with('{') {
                    match protocol::decode_line(line) {
                        LineVerdict::Event(event) => {
                            self.state = ModeState::Protocol;
                            return vec![event];
                        }
                        LineVerdict::Recognized => {
                            self.state = ModeState::Protocol;
                            return Vec::new();
                        }
                        LineVerdict::Malformed => {}
                    }
                }
                let mut text = TextParser::new();
                let events = text.feed_line(line);
                self.state = ModeState::Text(text);
                events
            }
            ModeState::Protocol => match protocol::decode_line(line) {
                LineVerdict::Event(event) => vec![event],
                LineVerdict::Recognized | LineVerdict::Malformed => Vec::new(),
            },
            ModeState::Text(text) => text.feed_line(line),
        }
    }

    /// Ends the stream, flushing anything still buffered.
    pub fn finish(self) -> Vec<TestEvent> {
        match self.state {
            ModeState::Undetermined | ModeState::Protocol => Vec::new(),
            ModeState::Text(text) => text.finish(),
        }
    }
}

/// Chunk-level wrapper over [`LineParser`].
#[derive(Debug)]
pub struct StreamParser {
    buffer: LineBuffer,
    lines: LineParser,
}

impl StreamParser {
    /// Creates a parser for the given mode.
    pub fn new(mode: ParserMode) -> Self {
        Self {
            buffer: LineBuffer::new(),
            lines: LineParser::new(mode),
        }
    }

    /// The wire format in effect, once known.
    pub fn wire_format(&self) -> Option<&'static str> {
        self.lines.wire_format()
    }

    /// Decodes the lines completed by `chunk`.
    pub fn feed_chunk(&mut self, chunk: &[u8]) -> Vec<TestEvent> {
        let mut events = Vec::new();
        for line in self.buffer.push(chunk) {
            events.extend(self.lines.feed_line(&line));
        }
        events
    }

    /// Ends the stream, parsing any unterminated trailing line and flushing
    /// buffered events.
    ///
    /// A truncated trailing protocol record does not decode and is dropped;
    /// the events collected so far stand.
    pub fn finish(mut self) -> Vec<TestEvent> {
        let mut events = Vec::new();
        if let Some(rest) = self.buffer.take_remainder() {
            events.extend(self.lines.feed_line(&rest));
        }
        events.extend(self.lines.finish());
        events
    }
}
