// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Failure diagnostics pulled out of captured test output.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// `path.go:line` or `path.go:line:col`, anywhere in a line. Compiler and
/// `t.Errorf` locations both show up mid-line, so this is unanchored.
static GO_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\w./\-]+\.go):(\d+)(?::(\d+))?").unwrap());

/// Fallback `path:line` for panics and tool output that do not name a Go
/// file.
static ANY_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\w./\-]+):(\d+)").unwrap());

/// A source position referenced by a failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    /// The file path as it appeared in the output.
    pub file: String,

    /// 1-based line number.
    pub line: u32,

    /// 1-based column, when the output carried one.
    pub column: Option<u32>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)?;
        if let Some(column) = self.column {
            write!(f, ":{column}")?;
        }
        Ok(())
    }
}

/// Summary of why a test failed, extracted from its output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorContext {
    /// The most relevant output line, or a placeholder when the failure
    /// produced no output at all.
    pub message: String,

    /// The source position, when one could be extracted.
    pub location: Option<SourceLocation>,
}

/// Scans a failed test's output lines for a source location. Go file
/// references are preferred over generic `path:line` matches; within each
/// tier the first matching line wins. The matched line doubles as the
/// failure message; without any match the last non-empty line stands in.
pub fn extract_error_context<S: AsRef<str>>(output: &[S]) -> ErrorContext {
    for line in output {
        if let Some(context) = match_location(line.as_ref(), &GO_LOCATION, true) {
            return context;
        }
    }
    for line in output {
        if let Some(context) = match_location(line.as_ref(), &ANY_LOCATION, false) {
            return context;
        }
    }

    let message = output
        .iter()
        .rev()
        .map(|line| line.as_ref().trim())
        .find(|line| !line.is_empty())
        .unwrap_or("test failed")
        .to_owned();
    ErrorContext {
        message,
        location: None,
    }
}

fn match_location(line: &str, regex: &Regex, with_column: bool) -> Option<ErrorContext> {
    let captures = regex.captures(line)?;
    let file = captures.get(1)?.as_str().to_owned();
    let line_number: u32 = captures.get(2)?.as_str().parse().ok()?;
    let column = if with_column {
        captures.get(3).and_then(|m| m.as_str().parse().ok())
    } else {
        None
    };
    Some(ErrorContext {
        message: line.trim().to_owned(),
        location: Some(SourceLocation {
            file,
            line: line_number,
            column,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn finds_a_mid_line_go_location() {
        let context = extract_error_context(&["some failure at file.go:42"]);
        assert_eq!(context.message, "some failure at file.go:42");
        assert_eq!(
            context.location,
            Some(SourceLocation {
                file: "file.go".to_owned(),
                line: 42,
                column: None,
            }),
        );
    }

    #[test]
    fn captures_the_column_when_present() {
        let context = extract_error_context(&["    internal/store/db.go:17:4: assignment error"]);
        assert_eq!(
            context.location,
            Some(SourceLocation {
                file: "internal/store/db.go".to_owned(),
                line: 17,
                column: Some(4),
            }),
        );
        assert_eq!(
            context.message,
            "internal/store/db.go:17:4: assignment error",
        );
    }

    #[test]
    fn prefers_go_files_over_generic_locations() {
        let context = extract_error_context(&[
            "goroutine 7 [running]:",
            "main.run(0x0) /src/app/main.go:31 +0x1b",
        ]);
        let location = context.location.expect("location found");
        assert_eq!(location.file, "/src/app/main.go");
        assert_eq!(location.line, 31);
    }

    #[test]
    fn falls_back_to_a_generic_location() {
        let context = extract_error_context(&["panic recorded in trace.txt:9"]);
        assert_eq!(
            context.location,
            Some(SourceLocation {
                file: "trace.txt".to_owned(),
                line: 9,
                column: None,
            }),
        );
    }

    #[test]
    fn first_matching_line_wins() {
        let context = extract_error_context(&[
            "expect.go:10: first assertion failed",
            "expect.go:20: second assertion failed",
        ]);
        assert_eq!(context.location.expect("location").line, 10);
        assert_eq!(context.message, "expect.go:10: first assertion failed");
    }

    #[test]
    fn without_a_location_the_last_nonempty_line_is_the_message() {
        let context = extract_error_context(&["expected true", "got false", "   "]);
        assert_eq!(context.message, "got false");
        assert_eq!(context.location, None);
    }

    #[test]
    fn empty_output_gets_a_placeholder() {
        let context = extract_error_context::<&str>(&[]);
        assert_eq!(context.message, "test failed");
        assert_eq!(context.location, None);
    }

    #[test]
    fn display_includes_the_column() {
        let location = SourceLocation {
            file: "pkg/a.go".to_owned(),
            line: 3,
            column: Some(14),
        };
        assert_eq!(location.to_string(), "pkg/a.go:3:14");
    }
}
