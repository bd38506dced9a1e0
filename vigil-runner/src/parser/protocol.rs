// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The JSON-lines protocol (`go test -json`).
//!
//! Each line is a self-describing record. Decoding is line-at-a-time and
//! stateless; lines that do not decode are skipped so that interleaved
//! stderr noise or a truncated tail never poisons the stream.

use crate::events::{TestAction, TestEvent};
use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use std::time::Duration;

/// One record of the upstream protocol.
///
/// Field names are fixed by the wire format.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProtocolRecord {
    #[serde(default)]
    time: Option<DateTime<FixedOffset>>,
    action: String,
    #[serde(default)]
    package: Option<String>,
    #[serde(default)]
    test: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    elapsed: Option<f64>,
}

/// The outcome of decoding one line.
#[derive(Debug)]
pub(super) enum LineVerdict {
    /// A record with one of the five documented actions.
    Event(TestEvent),

    /// A valid record whose action we drop (start, pause, cont, bench).
    Recognized,

    /// Not a protocol record.
    Malformed,
}

pub(super) fn decode_line(line: &str) -> LineVerdict {
    let record: ProtocolRecord = match serde_json::from_str(line) {
        Ok(record) => record,
        Err(_) => return LineVerdict::Malformed,
    };
    let Some(action) = TestAction::from_wire(&record.action) else {
        return LineVerdict::Recognized;
    };
    LineVerdict::Event(TestEvent {
        timestamp: record.time,
        action,
        package: record.package.unwrap_or_default(),
        test: record.test,
        // Output lines arrive with their newline still attached.
        output: record.output.map(|o| o.trim_end_matches('\n').to_owned()),
        // Negative, NaN, or overflowing elapsed values are discarded.
        elapsed: record
            .elapsed
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_a_terminal_record() {
        let verdict = decode_line(
            r#"{"Time":"2024-01-09T10:00:01.25Z","Action":"pass","Package":"example.com/pkg","Test":"TestA","Elapsed":0.25}"#,
        );
        let LineVerdict::Event(event) = verdict else {
            panic!("expected an event, got {verdict:?}");
        };
        assert_eq!(event.action, TestAction::Pass);
        assert_eq!(event.package, "example.com/pkg");
        assert_eq!(event.test.as_deref(), Some("TestA"));
        assert_eq!(event.elapsed, Some(Duration::from_millis(250)));
        assert!(event.timestamp.is_some());
    }

    #[test]
    fn package_level_records_have_no_test() {
        let verdict =
            decode_line(r#"{"Action":"fail","Package":"example.com/pkg","Elapsed":0.035}"#);
        let LineVerdict::Event(event) = verdict else {
            panic!("expected an event");
        };
        assert_eq!(event.test, None);
        assert_eq!(event.action, TestAction::Fail);
    }

    #[test]
    fn output_records_lose_their_trailing_newline() {
        let verdict = decode_line(
            r#"{"Action":"output","Package":"pkg","Test":"TestA","Output":"    file.go:42: boom\n"}"#,
        );
        let LineVerdict::Event(event) = verdict else {
            panic!("expected an event");
        };
        assert_eq!(event.output.as_deref(), Some("    file.go:42: boom"));
    }

    #[test]
    fn undocumented_actions_are_recognized_but_dropped() {
        assert!(matches!(
            decode_line(r#"{"Action":"start","Package":"pkg"}"#),
            LineVerdict::Recognized
        ));
        assert!(matches!(
            decode_line(r#"{"Action":"cont","Package":"pkg","Test":"TestA"}"#),
            LineVerdict::Recognized
        ));
    }

    #[test]
    fn garbage_is_malformed_not_fatal() {
        assert!(matches!(decode_line("not json"), LineVerdict::Malformed));
        assert!(matches!(
            decode_line(r#"{"Action":"pa"#),
            LineVerdict::Malformed
        ));
        // Valid JSON that is not a record shape.
        assert!(matches!(decode_line(r#"[1,2,3]"#), LineVerdict::Malformed));
    }

    #[test]
    fn negative_elapsed_is_discarded() {
        let verdict = decode_line(r#"{"Action":"pass","Package":"pkg","Elapsed":-1.0}"#);
        let LineVerdict::Event(event) = verdict else {
            panic!("expected an event");
        };
        assert_eq!(event.elapsed, None);
    }
}
