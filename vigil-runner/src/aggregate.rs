// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Builds a result tree out of the parsed event stream.
//!
//! The tree has one level of package nodes under a synthetic root, test
//! nodes under their package, and subtest nodes nested by splitting the
//! test name on `/`. Nodes appear in first-seen order and stay
//! [`NodeStatus::Running`] until a terminal event resolves them, so a
//! canceled or truncated run yields a partial tree that is honest about
//! what never finished.

use crate::events::{TestAction, TestEvent};
use crate::parser::{ErrorContext, extract_error_context};
use indexmap::IndexMap;
use std::{fmt, time::Duration};

/// The resolution state of one node in the result tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeStatus {
    /// No terminal event seen yet.
    Running,

    /// The node's terminal event was a pass.
    Passed,

    /// The node's terminal event was a failure.
    Failed,

    /// The node's terminal event was a skip.
    Skipped,
}

impl NodeStatus {
    fn from_terminal(action: TestAction) -> Option<Self> {
        match action {
            TestAction::Pass => Some(Self::Passed),
            TestAction::Fail => Some(Self::Failed),
            TestAction::Skip => Some(Self::Skipped),
            TestAction::Run | TestAction::Output => None,
        }
    }

    /// Returns the lowercase display name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of the aggregated result tree.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultNode {
    /// The package import path for package nodes, or the test name segment
    /// (the part after the last `/`) for test and subtest nodes. Empty for
    /// the root, and for the placeholder package of events whose package
    /// was never resolved.
    pub name: String,

    /// The node's resolution state.
    pub status: NodeStatus,

    /// Elapsed time from the terminal event, when it carried one.
    pub elapsed: Option<Duration>,

    /// Output lines attached to this node, in arrival order.
    pub output: Vec<String>,

    /// Failure diagnostics, populated for failed nodes when the run
    /// finishes.
    pub error: Option<ErrorContext>,

    /// Child nodes in first-seen order.
    pub children: IndexMap<String, ResultNode>,
}

impl ResultNode {
    fn new(name: String) -> Self {
        Self {
            name,
            status: NodeStatus::Running,
            elapsed: None,
            output: Vec::new(),
            error: None,
            children: IndexMap::new(),
        }
    }

    /// Returns the synthetic root of an empty tree.
    pub fn empty_root() -> Self {
        Self::new(String::new())
    }

    /// Returns true if no events were ever recorded into this tree.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Tallies test and subtest nodes in this subtree. Call on the root:
    /// the first level below it (packages) is excluded from the counts.
    pub fn counts(&self) -> RunCounts {
        let mut counts = RunCounts::default();
        for package in self.children.values() {
            for test in package.children.values() {
                test.tally(&mut counts);
            }
        }
        counts
    }

    fn tally(&self, counts: &mut RunCounts) {
        counts.total += 1;
        match self.status {
            NodeStatus::Running => counts.running += 1,
            NodeStatus::Passed => counts.passed += 1,
            NodeStatus::Failed => counts.failed += 1,
            NodeStatus::Skipped => counts.skipped += 1,
        }
        for child in self.children.values() {
            child.tally(counts);
        }
    }

    fn attach_error_contexts(&mut self) {
        if self.status == NodeStatus::Failed && self.error.is_none() && !self.output.is_empty() {
            self.error = Some(extract_error_context(&self.output));
        }
        for child in self.children.values_mut() {
            child.attach_error_contexts();
        }
    }
}

/// Counts over the test and subtest nodes of a finished (or partial)
/// result tree. Subtests count individually; package nodes do not count.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunCounts {
    /// All counted nodes, resolved or not.
    pub total: usize,

    /// Nodes that passed.
    pub passed: usize,

    /// Nodes that failed.
    pub failed: usize,

    /// Nodes that were skipped.
    pub skipped: usize,

    /// Tests that never saw a terminal event, nonzero only for canceled or
    /// truncated runs.
    pub running: usize,
}

impl RunCounts {
    /// Returns true if any test failed.
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl fmt::Display for RunCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} passed, {} failed, {} skipped", self.passed, self.failed, self.skipped)?;
        if self.running > 0 {
            write!(f, ", {} unresolved", self.running)?;
        }
        Ok(())
    }
}

/// Folds the event stream of one run into a [`ResultNode`] tree.
#[derive(Debug)]
pub struct ResultAggregator {
    root: ResultNode,
}

impl ResultAggregator {
    /// Creates an aggregator with an empty tree.
    pub fn new() -> Self {
        Self {
            root: ResultNode::empty_root(),
        }
    }

    /// Records one parsed event. Recording the same terminal event twice
    /// leaves the tree unchanged.
    pub fn record(&mut self, event: &TestEvent) {
        let node = self.resolve(event);
        match event.action {
            TestAction::Run => {}
            TestAction::Output => {
                if let Some(line) = &event.output {
                    node.output.push(line.clone());
                }
            }
            action => {
                if let Some(status) = NodeStatus::from_terminal(action) {
                    node.status = status;
                    node.elapsed = event.elapsed;
                }
            }
        }
    }

    /// Finishes the run: failed nodes get diagnostics extracted from their
    /// captured output, and the tree is returned.
    pub fn finish(mut self) -> ResultNode {
        self.root.attach_error_contexts();
        self.root
    }

    /// Walks (creating as needed) to the node the event addresses.
    fn resolve(&mut self, event: &TestEvent) -> &mut ResultNode {
        let mut node = self
            .root
            .children
            .entry(event.package.clone())
            .or_insert_with(|| ResultNode::new(event.package.clone()));
        if let Some(test) = &event.test {
            for segment in test.split('/') {
                node = node
                    .children
                    .entry(segment.to_owned())
                    .or_insert_with(|| ResultNode::new(segment.to_owned()));
            }
        }
        node
    }
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}
