//! Per-spec and per-suite reports. Everything here serializes, so
//! machine-readable formatters and the inter-process client can be layered
//! on top without touching the engine.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SuiteConfig;
use crate::node::{CodeLocation, NodeKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecState {
    #[default]
    Invalid,
    Passed,
    Skipped,
    Pending,
    Failed,
    Panicked,
    Aborted,
    Interrupted,
}

impl SpecState {
    /// States that count against the suite.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            SpecState::Failed | SpecState::Panicked | SpecState::Aborted | SpecState::Interrupted
        )
    }
}

impl fmt::Display for SpecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpecState::Invalid => "invalid",
            SpecState::Passed => "passed",
            SpecState::Skipped => "skipped",
            SpecState::Pending => "pending",
            SpecState::Failed => "failed",
            SpecState::Panicked => "panicked",
            SpecState::Aborted => "aborted",
            SpecState::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Where in the spec's chain the failing node sat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureNodeContext {
    #[default]
    LeafNode,
    AtTopLevel,
    InContainer,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    pub location: CodeLocation,
    /// The stringified panic payload, when the state is Panicked.
    pub forwarded_panic: Option<String>,
    pub node_context: FailureNodeContext,
    pub node_kind: Option<NodeKind>,
    pub node_location: CodeLocation,
    /// Index into the container hierarchy when `node_context` is `InContainer`.
    pub container_index: Option<usize>,
}

/// A user-attached entry on a spec report, added via `add_report_entry`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub name: String,
    pub time: SystemTime,
    pub location: CodeLocation,
    pub value: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpecReport {
    pub container_hierarchy_texts: Vec<String>,
    pub container_hierarchy_locations: Vec<CodeLocation>,
    pub container_hierarchy_labels: Vec<Vec<String>>,
    pub leaf_node_kind: NodeKind,
    pub leaf_node_location: CodeLocation,
    pub leaf_node_text: String,
    pub leaf_node_labels: Vec<String>,
    pub state: SpecState,
    pub failure: Failure,
    pub num_attempts: u32,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    pub run_time: Duration,
    pub captured_writer_output: String,
    pub captured_stdout_err: String,
    pub report_entries: Vec<ReportEntry>,
    pub parallel_process: u32,
    pub is_serial: bool,
    pub is_in_ordered_container: bool,
}

impl Default for SpecReport {
    fn default() -> Self {
        SpecReport {
            container_hierarchy_texts: Vec::new(),
            container_hierarchy_locations: Vec::new(),
            container_hierarchy_labels: Vec::new(),
            leaf_node_kind: NodeKind::It,
            leaf_node_location: CodeLocation::default(),
            leaf_node_text: String::new(),
            leaf_node_labels: Vec::new(),
            state: SpecState::Invalid,
            failure: Failure::default(),
            num_attempts: 0,
            start_time: None,
            end_time: None,
            run_time: Duration::ZERO,
            captured_writer_output: String::new(),
            captured_stdout_err: String::new(),
            report_entries: Vec::new(),
            parallel_process: 1,
            is_serial: false,
            is_in_ordered_container: false,
        }
    }
}

impl SpecReport {
    /// The container texts and leaf text joined into one readable path.
    pub fn full_text(&self) -> String {
        let mut parts: Vec<&str> = self
            .container_hierarchy_texts
            .iter()
            .map(String::as_str)
            .collect();
        if !self.leaf_node_text.is_empty() {
            parts.push(&self.leaf_node_text);
        }
        parts.join(" ")
    }

    pub fn failure_message(&self) -> &str {
        &self.failure.message
    }

    /// Container labels and leaf labels, deduplicated, in hierarchy order.
    pub fn combined_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        for level in &self.container_hierarchy_labels {
            for label in level {
                if !labels.contains(label) {
                    labels.push(label.clone());
                }
            }
        }
        for label in &self.leaf_node_labels {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }
        labels
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreRunStats {
    pub total_specs: usize,
    pub specs_that_will_run: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Report {
    pub suite_path: String,
    pub suite_description: String,
    pub suite_config: SuiteConfig,
    pub suite_has_programmatic_focus: bool,
    pub pre_run_stats: PreRunStats,
    pub suite_succeeded: bool,
    /// Failures that are not attributable to a single spec (build errors,
    /// interrupts, counter failures, pending-with-fail-on-pending).
    pub special_suite_failure_reasons: Vec<String>,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    pub run_time: Duration,
    pub spec_reports: Vec<SpecReport>,
}

impl Report {
    /// Merge a report aggregated from another process into this one.
    pub fn add(mut self, other: Report) -> Report {
        self.suite_succeeded = self.suite_succeeded && other.suite_succeeded;
        self.special_suite_failure_reasons
            .extend(other.special_suite_failure_reasons);
        if let (Some(mine), Some(theirs)) = (self.end_time, other.end_time) {
            self.end_time = Some(mine.max(theirs));
        } else if self.end_time.is_none() {
            self.end_time = other.end_time;
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            self.run_time = end.duration_since(start).unwrap_or(self.run_time);
        }
        self.spec_reports.extend(other.spec_reports);
        self
    }

    pub fn count_with_state(&self, state: SpecState) -> usize {
        self.spec_reports
            .iter()
            .filter(|r| r.state == state)
            .count()
    }

    /// Find a spec report by its leaf text. Handy for tooling and tests.
    pub fn find(&self, leaf_text: &str) -> Option<&SpecReport> {
        self.spec_reports
            .iter()
            .find(|r| r.leaf_node_text == leaf_text)
    }
}
