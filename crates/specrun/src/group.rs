//! The spec driver: runs one group of specs — all sharing an Ordered
//! ancestor chain, or a single spec — through the full lifecycle.
//!
//! Per spec: setup (`BeforeAll`s not yet passed, `BeforeEach` ascending,
//! `JustBeforeEach` ascending, the `It`), then five teardown passes. Each
//! pass is additive and observes state changed by the passes before it:
//!
//!   A. per-example teardown (`JustAfterEach`, then `AfterEach` + `AfterAll`,
//!      descending, capped at the deepest nesting level the setup reached)
//!   B. `AfterAll` rescue — an `AfterEach` failure can newly qualify one
//!   C. deferred cleanup (`CleanupAfterEach` unconditionally, then filtered
//!      `CleanupAfterAll`, both LIFO)
//!   D. `AfterAll` rescue again — a failing cleanup can newly qualify one
//!   E. late `CleanupAfterAll` — cleanups generated inside an `AfterAll`
//!
//! The filter that decides whether an after-node runs is where the ordered
//! group semantics live; see [`should_run_after_node`].

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use tracing::trace;

use crate::node::{
    sorted_by_ascending_nesting, sorted_by_descending_nesting, within_nesting_level, Node, NodeId,
    NodeKind, NodesExt,
};
use crate::report::{SpecReport, SpecState};
use crate::spec::Spec;
use crate::suite::{best_text_for, elapsed_since, Invocation, RunCtx};

pub(crate) const SKIP_DUE_TO_EARLIER_FAILURE: &str =
    "Spec skipped because an earlier spec in an ordered container failed";
pub(crate) const SKIP_DUE_TO_BEFORE_ALL_SKIP: &str =
    "Spec skipped because Skip() was called in BeforeAll";

/// Index of the last non-skipped spec in the group whose chain contains the
/// node id, if any. "Skipped" here is the generation-time decision — focus,
/// labels, pending — not a runtime skip.
fn index_of_last_spec_containing_node_id(group: &[Spec], id: NodeId) -> Option<usize> {
    let mut last = None;
    for (idx, spec) in group.iter().enumerate() {
        if !spec.skip && spec.nodes.contains_node_id(id) {
            last = Some(idx);
        }
    }
    last
}

/// The after-node policy that keeps ordered-group semantics correct across
/// retries and nested ordered containers.
#[allow(clippy::too_many_arguments)]
fn should_run_after_node(
    n: &Node,
    current_state: SpecState,
    terminating_node: &Option<Node>,
    is_final_attempt: bool,
    after_all_ran_this_attempt: &HashSet<NodeId>,
    group: &[Spec],
    spec_index: usize,
) -> bool {
    if matches!(n.kind, NodeKind::AfterEach | NodeKind::JustAfterEach) {
        return true;
    }

    let key = match n.kind {
        NodeKind::AfterAll => {
            // Already ran on this attempt: don't run again.
            if after_all_ran_this_attempt.contains(&n.id) {
                return false;
            }
            n.id
        }
        NodeKind::CleanupAfterAll => n.cleanup_generator_id,
        _ => n.id,
    };
    let is_last_spec_with_node =
        index_of_last_spec_containing_node_id(group, key) == Some(spec_index);

    match current_state {
        // We've passed so far; run the after-node only at the group boundary.
        SpecState::Passed => is_last_spec_with_node,
        SpecState::Skipped => {
            if is_last_spec_with_node {
                return true;
            }
            // A skipped BeforeAll at our nesting level means the whole
            // subgroup is going to skip: tear it down now.
            if let Some(t) = terminating_node {
                if t.kind == NodeKind::BeforeAll && t.nesting_level == n.nesting_level {
                    return true;
                }
            }
            false
        }
        SpecState::Failed | SpecState::Panicked => {
            if is_final_attempt {
                return true;
            }
            if let Some(t) = terminating_node {
                // A BeforeAll will be re-run on the retry, so clean up after it.
                if t.kind == NodeKind::BeforeAll {
                    if n.kind == NodeKind::AfterAll && t.nesting_level == n.nesting_level {
                        return true;
                    }
                    if n.kind == NodeKind::CleanupAfterAll && t.id == n.cleanup_generator_id {
                        return true;
                    }
                }
                // Same for an AfterAll that failed and will re-run.
                if t.kind == NodeKind::AfterAll
                    && n.kind == NodeKind::CleanupAfterAll
                    && t.id == n.cleanup_generator_id
                {
                    return true;
                }
            }
            false
        }
        // The run is over; drain the stack.
        SpecState::Interrupted | SpecState::Aborted => true,
        _ => false,
    }
}

impl RunCtx<'_> {
    pub(crate) fn run_group(&mut self, group: Vec<Spec>) {
        let mut node_state: HashMap<NodeId, SpecState> = HashMap::new();
        let mut group_succeeded = true;

        for i in 0..group.len() {
            let spec = group[i].clone();
            let leaf = spec.leaf().clone();
            let containers = spec.nodes.with_kind(NodeKind::Container);

            self.set_current_report(SpecReport {
                container_hierarchy_texts: containers.iter().map(|c| c.text.clone()).collect(),
                container_hierarchy_locations: containers
                    .iter()
                    .map(|c| c.code_location.clone())
                    .collect(),
                container_hierarchy_labels: containers.iter().map(|c| c.labels.clone()).collect(),
                leaf_node_kind: NodeKind::It,
                leaf_node_location: leaf.code_location.clone(),
                leaf_node_text: leaf.text.clone(),
                leaf_node_labels: leaf.labels.clone(),
                parallel_process: self.config.parallel_process,
                is_serial: spec.nodes.has_node_marked_serial(),
                is_in_ordered_container: spec.nodes.first_node_marked_ordered().is_some(),
                ..SpecReport::default()
            });

            // Initial skip determination.
            let mut skip = spec.skip;
            if spec.nodes.has_node_marked_pending() {
                skip = true;
                self.with_current_report(|r| r.state = SpecState::Pending);
            } else {
                if self.interrupt.status().interrupted || self.skip_all {
                    skip = true;
                }
                if !group_succeeded {
                    skip = true;
                    let failure = self.failure_for_leaf_node(&leaf, SKIP_DUE_TO_EARLIER_FAILURE);
                    self.with_current_report(|r| r.failure = failure);
                }
                for before_all in spec.nodes.with_kind(NodeKind::BeforeAll) {
                    if node_state.get(&before_all.id).copied().unwrap_or_default()
                        == SpecState::Skipped
                    {
                        skip = true;
                        let failure =
                            self.failure_for_leaf_node(&leaf, SKIP_DUE_TO_BEFORE_ALL_SKIP);
                        self.with_current_report(|r| r.failure = failure);
                        break;
                    }
                }
                if skip {
                    self.with_current_report(|r| r.state = SpecState::Skipped);
                }
            }

            if self.config.dry_run && !skip {
                skip = true;
                self.with_current_report(|r| r.state = SpecState::Passed);
            }

            let snapshot = self.snapshot_report();
            self.reporter.will_run(&snapshot);
            // Report-before-each fixtures see the (possibly skipped) report;
            // a failure in one converts the spec.
            self.report_each(&spec, NodeKind::ReportBeforeEach);
            if self.snapshot_report().state.is_failure() {
                skip = true;
            }

            self.with_current_report(|r| r.start_time = Some(SystemTime::now()));
            let mut max_attempts = std::cmp::max(1, spec.flake_attempts());
            if self.config.flake_attempts > 0 {
                max_attempts = self.config.flake_attempts;
            }

            let mut attempt: u32 = 0;
            while !skip && attempt < max_attempts {
                self.with_current_report(|r| r.num_attempts = attempt + 1);
                self.writer_truncate();
                self.interceptor.start_intercepting_output();
                if attempt > 0 {
                    self.writer_append(
                        format!("\nAttempt #{attempt} failed. Retrying...\n").as_bytes(),
                    );
                }
                let is_final_attempt = attempt == max_attempts - 1;
                trace!(spec = %leaf.text, attempt = attempt + 1, "spec attempt");

                // Setup sequence: BeforeAlls not yet passed, BeforeEach
                // ascending, JustBeforeEach ascending, then the leaf.
                let mut deepest_nesting_level_attained: i32 = -1;
                let mut setup_nodes: Vec<Node> = spec
                    .nodes
                    .with_kind(NodeKind::BeforeAll)
                    .into_iter()
                    .filter(|n| {
                        node_state.get(&n.id).copied().unwrap_or_default() != SpecState::Passed
                    })
                    .collect();
                setup_nodes.extend(spec.nodes.with_kind(NodeKind::BeforeEach));
                setup_nodes = sorted_by_ascending_nesting(setup_nodes);
                setup_nodes.extend(sorted_by_ascending_nesting(
                    spec.nodes.with_kind(NodeKind::JustBeforeEach),
                ));
                setup_nodes.extend(spec.nodes.with_kind(NodeKind::It));

                let mut terminating_node: Option<Node> = None;
                for node in &setup_nodes {
                    deepest_nesting_level_attained =
                        std::cmp::max(deepest_nesting_level_attained, node.nesting_level);
                    let text = best_text_for(&spec, node);
                    let (state, failure) = self.run_node(node, true, &text, Invocation::Default);
                    self.with_current_report(|r| {
                        r.state = state;
                        r.failure = failure;
                        r.run_time = elapsed_since(r.start_time);
                    });
                    node_state.insert(node.id, state);
                    if state != SpecState::Passed {
                        terminating_node = Some(node.clone());
                        break;
                    }
                }

                let mut after_all_ran_this_attempt: HashSet<NodeId> = HashSet::new();

                // Pass A: per-example teardown.
                let mut after_nodes =
                    sorted_by_descending_nesting(spec.nodes.with_kind(NodeKind::JustAfterEach));
                let mut each_and_all = spec.nodes.with_kind(NodeKind::AfterEach);
                each_and_all.extend(spec.nodes.with_kind(NodeKind::AfterAll));
                after_nodes.extend(sorted_by_descending_nesting(each_and_all));
                after_nodes = within_nesting_level(after_nodes, deepest_nesting_level_attained);
                let after_nodes = self.filter_after_nodes(
                    after_nodes,
                    &terminating_node,
                    is_final_attempt,
                    &after_all_ran_this_attempt,
                    &group,
                    i,
                );
                self.run_after_and_cleanup_nodes(
                    &after_nodes,
                    &spec,
                    &mut node_state,
                    &mut after_all_ran_this_attempt,
                    &mut terminating_node,
                );

                // Pass B: an AfterEach failure may have newly qualified an AfterAll.
                let after_nodes = within_nesting_level(
                    spec.nodes.with_kind(NodeKind::AfterAll),
                    deepest_nesting_level_attained,
                );
                let after_nodes = self.filter_after_nodes(
                    after_nodes,
                    &terminating_node,
                    is_final_attempt,
                    &after_all_ran_this_attempt,
                    &group,
                    i,
                );
                self.run_after_and_cleanup_nodes(
                    &after_nodes,
                    &spec,
                    &mut node_state,
                    &mut after_all_ran_this_attempt,
                    &mut terminating_node,
                );

                // Pass C: deferred cleanups, LIFO.
                let mut cleanup_nodes: Vec<Node> = {
                    let state = self.state.borrow();
                    let mut each = state.cleanup_nodes.with_kind(NodeKind::CleanupAfterEach);
                    each.reverse();
                    each
                };
                let mut cleanup_all = {
                    let state = self.state.borrow();
                    state.cleanup_nodes.with_kind(NodeKind::CleanupAfterAll)
                };
                cleanup_all = self.filter_after_nodes(
                    cleanup_all,
                    &terminating_node,
                    is_final_attempt,
                    &after_all_ran_this_attempt,
                    &group,
                    i,
                );
                cleanup_all.reverse();
                cleanup_nodes.extend(cleanup_all);
                self.run_after_and_cleanup_nodes(
                    &cleanup_nodes,
                    &spec,
                    &mut node_state,
                    &mut after_all_ran_this_attempt,
                    &mut terminating_node,
                );

                // Pass D: a failing cleanup may have newly qualified an AfterAll.
                let after_nodes = within_nesting_level(
                    spec.nodes.with_kind(NodeKind::AfterAll),
                    deepest_nesting_level_attained,
                );
                let after_nodes = self.filter_after_nodes(
                    after_nodes,
                    &terminating_node,
                    is_final_attempt,
                    &after_all_ran_this_attempt,
                    &group,
                    i,
                );
                self.run_after_and_cleanup_nodes(
                    &after_nodes,
                    &spec,
                    &mut node_state,
                    &mut after_all_ran_this_attempt,
                    &mut terminating_node,
                );

                // Pass E: AfterAlls may have generated more cleanups.
                let mut late_cleanup = {
                    let state = self.state.borrow();
                    state.cleanup_nodes.with_kind(NodeKind::CleanupAfterAll)
                };
                late_cleanup.reverse();
                let late_cleanup = self.filter_after_nodes(
                    late_cleanup,
                    &terminating_node,
                    is_final_attempt,
                    &after_all_ran_this_attempt,
                    &group,
                    i,
                );
                self.run_after_and_cleanup_nodes(
                    &late_cleanup,
                    &spec,
                    &mut node_state,
                    &mut after_all_ran_this_attempt,
                    &mut terminating_node,
                );

                let writer_output = self.writer_bytes_string();
                let intercepted = self.interceptor.stop_intercepting_and_return_output();
                self.with_current_report(|r| {
                    r.end_time = Some(SystemTime::now());
                    r.run_time = elapsed_since(r.start_time);
                    r.captured_writer_output.push_str(&writer_output);
                    r.captured_stdout_err.push_str(&intercepted);
                });

                if matches!(
                    self.snapshot_report().state,
                    SpecState::Passed
                        | SpecState::Skipped
                        | SpecState::Aborted
                        | SpecState::Interrupted
                ) {
                    break;
                }
                attempt += 1;
            }

            self.report_each(&spec, NodeKind::ReportAfterEach);
            self.process_current_spec_report();
            if self.snapshot_report().state.is_failure() {
                group_succeeded = false;
            }
            self.set_current_report(SpecReport::default());
        }
    }

    /// Applies [`should_run_after_node`] with the spec state as of now.
    /// Each teardown pass filters freshly so it observes what earlier
    /// passes changed.
    fn filter_after_nodes(
        &self,
        nodes: Vec<Node>,
        terminating_node: &Option<Node>,
        is_final_attempt: bool,
        after_all_ran_this_attempt: &HashSet<NodeId>,
        group: &[Spec],
        spec_index: usize,
    ) -> Vec<Node> {
        let current_state = self.snapshot_report().state;
        nodes
            .into_iter()
            .filter(|n| {
                should_run_after_node(
                    n,
                    current_state,
                    terminating_node,
                    is_final_attempt,
                    after_all_ran_this_attempt,
                    group,
                    spec_index,
                )
            })
            .collect()
    }

    /// Runs teardown/cleanup nodes. A teardown outcome replaces the spec
    /// state only while the spec is passing — except Aborted, which always
    /// wins.
    fn run_after_and_cleanup_nodes(
        &mut self,
        nodes: &[Node],
        spec: &Spec,
        node_state: &mut HashMap<NodeId, SpecState>,
        after_all_ran_this_attempt: &mut HashSet<NodeId>,
        terminating_node: &mut Option<Node>,
    ) {
        for node in nodes {
            let text = best_text_for(spec, node);
            let (state, failure) = self.run_node(node, true, &text, Invocation::Default);
            self.with_current_report(|r| r.run_time = elapsed_since(r.start_time));
            node_state.insert(node.id, state);

            let current_state = self.snapshot_report().state;
            if current_state == SpecState::Passed || state == SpecState::Aborted {
                self.with_current_report(|r| {
                    r.state = state;
                    r.failure = failure;
                });
                if state != SpecState::Passed {
                    *terminating_node = Some(node.clone());
                }
            }
            if node.kind == NodeKind::AfterAll {
                after_all_ran_this_attempt.insert(node.id);
            }
        }
    }
}
