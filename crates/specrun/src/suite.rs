//! The suite: tree construction phases, the run-phase scheduler, suite-level
//! fixtures, and single-node execution.
//!
//! During the build phases the suite lives in a thread-local slot so node
//! constructors can reach it. During the run it is owned by the scheduler;
//! only a small [`RunState`] stays in the thread-local so the reentrant
//! primitives (`fail`, `skip`, `defer_cleanup`, `current_spec_report`) can
//! find the failer, the cleanup stack, and the in-flight report.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, trace};

use crate::config::SuiteConfig;
use crate::error::{ClientError, SuiteError};
use crate::failer::{panic_payload_message, Failer, FailurePanic};
use crate::interfaces::{Client, InterruptHandler, OutputInterceptor, Reporter, SharedWriter};
use crate::node::{
    sorted_by_ascending_nesting, sorted_by_descending_nesting, CodeLocation, Node, NodeBody,
    NodeKind, NodesExt,
};
use crate::report::{
    Failure, FailureNodeContext, PreRunStats, Report, SpecReport, SpecState,
};
use crate::spec::{
    apply_focus_to_specs, count_without_skip, generate_specs, has_any_pending, order_specs, Spec,
};
use crate::tree::{apply_nested_focus_policy, Phase, TreeNode};

// ============================================================================
// Build-phase suite
// ============================================================================

pub(crate) struct Suite {
    pub(crate) phase: Phase,
    tree: TreeNode,
    /// Path of child indices to the currently-open container.
    cursor: Vec<usize>,
    top_level_containers: Vec<Node>,
    suite_nodes: Vec<Node>,
    build_errors: Vec<SuiteError>,
}

/// What `push_node` wants the caller to do next. Container bodies must run
/// without the thread-local suite borrowed, so entering is the caller's job.
pub(crate) enum Pushed {
    Done,
    EnterContainer {
        body: Rc<RefCell<Option<Box<dyn FnOnce()>>>>,
        location: CodeLocation,
    },
}

impl Suite {
    pub(crate) fn new() -> Self {
        Suite {
            phase: Phase::BuildTopLevel,
            tree: TreeNode::root(),
            cursor: Vec::new(),
            top_level_containers: Vec::new(),
            suite_nodes: Vec::new(),
            build_errors: Vec::new(),
        }
    }

    fn ancestor_chain(&self) -> Vec<&Node> {
        let mut chain = Vec::with_capacity(self.cursor.len());
        let mut current = &self.tree;
        for &idx in &self.cursor {
            current = &current.children[idx];
            chain.push(&current.node);
        }
        chain
    }

    pub(crate) fn push_node(&mut self, mut node: Node) -> Result<Pushed, SuiteError> {
        if node.kind.is_cleanup() {
            // Run-phase cleanups go through the runtime, never the suite.
            return Err(SuiteError::PushingCleanupNodeDuringTreeConstruction {
                location: node.code_location.clone(),
            });
        }

        if node.kind.is_before_suite_family()
            || node.kind.is_after_suite_family()
            || node.kind == NodeKind::ReportAfterSuite
        {
            return self.push_suite_node(node).map(|()| Pushed::Done);
        }

        if self.phase == Phase::Run {
            return Err(SuiteError::PushingNodeInRunPhase {
                kind: node.kind,
                location: node.code_location.clone(),
            });
        }

        node.nesting_level = self.cursor.len() as i32;

        if node.serial {
            if let Some(first_ordered) = self.ancestor_chain().iter().find(|n| n.ordered) {
                if !first_ordered.serial {
                    return Err(SuiteError::InvalidSerialNodeInNonSerialOrderedContainer {
                        kind: node.kind,
                        location: node.code_location.clone(),
                    });
                }
            }
        }

        if matches!(node.kind, NodeKind::BeforeAll | NodeKind::AfterAll)
            && !self.ancestor_chain().iter().any(|n| n.ordered)
        {
            return Err(SuiteError::SetupNodeNotInOrderedContainer {
                kind: node.kind,
                location: node.code_location.clone(),
            });
        }

        if node.kind == NodeKind::Container {
            // Top-level containers are queued during BuildTopLevel and only
            // entered during BuildTree, giving user code a chance to finish
            // configuring the suite before any body runs.
            if self.phase == Phase::BuildTopLevel {
                self.top_level_containers.push(node);
                return Ok(Pushed::Done);
            }
            let body = match &node.body {
                NodeBody::Container(body) => Rc::clone(body),
                _ => Rc::new(RefCell::new(None)),
            };
            let location = node.code_location.clone();
            let parent = self.tree.at_path_mut(&self.cursor);
            parent.children.push(TreeNode::new(node));
            let idx = parent.children.len() - 1;
            self.cursor.push(idx);
            return Ok(Pushed::EnterContainer { body, location });
        }

        let parent = self.tree.at_path_mut(&self.cursor);
        parent.children.push(TreeNode::new(node));
        Ok(Pushed::Done)
    }

    fn push_suite_node(&mut self, node: Node) -> Result<(), SuiteError> {
        if self.phase == Phase::BuildTree {
            return Err(SuiteError::SuiteNodeInNestedContext {
                kind: node.kind,
                location: node.code_location.clone(),
            });
        }
        if self.phase == Phase::Run {
            return Err(SuiteError::SuiteNodeDuringRunPhase {
                kind: node.kind,
                location: node.code_location.clone(),
            });
        }

        if node.kind.is_before_suite_family() {
            if let Some(existing) = self
                .suite_nodes
                .iter()
                .find(|n| n.kind.is_before_suite_family())
            {
                return Err(SuiteError::MultipleBeforeSuiteNodes {
                    kind: node.kind,
                    location: node.code_location.clone(),
                    existing_kind: existing.kind,
                    existing_location: existing.code_location.clone(),
                });
            }
        }
        if node.kind.is_after_suite_family() {
            if let Some(existing) = self
                .suite_nodes
                .iter()
                .find(|n| n.kind.is_after_suite_family())
            {
                return Err(SuiteError::MultipleAfterSuiteNodes {
                    kind: node.kind,
                    location: node.code_location.clone(),
                    existing_kind: existing.kind,
                    existing_location: existing.code_location.clone(),
                });
            }
        }

        self.suite_nodes.push(node);
        Ok(())
    }

    pub(crate) fn close_container(&mut self) {
        self.cursor.pop();
    }

    /// Discard the currently-open container and its partial subtree. Used
    /// when a container body panics during BuildTree.
    pub(crate) fn discard_open_container(&mut self) {
        if let Some(idx) = self.cursor.pop() {
            let parent = self.tree.at_path_mut(&self.cursor);
            parent.children.remove(idx);
        }
    }

    pub(crate) fn record_build_error(&mut self, err: SuiteError) {
        self.build_errors.push(err);
    }

    pub(crate) fn begin_build_tree(&mut self) -> Vec<Node> {
        self.phase = Phase::BuildTree;
        std::mem::take(&mut self.top_level_containers)
    }

    pub(crate) fn first_build_error(&self) -> Option<SuiteError> {
        self.build_errors.first().cloned()
    }
}

// ============================================================================
// Run-phase shared state
// ============================================================================

/// The slice of run state that reentrant primitives need: the failer, the
/// shared writer, the node currently executing, the in-flight spec report,
/// and the deferred-cleanup stack.
pub(crate) struct RunState {
    pub failer: Arc<Failer>,
    pub writer: SharedWriter,
    pub current_node: Option<Node>,
    pub current_spec_report: SpecReport,
    pub cleanup_nodes: Vec<Node>,
}

impl RunState {
    /// Register a deferred cleanup. The generated node's kind derives from
    /// the node currently running.
    pub(crate) fn push_cleanup(
        &mut self,
        location: CodeLocation,
        body: Rc<dyn Fn()>,
    ) -> Result<(), SuiteError> {
        let current = match &self.current_node {
            Some(node) => node,
            None => {
                return Err(SuiteError::PushingCleanupNodeDuringTreeConstruction { location })
            }
        };

        let kind = match current.kind {
            NodeKind::BeforeSuite
            | NodeKind::SynchronizedBeforeSuite
            | NodeKind::AfterSuite
            | NodeKind::SynchronizedAfterSuite => NodeKind::CleanupAfterSuite,
            NodeKind::BeforeAll | NodeKind::AfterAll => NodeKind::CleanupAfterAll,
            NodeKind::ReportBeforeEach | NodeKind::ReportAfterEach | NodeKind::ReportAfterSuite => {
                return Err(SuiteError::PushingCleanupInReportNode {
                    kind: current.kind,
                    location,
                })
            }
            kind if kind.is_cleanup() => {
                return Err(SuiteError::PushingCleanupInCleanupNode { location })
            }
            _ => NodeKind::CleanupAfterEach,
        };

        let mut node = Node::new(kind, "", location);
        node.nesting_level = current.nesting_level;
        node.cleanup_generator_id = current.id;
        node.body = NodeBody::Standard(body);
        self.cleanup_nodes.push(node);
        Ok(())
    }
}

thread_local! {
    static RUNTIME: RefCell<Option<Rc<RefCell<RunState>>>> = const { RefCell::new(None) };
}

pub(crate) fn with_runtime<R>(f: impl FnOnce(&mut RunState) -> R) -> Option<R> {
    let state = RUNTIME.with(|cell| cell.borrow().clone());
    state.map(|state| f(&mut state.borrow_mut()))
}

struct RuntimeInstallation;

impl RuntimeInstallation {
    fn install(state: Rc<RefCell<RunState>>) -> Self {
        RUNTIME.with(|cell| *cell.borrow_mut() = Some(state));
        RuntimeInstallation
    }
}

impl Drop for RuntimeInstallation {
    fn drop(&mut self) {
        RUNTIME.with(|cell| cell.borrow_mut().take());
    }
}

// ============================================================================
// Run entry
// ============================================================================

/// The collaborators a run needs. Everything is a narrow interface; the
/// defaults in [`crate::interfaces`] cover single-process embedding.
pub struct RunParams<'a> {
    pub config: SuiteConfig,
    pub reporter: &'a mut dyn Reporter,
    pub writer: SharedWriter,
    pub output_interceptor: &'a mut dyn OutputInterceptor,
    pub interrupt_handler: &'a dyn InterruptHandler,
    pub client: Option<&'a dyn Client>,
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub suite_succeeded: bool,
    pub has_programmatic_focus: bool,
    pub report: Report,
}

pub(crate) fn run_suite_impl(
    mut suite: Suite,
    description: &str,
    suite_path: &str,
    params: RunParams<'_>,
) -> RunResult {
    if suite.phase != Phase::BuildTree {
        suite.record_build_error(SuiteError::RunBeforeBuildTree);
    }
    let client_missing = params.config.is_parallel() && params.client.is_none();

    if !suite.build_errors.is_empty() || client_missing {
        let mut reasons: Vec<String> =
            suite.build_errors.iter().map(|e| e.to_string()).collect();
        if client_missing {
            reasons.push(ClientError::Missing.to_string());
        }
        let now = SystemTime::now();
        let report = Report {
            suite_path: suite_path.to_string(),
            suite_description: description.to_string(),
            suite_config: params.config.clone(),
            suite_succeeded: false,
            special_suite_failure_reasons: reasons,
            start_time: Some(now),
            end_time: Some(now),
            ..Report::default()
        };
        params.reporter.suite_will_begin(&report);
        params.reporter.suite_did_end(&report);
        return RunResult {
            suite_succeeded: false,
            has_programmatic_focus: false,
            report,
        };
    }

    apply_nested_focus_policy(&mut suite.tree);
    let mut specs = generate_specs(&suite.tree);
    let has_programmatic_focus = apply_focus_to_specs(&mut specs, &params.config);
    suite.phase = Phase::Run;

    let failer = Arc::new(Failer::new());
    let state = Rc::new(RefCell::new(RunState {
        failer: Arc::clone(&failer),
        writer: Arc::clone(&params.writer),
        current_node: None,
        current_spec_report: SpecReport::default(),
        cleanup_nodes: Vec::new(),
    }));
    let _installation = RuntimeInstallation::install(Rc::clone(&state));

    let mut ctx = RunCtx {
        config: params.config,
        failer,
        reporter: params.reporter,
        writer: params.writer,
        interceptor: params.output_interceptor,
        interrupt: params.interrupt_handler,
        client: params.client,
        state,
        report: Report::default(),
        skip_all: false,
        suite_nodes: std::mem::take(&mut suite.suite_nodes),
    };

    let suite_succeeded = ctx.run_specs(description, suite_path, has_programmatic_focus, specs);
    RunResult {
        suite_succeeded,
        has_programmatic_focus,
        report: ctx.report,
    }
}

// ============================================================================
// The run context
// ============================================================================

pub(crate) struct RunCtx<'a> {
    pub(crate) config: SuiteConfig,
    pub(crate) failer: Arc<Failer>,
    pub(crate) reporter: &'a mut dyn Reporter,
    pub(crate) writer: SharedWriter,
    pub(crate) interceptor: &'a mut dyn OutputInterceptor,
    pub(crate) interrupt: &'a dyn InterruptHandler,
    pub(crate) client: Option<&'a dyn Client>,
    pub(crate) state: Rc<RefCell<RunState>>,
    pub(crate) report: Report,
    pub(crate) skip_all: bool,
    suite_nodes: Vec<Node>,
}

/// How to invoke a node's body. Report and synchronized-suite nodes need
/// arguments, so their call sites hand `run_node` a prepared closure.
pub(crate) enum Invocation<'b> {
    Default,
    Custom(&'b dyn Fn()),
}

pub(crate) fn elapsed_since(start: Option<SystemTime>) -> Duration {
    start
        .and_then(|s| SystemTime::now().duration_since(s).ok())
        .unwrap_or_default()
}

pub(crate) fn best_text_for(spec: &Spec, node: &Node) -> String {
    if !node.text.is_empty() {
        node.text.clone()
    } else {
        spec.leaf().text.clone()
    }
}

fn report_node_placeholder(node: &Node) -> String {
    format!(
        "an interrupt arrived while a {} node was running; the node will finish so the report stays valid, and subsequent specs will be skipped.\n\nThe running {} node is at:\n{}.",
        node.kind, node.kind, node.code_location
    )
}

impl<'a> RunCtx<'a> {
    fn is_parallel(&self) -> bool {
        self.config.is_parallel()
    }

    fn is_primary(&self) -> bool {
        self.config.is_primary_process()
    }

    pub(crate) fn with_current_report<R>(&self, f: impl FnOnce(&mut SpecReport) -> R) -> R {
        f(&mut self.state.borrow_mut().current_spec_report)
    }

    pub(crate) fn snapshot_report(&self) -> SpecReport {
        self.state.borrow().current_spec_report.clone()
    }

    pub(crate) fn set_current_report(&self, report: SpecReport) {
        self.state.borrow_mut().current_spec_report = report;
    }

    pub(crate) fn writer_truncate(&self) {
        self.writer.lock().expect("writer mutex poisoned").truncate();
    }

    pub(crate) fn writer_append(&self, bytes: &[u8]) {
        self.writer.lock().expect("writer mutex poisoned").append(bytes);
    }

    pub(crate) fn writer_bytes_string(&self) -> String {
        let bytes = self.writer.lock().expect("writer mutex poisoned").bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub(crate) fn failure_for_leaf_node(&self, node: &Node, message: &str) -> Failure {
        Failure {
            message: message.to_string(),
            location: node.code_location.clone(),
            node_context: FailureNodeContext::LeafNode,
            node_kind: Some(node.kind),
            node_location: node.code_location.clone(),
            ..Failure::default()
        }
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    pub(crate) fn run_specs(
        &mut self,
        description: &str,
        suite_path: &str,
        has_programmatic_focus: bool,
        specs: Vec<Spec>,
    ) -> bool {
        let num_specs_that_will_run = count_without_skip(&specs);
        self.report = Report {
            suite_path: suite_path.to_string(),
            suite_description: description.to_string(),
            suite_config: self.config.clone(),
            suite_has_programmatic_focus: has_programmatic_focus,
            pre_run_stats: PreRunStats {
                total_specs: specs.len(),
                specs_that_will_run: num_specs_that_will_run,
            },
            suite_succeeded: true,
            start_time: Some(SystemTime::now()),
            ..Report::default()
        };
        debug!(
            total = specs.len(),
            will_run = num_specs_that_will_run,
            "suite starting"
        );

        self.reporter.suite_will_begin(&self.report);
        if self.is_parallel() {
            if let Some(client) = self.client {
                let _ = client.post_suite_will_begin(&self.report);
            }
        }

        self.run_before_suite(num_specs_that_will_run);

        if self.report.suite_succeeded {
            let (mut grouped, mut serial_grouped) = order_specs(&specs, &self.config);
            let mut local_counter = 0usize;
            let mut use_local_counter = !self.is_parallel();

            loop {
                let next = if use_local_counter {
                    let i = local_counter;
                    local_counter += 1;
                    Ok(i)
                } else {
                    match self.client {
                        Some(client) => client.fetch_next_counter(),
                        None => Err(ClientError::Missing),
                    }
                };

                let group_idx = match next {
                    Ok(i) => i,
                    Err(e) => {
                        self.report
                            .special_suite_failure_reasons
                            .push(format!("Failed to iterate over specs:\n{e}"));
                        self.report.suite_succeeded = false;
                        break;
                    }
                };

                if group_idx >= grouped.len() {
                    // The primary process picks up the serial groups once
                    // every parallel group — on every process — is done.
                    if self.is_primary() && !serial_grouped.is_empty() {
                        grouped = std::mem::take(&mut serial_grouped);
                        local_counter = 0;
                        use_local_counter = true;
                        if let Some(client) = self.client {
                            let _ = client.block_until_nonprimary_procs_have_finished();
                        }
                        continue;
                    }
                    break;
                }

                let group: Vec<Spec> =
                    grouped[group_idx].iter().map(|&i| specs[i].clone()).collect();
                debug!(group = group_idx, specs = group.len(), "running group");
                self.run_group(group);
            }

            if has_any_pending(&specs) && self.config.fail_on_pending {
                self.report
                    .special_suite_failure_reasons
                    .push("Detected pending specs and fail-on-pending is set".to_string());
                self.report.suite_succeeded = false;
            }
        }

        self.run_after_suite_cleanup(num_specs_that_will_run);

        let interrupt_status = self.interrupt.status();
        if interrupt_status.interrupted {
            let cause = interrupt_status
                .cause
                .map(|c| c.to_string())
                .unwrap_or_else(|| "interrupted".to_string());
            self.report.special_suite_failure_reasons.push(cause);
            self.report.suite_succeeded = false;
        }
        self.report.end_time = Some(SystemTime::now());
        self.report.run_time = elapsed_since(self.report.start_time);

        if self.is_primary() {
            self.run_report_after_suite();
        }
        self.reporter.suite_did_end(&self.report);
        if self.is_parallel() {
            if let Some(client) = self.client {
                let _ = client.post_suite_did_end(&self.report);
            }
        }
        debug!(succeeded = self.report.suite_succeeded, "suite finished");
        self.report.suite_succeeded
    }

    fn run_before_suite(&mut self, num_specs_that_will_run: usize) {
        let node = self
            .suite_nodes
            .iter()
            .find(|n| n.kind.is_before_suite_family())
            .cloned();
        let Some(node) = node else { return };
        if self.interrupt.status().interrupted || num_specs_that_will_run == 0 {
            return;
        }

        self.set_current_report(SpecReport {
            leaf_node_kind: node.kind,
            leaf_node_location: node.code_location.clone(),
            parallel_process: self.config.parallel_process,
            ..SpecReport::default()
        });
        let snapshot = self.snapshot_report();
        self.reporter.will_run(&snapshot);
        self.run_suite_node(&node);
        if self.snapshot_report().state == SpecState::Skipped {
            self.report
                .special_suite_failure_reasons
                .push("Suite skipped in BeforeSuite".to_string());
            self.skip_all = true;
        }
        self.process_current_spec_report();
    }

    fn run_after_suite_cleanup(&mut self, num_specs_that_will_run: usize) {
        let node = self
            .suite_nodes
            .iter()
            .find(|n| n.kind.is_after_suite_family())
            .cloned();
        if let Some(node) = node {
            if num_specs_that_will_run > 0 {
                self.set_current_report(SpecReport {
                    leaf_node_kind: node.kind,
                    leaf_node_location: node.code_location.clone(),
                    parallel_process: self.config.parallel_process,
                    ..SpecReport::default()
                });
                let snapshot = self.snapshot_report();
                self.reporter.will_run(&snapshot);
                self.run_suite_node(&node);
                self.process_current_spec_report();
            }
        }

        let mut after_suite_cleanup = self
            .state
            .borrow()
            .cleanup_nodes
            .with_kind(NodeKind::CleanupAfterSuite);
        after_suite_cleanup.reverse();
        for cleanup_node in after_suite_cleanup {
            self.set_current_report(SpecReport {
                leaf_node_kind: cleanup_node.kind,
                leaf_node_location: cleanup_node.code_location.clone(),
                parallel_process: self.config.parallel_process,
                ..SpecReport::default()
            });
            let snapshot = self.snapshot_report();
            self.reporter.will_run(&snapshot);
            self.run_suite_node(&cleanup_node);
            self.process_current_spec_report();
        }
    }

    fn run_report_after_suite(&mut self) {
        for node in self.suite_nodes.with_kind(NodeKind::ReportAfterSuite) {
            self.set_current_report(SpecReport {
                leaf_node_kind: node.kind,
                leaf_node_location: node.code_location.clone(),
                leaf_node_text: node.text.clone(),
                parallel_process: self.config.parallel_process,
                ..SpecReport::default()
            });
            let snapshot = self.snapshot_report();
            self.reporter.will_run(&snapshot);
            self.run_report_after_suite_node(&node);
            self.process_current_spec_report();
        }
    }

    // ------------------------------------------------------------------
    // Suite-level node execution
    // ------------------------------------------------------------------

    fn run_suite_node(&mut self, node: &Node) {
        if self.config.dry_run {
            self.with_current_report(|r| r.state = SpecState::Passed);
            return;
        }

        self.writer_truncate();
        self.interceptor.start_intercepting_output();
        self.with_current_report(|r| r.start_time = Some(SystemTime::now()));

        let mut external_error: Option<String> = None;

        match node.kind {
            NodeKind::BeforeSuite | NodeKind::AfterSuite => {
                let (state, failure) = self.run_node(node, true, "", Invocation::Default);
                self.with_current_report(|r| {
                    r.state = state;
                    r.failure = failure;
                });
            }
            NodeKind::CleanupAfterSuite => {
                if self.is_parallel() && self.is_primary() {
                    if let Some(client) = self.client {
                        if let Err(e) = client.block_until_nonprimary_procs_have_finished() {
                            external_error = Some(e.to_string());
                        }
                    }
                }
                if external_error.is_none() {
                    let (state, failure) = self.run_node(node, true, "", Invocation::Default);
                    self.with_current_report(|r| {
                        r.state = state;
                        r.failure = failure;
                    });
                }
            }
            NodeKind::SynchronizedBeforeSuite => {
                self.run_synchronized_before_suite(node, &mut external_error);
            }
            NodeKind::SynchronizedAfterSuite => {
                self.run_synchronized_after_suite(node, &mut external_error);
            }
            _ => {}
        }

        if let Some(message) = external_error {
            if !self.snapshot_report().state.is_failure() {
                let failure = self.failure_for_leaf_node(node, &message);
                self.with_current_report(|r| {
                    r.state = SpecState::Failed;
                    r.failure = failure;
                });
            }
        }

        let intercepted = self.interceptor.stop_intercepting_and_return_output();
        let writer_output = self.writer_bytes_string();
        self.with_current_report(|r| {
            r.end_time = Some(SystemTime::now());
            r.run_time = elapsed_since(r.start_time);
            r.captured_writer_output = writer_output;
            r.captured_stdout_err.push_str(&intercepted);
        });
    }

    fn run_synchronized_before_suite(&mut self, node: &Node, external_error: &mut Option<String>) {
        let (primary_body, all_procs_body) = match &node.body {
            NodeBody::SyncBeforeSuite { primary, all_procs } => {
                (Rc::clone(primary), Rc::clone(all_procs))
            }
            _ => return,
        };

        let mut data: Vec<u8> = Vec::new();
        let mut run_all_procs = false;

        if self.is_primary() {
            if self.is_parallel() {
                self.interceptor.stop_intercepting_and_return_output();
                if let Some(client) = self.client {
                    self.interceptor
                        .start_intercepting_output_and_forward_to(client);
                }
            }

            let collected: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
            {
                let collected = Rc::clone(&collected);
                let primary_body = Rc::clone(&primary_body);
                let invoke = move || {
                    *collected.borrow_mut() = primary_body();
                };
                let (state, failure) = self.run_node(node, true, "", Invocation::Custom(&invoke));
                self.with_current_report(|r| {
                    r.state = state;
                    r.failure = failure;
                });
            }
            data = collected.take();

            let passed = self.snapshot_report().state == SpecState::Passed;
            if self.is_parallel() {
                let intercepted = self.interceptor.stop_intercepting_and_return_output();
                self.with_current_report(|r| r.captured_stdout_err.push_str(&intercepted));
                self.interceptor.start_intercepting_output();
                if let Some(client) = self.client {
                    let posted = if passed {
                        client.post_synchronized_before_suite_completed(
                            SpecState::Passed,
                            data.clone(),
                        )
                    } else {
                        client.post_synchronized_before_suite_completed(
                            self.snapshot_report().state,
                            Vec::new(),
                        )
                    };
                    if let Err(e) = posted {
                        *external_error = Some(e.to_string());
                    }
                }
            }
            run_all_procs = passed && external_error.is_none();
        } else {
            match self
                .client
                .map(|c| c.block_until_synchronized_before_suite_data())
            {
                Some(Ok((primary_state, payload))) => match primary_state {
                    SpecState::Passed => {
                        run_all_procs = true;
                        data = payload;
                    }
                    SpecState::Failed | SpecState::Panicked => {
                        *external_error =
                            Some(SuiteError::SynchronizedBeforeSuiteFailedOnPrimary.to_string());
                    }
                    other => {
                        self.with_current_report(|r| r.state = other);
                    }
                },
                Some(Err(e)) => *external_error = Some(e.to_string()),
                None => *external_error = Some(ClientError::Missing.to_string()),
            }
        }

        if run_all_procs {
            let invoke = move || all_procs_body(&data);
            let (state, failure) = self.run_node(node, true, "", Invocation::Custom(&invoke));
            self.with_current_report(|r| {
                r.state = state;
                r.failure = failure;
            });
        }
    }

    fn run_synchronized_after_suite(&mut self, node: &Node, external_error: &mut Option<String>) {
        let (all_procs_body, primary_body) = match &node.body {
            NodeBody::SyncAfterSuite { all_procs, primary } => {
                (Rc::clone(all_procs), Rc::clone(primary))
            }
            _ => return,
        };

        let invoke = move || all_procs_body();
        let (state, failure) = self.run_node(node, true, "", Invocation::Custom(&invoke));
        self.with_current_report(|r| {
            r.state = state;
            r.failure = failure;
        });

        if self.is_primary() {
            if self.is_parallel() {
                if let Some(client) = self.client {
                    if let Err(e) = client.block_until_nonprimary_procs_have_finished() {
                        *external_error = Some(e.to_string());
                    }
                }
            }
            if external_error.is_none() {
                if self.is_parallel() {
                    let intercepted = self.interceptor.stop_intercepting_and_return_output();
                    self.with_current_report(|r| r.captured_stdout_err.push_str(&intercepted));
                    if let Some(client) = self.client {
                        self.interceptor
                            .start_intercepting_output_and_forward_to(client);
                    }
                }
                let invoke = move || primary_body();
                let (state, failure) = self.run_node(node, true, "", Invocation::Custom(&invoke));
                if self.snapshot_report().state == SpecState::Passed {
                    self.with_current_report(|r| {
                        r.state = state;
                        r.failure = failure;
                    });
                }
            }
        }
    }

    fn run_report_after_suite_node(&mut self, node: &Node) {
        if self.config.dry_run {
            self.with_current_report(|r| r.state = SpecState::Passed);
            return;
        }

        self.writer_truncate();
        self.interceptor.start_intercepting_output();
        self.with_current_report(|r| r.start_time = Some(SystemTime::now()));

        let mut suite_report = self.report.clone();
        if self.is_parallel() {
            let aggregated = match self
                .client
                .map(|c| c.block_until_aggregated_nonprimary_procs_report())
            {
                Some(Ok(aggregated)) => Ok(aggregated),
                Some(Err(e)) => Err(e.to_string()),
                None => Err(ClientError::Missing.to_string()),
            };
            match aggregated {
                Ok(aggregated) => suite_report = suite_report.add(aggregated),
                Err(message) => {
                    let failure = self.failure_for_leaf_node(node, &message);
                    let intercepted = self.interceptor.stop_intercepting_and_return_output();
                    self.with_current_report(|r| {
                        r.state = SpecState::Failed;
                        r.failure = failure;
                        r.end_time = Some(SystemTime::now());
                        r.run_time = elapsed_since(r.start_time);
                        r.captured_stdout_err.push_str(&intercepted);
                    });
                    return;
                }
            }
        }

        let body = match &node.body {
            NodeBody::ReportSuite(body) => Rc::clone(body),
            _ => return,
        };

        self.interrupt
            .set_interrupt_placeholder_message(report_node_placeholder(node));
        let invoke = move || body(&suite_report);
        let (state, failure) = self.run_node(node, false, "", Invocation::Custom(&invoke));
        self.interrupt.clear_interrupt_placeholder_message();
        self.with_current_report(|r| {
            r.state = state;
            r.failure = failure;
        });

        let intercepted = self.interceptor.stop_intercepting_and_return_output();
        let writer_output = self.writer_bytes_string();
        self.with_current_report(|r| {
            r.end_time = Some(SystemTime::now());
            r.run_time = elapsed_since(r.start_time);
            r.captured_writer_output = writer_output;
            r.captured_stdout_err = intercepted;
        });
    }

    // ------------------------------------------------------------------
    // Report-each fixtures
    // ------------------------------------------------------------------

    /// Runs `ReportBeforeEach`/`ReportAfterEach` nodes against the in-flight
    /// report. These are never interrupted; an inbound interrupt is deferred
    /// with a placeholder message until the node finishes.
    pub(crate) fn report_each(&mut self, spec: &Spec, kind: NodeKind) {
        if self.config.dry_run {
            return;
        }

        let mut nodes = spec.nodes.with_kind(kind);
        if kind == NodeKind::ReportAfterEach {
            nodes = sorted_by_descending_nesting(nodes);
        }
        if kind == NodeKind::ReportBeforeEach {
            nodes = sorted_by_ascending_nesting(nodes);
        }
        if nodes.is_empty() {
            return;
        }

        for node in &nodes {
            self.writer_truncate();
            self.interceptor.start_intercepting_output();
            let snapshot = self.snapshot_report();
            let body = match &node.body {
                NodeBody::ReportEach(body) => Rc::clone(body),
                _ => continue,
            };

            self.interrupt
                .set_interrupt_placeholder_message(report_node_placeholder(node));
            let invoke = move || body(&snapshot);
            let text = best_text_for(spec, node);
            let (state, failure) = self.run_node(node, false, &text, Invocation::Custom(&invoke));
            self.interrupt.clear_interrupt_placeholder_message();

            // A reporter failure only overrides a spec that hasn't already
            // failed; an abort always propagates.
            let current_state = self.snapshot_report().state;
            if (!current_state.is_failure() && state.is_failure()) || state == SpecState::Aborted {
                self.with_current_report(|r| {
                    r.state = state;
                    r.failure = failure;
                });
            }

            let writer_output = self.writer_bytes_string();
            let intercepted = self.interceptor.stop_intercepting_and_return_output();
            self.with_current_report(|r| {
                r.captured_writer_output.push_str(&writer_output);
                r.captured_stdout_err.push_str(&intercepted);
            });
        }
    }

    // ------------------------------------------------------------------
    // Single-node execution
    // ------------------------------------------------------------------

    /// Runs one node body in isolation: installs it as the current node,
    /// catches panics, drains the failer, and folds in a pending interrupt.
    pub(crate) fn run_node(
        &mut self,
        node: &Node,
        interruptible: bool,
        text: &str,
        invocation: Invocation<'_>,
    ) -> (SpecState, Failure) {
        if node.kind.is_cleanup() {
            self.state
                .borrow_mut()
                .cleanup_nodes
                .retain(|n| n.id != node.id);
        }

        self.state.borrow_mut().current_node = Some(node.clone());
        trace!(kind = %node.kind, text, "running node");

        if self.config.emit_spec_progress {
            let display = if text.is_empty() { "TOP-LEVEL" } else { text };
            let line = format!("[{}] {}\n  {}\n", node.kind, display, node.code_location);
            self.writer_append(line.as_bytes());
        }

        let mut failure = Failure {
            node_kind: Some(node.kind),
            node_location: node.code_location.clone(),
            ..Failure::default()
        };
        if node.kind == NodeKind::It || node.kind.is_suite_level() {
            failure.node_context = FailureNodeContext::LeafNode;
        } else if node.nesting_level <= 0 {
            failure.node_context = FailureNodeContext::AtTopLevel;
        } else {
            failure.node_context = FailureNodeContext::InContainer;
            failure.container_index = Some((node.nesting_level - 1) as usize);
        }

        if interruptible && self.interrupt.status().interrupted {
            failure.message = self.interrupt.interrupt_message_with_stack_traces();
            failure.location = node.code_location.clone();
            self.state.borrow_mut().current_node = None;
            return (SpecState::Interrupted, failure);
        }

        let body: Box<dyn Fn() + '_> = match invocation {
            Invocation::Custom(f) => Box::new(move || f()),
            Invocation::Default => match &node.body {
                NodeBody::Standard(f) => {
                    let f = Rc::clone(f);
                    Box::new(move || f())
                }
                _ => Box::new(|| {}),
            },
        };

        let result = catch_unwind(AssertUnwindSafe(|| body()));
        if let Err(payload) = result {
            if payload.downcast_ref::<FailurePanic>().is_none() {
                self.failer.panicked(
                    node.code_location.clone(),
                    panic_payload_message(payload.as_ref()),
                );
            }
        }

        let (outcome, failure_from_run) = self.failer.drain();
        self.state.borrow_mut().current_node = None;

        if outcome == SpecState::Passed {
            return (outcome, Failure::default());
        }
        failure.message = failure_from_run.message;
        failure.location = failure_from_run.location;
        failure.forwarded_panic = failure_from_run.forwarded_panic;
        (outcome, failure)
    }

    /// Emits the finished spec report and folds it into the suite report.
    pub(crate) fn process_current_spec_report(&mut self) {
        let report = self.snapshot_report();
        self.reporter.did_run(&report);
        if self.is_parallel() {
            if let Some(client) = self.client {
                let _ = client.post_did_run(&report);
            }
        }
        if report.state.is_failure() {
            self.report.suite_succeeded = false;
            if self.config.fail_fast || report.state == SpecState::Aborted {
                self.skip_all = true;
                if self.is_parallel() {
                    if let Some(client) = self.client {
                        let _ = client.post_abort();
                    }
                }
            }
        }
        self.report.spec_reports.push(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(text: &str) -> Node {
        let mut node = Node::new(NodeKind::Container, text, CodeLocation::default());
        let body: Box<dyn FnOnce()> = Box::new(|| {});
        node.body = NodeBody::Container(Rc::new(RefCell::new(Some(body))));
        node
    }

    fn enter(suite: &mut Suite, node: Node) {
        match suite.push_node(node) {
            Ok(Pushed::EnterContainer { .. }) => {}
            _ => panic!("expected to enter container"),
        }
    }

    #[test]
    fn top_level_containers_are_queued_not_entered() {
        let mut suite = Suite::new();
        match suite.push_node(container("top")) {
            Ok(Pushed::Done) => {}
            _ => panic!("top-level container should be queued"),
        }
        assert_eq!(suite.begin_build_tree().len(), 1);
    }

    #[test]
    fn before_all_outside_ordered_container_is_rejected() {
        let mut suite = Suite::new();
        suite.phase = Phase::BuildTree;
        enter(&mut suite, container("plain"));
        let err = suite
            .push_node(Node::new(
                NodeKind::BeforeAll,
                "",
                CodeLocation::default(),
            ))
            .err()
            .expect("BeforeAll outside Ordered must fail");
        assert!(matches!(
            err,
            SuiteError::SetupNodeNotInOrderedContainer { .. }
        ));
    }

    #[test]
    fn before_all_inside_ordered_container_is_accepted() {
        let mut suite = Suite::new();
        suite.phase = Phase::BuildTree;
        let mut ordered = container("ordered");
        ordered.ordered = true;
        enter(&mut suite, ordered);
        assert!(suite
            .push_node(Node::new(NodeKind::BeforeAll, "", CodeLocation::default()))
            .is_ok());
    }

    #[test]
    fn serial_node_inside_non_serial_ordered_container_is_rejected() {
        let mut suite = Suite::new();
        suite.phase = Phase::BuildTree;
        let mut ordered = container("ordered");
        ordered.ordered = true;
        enter(&mut suite, ordered);
        let mut it = Node::new(NodeKind::It, "serial leaf", CodeLocation::default());
        it.serial = true;
        let err = suite.push_node(it).err().expect("serial in ordered must fail");
        assert!(matches!(
            err,
            SuiteError::InvalidSerialNodeInNonSerialOrderedContainer { .. }
        ));
    }

    #[test]
    fn serial_node_inside_serial_ordered_container_is_accepted() {
        let mut suite = Suite::new();
        suite.phase = Phase::BuildTree;
        let mut ordered = container("ordered serial");
        ordered.ordered = true;
        ordered.serial = true;
        enter(&mut suite, ordered);
        let mut it = Node::new(NodeKind::It, "serial leaf", CodeLocation::default());
        it.serial = true;
        assert!(suite.push_node(it).is_ok());
    }

    #[test]
    fn duplicate_before_suite_nodes_are_rejected() {
        let mut suite = Suite::new();
        assert!(suite
            .push_node(Node::new(NodeKind::BeforeSuite, "", CodeLocation::default()))
            .is_ok());
        let err = suite
            .push_node(Node::new(
                NodeKind::SynchronizedBeforeSuite,
                "",
                CodeLocation::default(),
            ))
            .err()
            .expect("second before-suite node must fail");
        assert!(matches!(err, SuiteError::MultipleBeforeSuiteNodes { .. }));
    }

    #[test]
    fn suite_nodes_inside_containers_are_rejected() {
        let mut suite = Suite::new();
        suite.phase = Phase::BuildTree;
        enter(&mut suite, container("outer"));
        let err = suite
            .push_node(Node::new(NodeKind::BeforeSuite, "", CodeLocation::default()))
            .err()
            .expect("nested suite node must fail");
        assert!(matches!(err, SuiteError::SuiteNodeInNestedContext { .. }));
    }

    #[test]
    fn pushing_nodes_during_run_phase_is_rejected() {
        let mut suite = Suite::new();
        suite.phase = Phase::Run;
        let err = suite
            .push_node(Node::new(NodeKind::It, "late", CodeLocation::default()))
            .err()
            .expect("push during run must fail");
        assert!(matches!(err, SuiteError::PushingNodeInRunPhase { .. }));
    }

    #[test]
    fn nesting_levels_follow_container_depth() {
        let mut suite = Suite::new();
        suite.phase = Phase::BuildTree;
        enter(&mut suite, container("outer"));
        enter(&mut suite, container("inner"));
        assert!(suite
            .push_node(Node::new(NodeKind::It, "leaf", CodeLocation::default()))
            .is_ok());
        suite.close_container();
        suite.close_container();

        let outer = suite.tree.at_path(&[0]);
        assert_eq!(outer.node.nesting_level, 0);
        let inner = &outer.children[0];
        assert_eq!(inner.node.nesting_level, 1);
        assert_eq!(inner.children[0].node.nesting_level, 2);
    }

    #[test]
    fn cleanup_kind_derives_from_the_running_node() {
        let failer = Arc::new(Failer::new());
        let mut state = RunState {
            failer,
            writer: crate::interfaces::shared_buffer_writer(),
            current_node: None,
            current_spec_report: SpecReport::default(),
            cleanup_nodes: Vec::new(),
        };

        // No running node: rejected.
        assert!(matches!(
            state.push_cleanup(CodeLocation::default(), Rc::new(|| {})),
            Err(SuiteError::PushingCleanupNodeDuringTreeConstruction { .. })
        ));

        let mut before_all = Node::new(NodeKind::BeforeAll, "", CodeLocation::default());
        before_all.nesting_level = 2;
        let generator_id = before_all.id;
        state.current_node = Some(before_all);
        state
            .push_cleanup(CodeLocation::default(), Rc::new(|| {}))
            .expect("cleanup inside BeforeAll");
        let generated = &state.cleanup_nodes[0];
        assert_eq!(generated.kind, NodeKind::CleanupAfterAll);
        assert_eq!(generated.cleanup_generator_id, generator_id);
        assert_eq!(generated.nesting_level, 2);

        // Inside a report node: rejected.
        state.current_node = Some(Node::new(
            NodeKind::ReportAfterEach,
            "",
            CodeLocation::default(),
        ));
        assert!(matches!(
            state.push_cleanup(CodeLocation::default(), Rc::new(|| {})),
            Err(SuiteError::PushingCleanupInReportNode { .. })
        ));

        // Inside another cleanup: rejected.
        state.current_node = Some(Node::new(
            NodeKind::CleanupAfterEach,
            "",
            CodeLocation::default(),
        ));
        assert!(matches!(
            state.push_cleanup(CodeLocation::default(), Rc::new(|| {})),
            Err(SuiteError::PushingCleanupInCleanupNode { .. })
        ));
    }
}
