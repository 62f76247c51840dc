//! # specrun — a BDD spec execution engine
//!
//! Build a tree of nested groups and examples with closures, then run every
//! enabled example with full lifecycle semantics: `before_each`/`after_each`
//! chains, ordered containers with `before_all`/`after_all`, deferred
//! cleanup, flake retries, focus and pending marks, label filtering, and
//! structured per-spec and per-suite reports.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! fn main() {
//!     let result = specrun::run("Calculator", || {
//!         specrun::describe("Calculator", || {
//!             specrun::it("adds two numbers", || {
//!                 assert_eq!(2 + 3, 5);
//!             });
//!
//!             specrun::describe("ordered workflow", || {
//!                 specrun::before_all(|| { /* expensive setup */ });
//!                 specrun::it("step one", || {});
//!                 specrun::it("step two", || {});
//!                 specrun::after_all(|| { /* teardown */ });
//!             })
//!             .ordered();
//!         });
//!     });
//!     std::process::exit(i32::from(!result.suite_succeeded));
//! }
//! ```
//!
//! Containers queue during the first build phase and their bodies only run
//! once [`build_tree`] is called (the [`run`] convenience does this for
//! you), so suite-level configuration can happen after declaration.
//!
//! The engine is the core of a larger toolchain: output formatting, process
//! forking for parallel runs, signal handling, and stdout capture all plug
//! in through the traits in [`interfaces`].

pub mod config;
pub mod error;
pub mod interfaces;
pub mod report;
pub mod reporter;

mod failer;
mod group;
mod node;
mod spec;
mod suite;
mod tree;

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

pub use config::SuiteConfig;
pub use error::{ClientError, SuiteError};
pub use failer::{RecoverGuard, RecoverHandle};
pub use interfaces::{
    shared_buffer_writer, BufferWriter, Client, InterruptCause, InterruptHandler, InterruptStatus,
    ManualInterruptHandler, NoopInterruptHandler, NoopOutputInterceptor, NoopReporter,
    OutputInterceptor, Reporter, SharedWriter, Writer,
};
pub use node::{CodeLocation, NodeKind};
pub use report::{
    Failure, FailureNodeContext, PreRunStats, Report, ReportEntry, SpecReport, SpecState,
};
pub use reporter::DefaultReporter;
pub use suite::{RunParams, RunResult};

use failer::{panic_payload_message, FailurePanic};
use node::{Node, NodeBody};
use suite::{with_runtime, Pushed, Suite};

// ============================================================================
// The installed suite
// ============================================================================

thread_local! {
    static GLOBAL_SUITE: RefCell<Option<Suite>> = const { RefCell::new(None) };
}

fn with_global_suite<R>(f: impl FnOnce(&mut Suite) -> R) -> R {
    GLOBAL_SUITE.with(|cell| {
        let mut opt = cell.borrow_mut();
        let suite = opt
            .as_mut()
            .expect("specrun: no suite installed; call install() first");
        f(suite)
    })
}

/// Install a fresh suite as the registration target for the node
/// constructors. [`run`] does this for you; call it directly when driving
/// the build/run phases yourself.
pub fn install() {
    GLOBAL_SUITE.with(|cell| *cell.borrow_mut() = Some(Suite::new()));
}

fn report_construction_error(err: SuiteError) {
    // During the run phase a stray constructor call fails the current spec;
    // during the build phases it becomes a build error.
    let in_run_phase = with_runtime(|_| ()).is_some();
    if in_run_phase {
        fail(err.to_string());
    }
    GLOBAL_SUITE.with(|cell| {
        let mut opt = cell.borrow_mut();
        match opt.as_mut() {
            Some(suite) => suite.record_build_error(err),
            None => panic!("specrun: {err}"),
        }
    });
}

/// Push a node into the installed suite, entering container bodies without
/// holding the thread-local borrow so nested constructors can register.
fn register_node(node: Node) {
    let kind = node.kind;
    let location = node.code_location.clone();
    let pushed = GLOBAL_SUITE.with(|cell| {
        let mut opt = cell.borrow_mut();
        match opt.as_mut() {
            Some(suite) => Some(suite.push_node(node)),
            None => None,
        }
    });

    match pushed {
        None => {
            // No suite installed: either a stray call outside run()/install()
            // or a constructor invoked while specs are executing.
            let err = SuiteError::PushingNodeInRunPhase { kind, location };
            if with_runtime(|_| ()).is_some() {
                fail(err.to_string());
            }
            panic!("specrun: no suite installed; call install() first");
        }
        Some(Err(err)) => report_construction_error(err),
        Some(Ok(Pushed::Done)) => {}
        Some(Ok(Pushed::EnterContainer { body, location })) => {
            let body = body.borrow_mut().take();
            let result = catch_unwind(AssertUnwindSafe(|| {
                if let Some(body) = body {
                    body();
                }
            }));
            match result {
                Ok(()) => with_global_suite(|suite| suite.close_container()),
                Err(payload) => {
                    let panic_value = panic_payload_message(payload.as_ref());
                    with_global_suite(|suite| {
                        suite.discard_open_container();
                        suite.record_build_error(SuiteError::CaughtPanicDuringBuildPhase {
                            panic_value,
                            location,
                        });
                    });
                }
            }
        }
    }
}

// ============================================================================
// Container and leaf builders
// ============================================================================

/// Builder returned by [`describe`] and friends. Chain decorations, the
/// node registers when the builder drops (at the semicolon).
pub struct ContainerBuilder {
    node: Option<Node>,
}

impl ContainerBuilder {
    /// Children run in source order and may attach `before_all`/`after_all`.
    pub fn ordered(mut self) -> Self {
        if let Some(node) = &mut self.node {
            node.ordered = true;
        }
        self
    }

    /// Run only on the primary process, after parallel work drains.
    pub fn serial(mut self) -> Self {
        if let Some(node) = &mut self.node {
            node.serial = true;
        }
        self
    }

    /// Allow up to `n` attempts for every spec in this container.
    pub fn flake_attempts(mut self, n: u32) -> Self {
        if let Some(node) = &mut self.node {
            node.flake_attempts = n;
        }
        self
    }

    pub fn labels(mut self, labels: &[&str]) -> Self {
        if let Some(node) = &mut self.node {
            node.labels = labels.iter().map(|s| s.to_string()).collect();
        }
        self
    }
}

impl Drop for ContainerBuilder {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            register_node(node);
        }
    }
}

#[track_caller]
fn describe_impl(
    text: &str,
    focused: bool,
    pending: bool,
    body: impl FnOnce() + 'static,
) -> ContainerBuilder {
    let mut node = Node::new(NodeKind::Container, text, CodeLocation::caller());
    node.focused = focused;
    node.pending = pending;
    let body: Box<dyn FnOnce()> = Box::new(body);
    node.body = NodeBody::Container(Rc::new(RefCell::new(Some(body))));
    ContainerBuilder { node: Some(node) }
}

/// Declare a container. The body queues until [`build_tree`] enters it.
#[track_caller]
pub fn describe(text: &str, body: impl FnOnce() + 'static) -> ContainerBuilder {
    describe_impl(text, false, false, body)
}

/// A focused container: when any node is focused, only focused subtrees run.
#[track_caller]
pub fn fdescribe(text: &str, body: impl FnOnce() + 'static) -> ContainerBuilder {
    describe_impl(text, true, false, body)
}

/// A pending container: every spec beneath it reports Pending.
#[track_caller]
pub fn xdescribe(text: &str, body: impl FnOnce() + 'static) -> ContainerBuilder {
    describe_impl(text, false, true, body)
}

#[track_caller]
pub fn context(text: &str, body: impl FnOnce() + 'static) -> ContainerBuilder {
    describe_impl(text, false, false, body)
}

#[track_caller]
pub fn fcontext(text: &str, body: impl FnOnce() + 'static) -> ContainerBuilder {
    describe_impl(text, true, false, body)
}

#[track_caller]
pub fn xcontext(text: &str, body: impl FnOnce() + 'static) -> ContainerBuilder {
    describe_impl(text, false, true, body)
}

/// Builder returned by [`it`]. Chain decorations, the node registers when
/// the builder drops.
///
/// ```rust,no_run
/// # specrun::install();
/// specrun::it("retries flaky work", || { /* ... */ })
///     .labels(&["integration"])
///     .flake_attempts(3);
/// ```
pub struct ItBuilder {
    node: Option<Node>,
}

impl ItBuilder {
    pub fn labels(mut self, labels: &[&str]) -> Self {
        if let Some(node) = &mut self.node {
            node.labels = labels.iter().map(|s| s.to_string()).collect();
        }
        self
    }

    /// Allow up to `n` attempts before the spec counts as failed.
    pub fn flake_attempts(mut self, n: u32) -> Self {
        if let Some(node) = &mut self.node {
            node.flake_attempts = n;
        }
        self
    }

    /// Run only on the primary process, after parallel work drains.
    pub fn serial(mut self) -> Self {
        if let Some(node) = &mut self.node {
            node.serial = true;
        }
        self
    }
}

impl Drop for ItBuilder {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            register_node(node);
        }
    }
}

#[track_caller]
fn it_impl(text: &str, focused: bool, pending: bool, body: impl Fn() + 'static) -> ItBuilder {
    let mut node = Node::new(NodeKind::It, text, CodeLocation::caller());
    node.focused = focused;
    node.pending = pending;
    node.body = NodeBody::Standard(Rc::new(body));
    ItBuilder { node: Some(node) }
}

/// Declare an example.
#[track_caller]
pub fn it(text: &str, body: impl Fn() + 'static) -> ItBuilder {
    it_impl(text, false, false, body)
}

#[track_caller]
pub fn fit(text: &str, body: impl Fn() + 'static) -> ItBuilder {
    it_impl(text, true, false, body)
}

#[track_caller]
pub fn xit(text: &str, body: impl Fn() + 'static) -> ItBuilder {
    it_impl(text, false, true, body)
}

// ============================================================================
// Setup / teardown constructors
// ============================================================================

#[track_caller]
fn setup_node(kind: NodeKind, body: impl Fn() + 'static) {
    let mut node = Node::new(kind, "", CodeLocation::caller());
    node.body = NodeBody::Standard(Rc::new(body));
    register_node(node);
}

/// Runs before every spec in the enclosing container, outermost first.
#[track_caller]
pub fn before_each(body: impl Fn() + 'static) {
    setup_node(NodeKind::BeforeEach, body);
}

/// Runs after all `before_each` hooks, immediately before the example.
#[track_caller]
pub fn just_before_each(body: impl Fn() + 'static) {
    setup_node(NodeKind::JustBeforeEach, body);
}

/// Runs after every spec in the enclosing container, innermost first.
#[track_caller]
pub fn after_each(body: impl Fn() + 'static) {
    setup_node(NodeKind::AfterEach, body);
}

/// Runs immediately after the example, before the `after_each` chain.
#[track_caller]
pub fn just_after_each(body: impl Fn() + 'static) {
    setup_node(NodeKind::JustAfterEach, body);
}

/// Runs once before the first spec of the enclosing ordered container.
/// Only valid inside a container marked `.ordered()`.
#[track_caller]
pub fn before_all(body: impl Fn() + 'static) {
    setup_node(NodeKind::BeforeAll, body);
}

/// Runs once after the last spec of the enclosing ordered container.
/// Only valid inside a container marked `.ordered()`.
#[track_caller]
pub fn after_all(body: impl Fn() + 'static) {
    setup_node(NodeKind::AfterAll, body);
}

/// Runs once before any spec. At most one before-suite node per suite.
#[track_caller]
pub fn before_suite(body: impl Fn() + 'static) {
    setup_node(NodeKind::BeforeSuite, body);
}

/// Runs once after all specs. At most one after-suite node per suite.
#[track_caller]
pub fn after_suite(body: impl Fn() + 'static) {
    setup_node(NodeKind::AfterSuite, body);
}

/// Split before-suite for parallel runs: `primary` runs on process 1 and its
/// returned payload is delivered to `all_procs` on every process.
#[track_caller]
pub fn synchronized_before_suite(
    primary: impl Fn() -> Vec<u8> + 'static,
    all_procs: impl Fn(&[u8]) + 'static,
) {
    let mut node = Node::new(NodeKind::SynchronizedBeforeSuite, "", CodeLocation::caller());
    node.body = NodeBody::SyncBeforeSuite {
        primary: Rc::new(primary),
        all_procs: Rc::new(all_procs),
    };
    register_node(node);
}

/// Split after-suite for parallel runs: `all_procs` runs everywhere, then
/// `primary` runs on process 1 once the other processes have finished.
#[track_caller]
pub fn synchronized_after_suite(all_procs: impl Fn() + 'static, primary: impl Fn() + 'static) {
    let mut node = Node::new(NodeKind::SynchronizedAfterSuite, "", CodeLocation::caller());
    node.body = NodeBody::SyncAfterSuite {
        all_procs: Rc::new(all_procs),
        primary: Rc::new(primary),
    };
    register_node(node);
}

/// Receives the spec report before the spec runs. Never interrupted.
#[track_caller]
pub fn report_before_each(body: impl Fn(&SpecReport) + 'static) {
    let mut node = Node::new(NodeKind::ReportBeforeEach, "", CodeLocation::caller());
    node.body = NodeBody::ReportEach(Rc::new(body));
    register_node(node);
}

/// Receives the finished spec report after the spec runs. Never interrupted.
#[track_caller]
pub fn report_after_each(body: impl Fn(&SpecReport) + 'static) {
    let mut node = Node::new(NodeKind::ReportAfterEach, "", CodeLocation::caller());
    node.body = NodeBody::ReportEach(Rc::new(body));
    register_node(node);
}

/// Receives the aggregated suite report after the suite ends. In parallel
/// runs it executes on the primary process with every process's reports.
#[track_caller]
pub fn report_after_suite(text: &str, body: impl Fn(&Report) + 'static) {
    let mut node = Node::new(NodeKind::ReportAfterSuite, text, CodeLocation::caller());
    node.body = NodeBody::ReportSuite(Rc::new(body));
    register_node(node);
}

// ============================================================================
// Run-phase primitives
// ============================================================================

/// Fail the current spec with a message and unwind out of the node body.
#[track_caller]
pub fn fail(message: impl Into<String>) -> ! {
    let location = CodeLocation::caller();
    let recorded = with_runtime(|state| {
        state.failer.fail(message.into(), location.clone());
    });
    if recorded.is_none() {
        panic!("specrun: fail() called outside a running spec");
    }
    std::panic::panic_any(FailurePanic);
}

/// Skip the current spec with a reason and unwind out of the node body.
/// A skip inside a `before_all` skips the whole ordered group.
#[track_caller]
pub fn skip(reason: impl Into<String>) -> ! {
    let location = CodeLocation::caller();
    let recorded = with_runtime(|state| {
        state.failer.skip(reason.into(), location.clone());
    });
    if recorded.is_none() {
        panic!("specrun: skip() called outside a running spec");
    }
    std::panic::panic_any(FailurePanic);
}

/// Abort the entire suite: the current spec reports Aborted and every
/// remaining spec is skipped (and, in parallel, peers are told to stop).
#[track_caller]
pub fn abort_suite(message: impl Into<String>) -> ! {
    let location = CodeLocation::caller();
    let recorded = with_runtime(|state| {
        state.failer.abort_suite(message.into(), location.clone());
    });
    if recorded.is_none() {
        panic!("specrun: abort_suite() called outside a running spec");
    }
    std::panic::panic_any(FailurePanic);
}

/// Document a step within a spec. The step lands in the progress writer and
/// therefore in the spec report's captured output.
pub fn by(step: &str) {
    let written = with_runtime(|state| {
        state
            .writer
            .lock()
            .expect("writer mutex poisoned")
            .append(format!("STEP: {step}\n").as_bytes());
    });
    if written.is_none() {
        eprintln!("  STEP: {step}");
    }
}

/// Register a cleanup to run after the current spec (or ordered group, or
/// suite — derived from the node that registers it). LIFO order.
#[track_caller]
pub fn defer_cleanup(body: impl Fn() + 'static) {
    let location = CodeLocation::caller();
    let body: Rc<dyn Fn()> = Rc::new(body);
    let outcome = with_runtime(|state| state.push_cleanup(location.clone(), Rc::clone(&body)));
    match outcome {
        Some(Ok(())) => {}
        Some(Err(err)) => fail(err.to_string()),
        None => report_construction_error(SuiteError::PushingCleanupNodeDuringTreeConstruction {
            location,
        }),
    }
}

/// A snapshot of the report for the spec currently running, with the live
/// progress-writer output attached.
pub fn current_spec_report() -> SpecReport {
    with_runtime(|state| {
        let mut report = state.current_spec_report.clone();
        let bytes = state
            .writer
            .lock()
            .expect("writer mutex poisoned")
            .bytes();
        report.captured_writer_output = String::from_utf8_lossy(&bytes).into_owned();
        report
    })
    .unwrap_or_default()
}

/// Attach a named value to the current spec's report. Only valid while the
/// suite is running.
#[track_caller]
pub fn add_report_entry(name: &str, value: serde_json::Value) {
    let location = CodeLocation::caller();
    let entry = ReportEntry {
        name: name.to_string(),
        time: std::time::SystemTime::now(),
        location: location.clone(),
        value,
    };
    let added = with_runtime(|state| {
        state.current_spec_report.report_entries.push(entry);
    });
    if added.is_none() {
        report_construction_error(SuiteError::AddReportEntryNotDuringRunPhase { location });
    }
}

/// Obtain a handle for routing background-thread panics back to the current
/// node. Create it on the spec thread, move it into the thread, and hold
/// its guard for the thread's lifetime:
///
/// ```rust,no_run
/// # specrun::install();
/// specrun::it("spawns a worker", || {
///     let handle = specrun::recover_handle();
///     std::thread::spawn(move || {
///         let _guard = handle.guard();
///         // a panic here fails the spec instead of being lost
///     });
/// });
/// ```
#[track_caller]
pub fn recover_handle() -> RecoverHandle {
    let location = CodeLocation::caller();
    with_runtime(|state| RecoverHandle {
        failer: Arc::clone(&state.failer),
        location: location.clone(),
    })
    .expect("specrun: recover_handle() called outside a running spec")
}

// ============================================================================
// Build and run
// ============================================================================

/// Enter every queued top-level container, building the tree. Returns the
/// first build error; the suite remembers all of them and a subsequent
/// [`run_suite`] reports a failed suite without running specs.
pub fn build_tree() -> Result<(), SuiteError> {
    let queued = with_global_suite(|suite| suite.begin_build_tree());
    for container in queued {
        register_node(container);
    }
    match with_global_suite(|suite| suite.first_build_error()) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Run the installed suite. Consumes it: a new [`install`] is needed before
/// building another suite on this thread.
pub fn run_suite(description: &str, suite_path: &str, params: RunParams<'_>) -> RunResult {
    let suite = GLOBAL_SUITE.with(|cell| {
        cell.borrow_mut()
            .take()
            .expect("specrun: no suite installed; call install() first")
    });
    suite::run_suite_impl(suite, description, suite_path, params)
}

/// Install a suite, declare it with `body`, build the tree, and run with
/// default wiring: the colored [`DefaultReporter`], a buffer writer, no
/// output interception, no interrupts, single process, configuration from
/// `SPECRUN_*` environment variables.
pub fn run(description: &str, body: impl FnOnce()) -> RunResult {
    install();
    body();
    // Build errors are remembered by the suite and surface in the report.
    let _ = build_tree();
    let mut reporter = DefaultReporter::new();
    let mut interceptor = NoopOutputInterceptor;
    let interrupt_handler = NoopInterruptHandler;
    run_suite(
        description,
        "",
        RunParams {
            config: SuiteConfig::from_env(),
            reporter: &mut reporter,
            writer: shared_buffer_writer(),
            output_interceptor: &mut interceptor,
            interrupt_handler: &interrupt_handler,
            client: None,
        },
    )
}
