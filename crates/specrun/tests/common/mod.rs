#![allow(dead_code)]

//! Shared helpers: a trace recorder for lifecycle ordering assertions and a
//! one-call fixture runner.

use std::cell::RefCell;
use std::rc::Rc;

use specrun::{
    shared_buffer_writer, NoopInterruptHandler, NoopOutputInterceptor, NoopReporter,
    InterruptHandler, RunParams, RunResult, SpecState, SuiteConfig,
};

/// Records labels as bodies run, so tests can assert exact lifecycle order.
#[derive(Clone, Default)]
pub struct Trace(Rc<RefCell<Vec<String>>>);

impl Trace {
    pub fn new() -> Self {
        Trace::default()
    }

    /// A body that records `label`.
    pub fn t(&self, label: &str) -> impl Fn() + 'static {
        let records = Rc::clone(&self.0);
        let label = label.to_string();
        move || records.borrow_mut().push(label.clone())
    }

    /// A body that records `label` and then runs `f`.
    pub fn t_with(&self, label: &str, f: impl Fn() + 'static) -> impl Fn() + 'static {
        let record = self.t(label);
        move || {
            record();
            f();
        }
    }

    pub fn records(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

/// A body that fails the first `n` times it runs and passes afterwards.
pub fn flaky_failer(n: u32) -> impl Fn() + 'static {
    let count = Rc::new(RefCell::new(0u32));
    move || {
        *count.borrow_mut() += 1;
        if *count.borrow() <= n {
            specrun::fail("flake");
        }
    }
}

pub fn run_fixture(body: impl FnOnce()) -> RunResult {
    run_fixture_with(SuiteConfig::default(), body)
}

pub fn run_fixture_with(config: SuiteConfig, body: impl FnOnce()) -> RunResult {
    let handler = NoopInterruptHandler;
    run_fixture_full(config, &handler, body)
}

pub fn run_fixture_full(
    config: SuiteConfig,
    interrupt_handler: &dyn InterruptHandler,
    body: impl FnOnce(),
) -> RunResult {
    specrun::install();
    body();
    let _ = specrun::build_tree();
    let mut reporter = NoopReporter;
    let mut interceptor = NoopOutputInterceptor;
    specrun::run_suite(
        "fixture",
        "",
        RunParams {
            config,
            reporter: &mut reporter,
            writer: shared_buffer_writer(),
            output_interceptor: &mut interceptor,
            interrupt_handler,
            client: None,
        },
    )
}

/// The states of all It-leaf spec reports, in emission order.
pub fn leaf_states(result: &RunResult) -> Vec<SpecState> {
    result
        .report
        .spec_reports
        .iter()
        .filter(|r| r.leaf_node_kind == specrun::NodeKind::It)
        .map(|r| r.state)
        .collect()
}

pub fn state_of(result: &RunResult, leaf_text: &str) -> SpecState {
    result
        .report
        .find(leaf_text)
        .unwrap_or_else(|| panic!("no spec report for {leaf_text:?}"))
        .state
}

pub fn failure_message_of(result: &RunResult, leaf_text: &str) -> String {
    result
        .report
        .find(leaf_text)
        .unwrap_or_else(|| panic!("no spec report for {leaf_text:?}"))
        .failure
        .message
        .clone()
}

pub fn attempts_of(result: &RunResult, leaf_text: &str) -> u32 {
    result
        .report
        .find(leaf_text)
        .unwrap_or_else(|| panic!("no spec report for {leaf_text:?}"))
        .num_attempts
}
