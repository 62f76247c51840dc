//! Structural validation: invalid node placement, duplicate suite fixtures,
//! and panics during tree construction all become build errors that fail the
//! suite without running any spec.

mod common;

use common::run_fixture;
use specrun::SuiteError;

fn build_error_of(body: impl FnOnce()) -> SuiteError {
    specrun::install();
    body();
    specrun::build_tree().expect_err("expected a build error")
}

#[test]
fn serial_node_inside_non_serial_ordered_container_is_a_build_error() {
    let err = build_error_of(|| {
        specrun::describe("ordered", || {
            specrun::it("serial leaf", || {}).serial();
        })
        .ordered();
    });
    assert!(matches!(
        err,
        SuiteError::InvalidSerialNodeInNonSerialOrderedContainer { .. }
    ));
}

#[test]
fn serial_node_inside_serial_ordered_container_is_accepted() {
    specrun::install();
    specrun::describe("ordered", || {
        specrun::it("serial leaf", || {}).serial();
    })
    .ordered()
    .serial();
    assert!(specrun::build_tree().is_ok());
}

#[test]
fn before_all_outside_an_ordered_container_is_a_build_error() {
    let err = build_error_of(|| {
        specrun::describe("plain", || {
            specrun::before_all(|| {});
            specrun::it("leaf", || {});
        });
    });
    assert!(matches!(
        err,
        SuiteError::SetupNodeNotInOrderedContainer { .. }
    ));
}

#[test]
fn after_all_outside_an_ordered_container_is_a_build_error() {
    let err = build_error_of(|| {
        specrun::describe("plain", || {
            specrun::it("leaf", || {});
            specrun::after_all(|| {});
        });
    });
    assert!(matches!(
        err,
        SuiteError::SetupNodeNotInOrderedContainer { .. }
    ));
}

#[test]
fn two_before_suite_nodes_are_a_build_error() {
    let err = build_error_of(|| {
        specrun::before_suite(|| {});
        specrun::synchronized_before_suite(Vec::new, |_| {});
        specrun::it("leaf", || {});
    });
    assert!(matches!(err, SuiteError::MultipleBeforeSuiteNodes { .. }));
}

#[test]
fn two_after_suite_nodes_are_a_build_error() {
    let err = build_error_of(|| {
        specrun::after_suite(|| {});
        specrun::synchronized_after_suite(|| {}, || {});
        specrun::it("leaf", || {});
    });
    assert!(matches!(err, SuiteError::MultipleAfterSuiteNodes { .. }));
}

#[test]
fn suite_nodes_inside_containers_are_a_build_error() {
    let err = build_error_of(|| {
        specrun::describe("outer", || {
            specrun::before_suite(|| {});
            specrun::it("leaf", || {});
        });
    });
    assert!(matches!(err, SuiteError::SuiteNodeInNestedContext { .. }));
}

#[test]
fn a_panic_in_a_container_body_is_a_build_error_with_location() {
    let err = build_error_of(|| {
        specrun::describe("healthy", || {
            specrun::it("leaf", || {});
        });
        specrun::describe("explodes", || {
            panic!("bad fixture data");
        });
    });
    match err {
        SuiteError::CaughtPanicDuringBuildPhase {
            panic_value,
            location,
        } => {
            assert_eq!(panic_value, "bad fixture data");
            assert!(location.file.ends_with("build_error_test.rs"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn defer_cleanup_during_tree_construction_is_a_build_error() {
    let err = build_error_of(|| {
        specrun::describe("container", || {
            specrun::defer_cleanup(|| {});
            specrun::it("leaf", || {});
        });
    });
    assert!(matches!(
        err,
        SuiteError::PushingCleanupNodeDuringTreeConstruction { .. }
    ));
}

#[test]
fn a_suite_with_build_errors_reports_failure_without_running_specs() {
    let result = run_fixture(|| {
        specrun::describe("ordered-less", || {
            specrun::before_all(|| {});
            specrun::it("leaf", || {});
        });
    });

    assert!(!result.suite_succeeded);
    assert!(result.report.spec_reports.is_empty());
    assert!(result
        .report
        .special_suite_failure_reasons
        .iter()
        .any(|r| r.contains("Ordered container")));
}

#[test]
fn add_report_entry_outside_the_run_phase_is_a_build_error() {
    let err = build_error_of(|| {
        specrun::describe("container", || {
            specrun::add_report_entry("too early", serde_json::json!(1));
            specrun::it("leaf", || {});
        });
    });
    assert!(matches!(
        err,
        SuiteError::AddReportEntryNotDuringRunPhase { .. }
    ));
}
