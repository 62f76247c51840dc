//! Ordered-container lifecycle: before_all/after_all boundaries, mid-group
//! failures, skips from before_all, flake retries, and nested ordered
//! containers with deferred cleanup.

mod common;

use common::{attempts_of, failure_message_of, flaky_failer, run_fixture, state_of, Trace};
use specrun::SpecState;

const SKIP_DUE_TO_EARLIER_FAILURE: &str =
    "Spec skipped because an earlier spec in an ordered container failed";
const SKIP_DUE_TO_BEFORE_ALL_SKIP: &str =
    "Spec skipped because Skip() was called in BeforeAll";

#[test]
fn happy_path_runs_before_all_and_after_all_at_the_boundaries() {
    let rt = Trace::new();
    let result = run_fixture({
        let rt = rt.clone();
        move || {
            specrun::describe("container", {
                let rt = rt.clone();
                move || {
                    specrun::before_all(rt.t("BA"));
                    specrun::it("A", rt.t("A"));
                    specrun::it("B", rt.t("B"));
                    specrun::it("C", rt.t("C"));
                    specrun::after_all(rt.t("AA"));
                }
            })
            .ordered();
        }
    });

    assert!(result.suite_succeeded);
    assert_eq!(rt.records(), vec!["BA", "A", "B", "C", "AA"]);
    for leaf in ["A", "B", "C"] {
        assert_eq!(state_of(&result, leaf), SpecState::Passed);
        assert_eq!(attempts_of(&result, leaf), 1);
    }
}

#[test]
fn mid_group_failure_skips_later_specs_but_still_runs_after_all() {
    let rt = Trace::new();
    let result = run_fixture({
        let rt = rt.clone();
        move || {
            specrun::describe("container", {
                let rt = rt.clone();
                move || {
                    specrun::before_all(rt.t("BA"));
                    specrun::it("A", rt.t("A"));
                    specrun::it("B", rt.t("B"));
                    specrun::it("C", rt.t_with("C", || specrun::fail("boom")));
                    specrun::it("D", rt.t("D"));
                    specrun::it("E", rt.t("E"));
                    specrun::after_all(rt.t("AA"));
                }
            })
            .ordered();
        }
    });

    assert!(!result.suite_succeeded);
    assert_eq!(rt.records(), vec!["BA", "A", "B", "C", "AA"]);
    assert_eq!(state_of(&result, "A"), SpecState::Passed);
    assert_eq!(state_of(&result, "B"), SpecState::Passed);
    assert_eq!(state_of(&result, "C"), SpecState::Failed);
    for leaf in ["D", "E"] {
        assert_eq!(state_of(&result, leaf), SpecState::Skipped);
        assert_eq!(failure_message_of(&result, leaf), SKIP_DUE_TO_EARLIER_FAILURE);
    }
}

#[test]
fn skip_in_before_all_skips_the_whole_group_and_drains_cleanup() {
    let rt = Trace::new();
    let result = run_fixture({
        let rt = rt.clone();
        move || {
            specrun::describe("container", {
                let rt = rt.clone();
                move || {
                    specrun::before_all(rt.t_with("BA", {
                        let rt = rt.clone();
                        move || {
                            specrun::defer_cleanup(rt.t("DC"));
                            specrun::skip("skip");
                        }
                    }));
                    specrun::it("A", rt.t("A")).flake_attempts(3);
                    specrun::it("B", rt.t("B"));
                    specrun::it("C", rt.t("C"));
                    specrun::after_all(rt.t("AA"));
                }
            })
            .ordered();
        }
    });

    assert!(result.suite_succeeded);
    assert_eq!(rt.records(), vec!["BA", "AA", "DC"]);
    assert_eq!(state_of(&result, "A"), SpecState::Skipped);
    assert_eq!(failure_message_of(&result, "A"), "skip");
    assert_eq!(attempts_of(&result, "A"), 1);
    for leaf in ["B", "C"] {
        assert_eq!(state_of(&result, leaf), SpecState::Skipped);
        assert_eq!(
            failure_message_of(&result, leaf),
            SKIP_DUE_TO_BEFORE_ALL_SKIP
        );
    }
}

#[test]
fn flaky_leaf_retries_without_rerunning_before_all_or_after_all() {
    let rt = Trace::new();
    let result = run_fixture({
        let rt = rt.clone();
        move || {
            specrun::describe("container", {
                let rt = rt.clone();
                move || {
                    specrun::before_all(rt.t("BA"));
                    specrun::it("A", rt.t_with("A", flaky_failer(2))).flake_attempts(4);
                    specrun::it("B", rt.t("B"));
                    specrun::it("C", rt.t("C"));
                    specrun::after_all(rt.t("AA"));
                }
            })
            .ordered();
        }
    });

    assert!(result.suite_succeeded);
    assert_eq!(rt.records(), vec!["BA", "A", "A", "A", "B", "C", "AA"]);
    assert_eq!(state_of(&result, "A"), SpecState::Passed);
    assert_eq!(attempts_of(&result, "A"), 3);
    assert_eq!(attempts_of(&result, "B"), 1);
}

#[test]
fn flaky_before_all_reruns_its_after_all_and_cleanups_between_attempts() {
    let rt = Trace::new();
    let result = run_fixture({
        let rt = rt.clone();
        move || {
            specrun::describe("container", {
                let rt = rt.clone();
                move || {
                    specrun::before_all({
                        let rt = rt.clone();
                        let fail_once = flaky_failer(1);
                        move || {
                            rt.t("BA")();
                            specrun::defer_cleanup(rt.t("DC"));
                            fail_once();
                        }
                    });
                    specrun::it("A", rt.t("A")).flake_attempts(2);
                    specrun::it("B", rt.t("B"));
                    specrun::after_all(rt.t("AA"));
                }
            })
            .ordered();
        }
    });

    assert!(result.suite_succeeded);
    // Attempt 1: BA fails, so its AfterAll and generated cleanup run before
    // the retry. Attempt 2: BA passes, A runs; the group boundary at B runs
    // AfterAll and the second cleanup.
    assert_eq!(
        rt.records(),
        vec!["BA", "AA", "DC", "BA", "A", "B", "AA", "DC"]
    );
    assert_eq!(state_of(&result, "A"), SpecState::Passed);
    assert_eq!(attempts_of(&result, "A"), 2);
}

#[test]
fn after_all_panic_is_attributed_to_the_last_running_spec() {
    let rt = Trace::new();
    let result = run_fixture({
        let rt = rt.clone();
        move || {
            specrun::describe("container", {
                let rt = rt.clone();
                move || {
                    specrun::it("A", rt.t("A"));
                    specrun::it("B", rt.t("B"));
                    specrun::after_all(rt.t_with("AA", || panic!("teardown exploded")));
                }
            })
            .ordered();
        }
    });

    assert!(!result.suite_succeeded);
    assert_eq!(rt.records(), vec!["A", "B", "AA"]);
    assert_eq!(state_of(&result, "A"), SpecState::Passed);
    assert_eq!(state_of(&result, "B"), SpecState::Panicked);
    let failure = &result.report.find("B").unwrap().failure;
    assert_eq!(
        failure.forwarded_panic.as_deref(),
        Some("teardown exploded")
    );
}

#[test]
fn after_all_failure_on_last_spec_is_reported_against_that_spec() {
    let rt = Trace::new();
    let result = run_fixture({
        let rt = rt.clone();
        move || {
            specrun::describe("container", {
                let rt = rt.clone();
                move || {
                    specrun::it("A", rt.t("A"));
                    specrun::it("B", rt.t("B"));
                    specrun::after_all(rt.t_with("AA", || specrun::fail("teardown failed")));
                }
            })
            .ordered();
        }
    });

    assert!(!result.suite_succeeded);
    assert_eq!(state_of(&result, "A"), SpecState::Passed);
    assert_eq!(state_of(&result, "B"), SpecState::Failed);
    assert_eq!(failure_message_of(&result, "B"), "teardown failed");
}

#[test]
fn nested_ordered_containers_share_one_group_with_scoped_lifecycles() {
    let rt = Trace::new();
    let result = run_fixture({
        let rt = rt.clone();
        move || {
            specrun::describe("outer", {
                let rt = rt.clone();
                move || {
                    specrun::before_all({
                        let rt = rt.clone();
                        move || {
                            rt.t("BA_O")();
                            specrun::defer_cleanup(rt.t("DC_O"));
                        }
                    });
                    specrun::it("A", rt.t("A"));
                    specrun::it("B", rt.t("B"));
                    specrun::describe("inner", {
                        let rt = rt.clone();
                        move || {
                            specrun::before_all({
                                let rt = rt.clone();
                                move || {
                                    rt.t("BA_I")();
                                    specrun::defer_cleanup(rt.t("DC_I"));
                                }
                            });
                            specrun::it("C", rt.t("C"));
                            specrun::it("D", rt.t("D"));
                            specrun::after_all(rt.t("AA_I"));
                        }
                    })
                    .ordered();
                    specrun::it("E", rt.t("E"));
                    specrun::after_all(rt.t("AA_O"));
                }
            })
            .ordered();
        }
    });

    assert!(result.suite_succeeded);
    assert_eq!(
        rt.records(),
        vec!["BA_O", "A", "B", "BA_I", "C", "D", "AA_I", "DC_I", "E", "AA_O", "DC_O"]
    );
    for leaf in ["A", "B", "C", "D", "E"] {
        assert_eq!(state_of(&result, leaf), SpecState::Passed);
    }
}

#[test]
fn hooks_run_outer_to_inner_before_and_inner_to_outer_after() {
    let rt = Trace::new();
    let result = run_fixture({
        let rt = rt.clone();
        move || {
            specrun::before_each(rt.t("BE1"));
            specrun::after_each(rt.t("AE1"));
            specrun::describe("container", {
                let rt = rt.clone();
                move || {
                    specrun::before_all(rt.t("BA"));
                    specrun::before_each(rt.t("BE2"));
                    specrun::just_before_each(rt.t("JBE"));
                    specrun::it("A", rt.t("A"));
                    specrun::it("B", rt.t("B"));
                    specrun::just_after_each(rt.t("JAE"));
                    specrun::after_each(rt.t("AE2"));
                    specrun::after_all(rt.t("AA"));
                }
            })
            .ordered();
        }
    });

    assert!(result.suite_succeeded);
    assert_eq!(
        rt.records(),
        vec![
            "BE1", "BA", "BE2", "JBE", "A", "JAE", "AE2", "AE1", //
            "BE1", "BE2", "JBE", "B", "JAE", "AE2", "AA", "AE1",
        ]
    );
}

#[test]
fn focused_specs_in_an_ordered_group_still_share_lifecycle() {
    let rt = Trace::new();
    let result = run_fixture({
        let rt = rt.clone();
        move || {
            specrun::describe("container", {
                let rt = rt.clone();
                move || {
                    specrun::before_all(rt.t("BA"));
                    specrun::it("A", rt.t("A"));
                    specrun::fit("B", rt.t("B"));
                    specrun::fit("C", rt.t("C"));
                    specrun::it("D", rt.t("D"));
                    specrun::after_all(rt.t("AA"));
                }
            })
            .ordered();
        }
    });

    assert!(result.suite_succeeded);
    assert!(result.has_programmatic_focus);
    assert_eq!(rt.records(), vec!["BA", "B", "C", "AA"]);
    assert_eq!(state_of(&result, "B"), SpecState::Passed);
    assert_eq!(state_of(&result, "C"), SpecState::Passed);
    assert_eq!(state_of(&result, "A"), SpecState::Skipped);
    assert_eq!(state_of(&result, "D"), SpecState::Skipped);
}

#[test]
fn all_pending_specs_leave_before_all_and_after_all_unrun() {
    let rt = Trace::new();
    let result = run_fixture({
        let rt = rt.clone();
        move || {
            specrun::describe("container", {
                let rt = rt.clone();
                move || {
                    specrun::before_all(rt.t("BA"));
                    specrun::xit("A", rt.t("A"));
                    specrun::xit("B", rt.t("B"));
                    specrun::after_all(rt.t("AA"));
                }
            })
            .ordered();
        }
    });

    assert!(result.suite_succeeded);
    assert!(rt.records().is_empty());
    assert_eq!(state_of(&result, "A"), SpecState::Pending);
    assert_eq!(state_of(&result, "B"), SpecState::Pending);
}
