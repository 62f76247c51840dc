//! Console reporter with colored, indented tree output:
//!
//! ```text
//! Calculator
//!   ✓ adds two numbers
//!   when negative
//!     ✓ handles negatives
//!     ✗ fails on overflow
//! ```

use crate::interfaces::Reporter;
use crate::node::NodeKind;
use crate::report::{Report, SpecReport, SpecState};

fn use_color() -> bool {
    // Respect NO_COLOR env var (https://no-color.org/)
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }
    std::io::IsTerminal::is_terminal(&std::io::stdout())
}

fn green(s: &str) -> String {
    if use_color() {
        format!("\x1b[32m{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

fn red(s: &str) -> String {
    if use_color() {
        format!("\x1b[31m{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

fn yellow(s: &str) -> String {
    if use_color() {
        format!("\x1b[33m{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

fn bold(s: &str) -> String {
    if use_color() {
        format!("\x1b[1m{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

fn dim(s: &str) -> String {
    if use_color() {
        format!("\x1b[2m{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

/// The default console reporter.
#[derive(Debug, Default)]
pub struct DefaultReporter {
    printed_hierarchy: Vec<String>,
    failures: Vec<String>,
}

impl DefaultReporter {
    pub fn new() -> Self {
        DefaultReporter::default()
    }

    fn print_hierarchy(&mut self, report: &SpecReport) -> usize {
        let hierarchy = &report.container_hierarchy_texts;
        let mut common = 0;
        while common < hierarchy.len()
            && common < self.printed_hierarchy.len()
            && hierarchy[common] == self.printed_hierarchy[common]
        {
            common += 1;
        }
        for (depth, text) in hierarchy.iter().enumerate().skip(common) {
            println!("{}{}", "  ".repeat(depth), bold(text));
        }
        self.printed_hierarchy = hierarchy.clone();
        hierarchy.len()
    }
}

impl Reporter for DefaultReporter {
    fn suite_will_begin(&mut self, report: &Report) {
        println!();
        if !report.suite_description.is_empty() {
            println!("{}", bold(&report.suite_description));
        }
        println!(
            "{}",
            dim(&format!(
                "Will run {} of {} specs",
                report.pre_run_stats.specs_that_will_run, report.pre_run_stats.total_specs
            ))
        );
        println!();
    }

    fn did_run(&mut self, report: &SpecReport) {
        // Suite-level fixtures only earn a line when they fail.
        if report.leaf_node_kind != NodeKind::It {
            if report.state.is_failure() {
                println!(
                    "{} {} {}",
                    red("✗"),
                    red(&report.leaf_node_kind.to_string()),
                    dim(&report.leaf_node_location.to_string())
                );
                println!("  {}", red(report.failure_message()));
                self.failures.push(format!(
                    "[{}] {}",
                    report.leaf_node_kind,
                    report.failure_message()
                ));
            }
            return;
        }

        let depth = self.print_hierarchy(report);
        let indent = "  ".repeat(depth);
        let name = &report.leaf_node_text;

        let ms = report.run_time.as_millis();
        let time_str = if ms > 100 {
            format!(" {}", dim(&format!("({ms}ms)")))
        } else {
            String::new()
        };

        match report.state {
            SpecState::Passed => {
                println!("{indent}{} {}{}", green("✓"), name, time_str);
            }
            SpecState::Pending => {
                println!("{indent}{} {}", yellow("-"), dim(name));
            }
            SpecState::Skipped => {
                println!("{indent}{} {}", dim("S"), dim(name));
            }
            _ => {
                println!("{indent}{} {}{}", red("✗"), red(name), time_str);
                println!(
                    "{indent}  {}",
                    red(&format!("{}: {}", report.state, report.failure_message()))
                );
                if let Some(forwarded) = &report.failure.forwarded_panic {
                    println!("{indent}  {}", red(forwarded));
                }
                self.failures
                    .push(format!("{}: {}", report.full_text(), report.failure_message()));
            }
        }
    }

    fn suite_did_end(&mut self, report: &Report) {
        let passed = report.count_with_state(SpecState::Passed);
        let failed = report
            .spec_reports
            .iter()
            .filter(|r| r.state.is_failure())
            .count();
        let pending = report.count_with_state(SpecState::Pending);
        let skipped = report.count_with_state(SpecState::Skipped);
        let elapsed_str = format!("{:.3}s", report.run_time.as_secs_f64());

        let parts: Vec<String> = [
            (passed > 0).then(|| green(&format!("{passed} passed"))),
            (failed > 0).then(|| red(&format!("{failed} failed"))),
            (pending > 0).then(|| yellow(&format!("{pending} pending"))),
            (skipped > 0).then(|| dim(&format!("{skipped} skipped"))),
        ]
        .into_iter()
        .flatten()
        .collect();

        let summary = format!("{} ({})", parts.join(", "), dim(&elapsed_str));

        println!();
        if report.suite_succeeded {
            println!("{}", green("PASS"));
            println!("{summary}");
        } else {
            println!("{}", red("FAIL"));
            println!("{summary}");
            if !report.special_suite_failure_reasons.is_empty() {
                println!();
                for reason in &report.special_suite_failure_reasons {
                    println!("  {}", red(reason));
                }
            }
            if !self.failures.is_empty() {
                println!();
                println!("Failures:");
                for (i, failure) in self.failures.iter().enumerate() {
                    println!("  {}. {}", i + 1, failure);
                }
            }
            println!();
        }
    }
}
