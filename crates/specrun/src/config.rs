//! Suite configuration.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Skip every remaining spec after the first failure.
    pub fail_fast: bool,
    /// Treat pending specs as a suite failure.
    pub fail_on_pending: bool,
    /// Walk the whole suite and report, but run nothing.
    pub dry_run: bool,
    /// When positive, overrides per-spec flake attempts suite-wide.
    pub flake_attempts: u32,
    /// Write a `[Kind] text` line to the writer before each node body runs.
    pub emit_spec_progress: bool,
    /// Shuffle the order of spec groups (never of specs within a group).
    pub randomize_groups: bool,
    pub random_seed: u64,
    /// Label filter: `a,b` any-of, `a+b` all-of, `!a` none-of.
    pub label_filter: Option<String>,
    /// 1-based index of this process in a parallel run.
    pub parallel_process: u32,
    pub parallel_total: u32,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        SuiteConfig {
            fail_fast: false,
            fail_on_pending: false,
            dry_run: false,
            flake_attempts: 0,
            emit_spec_progress: false,
            randomize_groups: false,
            random_seed: 1,
            label_filter: None,
            parallel_process: 1,
            parallel_total: 1,
        }
    }
}

impl SuiteConfig {
    /// Read configuration from `SPECRUN_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = SuiteConfig::default();
        config.fail_fast = env_flag("SPECRUN_FAIL_FAST");
        config.fail_on_pending = env_flag("SPECRUN_FAIL_ON_PENDING");
        config.dry_run = env_flag("SPECRUN_DRY_RUN");
        config.emit_spec_progress = env_flag("SPECRUN_PROGRESS");
        if let Ok(v) = std::env::var("SPECRUN_FLAKE_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                config.flake_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("SPECRUN_SEED") {
            if let Ok(seed) = v.parse() {
                config.randomize_groups = true;
                config.random_seed = seed;
            }
        }
        match std::env::var("SPECRUN_LABEL_FILTER") {
            Ok(f) if !f.is_empty() => config.label_filter = Some(f),
            _ => {}
        }
        config
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel_total > 1
    }

    pub fn is_primary_process(&self) -> bool {
        self.parallel_process == 1
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_single_process_source_order() {
        let config = SuiteConfig::default();
        assert!(!config.is_parallel());
        assert!(config.is_primary_process());
        assert!(!config.randomize_groups);
        assert_eq!(config.flake_attempts, 0);
    }

    #[test]
    fn round_trips_through_json() {
        let mut config = SuiteConfig::default();
        config.fail_fast = true;
        config.label_filter = Some("integration,!slow".to_string());
        let json = serde_json::to_string(&config).unwrap();
        let back: SuiteConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
