//! Test framework traits and implementations.
//!
//! A framework knows how to talk to one kind of test executable: which
//! arguments list its tests, how to read that listing, which arguments select
//! a subset for a run, and how to turn the run's output into one
//! [`TestCommit`] per test.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      TestFramework                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  list_args() ─────────► spawn ──► parse_list(stdout)         │
//! │                                        │                     │
//! │                                        ▼                     │
//! │                               Vec<DiscoveredTest>            │
//! │                                                              │
//! │  run_args(selection) ──► spawn ──► parse_run(stdout, tests)  │
//! │                                        │                     │
//! │                                        ▼                     │
//! │                            Vec<(name, TestCommit)>           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Frameworks
//!
//! | Implementation | Target | Discovery |
//! |----------------|--------|-----------|
//! | [`googletest::GoogleTestFramework`] | GoogleTest | `--gtest_list_tests` |
//! | [`benchmark::BenchmarkFramework`] | Google Benchmark | `--benchmark_list_tests=true` |
//!
//! Results are accumulated with [`TestEventBuilder`], which owns the
//! formatting rules shared by every framework.

pub mod benchmark;
pub mod builder;
pub mod googletest;

use serde::{Deserialize, Serialize};

use crate::tree::{TestCommit, TestKind};

pub use builder::TestEventBuilder;

/// Result type for framework operations.
pub type FrameworkResult<T> = Result<T, FrameworkError>;

#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    /// The test listing could not be understood.
    #[error("Failed to parse test list: {0}")]
    ListParse(String),

    /// Structured run output was malformed.
    #[error("Failed to parse test output: {0}")]
    OutputParse(String),
}

/// Output dialect of an executable, as chosen in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameworkKind {
    #[default]
    Gtest,
    Benchmark,
}

impl FrameworkKind {
    pub fn framework(self) -> Box<dyn TestFramework> {
        match self {
            FrameworkKind::Gtest => Box::new(googletest::GoogleTestFramework),
            FrameworkKind::Benchmark => Box::new(benchmark::BenchmarkFramework),
        }
    }

    /// The tree-level kind for a test of this framework.
    pub fn test_kind(self, fail_if_exceeds_limit_ns: Option<f64>) -> TestKind {
        match self {
            FrameworkKind::Gtest => TestKind::GoogleTest,
            FrameworkKind::Benchmark => TestKind::GoogleBenchmark {
                fail_if_exceeds_limit_ns,
            },
        }
    }
}

impl std::fmt::Display for FrameworkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameworkKind::Gtest => f.write_str("gtest"),
            FrameworkKind::Benchmark => f.write_str("benchmark"),
        }
    }
}

/// One test reported by an executable's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTest {
    /// Labels of the intermediate suites, outermost first. Empty for tests
    /// that sit directly under the executable.
    pub suite_path: Vec<String>,
    pub label: String,
    /// Full name used for filtering and for matching run output.
    pub name: String,
    pub skipped: bool,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// A test about to be run, as the parsers need to see it.
#[derive(Debug, Clone, PartialEq)]
pub struct TestTarget {
    pub name: String,
    pub limit_ns: Option<f64>,
}

/// Which tests a run covers.
#[derive(Debug, Clone, Copy)]
pub enum RunSelection<'a> {
    All,
    Subset {
        names: &'a [String],
        /// A disabled test was selected explicitly.
        include_disabled: bool,
    },
}

pub trait TestFramework: Send + Sync {
    /// Arguments that make the executable print its tests.
    fn list_args(&self) -> Vec<String>;

    fn parse_list(&self, stdout: &str) -> FrameworkResult<Vec<DiscoveredTest>>;

    /// Arguments that run `selection`.
    fn run_args(&self, selection: RunSelection<'_>) -> Vec<String>;

    /// Interprets run output. Tests absent from the output are absent from
    /// the result; the caller decides what happened to them.
    fn parse_run(
        &self,
        stdout: &str,
        targets: &[TestTarget],
    ) -> FrameworkResult<Vec<(String, TestCommit)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framework_kind_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            framework: FrameworkKind,
        }
        let w: Wrapper = toml::from_str("framework = \"benchmark\"").unwrap();
        assert_eq!(w.framework, FrameworkKind::Benchmark);
        assert_eq!(w.framework.to_string(), "benchmark");
    }

    #[test]
    fn test_kind_carries_limit() {
        assert_eq!(
            FrameworkKind::Benchmark.test_kind(Some(5.0)),
            TestKind::GoogleBenchmark {
                fail_if_exceeds_limit_ns: Some(5.0)
            }
        );
        assert_eq!(FrameworkKind::Gtest.test_kind(Some(5.0)), TestKind::GoogleTest);
    }
}
