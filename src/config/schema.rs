//! Configuration schema definitions for testmate.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── TestConfig             - [test]: working dir, parallelism, timeout
//! ├── variables              - [variables]: user-defined ${name} values
//! └── ExecutableConfig[]     - [[executables]]: one per test binary
//!     ├── ExecutorConfig     - optional wrapper program
//!     └── TestOverride{}     - per-test timeout and benchmark limit
//! ```
//!
//! String values other than `name` and `framework` may use `${...}`
//! variables; they are resolved when the executables are loaded.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::framework::FrameworkKind;

/// Root configuration structure.
///
/// # Example
///
/// ```
/// use testmate::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [test]
///     parallel_execution_limit = 2
///
///     [[executables]]
///     path = "build/unit_tests"
/// "#).unwrap();
///
/// assert_eq!(config.test.parallel_execution_limit, 2);
/// assert_eq!(config.executables.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub test: TestConfig,

    /// Extra variables available to every template.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    #[serde(default)]
    pub executables: Vec<ExecutableConfig>,
}

/// Settings shared by every executable.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `working_dir` | None (the workspace directory) |
/// | `parallel_execution_limit` | 1 |
/// | `runtime_limit_secs` | None (no timeout) |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TestConfig {
    /// Default working directory of test processes.
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Maximum number of executable processes running at once.
    #[serde(default = "default_parallel_execution_limit")]
    pub parallel_execution_limit: usize,

    /// Timeout applied to every invocation that sets none of its own.
    #[serde(default)]
    pub runtime_limit_secs: Option<u64>,
}

fn default_parallel_execution_limit() -> usize {
    1
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            parallel_execution_limit: default_parallel_execution_limit(),
            runtime_limit_secs: None,
        }
    }
}

impl TestConfig {
    pub fn runtime_limit(&self) -> Option<Duration> {
        self.runtime_limit_secs.map(Duration::from_secs)
    }
}

/// One test executable.
///
/// ```toml
/// [[executables]]
/// name = "unit"
/// path = "${workspaceFolder}/build/unit_tests"
/// framework = "gtest"
/// args = ["--gtest_brief=0"]
/// cwd = "${absDirpath}"
/// timeout_secs = 30
/// env = { LD_LIBRARY_PATH = "${workspaceFolder}/lib" }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExecutableConfig {
    /// Display name. Defaults to the file name of `path`.
    #[serde(default)]
    pub name: Option<String>,

    pub path: String,

    #[serde(default)]
    pub framework: FrameworkKind,

    /// Arguments added to every invocation.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory. Defaults to `test.working_dir`.
    #[serde(default)]
    pub cwd: Option<String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Benchmark ceiling for the primary metric, in nanoseconds.
    #[serde(default)]
    pub fail_if_exceeds_limit_ns: Option<f64>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub executor: Option<ExecutorConfig>,

    /// Per-test overrides keyed by full test name.
    #[serde(default)]
    pub tests: BTreeMap<String, TestOverride>,
}

impl ExecutableConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            name: None,
            path: path.into(),
            framework: FrameworkKind::default(),
            args: Vec::new(),
            cwd: None,
            timeout_secs: None,
            fail_if_exceeds_limit_ns: None,
            env: BTreeMap::new(),
            executor: None,
            tests: BTreeMap::new(),
        }
    }
}

/// Wrapper program the executable is launched under.
///
/// Without `args` the wrapper receives the executable followed by its
/// arguments.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecutorConfig {
    pub program: String,

    /// Template using `${cmd}` plus one of `${argsFlat}`, `${args}`, or
    /// `${argsStr}`.
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TestOverride {
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub fail_if_exceeds_limit_ns: Option<f64>,
}
