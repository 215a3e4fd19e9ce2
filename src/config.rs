//! Configuration loading and validation for testmate.
//!
//! Configuration lives in a TOML file (`testmate.toml` by default). Loading
//! parses it into an immutable [`Config`] snapshot; [`Config::validate`]
//! rejects settings the engine cannot work with. Reacting to changes is
//! done by comparing two snapshots with [`ConfigDiff`].
//!
//! ```toml
//! [test]
//! working_dir = "${workspaceFolder}/build"
//! parallel_execution_limit = 4
//! runtime_limit_secs = 60
//!
//! [variables]
//! buildType = "Debug"
//!
//! [[executables]]
//! path = "${workspaceFolder}/build/unit_tests"
//!
//! [[executables]]
//! path = "${workspaceFolder}/build/bench"
//! framework = "benchmark"
//! fail_if_exceeds_limit_ns = 1000000
//!
//! [executables.executor]
//! program = "taskset"
//! args = ["-c", "0", "${cmd}", "${argsFlat}"]
//! ```

pub mod diff;
pub mod schema;

pub use diff::{ConfigDiff, keys};
pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

use crate::spawner::executor::validate_template;

/// Settings the engine refuses to start with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("test.parallel_execution_limit must be at least 1")]
    ParallelLimit,

    #[error("executables[{index}]: path must not be empty")]
    EmptyPath { index: usize },

    #[error("Invalid executor template: {0}")]
    ExecutorTemplate(String),
}

impl Config {
    /// Checks the snapshot for settings that cannot work.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.test.parallel_execution_limit == 0 {
            return Err(ValidationError::ParallelLimit);
        }
        for (index, exe) in self.executables.iter().enumerate() {
            if exe.path.trim().is_empty() {
                return Err(ValidationError::EmptyPath { index });
            }
            if let Some(executor) = &exe.executor
                && let Some(template) = &executor.args
            {
                validate_template(template)?;
            }
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use testmate::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testmate.toml"))?;
/// println!("Parallel limit: {}", config.test.parallel_execution_limit);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// ```
/// use testmate::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [test]
///     parallel_execution_limit = 4
/// "#)?;
///
/// assert_eq!(config.test.parallel_execution_limit, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::FrameworkKind;

    const FULL: &str = r#"
        [test]
        working_dir = "${workspaceFolder}/build"
        parallel_execution_limit = 3
        runtime_limit_secs = 60

        [variables]
        buildType = "Debug"

        [[executables]]
        name = "unit"
        path = "${workspaceFolder}/build/unit_tests"
        args = ["--gtest_brief=0"]
        env = { GTEST_SHUFFLE = "0" }

        [[executables]]
        path = "bench"
        framework = "benchmark"
        fail_if_exceeds_limit_ns = 1000000

        [executables.executor]
        program = "valgrind"
        args = ["--error-exitcode=1", "${cmd}", "${argsFlat}"]

        [executables.tests."BM_Sort/1024"]
        timeout_secs = 5
        fail_if_exceeds_limit_ns = 500000
    "#;

    #[test]
    fn test_load_full_config() {
        let config = load_config_str(FULL).unwrap();
        assert_eq!(config.test.parallel_execution_limit, 3);
        assert_eq!(config.test.runtime_limit_secs, Some(60));
        assert_eq!(config.variables["buildType"], "Debug");

        let unit = &config.executables[0];
        assert_eq!(unit.name.as_deref(), Some("unit"));
        assert_eq!(unit.framework, FrameworkKind::Gtest);
        assert_eq!(unit.env["GTEST_SHUFFLE"], "0");

        let bench = &config.executables[1];
        assert_eq!(bench.framework, FrameworkKind::Benchmark);
        assert_eq!(bench.executor.as_ref().unwrap().program, "valgrind");
        assert_eq!(bench.tests["BM_Sort/1024"].timeout_secs, Some(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.test.parallel_execution_limit, 1);
        assert!(config.executables.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = load_config_str(FULL).unwrap();
        config.test.parallel_execution_limit = 0;
        assert_eq!(config.validate(), Err(ValidationError::ParallelLimit));

        let mut config = load_config_str(FULL).unwrap();
        config.executables[0].path = " ".into();
        assert_eq!(config.validate(), Err(ValidationError::EmptyPath { index: 0 }));

        let mut config = load_config_str(FULL).unwrap();
        config.executables[1].executor = Some(ExecutorConfig {
            program: "valgrind".into(),
            args: Some(vec!["${argsFlat}".into()]),
        });
        assert!(matches!(
            config.validate(),
            Err(ValidationError::ExecutorTemplate(_))
        ));
    }

    #[test]
    fn test_load_config_reports_path() {
        let err = load_config(Path::new("/nonexistent/testmate.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/testmate.toml"));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(load_config_str("[test\nparallel").is_err());
    }
}
