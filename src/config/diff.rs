//! Which settings changed between two configuration snapshots.

use std::collections::BTreeSet;

use super::Config;

/// Dotted names of the settings a [`ConfigDiff`] can report.
pub mod keys {
    pub const WORKING_DIR: &str = "test.working_dir";
    pub const PARALLEL_EXECUTION_LIMIT: &str = "test.parallel_execution_limit";
    pub const RUNTIME_LIMIT: &str = "test.runtime_limit_secs";
    pub const VARIABLES: &str = "variables";
    pub const EXECUTABLES: &str = "executables";
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    changed: BTreeSet<&'static str>,
}

impl ConfigDiff {
    pub fn between(old: &Config, new: &Config) -> Self {
        let mut changed = BTreeSet::new();
        if old.test.working_dir != new.test.working_dir {
            changed.insert(keys::WORKING_DIR);
        }
        if old.test.parallel_execution_limit != new.test.parallel_execution_limit {
            changed.insert(keys::PARALLEL_EXECUTION_LIMIT);
        }
        if old.test.runtime_limit_secs != new.test.runtime_limit_secs {
            changed.insert(keys::RUNTIME_LIMIT);
        }
        if old.variables != new.variables {
            changed.insert(keys::VARIABLES);
        }
        if old.executables != new.executables {
            changed.insert(keys::EXECUTABLES);
        }
        Self { changed }
    }

    pub fn affects(&self, key: &str) -> bool {
        self.changed.contains(key)
    }

    pub fn affects_any(&self, keys: &[&str]) -> bool {
        keys.iter().any(|k| self.affects(k))
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn changed(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.changed.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutableConfig;

    #[test]
    fn test_identical_configs_have_no_diff() {
        let config = Config::default();
        assert!(ConfigDiff::between(&config, &config.clone()).is_empty());
    }

    #[test]
    fn test_reports_changed_keys() {
        let old = Config::default();
        let mut new = old.clone();
        new.test.parallel_execution_limit = 4;
        new.variables.insert("buildType".into(), "Release".into());
        new.executables.push(ExecutableConfig::new("build/unit"));

        let diff = ConfigDiff::between(&old, &new);
        assert!(diff.affects(keys::PARALLEL_EXECUTION_LIMIT));
        assert!(diff.affects(keys::VARIABLES));
        assert!(diff.affects(keys::EXECUTABLES));
        assert!(!diff.affects(keys::WORKING_DIR));
        assert!(diff.affects_any(&[keys::WORKING_DIR, keys::VARIABLES]));
        assert!(!diff.affects_any(&[keys::WORKING_DIR, keys::RUNTIME_LIMIT]));
        assert_eq!(diff.changed().count(), 3);
    }
}
