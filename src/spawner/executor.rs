//! Running commands under a wrapper program.
//!
//! An executor template rewrites `program args...` into an invocation of a
//! wrapper such as `valgrind` or `qemu-aarch64`. The template is an argument
//! list for the wrapper that refers to the original invocation through
//! placeholders:
//!
//! | Placeholder | Expands to |
//! |-------------|------------|
//! | `${cmd}` | the original program |
//! | `${argsFlat}` | the original arguments, one element each |
//! | `${args}` | same as `${argsFlat}` (deprecated) |
//! | `${argsStr}` | the original arguments as one quoted string |
//!
//! ```toml
//! [executables.executor]
//! program = "valgrind"
//! args = ["--error-exitcode=1", "${cmd}", "${argsFlat}"]
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Command, SpawnResult, SpawnReturns, Spawner};
use crate::config::ValidationError;
use crate::resolver::{ResolveRule, VariableResolver};

const CMD: &str = "${cmd}";
const ARG_PLACEHOLDERS: [&str; 3] = ["${args}", "${argsFlat}", "${argsStr}"];

/// Checks that an executor template names the program and its arguments.
pub fn validate_template(template: &[String]) -> Result<(), ValidationError> {
    if !template.iter().any(|t| t.contains(CMD)) {
        return Err(ValidationError::ExecutorTemplate(format!(
            "missing {} in {:?}",
            CMD, template
        )));
    }
    let has_args = template
        .iter()
        .any(|t| ARG_PLACEHOLDERS.iter().any(|p| t.contains(p)));
    if !has_args {
        return Err(ValidationError::ExecutorTemplate(format!(
            "missing one of {} in {:?}",
            ARG_PLACEHOLDERS.join(", "),
            template
        )));
    }
    Ok(())
}

/// Quotes arguments for `${argsStr}`: `"` is escaped, and arguments that are
/// empty or contain whitespace or quotes are wrapped in double quotes.
pub fn quote_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            let escaped = arg.replace('"', "\\\"");
            if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"') {
                format!("\"{}\"", escaped)
            } else {
                escaped
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A [`Spawner`] that rewrites every command to run under `executor`.
pub struct SpawnWithExecutor {
    executor: String,
    template: Option<Vec<String>>,
    inner: Arc<dyn Spawner>,
}

impl std::fmt::Debug for SpawnWithExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnWithExecutor")
            .field("executor", &self.executor)
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

impl SpawnWithExecutor {
    /// Fails if `template` is given but lacks `${cmd}` or every argument
    /// placeholder.
    pub fn new(
        executor: impl Into<String>,
        template: Option<Vec<String>>,
        inner: Arc<dyn Spawner>,
    ) -> Result<Self, ValidationError> {
        if let Some(template) = &template {
            validate_template(template)?;
        }
        Ok(Self {
            executor: executor.into(),
            template,
            inner,
        })
    }

    /// Rewrites `cmd` into the wrapped invocation.
    pub async fn wrap(&self, cmd: &Command) -> Command {
        let rules = vec![
            ResolveRule::literal(CMD, cmd.program.clone()),
            ResolveRule::list("${argsFlat}", cmd.args.clone()).flat(),
            ResolveRule::list("${args}", cmd.args.clone()).flat(),
            ResolveRule::literal("${argsStr}", quote_args(&cmd.args)),
        ];
        let resolver = VariableResolver::new(rules);

        let args = match &self.template {
            Some(template) => resolver.resolve_args(template).await,
            None => std::iter::once(cmd.program.clone())
                .chain(cmd.args.iter().cloned())
                .collect(),
        };

        Command {
            program: resolver.resolve_str(&self.executor).await,
            args,
            ..cmd.clone()
        }
    }
}

#[async_trait]
impl Spawner for SpawnWithExecutor {
    async fn spawn_async(
        &self,
        cmd: &Command,
        cancel: &CancellationToken,
    ) -> SpawnResult<SpawnReturns> {
        let wrapped = self.wrap(cmd).await;
        self.inner.spawn_async(&wrapped, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::DefaultSpawner;

    fn template(items: &[&str]) -> Option<Vec<String>> {
        Some(items.iter().map(|s| s.to_string()).collect())
    }

    fn inner() -> Arc<dyn Spawner> {
        Arc::new(DefaultSpawner::new())
    }

    #[test]
    fn test_template_requires_cmd() {
        let err = SpawnWithExecutor::new("wrapper", template(&["${argsFlat}"]), inner())
            .unwrap_err();
        assert!(matches!(err, ValidationError::ExecutorTemplate(_)));
    }

    #[test]
    fn test_template_requires_args() {
        assert!(SpawnWithExecutor::new("wrapper", template(&["${cmd}"]), inner()).is_err());
        assert!(
            SpawnWithExecutor::new("wrapper", template(&["${cmd}", "${args}"]), inner()).is_ok()
        );
    }

    #[tokio::test]
    async fn test_args_str_quoting() {
        let spawner =
            SpawnWithExecutor::new("sh", template(&["-c", "${cmd} ${argsStr}"]), inner()).unwrap();
        let cmd = Command::new("gtest").args(["--flag", "has \"quote\""]);
        let wrapped = spawner.wrap(&cmd).await;

        assert_eq!(wrapped.program, "sh");
        assert_eq!(wrapped.args, vec!["-c", r#"gtest --flag "has \"quote\"""#]);
    }

    #[tokio::test]
    async fn test_flat_args_and_default_template() {
        let cmd = Command::new("./unit")
            .args(["--a", "--b"])
            .working_dir("/tmp");

        let flat = SpawnWithExecutor::new(
            "valgrind",
            template(&["--quiet", "${cmd}", "${argsFlat}"]),
            inner(),
        )
        .unwrap();
        let wrapped = flat.wrap(&cmd).await;
        assert_eq!(wrapped.args, vec!["--quiet", "./unit", "--a", "--b"]);
        assert_eq!(wrapped.working_dir.as_deref(), Some("/tmp"));

        let plain = SpawnWithExecutor::new("valgrind", None, inner()).unwrap();
        assert_eq!(
            plain.wrap(&cmd).await.args,
            vec!["./unit", "--a", "--b"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawns_through_wrapper() {
        let spawner =
            SpawnWithExecutor::new("/bin/sh", template(&["-c", "${cmd} ${argsStr}"]), inner())
                .unwrap();
        let cmd = Command::new("echo").args(["wrapped", "two words"]);
        let result = spawner
            .spawn_async(&cmd, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stdout, "wrapped two words\n");
    }
}
