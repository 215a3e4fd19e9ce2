//! One test executable and the subtree it produced.
//!
//! A [`Runnable`] owns everything needed to talk to one executable: its
//! resolved [`ExecutableSpec`], the output dialect, and a spawner (wrapped in
//! [`SpawnWithExecutor`] when the configuration names a wrapper). It
//! discovers tests with [`Runnable::load`] and runs them with
//! [`Runnable::run_all`], [`Runnable::run_filtered`] or [`Runnable::run_one`].
//!
//! # Lifecycle of a run
//!
//! 1. Take the runnable's run lock (one invocation at a time).
//! 2. Wait for a [`TaskPool`] slot, unless the request is cancelled first.
//! 3. Mark the selected tests running.
//! 4. Spawn with the effective timeout.
//! 5. Parse the output and commit exactly one terminal result per test.
//!
//! Spawn failures, timeouts, cancellation, and malformed output all end in
//! `Errored` results; they never escape a run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ExecutableConfig, ExecutorConfig, TestConfig, TestOverride, ValidationError};
use crate::format::normalize_path;
use crate::framework::{
    DiscoveredTest, FrameworkError, FrameworkKind, RunSelection, TestEventBuilder, TestFramework,
    TestTarget,
};
use crate::pool::TaskPool;
use crate::resolver::{ResolveRule, VariableResolver};
use crate::spawner::{Command, SpawnError, SpawnReturns, SpawnWithExecutor, Spawner};
use crate::tree::{self, NodeId, RunId, SharedTree, Suite, Test, TestCommit};

pub use crate::tree::RunnableId;

#[derive(Debug, thiserror::Error)]
pub enum RunnableError {
    #[error("Discovery of {name} failed: {reason}")]
    Discovery { name: String, reason: String },

    #[error("Failed to run {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: SpawnError,
    },

    #[error("{0} is already running")]
    Busy(String),

    #[error("{0} was disposed")]
    Disposed(String),

    #[error(transparent)]
    Parse(#[from] FrameworkError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// An executable's configuration with every variable resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutableSpec {
    pub name: String,
    pub path: String,
    pub framework: FrameworkKind,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: Vec<(String, String)>,
    /// Executable timeout, falling back to the global runtime limit.
    pub timeout: Option<Duration>,
    pub fail_if_exceeds_limit_ns: Option<f64>,
    /// Wrapper program; its template keeps the `${cmd}`-style placeholders.
    pub executor: Option<ExecutorConfig>,
    pub overrides: BTreeMap<String, TestOverride>,
}

impl ExecutableSpec {
    /// Resolves `config` against the workspace variables.
    ///
    /// Besides the workspace variables, every string may use `${absPath}`,
    /// `${relPath}`, `${filename}`, `${absDirpath}` and `${name}`; `args`,
    /// `env` and the executor additionally see `${cwd}`, `${cwdFilename}` and
    /// `${cwdDirpath}`.
    pub async fn resolve(
        config: &ExecutableConfig,
        test: &TestConfig,
        workspace: Arc<VariableResolver>,
        workspace_dir: &Path,
    ) -> Self {
        let raw_path = workspace.resolve_str(&config.path).await;
        let path = absolute(workspace_dir, &shellexpand::tilde(&raw_path));

        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dirpath = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rel_path = path
            .strip_prefix(workspace_dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        let name = config.name.clone().unwrap_or_else(|| filename.clone());
        let path_str = path.to_string_lossy().into_owned();

        let base = Arc::new(VariableResolver::with_parent(
            vec![
                ResolveRule::literal("${absPath}", path_str.clone()),
                ResolveRule::literal("${relPath}", rel_path),
                ResolveRule::literal("${filename}", filename),
                ResolveRule::literal("${absDirpath}", dirpath),
                ResolveRule::literal("${name}", name.clone()),
            ],
            workspace,
        ));

        let cwd = match config.cwd.as_ref().or(test.working_dir.as_ref()) {
            Some(template) => {
                let resolved = base.resolve_str(template).await;
                absolute(workspace_dir, &shellexpand::tilde(&resolved))
            }
            None => workspace_dir.to_path_buf(),
        };
        let cwd = cwd.to_string_lossy().into_owned();

        let resolver = VariableResolver::with_parent(
            VariableResolver::path_rules("cwd", Path::new(&cwd)),
            base,
        );

        let args = resolver.resolve_args(&config.args).await;
        let env_pairs: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let env = resolver.resolve_env(&env_pairs).await;

        let executor = match &config.executor {
            Some(executor) => Some(ExecutorConfig {
                program: resolver.resolve_str(&executor.program).await,
                args: match &executor.args {
                    Some(template) => Some(resolver.resolve_args(template).await),
                    None => None,
                },
            }),
            None => None,
        };

        Self {
            name,
            path: path_str,
            framework: config.framework,
            args,
            cwd,
            env,
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .or_else(|| test.runtime_limit()),
            fail_if_exceeds_limit_ns: config.fail_if_exceeds_limit_ns,
            executor,
            overrides: config.tests.clone(),
        }
    }

    fn test_timeout(&self, name: &str) -> Option<Duration> {
        self.overrides
            .get(name)
            .and_then(|o| o.timeout_secs)
            .map(Duration::from_secs)
    }

    fn test_limit(&self, name: &str) -> Option<f64> {
        self.overrides
            .get(name)
            .and_then(|o| o.fail_if_exceeds_limit_ns)
            .or(self.fail_if_exceeds_limit_ns)
    }
}

fn absolute(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&base.join(path))
    }
}

pub struct Runnable {
    id: RunnableId,
    spec: ExecutableSpec,
    framework: Box<dyn TestFramework>,
    spawner: Arc<dyn Spawner>,
    pool: TaskPool,
    tree: SharedTree,
    parent: NodeId,
    suite: Mutex<Option<NodeId>>,
    run_lock: tokio::sync::Mutex<()>,
    disposed: CancellationToken,
}

impl std::fmt::Debug for Runnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runnable")
            .field("id", &self.id)
            .field("name", &self.spec.name)
            .field("path", &self.spec.path)
            .finish_non_exhaustive()
    }
}

/// Tests picked for one invocation.
struct Batch {
    ids: Vec<NodeId>,
    targets: Vec<TestTarget>,
    include_disabled: bool,
    timeout: Option<Duration>,
}

impl Runnable {
    /// Creates a runnable whose subtree will hang below `parent`.
    ///
    /// Fails if the executor template is invalid.
    pub fn new(
        spec: ExecutableSpec,
        spawner: Arc<dyn Spawner>,
        pool: TaskPool,
        tree: SharedTree,
        parent: NodeId,
    ) -> Result<Self, RunnableError> {
        let spawner: Arc<dyn Spawner> = match &spec.executor {
            Some(executor) => Arc::new(SpawnWithExecutor::new(
                executor.program.clone(),
                executor.args.clone(),
                spawner,
            )?),
            None => spawner,
        };
        Ok(Self {
            id: RunnableId::new(),
            framework: spec.framework.framework(),
            spec,
            spawner,
            pool,
            tree,
            parent,
            suite: Mutex::new(None),
            run_lock: tokio::sync::Mutex::new(()),
            disposed: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> RunnableId {
        self.id
    }

    pub fn spec(&self) -> &ExecutableSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The executable's suite, once loaded.
    pub fn suite(&self) -> Option<NodeId> {
        *self.suite.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// Whether a run is in flight.
    pub fn is_busy(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    fn command(&self, extra: Vec<String>, timeout: Option<Duration>) -> Command {
        Command::new(self.spec.path.clone())
            .args(self.spec.args.iter().cloned())
            .args(extra)
            .working_dir(self.spec.cwd.clone())
            .envs(self.spec.env.iter().cloned())
            .maybe_timeout(timeout)
    }

    /// Discovers the executable's tests and reconciles the subtree.
    ///
    /// The tree is untouched unless discovery succeeds. Returns the number of
    /// tests found.
    pub async fn load(&self) -> Result<usize, RunnableError> {
        if self.is_disposed() {
            return Err(RunnableError::Disposed(self.spec.name.clone()));
        }

        let cmd = self.command(self.framework.list_args(), self.spec.timeout);
        let output = self
            .pool
            .schedule(self.spawner.spawn_async(&cmd, &self.disposed))
            .await
            .map_err(|source| RunnableError::Spawn {
                name: self.spec.name.clone(),
                source,
            })?;

        if !output.success() {
            return Err(RunnableError::Discovery {
                name: self.spec.name.clone(),
                reason: format!(
                    "exited with code {:?}: {}",
                    output.status,
                    output.stderr.trim()
                ),
            });
        }

        let discovered = self.framework.parse_list(&output.stdout)?;
        if self.is_disposed() {
            return Err(RunnableError::Disposed(self.spec.name.clone()));
        }
        let count = discovered.len();
        self.reconcile(discovered);
        info!("Loaded {} tests from {}", count, self.spec.name);
        Ok(count)
    }

    fn reconcile(&self, discovered: Vec<DiscoveredTest>) {
        let mut tree = tree::lock(&self.tree);
        let mut suite_slot = self.suite.lock().unwrap_or_else(PoisonError::into_inner);

        if discovered.is_empty() {
            if let Some(existing) = suite_slot.take() {
                tree.remove(existing);
            }
            return;
        }

        let exe = match *suite_slot {
            Some(id) if tree.contains(id) => id,
            _ => {
                let suite = Suite::new(self.spec.name.clone())
                    .with_tooltip(format!("Path: {}\nCwd: {}", self.spec.path, self.spec.cwd));
                let Some(id) = tree.add_suite(self.parent, suite) else {
                    return;
                };
                id
            }
        };
        *suite_slot = Some(exe);

        let mut keep = HashSet::new();
        for found in discovered {
            let mut parent = exe;
            for label in &found.suite_path {
                let child = match tree.find_child_suite(parent, label) {
                    Some(id) => id,
                    None => match tree.add_suite(parent, Suite::new(label.clone())) {
                        Some(id) => id,
                        None => break,
                    },
                };
                tree.move_to_end(parent, child);
                parent = child;
            }

            let test = Test::new(
                found.label,
                found.name.clone(),
                self.id,
                self.spec
                    .framework
                    .test_kind(self.spec.test_limit(&found.name)),
            )
            .skipped(found.skipped)
            .with_timeout(self.spec.test_timeout(&found.name));

            let id = match tree.find_child_test(parent, &found.name) {
                Some(id) => {
                    if let Some(existing) = tree.test_mut(id) {
                        existing.update_from(test);
                    }
                    tree.move_to_end(parent, id);
                    id
                }
                None => match tree.add_test(parent, test) {
                    Some(id) => id,
                    None => continue,
                },
            };
            tree.set_test_location(id, found.file, found.line);
            keep.insert(id);
        }

        for stale in tree.tests_under(exe) {
            if !keep.contains(&stale) && tree.contains(stale) {
                debug!("Removing test {} no longer reported by {}", stale, self.spec.name);
                tree.remove(stale);
            }
        }
    }

    /// Runs every non-skipped test, waiting for an in-flight run to finish.
    pub async fn run_all(
        &self,
        run_id: RunId,
        cancel: &CancellationToken,
    ) -> Result<(), RunnableError> {
        let _guard = tokio::select! {
            guard = self.run_lock.lock() => guard,
            _ = cancel.cancelled() => return Ok(()),
            _ = self.disposed.cancelled() => {
                return Err(RunnableError::Disposed(self.spec.name.clone()));
            }
        };
        let batch = self.batch(|_, test| !test.skipped, false);
        self.execute(batch, RunSelection::All, run_id, cancel).await
    }

    /// Runs the tests matching `predicate`. Rejected while a run is in flight.
    pub async fn run_filtered<F>(
        &self,
        predicate: F,
        run_id: RunId,
        cancel: &CancellationToken,
    ) -> Result<(), RunnableError>
    where
        F: Fn(NodeId, &Test) -> bool,
    {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("Rejecting run of {}: a run is already in flight", self.spec.name);
            return Err(RunnableError::Busy(self.spec.name.clone()));
        };
        let batch = self.batch(predicate, false);
        self.execute_subset(batch, run_id, cancel).await
    }

    /// Runs a single test, honoring its own timeout override.
    pub async fn run_one(
        &self,
        test: NodeId,
        run_id: RunId,
        cancel: &CancellationToken,
    ) -> Result<(), RunnableError> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("Rejecting run of {}: a run is already in flight", self.spec.name);
            return Err(RunnableError::Busy(self.spec.name.clone()));
        };
        let batch = self.batch(|id, _| id == test, true);
        self.execute_subset(batch, run_id, cancel).await
    }

    async fn execute_subset(
        &self,
        batch: Batch,
        run_id: RunId,
        cancel: &CancellationToken,
    ) -> Result<(), RunnableError> {
        let names: Vec<String> = batch.targets.iter().map(|t| t.name.clone()).collect();
        let selection = RunSelection::Subset {
            names: &names,
            include_disabled: batch.include_disabled,
        };
        self.execute(batch, selection, run_id, cancel).await
    }

    fn batch<F>(&self, predicate: F, single: bool) -> Batch
    where
        F: Fn(NodeId, &Test) -> bool,
    {
        let tree = tree::lock(&self.tree);
        let mut batch = Batch {
            ids: Vec::new(),
            targets: Vec::new(),
            include_disabled: false,
            timeout: self.spec.timeout,
        };
        let Some(exe) = self.suite() else {
            return batch;
        };
        for id in tree.tests_under(exe) {
            let Some(test) = tree.test(id) else {
                continue;
            };
            if !predicate(id, test) {
                continue;
            }
            batch.include_disabled |= test.skipped;
            batch.targets.push(TestTarget {
                name: test.name.clone(),
                limit_ns: test.limit_ns(),
            });
            batch.ids.push(id);
            if single && test.timeout.is_some() {
                batch.timeout = test.timeout;
            }
        }
        batch
    }

    async fn execute(
        &self,
        batch: Batch,
        selection: RunSelection<'_>,
        run_id: RunId,
        cancel: &CancellationToken,
    ) -> Result<(), RunnableError> {
        if batch.ids.is_empty() {
            return Ok(());
        }

        // Either the request or disposal kills the process.
        let token = self.disposed.child_token();
        let link = {
            let cancel = cancel.clone();
            let token = token.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                token.cancel();
            })
        };
        let result = self.execute_inner(batch, selection, run_id, &token).await;
        link.abort();
        result
    }

    async fn execute_inner(
        &self,
        batch: Batch,
        selection: RunSelection<'_>,
        run_id: RunId,
        token: &CancellationToken,
    ) -> Result<(), RunnableError> {
        let _permit = tokio::select! {
            permit = self.pool.acquire() => permit,
            _ = token.cancelled() => {
                debug!("Run of {} cancelled before it started", self.spec.name);
                return Ok(());
            }
        };

        let started: Vec<NodeId> = {
            let mut tree = tree::lock(&self.tree);
            batch
                .ids
                .iter()
                .copied()
                .filter(|id| tree.mark_running(*id, run_id))
                .collect()
        };
        let started_set: HashSet<NodeId> = started.iter().copied().collect();
        let targets: Vec<(NodeId, TestTarget)> = batch
            .ids
            .iter()
            .copied()
            .zip(batch.targets)
            .filter(|(id, _)| started_set.contains(id))
            .collect();

        let cmd = self.command(self.framework.run_args(selection), batch.timeout);
        info!("Running {} test(s) of {}", targets.len(), self.spec.name);
        let result = self.spawner.spawn_async(&cmd, token).await;

        let commits = self.interpret(result, &targets);
        let mut tree = tree::lock(&self.tree);
        for (id, commit) in commits {
            tree.apply(id, run_id, commit);
        }
        Ok(())
    }

    /// Maps the outcome of one invocation to one result per started test.
    fn interpret(
        &self,
        result: Result<SpawnReturns, SpawnError>,
        targets: &[(NodeId, TestTarget)],
    ) -> Vec<(NodeId, TestCommit)> {
        let all = |commit: TestCommit| -> Vec<(NodeId, TestCommit)> {
            targets.iter().map(|(id, _)| (*id, commit.clone())).collect()
        };

        match result {
            Ok(output) => {
                let missing = format!(
                    "❗️ The test produced no result (exit code {}).",
                    output
                        .status
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                );
                self.parse_output(&output, &missing, targets)
            }
            Err(SpawnError::Timeout { after, .. }) => all(TestEventBuilder::timed_out(after)),
            Err(SpawnError::Cancelled { .. }) => {
                all(TestEventBuilder::errored_with("🚫 The run was cancelled.", ""))
            }
            Err(SpawnError::Signal { signal, output }) => {
                let missing = format!("❗️ The executable was terminated by {}.", signal);
                self.parse_output(&output, &missing, targets)
            }
            Err(e @ (SpawnError::Start { .. } | SpawnError::Io(_))) => all(
                TestEventBuilder::errored_with(format!("❗️ {}", e), ""),
            ),
        }
    }

    fn parse_output(
        &self,
        output: &SpawnReturns,
        missing: &str,
        targets: &[(NodeId, TestTarget)],
    ) -> Vec<(NodeId, TestCommit)> {
        let plain: Vec<TestTarget> = targets.iter().map(|(_, t)| t.clone()).collect();
        match self.framework.parse_run(&output.stdout, &plain) {
            Ok(results) => {
                let mut by_name: HashMap<String, TestCommit> = results.into_iter().collect();
                targets
                    .iter()
                    .map(|(id, target)| {
                        let commit = by_name.remove(&target.name).unwrap_or_else(|| {
                            TestEventBuilder::errored_with(missing, &output.stderr)
                        });
                        (*id, commit)
                    })
                    .collect()
            }
            Err(e) => {
                let commit = TestEventBuilder::errored_with(
                    format!("Unexpected error: {}", e),
                    &output.stdout,
                );
                targets.iter().map(|(id, _)| (*id, commit.clone())).collect()
            }
        }
    }

    /// Cancels in-flight processes and detaches the subtree.
    pub fn dispose(&self) {
        self.disposed.cancel();
        let suite = self
            .suite
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(suite) = suite {
            tree::lock(&self.tree).remove(suite);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::spawner::DefaultSpawner;
    use crate::tree::{EventSink, TestState, Tree};

    const GTEST_SCRIPT: &str = r#"
case "$1" in
  --gtest_list_tests)
    cat "$(dirname "$0")/list.txt"
    exit 0
    ;;
esac
if [ -f "$(dirname "$0")/hang" ]; then exec sleep 10; fi
echo "$@" > "$(dirname "$0")/last_args"
echo "[ RUN      ] Math.Add"
echo "[       OK ] Math.Add (1 ms)"
echo "[ RUN      ] Math.Sub"
echo "math.cpp:3: Failure"
echo "Expected: 1"
echo "[  FAILED  ] Math.Sub (2 ms)"
exit 1
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        tree: SharedTree,
        pool: TaskPool,
        runnable: Runnable,
    }

    fn spec(dir: &Path, timeout: Option<Duration>) -> ExecutableSpec {
        ExecutableSpec {
            name: "unit".to_string(),
            path: "/bin/sh".to_string(),
            framework: FrameworkKind::Gtest,
            args: vec![dir.join("fake_gtest.sh").to_string_lossy().into_owned()],
            cwd: dir.to_string_lossy().into_owned(),
            env: Vec::new(),
            timeout,
            fail_if_exceeds_limit_ns: None,
            executor: None,
            overrides: BTreeMap::new(),
        }
    }

    fn fixture(list: &str, timeout: Option<Duration>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fake_gtest.sh"), GTEST_SCRIPT).unwrap();
        std::fs::write(dir.path().join("list.txt"), list).unwrap();

        let tree = Tree::new("root", EventSink::discard()).into_shared();
        let pool = TaskPool::new(2);
        let root = tree::lock(&tree).root();
        let runnable = Runnable::new(
            spec(dir.path(), timeout),
            Arc::new(DefaultSpawner::new()),
            pool.clone(),
            tree.clone(),
            root,
        )
        .unwrap();
        Fixture {
            dir,
            tree,
            pool,
            runnable,
        }
    }

    fn find(f: &Fixture, name: &str) -> NodeId {
        let tree = tree::lock(&f.tree);
        tree.find_test(tree.root(), name).unwrap()
    }

    fn state(f: &Fixture, name: &str) -> TestState {
        let id = find(f, name);
        tree::lock(&f.tree).test(id).unwrap().state
    }

    const LIST: &str = "Math.\n  Add\n  Sub\n  DISABLED_Div\n";

    #[tokio::test]
    async fn test_load_builds_subtree_and_is_idempotent() {
        let f = fixture(LIST, None);
        assert_eq!(f.runnable.load().await.unwrap(), 3);

        let exe = f.runnable.suite().unwrap();
        let (fixture_suite, ids) = {
            let tree = tree::lock(&f.tree);
            assert_eq!(tree.suite(exe).unwrap().label, "unit");
            let fixture_suite = tree.children(exe)[0];
            assert_eq!(tree.suite(fixture_suite).unwrap().label, "Math");
            (fixture_suite, tree.tests_under(exe))
        };
        assert_eq!(ids.len(), 3);
        assert!(tree::lock(&f.tree).test(ids[2]).unwrap().skipped);

        f.runnable.load().await.unwrap();
        let tree = tree::lock(&f.tree);
        assert_eq!(tree.tests_under(exe), ids);
        assert_eq!(tree.children(exe), &[fixture_suite]);
    }

    #[tokio::test]
    async fn test_reload_removes_stale_tests() {
        let f = fixture(LIST, None);
        f.runnable.load().await.unwrap();
        let add = find(&f, "Math.Add");

        std::fs::write(f.dir.path().join("list.txt"), "Math.\n  Add\nOther.\n  New\n").unwrap();
        assert_eq!(f.runnable.load().await.unwrap(), 2);

        let tree = tree::lock(&f.tree);
        assert_eq!(tree.find_test(tree.root(), "Math.Add"), Some(add));
        assert!(tree.find_test(tree.root(), "Math.Sub").is_none());
        assert!(tree.find_test(tree.root(), "Other.New").is_some());
    }

    #[tokio::test]
    async fn test_failed_discovery_leaves_tree_untouched() {
        let f = fixture(LIST, None);
        f.runnable.load().await.unwrap();
        let before = tree::lock(&f.tree).len();

        std::fs::remove_file(f.dir.path().join("list.txt")).unwrap();
        let err = f.runnable.load().await.unwrap_err();
        assert!(matches!(err, RunnableError::Discovery { .. }));
        assert_eq!(tree::lock(&f.tree).len(), before);
    }

    #[tokio::test]
    async fn test_run_all_commits_results() {
        let f = fixture(LIST, None);
        f.runnable.load().await.unwrap();

        f.runnable
            .run_all(RunId::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state(&f, "Math.Add"), TestState::Passed);
        assert_eq!(state(&f, "Math.Sub"), TestState::Failed);
        assert_eq!(state(&f, "Math.DISABLED_Div"), TestState::Unset);

        let tree = tree::lock(&f.tree);
        assert_eq!(tree.running_counter(tree.root()), 0);
        let sub = tree.test(tree.find_test(tree.root(), "Math.Sub").unwrap()).unwrap();
        assert_eq!(sub.decorations[0].file, "math.cpp");
        assert_eq!(sub.last_run, Some(Duration::from_millis(2)));
        assert_eq!(f.pool.running(), 0);
    }

    #[tokio::test]
    async fn test_run_one_disabled_test_reports_missing_output() {
        let f = fixture(LIST, None);
        f.runnable.load().await.unwrap();
        let div = find(&f, "Math.DISABLED_Div");

        f.runnable
            .run_one(div, RunId::new(), &CancellationToken::new())
            .await
            .unwrap();

        let args = std::fs::read_to_string(f.dir.path().join("last_args")).unwrap();
        assert!(args.contains("--gtest_filter=Math.DISABLED_Div"));
        assert!(args.contains("--gtest_also_run_disabled_tests"));

        let tree = tree::lock(&f.tree);
        let test = tree.test(div).unwrap();
        assert_eq!(test.state, TestState::Errored);
        assert!(test.message.as_deref().unwrap().contains("exit code 1"));
        // Tests outside the selection are untouched.
        let add = tree.find_test(tree.root(), "Math.Add").unwrap();
        assert_eq!(tree.test(add).unwrap().state, TestState::Unset);
    }

    #[tokio::test]
    async fn test_timeout_errors_every_test_and_frees_pool() {
        let f = fixture(LIST, Some(Duration::from_millis(300)));
        f.runnable.load().await.unwrap();
        std::fs::write(f.dir.path().join("hang"), "").unwrap();

        f.runnable
            .run_all(RunId::new(), &CancellationToken::new())
            .await
            .unwrap();

        let tree = tree::lock(&f.tree);
        for name in ["Math.Add", "Math.Sub"] {
            let test = tree.test(tree.find_test(tree.root(), name).unwrap()).unwrap();
            assert_eq!(test.state, TestState::Errored);
            assert_eq!(test.description.as_deref(), Some("⌛️ Timed out"));
        }
        assert_eq!(tree.running_counter(tree.root()), 0);
        assert_eq!(f.pool.running(), 0);
    }

    #[tokio::test]
    async fn test_cancel_errors_running_tests() {
        let f = fixture(LIST, None);
        f.runnable.load().await.unwrap();
        std::fs::write(f.dir.path().join("hang"), "").unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        f.runnable.run_all(RunId::new(), &cancel).await.unwrap();

        assert_eq!(state(&f, "Math.Add"), TestState::Errored);
        let tree = tree::lock(&f.tree);
        assert_eq!(tree.running_counter(tree.root()), 0);
    }

    #[tokio::test]
    async fn test_filtered_run_is_rejected_while_busy() {
        let f = fixture(LIST, None);
        f.runnable.load().await.unwrap();
        std::fs::write(f.dir.path().join("hang"), "").unwrap();

        let cancel = CancellationToken::new();
        let run_all = f.runnable.run_all(RunId::new(), &cancel);
        let rejected = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(f.runnable.is_busy());
            let result = f
                .runnable
                .run_filtered(|_, _| true, RunId::new(), &CancellationToken::new())
                .await;
            cancel.cancel();
            result
        };
        let (all, rejected) = tokio::join!(run_all, rejected);
        all.unwrap();
        assert!(matches!(rejected, Err(RunnableError::Busy(_))));
    }

    #[tokio::test]
    async fn test_dispose_detaches_subtree() {
        let f = fixture(LIST, None);
        f.runnable.load().await.unwrap();
        f.runnable.dispose();

        assert!(f.runnable.suite().is_none());
        {
            let tree = tree::lock(&f.tree);
            assert!(tree.children(tree.root()).is_empty());
        }
        assert!(matches!(
            f.runnable.load().await,
            Err(RunnableError::Disposed(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_spec_variables() {
        let workspace = Arc::new(VariableResolver::with_parent(
            vec![ResolveRule::literal("${workspaceFolder}", "/work")],
            Arc::new(VariableResolver::global()),
        ));
        let mut config = ExecutableConfig::new("${workspaceFolder}/build/./unit_tests");
        config.cwd = Some("${absDirpath}".into());
        config.args = vec!["--out=${cwd}/${name}.xml".into()];
        config.env.insert("ROOT".into(), "${relPath}".into());
        config.executor = Some(ExecutorConfig {
            program: "${workspaceFolder}/tools/wrap".into(),
            args: Some(vec!["${cmd}".into(), "${argsFlat}".into()]),
        });
        let test = TestConfig {
            runtime_limit_secs: Some(9),
            ..TestConfig::default()
        };

        let spec = ExecutableSpec::resolve(&config, &test, workspace, Path::new("/work")).await;
        assert_eq!(spec.name, "unit_tests");
        assert_eq!(spec.path, "/work/build/unit_tests");
        assert_eq!(spec.cwd, "/work/build");
        assert_eq!(spec.args, vec!["--out=/work/build/unit_tests.xml"]);
        assert_eq!(spec.env, vec![("ROOT".to_string(), "build/unit_tests".to_string())]);
        assert_eq!(spec.timeout, Some(Duration::from_secs(9)));
        let executor = spec.executor.unwrap();
        assert_eq!(executor.program, "/work/tools/wrap");
        assert_eq!(executor.args.unwrap(), vec!["${cmd}", "${argsFlat}"]);
    }
}
