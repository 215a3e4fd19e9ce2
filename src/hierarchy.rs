//! The engine's entry point: configuration, executables, and the tree.
//!
//! [`TestHierarchy`] owns one [`Runnable`] per configured executable, all
//! attached below a shared root suite and gated by one [`TaskPool`].
//!
//! ```text
//!  Config ──> workspace resolver ──> ExecutableSpec per executable
//!                                          │
//!                                          ▼
//!   TaskPool <── Runnable ── Runnable ── Runnable ──> Tree ──> TreeEvents
//! ```
//!
//! Configuration changes go through [`TestHierarchy::apply_config`], which
//! only redoes the work the diff calls for.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::join_all;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigDiff, ValidationError, keys};
use crate::pool::TaskPool;
use crate::resolver::{ResolveRule, VariableResolver};
use crate::runnable::{ExecutableSpec, Runnable, RunnableError, RunnableId};
use crate::spawner::{DefaultSpawner, Spawner};
use crate::tree::{self, EventSink, NodeId, RunId, SharedTree, Tree, TreeEvent};

/// Label of the root suite.
pub const ROOT_LABEL: &str = "testmate";

/// The parts replaced by configuration changes. Readers clone what they
/// need; the lock is never held across an `.await`.
struct Snapshot {
    config: Arc<Config>,
    resolver: Arc<VariableResolver>,
    runnables: Vec<Arc<Runnable>>,
}

/// All methods take `&self`, so a reload or configuration change may
/// overlap a run. The run keeps the runnables it started with; results for
/// tests removed in the meantime are dropped by the tree.
pub struct TestHierarchy {
    workspace: PathBuf,
    pool: TaskPool,
    tree: SharedTree,
    spawner: Arc<dyn Spawner>,
    state: RwLock<Snapshot>,
    /// Serializes reloads and configuration changes.
    reloading: tokio::sync::Mutex<()>,
}

impl TestHierarchy {
    /// Creates an empty hierarchy; call [`reload`](Self::reload) to discover
    /// tests. Events for the whole tree arrive on the returned receiver.
    pub fn new(
        workspace: impl Into<PathBuf>,
        config: Config,
    ) -> Result<(Self, UnboundedReceiver<TreeEvent>), ValidationError> {
        config.validate()?;
        let workspace = workspace.into();
        let (sink, rx) = EventSink::channel();
        let hierarchy = Self {
            pool: TaskPool::new(config.test.parallel_execution_limit),
            tree: Tree::new(ROOT_LABEL, sink).into_shared(),
            spawner: Arc::new(DefaultSpawner::new()),
            state: RwLock::new(Snapshot {
                resolver: Arc::new(workspace_resolver(&workspace, &config)),
                config: Arc::new(config),
                runnables: Vec::new(),
            }),
            reloading: tokio::sync::Mutex::new(()),
            workspace,
        };
        Ok((hierarchy, rx))
    }

    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> Arc<Config> {
        self.read().config.clone()
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    pub fn runnables(&self) -> Vec<Arc<Runnable>> {
        self.read().runnables.clone()
    }

    pub fn root(&self) -> NodeId {
        tree::lock(&self.tree).root()
    }

    /// Rebuilds the runnable set from the configuration and loads it.
    ///
    /// Runnables whose resolved spec did not change are kept and reloaded in
    /// place, so their tests keep their ids and history. A runnable that fails
    /// to load is dropped until the next reload; its error is returned.
    pub async fn reload(&self) -> Vec<RunnableError> {
        let _reloading = self.reloading.lock().await;
        self.reload_locked().await
    }

    async fn reload_locked(&self) -> Vec<RunnableError> {
        let (config, resolver, current) = {
            let state = self.read();
            (state.config.clone(), state.resolver.clone(), state.runnables.clone())
        };

        let mut specs = Vec::with_capacity(config.executables.len());
        for exe in &config.executables {
            specs.push(
                ExecutableSpec::resolve(exe, &config.test, resolver.clone(), &self.workspace)
                    .await,
            );
        }

        let mut previous: Vec<Option<Arc<Runnable>>> = current.into_iter().map(Some).collect();
        let root = self.root();
        let mut errors = Vec::new();
        let mut next = Vec::with_capacity(specs.len());

        for spec in specs {
            let reused = previous
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|r| r.spec() == &spec))
                .and_then(Option::take);
            match reused {
                Some(runnable) => next.push(runnable),
                None => match Runnable::new(
                    spec,
                    self.spawner.clone(),
                    self.pool.clone(),
                    self.tree.clone(),
                    root,
                ) {
                    Ok(runnable) => next.push(Arc::new(runnable)),
                    Err(e) => {
                        error!("{}", e);
                        errors.push(e);
                    }
                },
            }
        }

        for stale in previous.into_iter().flatten() {
            debug!("Disposing {}", stale.name());
            stale.dispose();
        }

        let results = join_all(next.iter().map(|r| r.load())).await;
        let mut loaded = Vec::with_capacity(next.len());
        for (runnable, result) in next.into_iter().zip(results) {
            match result {
                Ok(_) => loaded.push(runnable),
                Err(e) => {
                    error!("Failed to load {}: {}", runnable.name(), e);
                    runnable.dispose();
                    errors.push(e);
                }
            }
        }

        let mut tree = tree::lock(&self.tree);
        for runnable in &loaded {
            if let Some(suite) = runnable.suite() {
                tree.move_to_end(root, suite);
            }
        }
        info!(
            "Loaded {} executable(s), {} test(s)",
            loaded.len(),
            tree.test_count(root, true)
        );
        drop(tree);
        self.write().runnables = loaded;
        errors
    }

    /// Switches to a new configuration, redoing only what changed.
    pub async fn apply_config(&self, config: Config) -> Result<ConfigDiff, ValidationError> {
        config.validate()?;
        let _reloading = self.reloading.lock().await;
        let diff = {
            let mut state = self.write();
            let diff = ConfigDiff::between(&state.config, &config);
            if diff.is_empty() {
                return Ok(diff);
            }
            debug!("Configuration changed: {:?}", diff.changed().collect::<Vec<_>>());

            if diff.affects(keys::PARALLEL_EXECUTION_LIMIT) {
                self.pool
                    .set_max_task_count(config.test.parallel_execution_limit);
            }
            if diff.affects_any(&[keys::VARIABLES, keys::WORKING_DIR]) {
                state.resolver = Arc::new(workspace_resolver(&self.workspace, &config));
            }
            state.config = Arc::new(config);
            diff
        };

        if diff.affects_any(&[
            keys::WORKING_DIR,
            keys::VARIABLES,
            keys::EXECUTABLES,
            keys::RUNTIME_LIMIT,
        ]) {
            self.reload_locked().await;
        }
        Ok(diff)
    }

    /// Runs the selected nodes; an empty selection runs everything.
    ///
    /// Suites expand to their non-skipped tests. Returns once every
    /// invocation finished or was cancelled.
    pub async fn run(&self, selection: &[NodeId], cancel: &CancellationToken) -> RunId {
        let run_id = RunId::new();
        let groups = self.group_selection(selection);
        let runnables = self.runnables();

        let runs = groups.into_iter().filter_map(|(runnable_id, selected)| {
            let runnable = runnables.iter().find(|r| r.id() == runnable_id)?;
            Some(self.run_group(runnable, selected, run_id, cancel))
        });
        for result in join_all(runs).await {
            if let Err(e) = result {
                warn!("{}", e);
            }
        }
        run_id
    }

    fn group_selection(&self, selection: &[NodeId]) -> HashMap<RunnableId, HashSet<NodeId>> {
        let tree = tree::lock(&self.tree);
        let selection = if selection.is_empty() {
            vec![tree.root()]
        } else {
            selection.to_vec()
        };
        let mut groups: HashMap<RunnableId, HashSet<NodeId>> = HashMap::new();
        for id in tree.collect_tests_to_run(&selection) {
            if let Some(test) = tree.test(id) {
                groups.entry(test.runnable).or_default().insert(id);
            }
        }
        groups
    }

    async fn run_group(
        &self,
        runnable: &Runnable,
        selected: HashSet<NodeId>,
        run_id: RunId,
        cancel: &CancellationToken,
    ) -> Result<(), RunnableError> {
        let runnable_tests: Vec<NodeId> = {
            let tree = tree::lock(&self.tree);
            match runnable.suite() {
                Some(suite) => tree
                    .tests_under(suite)
                    .into_iter()
                    .filter(|id| tree.test(*id).is_some_and(|t| !t.skipped))
                    .collect(),
                None => Vec::new(),
            }
        };

        if runnable_tests.iter().all(|id| selected.contains(id))
            && selected.len() == runnable_tests.len()
        {
            runnable.run_all(run_id, cancel).await
        } else if selected.len() == 1
            && let Some(&only) = selected.iter().next()
        {
            runnable.run_one(only, run_id, cancel).await
        } else {
            runnable
                .run_filtered(|id, _| selected.contains(&id), run_id, cancel)
                .await
        }
    }

    /// Disposes every runnable, killing their processes.
    pub fn dispose(&self) {
        let runnables = std::mem::take(&mut self.write().runnables);
        for runnable in runnables {
            runnable.dispose();
        }
    }
}

/// Variables available to every executable of the workspace.
fn workspace_resolver(workspace: &Path, config: &Config) -> VariableResolver {
    let folder = workspace.to_string_lossy().into_owned();
    let name = workspace
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut rules = vec![
        ResolveRule::literal("${workspaceFolder}", folder.clone()),
        ResolveRule::literal("${workspaceDirectory}", folder),
        ResolveRule::literal("${workspaceName}", name),
    ];
    rules.extend(
        config
            .variables
            .iter()
            .map(|(k, v)| ResolveRule::literal(format!("${{{}}}", k), v.clone())),
    );
    VariableResolver::with_parent(rules, Arc::new(VariableResolver::global()))
}
