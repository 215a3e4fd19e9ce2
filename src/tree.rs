//! Arena-backed test tree.
//!
//! The [`Tree`] exclusively owns every [`Node`]. Suites hold ordered child id
//! lists and nodes link to their parent by id, so there are no reference
//! cycles and removal is a map operation.
//!
//! ```text
//! root
//! ├── unit_tests            (suite per executable)
//! │   ├── MathTest           (suite per fixture)
//! │   │   ├── Add            (test)
//! │   │   └── DISABLED_Div   (test, skipped)
//! │   └── StringTest
//! │       └── Split
//! └── bench
//!     └── BM_Sort/1024
//! ```
//!
//! # Running state
//!
//! Each suite counts its running descendants. The counter's 0→1 edge emits
//! a suite `running` event and the 1→0 edge emits `completed` after the
//! suite recomputed its duration summary. All of this happens inside
//! [`Tree::mark_running`] and [`Tree::apply`], so callers only deal with
//! tests.
//!
//! The tree is shared as [`SharedTree`]. The lock is never held across an
//! `.await`.

pub mod event;
pub mod suite;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

pub use event::{
    Decoration, EventSink, NodeType, RunEventState, TestRunEvent, TreeEvent,
};
pub use suite::{Suite, SuiteStats};
pub use test::{Test, TestCommit, TestKind, TestOutcome, TestState};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Process-lifetime-unique node identifier.
    NodeId
);
uuid_id!(
    /// Identifies one run request.
    RunId
);
uuid_id!(
    /// Identifies the executable a test belongs to.
    RunnableId
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Suite(Suite),
    Test(Test),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    pub fn label(&self) -> &str {
        match &self.kind {
            NodeKind::Suite(s) => &s.label,
            NodeKind::Test(t) => &t.label,
        }
    }

    pub fn as_suite(&self) -> Option<&Suite> {
        match &self.kind {
            NodeKind::Suite(s) => Some(s),
            NodeKind::Test(_) => None,
        }
    }

    pub fn as_test(&self) -> Option<&Test> {
        match &self.kind {
            NodeKind::Test(t) => Some(t),
            NodeKind::Suite(_) => None,
        }
    }
}

pub type SharedTree = Arc<Mutex<Tree>>;

/// Locks a shared tree, recovering from poisoning.
pub fn lock(tree: &SharedTree) -> MutexGuard<'_, Tree> {
    tree.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Tree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    sink: EventSink,
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.root)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl Tree {
    pub fn new(root_label: impl Into<String>, sink: EventSink) -> Self {
        let root = NodeId::new();
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                id: root,
                parent: None,
                kind: NodeKind::Suite(Suite::new(root_label)),
            },
        );
        Self { nodes, root, sink }
    }

    pub fn into_shared(self) -> SharedTree {
        Arc::new(Mutex::new(self))
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn suite(&self, id: NodeId) -> Option<&Suite> {
        self.nodes.get(&id)?.as_suite()
    }

    pub fn suite_mut(&mut self, id: NodeId) -> Option<&mut Suite> {
        match &mut self.nodes.get_mut(&id)?.kind {
            NodeKind::Suite(s) => Some(s),
            NodeKind::Test(_) => None,
        }
    }

    pub fn test(&self, id: NodeId) -> Option<&Test> {
        self.nodes.get(&id)?.as_test()
    }

    pub fn test_mut(&mut self, id: NodeId) -> Option<&mut Test> {
        match &mut self.nodes.get_mut(&id)?.kind {
            NodeKind::Test(t) => Some(t),
            NodeKind::Suite(_) => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id)?.parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.suite(id).map(Suite::children).unwrap_or(&[])
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(p) = current {
            out.push(p);
            current = self.parent(p);
        }
        out
    }

    pub fn add_suite(&mut self, parent: NodeId, suite: Suite) -> Option<NodeId> {
        self.insert(parent, NodeKind::Suite(suite))
    }

    pub fn add_test(&mut self, parent: NodeId, test: Test) -> Option<NodeId> {
        self.insert(parent, NodeKind::Test(test))
    }

    fn insert(&mut self, parent: NodeId, kind: NodeKind) -> Option<NodeId> {
        if self.suite(parent).is_none() {
            error!("Cannot add child: parent {} is not a suite in the tree", parent);
            return None;
        }
        let id = NodeId::new();
        self.nodes.insert(
            id,
            Node {
                id,
                parent: Some(parent),
                kind,
            },
        );
        self.link(parent, id);
        Some(id)
    }

    /// Appends `child` to `parent`'s child list. Duplicates are ignored.
    fn link(&mut self, parent: NodeId, child: NodeId) {
        let Some(suite) = self.suite_mut(parent) else {
            return;
        };
        if suite.children.contains(&child) {
            error!("Node {} is already a child of {}", child, parent);
            return;
        }
        suite.children.push(child);
        self.invalidate_location(parent);
        self.sink.send(TreeEvent::Changed {
            node: parent,
            recursive: false,
        });
    }

    /// Moves `child` to the end of `parent`'s children, re-establishing
    /// discovery order after a reload.
    pub fn move_to_end(&mut self, parent: NodeId, child: NodeId) {
        if let Some(suite) = self.suite_mut(parent)
            && let Some(pos) = suite.children.iter().position(|c| *c == child)
        {
            let id = suite.children.remove(pos);
            suite.children.push(id);
        }
    }

    /// First child suite of `parent` labelled `label`.
    pub fn find_child_suite(&self, parent: NodeId, label: &str) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|c| self.suite(*c).is_some_and(|s| s.label == label))
    }

    /// First child test of `parent` whose full name is `name`.
    pub fn find_child_test(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|c| self.test(*c).is_some_and(|t| t.name == name))
    }

    /// Finds a test by name anywhere under `under`.
    pub fn find_test(&self, under: NodeId, name: &str) -> Option<NodeId> {
        self.tests_under(under)
            .into_iter()
            .find(|id| self.test(*id).is_some_and(|t| t.name == name))
    }

    /// Removes `id` and its subtree, then prunes ancestors left empty.
    ///
    /// Running tests inside the subtree release their ancestors' counters as
    /// if they had completed.
    pub fn remove(&mut self, id: NodeId) {
        if id == self.root {
            error!("Refusing to remove the root suite");
            return;
        }
        let Some(parent) = self.parent(id) else {
            if self.nodes.remove(&id).is_none() {
                debug!("Node {} already removed", id);
            }
            return;
        };

        let subtree = self.subtree(id);
        let removed: HashSet<NodeId> = subtree.iter().copied().collect();
        for node in &subtree {
            if self.test(*node).is_some_and(Test::is_running) {
                self.release_ancestors(*node, None, &removed);
            }
        }

        if let Some(suite) = self.suite_mut(parent) {
            let before = suite.children.len();
            suite.children.retain(|c| *c != id);
            if suite.children.len() == before {
                error!("Node {} was missing from its parent {}", id, parent);
            }
        }
        for node in subtree {
            self.nodes.remove(&node);
        }
        self.invalidate_location(parent);
        self.sink.send(TreeEvent::Changed {
            node: parent,
            recursive: true,
        });
        self.prune(parent);
    }

    /// Removes `id` if it is an empty non-root suite, repeating upwards.
    pub fn prune(&mut self, id: NodeId) {
        let mut current = Some(id);
        while let Some(node) = current {
            let empty_child = self.get(node).is_some_and(|n| {
                n.parent.is_some() && n.as_suite().is_some_and(|s| s.children.is_empty())
            });
            if !empty_child {
                return;
            }
            current = self.parent(node);
            if let Some(parent) = current
                && let Some(suite) = self.suite_mut(parent)
            {
                suite.children.retain(|c| *c != node);
            }
            self.nodes.remove(&node);
            if let Some(parent) = current {
                self.invalidate_location(parent);
                self.sink.send(TreeEvent::Changed {
                    node: parent,
                    recursive: true,
                });
            }
        }
    }

    /// `id` followed by every node below it, depth first.
    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            if !self.nodes.contains_key(&node) {
                continue;
            }
            out.push(node);
            stack.extend(self.children(node).iter().rev());
        }
        out
    }

    /// Tests below `id` (or `id` itself if it is a test), in display order.
    pub fn tests_under(&self, id: NodeId) -> Vec<NodeId> {
        self.subtree(id)
            .into_iter()
            .filter(|n| self.test(*n).is_some())
            .collect()
    }

    pub fn test_count(&self, id: NodeId, include_skipped: bool) -> usize {
        self.tests_under(id)
            .into_iter()
            .filter_map(|n| self.test(n))
            .filter(|t| include_skipped || !t.skipped)
            .count()
    }

    /// Resolves a selection to the tests that should run.
    ///
    /// A test is included when it is selected itself, or when one of its
    /// ancestors is selected and the test is not skipped.
    pub fn collect_tests_to_run(&self, selection: &[NodeId]) -> Vec<NodeId> {
        let selected: HashSet<NodeId> = selection.iter().copied().collect();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for &chosen in selection {
            for test_id in self.tests_under(chosen) {
                let Some(test) = self.test(test_id) else {
                    continue;
                };
                let include = selected.contains(&test_id) || !test.skipped;
                if include && seen.insert(test_id) {
                    out.push(test_id);
                }
            }
        }
        out
    }

    pub fn running_counter(&self, id: NodeId) -> usize {
        self.suite(id).map(Suite::running_counter).unwrap_or(0)
    }

    /// Common location of a node: explicit for tests, derived for suites.
    pub fn location(&self, id: NodeId) -> Option<Location> {
        let node = self.get(id)?;
        match &node.kind {
            NodeKind::Test(t) => t.location(),
            NodeKind::Suite(s) => s
                .location
                .get_or_init(|| {
                    let mut children = s.children.iter().map(|c| self.location(*c));
                    let first = children.next()??;
                    children
                        .all(|loc| loc.is_some_and(|l| l.file == first.file))
                        .then_some(Location {
                            file: first.file,
                            line: 0,
                        })
                })
                .clone(),
        }
    }

    pub fn set_test_location(&mut self, id: NodeId, file: Option<String>, line: Option<u32>) {
        if let Some(test) = self.test_mut(id) {
            test.file = file;
            test.line = line;
        }
        if let Some(parent) = self.parent(id) {
            self.invalidate_location(parent);
        }
    }

    fn invalidate_location(&mut self, from: NodeId) {
        let mut current = Some(from);
        while let Some(id) = current {
            if let Some(suite) = self.suite_mut(id) {
                suite.location.take();
            }
            current = self.parent(id);
        }
    }

    /// Marks a test running for `run_id` and increments every ancestor.
    ///
    /// Returns `false` if the test no longer exists.
    pub fn mark_running(&mut self, test_id: NodeId, run_id: RunId) -> bool {
        let Some(test) = self.test_mut(test_id) else {
            debug!("Cannot start {}: no longer in the tree", test_id);
            return false;
        };
        let was_running = test.is_running();
        test.state = TestState::Running;
        test.running_run = Some(run_id);
        test.message = None;

        self.sink.send(TreeEvent::Run(TestRunEvent {
            node: test_id,
            run_id,
            node_type: NodeType::Test,
            state: RunEventState::Running,
            description: None,
            tooltip: None,
            message: None,
            decorations: Vec::new(),
        }));

        if was_running {
            error!("Test {} was already running", test_id);
            return true;
        }

        for ancestor in self.ancestors(test_id) {
            let Some(suite) = self.suite_mut(ancestor) else {
                continue;
            };
            suite.running_counter += 1;
            if suite.running_counter == 1 {
                let event = suite_event(ancestor, run_id, suite, RunEventState::Running);
                self.sink.send(TreeEvent::Run(event));
            }
        }
        true
    }

    /// Applies a terminal result to a test and updates its ancestors.
    ///
    /// Results for tests removed by a reload are dropped.
    pub fn apply(&mut self, test_id: NodeId, run_id: RunId, commit: TestCommit) {
        let Some(test) = self.test_mut(test_id) else {
            debug!("Dropping result for {}: no longer in the tree", test_id);
            return;
        };
        if test.running_run.is_some_and(|r| r != run_id) {
            debug!("Test {} result from run {} overrides another run", test_id, run_id);
        }
        let was_running = test.is_running();
        let outcome = commit.outcome;
        test.commit(commit);

        let event = TestRunEvent {
            node: test_id,
            run_id,
            node_type: NodeType::Test,
            state: outcome.into(),
            description: test.description.clone(),
            tooltip: test.tooltip.clone(),
            message: test.message.clone(),
            decorations: test.decorations.clone(),
        };
        self.sink.send(TreeEvent::Run(event));

        if was_running {
            self.release_ancestors(test_id, Some(run_id), &HashSet::new());
        }
    }

    fn release_ancestors(
        &mut self,
        test_id: NodeId,
        run_id: Option<RunId>,
        skip: &HashSet<NodeId>,
    ) {
        let run_id = run_id
            .or_else(|| self.test(test_id).and_then(|t| t.running_run))
            .unwrap_or_default();
        for ancestor in self.ancestors(test_id) {
            if skip.contains(&ancestor) {
                continue;
            }
            let Some(suite) = self.suite_mut(ancestor) else {
                continue;
            };
            if suite.running_counter == 0 {
                error!("Running counter of suite {} would go negative", ancestor);
                continue;
            }
            suite.running_counter -= 1;
            if suite.running_counter == 0 {
                let stats = self.stats(ancestor);
                if let Some(suite) = self.suite_mut(ancestor) {
                    suite.set_summary(&stats);
                    let event = suite_event(ancestor, run_id, suite, RunEventState::Completed);
                    self.sink.send(TreeEvent::Run(event));
                }
            }
        }
    }

    /// Aggregates every test below `id`.
    pub fn stats(&self, id: NodeId) -> SuiteStats {
        let mut stats = SuiteStats::default();
        for test in self.tests_under(id).into_iter().filter_map(|t| self.test(t)) {
            stats.total += 1;
            if !test.skipped {
                stats.not_skipped += 1;
            }
            if let Some(duration) = test.last_run {
                stats.with_time += 1;
                stats.duration_sum += duration;
            }
        }
        stats
    }
}

fn suite_event(id: NodeId, run_id: RunId, suite: &Suite, state: RunEventState) -> TestRunEvent {
    TestRunEvent {
        node: id,
        run_id,
        node_type: NodeType::Suite,
        state,
        description: Some(suite.description()),
        tooltip: Some(suite.tooltip()),
        message: None,
        decorations: Vec::new(),
    }
}
