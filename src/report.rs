//! Console output: run progress, summaries, and tree listings.
//!
//! [`ConsoleReporter`] consumes [`TreeEvent`]s while a run is in flight,
//! drives an indicatif progress bar, and prints non-passing tests as they
//! complete. [`ConsoleReporter::finish`] turns what it saw into a
//! [`RunSummary`] for [`print_summary`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::{Value, json};

use crate::format::format_duration;
use crate::tree::{self, NodeId, NodeKind, NodeType, RunEventState, SharedTree, Tree, TreeEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTest {
    pub name: String,
    pub state: RunEventState,
    pub message: Option<String>,
}

/// Counts for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    /// Selected tests that never reported a result.
    pub not_run: usize,
    pub duration: Duration,
    pub failures: Vec<FailedTest>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed == 0 && self.errored == 0 && self.not_run == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    tree: SharedTree,
    progress: Mutex<Option<ProgressBar>>,
    outcomes: Mutex<HashMap<NodeId, RunEventState>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(tree: SharedTree, verbose: bool) -> Self {
        Self {
            tree,
            progress: Mutex::new(None),
            outcomes: Mutex::new(HashMap::new()),
            verbose,
        }
    }

    /// Starts the progress bar for `total` tests.
    pub fn start(&self, total: usize) {
        println!("Running {} tests", total);

        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);

        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(pb);
    }

    pub fn on_event(&self, event: &TreeEvent) {
        let TreeEvent::Run(run) = event else {
            return;
        };
        if run.node_type != NodeType::Test {
            return;
        }

        let name = qualified_name(&tree::lock(&self.tree), run.node);
        let progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);

        let status = match run.state {
            RunEventState::Running => {
                if self.verbose
                    && let Some(pb) = progress.as_ref()
                {
                    pb.println(format!("Running: {}", name));
                }
                return;
            }
            RunEventState::Passed => console::style("PASS").green(),
            RunEventState::Failed => console::style("FAIL").red(),
            RunEventState::Skipped => console::style("SKIP").yellow(),
            RunEventState::Errored => console::style("ERR ").red().bold(),
            RunEventState::Completed => return,
        };

        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run.node, run.state);

        if let Some(pb) = progress.as_ref() {
            pb.inc(1);
            if self.verbose || run.state != RunEventState::Passed {
                let description = run.description.as_deref().unwrap_or_default();
                pb.println(format!("{} {} {}", status, name, description).trim_end().to_string());
            }
        }
    }

    /// Stops the progress bar and summarizes the results for `selected`.
    pub fn finish(&self, selected: &[NodeId], duration: Duration) -> RunSummary {
        if let Some(pb) = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pb.finish_and_clear();
        }

        let outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        let tree = tree::lock(&self.tree);
        let mut summary = RunSummary {
            total: selected.len(),
            duration,
            ..RunSummary::default()
        };

        for id in selected {
            match outcomes.get(id) {
                Some(RunEventState::Passed) => summary.passed += 1,
                Some(RunEventState::Skipped) => summary.skipped += 1,
                Some(state @ (RunEventState::Failed | RunEventState::Errored)) => {
                    if *state == RunEventState::Failed {
                        summary.failed += 1;
                    } else {
                        summary.errored += 1;
                    }
                    summary.failures.push(FailedTest {
                        name: qualified_name(&tree, *id),
                        state: *state,
                        message: tree.test(*id).and_then(|t| t.message.clone()),
                    });
                }
                _ => summary.not_run += 1,
            }
        }
        summary
    }
}

/// `executable: Fixture.Test` style name for messages.
pub fn qualified_name(tree: &Tree, id: NodeId) -> String {
    let Some(test) = tree.test(id) else {
        return id.to_string();
    };
    let ancestors = tree.ancestors(id);
    // Nearest first; the executable suite sits just below the root.
    match ancestors.len().checked_sub(2).map(|i| ancestors[i]) {
        Some(exe) => format!(
            "{}: {}",
            tree.get(exe).map(|n| n.label()).unwrap_or_default(),
            test.name
        ),
        None => test.name.clone(),
    }
}

/// Prints a summary of test results to the console.
pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("Test Results:");
    println!("  Total:   {}", summary.total);
    println!("  Passed:  {}", console::style(summary.passed).green());
    println!("  Failed:  {}", console::style(summary.failed).red());
    println!("  Errored: {}", console::style(summary.errored).red());
    println!("  Skipped: {}", console::style(summary.skipped).yellow());

    if summary.not_run > 0 {
        println!("  Not Run: {}", console::style(summary.not_run).red().bold());
    }

    println!("  Duration: {}", format_duration(summary.duration));

    println!();
    if summary.success() {
        println!("{}", console::style("All tests passed!").green().bold());
        return;
    }
    if summary.failures.is_empty() {
        println!("{}", console::style("Some tests did not run.").red().bold());
        return;
    }

    println!("{}", console::style("Some tests failed.").red().bold());
    println!();
    println!("Failed tests:");
    for failure in &summary.failures {
        println!("  - {}", failure.name);
        if let Some(message) = &failure.message {
            for line in message.lines() {
                println!("    {}", console::style(line).dim());
            }
        }
    }
}

/// Indented text rendering of the tree, one node per line.
pub fn render_tree(tree: &Tree) -> String {
    let mut out = String::new();
    for child in tree.children(tree.root()) {
        render_node(tree, *child, 0, &mut out);
    }
    out
}

fn render_node(tree: &Tree, id: NodeId, depth: usize, out: &mut String) {
    let Some(node) = tree.get(id) else {
        return;
    };
    let indent = "  ".repeat(depth);
    match &node.kind {
        NodeKind::Suite(suite) => {
            out.push_str(&format!(
                "{}{} ({} tests)\n",
                indent,
                suite.label,
                tree.test_count(id, true)
            ));
            for child in suite.children() {
                render_node(tree, *child, depth + 1, out);
            }
        }
        NodeKind::Test(test) => {
            let marker = if test.skipped { " [disabled]" } else { "" };
            out.push_str(&format!("{}{}{}\n", indent, test.label, marker));
        }
    }
}

/// JSON rendering of the tree below the root.
pub fn tree_json(tree: &Tree) -> Value {
    Value::Array(
        tree.children(tree.root())
            .iter()
            .filter_map(|c| node_json(tree, *c))
            .collect(),
    )
}

fn node_json(tree: &Tree, id: NodeId) -> Option<Value> {
    let node = tree.get(id)?;
    Some(match &node.kind {
        NodeKind::Suite(suite) => json!({
            "type": "suite",
            "label": suite.label,
            "children": suite
                .children()
                .iter()
                .filter_map(|c| node_json(tree, *c))
                .collect::<Vec<_>>(),
        }),
        NodeKind::Test(test) => json!({
            "type": "test",
            "label": test.label,
            "name": test.name,
            "skipped": test.skipped,
            "file": test.file,
            "line": test.line,
        }),
    })
}
