//! Semantic events emitted by the tree.
//!
//! The tree never renders anything itself. Every state transition is pushed
//! into an [`EventSink`] and consumed by whoever owns the receiving end: the
//! console reporter in the CLI, or a host UI adapter.

use serde::Serialize;
use tokio::sync::mpsc;

use super::{NodeId, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Test,
    Suite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunEventState {
    Running,
    Passed,
    Failed,
    Skipped,
    Errored,
    /// A suite's last running descendant finished.
    Completed,
}

/// A failure annotation anchored at a source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decoration {
    pub file: String,
    pub line: u32,
    pub message: String,
    pub hover: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRunEvent {
    pub node: NodeId,
    pub run_id: RunId,
    pub node_type: NodeType,
    pub state: RunEventState,
    pub description: Option<String>,
    pub tooltip: Option<String>,
    pub message: Option<String>,
    pub decorations: Vec<Decoration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeEvent {
    Run(TestRunEvent),
    /// Children of `node` were added or removed.
    Changed { node: NodeId, recursive: bool },
}

/// Sending half of the tree's event channel.
///
/// A discarding sink drops every event, which is what tests and the `list`
/// command want.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<TreeEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TreeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, event: TreeEvent) {
        if let Some(tx) = &self.tx {
            // A closed receiver only means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }
}
