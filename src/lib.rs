//! testmate: a hierarchical runner for pre-built GoogleTest and Google
//! Benchmark executables.
//!
//! Executables are configured in a TOML file. testmate asks each one for its
//! tests, arranges them in a tree (executable, fixture, test), runs
//! selections with bounded parallelism, and turns the output into per-test
//! results with source-anchored failure decorations.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Resolver**: `${...}` variable substitution for configuration values
//! - **Spawner**: process execution with timeouts, cancellation, and wrappers
//! - **Pool**: the shared admission gate bounding concurrent processes
//! - **Tree**: suites and tests, running counters, and the event stream
//! - **Framework**: listing and output parsers for each executable kind
//! - **Runnable**: one executable, its discovery and its runs
//! - **Hierarchy**: the configured set of runnables
//! - **Report**: console progress and summaries
//!
//! # Example
//!
//! ```no_run
//! use testmate::config::load_config;
//! use testmate::hierarchy::TestHierarchy;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("testmate.toml"))?;
//!     let (hierarchy, _events) = TestHierarchy::new(".", config)?;
//!     hierarchy.reload().await;
//!     hierarchy.run(&[], &CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod format;
pub mod framework;
pub mod hierarchy;
pub mod pool;
pub mod report;
pub mod resolver;
pub mod runnable;
pub mod spawner;
pub mod tree;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use hierarchy::TestHierarchy;
pub use runnable::{Runnable, RunnableError};
pub use tree::{SharedTree, Tree, TreeEvent};
