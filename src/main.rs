//! testmate CLI - runs GoogleTest and Google Benchmark executables.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use testmate::config::{self, Config};
use testmate::format::normalize_path;
use testmate::hierarchy::TestHierarchy;
use testmate::report::{ConsoleReporter, print_summary, qualified_name, render_tree, tree_json};
use testmate::tree;

#[derive(Parser)]
#[command(name = "testmate")]
#[command(about = "Runs GoogleTest and Google Benchmark executables", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "testmate.toml")]
    config: PathBuf,

    /// Workspace directory (defaults to the directory of the config file)
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover and run tests
    Run {
        /// Override the parallel execution limit
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Only run tests whose name contains this string
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Discover tests without running them
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let workspace = workspace_dir(&cli.config, cli.workspace.as_deref())?;

    match cli.command {
        Commands::Run { parallel, filter } => {
            run_tests(&cli.config, &workspace, parallel, filter, cli.verbose).await
        }
        Commands::List { format } => list_tests(&cli.config, &workspace, &format).await,
        Commands::Validate => validate_config(&cli.config),
    }
}

fn workspace_dir(config_path: &Path, workspace: Option<&Path>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("Failed to determine the current directory")?;
    let dir = match workspace {
        Some(dir) => cwd.join(dir),
        None => cwd
            .join(config_path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(cwd),
    };
    Ok(normalize_path(&dir))
}

fn load(config_path: &Path) -> Result<Config> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

async fn run_tests(
    config_path: &Path,
    workspace: &Path,
    parallel_override: Option<usize>,
    filter: Option<String>,
    verbose: bool,
) -> Result<()> {
    let mut config = load(config_path)?;
    if let Some(parallel) = parallel_override {
        config.test.parallel_execution_limit = parallel;
    }

    let (hierarchy, mut rx) = TestHierarchy::new(workspace, config)?;
    let errors = hierarchy.reload().await;
    if !errors.is_empty() {
        warn!("{} executable(s) failed to load", errors.len());
    }

    let (selection, tests) = {
        let tree = tree::lock(hierarchy.tree());
        let root = tree.root();
        let selection = match &filter {
            Some(filter) => tree
                .tests_under(root)
                .into_iter()
                .filter(|id| qualified_name(&tree, *id).contains(filter.as_str()))
                .collect(),
            None => Vec::new(),
        };
        let tests = if selection.is_empty() {
            tree.collect_tests_to_run(&[root])
        } else {
            tree.collect_tests_to_run(&selection)
        };
        (selection, tests)
    };
    if let Some(filter) = &filter
        && selection.is_empty()
    {
        bail!("No tests match filter {:?}", filter);
    }

    let reporter = ConsoleReporter::new(hierarchy.tree().clone(), verbose);
    // Events from discovery are not part of the run.
    while rx.try_recv().is_ok() {}
    reporter.start(tests.len());

    let cancel = CancellationToken::new();
    let started = Instant::now();
    {
        let run = hierarchy.run(&selection, &cancel);
        tokio::pin!(run);
        loop {
            tokio::select! {
                _ = &mut run => break,
                Some(event) = rx.recv() => reporter.on_event(&event),
                _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                    warn!("Interrupted, cancelling the run");
                    cancel.cancel();
                }
            }
        }
    }
    while let Ok(event) = rx.try_recv() {
        reporter.on_event(&event);
    }

    let summary = reporter.finish(&tests, started.elapsed());
    print_summary(&summary);
    hierarchy.dispose();
    std::process::exit(summary.exit_code());
}

async fn list_tests(config_path: &Path, workspace: &Path, format: &str) -> Result<()> {
    let config = load(config_path)?;
    let (hierarchy, _rx) = TestHierarchy::new(workspace, config)?;
    hierarchy.reload().await;

    let tree = tree::lock(hierarchy.tree());
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&tree_json(&tree))?;
            println!("{}", json);
        }
        _ => {
            println!("Discovered {} tests:", tree.test_count(tree.root(), true));
            print!("{}", render_tree(&tree));
        }
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match load(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!(
                "  Parallel execution limit: {}",
                config.test.parallel_execution_limit
            );
            match config.test.runtime_limit_secs {
                Some(secs) => println!("  Runtime limit: {}s", secs),
                None => println!("  Runtime limit: none"),
            }
            if let Some(dir) = &config.test.working_dir {
                println!("  Working dir: {}", dir);
            }
            println!("  Executables: {}", config.executables.len());
            for exe in &config.executables {
                println!("    - {} ({})", exe.name.as_deref().unwrap_or(&exe.path), exe.framework);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}
