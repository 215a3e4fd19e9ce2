//! Process spawning with captured output, timeouts, and cancellation.
//!
//! The [`Spawner`] trait is the seam between the engine and the operating
//! system. [`DefaultSpawner`] runs a [`Command`] as a local child process and
//! accumulates its stdout and stderr while it runs. Wrapper programs
//! (valgrind, emulators, remote launchers) are layered on top with
//! [`SpawnWithExecutor`].
//!
//! # Outcomes
//!
//! | Situation | Result |
//! |-----------|--------|
//! | Process exits (any exit code) | `Ok(SpawnReturns)` |
//! | Process could not be created | [`SpawnError::Start`] |
//! | Process killed by a signal | [`SpawnError::Signal`] with captured output |
//! | Timeout elapsed | [`SpawnError::Timeout`], process killed |
//! | Token cancelled | [`SpawnError::Cancelled`], process killed |
//!
//! A non-zero exit code is not an error: test binaries exit non-zero whenever
//! a test fails, and the output still has to be parsed.

pub mod executor;

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use executor::SpawnWithExecutor;

/// How long to keep reading pipes after the process itself is gone.
///
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Result type for spawn operations.
pub type SpawnResult<T> = Result<T, SpawnError>;

/// Errors that can occur while running a process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The OS refused to create the process.
    #[error("Failed to start {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process was terminated by a signal.
    #[error("Process terminated by signal {signal}")]
    Signal {
        signal: String,
        output: Box<SpawnReturns>,
    },

    /// The process outlived its timeout and was killed.
    #[error("Process timed out after {}ms", after.as_millis())]
    Timeout {
        after: Duration,
        output: Box<SpawnReturns>,
    },

    /// The run was cancelled and the process was killed.
    #[error("Process was cancelled")]
    Cancelled { output: Box<SpawnReturns> },

    /// I/O error while waiting for the process.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Output captured before the failure, when the process got that far.
    pub fn output(&self) -> Option<&SpawnReturns> {
        match self {
            SpawnError::Signal { output, .. }
            | SpawnError::Timeout { output, .. }
            | SpawnError::Cancelled { output } => Some(output),
            SpawnError::Start { .. } | SpawnError::Io(_) => None,
        }
    }
}

/// A command to spawn.
///
/// Commands are built using a fluent builder API.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use testmate::spawner::Command;
///
/// let cmd = Command::new("./unit_tests")
///     .arg("--gtest_color=no")
///     .args(["--gtest_filter=Math.*", "--gtest_brief=0"])
///     .working_dir("/work/build")
///     .env("GTEST_SHUFFLE", "0")
///     .timeout(Duration::from_secs(30));
///
/// assert_eq!(cmd.program, "./unit_tests");
/// assert_eq!(cmd.args.len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory. If `None`, the current directory is inherited.
    pub working_dir: Option<String>,

    /// Environment variables added on top of the inherited environment.
    pub env: Vec<(String, String)>,

    /// Maximum execution time. The process is killed when it elapses.
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn maybe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Renders the command as a shell-quoted line, for logs and reports.
    ///
    /// ```
    /// use testmate::spawner::Command;
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(&self.args))
    }
}

/// Everything observed about one finished (or killed) process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnReturns {
    pub pid: Option<u32>,
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` when the process did not exit normally.
    pub status: Option<i32>,
    /// Name of the terminating signal, e.g. `SIGSEGV`.
    pub signal: Option<String>,
    pub error: Option<String>,
    /// Both output pipes reached end-of-file.
    pub closed: bool,
    pub duration: Duration,
}

impl SpawnReturns {
    /// Returns `true` if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Executes commands.
///
/// Implementations must be `Send + Sync` so one spawner can be shared by every
/// runnable.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Runs `cmd` to completion, honoring its timeout and `cancel`.
    async fn spawn_async(
        &self,
        cmd: &Command,
        cancel: &CancellationToken,
    ) -> SpawnResult<SpawnReturns>;
}

/// Spawner that runs commands as local child processes.
#[derive(Debug, Clone, Default)]
pub struct DefaultSpawner;

impl DefaultSpawner {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Clone, Copy)]
enum Outcome {
    Exited,
    TimedOut(Duration),
    Cancelled,
}

#[async_trait]
impl Spawner for DefaultSpawner {
    async fn spawn_async(
        &self,
        cmd: &Command,
        cancel: &CancellationToken,
    ) -> SpawnResult<SpawnReturns> {
        let mut process = tokio::process::Command::new(&cmd.program);
        process.args(&cmd.args);
        for (key, value) in &cmd.env {
            process.env(key, value);
        }
        if let Some(dir) = &cmd.working_dir {
            process.current_dir(dir);
        }
        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        debug!("Spawning: {}", cmd.to_shell_string());
        let started = Instant::now();

        let mut child = process.spawn().map_err(|source| SpawnError::Start {
            program: cmd.program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(drain(stdout, stdout_buf.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(drain(stderr, stderr_buf.clone()));
        }

        let mut exit_status = None;
        let outcome = tokio::select! {
            status = child.wait() => {
                exit_status = Some(status);
                Outcome::Exited
            }
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = sleep_or_pending(cmd.timeout) => {
                Outcome::TimedOut(cmd.timeout.unwrap_or_default())
            }
        };

        if !matches!(outcome, Outcome::Exited) {
            // Fails only if the process already exited.
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        let closed = finish_drains(drains).await;
        let mut returns = SpawnReturns {
            pid,
            stdout: take_lossy(&stdout_buf),
            stderr: take_lossy(&stderr_buf),
            closed,
            duration: started.elapsed(),
            ..Default::default()
        };

        match outcome {
            Outcome::TimedOut(after) => {
                debug!("Process {:?} timed out after {:?}", pid, after);
                returns.error = Some(format!("timed out after {}ms", after.as_millis()));
                Err(SpawnError::Timeout {
                    after,
                    output: Box::new(returns),
                })
            }
            Outcome::Cancelled => {
                debug!("Process {:?} cancelled", pid);
                returns.error = Some("cancelled".to_string());
                Err(SpawnError::Cancelled {
                    output: Box::new(returns),
                })
            }
            Outcome::Exited => {
                let status = match exit_status {
                    Some(status) => status?,
                    None => return Err(std::io::Error::other("no exit status").into()),
                };
                returns.status = status.code();
                if let Some(signal) = signal_name(&status) {
                    returns.signal = Some(signal.clone());
                    returns.error = Some(format!("terminated by signal {}", signal));
                    return Err(SpawnError::Signal {
                        signal,
                        output: Box::new(returns),
                    });
                }
                Ok(returns)
            }
        }
    }
}

fn drain<R>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]),
            }
        }
    })
}

/// Waits for the drain tasks up to [`DRAIN_GRACE`]. Returns whether every
/// pipe was closed.
async fn finish_drains(drains: Vec<JoinHandle<()>>) -> bool {
    let aborts: Vec<_> = drains.iter().map(JoinHandle::abort_handle).collect();
    match tokio::time::timeout(DRAIN_GRACE, futures::future::join_all(drains)).await {
        Ok(_) => true,
        Err(_) => {
            for handle in aborts {
                handle.abort();
            }
            false
        }
    }
}

fn take_lossy(buf: &Mutex<Vec<u8>>) -> String {
    let bytes = std::mem::take(&mut *buf.lock().unwrap_or_else(PoisonError::into_inner));
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    let number = status.signal()?;
    let name = match number {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        _ => return Some(format!("SIG{}", number)),
    };
    Some(name.to_string())
}

#[cfg(not(unix))]
fn signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        Command::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let token = CancellationToken::new();
        let result = DefaultSpawner::new()
            .spawn_async(&sh("echo out; echo err >&2; exit 3"), &token)
            .await
            .unwrap();

        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.status, Some(3));
        assert!(!result.success());
        assert!(result.closed);
        assert!(result.pid.is_some());
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = sh("printf '%s %s' \"$GREETING\" \"$(basename \"$(pwd)\")\"")
            .env("GREETING", "hi")
            .working_dir(dir.path().to_string_lossy());

        let result = DefaultSpawner::new()
            .spawn_async(&cmd, &CancellationToken::new())
            .await
            .unwrap();
        let expected = format!(
            "hi {}",
            dir.path().file_name().unwrap().to_string_lossy()
        );
        assert_eq!(result.stdout, expected);
    }

    #[tokio::test]
    async fn test_start_failure() {
        let err = DefaultSpawner::new()
            .spawn_async(
                &Command::new("/nonexistent/testmate-binary"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::Start { .. }));
        assert!(err.output().is_none());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_keeps_output() {
        let cmd = sh("echo before; exec sleep 10").timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = DefaultSpawner::new()
            .spawn_async(&cmd, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            SpawnError::Timeout { after, output } => {
                assert_eq!(after, Duration::from_millis(200));
                assert_eq!(output.stdout, "before\n");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let err = DefaultSpawner::new()
            .spawn_async(&sh("exec sleep 10"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_signal_is_reported() {
        let err = DefaultSpawner::new()
            .spawn_async(&sh("echo partial; kill -SEGV $$"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SpawnError::Signal { signal, output } => {
                assert_eq!(signal, "SIGSEGV");
                assert_eq!(output.signal.as_deref(), Some("SIGSEGV"));
                assert_eq!(output.status, None);
                assert_eq!(output.stdout, "partial\n");
            }
            other => panic!("expected signal, got {other:?}"),
        }
    }

    #[test]
    fn test_shell_string_quotes_args() {
        let cmd = Command::new("gtest").args(["--gtest_filter=A.*", "two words"]);
        assert_eq!(cmd.to_shell_string(), "gtest '--gtest_filter=A.*' 'two words'");
    }
}
