//! Process backend trait and implementations.
//!
//! A backend runs one fully-described child process under a wall-clock limit
//! and reports what happened as a [`RunOutcome`]. Timeouts are an outcome, not
//! an error. The executor and the environment manager both drive processes
//! through this seam.

mod local;

pub use local::LocalBackend;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

/// A single child process to run.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Program to execute. Looked up on the child's `PATH` when not absolute.
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory; the daemon's own when `None`.
    pub cwd: Option<PathBuf>,
    /// Complete child environment. The inherited environment is cleared
    /// first. `None` inherits the daemon's environment and is only used for
    /// provisioning commands.
    pub env: Option<BTreeMap<String, String>>,
    /// Pipe stdout/stderr back. When false both go to the null device.
    pub capture_output: bool,
    /// Bytes kept per stream; the rest is drained and discarded.
    pub output_limit: usize,
}

impl Invocation {
    /// Invocation with inherited environment and captured output.
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: None,
            capture_output: true,
            output_limit: usize::MAX,
        }
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    #[must_use]
    pub const fn with_capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    #[must_use]
    pub const fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The child exited on its own (or was killed by someone else).
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// The wall-clock limit expired and the process group was killed.
    /// Carries whatever output was read before the kill.
    TimedOut { stdout: String, stderr: String },
    /// The child could not be spawned or waited on.
    SpawnFailed { cause: std::io::Error },
}

/// Trait for process backends.
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    /// Run `invocation`, killing it once `timeout` elapses.
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> RunOutcome;
}
