//! Execution engine.
//!
//! Runs one snippet inside a project: validate the request, confine the
//! working directory, acquire the project environment, snapshot the tree, run
//! the interpreter or shell under a timeout, then diff the tree.
//!
//! Malformed requests and confinement failures are errors. A non-zero exit or
//! a timeout is a normal [`ExecutionResult`] with `success == false`. Nothing
//! is retried.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::backend::{Invocation, ProcessBackend, RunOutcome};
use crate::config::{Config, ExecutionConfig};
use crate::confine::{confine, confine_existing_directory};
use crate::environment::{Environment, EnvironmentManager};
use crate::error::{Error, Result};
use crate::snapshot::FileSnapshot;

/// Exit code reported when the process was killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Supported languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Run with the project environment's interpreter (`python -c`).
    Python,
    /// Run with the configured shell (`bash -c`).
    Shell,
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "python" => Ok(Self::Python),
            "shell" => Ok(Self::Shell),
            other => Err(Error::Execution(format!("Unsupported language: {other}"))),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Python => f.write_str("python"),
            Self::Shell => f.write_str("shell"),
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Seconds; the configured default when `None`.
    pub timeout_seconds: Option<u64>,
    /// Project-relative working directory.
    pub working_dir: Option<PathBuf>,
    pub capture_output: bool,
    /// Packages the environment must have before running.
    pub packages: Vec<String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: None,
            working_dir: None,
            capture_output: true,
            packages: Vec::new(),
        }
    }
}

/// One snippet to run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    pub project_path: PathBuf,
    pub options: ExecutionOptions,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: Language, project_path: impl Into<PathBuf>) -> Self {
        Self {
            code: code.into(),
            language,
            project_path: project_path.into(),
            options: ExecutionOptions::default(),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, seconds: u64) -> Self {
        self.options.timeout_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub const fn with_capture_output(mut self, capture: bool) -> Self {
        self.options.capture_output = capture;
        self
    }

    #[must_use]
    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.packages = packages.into_iter().map(Into::into).collect();
        self
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code zero and not timed out.
    pub success: bool,
    /// [`TIMEOUT_EXIT_CODE`] when timed out.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Project-relative paths created or modified, sorted. Deleted files are
    /// not listed.
    pub files_modified: Vec<String>,
    pub timed_out: bool,
}

/// Runs snippets against project directories.
pub struct Executor<B> {
    backend: Arc<B>,
    environments: EnvironmentManager<B>,
    config: ExecutionConfig,
}

impl<B: ProcessBackend> Executor<B> {
    pub fn new(config: &Config, backend: B) -> Self {
        let backend = Arc::new(backend);
        Self {
            environments: EnvironmentManager::new(
                Arc::clone(&backend),
                config.environment.clone(),
                config.restricted_env.clone(),
            ),
            backend,
            config: config.execution.clone(),
        }
    }

    pub const fn environments(&self) -> &EnvironmentManager<B> {
        &self.environments
    }

    #[instrument(skip(self, request), fields(language = %request.language, project = %request.project_path.display()))]
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        // Validating
        if request.code.trim().is_empty() {
            return Err(Error::Execution("Empty code".into()));
        }
        let timeout = self.timeout_for(&request.options)?;
        let project = confine_existing_directory(&request.project_path)?;
        let working_dir = match &request.options.working_dir {
            Some(dir) => {
                let resolved = confine(dir, &project).map_err(Error::SecurityViolation)?;
                if !resolved.is_dir() {
                    return Err(Error::Execution(format!(
                        "Working directory does not exist: {}",
                        dir.display()
                    )));
                }
                resolved
            }
            None => project.clone(),
        };

        // Preparing
        let env = self
            .environments
            .acquire(&project, &request.options.packages)
            .await?;
        let invocation = self.invocation(request, &env, working_dir);

        // Snapshotting
        let before = snapshot(&project).await?;

        // Running
        debug!(code_len = request.code.len(), timeout = ?timeout, "Running snippet");
        let started = Instant::now();
        let outcome = self.backend.run(&invocation, timeout).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let budget = self.config.max_output_bytes;
        let (exit_code, stdout, stderr, timed_out) = match outcome {
            RunOutcome::Completed {
                exit_code,
                stdout,
                stderr,
            } => (exit_code, stdout, truncate_output(stderr, budget), false),
            RunOutcome::TimedOut { stdout, stderr } => (
                TIMEOUT_EXIT_CODE,
                stdout,
                timeout_stderr(stderr, timeout, budget),
                true,
            ),
            RunOutcome::SpawnFailed { cause } => {
                return Err(Error::Execution(format!("Execution failed: {cause}")));
            }
        };
        let stdout = truncate_output(stdout, budget);

        // Diffing
        let after = snapshot(&project).await?;
        let files_modified = before.modified_since(&after);

        let result = ExecutionResult {
            success: exit_code == 0 && !timed_out,
            exit_code,
            stdout,
            stderr,
            duration_ms,
            files_modified,
            timed_out,
        };

        info!(
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration_ms,
            files_modified = result.files_modified.len(),
            "Execution finished"
        );
        Ok(result)
    }

    fn timeout_for(&self, options: &ExecutionOptions) -> Result<Duration> {
        let seconds = options
            .timeout_seconds
            .unwrap_or(self.config.default_timeout_seconds);
        if seconds == 0 || seconds > self.config.max_timeout_seconds {
            return Err(Error::Execution(format!(
                "Timeout must be between 1 and {} seconds, got {seconds}",
                self.config.max_timeout_seconds
            )));
        }
        Ok(Duration::from_secs(seconds))
    }

    fn invocation(&self, request: &ExecutionRequest, env: &Environment, working_dir: PathBuf) -> Invocation {
        let program = match request.language {
            Language::Python => env.interpreter.clone(),
            Language::Shell => PathBuf::from(&self.config.shell),
        };

        Invocation::new(program, ["-c", request.code.as_str()])
            .with_cwd(working_dir)
            .with_env(self.environments.execution_environment_variables(&env.project_path))
            .with_capture_output(request.options.capture_output)
            .with_output_limit(self.config.max_output_bytes)
    }
}

async fn snapshot(project: &Path) -> Result<FileSnapshot> {
    let root = project.to_path_buf();
    tokio::task::spawn_blocking(move || FileSnapshot::capture(&root))
        .await
        .map_err(|e| Error::Execution(format!("Snapshot failed: {e}")))
}

/// Cut `output` to at most `max_bytes`, on a character boundary.
pub fn truncate_output(mut output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let mut cut = max_bytes;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output
}

/// Partial stderr followed by a note naming the timeout. The note always
/// survives truncation.
fn timeout_stderr(partial: String, timeout: Duration, budget: usize) -> String {
    let note = format!("Execution timed out after {}s", timeout.as_secs());
    if partial.is_empty() {
        return truncate_output(note, budget);
    }
    let room = budget.saturating_sub(note.len() + 1);
    let mut stderr = truncate_output(partial, room);
    if !stderr.is_empty() {
        stderr.push('\n');
    }
    stderr.push_str(&note);
    truncate_output(stderr, budget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use async_trait::async_trait;
    use std::fs;
    use std::time::SystemTime;

    fn host_python() -> Option<PathBuf> {
        ["/usr/bin/python3", "/usr/local/bin/python3", "/bin/python3"]
            .iter()
            .map(PathBuf::from)
            .find(|p| p.is_file())
    }

    fn host_has_bash() -> bool {
        ["/usr/bin/bash", "/bin/bash", "/usr/local/bin/bash"]
            .iter()
            .any(|p| Path::new(p).is_file())
    }

    /// Project with a pre-built environment so tests never run `venv` or pip.
    /// The interpreter links to the host `python3` when there is one.
    fn seeded_project() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let project = fs::canonicalize(dir.path()).unwrap();
        let bin = project.join(".venv/bin");
        fs::create_dir_all(&bin).unwrap();
        match host_python() {
            Some(python) => std::os::unix::fs::symlink(python, bin.join("python")).unwrap(),
            None => fs::write(bin.join("python"), "").unwrap(),
        }
        (dir, project)
    }

    fn executor() -> Executor<LocalBackend> {
        Executor::new(&Config::default(), LocalBackend::new())
    }

    fn python(code: &str, project: &Path) -> ExecutionRequest {
        ExecutionRequest::new(code, Language::Python, project)
    }

    fn shell(code: &str, project: &Path) -> ExecutionRequest {
        ExecutionRequest::new(code, Language::Shell, project)
    }

    #[tokio::test]
    async fn python_print_hello() {
        if host_python().is_none() {
            return;
        }
        let (_dir, project) = seeded_project();

        let result = executor().execute(&python("print('Hello')", &project)).await.unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("Hello"));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn python_timeout() {
        if host_python().is_none() {
            return;
        }
        let (_dir, project) = seeded_project();
        let request = python("import time; time.sleep(10)", &project).with_timeout(1);

        let started = Instant::now();
        let result = executor().execute(&request).await.unwrap();

        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("timed out after 1s"));
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn python_syntax_error() {
        if host_python().is_none() {
            return;
        }
        let (_dir, project) = seeded_project();

        let result = executor().execute(&python("def broken(", &project)).await.unwrap();

        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
        assert!(!result.stderr.is_empty());
    }

    #[tokio::test]
    async fn python_tracks_file_creation() {
        if host_python().is_none() {
            return;
        }
        let (_dir, project) = seeded_project();
        let code = "with open('created.txt', 'w') as f: f.write('hello')";

        let result = executor().execute(&python(code, &project)).await.unwrap();

        assert!(result.success);
        assert_eq!(result.files_modified, vec!["created.txt"]);
    }

    #[tokio::test]
    async fn shell_creates_file() {
        if !host_has_bash() {
            return;
        }
        let (_dir, project) = seeded_project();

        let result = executor()
            .execute(&shell("echo hi > created.txt", &project))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.files_modified.contains(&"created.txt".to_string()));
        assert!(project.join("created.txt").exists());
        // The environment directory is never reported.
        assert!(result.files_modified.iter().all(|p| !p.starts_with(".venv")));
    }

    #[tokio::test]
    async fn reports_rewritten_but_not_untouched_files() {
        if !host_has_bash() {
            return;
        }
        let (_dir, project) = seeded_project();
        for name in ["existing.txt", "untouched.txt"] {
            let path = project.join(name);
            fs::write(&path, "before").unwrap();
            let old = SystemTime::now() - Duration::from_secs(3600);
            fs::File::options().write(true).open(&path).unwrap().set_modified(old).unwrap();
        }

        let result = executor()
            .execute(&shell("echo after > existing.txt; cat untouched.txt", &project))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.files_modified, vec!["existing.txt"]);
    }

    #[tokio::test]
    async fn shell_nonzero_exit() {
        if !host_has_bash() {
            return;
        }
        let (_dir, project) = seeded_project();

        let result = executor().execute(&shell("echo bad >&2; exit 3", &project)).await.unwrap();

        assert!(!result.success);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, 3);
        assert!(result.stderr.contains("bad"));
    }

    #[tokio::test]
    async fn output_is_truncated_to_budget() {
        if !host_has_bash() {
            return;
        }
        let (_dir, project) = seeded_project();
        let mut config = Config::default();
        config.execution.max_output_bytes = 1000;
        let executor = Executor::new(&config, LocalBackend::new());

        let code = "head -c 300000 /dev/zero | tr '\\0' 'x'; head -c 300000 /dev/zero | tr '\\0' 'y' >&2";
        let result = executor.execute(&shell(code, &project)).await.unwrap();

        assert!(result.success);
        assert_eq!(result.stdout.len(), 1000);
        assert_eq!(result.stderr.len(), 1000);
    }

    #[tokio::test]
    async fn runs_in_working_dir() {
        if !host_has_bash() {
            return;
        }
        let (_dir, project) = seeded_project();
        fs::create_dir_all(project.join("sub/dir")).unwrap();

        let request = shell("pwd; touch made-here.txt", &project).with_working_dir("sub/dir");
        let result = executor().execute(&request).await.unwrap();

        assert!(result.success);
        assert_eq!(result.stdout.trim(), project.join("sub/dir").to_string_lossy());
        assert_eq!(result.files_modified, vec!["sub/dir/made-here.txt"]);
    }

    #[tokio::test]
    async fn child_sees_only_restricted_environment() {
        if !host_has_bash() {
            return;
        }
        let (_dir, project) = seeded_project();

        let code = "echo \"home=$HOME\"; echo \"pp=[$PYTHONPATH]\"; echo \"proxy=[${https_proxy-unset}]\"; env";
        let result = executor().execute(&shell(code, &project)).await.unwrap();

        assert!(result.success);
        assert!(result.stdout.contains(&format!("home={}", project.display())));
        assert!(result.stdout.contains("pp=[]"));
        assert!(result.stdout.contains("proxy=[]"));
        assert!(!result.stdout.contains("CARGO_MANIFEST_DIR="));
    }

    #[tokio::test]
    async fn uncaptured_output_is_empty() {
        if !host_has_bash() {
            return;
        }
        let (_dir, project) = seeded_project();

        let request = shell("echo loud; echo louder >&2", &project).with_capture_output(false);
        let result = executor().execute(&request).await.unwrap();

        assert!(result.success);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn rejects_empty_code_before_environment() {
        let dir = tempfile::tempdir().unwrap();

        let err = executor().execute(&shell("   \n", dir.path())).await.unwrap_err();

        assert!(matches!(err, Error::Execution(_)));
        assert_eq!(err.to_string(), "Empty code");
        assert!(!dir.path().join(".venv").exists());
    }

    #[tokio::test]
    async fn rejects_escaping_working_dir_before_environment() {
        let dir = tempfile::tempdir().unwrap();

        let request = shell("touch pwned", dir.path()).with_working_dir("../../etc");
        let err = executor().execute(&request).await.unwrap_err();

        assert!(matches!(err, Error::SecurityViolation(_)));
        assert!(err.is_access_denied());
        assert!(!dir.path().join(".venv").exists());
    }

    #[tokio::test]
    async fn rejects_absolute_working_dir_outside_project() {
        let dir = tempfile::tempdir().unwrap();
        let request = shell("true", dir.path()).with_working_dir("/etc");
        let err = executor().execute(&request).await.unwrap_err();
        assert!(matches!(err, Error::SecurityViolation(_)));
    }

    #[tokio::test]
    async fn rejects_symlinked_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let request = shell("touch pwned", dir.path()).with_working_dir("link");
        let err = executor().execute(&request).await.unwrap_err();

        assert!(matches!(err, Error::SecurityViolation(_)));
        assert!(!outside.path().join("pwned").exists());
    }

    #[tokio::test]
    async fn rejects_symlink_reached_through_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        let request = shell("touch pwned", dir.path()).with_working_dir("nothere/../escape");
        let err = executor().execute(&request).await.unwrap_err();

        assert!(matches!(err, Error::SecurityViolation(_)));
        assert!(!outside.path().join("pwned").exists());
        assert!(!dir.path().join(".venv").exists());
    }

    #[tokio::test]
    async fn missing_working_dir_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let request = shell("true", dir.path()).with_working_dir("not/there");
        let err = executor().execute(&request).await.unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn rejects_invalid_project_path() {
        let err = executor()
            .execute(&shell("true", Path::new("/nonexistent/path")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PathViolation(_)));
    }

    #[tokio::test]
    async fn rejects_out_of_range_timeout() {
        let dir = tempfile::tempdir().unwrap();
        for seconds in [0, 301] {
            let request = shell("true", dir.path()).with_timeout(seconds);
            let err = executor().execute(&request).await.unwrap_err();
            assert!(matches!(err, Error::Execution(_)), "timeout {seconds}");
        }
    }

    #[test]
    fn parses_languages() {
        assert_eq!("python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("shell".parse::<Language>().unwrap(), Language::Shell);

        let err = "javascript".parse::<Language>().unwrap_err();
        assert!(err.is_caller_error());
        assert!(err.to_string().contains("Unsupported language"));
    }

    /// Backend whose processes never start.
    struct BrokenBackend;

    #[async_trait]
    impl ProcessBackend for BrokenBackend {
        async fn run(&self, _invocation: &Invocation, _timeout: Duration) -> RunOutcome {
            RunOutcome::SpawnFailed {
                cause: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "exec denied"),
            }
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_not_a_result() {
        let (_dir, project) = seeded_project();
        let executor = Executor::new(&Config::default(), BrokenBackend);

        let err = executor.execute(&shell("true", &project)).await.unwrap_err();

        assert!(matches!(err, Error::Execution(_)));
        assert!(err.to_string().contains("exec denied"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_output("hello".into(), 10), "hello");
        assert_eq!(truncate_output("hello".into(), 3), "hel");
        // "é" is two bytes; cutting inside it backs off.
        assert_eq!(truncate_output("aé".into(), 2), "a");
        assert_eq!(truncate_output("abc".into(), 0), "");
    }

    #[test]
    fn timeout_note_survives_truncation() {
        let stderr = timeout_stderr("x".repeat(500), Duration::from_secs(7), 100);
        assert!(stderr.len() <= 100);
        assert!(stderr.ends_with("Execution timed out after 7s"));

        assert_eq!(
            timeout_stderr(String::new(), Duration::from_secs(1), 1000),
            "Execution timed out after 1s"
        );
    }
}
