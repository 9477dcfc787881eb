//! Per-project execution environments.
//!
//! Each project owns one interpreter environment in a reserved directory
//! (`.venv` by default) with a JSON sidecar describing it. The in-memory cache
//! only saves re-validating the disk on every call; the disk stays
//! authoritative and dropping the manager never deletes an environment.
//!
//! All work for one project runs under a per-project lock, so concurrent
//! first-time requests create exactly one environment. Different projects
//! proceed in parallel.

mod restricted;

pub use restricted::RestrictedEnv;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{Invocation, ProcessBackend, RunOutcome};
use crate::config::{EnvironmentConfig, RestrictedEnvConfig};
use crate::confine::confine_existing_directory;
use crate::error::{Error, Result};

/// Bytes of provisioning output kept for diagnostics.
const PROVISION_OUTPUT_LIMIT: usize = 64 * 1024;

/// Health of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Ready,
    /// The interpreter executable is gone.
    Corrupted,
}

/// One isolated interpreter installation tied to one project.
#[derive(Debug, Clone, Serialize)]
pub struct Environment {
    pub id: Uuid,
    /// Canonical project directory.
    pub project_path: PathBuf,
    /// Environment directory inside the project.
    pub root: PathBuf,
    pub interpreter: PathBuf,
    pub created_at: DateTime<Utc>,
    pub packages: BTreeSet<String>,
    pub status: EnvironmentStatus,
}

impl Environment {
    fn new(project_path: PathBuf, root: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            interpreter: interpreter_path(&root),
            project_path,
            root,
            created_at: Utc::now(),
            packages: BTreeSet::new(),
            status: EnvironmentStatus::Ready,
        }
    }

    /// Re-check the interpreter on disk and update `status`.
    pub fn refresh_status(&mut self) -> EnvironmentStatus {
        self.status = if self.interpreter.is_file() {
            EnvironmentStatus::Ready
        } else {
            EnvironmentStatus::Corrupted
        };
        self.status
    }
}

/// Sidecar persisted inside the environment directory.
#[derive(Debug, Serialize, Deserialize)]
struct EnvironmentMetadata {
    id: Uuid,
    project_path: PathBuf,
    created_at: DateTime<Utc>,
    #[serde(default)]
    packages: BTreeSet<String>,
}

impl From<&Environment> for EnvironmentMetadata {
    fn from(env: &Environment) -> Self {
        Self {
            id: env.id,
            project_path: env.project_path.clone(),
            created_at: env.created_at,
            packages: env.packages.clone(),
        }
    }
}

/// What was found in the environment directory.
enum DiskState {
    Missing,
    Ready(Environment),
    Corrupted(String),
}

fn interpreter_path(root: &Path) -> PathBuf {
    root.join("bin").join("python")
}

/// Creates, caches, repairs and releases per-project environments.
pub struct EnvironmentManager<B> {
    backend: Arc<B>,
    config: EnvironmentConfig,
    restricted: RestrictedEnvConfig,
    cache: RwLock<HashMap<PathBuf, Environment>>,
    /// Per-project lock, keyed by canonical project path. Held for the whole
    /// acquire/release sequence.
    project_locks: RwLock<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl<B: ProcessBackend> EnvironmentManager<B> {
    pub fn new(backend: Arc<B>, config: EnvironmentConfig, restricted: RestrictedEnvConfig) -> Self {
        Self {
            backend,
            config,
            restricted,
            cache: RwLock::new(HashMap::new()),
            project_locks: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the per-project lock.
    async fn project_lock(&self, project: &Path) -> Arc<Mutex<()>> {
        // Fast path: read lock
        {
            let locks = self.project_locks.read().await;
            if let Some(lock) = locks.get(project) {
                return Arc::clone(lock);
            }
        }
        // Slow path: create
        let mut locks = self.project_locks.write().await;
        Arc::clone(
            locks
                .entry(project.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Return a ready environment for `project_path`, creating or repairing
    /// it as needed and installing any of `packages` it does not have yet.
    #[instrument(skip(self, project_path, packages), fields(project = %project_path.as_ref().display()))]
    pub async fn acquire(&self, project_path: impl AsRef<Path>, packages: &[String]) -> Result<Environment> {
        let project = confine_existing_directory(project_path)?;
        validate_packages(packages)?;

        let lock = self.project_lock(&project).await;
        let _guard = lock.lock().await;

        let mut env = match self.cached(&project).await {
            Some(env) => env,
            None => self.load_or_create(&project).await?,
        };

        let missing: Vec<String> = packages
            .iter()
            .filter(|p| !env.packages.contains(p.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.install_packages(&env, &missing).await?;
            env.packages.extend(missing);
            self.write_metadata(&env)?;
        }

        self.cache.write().await.insert(project, env.clone());
        Ok(env)
    }

    /// Delete the project's environment and forget it. Returns `true` whether
    /// or not anything existed.
    #[instrument(skip(self, project_path), fields(project = %project_path.as_ref().display()))]
    pub async fn release(&self, project_path: impl AsRef<Path>) -> Result<bool> {
        let project = confine_existing_directory(project_path)?;

        let lock = self.project_lock(&project).await;
        let _guard = lock.lock().await;

        self.cache.write().await.remove(&project);

        let root = project.join(&self.config.dir_name);
        if root.symlink_metadata().is_ok() {
            discard(&root).await?;
            info!(root = %root.display(), "Released environment");
        }
        Ok(true)
    }

    /// The complete variable map for a child process run in `project_path`.
    pub fn execution_environment_variables(&self, project_path: &Path) -> BTreeMap<String, String> {
        self.restricted_env(project_path).vars()
    }

    pub fn restricted_env(&self, project_path: &Path) -> RestrictedEnv {
        RestrictedEnv::new(project_path, &self.restricted)
    }

    /// Cached environment, if its interpreter is still there.
    async fn cached(&self, project: &Path) -> Option<Environment> {
        let mut cache = self.cache.write().await;
        let env = cache.get_mut(project)?;
        if env.refresh_status() == EnvironmentStatus::Ready {
            return Some(env.clone());
        }
        warn!(root = %env.root.display(), "Cached environment lost its interpreter, evicting");
        cache.remove(project);
        None
    }

    async fn load_or_create(&self, project: &Path) -> Result<Environment> {
        let root = project.join(&self.config.dir_name);

        match self.inspect(project, &root)? {
            DiskState::Ready(env) => {
                info!(id = %env.id, root = %root.display(), "Loaded existing environment");
                return Ok(env);
            }
            DiskState::Corrupted(reason) => {
                warn!(root = %root.display(), reason = %reason, "Removing corrupted environment");
                discard(&root).await?;
            }
            DiskState::Missing => {}
        }

        self.create(project, root).await
    }

    /// Look at the environment directory without changing anything, except
    /// writing a sidecar for an environment that has none.
    fn inspect(&self, project: &Path, root: &Path) -> Result<DiskState> {
        let Ok(meta) = root.symlink_metadata() else {
            return Ok(DiskState::Missing);
        };
        if meta.file_type().is_symlink() {
            return Ok(DiskState::Corrupted("environment directory is a symlink".into()));
        }
        if !meta.is_dir() {
            return Ok(DiskState::Corrupted("environment path is not a directory".into()));
        }

        let mut env = Environment::new(project.to_path_buf(), root.to_path_buf());
        if env.refresh_status() == EnvironmentStatus::Corrupted {
            return Ok(DiskState::Corrupted("interpreter executable is missing".into()));
        }

        let metadata_path = root.join(&self.config.metadata_file);
        match std::fs::read_to_string(&metadata_path) {
            Ok(json) => match serde_json::from_str::<EnvironmentMetadata>(&json) {
                Ok(metadata) => {
                    env.id = metadata.id;
                    env.created_at = metadata.created_at;
                    env.packages = metadata.packages;
                }
                Err(e) => return Ok(DiskState::Corrupted(format!("unreadable metadata: {e}"))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(root = %root.display(), "Adopting environment without metadata");
                self.write_metadata(&env)?;
            }
            Err(e) => return Ok(DiskState::Corrupted(format!("cannot read metadata: {e}"))),
        }

        Ok(DiskState::Ready(env))
    }

    async fn create(&self, project: &Path, root: PathBuf) -> Result<Environment> {
        info!(root = %root.display(), "Creating environment");

        let create = Invocation::new(
            &self.config.base_interpreter,
            ["-m".to_string(), "venv".to_string(), root.to_string_lossy().into_owned()],
        )
        .with_cwd(project);
        self.provision(&create, self.config.create_timeout(), "create virtual environment")
            .await?;

        let mut env = Environment::new(project.to_path_buf(), root);
        if env.refresh_status() == EnvironmentStatus::Corrupted {
            return Err(Error::Environment(format!(
                "Virtual environment created but interpreter is missing: {}",
                env.interpreter.display()
            )));
        }

        if self.config.upgrade_package_manager {
            let upgrade = Invocation::new(&env.interpreter, ["-m", "pip", "install", "--upgrade", "pip", "-q"])
                .with_cwd(project);
            if let Err(e) = self
                .provision(&upgrade, self.config.upgrade_timeout(), "upgrade pip")
                .await
            {
                warn!(error = %e, "Package manager upgrade failed, continuing");
            }
        }

        self.write_metadata(&env)?;
        info!(id = %env.id, "Environment ready");
        Ok(env)
    }

    async fn install_packages(&self, env: &Environment, packages: &[String]) -> Result<()> {
        info!(packages = ?packages, "Installing packages");

        let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string(), "-q".to_string()];
        args.extend(packages.iter().cloned());
        let install = Invocation::new(&env.interpreter, args).with_cwd(&env.project_path);

        self.provision(&install, self.config.install_timeout(), "install packages")
            .await
    }

    /// Run a provisioning command; anything but a clean exit is an error.
    async fn provision(&self, invocation: &Invocation, timeout: Duration, what: &str) -> Result<()> {
        let invocation = invocation.clone().with_output_limit(PROVISION_OUTPUT_LIMIT);
        debug!(program = %invocation.program.display(), args = ?invocation.args, "Provisioning");

        match self.backend.run(&invocation, timeout).await {
            RunOutcome::Completed { exit_code: 0, .. } => Ok(()),
            RunOutcome::Completed { exit_code, stdout, stderr } => {
                let diagnostic = if stderr.trim().is_empty() { stdout } else { stderr };
                Err(Error::Environment(format!(
                    "Failed to {what} (exit code {exit_code}): {}",
                    diagnostic.trim()
                )))
            }
            RunOutcome::TimedOut { .. } => Err(Error::Environment(format!(
                "Timed out after {}s trying to {what}",
                timeout.as_secs()
            ))),
            RunOutcome::SpawnFailed { cause } => {
                Err(Error::Environment(format!("Failed to {what}: {cause}")))
            }
        }
    }

    fn write_metadata(&self, env: &Environment) -> Result<()> {
        let path = env.root.join(&self.config.metadata_file);
        let json = serde_json::to_string_pretty(&EnvironmentMetadata::from(env))
            .map_err(|e| Error::Environment(format!("Failed to serialize metadata: {e}")))?;
        std::fs::write(&path, json)
            .map_err(|e| Error::Environment(format!("Failed to write {}: {e}", path.display())))
    }
}

/// Remove an environment directory entirely. A symlink is unlinked, never
/// followed.
async fn discard(root: &Path) -> Result<()> {
    let not_dir = root
        .symlink_metadata()
        .map(|m| !m.is_dir())
        .unwrap_or(false);
    let removed = if not_dir {
        tokio::fs::remove_file(root).await
    } else {
        tokio::fs::remove_dir_all(root).await
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Environment(format!(
            "Failed to remove environment {}: {e}",
            root.display()
        ))),
    }
}

/// Reject specs the installer would read as options.
fn validate_packages(packages: &[String]) -> Result<()> {
    for spec in packages {
        let spec = spec.trim();
        if spec.is_empty() || spec.starts_with('-') {
            return Err(Error::Environment(format!("Invalid package specification: '{spec}'")));
        }
    }
    Ok(())
}
