//! Path confinement.
//!
//! Every path a request names is resolved (symlinks, `.` and `..`) before it
//! is compared against its boundary. Comparing the raw string is not enough:
//! `sub/../../etc` or a symlink planted inside the project would slip through.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::PathViolation;

/// Resolve `candidate` against `boundary` and require the result to be the
/// boundary itself or one of its descendants.
///
/// Relative candidates are taken relative to `boundary`; absolute candidates
/// are checked as-is. The candidate does not have to exist: components found
/// on disk are canonicalized and missing ones are applied lexically, so a
/// missing directory is reported as a legitimate (but absent) location rather
/// than as an escape.
pub fn confine(candidate: impl AsRef<Path>, boundary: impl AsRef<Path>) -> Result<PathBuf, PathViolation> {
    let candidate = candidate.as_ref();
    let boundary = boundary.as_ref();

    let boundary_real = fs::canonicalize(boundary).map_err(|e| {
        PathViolation::new(boundary, format!("is not a usable boundary directory: {e}"))
    })?;

    let joined = boundary_real.join(candidate);
    let target = resolve(&joined)
        .map_err(|e| PathViolation::new(candidate, format!("cannot be resolved: {e}")))?;

    if !target.starts_with(&boundary_real) {
        debug!(
            candidate = %candidate.display(),
            resolved = %target.display(),
            boundary = %boundary_real.display(),
            "Rejected path outside boundary"
        );
        return Err(PathViolation::new(candidate, "resolves outside project directory"));
    }

    Ok(target)
}

/// Canonicalize a project root, which acts as its own boundary.
pub fn confine_existing_directory(path: impl AsRef<Path>) -> Result<PathBuf, PathViolation> {
    let path = path.as_ref();

    let real = fs::canonicalize(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PathViolation::new(path, "does not exist")
        } else {
            PathViolation::new(path, format!("cannot be resolved: {e}"))
        }
    })?;

    if !real.is_dir() {
        return Err(PathViolation::new(path, "is not a directory"));
    }

    Ok(real)
}

/// Resolve `path` one component at a time. Every component that exists on
/// disk is canonicalized as soon as it is reached, so a symlink is followed
/// even when an earlier missing component was cancelled out by `..`. Only
/// components that do not exist are applied lexically.
fn resolve(path: &Path) -> std::io::Result<PathBuf> {
    let mut resolved = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                // The prefix is canonical up to any missing tail, so popping
                // never skips over a symlink.
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                if resolved.symlink_metadata().is_ok() {
                    resolved = fs::canonicalize(&resolved)?;
                }
            }
        }
    }

    Ok(resolved)
}
