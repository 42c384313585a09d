//! Directory provisioner stage
//!
//! Ensures the configuration directories exist with the specified ownership
//! and permission bits. Non-destructive when everything already matches.

use anyhow::{Context, Result};
use nix::unistd::{chown, Gid, Group, Uid, User};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;
use tracing::info;

use crate::error::{StageError, StageResult};
use crate::outcome::{Stage, StageOutcome};

/// Desired state for one directory
#[derive(Debug, Clone)]
pub struct DirSpec {
    pub path: PathBuf,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<u32>,
}

impl DirSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owner: None,
            group: None,
            mode: None,
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>, group: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self.group = Some(group.into());
        self
    }
}

/// Ensure all directories; Changed if any of them changed
pub fn ensure_all(specs: &[DirSpec], dry_run: bool) -> StageResult {
    let mut outcome = StageOutcome::Unchanged;

    for spec in specs {
        let one = ensure_one(spec, dry_run).map_err(|e| StageError::tool(Stage::Directories, e))?;
        if one.changed() {
            outcome = StageOutcome::Changed;
        }
    }

    Ok(outcome)
}

fn ensure_one(spec: &DirSpec, dry_run: bool) -> Result<StageOutcome> {
    let mut changed = false;

    if !spec.path.exists() {
        if dry_run {
            info!(path = %spec.path.display(), "Would create directory");
            return Ok(StageOutcome::Changed);
        }
        fs::create_dir_all(&spec.path)
            .with_context(|| format!("Failed to create directory {}", spec.path.display()))?;
        info!(path = %spec.path.display(), "Created directory");
        changed = true;
    } else if !spec.path.is_dir() {
        anyhow::bail!(
            "Path exists but is not a directory: {}",
            spec.path.display()
        );
    }

    if let Some(mode) = spec.mode {
        let metadata = fs::metadata(&spec.path)
            .with_context(|| format!("Failed to stat {}", spec.path.display()))?;
        if metadata.permissions().mode() & 0o7777 != mode {
            if dry_run {
                info!(path = %spec.path.display(), mode = %format!("{:o}", mode), "Would set directory mode");
                return Ok(StageOutcome::Changed);
            }
            fs::set_permissions(&spec.path, fs::Permissions::from_mode(mode))
                .with_context(|| format!("Failed to set mode on {}", spec.path.display()))?;
            info!(path = %spec.path.display(), mode = %format!("{:o}", mode), "Set directory mode");
            changed = true;
        }
    }

    if spec.owner.is_some() || spec.group.is_some() {
        changed |= ensure_ownership(spec, dry_run)?;
    }

    if changed {
        Ok(StageOutcome::Changed)
    } else {
        info!(path = %spec.path.display(), "Directory already in desired state");
        Ok(StageOutcome::Unchanged)
    }
}

fn ensure_ownership(spec: &DirSpec, dry_run: bool) -> Result<bool> {
    let uid = spec
        .owner
        .as_deref()
        .map(resolve_uid)
        .transpose()?;
    let gid = spec
        .group
        .as_deref()
        .map(resolve_gid)
        .transpose()?;

    let metadata = fs::metadata(&spec.path)
        .with_context(|| format!("Failed to stat {}", spec.path.display()))?;

    let uid_matches = uid.map(|u| u.as_raw() == metadata.uid()).unwrap_or(true);
    let gid_matches = gid.map(|g| g.as_raw() == metadata.gid()).unwrap_or(true);
    if uid_matches && gid_matches {
        return Ok(false);
    }

    let owner_str = spec.owner.as_deref().unwrap_or("-");
    let group_str = spec.group.as_deref().unwrap_or("-");

    if dry_run {
        info!(path = %spec.path.display(), owner = owner_str, group = group_str, "Would set ownership");
        return Ok(true);
    }

    chown(&spec.path, uid, gid).with_context(|| {
        format!(
            "Failed to set ownership of {} to {}:{}",
            spec.path.display(),
            owner_str,
            group_str
        )
    })?;
    info!(path = %spec.path.display(), owner = owner_str, group = group_str, "Set ownership");
    Ok(true)
}

fn resolve_uid(name: &str) -> Result<Uid> {
    let user = User::from_name(name)
        .with_context(|| format!("Failed to look up user {}", name))?
        .with_context(|| format!("Unknown user {}", name))?;
    Ok(user.uid)
}

fn resolve_gid(name: &str) -> Result<Gid> {
    let group = Group::from_name(name)
        .with_context(|| format!("Failed to look up group {}", name))?
        .with_context(|| format!("Unknown group {}", name))?;
    Ok(group.gid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_creates_missing_directory_with_mode() {
        let dir = TempDir::new().unwrap();
        let spec = DirSpec::new(dir.path().join("etc/observe-agent")).mode(0o755);

        let outcome = ensure_all(std::slice::from_ref(&spec), false).unwrap();
        assert_eq!(outcome, StageOutcome::Changed);
        assert!(spec.path.is_dir());

        let mode = fs::metadata(&spec.path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn test_idempotent_when_state_matches() {
        let dir = TempDir::new().unwrap();
        let spec = DirSpec::new(dir.path().join("conf")).mode(0o750);

        assert_eq!(
            ensure_all(std::slice::from_ref(&spec), false).unwrap(),
            StageOutcome::Changed
        );
        assert_eq!(
            ensure_all(std::slice::from_ref(&spec), false).unwrap(),
            StageOutcome::Unchanged
        );
    }

    #[test]
    fn test_corrects_drifted_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf");
        fs::create_dir(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o777)).unwrap();

        let spec = DirSpec::new(&path).mode(0o755);
        assert_eq!(
            ensure_all(std::slice::from_ref(&spec), false).unwrap(),
            StageOutcome::Changed
        );
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn test_rejects_file_at_directory_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf");
        fs::write(&path, "not a directory").unwrap();

        let spec = DirSpec::new(&path);
        assert!(ensure_all(std::slice::from_ref(&spec), false).is_err());
    }

    #[test]
    fn test_dry_run_does_not_create() {
        let dir = TempDir::new().unwrap();
        let spec = DirSpec::new(dir.path().join("conf")).mode(0o755);

        let outcome = ensure_all(std::slice::from_ref(&spec), true).unwrap();
        assert_eq!(outcome, StageOutcome::Changed);
        assert!(!spec.path.exists());
    }
}
