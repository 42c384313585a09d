//! Repository manager stage
//!
//! Ensures the Observe apt repository is registered as a package source under
//! a fixed, well-known list file, so re-runs update the entry in place rather
//! than duplicating it. The package index refresh that follows is skipped
//! when the registration did not change.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::cmd::{self, CommandLine};
use crate::error::{StageError, StageResult};
use crate::outcome::{Stage, StageOutcome};

/// The apt source entry and where it is registered
#[derive(Debug, Clone)]
pub struct AptRepo {
    /// Fixed identifier: the list file under sources.list.d
    pub list_path: PathBuf,
    /// The deb line written into the list file
    pub entry: String,
}

impl AptRepo {
    /// The Observe repository with its pre-provisioned signing keyring
    pub fn observe_default() -> Self {
        Self {
            list_path: PathBuf::from("/etc/apt/sources.list.d/observeinc.list"),
            entry: "deb [signed-by=/etc/apt/keyrings/observeinc.gpg] \
                    https://repo.observeinc.com/apt stable main"
                .to_string(),
        }
    }
}

/// Idempotently register the repository, reporting whether the entry changed
pub fn ensure_registered(repo: &AptRepo, dry_run: bool) -> StageResult {
    register(repo, dry_run).map_err(|e| StageError::tool(Stage::Repository, e))
}

fn register(repo: &AptRepo, dry_run: bool) -> Result<StageOutcome> {
    let desired = format!("{}\n", repo.entry.trim());

    let current = if repo.list_path.exists() {
        Some(fs::read_to_string(&repo.list_path).with_context(|| {
            format!("Failed to read repository list {}", repo.list_path.display())
        })?)
    } else {
        None
    };

    if current.as_deref() == Some(desired.as_str()) {
        info!(path = %repo.list_path.display(), "Repository already registered");
        return Ok(StageOutcome::Unchanged);
    }

    if dry_run {
        info!(path = %repo.list_path.display(), "Would register repository");
        return Ok(StageOutcome::Changed);
    }

    if let Some(parent) = repo.list_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(&repo.list_path, &desired).with_context(|| {
        format!(
            "Failed to write repository list {}",
            repo.list_path.display()
        )
    })?;

    info!(path = %repo.list_path.display(), "Registered repository");
    Ok(StageOutcome::Changed)
}

/// Refresh the package index; called only when the registration changed
pub async fn refresh_index(dry_run: bool, timeout: Duration) -> Result<(), StageError> {
    if dry_run {
        info!("Would refresh package index");
        return Ok(());
    }

    let cmd = CommandLine::new("apt-get").arg("update");
    cmd::run_checked(&cmd, timeout)
        .await
        .context("Failed to refresh package index")
        .map_err(|e| StageError::tool(Stage::Repository, e))?;

    info!("Refreshed package index");
    Ok(())
}
