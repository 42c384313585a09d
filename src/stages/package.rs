//! Package installer and version pinner stages
//!
//! Installs the agent package at the latest available version, reporting
//! whether an install or upgrade actually occurred, and later pins the
//! installed version against out-of-band upgrades. The changed signal gates
//! the backup stage: a backup is only meaningful when an install happened.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::info;

use crate::cmd::{self, CommandLine};
use crate::error::{StageError, StageResult};
use crate::outcome::{Stage, StageOutcome};

/// Query the installed version of a package. A failed query is treated as
/// not installed rather than an error, matching dpkg's behavior for unknown
/// packages.
pub async fn installed_version(package: &str, timeout: Duration) -> Option<String> {
    let cmd = CommandLine::new("dpkg-query")
        .arg("-W")
        .arg("-f")
        .arg("${Version}")
        .arg(package);

    match cmd::run(&cmd, timeout).await {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if version.is_empty() {
                None
            } else {
                Some(version)
            }
        }
        _ => None,
    }
}

/// Ensure the package is installed at the latest available version
pub async fn ensure_latest(package: &str, dry_run: bool, timeout: Duration) -> StageResult {
    let before = installed_version(package, timeout).await;

    if dry_run {
        match &before {
            Some(version) => {
                info!(package, version = %version, "Would upgrade package to latest available")
            }
            None => info!(package, "Would install package"),
        }
        return Ok(StageOutcome::Changed);
    }

    let cmd = CommandLine::new("apt-get")
        .arg("install")
        .arg("-y")
        .arg(package);
    cmd::run_checked(&cmd, timeout)
        .await
        .with_context(|| format!("Failed to install package {}", package))
        .map_err(|e| StageError::tool(Stage::Package, e))?;

    let after = installed_version(package, timeout).await;

    match (&before, &after) {
        (Some(b), Some(a)) if b == a => {
            info!(package, version = %a, "Package already at latest version");
            Ok(StageOutcome::Unchanged)
        }
        (_, Some(a)) => {
            info!(package, version = %a, "Installed package");
            Ok(StageOutcome::Changed)
        }
        (_, None) => Err(StageError::tool(
            Stage::Package,
            anyhow::anyhow!("Package {} not present after install", package),
        )),
    }
}

/// Check whether the package is already held
async fn is_held(package: &str, timeout: Duration) -> Result<bool> {
    let cmd = CommandLine::new("apt-mark").arg("showhold").arg(package);
    let output = cmd::run(&cmd, timeout)
        .await
        .with_context(|| format!("Failed to query hold state of {}", package))?;

    let held = String::from_utf8_lossy(&output.stdout)
        .lines()
        .any(|line| line.trim() == package);
    Ok(held)
}

/// Lock the package at its currently installed version. Runs last, after
/// service verification, so a failed deployment never pins a broken version.
pub async fn pin(package: &str, dry_run: bool, timeout: Duration) -> StageResult {
    if dry_run {
        info!(package, "Would pin package version");
        return Ok(StageOutcome::Changed);
    }

    if is_held(package, timeout)
        .await
        .map_err(|e| StageError::tool(Stage::Pin, e))?
    {
        info!(package, "Package version already pinned");
        return Ok(StageOutcome::Unchanged);
    }

    let cmd = CommandLine::new("apt-mark").arg("hold").arg(package);
    cmd::run_checked(&cmd, timeout)
        .await
        .with_context(|| format!("Failed to pin package {}", package))
        .map_err(|e| StageError::tool(Stage::Pin, e))?;

    info!(package, "Pinned package version");
    Ok(StageOutcome::Changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::DEFAULT_TIMEOUT;

    #[tokio::test]
    async fn test_ensure_latest_dry_run_reports_changed() {
        let outcome = ensure_latest("observe-agent", true, DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Changed);
    }

    #[tokio::test]
    async fn test_pin_dry_run() {
        let outcome = pin("observe-agent", true, DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(outcome, StageOutcome::Changed);
    }

    #[tokio::test]
    async fn test_installed_version_unknown_package() {
        // Unknown packages and missing dpkg both read as not installed
        let version =
            installed_version("definitely-not-a-real-package-xyz", DEFAULT_TIMEOUT).await;
        assert!(version.is_none());
    }
}
