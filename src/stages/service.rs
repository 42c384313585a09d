//! Service controller stage
//!
//! Starts and enables the agent's systemd unit, then verifies live state:
//! a successful start/enable call alone is not trusted as proof of a running
//! service. The update flow additionally stops and restarts the unit.

use anyhow::Context;
use std::time::Duration;
use tracing::info;

use crate::cmd::{self, CommandLine};
use crate::error::{StageError, StageResult};
use crate::outcome::{Stage, StageOutcome};

fn systemctl(args: &[&str]) -> CommandLine {
    CommandLine::new("systemctl").args(args.iter().copied().map(str::to_string))
}

/// Reload systemd manager state; required before start when unit files changed
pub async fn daemon_reload(dry_run: bool, timeout: Duration) -> Result<(), StageError> {
    if dry_run {
        info!("Would reload service manager state");
        return Ok(());
    }

    cmd::run_checked(&systemctl(&["daemon-reload"]), timeout)
        .await
        .context("Failed to reload service manager state")
        .map_err(|e| StageError::tool(Stage::Service, e))?;

    info!("Reloaded service manager state");
    Ok(())
}

async fn is_active(unit: &str, timeout: Duration) -> Result<bool, StageError> {
    cmd::status_ok(&systemctl(&["is-active", "--quiet", unit]), timeout)
        .await
        .with_context(|| format!("Failed to query active state of {}", unit))
        .map_err(|e| StageError::tool(Stage::Service, e))
}

async fn is_enabled(unit: &str, timeout: Duration) -> Result<bool, StageError> {
    cmd::status_ok(&systemctl(&["is-enabled", "--quiet", unit]), timeout)
        .await
        .with_context(|| format!("Failed to query enabled state of {}", unit))
        .map_err(|e| StageError::tool(Stage::Service, e))
}

/// Ensure the unit is running and enabled at boot
pub async fn start_and_enable(unit: &str, dry_run: bool, timeout: Duration) -> StageResult {
    if dry_run {
        info!(unit, "Would start and enable service");
        return Ok(StageOutcome::Changed);
    }

    let mut changed = false;

    if !is_active(unit, timeout).await? {
        cmd::run_checked(&systemctl(&["start", unit]), timeout)
            .await
            .with_context(|| format!("Failed to start service {}", unit))
            .map_err(|e| StageError::tool(Stage::Service, e))?;
        info!(unit, "Started service");
        changed = true;
    } else {
        info!(unit, "Service already running");
    }

    if !is_enabled(unit, timeout).await? {
        cmd::run_checked(&systemctl(&["enable", unit]), timeout)
            .await
            .with_context(|| format!("Failed to enable service {}", unit))
            .map_err(|e| StageError::tool(Stage::Service, e))?;
        info!(unit, "Enabled service");
        changed = true;
    } else {
        info!(unit, "Service already enabled");
    }

    Ok(if changed {
        StageOutcome::Changed
    } else {
        StageOutcome::Unchanged
    })
}

/// Stop the unit; used by the update flow before configuration replacement
pub async fn stop(unit: &str, dry_run: bool, timeout: Duration) -> StageResult {
    if dry_run {
        info!(unit, "Would stop service");
        return Ok(StageOutcome::Changed);
    }

    if !is_active(unit, timeout).await? {
        info!(unit, "Service already stopped");
        return Ok(StageOutcome::Unchanged);
    }

    cmd::run_checked(&systemctl(&["stop", unit]), timeout)
        .await
        .with_context(|| format!("Failed to stop service {}", unit))
        .map_err(|e| StageError::tool(Stage::Service, e))?;

    info!(unit, "Stopped service");
    Ok(StageOutcome::Changed)
}

/// Restart the unit
pub async fn restart(unit: &str, dry_run: bool, timeout: Duration) -> Result<(), StageError> {
    if dry_run {
        info!(unit, "Would restart service");
        return Ok(());
    }

    cmd::run_checked(&systemctl(&["restart", unit]), timeout)
        .await
        .with_context(|| format!("Failed to restart service {}", unit))
        .map_err(|e| StageError::tool(Stage::Service, e))?;

    info!(unit, "Restarted service");
    Ok(())
}

/// Query live state and fail the run if the unit is not active
pub async fn verify_active(unit: &str, dry_run: bool, timeout: Duration) -> Result<(), StageError> {
    if dry_run {
        info!(unit, "Would verify service is active");
        return Ok(());
    }

    if !is_active(unit, timeout).await? {
        return Err(StageError::service_verification(format!(
            "Service {} is not active after start",
            unit
        )));
    }

    info!(unit, "Service verified active");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::DEFAULT_TIMEOUT;

    #[tokio::test]
    async fn test_start_and_enable_dry_run() {
        let outcome = start_and_enable("observe-agent", true, DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Changed);
    }

    #[tokio::test]
    async fn test_stop_dry_run() {
        let outcome = stop("observe-agent", true, DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(outcome, StageOutcome::Changed);
    }

    #[tokio::test]
    async fn test_verify_dry_run_passes() {
        assert!(verify_active("observe-agent", true, DEFAULT_TIMEOUT)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_daemon_reload_dry_run() {
        assert!(daemon_reload(true, DEFAULT_TIMEOUT).await.is_ok());
    }

    #[test]
    fn test_systemctl_command_shape() {
        let cmd = systemctl(&["is-active", "--quiet", "observe-agent"]);
        assert_eq!(cmd.display(), "systemctl is-active --quiet observe-agent");
    }
}
